//! LMDB-backed expiry backend.
//!
//! Uses the heed crate (Rust bindings for LMDB). Each collection is a named
//! LMDB database keyed by the access key, with the JSON-encoded
//! [`AccessEntry`] as value. A separate metadata database records the
//! capacity mode and the attribute TTL reclamation is enabled on.
//!
//! # Thread Safety
//!
//! LMDB provides ACID transactions. The backend uses:
//! - Read transactions for `get_item` and `describe`
//! - Write transactions for `put_item`, `delete_item`, provisioning and
//!   `reclaim_expired`
//! - Database handles are opened once and shared behind an `RwLock`

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use knockrd_core::{AccessEntry, StoreError};

use super::{
    missing_collection, CollectionMeta, CollectionSpec, EnsureOutcome, ExpiryBackend,
};

/// Name of the LMDB database holding per-collection metadata.
const META_DB: &str = "knockrd-meta";

/// Maximum number of named databases, metadata included.
const MAX_DBS: u32 = 16;

/// Error type for LMDB store operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbStoreError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open a database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Entry or metadata could not be encoded or decoded.
    #[error("Codec error for {key}: {reason}")]
    Codec { key: String, reason: String },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbStoreError> for StoreError {
    fn from(e: LmdbStoreError) -> Self {
        match e {
            LmdbStoreError::Codec { key, reason } => StoreError::Codec { key, reason },
            other => StoreError::Unavailable {
                reason: other.to_string(),
            },
        }
    }
}

fn txn_err(e: heed::Error) -> LmdbStoreError {
    LmdbStoreError::Transaction(e.to_string())
}

/// LMDB-backed [`ExpiryBackend`].
pub struct LmdbExpiryBackend {
    env: Env,
    meta: Database<Bytes, Bytes>,
    collections: RwLock<HashMap<String, Database<Bytes, Bytes>>>,
}

impl std::fmt::Debug for LmdbExpiryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmdbExpiryBackend")
            .field("path", &self.env.path())
            .finish()
    }
}

impl LmdbExpiryBackend {
    /// Open (creating if needed) an LMDB environment at `path`.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the map in megabytes
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbStoreError> {
        std::fs::create_dir_all(&path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb.saturating_mul(1024 * 1024))
                .max_dbs(MAX_DBS)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbStoreError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(txn_err)?;
        let meta: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, Some(META_DB))
            .map_err(|e| LmdbStoreError::DbOpen(e.to_string()))?;
        wtxn.commit().map_err(txn_err)?;

        Ok(Self {
            env,
            meta,
            collections: RwLock::new(HashMap::new()),
        })
    }

    /// Look up the handle for an existing collection.
    ///
    /// Handles are opened inside a committed write transaction so they stay
    /// valid for the lifetime of the environment.
    fn collection(&self, name: &str) -> Result<Option<Database<Bytes, Bytes>>, LmdbStoreError> {
        if let Ok(handles) = self.collections.read() {
            if let Some(db) = handles.get(name) {
                return Ok(Some(*db));
            }
        }

        let wtxn = self.env.write_txn().map_err(txn_err)?;
        let db: Option<Database<Bytes, Bytes>> = self
            .env
            .open_database(&wtxn, Some(name))
            .map_err(|e| LmdbStoreError::DbOpen(e.to_string()))?;
        wtxn.commit().map_err(txn_err)?;

        if let Some(db) = db {
            if let Ok(mut handles) = self.collections.write() {
                handles.insert(name.to_string(), db);
            }
        }
        Ok(db)
    }

    fn read_meta(&self, name: &str) -> Result<Option<CollectionMeta>, LmdbStoreError> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        match self.meta.get(&rtxn, name.as_bytes()).map_err(txn_err)? {
            Some(bytes) => serde_json::from_slice(bytes)
                .map(Some)
                .map_err(|e| LmdbStoreError::Codec {
                    key: name.to_string(),
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    fn write_meta(
        &self,
        wtxn: &mut heed::RwTxn<'_>,
        name: &str,
        meta: &CollectionMeta,
    ) -> Result<(), LmdbStoreError> {
        let bytes = serde_json::to_vec(meta).map_err(|e| LmdbStoreError::Codec {
            key: name.to_string(),
            reason: e.to_string(),
        })?;
        self.meta
            .put(wtxn, name.as_bytes(), &bytes)
            .map_err(txn_err)
    }
}

fn decode_entry(key: &str, bytes: &[u8]) -> Result<AccessEntry, LmdbStoreError> {
    serde_json::from_slice(bytes).map_err(|e| LmdbStoreError::Codec {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl ExpiryBackend for LmdbExpiryBackend {
    fn name(&self) -> &'static str {
        "lmdb"
    }

    async fn ensure_collection(&self, spec: &CollectionSpec) -> Result<EnsureOutcome, StoreError> {
        if self.collection(&spec.name)?.is_some() {
            return Ok(EnsureOutcome::AlreadyExists);
        }

        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let db: Database<Bytes, Bytes> = self
            .env
            .create_database(&mut wtxn, Some(&spec.name))
            .map_err(|e| LmdbStoreError::DbOpen(e.to_string()))?;
        let meta = CollectionMeta {
            capacity: spec.capacity,
            expiry_attribute: None,
        };
        self.write_meta(&mut wtxn, &spec.name, &meta)?;
        wtxn.commit().map_err(txn_err)?;

        if let Ok(mut handles) = self.collections.write() {
            handles.insert(spec.name.clone(), db);
        }
        Ok(EnsureOutcome::Created)
    }

    async fn enable_expiry(&self, collection: &str, attribute: &str) -> Result<(), StoreError> {
        if self.collection(collection)?.is_none() {
            return Err(missing_collection(collection));
        }
        let mut meta = self.read_meta(collection)?.unwrap_or(CollectionMeta {
            capacity: Default::default(),
            expiry_attribute: None,
        });
        if meta.expiry_attribute.as_deref() == Some(attribute) {
            return Ok(());
        }
        meta.expiry_attribute = Some(attribute.to_string());

        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        self.write_meta(&mut wtxn, collection, &meta)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(())
    }

    async fn describe(&self, collection: &str) -> Result<Option<CollectionMeta>, StoreError> {
        if self.collection(collection)?.is_none() {
            return Ok(None);
        }
        Ok(self.read_meta(collection)?)
    }

    async fn get_item(
        &self,
        collection: &str,
        key: &str,
    ) -> Result<Option<AccessEntry>, StoreError> {
        let db = self
            .collection(collection)?
            .ok_or_else(|| missing_collection(collection))?;
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        match db.get(&rtxn, key.as_bytes()).map_err(txn_err)? {
            Some(bytes) => Ok(Some(decode_entry(key, bytes)?)),
            None => Ok(None),
        }
    }

    async fn put_item(&self, collection: &str, entry: &AccessEntry) -> Result<(), StoreError> {
        let db = self
            .collection(collection)?
            .ok_or_else(|| missing_collection(collection))?;
        let bytes = serde_json::to_vec(entry).map_err(|e| StoreError::Codec {
            key: entry.key.clone(),
            reason: e.to_string(),
        })?;

        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        db.put(&mut wtxn, entry.key.as_bytes(), &bytes)
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(())
    }

    async fn delete_item(&self, collection: &str, key: &str) -> Result<(), StoreError> {
        let db = self
            .collection(collection)?
            .ok_or_else(|| missing_collection(collection))?;
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        db.delete(&mut wtxn, key.as_bytes()).map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(())
    }

    async fn reclaim_expired(
        &self,
        collection: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let db = self
            .collection(collection)?
            .ok_or_else(|| missing_collection(collection))?;
        let expiry_enabled = self
            .read_meta(collection)?
            .map(|m| m.expiry_attribute.is_some())
            .unwrap_or(false);
        if !expiry_enabled {
            return Ok(0);
        }

        let expired: Vec<Vec<u8>> = {
            let rtxn = self.env.read_txn().map_err(txn_err)?;
            let iter = db.iter(&rtxn).map_err(txn_err)?;
            let mut keys = Vec::new();
            for result in iter {
                let (key, value) = match result {
                    Ok(kv) => kv,
                    Err(_) => continue,
                };
                let key_str = String::from_utf8_lossy(key);
                match decode_entry(&key_str, value) {
                    Ok(entry) if !entry.is_live_at(now) => keys.push(key.to_vec()),
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(collection = %collection, error = %e, "Skipping undecodable entry during reclamation");
                    }
                }
            }
            keys
        };

        if expired.is_empty() {
            return Ok(0);
        }

        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let mut deleted = 0u64;
        for key in &expired {
            if db.delete(&mut wtxn, key).map_err(txn_err)? {
                deleted += 1;
            }
        }
        wtxn.commit().map_err(txn_err)?;

        tracing::debug!(collection = %collection, deleted = deleted, "Reclaimed expired entries");
        Ok(deleted)
    }
}
