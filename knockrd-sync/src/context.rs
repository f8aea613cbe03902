//! Startup context.
//!
//! [`KnockContext`] is built once from a [`KnockConfig`] and owns every
//! long-lived handle: the access store, the cache in front of it and the
//! reconciliation engine with its sinks. Components receive it explicitly.

use std::path::Path;
use std::sync::Arc;

use knockrd_core::{Clock, ConfigError, KnockConfig, KnockError, StoreError, SystemClock};
use knockrd_storage::{
    AccessBackend, AccessCache, AccessStore, ExpiryBackend, InMemoryExpiryBackend,
    LmdbExpiryBackend,
};

use crate::reconcile::Reconciler;
use crate::sink::Sink;
use crate::sinks::{
    ConsulKvClient, InMemoryIpSet, InMemoryKv, InMemorySecurityGroup, IngressClient, IpSetClient,
    KvClient, KvSink, ListSink, RuleSink,
};

/// Remote clients for the sinks the configuration names.
///
/// A configured list or rule sink without its client is a configuration
/// error. A configured KV sink without a client gets a [`ConsulKvClient`].
#[derive(Clone, Default)]
pub struct SinkClients {
    pub ip_set: Option<Arc<dyn IpSetClient>>,
    pub ingress: Option<Arc<dyn IngressClient>>,
    pub kv: Option<Arc<dyn KvClient>>,
}

impl SinkClients {
    /// In-memory clients for every sink kind, with the configured list
    /// targets created empty.
    pub fn in_memory(config: &KnockConfig) -> Self {
        let ip_set = InMemoryIpSet::new();
        if let Some(targets) = &config.ip_set {
            for target in targets.v4.iter().chain(targets.v6.iter()) {
                ip_set.insert_set(&target.id, &[]);
            }
        }
        Self {
            ip_set: Some(Arc::new(ip_set)),
            ingress: Some(Arc::new(InMemorySecurityGroup::new())),
            kv: Some(Arc::new(InMemoryKv::new())),
        }
    }

    pub fn with_ip_set(mut self, client: Arc<dyn IpSetClient>) -> Self {
        self.ip_set = Some(client);
        self
    }

    pub fn with_ingress(mut self, client: Arc<dyn IngressClient>) -> Self {
        self.ingress = Some(client);
        self
    }

    pub fn with_kv(mut self, client: Arc<dyn KvClient>) -> Self {
        self.kv = Some(client);
        self
    }
}

/// Handles shared by the request path and the propagation path.
#[derive(Clone)]
pub struct KnockContext {
    config: Arc<KnockConfig>,
    store: Arc<AccessStore>,
    cache: Option<Arc<AccessCache<AccessStore>>>,
    reconciler: Reconciler,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for KnockContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnockContext")
            .field("store", &self.store)
            .field("cache", &self.cache)
            .field("reconciler", &self.reconciler)
            .finish()
    }
}

impl KnockContext {
    /// Load configuration from `path` (see [`KnockConfig::load`]) and build.
    pub async fn load(path: Option<&Path>, clients: SinkClients) -> Result<Self, KnockError> {
        let (config, adjustments) = KnockConfig::load(path)?;
        log_adjustments(&adjustments);
        Self::build(config, clients, Arc::new(SystemClock)).await
    }

    /// Normalize and validate `config`, open and provision the store, then
    /// assemble the sinks. Provisioning failure is fatal.
    pub async fn build(
        mut config: KnockConfig,
        clients: SinkClients,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, KnockError> {
        log_adjustments(&config.normalize());
        config.validate()?;

        let backend: Arc<dyn ExpiryBackend> = match &config.store_path {
            Some(path) => Arc::new(
                LmdbExpiryBackend::open(path, config.store_map_size_mb).map_err(StoreError::from)?,
            ),
            None => Arc::new(InMemoryExpiryBackend::new()),
        };
        let store = AccessStore::new(backend, config.table_name.clone())
            .with_ttl(config.ttl())
            .with_timeout(config.store_timeout())
            .with_clock(clock.clone());
        store.provision(&config.provisioning).await?;
        let store = Arc::new(store);

        let cache = if config.cache_enabled() {
            Some(Arc::new(
                AccessCache::new(
                    store.clone(),
                    config.cache_ttl(),
                    config.negative_cache_ttl(),
                )
                .with_clock(clock.clone()),
            ))
        } else {
            tracing::info!("Access cache disabled");
            None
        };

        let reconciler = Reconciler::new(build_sinks(&config, clients)?);

        tracing::info!(
            table = %config.table_name,
            persistent = config.store_path.is_some(),
            ttl_secs = config.ttl_secs,
            cache_ttl_secs = config.cache_ttl_secs,
            sinks = ?reconciler.kinds(),
            "knockrd context ready"
        );

        Ok(Self {
            config: Arc::new(config),
            store,
            cache,
            reconciler,
            clock,
        })
    }

    pub fn config(&self) -> &KnockConfig {
        &self.config
    }

    /// Request-path handle: the cache when enabled, the bare store otherwise.
    pub fn access(&self) -> Arc<dyn AccessBackend> {
        match &self.cache {
            Some(cache) => cache.clone() as Arc<dyn AccessBackend>,
            None => self.store.clone(),
        }
    }

    pub fn store(&self) -> &Arc<AccessStore> {
        &self.store
    }

    pub fn cache(&self) -> Option<&Arc<AccessCache<AccessStore>>> {
        self.cache.as_ref()
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Drop expired entries from the store and stale entries from the cache.
    pub async fn reclaim_expired(&self) -> Result<u64, StoreError> {
        let removed = self.store.reclaim_expired().await?;
        let purged = self.cache.as_ref().map(|c| c.purge_expired()).unwrap_or(0);
        tracing::debug!(removed = removed, purged = purged, "Reclaimed expired entries");
        Ok(removed)
    }
}

fn log_adjustments(adjustments: &[knockrd_core::ConfigAdjustment]) {
    for adjustment in adjustments {
        tracing::warn!(adjustment = %adjustment, "Adjusted configuration");
    }
}

fn build_sinks(config: &KnockConfig, clients: SinkClients) -> Result<Vec<Arc<dyn Sink>>, KnockError> {
    let timeout = config.sink_timeout();
    let mut sinks: Vec<Arc<dyn Sink>> = Vec::new();

    if let Some(ip_set) = config.ip_set.as_ref().filter(|s| !s.is_empty()) {
        let client = clients
            .ip_set
            .ok_or_else(|| ConfigError::missing("ip_set client"))?;
        sinks.push(Arc::new(ListSink::new(
            client,
            ip_set.v4.clone(),
            ip_set.v6.clone(),
            timeout,
        )));
    }

    if !config.security_groups.is_empty() {
        let client = clients
            .ingress
            .ok_or_else(|| ConfigError::missing("security_groups client"))?;
        sinks.push(Arc::new(RuleSink::new(
            client,
            config.security_groups.clone(),
            timeout,
        )));
    }

    if let Some(consul) = &config.consul {
        let client: Arc<dyn KvClient> = match clients.kv {
            Some(client) => client,
            None => Arc::new(ConsulKvClient::new(consul, timeout)?),
        };
        sinks.push(Arc::new(KvSink::new(client, consul.kv_target(), timeout)));
    }

    Ok(sinks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::SinkKind;
    use knockrd_core::{
        ConsulConfig, IpSetConfig, ListScope, ListTarget, ManualClock, RuleTarget,
    };
    use std::time::Duration;

    fn list_target(id: &str) -> ListTarget {
        ListTarget {
            id: id.to_string(),
            name: id.to_string(),
            scope: ListScope::Regional,
        }
    }

    fn full_config() -> KnockConfig {
        KnockConfig {
            ip_set: Some(IpSetConfig {
                v4: Some(list_target("allow-v4")),
                v6: Some(list_target("allow-v6")),
            }),
            security_groups: vec![RuleTarget {
                id: "sg-0123".to_string(),
                from_port: 22,
                to_port: 22,
                protocol: "tcp".to_string(),
            }],
            consul: Some(ConsulConfig::new("127.0.0.1:8500")),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_build_defaults() {
        let ctx = KnockContext::build(
            KnockConfig::default(),
            SinkClients::default(),
            Arc::new(ManualClock::at_epoch_2024()),
        )
        .await
        .expect("build");

        assert!(ctx.cache().is_some());
        assert!(ctx.reconciler().is_empty());

        let access = ctx.access();
        access.set("198.51.100.1").await.expect("set");
        assert!(access.get("198.51.100.1").await.expect("get"));
    }

    #[tokio::test]
    async fn test_build_with_every_sink() {
        let config = full_config();
        let clients = SinkClients::in_memory(&config);
        let ctx = KnockContext::build(config, clients, Arc::new(ManualClock::at_epoch_2024()))
            .await
            .expect("build");
        assert_eq!(
            ctx.reconciler().kinds(),
            vec![SinkKind::List, SinkKind::Rule, SinkKind::KeyValue]
        );
    }

    #[tokio::test]
    async fn test_missing_client_is_config_error() {
        let err = KnockContext::build(
            full_config(),
            SinkClients::default(),
            Arc::new(ManualClock::at_epoch_2024()),
        )
        .await
        .expect_err("no list client");
        assert_eq!(err, KnockError::Config(ConfigError::missing("ip_set client")));
    }

    #[tokio::test]
    async fn test_cache_disabled_hands_out_store() {
        let config = KnockConfig {
            cache_ttl_secs: 0,
            negative_cache_ttl_secs: 0,
            ..Default::default()
        };
        let ctx = KnockContext::build(
            config,
            SinkClients::default(),
            Arc::new(ManualClock::at_epoch_2024()),
        )
        .await
        .expect("build");
        assert!(ctx.cache().is_none());
        assert_eq!(ctx.access().ttl(), Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_reclaim_expired_with_lmdb() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = Arc::new(ManualClock::at_epoch_2024());
        let config = KnockConfig {
            store_path: Some(dir.path().join("store")),
            ttl_secs: 60,
            ..Default::default()
        };
        let ctx = KnockContext::build(config, SinkClients::default(), clock.clone())
            .await
            .expect("build");

        ctx.access().set("198.51.100.1").await.expect("set");
        clock.advance(Duration::from_secs(61));
        assert_eq!(ctx.reclaim_expired().await.expect("reclaim"), 1);
        assert!(!ctx.store().get("198.51.100.1").await.expect("get"));
    }
}
