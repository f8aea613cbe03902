//! Mutation-log wire format.
//!
//! A batch is a JSON document of the shape
//!
//! ```text
//! {"Records": [{"eventName": "INSERT", "dynamodb": {"Keys": {"Key": {"S": "198.51.100.1"}}}}]}
//! ```
//!
//! Fields this service does not read are ignored.

use std::collections::HashMap;

use knockrd_core::{MutationKind, MutationRecord, ValidationError};
use serde::{Deserialize, Serialize};

/// Attribute holding the access key in each record's key map.
pub const KEY_ATTRIBUTE: &str = "Key";

/// One delivery from the mutation log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamBatch {
    #[serde(rename = "Records", default)]
    pub records: Vec<StreamRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRecord {
    #[serde(rename = "eventID", default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,

    #[serde(rename = "eventName", default)]
    pub event_name: String,

    #[serde(rename = "dynamodb", default)]
    pub change: StreamChange,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChange {
    #[serde(rename = "Keys", default)]
    pub keys: HashMap<String, AttributeValue>,
}

/// Typed attribute value. Only the string form carries an access key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeValue {
    #[serde(rename = "S", default, skip_serializing_if = "Option::is_none")]
    pub s: Option<String>,

    #[serde(rename = "N", default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
}

impl StreamBatch {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Build a batch from `(key, event name)` pairs.
    pub fn from_pairs<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        Self {
            records: pairs
                .into_iter()
                .map(|(key, name)| StreamRecord::new(key, name))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Decode every record, in order.
    pub fn mutation_records(&self) -> Vec<Result<MutationRecord, ValidationError>> {
        self.records.iter().map(StreamRecord::to_mutation).collect()
    }
}

impl StreamRecord {
    pub fn new(key: &str, event_name: &str) -> Self {
        let mut keys = HashMap::new();
        keys.insert(
            KEY_ATTRIBUTE.to_string(),
            AttributeValue {
                s: Some(key.to_string()),
                n: None,
            },
        );
        Self {
            event_id: None,
            event_name: event_name.to_string(),
            change: StreamChange { keys },
        }
    }

    /// The string value of the key attribute, if present.
    pub fn key(&self) -> Option<&str> {
        self.change
            .keys
            .get(KEY_ATTRIBUTE)
            .and_then(|v| v.s.as_deref())
    }

    pub fn to_mutation(&self) -> Result<MutationRecord, ValidationError> {
        let key = self.key().ok_or(ValidationError::MissingKey)?;
        Ok(MutationRecord::new(
            key,
            MutationKind::parse(&self.event_name),
        ))
    }
}
