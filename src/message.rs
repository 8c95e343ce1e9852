use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    #[default]
    Transient,
    Persistent,
}

impl DeliveryMode {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            DeliveryMode::Transient => 1,
            DeliveryMode::Persistent => 2,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(DeliveryMode::Transient),
            2 => Some(DeliveryMode::Persistent),
            _ => None,
        }
    }
}

/// Message metadata carried alongside the body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicProperties {
    /// Empty until the broker assigns one on publish.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub routing_key: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub delivery_mode: DeliveryMode,
    #[serde(default)]
    pub priority: u8,
    /// Nanoseconds since the UNIX epoch; stamped on publish when zero.
    #[serde(default)]
    pub timestamp_ns: u64,
    #[serde(default)]
    pub correlation_id: String,
    #[serde(default)]
    pub reply_to: String,
    #[serde(default)]
    pub content_type: String,
}

impl BasicProperties {
    pub fn with_routing_key(routing_key: impl Into<String>) -> Self {
        Self {
            routing_key: routing_key.into(),
            ..Self::default()
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Location of a durable message's record inside its queue log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLocation {
    pub offset: u64,
    pub len: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub properties: BasicProperties,
    pub body: Vec<u8>,
    pub(crate) location: Option<RecordLocation>,
}

impl Message {
    pub fn new(properties: BasicProperties, body: impl Into<Vec<u8>>) -> Self {
        Self {
            properties,
            body: body.into(),
            location: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.properties.id
    }

    pub fn is_durable(&self) -> bool {
        self.location.is_some()
    }

    pub fn location(&self) -> Option<RecordLocation> {
        self.location
    }
}

/// Produces broker-assigned message ids of the form `<epoch hex>-<seq>`.
///
/// The epoch is the creation timestamp, so ids minted after a restart never
/// collide with ids recovered from a queue log.
#[derive(Debug)]
pub struct IdGenerator {
    epoch: u64,
    seq: AtomicU64,
}

impl IdGenerator {
    pub fn new(epoch: u64) -> Self {
        Self {
            epoch,
            seq: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{:x}-{}", self.epoch, seq)
    }
}
