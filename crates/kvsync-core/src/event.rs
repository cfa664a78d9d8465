//! Subscription payloads and options

use std::fmt;

use crate::key::Key;

/// Values stored under keys
pub type Value = serde_json::Value;

/// Identifier the store hands out for each subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(u64);

impl TransactionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// Flags for `subscribe` and `psubscribe`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Suppress identical consecutive values
    pub unique: bool,
    /// Skip the replay of currently retained values
    pub live_only: bool,
}

impl SubscribeOptions {
    pub fn unique() -> Self {
        Self {
            unique: true,
            live_only: false,
        }
    }

    pub fn with_live_only(mut self, live_only: bool) -> Self {
        self.live_only = live_only;
        self
    }
}

/// One delivered batch of changes for a pattern subscription
///
/// `removed` carries the last known value of each deleted key, which may
/// already be stale. Consumers apply upserts first and removals second.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyValueEvent {
    pub upserted: Vec<(Key, Value)>,
    pub removed: Vec<(Key, Value)>,
}

impl KeyValueEvent {
    pub fn upserted(entries: Vec<(Key, Value)>) -> Self {
        Self {
            upserted: entries,
            removed: Vec::new(),
        }
    }

    pub fn removed(entries: Vec<(Key, Value)>) -> Self {
        Self {
            upserted: Vec::new(),
            removed: entries,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.upserted.is_empty() && self.removed.is_empty()
    }
}
