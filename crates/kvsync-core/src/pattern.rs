//! Pattern subscription state
//!
//! [`PatternState`] folds the batches of a pattern subscription into an
//! insertion-ordered `key -> value` map. Each applied batch produces a new
//! `Arc` for the entries, so a snapshot handed to a consumer is never
//! mutated afterwards.

use std::future::Future;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::debug;

use crate::error::ClientResult;
use crate::event::{KeyValueEvent, SubscribeOptions, Value};
use crate::key::{Key, Pattern};
use crate::primitives::{Connection, Subscription};
use crate::watch::{Reducer, Watch};

/// Live view of every key matching a pattern
pub type PatternWatch = Watch<PatternState>;

/// Keys currently matching the bound pattern
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatternState {
    pattern: Option<Pattern>,
    entries: Arc<IndexMap<Key, Value>>,
}

impl PatternState {
    /// Empty state bound to `pattern`
    pub fn new(pattern: Pattern) -> Self {
        Self {
            pattern: Some(pattern),
            entries: Arc::default(),
        }
    }

    pub fn pattern(&self) -> Option<&Pattern> {
        self.pattern.as_ref()
    }

    pub fn entries(&self) -> &Arc<IndexMap<Key, Value>> {
        &self.entries
    }

    pub fn get(&self, key: &Key) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Clear everything and bind to `pattern`
    pub fn reset(&mut self, pattern: &Pattern) {
        self.pattern = Some(pattern.clone());
        self.entries = Arc::default();
    }

    /// Apply one batch delivered for `bound`
    ///
    /// A batch for a different pattern than the current one clears the state
    /// first. Upserts are applied before removals, so a key both upserted and
    /// removed in the same batch ends up absent. Returns true when the state
    /// changed identity.
    pub fn apply(&mut self, bound: &Pattern, event: KeyValueEvent) -> bool {
        let stale = self.pattern.as_ref() != Some(bound);
        if stale {
            debug!(pattern = %bound, "Pattern changed, clearing state");
            self.reset(bound);
        }
        if event.is_empty() {
            return stale;
        }

        let mut entries = IndexMap::clone(&self.entries);
        for (key, value) in event.upserted {
            entries.insert(key, value);
        }
        for (key, _) in event.removed {
            entries.shift_remove(&key);
        }
        self.entries = Arc::new(entries);
        true
    }
}

impl Reducer for PatternState {
    type Target = Pattern;
    type Item = KeyValueEvent;
    type Snapshot = PatternState;

    fn open<'a, C: Connection>(
        connection: &'a C,
        target: &'a Pattern,
        options: SubscribeOptions,
    ) -> impl Future<Output = ClientResult<Subscription<KeyValueEvent>>> + Send + 'a {
        connection.psubscribe(target, options)
    }

    fn reset(&mut self, target: &Pattern) {
        PatternState::reset(self, target);
    }

    fn fold(&mut self, bound: &Pattern, item: KeyValueEvent) -> bool {
        self.apply(bound, item)
    }

    fn snapshot(&self) -> PatternState {
        self.clone()
    }
}
