//! Connection scope
//!
//! A [`ClientScope`] is the context everything else hangs off: it owns the
//! connection manager and hands out watches, caches and one-shot requests
//! bound to its connection. Pass it (or a reference) explicitly to the code
//! that needs the store.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::cache::{CachePolicy, LocalCache};
use crate::config::Config;
use crate::connection::{ConnectionManager, ConnectionSettings, ConnectionState};
use crate::error::{ClientError, ClientResult};
use crate::event::{SubscribeOptions, Value};
use crate::key::{Key, Pattern, Syntax};
use crate::pattern::{PatternState, PatternWatch};
use crate::primitives::{Connection, Transport};
use crate::tree::{TreeAggregator, TreeWatch};
use crate::value::{ChildrenState, ChildrenWatch, ValueState, ValueWatch};
use crate::watch::Watch;

/// One connection scope
pub struct ClientScope<T: Transport> {
    manager: ConnectionManager<T>,
    /// Used while no connection has negotiated one
    syntax: Syntax,
}

impl<T: Transport> ClientScope<T> {
    /// Start connecting with `settings`
    pub fn new(transport: T, settings: ConnectionSettings) -> Self {
        Self {
            manager: ConnectionManager::spawn(transport, settings),
            syntax: Syntax::default(),
        }
    }

    pub fn from_config(transport: T, config: &Config) -> Self {
        Self::new(transport, config.connection_settings()).with_syntax(config.syntax())
    }

    /// Syntax to use until a connection reports its own
    pub fn with_syntax(mut self, syntax: Syntax) -> Self {
        self.syntax = syntax;
        self
    }

    pub fn manager(&self) -> &ConnectionManager<T> {
        &self.manager
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.manager.subscribe_state()
    }

    pub fn reconfigure(&self, settings: ConnectionSettings) {
        self.manager.reconfigure(settings);
    }

    /// The live connection, or `NotConnected`
    pub fn connection(&self) -> ClientResult<Arc<T::Handle>> {
        self.manager.connection().ok_or(ClientError::NotConnected)
    }

    /// Wait up to `timeout` for a live connection
    pub async fn wait_connected(&self, timeout: Duration) -> ClientResult<Arc<T::Handle>> {
        let mut handles = self.manager.subscribe_connection();
        let connected = async move {
            match handles.wait_for(Option::is_some).await {
                Ok(handle) => handle.clone(),
                Err(_) => None,
            }
        };

        match tokio::time::timeout(timeout, connected).await {
            Ok(Some(handle)) => Ok(handle),
            _ => Err(ClientError::NotConnected),
        }
    }

    /// Syntax of the live connection, or the configured one
    pub fn syntax(&self) -> Syntax {
        self.manager
            .connection()
            .map_or(self.syntax, |connection| connection.syntax())
    }

    pub fn parse_key(&self, raw: &str) -> ClientResult<Key> {
        self.syntax().parse_key(raw)
    }

    pub fn parse_pattern(&self, raw: &str) -> ClientResult<Pattern> {
        self.syntax().parse_pattern(raw)
    }

    /// Live map of every key matching `pattern`
    pub fn watch_pattern(&self, pattern: Pattern, options: SubscribeOptions) -> PatternWatch {
        Watch::spawn(
            self.manager.subscribe_connection(),
            pattern,
            options,
            PatternState::default(),
        )
    }

    /// Live tree of every key matching `pattern`
    ///
    /// The tree only tracks keys, so [`SubscribeOptions::unique`] is usually
    /// what you want here.
    pub fn watch_tree(&self, pattern: Pattern, options: SubscribeOptions) -> TreeWatch {
        Watch::spawn(
            self.manager.subscribe_connection(),
            pattern,
            options,
            TreeAggregator::default(),
        )
    }

    pub fn watch_value(&self, key: Key, options: SubscribeOptions) -> ValueWatch {
        Watch::spawn(
            self.manager.subscribe_connection(),
            key,
            options,
            ValueState::default(),
        )
    }

    /// Live children of `parent` (the root when `None`)
    ///
    /// `subscribe_ls` takes no flags.
    pub fn watch_children(&self, parent: Option<Key>) -> ChildrenWatch {
        Watch::spawn(
            self.manager.subscribe_connection(),
            parent,
            SubscribeOptions::default(),
            ChildrenState::default(),
        )
    }

    pub async fn get(&self, key: &Key) -> ClientResult<Option<Value>> {
        self.connection()?.get(key).await
    }

    pub async fn set(&self, key: &Key, value: Value) -> ClientResult<()> {
        self.connection()?.set(key, value).await
    }

    pub async fn delete(&self, key: &Key) -> ClientResult<Option<Value>> {
        self.connection()?.delete(key).await
    }

    pub async fn publish(&self, key: &Key, value: Value) -> ClientResult<()> {
        self.connection()?.publish(key, value).await
    }

    pub async fn ls(&self, parent: Option<&Key>) -> ClientResult<Vec<String>> {
        self.connection()?.ls(parent).await
    }

    /// Cache in front of this scope's connection
    ///
    /// Follows reconnects; requests fail with `NotConnected` while there is
    /// no live connection.
    pub fn cache(&self, policy: &CachePolicy) -> LocalCache<T::Handle> {
        LocalCache::with_policy(self.manager.subscribe_connection(), policy)
    }

    /// Stop the manager and close the connection
    pub async fn shutdown(self) {
        self.manager.shutdown().await;
    }
}
