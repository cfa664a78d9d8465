//! In-process store
//!
//! [`MemoryStore`] implements the key-value primitives without any wire
//! format. Values live in a sorted map and subscribers receive deliveries
//! through unbounded channels, synchronously with the write that caused
//! them, so a caller can drain a subscription with
//! [`Subscription::try_recv`] right after a write.
//!
//! [`MemoryTransport`] hands out connections to one shared store. It can be
//! made unavailable, require an auth token, or drop every open connection,
//! which is what the connection lifecycle tests rely on.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::error::{ClientError, ClientResult};
use crate::event::{KeyValueEvent, SubscribeOptions, TransactionId, Value};
use crate::key::{Key, Pattern, Syntax};
use crate::primitives::{Connection, Subscription, Transport, Unsubscribe};

type ConnectionId = u64;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

enum Subscriber {
    Key {
        key: Key,
        unique: bool,
        last: Option<Value>,
        tx: mpsc::UnboundedSender<Option<Value>>,
    },
    Pattern {
        pattern: Pattern,
        unique: bool,
        tx: mpsc::UnboundedSender<KeyValueEvent>,
    },
    Children {
        parent: Option<Key>,
        last: Vec<String>,
        tx: mpsc::UnboundedSender<Vec<String>>,
    },
}

struct Registration {
    connection: ConnectionId,
    subscriber: Subscriber,
}

#[derive(Default)]
struct StoreState {
    values: BTreeMap<Key, Value>,
    subscribers: HashMap<TransactionId, Registration>,
    next_transaction: u64,
    next_connection: ConnectionId,
}

impl StoreState {
    fn register(&mut self, connection: ConnectionId, subscriber: Subscriber) -> TransactionId {
        self.next_transaction += 1;
        let id = TransactionId::new(self.next_transaction);
        self.subscribers.insert(
            id,
            Registration {
                connection,
                subscriber,
            },
        );
        id
    }

    fn notify_write(&mut self, key: &Key, value: &Value, previous: Option<&Value>) {
        let unchanged = previous == Some(value);
        self.subscribers
            .retain(|id, registration| match &mut registration.subscriber {
                Subscriber::Key {
                    key: watched,
                    unique,
                    last,
                    tx,
                } => {
                    if watched != key || (*unique && last.as_ref() == Some(value)) {
                        return true;
                    }
                    *last = Some(value.clone());
                    deliver(id, tx, Some(value.clone()))
                }
                Subscriber::Pattern {
                    pattern,
                    unique,
                    tx,
                } => {
                    if !pattern.matches(key) || (*unique && unchanged) {
                        return true;
                    }
                    deliver(
                        id,
                        tx,
                        KeyValueEvent::upserted(vec![(key.clone(), value.clone())]),
                    )
                }
                Subscriber::Children { .. } => true,
            });
    }

    fn notify_delete(&mut self, key: &Key, removed: &Value) {
        self.subscribers
            .retain(|id, registration| match &mut registration.subscriber {
                Subscriber::Key {
                    key: watched,
                    last,
                    tx,
                    ..
                } => {
                    if watched != key {
                        return true;
                    }
                    *last = None;
                    deliver(id, tx, None)
                }
                Subscriber::Pattern { pattern, tx, .. } => {
                    if !pattern.matches(key) {
                        return true;
                    }
                    deliver(
                        id,
                        tx,
                        KeyValueEvent::removed(vec![(key.clone(), removed.clone())]),
                    )
                }
                Subscriber::Children { .. } => true,
            });
    }

    fn notify_children(&mut self) {
        let values = &self.values;
        self.subscribers
            .retain(|id, registration| match &mut registration.subscriber {
                Subscriber::Children { parent, last, tx } => {
                    let current = children_of(values, parent.as_ref());
                    if current == *last {
                        return true;
                    }
                    *last = current.clone();
                    deliver(id, tx, current)
                }
                _ => true,
            });
    }
}

fn children_of(values: &BTreeMap<Key, Value>, parent: Option<&Key>) -> Vec<String> {
    let depth = parent.map_or(0, Key::depth);
    let mut children = BTreeSet::new();
    for key in values.keys() {
        if key.depth() > depth && parent.map_or(true, |p| key.starts_with(p)) {
            children.insert(key.segments()[depth].clone());
        }
    }
    children.into_iter().collect()
}

fn deliver<T>(id: &TransactionId, tx: &mpsc::UnboundedSender<T>, payload: T) -> bool {
    if tx.send(payload).is_err() {
        trace!(id = %id, "Dropping subscriber with closed receiver");
        return false;
    }
    true
}

/// Shared in-memory key-value store
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
    syntax: Syntax,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that reports `syntax` during the handshake
    pub fn with_syntax(syntax: Syntax) -> Self {
        Self {
            state: Arc::default(),
            syntax,
        }
    }

    pub fn syntax(&self) -> Syntax {
        self.syntax
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        lock(&self.state)
    }

    pub fn get(&self, key: &Key) -> Option<Value> {
        self.lock().values.get(key).cloned()
    }

    pub fn set(&self, key: &Key, value: Value) {
        let mut state = self.lock();
        let previous = state.values.insert(key.clone(), value.clone());
        state.notify_write(key, &value, previous.as_ref());
        if previous.is_none() {
            state.notify_children();
        }
    }

    /// Deliver a value to subscribers without storing it
    pub fn publish(&self, key: &Key, value: Value) {
        self.lock().notify_write(key, &value, None);
    }

    pub fn delete(&self, key: &Key) -> Option<Value> {
        let mut state = self.lock();
        let removed = state.values.remove(key)?;
        state.notify_delete(key, &removed);
        state.notify_children();
        Some(removed)
    }

    pub fn ls(&self, parent: Option<&Key>) -> Vec<String> {
        children_of(&self.lock().values, parent)
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.lock().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().values.is_empty()
    }

    /// Number of live subscriptions across all connections
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    fn open_connection(&self) -> ConnectionId {
        let mut state = self.lock();
        state.next_connection += 1;
        state.next_connection
    }

    fn drop_connection(&self, connection: ConnectionId) {
        self.lock()
            .subscribers
            .retain(|_, registration| registration.connection != connection);
    }

    fn unregister(&self, id: TransactionId) -> bool {
        self.lock().subscribers.remove(&id).is_some()
    }

    fn subscribe_key(
        &self,
        connection: ConnectionId,
        key: &Key,
        options: SubscribeOptions,
    ) -> (TransactionId, mpsc::UnboundedReceiver<Option<Value>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        let current = state.values.get(key).cloned();
        if !options.live_only {
            if let Some(value) = &current {
                let _ = tx.send(Some(value.clone()));
            }
        }
        let id = state.register(
            connection,
            Subscriber::Key {
                key: key.clone(),
                unique: options.unique,
                last: current,
                tx,
            },
        );
        (id, rx)
    }

    fn subscribe_pattern(
        &self,
        connection: ConnectionId,
        pattern: &Pattern,
        options: SubscribeOptions,
    ) -> (TransactionId, mpsc::UnboundedReceiver<KeyValueEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        if !options.live_only {
            let retained: Vec<(Key, Value)> = state
                .values
                .iter()
                .filter(|(key, _)| pattern.matches(key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            if !retained.is_empty() {
                let _ = tx.send(KeyValueEvent::upserted(retained));
            }
        }
        let id = state.register(
            connection,
            Subscriber::Pattern {
                pattern: pattern.clone(),
                unique: options.unique,
                tx,
            },
        );
        (id, rx)
    }

    fn subscribe_children(
        &self,
        connection: ConnectionId,
        parent: Option<&Key>,
    ) -> (TransactionId, mpsc::UnboundedReceiver<Vec<String>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        let current = children_of(&state.values, parent);
        let _ = tx.send(current.clone());
        let id = state.register(
            connection,
            Subscriber::Children {
                parent: parent.cloned(),
                last: current,
                tx,
            },
        );
        (id, rx)
    }
}

struct ConnectionShared {
    id: ConnectionId,
    store: MemoryStore,
    client_name: Option<String>,
    closed: watch::Sender<bool>,
}

impl ConnectionShared {
    fn ensure_open(&self) -> ClientResult<()> {
        if *self.closed.borrow() {
            return Err(ClientError::Closed);
        }
        Ok(())
    }

    fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        self.store.drop_connection(self.id);
        debug!(connection = self.id, "Memory connection closed");
    }
}

impl Unsubscribe for ConnectionShared {
    fn unsubscribe(&self, id: TransactionId) -> ClientResult<()> {
        if self.store.unregister(id) {
            trace!(id = %id, "Unsubscribed");
        }
        Ok(())
    }
}

impl Drop for ConnectionShared {
    fn drop(&mut self) {
        self.store.drop_connection(self.id);
    }
}

/// Connection handle to a [`MemoryStore`]
pub struct MemoryConnection {
    shared: Arc<ConnectionShared>,
}

impl MemoryConnection {
    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    /// Name the client announced when connecting
    pub fn client_name(&self) -> Option<&str> {
        self.shared.client_name.as_deref()
    }
}

impl Unsubscribe for MemoryConnection {
    fn unsubscribe(&self, id: TransactionId) -> ClientResult<()> {
        self.shared.unsubscribe(id)
    }
}

impl Connection for MemoryConnection {
    fn syntax(&self) -> Syntax {
        self.shared.store.syntax()
    }

    async fn get(&self, key: &Key) -> ClientResult<Option<Value>> {
        self.shared.ensure_open()?;
        Ok(self.shared.store.get(key))
    }

    async fn set(&self, key: &Key, value: Value) -> ClientResult<()> {
        self.shared.ensure_open()?;
        self.shared.store.set(key, value);
        Ok(())
    }

    async fn delete(&self, key: &Key) -> ClientResult<Option<Value>> {
        self.shared.ensure_open()?;
        Ok(self.shared.store.delete(key))
    }

    async fn publish(&self, key: &Key, value: Value) -> ClientResult<()> {
        self.shared.ensure_open()?;
        self.shared.store.publish(key, value);
        Ok(())
    }

    async fn ls(&self, parent: Option<&Key>) -> ClientResult<Vec<String>> {
        self.shared.ensure_open()?;
        Ok(self.shared.store.ls(parent))
    }

    async fn subscribe(
        &self,
        key: &Key,
        options: SubscribeOptions,
    ) -> ClientResult<Subscription<Option<Value>>> {
        self.shared.ensure_open()?;
        let (id, rx) = self.shared.store.subscribe_key(self.shared.id, key, options);
        Ok(Subscription::new(id, rx, self.shared.clone()))
    }

    async fn psubscribe(
        &self,
        pattern: &Pattern,
        options: SubscribeOptions,
    ) -> ClientResult<Subscription<KeyValueEvent>> {
        self.shared.ensure_open()?;
        let (id, rx) = self
            .shared
            .store
            .subscribe_pattern(self.shared.id, pattern, options);
        Ok(Subscription::new(id, rx, self.shared.clone()))
    }

    async fn subscribe_ls(&self, parent: Option<&Key>) -> ClientResult<Subscription<Vec<String>>> {
        self.shared.ensure_open()?;
        let (id, rx) = self.shared.store.subscribe_children(self.shared.id, parent);
        Ok(Subscription::new(id, rx, self.shared.clone()))
    }

    fn close(&self) {
        self.shared.close();
    }

    fn closed(&self) -> impl std::future::Future<Output = ()> + Send {
        let mut rx = self.shared.closed.subscribe();
        async move {
            let _ = rx.wait_for(|closed| *closed).await;
        }
    }
}

#[derive(Default)]
struct TransportControl {
    unavailable: AtomicBool,
    attempts: AtomicUsize,
    required_token: Mutex<Option<String>>,
    connections: Mutex<Vec<Weak<ConnectionShared>>>,
}

/// Transport producing [`MemoryConnection`]s to one shared store
#[derive(Clone, Default)]
pub struct MemoryTransport {
    store: MemoryStore,
    control: Arc<TransportControl>,
}

impl MemoryTransport {
    pub fn new(store: MemoryStore) -> Self {
        Self {
            store,
            control: Arc::default(),
        }
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    /// Make subsequent connection attempts fail (or succeed again)
    pub fn set_available(&self, available: bool) {
        self.control.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Reject connections whose auth token differs from `token`
    pub fn require_auth_token(&self, token: Option<String>) {
        *lock(&self.control.required_token) = token;
    }

    /// Number of `connect` calls so far, failed ones included
    pub fn connect_attempts(&self) -> usize {
        self.control.attempts.load(Ordering::SeqCst)
    }

    /// Close every open connection as if the store went away
    pub fn drop_connections(&self) {
        let connections = std::mem::take(&mut *lock(&self.control.connections));
        for shared in connections.iter().filter_map(Weak::upgrade) {
            shared.close();
        }
    }
}

impl Transport for MemoryTransport {
    type Handle = MemoryConnection;

    async fn connect(
        &self,
        address: &str,
        auth_token: Option<&str>,
        _keepalive: Option<Duration>,
        client_name: Option<&str>,
    ) -> ClientResult<MemoryConnection> {
        let attempt = self.control.attempts.fetch_add(1, Ordering::SeqCst) + 1;

        let refuse = |message: &str| ClientError::Connect {
            address: address.to_string(),
            message: message.to_string(),
        };

        if self.control.unavailable.load(Ordering::SeqCst) {
            return Err(refuse("store unavailable"));
        }
        if let Some(required) = lock(&self.control.required_token).as_deref() {
            if auth_token != Some(required) {
                return Err(refuse("authentication failed"));
            }
        }

        let (closed, _) = watch::channel(false);
        let shared = Arc::new(ConnectionShared {
            id: self.store.open_connection(),
            store: self.store.clone(),
            client_name: client_name.map(String::from),
            closed,
        });
        {
            let mut connections = lock(&self.control.connections);
            connections.retain(|connection| connection.strong_count() > 0);
            connections.push(Arc::downgrade(&shared));
        }
        debug!(
            address,
            attempt,
            connection = shared.id,
            client_name = ?client_name,
            "Memory connection opened"
        );

        Ok(MemoryConnection { shared })
    }
}
