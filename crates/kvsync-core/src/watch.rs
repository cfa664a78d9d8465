//! Live watches
//!
//! A [`Watch`] binds a [`Reducer`] to the current connection and keeps its
//! snapshot up to date. Everything happens inside one task: whenever the
//! target or the connection changes, the previous subscription is released,
//! the reducer is reset to an empty state for the new target and a new
//! subscription is opened if a connection exists. Deliveries are folded in
//! order and the snapshot is republished only when the reducer says so.
//!
//! Consumers read snapshots through a `watch::Receiver`, so a slow reader
//! only ever sees the latest state.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{ClientError, ClientResult};
use crate::event::SubscribeOptions;
use crate::primitives::{Connection, Subscription};

/// Derived state fed by one subscription
pub trait Reducer: Send + 'static {
    /// What the subscription is bound to (a pattern, a key, ...)
    type Target: Clone + PartialEq + fmt::Debug + Send + Sync + 'static;
    /// One delivery
    type Item: Send + 'static;
    /// What consumers read
    type Snapshot: Clone + Send + Sync + 'static;

    /// Open the subscription for `target`
    fn open<'a, C: Connection>(
        connection: &'a C,
        target: &'a Self::Target,
        options: SubscribeOptions,
    ) -> impl Future<Output = ClientResult<Subscription<Self::Item>>> + Send + 'a;

    /// Drop all state and bind to `target`
    fn reset(&mut self, target: &Self::Target);

    /// Fold one delivery; returns true when the snapshot should be republished
    fn fold(&mut self, bound: &Self::Target, item: Self::Item) -> bool;

    fn snapshot(&self) -> Self::Snapshot;
}

/// Handle to a running watch
///
/// Dropping the handle stops the task and releases its subscription.
pub struct Watch<R: Reducer> {
    target_tx: watch::Sender<R::Target>,
    snapshot_rx: watch::Receiver<R::Snapshot>,
    error_rx: watch::Receiver<Option<ClientError>>,
    task: JoinHandle<()>,
}

impl<R: Reducer> Watch<R> {
    /// Spawn a watch following the connections published on `connections`
    pub fn spawn<C: Connection>(
        connections: watch::Receiver<Option<Arc<C>>>,
        target: R::Target,
        options: SubscribeOptions,
        mut reducer: R,
    ) -> Self {
        reducer.reset(&target);
        let (snapshot_tx, snapshot_rx) = watch::channel(reducer.snapshot());
        let (target_tx, targets) = watch::channel(target);
        let (error_tx, error_rx) = watch::channel(None);

        let driver = Driver {
            reducer,
            connections,
            targets,
            options,
            snapshot_tx,
            error_tx,
        };
        let task = tokio::spawn(driver.run());

        Self {
            target_tx,
            snapshot_rx,
            error_rx,
            task,
        }
    }

    pub fn target(&self) -> R::Target {
        self.target_tx.borrow().clone()
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> R::Snapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<R::Snapshot> {
        self.snapshot_rx.clone()
    }

    /// Error of the last failed subscribe, cleared by the next success
    pub fn last_error(&self) -> Option<ClientError> {
        self.error_rx.borrow().clone()
    }

    pub fn subscribe_errors(&self) -> watch::Receiver<Option<ClientError>> {
        self.error_rx.clone()
    }

    /// Bind to a new target; identical targets are ignored
    pub fn retarget(&self, target: R::Target) {
        self.target_tx.send_if_modified(|current| {
            if *current == target {
                return false;
            }
            *current = target;
            true
        });
    }

    /// Stop the watch and wait until its subscription is released
    pub async fn close(self) {
        let Watch {
            target_tx, task, ..
        } = self;
        drop(target_tx);

        if let Err(e) = task.await {
            warn!(error = %e, "Watch task failed");
        }
    }
}

enum Wake<T> {
    Rebind,
    Stop,
    Item(Option<T>),
}

struct Driver<R: Reducer, C> {
    reducer: R,
    connections: watch::Receiver<Option<Arc<C>>>,
    targets: watch::Receiver<R::Target>,
    options: SubscribeOptions,
    snapshot_tx: watch::Sender<R::Snapshot>,
    error_tx: watch::Sender<Option<ClientError>>,
}

impl<R: Reducer, C: Connection> Driver<R, C> {
    async fn run(mut self) {
        let mut bound = self.targets.borrow_and_update().clone();
        let mut subscription: Option<Subscription<R::Item>> = None;

        loop {
            if let Some(mut previous) = subscription.take() {
                previous.release();
            }
            self.reducer.reset(&bound);
            self.snapshot_tx.send_replace(self.reducer.snapshot());
            subscription = self.open(&bound).await;

            loop {
                let wake = tokio::select! {
                    changed = self.targets.changed() => match changed {
                        Ok(()) => Wake::Rebind,
                        Err(_) => Wake::Stop,
                    },
                    changed = self.connections.changed() => match changed {
                        Ok(()) => Wake::Rebind,
                        Err(_) => Wake::Stop,
                    },
                    item = next_item(&mut subscription) => Wake::Item(item),
                };

                match wake {
                    Wake::Item(Some(item)) => {
                        if self.reducer.fold(&bound, item) {
                            self.snapshot_tx.send_replace(self.reducer.snapshot());
                        }
                    }
                    Wake::Item(None) => {
                        debug!(target = ?bound, "Subscription ended by store");
                        subscription = None;
                    }
                    Wake::Rebind => {
                        bound = self.targets.borrow_and_update().clone();
                        break;
                    }
                    Wake::Stop => {
                        if let Some(mut subscription) = subscription.take() {
                            subscription.release();
                        }
                        debug!(target = ?bound, "Watch stopped");
                        return;
                    }
                }
            }
        }
    }

    async fn open(&mut self, target: &R::Target) -> Option<Subscription<R::Item>> {
        let connection = self.connections.borrow_and_update().clone()?;

        match R::open(connection.as_ref(), target, self.options).await {
            Ok(subscription) => {
                debug!(target = ?target, id = %subscription.id(), "Subscribed");
                self.error_tx.send_replace(None);
                Some(subscription)
            }
            Err(e) => {
                warn!(target = ?target, error = %e, "Subscribe failed");
                self.error_tx.send_replace(Some(e));
                None
            }
        }
    }
}

async fn next_item<T>(subscription: &mut Option<Subscription<T>>) -> Option<T> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Value;
    use crate::key::Key;
    use crate::memory::{MemoryConnection, MemoryTransport};
    use crate::primitives::Transport;
    use serde_json::json;

    /// Counts every delivery for one key
    #[derive(Default)]
    struct Counter {
        key: Option<Key>,
        seen: Vec<Option<Value>>,
    }

    impl Reducer for Counter {
        type Target = Key;
        type Item = Option<Value>;
        type Snapshot = usize;

        fn open<'a, C: Connection>(
            connection: &'a C,
            target: &'a Key,
            options: SubscribeOptions,
        ) -> impl Future<Output = ClientResult<Subscription<Option<Value>>>> + Send + 'a {
            connection.subscribe(target, options)
        }

        fn reset(&mut self, target: &Key) {
            self.key = Some(target.clone());
            self.seen.clear();
        }

        fn fold(&mut self, _bound: &Key, item: Option<Value>) -> bool {
            self.seen.push(item);
            true
        }

        fn snapshot(&self) -> usize {
            self.seen.len()
        }
    }

    fn key(raw: &str) -> Key {
        Key::parse(raw).unwrap()
    }

    async fn connected(
        transport: &MemoryTransport,
    ) -> (
        watch::Sender<Option<Arc<MemoryConnection>>>,
        Arc<MemoryConnection>,
    ) {
        let conn = Arc::new(transport.connect("memory://test", None, None, None).await.unwrap());
        let (tx, _) = watch::channel(Some(conn.clone()));
        (tx, conn)
    }

    #[tokio::test]
    async fn test_folds_deliveries() {
        let transport = MemoryTransport::default();
        let (tx, conn) = connected(&transport).await;
        let watch = Watch::spawn(
            tx.subscribe(),
            key("a"),
            SubscribeOptions::default(),
            Counter::default(),
        );
        let mut rx = watch.subscribe();

        // Wait for the subscription to be registered
        while transport.store().subscriber_count() == 0 {
            tokio::task::yield_now().await;
        }
        conn.set(&key("a"), json!(1)).await.unwrap();
        conn.set(&key("a"), json!(2)).await.unwrap();

        rx.wait_for(|count| *count == 2).await.unwrap();
        assert!(watch.last_error().is_none());
    }

    #[tokio::test]
    async fn test_close_releases_subscription() {
        let transport = MemoryTransport::default();
        let (tx, _conn) = connected(&transport).await;
        let watch = Watch::spawn(
            tx.subscribe(),
            key("a"),
            SubscribeOptions::default(),
            Counter::default(),
        );
        while transport.store().subscriber_count() == 0 {
            tokio::task::yield_now().await;
        }

        watch.close().await;
        assert_eq!(transport.store().subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_connection_change_rebinds() {
        let transport = MemoryTransport::default();
        let (tx, first) = connected(&transport).await;
        let watch = Watch::spawn(
            tx.subscribe(),
            key("a"),
            SubscribeOptions::default(),
            Counter::default(),
        );
        let mut rx = watch.subscribe();
        transport.store().set(&key("a"), json!("x"));
        while transport.store().subscriber_count() == 0 {
            tokio::task::yield_now().await;
        }
        rx.wait_for(|count| *count >= 1).await.unwrap();

        tx.send_replace(None);
        rx.wait_for(|count| *count == 0).await.unwrap();
        while transport.store().subscriber_count() != 0 {
            tokio::task::yield_now().await;
        }

        let second = Arc::new(transport.connect("memory://test", None, None, None).await.unwrap());
        tx.send_replace(Some(second));
        // Replay of the retained value on the new subscription
        rx.wait_for(|count| *count == 1).await.unwrap();
        assert!(!first.is_closed());
    }

    #[tokio::test]
    async fn test_subscribe_failure_is_recorded() {
        let transport = MemoryTransport::default();
        let (tx, conn) = connected(&transport).await;
        conn.close();

        let watch = Watch::spawn(
            tx.subscribe(),
            key("a"),
            SubscribeOptions::default(),
            Counter::default(),
        );
        let mut errors = watch.subscribe_errors();
        let err = errors.wait_for(Option::is_some).await.unwrap().clone();

        assert_eq!(err, Some(ClientError::Closed));
        assert_eq!(watch.snapshot(), 0);
    }

    #[tokio::test]
    async fn test_retarget_ignores_identical_target() {
        let transport = MemoryTransport::default();
        let (tx, _conn) = connected(&transport).await;
        let watch = Watch::spawn(
            tx.subscribe(),
            key("a"),
            SubscribeOptions::default(),
            Counter::default(),
        );
        let mut targets_seen = watch.target_tx.subscribe();
        targets_seen.borrow_and_update();

        watch.retarget(key("a"));
        assert!(!targets_seen.has_changed().unwrap());

        watch.retarget(key("b"));
        assert!(targets_seen.has_changed().unwrap());
        assert_eq!(watch.target(), key("b"));
    }
}
