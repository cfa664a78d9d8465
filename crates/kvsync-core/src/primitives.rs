//! Key-value primitives
//!
//! The seam between this crate and whatever actually talks to the store.
//! A [`Transport`] produces [`Connection`] handles; a connection exposes the
//! request/response operations plus subscriptions that deliver into a
//! [`Subscription`] receiver.
//!
//! ## Releasing subscriptions
//!
//! A subscription is released exactly once: either explicitly through
//! [`Subscription::release`] or when it is dropped. Releasing closes the
//! receiver first, so anything the store delivers afterwards is discarded.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::ClientResult;
use crate::event::{KeyValueEvent, SubscribeOptions, TransactionId, Value};
use crate::key::{Key, Pattern, Syntax};

/// Cancels a subscription on the store side
///
/// Unknown or already released ids must be accepted as a no-op.
pub trait Unsubscribe: Send + Sync {
    fn unsubscribe(&self, id: TransactionId) -> ClientResult<()>;
}

/// A live connection to the store
pub trait Connection: Unsubscribe + 'static {
    /// Separator and wildcards agreed on during the handshake
    fn syntax(&self) -> Syntax;

    fn get(&self, key: &Key) -> impl Future<Output = ClientResult<Option<Value>>> + Send;

    fn set(&self, key: &Key, value: Value) -> impl Future<Output = ClientResult<()>> + Send;

    /// Delete a key, returning the removed value
    fn delete(&self, key: &Key) -> impl Future<Output = ClientResult<Option<Value>>> + Send;

    /// Notify subscribers without retaining the value
    fn publish(&self, key: &Key, value: Value) -> impl Future<Output = ClientResult<()>> + Send;

    /// Direct children of `parent` (the root when `None`)
    fn ls(&self, parent: Option<&Key>) -> impl Future<Output = ClientResult<Vec<String>>> + Send;

    /// Subscribe to one key; `None` is delivered when the key is deleted
    fn subscribe(
        &self,
        key: &Key,
        options: SubscribeOptions,
    ) -> impl Future<Output = ClientResult<Subscription<Option<Value>>>> + Send;

    /// Subscribe to every key matching `pattern`
    fn psubscribe(
        &self,
        pattern: &Pattern,
        options: SubscribeOptions,
    ) -> impl Future<Output = ClientResult<Subscription<KeyValueEvent>>> + Send;

    /// Subscribe to the children of `parent`
    fn subscribe_ls(
        &self,
        parent: Option<&Key>,
    ) -> impl Future<Output = ClientResult<Subscription<Vec<String>>>> + Send;

    /// Close the connection from this side
    fn close(&self);

    /// Resolves once the connection is closed by either side
    fn closed(&self) -> impl Future<Output = ()> + Send;
}

/// Establishes connections
pub trait Transport: Send + Sync + 'static {
    type Handle: Connection;

    /// `client_name` is reported to the store during the handshake
    fn connect(
        &self,
        address: &str,
        auth_token: Option<&str>,
        keepalive: Option<Duration>,
        client_name: Option<&str>,
    ) -> impl Future<Output = ClientResult<Self::Handle>> + Send;
}

/// Receiving end of a subscription
pub struct Subscription<T> {
    id: TransactionId,
    rx: mpsc::UnboundedReceiver<T>,
    releaser: Option<Arc<dyn Unsubscribe>>,
}

impl<T> Subscription<T> {
    pub fn new(
        id: TransactionId,
        rx: mpsc::UnboundedReceiver<T>,
        releaser: Arc<dyn Unsubscribe>,
    ) -> Self {
        Self {
            id,
            rx,
            releaser: Some(releaser),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn is_released(&self) -> bool {
        self.releaser.is_none()
    }

    /// Wait for the next delivery
    ///
    /// Returns `None` once released or when the store ends the subscription.
    pub async fn recv(&mut self) -> Option<T> {
        if self.is_released() {
            return None;
        }
        self.rx.recv().await
    }

    /// Take a delivery that is already queued, without waiting
    pub fn try_recv(&mut self) -> Option<T> {
        if self.is_released() {
            return None;
        }
        self.rx.try_recv().ok()
    }

    /// Release the subscription; later calls are no-ops
    pub fn release(&mut self) {
        let Some(releaser) = self.releaser.take() else {
            return;
        };

        self.rx.close();
        while self.rx.try_recv().is_ok() {}

        if let Err(e) = releaser.unsubscribe(self.id) {
            debug!(id = %self.id, error = %e, "Unsubscribe failed");
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.release();
    }
}
