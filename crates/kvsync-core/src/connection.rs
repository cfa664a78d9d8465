//! Connection lifecycle
//!
//! A [`ConnectionManager`] owns one background task that keeps a single
//! connection to the store alive. It issues at most one `connect` at a time,
//! publishes every state transition through a `watch` channel and retries
//! after a fixed delay when automatic reconnection is enabled. The current
//! handle is published through a second `watch` channel so that watches and
//! caches can rebind when it changes.
//!
//! Failures never escape the task. They are logged and show up in
//! [`ConnectionState`].

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::primitives::{Connection, Transport};

/// Delay between a failed or lost connection and the next attempt
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// No connection and none in progress
    Disconnected,
    /// A connect request is outstanding
    Connecting,
    /// The last connect request failed
    CouldNotConnect,
    /// Connected to the store
    Connected,
}

impl ConnectionStatus {
    pub fn severity(self) -> Severity {
        match self {
            ConnectionStatus::Connected => Severity::Ok,
            ConnectionStatus::Connecting => Severity::Warning,
            ConnectionStatus::CouldNotConnect | ConnectionStatus::Disconnected => Severity::Error,
        }
    }

    pub fn is_connected(self) -> bool {
        self == ConnectionStatus::Connected
    }
}

/// How a status should be presented
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Ok,
    Warning,
    Error,
}

/// Snapshot published on every transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub severity: Severity,
    pub address: Option<String>,
    /// Connect attempts made so far; never reset
    pub attempts: u64,
}

impl Default for ConnectionState {
    fn default() -> Self {
        let status = ConnectionStatus::Disconnected;
        Self {
            status,
            severity: status.severity(),
            address: None,
            attempts: 0,
        }
    }
}

/// Where and how to connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Store address; no connection is attempted without one
    pub address: Option<String>,
    pub auth_token: Option<String>,
    pub keepalive: Option<Duration>,
    /// Name announced to the store when connecting
    pub client_name: Option<String>,
    pub automatic_reconnect: bool,
    pub retry_delay: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            address: None,
            auth_token: None,
            keepalive: None,
            client_name: None,
            automatic_reconnect: true,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl ConnectionSettings {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Self::default()
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    pub fn with_automatic_reconnect(mut self, enabled: bool) -> Self {
        self.automatic_reconnect = enabled;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

/// Commands sent to the manager task
#[derive(Debug, Clone)]
enum ManagerCommand {
    Reconfigure(ConnectionSettings),
    Shutdown,
}

/// Handle to the connection manager task
///
/// Dropping the manager stops the task and closes the live connection, same
/// as [`ConnectionManager::shutdown`] without waiting for it.
pub struct ConnectionManager<T: Transport> {
    command_tx: mpsc::UnboundedSender<ManagerCommand>,
    state_rx: watch::Receiver<ConnectionState>,
    handle_rx: watch::Receiver<Option<Arc<T::Handle>>>,
    task: JoinHandle<()>,
}

impl<T: Transport> ConnectionManager<T> {
    /// Spawn the manager task on the current tokio runtime
    pub fn spawn(transport: T, settings: ConnectionSettings) -> Self {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState {
            address: settings.address.clone(),
            ..ConnectionState::default()
        });
        let (handle_tx, handle_rx) = watch::channel(None);

        let control = Control {
            settings,
            commands,
            state_tx,
            attempts: 0,
        };
        let task = tokio::spawn(manager_loop(transport, control, handle_tx));

        Self {
            command_tx,
            state_rx,
            handle_rx,
            task,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// The live connection, if any
    pub fn connection(&self) -> Option<Arc<T::Handle>> {
        self.handle_rx.borrow().clone()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<Option<Arc<T::Handle>>> {
        self.handle_rx.clone()
    }

    /// Replace the settings
    ///
    /// Identical settings are ignored. Anything else tears down the current
    /// connection (or pending attempt) and starts over, which is also how a
    /// manager without automatic reconnection is revived.
    pub fn reconfigure(&self, settings: ConnectionSettings) {
        if self
            .command_tx
            .send(ManagerCommand::Reconfigure(settings))
            .is_err()
        {
            debug!("Connection manager already stopped");
        }
    }

    /// Stop the task and wait until the connection is closed
    pub async fn shutdown(self) {
        let ConnectionManager {
            command_tx, task, ..
        } = self;
        let _ = command_tx.send(ManagerCommand::Shutdown);
        drop(command_tx);

        if let Err(e) = task.await {
            warn!(error = %e, "Connection manager task failed");
        }
    }
}

enum Step {
    Continue,
    Stop,
}

/// Task-side state that is not borrowed by an in-flight connect
struct Control {
    settings: ConnectionSettings,
    commands: mpsc::UnboundedReceiver<ManagerCommand>,
    state_tx: watch::Sender<ConnectionState>,
    attempts: u64,
}

impl Control {
    fn publish(&self, status: ConnectionStatus) {
        self.state_tx.send_replace(ConnectionState {
            status,
            severity: status.severity(),
            address: self.settings.address.clone(),
            attempts: self.attempts,
        });
    }

    /// Wait for new settings or shutdown
    async fn next_change(&mut self) -> Step {
        loop {
            match self.commands.recv().await {
                Some(ManagerCommand::Reconfigure(settings)) => {
                    if settings == self.settings {
                        continue;
                    }
                    info!(address = ?settings.address, "Connection settings changed");
                    self.settings = settings;
                    return Step::Continue;
                }
                Some(ManagerCommand::Shutdown) | None => return Step::Stop,
            }
        }
    }
}

async fn manager_loop<T: Transport>(
    transport: T,
    mut control: Control,
    handle_tx: watch::Sender<Option<Arc<T::Handle>>>,
) {
    loop {
        let step = match control.settings.address.clone() {
            Some(address) => run_attempt(&transport, &mut control, &handle_tx, address).await,
            None => {
                control.publish(ConnectionStatus::Disconnected);
                control.next_change().await
            }
        };
        if let Step::Stop = step {
            break;
        }
    }

    handle_tx.send_replace(None);
    control.publish(ConnectionStatus::Disconnected);
    debug!("Connection manager stopped");
}

/// One connect attempt, the connected phase and the wait before the next
async fn run_attempt<T: Transport>(
    transport: &T,
    control: &mut Control,
    handle_tx: &watch::Sender<Option<Arc<T::Handle>>>,
    address: String,
) -> Step {
    control.attempts += 1;
    control.publish(ConnectionStatus::Connecting);
    debug!(address = %address, attempt = control.attempts, "Connecting");

    let auth_token = control.settings.auth_token.clone();
    let keepalive = control.settings.keepalive;
    let client_name = control.settings.client_name.clone();

    let result = tokio::select! {
        result = transport.connect(
            &address,
            auth_token.as_deref(),
            keepalive,
            client_name.as_deref(),
        ) => result,
        step = control.next_change() => return step,
    };

    match result {
        Ok(handle) => {
            let handle = Arc::new(handle);
            handle_tx.send_replace(Some(handle.clone()));
            control.publish(ConnectionStatus::Connected);
            info!(address = %address, attempt = control.attempts, "Connected");

            let step = tokio::select! {
                _ = handle.closed() => None,
                step = control.next_change() => Some(step),
            };
            handle_tx.send_replace(None);

            if let Some(step) = step {
                handle.close();
                return step;
            }
            warn!(address = %address, "Connection closed by store");
            control.publish(ConnectionStatus::Disconnected);
        }
        Err(e) => {
            warn!(address = %address, attempt = control.attempts, error = %e, "Connection attempt failed");
            control.publish(ConnectionStatus::CouldNotConnect);
        }
    }

    if !control.settings.automatic_reconnect {
        debug!("Automatic reconnection disabled, waiting for new settings");
        return control.next_change().await;
    }

    let delay = control.settings.retry_delay;
    debug!(delay_ms = delay.as_millis() as u64, "Retrying after delay");
    tokio::select! {
        _ = tokio::time::sleep(delay) => Step::Continue,
        step = control.next_change() => step,
    }
}
