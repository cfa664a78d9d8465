//! kvsync Core Library
//!
//! This crate turns the push notifications of a hierarchical key-value
//! publish/subscribe store into locally held state that consumers can read
//! at any time.
//!
//! # Architecture
//!
//! - **Connection manager**: keeps one connection alive, reconnecting after a
//!   fixed delay, and publishes its state through `tokio::sync::watch`
//! - **Watches**: one task per watch folds subscription deliveries into a
//!   snapshot (pattern map, key tree, single value, children list)
//! - **Local cache**: read-through / write-through cache with optional expiry
//!
//! The wire protocol is not part of this crate. Anything implementing
//! [`Transport`] and [`Connection`] can be plugged in; [`MemoryTransport`]
//! is an in-process store used by tests and the CLI simulator.
//!
//! # Quick Start
//!
//! ```text
//! let scope = ClientScope::from_config(transport, &config);
//!
//! // Everything under sensors/, kept up to date
//! let pattern = scope.parse_pattern("sensors/#")?;
//! let sensors = scope.watch_pattern(pattern, SubscribeOptions::default());
//! let mut snapshots = sensors.subscribe();
//! snapshots.changed().await?;
//! println!("{} sensors", snapshots.borrow().len());
//! ```
//!
//! # Modules
//!
//! - `scope`: Connection scope (main entry point)
//! - `connection`: Connection lifecycle manager
//! - `watch`: Watch driver and the `Reducer` trait
//! - `pattern`, `tree`, `value`: Reducers
//! - `cache`: Local cache
//! - `primitives`: Transport and connection traits
//! - `memory`: In-process store
//! - `key`, `event`: Keys, patterns and subscription payloads
//! - `config`: Client configuration

pub mod cache;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod key;
pub mod memory;
pub mod pattern;
pub mod primitives;
pub mod scope;
pub mod tree;
pub mod value;
pub mod watch;

pub use cache::{CachePolicy, CacheSubscription, LocalCache, MissPolicy};
pub use config::Config;
pub use connection::{
    ConnectionManager, ConnectionSettings, ConnectionState, ConnectionStatus, Severity,
};
pub use error::{ClientError, ClientResult};
pub use event::{KeyValueEvent, SubscribeOptions, TransactionId, Value};
pub use key::{Key, Pattern, PatternSegment, Syntax};
pub use memory::{MemoryConnection, MemoryStore, MemoryTransport};
pub use pattern::{PatternState, PatternWatch};
pub use primitives::{Connection, Subscription, Transport, Unsubscribe};
pub use scope::ClientScope;
pub use tree::{KeyTree, TreeAggregator, TreeNode, TreeWatch};
pub use value::{ChildrenState, ChildrenWatch, ValueState, ValueWatch};
pub use watch::{Reducer, Watch};
