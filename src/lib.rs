//! # metaview - continuous metadata views over a telemetry transport
//!
//! metaview ingests metadata published over a topic-addressed pub/sub
//! transport, indexes it by path, and keeps long-lived declarative
//! subscriptions ("views") matched against the live index. As matches
//! appear and disappear, per-path forwarding starts and stops on its own.
//!
//! ## Core Concepts
//!
//! - **MetadataRecord**: one key/value assertion filed under a path
//! - **MetadataIndex**: latest record per path, queryable by expression
//! - **Expression**: target namespaces plus a predicate tree
//! - **View**: a registered expression and the set of paths it matches
//! - **Forwarder**: one live subscription on a path, fanned out to views
//! - **ViewManager**: subscribes namespaces, reconciles views, drives forwarders
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use metaview::{Expression, InMemoryTransport, Node, ViewManager, ViewManagerConfig};
//!
//! let transport = Arc::new(InMemoryTransport::new());
//! let manager = ViewManager::with_memory_index(ViewManagerConfig::default(), transport)?;
//!
//! let reg = manager.register_view(Expression::new(["ns1"], Node::entry("location", "floor2")))?;
//! while let Ok(msg) = reg.stream.recv() {
//!     println!("{}", msg.topic);
//! }
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod expression;
pub mod forwarder;
pub mod index;
pub mod inheritance;
pub mod logging;
pub mod manager;
pub mod pool;
pub mod record;
pub mod transport;
pub mod view;

// Re-export primary types at crate root for convenience
pub use config::{RetryPolicy, ViewManagerConfig};
pub use error::{ExpressionEvalError, TransportError, ValidationError, ViewError, ViewResult};
pub use expression::{Evaluate, Expression, ExpressionHash, Node};
pub use forwarder::Forwarder;
pub use index::{MemoryMetadataIndex, MetadataIndex};
pub use inheritance::{archive_timeseries, Archiver, Properties, StreamMessage, TieredMessages};
pub use manager::ViewManager;
pub use pool::{WorkerPool, WorkerPoolHandle};
pub use record::{extract_records, MetadataRecord};
pub use transport::{
    topic_matches, InMemoryTransport, Message, MetadataTuple, PayloadKind, PayloadObject, Subscription,
    SubscriptionId, Transport,
};
pub use view::{MatchSet, View, ViewId, ViewRegistration, ViewStream};
