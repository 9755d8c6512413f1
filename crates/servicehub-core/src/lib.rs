//! # ServiceHub Core
//!
//! The dead-letter queue engine behind ServiceHub: namespace credential
//! storage, a cached broker client per namespace, a background scanner that
//! keeps a local view of dead-lettered messages in sync with the broker, and
//! the replay/purge operations that move messages back to a live entity or
//! discard them without risking the at-most-one-loss guarantee operators
//! depend on.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use servicehub_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), EngineError> {
//!     let config = EngineConfig::new(vec![0u8; 32]);
//!     let db = SqliteHandle::open_in_memory()?;
//!     let namespaces = NamespaceRepository::new(db).await?;
//!     let _ = namespaces;
//!     let _ = config;
//!     Ok(())
//! }
//! ```

#![deny(warnings)]
#![deny(missing_docs)]
#![deny(unsafe_code)]

/// Broker protocol seam: wire DTOs, failure classification, the transport
/// trait objects, the per-namespace client wrapper and its cache.
pub mod broker;

/// Engine-wide configuration, with the defaults from the external-interfaces
/// contract.
pub mod config;

/// SQLite connection handling shared by every persistent store.
pub mod db;

/// The dead-letter message store, scanner, and their data model.
pub mod dlq;

/// The typed error taxonomy every fallible operation in this crate returns.
pub mod error;

/// Namespace records and their persistent store.
pub mod namespace;

/// Resilience patterns (retry with backoff).
pub mod resilience;

/// Auto-replay rule evaluation and execution, single and batched.
pub mod rules;

/// Security utilities: at-rest credential protection.
pub mod security;

/// Graceful shutdown utilities shared by every background task.
pub mod shutdown;

/// An in-memory broker double used by this crate's own test suite.
#[cfg(test)]
pub mod testing;

/// Re-export async_trait for implementing `BrokerTransport`/`AdminClient`.
pub use async_trait;
/// Re-export chrono for timestamp handling.
pub use chrono;
/// Re-export dashmap, used by `BrokerClientCache`.
pub use dashmap;
/// Re-export parking_lot for synchronization primitives.
pub use parking_lot;
/// Re-export rand for jittered backoff.
pub use rand;
/// Re-export serde for serialization.
pub use serde;
/// Re-export serde_json for JSON handling.
pub use serde_json;
/// Re-export tokio for the async runtime.
pub use tokio;
/// Re-export tracing for observability.
pub use tracing;
/// Re-export tracing_subscriber for log configuration.
pub use tracing_subscriber;
/// Re-export uuid for identifiers.
pub use uuid;

/// Commonly used imports for applications embedding the ServiceHub engine.
pub mod prelude {
    pub use crate::broker::{
        AdminClient, BrokerClientCache, BrokerClientWrapper, BrokerTransport, FailureCategory,
        Message, OutboundMessage, PeekRequest, ReplayOutcome, SendRequest, TransportFactory,
    };
    pub use crate::config::EngineConfig;
    pub use crate::db::SqliteHandle;
    pub use crate::dlq::{AutoReplayRule, DlqMessage, DlqScanner, DlqStore, ReplayHistory};
    pub use crate::error::EngineError;
    pub use crate::namespace::{AuthType, Namespace, NamespaceRepository};
    pub use crate::resilience::{RetryConfig, RetryExecutor};
    pub use crate::rules::{AutoReplayExecutor, BatchReplayCoordinator, RuleEngine};
    pub use crate::security::ConnectionStringProtector;
    pub use crate::shutdown::{
        GracefulShutdown, GracefulShutdownExt, ShutdownAwareTaskSpawner, ShutdownSignal,
        ShutdownToken,
    };
}
