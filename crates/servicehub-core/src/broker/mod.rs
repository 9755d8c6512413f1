//! The broker protocol seam: wire DTOs, failure classification, the
//! transport trait objects, and the per-namespace client wrapper built on
//! top of them (§4.4, §4.5).

mod cache;
mod client;
mod failure;
mod message;
mod transport;

pub use cache::{BrokerClientCache, TransportFactory};
pub use client::{failure_category, BrokerClientWrapper, ReplayOutcome};
pub use failure::{classify, FailureCategory};
pub use message::{
    entity_path, EntityType, Message, MessageState, OutboundMessage, PeekRequest, PropertyValue,
    SendRequest,
};
pub use transport::{
    AdminClient, BrokerTransport, LockedMessage, MessageLock, QueueMetadata, SubscriptionMetadata,
    TopicMetadata,
};
