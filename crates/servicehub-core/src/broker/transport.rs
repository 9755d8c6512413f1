//! The seam between `BrokerClientWrapper` and the actual broker wire
//! protocol.
//!
//! Everything the wrapper needs from the broker SDK is expressed as a
//! trait so the replay/peek/purge algorithms in [`crate::broker::client`]
//! can be exercised against an in-memory double (see
//! `crate::testing::InMemoryBroker`) without a live broker.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::EngineError;

use super::message::{Message, OutboundMessage};

/// An opaque handle to a peek-locked message, returned alongside its
/// contents from [`BrokerTransport::receive_locked`]. Holding one keeps the
/// broker-side lease alive until `complete` or `abandon` is called.
#[derive(Debug, Clone)]
pub struct MessageLock {
    /// The sequence number of the locked message — used to match it against
    /// the caller's target set.
    pub sequence_number: i64,
    /// An opaque token the transport uses to identify the specific delivery
    /// to complete/abandon (brokers commonly call this a "lock token").
    pub token: String,
}

/// A message received in peek-lock mode, paired with the lock needed to
/// release it.
#[derive(Debug, Clone)]
pub struct LockedMessage {
    pub message: Message,
    pub lock: MessageLock,
}

/// Static + runtime metadata for a queue.
#[derive(Debug, Clone)]
pub struct QueueMetadata {
    pub name: String,
    pub status: String,
    pub max_size_mb: u64,
    pub default_ttl: Option<Duration>,
    pub lock_duration: Duration,
    pub max_delivery_count: u32,
    pub requires_session: bool,
    pub forward_to: Option<String>,
    pub active_message_count: u64,
    pub dead_letter_message_count: u64,
    pub scheduled_message_count: u64,
    pub transfer_message_count: u64,
}

/// Static + runtime metadata for a topic.
#[derive(Debug, Clone)]
pub struct TopicMetadata {
    pub name: String,
    pub status: String,
    pub max_size_mb: u64,
    pub default_ttl: Option<Duration>,
    pub supports_partitioning: bool,
    pub active_message_count: u64,
    pub scheduled_message_count: u64,
}

/// Static + runtime metadata for a subscription under a topic.
#[derive(Debug, Clone)]
pub struct SubscriptionMetadata {
    pub topic_name: String,
    pub name: String,
    pub status: String,
    pub lock_duration: Duration,
    pub max_delivery_count: u32,
    pub requires_session: bool,
    pub forward_to: Option<String>,
    pub active_message_count: u64,
    pub dead_letter_message_count: u64,
    pub transfer_message_count: u64,
}

/// The cached, lazily-created metadata client (§4.4.1). Creating one of
/// these per request caused the socket-exhaustion regression the spec calls
/// out in §9 — the wrapper must create at most one over its lifetime.
#[async_trait]
pub trait AdminClient: Send + Sync {
    async fn get_queues(&self) -> Result<Vec<QueueMetadata>, EngineError>;
    async fn get_queue(&self, name: &str) -> Result<QueueMetadata, EngineError>;
    async fn get_topics(&self) -> Result<Vec<TopicMetadata>, EngineError>;
    async fn get_topic(&self, name: &str) -> Result<TopicMetadata, EngineError>;
    async fn get_subscriptions(&self, topic: &str) -> Result<Vec<SubscriptionMetadata>, EngineError>;
    async fn get_subscription(
        &self,
        topic: &str,
        name: &str,
    ) -> Result<SubscriptionMetadata, EngineError>;
}

/// Everything `BrokerClientWrapper` needs from the wire protocol.
///
/// One implementor is constructed per namespace (by
/// `BrokerClientCache::get_or_create`) from the namespace's decrypted
/// credential.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Create the admin client. Called at most once per wrapper lifetime —
    /// the wrapper caches the result behind a mutex.
    async fn create_admin_client(&self) -> Result<Box<dyn AdminClient>, EngineError>;

    /// Receive up to `max_messages` in peek-lock mode from `entity_path`,
    /// waiting up to `wait` for the first message. An empty result means no
    /// messages were available within `wait`, not an error.
    async fn receive_locked(
        &self,
        entity_path: &str,
        max_messages: u32,
        wait: Duration,
    ) -> Result<Vec<LockedMessage>, EngineError>;

    /// Peek (non-destructively) up to `max_messages` starting from
    /// `from_sequence` (exclusive) if given.
    async fn peek(
        &self,
        entity_path: &str,
        max_messages: u32,
        from_sequence: Option<i64>,
    ) -> Result<Vec<Message>, EngineError>;

    /// Send a message to `entity_path` (not a DLQ path).
    async fn send(&self, entity_path: &str, message: OutboundMessage) -> Result<(), EngineError>;

    /// Acknowledge and remove a locked message.
    async fn complete(&self, entity_path: &str, lock: &MessageLock) -> Result<(), EngineError>;

    /// Release a lock, making the message visible again (increments its
    /// delivery count).
    async fn abandon(&self, entity_path: &str, lock: &MessageLock) -> Result<(), EngineError>;

    /// The resolvable fully-qualified namespace string, used by the health
    /// probe (§4.4.8).
    fn fully_qualified_namespace(&self) -> &str;
}
