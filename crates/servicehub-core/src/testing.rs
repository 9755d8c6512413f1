//! An in-memory `BrokerTransport`/`AdminClient` double.
//!
//! Exists so `BrokerClientWrapper`'s replay/peek/purge algorithms — the part
//! of this crate that actually matters — can be exercised without a live
//! broker connection. Only available to tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::broker::{
    AdminClient, BrokerTransport, LockedMessage, Message, MessageLock, MessageState,
    OutboundMessage, QueueMetadata, SubscriptionMetadata, TopicMetadata,
};
use crate::error::EngineError;

fn default_queue(name: &str, dead_letter_message_count: u64) -> QueueMetadata {
    QueueMetadata {
        name: name.to_string(),
        status: "Active".to_string(),
        max_size_mb: 1024,
        default_ttl: None,
        lock_duration: Duration::from_secs(30),
        max_delivery_count: 10,
        requires_session: false,
        forward_to: None,
        active_message_count: 0,
        dead_letter_message_count,
        scheduled_message_count: 0,
        transfer_message_count: 0,
    }
}

fn default_topic(name: &str) -> TopicMetadata {
    TopicMetadata {
        name: name.to_string(),
        status: "Active".to_string(),
        max_size_mb: 1024,
        default_ttl: None,
        supports_partitioning: false,
        active_message_count: 0,
        scheduled_message_count: 0,
    }
}

fn default_subscription(topic: &str, name: &str, dead_letter_message_count: u64) -> SubscriptionMetadata {
    SubscriptionMetadata {
        topic_name: topic.to_string(),
        name: name.to_string(),
        status: "Active".to_string(),
        lock_duration: Duration::from_secs(30),
        max_delivery_count: 10,
        requires_session: false,
        forward_to: None,
        active_message_count: 0,
        dead_letter_message_count,
        transfer_message_count: 0,
    }
}

const DLQ_SUFFIX: &str = "/$DeadLetterQueue";

fn split_path(path: &str) -> (&str, bool) {
    match path.strip_suffix(DLQ_SUFFIX) {
        Some(base) => (base, true),
        None => (path, false),
    }
}

#[derive(Default)]
struct Entity {
    live: Vec<Message>,
    dead_letter: Vec<Message>,
    last_sent: Option<OutboundMessage>,
}

/// A locked-out message, pulled by `receive_locked` and not yet resolved by
/// `complete`/`abandon`.
struct InFlight {
    base: String,
    from_dead_letter: bool,
    message: Message,
}

/// A single-process stand-in for a namespace's queues/topics/subscriptions.
/// Entity paths are plain strings (e.g. `"q1"`, `"t1/Subscriptions/s1"`,
/// optionally suffixed with `/$DeadLetterQueue`), matching what
/// [`crate::broker::entity_path`] produces.
pub struct InMemoryBroker {
    fqns: String,
    entities: Mutex<HashMap<String, Entity>>,
    in_flight: Mutex<HashMap<String, InFlight>>,
    queues: Arc<Mutex<HashMap<String, QueueMetadata>>>,
    topics: Arc<Mutex<HashMap<String, TopicMetadata>>>,
    subscriptions: Arc<Mutex<HashMap<(String, String), SubscriptionMetadata>>>,
    next_lock_token: AtomicU64,
    next_sequence: AtomicI64,
    admin_client_creations: AtomicU64,
}

impl InMemoryBroker {
    pub fn new(fqns: impl Into<String>) -> Self {
        Self {
            fqns: fqns.into(),
            entities: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            queues: Arc::new(Mutex::new(HashMap::new())),
            topics: Arc::new(Mutex::new(HashMap::new())),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            next_lock_token: AtomicU64::new(1),
            next_sequence: AtomicI64::new(1_000_000),
            admin_client_creations: AtomicU64::new(0),
        }
    }

    /// Register (or update) a queue's admin metadata, so `get_queues`
    /// reports it with the given dead-letter count.
    pub fn register_queue(&self, name: &str, dead_letter_message_count: u64) {
        self.queues
            .lock()
            .insert(name.to_string(), default_queue(name, dead_letter_message_count));
    }

    /// Register a topic (with no subscriptions) so `get_topics` reports it.
    pub fn register_topic(&self, name: &str) {
        self.topics.lock().insert(name.to_string(), default_topic(name));
    }

    /// Register (or update) a subscription's admin metadata under `topic`.
    pub fn register_subscription(&self, topic: &str, name: &str, dead_letter_message_count: u64) {
        self.topics.lock().entry(topic.to_string()).or_insert_with(|| default_topic(topic));
        self.subscriptions.lock().insert(
            (topic.to_string(), name.to_string()),
            default_subscription(topic, name, dead_letter_message_count),
        );
    }

    /// Drop every dead-lettered message at `path`, as if an operator purged
    /// it out of band.
    pub fn clear_dead_letters(&self, path: &str) {
        let (base, _) = split_path(path);
        if let Some(entity) = self.entities.lock().get_mut(base) {
            entity.dead_letter.clear();
        }
    }

    /// Seed a dead-lettered message directly into `path`'s DLQ.
    pub fn seed_dead_letter(
        &self,
        path: &str,
        sequence_number: i64,
        body: Vec<u8>,
        dead_letter_reason: Option<String>,
    ) {
        let message = Message {
            sequence_number,
            message_id: uuid::Uuid::new_v4().to_string(),
            body,
            content_type: None,
            correlation_id: None,
            session_id: None,
            partition_key: None,
            subject: None,
            reply_to: None,
            reply_to_session_id: None,
            to: None,
            time_to_live: None,
            scheduled_enqueue_time: None,
            application_properties: HashMap::new(),
            delivery_count: 1,
            enqueued_time: chrono::Utc::now(),
            dead_letter_reason,
            dead_letter_error_description: None,
            dead_letter_source: None,
            state: MessageState::DeadLettered,
        };
        self.entities
            .lock()
            .entry(path.to_string())
            .or_default()
            .dead_letter
            .push(message);
    }

    pub fn dead_letter_count(&self, path: &str) -> usize {
        let (base, _) = split_path(path);
        self.entities
            .lock()
            .get(base)
            .map(|e| e.dead_letter.len())
            .unwrap_or(0)
    }

    pub fn live_count(&self, path: &str) -> usize {
        let (base, _) = split_path(path);
        self.entities.lock().get(base).map(|e| e.live.len()).unwrap_or(0)
    }

    pub fn last_sent(&self, path: &str) -> Option<OutboundMessage> {
        let (base, _) = split_path(path);
        self.entities.lock().get(base).and_then(|e| e.last_sent.clone())
    }

    pub fn admin_client_creations(&self) -> u64 {
        self.admin_client_creations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerTransport for InMemoryBroker {
    async fn create_admin_client(&self) -> Result<Box<dyn AdminClient>, EngineError> {
        self.admin_client_creations.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(InMemoryAdminClient {
            queues: self.queues.clone(),
            topics: self.topics.clone(),
            subscriptions: self.subscriptions.clone(),
        }))
    }

    async fn receive_locked(
        &self,
        entity_path: &str,
        max_messages: u32,
        _wait: Duration,
    ) -> Result<Vec<LockedMessage>, EngineError> {
        let (base, from_dead_letter) = split_path(entity_path);
        let mut entities = self.entities.lock();
        let entity = entities.entry(base.to_string()).or_default();
        let source = if from_dead_letter {
            &mut entity.dead_letter
        } else {
            &mut entity.live
        };
        let take = (max_messages as usize).min(source.len());
        let drained: Vec<Message> = source.drain(0..take).collect();
        drop(entities);

        let mut in_flight = self.in_flight.lock();
        Ok(drained
            .into_iter()
            .map(|message| {
                let token = self.next_lock_token.fetch_add(1, Ordering::SeqCst);
                let token = format!("lock-{token}");
                let lock = MessageLock {
                    sequence_number: message.sequence_number,
                    token: token.clone(),
                };
                in_flight.insert(
                    token,
                    InFlight {
                        base: base.to_string(),
                        from_dead_letter,
                        message: message.clone(),
                    },
                );
                LockedMessage { message, lock }
            })
            .collect())
    }

    async fn peek(
        &self,
        entity_path: &str,
        max_messages: u32,
        from_sequence: Option<i64>,
    ) -> Result<Vec<Message>, EngineError> {
        let (base, from_dead_letter) = split_path(entity_path);
        let entities = self.entities.lock();
        let Some(entity) = entities.get(base) else {
            return Ok(Vec::new());
        };
        let source = if from_dead_letter { &entity.dead_letter } else { &entity.live };
        let floor = from_sequence.unwrap_or(i64::MIN);
        Ok(source
            .iter()
            .filter(|m| m.sequence_number > floor)
            .take(max_messages as usize)
            .cloned()
            .collect())
    }

    async fn send(&self, entity_path: &str, message: OutboundMessage) -> Result<(), EngineError> {
        let (base, _) = split_path(entity_path);
        let sequence_number = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let stored = Message {
            sequence_number,
            message_id: uuid::Uuid::new_v4().to_string(),
            body: message.body.clone(),
            content_type: message.content_type.clone(),
            correlation_id: message.correlation_id.clone(),
            session_id: message.session_id.clone(),
            partition_key: message.partition_key.clone(),
            subject: message.subject.clone(),
            reply_to: message.reply_to.clone(),
            reply_to_session_id: message.reply_to_session_id.clone(),
            to: message.to.clone(),
            time_to_live: message.time_to_live,
            scheduled_enqueue_time: message.scheduled_enqueue_time,
            application_properties: message.application_properties.clone(),
            delivery_count: 0,
            enqueued_time: chrono::Utc::now(),
            dead_letter_reason: None,
            dead_letter_error_description: None,
            dead_letter_source: None,
            state: MessageState::Active,
        };
        let mut entities = self.entities.lock();
        let entity = entities.entry(base.to_string()).or_default();
        entity.live.push(stored);
        entity.last_sent = Some(message);
        Ok(())
    }

    async fn complete(&self, _entity_path: &str, lock: &MessageLock) -> Result<(), EngineError> {
        self.in_flight.lock().remove(&lock.token);
        Ok(())
    }

    async fn abandon(&self, _entity_path: &str, lock: &MessageLock) -> Result<(), EngineError> {
        let Some(in_flight) = self.in_flight.lock().remove(&lock.token) else {
            return Ok(());
        };
        let mut entities = self.entities.lock();
        let entity = entities.entry(in_flight.base).or_default();
        if in_flight.from_dead_letter {
            entity.dead_letter.push(in_flight.message);
        } else {
            entity.live.push(in_flight.message);
        }
        Ok(())
    }

    fn fully_qualified_namespace(&self) -> &str {
        &self.fqns
    }
}

struct InMemoryAdminClient {
    queues: Arc<Mutex<HashMap<String, QueueMetadata>>>,
    topics: Arc<Mutex<HashMap<String, TopicMetadata>>>,
    subscriptions: Arc<Mutex<HashMap<(String, String), SubscriptionMetadata>>>,
}

#[async_trait]
impl AdminClient for InMemoryAdminClient {
    async fn get_queues(&self) -> Result<Vec<QueueMetadata>, EngineError> {
        Ok(self.queues.lock().values().cloned().collect())
    }

    async fn get_queue(&self, name: &str) -> Result<QueueMetadata, EngineError> {
        self.queues
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::not_found("queue", name))
    }

    async fn get_topics(&self) -> Result<Vec<TopicMetadata>, EngineError> {
        Ok(self.topics.lock().values().cloned().collect())
    }

    async fn get_topic(&self, name: &str) -> Result<TopicMetadata, EngineError> {
        self.topics
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::not_found("topic", name))
    }

    async fn get_subscriptions(&self, topic: &str) -> Result<Vec<SubscriptionMetadata>, EngineError> {
        Ok(self
            .subscriptions
            .lock()
            .iter()
            .filter(|((t, _), _)| t == topic)
            .map(|(_, meta)| meta.clone())
            .collect())
    }

    async fn get_subscription(
        &self,
        topic: &str,
        name: &str,
    ) -> Result<SubscriptionMetadata, EngineError> {
        self.subscriptions
            .lock()
            .get(&(topic.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| EngineError::not_found("subscription", name))
    }
}
