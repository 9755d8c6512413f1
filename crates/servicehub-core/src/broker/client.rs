//! `BrokerClientWrapper` — the per-namespace protocol façade (§4.4).
//!
//! This is the critical path of the whole engine: peek, send, the
//! safe single-message replay algorithm, its O(k) batch cousin, and purge
//! all live here, on top of a cached admin client that exists to avoid the
//! socket-exhaustion anti-pattern called out in §9.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;

use crate::config::{PurgeConfig, ReplayConfig};
use crate::error::EngineError;

use super::failure::classify;
use super::message::{entity_path, Message, OutboundMessage, PeekRequest, PropertyValue, SendRequest};
use super::transport::{
    AdminClient, BrokerTransport, LockedMessage, QueueMetadata, SubscriptionMetadata, TopicMetadata,
};

/// The outcome of replaying a single sequence number as part of a batch
/// (§4.4.5).
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayOutcome {
    /// The message was sent to the live entity and removed from the DLQ.
    Success,
    /// The send or complete failed; the original remains in the DLQ.
    Failed(String),
    /// The sequence number was not found within the scan budget.
    NotFound,
}

/// Per-namespace façade over the broker. Owned exclusively by
/// `BrokerClientCache`; callers borrow it by value through method calls
/// only (§3 Ownership).
pub struct BrokerClientWrapper {
    transport: Arc<dyn BrokerTransport>,
    admin_client: tokio::sync::Mutex<Option<Arc<dyn AdminClient>>>,
    disposed: AtomicBool,
    fingerprint: u64,
    replay_single: ReplayConfig,
    replay_batch: ReplayConfig,
    purge: PurgeConfig,
}

impl BrokerClientWrapper {
    /// Build a wrapper over `transport`. `fingerprint` is the credential
    /// fingerprint `BrokerClientCache` uses to decide whether a cached
    /// wrapper is still valid for a given credential (§4.3).
    pub fn new(
        transport: Arc<dyn BrokerTransport>,
        fingerprint: u64,
        replay_single: ReplayConfig,
        replay_batch: ReplayConfig,
        purge: PurgeConfig,
    ) -> Self {
        Self {
            transport,
            admin_client: tokio::sync::Mutex::new(None),
            disposed: AtomicBool::new(false),
            fingerprint,
            replay_single,
            replay_batch,
            purge,
        }
    }

    /// The fingerprint this wrapper was built with.
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    fn ensure_live(&self) -> Result<(), EngineError> {
        if self.disposed.load(Ordering::Acquire) {
            Err(EngineError::ServiceUnavailable(
                "broker client wrapper has been disposed".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    /// §4.4.1 — create the admin client at most once, behind a mutex held
    /// only across the first call.
    async fn admin_client(&self) -> Result<Arc<dyn AdminClient>, EngineError> {
        self.ensure_live()?;
        let mut guard = self.admin_client.lock().await;
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }
        let created: Arc<dyn AdminClient> = Arc::from(self.transport.create_admin_client().await?);
        *guard = Some(created.clone());
        Ok(created)
    }

    /// §4.4.2 — non-destructive peek.
    pub async fn peek_messages(&self, request: PeekRequest) -> Result<Vec<Message>, EngineError> {
        self.ensure_live()?;
        let path = request.entity_path();
        self.transport
            .peek(&path, request.clamped_max_messages(), request.from_sequence)
            .await
    }

    /// §4.4.3 — send.
    pub async fn send_message(&self, entity: &str, request: SendRequest) -> Result<(), EngineError> {
        self.ensure_live()?;
        self.transport.send(entity, OutboundMessage::from(request)).await
    }

    /// §4.4.4 — the safe single-message replay algorithm. Moves the message
    /// with `sequence` from the DLQ of `entity[/subscription]` back to the
    /// live entity without loss: the original is removed from the DLQ only
    /// after the clone is acknowledged by the broker.
    pub async fn replay_message(
        &self,
        entity: &str,
        subscription: Option<&str>,
        sequence: i64,
    ) -> Result<(), EngineError> {
        self.replay_message_to(entity, subscription, sequence, None).await
    }

    /// Same algorithm as [`Self::replay_message`], but lands the clone on
    /// `target_entity` instead of the source entity when given — the
    /// alternate-entity redirect a replay rule's action can request.
    pub async fn replay_message_to(
        &self,
        entity: &str,
        subscription: Option<&str>,
        sequence: i64,
        target_entity: Option<&str>,
    ) -> Result<(), EngineError> {
        self.ensure_live()?;
        let dlq_path = entity_path(entity, subscription, true);
        // A subscription has no inbox of its own; a replayed clone always
        // lands on its topic (or queue), never on `entity/Subscriptions/sub`.
        let live_path = entity_path(target_entity.unwrap_or(entity), None, false);

        let (target, abandon_list) = self
            .scan_for_sequence(&dlq_path, &[sequence].into_iter().collect(), self.replay_single)
            .await?;

        let outcome = match target.into_iter().next() {
            None => Err(EngineError::NotFound(format!(
                "message with sequence {sequence} not found in dead-letter queue for '{dlq_path}'"
            ))),
            Some((_, locked)) => self.send_and_complete(&dlq_path, &live_path, locked).await,
        };

        self.abandon_all(&dlq_path, abandon_list).await;
        outcome
    }

    /// §4.4.5 — batched replay. A single receiver/sender pair services the
    /// whole pending set, making this O(k) instead of the naive O(k²).
    pub async fn replay_messages(
        &self,
        entity: &str,
        subscription: Option<&str>,
        sequences: &[i64],
    ) -> Result<HashMap<i64, ReplayOutcome>, EngineError> {
        self.replay_messages_to(entity, subscription, sequences, None).await
    }

    /// Same algorithm as [`Self::replay_messages`], but lands every clone on
    /// `target_entity` instead of the source entity when given.
    pub async fn replay_messages_to(
        &self,
        entity: &str,
        subscription: Option<&str>,
        sequences: &[i64],
        target_entity: Option<&str>,
    ) -> Result<HashMap<i64, ReplayOutcome>, EngineError> {
        self.ensure_live()?;
        let dlq_path = entity_path(entity, subscription, true);
        // A subscription has no inbox of its own; a replayed clone always
        // lands on its topic (or queue), never on `entity/Subscriptions/sub`.
        let live_path = entity_path(target_entity.unwrap_or(entity), None, false);

        let pending_set: HashSet<i64> = sequences.iter().copied().collect();
        let (found, abandon_list) =
            self.scan_for_sequence(&dlq_path, &pending_set, self.replay_batch).await?;

        let mut results = HashMap::with_capacity(sequences.len());
        for seq in &pending_set {
            if !found.contains_key(seq) {
                results.insert(*seq, ReplayOutcome::NotFound);
            }
        }

        for (seq, locked) in found {
            let outcome = match self.send_and_complete(&dlq_path, &live_path, locked).await {
                Ok(()) => ReplayOutcome::Success,
                Err(e) => ReplayOutcome::Failed(e.to_string()),
            };
            results.insert(seq, outcome);
        }

        self.abandon_all(&dlq_path, abandon_list).await;
        Ok(results)
    }

    /// §4.4.6 — purge: the same scan-for-sequence algorithm as replay, but
    /// the target is completed (deleted) rather than resent.
    pub async fn purge_message(
        &self,
        entity: &str,
        subscription: Option<&str>,
        sequence: i64,
        from_dead_letter: bool,
    ) -> Result<(), EngineError> {
        self.ensure_live()?;
        let path = entity_path(entity, subscription, from_dead_letter);
        let purge_as_replay = ReplayConfig {
            max_attempts: self.purge.max_attempts,
            batch_size: self.purge.batch_size,
            wait: self.replay_single.wait,
        };

        let (target, abandon_list) = self
            .scan_for_sequence(&path, &[sequence].into_iter().collect(), purge_as_replay)
            .await?;

        let outcome = match target.into_iter().next() {
            None => Err(EngineError::NotFound(format!(
                "message with sequence {sequence} not found in '{path}'"
            ))),
            Some((_, locked)) => self
                .transport
                .complete(&path, &locked.lock)
                .await
                .map_err(|e| e),
        };

        self.abandon_all(&path, abandon_list).await;
        outcome
    }

    /// The shared scan-for-sequence loop behind replay and purge (§4.4.4
    /// step 2 / §4.4.5 step 3): receive up to `config.batch_size` messages
    /// per attempt, routing each into either the target set (its sequence
    /// is in `wanted`) or the cleanup list, until every wanted sequence is
    /// found or a batch comes back empty.
    async fn scan_for_sequence(
        &self,
        path: &str,
        wanted: &HashSet<i64>,
        config: ReplayConfig,
    ) -> Result<(HashMap<i64, LockedMessage>, Vec<LockedMessage>), EngineError> {
        let mut remaining: HashSet<i64> = wanted.clone();
        let mut found = HashMap::new();
        let mut abandon_list = Vec::new();

        for _ in 0..config.max_attempts {
            if remaining.is_empty() {
                break;
            }
            let batch = self
                .transport
                .receive_locked(path, config.batch_size, config.wait)
                .await?;
            if batch.is_empty() {
                break;
            }
            for locked in batch {
                let seq = locked.message.sequence_number;
                if remaining.remove(&seq) {
                    found.insert(seq, locked);
                } else {
                    abandon_list.push(locked);
                }
            }
        }

        Ok((found, abandon_list))
    }

    /// Clone-send-complete/abandon dance shared by single and batch replay
    /// (§4.4.4 steps 4-6).
    async fn send_and_complete(
        &self,
        dlq_path: &str,
        live_path: &str,
        locked: LockedMessage,
    ) -> Result<(), EngineError> {
        let outbound = clone_for_replay(&locked.message);
        match self.transport.send(live_path, outbound).await {
            Ok(()) => self.transport.complete(dlq_path, &locked.lock).await,
            Err(send_err) => {
                if let Err(abandon_err) = self.transport.abandon(dlq_path, &locked.lock).await {
                    tracing::warn!(
                        error = %abandon_err,
                        sequence = locked.lock.sequence_number,
                        "failed to abandon original dlq message after failed replay send"
                    );
                }
                Err(send_err)
            }
        }
    }

    /// Best-effort cleanup of every message that wasn't the replay/purge
    /// target. Errors are logged, never propagated (§4.4.4 step 7).
    async fn abandon_all(&self, path: &str, list: Vec<LockedMessage>) {
        for locked in list {
            if let Err(e) = self.transport.abandon(path, &locked.lock).await {
                tracing::warn!(
                    error = %e,
                    sequence = locked.lock.sequence_number,
                    "failed to abandon message during cleanup"
                );
            }
        }
    }

    /// §4.4.7 — queues.
    pub async fn get_queues(&self) -> Result<Vec<QueueMetadata>, EngineError> {
        self.admin_client().await?.get_queues().await
    }

    /// §4.4.7 — a single queue.
    pub async fn get_queue(&self, name: &str) -> Result<QueueMetadata, EngineError> {
        self.admin_client().await?.get_queue(name).await
    }

    /// §4.4.7 — topics.
    pub async fn get_topics(&self) -> Result<Vec<TopicMetadata>, EngineError> {
        self.admin_client().await?.get_topics().await
    }

    /// §4.4.7 — a single topic.
    pub async fn get_topic(&self, name: &str) -> Result<TopicMetadata, EngineError> {
        self.admin_client().await?.get_topic(name).await
    }

    /// §4.4.7 — subscriptions under a topic.
    pub async fn get_subscriptions(
        &self,
        topic: &str,
    ) -> Result<Vec<SubscriptionMetadata>, EngineError> {
        self.admin_client().await?.get_subscriptions(topic).await
    }

    /// §4.4.7 — a single subscription.
    pub async fn get_subscription(
        &self,
        topic: &str,
        name: &str,
    ) -> Result<SubscriptionMetadata, EngineError> {
        self.admin_client().await?.get_subscription(topic, name).await
    }

    /// §4.4.8 — cheap existence check; not a deep probe.
    pub fn test_connection(&self) -> Result<(), EngineError> {
        self.ensure_live()?;
        if self.transport.fully_qualified_namespace().is_empty() {
            return Err(EngineError::ServiceUnavailable(
                "namespace is not resolvable".to_string(),
            ));
        }
        Ok(())
    }

    /// §4.4.9 — idempotent disposal. Safe to call concurrently with an
    /// in-flight operation; that operation may observe `ServiceUnavailable`
    /// and return cleanly.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }

    /// Whether `dispose` has been called.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

/// Build the replay clone per §4.4.4 step 4: same body and user-visible
/// headers, application properties minus the dead-letter markers, plus the
/// replay-provenance stamps.
fn clone_for_replay(message: &Message) -> OutboundMessage {
    let mut application_properties: HashMap<String, PropertyValue> = message
        .application_properties
        .iter()
        .filter(|(k, _)| k.as_str() != "DeadLetterReason" && k.as_str() != "DeadLetterErrorDescription")
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    application_properties.insert("Replayed".to_string(), PropertyValue::Bool(true));
    application_properties.insert(
        "ReplayedAt".to_string(),
        PropertyValue::String(Utc::now().to_rfc3339()),
    );
    application_properties.insert(
        "OriginalSequenceNumber".to_string(),
        PropertyValue::Int64(message.sequence_number),
    );
    application_properties.insert(
        "OriginalDeadLetterReason".to_string(),
        PropertyValue::String(
            message
                .dead_letter_reason
                .clone()
                .unwrap_or_else(|| "Unknown".to_string()),
        ),
    );

    OutboundMessage {
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
        application_properties,
    }
}

/// Derive a `failure_category` from a message's dead-letter reason, used by
/// `DlqStore::upsert_observed` and `DlqScanner` (§4.5).
pub fn failure_category(dead_letter_reason: Option<&str>) -> super::failure::FailureCategory {
    classify(dead_letter_reason.unwrap_or(""))
}
