//! The dead-letter tracking data model (§3): tracked messages, their replay
//! history, and the auto-replay rules evaluated against them.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::broker::{EntityType, FailureCategory};

/// Lifecycle state of a tracked DLQ message. `Replayed`, `Resolved`,
/// `Archived`, and `Discarded` are terminal (P1): no later observation may
/// move a row back to `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DlqMessageStatus {
    Active,
    Replayed,
    ReplayFailed,
    Resolved,
    Archived,
    Discarded,
}

impl DlqMessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "Active",
            Self::Replayed => "Replayed",
            Self::ReplayFailed => "ReplayFailed",
            Self::Resolved => "Resolved",
            Self::Archived => "Archived",
            Self::Discarded => "Discarded",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "Active" => Some(Self::Active),
            "Replayed" => Some(Self::Replayed),
            "ReplayFailed" => Some(Self::ReplayFailed),
            "Resolved" => Some(Self::Resolved),
            "Archived" => Some(Self::Archived),
            "Discarded" => Some(Self::Discarded),
            _ => None,
        }
    }

    /// §3 / P1: terminal states never transition back to `Active`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Replayed | Self::ReplayFailed | Self::Resolved | Self::Archived | Self::Discarded)
    }
}

/// A message the scanner has observed at least once in a DLQ. Dedup key is
/// `(namespace_id, entity_name, sequence_number)` (P2).
#[derive(Debug, Clone)]
pub struct DlqMessage {
    pub id: Uuid,
    pub namespace_id: Uuid,
    pub entity_name: String,
    pub topic_name: Option<String>,
    pub entity_type: EntityType,
    pub broker_message_id: String,
    pub sequence_number: i64,
    pub enqueued_time: DateTime<Utc>,
    pub dead_letter_reason: Option<String>,
    pub dead_letter_error_description: Option<String>,
    pub delivery_count: u32,
    pub failure_category: FailureCategory,
    /// First 4 KiB of the body, UTF-8-lossy.
    pub body_preview: String,
    pub content_type: Option<String>,
    pub custom_properties_json: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub status: DlqMessageStatus,
    pub replayed_at: Option<DateTime<Utc>>,
    pub replay_success: Option<bool>,
}

impl DlqMessage {
    /// The broker entity/subscription pair to peek or replay against (§4.9
    /// step 2). For a subscription, `entity_name` is stored as
    /// `"<topic>/subscriptions/<sub>"`; this strips that prefix back off.
    pub fn source_entity(&self) -> (String, Option<String>) {
        match self.entity_type {
            EntityType::Queue => (self.entity_name.clone(), None),
            EntityType::Subscription => {
                let topic = self.topic_name.clone().unwrap_or_default();
                let prefix = format!("{topic}/subscriptions/");
                let sub = self.entity_name.strip_prefix(prefix.as_str()).unwrap_or(&self.entity_name).to_string();
                (topic, Some(sub))
            }
        }
    }
}

/// Truncate `body` to a UTF-8-lossy preview of at most 4 KiB.
pub fn body_preview(body: &[u8]) -> String {
    const LIMIT: usize = 4 * 1024;
    let truncated = &body[..body.len().min(LIMIT)];
    String::from_utf8_lossy(truncated).into_owned()
}

/// How a replay was initiated, per §9's open question: a batch replay with a
/// target-entity override still records `Batch`, not `AlternateEntity` — see
/// the decision note in DESIGN.md.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ReplayStrategy {
    OriginalEntity,
    AlternateEntity,
    Batch,
}

impl ReplayStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OriginalEntity => "original-entity",
            Self::AlternateEntity => "alternate-entity",
            Self::Batch => "batch",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "original-entity" => Some(Self::OriginalEntity),
            "alternate-entity" => Some(Self::AlternateEntity),
            "batch" => Some(Self::Batch),
            _ => None,
        }
    }
}

/// The result recorded for one replay attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum OutcomeStatus {
    Success,
    Failed,
    Error,
    Skipped,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::Failed => "Failed",
            Self::Error => "Error",
            Self::Skipped => "Skipped",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "Success" => Some(Self::Success),
            "Failed" => Some(Self::Failed),
            "Error" => Some(Self::Error),
            "Skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

/// Append-only record of one replay attempt (§3 ReplayHistory).
#[derive(Debug, Clone)]
pub struct ReplayHistory {
    pub id: Uuid,
    pub dlq_message_id: Uuid,
    pub rule_id: Option<Uuid>,
    pub replayed_at: DateTime<Utc>,
    pub replayed_by: String,
    pub replay_strategy: ReplayStrategy,
    pub replayed_to_entity: String,
    pub outcome_status: OutcomeStatus,
    pub error_details: Option<String>,
}

/// The fixed whitelist of fields a rule condition may reference (§4.8).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Field {
    DeadLetterReason,
    DeadLetterErrorDescription,
    FailureCategory,
    EntityName,
    TopicName,
    ContentType,
    BodyPreview,
    DeliveryCount,
    EnqueuedTime,
    /// `Property.<name>` — access into `custom_properties_json`, string-typed.
    Property(String),
}

impl Field {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DeadLetterReason" => Some(Self::DeadLetterReason),
            "DeadLetterErrorDescription" => Some(Self::DeadLetterErrorDescription),
            "FailureCategory" => Some(Self::FailureCategory),
            "EntityName" => Some(Self::EntityName),
            "TopicName" => Some(Self::TopicName),
            "ContentType" => Some(Self::ContentType),
            "BodyPreview" => Some(Self::BodyPreview),
            "DeliveryCount" => Some(Self::DeliveryCount),
            "EnqueuedTime" => Some(Self::EnqueuedTime),
            other => other.strip_prefix("Property.").map(|name| Self::Property(name.to_string())),
        }
    }
}

/// A rule condition's comparison operator (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Operator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Regex,
    GreaterThan,
    LessThan,
    In,
}

/// One rule condition: `field operator value`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Condition {
    pub field: Field,
    pub operator: Operator,
    pub value: String,
}

/// The action taken when a rule's conditions match.
#[derive(Debug, Clone)]
pub struct Action {
    pub auto_replay: bool,
    pub target_entity: Option<String>,
    pub delay_seconds: u32,
    pub exponential_backoff: bool,
    pub max_replays_per_hour: u32,
}

/// A rule: a conjunction of conditions plus an action, evaluated by
/// `RuleEngine` and applied by `AutoReplayExecutor`/`BatchReplayCoordinator`.
#[derive(Debug, Clone)]
pub struct AutoReplayRule {
    pub id: Uuid,
    /// `None` means global (applies across all namespaces).
    pub namespace_id: Option<Uuid>,
    pub name: String,
    pub description: Option<String>,
    pub conditions: Vec<Condition>,
    pub action: Action,
    pub enabled: bool,
    pub match_count: u64,
    pub success_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AutoReplayRule {
    /// P3: `success_count <= match_count` at every persisted state.
    pub fn counters_consistent(&self) -> bool {
        self.success_count <= self.match_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_fixed() {
        assert!(DlqMessageStatus::Replayed.is_terminal());
        assert!(DlqMessageStatus::Resolved.is_terminal());
        assert!(DlqMessageStatus::Archived.is_terminal());
        assert!(DlqMessageStatus::Discarded.is_terminal());
        assert!(DlqMessageStatus::ReplayFailed.is_terminal());
        assert!(!DlqMessageStatus::Active.is_terminal());
    }

    #[test]
    fn body_preview_truncates_to_4kib() {
        let body = vec![b'x'; 5000];
        assert_eq!(body_preview(&body).len(), 4096);
    }

    #[test]
    fn field_parses_property_access() {
        assert_eq!(Field::parse("Property.tenant"), Some(Field::Property("tenant".to_string())));
        assert_eq!(Field::parse("DeliveryCount"), Some(Field::DeliveryCount));
        assert_eq!(Field::parse("NotARealField"), None);
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            DlqMessageStatus::Active,
            DlqMessageStatus::Replayed,
            DlqMessageStatus::ReplayFailed,
            DlqMessageStatus::Resolved,
            DlqMessageStatus::Archived,
            DlqMessageStatus::Discarded,
        ] {
            assert_eq!(DlqMessageStatus::from_str(status.as_str()), Some(status));
        }
    }
}
