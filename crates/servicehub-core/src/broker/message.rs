//! Wire-level DTOs exchanged with the broker (§4.4.2, §4.4.3).

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Which kind of entity a path addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum EntityType {
    /// A queue.
    Queue,
    /// A subscription under a topic.
    Subscription,
}

/// The broker-observed lifecycle state of a message, computed from its
/// delivery metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum MessageState {
    /// Available for immediate delivery.
    Active,
    /// Received but not yet completed/abandoned; invisible until lease
    /// expiry.
    Deferred,
    /// Scheduled for a future enqueue time.
    Scheduled,
    /// Moved to the dead-letter sub-queue.
    DeadLettered,
}

/// An application-property value, coerced from whatever generic JSON scalar
/// arrived on a `SendRequest` (§4.4.3).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    /// A whole number that fits in 64 bits.
    Int64(i64),
    /// A floating-point number that isn't representable as `Int64`.
    Double(f64),
    /// `true`/`false`.
    Bool(bool),
    /// Anything else, including values that must remain textual.
    String(String),
    /// JSON `null`.
    Null,
}

impl PropertyValue {
    /// Coerce a generic JSON scalar into the broker's primitive property
    /// types. Arrays and objects are rejected by stringifying them — the
    /// broker property bag does not support nested structures.
    pub fn coerce(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int64(i)
                } else if let Some(f) = n.as_f64() {
                    Self::Double(f)
                } else {
                    Self::String(n.to_string())
                }
            }
            serde_json::Value::String(s) => Self::String(s.clone()),
            other => Self::String(other.to_string()),
        }
    }
}

/// A message as observed from the broker, including delivery metadata.
#[derive(Debug, Clone)]
pub struct Message {
    /// Broker-assigned, stable for the message's lifetime.
    pub sequence_number: i64,
    /// Broker-assigned message identifier.
    pub message_id: String,
    /// Raw body bytes.
    pub body: Vec<u8>,
    /// MIME content type, if set by the sender.
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub session_id: Option<String>,
    pub partition_key: Option<String>,
    pub subject: Option<String>,
    pub reply_to: Option<String>,
    pub reply_to_session_id: Option<String>,
    pub to: Option<String>,
    pub time_to_live: Option<Duration>,
    pub scheduled_enqueue_time: Option<DateTime<Utc>>,
    /// User-defined properties, already coerced to broker primitives.
    pub application_properties: HashMap<String, PropertyValue>,
    pub delivery_count: u32,
    pub enqueued_time: DateTime<Utc>,
    pub dead_letter_reason: Option<String>,
    pub dead_letter_error_description: Option<String>,
    pub dead_letter_source: Option<String>,
    /// Computed from the above per the broker's visibility rules.
    pub state: MessageState,
}

/// Input to `BrokerClientWrapper::send_message` (§4.4.3).
#[derive(Debug, Clone, Default)]
pub struct SendRequest {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub session_id: Option<String>,
    pub partition_key: Option<String>,
    pub subject: Option<String>,
    pub reply_to: Option<String>,
    pub reply_to_session_id: Option<String>,
    pub to: Option<String>,
    pub time_to_live: Option<Duration>,
    pub scheduled_enqueue_time: Option<DateTime<Utc>>,
    /// Arrives as generic JSON scalars; coerced via `PropertyValue::coerce`
    /// before being handed to the broker.
    pub application_properties: HashMap<String, serde_json::Value>,
}

/// The wire-ready form of [`SendRequest`], with application properties
/// already coerced to broker primitives. This is what
/// [`super::transport::BrokerTransport::send`] actually receives.
#[derive(Debug, Clone, Default)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub session_id: Option<String>,
    pub partition_key: Option<String>,
    pub subject: Option<String>,
    pub reply_to: Option<String>,
    pub reply_to_session_id: Option<String>,
    pub to: Option<String>,
    pub time_to_live: Option<Duration>,
    pub scheduled_enqueue_time: Option<DateTime<Utc>>,
    pub application_properties: HashMap<String, PropertyValue>,
}

impl From<SendRequest> for OutboundMessage {
    fn from(req: SendRequest) -> Self {
        Self {
            body: req.body,
            content_type: req.content_type,
            correlation_id: req.correlation_id,
            session_id: req.session_id,
            partition_key: req.partition_key,
            subject: req.subject,
            reply_to: req.reply_to,
            reply_to_session_id: req.reply_to_session_id,
            to: req.to,
            time_to_live: req.time_to_live,
            scheduled_enqueue_time: req.scheduled_enqueue_time,
            application_properties: req
                .application_properties
                .iter()
                .map(|(k, v)| (k.clone(), PropertyValue::coerce(v)))
                .collect(),
        }
    }
}

/// A request to peek (optionally from the dead-letter sub-queue) (§4.4.2).
#[derive(Debug, Clone)]
pub struct PeekRequest {
    pub entity: String,
    pub subscription: Option<String>,
    pub from_dead_letter: bool,
    pub max_messages: u32,
    pub from_sequence: Option<i64>,
}

impl PeekRequest {
    /// Clamp `max_messages` into `[1, 100]` per §4.4.2 / B1.
    pub fn clamped_max_messages(&self) -> u32 {
        self.max_messages.clamp(1, 100)
    }

    /// The broker path this request addresses: `entity`, or
    /// `entity/Subscriptions/subscription`, suffixed with
    /// `/$DeadLetterQueue` when peeking the DLQ.
    pub fn entity_path(&self) -> String {
        entity_path(&self.entity, self.subscription.as_deref(), self.from_dead_letter)
    }
}

/// Build a broker entity path from its parts, per §4.4.2 / §6.
pub fn entity_path(entity: &str, subscription: Option<&str>, dead_letter: bool) -> String {
    let mut path = match subscription {
        Some(sub) => format!("{entity}/Subscriptions/{sub}"),
        None => entity.to_string(),
    };
    if dead_letter {
        path.push_str("/$DeadLetterQueue");
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_max_messages_low() {
        let req = PeekRequest {
            entity: "q1".into(),
            subscription: None,
            from_dead_letter: false,
            max_messages: 0,
            from_sequence: None,
        };
        assert_eq!(req.clamped_max_messages(), 1);
    }

    #[test]
    fn clamps_max_messages_high() {
        let req = PeekRequest {
            entity: "q1".into(),
            subscription: None,
            from_dead_letter: false,
            max_messages: 10_000,
            from_sequence: None,
        };
        assert_eq!(req.clamped_max_messages(), 100);
    }

    #[test]
    fn entity_path_queue_dlq() {
        assert_eq!(entity_path("q1", None, true), "q1/$DeadLetterQueue");
    }

    #[test]
    fn entity_path_subscription() {
        assert_eq!(
            entity_path("t1", Some("s1"), true),
            "t1/Subscriptions/s1/$DeadLetterQueue"
        );
    }

    #[test]
    fn send_request_converts_to_outbound_with_coerced_properties() {
        let mut props = HashMap::new();
        props.insert("retries".to_string(), serde_json::json!(3));
        let req = SendRequest {
            body: b"hi".to_vec(),
            application_properties: props,
            ..Default::default()
        };
        let outbound = OutboundMessage::from(req);
        assert_eq!(
            outbound.application_properties.get("retries"),
            Some(&PropertyValue::Int64(3))
        );
    }

    #[test]
    fn coerces_json_scalars() {
        assert_eq!(PropertyValue::coerce(&serde_json::json!(42)), PropertyValue::Int64(42));
        assert_eq!(
            PropertyValue::coerce(&serde_json::json!(1.5)),
            PropertyValue::Double(1.5)
        );
        assert_eq!(PropertyValue::coerce(&serde_json::json!(true)), PropertyValue::Bool(true));
        assert_eq!(
            PropertyValue::coerce(&serde_json::json!("hi")),
            PropertyValue::String("hi".to_string())
        );
        assert_eq!(PropertyValue::coerce(&serde_json::Value::Null), PropertyValue::Null);
    }
}
