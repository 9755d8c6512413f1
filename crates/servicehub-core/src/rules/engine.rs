//! `RuleEngine` — evaluates an `AutoReplayRule`'s conditions against a
//! tracked message (§4.8).

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::DateTime;

use crate::dlq::{AutoReplayRule, Condition, DlqMessage, Field, Operator};

/// Stateless evaluator. A rule matches a message when every one of its
/// conditions holds (AND-conjunction); an empty condition list always
/// matches.
pub struct RuleEngine;

impl RuleEngine {
    pub fn new() -> Self {
        Self
    }

    /// Whether `rule` matches `message`. A condition referencing a property
    /// the message doesn't carry, or a malformed regex, makes that single
    /// condition false rather than failing the whole evaluation.
    pub fn evaluate(&self, rule: &AutoReplayRule, message: &DlqMessage) -> bool {
        rule.conditions.iter().all(|condition| evaluate_condition(condition, message))
    }
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn evaluate_condition(condition: &Condition, message: &DlqMessage) -> bool {
    let Some(actual) = field_value(&condition.field, message) else {
        return false;
    };

    match condition.operator {
        Operator::Equals => actual.eq_ignore_ascii_case(&condition.value),
        Operator::NotEquals => !actual.eq_ignore_ascii_case(&condition.value),
        Operator::Contains => actual.to_lowercase().contains(&condition.value.to_lowercase()),
        Operator::NotContains => !actual.to_lowercase().contains(&condition.value.to_lowercase()),
        Operator::StartsWith => actual.to_lowercase().starts_with(&condition.value.to_lowercase()),
        Operator::EndsWith => actual.to_lowercase().ends_with(&condition.value.to_lowercase()),
        Operator::Regex => regex::Regex::new(&format!("^(?:{})$", condition.value))
            .map(|re| re.is_match(&actual))
            .unwrap_or(false),
        Operator::GreaterThan => compare(&actual, &condition.value) == Some(Ordering::Greater),
        Operator::LessThan => compare(&actual, &condition.value) == Some(Ordering::Less),
        Operator::In => condition
            .value
            .split(',')
            .any(|candidate| candidate.trim().eq_ignore_ascii_case(actual.trim())),
    }
}

fn field_value(field: &Field, message: &DlqMessage) -> Option<String> {
    match field {
        Field::DeadLetterReason => Some(message.dead_letter_reason.clone().unwrap_or_default()),
        Field::DeadLetterErrorDescription => {
            Some(message.dead_letter_error_description.clone().unwrap_or_default())
        }
        Field::FailureCategory => Some(message.failure_category.as_str().to_string()),
        Field::EntityName => Some(message.entity_name.clone()),
        Field::TopicName => Some(message.topic_name.clone().unwrap_or_default()),
        Field::ContentType => Some(message.content_type.clone().unwrap_or_default()),
        Field::BodyPreview => Some(message.body_preview.clone()),
        Field::DeliveryCount => Some(message.delivery_count.to_string()),
        Field::EnqueuedTime => Some(message.enqueued_time.to_rfc3339()),
        Field::Property(name) => property_value(&message.custom_properties_json, name),
    }
}

fn property_value(properties_json: &str, name: &str) -> Option<String> {
    let map: HashMap<String, serde_json::Value> = serde_json::from_str(properties_json).ok()?;
    match map.get(name)? {
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Numeric comparison if both sides parse as a number, falling back to
/// RFC3339 timestamp comparison. Neither parses → no defined ordering.
fn compare(a: &str, b: &str) -> Option<Ordering> {
    if let (Ok(a), Ok(b)) = (a.parse::<f64>(), b.parse::<f64>()) {
        return a.partial_cmp(&b);
    }
    if let (Ok(a), Ok(b)) = (DateTime::parse_from_rfc3339(a), DateTime::parse_from_rfc3339(b)) {
        return a.partial_cmp(&b);
    }
    None
}
