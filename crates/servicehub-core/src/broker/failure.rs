//! Failure category classification (§4.5).
//!
//! The broker gives us a free-form `dead_letter_reason` string; we derive a
//! stable category from it by case-insensitive substring matching, tried in
//! precedence order. Recomputed on every upsert, so a reason change updates
//! the category.

/// The derived, stable category of why a message was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FailureCategory {
    MaxDeliveryCountExceeded,
    TtlExpired,
    FilterEvaluation,
    SessionLock,
    Authorization,
    ResourceNotFound,
    QuotaExceeded,
    DataQuality,
    ProcessingError,
    Transient,
}

impl FailureCategory {
    /// The column value / wire name for this category.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MaxDeliveryCountExceeded => "MaxDeliveryCountExceeded",
            Self::TtlExpired => "TTLExpired",
            Self::FilterEvaluation => "FilterEvaluation",
            Self::SessionLock => "SessionLock",
            Self::Authorization => "Authorization",
            Self::ResourceNotFound => "ResourceNotFound",
            Self::QuotaExceeded => "QuotaExceeded",
            Self::DataQuality => "DataQuality",
            Self::ProcessingError => "ProcessingError",
            Self::Transient => "Transient",
        }
    }
}

/// Precedence-ordered (category, triggering substrings) table from §4.5.
const RULES: &[(FailureCategory, &[&str])] = &[
    (FailureCategory::MaxDeliveryCountExceeded, &["maxdelivery", "maxdeliverycount"]),
    (FailureCategory::TtlExpired, &["expired", "ttl"]),
    (FailureCategory::FilterEvaluation, &["filter"]),
    (FailureCategory::SessionLock, &["session"]),
    (FailureCategory::Authorization, &["unauthorized", "forbidden"]),
    (FailureCategory::ResourceNotFound, &["notfound", "entitynotfound"]),
    (FailureCategory::QuotaExceeded, &["quota", "sizeexceeded"]),
    (FailureCategory::DataQuality, &["deserializ", "schema", "malformed"]),
    (FailureCategory::ProcessingError, &["exception", "error"]),
];

/// Classify a broker-supplied dead-letter reason. Unknown text falls back to
/// `Transient`.
pub fn classify(reason: &str) -> FailureCategory {
    let lower = reason.to_lowercase();
    for (category, needles) in RULES {
        if needles.iter().any(|needle| lower.contains(needle)) {
            return *category;
        }
    }
    FailureCategory::Transient
}
