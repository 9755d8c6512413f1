//! `DlqStore` — the relational store of tracked DLQ messages, replay
//! history, and auto-replay rules (§4.6).

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::broker::{EntityType, FailureCategory};
use crate::db::SqliteHandle;
use crate::error::EngineError;

use super::model::{
    body_preview, Action, AutoReplayRule, Condition, DlqMessage, DlqMessageStatus, OutcomeStatus,
    ReplayHistory, ReplayStrategy,
};

/// Filters accepted by [`DlqStore::get_active_by_namespace`].
#[derive(Debug, Clone, Default)]
pub struct DlqFilter {
    pub entity_name: Option<String>,
    pub failure_category: Option<FailureCategory>,
}

/// Offset/limit paging for read queries.
#[derive(Debug, Clone, Copy)]
pub struct Paging {
    pub limit: u32,
    pub offset: u32,
}

impl Default for Paging {
    fn default() -> Self {
        Self { limit: 100, offset: 0 }
    }
}

/// Aggregate counts for a namespace's tracked messages.
#[derive(Debug, Clone, Default)]
pub struct DlqSummary {
    pub total: i64,
    pub by_status: Vec<(String, i64)>,
    pub by_failure_category: Vec<(String, i64)>,
}

/// Export output format for [`DlqStore::export`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

pub struct DlqStore {
    db: SqliteHandle,
}

impl DlqStore {
    /// Open the store, creating its tables if absent.
    pub async fn new(db: SqliteHandle) -> Result<Self, EngineError> {
        db.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS dlq_messages (
                    id TEXT PRIMARY KEY,
                    namespace_id TEXT NOT NULL,
                    entity_name TEXT NOT NULL,
                    topic_name TEXT,
                    entity_type TEXT NOT NULL,
                    broker_message_id TEXT NOT NULL,
                    sequence_number INTEGER NOT NULL,
                    enqueued_time TEXT NOT NULL,
                    dead_letter_reason TEXT,
                    dead_letter_error_description TEXT,
                    delivery_count INTEGER NOT NULL,
                    failure_category TEXT NOT NULL,
                    body_preview TEXT NOT NULL,
                    content_type TEXT,
                    custom_properties_json TEXT NOT NULL,
                    first_seen_at TEXT NOT NULL,
                    last_seen_at TEXT NOT NULL,
                    status TEXT NOT NULL,
                    replayed_at TEXT,
                    replay_success INTEGER
                );
                CREATE UNIQUE INDEX IF NOT EXISTS idx_dlq_messages_dedup
                    ON dlq_messages(namespace_id, entity_name, sequence_number);
                CREATE INDEX IF NOT EXISTS idx_dlq_messages_namespace_status
                    ON dlq_messages(namespace_id, status);

                CREATE TABLE IF NOT EXISTS replay_history (
                    id TEXT PRIMARY KEY,
                    dlq_message_id TEXT NOT NULL REFERENCES dlq_messages(id),
                    rule_id TEXT,
                    replayed_at TEXT NOT NULL,
                    replayed_by TEXT NOT NULL,
                    replay_strategy TEXT NOT NULL,
                    replayed_to_entity TEXT NOT NULL,
                    outcome_status TEXT NOT NULL,
                    error_details TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_replay_history_message
                    ON replay_history(dlq_message_id);
                CREATE INDEX IF NOT EXISTS idx_replay_history_rule_time
                    ON replay_history(rule_id, replayed_at);

                CREATE TABLE IF NOT EXISTS auto_replay_rules (
                    id TEXT PRIMARY KEY,
                    namespace_id TEXT,
                    name TEXT NOT NULL,
                    description TEXT,
                    conditions_json TEXT NOT NULL,
                    action_auto_replay INTEGER NOT NULL,
                    action_target_entity TEXT,
                    action_delay_seconds INTEGER NOT NULL,
                    action_exponential_backoff INTEGER NOT NULL,
                    action_max_replays_per_hour INTEGER NOT NULL,
                    enabled INTEGER NOT NULL,
                    match_count INTEGER NOT NULL,
                    success_count INTEGER NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );",
            )
            .map_err(EngineError::from)
        })
        .await?;

        Ok(Self { db })
    }

    /// §4.6 `UpsertObserved`. Idempotent: a second observation with identical
    /// data leaves `first_seen_at` untouched and refreshes everything else
    /// (R2).
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_observed(
        &self,
        namespace_id: Uuid,
        entity_name: String,
        topic_name: Option<String>,
        entity_type: EntityType,
        broker_message_id: String,
        sequence_number: i64,
        enqueued_time: DateTime<Utc>,
        dead_letter_reason: Option<String>,
        dead_letter_error_description: Option<String>,
        delivery_count: u32,
        body: &[u8],
        content_type: Option<String>,
        custom_properties_json: String,
        observed_at: DateTime<Utc>,
    ) -> Result<DlqMessage, EngineError> {
        let failure_category = crate::broker::classify(dead_letter_reason.as_deref().unwrap_or(""));
        let preview = body_preview(body);

        self.db
            .with_conn(move |conn| {
                let existing: Option<String> = conn
                    .query_row(
                        "SELECT id FROM dlq_messages \
                         WHERE namespace_id = ?1 AND entity_name = ?2 AND sequence_number = ?3",
                        params![namespace_id.to_string(), entity_name, sequence_number],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(EngineError::from)?;

                let id = match existing {
                    Some(id) => {
                        // Status is never touched here: a terminal row stays terminal
                        // (P1) while everything else about the observation refreshes.
                        conn.execute(
                            "UPDATE dlq_messages SET \
                                dead_letter_reason = ?1, dead_letter_error_description = ?2, \
                                delivery_count = ?3, failure_category = ?4, body_preview = ?5, \
                                content_type = ?6, custom_properties_json = ?7, last_seen_at = ?8, \
                                broker_message_id = ?9, enqueued_time = ?10 \
                             WHERE id = ?11",
                            params![
                                dead_letter_reason,
                                dead_letter_error_description,
                                delivery_count,
                                failure_category.as_str(),
                                preview,
                                content_type,
                                custom_properties_json,
                                observed_at.to_rfc3339(),
                                broker_message_id,
                                enqueued_time.to_rfc3339(),
                                id,
                            ],
                        )
                        .map_err(EngineError::from)?;
                        id
                    }
                    None => {
                        let id = Uuid::new_v4().to_string();
                        conn.execute(
                            "INSERT INTO dlq_messages (
                                id, namespace_id, entity_name, topic_name, entity_type,
                                broker_message_id, sequence_number, enqueued_time,
                                dead_letter_reason, dead_letter_error_description,
                                delivery_count, failure_category, body_preview, content_type,
                                custom_properties_json, first_seen_at, last_seen_at, status,
                                replayed_at, replay_success
                            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,NULL,NULL)",
                            params![
                                id,
                                namespace_id.to_string(),
                                entity_name,
                                topic_name,
                                entity_type_as_str(entity_type),
                                broker_message_id,
                                sequence_number,
                                enqueued_time.to_rfc3339(),
                                dead_letter_reason,
                                dead_letter_error_description,
                                delivery_count,
                                failure_category.as_str(),
                                preview,
                                content_type,
                                custom_properties_json,
                                observed_at.to_rfc3339(),
                                observed_at.to_rfc3339(),
                                DlqMessageStatus::Active.as_str(),
                            ],
                        )
                        .map_err(EngineError::from)?;
                        id
                    }
                };

                conn.query_row(
                    "SELECT id, namespace_id, entity_name, topic_name, entity_type, \
                     broker_message_id, sequence_number, enqueued_time, dead_letter_reason, \
                     dead_letter_error_description, delivery_count, failure_category, \
                     body_preview, content_type, custom_properties_json, first_seen_at, \
                     last_seen_at, status, replayed_at, replay_success \
                     FROM dlq_messages WHERE id = ?1",
                    params![id],
                    row_to_dlq_message,
                )
                .map_err(EngineError::from)
            })
            .await?
    }

    /// §4.6 `MarkResolved`. `still_active` is the set of `(entity_name, seq)`
    /// pairs observed during the current scan; every `Active` row in
    /// `namespace_id` not in that set, with `last_seen_at < cutoff`,
    /// transitions to `Resolved` (B4).
    pub async fn mark_resolved(
        &self,
        namespace_id: Uuid,
        still_active: HashSet<(String, i64)>,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, EngineError> {
        self.db
            .with_conn(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, entity_name, sequence_number FROM dlq_messages \
                     WHERE namespace_id = ?1 AND status = ?2 AND last_seen_at < ?3",
                )?;
                let candidates: Vec<(String, String, i64)> = stmt
                    .query_map(
                        params![
                            namespace_id.to_string(),
                            DlqMessageStatus::Active.as_str(),
                            cutoff.to_rfc3339()
                        ],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                    )?
                    .collect::<Result<Vec<_>, _>>()?;

                let mut resolved = 0usize;
                for (id, entity_name, seq) in candidates {
                    if still_active.contains(&(entity_name, seq)) {
                        continue;
                    }
                    conn.execute(
                        "UPDATE dlq_messages SET status = ?1 WHERE id = ?2",
                        params![DlqMessageStatus::Resolved.as_str(), id],
                    )?;
                    resolved += 1;
                }
                Ok(resolved)
            })
            .await
    }

    /// §4.6 read query: active tracked messages for a namespace.
    pub async fn get_active_by_namespace(
        &self,
        namespace_id: Uuid,
        filter: DlqFilter,
        paging: Paging,
    ) -> Result<Vec<DlqMessage>, EngineError> {
        self.db
            .with_conn(move |conn| {
                let mut sql = "SELECT id, namespace_id, entity_name, topic_name, entity_type, \
                     broker_message_id, sequence_number, enqueued_time, dead_letter_reason, \
                     dead_letter_error_description, delivery_count, failure_category, \
                     body_preview, content_type, custom_properties_json, first_seen_at, \
                     last_seen_at, status, replayed_at, replay_success \
                     FROM dlq_messages WHERE namespace_id = ? AND status = 'Active'"
                    .to_string();

                let mut bound: Vec<Box<dyn rusqlite::ToSql>> =
                    vec![Box::new(namespace_id.to_string())];
                if let Some(entity_name) = &filter.entity_name {
                    sql.push_str(" AND entity_name = ?");
                    bound.push(Box::new(entity_name.clone()));
                }
                if let Some(category) = &filter.failure_category {
                    sql.push_str(" AND failure_category = ?");
                    bound.push(Box::new(category.as_str()));
                }
                sql.push_str(" ORDER BY last_seen_at DESC LIMIT ? OFFSET ?");
                bound.push(Box::new(paging.limit));
                bound.push(Box::new(paging.offset));

                let mut stmt = conn.prepare(&sql)?;
                let params_ref: Vec<&dyn rusqlite::ToSql> =
                    bound.iter().map(|b| b.as_ref()).collect();
                let rows = stmt
                    .query_map(params_ref.as_slice(), row_to_dlq_message)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// §4.6 `GetSummary`.
    pub async fn get_summary(&self, namespace_id: Uuid) -> Result<DlqSummary, EngineError> {
        self.db
            .with_conn(move |conn| {
                let total: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM dlq_messages WHERE namespace_id = ?1",
                    params![namespace_id.to_string()],
                    |row| row.get(0),
                )?;

                let mut by_status = Vec::new();
                let mut stmt = conn.prepare_cached(
                    "SELECT status, COUNT(*) FROM dlq_messages WHERE namespace_id = ?1 GROUP BY status",
                )?;
                for row in stmt.query_map(params![namespace_id.to_string()], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })? {
                    by_status.push(row?);
                }

                let mut by_failure_category = Vec::new();
                let mut stmt = conn.prepare_cached(
                    "SELECT failure_category, COUNT(*) FROM dlq_messages \
                     WHERE namespace_id = ?1 GROUP BY failure_category",
                )?;
                for row in stmt.query_map(params![namespace_id.to_string()], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })? {
                    by_failure_category.push(row?);
                }

                Ok(DlqSummary { total, by_status, by_failure_category })
            })
            .await
    }

    /// §4.6 `Export`. JSON is a structured array; CSV is a flat
    /// `id,entity_name,sequence_number,status,failure_category` table.
    pub async fn export(
        &self,
        namespace_id: Uuid,
        format: ExportFormat,
    ) -> Result<String, EngineError> {
        let rows = self
            .get_active_by_namespace(namespace_id, DlqFilter::default(), Paging { limit: 100_000, offset: 0 })
            .await?;

        match format {
            ExportFormat::Json => {
                let values: Vec<serde_json::Value> = rows
                    .iter()
                    .map(|m| {
                        serde_json::json!({
                            "id": m.id.to_string(),
                            "entity_name": m.entity_name,
                            "sequence_number": m.sequence_number,
                            "status": m.status.as_str(),
                            "failure_category": m.failure_category.as_str(),
                            "dead_letter_reason": m.dead_letter_reason,
                        })
                    })
                    .collect();
                serde_json::to_string(&values).map_err(|e| EngineError::Internal(e.to_string()))
            }
            ExportFormat::Csv => {
                let mut out = String::from("id,entity_name,sequence_number,status,failure_category\n");
                for m in &rows {
                    out.push_str(&format!(
                        "{},{},{},{},{}\n",
                        m.id, m.entity_name, m.sequence_number, m.status.as_str(), m.failure_category.as_str()
                    ));
                }
                Ok(out)
            }
        }
    }

    /// §4.6 `GetTimeline`: every replay attempt for one tracked message,
    /// oldest first.
    pub async fn get_timeline(&self, dlq_message_id: Uuid) -> Result<Vec<ReplayHistory>, EngineError> {
        self.db
            .with_conn(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, dlq_message_id, rule_id, replayed_at, replayed_by, \
                     replay_strategy, replayed_to_entity, outcome_status, error_details \
                     FROM replay_history WHERE dlq_message_id = ?1 ORDER BY replayed_at ASC",
                )?;
                let rows = stmt
                    .query_map(params![dlq_message_id.to_string()], row_to_history)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// §4.6 `AddReplayHistory`. Append-only.
    pub async fn add_replay_history(&self, record: ReplayHistory) -> Result<(), EngineError> {
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO replay_history (
                        id, dlq_message_id, rule_id, replayed_at, replayed_by,
                        replay_strategy, replayed_to_entity, outcome_status, error_details
                    ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
                    params![
                        record.id.to_string(),
                        record.dlq_message_id.to_string(),
                        record.rule_id.map(|id| id.to_string()),
                        record.replayed_at.to_rfc3339(),
                        record.replayed_by,
                        record.replay_strategy.as_str(),
                        record.replayed_to_entity,
                        record.outcome_status.as_str(),
                        record.error_details,
                    ],
                )
                .map_err(EngineError::from)?;
                Ok(())
            })
            .await
    }

    /// §4.6 `TransitionAfterReplay`. Rejects with `Conflict` if the row is
    /// already in a terminal state.
    pub async fn transition_after_replay(
        &self,
        dlq_message_id: Uuid,
        success: bool,
        at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.db
            .with_conn(move |conn| {
                let status: String = conn
                    .query_row(
                        "SELECT status FROM dlq_messages WHERE id = ?1",
                        params![dlq_message_id.to_string()],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(EngineError::from)?
                    .ok_or_else(|| EngineError::not_found("dlq_message", dlq_message_id))?;

                let current = DlqMessageStatus::from_str(&status).unwrap_or(DlqMessageStatus::Active);
                if current.is_terminal() {
                    return Err(EngineError::Conflict(format!(
                        "dlq_message {dlq_message_id} is already in terminal state {status}"
                    )));
                }

                let (new_status, replay_success) = if success {
                    (DlqMessageStatus::Replayed, true)
                } else {
                    (DlqMessageStatus::ReplayFailed, false)
                };

                conn.execute(
                    "UPDATE dlq_messages SET status = ?1, replay_success = ?2, replayed_at = ?3 \
                     WHERE id = ?4",
                    params![
                        new_status.as_str(),
                        replay_success as i64,
                        at.to_rfc3339(),
                        dlq_message_id.to_string(),
                    ],
                )
                .map_err(EngineError::from)?;
                Ok(())
            })
            .await
    }

    // -- Auto-replay rules -------------------------------------------------

    /// Create a rule. `name` must be unique within its scope (global, or a
    /// single namespace).
    pub async fn create_rule(&self, rule: AutoReplayRule) -> Result<AutoReplayRule, EngineError> {
        let conditions_json = serde_json::to_string(&rule.conditions)
            .map_err(|e| EngineError::Internal(e.to_string()))?;

        self.db
            .with_conn(move |conn| {
                let existing: Option<i64> = conn
                    .query_row(
                        "SELECT 1 FROM auto_replay_rules WHERE name = ?1 AND \
                         (namespace_id = ?2 OR (namespace_id IS NULL AND ?2 IS NULL))",
                        params![rule.name, rule.namespace_id.map(|id| id.to_string())],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(EngineError::from)?;
                if existing.is_some() {
                    return Err(EngineError::Conflict(format!("rule '{}' already exists in scope", rule.name)));
                }

                conn.execute(
                    "INSERT INTO auto_replay_rules (
                        id, namespace_id, name, description, conditions_json,
                        action_auto_replay, action_target_entity, action_delay_seconds,
                        action_exponential_backoff, action_max_replays_per_hour,
                        enabled, match_count, success_count, created_at, updated_at
                    ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
                    params![
                        rule.id.to_string(),
                        rule.namespace_id.map(|id| id.to_string()),
                        rule.name,
                        rule.description,
                        conditions_json,
                        rule.action.auto_replay as i64,
                        rule.action.target_entity,
                        rule.action.delay_seconds,
                        rule.action.exponential_backoff as i64,
                        rule.action.max_replays_per_hour,
                        rule.enabled as i64,
                        rule.match_count as i64,
                        rule.success_count as i64,
                        rule.created_at.to_rfc3339(),
                        rule.updated_at.to_rfc3339(),
                    ],
                )
                .map_err(EngineError::from)?;
                Ok(())
            })
            .await?;

        Ok(rule)
    }

    /// Fetch a rule by id.
    pub async fn get_rule(&self, id: Uuid) -> Result<AutoReplayRule, EngineError> {
        self.db
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT id, namespace_id, name, description, conditions_json, \
                     action_auto_replay, action_target_entity, action_delay_seconds, \
                     action_exponential_backoff, action_max_replays_per_hour, enabled, \
                     match_count, success_count, created_at, updated_at \
                     FROM auto_replay_rules WHERE id = ?1",
                    params![id.to_string()],
                    row_to_rule,
                )
                .optional()
                .map_err(EngineError::from)?
                .ok_or_else(|| EngineError::not_found("auto_replay_rule", id))
            })
            .await?
    }

    /// All enabled rules in scope for `namespace_id` (global rules plus
    /// namespace-specific ones).
    pub async fn get_enabled_rules(&self, namespace_id: Uuid) -> Result<Vec<AutoReplayRule>, EngineError> {
        self.db
            .with_conn(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, namespace_id, name, description, conditions_json, \
                     action_auto_replay, action_target_entity, action_delay_seconds, \
                     action_exponential_backoff, action_max_replays_per_hour, enabled, \
                     match_count, success_count, created_at, updated_at \
                     FROM auto_replay_rules \
                     WHERE enabled = 1 AND (namespace_id IS NULL OR namespace_id = ?1)",
                )?;
                let rows = stmt
                    .query_map(params![namespace_id.to_string()], row_to_rule)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Count this rule's replays recorded in the last hour (§4.9 step 1).
    pub async fn replays_in_last_hour(&self, rule_id: Uuid, now: DateTime<Utc>) -> Result<u32, EngineError> {
        let cutoff = now - chrono::Duration::hours(1);
        self.db
            .with_conn(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM replay_history WHERE rule_id = ?1 AND replayed_at >= ?2",
                    params![rule_id.to_string(), cutoff.to_rfc3339()],
                    |row| row.get(0),
                )?;
                Ok(count as u32)
            })
            .await
    }

    /// Increment a rule's match/success counters (§4.9 step 5, §4.10 step 4).
    pub async fn bump_rule_counters(&self, rule_id: Uuid, matched: bool, succeeded: bool) -> Result<(), EngineError> {
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE auto_replay_rules SET \
                     match_count = match_count + ?1, success_count = success_count + ?2, \
                     updated_at = ?3 WHERE id = ?4",
                    params![
                        matched as i64,
                        succeeded as i64,
                        Utc::now().to_rfc3339(),
                        rule_id.to_string(),
                    ],
                )
                .map_err(EngineError::from)?;
                Ok(())
            })
            .await
    }

    /// Record a replay attempt's history, the tracked message's status
    /// transition, and the owning rule's counters in one transaction
    /// (§4.9 step 5, §4.10 step 4). `status_transition` is `None` when the
    /// attempt never reached the broker (e.g. rate-limited) and the tracked
    /// message should stay `Active`. `rule_counters` is `None` for manual
    /// (non-rule-driven) replays.
    pub async fn record_replay_outcome(
        &self,
        history: ReplayHistory,
        status_transition: Option<(Uuid, bool, DateTime<Utc>)>,
        rule_counters: Option<(Uuid, bool, bool)>,
    ) -> Result<(), EngineError> {
        self.db
            .with_conn_mut(move |conn| {
                let tx = conn.transaction().map_err(EngineError::from)?;

                tx.execute(
                    "INSERT INTO replay_history (
                        id, dlq_message_id, rule_id, replayed_at, replayed_by,
                        replay_strategy, replayed_to_entity, outcome_status, error_details
                    ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
                    params![
                        history.id.to_string(),
                        history.dlq_message_id.to_string(),
                        history.rule_id.map(|id| id.to_string()),
                        history.replayed_at.to_rfc3339(),
                        history.replayed_by,
                        history.replay_strategy.as_str(),
                        history.replayed_to_entity,
                        history.outcome_status.as_str(),
                        history.error_details,
                    ],
                )
                .map_err(EngineError::from)?;

                if let Some((dlq_message_id, success, at)) = status_transition {
                    let status: String = tx
                        .query_row(
                            "SELECT status FROM dlq_messages WHERE id = ?1",
                            params![dlq_message_id.to_string()],
                            |row| row.get(0),
                        )
                        .optional()
                        .map_err(EngineError::from)?
                        .ok_or_else(|| EngineError::not_found("dlq_message", dlq_message_id))?;

                    let current = DlqMessageStatus::from_str(&status).unwrap_or(DlqMessageStatus::Active);
                    if current.is_terminal() {
                        return Err(EngineError::Conflict(format!(
                            "dlq_message {dlq_message_id} is already in terminal state {status}"
                        )));
                    }

                    let (new_status, replay_success) = if success {
                        (DlqMessageStatus::Replayed, true)
                    } else {
                        (DlqMessageStatus::ReplayFailed, false)
                    };

                    tx.execute(
                        "UPDATE dlq_messages SET status = ?1, replay_success = ?2, replayed_at = ?3 \
                         WHERE id = ?4",
                        params![
                            new_status.as_str(),
                            replay_success as i64,
                            at.to_rfc3339(),
                            dlq_message_id.to_string(),
                        ],
                    )
                    .map_err(EngineError::from)?;
                }

                if let Some((rule_id, matched, succeeded)) = rule_counters {
                    tx.execute(
                        "UPDATE auto_replay_rules SET \
                         match_count = match_count + ?1, success_count = success_count + ?2, \
                         updated_at = ?3 WHERE id = ?4",
                        params![
                            matched as i64,
                            succeeded as i64,
                            Utc::now().to_rfc3339(),
                            rule_id.to_string(),
                        ],
                    )
                    .map_err(EngineError::from)?;
                }

                tx.commit().map_err(EngineError::from)?;
                Ok(())
            })
            .await
    }
}

fn entity_type_as_str(entity_type: EntityType) -> &'static str {
    match entity_type {
        EntityType::Queue => "Queue",
        EntityType::Subscription => "Subscription",
    }
}

fn entity_type_from_str(s: &str) -> EntityType {
    match s {
        "Subscription" => EntityType::Subscription,
        _ => EntityType::Queue,
    }
}

fn parse_rfc3339(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_dlq_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<DlqMessage> {
    let id: String = row.get(0)?;
    let namespace_id: String = row.get(1)?;
    let entity_type: String = row.get(4)?;
    let failure_category: String = row.get(11)?;
    let status: String = row.get(17)?;
    let replay_success: Option<i64> = row.get(19)?;

    Ok(DlqMessage {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        namespace_id: Uuid::parse_str(&namespace_id).unwrap_or_default(),
        entity_name: row.get(2)?,
        topic_name: row.get(3)?,
        entity_type: entity_type_from_str(&entity_type),
        broker_message_id: row.get(5)?,
        sequence_number: row.get(6)?,
        enqueued_time: parse_rfc3339(&row.get::<_, String>(7)?),
        dead_letter_reason: row.get(8)?,
        dead_letter_error_description: row.get(9)?,
        delivery_count: row.get(10)?,
        failure_category: failure_category_from_str(&failure_category),
        body_preview: row.get(12)?,
        content_type: row.get(13)?,
        custom_properties_json: row.get(14)?,
        first_seen_at: parse_rfc3339(&row.get::<_, String>(15)?),
        last_seen_at: parse_rfc3339(&row.get::<_, String>(16)?),
        status: DlqMessageStatus::from_str(&status).unwrap_or(DlqMessageStatus::Active),
        replayed_at: row.get::<_, Option<String>>(18)?.map(|s| parse_rfc3339(&s)),
        replay_success: replay_success.map(|v| v != 0),
    })
}

fn failure_category_from_str(s: &str) -> FailureCategory {
    use FailureCategory::*;
    match s {
        "MaxDeliveryCountExceeded" => MaxDeliveryCountExceeded,
        "TTLExpired" => TtlExpired,
        "FilterEvaluation" => FilterEvaluation,
        "SessionLock" => SessionLock,
        "Authorization" => Authorization,
        "ResourceNotFound" => ResourceNotFound,
        "QuotaExceeded" => QuotaExceeded,
        "DataQuality" => DataQuality,
        "ProcessingError" => ProcessingError,
        _ => Transient,
    }
}

fn row_to_history(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReplayHistory> {
    let id: String = row.get(0)?;
    let dlq_message_id: String = row.get(1)?;
    let rule_id: Option<String> = row.get(2)?;
    let replay_strategy: String = row.get(5)?;
    let outcome_status: String = row.get(7)?;

    Ok(ReplayHistory {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        dlq_message_id: Uuid::parse_str(&dlq_message_id).unwrap_or_default(),
        rule_id: rule_id.and_then(|s| Uuid::parse_str(&s).ok()),
        replayed_at: parse_rfc3339(&row.get::<_, String>(3)?),
        replayed_by: row.get(4)?,
        replay_strategy: ReplayStrategy::from_str(&replay_strategy).unwrap_or(ReplayStrategy::OriginalEntity),
        replayed_to_entity: row.get(6)?,
        outcome_status: OutcomeStatus::from_str(&outcome_status).unwrap_or(OutcomeStatus::Error),
        error_details: row.get(8)?,
    })
}

fn row_to_rule(row: &rusqlite::Row<'_>) -> rusqlite::Result<AutoReplayRule> {
    let id: String = row.get(0)?;
    let namespace_id: Option<String> = row.get(1)?;
    let conditions_json: String = row.get(4)?;
    let conditions: Vec<Condition> = serde_json::from_str(&conditions_json).unwrap_or_default();

    Ok(AutoReplayRule {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        namespace_id: namespace_id.and_then(|s| Uuid::parse_str(&s).ok()),
        name: row.get(2)?,
        description: row.get(3)?,
        conditions,
        action: Action {
            auto_replay: row.get::<_, i64>(5)? != 0,
            target_entity: row.get(6)?,
            delay_seconds: row.get(7)?,
            exponential_backoff: row.get::<_, i64>(8)? != 0,
            max_replays_per_hour: row.get(9)?,
        },
        enabled: row.get::<_, i64>(10)? != 0,
        match_count: row.get::<_, i64>(11)? as u64,
        success_count: row.get::<_, i64>(12)? as u64,
        created_at: parse_rfc3339(&row.get::<_, String>(13)?),
        updated_at: parse_rfc3339(&row.get::<_, String>(14)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::model::{Field, Operator};

    async fn store() -> DlqStore {
        let db = SqliteHandle::open_in_memory().unwrap();
        DlqStore::new(db).await.unwrap()
    }

    fn sample_rule(namespace_id: Option<Uuid>) -> AutoReplayRule {
        let now = Utc::now();
        AutoReplayRule {
            id: Uuid::new_v4(),
            namespace_id,
            name: "retry-transient".to_string(),
            description: None,
            conditions: vec![Condition {
                field: Field::FailureCategory,
                operator: Operator::Equals,
                value: "Transient".to_string(),
            }],
            action: Action {
                auto_replay: true,
                target_entity: None,
                delay_seconds: 0,
                exponential_backoff: false,
                max_replays_per_hour: 100,
            },
            enabled: true,
            match_count: 0,
            success_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn upsert_observed_inserts_then_refreshes() {
        let store = store().await;
        let ns = Uuid::new_v4();
        let now = Utc::now();

        let first = store
            .upsert_observed(
                ns,
                "q1".to_string(),
                None,
                EntityType::Queue,
                "m1".to_string(),
                42,
                now,
                Some("MaxDeliveryCountExceeded".to_string()),
                None,
                5,
                b"hello",
                None,
                "{}".to_string(),
                now,
            )
            .await
            .unwrap();
        assert_eq!(first.status, DlqMessageStatus::Active);
        assert_eq!(first.failure_category, FailureCategory::MaxDeliveryCountExceeded);

        let later = now + chrono::Duration::seconds(30);
        let second = store
            .upsert_observed(
                ns,
                "q1".to_string(),
                None,
                EntityType::Queue,
                "m1".to_string(),
                42,
                now,
                Some("MaxDeliveryCountExceeded".to_string()),
                None,
                6,
                b"hello",
                None,
                "{}".to_string(),
                later,
            )
            .await
            .unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.delivery_count, 6);
        assert_eq!(second.last_seen_at, later);
        assert_eq!(second.first_seen_at, first.first_seen_at);
    }

    #[tokio::test]
    async fn mark_resolved_transitions_unseen_rows() {
        let store = store().await;
        let ns = Uuid::new_v4();
        let t0 = Utc::now();

        let msg = store
            .upsert_observed(
                ns, "q1".to_string(), None, EntityType::Queue, "m1".to_string(), 7, t0,
                None, None, 1, b"x", None, "{}".to_string(), t0,
            )
            .await
            .unwrap();

        let cutoff = t0 + chrono::Duration::seconds(10);
        let resolved = store.mark_resolved(ns, HashSet::new(), cutoff).await.unwrap();
        assert_eq!(resolved, 1);

        let rows = store
            .get_active_by_namespace(ns, DlqFilter::default(), Paging::default())
            .await
            .unwrap();
        assert!(rows.iter().all(|m| m.id != msg.id));
    }

    #[tokio::test]
    async fn transition_after_replay_rejects_terminal_rows() {
        let store = store().await;
        let ns = Uuid::new_v4();
        let t0 = Utc::now();

        let msg = store
            .upsert_observed(
                ns, "q1".to_string(), None, EntityType::Queue, "m1".to_string(), 1, t0,
                None, None, 1, b"x", None, "{}".to_string(), t0,
            )
            .await
            .unwrap();

        store.transition_after_replay(msg.id, true, t0).await.unwrap();
        let result = store.transition_after_replay(msg.id, true, t0).await;
        assert!(matches!(result, Err(EngineError::Conflict(_))));
    }

    #[tokio::test]
    async fn rule_name_unique_within_scope() {
        let store = store().await;
        store.create_rule(sample_rule(None)).await.unwrap();
        let result = store.create_rule(sample_rule(None)).await;
        assert!(matches!(result, Err(EngineError::Conflict(_))));
    }

    #[tokio::test]
    async fn rate_limit_counts_recent_history_only() {
        let store = store().await;
        let ns = Uuid::new_v4();
        let rule = store.create_rule(sample_rule(Some(ns))).await.unwrap();
        let now = Utc::now();

        let msg = store
            .upsert_observed(
                ns, "q1".to_string(), None, EntityType::Queue, "m1".to_string(), 1, now,
                None, None, 1, b"x", None, "{}".to_string(), now,
            )
            .await
            .unwrap();

        store
            .add_replay_history(ReplayHistory {
                id: Uuid::new_v4(),
                dlq_message_id: msg.id,
                rule_id: Some(rule.id),
                replayed_at: now - chrono::Duration::minutes(10),
                replayed_by: "engine".to_string(),
                replay_strategy: ReplayStrategy::OriginalEntity,
                replayed_to_entity: "q1".to_string(),
                outcome_status: OutcomeStatus::Success,
                error_details: None,
            })
            .await
            .unwrap();
        store
            .add_replay_history(ReplayHistory {
                id: Uuid::new_v4(),
                dlq_message_id: msg.id,
                rule_id: Some(rule.id),
                replayed_at: now - chrono::Duration::hours(2),
                replayed_by: "engine".to_string(),
                replay_strategy: ReplayStrategy::OriginalEntity,
                replayed_to_entity: "q1".to_string(),
                outcome_status: OutcomeStatus::Success,
                error_details: None,
            })
            .await
            .unwrap();

        let count = store.replays_in_last_hour(rule.id, now).await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn bump_rule_counters_keeps_success_leq_match() {
        let store = store().await;
        let rule = store.create_rule(sample_rule(None)).await.unwrap();

        store.bump_rule_counters(rule.id, true, true).await.unwrap();
        store.bump_rule_counters(rule.id, true, false).await.unwrap();

        let refreshed = store.get_rule(rule.id).await.unwrap();
        assert_eq!(refreshed.match_count, 2);
        assert_eq!(refreshed.success_count, 1);
        assert!(refreshed.counters_consistent());
    }

    #[tokio::test]
    async fn record_replay_outcome_applies_all_three_writes_together() {
        let store = store().await;
        let ns = Uuid::new_v4();
        let now = Utc::now();
        let rule = store.create_rule(sample_rule(Some(ns))).await.unwrap();

        let msg = store
            .upsert_observed(
                ns, "q1".to_string(), None, EntityType::Queue, "m1".to_string(), 1, now,
                None, None, 1, b"x", None, "{}".to_string(), now,
            )
            .await
            .unwrap();

        store
            .record_replay_outcome(
                ReplayHistory {
                    id: Uuid::new_v4(),
                    dlq_message_id: msg.id,
                    rule_id: Some(rule.id),
                    replayed_at: now,
                    replayed_by: "rule-engine".to_string(),
                    replay_strategy: ReplayStrategy::OriginalEntity,
                    replayed_to_entity: "q1".to_string(),
                    outcome_status: OutcomeStatus::Success,
                    error_details: None,
                },
                Some((msg.id, true, now)),
                Some((rule.id, true, true)),
            )
            .await
            .unwrap();

        let refreshed = store.get_rule(rule.id).await.unwrap();
        assert_eq!(refreshed.match_count, 1);
        assert_eq!(refreshed.success_count, 1);

        let timeline = store.get_timeline(msg.id).await.unwrap();
        assert_eq!(timeline.len(), 1);

        let result = store
            .record_replay_outcome(
                ReplayHistory {
                    id: Uuid::new_v4(),
                    dlq_message_id: msg.id,
                    rule_id: Some(rule.id),
                    replayed_at: now,
                    replayed_by: "rule-engine".to_string(),
                    replay_strategy: ReplayStrategy::OriginalEntity,
                    replayed_to_entity: "q1".to_string(),
                    outcome_status: OutcomeStatus::Success,
                    error_details: None,
                },
                Some((msg.id, true, now)),
                None,
            )
            .await;
        assert!(matches!(result, Err(EngineError::Conflict(_))));
    }

    #[tokio::test]
    async fn export_json_contains_active_rows() {
        let store = store().await;
        let ns = Uuid::new_v4();
        let now = Utc::now();
        store
            .upsert_observed(
                ns, "q1".to_string(), None, EntityType::Queue, "m1".to_string(), 1, now,
                Some("TTLExpired".to_string()), None, 1, b"body", None, "{}".to_string(), now,
            )
            .await
            .unwrap();

        let json = store.export(ns, ExportFormat::Json).await.unwrap();
        assert!(json.contains("TTLExpired"));
        let csv = store.export(ns, ExportFormat::Csv).await.unwrap();
        assert!(csv.starts_with("id,entity_name,sequence_number,status,failure_category"));
    }
}
