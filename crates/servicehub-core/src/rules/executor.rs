//! `AutoReplayExecutor` — drives a single rule match through to a recorded
//! outcome (§4.9).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::broker::{BrokerClientCache, EntityType};
use crate::dlq::{AutoReplayRule, DlqMessage, DlqStore, OutcomeStatus, ReplayHistory, ReplayStrategy};
use crate::error::EngineError;
use crate::namespace::NamespaceRepository;
use crate::security::ConnectionStringProtector;
use crate::shutdown::ShutdownToken;

const REPLAYED_BY: &str = "auto-replay";

/// Executes the action side of a matched auto-replay rule against one
/// tracked message: rate limit, optional delay, the actual replay call, and
/// the atomic history/transition/counters write.
pub struct AutoReplayExecutor {
    store: Arc<DlqStore>,
    cache: Arc<BrokerClientCache>,
    namespaces: Arc<NamespaceRepository>,
    protector: Arc<ConnectionStringProtector>,
}

impl AutoReplayExecutor {
    pub fn new(
        store: Arc<DlqStore>,
        cache: Arc<BrokerClientCache>,
        namespaces: Arc<NamespaceRepository>,
        protector: Arc<ConnectionStringProtector>,
    ) -> Self {
        Self { store, cache, namespaces, protector }
    }

    /// Run `rule`'s action against `message`. `shutdown` lets a pending
    /// per-rule delay be interrupted by process shutdown rather than
    /// blocking it; a cancelled delay counts as skipped, not failed.
    pub async fn execute(
        &self,
        message: &DlqMessage,
        rule: &AutoReplayRule,
        shutdown: &mut ShutdownToken,
    ) -> Result<OutcomeStatus, EngineError> {
        let now = Utc::now();
        let recent = self.store.replays_in_last_hour(rule.id, now).await?;
        if recent >= rule.action.max_replays_per_hour {
            self.record(
                message, rule, OutcomeStatus::Skipped, message.entity_name.clone(),
                Some("RateLimited".to_string()), ReplayStrategy::OriginalEntity,
            )
            .await?;
            return Ok(OutcomeStatus::Skipped);
        }

        if rule.action.delay_seconds > 0 {
            let delay = tokio::time::sleep(Duration::from_secs(rule.action.delay_seconds as u64));
            tokio::select! {
                _ = delay => {}
                _ = shutdown.cancelled() => {
                    self.record(
                        message, rule, OutcomeStatus::Skipped, message.entity_name.clone(),
                        Some("shutdown requested during replay delay".to_string()), ReplayStrategy::OriginalEntity,
                    )
                    .await?;
                    return Ok(OutcomeStatus::Skipped);
                }
            }
        }

        let namespace = self.namespaces.get_by_id(message.namespace_id).await?;
        let credential = namespace.decrypt_credential(&self.protector)?;
        let wrapper = self.cache.get_or_create(namespace.id, &credential)?;

        let (entity, subscription) = message.source_entity();
        let target_entity = rule.action.target_entity.as_deref();
        let replay_strategy =
            if target_entity.is_some() { ReplayStrategy::AlternateEntity } else { ReplayStrategy::OriginalEntity };
        let replayed_to_entity = target_entity.unwrap_or(&entity).to_string();

        let result = wrapper
            .replay_message_to(&entity, subscription.as_deref(), message.sequence_number, target_entity)
            .await;

        let (outcome_status, error_details) = match &result {
            Ok(()) => (OutcomeStatus::Success, None),
            Err(e) => (OutcomeStatus::Failed, Some(e.to_string())),
        };

        self.record(message, rule, outcome_status, replayed_to_entity, error_details, replay_strategy)
            .await?;

        Ok(outcome_status)
    }

    async fn record(
        &self,
        message: &DlqMessage,
        rule: &AutoReplayRule,
        outcome_status: OutcomeStatus,
        replayed_to_entity: String,
        error_details: Option<String>,
        replay_strategy: ReplayStrategy,
    ) -> Result<(), EngineError> {
        let at = Utc::now();
        let succeeded = outcome_status == OutcomeStatus::Success;
        let status_transition = (outcome_status != OutcomeStatus::Skipped).then_some((message.id, succeeded, at));

        self.store
            .record_replay_outcome(
                ReplayHistory {
                    id: Uuid::new_v4(),
                    dlq_message_id: message.id,
                    rule_id: Some(rule.id),
                    replayed_at: at,
                    replayed_by: REPLAYED_BY.to_string(),
                    replay_strategy,
                    replayed_to_entity,
                    outcome_status,
                    error_details,
                },
                status_transition,
                Some((rule.id, true, succeeded)),
            )
            .await
    }
}
