//! `BatchReplayCoordinator` — runs one rule's action against every matching
//! tracked message in its scope using the broker's O(k) batch replay path
//! (§4.10).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::broker::{BrokerClientCache, BrokerClientWrapper, EntityType, ReplayOutcome};
use crate::dlq::{AutoReplayRule, DlqFilter, DlqMessage, DlqStore, OutcomeStatus, Paging, ReplayHistory, ReplayStrategy};
use crate::error::EngineError;
use crate::namespace::NamespaceRepository;
use crate::security::ConnectionStringProtector;

use super::engine::RuleEngine;

const REPLAYED_BY: &str = "batch-replay";

/// Outcome tally for one `replay_all` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub matched: usize,
    pub replayed: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Finds every tracked message in a rule's scope that the rule matches and
/// replays them all through `BrokerClientWrapper::replay_messages_to`,
/// grouped per source entity so each group costs one receive/send pass
/// instead of one per message.
pub struct BatchReplayCoordinator {
    store: Arc<DlqStore>,
    cache: Arc<BrokerClientCache>,
    namespaces: Arc<NamespaceRepository>,
    protector: Arc<ConnectionStringProtector>,
    engine: RuleEngine,
}

impl BatchReplayCoordinator {
    pub fn new(
        store: Arc<DlqStore>,
        cache: Arc<BrokerClientCache>,
        namespaces: Arc<NamespaceRepository>,
        protector: Arc<ConnectionStringProtector>,
    ) -> Self {
        Self { store, cache, namespaces, protector, engine: RuleEngine::new() }
    }

    /// Replay every active tracked message `rule_id` matches across its
    /// scope: a single namespace if the rule is namespace-scoped, every
    /// active namespace if it's global (§4.10 step 1). `max_replays_per_hour`
    /// is a budget shared across the whole call, not per namespace or per
    /// group — matches beyond it are skipped rather than replayed.
    pub async fn replay_all(&self, rule_id: Uuid) -> Result<BatchSummary, EngineError> {
        let rule = self.store.get_rule(rule_id).await?;
        let namespace_ids = match rule.namespace_id {
            Some(id) => vec![id],
            None => self.namespaces.get_active().await?.into_iter().map(|ns| ns.id).collect(),
        };

        let now = Utc::now();
        let recent = self.store.replays_in_last_hour(rule.id, now).await?;
        let mut remaining_budget = rule.action.max_replays_per_hour.saturating_sub(recent);

        let mut summary = BatchSummary::default();
        for namespace_id in namespace_ids {
            self.replay_in_namespace(namespace_id, &rule, &mut summary, &mut remaining_budget).await?;
        }
        Ok(summary)
    }

    async fn replay_in_namespace(
        &self,
        namespace_id: Uuid,
        rule: &AutoReplayRule,
        summary: &mut BatchSummary,
        remaining_budget: &mut u32,
    ) -> Result<(), EngineError> {
        let candidates = self
            .store
            .get_active_by_namespace(namespace_id, DlqFilter::default(), Paging { limit: 10_000, offset: 0 })
            .await?;

        let matches: Vec<DlqMessage> = candidates.into_iter().filter(|m| self.engine.evaluate(rule, m)).collect();
        if matches.is_empty() {
            return Ok(());
        }
        summary.matched += matches.len();

        let namespace = self.namespaces.get_by_id(namespace_id).await?;
        let credential = namespace.decrypt_credential(&self.protector)?;
        let wrapper = self.cache.get_or_create(namespace.id, &credential)?;

        for (group_key, group) in group_by_source_entity(matches) {
            self.replay_group(&wrapper, rule, group_key, group, summary, remaining_budget).await?;
        }
        Ok(())
    }

    async fn replay_group(
        &self,
        wrapper: &BrokerClientWrapper,
        rule: &AutoReplayRule,
        (entity, subscription): (String, Option<String>),
        mut group: Vec<DlqMessage>,
        summary: &mut BatchSummary,
        remaining_budget: &mut u32,
    ) -> Result<(), EngineError> {
        let take = (*remaining_budget as usize).min(group.len());
        let rate_limited = group.split_off(take);
        *remaining_budget -= take as u32;

        for message in &rate_limited {
            summary.skipped += 1;
            self.store
                .record_replay_outcome(
                    ReplayHistory {
                        id: Uuid::new_v4(),
                        dlq_message_id: message.id,
                        rule_id: Some(rule.id),
                        replayed_at: Utc::now(),
                        replayed_by: REPLAYED_BY.to_string(),
                        replay_strategy: ReplayStrategy::Batch,
                        replayed_to_entity: entity.clone(),
                        outcome_status: OutcomeStatus::Skipped,
                        error_details: Some("RateLimited".to_string()),
                    },
                    None,
                    Some((rule.id, true, false)),
                )
                .await?;
        }

        if group.is_empty() {
            return Ok(());
        }

        let by_sequence: HashMap<i64, &DlqMessage> = group.iter().map(|m| (m.sequence_number, m)).collect();
        let sequences: Vec<i64> = group.iter().map(|m| m.sequence_number).collect();
        let target_entity = rule.action.target_entity.as_deref();
        let replay_strategy = ReplayStrategy::Batch;

        let outcomes = wrapper
            .replay_messages_to(&entity, subscription.as_deref(), &sequences, target_entity)
            .await?;

        for (sequence, outcome) in outcomes {
            let Some(message) = by_sequence.get(&sequence) else { continue };
            let replayed_to_entity = target_entity.unwrap_or(&entity).to_string();
            let at = Utc::now();

            let (outcome_status, error_details, status_transition) = match outcome {
                ReplayOutcome::Success => {
                    summary.replayed += 1;
                    (OutcomeStatus::Success, None, Some((message.id, true, at)))
                }
                ReplayOutcome::Failed(reason) => {
                    summary.failed += 1;
                    (OutcomeStatus::Failed, Some(reason), Some((message.id, false, at)))
                }
                ReplayOutcome::NotFound => {
                    // Already gone from the DLQ by some other path; leave the
                    // tracked row for the next scan to reconcile.
                    summary.skipped += 1;
                    (OutcomeStatus::Error, Some("not found in dead-letter queue at replay time".to_string()), None)
                }
            };

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
                    Some((rule.id, true, outcome_status == OutcomeStatus::Success)),
                )
                .await?;
        }

        Ok(())
    }
}

fn group_by_source_entity(messages: Vec<DlqMessage>) -> HashMap<(String, Option<String>), Vec<DlqMessage>> {
    let mut groups: HashMap<(String, Option<String>), Vec<DlqMessage>> = HashMap::new();
    for message in messages {
        let key = message.source_entity();
        groups.entry(key).or_default().push(message);
    }
    groups
}
