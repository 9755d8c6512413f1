//! `DlqScanner` — the background task that keeps `DlqStore` in sync with
//! what's actually sitting in each namespace's dead-letter sub-queues
//! (§4.7).

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::broker::{BrokerClientCache, PeekRequest};
use crate::config::ScannerConfig;
use crate::error::EngineError;
use crate::namespace::{Namespace, NamespaceRepository};
use crate::security::ConnectionStringProtector;
use crate::shutdown::ShutdownToken;

use super::store::DlqStore;

/// Periodically peeks every active namespace's dead-lettered entities and
/// reconciles them into `DlqStore`. Failures for one namespace or entity are
/// logged and never block the rest of the scan (§4.7 step 5).
pub struct DlqScanner {
    namespaces: Arc<NamespaceRepository>,
    cache: Arc<BrokerClientCache>,
    store: Arc<DlqStore>,
    protector: Arc<ConnectionStringProtector>,
    config: ScannerConfig,
}

impl DlqScanner {
    pub fn new(
        namespaces: Arc<NamespaceRepository>,
        cache: Arc<BrokerClientCache>,
        store: Arc<DlqStore>,
        protector: Arc<ConnectionStringProtector>,
        config: ScannerConfig,
    ) -> Self {
        Self { namespaces, cache, store, protector, config }
    }

    /// Run one scan pass over every active namespace, bounded to
    /// `config.max_concurrent_namespaces` in flight at once. Returns the
    /// total number of rows upserted.
    pub async fn scan_all(&self) -> usize {
        let namespaces = match self.namespaces.get_active().await {
            Ok(ns) => ns,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list active namespaces for scan");
                return 0;
            }
        };

        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.config.max_concurrent_namespaces.max(1)));
        let mut join_set = tokio::task::JoinSet::new();

        for namespace in namespaces {
            let semaphore = semaphore.clone();
            let cache = self.cache.clone();
            let store = self.store.clone();
            let protector = self.protector.clone();
            let config = self.config.clone();

            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
                scan_one_namespace(&namespace, &cache, &store, &protector, &config).await
            });
        }

        let mut total = 0usize;
        while let Some(result) = join_set.join_next().await {
            match result {
                Ok(Ok(count)) => total += count,
                Ok(Err(e)) => tracing::warn!(error = %e, "namespace scan failed"),
                Err(e) => tracing::warn!(error = %e, "namespace scan task panicked"),
            }
        }
        total
    }

    /// Scan a single namespace on demand (the explicit "scan now" trigger).
    /// Returns the number of rows upserted.
    pub async fn scan_now(&self, namespace_id: Uuid) -> Result<usize, EngineError> {
        let namespace = self.namespaces.get_by_id(namespace_id).await?;
        scan_one_namespace(&namespace, &self.cache, &self.store, &self.protector, &self.config).await
    }

    /// Run `scan_all` on `config.scan_interval` until `token` fires.
    pub async fn run(self: Arc<Self>, mut token: ShutdownToken) {
        let mut ticker = tokio::time::interval(self.config.scan_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let upserted = self.scan_all().await;
                    tracing::debug!(upserted, "dlq scan pass complete");
                }
                _ = token.cancelled() => {
                    tracing::info!("dlq scanner shutting down");
                    break;
                }
            }
        }
    }
}

async fn scan_one_namespace(
    namespace: &Namespace,
    cache: &BrokerClientCache,
    store: &DlqStore,
    protector: &ConnectionStringProtector,
    config: &ScannerConfig,
) -> Result<usize, EngineError> {
    let credential = namespace.decrypt_credential(protector)?;
    let wrapper = cache.get_or_create(namespace.id, &credential)?;

    let scan_started_at = Utc::now();
    let mut still_active = HashSet::new();
    let mut upserted = 0usize;

    match wrapper.get_queues().await {
        Ok(queues) => {
            for queue in queues {
                if queue.dead_letter_message_count == 0 {
                    continue;
                }
                match scan_entity(
                    &wrapper,
                    store,
                    namespace.id,
                    crate::broker::EntityType::Queue,
                    &queue.name,
                    None,
                    config.max_peek_per_entity,
                    scan_started_at,
                )
                .await
                {
                    Ok((seen, count)) => {
                        still_active.extend(seen);
                        upserted += count;
                    }
                    Err(e) => tracing::warn!(
                        namespace = %namespace.id, entity = %queue.name, error = %e,
                        "failed to scan queue dead-letter sub-queue"
                    ),
                }
            }
        }
        Err(e) => tracing::warn!(namespace = %namespace.id, error = %e, "failed to list queues"),
    }

    match wrapper.get_topics().await {
        Ok(topics) => {
            for topic in topics {
                let subscriptions = match wrapper.get_subscriptions(&topic.name).await {
                    Ok(subs) => subs,
                    Err(e) => {
                        tracing::warn!(
                            namespace = %namespace.id, topic = %topic.name, error = %e,
                            "failed to list subscriptions"
                        );
                        continue;
                    }
                };

                for subscription in subscriptions {
                    if subscription.dead_letter_message_count == 0 {
                        continue;
                    }
                    match scan_entity(
                        &wrapper,
                        store,
                        namespace.id,
                        crate::broker::EntityType::Subscription,
                        &topic.name,
                        Some(&subscription.name),
                        config.max_peek_per_entity,
                        scan_started_at,
                    )
                    .await
                    {
                        Ok((seen, count)) => {
                            still_active.extend(seen);
                            upserted += count;
                        }
                        Err(e) => tracing::warn!(
                            namespace = %namespace.id, entity = %subscription.name, error = %e,
                            "failed to scan subscription dead-letter sub-queue"
                        ),
                    }
                }
            }
        }
        Err(e) => tracing::warn!(namespace = %namespace.id, error = %e, "failed to list topics"),
    }

    let cutoff = scan_started_at
        - chrono::Duration::from_std(config.stale_threshold).unwrap_or_else(|_| chrono::Duration::seconds(0));
    if let Err(e) = store.mark_resolved(namespace.id, still_active, cutoff).await {
        tracing::warn!(namespace = %namespace.id, error = %e, "failed to mark resolved messages");
    }

    Ok(upserted)
}

/// Peek and upsert one queue's or one subscription's dead-letter sub-queue.
/// `queue_or_topic` is the queue name for a queue, the topic name for a
/// subscription; `subscription` is `None` for a queue, `Some(sub_name)` for
/// a subscription. The stored `entity_name` follows §3's dedup key shape —
/// bare for a queue, `"<topic>/subscriptions/<sub>"` for a subscription, so
/// `(namespace_id, entity_name, sequence_number)` can't collide across two
/// topics that happen to share a subscription name.
async fn scan_entity(
    wrapper: &crate::broker::BrokerClientWrapper,
    store: &DlqStore,
    namespace_id: Uuid,
    entity_type: crate::broker::EntityType,
    queue_or_topic: &str,
    subscription: Option<&str>,
    max_peek: u32,
    observed_at: chrono::DateTime<Utc>,
) -> Result<(Vec<(String, i64)>, usize), EngineError> {
    let messages = wrapper
        .peek_messages(PeekRequest {
            entity: queue_or_topic.to_string(),
            subscription: subscription.map(str::to_string),
            from_dead_letter: true,
            max_messages: max_peek,
            from_sequence: None,
        })
        .await?;

    let (entity_name, topic_name) = match subscription {
        Some(sub) => (format!("{queue_or_topic}/subscriptions/{sub}"), Some(queue_or_topic.to_string())),
        None => (queue_or_topic.to_string(), None),
    };

    let mut seen = Vec::with_capacity(messages.len());
    let mut count = 0usize;

    for message in &messages {
        let properties_json = serde_json::to_string(&message.application_properties)
            .unwrap_or_else(|_| "{}".to_string());

        store
            .upsert_observed(
                namespace_id,
                entity_name.clone(),
                topic_name.clone(),
                entity_type,
                message.message_id.clone(),
                message.sequence_number,
                message.enqueued_time,
                message.dead_letter_reason.clone(),
                message.dead_letter_error_description.clone(),
                message.delivery_count,
                &message.body,
                message.content_type.clone(),
                properties_json,
                observed_at,
            )
            .await?;

        seen.push((entity_name.clone(), message.sequence_number));
        count += 1;
    }

    Ok((seen, count))
}
