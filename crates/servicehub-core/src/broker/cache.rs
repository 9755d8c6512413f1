//! `BrokerClientCache` (§4.3) — one live `BrokerClientWrapper` per namespace,
//! keyed by namespace id, invalidated on credential change and swept for
//! idleness.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::config::{PurgeConfig, ReplayConfig};
use crate::error::EngineError;
use crate::shutdown::ShutdownToken;

use super::client::BrokerClientWrapper;
use super::transport::BrokerTransport;

/// Builds a [`BrokerTransport`] from a decrypted connection string. The
/// cache depends on this seam instead of a concrete broker SDK so it stays
/// testable without a live namespace.
pub trait TransportFactory: Send + Sync {
    fn build(&self, connection_string: &str) -> Result<Arc<dyn BrokerTransport>, EngineError>;
}

struct CacheEntry {
    wrapper: Arc<BrokerClientWrapper>,
    last_used: Mutex<Instant>,
}

/// Computes a stable fingerprint for a credential string, used to detect
/// rotation without keeping the plaintext around longer than necessary.
fn fingerprint(credential: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    credential.hash(&mut hasher);
    hasher.finish()
}

/// Concurrent namespace_id → wrapper cache. At most one live wrapper per
/// namespace at any instant (P5): `get_or_create` disposes the stale entry
/// before installing its replacement, never leaving two wrappers registered
/// for the same id.
pub struct BrokerClientCache {
    entries: DashMap<Uuid, CacheEntry>,
    factory: Arc<dyn TransportFactory>,
    idle_ttl: Duration,
    sweep_interval: Duration,
    replay_single: ReplayConfig,
    replay_batch: ReplayConfig,
    purge: PurgeConfig,
}

impl BrokerClientCache {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        idle_ttl: Duration,
        sweep_interval: Duration,
        replay_single: ReplayConfig,
        replay_batch: ReplayConfig,
        purge: PurgeConfig,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            factory,
            idle_ttl,
            sweep_interval,
            replay_single,
            replay_batch,
            purge,
        }
    }

    /// Return the cached wrapper for `namespace_id` if its fingerprint still
    /// matches `credential`, creating (or replacing) one otherwise.
    pub fn get_or_create(
        &self,
        namespace_id: Uuid,
        credential: &str,
    ) -> Result<Arc<BrokerClientWrapper>, EngineError> {
        let wanted = fingerprint(credential);

        if let Some(entry) = self.entries.get(&namespace_id) {
            if entry.wrapper.fingerprint() == wanted && !entry.wrapper.is_disposed() {
                *entry.last_used.lock() = Instant::now();
                return Ok(entry.wrapper.clone());
            }
        }

        // Either missing, disposed, or the credential rotated underneath us.
        // Build the replacement before touching the map so a failing
        // transport build leaves the existing (possibly stale) entry alone.
        let transport = self.factory.build(credential)?;
        let wrapper = Arc::new(BrokerClientWrapper::new(
            transport,
            wanted,
            self.replay_single,
            self.replay_batch,
            self.purge,
        ));

        if let Some((_, stale)) = self.entries.remove(&namespace_id) {
            stale.wrapper.dispose();
        }
        self.entries.insert(
            namespace_id,
            CacheEntry {
                wrapper: wrapper.clone(),
                last_used: Mutex::new(Instant::now()),
            },
        );

        Ok(wrapper)
    }

    /// Explicitly evict and dispose a namespace's wrapper, e.g. on
    /// deactivation or credential rotation (§4.2 `update_credential`).
    pub fn invalidate(&self, namespace_id: Uuid) {
        if let Some((_, entry)) = self.entries.remove(&namespace_id) {
            entry.wrapper.dispose();
        }
    }

    /// One sweep pass: dispose and evict every entry idle longer than
    /// `idle_ttl`.
    pub fn sweep_idle(&self) {
        let now = Instant::now();
        let stale: Vec<Uuid> = self
            .entries
            .iter()
            .filter(|entry| now.duration_since(*entry.value().last_used.lock()) >= self.idle_ttl)
            .map(|entry| *entry.key())
            .collect();

        for namespace_id in stale {
            self.invalidate(namespace_id);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run `sweep_idle` on `sweep_interval` until `token` fires.
    pub async fn run_sweep_loop(self: Arc<Self>, mut token: ShutdownToken) {
        let mut ticker = tokio::time::interval(self.sweep_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep_idle(),
                _ = token.cancelled() => {
                    tracing::info!("broker client cache sweep loop shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use crate::testing::InMemoryBroker;

    use super::*;

    struct CountingFactory {
        calls: AtomicU64,
    }

    impl TransportFactory for CountingFactory {
        fn build(&self, connection_string: &str) -> Result<Arc<dyn BrokerTransport>, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(InMemoryBroker::new(connection_string.to_string())))
        }
    }

    fn cache(factory: Arc<CountingFactory>) -> BrokerClientCache {
        BrokerClientCache::new(
            factory,
            Duration::from_secs(3600),
            Duration::from_secs(60),
            ReplayConfig::single_default(),
            ReplayConfig::batch_default(),
            PurgeConfig::default(),
        )
    }

    #[test]
    fn reuses_wrapper_for_same_credential() {
        let factory = Arc::new(CountingFactory { calls: AtomicU64::new(0) });
        let c = cache(factory.clone());
        let id = Uuid::new_v4();

        let a = c.get_or_create(id, "Endpoint=sb://x;SharedAccessKey=k").unwrap();
        let b = c.get_or_create(id, "Endpoint=sb://x;SharedAccessKey=k").unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(factory.calls.load(Ordering::SeqCst), 1);
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn rotated_credential_replaces_and_disposes_old_wrapper() {
        let factory = Arc::new(CountingFactory { calls: AtomicU64::new(0) });
        let c = cache(factory);
        let id = Uuid::new_v4();

        let old = c.get_or_create(id, "key-1").unwrap();
        let new = c.get_or_create(id, "key-2").unwrap();

        assert!(old.is_disposed());
        assert!(!new.is_disposed());
        assert!(!Arc::ptr_eq(&old, &new));
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn invalidate_disposes_and_removes() {
        let factory = Arc::new(CountingFactory { calls: AtomicU64::new(0) });
        let c = cache(factory);
        let id = Uuid::new_v4();

        let wrapper = c.get_or_create(id, "key").unwrap();
        c.invalidate(id);

        assert!(wrapper.is_disposed());
        assert!(c.is_empty());
    }

    #[test]
    fn sweep_evicts_idle_entries_only() {
        let factory = Arc::new(CountingFactory { calls: AtomicU64::new(0) });
        let mut c = cache(factory);
        c.idle_ttl = Duration::from_millis(1);
        let id = Uuid::new_v4();

        let wrapper = c.get_or_create(id, "key").unwrap();
        std::thread::sleep(Duration::from_millis(5));
        c.sweep_idle();

        assert!(wrapper.is_disposed());
        assert!(c.is_empty());
    }

    #[test]
    fn different_namespaces_get_independent_wrappers() {
        let factory = Arc::new(CountingFactory { calls: AtomicU64::new(0) });
        let c = cache(factory.clone());

        let a = c.get_or_create(Uuid::new_v4(), "key").unwrap();
        let b = c.get_or_create(Uuid::new_v4(), "key").unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(factory.calls.load(Ordering::SeqCst), 2);
        assert_eq!(c.len(), 2);
    }
}
