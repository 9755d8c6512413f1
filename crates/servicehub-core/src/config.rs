//! Engine configuration.
//!
//! Every knob named in the specification's external-interfaces section, with
//! its documented default. There is no environment-variable or file loader
//! here deliberately — that belongs to the (out-of-scope) HTTP edge binary;
//! this struct is the contract it must populate.

use std::time::Duration;

/// Top-level configuration for a running engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Master key material for `ConnectionStringProtector` (§4.1). Required;
    /// no default — supplied externally (environment or key vault).
    pub encryption: EncryptionConfig,
    /// `BrokerClientCache` eviction policy.
    pub cache: CacheConfig,
    /// `DlqScanner` tuning.
    pub scanner: ScannerConfig,
    /// Single-message replay tuning (`BrokerClientWrapper::replay_message`).
    pub replay_single: ReplayConfig,
    /// Batch replay tuning (`BrokerClientWrapper::replay_messages`).
    pub replay_batch: ReplayConfig,
    /// Purge tuning (`BrokerClientWrapper::purge_message`).
    pub purge: PurgeConfig,
    /// Auto-replay rule defaults.
    pub rules: RulesConfig,
}

impl EngineConfig {
    /// Build a config from a master key, with every other field defaulted.
    pub fn new(master_key: Vec<u8>) -> Self {
        Self {
            encryption: EncryptionConfig { master_key },
            cache: CacheConfig::default(),
            scanner: ScannerConfig::default(),
            replay_single: ReplayConfig::single_default(),
            replay_batch: ReplayConfig::batch_default(),
            purge: PurgeConfig::default(),
            rules: RulesConfig::default(),
        }
    }
}

/// `encryption.*`
#[derive(Clone)]
pub struct EncryptionConfig {
    /// Raw master key bytes. Not `Debug`-printed to avoid leaking it into
    /// logs.
    pub master_key: Vec<u8>,
}

impl std::fmt::Debug for EncryptionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionConfig")
            .field("master_key", &"<redacted>")
            .finish()
    }
}

/// `cache.*`
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// `cache.idle_ttl_minutes` — wrapper eviction threshold.
    pub idle_ttl: Duration,
    /// Interval of the periodic idle sweep. Fixed at 60s by the spec, not a
    /// configured value, but kept here so tests can shrink it.
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            idle_ttl: Duration::from_secs(60 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// `scanner.*`
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// `scanner.interval_seconds`
    pub scan_interval: Duration,
    /// `scanner.max_peek_per_entity`
    pub max_peek_per_entity: u32,
    /// `scanner.max_concurrent_namespaces`
    pub max_concurrent_namespaces: usize,
    /// `scanner.stale_threshold_seconds`
    pub stale_threshold: Duration,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(10),
            max_peek_per_entity: 100,
            max_concurrent_namespaces: 4,
            stale_threshold: Duration::from_secs(20),
        }
    }
}

/// Shared shape of `replay.single.*` / `replay.batch.*`.
#[derive(Debug, Clone, Copy)]
pub struct ReplayConfig {
    /// Number of scan batches attempted before giving up.
    pub max_attempts: u32,
    /// Messages received per batch.
    pub batch_size: u32,
    /// Max wait per batch receive.
    pub wait: Duration,
}

impl ReplayConfig {
    /// `replay.single.*` defaults.
    pub fn single_default() -> Self {
        Self {
            max_attempts: 10,
            batch_size: 50,
            wait: Duration::from_secs(3),
        }
    }

    /// `replay.batch.*` defaults.
    pub fn batch_default() -> Self {
        Self {
            max_attempts: 10,
            batch_size: 100,
            wait: Duration::from_secs(5),
        }
    }
}

/// `purge.*`
#[derive(Debug, Clone, Copy)]
pub struct PurgeConfig {
    /// `purge.max_attempts`
    pub max_attempts: u32,
    /// `purge.batch_size`
    pub batch_size: u32,
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            batch_size: 100,
        }
    }
}

/// `rules.*`
#[derive(Debug, Clone, Copy)]
pub struct RulesConfig {
    /// `rules.default_max_replays_per_hour`
    pub default_max_replays_per_hour: u32,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            default_max_replays_per_hour: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = EngineConfig::new(vec![0u8; 32]);
        assert_eq!(cfg.cache.idle_ttl, Duration::from_secs(3600));
        assert_eq!(cfg.scanner.scan_interval, Duration::from_secs(10));
        assert_eq!(cfg.scanner.max_peek_per_entity, 100);
        assert_eq!(cfg.scanner.max_concurrent_namespaces, 4);
        assert_eq!(cfg.scanner.stale_threshold, Duration::from_secs(20));
        assert_eq!(cfg.replay_single.max_attempts, 10);
        assert_eq!(cfg.replay_single.batch_size, 50);
        assert_eq!(cfg.replay_batch.batch_size, 100);
        assert_eq!(cfg.purge.max_attempts, 20);
        assert_eq!(cfg.rules.default_max_replays_per_hour, 100);
    }

    #[test]
    fn encryption_config_debug_redacts_key() {
        let cfg = EncryptionConfig {
            master_key: vec![1, 2, 3, 4],
        };
        assert_eq!(format!("{cfg:?}"), "EncryptionConfig { master_key: \"<redacted>\" }");
    }
}
