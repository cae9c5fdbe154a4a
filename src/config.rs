//! Engine configuration.
//!
//! All settings can be configured via environment variables:
//! - `FLOW_ENRICHMENT_ENABLED`: Hand answers to the enricher (default: true)
//! - `FLOW_ENRICHMENT_TIMEOUT_MS`: Per-answer enrichment timeout (default: 5000)
//! - `FLOW_MAX_COMMIT_ATTEMPTS`: Retries on optimistic-lock conflicts (default: 3)
//! - `FLOW_FORM_CACHE_SIZE`: Forms kept in the LRU cache (default: 256)

use std::time::Duration;

/// Tunables for [`crate::FlowEngine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Whether submitted answers are handed to the enricher.
    pub enrichment_enabled: bool,
    /// Upper bound for one enrichment call.
    pub enrichment_timeout: Duration,
    /// How many times a mutation is recomputed after a version conflict.
    pub max_commit_attempts: u32,
    /// Capacity of the form cache; 0 disables caching.
    pub form_cache_size: usize,
}

impl EngineConfig {
    /// Load configuration from environment variables with defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enrichment_enabled: env_parse("FLOW_ENRICHMENT_ENABLED").unwrap_or(defaults.enrichment_enabled),
            enrichment_timeout: env_parse("FLOW_ENRICHMENT_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.enrichment_timeout),
            max_commit_attempts: env_parse::<u32>("FLOW_MAX_COMMIT_ATTEMPTS")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_commit_attempts),
            form_cache_size: env_parse("FLOW_FORM_CACHE_SIZE").unwrap_or(defaults.form_cache_size),
        }
    }

    /// Disable enrichment.
    pub fn without_enrichment(mut self) -> Self {
        self.enrichment_enabled = false;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enrichment_enabled: true,
            enrichment_timeout: Duration::from_millis(5_000),
            max_commit_attempts: 3,
            form_cache_size: 256,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}
