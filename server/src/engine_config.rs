use config::{Config, ConfigError};
use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Max campaigns picked up per cycle.
    pub campaigns_at_once: usize,
    /// Shrink the pick-up limit by the number of campaigns still in flight.
    pub auto_adjust_campaigns_at_once: bool,
    /// Default per-campaign subscriber allotment per cycle.
    pub subscribers_at_once: usize,
    /// Campaign-level fan-out. 1 = sequential.
    pub campaigns_in_parallel: usize,
    /// Batch-level fan-out within one campaign. 1 = sequential.
    pub subscriber_batches_in_parallel: usize,
    /// Admission-stage fan-out.
    pub precheck_in_parallel: usize,
    /// Master switch; off forces every fan-out to 1 and enables the
    /// per-subscriber quota safety net.
    pub parallel_sending: bool,
    /// Seconds between scheduler-driven dispatch cycles.
    pub interval_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            campaigns_at_once: 10,
            auto_adjust_campaigns_at_once: true,
            subscribers_at_once: 300,
            campaigns_in_parallel: 5,
            subscriber_batches_in_parallel: 3,
            precheck_in_parallel: 3,
            parallel_sending: true,
            interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Chance per subscriber iteration of re-reading the live campaign
    /// status. Tuning constant, not a principled value.
    pub status_recheck_probability: f64,
    /// Domain-policy retry rounds beyond the active server count.
    pub domain_policy_extra_rounds: usize,
    /// Consecutive transport failures before rotating servers.
    pub max_consecutive_failures: u32,
    /// Rotate servers after this many sends on one server; 0 disables.
    pub change_server_at: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            status_recheck_probability: 0.5,
            domain_policy_extra_rounds: 5,
            max_consecutive_failures: 5,
            change_server_at: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    /// Campaign moves to `blocked` above either rate (0..1).
    pub max_bounce_rate: f32,
    pub max_complaint_rate: f32,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            max_bounce_rate: 0.05,
            max_complaint_rate: 0.01,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Top-level run lock TTL.
    pub run_ttl_secs: u64,
    /// Per-campaign-per-day claim TTL.
    pub campaign_ttl_secs: u64,
    /// Short TTL for allowance/usage/dedup read-modify-write steps.
    pub step_ttl_secs: u64,
    /// How long a sender polls for a contended step lock before giving up.
    pub step_wait_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            run_ttl_secs: 600,
            campaign_ttl_secs: 3600,
            step_ttl_secs: 30,
            step_wait_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PacerConfig {
    /// Engine-wide sends per second across all workers.
    pub sends_per_sec: usize,
    pub refill_interval_ms: u64,
    pub refill_amount: usize,
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self {
            sends_per_sec: 50,
            refill_interval_ms: 100,
            refill_amount: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UrlConfig {
    /// Base for per-subscriber unsubscribe links.
    pub unsubscribe_base_url: String,
    pub abuse_report_email: String,
}

impl Default for UrlConfig {
    fn default() -> Self {
        Self {
            unsubscribe_base_url: "https://localhost/lists/unsubscribe".to_string(),
            abuse_report_email: "abuse@localhost".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub dispatch: DispatchConfig,
    pub retry: RetryConfig,
    pub thresholds: ThresholdConfig,
    pub locks: LockConfig,
    pub pacer: PacerConfig,
    pub urls: UrlConfig,
}

impl EngineConfig {
    /// Load `engine.toml` (path overridable via ENGINE_CONFIG) with
    /// `ENGINE__`-prefixed environment overrides. A missing file falls back
    /// to defaults so the binary runs out of the box.
    pub fn load() -> Result<Self, ConfigError> {
        let path = env::var("ENGINE_CONFIG").unwrap_or_else(|_| "engine".to_string());
        let builder = Config::builder()
            .add_source(config::File::with_name(&path).required(false))
            .add_source(
                config::Environment::with_prefix("ENGINE")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        let cfg: EngineConfig = builder.try_deserialize()?;
        cfg.validate().map_err(ConfigError::Message)?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.retry.status_recheck_probability) {
            return Err("retry.status_recheck_probability must be within 0..=1".to_string());
        }
        if self.dispatch.campaigns_in_parallel == 0
            || self.dispatch.subscriber_batches_in_parallel == 0
            || self.dispatch.precheck_in_parallel == 0
        {
            return Err("dispatch fan-out settings must be at least 1".to_string());
        }
        if self.dispatch.subscribers_at_once == 0 {
            return Err("dispatch.subscribers_at_once must be at least 1".to_string());
        }
        Ok(())
    }

    /// Campaign-level fan-out with the master switch applied.
    pub fn effective_campaigns_in_parallel(&self) -> usize {
        if self.dispatch.parallel_sending {
            self.dispatch.campaigns_in_parallel
        } else {
            1
        }
    }

    /// Batch-level fan-out with the master switch applied.
    pub fn effective_batches_in_parallel(&self) -> usize {
        if self.dispatch.parallel_sending {
            self.dispatch.subscriber_batches_in_parallel
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = EngineConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.dispatch.campaigns_at_once, 10);
        assert_eq!(cfg.retry.domain_policy_extra_rounds, 5);
    }

    #[test]
    fn test_validation_rejects_bad_probability() {
        let mut cfg = EngineConfig::default();
        cfg.retry.status_recheck_probability = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_parallelism_master_switch() {
        let mut cfg = EngineConfig::default();
        cfg.dispatch.campaigns_in_parallel = 8;
        cfg.dispatch.subscriber_batches_in_parallel = 4;
        assert_eq!(cfg.effective_campaigns_in_parallel(), 8);
        cfg.dispatch.parallel_sending = false;
        assert_eq!(cfg.effective_campaigns_in_parallel(), 1);
        assert_eq!(cfg.effective_batches_in_parallel(), 1);
    }
}
