//! Orchestrator configuration.
//!
//! Every value has a default and can be overridden from the environment.
//! Unparseable values are logged and replaced by the default. Counts and
//! durations below their minimum of 1 are raised to it with a warning.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::queue::{QueueSettings, DEFAULT_MAX_ATTEMPTS};

/// Allow runs of unapproved plans.
pub const ENV_PATCH_AUTO: &str = "FEATURE_PATCH_AUTO";

/// Workers on the `alert-triage` queue.
pub const ENV_CLUSTER_WORKERS: &str = "OPSFLOW_CLUSTER_WORKERS";

/// Workers on the `patch-exec` queue.
pub const ENV_PATCH_WORKERS: &str = "OPSFLOW_PATCH_WORKERS";

pub const ENV_VISIBILITY_TIMEOUT_SECS: &str = "OPSFLOW_VISIBILITY_TIMEOUT_SECS";
pub const ENV_MAX_ATTEMPTS: &str = "OPSFLOW_MAX_ATTEMPTS";
pub const ENV_POLL_INTERVAL_MS: &str = "OPSFLOW_POLL_INTERVAL_MS";

pub const DEFAULT_CLUSTER_WORKERS: usize = 1;
pub const DEFAULT_PATCH_WORKERS: usize = 4;

/// Tunables for the orchestrator and its worker pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Run plans that are still PENDING approval
    pub auto_execute: bool,
    pub cluster_workers: usize,
    pub patch_workers: usize,
    pub queue: QueueSettings,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            auto_execute: false,
            cluster_workers: DEFAULT_CLUSTER_WORKERS,
            patch_workers: DEFAULT_PATCH_WORKERS,
            queue: QueueSettings::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Read configuration from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let queue = QueueSettings {
            visibility_timeout: Duration::from_secs(env_at_least(
                ENV_VISIBILITY_TIMEOUT_SECS,
                defaults.queue.visibility_timeout.as_secs(),
                1,
            )),
            max_attempts: env_at_least(ENV_MAX_ATTEMPTS, DEFAULT_MAX_ATTEMPTS, 1),
            poll_interval: Duration::from_millis(env_at_least(
                ENV_POLL_INTERVAL_MS,
                u64::try_from(defaults.queue.poll_interval.as_millis()).unwrap_or(u64::MAX),
                1,
            )),
        };

        Self {
            auto_execute: env_flag(ENV_PATCH_AUTO),
            cluster_workers: env_at_least(ENV_CLUSTER_WORKERS, defaults.cluster_workers, 1),
            patch_workers: env_at_least(ENV_PATCH_WORKERS, defaults.patch_workers, 1),
            queue,
        }
    }

    #[must_use]
    pub const fn with_auto_execute(mut self, enabled: bool) -> Self {
        self.auto_execute = enabled;
        self
    }
}

/// `true`, `1`, and `yes` (any case) enable a flag.
fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(false)
}

fn env_parse<T: FromStr + Copy>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "Invalid configuration value, using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_at_least<T: FromStr + Copy + PartialOrd + Display>(key: &str, default: T, min: T) -> T {
    let value = env_parse(key, default);
    if value < min {
        warn!(key, %value, %min, "Configuration value below minimum, clamping");
        return min;
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            ENV_PATCH_AUTO,
            ENV_CLUSTER_WORKERS,
            ENV_PATCH_WORKERS,
            ENV_VISIBILITY_TIMEOUT_SECS,
            ENV_MAX_ATTEMPTS,
            ENV_POLL_INTERVAL_MS,
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_defaults_without_env() {
        clear_env();
        let config = OrchestratorConfig::from_env();
        assert_eq!(config, OrchestratorConfig::default());
        assert!(!config.auto_execute);
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.queue.visibility_timeout, Duration::from_secs(300));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        std::env::set_var(ENV_PATCH_AUTO, "TRUE");
        std::env::set_var(ENV_PATCH_WORKERS, "8");
        std::env::set_var(ENV_MAX_ATTEMPTS, "5");
        std::env::set_var(ENV_POLL_INTERVAL_MS, "50");

        let config = OrchestratorConfig::from_env();
        clear_env();

        assert!(config.auto_execute);
        assert_eq!(config.patch_workers, 8);
        assert_eq!(config.queue.max_attempts, 5);
        assert_eq!(config.queue.poll_interval, Duration::from_millis(50));
    }

    #[test]
    #[serial]
    fn test_invalid_values_fall_back() {
        clear_env();
        std::env::set_var(ENV_CLUSTER_WORKERS, "many");
        std::env::set_var(ENV_MAX_ATTEMPTS, "0");

        let config = OrchestratorConfig::from_env();
        clear_env();

        assert_eq!(config.cluster_workers, DEFAULT_CLUSTER_WORKERS);
        assert_eq!(config.queue.max_attempts, 1);
    }

    #[test]
    #[serial]
    fn test_zero_timings_are_clamped() {
        clear_env();
        std::env::set_var(ENV_VISIBILITY_TIMEOUT_SECS, "0");
        std::env::set_var(ENV_POLL_INTERVAL_MS, "0");
        std::env::set_var(ENV_PATCH_WORKERS, "0");

        let config = OrchestratorConfig::from_env();
        clear_env();

        assert_eq!(config.queue.visibility_timeout, Duration::from_secs(1));
        assert_eq!(config.queue.poll_interval, Duration::from_millis(1));
        assert_eq!(config.patch_workers, 1);
    }
}
