//! Configuration read by the control-plane components.

use crate::pipeline::BuildLogRetention;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("max_build_logs_to_retain ({max}) is less than default_build_logs_to_retain ({default})")]
    RetentionBelowDefault { max: u32, default: u32 },
    #[error("max_days_to_retain_build_logs ({max}) is less than default_days_to_retain_build_logs ({default})")]
    DaysBelowDefault { max: u32, default: u32 },
    #[error("lease_heartbeat_fraction must be at least 2, got {0}")]
    HeartbeatFraction(u32),
    #[error("unknown container placement strategy '{0}'")]
    UnknownStrategy(String),
}

impl From<ConfigError> for crate::Error {
    fn from(err: ConfigError) -> Self {
        crate::Error::Other(format!("invalid configuration: {err}"))
    }
}

/// Garbage collection tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcConfig {
    /// How often each collector runs.
    #[serde(default = "default_gc_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_grace")]
    pub one_off_build_grace_period_secs: u64,
    #[serde(default = "default_grace")]
    pub missing_grace_period_secs: u64,
    #[serde(default = "default_grace")]
    pub hijack_grace_period_secs: u64,
    #[serde(default = "default_check_recycle")]
    pub check_recycle_period_secs: u64,
    /// Unreferenced configs and caches live this long before removal.
    #[serde(default = "default_grace")]
    pub unreferenced_grace_period_secs: u64,
    #[serde(default = "default_artifact_ttl")]
    pub artifact_ttl_secs: u64,
    #[serde(default = "default_log_batch")]
    pub build_log_collector_batch_size: usize,
    #[serde(default = "default_stall_after")]
    pub worker_heartbeat_stall_after_secs: u64,
}

fn default_gc_interval() -> u64 {
    30
}

fn default_grace() -> u64 {
    300
}

fn default_check_recycle() -> u64 {
    6 * 3600
}

fn default_artifact_ttl() -> u64 {
    12 * 3600
}

fn default_log_batch() -> usize {
    500
}

fn default_stall_after() -> u64 {
    60
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_gc_interval(),
            one_off_build_grace_period_secs: default_grace(),
            missing_grace_period_secs: default_grace(),
            hijack_grace_period_secs: default_grace(),
            check_recycle_period_secs: default_check_recycle(),
            unreferenced_grace_period_secs: default_grace(),
            artifact_ttl_secs: default_artifact_ttl(),
            build_log_collector_batch_size: default_log_batch(),
            worker_heartbeat_stall_after_secs: default_stall_after(),
        }
    }
}

impl GcConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn one_off_build_grace_period(&self) -> Duration {
        Duration::from_secs(self.one_off_build_grace_period_secs)
    }

    pub fn missing_grace_period(&self) -> Duration {
        Duration::from_secs(self.missing_grace_period_secs)
    }

    pub fn hijack_grace_period(&self) -> Duration {
        Duration::from_secs(self.hijack_grace_period_secs)
    }

    pub fn check_recycle_period(&self) -> Duration {
        Duration::from_secs(self.check_recycle_period_secs)
    }

    pub fn unreferenced_grace_period(&self) -> Duration {
        Duration::from_secs(self.unreferenced_grace_period_secs)
    }

    pub fn artifact_ttl(&self) -> Duration {
        Duration::from_secs(self.artifact_ttl_secs)
    }

    pub fn worker_heartbeat_stall_after(&self) -> Duration {
        Duration::from_secs(self.worker_heartbeat_stall_after_secs)
    }
}

/// Knobs shared by the scheduler, checker, engine and collectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default = "default_runner_interval")]
    pub component_runner_interval_secs: u64,
    #[serde(default = "default_scheduling_in_flight")]
    pub job_scheduling_max_in_flight: usize,
    #[serde(default = "default_check_timeout")]
    pub global_resource_check_timeout_secs: u64,
    #[serde(default = "default_checking_interval")]
    pub resource_checking_interval_secs: u64,
    #[serde(default)]
    pub default_build_logs_to_retain: u32,
    #[serde(default)]
    pub max_build_logs_to_retain: u32,
    #[serde(default)]
    pub default_days_to_retain_build_logs: u32,
    #[serde(default)]
    pub max_days_to_retain_build_logs: u32,
    #[serde(default)]
    pub enable_redact_secrets: bool,
    #[serde(default = "default_row_limit")]
    pub algorithm_candidate_row_limit: usize,
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
    /// Heartbeat period is `ttl / lease_heartbeat_fraction`.
    #[serde(default = "default_heartbeat_fraction")]
    pub lease_heartbeat_fraction: u32,
    #[serde(default = "default_checker_batch")]
    pub checker_batch_size: usize,
    /// Bound for `on_abort`/`ensure` after a build is aborted.
    #[serde(default = "default_abort_grace")]
    pub abort_grace_period_secs: u64,
    #[serde(default = "default_strategy")]
    pub container_placement_strategy: Vec<String>,
    #[serde(default)]
    pub max_active_containers_per_worker: usize,
    #[serde(default)]
    pub max_active_volumes_per_worker: usize,
    #[serde(default)]
    pub max_active_tasks_per_worker: usize,
    /// How long `choose_for` waits for a suitable worker.
    #[serde(default = "default_worker_wait")]
    pub worker_wait_timeout_secs: u64,
    #[serde(default)]
    pub gc: GcConfig,
}

fn default_runner_interval() -> u64 {
    10
}

fn default_scheduling_in_flight() -> usize {
    32
}

fn default_check_timeout() -> u64 {
    3600
}

fn default_checking_interval() -> u64 {
    60
}

fn default_row_limit() -> usize {
    100
}

fn default_drain_timeout() -> u64 {
    30
}

fn default_heartbeat_fraction() -> u32 {
    3
}

fn default_checker_batch() -> usize {
    50
}

fn default_abort_grace() -> u64 {
    60
}

fn default_strategy() -> Vec<String> {
    vec!["volume-locality".to_string(), "fewest-build-containers".to_string()]
}

fn default_worker_wait() -> u64 {
    300
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            component_runner_interval_secs: default_runner_interval(),
            job_scheduling_max_in_flight: default_scheduling_in_flight(),
            global_resource_check_timeout_secs: default_check_timeout(),
            resource_checking_interval_secs: default_checking_interval(),
            default_build_logs_to_retain: 0,
            max_build_logs_to_retain: 0,
            default_days_to_retain_build_logs: 0,
            max_days_to_retain_build_logs: 0,
            enable_redact_secrets: false,
            algorithm_candidate_row_limit: default_row_limit(),
            drain_timeout_secs: default_drain_timeout(),
            lease_heartbeat_fraction: default_heartbeat_fraction(),
            checker_batch_size: default_checker_batch(),
            abort_grace_period_secs: default_abort_grace(),
            container_placement_strategy: default_strategy(),
            max_active_containers_per_worker: 0,
            max_active_volumes_per_worker: 0,
            max_active_tasks_per_worker: 0,
            worker_wait_timeout_secs: default_worker_wait(),
            gc: GcConfig::default(),
        }
    }
}

pub const PLACEMENT_STRATEGIES: &[&str] = &[
    "volume-locality",
    "fewest-build-containers",
    "random",
    "limit-active-containers",
    "limit-active-volumes",
    "limit-active-tasks",
];

impl CoreConfig {
    pub fn component_runner_interval(&self) -> Duration {
        Duration::from_secs(self.component_runner_interval_secs)
    }

    pub fn global_resource_check_timeout(&self) -> Duration {
        Duration::from_secs(self.global_resource_check_timeout_secs)
    }

    pub fn resource_checking_interval(&self) -> Duration {
        Duration::from_secs(self.resource_checking_interval_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn abort_grace_period(&self) -> Duration {
        Duration::from_secs(self.abort_grace_period_secs)
    }

    pub fn worker_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_wait_timeout_secs)
    }

    pub fn default_retention(&self) -> BuildLogRetention {
        BuildLogRetention {
            builds: self.default_build_logs_to_retain,
            days: self.default_days_to_retain_build_logs,
        }
    }

    pub fn max_retention(&self) -> BuildLogRetention {
        BuildLogRetention {
            builds: self.max_build_logs_to_retain,
            days: self.max_days_to_retain_build_logs,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("component_runner_interval_secs", self.component_runner_interval_secs),
            ("global_resource_check_timeout_secs", self.global_resource_check_timeout_secs),
            ("resource_checking_interval_secs", self.resource_checking_interval_secs),
            ("gc.interval_secs", self.gc.interval_secs),
            ("gc.check_recycle_period_secs", self.gc.check_recycle_period_secs),
            ("gc.artifact_ttl_secs", self.gc.artifact_ttl_secs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.job_scheduling_max_in_flight == 0 {
            return Err(ConfigError::Zero("job_scheduling_max_in_flight"));
        }
        if self.lease_heartbeat_fraction < 2 {
            return Err(ConfigError::HeartbeatFraction(self.lease_heartbeat_fraction));
        }
        if self.checker_batch_size == 0 {
            return Err(ConfigError::Zero("checker_batch_size"));
        }
        if self.gc.build_log_collector_batch_size == 0 {
            return Err(ConfigError::Zero("gc.build_log_collector_batch_size"));
        }
        if self.max_build_logs_to_retain > 0
            && self.max_build_logs_to_retain < self.default_build_logs_to_retain
        {
            return Err(ConfigError::RetentionBelowDefault {
                max: self.max_build_logs_to_retain,
                default: self.default_build_logs_to_retain,
            });
        }
        if self.max_days_to_retain_build_logs > 0
            && self.max_days_to_retain_build_logs < self.default_days_to_retain_build_logs
        {
            return Err(ConfigError::DaysBelowDefault {
                max: self.max_days_to_retain_build_logs,
                default: self.default_days_to_retain_build_logs,
            });
        }
        for strategy in &self.container_placement_strategy {
            if !PLACEMENT_STRATEGIES.contains(&strategy.as_str()) {
                return Err(ConfigError::UnknownStrategy(strategy.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CoreConfig::default();
        config.validate().unwrap();
        assert_eq!(config.component_runner_interval(), Duration::from_secs(10));
        assert_eq!(config.gc.artifact_ttl(), Duration::from_secs(12 * 3600));
        assert_eq!(config.algorithm_candidate_row_limit, 100);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = CoreConfig {
            component_runner_interval_secs: 0,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero("component_runner_interval_secs"))
        );
    }

    #[test]
    fn test_max_retention_below_default_rejected() {
        let config = CoreConfig {
            default_build_logs_to_retain: 10,
            max_build_logs_to_retain: 5,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RetentionBelowDefault { .. })
        ));
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: CoreConfig = serde_yaml::from_str("job_scheduling_max_in_flight: 4\ngc: {}").unwrap();
        assert_eq!(config.job_scheduling_max_in_flight, 4);
        assert_eq!(config.gc.check_recycle_period(), Duration::from_secs(6 * 3600));
    }
}
