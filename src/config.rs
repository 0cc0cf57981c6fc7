use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// External dependency probes to register at startup. Cadence and
    /// criticality are always assigned here, never inferred.
    #[serde(default)]
    pub probes: Vec<ProbeConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Scheduler tick interval in milliseconds
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Maximum concurrent component tasks
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    /// Per-task deadline in milliseconds
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
    /// Base retry backoff in milliseconds
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Retry backoff ceiling in milliseconds
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
}

fn default_tick_interval_ms() -> u64 {
    250
}
fn default_worker_pool_size() -> usize {
    8
}
fn default_task_timeout_ms() -> u64 {
    30_000
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_cap_ms() -> u64 {
    60_000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            worker_pool_size: default_worker_pool_size(),
            task_timeout_ms: default_task_timeout_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatConfig {
    /// Consecutive failures before HEALTHY -> DEGRADED
    #[serde(default = "default_degrade_threshold")]
    pub degrade_threshold: u32,
    /// Further consecutive failures before DEGRADED -> FAILED
    #[serde(default = "default_fail_threshold")]
    pub fail_threshold: u32,
    /// Consecutive successes before returning to HEALTHY
    #[serde(default = "default_recover_threshold")]
    pub recover_threshold: u32,
    /// Sliding window of recent outcomes kept per component
    #[serde(default = "default_window_size")]
    pub window_size: usize,
}

fn default_degrade_threshold() -> u32 {
    3
}
fn default_fail_threshold() -> u32 {
    2
}
fn default_recover_threshold() -> u32 {
    2
}
fn default_window_size() -> usize {
    16
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            degrade_threshold: default_degrade_threshold(),
            fail_threshold: default_fail_threshold(),
            recover_threshold: default_recover_threshold(),
            window_size: default_window_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecoveryConfig {
    /// Time allowed for a soft restart to bring a component back (ms)
    #[serde(default = "default_remediation_timeout_ms")]
    pub remediation_timeout_ms: u64,
    /// Verification window after a restore (ms)
    #[serde(default = "default_verify_window_ms")]
    pub verify_window_ms: u64,
    /// Poll interval while waiting on health during remediation/verification (ms)
    #[serde(default = "default_health_poll_ms")]
    pub health_poll_ms: u64,
    /// Maximum failover attempts before FAILED_PERMANENT
    #[serde(default = "default_max_failover_attempts")]
    pub max_failover_attempts: u32,
}

fn default_remediation_timeout_ms() -> u64 {
    30_000
}
fn default_verify_window_ms() -> u64 {
    60_000
}
fn default_health_poll_ms() -> u64 {
    250
}
fn default_max_failover_attempts() -> u32 {
    3
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            remediation_timeout_ms: default_remediation_timeout_ms(),
            verify_window_ms: default_verify_window_ms(),
            health_poll_ms: default_health_poll_ms(),
            max_failover_attempts: default_max_failover_attempts(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckpointConfig {
    /// Directory for the file-backed checkpoint store
    #[serde(default = "default_checkpoint_dir")]
    pub dir: String,
    /// Interval between automatic checkpoints in seconds
    #[serde(default = "default_checkpoint_interval_secs")]
    pub interval_secs: u64,
    /// Most recent checkpoints always retained
    #[serde(default = "default_keep_recent")]
    pub keep_recent: usize,
    /// One checkpoint per day retained this many days back
    #[serde(default = "default_keep_daily")]
    pub keep_daily: usize,
}

fn default_checkpoint_dir() -> String {
    "data/checkpoints".to_string()
}
fn default_checkpoint_interval_secs() -> u64 {
    300
}
fn default_keep_recent() -> usize {
    5
}
fn default_keep_daily() -> usize {
    7
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: default_checkpoint_dir(),
            interval_secs: default_checkpoint_interval_secs(),
            keep_recent: default_keep_recent(),
            keep_daily: default_keep_daily(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
    /// Grace period for in-flight tasks to finish (ms)
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
}

fn default_grace_ms() -> u64 {
    30_000
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_ms: default_grace_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    /// Bind address for the control server
    #[serde(default = "default_control_bind")]
    pub bind: String,
}

fn default_control_bind() -> String {
    "127.0.0.1:7770".to_string()
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            bind: default_control_bind(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Optional directory for daily rolling log files
    #[serde(default)]
    pub dir: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// A single external dependency probe registration
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    pub name: String,
    pub url: String,
    /// Run interval in seconds
    pub interval_secs: u64,
    /// Critical probes trigger failover on failure; others only log
    #[serde(default)]
    pub critical: bool,
    /// Request timeout in milliseconds
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default values
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("VIGIL_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (VIGIL_SCHEDULER__TICK_INTERVAL_MS, etc.)
            .add_source(
                Environment::with_prefix("VIGIL")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.scheduler.tick_interval_ms == 0 {
            errors.push("scheduler.tick_interval_ms must be positive".to_string());
        }

        if self.scheduler.worker_pool_size == 0 {
            errors.push("scheduler.worker_pool_size must be positive".to_string());
        }

        if self.scheduler.backoff_base_ms > self.scheduler.backoff_cap_ms {
            errors.push("scheduler.backoff_base_ms exceeds backoff_cap_ms".to_string());
        }

        if self.heartbeat.degrade_threshold == 0 {
            errors.push("heartbeat.degrade_threshold must be at least 1".to_string());
        }

        if self.heartbeat.recover_threshold == 0 {
            errors.push("heartbeat.recover_threshold must be at least 1".to_string());
        }

        let consecutive = (self.heartbeat.degrade_threshold + self.heartbeat.fail_threshold) as usize;
        if self.heartbeat.window_size < consecutive {
            errors.push(format!(
                "heartbeat.window_size {} is smaller than degrade+fail thresholds {}",
                self.heartbeat.window_size, consecutive
            ));
        }

        if self.recovery.max_failover_attempts == 0 {
            errors.push("recovery.max_failover_attempts must be at least 1".to_string());
        }

        if self.checkpoint.keep_recent == 0 {
            errors.push("checkpoint.keep_recent must be at least 1".to_string());
        }

        for probe in &self.probes {
            if probe.interval_secs == 0 {
                errors.push(format!("probe {} has zero interval", probe.name));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            recovery: RecoveryConfig::default(),
            checkpoint: CheckpointConfig::default(),
            shutdown: ShutdownConfig::default(),
            control: ControlConfig::default(),
            logging: LoggingConfig::default(),
            probes: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.heartbeat.degrade_threshold, 3);
        assert_eq!(config.heartbeat.fail_threshold, 2);
        assert_eq!(config.heartbeat.recover_threshold, 2);
    }

    #[test]
    fn test_validate_rejects_small_window() {
        let mut config = AppConfig::default();
        config.heartbeat.window_size = 2;
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("window_size")));
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = AppConfig::default();
        config.scheduler.worker_pool_size = 0;
        assert!(config.validate().is_err());
    }
}
