mod file_config;

pub use file_config::{FileConfig, ReindexConfig, ThrottleConfig};

use crate::reindex::{
    validate_config, OrchestratorSettings, ReindexJobConfig, ResourceRateThrottleConfig,
};
use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub max_concurrency: Option<u32>,
    pub max_resources_per_page: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_dir: PathBuf,

    // Feature configs (with defaults)
    pub reindex: ReindexSettings,
    pub throttle: ThrottleSettings,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
            })?;

        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let defaults = ReindexSettings::default();
        let rx_file = file.reindex.unwrap_or_default();
        let reindex = ReindexSettings {
            max_concurrency: rx_file
                .max_concurrency
                .or(cli.max_concurrency)
                .unwrap_or(defaults.max_concurrency),
            max_resources_per_page: rx_file
                .max_resources_per_page
                .or(cli.max_resources_per_page)
                .unwrap_or(defaults.max_resources_per_page),
            heartbeat_timeout_secs: rx_file
                .heartbeat_timeout_secs
                .unwrap_or(defaults.heartbeat_timeout_secs),
            consecutive_failure_threshold: rx_file
                .consecutive_failure_threshold
                .unwrap_or(defaults.consecutive_failure_threshold),
            max_commit_retries: rx_file
                .max_commit_retries
                .unwrap_or(defaults.max_commit_retries),
            poll_interval_ms: rx_file.poll_interval_ms.unwrap_or(defaults.poll_interval_ms),
            worker_idle_interval_secs: rx_file
                .worker_idle_interval_secs
                .unwrap_or(defaults.worker_idle_interval_secs),
        };
        validate_config(&reindex.job_config())?;

        let throttle_defaults = ThrottleSettings::default();
        let th_file = file.throttle.unwrap_or_default();
        let throttle = ThrottleSettings {
            enabled: th_file.enabled.unwrap_or(throttle_defaults.enabled),
            max_resources_per_minute: th_file
                .max_resources_per_minute
                .unwrap_or(throttle_defaults.max_resources_per_minute),
            min_delay_ms: th_file.min_delay_ms.unwrap_or(throttle_defaults.min_delay_ms),
        };
        if throttle.enabled && throttle.max_resources_per_minute == 0 {
            bail!("throttle.max_resources_per_minute must be positive when the throttle is enabled");
        }

        Ok(Self {
            db_dir,
            reindex,
            throttle,
        })
    }

    pub fn jobs_db_path(&self) -> PathBuf {
        self.db_dir.join("reindex_jobs.db")
    }

    pub fn resources_db_path(&self) -> PathBuf {
        self.db_dir.join("resources.db")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReindexSettings {
    pub max_concurrency: u32,
    pub max_resources_per_page: u64,
    pub heartbeat_timeout_secs: u64,
    pub consecutive_failure_threshold: u32,
    pub max_commit_retries: u32,
    pub poll_interval_ms: u64,
    pub worker_idle_interval_secs: u64,
}

impl Default for ReindexSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            max_resources_per_page: 100,
            heartbeat_timeout_secs: 600,
            consecutive_failure_threshold: 5,
            max_commit_retries: 5,
            poll_interval_ms: 1000,
            worker_idle_interval_secs: 10,
        }
    }
}

impl ReindexSettings {
    /// Limits stamped on jobs created from this configuration.
    pub fn job_config(&self) -> ReindexJobConfig {
        ReindexJobConfig {
            max_concurrency: self.max_concurrency,
            max_resources_per_page: self.max_resources_per_page,
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_secs),
            consecutive_failure_threshold: self.consecutive_failure_threshold,
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            max_commit_retries: self.max_commit_retries,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }

    pub fn worker_idle_interval(&self) -> Duration {
        Duration::from_secs(self.worker_idle_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottleSettings {
    pub enabled: bool,
    pub max_resources_per_minute: u64,
    pub min_delay_ms: u64,
}

impl Default for ThrottleSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_resources_per_minute: 50_000,
            min_delay_ms: 0,
        }
    }
}

impl ThrottleSettings {
    pub fn throttle_config(&self) -> ResourceRateThrottleConfig {
        ResourceRateThrottleConfig {
            max_resources_per_minute: self.max_resources_per_minute,
            min_delay: Duration::from_millis(self.min_delay_ms),
            enabled: self.enabled,
            ..Default::default()
        }
    }
}
