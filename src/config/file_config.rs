use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_dir: Option<String>,

    // Feature configs
    pub reindex: Option<ReindexConfig>,
    pub throttle: Option<ThrottleConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct ReindexConfig {
    pub max_concurrency: Option<u32>,
    pub max_resources_per_page: Option<u64>,
    pub heartbeat_timeout_secs: Option<u64>,
    pub consecutive_failure_threshold: Option<u32>,
    pub max_commit_retries: Option<u32>,
    pub poll_interval_ms: Option<u64>,
    pub worker_idle_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct ThrottleConfig {
    pub enabled: Option<bool>,
    pub max_resources_per_minute: Option<u64>,
    pub min_delay_ms: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
