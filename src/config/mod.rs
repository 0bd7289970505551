use anyhow::{Context, Result};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub feed: FeedConfig,
    pub storage: StorageConfig,
    pub pipeline: PipelineConfig,
    pub schedule: ScheduleConfig,
}

/// External price feed configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeedConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// data.gov.in API key; supply via `MANDI__FEED__API_KEY` or config/local.toml.
    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_page_size")]
    pub page_size: usize,

    #[serde(default = "default_max_pages")]
    pub max_pages: u32,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Pipeline configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// Only records whose state field equals this exactly are ingested.
    #[serde(default = "default_target_state")]
    pub target_state: String,
}

/// Scheduler configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScheduleConfig {
    /// Daily trigger as local wall-clock `HH:MM`.
    #[serde(default = "default_trigger_time")]
    pub trigger_time: String,

    #[serde(default = "default_true")]
    pub run_on_start: bool,
}

impl ScheduleConfig {
    pub fn trigger(&self) -> Result<NaiveTime> {
        NaiveTime::parse_from_str(&self.trigger_time, "%H:%M")
            .with_context(|| format!("invalid schedule.trigger_time {:?}", self.trigger_time))
    }
}

// ── Defaults ─────────────────────────────────────────────────────────────────

fn default_base_url() -> String {
    "https://api.data.gov.in/resource/9ef84268-d588-465a-a308-a864a43d0070".to_string()
}
fn default_page_size() -> usize {
    500
}
fn default_max_pages() -> u32 {
    40
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    500
}
fn default_user_agent() -> String {
    "mandi-etl/0.1 (agricultural price ingestion)".to_string()
}
fn default_db_path() -> PathBuf {
    PathBuf::from("data/mandi.duckdb")
}
fn default_target_state() -> String {
    "Tamil Nadu".to_string()
}
fn default_trigger_time() -> String {
    "04:00".to_string()
}
fn default_true() -> bool {
    true
}

// ── Loader ───────────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from file + environment overrides
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let cfg = config::Config::builder()
            .add_source(
                config::File::with_name("config/default")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::File::with_name("config/local")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(config::Environment::with_prefix("MANDI").separator("__"))
            .build()?;

        let app_cfg: AppConfig = cfg.try_deserialize().unwrap_or_else(|_| AppConfig::default());
        app_cfg.schedule.trigger()?;
        Ok(app_cfg)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            feed: FeedConfig {
                base_url: default_base_url(),
                api_key: String::new(),
                page_size: default_page_size(),
                max_pages: default_max_pages(),
                timeout_secs: default_timeout_secs(),
                max_retries: default_max_retries(),
                retry_base_ms: default_retry_base_ms(),
                user_agent: default_user_agent(),
            },
            storage: StorageConfig {
                db_path: default_db_path(),
                run_migrations: true,
            },
            pipeline: PipelineConfig {
                target_state: default_target_state(),
            },
            schedule: ScheduleConfig {
                trigger_time: default_trigger_time(),
                run_on_start: true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_trigger_parses() {
        let cfg = AppConfig::default();
        assert_eq!(
            cfg.schedule.trigger().unwrap(),
            NaiveTime::from_hms_opt(4, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_bad_trigger_time_rejected() {
        let sched = ScheduleConfig {
            trigger_time: "25:99".to_string(),
            run_on_start: true,
        };
        assert!(sched.trigger().is_err());
    }
}
