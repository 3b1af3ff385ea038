// Scan configuration, stored per schedule as a JSON document

use crate::error::{MuncherError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_MAX_DEPTH: usize = 3;
pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_BROWSER_SESSIONS: usize = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanConfig {
    #[serde(alias = "domains", deserialize_with = "one_or_many")]
    pub seeds: Vec<String>,

    #[serde(default)]
    pub domain_only: bool,

    #[serde(alias = "depth", default = "default_max_depth")]
    pub max_depth: usize,

    /// Per-worker pause between fetches.
    #[serde(default)]
    pub request_delay_ms: u64,

    #[serde(default)]
    pub user_agent: Option<String>,

    #[serde(default)]
    pub silent: bool,

    #[serde(default = "default_logs_folder")]
    pub logs_folder: PathBuf,

    #[serde(default = "default_output_folder")]
    pub output_folder: PathBuf,

    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_browser_sessions")]
    pub browser_sessions: usize,

    #[serde(default = "default_navigation_timeout_secs")]
    pub navigation_timeout_secs: u64,

    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,

    /// Cache "no record" answers from the knowledge source too.
    #[serde(default)]
    pub cache_unknown: bool,
}

fn default_max_depth() -> usize {
    DEFAULT_MAX_DEPTH
}

fn default_logs_folder() -> PathBuf {
    PathBuf::from("logs")
}

fn default_output_folder() -> PathBuf {
    PathBuf::from("output")
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

fn default_browser_sessions() -> usize {
    DEFAULT_BROWSER_SESSIONS
}

fn default_navigation_timeout_secs() -> u64 {
    30
}

fn default_settle_ms() -> u64 {
    1000
}

/// Older configs store a single seed as a plain string.
fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(seed) => vec![seed],
        OneOrMany::Many(seeds) => seeds,
    })
}

impl ScanConfig {
    pub fn new(seeds: Vec<String>) -> Self {
        Self {
            seeds,
            domain_only: false,
            max_depth: DEFAULT_MAX_DEPTH,
            request_delay_ms: 0,
            user_agent: None,
            silent: false,
            logs_folder: default_logs_folder(),
            output_folder: default_output_folder(),
            workers: DEFAULT_WORKERS,
            browser_sessions: DEFAULT_BROWSER_SESSIONS,
            navigation_timeout_secs: default_navigation_timeout_secs(),
            settle_ms: default_settle_ms(),
            cache_unknown: false,
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: ScanConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Seed URLs themselves are checked when the frontier is built.
    pub fn validate(&self) -> Result<()> {
        if self.seeds.iter().all(|s| s.trim().is_empty()) {
            return Err(MuncherError::Config("at least one seed URL is required".to_string()));
        }
        if self.workers == 0 {
            return Err(MuncherError::Config("workers must be at least 1".to_string()));
        }
        if self.browser_sessions == 0 {
            return Err(MuncherError::Config("browser_sessions must be at least 1".to_string()));
        }
        if self.navigation_timeout_secs == 0 {
            return Err(MuncherError::Config(
                "navigation_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_secs(self.navigation_timeout_secs)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    /// `None` for silent scans, which keep no log file.
    pub fn log_file_path(&self, schedule_id: i64, at: DateTime<Utc>) -> Option<PathBuf> {
        if self.silent {
            return None;
        }
        Some(self.logs_folder.join(artifact_name(schedule_id, at, "log")))
    }

    pub fn output_file_path(&self, schedule_id: i64, at: DateTime<Utc>) -> PathBuf {
        self.output_folder.join(artifact_name(schedule_id, at, "csv"))
    }
}

fn artifact_name(schedule_id: i64, at: DateTime<Utc>, extension: &str) -> String {
    format!(
        "cookies_schedule_{}_{}.{}",
        schedule_id,
        at.format("%Y-%m-%d_%H.%M.%S"),
        extension
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_legacy_config_keys() {
        let json = r#"{
            "domain_only": false,
            "depth": 3,
            "domains": "https://animetake.tv",
            "silent": true,
            "log_file": "",
            "output_file": "",
            "logs_folder": "logs",
            "output_folder": "output"
        }"#;

        let config = ScanConfig::from_json(json).unwrap();
        assert_eq!(config.seeds, vec!["https://animetake.tv"]);
        assert_eq!(config.max_depth, 3);
        assert!(config.silent);
        assert_eq!(config.workers, DEFAULT_WORKERS);
        assert!(!config.cache_unknown);
    }

    #[test]
    fn test_round_trip_keeps_every_field() {
        let mut config = ScanConfig::new(vec!["https://site.test/".to_string()]);
        config.domain_only = true;
        config.request_delay_ms = 250;
        config.user_agent = Some("muncher-test".to_string());
        config.cache_unknown = true;

        let loaded = ScanConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_empty_seeds_are_rejected() {
        assert!(matches!(
            ScanConfig::from_json(r#"{"seeds": []}"#),
            Err(MuncherError::Config(_))
        ));
        assert!(matches!(
            ScanConfig::from_json(r#"{"domains": "  "}"#),
            Err(MuncherError::Config(_))
        ));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let json = r#"{"seeds": ["https://site.test/"], "workers": 0}"#;
        assert!(ScanConfig::from_json(json).is_err());
    }

    #[test]
    fn test_missing_seeds_is_json_error() {
        assert!(matches!(
            ScanConfig::from_json(r#"{"depth": 2}"#),
            Err(MuncherError::Json(_))
        ));
    }

    #[test]
    fn test_artifact_paths() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 13, 45, 9).unwrap();
        let mut config = ScanConfig::new(vec!["https://site.test/".to_string()]);
        config.logs_folder = PathBuf::from("/tmp/logs");

        assert_eq!(
            config.log_file_path(7, at).unwrap(),
            PathBuf::from("/tmp/logs/cookies_schedule_7_2024-05-01_13.45.09.log")
        );

        config.silent = true;
        assert!(config.log_file_path(7, at).is_none());
        assert!(
            config
                .output_file_path(7, at)
                .ends_with("cookies_schedule_7_2024-05-01_13.45.09.csv")
        );
    }
}
