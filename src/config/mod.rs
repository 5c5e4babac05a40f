use std::{fs, path::Path, time::Duration};

use serde::Deserialize;

use crate::core::error::SyncError;
use crate::core::view::validate_limit;

pub const DEFAULT_CONFIG_PATH: &str = "config/socwatch.toml";
pub const TOKEN_ENV: &str = "SOCWATCH_TOKEN";
pub const API_KEY_ENV: &str = "SOCWATCH_API_KEY";

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub base_url: String,
    pub events_page_size: u64,
    pub alerts_page_size: u64,
    pub rules_page_size: u64,
    pub summary_interval_secs: u64,
    pub request_timeout_ms: Option<u64>,
    pub user_agent: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        default_config()
    }
}

impl AppConfig {
    pub fn summary_interval(&self) -> Duration {
        Duration::from_secs(self.summary_interval_secs)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.base_url.trim().is_empty() {
            return Err(SyncError::Config("base_url must not be empty".into()));
        }
        for (key, size) in [
            ("events_page_size", self.events_page_size),
            ("alerts_page_size", self.alerts_page_size),
            ("rules_page_size", self.rules_page_size),
        ] {
            validate_limit(size).map_err(|e| SyncError::Config(format!("{}: {}", key, e)))?;
        }
        if self.summary_interval_secs == 0 {
            return Err(SyncError::Config(
                "summary_interval_secs must be at least 1".into(),
            ));
        }
        if self.request_timeout_ms == Some(0) {
            return Err(SyncError::Config(
                "request_timeout_ms must be positive when set".into(),
            ));
        }
        Ok(())
    }
}

/// Load from `path` (or the default location). A missing file yields defaults.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, SyncError> {
    let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));

    if !path.exists() {
        return Ok(default_config());
    }

    let content = fs::read_to_string(path).map_err(|e| SyncError::Config(e.to_string()))?;
    let cfg: AppConfig =
        toml::from_str(&content).map_err(|e| SyncError::Config(e.to_string()))?;
    cfg.validate()?;
    Ok(cfg)
}

pub fn default_config() -> AppConfig {
    AppConfig {
        base_url: "http://127.0.0.1:8000".to_string(),
        events_page_size: 25,
        alerts_page_size: 50,
        rules_page_size: 50,
        summary_interval_secs: 15,
        request_timeout_ms: None,
        user_agent: concat!("socwatch/", env!("CARGO_PKG_VERSION")).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let cfg = load_config(Some(Path::new("does/not/exist.toml"))).unwrap();
        assert_eq!(cfg, default_config());
        assert_eq!(cfg.summary_interval(), Duration::from_secs(15));
        assert!(cfg.request_timeout().is_none());
    }

    #[test]
    fn partial_toml_keeps_remaining_defaults() {
        let cfg: AppConfig = toml::from_str(
            r#"
            base_url = "https://soc.example.org"
            events_page_size = 10
            request_timeout_ms = 2500
            "#,
        )
        .unwrap();
        assert_eq!(cfg.base_url, "https://soc.example.org");
        assert_eq!(cfg.events_page_size, 10);
        assert_eq!(cfg.alerts_page_size, 50);
        assert_eq!(cfg.request_timeout(), Some(Duration::from_millis(2500)));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_zero_interval_and_oversized_pages() {
        let mut cfg = default_config();
        cfg.summary_interval_secs = 0;
        assert!(matches!(cfg.validate(), Err(SyncError::Config(_))));

        let mut cfg = default_config();
        cfg.rules_page_size = 501;
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("rules_page_size"));
    }

    #[test]
    fn invalid_file_is_a_config_error() {
        let dir = std::env::temp_dir().join(format!("socwatch-cfg-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bad.toml");
        fs::write(&path, "events_page_size = \"many\"").unwrap();
        assert!(matches!(
            load_config(Some(&path)),
            Err(SyncError::Config(_))
        ));
        let _ = fs::remove_dir_all(&dir);
    }
}
