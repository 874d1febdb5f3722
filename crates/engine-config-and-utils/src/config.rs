//! Configuration management for the entitlement sync host.

use crate::{CoreError, CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::path::Path;
use url::Url;

/// Default Supabase URL (can be overridden at compile time via SUPABASE_URL env var).
pub const DEFAULT_SUPABASE_URL: &str = match option_env!("SUPABASE_URL") {
    Some(url) => url,
    None => "https://random.supabase.co",
};

/// Default Supabase publishable key (can be overridden at compile time via SUPABASE_PUBLISHABLE_KEY env var).
pub const DEFAULT_SUPABASE_PUBLISHABLE_KEY: &str = match option_env!("SUPABASE_PUBLISHABLE_KEY") {
    Some(key) => key,
    None => "random-key",
};

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

const DEFAULT_BOOTSTRAP_URL_PATTERN: &str = "https://app.example.com/*";
const DEFAULT_BILLING_URL_PATTERN: &str = "https://app.example.com/billing*";

/// Poll intervals per auth tier, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Interval while signed out. Short so a sign-in elsewhere is picked up quickly.
    pub unauthenticated_secs: u64,
    /// Interval for a signed-in user without an active subscription.
    pub free_secs: u64,
    /// Interval for a signed-in user with an active subscription.
    pub premium_secs: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            unauthenticated_secs: 30,
            free_secs: 15 * 60,
            premium_secs: 5 * 60,
        }
    }
}

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Supabase project URL.
    #[serde(default = "default_supabase_url")]
    pub supabase_url: String,
    /// Supabase publishable API key (public, safe to expose).
    #[serde(default = "default_supabase_publishable_key")]
    pub supabase_publishable_key: String,
    /// Project reference used in browser storage keys. Derived from the
    /// Supabase host when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_ref: Option<String>,
    /// Tabs matching this pattern are scanned for an existing session.
    #[serde(default = "default_bootstrap_url_pattern")]
    pub bootstrap_url_pattern: String,
    /// Navigating to a page matching this pattern triggers a check.
    #[serde(default = "default_billing_url_pattern")]
    pub billing_url_pattern: String,
    #[serde(default)]
    pub poll: PollConfig,
    /// Tokens expiring within this window are refreshed before use.
    #[serde(default = "default_token_grace_secs")]
    pub token_grace_secs: u64,
    /// Identical entitlement payloads inside this window are not re-sent.
    #[serde(default = "default_broadcast_cooldown_ms")]
    pub broadcast_cooldown_ms: u64,
    #[serde(default = "default_max_scan_tabs")]
    pub max_scan_tabs: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// How often a long-lived context re-reads the store file for writes made
    /// by other processes.
    #[serde(default = "default_store_watch_ms")]
    pub store_watch_ms: u64,
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_supabase_url() -> String {
    DEFAULT_SUPABASE_URL.to_string()
}

fn default_supabase_publishable_key() -> String {
    DEFAULT_SUPABASE_PUBLISHABLE_KEY.to_string()
}

fn default_bootstrap_url_pattern() -> String {
    DEFAULT_BOOTSTRAP_URL_PATTERN.to_string()
}

fn default_billing_url_pattern() -> String {
    DEFAULT_BILLING_URL_PATTERN.to_string()
}

fn default_token_grace_secs() -> u64 {
    300
}

fn default_broadcast_cooldown_ms() -> u64 {
    1000
}

fn default_max_scan_tabs() -> usize {
    5
}

fn default_request_timeout_secs() -> u64 {
    15
}

fn default_store_watch_ms() -> u64 {
    1000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            supabase_url: default_supabase_url(),
            supabase_publishable_key: default_supabase_publishable_key(),
            project_ref: None,
            bootstrap_url_pattern: default_bootstrap_url_pattern(),
            billing_url_pattern: default_billing_url_pattern(),
            poll: PollConfig::default(),
            token_grace_secs: default_token_grace_secs(),
            broadcast_cooldown_ms: default_broadcast_cooldown_ms(),
            max_scan_tabs: default_max_scan_tabs(),
            request_timeout_secs: default_request_timeout_secs(),
            store_watch_ms: default_store_watch_ms(),
        }
    }
}

impl Config {
    /// Create a new Config with default values, then override from environment.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Load configuration from `<base>/config.json`, falling back to defaults,
    /// then apply environment overrides.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let config_path = paths.config_file();
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    /// Override configuration from environment variables.
    fn load_from_env(&mut self) {
        if let Ok(log_level) = std::env::var("ENTITLEMENT_LOG_LEVEL") {
            self.log_level = log_level;
        }
        if let Ok(url) = std::env::var("ENTITLEMENT_SUPABASE_URL") {
            if !url.trim().is_empty() {
                self.supabase_url = url;
            }
        }
        if let Ok(key) = std::env::var("ENTITLEMENT_SUPABASE_KEY") {
            if !key.trim().is_empty() {
                self.supabase_publishable_key = key;
            }
        }
    }

    fn validate(&self) -> CoreResult<()> {
        let poll = &self.poll;
        if poll.unauthenticated_secs == 0 || poll.free_secs == 0 || poll.premium_secs == 0 {
            return Err(CoreError::Config(
                "poll intervals must be greater than zero".to_string(),
            ));
        }
        if self.max_scan_tabs == 0 {
            return Err(CoreError::Config(
                "max_scan_tabs must be greater than zero".to_string(),
            ));
        }
        if self.store_watch_ms == 0 {
            return Err(CoreError::Config(
                "store_watch_ms must be greater than zero".to_string(),
            ));
        }
        self.supabase_url()?;
        Ok(())
    }

    /// Get the Supabase URL as a parsed URL.
    pub fn supabase_url(&self) -> CoreResult<Url> {
        Url::parse(&self.supabase_url).map_err(CoreError::from)
    }

    /// Project reference, either configured or taken from the first label of
    /// the Supabase host (`<ref>.supabase.co`).
    pub fn project_ref(&self) -> Option<String> {
        if let Some(project_ref) = self.project_ref.as_deref().filter(|r| !r.is_empty()) {
            return Some(project_ref.to_string());
        }
        let url = self.supabase_url().ok()?;
        let host = url.host_str()?;
        let (first, rest) = host.split_once('.')?;
        (!first.is_empty() && !rest.is_empty()).then(|| first.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
        assert_eq!(config.supabase_url, DEFAULT_SUPABASE_URL);
        assert_eq!(
            config.supabase_publishable_key,
            DEFAULT_SUPABASE_PUBLISHABLE_KEY
        );
        assert_eq!(config.poll.unauthenticated_secs, 30);
        assert_eq!(config.poll.free_secs, 900);
        assert_eq!(config.poll.premium_secs, 300);
        assert_eq!(config.token_grace_secs, 300);
        assert_eq!(config.max_scan_tabs, 5);
        assert_eq!(config.store_watch_ms, 1000);
    }

    #[test]
    fn test_config_load_from_file_partial() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");

        let config_json = r#"{
            "log_level": "debug",
            "poll": { "premium_secs": 60 }
        }"#;

        std::fs::write(&config_path, config_json).unwrap();

        let config = Config::load_from_file(&config_path).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.poll.premium_secs, 60);
        assert_eq!(config.poll.free_secs, 900);
        assert_eq!(config.broadcast_cooldown_ms, 1000);
    }

    #[test]
    fn test_config_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let mut config = Config::default();
        config.max_scan_tabs = 3;
        config.project_ref = Some("abcd".to_string());

        config.save(&paths).unwrap();

        let loaded = Config::load(&paths).unwrap();
        assert_eq!(loaded.max_scan_tabs, 3);
        assert_eq!(loaded.project_ref(), Some("abcd".to_string()));
    }

    #[test]
    fn test_config_load_nonexistent_uses_defaults() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let config = Config::load(&paths).unwrap();
        assert_eq!(config.poll, PollConfig::default());
    }

    #[test]
    fn test_config_rejects_zero_interval() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());
        paths.ensure_dirs().unwrap();
        std::fs::write(paths.config_file(), r#"{"poll": {"free_secs": 0}}"#).unwrap();

        assert!(matches!(Config::load(&paths), Err(CoreError::Config(_))));
    }

    #[test]
    fn test_project_ref_from_host() {
        let mut config = Config::default();
        config.supabase_url = "https://xyzproject.supabase.co".to_string();
        assert_eq!(config.project_ref(), Some("xyzproject".to_string()));

        config.supabase_url = "http://localhost:54321".to_string();
        assert_eq!(config.project_ref(), None);
    }

    #[test]
    fn test_config_invalid_url() {
        let mut config = Config::default();
        config.supabase_url = "not a valid url".to_string();

        assert!(config.supabase_url().is_err());
        assert_eq!(config.project_ref(), None);
    }
}
