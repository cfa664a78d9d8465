//! Client configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/kvsync/config.toml)
//! 3. Environment variables (KVSYNC_* prefix)
//!
//! Environment variables take precedence over config file values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cache::{CachePolicy, MissPolicy, DEFAULT_SWEEP_INTERVAL};
use crate::connection::{ConnectionSettings, DEFAULT_RETRY_DELAY};
use crate::key::{Syntax, DEFAULT_MULTI_WILDCARD, DEFAULT_SEPARATOR, DEFAULT_WILDCARD};

/// Environment variable prefix
const ENV_PREFIX: &str = "KVSYNC";

/// Client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// URL scheme of the store endpoint
    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// Store hosts; the first one is used for the connection
    #[serde(default = "default_hosts")]
    pub hosts: Vec<String>,

    #[serde(default = "default_port")]
    pub port: u16,

    /// URL path of the store endpoint
    #[serde(default = "default_path")]
    pub path: String,

    #[serde(default)]
    pub auth_token: Option<String>,

    /// Retry after a failed or lost connection
    #[serde(default = "default_true")]
    pub automatic_reconnect: bool,

    /// Keepalive interval in seconds (optional)
    #[serde(default)]
    pub keepalive_secs: Option<u64>,

    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,

    /// Name reported to the store (optional)
    #[serde(default)]
    pub client_name: Option<String>,

    #[serde(default = "default_separator")]
    pub separator: char,

    #[serde(default = "default_wildcard")]
    pub wildcard: char,

    #[serde(default = "default_multi_wildcard")]
    pub multi_wildcard: char,

    /// Write logs to this file instead of stderr
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    #[serde(default)]
    pub cache: CacheConfig,
}

/// `[cache]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Entries older than this are refetched (optional)
    #[serde(default)]
    pub max_age_secs: Option<u64>,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Cache keys the store reports as missing
    #[serde(default = "default_true")]
    pub remember_misses: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_age_secs: None,
            sweep_interval_secs: default_sweep_interval_secs(),
            remember_misses: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scheme: default_scheme(),
            hosts: default_hosts(),
            port: default_port(),
            path: default_path(),
            auth_token: None,
            automatic_reconnect: true,
            keepalive_secs: None,
            reconnect_delay_secs: default_reconnect_delay_secs(),
            client_name: None,
            separator: DEFAULT_SEPARATOR,
            wildcard: DEFAULT_WILDCARD,
            multi_wildcard: DEFAULT_MULTI_WILDCARD,
            log_file: None,
            cache: CacheConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (KVSYNC_HOSTS, KVSYNC_PORT, ...)
    /// 2. Config file (~/.config/kvsync/config.toml or KVSYNC_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // KVSYNC_SCHEME
        if let Ok(val) = std::env::var(format!("{}_SCHEME", ENV_PREFIX)) {
            if !val.is_empty() {
                self.scheme = val;
            }
        }

        // KVSYNC_HOSTS (comma separated)
        if let Ok(val) = std::env::var(format!("{}_HOSTS", ENV_PREFIX)) {
            let hosts: Vec<String> = val
                .split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(String::from)
                .collect();
            if !hosts.is_empty() {
                self.hosts = hosts;
            }
        }

        // KVSYNC_PORT
        if let Ok(val) = std::env::var(format!("{}_PORT", ENV_PREFIX)) {
            match val.parse() {
                Ok(port) => self.port = port,
                Err(_) => warn!(value = %val, "Ignoring invalid {}_PORT", ENV_PREFIX),
            }
        }

        // KVSYNC_AUTH_TOKEN
        if let Ok(val) = std::env::var(format!("{}_AUTH_TOKEN", ENV_PREFIX)) {
            self.auth_token = if val.is_empty() { None } else { Some(val) };
        }

        // KVSYNC_AUTOMATIC_RECONNECT
        if let Ok(val) = std::env::var(format!("{}_AUTOMATIC_RECONNECT", ENV_PREFIX)) {
            self.automatic_reconnect = val.eq_ignore_ascii_case("true") || val == "1";
        }

        // KVSYNC_CLIENT_NAME
        if let Ok(val) = std::env::var(format!("{}_CLIENT_NAME", ENV_PREFIX)) {
            self.client_name = if val.is_empty() { None } else { Some(val) };
        }
    }

    /// Check values that serde cannot
    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            bail!("At least one host must be configured");
        }
        if !self.syntax().is_valid() {
            bail!(
                "Separator '{}', wildcard '{}' and multi-level wildcard '{}' must differ",
                self.separator,
                self.wildcard,
                self.multi_wildcard
            );
        }
        Ok(())
    }

    /// Save configuration to the default file
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_file_path())
    }

    /// Save configuration to a specific file
    pub fn save_to_path(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with KVSYNC_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("kvsync")
            .join("config.toml")
    }

    /// Endpoint URL for every configured host
    pub fn addresses(&self) -> Vec<String> {
        let path = self.path.trim_start_matches('/');
        self.hosts
            .iter()
            .map(|host| format!("{}://{}:{}/{}", self.scheme, host, self.port, path))
            .collect()
    }

    /// Settings for the connection manager, using the first host
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            address: self.addresses().into_iter().next(),
            auth_token: self.auth_token.clone(),
            keepalive: self.keepalive_secs.map(Duration::from_secs),
            client_name: self.client_name.clone(),
            automatic_reconnect: self.automatic_reconnect,
            retry_delay: Duration::from_secs(self.reconnect_delay_secs),
        }
    }

    pub fn syntax(&self) -> Syntax {
        Syntax {
            separator: self.separator,
            wildcard: self.wildcard,
            multi_wildcard: self.multi_wildcard,
        }
    }

    pub fn cache_policy(&self) -> CachePolicy {
        CachePolicy {
            misses: if self.cache.remember_misses {
                MissPolicy::Remember
            } else {
                MissPolicy::Requery
            },
            max_age: self.cache.max_age_secs.map(Duration::from_secs),
            sweep_interval: Duration::from_secs(self.cache.sweep_interval_secs),
        }
    }
}

fn default_scheme() -> String {
    "ws".to_string()
}

fn default_hosts() -> Vec<String> {
    vec!["localhost".to_string()]
}

fn default_port() -> u16 {
    8080
}

fn default_path() -> String {
    "/ws".to_string()
}

fn default_true() -> bool {
    true
}

fn default_reconnect_delay_secs() -> u64 {
    DEFAULT_RETRY_DELAY.as_secs()
}

fn default_separator() -> char {
    DEFAULT_SEPARATOR
}

fn default_wildcard() -> char {
    DEFAULT_WILDCARD
}

fn default_multi_wildcard() -> char {
    DEFAULT_MULTI_WILDCARD
}

fn default_sweep_interval_secs() -> u64 {
    DEFAULT_SWEEP_INTERVAL.as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;
    use tempfile::TempDir;

    // Mutex to serialize tests that touch environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Guard that locks env access and saves/restores env vars
    struct EnvGuard<'a> {
        _lock: std::sync::MutexGuard<'a, ()>,
        saved: Vec<(String, Option<String>)>,
    }

    impl<'a> EnvGuard<'a> {
        fn new(vars: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
            let saved = vars
                .iter()
                .map(|&name| (name.to_string(), env::var(name).ok()))
                .collect();
            // Clear all the vars
            for name in vars {
                env::remove_var(name);
            }
            Self { _lock: lock, saved }
        }
    }

    impl Drop for EnvGuard<'_> {
        fn drop(&mut self) {
            for (name, value) in &self.saved {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    const ENV_VARS: &[&str] = &[
        "KVSYNC_SCHEME",
        "KVSYNC_HOSTS",
        "KVSYNC_PORT",
        "KVSYNC_AUTH_TOKEN",
        "KVSYNC_AUTOMATIC_RECONNECT",
        "KVSYNC_CLIENT_NAME",
        "KVSYNC_CONFIG",
    ];

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.addresses(), vec!["ws://localhost:8080/ws"]);
        assert!(config.automatic_reconnect);
        assert_eq!(config.reconnect_delay_secs, 3);
        assert_eq!(config.syntax(), Syntax::default());
        assert!(config.cache.remember_misses);
    }

    #[test]
    fn test_connection_settings() {
        let config = Config {
            hosts: vec!["store-a".to_string(), "store-b".to_string()],
            auth_token: Some("secret".to_string()),
            keepalive_secs: Some(15),
            automatic_reconnect: false,
            client_name: Some("dashboard".to_string()),
            ..Config::default()
        };

        assert_eq!(
            config.addresses(),
            vec!["ws://store-a:8080/ws", "ws://store-b:8080/ws"]
        );

        let settings = config.connection_settings();
        assert_eq!(settings.address.as_deref(), Some("ws://store-a:8080/ws"));
        assert_eq!(settings.auth_token.as_deref(), Some("secret"));
        assert_eq!(settings.keepalive, Some(Duration::from_secs(15)));
        assert_eq!(settings.client_name.as_deref(), Some("dashboard"));
        assert!(!settings.automatic_reconnect);
        assert_eq!(settings.retry_delay, Duration::from_secs(3));
    }

    #[test]
    fn test_cache_policy() {
        let mut config = Config::default();
        assert_eq!(config.cache_policy(), CachePolicy::default());

        config.cache.max_age_secs = Some(30);
        config.cache.remember_misses = false;
        let policy = config.cache_policy();
        assert_eq!(policy.max_age, Some(Duration::from_secs(30)));
        assert_eq!(policy.misses, MissPolicy::Requery);
    }

    #[test]
    fn test_env_override_hosts_and_port() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("KVSYNC_HOSTS", "a.local, b.local,");
        env::set_var("KVSYNC_PORT", "9000");
        config.apply_env_overrides();

        assert_eq!(config.hosts, vec!["a.local", "b.local"]);
        assert_eq!(config.port, 9000);

        // Invalid port is ignored
        env::set_var("KVSYNC_PORT", "not-a-port");
        config.apply_env_overrides();
        assert_eq!(config.port, 9000);
    }

    #[test]
    fn test_env_override_automatic_reconnect() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("KVSYNC_AUTOMATIC_RECONNECT", "false");
        config.apply_env_overrides();
        assert!(!config.automatic_reconnect);

        env::set_var("KVSYNC_AUTOMATIC_RECONNECT", "1");
        config.apply_env_overrides();
        assert!(config.automatic_reconnect);
    }

    #[test]
    fn test_env_override_auth_token() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("KVSYNC_AUTH_TOKEN", "token-1");
        config.apply_env_overrides();
        assert_eq!(config.auth_token, Some("token-1".to_string()));

        // Empty string clears it
        env::set_var("KVSYNC_AUTH_TOKEN", "");
        config.apply_env_overrides();
        assert!(config.auth_token.is_none());
    }

    #[test]
    fn test_load_from_str() {
        let _guard = EnvGuard::new(ENV_VARS);

        let toml = r#"
            scheme = "wss"
            hosts = ["store.example.com"]
            port = 443
            separator = "."
            wildcard = "*"
            multi_wildcard = ">"

            [cache]
            max_age_secs = 60
        "#;

        let config = Config::load_from_str(toml).unwrap();
        assert_eq!(config.addresses(), vec!["wss://store.example.com:443/ws"]);
        assert_eq!(config.syntax().separator, '.');
        assert_eq!(config.cache.max_age_secs, Some(60));
        assert_eq!(config.cache.sweep_interval_secs, 1);
    }

    #[test]
    fn test_invalid_syntax_is_rejected() {
        let _guard = EnvGuard::new(ENV_VARS);

        let err = Config::load_from_str(r#"wildcard = "/""#).unwrap_err();
        assert!(err.to_string().contains("must differ"));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let _guard = EnvGuard::new(ENV_VARS);
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config {
            hosts: vec!["store".to_string()],
            client_name: Some("dashboard".to_string()),
            log_file: Some(PathBuf::from("/tmp/kvsync.log")),
            ..Config::default()
        };
        config.save_to_path(&path).unwrap();

        let loaded = Config::load_from_path(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_from_path_missing_file() {
        let _guard = EnvGuard::new(ENV_VARS);

        let path = PathBuf::from("/nonexistent/config.toml");
        let config = Config::load_from_path(&path).unwrap();
        // Should return defaults when file doesn't exist
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_config_file_path_override() {
        let _guard = EnvGuard::new(ENV_VARS);

        env::set_var("KVSYNC_CONFIG", "/etc/kvsync.toml");
        assert_eq!(Config::config_file_path(), PathBuf::from("/etc/kvsync.toml"));
    }
}
