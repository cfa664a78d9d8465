//! Config command handlers

use std::path::Path;

use anyhow::{bail, Context, Result};

use kvsync_core::Config;

use crate::output::{Output, OutputFormat};

const VALID_KEYS: &str = "scheme, hosts, port, path, auth_token, automatic_reconnect, \
     keepalive_secs, reconnect_delay_secs, client_name, separator, wildcard, multi_wildcard, \
     log_file, cache.max_age_secs, cache.sweep_interval_secs, cache.remember_misses";

/// Show current configuration
pub fn show(config_path: &Path, output: &Output) -> Result<()> {
    let config = Config::load_from_path(config_path).context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "addresses": config.addresses(),
                    "auth_token": config.auth_token.as_ref().map(|_| "(set)"),
                    "automatic_reconnect": config.automatic_reconnect,
                    "keepalive_secs": config.keepalive_secs,
                    "reconnect_delay_secs": config.reconnect_delay_secs,
                    "client_name": config.client_name,
                    "separator": config.separator,
                    "wildcard": config.wildcard,
                    "multi_wildcard": config.multi_wildcard,
                    "log_file": config.log_file,
                    "cache": {
                        "max_age_secs": config.cache.max_age_secs,
                        "sweep_interval_secs": config.cache.sweep_interval_secs,
                        "remember_misses": config.cache.remember_misses
                    }
                })
            );
        }
        OutputFormat::Quiet => {
            for address in config.addresses() {
                println!("{}", address);
            }
        }
        OutputFormat::Human => {
            println!("Configuration:");
            println!("  addresses:            {}", config.addresses().join(", "));
            println!(
                "  auth_token:           {}",
                if config.auth_token.is_some() {
                    "(set)"
                } else {
                    "(not set)"
                }
            );
            println!("  automatic_reconnect:  {}", config.automatic_reconnect);
            println!(
                "  keepalive_secs:       {}",
                optional(config.keepalive_secs.map(|s| s.to_string()))
            );
            println!("  reconnect_delay_secs: {}", config.reconnect_delay_secs);
            println!(
                "  client_name:          {}",
                optional(config.client_name.clone())
            );
            println!(
                "  syntax:               separator '{}', wildcard '{}', multi-level '{}'",
                config.separator, config.wildcard, config.multi_wildcard
            );
            println!(
                "  log_file:             {}",
                optional(config.log_file.as_ref().map(|p| p.display().to_string()))
            );
            println!(
                "  cache.max_age_secs:   {}",
                optional(config.cache.max_age_secs.map(|s| s.to_string()))
            );
            println!(
                "  cache.sweep_interval: {}s",
                config.cache.sweep_interval_secs
            );
            println!("  cache.remember_misses: {}", config.cache.remember_misses);
            println!();
            println!("Config file: {}", config_path.display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(key: String, value: String, config_path: &Path, output: &Output) -> Result<()> {
    let mut config = Config::load_from_path(config_path).context("Failed to load configuration")?;

    apply(&mut config, &key, &value)?;
    config.validate()?;

    config
        .save_to_path(config_path)
        .context("Failed to save configuration")?;

    output.success(&format!("Set {} = {}", key, value));

    Ok(())
}

fn apply(config: &mut Config, key: &str, value: &str) -> Result<()> {
    match key {
        "scheme" => config.scheme = value.to_string(),
        "hosts" => {
            config.hosts = value
                .split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(String::from)
                .collect();
        }
        "port" => {
            config.port = value
                .parse()
                .context("Invalid value for port. Use a number between 0 and 65535.")?;
        }
        "path" => config.path = value.to_string(),
        "auth_token" => config.auth_token = optional_value(value),
        "automatic_reconnect" => {
            config.automatic_reconnect = value
                .parse()
                .context("Invalid value for automatic_reconnect. Use 'true' or 'false'.")?;
        }
        "keepalive_secs" => {
            config.keepalive_secs = optional_value(value)
                .map(|v| v.parse::<u64>())
                .transpose()
                .context("Invalid value for keepalive_secs. Use a number of seconds.")?;
        }
        "reconnect_delay_secs" => {
            config.reconnect_delay_secs = value
                .parse()
                .context("Invalid value for reconnect_delay_secs. Use a number of seconds.")?;
        }
        "client_name" => config.client_name = optional_value(value),
        "separator" => config.separator = single_char(key, value)?,
        "wildcard" => config.wildcard = single_char(key, value)?,
        "multi_wildcard" => config.multi_wildcard = single_char(key, value)?,
        "log_file" => config.log_file = optional_value(value).map(Into::into),
        "cache.max_age_secs" => {
            config.cache.max_age_secs = optional_value(value)
                .map(|v| v.parse::<u64>())
                .transpose()
                .context("Invalid value for cache.max_age_secs. Use a number of seconds.")?;
        }
        "cache.sweep_interval_secs" => {
            config.cache.sweep_interval_secs = value
                .parse()
                .context("Invalid value for cache.sweep_interval_secs. Use a number of seconds.")?;
        }
        "cache.remember_misses" => {
            config.cache.remember_misses = value
                .parse()
                .context("Invalid value for cache.remember_misses. Use 'true' or 'false'.")?;
        }
        _ => {
            bail!(
                "Unknown configuration key: '{}'\nValid keys: {}",
                key,
                VALID_KEYS
            );
        }
    }
    Ok(())
}

/// Empty or "none" clears an optional value
fn optional_value(value: &str) -> Option<String> {
    if value.is_empty() || value == "none" {
        None
    } else {
        Some(value.to_string())
    }
}

fn single_char(key: &str, value: &str) -> Result<char> {
    let mut chars = value.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Ok(c),
        _ => bail!("Invalid value for {}. Use a single character.", key),
    }
}

fn optional(value: Option<String>) -> String {
    value.unwrap_or_else(|| "(not set)".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn quiet() -> Output {
        Output::new(OutputFormat::Quiet)
    }

    #[test]
    fn test_set_writes_config_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        set("port".to_string(), "9090".to_string(), &path, &quiet()).unwrap();
        set(
            "hosts".to_string(),
            "a.local, b.local".to_string(),
            &path,
            &quiet(),
        )
        .unwrap();
        set(
            "cache.max_age_secs".to_string(),
            "30".to_string(),
            &path,
            &quiet(),
        )
        .unwrap();

        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.hosts, vec!["a.local", "b.local"]);
        assert_eq!(config.cache.max_age_secs, Some(30));
    }

    #[test]
    fn test_none_clears_optional_values() {
        let mut config = Config::default();
        apply(&mut config, "client_name", "dashboard").unwrap();
        assert_eq!(config.client_name.as_deref(), Some("dashboard"));

        apply(&mut config, "client_name", "none").unwrap();
        assert!(config.client_name.is_none());

        apply(&mut config, "keepalive_secs", "20").unwrap();
        assert_eq!(config.keepalive_secs, Some(20));
        apply(&mut config, "keepalive_secs", "").unwrap();
        assert!(config.keepalive_secs.is_none());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut config = Config::default();
        assert!(apply(&mut config, "port", "eighty").is_err());
        assert!(apply(&mut config, "separator", "::").is_err());
        assert!(apply(&mut config, "automatic_reconnect", "maybe").is_err());

        let err = apply(&mut config, "nonsense", "1").unwrap_err();
        assert!(err.to_string().contains("Unknown configuration key"));
    }

    #[test]
    fn test_clashing_syntax_is_not_saved() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        assert!(set("separator".to_string(), "#".to_string(), &path, &quiet()).is_err());
        assert!(!path.exists());
    }
}
