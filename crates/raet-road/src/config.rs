//! Configuration loading from `~/.raet/raet.toml` with defaults.

use crate::keep::is_valid_role;
use raet_types::config::StackConfig;
use raet_types::kinds::UXD_MAX_PACKET_SIZE;
use raet_types::{RaetError, RaetResult};
use raet_wire::packet::MAX_HEAD_SIZE;
use std::path::{Path, PathBuf};
use tracing::info;

/// Smallest packet ceiling that still leaves room for a head, a neck and
/// some body.
const MIN_PACKET_SIZE: usize = MAX_HEAD_SIZE + 40 + 64;

/// Default config location: `~/.raet/raet.toml`.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".raet")
        .join("raet.toml")
}

/// Load stack configuration from a TOML file, with defaults.
///
/// A missing, unreadable or invalid file yields the default configuration.
pub fn load_config(path: Option<&Path>) -> StackConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if config_path.exists() {
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str::<StackConfig>(&contents) {
                Ok(config) => {
                    info!(path = %config_path.display(), "Loaded configuration");
                    return config;
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        path = %config_path.display(),
                        "Failed to parse config, using defaults"
                    );
                }
            },
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to read config file, using defaults"
                );
            }
        }
    } else {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
    }

    StackConfig::default()
}

/// Reject values a stack cannot run with.
pub fn validate_config(config: &StackConfig) -> RaetResult<()> {
    if config.name.is_empty() {
        return Err(RaetError::Config("name must not be empty".to_string()));
    }
    if config.max_packet_size < MIN_PACKET_SIZE {
        return Err(RaetError::Config(format!(
            "max_packet_size {} is below the minimum {MIN_PACKET_SIZE}",
            config.max_packet_size
        )));
    }
    if !config.role.is_empty() && !is_valid_role(&config.role) {
        return Err(RaetError::Config(format!("role {:?} is not a valid role name", config.role)));
    }
    if config.retry.max_attempts == 0 {
        return Err(RaetError::Config("retry.max_attempts must be at least 1".to_string()));
    }
    if config.retry.min_delay_ms > config.retry.max_delay_ms {
        return Err(RaetError::Config(
            "retry.min_delay_ms exceeds retry.max_delay_ms".to_string(),
        ));
    }
    if config.lane.page_size < 256 || config.lane.page_size > UXD_MAX_PACKET_SIZE {
        return Err(RaetError::Config(format!(
            "lane.page_size {} is outside 256..={UXD_MAX_PACKET_SIZE}",
            config.lane.page_size
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use raet_types::kinds::{AutoMode, BodyKind};

    #[test]
    fn test_load_config_missing_file() {
        let config = load_config(Some(Path::new("/nonexistent/raet.toml")));
        assert_eq!(config.name, "raet-node");
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_load_partial_config() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("raet.toml");
        std::fs::write(
            &path,
            r#"
name = "minion-1"
ha = "127.0.0.1:7540"
main_ha = "10.0.0.1:7530"
auto_mode = "once"
body_kind = "msgpack"

[retry]
max_attempts = 3

[timeouts]
cookie_ms = 2000
"#,
        )
        .unwrap();
        let config = load_config(Some(&path));
        assert_eq!(config.name, "minion-1");
        assert_eq!(config.ha.port(), 7540);
        assert_eq!(config.main_ha, Some("10.0.0.1:7530".parse().unwrap()));
        assert_eq!(config.auto_mode, AutoMode::Once);
        assert_eq!(config.body_kind, BodyKind::Msgpack);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.min_delay_ms, 500);
        assert_eq!(config.timeouts.cookie_ms, 2000);
        assert_eq!(config.timeouts.transaction_ms, 10_000);
    }

    #[test]
    fn test_invalid_file_falls_back() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("raet.toml");
        std::fs::write(&path, "name = [").unwrap();
        assert_eq!(load_config(Some(&path)).name, "raet-node");
    }

    #[test]
    fn test_validate_rejects_tiny_packets() {
        let config = StackConfig {
            max_packet_size: 200,
            ..Default::default()
        };
        assert!(matches!(validate_config(&config), Err(RaetError::Config(_))));
        let config = StackConfig {
            name: String::new(),
            ..Default::default()
        };
        assert!(validate_config(&config).is_err());
        let config = StackConfig {
            role: "../primary".into(),
            ..Default::default()
        };
        assert!(matches!(validate_config(&config), Err(RaetError::Config(_))));
        let mut config = StackConfig::default();
        config.lane.page_size = UXD_MAX_PACKET_SIZE * 2;
        assert!(matches!(validate_config(&config), Err(RaetError::Config(_))));
    }
}
