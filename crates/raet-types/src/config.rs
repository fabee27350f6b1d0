//! Stack configuration types.
//!
//! All fields carry serde defaults so a partial TOML file (or none at all)
//! yields a usable configuration.

use crate::kinds::{AutoMode, BodyKind, HeadKind, RAET_PORT, UDP_MAX_PACKET_SIZE, UXD_MAX_PACKET_SIZE};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Top-level configuration for one road stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    /// Local estate name, unique among the peers of a controller.
    pub name: String,
    /// Address the UDP socket binds to.
    pub ha: SocketAddr,
    /// Whether this stack is the controller (accepts joins).
    pub main: bool,
    /// Application role advertised during Join. Remotes advertising the
    /// same non-empty role share one trust record on the controller.
    pub role: String,
    /// Application kind advertised during Join.
    pub kind: u8,
    /// Identity store directory. Defaults to `~/.raet/keep/<name>`.
    pub keep_dir: Option<PathBuf>,
    /// How unseen or changed remote identities are treated.
    pub auto_mode: AutoMode,
    /// Encoding of outgoing packet heads.
    pub head_kind: HeadKind,
    /// Serialization of outgoing message bodies.
    pub body_kind: BodyKind,
    /// Ceiling for one datagram; larger messages are segmented.
    pub max_packet_size: usize,
    /// Controller address used by `bootstrap()`.
    pub main_ha: Option<SocketAddr>,
    /// Resend schedule for initiator transactions.
    pub retry: RetryConfig,
    /// Transaction lifetimes.
    pub timeouts: TimeoutConfig,
    /// Local-socket (UXD) lane settings.
    pub lane: LaneConfig,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            name: "raet-node".to_string(),
            ha: SocketAddr::from(([0, 0, 0, 0], RAET_PORT)),
            main: false,
            role: String::new(),
            kind: 0,
            keep_dir: None,
            auto_mode: AutoMode::Never,
            head_kind: HeadKind::Json,
            body_kind: BodyKind::Json,
            max_packet_size: UDP_MAX_PACKET_SIZE,
            main_ha: None,
            retry: RetryConfig::default(),
            timeouts: TimeoutConfig::default(),
            lane: LaneConfig::default(),
        }
    }
}

impl StackConfig {
    /// Resolve the keep directory, falling back to `~/.raet/keep/<name>`.
    pub fn resolved_keep_dir(&self) -> PathBuf {
        self.keep_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".raet")
                .join("keep")
                .join(&self.name)
        })
    }
}

/// Configuration for resend behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of sends (including the first).
    pub max_attempts: u32,
    /// Delay before the first resend in milliseconds.
    pub min_delay_ms: u64,
    /// Maximum delay between resends in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            min_delay_ms: 500,
            max_delay_ms: 4_000,
        }
    }
}

/// Transaction lifetimes in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Lifetime of an ordinary transaction.
    pub transaction_ms: u64,
    /// Lifetime of a correspondent Join held pending an acceptance decision.
    pub pend_ms: u64,
    /// Maximum age of an Allow cookie.
    pub cookie_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            transaction_ms: 10_000,
            pend_ms: 300_000,
            cookie_ms: 5_000,
        }
    }
}

/// Local-socket lane configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LaneConfig {
    /// Directory holding the lane's unix datagram sockets.
    pub sock_dir: Option<PathBuf>,
    /// Ceiling for one page.
    pub page_size: usize,
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            sock_dir: None,
            page_size: UXD_MAX_PACKET_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StackConfig::default();
        assert_eq!(config.ha.port(), RAET_PORT);
        assert_eq!(config.auto_mode, AutoMode::Never);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.lane.page_size, UXD_MAX_PACKET_SIZE);
    }

    #[test]
    fn test_partial_toml() {
        let config: StackConfig = toml::from_str(
            r#"
name = "minion1"
auto_mode = "once"
head_kind = "binary"

[retry]
max_attempts = 2
"#,
        )
        .unwrap();
        assert_eq!(config.name, "minion1");
        assert_eq!(config.auto_mode, AutoMode::Once);
        assert_eq!(config.head_kind, HeadKind::Binary);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.min_delay_ms, 500);
        assert_eq!(config.timeouts.transaction_ms, 10_000);
    }

    #[test]
    fn test_keep_dir_override() {
        let config = StackConfig {
            keep_dir: Some(PathBuf::from("/tmp/keep")),
            ..Default::default()
        };
        assert_eq!(config.resolved_keep_dir(), PathBuf::from("/tmp/keep"));
        let default = StackConfig::default();
        assert!(default.resolved_keep_dir().ends_with("raet-node"));
    }
}
