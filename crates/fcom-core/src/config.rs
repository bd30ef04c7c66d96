//! Configuration for an FCOM runtime instance.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $FCOM_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/fcom/config.toml
//!   3. ~/.config/fcom/config.toml
//!
//! The environment names (`FCOM_MC_PREFIX`, `FCOM_MC_IFADDR`) are the
//! ones facility tooling already exports, so a process can usually be
//! pointed at the right fabric without any file at all.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Runtime configuration. `Fcom::init(prefix, n_bufs)` is shorthand for
/// filling in the two fields that have no useful global default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FcomConfig {
    /// Multicast prefix spec, `"<ip>[:<port>]"`. No default; every
    /// facility assigns its own prefix.
    pub mc_prefix: String,

    /// Dotted address of the interface to receive and join on.
    /// Empty = kernel default (routing table / single NIC).
    pub mc_interface: String,

    /// Number of payload buffers to create, distributed over the size
    /// classes by weight. 0 = send-only instance (no receive runtime).
    pub n_bufs: u32,

    /// Receiver thread priority as a percentile of the platform's
    /// real-time range.
    pub rx_priority_percent: u8,

    /// Receiver poll timeout in milliseconds; this bounds how long the
    /// shutdown flag can go unchecked.
    pub rx_poll_ms: u32,
}

impl Default for FcomConfig {
    fn default() -> Self {
        Self {
            mc_prefix: String::new(),
            mc_interface: String::new(),
            n_bufs: 1000,
            rx_priority_percent: 80,
            rx_poll_ms: 500,
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl FcomConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            FcomConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("FCOM_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Apply FCOM_* env var overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("FCOM_MC_PREFIX") {
            self.mc_prefix = v;
        }
        if let Ok(v) = std::env::var("FCOM_MC_IFADDR") {
            self.mc_interface = v;
        }
        if let Ok(v) = std::env::var("FCOM_N_BUFS") {
            if let Ok(n) = v.parse() {
                self.n_bufs = n;
            }
        }
        if let Ok(v) = std::env::var("FCOM_RX_PRIORITY_PERCENT") {
            if let Ok(p) = v.parse() {
                self.rx_priority_percent = p;
            }
        }
    }
}

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_or_tmp().join(".config"))
        .join("fcom")
}

fn home_or_tmp() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = FcomConfig::default();
        assert_eq!(c.n_bufs, 1000);
        assert_eq!(c.rx_priority_percent, 80);
        assert_eq!(c.rx_poll_ms, 500);
        assert!(c.mc_prefix.is_empty());
    }

    #[test]
    fn parses_partial_toml() {
        let c: FcomConfig =
            toml::from_str("mc_prefix = \"239.255.0.0:4586\"\nn_bufs = 50\n").unwrap();
        assert_eq!(c.mc_prefix, "239.255.0.0:4586");
        assert_eq!(c.n_bufs, 50);
        // untouched fields keep their defaults
        assert_eq!(c.rx_poll_ms, 500);
    }
}
