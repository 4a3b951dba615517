//! Bridge configuration.
//!
//! Every field has a default matching the stock ports and timings, so an empty
//! JSON object is a valid config file.
//!
//! ```json
//! {"host":"127.0.0.1","request_port":50006,"response_port":50007,"host_pid":4242}
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{BridgeError, Result};

/// Default request channel port.
pub const DEFAULT_REQUEST_PORT: u16 = 50006;

/// Default response channel port.
pub const DEFAULT_RESPONSE_PORT: u16 = 50007;

/// Size of the single bounded read performed per message.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024;

/// Connection settings shared by both sides of the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub host: String,
    pub request_port: u16,
    /// `None` sends responses back over the request connection.
    pub response_port: Option<u16>,
    /// Host application process to watch; the worker quits when it exits.
    pub host_pid: Option<u32>,
    pub read_buffer_size: usize,
    /// Retry delay, watchdog cadence and receive timeout.
    pub poll_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub accept_timeout_ms: u64,
    /// Upper bound on waiting for each thread during stop.
    pub join_timeout_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            request_port: DEFAULT_REQUEST_PORT,
            response_port: Some(DEFAULT_RESPONSE_PORT),
            host_pid: None,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            poll_interval_ms: 1000,
            connect_timeout_ms: 3000,
            accept_timeout_ms: 1000,
            join_timeout_ms: 5000,
        }
    }
}

impl BridgeConfig {
    /// Load a JSON config file (supports `~` expansion).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = expand_path(path.as_ref());
        let content = fs::read_to_string(&path).map_err(|e| {
            BridgeError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: BridgeConfig = serde_json::from_str(&content).map_err(|e| {
            BridgeError::Config(format!("cannot parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `SD_BRIDGE_*` environment overrides.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(host) = std::env::var("SD_BRIDGE_HOST") {
            self.host = host;
        }
        if let Some(port) = env_number("SD_BRIDGE_REQUEST_PORT")? {
            self.request_port = port;
        }
        if let Ok(raw) = std::env::var("SD_BRIDGE_RESPONSE_PORT") {
            self.response_port = match raw.trim() {
                "" | "none" => None,
                value => Some(parse_number("SD_BRIDGE_RESPONSE_PORT", value)?),
            };
        }
        if let Some(pid) = env_number("SD_BRIDGE_HOST_PID")? {
            self.host_pid = Some(pid);
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(BridgeError::Config("host must not be empty".into()));
        }
        if self.read_buffer_size == 0 {
            return Err(BridgeError::Config("read_buffer_size must be positive".into()));
        }
        for (name, value) in [
            ("poll_interval_ms", self.poll_interval_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("accept_timeout_ms", self.accept_timeout_ms),
            ("join_timeout_ms", self.join_timeout_ms),
        ] {
            if value == 0 {
                return Err(BridgeError::Config(format!("{} must be positive", name)));
            }
        }
        if self.response_port == Some(self.request_port) && self.request_port != 0 {
            return Err(BridgeError::Config(format!(
                "request and response channels both use port {}",
                self.request_port
            )));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    /// `host:port` for the given port.
    pub fn addr(&self, port: u16) -> String {
        format!("{}:{}", self.host, port)
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => parse_number(key, raw.trim()).map(Some),
        Err(_) => Ok(None),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| BridgeError::Config(format!("{} is not a valid number: {:?}", key, raw)))
}

/// Expand `~` in path to home directory.
pub(crate) fn expand_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    let expanded = shellexpand::tilde(&path_str);
    PathBuf::from(expanded.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_stock_ports() {
        let config = BridgeConfig::default();
        assert_eq!(config.request_port, 50006);
        assert_eq!(config.response_port, Some(50007));
        assert_eq!(config.read_buffer_size, 1024);
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.connect_timeout(), Duration::from_secs(3));
        assert_eq!(config.accept_timeout(), Duration::from_secs(1));
        config.validate().unwrap();
    }

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"request_port": 6000, "host_pid": 99}}"#).unwrap();
        let config = BridgeConfig::load(file.path()).unwrap();
        assert_eq!(config.request_port, 6000);
        assert_eq!(config.host_pid, Some(99));
        assert_eq!(config.response_port, Some(DEFAULT_RESPONSE_PORT));
    }

    #[test]
    fn test_load_rejects_bad_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            BridgeConfig::load(file.path()),
            Err(BridgeError::Config(_))
        ));
    }

    #[test]
    fn test_validate_rejects_shared_port() {
        let config = BridgeConfig {
            response_port: Some(DEFAULT_REQUEST_PORT),
            ..BridgeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let config = BridgeConfig {
            poll_interval_ms: 0,
            ..BridgeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_expand_path() {
        let path = expand_path(Path::new("~/.sd-bridge/config.json"));
        assert!(!path.to_string_lossy().contains('~'));
    }
}
