use std::io::Read;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::error::{Result, TapError};
use crate::filter::FilterId;
use crate::pool::DEFAULT_CAPACITY;
use crate::rules::{ActionKind, RuleId};

// The struct that will hold our application's configuration.
#[derive(Debug, Deserialize)]
pub struct Settings {
    pub log_level: String,
    /// YAML file with the listeners, rules, chains and devices to set up.
    pub table_file_path: String,
    #[serde(default = "default_capacity")]
    pub pool_capacity: usize,
    #[serde(default)]
    pub capture: CaptureSettings,
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,
}

fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}

fn default_report_interval() -> u64 {
    30
}

/// How interfaces are opened for capture.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    pub snaplen: usize,
    pub promiscuous: bool,
    pub read_timeout_ms: i32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        CaptureSettings {
            snaplen: 65535,
            promiscuous: true,
            read_timeout_ms: 1000,
        }
    }
}

impl CaptureSettings {
    /// Rejects capture parameters that would stall the pipeline. A read
    /// timeout of 0 makes pcap block until the next frame, so the capture
    /// thread would never notice the device stopping on a quiet interface.
    pub fn validate(&self) -> Result<()> {
        if self.snaplen == 0 {
            return Err(TapError::invalid("capture.snaplen must be at least 1"));
        }
        if self.read_timeout_ms <= 0 {
            return Err(TapError::invalid(format!(
                "capture.read_timeout_ms must be positive, got {}",
                self.read_timeout_ms
            )));
        }
        Ok(())
    }
}

impl Settings {
    /// Loads `config/default.toml`, overridden by `RTAP_*` environment
    /// variables (`RTAP_POOL_CAPACITY=32`, `RTAP_CAPTURE__SNAPLEN=2048`).
    pub fn new() -> std::result::Result<Self, ConfigError> {
        Self::from_file("config/default.toml")
    }

    pub fn from_file(path: &str) -> std::result::Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("RTAP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        // Build the configuration and deserialize it into the struct
        builder.build()?.try_deserialize()
    }

    /// Rejects settings the pipeline cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.pool_capacity == 0 {
            return Err(TapError::invalid("pool_capacity must be at least 1"));
        }
        self.capture.validate()
    }
}

/// Startup contents of the tap, applied in dependency order.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TapTable {
    pub listeners: Vec<ListenerEntry>,
    pub rules: Vec<RuleEntry>,
    pub chains: Vec<ChainEntry>,
    pub devices: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListenerEntry {
    pub id: u32,
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Deserialize)]
pub struct RuleEntry {
    pub id: RuleId,
    pub action: ActionKind,
    /// Listener id for `forward` rules.
    pub listener: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct ChainEntry {
    pub name: String,
    #[serde(default)]
    pub filters: Vec<FilterEntry>,
}

#[derive(Debug, Deserialize)]
pub struct FilterEntry {
    pub id: FilterId,
    #[serde(rename = "type")]
    pub layer: String,
    pub subtype: String,
    pub rule: RuleId,
    #[serde(default)]
    pub argument: String,
}

impl TapTable {
    pub fn from_reader(reader: impl Read) -> Result<Self> {
        Ok(serde_yaml::from_reader(reader)?)
    }

    pub fn load(path: &str) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = r#"
listeners:
  - id: 1
    address: 127.0.0.1
    port: 8888
rules:
  - id: 1
    action: forward
    listener: 1
  - id: 2
    action: drop
chains:
  - name: mgmt
    filters:
      - id: 10
        type: mac
        subtype: frame-control
        rule: 2
        argument: "0x0080"
      - id: 11
        type: all
        subtype: all
        rule: 1
devices:
  - wlan0mon
"#;

    #[test]
    fn test_table_parses() {
        // ACT
        let table = TapTable::from_reader(TABLE.as_bytes()).unwrap();

        // ASSERT
        assert_eq!(table.listeners.len(), 1);
        assert_eq!(table.rules[0].action, ActionKind::Forward);
        assert_eq!(table.rules[0].listener, Some(1));
        assert_eq!(table.rules[1].listener, None);
        assert_eq!(table.chains[0].filters[0].layer, "mac");
        assert_eq!(table.chains[0].filters[1].argument, "");
        assert_eq!(table.devices, vec!["wlan0mon".to_string()]);
    }

    #[test]
    fn test_empty_table_is_valid() {
        let table = TapTable::from_reader("{}".as_bytes()).unwrap();

        assert!(table.rules.is_empty());
        assert!(table.devices.is_empty());
    }

    #[test]
    fn test_unknown_action_is_rejected() {
        let yaml = "rules:\n  - id: 1\n    action: mirror\n";

        assert!(TapTable::from_reader(yaml.as_bytes()).is_err());
    }

    fn settings(pool_capacity: usize, capture: CaptureSettings) -> Settings {
        Settings {
            log_level: "info".to_string(),
            table_file_path: "config/tap.yaml".to_string(),
            pool_capacity,
            capture,
            report_interval_secs: 30,
        }
    }

    #[test]
    fn test_zero_capacity_fails_validation() {
        let settings = settings(0, CaptureSettings::default());

        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_non_positive_read_timeout_fails_validation() {
        for read_timeout_ms in [0, -1] {
            let capture = CaptureSettings {
                read_timeout_ms,
                ..CaptureSettings::default()
            };

            let err = settings(16, capture).validate().unwrap_err();

            assert!(
                matches!(err, TapError::InvalidArgument(_)),
                "read_timeout_ms = {} must be rejected",
                read_timeout_ms
            );
        }
        assert!(settings(16, CaptureSettings { read_timeout_ms: 1, ..CaptureSettings::default() })
            .validate()
            .is_ok());
    }

    #[test]
    fn test_default_config_file_loads() {
        let settings = Settings::from_file(concat!(env!("CARGO_MANIFEST_DIR"), "/config/default.toml")).unwrap();

        assert_eq!(settings.pool_capacity, 16);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_shipped_table_loads() {
        let table = TapTable::load(concat!(env!("CARGO_MANIFEST_DIR"), "/config/tap.yaml")).unwrap();

        assert_eq!(table.chains.len(), 2);
        assert_eq!(table.chains[0].filters[1].argument, "0x0040");
    }
}
