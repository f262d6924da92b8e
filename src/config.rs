use std::{fs::File, io::BufReader, path::Path, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::sink::SinkConfig;

#[inline]
fn default_name_marker() -> String {
    "ESP32".to_string()
}
#[inline]
fn default_scan_timeout() -> Duration {
    Duration::from_secs(10)
}
#[inline]
fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}
#[inline]
fn default_characteristic() -> Option<Uuid> {
    Some(Uuid::from_u128(0xaaaaaaaa_bbbb_cccc_dddd_eeeeeeeeeee1))
}
#[inline]
fn default_event_capacity() -> usize {
    64
}
#[inline]
fn default_imbalance_threshold_mv() -> u16 {
    200
}
#[inline]
fn default_battery_id() -> String {
    "primary-battery-001".to_string()
}
#[inline]
fn default_sinks() -> Vec<SinkConfig> {
    vec![SinkConfig::Console]
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Substring an advertised name must contain to be listed
    // optional, default: ESP32
    #[serde(default = "default_name_marker")]
    pub name_marker: String,
    // Upper bound of a scan
    // optional, default: 10s
    #[serde(default = "default_scan_timeout", with = "humantime_serde")]
    pub scan_timeout: Duration,
    // Bound on link establishment, and separately on service discovery
    // optional, default: 10s
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    // Preferred telemetry characteristic, any notifiable one is used otherwise
    // optional, default: aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeee1
    #[serde(default = "default_characteristic")]
    pub characteristic: Option<Uuid>,
    // Capacity of each subscriber channel, oldest items are dropped beyond it
    // optional, default: 64
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    // Cell spread above which a reading is flagged
    // optional, default: 200
    #[serde(default = "default_imbalance_threshold_mv")]
    pub imbalance_threshold_mv: u16,
    // User or session identifier attached to forwarded readings
    // optional
    #[serde(default)]
    pub user: Option<String>,
    // Battery identifier attached to forwarded readings
    // optional, default: primary-battery-001
    #[serde(default = "default_battery_id")]
    pub battery_id: String,
    // Where readings go
    // optional, default: [Console]
    #[serde(default = "default_sinks")]
    pub sinks: Vec<SinkConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name_marker: default_name_marker(),
            scan_timeout: default_scan_timeout(),
            connect_timeout: default_connect_timeout(),
            characteristic: default_characteristic(),
            event_capacity: default_event_capacity(),
            imbalance_threshold_mv: default_imbalance_threshold_mv(),
            user: None,
            battery_id: default_battery_id(),
            sinks: default_sinks(),
        }
    }
}

impl Config {
    pub fn from_reader<R: std::io::Read>(reader: R) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_reader(reader).context("failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path`, or the defaults when the file does not exist.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let file = File::open(path)
            .with_context(|| format!("failed to open file {}", path.display()))?;
        Self::from_reader(BufReader::new(file))
            .with_context(|| format!("failed to load config file {}", path.display()))
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.name_marker.is_empty() {
            anyhow::bail!("name_marker must not be empty");
        }
        if self.event_capacity == 0 {
            anyhow::bail!("event_capacity must be at least 1");
        }
        if self.scan_timeout.is_zero() {
            anyhow::bail!("scan_timeout must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_document_uses_defaults() {
        let config = Config::from_reader("{}".as_bytes()).unwrap();
        assert_eq!(config.name_marker, "ESP32");
        assert_eq!(config.scan_timeout, Duration::from_secs(10));
        assert_eq!(config.event_capacity, 64);
        assert_eq!(config.battery_id, "primary-battery-001");
        assert!(config.user.is_none());
        assert_eq!(config.sinks.len(), 1);
    }

    #[test]
    fn durations_and_sinks_parse() {
        let yaml = "
name_marker: Mock-Streamer
scan_timeout: 30s
connect_timeout: 1500ms
characteristic: 0000ffe1-0000-1000-8000-00805f9b34fb
user: user@example.com
sinks:
  - Console
  - File:
      path: /tmp/readings.jsonl
";
        let config = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(config.name_marker, "Mock-Streamer");
        assert_eq!(config.scan_timeout, Duration::from_secs(30));
        assert_eq!(config.connect_timeout, Duration::from_millis(1500));
        assert_eq!(
            config.characteristic,
            Some(Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb))
        );
        assert_eq!(config.user.as_deref(), Some("user@example.com"));
        assert_eq!(config.sinks.len(), 2);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(Config::from_reader("name_marker: ''".as_bytes()).is_err());
        assert!(Config::from_reader("event_capacity: 0".as_bytes()).is_err());
        assert!(Config::from_reader("scan_timeout: 0s".as_bytes()).is_err());
        assert!(Config::from_reader("scan_timeout: soon".as_bytes()).is_err());
    }

    #[test]
    fn load_reads_file_or_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.yaml");
        assert_eq!(Config::load(&missing).unwrap().name_marker, "ESP32");

        let path = dir.path().join("cellwatch.yaml");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "battery_id: spare").unwrap();
        assert_eq!(Config::load(&path).unwrap().battery_id, "spare");
    }
}
