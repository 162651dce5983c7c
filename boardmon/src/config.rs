//! Monitor configuration.
//!
//! Settings come from an optional JSON file, then environment variables
//! override individual values:
//!
//! - `BOARDMON_DROP_DELAY_MS`: grace period before a missing board is dropped
//! - `BOARDMON_BUCKETS`: hash bucket count of the device and interface indexes

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    filter::{DeviceFilter, DeviceMatch},
};

pub const DROP_DELAY_ENV: &str = "BOARDMON_DROP_DELAY_MS";
pub const BUCKETS_ENV: &str = "BOARDMON_BUCKETS";

/// Default grace period before a missing board is dropped.
pub const DEFAULT_DROP_DELAY: Duration = Duration::from_millis(7000);
pub const DEFAULT_BUCKETS: usize = 64;

/// Tunables of a [`Monitor`](crate::monitor::Monitor).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    /// Grace period for missing boards, in milliseconds in files
    #[serde(with = "millis")]
    pub drop_delay: Duration,

    /// Bucket count of the hash indexes
    pub buckets: usize,

    /// Device match rules; empty matches every device
    pub filter: Vec<DeviceMatch>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            drop_delay: DEFAULT_DROP_DELAY,
            buckets: DEFAULT_BUCKETS,
            filter: Vec::new(),
        }
    }
}

impl MonitorConfig {
    /// Load configuration from a JSON file. Missing keys keep their
    /// defaults.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Override values from the environment.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(ms) = env_number::<u64>(DROP_DELAY_ENV)? {
            self.drop_delay = Duration::from_millis(ms);
        }
        if let Some(buckets) = env_number::<usize>(BUCKETS_ENV)? {
            self.buckets = buckets;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.buckets == 0 {
            return Err(Error::Param("bucket count must be at least 1".into()));
        }
        self.device_filter().map(drop)
    }

    pub fn device_filter(&self) -> Result<DeviceFilter> {
        DeviceFilter::new(self.filter.clone())
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Param(format!("{name}: invalid value {value:?}"))),
        Err(_) => Ok(None),
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().try_into().unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceType;
    use serial_test::serial;
    use std::io::Write;

    fn clear_env() {
        std::env::remove_var(DROP_DELAY_ENV);
        std::env::remove_var(BUCKETS_ENV);
    }

    #[test]
    fn test_parse_partial_file() {
        let config: MonitorConfig = serde_json::from_str(
            r#"{"drop_delay": 250, "filter": [{"type": "serial"}, {"vid": "16c0", "pid": "0478"}]}"#,
        )
        .unwrap();
        assert_eq!(config.drop_delay, Duration::from_millis(250));
        assert_eq!(config.buckets, DEFAULT_BUCKETS);
        assert_eq!(config.filter[0], DeviceMatch::of_type(DeviceType::Serial));
        assert_eq!(config.filter[1], DeviceMatch::vid_pid(0x16c0, 0x0478));
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(serde_json::from_str::<MonitorConfig>(r#"{"drop_dealy": 5}"#).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("boardmon-config-{}.json", std::process::id()));
        std::fs::File::create(&path)
            .unwrap()
            .write_all(br#"{"buckets": 16}"#)
            .unwrap();

        let config = MonitorConfig::load_from(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.buckets, 16);
        assert_eq!(config.drop_delay, DEFAULT_DROP_DELAY);

        assert!(matches!(MonitorConfig::load_from(&path), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate() {
        let config = MonitorConfig {
            buckets: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Param(_))));

        let config = MonitorConfig {
            filter: vec![DeviceMatch {
                pid: Some(0x0483),
                ..DeviceMatch::any()
            }],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Param(_))));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        std::env::set_var(DROP_DELAY_ENV, "1500");
        std::env::set_var(BUCKETS_ENV, "32");

        let config = MonitorConfig::from_env().unwrap();
        assert_eq!(config.drop_delay, Duration::from_millis(1500));
        assert_eq!(config.buckets, 32);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_invalid_value() {
        clear_env();
        std::env::set_var(DROP_DELAY_ENV, "soon");
        assert!(matches!(MonitorConfig::from_env(), Err(Error::Param(_))));

        clear_env();
        std::env::set_var(BUCKETS_ENV, "0");
        assert!(matches!(MonitorConfig::from_env(), Err(Error::Param(_))));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_unset_keeps_defaults() {
        clear_env();
        assert_eq!(MonitorConfig::from_env().unwrap(), MonitorConfig::default());
    }
}
