use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use gripsim_domain::{mode::SimulationMode, tree::DEFAULT_DEVICE_NAME};

pub const MIN_NOTIFY_INTERVAL: Duration = Duration::from_millis(100);
pub const MAX_NOTIFY_INTERVAL: Duration = Duration::from_secs(10);

/// GAP limit for the device name characteristic
const MAX_DEVICE_NAME_LEN: usize = 248;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("device name must not be empty")]
    EmptyDeviceName,
    #[error("device name is {0} bytes, at most 248 are allowed")]
    DeviceNameTooLong(usize),
    #[error("max_clients must be at least 1")]
    NoClientsAllowed,
    #[error("notify interval {} is outside 100ms..=10s", pretty(.0))]
    IntervalOutOfRange(Duration),
}

fn pretty(duration: &Duration) -> humantime::FormattedDuration {
    humantime::format_duration(*duration)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeripheralConfig {
    /// Local name broadcast while advertising
    pub device_name: String,
    pub max_clients: usize,
    #[serde(with = "humantime_duration")]
    pub notify_interval: Duration,
    /// Keep broadcasting while at least one client is connected
    pub advertise_while_connected: bool,
    /// Mode applied on start; `None` keeps the current one
    pub initial_mode: Option<SimulationMode>,
    /// Seed for reproducible readings; `None` draws from OS entropy
    pub seed: Option<u64>,
}

impl Default for PeripheralConfig {
    fn default() -> PeripheralConfig {
        PeripheralConfig {
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            max_clients: 4,
            notify_interval: Duration::from_secs(1),
            advertise_while_connected: false,
            initial_mode: None,
            seed: None,
        }
    }
}

impl PeripheralConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_name.trim().is_empty() {
            return Err(ConfigError::EmptyDeviceName);
        }
        if self.device_name.len() > MAX_DEVICE_NAME_LEN {
            return Err(ConfigError::DeviceNameTooLong(self.device_name.len()));
        }
        if self.max_clients == 0 {
            return Err(ConfigError::NoClientsAllowed);
        }
        if !(MIN_NOTIFY_INTERVAL..=MAX_NOTIFY_INTERVAL).contains(&self.notify_interval) {
            return Err(ConfigError::IntervalOutOfRange(self.notify_interval));
        }
        Ok(())
    }
}

mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(D::Error::custom)
    }
}
