use std::time::Duration;

use mac_address::MacAddress;
use serde_derive::Deserialize;

pub const DEFAULT_SCAN_INTERVAL_SECONDS: u64 = 5;
pub const DEFAULT_MISSED_INTERVALS: u32 = 2;
pub const DEFAULT_GRACE_PERIOD_SECONDS: u64 = 15;
pub const DEFAULT_PROMPT_TIMEOUT_SECONDS: u64 = 60;

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    pub devices: Option<Vec<KnownDevice>>,
    pub scan: Option<ScanConfig>,
    pub policy: Option<PolicyConfig>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub topic_path: Option<String>,
    pub keep_alive_seconds: Option<u64>,
}

/// A paired device whose connectivity implies vehicle proximity.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct KnownDevice {
    pub address: MacAddress,
    pub name: String,
    /// Overrides `always_assume_in_car` for this device when set.
    pub assume_occupied_on_connect: Option<bool>,
}

impl KnownDevice {
    /// Stable identifier used throughout the engine: the upper-case,
    /// colon-separated MAC, which is also how btleplug prints `BDAddr`.
    pub fn id(&self) -> String {
        self.address.to_string()
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ScanConfig {
    pub interval_seconds: Option<u64>,
    pub missed_intervals: Option<u32>,
}

impl ScanConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(
            self.interval_seconds
                .unwrap_or(DEFAULT_SCAN_INTERVAL_SECONDS)
                .max(1),
        )
    }

    pub fn missed_intervals(&self) -> u32 {
        self.missed_intervals.unwrap_or(DEFAULT_MISSED_INTERVALS).max(1)
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct PolicyConfig {
    pub auto_detection_enabled: Option<bool>,
    pub always_assume_in_car: Option<bool>,
    pub grace_period_seconds: Option<u64>,
    pub prompt_timeout_seconds: Option<u64>,
}
