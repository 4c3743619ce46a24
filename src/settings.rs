//! The settings collaborator: device list and detection policy flags.
//!
//! The engine never reads flags from ambient state. It asks a
//! [`SettingsSource`] for a [`Policy`] value at session start and carries that
//! value until the next checkpoint.

use std::path::PathBuf;
use std::time::Duration;

use log::{debug, warn};
use serde_derive::Deserialize;

use crate::config::{
    DEFAULT_GRACE_PERIOD_SECONDS, DEFAULT_PROMPT_TIMEOUT_SECONDS, KnownDevice, PolicyConfig,
};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("unable to read settings from {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("unable to parse settings: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("no presence devices configured")]
    NoDevices,
}

/// Detection policy, fixed for the duration of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    pub auto_detection_enabled: bool,
    pub always_assume_in_car: bool,
    pub grace_period: Duration,
    pub prompt_timeout: Duration,
    pub known_devices: Vec<KnownDevice>,
}

impl Policy {
    pub fn from_config(config: &PolicyConfig, known_devices: Vec<KnownDevice>) -> Self {
        Policy {
            auto_detection_enabled: config.auto_detection_enabled.unwrap_or(true),
            always_assume_in_car: config.always_assume_in_car.unwrap_or(false),
            grace_period: Duration::from_secs(
                config
                    .grace_period_seconds
                    .unwrap_or(DEFAULT_GRACE_PERIOD_SECONDS),
            ),
            prompt_timeout: Duration::from_secs(
                config
                    .prompt_timeout_seconds
                    .unwrap_or(DEFAULT_PROMPT_TIMEOUT_SECONDS),
            ),
            known_devices,
        }
    }

    /// Used when the settings store cannot be read: always prompt, default
    /// to occupied if the prompt goes unanswered, keep watching the devices
    /// we already knew about.
    pub fn fail_safe(known_devices: Vec<KnownDevice>) -> Self {
        Policy {
            auto_detection_enabled: true,
            always_assume_in_car: false,
            grace_period: Duration::from_secs(DEFAULT_GRACE_PERIOD_SECONDS),
            prompt_timeout: Duration::from_secs(DEFAULT_PROMPT_TIMEOUT_SECONDS),
            known_devices,
        }
    }

    pub fn device(&self, device_id: &str) -> Option<&KnownDevice> {
        self.known_devices.iter().find(|d| d.id() == device_id)
    }

    /// Whether a `connected` event from this device confirms occupancy
    /// without asking.
    pub fn assume_on_connect(&self, device_id: &str) -> bool {
        self.device(device_id)
            .and_then(|d| d.assume_occupied_on_connect)
            .unwrap_or(self.always_assume_in_car)
    }
}

pub trait SettingsSource: Send {
    fn load(&self) -> Result<Policy, SettingsError>;
}

/// Load a fresh policy, falling back to [`Policy::fail_safe`] with the
/// previous device set when the store is unavailable. The flag is false
/// when the fallback was used.
pub fn load_or_fail_safe(source: &dyn SettingsSource, previous: &Policy) -> (Policy, bool) {
    match source.load() {
        Ok(policy) => {
            debug!(
                "Loaded policy: {} devices, assume={}, grace={:?}",
                policy.known_devices.len(),
                policy.always_assume_in_car,
                policy.grace_period
            );
            (policy, true)
        }
        Err(err) => {
            warn!("Settings unavailable, using fail-safe policy: {}", err);
            (Policy::fail_safe(previous.known_devices.clone()), false)
        }
    }
}

#[derive(Deserialize, Debug, Default)]
struct SettingsFile {
    policy: Option<PolicyConfig>,
    devices: Option<Vec<KnownDevice>>,
}

/// Reads the `[policy]` and `[[devices]]` tables of the config file on
/// every load, so edits take effect at the next session.
pub struct FileSettings {
    path: PathBuf,
}

impl FileSettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileSettings { path: path.into() }
    }
}

impl SettingsSource for FileSettings {
    fn load(&self) -> Result<Policy, SettingsError> {
        let contents = std::fs::read_to_string(&self.path).map_err(|source| SettingsError::Read {
            path: self.path.clone(),
            source,
        })?;
        parse_settings(&contents)
    }
}

fn parse_settings(contents: &str) -> Result<Policy, SettingsError> {
    let file: SettingsFile = toml::de::from_str(contents)?;
    let devices = file.devices.unwrap_or_default();
    if devices.is_empty() {
        return Err(SettingsError::NoDevices);
    }
    Ok(Policy::from_config(&file.policy.unwrap_or_default(), devices))
}

#[cfg(test)]
pub struct StaticSettings(pub Policy);

#[cfg(test)]
impl SettingsSource for StaticSettings {
    fn load(&self) -> Result<Policy, SettingsError> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Unavailable;

    impl SettingsSource for Unavailable {
        fn load(&self) -> Result<Policy, SettingsError> {
            Err(SettingsError::NoDevices)
        }
    }

    fn device(address: &str, assume: Option<bool>) -> KnownDevice {
        KnownDevice {
            address: address.parse().unwrap(),
            name: "Car".to_string(),
            assume_occupied_on_connect: assume,
        }
    }

    #[test]
    fn test_parse_settings() {
        let policy = parse_settings(
            r#"
            [mqtt]
            host = "localhost"

            [policy]
            always_assume_in_car = true
            grace_period_seconds = 20

            [[devices]]
            address = "00:11:22:33:44:55"
            name = "Toyota Camry"
            "#,
        )
        .unwrap();
        assert!(policy.auto_detection_enabled);
        assert!(policy.always_assume_in_car);
        assert_eq!(policy.grace_period, Duration::from_secs(20));
        assert_eq!(policy.prompt_timeout, Duration::from_secs(60));
        assert!(policy.device("00:11:22:33:44:55").is_some());
    }

    #[test]
    fn test_no_devices_is_an_error() {
        let result = parse_settings("[policy]\nalways_assume_in_car = true\n");
        assert!(matches!(result, Err(SettingsError::NoDevices)));
    }

    #[test]
    fn test_missing_file() {
        let settings = FileSettings::new("/nonexistent/carseat-guard.toml");
        assert!(matches!(settings.load(), Err(SettingsError::Read { .. })));
    }

    #[test]
    fn test_device_override_beats_global_flag() {
        let mut policy = Policy::fail_safe(vec![
            device("00:11:22:33:44:55", Some(true)),
            device("66:77:88:99:AA:BB", None),
        ]);
        assert!(policy.assume_on_connect("00:11:22:33:44:55"));
        assert!(!policy.assume_on_connect("66:77:88:99:AA:BB"));

        policy.always_assume_in_car = true;
        policy.known_devices[0].assume_occupied_on_connect = Some(false);
        assert!(!policy.assume_on_connect("00:11:22:33:44:55"));
        assert!(policy.assume_on_connect("66:77:88:99:AA:BB"));
    }

    #[test]
    fn test_fallback_keeps_known_devices() {
        let mut previous = Policy::fail_safe(vec![device("00:11:22:33:44:55", None)]);
        previous.always_assume_in_car = true;
        previous.grace_period = Duration::from_secs(90);

        let (policy, loaded) = load_or_fail_safe(&Unavailable, &previous);
        assert!(!loaded);
        assert!(!policy.always_assume_in_car);
        assert_eq!(policy.grace_period, Duration::from_secs(15));
        assert_eq!(policy.known_devices, previous.known_devices);
    }
}
