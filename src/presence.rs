//! Debounced per-device presence.
//!
//! Raw observations are noisy: advertisements are missed, scans restart, the
//! radio drops out for a moment. A device only flips state once the new
//! signal has held for a full scan interval without contradiction, and a
//! connected device only goes away after `missed_intervals` intervals of
//! silence (or an explicit absence that is not contradicted in time).

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use log::{debug, info, trace};

use crate::config::KnownDevice;
use crate::messages::Observation;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PresenceTransition {
    Connected(String),
    Disconnected(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct PresenceState {
    pub device_id: String,
    pub name: String,
    pub connected: bool,
    pub last_seen_at: Option<SystemTime>,
}

#[derive(Clone, Copy, Debug)]
enum Pending {
    Connect(SystemTime),
    Disconnect(SystemTime),
}

#[derive(Debug)]
struct DeviceTrack {
    state: PresenceState,
    last_observed_at: Option<SystemTime>,
    pending: Option<Pending>,
}

pub struct PresenceTracker {
    interval: Duration,
    missed_intervals: u32,
    immediate_connect: bool,
    devices: BTreeMap<String, DeviceTrack>,
}

pub(crate) fn elapsed(since: SystemTime, now: SystemTime) -> Duration {
    now.duration_since(since).unwrap_or_default()
}

impl PresenceTracker {
    pub fn new(interval: Duration, missed_intervals: u32) -> Self {
        PresenceTracker {
            interval,
            missed_intervals: missed_intervals.max(1),
            immediate_connect: false,
            devices: BTreeMap::new(),
        }
    }

    /// With immediate connect, the first sighting of a known device is
    /// reported as `Connected` without waiting out the dwell window.
    /// Disconnection is always debounced.
    pub fn set_immediate_connect(&mut self, immediate: bool) {
        self.immediate_connect = immediate;
    }

    fn silence_threshold(&self) -> Duration {
        self.interval * self.missed_intervals
    }

    /// Replace the known device set. Devices that vanish from the set while
    /// connected are reported as disconnected.
    pub fn set_known_devices(&mut self, devices: &[KnownDevice]) -> Vec<PresenceTransition> {
        let mut transitions = Vec::new();

        self.devices.retain(|id, track| {
            let keep = devices.iter().any(|d| &d.id() == id);
            if !keep {
                info!("Device {} ({}) is no longer known", track.state.name, id);
                if track.state.connected {
                    transitions.push(PresenceTransition::Disconnected(id.clone()));
                }
            }
            keep
        });

        for device in devices {
            let id = device.id();
            match self.devices.get_mut(&id) {
                Some(track) => track.state.name = device.name.clone(),
                None => {
                    self.devices.insert(
                        id.clone(),
                        DeviceTrack {
                            state: PresenceState {
                                device_id: id,
                                name: device.name.clone(),
                                connected: false,
                                last_seen_at: None,
                            },
                            last_observed_at: None,
                            pending: None,
                        },
                    );
                }
            }
        }

        transitions
    }

    pub fn observe(&mut self, observation: &Observation) -> Option<PresenceTransition> {
        let interval = self.interval;
        let immediate_connect = self.immediate_connect;

        let Some(track) = self.devices.get_mut(&observation.device_id) else {
            trace!("Ignoring observation of unknown device {}", observation.device_id);
            return None;
        };

        if track
            .last_observed_at
            .is_some_and(|last| observation.at < last)
        {
            debug!(
                "Ignoring out-of-order observation of {} ({:?})",
                observation.device_id, observation.at
            );
            return None;
        }
        track.last_observed_at = Some(observation.at);

        let at = observation.at;
        if observation.present {
            track.state.last_seen_at = Some(at);
            trace!("Saw {} (rssi: {:?})", track.state.name, observation.rssi);

            if track.state.connected {
                track.pending = None;
                return None;
            }

            match track.pending {
                _ if immediate_connect => {}
                Some(Pending::Connect(since)) if elapsed(since, at) >= interval => {}
                Some(Pending::Connect(_)) => return None,
                _ => {
                    track.pending = Some(Pending::Connect(at));
                    return None;
                }
            }
            track.pending = None;
            track.state.connected = true;
            info!("{} connected", track.state.name);
            Some(PresenceTransition::Connected(track.state.device_id.clone()))
        } else {
            if !track.state.connected {
                track.pending = None;
                return None;
            }

            match track.pending {
                Some(Pending::Disconnect(since)) if elapsed(since, at) >= interval => {
                    track.pending = None;
                    track.state.connected = false;
                    info!("{} disconnected", track.state.name);
                    Some(PresenceTransition::Disconnected(
                        track.state.device_id.clone(),
                    ))
                }
                Some(Pending::Disconnect(_)) => None,
                _ => {
                    track.pending = Some(Pending::Disconnect(at));
                    None
                }
            }
        }
    }

    /// Resolve pending transitions and detect silence. Called periodically;
    /// tolerates arbitrary gaps between calls.
    pub fn check(&mut self, now: SystemTime) -> Vec<PresenceTransition> {
        let interval = self.interval;
        let threshold = self.silence_threshold();
        let mut transitions = Vec::new();

        for track in self.devices.values_mut() {
            let silent = track
                .state
                .last_seen_at
                .is_none_or(|seen| elapsed(seen, now) > threshold);

            if track.state.connected {
                let absence_held = matches!(
                    track.pending,
                    Some(Pending::Disconnect(since)) if elapsed(since, now) >= interval
                );
                if absence_held || silent {
                    if silent {
                        info!(
                            "{} not seen for over {:?}, treating as disconnected",
                            track.state.name, threshold
                        );
                    } else {
                        info!("{} disconnected", track.state.name);
                    }
                    track.pending = None;
                    track.state.connected = false;
                    transitions.push(PresenceTransition::Disconnected(
                        track.state.device_id.clone(),
                    ));
                }
            } else if let Some(Pending::Connect(since)) = track.pending {
                if silent {
                    debug!("Dropping unconfirmed sighting of {}", track.state.name);
                    track.pending = None;
                } else if elapsed(since, now) >= interval {
                    info!("{} connected", track.state.name);
                    track.pending = None;
                    track.state.connected = true;
                    transitions.push(PresenceTransition::Connected(
                        track.state.device_id.clone(),
                    ));
                }
            }
        }

        transitions
    }

    pub fn current_state(&self, device_id: &str) -> Option<&PresenceState> {
        self.devices.get(device_id).map(|t| &t.state)
    }

    pub fn is_connected(&self, device_id: &str) -> bool {
        self.current_state(device_id).is_some_and(|s| s.connected)
    }

    /// True while any known device is connected.
    pub fn any_connected(&self) -> bool {
        self.devices.values().any(|t| t.state.connected)
    }

    pub fn first_connected(&self) -> Option<&PresenceState> {
        self.devices
            .values()
            .map(|t| &t.state)
            .find(|s| s.connected)
    }
}

#[cfg(test)]
mod tests {
    use std::time::UNIX_EPOCH;

    use super::*;

    const CAR: &str = "00:11:22:33:44:55";
    const OTHER: &str = "66:77:88:99:AA:BB";

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_700_000_000 + secs)
    }

    fn seen(device_id: &str, secs: u64) -> Observation {
        Observation {
            device_id: device_id.to_string(),
            present: true,
            rssi: Some(-60),
            at: at(secs),
        }
    }

    fn lost(device_id: &str, secs: u64) -> Observation {
        Observation {
            present: false,
            rssi: None,
            ..seen(device_id, secs)
        }
    }

    fn tracker() -> PresenceTracker {
        let mut tracker = PresenceTracker::new(Duration::from_secs(5), 2);
        tracker.set_known_devices(&[
            KnownDevice {
                address: CAR.parse().unwrap(),
                name: "Toyota Camry".to_string(),
                assume_occupied_on_connect: None,
            },
            KnownDevice {
                address: OTHER.parse().unwrap(),
                name: "Honda Civic".to_string(),
                assume_occupied_on_connect: None,
            },
        ]);
        tracker
    }

    fn connected_tracker() -> PresenceTracker {
        let mut tracker = tracker();
        tracker.set_immediate_connect(true);
        assert_eq!(
            tracker.observe(&seen(CAR, 0)),
            Some(PresenceTransition::Connected(CAR.to_string()))
        );
        tracker
    }

    #[test]
    fn test_unknown_device_ignored() {
        let mut tracker = tracker();
        tracker.set_immediate_connect(true);
        assert_eq!(tracker.observe(&seen("AA:AA:AA:AA:AA:AA", 0)), None);
        assert!(tracker.first_connected().is_none());
        assert!(tracker.current_state("AA:AA:AA:AA:AA:AA").is_none());
    }

    #[test]
    fn test_connect_requires_dwell() {
        let mut tracker = tracker();
        assert_eq!(tracker.observe(&seen(CAR, 0)), None);
        assert_eq!(tracker.observe(&seen(CAR, 3)), None);
        assert_eq!(
            tracker.observe(&seen(CAR, 5)),
            Some(PresenceTransition::Connected(CAR.to_string()))
        );
        assert!(tracker.is_connected(CAR));
        assert_eq!(tracker.current_state(CAR).unwrap().last_seen_at, Some(at(5)));
    }

    #[test]
    fn test_connect_confirmed_by_tick() {
        let mut tracker = tracker();
        tracker.observe(&seen(CAR, 0));
        assert!(tracker.check(at(4)).is_empty());
        assert_eq!(
            tracker.check(at(5)),
            vec![PresenceTransition::Connected(CAR.to_string())]
        );
    }

    #[test]
    fn test_contradicted_sighting_does_not_connect() {
        let mut tracker = tracker();
        tracker.observe(&seen(CAR, 0));
        tracker.observe(&lost(CAR, 2));
        assert!(tracker.check(at(6)).is_empty());
        assert!(!tracker.is_connected(CAR));
    }

    #[test]
    fn test_single_missed_observation_does_not_disconnect() {
        let mut tracker = connected_tracker();
        // Observation at 5 never arrives.
        assert!(tracker.check(at(5)).is_empty());
        assert!(tracker.check(at(10)).is_empty());
        assert_eq!(tracker.observe(&seen(CAR, 10)), None);
        assert!(tracker.check(at(15)).is_empty());
        assert!(tracker.is_connected(CAR));
    }

    #[test]
    fn test_silence_disconnects_once() {
        let mut tracker = connected_tracker();
        assert!(tracker.check(at(10)).is_empty());
        assert_eq!(
            tracker.check(at(11)),
            vec![PresenceTransition::Disconnected(CAR.to_string())]
        );
        assert!(tracker.check(at(20)).is_empty());
        assert!(tracker.check(at(60)).is_empty());
        assert!(!tracker.any_connected());
    }

    #[test]
    fn test_explicit_absence_is_debounced() {
        let mut tracker = connected_tracker();
        assert_eq!(tracker.observe(&lost(CAR, 1)), None);
        assert_eq!(tracker.observe(&seen(CAR, 3)), None);
        assert!(tracker.check(at(7)).is_empty());

        assert_eq!(tracker.observe(&lost(CAR, 8)), None);
        assert_eq!(tracker.observe(&lost(CAR, 10)), None);
        assert_eq!(
            tracker.observe(&lost(CAR, 13)),
            Some(PresenceTransition::Disconnected(CAR.to_string()))
        );
    }

    #[test]
    fn test_out_of_order_observation_ignored() {
        let mut tracker = connected_tracker();
        tracker.observe(&seen(CAR, 8));
        tracker.observe(&lost(CAR, 4));
        assert_eq!(tracker.current_state(CAR).unwrap().last_seen_at, Some(at(8)));
        assert!(tracker.check(at(12)).is_empty());
    }

    #[test]
    fn test_removed_device_reported_disconnected() {
        let mut tracker = connected_tracker();
        let transitions = tracker.set_known_devices(&[KnownDevice {
            address: OTHER.parse().unwrap(),
            name: "Honda Civic".to_string(),
            assume_occupied_on_connect: None,
        }]);
        assert_eq!(
            transitions,
            vec![PresenceTransition::Disconnected(CAR.to_string())]
        );
        assert!(tracker.current_state(CAR).is_none());
        assert!(tracker.current_state(OTHER).is_some());
    }

    #[test]
    fn test_burst_of_observations() {
        let mut tracker = connected_tracker();
        for _ in 0..10 {
            assert_eq!(tracker.observe(&seen(CAR, 1)), None);
        }
        assert!(tracker.check(at(11)).is_empty());
        assert_eq!(tracker.first_connected().unwrap().device_id, CAR);
    }
}
