use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serializer;
use serde_derive::Serialize;

/// Identifies one occupancy evaluation, from the `connected` event (or manual
/// activation) that opened it until occupancy is cleared again.
pub type SessionId = u64;

/// Tags one armed countdown. Expiry callbacks carrying an older token are
/// discarded.
pub type ArmToken = u64;

/// Who established the current occupancy. Before anything is confirmed
/// there is no session at all, so there is no unset variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmedBy {
    System,
    User,
}

/// A raw observation from the scanning collaborator.
#[derive(Clone, Debug, PartialEq)]
pub struct Observation {
    pub device_id: String,
    pub present: bool,
    pub rssi: Option<i16>,
    pub at: SystemTime,
}

/// Everything the serialized event processor consumes.
#[derive(Clone, Debug, PartialEq)]
pub enum Input {
    Observe(Observation),
    UserConfirmsPresence { session: SessionId, in_car: bool },
    UserMarksSafe { session: SessionId },
    UserDeclaresInCar,
    PromptUndeliverable { session: SessionId },
    TimerExpired { session: SessionId, token: ArmToken },
    Tick,
}

/// Outbound events for the UI and notification collaborators.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    DevicePresence {
        device_id: String,
        name: String,
        connected: bool,
    },
    PromptOccupancy {
        session: SessionId,
        device_id: String,
        name: String,
    },
    OccupancyChanged {
        session: SessionId,
        occupied: bool,
        confirmed_by: ConfirmedBy,
    },
    CountdownStarted {
        session: SessionId,
        #[serde(serialize_with = "unix_seconds")]
        deadline: SystemTime,
    },
    CountdownCanceled {
        session: SessionId,
    },
    AlarmFired {
        session: SessionId,
    },
    AlarmResolved {
        session: SessionId,
    },
    ActivationRejected {
        reason: String,
    },
}

fn unix_seconds<S: Serializer>(at: &SystemTime, serializer: S) -> Result<S::Ok, S::Error> {
    let secs = at
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    serializer.serialize_u64(secs)
}
