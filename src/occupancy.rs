//! Belief about whether the dependent is in the vehicle.
//!
//! ```text
//!              connected (assume)
//!  Unset ─────────────────────────────────────────► Occupied
//!  Unoccupied      │                                  ▲   │
//!     ▲            │ connected (prompt)      yes /    │   │ marks safe
//!     │            ▼                         timeout  │   │
//!     │     AwaitingConfirmation ─────────────────────┘   │
//!     │            │ no / marks safe                      │
//!     └────────────┴──────────────────────────────────────┘
//! ```
//!
//! Disconnection never clears occupancy here; that is the escalation
//! engine's job, and it ends with the user marking the dependent safe.

use std::time::{Duration, SystemTime};

use log::{debug, info};

use crate::messages::{ConfirmedBy, SessionId};

#[derive(Clone, Debug, PartialEq)]
pub struct OccupancySession {
    pub id: SessionId,
    pub occupied: bool,
    pub source_device_id: Option<String>,
    pub confirmed_by: ConfirmedBy,
}

#[derive(Clone, Debug, PartialEq)]
pub enum OccupancyState {
    Unset,
    AwaitingConfirmation {
        session: SessionId,
        device_id: String,
        prompt_deadline: SystemTime,
    },
    Occupied(OccupancySession),
    Unoccupied,
}

/// What a transition did, so the caller can emit events and drive
/// escalation.
#[derive(Clone, Debug, PartialEq)]
pub enum OccupancyOutcome {
    Unchanged,
    Prompt {
        session: SessionId,
        device_id: String,
    },
    Occupied(OccupancySession),
    Cleared {
        session: SessionId,
        was_occupied: bool,
    },
}

pub struct OccupancyMachine {
    state: OccupancyState,
    last_session: SessionId,
}

impl Default for OccupancyMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl OccupancyMachine {
    pub fn new() -> Self {
        OccupancyMachine {
            state: OccupancyState::Unset,
            last_session: 0,
        }
    }

    pub fn state(&self) -> &OccupancyState {
        &self.state
    }

    /// The occupied session, if any.
    pub fn session(&self) -> Option<&OccupancySession> {
        match &self.state {
            OccupancyState::Occupied(session) => Some(session),
            _ => None,
        }
    }

    pub fn current_session_id(&self) -> Option<SessionId> {
        match &self.state {
            OccupancyState::AwaitingConfirmation { session, .. } => Some(*session),
            OccupancyState::Occupied(session) => Some(session.id),
            _ => None,
        }
    }

    pub fn is_occupied(&self) -> bool {
        self.session().is_some()
    }

    /// Whether a `connected` event would open a new session.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, OccupancyState::Unset | OccupancyState::Unoccupied)
    }

    fn next_session(&mut self) -> SessionId {
        self.last_session += 1;
        self.last_session
    }

    fn occupy(&mut self, id: SessionId, device_id: String, by: ConfirmedBy) -> OccupancyOutcome {
        let session = OccupancySession {
            id,
            occupied: true,
            source_device_id: Some(device_id),
            confirmed_by: by,
        };
        info!("Session {} occupied (confirmed by {:?})", id, by);
        self.state = OccupancyState::Occupied(session.clone());
        OccupancyOutcome::Occupied(session)
    }

    pub fn on_connected(
        &mut self,
        device_id: &str,
        assume: bool,
        prompt_timeout: Duration,
        now: SystemTime,
    ) -> OccupancyOutcome {
        match &self.state {
            OccupancyState::Unset | OccupancyState::Unoccupied => {
                let session = self.next_session();
                if assume {
                    self.occupy(session, device_id.to_string(), ConfirmedBy::System)
                } else {
                    info!("Session {}: asking whether the dependent is aboard", session);
                    self.state = OccupancyState::AwaitingConfirmation {
                        session,
                        device_id: device_id.to_string(),
                        prompt_deadline: now + prompt_timeout,
                    };
                    OccupancyOutcome::Prompt {
                        session,
                        device_id: device_id.to_string(),
                    }
                }
            }
            OccupancyState::AwaitingConfirmation {
                session,
                device_id: prompting,
                ..
            } => {
                if prompting == device_id {
                    debug!("Session {}: duplicate connect from {} suppressed", session, device_id);
                } else {
                    debug!(
                        "Session {}: prompt for {} still open, ignoring {}",
                        session, prompting, device_id
                    );
                }
                OccupancyOutcome::Unchanged
            }
            OccupancyState::Occupied(session) => {
                debug!("Session {}: {} connected while occupied", session.id, device_id);
                OccupancyOutcome::Unchanged
            }
        }
    }

    pub fn on_user_answer(&mut self, session: SessionId, in_car: bool) -> OccupancyOutcome {
        let OccupancyState::AwaitingConfirmation {
            session: awaiting,
            device_id,
            ..
        } = &self.state
        else {
            debug!("No prompt outstanding, ignoring answer for session {}", session);
            return OccupancyOutcome::Unchanged;
        };
        if *awaiting != session {
            debug!("Ignoring stale answer for session {} (awaiting {})", session, awaiting);
            return OccupancyOutcome::Unchanged;
        }

        if in_car {
            let device_id = device_id.clone();
            self.occupy(session, device_id, ConfirmedBy::User)
        } else {
            info!("Session {}: user answered not in car", session);
            self.state = OccupancyState::Unoccupied;
            OccupancyOutcome::Cleared {
                session,
                was_occupied: false,
            }
        }
    }

    /// Default an unanswered prompt to occupied once its window has passed.
    pub fn on_prompt_deadline(&mut self, now: SystemTime) -> OccupancyOutcome {
        match &self.state {
            OccupancyState::AwaitingConfirmation {
                session,
                device_id,
                prompt_deadline,
            } if now >= *prompt_deadline => {
                info!("Session {}: prompt unanswered, assuming occupied", session);
                let (session, device_id) = (*session, device_id.clone());
                self.occupy(session, device_id, ConfirmedBy::System)
            }
            _ => OccupancyOutcome::Unchanged,
        }
    }

    pub fn on_prompt_undeliverable(&mut self, session: SessionId) -> OccupancyOutcome {
        match &self.state {
            OccupancyState::AwaitingConfirmation {
                session: awaiting,
                device_id,
                ..
            } if *awaiting == session => {
                info!("Session {}: prompt undeliverable, assuming occupied", session);
                let device_id = device_id.clone();
                self.occupy(session, device_id, ConfirmedBy::System)
            }
            _ => OccupancyOutcome::Unchanged,
        }
    }

    /// Manual "dependent is aboard". The caller checks that `device_id` is
    /// currently connected.
    pub fn declare_in_car(&mut self, device_id: &str) -> OccupancyOutcome {
        match &self.state {
            OccupancyState::Occupied(_) => OccupancyOutcome::Unchanged,
            OccupancyState::AwaitingConfirmation { session, .. } => {
                let session = *session;
                self.occupy(session, device_id.to_string(), ConfirmedBy::User)
            }
            OccupancyState::Unset | OccupancyState::Unoccupied => {
                let session = self.next_session();
                self.occupy(session, device_id.to_string(), ConfirmedBy::User)
            }
        }
    }

    pub fn mark_safe(&mut self, session: SessionId) -> OccupancyOutcome {
        if self.current_session_id() != Some(session) {
            debug!("Session {} is not active, nothing to clear", session);
            return OccupancyOutcome::Unchanged;
        }
        let was_occupied = self.is_occupied();
        info!("Session {}: marked safe", session);
        self.state = OccupancyState::Unoccupied;
        OccupancyOutcome::Cleared {
            session,
            was_occupied,
        }
    }
}
