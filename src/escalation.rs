//! Countdown and alarm lifecycle for one occupancy session.
//!
//! ```text
//!          disconnected                 deadline reached
//!  Idle ───────────────► Armed ─────────────────────────► Firing
//!   ▲                      │  │                             │
//!   │ reconnect before     │  │ marks safe                  │ marks safe
//!   │ deadline             │  ▼                             ▼
//!   └──────────────────────┘  Resolved ◄────────────────────┘
//! ```
//!
//! The countdown is a single wall-clock deadline, not a decrementing counter.
//! Every arm takes a fresh [`ArmToken`]; an expiry that carries any other
//! token is stale and dropped, so a cancel and an expiry can never both take
//! effect.

use std::time::{Duration, SystemTime};

use log::{debug, info, warn};

use crate::messages::{ArmToken, SessionId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EscalationState {
    Idle,
    Armed { deadline: SystemTime, token: ArmToken },
    Firing { token: ArmToken },
    Resolved,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EscalationOutcome {
    Unchanged,
    CountdownStarted {
        session: SessionId,
        deadline: SystemTime,
        token: ArmToken,
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
}

/// Snapshot of the armed countdown, for scheduling the wake-up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EscalationTimer {
    pub session: SessionId,
    pub token: ArmToken,
    pub deadline: SystemTime,
}

pub struct EscalationEngine {
    session: Option<SessionId>,
    state: EscalationState,
    last_token: ArmToken,
}

impl Default for EscalationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl EscalationEngine {
    pub fn new() -> Self {
        EscalationEngine {
            session: None,
            state: EscalationState::Idle,
            last_token: 0,
        }
    }

    pub fn state(&self) -> EscalationState {
        self.state
    }

    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    /// Armed or firing.
    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            EscalationState::Armed { .. } | EscalationState::Firing { .. }
        )
    }

    pub fn armed_timer(&self) -> Option<EscalationTimer> {
        match (self.session, self.state) {
            (Some(session), EscalationState::Armed { deadline, token }) => Some(EscalationTimer {
                session,
                token,
                deadline,
            }),
            _ => None,
        }
    }

    /// Attach to a newly occupied session.
    pub fn begin_session(&mut self, session: SessionId) {
        assert!(
            !self.is_active(),
            "session {} started while session {:?} still has an active countdown",
            session,
            self.session
        );
        self.session = Some(session);
        self.state = EscalationState::Idle;
    }

    fn arm(&mut self, session: SessionId, now: SystemTime, grace: Duration) -> EscalationOutcome {
        assert_eq!(
            self.state,
            EscalationState::Idle,
            "attempted to arm a second countdown for session {}",
            session
        );
        self.last_token += 1;
        let token = self.last_token;
        let deadline = now + grace;
        self.state = EscalationState::Armed { deadline, token };
        info!(
            "Session {}: countdown armed (token {}, {:?} grace)",
            session, token, grace
        );
        EscalationOutcome::CountdownStarted {
            session,
            deadline,
            token,
        }
    }

    fn fire(&mut self, session: SessionId, token: ArmToken) -> EscalationOutcome {
        self.state = EscalationState::Firing { token };
        warn!("Session {}: ALARM, dependent may still be in the vehicle", session);
        EscalationOutcome::AlarmFired { session }
    }

    /// The source device dropped while the session is occupied.
    pub fn on_disconnected(
        &mut self,
        session: SessionId,
        now: SystemTime,
        grace: Duration,
    ) -> EscalationOutcome {
        if self.session != Some(session) {
            debug!("Disconnect for inactive session {} ignored", session);
            return EscalationOutcome::Unchanged;
        }
        match self.state {
            EscalationState::Idle => self.arm(session, now, grace),
            EscalationState::Armed { token, .. } | EscalationState::Firing { token } => {
                debug!("Session {}: duplicate disconnect (token {} live)", session, token);
                EscalationOutcome::Unchanged
            }
            EscalationState::Resolved => EscalationOutcome::Unchanged,
        }
    }

    /// The source device came back. Cancels the countdown only if observed
    /// strictly before the deadline; otherwise the alarm stands.
    pub fn on_reconnected(&mut self, now: SystemTime) -> EscalationOutcome {
        let Some(session) = self.session else {
            return EscalationOutcome::Unchanged;
        };
        match self.state {
            EscalationState::Armed { deadline, .. } if now < deadline => {
                info!("Session {}: reconnected, countdown canceled", session);
                self.state = EscalationState::Idle;
                EscalationOutcome::CountdownCanceled { session }
            }
            EscalationState::Armed { token, .. } => {
                info!("Session {}: reconnected after deadline", session);
                self.fire(session, token)
            }
            EscalationState::Firing { .. } => {
                debug!("Session {}: reconnected while firing, alarm stands", session);
                EscalationOutcome::Unchanged
            }
            _ => EscalationOutcome::Unchanged,
        }
    }

    /// A scheduled wake-up for `token`. Stale tokens are discarded; a
    /// wake-up before the deadline (clock adjustment, early timer) is a
    /// no-op and the caller reschedules.
    pub fn on_expiry(&mut self, token: ArmToken, now: SystemTime) -> EscalationOutcome {
        let Some(session) = self.session else {
            debug!("Expiry for token {} with no session, discarded", token);
            return EscalationOutcome::Unchanged;
        };
        match self.state {
            EscalationState::Armed {
                deadline,
                token: armed,
            } if armed == token => {
                if now >= deadline {
                    self.fire(session, token)
                } else {
                    debug!("Session {}: woke before deadline", session);
                    EscalationOutcome::Unchanged
                }
            }
            _ => {
                debug!("Session {}: stale expiry for token {} discarded", session, token);
                EscalationOutcome::Unchanged
            }
        }
    }

    /// Periodic deadline check; equivalent to the current token's expiry.
    pub fn poll(&mut self, now: SystemTime) -> EscalationOutcome {
        match self.state {
            EscalationState::Armed { token, .. } => self.on_expiry(token, now),
            _ => EscalationOutcome::Unchanged,
        }
    }

    /// The user confirmed the dependent is out of the vehicle.
    pub fn resolve(&mut self, session: SessionId) -> EscalationOutcome {
        if self.session != Some(session) {
            return EscalationOutcome::Unchanged;
        }
        let outcome = match self.state {
            EscalationState::Armed { .. } => EscalationOutcome::CountdownCanceled { session },
            EscalationState::Firing { .. } => EscalationOutcome::AlarmResolved { session },
            EscalationState::Idle => EscalationOutcome::Unchanged,
            EscalationState::Resolved => {
                debug!("Session {} already resolved", session);
                return EscalationOutcome::Unchanged;
            }
        };
        info!("Session {}: resolved", session);
        self.state = EscalationState::Resolved;
        outcome
    }
}
