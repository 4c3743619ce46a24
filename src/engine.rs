//! The serialized event processor.
//!
//! Presence feeds occupancy, occupancy feeds escalation. Every input is
//! applied to completion before the next one is looked at, and the
//! cross-component invariants are asserted after each step.

use std::time::{Duration, SystemTime};

use log::{debug, info, warn};

use crate::escalation::{EscalationEngine, EscalationOutcome, EscalationState, EscalationTimer};
use crate::messages::{ConfirmedBy, EngineEvent, Input};
use crate::occupancy::{OccupancyMachine, OccupancyOutcome, OccupancyState};
use crate::presence::{PresenceTracker, PresenceTransition};
use crate::settings::{Policy, SettingsSource, load_or_fail_safe};

pub struct Engine {
    settings: Box<dyn SettingsSource>,
    policy: Policy,
    /// False while the last load fell back to the fail-safe policy.
    settings_loaded: bool,
    tracker: PresenceTracker,
    occupancy: OccupancyMachine,
    escalation: EscalationEngine,
}

impl Engine {
    pub fn new(settings: Box<dyn SettingsSource>, interval: Duration, missed_intervals: u32) -> Self {
        let (policy, settings_loaded) =
            load_or_fail_safe(settings.as_ref(), &Policy::fail_safe(Vec::new()));
        let mut tracker = PresenceTracker::new(interval, missed_intervals);
        tracker.set_known_devices(&policy.known_devices);
        tracker.set_immediate_connect(policy.auto_detection_enabled);

        Engine {
            settings,
            policy,
            settings_loaded,
            tracker,
            occupancy: OccupancyMachine::new(),
            escalation: EscalationEngine::new(),
        }
    }

    pub fn occupancy(&self) -> &OccupancyState {
        self.occupancy.state()
    }

    pub fn escalation(&self) -> EscalationState {
        self.escalation.state()
    }

    pub fn armed_timer(&self) -> Option<EscalationTimer> {
        self.escalation.armed_timer()
    }

    pub fn handle(&mut self, input: Input, now: SystemTime) -> Vec<EngineEvent> {
        let mut events = Vec::new();

        match input {
            Input::Observe(observation) => {
                if let Some(transition) = self.tracker.observe(&observation) {
                    self.apply_presence(transition, now, &mut events);
                }
            }
            Input::Tick => {
                // Without a usable device list no connect can ever happen,
                // so keep retrying the store between sessions.
                if self.occupancy.is_idle()
                    && (!self.settings_loaded || self.policy.known_devices.is_empty())
                {
                    self.refresh_policy(now, &mut events);
                }
                for transition in self.tracker.check(now) {
                    self.apply_presence(transition, now, &mut events);
                }
                let outcome = self.occupancy.on_prompt_deadline(now);
                self.apply_occupancy(outcome, now, &mut events);
                let outcome = self.escalation.poll(now);
                push_escalation(outcome, &mut events);
            }
            Input::UserConfirmsPresence { session, in_car } => {
                let outcome = self.occupancy.on_user_answer(session, in_car);
                self.apply_occupancy(outcome, now, &mut events);
            }
            Input::UserMarksSafe { session } => {
                let outcome = self.occupancy.mark_safe(session);
                self.apply_occupancy(outcome, now, &mut events);
            }
            Input::UserDeclaresInCar => self.declare_in_car(now, &mut events),
            Input::PromptUndeliverable { session } => {
                let outcome = self.occupancy.on_prompt_undeliverable(session);
                self.apply_occupancy(outcome, now, &mut events);
            }
            Input::TimerExpired { session, token } => {
                if self.escalation.session() == Some(session) {
                    let outcome = self.escalation.on_expiry(token, now);
                    push_escalation(outcome, &mut events);
                } else {
                    debug!("Expiry for session {} (token {}) discarded", session, token);
                }
            }
        }

        self.check_invariants();
        events
    }

    /// Re-read settings at a session checkpoint.
    fn refresh_policy(&mut self, now: SystemTime, events: &mut Vec<EngineEvent>) {
        (self.policy, self.settings_loaded) =
            load_or_fail_safe(self.settings.as_ref(), &self.policy);
        self.tracker
            .set_immediate_connect(self.policy.auto_detection_enabled);
        for transition in self.tracker.set_known_devices(&self.policy.known_devices) {
            self.apply_presence(transition, now, events);
        }
    }

    fn device_name(&self, device_id: &str) -> String {
        self.tracker
            .current_state(device_id)
            .map(|s| s.name.clone())
            .or_else(|| self.policy.device(device_id).map(|d| d.name.clone()))
            .unwrap_or_else(|| device_id.to_string())
    }

    fn apply_presence(
        &mut self,
        transition: PresenceTransition,
        now: SystemTime,
        events: &mut Vec<EngineEvent>,
    ) {
        match transition {
            PresenceTransition::Connected(device_id) => {
                events.push(EngineEvent::DevicePresence {
                    name: self.device_name(&device_id),
                    device_id: device_id.clone(),
                    connected: true,
                });

                if self.occupancy.is_idle() {
                    self.refresh_policy(now, events);
                    if !self.tracker.is_connected(&device_id) {
                        return;
                    }
                    if !self.policy.auto_detection_enabled {
                        debug!("Automatic detection off, not evaluating {}", device_id);
                        return;
                    }
                }

                let outcome = self.occupancy.on_connected(
                    &device_id,
                    self.policy.assume_on_connect(&device_id),
                    self.policy.prompt_timeout,
                    now,
                );
                self.apply_occupancy(outcome, now, events);

                if self.is_source(&device_id) {
                    let outcome = self.escalation.on_reconnected(now);
                    push_escalation(outcome, events);
                }
            }
            PresenceTransition::Disconnected(device_id) => {
                events.push(EngineEvent::DevicePresence {
                    name: self.device_name(&device_id),
                    device_id: device_id.clone(),
                    connected: false,
                });

                if let Some(session) = self.occupancy.session()
                    && self.is_source(&device_id)
                {
                    let outcome =
                        self.escalation
                            .on_disconnected(session.id, now, self.policy.grace_period);
                    push_escalation(outcome, events);
                }
            }
        }
    }

    fn is_source(&self, device_id: &str) -> bool {
        self.occupancy
            .session()
            .and_then(|s| s.source_device_id.as_deref())
            == Some(device_id)
    }

    fn apply_occupancy(
        &mut self,
        outcome: OccupancyOutcome,
        now: SystemTime,
        events: &mut Vec<EngineEvent>,
    ) {
        match outcome {
            OccupancyOutcome::Unchanged => {}
            OccupancyOutcome::Prompt { session, device_id } => {
                events.push(EngineEvent::PromptOccupancy {
                    session,
                    name: self.device_name(&device_id),
                    device_id,
                });
            }
            OccupancyOutcome::Occupied(session) => {
                self.escalation.begin_session(session.id);
                events.push(EngineEvent::OccupancyChanged {
                    session: session.id,
                    occupied: true,
                    confirmed_by: session.confirmed_by,
                });

                // Confirmed after the source already left: start counting now.
                if let Some(source) = session.source_device_id.as_deref()
                    && !self.tracker.is_connected(source)
                {
                    info!(
                        "Session {}: occupied but {} is not connected",
                        session.id, source
                    );
                    let outcome =
                        self.escalation
                            .on_disconnected(session.id, now, self.policy.grace_period);
                    push_escalation(outcome, events);
                }
            }
            OccupancyOutcome::Cleared {
                session,
                was_occupied,
            } => {
                let outcome = self.escalation.resolve(session);
                push_escalation(outcome, events);
                if was_occupied {
                    events.push(EngineEvent::OccupancyChanged {
                        session,
                        occupied: false,
                        confirmed_by: ConfirmedBy::User,
                    });
                }
            }
        }
    }

    fn declare_in_car(&mut self, now: SystemTime, events: &mut Vec<EngineEvent>) {
        if self.occupancy.is_occupied() {
            debug!("Already occupied, ignoring manual activation");
            return;
        }
        if self.occupancy.is_idle() {
            self.refresh_policy(now, events);
        }
        if !self.tracker.any_connected() {
            warn!("Manual activation rejected: no presence device connected");
            events.push(EngineEvent::ActivationRejected {
                reason: "no presence device connected".to_string(),
            });
            return;
        }
        // Prefer the device that raised a pending prompt.
        let prompting = match self.occupancy.state() {
            OccupancyState::AwaitingConfirmation { device_id, .. }
                if self.tracker.is_connected(device_id) =>
            {
                Some(device_id.clone())
            }
            _ => None,
        };
        let Some(device_id) = prompting
            .or_else(|| self.tracker.first_connected().map(|s| s.device_id.clone()))
        else {
            return;
        };
        let outcome = self.occupancy.declare_in_car(&device_id);
        self.apply_occupancy(outcome, now, events);
    }

    /// Violations mean the serialization discipline was broken; they are
    /// never reconciled.
    fn check_invariants(&self) {
        if self.escalation.is_active() {
            let occupied = self.occupancy.session().map(|s| s.id);
            assert!(
                occupied.is_some() && occupied == self.escalation.session(),
                "countdown for session {:?} is active but occupancy is {:?}",
                self.escalation.session(),
                self.occupancy.state()
            );
        }
        if let Some(session) = self.occupancy.session() {
            assert!(session.occupied, "session {} held without occupancy", session.id);
            assert_eq!(
                self.escalation.session(),
                Some(session.id),
                "occupied session {} has no escalation attached",
                session.id
            );
        }
    }
}

fn push_escalation(outcome: EscalationOutcome, events: &mut Vec<EngineEvent>) {
    match outcome {
        EscalationOutcome::Unchanged => {}
        EscalationOutcome::CountdownStarted {
            session,
            deadline,
            token,
        } => {
            debug!("Session {}: countdown token {} until {:?}", session, token, deadline);
            events.push(EngineEvent::CountdownStarted { session, deadline })
        }
        EscalationOutcome::CountdownCanceled { session } => {
            events.push(EngineEvent::CountdownCanceled { session })
        }
        EscalationOutcome::AlarmFired { session } => {
            events.push(EngineEvent::AlarmFired { session })
        }
        EscalationOutcome::AlarmResolved { session } => {
            events.push(EngineEvent::AlarmResolved { session })
        }
    }
}
