use std::time::{Duration, SystemTime};

use log::{debug, error, info, trace};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, sleep_until};

use crate::engine::Engine;
use crate::escalation::EscalationTimer;
use crate::messages::{EngineEvent, Input};

/// Wall-clock source for the engine. Deadlines are compared against this,
/// not against a monotonic timer, so a suspended host still fires on resume.
pub trait Clock: Send {
    fn now(&self) -> SystemTime;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Single owner of the engine. Scanner observations, user actions, the
/// periodic tick and the countdown wake-up all funnel through one loop.
pub struct Manager<C: Clock> {
    engine: Engine,
    clock: C,
    tick_interval: Duration,
    inputs: mpsc::Receiver<Input>,
    events: mpsc::Sender<EngineEvent>,
}

async fn wait_for(wake: Option<Instant>) {
    match wake {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl<C: Clock> Manager<C> {
    pub fn new(
        engine: Engine,
        clock: C,
        tick_interval: Duration,
        inputs: mpsc::Receiver<Input>,
        events: mpsc::Sender<EngineEvent>,
    ) -> Self {
        Manager {
            engine,
            clock,
            tick_interval,
            inputs,
            events,
        }
    }

    fn wake_at(&self, timer: &EscalationTimer) -> Instant {
        let remaining = timer
            .deadline
            .duration_since(self.clock.now())
            .unwrap_or_default();
        Instant::now() + remaining
    }

    fn dispatch(&mut self, input: Input) {
        let now = self.clock.now();
        for event in self.engine.handle(input, now) {
            debug!("Engine event: {:?}", event);
            // A slow or missing notifier must not stall the engine.
            if let Err(err) = self.events.try_send(event) {
                error!("Error delivering engine event: {}", err);
            }
        }
        trace!(
            "occupancy: {:?}, escalation: {:?}",
            self.engine.occupancy(),
            self.engine.escalation()
        );
    }

    /// Runs until every input sender has been dropped.
    pub async fn run_loop(mut self) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let timer = self.engine.armed_timer();
            let wake = timer.as_ref().map(|t| self.wake_at(t));

            tokio::select! {
                input = self.inputs.recv() => match input {
                    Some(input) => self.dispatch(input),
                    None => {
                        info!("Input channels closed");
                        break;
                    }
                },
                _ = ticker.tick() => self.dispatch(Input::Tick),
                _ = wait_for(wake) => {
                    if let Some(timer) = timer {
                        self.dispatch(Input::TimerExpired {
                            session: timer.session,
                            token: timer.token,
                        });
                    }
                }
            }
        }
        info!("Exiting manager event loop");
    }
}

#[cfg(test)]
mod tests {
    use std::time::UNIX_EPOCH;

    use super::*;
    use crate::config::KnownDevice;
    use crate::messages::{ConfirmedBy, Observation};
    use crate::settings::{Policy, StaticSettings};

    const CAR: &str = "00:11:22:33:44:55";

    /// Wall clock that follows tokio's paused time.
    struct PausedClock {
        base: SystemTime,
        start: Instant,
    }

    impl PausedClock {
        fn new() -> Self {
            PausedClock {
                base: UNIX_EPOCH + Duration::from_secs(1_700_000_000),
                start: Instant::now(),
            }
        }
    }

    impl Clock for PausedClock {
        fn now(&self) -> SystemTime {
            self.base + self.start.elapsed()
        }
    }

    fn spawn_manager(
        assume: bool,
        event_capacity: usize,
    ) -> (mpsc::Sender<Input>, mpsc::Receiver<EngineEvent>, SystemTime) {
        let mut policy = Policy::fail_safe(vec![KnownDevice {
            address: CAR.parse().unwrap(),
            name: "Toyota Camry".to_string(),
            assume_occupied_on_connect: None,
        }]);
        policy.always_assume_in_car = assume;
        let engine = Engine::new(
            Box::new(StaticSettings(policy)),
            Duration::from_secs(5),
            2,
        );

        let clock = PausedClock::new();
        let base = clock.base;
        let (input_tx, input_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::channel(event_capacity);
        let manager = Manager::new(engine, clock, Duration::from_secs(5), input_rx, event_tx);
        tokio::spawn(manager.run_loop());
        (input_tx, event_rx, base)
    }

    fn seen(at: SystemTime) -> Input {
        Input::Observe(Observation {
            device_id: CAR.to_string(),
            present: true,
            rssi: Some(-55),
            at,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_escalates_to_single_alarm() {
        let (inputs, mut events, base) = spawn_manager(true, 16);
        inputs.send(seen(base)).await.unwrap();

        assert!(matches!(
            events.recv().await,
            Some(EngineEvent::DevicePresence {
                connected: true,
                ..
            })
        ));
        assert_eq!(
            events.recv().await,
            Some(EngineEvent::OccupancyChanged {
                session: 1,
                occupied: true,
                confirmed_by: ConfirmedBy::System
            })
        );

        // Silence: ticks at 5 and 10 stay quiet, 15 exceeds two intervals.
        assert!(matches!(
            events.recv().await,
            Some(EngineEvent::DevicePresence {
                connected: false,
                ..
            })
        ));
        assert_eq!(
            events.recv().await,
            Some(EngineEvent::CountdownStarted {
                session: 1,
                deadline: base + Duration::from_secs(30)
            })
        );
        assert_eq!(
            events.recv().await,
            Some(EngineEvent::AlarmFired { session: 1 })
        );

        inputs
            .send(Input::UserMarksSafe { session: 1 })
            .await
            .unwrap();
        assert_eq!(
            events.recv().await,
            Some(EngineEvent::AlarmResolved { session: 1 })
        );
        assert!(matches!(
            events.recv().await,
            Some(EngineEvent::OccupancyChanged {
                occupied: false,
                ..
            })
        ));

        tokio::time::advance(Duration::from_secs(60)).await;
        drop(inputs);
        while let Some(event) = events.recv().await {
            assert!(
                !matches!(event, EngineEvent::AlarmFired { .. }),
                "second alarm: {event:?}"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_during_countdown_cancels() {
        let (inputs, mut events, base) = spawn_manager(true, 16);
        inputs.send(seen(base)).await.unwrap();

        let mut received = Vec::new();
        loop {
            let event = events.recv().await.unwrap();
            let started = matches!(event, EngineEvent::CountdownStarted { .. });
            received.push(event);
            if started {
                break;
            }
        }

        tokio::time::advance(Duration::from_secs(5)).await;
        inputs
            .send(seen(base + Duration::from_secs(20)))
            .await
            .unwrap();
        assert!(matches!(
            events.recv().await,
            Some(EngineEvent::DevicePresence {
                connected: true,
                ..
            })
        ));
        assert_eq!(
            events.recv().await,
            Some(EngineEvent::CountdownCanceled { session: 1 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_notifier_does_not_block_inputs() {
        let (inputs, mut events, base) = spawn_manager(true, 1);

        // Nobody reads events while far more inputs than the input channel
        // holds are pushed through.
        for secs in 0..64 {
            let sent = tokio::time::timeout(
                Duration::from_secs(1),
                inputs.send(seen(base + Duration::from_secs(secs))),
            )
            .await;
            assert!(matches!(sent, Ok(Ok(()))), "input {secs} was not accepted");
        }

        assert!(matches!(
            events.recv().await,
            Some(EngineEvent::DevicePresence {
                connected: true,
                ..
            })
        ));
    }
}
