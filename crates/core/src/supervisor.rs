//! Restart supervisor: keeps a [`Device`](crate::device::Device) running,
//! applying exponential backoff between crash-restarts.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::device::Device;

/// `Idle -> Running -> (Running | Backoff(d) | Stopped)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SupervisorState {
    Idle,
    Running,
    Backoff(Duration),
    Stopped,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Backoff applied after the first failing run.
    pub initial_backoff: Duration,
    /// Backoff never grows past this.
    pub max_backoff: Duration,
    /// A run lasting at least this long counts as "sustained": the next
    /// failure resets backoff to `initial_backoff` instead of growing it.
    pub reset_after: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1000),
            reset_after: Duration::from_secs(2),
        }
    }
}

/// Drives one device's `run` loop with restart-on-failure and exponential
/// backoff, exposing its current state for monitoring/tests.
pub struct RestartSupervisor {
    config: SupervisorConfig,
    state_tx: watch::Sender<SupervisorState>,
    restarts: AtomicU32,
}

impl RestartSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let (state_tx, _rx) = watch::channel(SupervisorState::Idle);
        Self {
            config,
            state_tx,
            restarts: AtomicU32::new(0),
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SupervisorState> {
        self.state_tx.subscribe()
    }

    pub fn restart_count(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: SupervisorState) {
        let _ = self.state_tx.send(state);
    }

    /// Runs `device` until `cancel` fires. Returns once the device either
    /// stops cleanly or the supervisor is cancelled during backoff.
    pub async fn supervise(&self, device: &(dyn Device + '_), cancel: CancellationToken) {
        let mut current_backoff = self.config.initial_backoff;

        loop {
            if cancel.is_cancelled() {
                self.set_state(SupervisorState::Stopped);
                return;
            }

            self.set_state(SupervisorState::Running);
            let started = tokio::time::Instant::now();
            let outcome = device.run(cancel.clone()).await;
            let ran_for = started.elapsed();

            match outcome.error {
                None => {
                    info!(device = device.name(), "device run exited cleanly");
                    self.set_state(SupervisorState::Stopped);
                    return;
                }
                Some(err) => {
                    self.restarts.fetch_add(1, Ordering::SeqCst);
                    warn!(device = device.name(), error = %err, "device run failed, restarting");

                    current_backoff = if outcome.immediate_error {
                        self.config.initial_backoff
                    } else if ran_for >= self.config.reset_after {
                        self.config.initial_backoff
                    } else {
                        std::cmp::min(current_backoff * 2, self.config.max_backoff)
                    };

                    self.set_state(SupervisorState::Backoff(current_backoff));
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            self.set_state(SupervisorState::Stopped);
                            return;
                        }
                        _ = tokio::time::sleep(current_backoff) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RunOutcome;
    use crate::register_db::RegisterDb;
    use std::sync::Mutex;
    use tokio::sync::broadcast;

    struct ScriptedDevice {
        register_db: RegisterDb,
        outcomes: Mutex<Vec<(Option<Duration>, RunOutcome)>>,
    }

    #[async_trait::async_trait]
    impl Device for ScriptedDevice {
        fn name(&self) -> &str {
            "scripted"
        }
        fn model(&self) -> &str {
            "scripted-model"
        }
        fn register_db(&self) -> &RegisterDb {
            &self.register_db
        }
        fn is_available(&self) -> bool {
            true
        }
        fn subscribe_available(&self) -> broadcast::Receiver<bool> {
            broadcast::channel(1).1
        }
        async fn run(&self, _cancel: CancellationToken) -> RunOutcome {
            let mut outcomes = self.outcomes.lock().unwrap();
            let (delay, outcome) = outcomes.remove(0);
            drop(outcomes);
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
            outcome
        }
    }

    fn failing_outcome() -> RunOutcome {
        RunOutcome::failed(anyhow::anyhow!("boom"))
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_exponentially_then_caps() {
        let device = ScriptedDevice {
            register_db: RegisterDb::new(),
            outcomes: Mutex::new(vec![
                (None, failing_outcome()),
                (None, failing_outcome()),
                (None, failing_outcome()),
                (None, failing_outcome()),
                (None, failing_outcome()),
                (None, RunOutcome::ok()),
            ]),
        };

        let supervisor = RestartSupervisor::new(SupervisorConfig::default());
        let mut states = supervisor.subscribe_state();
        let cancel = CancellationToken::new();

        let supervise = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                supervisor.supervise(&device, cancel).await;
                supervisor
            }
        });

        let mut backoffs = Vec::new();
        loop {
            states.changed().await.unwrap();
            match *states.borrow() {
                SupervisorState::Backoff(d) => backoffs.push(d),
                SupervisorState::Stopped => break,
                _ => {}
            }
        }

        supervise.await.unwrap();

        assert_eq!(
            backoffs,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
                Duration::from_millis(1000),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_run_resets_backoff() {
        let device = ScriptedDevice {
            register_db: RegisterDb::new(),
            outcomes: Mutex::new(vec![
                (None, failing_outcome()),
                (None, failing_outcome()),
                (Some(Duration::from_secs(3)), failing_outcome()),
                (None, RunOutcome::ok()),
            ]),
        };

        let supervisor = RestartSupervisor::new(SupervisorConfig::default());
        let mut states = supervisor.subscribe_state();
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(async move {
            supervisor.supervise(&device, cancel).await;
        });

        let mut backoffs = Vec::new();
        loop {
            states.changed().await.unwrap();
            match *states.borrow() {
                SupervisorState::Backoff(d) => backoffs.push(d),
                SupervisorState::Stopped => break,
                _ => {}
            }
        }
        handle.await.unwrap();

        // First two failures grow 100 -> 200; the third run lasted 3s
        // (>= reset_after), so the backoff after it resets to 100.
        assert_eq!(
            backoffs,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(100),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_error_does_not_grow_backoff() {
        let device = ScriptedDevice {
            register_db: RegisterDb::new(),
            outcomes: Mutex::new(vec![
                (None, failing_outcome()),
                (None, RunOutcome::immediate(anyhow::anyhow!("bad config"))),
                (None, RunOutcome::ok()),
            ]),
        };

        let supervisor = RestartSupervisor::new(SupervisorConfig::default());
        let mut states = supervisor.subscribe_state();
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(async move {
            supervisor.supervise(&device, cancel).await;
        });

        let mut backoffs = Vec::new();
        loop {
            states.changed().await.unwrap();
            match *states.borrow() {
                SupervisorState::Backoff(d) => backoffs.push(d),
                SupervisorState::Stopped => break,
                _ => {}
            }
        }
        handle.await.unwrap();

        assert_eq!(
            backoffs,
            vec![Duration::from_millis(100), Duration::from_millis(100)]
        );
    }

    #[tokio::test]
    async fn cancellation_during_backoff_stops_promptly() {
        let device = ScriptedDevice {
            register_db: RegisterDb::new(),
            outcomes: Mutex::new(vec![(None, failing_outcome())]),
        };

        let supervisor = RestartSupervisor::new(SupervisorConfig {
            initial_backoff: Duration::from_secs(60),
            ..SupervisorConfig::default()
        });
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();

        let handle = tokio::spawn(async move {
            supervisor.supervise(&device, cancel_clone).await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("supervisor did not stop promptly on cancellation")
            .unwrap();
    }
}
