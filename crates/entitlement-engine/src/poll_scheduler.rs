//! Per-process poll timer.

use engine_config_and_utils::PollConfig;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use token_storage::AuthState;
use tracing::debug;

/// Poll interval for each tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollIntervals {
    pub unauthenticated: Duration,
    pub free: Duration,
    pub premium: Duration,
}

impl From<&PollConfig> for PollIntervals {
    fn from(config: &PollConfig) -> Self {
        Self {
            unauthenticated: Duration::from_secs(config.unauthenticated_secs),
            free: Duration::from_secs(config.free_secs),
            premium: Duration::from_secs(config.premium_secs),
        }
    }
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self::from(&PollConfig::default())
    }
}

/// The poll interval for a state.
///
/// Signed-out processes poll quickly to notice a sign-in, premium users
/// moderately to notice a cancellation, free users slowly.
pub fn poll_interval_for(state: &AuthState, intervals: &PollIntervals) -> Duration {
    if !state.is_authenticated() {
        intervals.unauthenticated
    } else if state.subscription().is_active {
        intervals.premium
    } else {
        intervals.free
    }
}

struct Running {
    interval: Duration,
    task: JoinHandle<()>,
}

/// One repeating timer. Ticks are delivered on an mpsc channel so the owner
/// handles them on its own event loop.
pub struct PollScheduler {
    ticks: mpsc::Sender<Instant>,
    running: Mutex<Option<Running>>,
}

impl PollScheduler {
    pub fn new(ticks: mpsc::Sender<Instant>) -> Self {
        Self {
            ticks,
            running: Mutex::new(None),
        }
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the timer. The first tick fires one full `interval` from now.
    pub fn restart(&self, interval: Duration) {
        let mut running = self.running();
        if let Some(previous) = running.take() {
            previous.task.abort();
        }

        let ticks = self.ticks.clone();
        let first = Instant::now() + interval;
        let task = tokio::spawn(async move {
            let mut timer = interval_at(first, interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                let at = timer.tick().await;
                match ticks.try_send(at) {
                    Ok(()) => {}
                    // The owner has not drained the previous tick yet
                    Err(mpsc::error::TrySendError::Full(_)) => {}
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
        });

        debug!(interval_secs = interval.as_secs(), "Poll timer restarted");
        *running = Some(Running { interval, task });
    }

    /// Clear the timer.
    pub fn stop(&self) {
        if let Some(previous) = self.running().take() {
            previous.task.abort();
            debug!("Poll timer stopped");
        }
    }

    /// Interval of the running timer, if any.
    pub fn current_interval(&self) -> Option<Duration> {
        self.running().as_ref().map(|r| r.interval)
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
