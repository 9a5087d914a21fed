// src/schedule.rs

//! Periodic update checks

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// Default time between checks (6 hours)
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

/// Trigger collaborator that can be told to stop scheduling checks
pub trait Scheduler: Send + Sync {
    /// Cancel every pending future check
    fn cancel(&self);
}

/// Runs a check immediately and then once per interval until cancelled
///
/// Clones share the same cancellation state, so a clone handed to the
/// orchestrator stops the loop running on another thread.
#[derive(Clone)]
pub struct PeriodicSchedule {
    interval: Duration,
    cancelled: Arc<(Mutex<bool>, Condvar)>,
}

impl PeriodicSchedule {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            cancelled: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        let (flag, _) = &*self.cancelled;
        *flag.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Call `trigger` now and after every interval until cancelled
    pub fn run<F: FnMut()>(&self, mut trigger: F) {
        let (flag, wakeup) = &*self.cancelled;

        loop {
            if self.is_cancelled() {
                break;
            }
            trigger();

            let guard = flag.lock().unwrap_or_else(|e| e.into_inner());
            let (guard, _) = wakeup
                .wait_timeout_while(guard, self.interval, |cancelled| !*cancelled)
                .unwrap_or_else(|e| e.into_inner());
            if *guard {
                break;
            }
            debug!("Next scheduled update check");
        }

        info!("Periodic update checks stopped");
    }
}

impl Scheduler for PeriodicSchedule {
    fn cancel(&self) {
        let (flag, wakeup) = &*self.cancelled;
        *flag.lock().unwrap_or_else(|e| e.into_inner()) = true;
        wakeup.notify_all();
        info!("Cancelled future update checks");
    }
}
