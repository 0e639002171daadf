//! Deadline timer: one tokio task sleeping until the earliest deadline.
//!
//! Owners arm the timer from any thread; the task calls `on_fire` once the
//! deadline passes. The deadline is cleared before `on_fire` runs, so the
//! callback re-arms for whatever comes next. Callbacks run on the timer
//! task and must not block.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::lock;

struct TimerShared {
    deadline: Mutex<Option<Instant>>,
    wake: Notify,
    closed: AtomicBool,
}

pub struct DeadlineTimer {
    name: &'static str,
    shared: Arc<TimerShared>,
}

impl DeadlineTimer {
    /// Spawn the timer task on `runtime`. The timer starts disarmed.
    pub fn spawn<F>(runtime: &Handle, name: &'static str, on_fire: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let shared = Arc::new(TimerShared {
            deadline: Mutex::new(None),
            wake: Notify::new(),
            closed: AtomicBool::new(false),
        });
        runtime.spawn(run(name, shared.clone(), on_fire));
        Self { name, shared }
    }

    /// Fire at `at`, replacing any earlier or later deadline.
    pub fn arm(&self, at: Instant) {
        *lock(&self.shared.deadline) = Some(at);
        self.shared.wake.notify_one();
    }

    /// Fire at `at` unless an earlier deadline is already set.
    pub fn arm_earlier(&self, at: Instant) {
        let mut deadline = lock(&self.shared.deadline);
        match *deadline {
            Some(current) if current <= at => {}
            _ => {
                *deadline = Some(at);
                drop(deadline);
                self.shared.wake.notify_one();
            }
        }
    }

    pub fn disarm(&self) {
        *lock(&self.shared.deadline) = None;
        self.shared.wake.notify_one();
    }

    pub fn deadline(&self) -> Option<Instant> {
        *lock(&self.shared.deadline)
    }

    /// Stop the task. A callback already running finishes; none start after.
    pub fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            tracing::trace!(timer = self.name, "timer closed");
        }
        self.shared.wake.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl Drop for DeadlineTimer {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run<F>(name: &'static str, shared: Arc<TimerShared>, on_fire: F)
where
    F: Fn() + Send + Sync + 'static,
{
    loop {
        if shared.closed.load(Ordering::Acquire) {
            break;
        }

        let next = *lock(&shared.deadline);
        let Some(at) = next else {
            shared.wake.notified().await;
            continue;
        };

        tokio::select! {
            _ = tokio::time::sleep_until(at) => {}
            _ = shared.wake.notified() => continue,
        }

        if shared.closed.load(Ordering::Acquire) {
            break;
        }

        // Re-check under the lock: the deadline may have moved while we slept.
        let due = {
            let mut deadline = lock(&shared.deadline);
            match *deadline {
                Some(at) if at <= Instant::now() => {
                    *deadline = None;
                    true
                }
                _ => false,
            }
        };

        if due {
            tracing::trace!(timer = name, "timer fired");
            on_fire();
        }
    }
}
