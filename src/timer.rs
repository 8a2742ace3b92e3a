//! Cancelable timers
//!
//! A [`TimerSlot`] owns at most one pending task. Arming it again or
//! cancelling it aborts whatever was pending, so a phase that ends early
//! never sees a stale callback fire into the next phase.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

pub struct TimerSlot {
    runtime: Handle,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TimerSlot {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            task: Mutex::new(None),
        }
    }

    /// Run `f` once after `delay`, replacing any pending task.
    pub fn once<F>(&self, delay: Duration, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn(async move {
            time::sleep(delay).await;
            f();
        });
    }

    /// Run `f` on its own task once the caller has returned to the runtime.
    ///
    /// Used to report from outside the dispatch that triggered the report.
    pub fn defer<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn(async move { f() });
    }

    /// Run `f` every `period`, first after one full period.
    pub fn every<F>(&self, period: Duration, mut f: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.spawn(async move {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                f();
            }
        });
    }

    pub fn cancel(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    fn spawn<Fut>(&self, fut: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task = self.runtime.spawn(fut);
        if let Some(previous) = self.task.lock().replace(task) {
            previous.abort();
        }
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}
