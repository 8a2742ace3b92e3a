//! Lifecycle phase managers
//!
//! Each manager owns one phase. It reacts to the `state_change` that enters
//! its phase, asks the components to do their part, and reports
//! `process_complete` (or `process_fault`) when the phase is over.
//!
//! | phase    | begin                        | completes when                      |
//! |----------|------------------------------|-------------------------------------|
//! | init     | one broadcast                | registry has every acknowledgment   |
//! | test     | one message per component    | every component reported a pass     |
//! | startup  | one broadcast                | fixed delay elapsed                 |
//! | shutdown | one message per component    | registry complete, else fault       |
//!
//! Completions are reported from a task of their own rather than from inside
//! the acknowledgment that finished the phase. The next `state_change` then
//! reaches every subscriber after the one that started the phase.

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::bus::{MessageBus, Subscription};
use crate::manifest::ComponentManifest;
use crate::message::{AppState, Message, Process, SYSTEM_ID};
use crate::registry::{Phase, Registry};
use crate::timer::TimerSlot;

fn subscribe<T, F>(bus: &MessageBus, me: &Arc<T>, handle: F) -> Subscription
where
    T: Send + Sync + 'static,
    F: Fn(&T, &Message) + Send + Sync + 'static,
{
    let me = Arc::downgrade(me);
    bus.subscribe(move |msg| {
        if let Some(me) = me.upgrade() {
            handle(&me, msg);
        }
    })
}

// ============================================================================
// Init
// ============================================================================

/// Broadcasts the init begin and reports once the registry has heard from
/// every component.
pub struct InitManager {
    bus: Arc<MessageBus>,
    registry: Arc<Registry>,
    report: TimerSlot,
    me: Weak<InitManager>,
}

impl InitManager {
    pub fn new(bus: Arc<MessageBus>, registry: Arc<Registry>, runtime: Handle) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            bus,
            registry,
            report: TimerSlot::new(runtime),
            me: me.clone(),
        })
    }

    pub fn attach(self: &Arc<Self>) -> Subscription {
        subscribe(&self.bus, self, Self::handle)
    }

    fn handle(&self, msg: &Message) {
        let Message::StateChange { state, .. } = msg else {
            return;
        };
        if *state == AppState::Init {
            self.begin();
            return;
        }
        self.report.cancel();
        if self.registry.phase() == Phase::Initializing {
            debug!("Init abandoned on entering {state}");
            self.registry.reset();
        }
    }

    fn begin(&self) {
        let me = self.me.clone();
        self.registry.begin(Box::new(move || {
            if let Some(manager) = me.upgrade() {
                manager.complete();
            }
        }));
        self.bus.emit(Message::process_begin(SYSTEM_ID, Process::Init));
    }

    fn complete(&self) {
        let bus = Arc::clone(&self.bus);
        self.report.defer(move || {
            info!("Initialization complete");
            bus.emit(Message::process_complete("init", Process::Init));
        });
    }
}

// ============================================================================
// Test
// ============================================================================

#[derive(Default)]
struct TestRun {
    active: bool,
    tested: HashSet<String>,
}

/// Asks every component to self-test and reports once all of them passed.
pub struct TestManager {
    bus: Arc<MessageBus>,
    manifest: Arc<ComponentManifest>,
    run: Mutex<TestRun>,
    diagnostic: TimerSlot,
    report: TimerSlot,
    warn_after: Duration,
    me: Weak<TestManager>,
}

impl TestManager {
    pub fn new(
        bus: Arc<MessageBus>,
        manifest: Arc<ComponentManifest>,
        warn_after: Duration,
        runtime: Handle,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            bus,
            manifest,
            run: Mutex::new(TestRun::default()),
            diagnostic: TimerSlot::new(runtime.clone()),
            report: TimerSlot::new(runtime),
            warn_after,
            me: me.clone(),
        })
    }

    pub fn attach(self: &Arc<Self>) -> Subscription {
        subscribe(&self.bus, self, Self::handle)
    }

    /// Components that have not reported a pass in the current run, sorted.
    pub fn untested(&self) -> Vec<String> {
        let run = self.run.lock();
        let mut missing: Vec<String> = self
            .manifest
            .all_ids()
            .iter()
            .filter(|id| !run.tested.contains(*id))
            .cloned()
            .collect();
        missing.sort();
        missing
    }

    fn handle(&self, msg: &Message) {
        match msg {
            Message::StateChange {
                state: AppState::Test,
                ..
            } => self.begin(),
            Message::StateChange { .. } => {
                self.run.lock().active = false;
                self.diagnostic.cancel();
                self.report.cancel();
            }
            Message::TestResult { id, passed } => self.record(id, *passed),
            _ => {}
        }
    }

    fn begin(&self) {
        {
            let mut run = self.run.lock();
            run.active = true;
            run.tested.clear();
        }

        let me = self.me.clone();
        self.diagnostic.once(self.warn_after, move || {
            if let Some(manager) = me.upgrade() {
                if manager.run.lock().active {
                    warn!("Components that have not passed their test: {:?}", manager.untested());
                }
            }
        });

        if self.manifest.is_empty() {
            self.finish();
            return;
        }

        info!("Testing {} components", self.manifest.len());
        for id in self.manifest.all_ids() {
            self.bus.emit(Message::process_begin(id.as_str(), Process::Test));
        }
    }

    fn record(&self, id: &str, passed: bool) {
        let done = {
            let mut run = self.run.lock();
            if !run.active || !self.manifest.contains(id) {
                return;
            }
            if !passed {
                warn!("Component {id} failed its test");
                return;
            }
            run.tested.insert(id.to_string());
            run.tested.len() == self.manifest.len()
        };

        if done {
            self.finish();
        }
    }

    fn finish(&self) {
        self.run.lock().active = false;
        self.diagnostic.cancel();
        let bus = Arc::clone(&self.bus);
        self.report.defer(move || {
            info!("Test complete");
            bus.emit(Message::process_complete(SYSTEM_ID, Process::Test));
        });
    }
}

// ============================================================================
// Startup
// ============================================================================

/// Startup is a fixed delay; nothing is asked of the components.
pub struct StartupManager {
    bus: Arc<MessageBus>,
    timer: TimerSlot,
    delay: Duration,
}

impl StartupManager {
    pub fn new(bus: Arc<MessageBus>, delay: Duration, runtime: Handle) -> Arc<Self> {
        Arc::new(Self {
            bus,
            timer: TimerSlot::new(runtime),
            delay,
        })
    }

    pub fn attach(self: &Arc<Self>) -> Subscription {
        subscribe(&self.bus, self, Self::handle)
    }

    fn handle(&self, msg: &Message) {
        let Message::StateChange { state, .. } = msg else {
            return;
        };
        if *state != AppState::Startup {
            self.timer.cancel();
            return;
        }

        self.bus
            .emit(Message::process_begin(SYSTEM_ID, Process::Startup));
        info!("Starting system");

        let bus = Arc::clone(&self.bus);
        self.timer.once(self.delay, move || {
            info!("Startup complete");
            bus.emit(Message::process_complete(SYSTEM_ID, Process::Startup));
        });
    }
}

// ============================================================================
// Shutdown
// ============================================================================

#[derive(Default)]
struct ShutdownRun {
    active: bool,
    acknowledged: HashSet<String>,
}

/// Collects shutdown acknowledgments against a deadline. A component that
/// never answers turns the shutdown into a fault.
pub struct ShutdownManager {
    bus: Arc<MessageBus>,
    registry: Arc<Registry>,
    manifest: Arc<ComponentManifest>,
    run: Mutex<ShutdownRun>,
    deadline: TimerSlot,
    report: TimerSlot,
    fail_after: Duration,
    me: Weak<ShutdownManager>,
}

impl ShutdownManager {
    pub fn new(
        bus: Arc<MessageBus>,
        registry: Arc<Registry>,
        manifest: Arc<ComponentManifest>,
        fail_after: Duration,
        runtime: Handle,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            bus,
            registry,
            manifest,
            run: Mutex::new(ShutdownRun::default()),
            deadline: TimerSlot::new(runtime.clone()),
            report: TimerSlot::new(runtime),
            fail_after,
            me: me.clone(),
        })
    }

    pub fn attach(self: &Arc<Self>) -> Subscription {
        subscribe(&self.bus, self, Self::handle)
    }

    fn handle(&self, msg: &Message) {
        match msg {
            Message::StateChange {
                state: AppState::Shutdown,
                ..
            } => self.begin(),
            Message::StateChange { state, .. } => self.abandon(*state),
            Message::Acknowledge {
                id,
                process: Process::Shutdown,
            } => {
                let mut run = self.run.lock();
                if run.active && self.manifest.contains(id) {
                    run.acknowledged.insert(id.clone());
                }
            }
            _ => {}
        }
    }

    fn begin(&self) {
        {
            let mut run = self.run.lock();
            run.active = true;
            run.acknowledged.clear();
        }

        let me = self.me.clone();
        self.deadline.once(self.fail_after, move || {
            if let Some(manager) = me.upgrade() {
                manager.timed_out();
            }
        });

        let me = self.me.clone();
        self.registry.begin_shutdown(Box::new(move || {
            if let Some(manager) = me.upgrade() {
                manager.complete();
            }
        }));

        info!("Shutdown started for {} components", self.manifest.len());
        for id in self.manifest.all_ids() {
            self.bus
                .emit(Message::process_begin(id.as_str(), Process::Shutdown));
        }
    }

    fn complete(&self) {
        if !self.finish() {
            return;
        }
        let bus = Arc::clone(&self.bus);
        self.report.defer(move || {
            info!("Shutdown complete");
            bus.emit(Message::process_complete("shutdown", Process::Shutdown));
        });
    }

    fn timed_out(&self) {
        let acknowledged = self.run.lock().acknowledged.len();
        if !self.finish() {
            return;
        }
        warn!(
            "Shutdown timed out: {acknowledged}/{} acknowledged, missing {:?}",
            self.manifest.len(),
            self.registry.pending()
        );
        self.registry.reset();
        self.bus
            .emit(Message::process_fault(SYSTEM_ID, Process::Shutdown));
    }

    fn abandon(&self, state: AppState) {
        self.report.cancel();
        if self.finish() {
            debug!("Shutdown abandoned on entering {state}");
            if self.registry.phase() == Phase::ShuttingDown {
                self.registry.reset();
            }
        }
    }

    /// End the run. Returns false if no run was active.
    fn finish(&self) -> bool {
        let was_active = std::mem::replace(&mut self.run.lock().active, false);
        if was_active {
            self.deadline.cancel();
        }
        was_active
    }
}
