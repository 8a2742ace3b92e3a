//! Fixed-interval tick engine
//!
//! Runs from `startup` until `off`/`shutdown`. Every period each registered
//! subsystem is advanced once, in registration order, then
//! `tick{counter}` is broadcast.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{error, info};
use serde_json::{Map, Value};
use tokio::runtime::Handle;

use crate::bus::{panic_reason, MessageBus, Subscription};
use crate::error::Result;
use crate::message::{AppState, Message, SYSTEM_ID};
use crate::timer::TimerSlot;

/// A physical model advanced by the tick engine.
///
/// Subsystems only talk to each other through the bus; `snapshot` is for
/// diagnostics and tests, never for coupling.
pub trait Subsystem: Send + Sync {
    fn name(&self) -> &'static str;

    /// Advance one step and publish the results.
    fn tick(&self) -> Result<()>;

    fn snapshot(&self) -> Value;
}

/// Fixed-period driver for the registered subsystems
pub struct TickEngine {
    bus: Arc<MessageBus>,
    subsystems: Vec<Arc<dyn Subsystem>>,
    period: Duration,
    counter: AtomicU64,
    running: AtomicBool,
    timer: TimerSlot,
    me: Weak<TickEngine>,
}

impl TickEngine {
    /// Subsystems tick in the order given.
    pub fn new(
        bus: Arc<MessageBus>,
        subsystems: Vec<Arc<dyn Subsystem>>,
        period: Duration,
        runtime: Handle,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            bus,
            subsystems,
            period,
            counter: AtomicU64::new(0),
            running: AtomicBool::new(false),
            timer: TimerSlot::new(runtime),
            me: me.clone(),
        })
    }

    /// Follow `state_change`: run from startup, stop on shutdown or off.
    pub fn attach(self: &Arc<Self>) -> Subscription {
        let me = Arc::downgrade(self);
        self.bus.subscribe(move |msg| {
            let Message::StateChange { state, .. } = msg else {
                return;
            };
            let Some(engine) = me.upgrade() else {
                return;
            };
            match state {
                AppState::Startup | AppState::On => engine.start(),
                AppState::Off | AppState::Shutdown => engine.stop(),
                _ => {}
            }
        })
    }

    /// Start ticking. A no-op when already running.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.counter.store(0, Ordering::SeqCst);
        info!(
            "Tick engine started: {} subsystems every {:?}",
            self.subsystems.len(),
            self.period
        );

        let me = self.me.clone();
        self.timer.every(self.period, move || {
            if let Some(engine) = me.upgrade() {
                engine.step();
            }
        });
    }

    /// Stop ticking. The counter keeps its value until the next start.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.timer.cancel();
            info!("Tick engine stopped after {} ticks", self.counter());
        }
    }

    /// Whether the interval task is armed
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ticks since the last start
    pub fn counter(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    /// Run one tick immediately and return its counter.
    pub fn step(&self) -> u64 {
        for subsystem in &self.subsystems {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| subsystem.tick()));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!("Tick failed in {}: {err}", subsystem.name()),
                Err(payload) => error!(
                    "Tick panicked in {}: {}",
                    subsystem.name(),
                    panic_reason(payload.as_ref())
                ),
            }
        }

        let counter = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.bus.emit(Message::Tick {
            id: SYSTEM_ID.to_string(),
            counter,
        });
        counter
    }

    /// Snapshot of every subsystem keyed by name.
    pub fn snapshots(&self) -> Value {
        let map: Map<String, Value> = self
            .subsystems
            .iter()
            .map(|s| (s.name().to_string(), s.snapshot()))
            .collect();
        Value::Object(map)
    }
}
