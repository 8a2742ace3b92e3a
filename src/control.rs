//! Automatic control-rod regulator
//!
//! A PID loop drives every control rod together so the average core
//! temperature tracks the operator's set-point. It only regulates while the
//! plant is `on`, and asks for an emergency SCRAM when the core or the
//! generator reports a critical condition.

use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;

use crate::bus::{MessageBus, Subscription};
use crate::config::ControlTuning;
use crate::error::Result;
use crate::message::{AppState, Condition, Message};
use crate::reactor_core::CONTROL_ROD_CELLS;
use crate::tick::Subsystem;

const MAX_DT_SECS: f64 = 1.0;

/// Identifier used when the regulator requests a SCRAM
pub const CONTROL_ID: &str = "ctrl";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Regulator {
    pub target: f64,
    pub measured: f64,
    pub integral_error: f64,
    pub last_error: f64,
    /// Commanded position shared by every control rod
    pub position: f64,
}

impl Regulator {
    fn new(position: f64) -> Self {
        Self {
            target: 0.0,
            measured: 0.0,
            integral_error: 0.0,
            last_error: 0.0,
            position,
        }
    }

    /// One PID step. Returns the rod travel applied (positive = withdraw).
    pub fn step(&mut self, tuning: &ControlTuning, dt: f64) -> f64 {
        let error = self.target - self.measured;

        if error.abs() <= tuning.deadband {
            self.last_error = error;
            return 0.0;
        }

        self.integral_error =
            (self.integral_error + error * dt).clamp(-tuning.max_integral, tuning.max_integral);

        let p_term = tuning.kp * error;
        let i_term = tuning.ki * self.integral_error;
        let d_term = if dt > 0.0 {
            tuning.kd * (error - self.last_error) / dt
        } else {
            0.0
        };
        self.last_error = error;

        let max_travel = tuning.rod_speed * dt;
        let travel = (p_term + i_term + d_term).clamp(-max_travel, max_travel);
        let before = self.position;
        self.position = (self.position + travel).clamp(0.0, 1.0);
        self.position - before
    }

    fn reset(&mut self) {
        self.integral_error = 0.0;
        self.last_error = 0.0;
    }
}

struct ControlInner {
    regulator: Regulator,
    state: AppState,
    last_tick: Instant,
}

/// Automatic regulator driving the control rod sliders
pub struct ControlSystem {
    bus: Arc<MessageBus>,
    tuning: ControlTuning,
    inner: Mutex<ControlInner>,
}

impl ControlSystem {
    pub fn new(bus: Arc<MessageBus>, tuning: ControlTuning, initial_position: f64) -> Arc<Self> {
        Arc::new(Self {
            bus,
            tuning,
            inner: Mutex::new(ControlInner {
                regulator: Regulator::new(initial_position),
                state: AppState::Off,
                last_tick: Instant::now(),
            }),
        })
    }

    pub fn attach(self: &Arc<Self>) -> Subscription {
        let me = Arc::downgrade(self);
        self.bus.subscribe(move |msg| {
            if let Some(control) = me.upgrade() {
                control.handle(msg);
            }
        })
    }

    fn handle(&self, msg: &Message) {
        match msg {
            Message::StateChange { state, .. } => {
                let mut inner = self.inner.lock();
                inner.state = *state;
                if *state == AppState::Scram {
                    inner.regulator.position = 0.0;
                    inner.regulator.reset();
                }
            }
            Message::TargetTempUpdate { value } => {
                let mut inner = self.inner.lock();
                inner.regulator.target = value.clamp(0.0, 1.0);
                inner.regulator.integral_error = 0.0;
            }
            Message::CoreTempUpdate { value } => self.inner.lock().regulator.measured = *value,
            Message::CoreStateUpdate {
                value: Condition::Critical,
            } => self.request_scram("core"),
            Message::GenStateUpdate {
                id,
                value: Condition::Critical,
            } => self.request_scram(id),
            _ => {}
        }
    }

    fn request_scram(&self, source: &str) {
        if self.inner.lock().state != AppState::On {
            return;
        }
        warn!("Critical {source} condition, requesting emergency SCRAM");
        self.bus.emit(Message::EmergencyScram {
            id: CONTROL_ID.to_string(),
        });
    }

    /// Copy of the regulator state
    pub fn regulator(&self) -> Regulator {
        self.inner.lock().regulator.clone()
    }
}

impl Subsystem for ControlSystem {
    fn name(&self) -> &'static str {
        "control"
    }

    fn tick(&self) -> Result<()> {
        let moved_to = {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            let dt = now.duration_since(inner.last_tick).as_secs_f64();
            inner.last_tick = now;

            let state = inner.state;
            if state == AppState::Scram {
                drop(inner);
                self.bus.emit(Message::CtrlStateUpdate {
                    value: Condition::Critical,
                });
                return Ok(());
            }
            if state != AppState::On {
                return Ok(());
            }

            if !(dt > 0.0 && dt < MAX_DT_SECS) {
                debug!("Skipping regulator step, implausible dt {dt:.3}s");
                None
            } else {
                let travel = inner.regulator.step(&self.tuning, dt);
                (travel != 0.0).then_some(inner.regulator.position)
            }
        };

        if let Some(position) = moved_to {
            for index in 0..CONTROL_ROD_CELLS.len() {
                self.bus.emit(Message::PositionUpdate {
                    id: format!("rod_{index}"),
                    value: position,
                });
            }
        }
        self.bus.emit(Message::CtrlStateUpdate {
            value: Condition::Normal,
        });
        Ok(())
    }

    fn snapshot(&self) -> Value {
        serde_json::to_value(self.regulator()).unwrap_or(Value::Null)
    }
}
