//! Primary and secondary coolant loops
//!
//! The primary loop takes heat from the core, the secondary loop takes heat
//! from the primary and feeds the turbine as steam. All quantities are
//! normalized to 0-1.

use std::sync::Arc;

use log::{debug, info};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;

use crate::bus::{MessageBus, Subscription};
use crate::config::CoolantTuning;
use crate::error::{Result, SimError};
use crate::message::{slider_index, AppState, Message, SYSTEM_ID};
use crate::tick::Subsystem;

/// Outputs of one integration step
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CoolantReadings {
    pub primary_temp: f64,
    pub secondary_temp: f64,
    pub primary_pressure: f64,
    pub secondary_pressure: f64,
}

/// Loop state. `step` is a pure function of this state, the tuning and `dt`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoolantLoops {
    pub primary_temp: f64,
    pub secondary_temp: f64,
    pub primary_pump: f64,
    pub secondary_pump: f64,
    pub primary_pressure: f64,
    pub secondary_pressure: f64,
    /// Last reported core temperature
    pub core_temp: f64,
    /// Integrated step time, drives the turbulence term
    pub elapsed: f64,
}

impl Default for CoolantLoops {
    fn default() -> Self {
        Self {
            primary_temp: 0.0,
            secondary_temp: 0.0,
            primary_pump: 0.5,
            secondary_pump: 0.0,
            primary_pressure: 0.0,
            secondary_pressure: 0.0,
            core_temp: 0.0,
            elapsed: 0.0,
        }
    }
}

impl CoolantLoops {
    /// Advance both loops by `dt` seconds.
    pub fn step(&mut self, tuning: &CoolantTuning, dt: f64) -> CoolantReadings {
        let inertia = tuning.thermal_mass * tuning.heat_capacity;

        let primary_gain =
            (self.core_temp - self.primary_temp) * self.primary_pump * tuning.heat_transfer * dt / inertia;
        self.primary_temp = (self.primary_temp + primary_gain).clamp(0.0, 1.0);

        let secondary_gain = (self.primary_temp - self.secondary_temp)
            * self.secondary_pump
            * tuning.secondary_transfer
            * dt
            / inertia;
        self.secondary_temp = (self.secondary_temp + secondary_gain).clamp(0.0, 1.0);

        self.elapsed += dt;
        let turbulence = self.elapsed.sin() * tuning.turbulence;
        let pressure = |temp: f64, pump: f64| {
            (temp * tuning.temp_pressure_factor + pump * tuning.pump_pressure_factor + turbulence)
                .clamp(0.0, 1.0)
        };
        self.primary_pressure = pressure(self.primary_temp, self.primary_pump);
        self.secondary_pressure = pressure(self.secondary_temp, self.secondary_pump);

        CoolantReadings {
            primary_temp: self.primary_temp,
            secondary_temp: self.secondary_temp,
            primary_pressure: self.primary_pressure,
            secondary_pressure: self.secondary_pressure,
        }
    }
}

struct CoolantInner {
    loops: CoolantLoops,
    last_tick: Instant,
}

/// Primary and secondary coolant loops on the bus
pub struct CoolantSystem {
    bus: Arc<MessageBus>,
    tuning: CoolantTuning,
    inner: Mutex<CoolantInner>,
}

impl CoolantSystem {
    pub fn new(bus: Arc<MessageBus>, tuning: CoolantTuning) -> Arc<Self> {
        Arc::new(Self {
            bus,
            tuning,
            inner: Mutex::new(CoolantInner {
                loops: CoolantLoops::default(),
                last_tick: Instant::now(),
            }),
        })
    }

    pub fn attach(self: &Arc<Self>) -> Subscription {
        let me = Arc::downgrade(self);
        self.bus.subscribe(move |msg| {
            if let Some(coolant) = me.upgrade() {
                coolant.handle(msg);
            }
        })
    }

    fn handle(&self, msg: &Message) {
        match msg {
            Message::CoreTempUpdate { value } => self.inner.lock().loops.core_temp = *value,
            Message::PositionUpdate { id, value } => match slider_index(id, "cooling") {
                Some(0) => self.set_primary_pump(*value),
                Some(1) => self.inner.lock().loops.secondary_pump = value.clamp(0.0, 1.0),
                _ => {}
            },
            Message::StateChange {
                state: AppState::Startup,
                ..
            } => {
                info!("Startup: primary and secondary pumps to {:.0}%", self.tuning.startup_pump_speed * 100.0);
                self.inner.lock().loops.secondary_pump = self.tuning.startup_pump_speed;
                self.force_primary_pump(self.tuning.startup_pump_speed);
            }
            Message::StateChange {
                state: AppState::Scram,
                ..
            } => {
                info!("SCRAM: primary pump to {:.0}%", self.tuning.scram_pump_speed * 100.0);
                self.force_primary_pump(self.tuning.scram_pump_speed);
            }
            _ => {}
        }
    }

    fn set_primary_pump(&self, speed: f64) {
        let speed = speed.clamp(0.0, 1.0);
        self.inner.lock().loops.primary_pump = speed;
        self.bus.emit(Message::FlowRateUpdate { value: speed });
    }

    fn force_primary_pump(&self, speed: f64) {
        self.inner.lock().loops.primary_pump = speed;
        self.bus.emit(Message::PumpSpeedUpdate {
            id: SYSTEM_ID.to_string(),
            value: speed,
        });
        self.bus.emit(Message::FlowRateUpdate { value: speed });
    }

    /// Copy of the current loop state
    pub fn loops(&self) -> CoolantLoops {
        self.inner.lock().loops.clone()
    }
}

impl Subsystem for CoolantSystem {
    fn name(&self) -> &'static str {
        "coolant"
    }

    fn tick(&self) -> Result<()> {
        let readings = {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            let dt = now.duration_since(inner.last_tick).as_secs_f64();
            inner.last_tick = now;

            if !(dt > 0.0 && dt < self.tuning.max_dt_secs) {
                debug!("Skipping coolant step, implausible dt {dt:.3}s");
                return Ok(());
            }
            inner.loops.step(&self.tuning, dt)
        };

        if !readings.primary_temp.is_finite() {
            return Err(SimError::Subsystem {
                name: "coolant",
                reason: format!("primary temperature diverged: {}", readings.primary_temp),
            });
        }

        self.bus.emit(Message::SetMeter {
            id: "pump_temp_meter".to_string(),
            value: readings.primary_temp,
        });
        self.bus.emit(Message::SetMeter {
            id: "pump_pres_meter".to_string(),
            value: readings.primary_pressure,
        });
        self.bus.emit(Message::CoolantTempUpdate {
            value: readings.primary_temp,
        });
        self.bus.emit(Message::SteamTempUpdate {
            value: readings.secondary_temp,
        });
        Ok(())
    }

    fn snapshot(&self) -> Value {
        serde_json::to_value(self.loops()).unwrap_or(Value::Null)
    }
}
