//! Turbine, generator, capacitor bank and grid loads

use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;

use crate::bus::{MessageBus, Subscription};
use crate::config::GeneratorTuning;
use crate::error::Result;
use crate::message::{Condition, Message};
use crate::tick::Subsystem;

const OVERSPEED_WARNING: f64 = 0.85;
const OVERSPEED_CRITICAL: f64 = 0.95;
const LOAD_WARNING: f64 = 0.75;
const LOAD_CRITICAL: f64 = 0.9;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Capacitor {
    pub charge: f64,
    /// Charging from the generator when set, discharging otherwise
    pub used: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GeneratorConditions {
    pub load: Condition,
    pub voltage: Condition,
    pub rpm: Condition,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Electrical {
    pub steam_temp: f64,
    pub rpm: f64,
    pub voltage: f64,
    pub capacitors: [Capacitor; 2],
    pub loads: [f64; 4],
    pub elapsed: f64,
}

impl Default for Electrical {
    fn default() -> Self {
        Self {
            steam_temp: 0.0,
            rpm: 0.0,
            voltage: 0.0,
            capacitors: [Capacitor::default(); 2],
            loads: [0.0; 4],
            elapsed: 0.0,
        }
    }
}

impl Electrical {
    /// Advance by `dt` seconds. `rng` is only drawn from when noise is enabled.
    pub fn step(&mut self, tuning: &GeneratorTuning, dt: f64, rng: &mut StdRng) -> GeneratorConditions {
        let target_rpm = (self.steam_temp * tuning.heat_to_rpm).clamp(0.0, 1.0);
        let charging = self.capacitors.iter().filter(|c| c.used).count() as f64;
        let brake = tuning.brake_per_capacitor * charging;
        self.rpm = (self.rpm + ((target_rpm - self.rpm) * tuning.inertia - brake) * dt).clamp(0.0, 1.0);
        self.voltage = (self.rpm * tuning.voltage_per_rpm).clamp(0.0, 1.0);

        for capacitor in &mut self.capacitors {
            let delta = if capacitor.used {
                tuning.charge_rate * self.voltage * dt
            } else {
                -tuning.discharge_rate * dt
            };
            capacitor.charge = (capacitor.charge + delta).clamp(0.0, 1.0);
        }

        self.elapsed += dt;
        let relief = tuning.capacitor_relief * self.capacitors.iter().map(|c| c.charge).sum::<f64>();
        for (i, load) in self.loads.iter_mut().enumerate() {
            let wave = tuning.load_amplitude * (tuning.load_frequencies[i] * self.elapsed).sin();
            let noise = if tuning.noise > 0.0 {
                tuning.noise * (rng.gen::<f64>() - 0.5)
            } else {
                0.0
            };
            *load = (tuning.base_loads[i] + wave + noise - relief).clamp(0.0, 1.0);
        }

        let peak_load = self.loads.iter().copied().fold(0.0, f64::max);
        GeneratorConditions {
            load: Condition::above(peak_load, LOAD_WARNING, LOAD_CRITICAL),
            voltage: Condition::above(self.voltage, OVERSPEED_WARNING, OVERSPEED_CRITICAL),
            rpm: Condition::above(self.rpm, OVERSPEED_WARNING, OVERSPEED_CRITICAL),
        }
    }
}

struct GeneratorInner {
    electrical: Electrical,
    rng: StdRng,
    last_tick: Instant,
}

/// Turbine, generator and capacitor bank on the bus
pub struct GeneratorSystem {
    bus: Arc<MessageBus>,
    tuning: GeneratorTuning,
    inner: Mutex<GeneratorInner>,
}

impl GeneratorSystem {
    pub fn new(bus: Arc<MessageBus>, tuning: GeneratorTuning) -> Arc<Self> {
        let rng = match tuning.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Arc::new(Self {
            bus,
            tuning,
            inner: Mutex::new(GeneratorInner {
                electrical: Electrical::default(),
                rng,
                last_tick: Instant::now(),
            }),
        })
    }

    pub fn attach(self: &Arc<Self>) -> Subscription {
        let me = Arc::downgrade(self);
        self.bus.subscribe(move |msg| {
            let Some(generator) = me.upgrade() else {
                return;
            };
            match msg {
                Message::SteamTempUpdate { value } => {
                    generator.inner.lock().electrical.steam_temp = *value;
                }
                Message::CapacitorToggle { index } => generator.toggle_capacitor(*index),
                _ => {}
            }
        })
    }

    /// Flip capacitor `index` between charging and discharging.
    pub fn toggle_capacitor(&self, index: usize) {
        let mut inner = self.inner.lock();
        match inner.electrical.capacitors.get_mut(index) {
            Some(capacitor) => {
                capacitor.used = !capacitor.used;
                debug!("Capacitor {index} used: {}", capacitor.used);
            }
            None => debug!("No capacitor {index}"),
        }
    }

    /// Copy of the electrical state
    pub fn electrical(&self) -> Electrical {
        self.inner.lock().electrical.clone()
    }
}

impl Subsystem for GeneratorSystem {
    fn name(&self) -> &'static str {
        "generator"
    }

    fn tick(&self) -> Result<()> {
        let (electrical, conditions) = {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            let dt = now.duration_since(inner.last_tick).as_secs_f64();
            inner.last_tick = now;
            if !(dt > 0.0 && dt < self.tuning.max_dt_secs) {
                debug!("Skipping generator step, implausible dt {dt:.3}s");
                return Ok(());
            }

            let GeneratorInner { electrical, rng, .. } = &mut *inner;
            let conditions = electrical.step(&self.tuning, dt, rng);
            (electrical.clone(), conditions)
        };

        let mut outbox = vec![
            Message::TurbineRpmUpdate { value: electrical.rpm },
            Message::GeneratorVoltageUpdate { value: electrical.voltage },
        ];
        outbox.extend(
            electrical
                .capacitors
                .iter()
                .enumerate()
                .map(|(index, c)| Message::CapacitorChargeUpdate { index, value: c.charge }),
        );
        outbox.extend(
            electrical
                .loads
                .iter()
                .enumerate()
                .map(|(index, &value)| Message::GridLoadUpdate { index, value }),
        );
        for (id, value) in [
            ("load", conditions.load),
            ("voltage", conditions.voltage),
            ("rpm", conditions.rpm),
        ] {
            outbox.push(Message::GenStateUpdate {
                id: id.to_string(),
                value,
            });
        }

        for msg in outbox {
            self.bus.emit(msg);
        }
        Ok(())
    }

    fn snapshot(&self) -> Value {
        serde_json::to_value(self.electrical()).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MessageLog;
    use std::time::Duration;
    use tokio::time;

    fn quiet() -> GeneratorTuning {
        GeneratorTuning {
            noise: 0.0,
            ..GeneratorTuning::default()
        }
    }

    #[test]
    fn test_rpm_follows_steam_with_inertia() {
        let tuning = quiet();
        let mut rng = StdRng::seed_from_u64(7);
        let mut electrical = Electrical {
            steam_temp: 0.5,
            ..Electrical::default()
        };

        let first = electrical.step(&tuning, 0.5, &mut rng);
        assert!(electrical.rpm > 0.0 && electrical.rpm < 0.6);
        assert_eq!(first.rpm, Condition::Normal);

        for _ in 0..200 {
            electrical.step(&tuning, 0.5, &mut rng);
        }
        assert!((electrical.rpm - 0.6).abs() < 1e-6);
        assert!((electrical.voltage - 0.54).abs() < 1e-6);
    }

    #[test]
    fn test_charging_capacitors_brake_the_turbine() {
        let tuning = quiet();
        let mut rng = StdRng::seed_from_u64(7);
        let settle = |used: bool, rng: &mut StdRng| {
            let mut electrical = Electrical {
                steam_temp: 0.5,
                ..Electrical::default()
            };
            electrical.capacitors[0].used = used;
            for _ in 0..200 {
                electrical.step(&tuning, 0.5, rng);
            }
            electrical
        };

        let free = settle(false, &mut rng);
        let braked = settle(true, &mut rng);
        assert!(braked.rpm < free.rpm);
        assert!(braked.capacitors[0].charge > 0.0);
        assert_eq!(free.capacitors[0].charge, 0.0);
        // Stored charge relieves the grid
        assert!(braked.loads[3] < free.loads[3]);
    }

    #[test]
    fn test_seeded_noise_is_reproducible() {
        let tuning = GeneratorTuning::default();
        let run = || {
            let mut rng = StdRng::seed_from_u64(42);
            let mut electrical = Electrical::default();
            (0..20)
                .map(|_| {
                    electrical.step(&tuning, 0.5, &mut rng);
                    electrical.loads
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_overspeed_is_critical() {
        let tuning = GeneratorTuning {
            heat_to_rpm: 2.0,
            ..quiet()
        };
        let mut rng = StdRng::seed_from_u64(1);
        let mut electrical = Electrical {
            steam_temp: 1.0,
            ..Electrical::default()
        };
        let mut last = electrical.step(&tuning, 0.5, &mut rng);
        for _ in 0..100 {
            last = electrical.step(&tuning, 0.5, &mut rng);
        }
        assert_eq!(last.rpm, Condition::Critical);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_publishes_everything() {
        let bus = Arc::new(MessageBus::default());
        let generator = GeneratorSystem::new(Arc::clone(&bus), quiet());
        generator.attach();
        let log = MessageLog::new();
        log.attach_to(&bus);

        bus.emit(Message::CapacitorToggle { index: 1 });
        bus.emit(Message::CapacitorToggle { index: 9 });
        assert!(generator.electrical().capacitors[1].used);

        time::sleep(Duration::from_millis(500)).await;
        generator.tick().unwrap();
        assert_eq!(log.count_where(|m| matches!(m, Message::CapacitorChargeUpdate { .. })), 2);
        assert_eq!(log.count_where(|m| matches!(m, Message::GridLoadUpdate { .. })), 4);
        assert_eq!(log.count_where(|m| matches!(m, Message::GenStateUpdate { .. })), 3);
    }
}
