//! Simulation configuration
//!
//! Everything has a default, so a config file only needs the keys it
//! overrides. Files are JSON.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::bus::BusMode;
use crate::error::{Result, SimError};
use crate::manifest::Category;

/// Locations probed when no explicit config path is given
const CONFIG_PATHS: [&str; 2] = ["config/reactor_panel.json", "../config/reactor_panel.json"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Tick engine period
    pub tick_interval_ms: u64,
    pub bus_mode: BusMode,
    pub timeouts: Timeouts,
    pub core: CoreTuning,
    pub coolant: CoolantTuning,
    pub generator: GeneratorTuning,
    pub control: ControlTuning,
    /// Replaces the built-in component manifest when present
    pub components: Option<Vec<CategoryIds>>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 500,
            bus_mode: BusMode::Open,
            timeouts: Timeouts::default(),
            core: CoreTuning::default(),
            coolant: CoolantTuning::default(),
            generator: GeneratorTuning::default(),
            control: ControlTuning::default(),
            components: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryIds {
    pub category: Category,
    pub ids: Vec<String>,
}

/// Phase deadlines, all in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Diagnostic only: log components that have not acknowledged init
    pub init_warn_ms: u64,
    /// Diagnostic only: log components that have not passed their test
    pub test_warn_ms: u64,
    /// Hard deadline: shutdown escalates to a fault
    pub shutdown_fail_ms: u64,
    /// Fixed startup duration
    pub startup_delay_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            init_warn_ms: 10_000,
            test_warn_ms: 10_000,
            shutdown_fail_ms: 10_000,
            startup_delay_ms: 2_000,
        }
    }
}

/// Fuel-rod grid tuning (all temperatures normalized 0-1)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreTuning {
    pub heat_gain: f64,
    pub heat_loss: f64,
    pub interference: f64,
    pub normalization: f64,
    pub coolant_cooling: f64,
    pub initial_temperature: f64,
    pub initial_rod_position: f64,
    pub transition_ms: u64,
    pub recalc_debounce_ms: u64,
    pub warning_temperature: f64,
    pub critical_temperature: f64,
}

impl Default for CoreTuning {
    fn default() -> Self {
        Self {
            heat_gain: 0.018,
            heat_loss: 0.1,
            interference: 3.5,
            normalization: 2.0,
            coolant_cooling: 0.03,
            initial_temperature: 0.02,
            initial_rod_position: 0.0,
            transition_ms: 5_000,
            recalc_debounce_ms: 1_000,
            warning_temperature: 0.7,
            critical_temperature: 0.9,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoolantTuning {
    pub heat_capacity: f64,
    pub thermal_mass: f64,
    /// Core to primary loop
    pub heat_transfer: f64,
    /// Primary to secondary loop
    pub secondary_transfer: f64,
    pub temp_pressure_factor: f64,
    pub pump_pressure_factor: f64,
    pub turbulence: f64,
    pub startup_pump_speed: f64,
    pub scram_pump_speed: f64,
    /// Ticks whose real-time delta is at or above this are discarded
    pub max_dt_secs: f64,
}

impl Default for CoolantTuning {
    fn default() -> Self {
        Self {
            heat_capacity: 0.7,
            thermal_mass: 0.8,
            heat_transfer: 0.6,
            secondary_transfer: 0.4,
            temp_pressure_factor: 0.6,
            pump_pressure_factor: 0.4,
            turbulence: 0.05,
            startup_pump_speed: 0.5,
            scram_pump_speed: 1.0,
            max_dt_secs: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorTuning {
    pub heat_to_rpm: f64,
    pub inertia: f64,
    pub brake_per_capacitor: f64,
    pub voltage_per_rpm: f64,
    pub charge_rate: f64,
    pub discharge_rate: f64,
    /// Fraction of combined capacitor charge taken off every grid load
    pub capacitor_relief: f64,
    pub base_loads: [f64; 4],
    pub load_amplitude: f64,
    /// rad/s, one per grid load
    pub load_frequencies: [f64; 4],
    /// Peak-to-peak random noise per tick; 0 disables it
    pub noise: f64,
    pub seed: Option<u64>,
    pub max_dt_secs: f64,
}

impl Default for GeneratorTuning {
    fn default() -> Self {
        Self {
            heat_to_rpm: 1.2,
            inertia: 0.5,
            brake_per_capacitor: 0.05,
            voltage_per_rpm: 0.9,
            charge_rate: 0.3,
            discharge_rate: 0.1,
            capacitor_relief: 0.25,
            base_loads: [0.2, 0.3, 0.4, 0.5],
            load_amplitude: 0.1,
            load_frequencies: [0.11, 0.17, 0.23, 0.29],
            noise: 0.05,
            seed: None,
            max_dt_secs: 1.0,
        }
    }
}

/// Automatic regulator gains
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlTuning {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub deadband: f64,
    /// Max rod travel per second
    pub rod_speed: f64,
    pub max_integral: f64,
}

impl Default for ControlTuning {
    fn default() -> Self {
        Self {
            kp: 0.5,
            ki: 0.05,
            kd: 0.1,
            deadband: 0.01,
            rod_speed: 0.05,
            max_integral: 5.0,
        }
    }
}

impl SimConfig {
    /// Load configuration.
    ///
    /// An explicit path must exist and parse. Without one, the default
    /// locations are probed and built-in defaults are used if none exists.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }

        for candidate in CONFIG_PATHS {
            let candidate = Path::new(candidate);
            if candidate.exists() {
                return Self::from_file(candidate);
            }
        }

        warn!("No config file found, using built-in defaults");
        Ok(Self::default())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|source| SimError::ConfigRead {
            path: PathBuf::from(path),
            source,
        })?;
        let config = serde_json::from_str(&content).map_err(|source| SimError::ConfigParse {
            path: PathBuf::from(path),
            source,
        })?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}
