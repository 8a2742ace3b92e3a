//! Bus message taxonomy
//!
//! Every message carries a `type` discriminator on the wire; the remaining
//! fields depend on the type. Messages are immutable values: a publisher
//! builds one, every subscriber sees the same value, and nothing keeps it.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Identifier the core uses when it speaks for the whole plant.
pub const SYSTEM_ID: &str = "system";

/// Identifier of the master power button.
pub const MASTER_ID: &str = "master";

/// Overall operating mode of the plant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppState {
    Off,
    Init,
    Test,
    Fault,
    Startup,
    On,
    Shutdown,
    Scram,
}

impl AppState {
    pub const ALL: [AppState; 8] = [
        AppState::Off,
        AppState::Init,
        AppState::Test,
        AppState::Fault,
        AppState::Startup,
        AppState::On,
        AppState::Shutdown,
        AppState::Scram,
    ];

    /// States reachable from `self` in one step.
    pub fn allowed_next(self) -> &'static [AppState] {
        use AppState::*;
        match self {
            Off => &[Init],
            Init => &[Test, Fault],
            Test => &[Startup, Fault],
            Fault => &[Shutdown, Off],
            Startup => &[On, Fault],
            On => &[Shutdown, Scram, Fault],
            Shutdown => &[Off],
            Scram => &[On, Shutdown, Fault],
        }
    }

    pub fn can_transition_to(self, next: AppState) -> bool {
        self.allowed_next().contains(&next)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AppState::Off => "off",
            AppState::Init => "init",
            AppState::Test => "test",
            AppState::Fault => "fault",
            AppState::Startup => "startup",
            AppState::On => "on",
            AppState::Shutdown => "shutdown",
            AppState::Scram => "scram",
        }
    }
}

impl fmt::Display for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle phase named in `process_*` and `acknowledge` messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Process {
    Init,
    Test,
    Startup,
    Shutdown,
}

impl fmt::Display for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Process::Init => "init",
            Process::Test => "test",
            Process::Startup => "startup",
            Process::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Fuel rod engagement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RodState {
    Engaged,
    Withdrawn,
    Transitioning,
}

/// Qualitative bucket shown on condition lights
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Normal,
    Warning,
    Critical,
}

impl Condition {
    /// Bucket a value where higher is worse.
    pub fn above(value: f64, warning: f64, critical: f64) -> Self {
        if value > critical {
            Condition::Critical
        } else if value > warning {
            Condition::Warning
        } else {
            Condition::Normal
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    // Operator input
    PowerButtonPress { id: String },
    ScramButtonPress { id: String },
    EmergencyScram { id: String },

    // Lifecycle
    StateChange { id: String, state: AppState },
    ProcessBegin { id: String, process: Process },
    ProcessComplete { id: String, process: Process },
    ProcessFault { id: String, process: Process },
    Acknowledge { id: String, process: Process },
    TestResult { id: String, passed: bool },

    // Core
    TemperatureUpdate { id: String, value: f64, x: usize, y: usize },
    FuelRodStateUpdate { id: String, state: RodState, x: usize, y: usize },
    FuelRodStateToggle { id: String, x: usize, y: usize },
    CoreTempUpdate { value: f64 },
    CoreStateUpdate { value: Condition },
    ControlRodPositionUpdate { id: String, index: usize, value: f64 },

    // Sliders and set-points
    PositionUpdate { id: String, value: f64 },
    TargetTempUpdate { value: f64 },

    // Coolant
    CoolantTempUpdate { value: f64 },
    SteamTempUpdate { value: f64 },
    FlowRateUpdate { value: f64 },
    PumpSpeedUpdate { id: String, value: f64 },
    SetMeter { id: String, value: f64 },

    // Turbine / generator
    TurbineRpmUpdate { value: f64 },
    GeneratorVoltageUpdate { value: f64 },
    CapacitorChargeUpdate { index: usize, value: f64 },
    CapacitorToggle { index: usize },
    GridLoadUpdate { index: usize, value: f64 },
    GenStateUpdate { id: String, value: Condition },

    // Control
    CtrlStateUpdate { value: Condition },

    Tick { id: String, counter: u64 },
}

impl Message {
    pub fn power_button(id: impl Into<String>) -> Self {
        Message::PowerButtonPress { id: id.into() }
    }

    pub fn scram_button(id: impl Into<String>) -> Self {
        Message::ScramButtonPress { id: id.into() }
    }

    pub fn state_change(state: AppState) -> Self {
        Message::StateChange {
            id: SYSTEM_ID.to_string(),
            state,
        }
    }

    pub fn process_begin(id: impl Into<String>, process: Process) -> Self {
        Message::ProcessBegin {
            id: id.into(),
            process,
        }
    }

    pub fn process_complete(id: impl Into<String>, process: Process) -> Self {
        Message::ProcessComplete {
            id: id.into(),
            process,
        }
    }

    pub fn process_fault(id: impl Into<String>, process: Process) -> Self {
        Message::ProcessFault {
            id: id.into(),
            process,
        }
    }

    pub fn acknowledge(id: impl Into<String>, process: Process) -> Self {
        Message::Acknowledge {
            id: id.into(),
            process,
        }
    }

    pub fn test_result(id: impl Into<String>, passed: bool) -> Self {
        Message::TestResult {
            id: id.into(),
            passed,
        }
    }

    /// Wire name of the message type.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::PowerButtonPress { .. } => "power_button_press",
            Message::ScramButtonPress { .. } => "scram_button_press",
            Message::EmergencyScram { .. } => "emergency_scram",
            Message::StateChange { .. } => "state_change",
            Message::ProcessBegin { .. } => "process_begin",
            Message::ProcessComplete { .. } => "process_complete",
            Message::ProcessFault { .. } => "process_fault",
            Message::Acknowledge { .. } => "acknowledge",
            Message::TestResult { .. } => "test_result",
            Message::TemperatureUpdate { .. } => "temperature_update",
            Message::FuelRodStateUpdate { .. } => "fuel_rod_state_update",
            Message::FuelRodStateToggle { .. } => "fuel_rod_state_toggle",
            Message::CoreTempUpdate { .. } => "core_temp_update",
            Message::CoreStateUpdate { .. } => "core_state_update",
            Message::ControlRodPositionUpdate { .. } => "control_rod_position_update",
            Message::PositionUpdate { .. } => "position_update",
            Message::TargetTempUpdate { .. } => "target_temp_update",
            Message::CoolantTempUpdate { .. } => "coolant_temp_update",
            Message::SteamTempUpdate { .. } => "steam_temp_update",
            Message::FlowRateUpdate { .. } => "flow_rate_update",
            Message::PumpSpeedUpdate { .. } => "pump_speed_update",
            Message::SetMeter { .. } => "set_meter",
            Message::TurbineRpmUpdate { .. } => "turbine_rpm_update",
            Message::GeneratorVoltageUpdate { .. } => "generator_voltage_update",
            Message::CapacitorChargeUpdate { .. } => "capacitor_charge_update",
            Message::CapacitorToggle { .. } => "capacitor_toggle",
            Message::GridLoadUpdate { .. } => "grid_load_update",
            Message::GenStateUpdate { .. } => "gen_state_update",
            Message::CtrlStateUpdate { .. } => "ctrl_state_update",
            Message::Tick { .. } => "tick",
        }
    }

    /// Decode a message arriving from the renderer.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Parse a slider id of the form `<target>_<index>`.
pub fn slider_index(id: &str, target: &str) -> Option<usize> {
    id.strip_prefix(target)?.strip_prefix('_')?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format_uses_type_tag() {
        let msg = Message::state_change(AppState::Scram);
        let json: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "state_change");
        assert_eq!(json["id"], "system");
        assert_eq!(json["state"], "scram");
    }

    #[test]
    fn test_decode_renderer_message() {
        let msg = Message::from_json(r#"{"type":"fuel_rod_state_toggle","id":"fuel_rod_button_1_2","x":1,"y":2}"#).unwrap();
        assert_eq!(
            msg,
            Message::FuelRodStateToggle {
                id: "fuel_rod_button_1_2".into(),
                x: 1,
                y: 2
            }
        );
        assert_eq!(msg.kind(), "fuel_rod_state_toggle");
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(Message::from_json(r#"{"type":"bogus","id":"x"}"#).is_err());
        assert!(Message::from_json(r#"{"id":"x"}"#).is_err());
    }

    #[test]
    fn test_transition_table() {
        assert!(AppState::Off.can_transition_to(AppState::Init));
        assert!(!AppState::Off.can_transition_to(AppState::On));
        assert!(AppState::On.can_transition_to(AppState::Scram));
        assert!(AppState::Scram.can_transition_to(AppState::On));
        assert!(!AppState::Shutdown.can_transition_to(AppState::Fault));
        for state in AppState::ALL {
            if state != AppState::Off {
                assert!(!state.allowed_next().is_empty());
            }
        }
    }

    #[test]
    fn test_condition_buckets() {
        assert_eq!(Condition::above(0.95, 0.7, 0.9), Condition::Critical);
        assert_eq!(Condition::above(0.8, 0.7, 0.9), Condition::Warning);
        assert_eq!(Condition::above(0.1, 0.7, 0.9), Condition::Normal);
    }

    #[test]
    fn test_slider_index() {
        assert_eq!(slider_index("rod_3", "rod"), Some(3));
        assert_eq!(slider_index("cooling_0", "cooling"), Some(0));
        assert_eq!(slider_index("rod3", "rod"), None);
        assert_eq!(slider_index("cooling_0", "rod"), None);
    }
}
