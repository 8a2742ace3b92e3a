use std::sync::Arc;
use std::time::Duration;

use reactor_panel_lib::bus::MessageBus;
use reactor_panel_lib::config::{CoolantTuning, CoreTuning};
use reactor_panel_lib::coolant::CoolantLoops;
use reactor_panel_lib::message::{AppState, Condition, Message};
use reactor_panel_lib::reactor_core::CONTROL_ROD_CELLS;
use reactor_panel_lib::testing::MessageLog;
use reactor_panel_lib::{SimConfig, Simulation};
use tokio::time;

async fn running(config: SimConfig) -> (Simulation, MessageLog) {
    let bus = Arc::new(MessageBus::new(config.bus_mode));
    let log = MessageLog::new();
    log.attach_to(&bus);
    let sim = Simulation::with_bus(config, bus).unwrap();
    sim.attach_panel();
    sim.press_power();
    time::sleep(Duration::from_millis(2050)).await;
    assert_eq!(sim.state(), AppState::On);
    (sim, log)
}

fn withdraw_control_rods(sim: &Simulation) {
    for i in 0..CONTROL_ROD_CELLS.len() {
        sim.bus.emit(Message::PositionUpdate {
            id: format!("rod_{i}"),
            value: 1.0,
        });
    }
}

#[tokio::test(start_paused = true)]
async fn plant_heats_up_and_feeds_the_turbine() {
    let config = SimConfig {
        tick_interval_ms: 100,
        ..SimConfig::default()
    };
    let (sim, log) = running(config).await;
    withdraw_control_rods(&sim);

    time::sleep(Duration::from_secs(60)).await;

    assert!(sim.core.temperature(2, 2).unwrap() > 0.3);
    let loops = sim.coolant.loops();
    assert!(loops.primary_temp > 0.0);
    assert!(loops.secondary_temp > 0.0);
    assert!(sim.generator.electrical().rpm > 0.0);
    assert!(log.count_where(|m| matches!(m, Message::TurbineRpmUpdate { .. })) > 0);
    assert!(log.count_where(|m| matches!(m, Message::Tick { .. })) > 500);
}

#[tokio::test(start_paused = true)]
async fn overheating_core_triggers_emergency_scram() {
    let config = SimConfig {
        tick_interval_ms: 100,
        core: CoreTuning {
            heat_gain: 0.05,
            ..CoreTuning::default()
        },
        ..SimConfig::default()
    };
    let (sim, log) = running(config).await;
    withdraw_control_rods(&sim);

    time::sleep(Duration::from_secs(10)).await;

    assert_eq!(sim.state(), AppState::Scram);
    assert!(log.messages().contains(&Message::CoreStateUpdate {
        value: Condition::Critical
    }));
    assert_eq!(
        log.count_where(|m| matches!(m, Message::EmergencyScram { id } if id == "ctrl")),
        1
    );
    assert!(sim.core.control_rods().iter().all(|rod| rod.position == 0.0));
    assert_eq!(sim.coolant.loops().primary_pump, 1.0);

    // Fully inserted rods leave no reactivity anywhere
    for x in 0..6 {
        for y in 0..6 {
            assert_eq!(sim.core.reactivity(x, y), Some(0.0));
        }
    }
}

#[tokio::test(start_paused = true)]
async fn regulator_pulls_rods_toward_target() {
    let config = SimConfig {
        tick_interval_ms: 100,
        ..SimConfig::default()
    };
    let (sim, _log) = running(config).await;
    sim.bus.emit(Message::TargetTempUpdate { value: 0.4 });

    time::sleep(Duration::from_secs(5)).await;
    let position = sim.control.regulator().position;
    assert!(position > 0.0);
    assert!(sim
        .core
        .control_rods()
        .iter()
        .all(|rod| (rod.position - position).abs() < 1e-12));
}

#[test]
fn coolant_sequences_repeat_exactly() {
    let tuning = CoolantTuning::default();
    let run = |core_temps: &[f64]| {
        let mut loops = CoolantLoops {
            secondary_pump: 0.5,
            ..CoolantLoops::default()
        };
        core_temps
            .iter()
            .map(|&t| {
                loops.core_temp = t;
                loops.step(&tuning, 0.25)
            })
            .collect::<Vec<_>>()
    };
    let inputs: Vec<f64> = (0..40).map(|i| (i as f64 / 40.0).min(0.9)).collect();
    assert_eq!(run(&inputs), run(&inputs));
}
