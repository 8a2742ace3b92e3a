//! Reactor core: 6x6 fuel rod grid and control rods
//!
//! Base reactivity of a cell is the inverse-distance sum over every other
//! fuel rod, with withdrawn rods placed infinitely far away. Control rods
//! subtract an inverse-distance term scaled by how far they are inserted.
//! Base reactivity is only rebuilt on start and (debounced) after a rod
//! changes engagement.

use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, info};
use ndarray::{Array2, Array3};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::runtime::Handle;
use tokio::time::Instant;

use crate::bus::{MessageBus, Subscription};
use crate::config::CoreTuning;
use crate::error::Result;
use crate::manifest::{fuel_rod_id, GRID_SIZE};
use crate::message::{slider_index, AppState, Condition, Message, RodState, SYSTEM_ID};
use crate::tick::Subsystem;
use crate::timer::TimerSlot;

/// Control rod cells: both diagonals, minus the central 2x2 block
pub const CONTROL_ROD_CELLS: [(usize, usize); 8] = [
    (0, 0),
    (1, 1),
    (4, 4),
    (5, 5),
    (0, 5),
    (1, 4),
    (4, 1),
    (5, 0),
];

const FUEL_ROD_PREFIX: &str = "fuel_rod_button";

#[derive(Debug, Clone, Copy)]
struct Transition {
    started: Instant,
    from: RodState,
}

#[derive(Debug, Clone, Copy)]
struct FuelRod {
    temperature: f64,
    state: RodState,
    transition: Option<Transition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ControlRod {
    pub x: usize,
    pub y: usize,
    /// 0 = fully inserted, 1 = fully withdrawn
    pub position: f64,
}

fn distance(a: (usize, usize), b: (usize, usize)) -> f64 {
    let dx = a.0 as f64 - b.0 as f64;
    let dy = a.1 as f64 - b.1 as f64;
    (dx * dx + dy * dy).sqrt()
}

fn cells() -> impl Iterator<Item = (usize, usize)> {
    (0..GRID_SIZE).flat_map(|x| (0..GRID_SIZE).map(move |y| (x, y)))
}

/// Inverse-distance sum over every other rod, normalized.
fn base_reactivity(states: &Array2<RodState>, normalization: f64) -> Array2<f64> {
    let mut base = Array2::zeros((GRID_SIZE, GRID_SIZE));
    for cell in cells() {
        let sum: f64 = cells()
            .filter(|other| *other != cell)
            .map(|other| {
                let d = if states[[other.0, other.1]] == RodState::Withdrawn {
                    f64::INFINITY
                } else {
                    distance(cell, other)
                };
                1.0 / (1.0 + d)
            })
            .sum();
        base[[cell.0, cell.1]] = sum / normalization;
    }
    base
}

/// `influence[[k, x, y]]` = 1 / (1 + distance from control rod k to (x, y))
fn influence_table(control_rods: &[ControlRod]) -> Array3<f64> {
    let mut table = Array3::zeros((control_rods.len(), GRID_SIZE, GRID_SIZE));
    for (k, rod) in control_rods.iter().enumerate() {
        for cell in cells() {
            table[[k, cell.0, cell.1]] = 1.0 / (1.0 + distance((rod.x, rod.y), cell));
        }
    }
    table
}

struct CoreModel {
    tuning: CoreTuning,
    rods: Array2<FuelRod>,
    control_rods: Vec<ControlRod>,
    base: Array2<f64>,
    influence: Array3<f64>,
    reactivity: Array2<f64>,
    coolant_temp: f64,
    flow_rate: f64,
    running: bool,
    scrammed: bool,
}

impl CoreModel {
    fn new(tuning: CoreTuning) -> Self {
        let rods = Array2::from_elem(
            (GRID_SIZE, GRID_SIZE),
            FuelRod {
                temperature: tuning.initial_temperature,
                state: RodState::Engaged,
                transition: None,
            },
        );
        let control_rods: Vec<ControlRod> = CONTROL_ROD_CELLS
            .iter()
            .map(|&(x, y)| ControlRod {
                x,
                y,
                position: tuning.initial_rod_position,
            })
            .collect();

        let mut model = Self {
            influence: influence_table(&control_rods),
            base: Array2::zeros((GRID_SIZE, GRID_SIZE)),
            reactivity: Array2::zeros((GRID_SIZE, GRID_SIZE)),
            rods,
            control_rods,
            coolant_temp: 0.0,
            flow_rate: 0.5,
            running: false,
            scrammed: false,
            tuning,
        };
        model.rebuild_base();
        model
    }

    fn rebuild_base(&mut self) {
        let states = self.rods.map(|rod| rod.state);
        self.base = base_reactivity(&states, self.tuning.normalization);
    }

    /// Reassign control rods to their structural cells, keeping positions.
    fn assign_control_rods(&mut self) {
        for (rod, &(x, y)) in self.control_rods.iter_mut().zip(CONTROL_ROD_CELLS.iter()) {
            rod.x = x;
            rod.y = y;
        }
        self.influence = influence_table(&self.control_rods);
    }

    fn interference(&self, x: usize, y: usize) -> f64 {
        self.control_rods
            .iter()
            .enumerate()
            .map(|(k, rod)| (1.0 - rod.position) * self.influence[[k, x, y]])
            .sum::<f64>()
            * self.tuning.interference
    }

    fn begin_transition(&mut self, x: usize, y: usize, now: Instant) -> bool {
        let rod = &mut self.rods[[x, y]];
        if rod.state == RodState::Transitioning {
            return false;
        }
        rod.transition = Some(Transition {
            started: now,
            from: rod.state,
        });
        rod.state = RodState::Transitioning;
        true
    }

    /// Finish transitions older than the transition time. Returns the cells
    /// that changed and their new state.
    fn complete_transitions(&mut self, now: Instant) -> Vec<(usize, usize, RodState)> {
        let hold = Duration::from_millis(self.tuning.transition_ms);
        let mut finished = Vec::new();
        for ((x, y), rod) in self.rods.indexed_iter_mut() {
            let Some(transition) = rod.transition else {
                continue;
            };
            if now.duration_since(transition.started) < hold {
                continue;
            }
            rod.state = match transition.from {
                RodState::Engaged => RodState::Withdrawn,
                _ => RodState::Engaged,
            };
            rod.transition = None;
            finished.push((x, y, rod.state));
        }
        finished
    }

    /// Integrate one step. Returns (per-rod updates, average temperature, condition).
    fn integrate(&mut self) -> (Vec<Message>, f64, Condition) {
        let mut updates = Vec::new();
        let mut hottest: f64 = 0.0;
        let mut engaged_heat = 0.0;

        for (x, y) in cells() {
            if self.rods[[x, y]].state != RodState::Engaged {
                self.reactivity[[x, y]] = 0.0;
                continue;
            }

            let reactivity = (self.base[[x, y]] - self.interference(x, y)).max(0.0);
            self.reactivity[[x, y]] = reactivity;

            let t = &self.tuning;
            let mut temperature = self.rods[[x, y]].temperature;
            temperature += t.heat_gain * reactivity;
            temperature -= t.heat_loss * temperature;
            temperature -= t.coolant_cooling * self.flow_rate * (temperature - self.coolant_temp);
            let temperature = temperature.clamp(0.0, 1.0);
            self.rods[[x, y]].temperature = temperature;

            hottest = hottest.max(temperature);
            engaged_heat += temperature;
            updates.push(Message::TemperatureUpdate {
                id: fuel_rod_id(FUEL_ROD_PREFIX, x, y),
                value: temperature,
                x,
                y,
            });
        }

        // Rods out of the core keep their last temperature but add no heat
        let average = engaged_heat / (GRID_SIZE * GRID_SIZE) as f64;
        let condition = Condition::above(
            hottest,
            self.tuning.warning_temperature,
            self.tuning.critical_temperature,
        );
        (updates, average, condition)
    }
}

fn rod_update(x: usize, y: usize, state: RodState) -> Message {
    Message::FuelRodStateUpdate {
        id: fuel_rod_id(FUEL_ROD_PREFIX, x, y),
        state,
        x,
        y,
    }
}

/// The core as a bus participant
pub struct CoreSystem {
    bus: Arc<MessageBus>,
    model: Mutex<CoreModel>,
    recalculation: TimerSlot,
    debounce: Duration,
    me: Weak<CoreSystem>,
}

impl CoreSystem {
    pub fn new(bus: Arc<MessageBus>, tuning: CoreTuning, runtime: Handle) -> Arc<Self> {
        let debounce = Duration::from_millis(tuning.recalc_debounce_ms);
        Arc::new_cyclic(|me| Self {
            bus,
            model: Mutex::new(CoreModel::new(tuning)),
            recalculation: TimerSlot::new(runtime),
            debounce,
            me: me.clone(),
        })
    }

    /// Subscribe to state changes, operator input and coolant readings.
    pub fn attach(self: &Arc<Self>) -> Subscription {
        let me = Arc::downgrade(self);
        self.bus.subscribe(move |msg| {
            if let Some(core) = me.upgrade() {
                core.handle(msg);
            }
        })
    }

    fn handle(&self, msg: &Message) {
        match msg {
            Message::StateChange { state, .. } => match state {
                AppState::On => self.start(),
                AppState::Scram => self.scram(),
                AppState::Off | AppState::Shutdown => self.stop(),
                _ => {}
            },
            Message::FuelRodStateToggle { x, y, .. } => self.toggle(*x, *y),
            Message::PositionUpdate { id, value } => {
                if let Some(index) = slider_index(id, "rod") {
                    self.set_control_rod(index, *value);
                }
            }
            Message::CoolantTempUpdate { value } => self.model.lock().coolant_temp = *value,
            Message::FlowRateUpdate { value } => self.model.lock().flow_rate = *value,
            _ => {}
        }
    }

    fn start(&self) {
        let outbox: Vec<Message> = {
            let mut model = self.model.lock();
            model.assign_control_rods();
            model.rebuild_base();
            model.running = true;
            model.scrammed = false;

            let now = Instant::now();
            let withdrawn: Vec<(usize, usize)> = model
                .rods
                .indexed_iter()
                .filter(|(_, rod)| rod.state == RodState::Withdrawn)
                .map(|(cell, _)| cell)
                .collect();
            withdrawn
                .into_iter()
                .filter(|&(x, y)| model.begin_transition(x, y, now))
                .map(|(x, y)| rod_update(x, y, RodState::Transitioning))
                .collect()
        };

        if !outbox.is_empty() {
            info!("Re-engaging {} withdrawn fuel rods", outbox.len());
        }
        for msg in outbox {
            self.bus.emit(msg);
        }
    }

    fn stop(&self) {
        let mut model = self.model.lock();
        if model.running {
            debug!("Core stopped");
        }
        model.running = false;
    }

    fn scram(&self) {
        let count = {
            let mut model = self.model.lock();
            model.scrammed = true;
            for rod in &mut model.control_rods {
                rod.position = 0.0;
            }
            model.control_rods.len()
        };

        info!("SCRAM: inserting all control rods");
        for index in 0..count {
            self.bus.emit(Message::ControlRodPositionUpdate {
                id: SYSTEM_ID.to_string(),
                index,
                value: 0.0,
            });
        }
    }

    /// Start moving fuel rod (x, y) in or out. Ignored while the rod is
    /// already moving or outside the grid.
    pub fn toggle(&self, x: usize, y: usize) {
        if x >= GRID_SIZE || y >= GRID_SIZE {
            debug!("Ignoring toggle outside the grid: ({x}, {y})");
            return;
        }
        let started = self.model.lock().begin_transition(x, y, Instant::now());
        if started {
            self.bus.emit(rod_update(x, y, RodState::Transitioning));
        }
    }

    /// Move control rod `index`. Ignored while scrammed.
    pub fn set_control_rod(&self, index: usize, position: f64) {
        let mut model = self.model.lock();
        if model.scrammed {
            debug!("Ignoring control rod {index} move during SCRAM");
            return;
        }
        if let Some(rod) = model.control_rods.get_mut(index) {
            rod.position = position.clamp(0.0, 1.0);
        }
    }

    /// Rebuild the base reactivity table from the current rod states.
    pub fn recalculate(&self) {
        self.model.lock().rebuild_base();
        debug!("Base reactivity recalculated");
    }

    fn schedule_recalculation(&self) {
        let me = self.me.clone();
        self.recalculation.once(self.debounce, move || {
            if let Some(core) = me.upgrade() {
                core.recalculate();
            }
        });
    }

    /// Whether the core integrates on tick (`on` or `scram`)
    pub fn is_running(&self) -> bool {
        self.model.lock().running
    }

    /// Base reactivity of cell (x, y); `None` outside the grid.
    pub fn base_reactivity(&self, x: usize, y: usize) -> Option<f64> {
        self.model.lock().base.get([x, y]).copied()
    }

    /// Final reactivity from the last tick; `None` outside the grid.
    pub fn reactivity(&self, x: usize, y: usize) -> Option<f64> {
        self.model.lock().reactivity.get([x, y]).copied()
    }

    /// Fuel rod temperature; `None` outside the grid.
    pub fn temperature(&self, x: usize, y: usize) -> Option<f64> {
        self.model.lock().rods.get([x, y]).map(|rod| rod.temperature)
    }

    /// Fuel rod engagement; `None` outside the grid.
    pub fn rod_state(&self, x: usize, y: usize) -> Option<RodState> {
        self.model.lock().rods.get([x, y]).map(|rod| rod.state)
    }

    /// Current control rod positions, in slider order
    pub fn control_rods(&self) -> Vec<ControlRod> {
        self.model.lock().control_rods.clone()
    }
}

impl Subsystem for CoreSystem {
    fn name(&self) -> &'static str {
        "core"
    }

    fn tick(&self) -> Result<()> {
        let (finished, updates, average, condition) = {
            let mut model = self.model.lock();
            if !model.running {
                return Ok(());
            }
            let finished = model.complete_transitions(Instant::now());
            let (updates, average, condition) = model.integrate();
            (finished, updates, average, condition)
        };

        for &(x, y, state) in &finished {
            self.bus.emit(rod_update(x, y, state));
        }
        if !finished.is_empty() {
            self.schedule_recalculation();
        }

        for msg in updates {
            self.bus.emit(msg);
        }
        self.bus.emit(Message::CoreTempUpdate { value: average });
        self.bus.emit(Message::CoreStateUpdate { value: condition });
        Ok(())
    }

    fn snapshot(&self) -> Value {
        let model = self.model.lock();
        let temperatures: Vec<Vec<f64>> = model
            .rods
            .rows()
            .into_iter()
            .map(|row| row.iter().map(|rod| rod.temperature).collect())
            .collect();
        json!({
            "running": model.running,
            "scrammed": model.scrammed,
            "coolant_temp": model.coolant_temp,
            "flow_rate": model.flow_rate,
            "temperatures": temperatures,
            "control_rods": model.control_rods,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MessageLog;
    use tokio::time;

    fn setup() -> (Arc<MessageBus>, Arc<CoreSystem>, MessageLog) {
        let bus = Arc::new(MessageBus::default());
        let core = CoreSystem::new(Arc::clone(&bus), CoreTuning::default(), Handle::current());
        core.attach();
        let log = MessageLog::new();
        log.attach_to(&bus);
        (bus, core, log)
    }

    fn withdraw_all_control_rods(bus: &MessageBus) {
        for i in 0..CONTROL_ROD_CELLS.len() {
            bus.emit(Message::PositionUpdate {
                id: format!("rod_{i}"),
                value: 1.0,
            });
        }
    }

    #[test]
    fn test_base_reactivity_is_symmetric() {
        let states = Array2::from_elem((GRID_SIZE, GRID_SIZE), RodState::Engaged);
        let base = base_reactivity(&states, 2.0);
        assert!((base[[0, 0]] - base[[5, 5]]).abs() < 1e-12);
        assert!((base[[0, 5]] - base[[5, 0]]).abs() < 1e-12);
        // The centre sees more neighbours than a corner
        assert!(base[[2, 2]] > base[[0, 0]]);
    }

    #[test]
    fn test_full_insertion_outweighs_every_base() {
        let model = CoreModel::new(CoreTuning::default());
        for (x, y) in cells() {
            assert!(model.interference(x, y) >= model.base[[x, y]], "cell ({x}, {y})");
        }
    }

    #[tokio::test]
    async fn test_idle_until_on() {
        let (bus, core, log) = setup();
        core.tick().unwrap();
        assert!(log.is_empty());

        bus.emit(Message::state_change(AppState::On));
        core.tick().unwrap();
        assert_eq!(
            log.count_where(|m| matches!(m, Message::TemperatureUpdate { .. })),
            GRID_SIZE * GRID_SIZE
        );
        assert_eq!(log.count_where(|m| matches!(m, Message::CoreTempUpdate { .. })), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_withdrawn_rod_reduces_neighbour_reactivity() {
        let (bus, core, _log) = setup();
        bus.emit(Message::state_change(AppState::On));
        withdraw_all_control_rods(&bus);
        core.tick().unwrap();
        let before = core.reactivity(2, 3).unwrap();
        assert!(before > 0.0);

        bus.emit(Message::FuelRodStateToggle {
            id: "fuel_rod_button_2_2".into(),
            x: 2,
            y: 2,
        });
        assert_eq!(core.rod_state(2, 2), Some(RodState::Transitioning));

        time::sleep(Duration::from_millis(5000)).await;
        core.tick().unwrap();
        assert_eq!(core.rod_state(2, 2), Some(RodState::Withdrawn));

        // Recalculation is debounced
        time::sleep(Duration::from_millis(1100)).await;
        core.tick().unwrap();
        assert!(core.reactivity(2, 3).unwrap() < before);
        assert_eq!(core.reactivity(2, 2), Some(0.0));
    }

    #[tokio::test]
    async fn test_toggle_ignored_mid_transition() {
        let (_bus, core, log) = setup();
        core.toggle(1, 2);
        core.toggle(1, 2);
        core.toggle(GRID_SIZE, 0);
        assert_eq!(
            log.count_where(|m| matches!(m, Message::FuelRodStateUpdate { .. })),
            1
        );
    }

    #[tokio::test]
    async fn test_scram_collapses_reactivity() {
        let (bus, core, log) = setup();
        bus.emit(Message::state_change(AppState::On));
        withdraw_all_control_rods(&bus);
        core.tick().unwrap();
        assert!(core.reactivity(3, 3).unwrap() > 0.0);

        bus.emit(Message::state_change(AppState::Scram));
        assert!(core.control_rods().iter().all(|rod| rod.position == 0.0));
        assert_eq!(
            log.count_where(|m| matches!(m, Message::ControlRodPositionUpdate { value, .. } if *value == 0.0)),
            CONTROL_ROD_CELLS.len()
        );

        // Sliders cannot pull rods during SCRAM
        withdraw_all_control_rods(&bus);
        core.tick().unwrap();
        for (x, y) in cells() {
            assert_eq!(core.reactivity(x, y), Some(0.0));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_re_engages_withdrawn_rods() {
        let (bus, core, log) = setup();
        core.toggle(4, 2);
        bus.emit(Message::state_change(AppState::On));
        time::sleep(Duration::from_millis(5000)).await;
        core.tick().unwrap();
        assert_eq!(core.rod_state(4, 2), Some(RodState::Withdrawn));

        bus.emit(Message::state_change(AppState::Shutdown));
        bus.emit(Message::state_change(AppState::On));
        assert_eq!(core.rod_state(4, 2), Some(RodState::Transitioning));
        time::sleep(Duration::from_millis(5000)).await;
        core.tick().unwrap();
        assert_eq!(core.rod_state(4, 2), Some(RodState::Engaged));
        assert!(log.count_where(|m| matches!(m, Message::FuelRodStateUpdate { state: RodState::Engaged, .. })) >= 1);
    }

    #[tokio::test]
    async fn test_hot_core_reports_critical() {
        let (bus, core, log) = setup();
        bus.emit(Message::state_change(AppState::On));
        withdraw_all_control_rods(&bus);
        bus.emit(Message::FlowRateUpdate { value: 0.0 });
        for _ in 0..100 {
            core.tick().unwrap();
        }
        let last = log
            .messages()
            .into_iter()
            .rev()
            .find_map(|m| match m {
                Message::CoreStateUpdate { value } => Some(value),
                _ => None,
            });
        // Equilibrium of the hottest cells sits between warning and critical
        assert_eq!(last, Some(Condition::Warning));
        assert!(core.temperature(2, 2).unwrap() > 0.7);
    }

    #[tokio::test]
    async fn test_accessors_reject_cells_off_the_grid() {
        let (_bus, core, _log) = setup();
        assert!(core.base_reactivity(0, 0).is_some());
        assert_eq!(core.base_reactivity(GRID_SIZE, 0), None);
        assert_eq!(core.reactivity(0, GRID_SIZE), None);
        assert_eq!(core.temperature(GRID_SIZE, GRID_SIZE), None);
        assert_eq!(core.rod_state(7, 1), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_average_counts_only_engaged_rods() {
        let (bus, core, log) = setup();
        bus.emit(Message::state_change(AppState::On));
        withdraw_all_control_rods(&bus);
        bus.emit(Message::FlowRateUpdate { value: 0.0 });
        for _ in 0..50 {
            core.tick().unwrap();
        }

        core.toggle(2, 2);
        time::sleep(Duration::from_millis(5000)).await;
        core.tick().unwrap();
        assert_eq!(core.rod_state(2, 2), Some(RodState::Withdrawn));
        let withdrawn_heat = core.temperature(2, 2).unwrap();
        assert!(withdrawn_heat > 0.0);

        let engaged: f64 = cells()
            .filter(|&(x, y)| core.rod_state(x, y) == Some(RodState::Engaged))
            .filter_map(|(x, y)| core.temperature(x, y))
            .sum();
        let cell_count = (GRID_SIZE * GRID_SIZE) as f64;
        let reported = log
            .messages()
            .into_iter()
            .rev()
            .find_map(|m| match m {
                Message::CoreTempUpdate { value } => Some(value),
                _ => None,
            })
            .unwrap();
        assert!((reported - engaged / cell_count).abs() < 1e-12);
        assert!(reported < (engaged + withdrawn_heat) / cell_count);
    }
}
