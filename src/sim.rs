//! Simulation context
//!
//! Builds every component in dependency order and wires it to one bus.
//! Nothing is global, so several simulations can live side by side.

use std::sync::Arc;
use std::time::Duration;

use log::info;
use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::bus::MessageBus;
use crate::config::SimConfig;
use crate::control::ControlSystem;
use crate::coolant::CoolantSystem;
use crate::error::Result;
use crate::generator::GeneratorSystem;
use crate::lifecycle::{InitManager, ShutdownManager, StartupManager, TestManager};
use crate::manifest::ComponentManifest;
use crate::message::{AppState, Message, MASTER_ID};
use crate::panel::EchoPanel;
use crate::reactor_core::CoreSystem;
use crate::registry::Registry;
use crate::state_machine::StateMachine;
use crate::tick::{Subsystem, TickEngine};

/// Every component of one plant, wired to one bus.
pub struct Simulation {
    pub config: SimConfig,
    pub bus: Arc<MessageBus>,
    pub manifest: Arc<ComponentManifest>,
    pub registry: Arc<Registry>,
    pub state_machine: Arc<StateMachine>,
    pub init: Arc<InitManager>,
    pub test: Arc<TestManager>,
    pub startup: Arc<StartupManager>,
    pub shutdown: Arc<ShutdownManager>,
    pub core: Arc<CoreSystem>,
    pub coolant: Arc<CoolantSystem>,
    pub generator: Arc<GeneratorSystem>,
    pub control: Arc<ControlSystem>,
    pub ticks: Arc<TickEngine>,
    panel: Mutex<Option<Arc<EchoPanel>>>,
}

impl Simulation {
    /// Build a simulation on a fresh bus. Must run inside a tokio runtime.
    pub fn new(config: SimConfig) -> Result<Self> {
        let bus = Arc::new(MessageBus::new(config.bus_mode));
        Self::with_bus(config, bus)
    }

    /// Build a simulation on an existing bus, after whatever is already
    /// subscribed to it.
    pub fn with_bus(config: SimConfig, bus: Arc<MessageBus>) -> Result<Self> {
        let runtime = Handle::try_current()?;
        let timeouts = &config.timeouts;

        let manifest = Arc::new(match &config.components {
            Some(entries) => ComponentManifest::from_config(entries),
            None => ComponentManifest::default(),
        });

        let registry = Registry::new(
            Arc::clone(&manifest),
            Duration::from_millis(timeouts.init_warn_ms),
            runtime.clone(),
        );
        let state_machine = StateMachine::new(Arc::clone(&bus));
        let init = InitManager::new(Arc::clone(&bus), Arc::clone(&registry), runtime.clone());
        let test = TestManager::new(
            Arc::clone(&bus),
            Arc::clone(&manifest),
            Duration::from_millis(timeouts.test_warn_ms),
            runtime.clone(),
        );
        let startup = StartupManager::new(
            Arc::clone(&bus),
            Duration::from_millis(timeouts.startup_delay_ms),
            runtime.clone(),
        );
        let shutdown = ShutdownManager::new(
            Arc::clone(&bus),
            Arc::clone(&registry),
            Arc::clone(&manifest),
            Duration::from_millis(timeouts.shutdown_fail_ms),
            runtime.clone(),
        );

        let core = CoreSystem::new(Arc::clone(&bus), config.core.clone(), runtime.clone());
        let coolant = CoolantSystem::new(Arc::clone(&bus), config.coolant.clone());
        let generator = GeneratorSystem::new(Arc::clone(&bus), config.generator.clone());
        let control = ControlSystem::new(
            Arc::clone(&bus),
            config.control.clone(),
            config.core.initial_rod_position,
        );
        let subsystems: Vec<Arc<dyn Subsystem>> = vec![
            control.clone(),
            core.clone(),
            coolant.clone(),
            generator.clone(),
        ];
        let ticks = TickEngine::new(Arc::clone(&bus), subsystems, config.tick_interval(), runtime);

        // The plant sees each state_change before the phase managers start
        // emitting into it.
        ticks.attach();
        core.attach();
        coolant.attach();
        generator.attach();
        control.attach();
        shutdown.attach();
        startup.attach();
        test.attach();
        init.attach();
        registry.attach(&bus);
        state_machine.attach();

        info!(
            "Simulation ready: {} components, {:?} bus, tick every {:?}",
            manifest.len(),
            bus.mode(),
            config.tick_interval()
        );

        Ok(Self {
            config,
            bus,
            manifest,
            registry,
            state_machine,
            init,
            test,
            startup,
            shutdown,
            core,
            coolant,
            generator,
            control,
            ticks,
            panel: Mutex::new(None),
        })
    }

    /// Attach a scripted panel that answers every handshake.
    ///
    /// The simulation keeps the panel alive; attaching again returns the
    /// panel already in place.
    pub fn attach_panel(&self) -> Arc<EchoPanel> {
        let mut slot = self.panel.lock();
        if let Some(panel) = slot.as_ref() {
            return Arc::clone(panel);
        }
        let panel = EchoPanel::new(Arc::clone(&self.bus), Arc::clone(&self.manifest));
        panel.attach();
        *slot = Some(Arc::clone(&panel));
        panel
    }

    /// The scripted panel, if one is attached.
    pub fn panel(&self) -> Option<Arc<EchoPanel>> {
        self.panel.lock().clone()
    }

    /// Current operating state
    pub fn state(&self) -> AppState {
        self.state_machine.current()
    }

    /// Press the master power button.
    pub fn press_power(&self) {
        self.bus.emit(Message::power_button(MASTER_ID));
    }

    /// Press the operator SCRAM button.
    pub fn press_scram(&self) {
        self.bus.emit(Message::scram_button("scram"));
    }

    /// Stop every timer and drop every subscriber.
    pub fn teardown(&self) {
        self.ticks.stop();
        self.registry.reset();
        self.bus.clear();
        self.panel.lock().take();
        info!("Simulation torn down in state {}", self.state());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_runtime() {
        assert!(Simulation::new(SimConfig::default()).is_err());
    }

    #[tokio::test]
    async fn test_independent_instances() {
        let a = Simulation::new(SimConfig::default()).unwrap();
        let b = Simulation::new(SimConfig::default()).unwrap();
        a.press_power();
        assert_eq!(a.state(), AppState::Init);
        assert_eq!(b.state(), AppState::Off);

        a.teardown();
        assert_eq!(a.bus.subscriber_count(), 0);
        assert!(a.panel().is_none());
        a.press_power();
        assert_eq!(a.state(), AppState::Init);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panel_outlives_dropped_handle() {
        let sim = Simulation::new(SimConfig::default()).unwrap();
        drop(sim.attach_panel());
        let subscribers = sim.bus.subscriber_count();
        assert!(Arc::ptr_eq(&sim.attach_panel(), &sim.panel().unwrap()));
        assert_eq!(sim.bus.subscriber_count(), subscribers);

        sim.press_power();
        assert!(sim.registry.pending().is_empty());
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(sim.state(), AppState::Startup);
    }
}
