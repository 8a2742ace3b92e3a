//! Reactor Control-Panel Simulator - Main Entry Point
//!
//! Headless run: power the plant up against a scripted panel, let it run,
//! optionally SCRAM, then power it down.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};
use reactor_panel_lib::message::Message;
use reactor_panel_lib::{AppState, MessageBus, SimConfig, Simulation};

#[derive(Parser, Debug)]
#[command(name = "reactor-panel", about = "Headless reactor control-panel simulation")]
struct Args {
    /// JSON config file (defaults to config/reactor_panel.json when present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// How long to stay powered on
    #[arg(long, default_value_t = 30)]
    duration_secs: u64,

    /// Override the tick period
    #[arg(long)]
    tick_ms: Option<u64>,

    /// Press SCRAM this many seconds after reaching `on`
    #[arg(long)]
    scram_after_secs: Option<u64>,

    /// Target average core temperature for the regulator
    #[arg(long, default_value_t = 0.5)]
    target_temp: f64,

    /// Component ids that never answer handshakes (repeatable)
    #[arg(long)]
    silent: Vec<String>,

    /// Print every bus message as a JSON line
    #[arg(long)]
    trace: bool,
}

fn main() {
    // Initialize logging
    env_logger::init();

    let args = Args::parse();
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("Failed to start runtime: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = runtime.block_on(run(args)) {
        error!("{err}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> reactor_panel_lib::Result<()> {
    let mut config = SimConfig::load(args.config.as_deref())?;
    if let Some(tick_ms) = args.tick_ms {
        config.tick_interval_ms = tick_ms;
    }
    let startup_wait = Duration::from_millis(config.timeouts.startup_delay_ms) + Duration::from_secs(1);
    let shutdown_wait = Duration::from_millis(config.timeouts.shutdown_fail_ms) + Duration::from_secs(1);

    // The tracer subscribes first so it prints in dispatch order
    let bus = Arc::new(MessageBus::new(config.bus_mode));
    if args.trace {
        bus.subscribe(|msg| match msg.to_json() {
            Ok(line) => println!("{line}"),
            Err(err) => warn!("Unprintable message: {err}"),
        });
    }
    let sim = Simulation::with_bus(config, bus)?;
    let panel = sim.attach_panel();
    for id in &args.silent {
        panel.silence(id.as_str());
    }

    sim.press_power();
    tokio::time::sleep(startup_wait).await;
    if sim.state() != AppState::On {
        warn!("Plant did not reach on (state {})", sim.state());
    }
    sim.bus.emit(Message::TargetTempUpdate {
        value: args.target_temp,
    });

    let duration = Duration::from_secs(args.duration_secs);
    match args.scram_after_secs.map(Duration::from_secs) {
        Some(scram_after) if scram_after < duration => {
            tokio::time::sleep(scram_after).await;
            info!("Operator SCRAM");
            sim.press_scram();
            tokio::time::sleep(duration - scram_after).await;
        }
        _ => tokio::time::sleep(duration).await,
    }

    info!("Powering down from {}", sim.state());
    sim.press_power();
    let deadline = tokio::time::Instant::now() + shutdown_wait;
    while sim.state() == AppState::Shutdown && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    if sim.state() == AppState::Fault {
        warn!("Shutdown faulted, forcing off");
        sim.press_power();
    }

    info!(
        "Final state {} after {} ticks",
        sim.state(),
        sim.ticks.counter()
    );
    sim.teardown();
    Ok(())
}
