//! Reactor Control-Panel Simulation Library
//!
//! A message bus, the operating-state machine with its lifecycle handshakes,
//! and the coupled core / coolant / generator models advanced by a tick
//! engine. Rendering is external: a panel only talks to this crate through
//! bus messages.

pub mod bus;
pub mod config;
pub mod control;
pub mod coolant;
pub mod error;
pub mod generator;
pub mod lifecycle;
pub mod manifest;
pub mod message;
pub mod panel;
pub mod reactor_core;
pub mod registry;
pub mod sim;
pub mod state_machine;
pub mod testing;
pub mod tick;
pub mod timer;

pub use bus::{BusMode, MessageBus, Subscription};
pub use config::SimConfig;
pub use error::{Result, SimError};
pub use message::{AppState, Message, Process};
pub use sim::Simulation;
