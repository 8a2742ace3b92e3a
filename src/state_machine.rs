//! Operating-state machine
//!
//! The single owner of [`AppState`]. Requests that are not in the
//! transition table are logged and dropped; every accepted transition is
//! announced with `state_change{id:"system", state}`.

use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::bus::{MessageBus, Subscription};
use crate::error::{Result, SimError};
use crate::message::{AppState, Message, Process};

/// What a message asks the machine to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Move to the state if the table allows it
    To(AppState),
    /// Move to the state regardless of the table
    Force(AppState),
}

/// Decide what `msg` asks for while in `current`.
pub fn request_for(current: AppState, msg: &Message) -> Option<Request> {
    use AppState::*;

    if let Message::PowerButtonPress { .. } = msg {
        return match current {
            Off => Some(Request::To(Init)),
            On | Scram => Some(Request::To(Shutdown)),
            Fault => Some(Request::Force(Off)),
            _ => None,
        };
    }

    if current == Off {
        return None;
    }

    match msg {
        Message::ProcessComplete { process, .. } => match (process, current) {
            (Process::Init, Init) => Some(Request::To(Test)),
            (Process::Test, Test) => Some(Request::To(Startup)),
            (Process::Startup, Startup) => Some(Request::To(On)),
            (Process::Shutdown, Shutdown) => Some(Request::To(Off)),
            _ => None,
        },
        Message::ProcessFault { .. } => Some(Request::Force(Fault)),
        Message::ScramButtonPress { .. } | Message::EmergencyScram { .. } => {
            if current == Scram {
                Some(Request::To(On))
            } else {
                Some(Request::To(Scram))
            }
        }
        _ => None,
    }
}

pub struct StateMachine {
    bus: Arc<MessageBus>,
    state: Mutex<AppState>,
}

impl StateMachine {
    pub fn new(bus: Arc<MessageBus>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            state: Mutex::new(AppState::Off),
        })
    }

    pub fn attach(self: &Arc<Self>) -> Subscription {
        let me = Arc::downgrade(self);
        self.bus.subscribe(move |msg| {
            if let Some(machine) = me.upgrade() {
                machine.handle(msg);
            }
        })
    }

    pub fn current(&self) -> AppState {
        *self.state.lock()
    }

    pub fn handle(&self, msg: &Message) {
        let current = self.current();
        let Some(request) = request_for(current, msg) else {
            if current == AppState::Off && is_lifecycle(msg) {
                debug!("Ignoring {} while off", msg.kind());
            }
            return;
        };

        if let Message::ProcessFault { process, id } = msg {
            warn!("Process fault reported by {id}: {process}");
        }

        let result = match request {
            Request::To(next) => self.request(next),
            Request::Force(next) => self.force(next),
        };
        if let Err(err) = result {
            warn!("Dropping {}: {err}", msg.kind());
        }
    }

    /// Apply a table-checked transition.
    ///
    /// Returns `Ok(false)` without emitting when already in `next`.
    pub fn request(&self, next: AppState) -> Result<bool> {
        self.commit(next, false)
    }

    /// Apply a transition without consulting the table.
    pub fn force(&self, next: AppState) -> Result<bool> {
        self.commit(next, true)
    }

    fn commit(&self, next: AppState, forced: bool) -> Result<bool> {
        let from = {
            let mut state = self.state.lock();
            let from = *state;
            if from == next {
                debug!("Already {next}");
                return Ok(false);
            }
            if !forced && !from.can_transition_to(next) {
                return Err(SimError::InvalidTransition { from, to: next });
            }
            *state = next;
            from
        };

        info!("State transition: {from} -> {next}");
        self.bus.emit(Message::state_change(next));
        Ok(true)
    }

    #[cfg(test)]
    fn with_state(bus: Arc<MessageBus>, state: AppState) -> Arc<Self> {
        Arc::new(Self {
            bus,
            state: Mutex::new(state),
        })
    }
}

fn is_lifecycle(msg: &Message) -> bool {
    matches!(
        msg,
        Message::ProcessComplete { .. }
            | Message::ProcessFault { .. }
            | Message::ScramButtonPress { .. }
            | Message::EmergencyScram { .. }
    )
}
