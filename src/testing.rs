//! Message recording for tests and traces

use std::sync::Arc;

use parking_lot::Mutex;

use crate::bus::{MessageBus, Subscription};
use crate::message::{AppState, Message, Process};

/// Records every message seen on a bus, in delivery order.
#[derive(Clone, Default)]
pub struct MessageLog {
    messages: Arc<Mutex<Vec<Message>>>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach_to(&self, bus: &MessageBus) -> Subscription {
        let messages = Arc::clone(&self.messages);
        bus.subscribe(move |msg| messages.lock().push(msg.clone()))
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    pub fn clear(&self) {
        self.messages.lock().clear();
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.messages.lock().iter().map(Message::kind).collect()
    }

    /// Every state announced through `state_change`, in order.
    pub fn states(&self) -> Vec<AppState> {
        self.messages
            .lock()
            .iter()
            .filter_map(|msg| match msg {
                Message::StateChange { state, .. } => Some(*state),
                _ => None,
            })
            .collect()
    }

    pub fn count_where(&self, predicate: impl Fn(&Message) -> bool) -> usize {
        self.messages.lock().iter().filter(|msg| predicate(msg)).count()
    }

    pub fn completed(&self, process: Process) -> usize {
        self.count_where(|msg| {
            matches!(msg, Message::ProcessComplete { process: p, .. } if *p == process)
        })
    }

    pub fn faulted(&self, process: Process) -> usize {
        self.count_where(|msg| {
            matches!(msg, Message::ProcessFault { process: p, .. } if *p == process)
        })
    }
}
