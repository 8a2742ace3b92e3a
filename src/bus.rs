//! Publish/subscribe message bus
//!
//! Dispatch is synchronous and in subscription order. A handler may emit
//! from inside its own invocation; the nested message is dispatched
//! immediately, before the outer dispatch continues.
//!
//! Two modes exist:
//! - [`BusMode::Open`] delivers every message.
//! - [`BusMode::PowerGated`] models the master power path. While unpowered,
//!   only `power_button_press{id:"master"}` gets through (and powers the
//!   bus). Once powered, `state_change{state:"off"}` is delivered and then
//!   closes the gate again.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, error, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::message::{AppState, Message, MASTER_ID};

/// A subscriber callback
pub type Handler = Arc<dyn Fn(&Message) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusMode {
    #[default]
    Open,
    PowerGated,
}

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    handlers: Vec<(u64, Handler)>,
}

/// Handle returned by [`MessageBus::subscribe`]
pub struct Subscription {
    id: u64,
    subscribers: Weak<Mutex<Subscribers>>,
}

impl Subscription {
    /// Remove the handler. Returns false if it was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(subscribers) = self.subscribers.upgrade() else {
            return false;
        };
        let mut subscribers = subscribers.lock();
        let before = subscribers.handlers.len();
        subscribers.handlers.retain(|(id, _)| *id != self.id);
        subscribers.handlers.len() != before
    }
}

enum Gate {
    Deliver,
    DeliverThenClose,
    Drop,
}

/// Synchronous, reentrant publish/subscribe channel
pub struct MessageBus {
    mode: BusMode,
    powered: AtomicBool,
    subscribers: Arc<Mutex<Subscribers>>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(BusMode::Open)
    }
}

impl MessageBus {
    pub fn new(mode: BusMode) -> Self {
        Self {
            mode,
            powered: AtomicBool::new(false),
            subscribers: Arc::new(Mutex::new(Subscribers::default())),
        }
    }

    /// Delivery mode chosen at construction
    pub fn mode(&self) -> BusMode {
        self.mode
    }

    /// Whether the power gate is open. Always true for an open bus.
    pub fn is_powered(&self) -> bool {
        self.mode == BusMode::Open || self.powered.load(Ordering::SeqCst)
    }

    /// Register `handler` behind every existing subscriber.
    ///
    /// Dropping the returned [`Subscription`] keeps the handler; call
    /// [`Subscription::unsubscribe`] to remove it.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let mut subscribers = self.subscribers.lock();
        let id = subscribers.next_id;
        subscribers.next_id += 1;
        subscribers.handlers.push((id, Arc::new(handler)));
        Subscription {
            id,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    /// Number of registered handlers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().handlers.len()
    }

    /// Deliver `msg` to every current subscriber.
    ///
    /// A panicking handler is logged and skipped; the remaining handlers
    /// still receive the message.
    pub fn emit(&self, msg: Message) {
        let gate = self.admit(&msg);
        if let Gate::Drop = gate {
            debug!("Bus unpowered, dropping {}", msg.kind());
            return;
        }

        // Snapshot so handlers can subscribe or emit while we dispatch
        let handlers: Vec<Handler> = self
            .subscribers
            .lock()
            .handlers
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        for handler in handlers {
            let result = panic::catch_unwind(AssertUnwindSafe(|| handler(&msg)));
            if let Err(payload) = result {
                error!(
                    "Subscriber panicked while handling {}: {}",
                    msg.kind(),
                    panic_reason(payload.as_ref())
                );
            }
        }

        if let Gate::DeliverThenClose = gate {
            self.powered.store(false, Ordering::SeqCst);
            info!("Bus powered off");
        }
    }

    /// Drop every subscriber.
    pub fn clear(&self) {
        self.subscribers.lock().handlers.clear();
    }

    fn admit(&self, msg: &Message) -> Gate {
        if self.mode == BusMode::Open {
            return Gate::Deliver;
        }

        if !self.powered.load(Ordering::SeqCst) {
            return match msg {
                Message::PowerButtonPress { id } if id == MASTER_ID => {
                    self.powered.store(true, Ordering::SeqCst);
                    info!("Bus powered on");
                    Gate::Deliver
                }
                _ => Gate::Drop,
            };
        }

        match msg {
            Message::StateChange {
                state: AppState::Off,
                ..
            } => Gate::DeliverThenClose,
            _ => Gate::Deliver,
        }
    }
}

pub(crate) fn panic_reason(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MessageLog;

    #[test]
    fn test_delivers_in_subscription_order() {
        let bus = MessageBus::default();
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let order = Arc::clone(&order);
            bus.subscribe(move |_| order.lock().push(n));
        }
        bus.emit(Message::power_button("x"));
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = MessageBus::default();
        let log = MessageLog::new();
        let sub = log.attach_to(&bus);
        bus.emit(Message::power_button("a"));
        assert!(sub.unsubscribe());
        bus.emit(Message::power_button("b"));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let bus = MessageBus::default();
        bus.subscribe(|_| panic!("broken gauge"));
        let log = MessageLog::new();
        log.attach_to(&bus);
        bus.emit(Message::scram_button("scram"));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_nested_emit_dispatches_immediately() {
        let bus = Arc::new(MessageBus::default());
        let log = MessageLog::new();
        let weak = Arc::downgrade(&bus);
        bus.subscribe(move |msg| {
            if let Message::PowerButtonPress { .. } = msg {
                if let Some(bus) = weak.upgrade() {
                    bus.emit(Message::state_change(AppState::Init));
                }
            }
        });
        log.attach_to(&bus);
        bus.emit(Message::power_button("master"));
        // The nested state_change reaches the log before the outer message
        assert_eq!(log.kinds(), vec!["state_change", "power_button_press"]);
    }

    #[test]
    fn test_clear_drops_everything() {
        let bus = MessageBus::default();
        let log = MessageLog::new();
        log.attach_to(&bus);
        bus.clear();
        bus.emit(Message::power_button("master"));
        assert!(log.is_empty());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_power_gate() {
        let bus = MessageBus::new(BusMode::PowerGated);
        let log = MessageLog::new();
        log.attach_to(&bus);

        bus.emit(Message::scram_button("scram"));
        bus.emit(Message::power_button("not_master"));
        assert!(log.is_empty());
        assert!(!bus.is_powered());

        bus.emit(Message::power_button("master"));
        assert!(bus.is_powered());
        bus.emit(Message::scram_button("scram"));
        assert_eq!(log.len(), 2);

        // Off is delivered, then the gate closes
        bus.emit(Message::state_change(AppState::Off));
        assert_eq!(log.len(), 3);
        assert!(!bus.is_powered());
        bus.emit(Message::scram_button("scram"));
        assert_eq!(log.len(), 3);
    }
}
