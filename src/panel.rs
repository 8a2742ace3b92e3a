//! Scripted stand-in for the renderer
//!
//! Answers every handshake the way a healthy panel would: init and shutdown
//! begins are acknowledged, per-component tests pass. Silenced ids never
//! answer, which is how unresponsive hardware is simulated.

use std::collections::HashSet;
use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;

use crate::bus::{MessageBus, Subscription};
use crate::manifest::ComponentManifest;
use crate::message::{Message, Process};

/// Answers handshakes on behalf of every manifest component
pub struct EchoPanel {
    bus: Arc<MessageBus>,
    manifest: Arc<ComponentManifest>,
    silenced: Mutex<HashSet<String>>,
}

impl EchoPanel {
    pub fn new(bus: Arc<MessageBus>, manifest: Arc<ComponentManifest>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            manifest,
            silenced: Mutex::new(HashSet::new()),
        })
    }

    pub fn attach(self: &Arc<Self>) -> Subscription {
        let me = Arc::downgrade(self);
        self.bus.subscribe(move |msg| {
            if let Some(panel) = me.upgrade() {
                panel.handle(msg);
            }
        })
    }

    /// Stop answering for `id`.
    pub fn silence(&self, id: impl Into<String>) {
        self.silenced.lock().insert(id.into());
    }

    pub fn unsilence(&self, id: &str) {
        self.silenced.lock().remove(id);
    }

    fn responds(&self, id: &str) -> bool {
        self.manifest.contains(id) && !self.silenced.lock().contains(id)
    }

    fn handle(&self, msg: &Message) {
        let Message::ProcessBegin { id, process } = msg else {
            return;
        };
        match process {
            Process::Init => {
                // One broadcast, every component answers
                let ids: Vec<String> = self
                    .manifest
                    .all_ids()
                    .iter()
                    .filter(|id| self.responds(id))
                    .cloned()
                    .collect();
                trace!("Acknowledging init for {} components", ids.len());
                for id in ids {
                    self.bus.emit(Message::acknowledge(id, Process::Init));
                }
            }
            Process::Test if self.responds(id) => {
                self.bus.emit(Message::test_result(id.as_str(), true));
            }
            Process::Shutdown if self.responds(id) => {
                self.bus.emit(Message::acknowledge(id.as_str(), Process::Shutdown));
            }
            _ => {}
        }
    }
}
