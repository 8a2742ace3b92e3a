//! Acknowledgment registry
//!
//! Tracks which components still owe an acknowledgment for the phase in
//! progress (init or shutdown). Completion is signalled the moment the last
//! acknowledgment lands; there is no polling.

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::bus::{MessageBus, Subscription};
use crate::manifest::ComponentManifest;
use crate::message::{Message, Process};
use crate::timer::TimerSlot;

/// Callback run when the last pending component acknowledges
pub type Completion = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Initializing,
    ShuttingDown,
}

impl Phase {
    fn process(self) -> Option<Process> {
        match self {
            Phase::Idle => None,
            Phase::Initializing => Some(Process::Init),
            Phase::ShuttingDown => Some(Process::Shutdown),
        }
    }
}

struct Inner {
    pending: HashSet<String>,
    phase: Phase,
    on_complete: Option<Completion>,
}

/// Pending-acknowledgment set shared by the init and shutdown phases
pub struct Registry {
    manifest: Arc<ComponentManifest>,
    inner: Mutex<Inner>,
    diagnostic: TimerSlot,
    warn_after: Duration,
    me: Weak<Registry>,
}

impl Registry {
    /// Create an idle registry with every manifest id pending. `warn_after`
    /// is how long a phase may run before the stragglers are logged.
    pub fn new(manifest: Arc<ComponentManifest>, warn_after: Duration, runtime: Handle) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            inner: Mutex::new(Inner {
                pending: manifest.all_ids().iter().cloned().collect(),
                phase: Phase::Idle,
                on_complete: None,
            }),
            manifest,
            diagnostic: TimerSlot::new(runtime),
            warn_after,
            me: me.clone(),
        })
    }

    /// Feed `acknowledge` messages whose process matches the active phase.
    pub fn attach(self: &Arc<Self>, bus: &MessageBus) -> Subscription {
        let me = Arc::downgrade(self);
        bus.subscribe(move |msg| {
            let Message::Acknowledge { id, process } = msg else {
                return;
            };
            let Some(registry) = me.upgrade() else {
                return;
            };
            if registry.phase().process() == Some(*process) {
                registry.acknowledge(id);
            } else {
                debug!("Ignoring {process} acknowledgment from {id}");
            }
        })
    }

    /// Refill the pending set and drop any phase in progress.
    pub fn reset(&self) {
        self.diagnostic.cancel();
        let mut inner = self.inner.lock();
        inner.pending = self.manifest.all_ids().iter().cloned().collect();
        inner.phase = Phase::Idle;
        inner.on_complete = None;
    }

    /// Start the init phase. Runs `on_complete` immediately when the
    /// manifest is empty.
    pub fn begin(&self, on_complete: Completion) {
        self.start(Phase::Initializing, on_complete);
    }

    /// Start the shutdown phase.
    pub fn begin_shutdown(&self, on_complete: Completion) {
        self.start(Phase::ShuttingDown, on_complete);
    }

    /// Record an acknowledgment. Returns true if it removed a pending id.
    ///
    /// Ignored when no phase is active or the id is not pending. The
    /// completion callback runs at most once per phase.
    pub fn acknowledge(&self, component_id: &str) -> bool {
        let completion = {
            let mut inner = self.inner.lock();
            if inner.phase == Phase::Idle || !inner.pending.remove(component_id) {
                return false;
            }
            if !inner.pending.is_empty() {
                return true;
            }
            info!("All components acknowledged ({:?})", inner.phase);
            inner.phase = Phase::Idle;
            inner.on_complete.take()
        };

        self.diagnostic.cancel();
        if let Some(done) = completion {
            done();
        }
        true
    }

    /// Phase in progress
    pub fn phase(&self) -> Phase {
        self.inner.lock().phase
    }

    /// Whether a phase is waiting for acknowledgments
    pub fn is_active(&self) -> bool {
        self.phase() != Phase::Idle
    }

    /// Ids still owing an acknowledgment, sorted.
    pub fn pending(&self) -> Vec<String> {
        let mut pending: Vec<String> = self.inner.lock().pending.iter().cloned().collect();
        pending.sort();
        pending
    }

    fn start(&self, phase: Phase, on_complete: Completion) {
        self.reset();
        let completion = {
            let mut inner = self.inner.lock();
            if inner.pending.is_empty() {
                Some(on_complete)
            } else {
                inner.phase = phase;
                inner.on_complete = Some(on_complete);
                None
            }
        };

        if let Some(done) = completion {
            done();
            return;
        }

        let me = self.me.clone();
        self.diagnostic.once(self.warn_after, move || {
            if let Some(registry) = me.upgrade() {
                if registry.phase() == phase {
                    warn!(
                        "Components that have not acknowledged ({phase:?}): {:?}",
                        registry.pending()
                    );
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Category;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manifest(ids: &[&str]) -> Arc<ComponentManifest> {
        Arc::new(ComponentManifest::new(vec![(
            Category::Buttons,
            ids.iter().map(|s| s.to_string()).collect(),
        )]))
    }

    fn counter() -> (Arc<AtomicUsize>, Completion) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (count, Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[tokio::test]
    async fn test_completes_exactly_once() {
        let registry = Registry::new(manifest(&["a", "b", "c"]), Duration::from_secs(10), Handle::current());
        let (count, done) = counter();
        registry.begin(done);

        assert!(registry.acknowledge("a"));
        assert!(registry.acknowledge("b"));
        assert!(!registry.acknowledge("b"));
        assert!(!registry.acknowledge("stranger"));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        assert!(registry.acknowledge("c"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(registry.phase(), Phase::Idle);

        // Late acknowledgments after completion are no-ops
        assert!(!registry.acknowledge("c"));
        assert!(!registry.acknowledge("a"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_acknowledge_outside_phase_is_ignored() {
        let registry = Registry::new(manifest(&["a", "b"]), Duration::from_secs(10), Handle::current());
        assert!(!registry.acknowledge("a"));

        let (count, done) = counter();
        registry.begin_shutdown(done);
        assert_eq!(registry.pending(), vec!["a", "b"]);
        registry.acknowledge("a");
        registry.acknowledge("b");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_manifest_completes_immediately() {
        let registry = Registry::new(manifest(&[]), Duration::from_secs(10), Handle::current());
        let (count, done) = counter();
        registry.begin(done);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!registry.is_active());
    }

    #[tokio::test]
    async fn test_reset_abandons_phase() {
        let registry = Registry::new(manifest(&["a"]), Duration::from_secs(10), Handle::current());
        let (count, done) = counter();
        registry.begin(done);
        registry.reset();
        assert!(!registry.acknowledge("a"));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_bus_acknowledgments_match_phase() {
        let bus = MessageBus::default();
        let registry = Registry::new(manifest(&["a"]), Duration::from_secs(10), Handle::current());
        registry.attach(&bus);
        let (count, done) = counter();
        registry.begin(done);

        bus.emit(Message::acknowledge("a", Process::Shutdown));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        bus.emit(Message::acknowledge("a", Process::Init));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
