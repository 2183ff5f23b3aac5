//! Interrupt plumbing between a running script and whoever needs to stop it.
//!
//! The host installs a [`ScriptInterrupt`] into an [`InterruptTarget`] as soon as
//! its isolate exists. Anything holding a clone of the target can then force the
//! isolate to stop, from any thread.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Something that can force a running script to stop executing.
///
/// Implementations must be callable from any thread and must tolerate being
/// called after the script has already finished.
pub trait ScriptInterrupt: Send + Sync + 'static {
    fn interrupt(&self);
}

/// Shared slot holding the interrupter of the script currently executing.
#[derive(Clone, Default)]
pub struct InterruptTarget {
    slot: Arc<Mutex<Option<Arc<dyn ScriptInterrupt>>>>,
    fired: Arc<AtomicUsize>,
}

impl InterruptTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the interrupter for the running script, replacing any previous one.
    pub fn install(&self, interrupt: Arc<dyn ScriptInterrupt>) {
        *self.slot.lock() = Some(interrupt);
    }

    /// Remove the interrupter once the script is done with its isolate.
    pub fn clear(&self) {
        self.slot.lock().take();
    }

    pub fn is_installed(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Interrupt the installed script, if any.
    ///
    /// Returns `false` when nothing was installed yet.
    pub fn fire(&self) -> bool {
        // Clone out so the lock is not held across the interrupt call.
        let current = self.slot.lock().clone();
        match current {
            Some(interrupt) => {
                self.fired.fetch_add(1, Ordering::SeqCst);
                interrupt.interrupt();
                true
            }
            None => false,
        }
    }

    /// Number of interrupts delivered to an installed script.
    pub fn fired_count(&self) -> usize {
        self.fired.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for InterruptTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptTarget")
            .field("installed", &self.is_installed())
            .field("fired", &self.fired_count())
            .finish()
    }
}
