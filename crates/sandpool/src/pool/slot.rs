use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::OnceCell;

use super::{PoolError, ResourceFactory};

/// One unit of pool capacity. The value is built at most once.
pub(crate) struct Slot<H> {
    cell: OnceCell<H>,
    /// Construction was started eagerly by the replenisher
    forced: bool,
    released: AtomicBool,
    /// Unbound from its key by `remove`
    detached: AtomicBool,
}

impl<H: Clone + Send + Sync + 'static> Slot<H> {
    pub(crate) fn new(forced: bool) -> Self {
        Self {
            cell: OnceCell::new(),
            forced,
            released: AtomicBool::new(false),
            detached: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_forced(&self) -> bool {
        self.forced
    }

    /// Construct on first use; concurrent callers share one construction.
    /// A failed construction leaves the slot empty so the next caller retries.
    pub(crate) async fn value(&self, factory: &dyn ResourceFactory<H>) -> Result<H, PoolError> {
        self.cell
            .get_or_try_init(|| factory.create())
            .await
            .cloned()
    }

    pub(crate) fn detach(&self) {
        self.detached.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    pub(crate) fn constructed(&self) -> Option<H> {
        self.cell.get().cloned()
    }

    /// Hand out the value for release, at most once over the slot's life.
    pub(crate) fn take_for_release(&self) -> Option<H> {
        let value = self.cell.get()?;
        if self.released.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(value.clone())
    }
}
