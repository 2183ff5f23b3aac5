//! Bounded keyed resource pool
//!
//! A pool owns exactly `max` slots of capacity. Unclaimed slots wait in a FIFO
//! supply that a background replenisher keeps topped up; the first `prewarm`
//! of them are constructed eagerly.
//!
//! ```text
//! get(key) ──► allocated? ──yes──► slot.value()
//!                 │no
//!                 ▼
//!        [allocation lock] ──► supply.recv() ──► bind key ──► slot.value()
//!
//! remove(key) ──► unbind ──► request ──► replenisher ──► supply
//! ```

mod slot;

use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use slot::Slot;

/// Pool errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("Pool capacity must be at least 1")]
    InvalidCapacity,

    #[error("Pool exhausted: all {max} slots are allocated")]
    Exhausted { max: usize },

    #[error("Construction failed: {0}")]
    Construction(String),

    #[error("Pool is shut down")]
    Closed,
}

/// Builds and tears down pooled values.
#[async_trait]
pub trait ResourceFactory<H>: Send + Sync + 'static {
    /// Construct a new value. Values are not tied to a key until claimed.
    async fn create(&self) -> Result<H, PoolError>;

    /// Dispose of a value the pool no longer hands out.
    async fn release(&self, value: H);
}

struct PoolInner<K, H> {
    factory: Arc<dyn ResourceFactory<H>>,
    max: usize,
    prewarm: usize,
    allocated: DashMap<K, Arc<Slot<H>>>,
    /// Unclaimed slots. The lock also serializes new-key allocation.
    supply: Mutex<mpsc::UnboundedReceiver<Arc<Slot<H>>>>,
    requests: mpsc::UnboundedSender<()>,
    unclaimed: AtomicUsize,
    /// Forced slots sitting unclaimed
    warm: AtomicUsize,
    closing: AtomicBool,
    shutdown: CancellationToken,
}

/// Bounded, concurrent, keyed object pool.
pub struct ResourcePool<K, H> {
    inner: Arc<PoolInner<K, H>>,
}

impl<K, H> Clone for ResourcePool<K, H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, H> ResourcePool<K, H>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    H: Clone + Send + Sync + 'static,
{
    /// Create a pool of `max` slots, `prewarm` of them constructed eagerly.
    ///
    /// `prewarm` is capped at `max`. Must be called inside a tokio runtime.
    pub fn new(
        factory: Arc<dyn ResourceFactory<H>>,
        max: usize,
        prewarm: usize,
    ) -> Result<Self, PoolError> {
        if max == 0 {
            return Err(PoolError::InvalidCapacity);
        }

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (supply_tx, supply_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let inner = Arc::new(PoolInner {
            factory,
            max,
            prewarm: prewarm.min(max),
            allocated: DashMap::new(),
            supply: Mutex::new(supply_rx),
            requests: request_tx,
            unclaimed: AtomicUsize::new(0),
            warm: AtomicUsize::new(0),
            closing: AtomicBool::new(false),
            shutdown: shutdown.clone(),
        });

        for _ in 0..max {
            let _ = inner.requests.send(());
        }

        tokio::spawn(replenish(
            Arc::downgrade(&inner),
            request_rx,
            supply_tx,
            shutdown,
        ));

        Ok(Self { inner })
    }

    /// Return the value bound to `key`, binding a fresh slot if the key is new.
    ///
    /// Fails with [`PoolError::Exhausted`] when every slot is bound.
    pub async fn get(&self, key: &K) -> Result<H, PoolError> {
        loop {
            if self.inner.shutdown.is_cancelled() {
                return Err(PoolError::Closed);
            }

            let slot = match self.bound(key) {
                Some(slot) => slot,
                None => self.claim(key).await?,
            };

            let value = slot.value(self.inner.factory.as_ref()).await?;

            if self.inner.shutdown.is_cancelled() {
                if let Some(value) = slot.take_for_release() {
                    self.inner.factory.release(value).await;
                }
                return Err(PoolError::Closed);
            }

            // Removed while under construction: nobody else holds the value.
            if slot.is_detached() {
                if let Some(value) = slot.take_for_release() {
                    debug!("Releasing value built for a removed key");
                    self.inner.factory.release(value).await;
                }
                continue;
            }

            return Ok(value);
        }
    }

    fn bound(&self, key: &K) -> Option<Arc<Slot<H>>> {
        self.inner
            .allocated
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
    }

    async fn claim(&self, key: &K) -> Result<Arc<Slot<H>>, PoolError> {
        let mut supply = self.inner.supply.lock().await;

        // Another caller may have bound the key while we waited for the lock.
        if let Some(slot) = self.bound(key) {
            return Ok(slot);
        }

        if self.inner.allocated.len() >= self.inner.max {
            return Err(PoolError::Exhausted {
                max: self.inner.max,
            });
        }

        // Capacity remains, so a slot is either queued or about to be.
        let slot = tokio::select! {
            slot = supply.recv() => slot.ok_or(PoolError::Closed)?,
            _ = self.inner.shutdown.cancelled() => return Err(PoolError::Closed),
        };

        self.inner.unclaimed.fetch_sub(1, Ordering::SeqCst);
        if slot.is_forced() {
            self.inner.warm.fetch_sub(1, Ordering::SeqCst);
        }

        self.inner.allocated.insert(key.clone(), Arc::clone(&slot));
        Ok(slot)
    }

    /// Unbind `key` and request exactly one replacement slot.
    ///
    /// Returns the bound value if it had been constructed; the caller then owns
    /// its release. A value still under construction is released by the pool.
    pub fn remove(&self, key: &K) -> Option<H> {
        let (_, slot) = self.inner.allocated.remove(key)?;
        slot.detach();

        if self.inner.requests.send(()).is_err() {
            debug!("Replenisher gone, slot not replaced");
        }

        slot.take_for_release()
    }

    /// Unbind `key` and hand its value to the factory's release hook.
    pub async fn remove_and_release(&self, key: &K) -> bool {
        match self.remove(key) {
            Some(value) => {
                self.inner.factory.release(value).await;
                true
            }
            None => false,
        }
    }

    /// Number of bound keys
    pub fn count(&self) -> usize {
        self.inner.allocated.len()
    }

    /// Number of slots waiting to be claimed
    pub fn pending_count(&self) -> usize {
        self.inner.unclaimed.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.inner.max
    }

    /// Constructed values of all bound keys
    pub fn values(&self) -> Vec<H> {
        self.inner
            .allocated
            .iter()
            .filter_map(|entry| entry.value().constructed())
            .collect()
    }

    /// Stop replenishing and release every constructed value, bound or not.
    pub async fn shutdown(&self) {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.cancel();

        let mut slots = Vec::new();
        {
            let mut supply = self.inner.supply.lock().await;
            supply.close();
            while let Ok(slot) = supply.try_recv() {
                slots.push(slot);
            }
        }

        let keys: Vec<K> = self
            .inner
            .allocated
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            if let Some((_, slot)) = self.inner.allocated.remove(&key) {
                slots.push(slot);
            }
        }

        let mut released = 0usize;
        for slot in slots {
            if let Some(value) = slot.take_for_release() {
                self.inner.factory.release(value).await;
                released += 1;
            }
        }

        debug!(released, "Pool shut down");
    }
}

/// Turn replacement requests into supply slots, forcing construction while
/// fewer than `prewarm` forced slots are unclaimed.
async fn replenish<K, H>(
    inner: Weak<PoolInner<K, H>>,
    mut requests: mpsc::UnboundedReceiver<()>,
    supply: mpsc::UnboundedSender<Arc<Slot<H>>>,
    shutdown: CancellationToken,
) where
    K: Eq + Hash + Send + Sync + 'static,
    H: Clone + Send + Sync + 'static,
{
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            request = requests.recv() => {
                if request.is_none() {
                    break;
                }
            }
        }

        let Some(inner) = inner.upgrade() else {
            break;
        };

        let forced = inner.warm.load(Ordering::SeqCst) < inner.prewarm;
        let slot = Arc::new(Slot::new(forced));

        if forced {
            inner.warm.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(force(Arc::clone(&inner), Arc::clone(&slot)));
        }

        inner.unclaimed.fetch_add(1, Ordering::SeqCst);
        if supply.send(slot).is_err() {
            break;
        }
    }
}

async fn force<K, H>(inner: Arc<PoolInner<K, H>>, slot: Arc<Slot<H>>)
where
    K: Eq + Hash + Send + Sync + 'static,
    H: Clone + Send + Sync + 'static,
{
    if let Err(e) = slot.value(inner.factory.as_ref()).await {
        warn!(error = %e, "Eager construction failed, will retry on claim");
        return;
    }

    // Finished after shutdown swept the supply.
    if inner.shutdown.is_cancelled() {
        if let Some(value) = slot.take_for_release() {
            inner.factory.release(value).await;
        }
    }
}
