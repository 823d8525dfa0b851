//! Handle-indexed ownership of long-lived native objects.
//!
//! The host never sees a native address: it holds opaque integer handles
//! issued here and resolved through the registry on every use. Handles are
//! monotonically increasing and never reused within a process, so a stale
//! handle from a released object can never alias a newer one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use thiserror::Error;

use crate::model::ModelInstance;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("handle {0} does not name a live object")]
    NotFound(u64),
}

/// A table of live objects keyed by issued handle.
///
/// Lookups take the shared lock, so concurrent resolves of distinct handles
/// proceed in parallel; insert and release are exclusive. Values are
/// `Arc`ed: releasing a handle makes it unresolvable immediately while any
/// in-flight user of the object keeps it alive until done.
pub struct Registry<T> {
    entries: RwLock<HashMap<u64, Arc<T>>>,
    next_handle: AtomicU64,
}

impl<T> Registry<T> {
    pub fn new() -> Registry<T> {
        Registry {
            entries: RwLock::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Insert a fully constructed object and issue its handle.
    pub fn insert(&self, value: T) -> u64 {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.write().expect("Poisoned registry lock");
        entries.insert(handle, Arc::new(value));
        handle
    }

    pub fn resolve(&self, handle: u64) -> Result<Arc<T>, RegistryError> {
        let entries = self.entries.read().expect("Poisoned registry lock");
        entries
            .get(&handle)
            .cloned()
            .ok_or(RegistryError::NotFound(handle))
    }

    /// Remove the mapping. A second release of the same handle is
    /// `NotFound`, not undefined behavior.
    pub fn release(&self, handle: u64) -> Result<Arc<T>, RegistryError> {
        let mut entries = self.entries.write().expect("Poisoned registry lock");
        entries.remove(&handle).ok_or(RegistryError::NotFound(handle))
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("Poisoned registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All live entries, for teardown sweeps.
    pub fn snapshot(&self) -> Vec<(u64, Arc<T>)> {
        self.entries
            .read()
            .expect("Poisoned registry lock")
            .iter()
            .map(|(&handle, value)| (handle, Arc::clone(value)))
            .collect()
    }

    /// Drop every remaining entry, for bridge teardown.
    pub fn clear(&self) {
        self.entries
            .write()
            .expect("Poisoned registry lock")
            .clear();
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Registry<T> {
        Registry::new()
    }
}

/// Registry entry for a model: the instance plus its single-run lease.
pub struct ModelEntry {
    instance: ModelInstance,
    active: AtomicBool,
}

impl ModelEntry {
    pub fn new(instance: ModelInstance) -> ModelEntry {
        ModelEntry {
            instance,
            active: AtomicBool::new(false),
        }
    }

    pub fn instance(&self) -> &ModelInstance {
        &self.instance
    }

    /// Claim the instance for one sampling run.
    ///
    /// The sampler's internal state is not safe for concurrent use, so a
    /// second claim while a run is active yields `None` and the caller
    /// reports busy. The permit releases the lease on drop, including on
    /// worker panic.
    pub fn try_acquire(entry: &Arc<ModelEntry>) -> Option<RunPermit> {
        entry
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunPermit {
                entry: Arc::clone(entry),
            })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

/// Exclusive lease on a model for the duration of one run.
pub struct RunPermit {
    entry: Arc<ModelEntry>,
}

impl RunPermit {
    pub fn instance(&self) -> &ModelInstance {
        self.entry.instance()
    }
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        self.entry.active.store(false, Ordering::Release);
    }
}
