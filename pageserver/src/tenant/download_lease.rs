//! Leases on layer files that are being downloaded.
//!
//! A download holds a [`DownloadLease`] on the layer for as long as it reads
//! from the remote storage. A remote deletion of the same layer first takes a
//! [`DeletionGuard`] with [`DownloadLeases::begin_deletion`], which waits until
//! every lease is dropped. While the guard is alive, new leases on the layer wait
//! for it in [`DownloadLeases::acquire`], so a layer never disappears under an
//! in-flight download.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use utils::id::TenantTimelineId;

use super::storage_layer::LayerFileName;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseKey {
    pub timeline: TenantTimelineId,
    pub layer: LayerFileName,
}

#[derive(Debug, Default)]
struct KeyState {
    leases: usize,
    deleting: bool,
}

#[derive(Default)]
pub struct DownloadLeases {
    keys: Mutex<HashMap<LeaseKey, KeyState>>,
    changed: Notify,
}

impl DownloadLeases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a lease on `key`, waiting for a deletion of the layer in progress to finish first.
    pub async fn acquire(self: &Arc<Self>, key: LeaseKey) -> DownloadLease {
        loop {
            // Register for the wakeup before checking, so a change in between is not missed.
            let changed = self.changed.notified();
            {
                let mut keys = self.keys.lock();
                let state = keys.entry(key.clone()).or_default();
                if !state.deleting {
                    state.leases += 1;
                    return DownloadLease {
                        leases: Arc::clone(self),
                        key,
                    };
                }
            }
            changed.await;
        }
    }

    /// Waits until no lease is held on `key` and marks the layer as being deleted,
    /// in one step under the lock. Returns immediately if there is no lease.
    pub async fn begin_deletion(self: &Arc<Self>, key: LeaseKey) -> DeletionGuard {
        loop {
            let changed = self.changed.notified();
            {
                let mut keys = self.keys.lock();
                let state = keys.entry(key.clone()).or_default();
                if state.leases == 0 && !state.deleting {
                    state.deleting = true;
                    return DeletionGuard {
                        leases: Arc::clone(self),
                        key,
                    };
                }
            }
            changed.await;
        }
    }

    pub fn is_held(&self, key: &LeaseKey) -> bool {
        self.keys
            .lock()
            .get(key)
            .map_or(false, |state| state.leases > 0)
    }

    pub fn is_being_deleted(&self, key: &LeaseKey) -> bool {
        self.keys
            .lock()
            .get(key)
            .map_or(false, |state| state.deleting)
    }

    fn update(&self, key: &LeaseKey, f: impl FnOnce(&mut KeyState)) {
        let mut keys = self.keys.lock();
        if let Some(state) = keys.get_mut(key) {
            f(state);
            if state.leases == 0 && !state.deleting {
                keys.remove(key);
            }
        }
        drop(keys);
        self.changed.notify_waiters();
    }
}

/// RAII guard of a download in progress.
pub struct DownloadLease {
    leases: Arc<DownloadLeases>,
    key: LeaseKey,
}

impl Drop for DownloadLease {
    fn drop(&mut self) {
        self.leases.update(&self.key, |state| state.leases -= 1);
    }
}

/// RAII guard of a remote deletion in progress. No lease on the layer can be taken while it lives.
pub struct DeletionGuard {
    leases: Arc<DownloadLeases>,
    key: LeaseKey,
}

impl Drop for DeletionGuard {
    fn drop(&mut self) {
        self.leases.update(&self.key, |state| state.deleting = false);
    }
}
