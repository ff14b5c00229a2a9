//! Served volumes and coordinator bookkeeping.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::Notify;

use crate::coordinator::LeaseOp;
use crate::mount::Mount;
use crate::types::{InodeNumber, MountId};

/// Counter of live tasks with an awaitable zero point.
///
/// The coordinator count per volume; shutdown waits on it reaching zero.
#[derive(Default)]
pub struct TaskCount {
    count: AtomicUsize,
    notify: Notify,
}

impl TaskCount {
    /// Creates a counter at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `n` live tasks.
    pub fn add(&self, n: usize) {
        self.count.fetch_add(n, Ordering::SeqCst);
    }

    /// Marks one task finished, waking waiters at zero.
    pub fn done(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.notify.notify_waiters();
        }
    }

    /// Current live count.
    pub fn current(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Waits until the count reaches zero.
    pub async fn wait_zero(&self) {
        let mut notified = std::pin::pin!(self.notify.notified());
        loop {
            notified.as_mut().enable();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.as_mut().await;
            notified.set(self.notify.notified());
        }
    }
}

/// A served volume: mount membership, per-inode coordinators, accounting.
pub struct Volume {
    name: String,
    accepting_mounts: AtomicBool,
    mounts: DashMap<MountId, Arc<Mount>>,
    coordinators: DashMap<InodeNumber, mpsc::Sender<LeaseOp>>,
    live_coordinators: TaskCount,
}

impl Volume {
    /// Creates a volume that accepts mounts.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            accepting_mounts: AtomicBool::new(true),
            mounts: DashMap::new(),
            coordinators: DashMap::new(),
            live_coordinators: TaskCount::new(),
        }
    }

    /// Volume name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True while new mounts and requests are admitted.
    pub fn accepting(&self) -> bool {
        self.accepting_mounts.load(Ordering::SeqCst)
    }

    /// Stops admitting mounts and requests; existing leases drain.
    pub fn stop_accepting(&self) {
        self.accepting_mounts.store(false, Ordering::SeqCst);
    }

    /// Adds a mount to the volume.
    pub fn add_mount(&self, mount: Arc<Mount>) {
        self.mounts.insert(mount.id(), mount);
    }

    /// Removes a mount from the volume.
    pub fn remove_mount(&self, id: MountId) -> Option<Arc<Mount>> {
        self.mounts.remove(&id).map(|(_, m)| m)
    }

    /// Ids of all mounts on this volume.
    pub fn mount_ids(&self) -> Vec<MountId> {
        self.mounts.iter().map(|e| *e.key()).collect()
    }

    /// Looks up the coordinator channel for `inode`, creating one with
    /// `spawn` if absent.
    pub fn coordinator_or_spawn(
        &self,
        inode: InodeNumber,
        spawn: impl FnOnce() -> mpsc::Sender<LeaseOp>,
    ) -> mpsc::Sender<LeaseOp> {
        self.coordinators
            .entry(inode)
            .or_insert_with(spawn)
            .clone()
    }

    /// Looks up the coordinator channel for `inode` if one exists.
    pub fn coordinator(&self, inode: InodeNumber) -> Option<mpsc::Sender<LeaseOp>> {
        self.coordinators.get(&inode).map(|e| e.clone())
    }

    /// Channels of all live coordinators.
    pub fn coordinator_channels(&self) -> Vec<(InodeNumber, mpsc::Sender<LeaseOp>)> {
        self.coordinators
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    /// Removes the coordinator entry for `inode`, but only if it still
    /// holds `expected` (a retired actor must not unregister a successor).
    pub fn remove_coordinator(&self, inode: InodeNumber, expected: &mpsc::Sender<LeaseOp>) {
        self.coordinators
            .remove_if(&inode, |_, tx| tx.same_channel(expected));
    }

    /// The live-coordinator counter.
    pub fn live_coordinators(&self) -> &TaskCount {
        &self.live_coordinators
    }
}
