//! Mount sessions and the mount registry.
//!
//! A mount is one remote client session against a volume. The registry
//! indexes mounts by both the 16-byte id and its base64url text form, and
//! owns the per-mount callback channel used for server-initiated
//! revoke/demote interrupts.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::types::{InodeNumber, LeaseReplyType, MountId};

/// Capacity of a mount's interrupt callback channel.
const INTERRUPT_CHANNEL_CAPACITY: usize = 256;

/// Server-initiated callback asking a mount to release or downgrade a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseInterrupt {
    /// Inode whose lease is being interrupted.
    pub inode: InodeNumber,
    /// `RevokeInterrupt` or `DemoteInterrupt`.
    pub kind: LeaseReplyType,
    /// Interrupt cycle generation, echoed so late acks can be correlated.
    pub generation: u64,
}

/// One mounted client session.
pub struct Mount {
    id: MountId,
    text_id: String,
    volume: String,
    interrupts: mpsc::Sender<LeaseInterrupt>,
    interests: Mutex<HashSet<InodeNumber>>,
    dead: AtomicBool,
}

impl Mount {
    fn new(volume: &str, interrupts: mpsc::Sender<LeaseInterrupt>) -> Self {
        let id = MountId::generate();
        Self {
            id,
            text_id: id.to_text(),
            volume: volume.to_string(),
            interrupts,
            interests: Mutex::new(HashSet::new()),
            dead: AtomicBool::new(false),
        }
    }

    /// The 16-byte mount id.
    pub fn id(&self) -> MountId {
        self.id
    }

    /// The base64url text form of the mount id.
    pub fn text_id(&self) -> &str {
        &self.text_id
    }

    /// Name of the volume this mount belongs to.
    pub fn volume(&self) -> &str {
        &self.volume
    }

    /// Delivers an interrupt callback without blocking.
    ///
    /// A full or closed channel drops the callback; the retransmit cycle
    /// covers the loss.
    pub fn deliver(&self, interrupt: LeaseInterrupt) -> bool {
        match self.interrupts.try_send(interrupt) {
            Ok(()) => true,
            Err(_) => {
                debug!(
                    mount = %self.text_id,
                    inode = %interrupt.inode,
                    "interrupt callback not delivered"
                );
                false
            }
        }
    }

    /// Marks the mount silent/dead; it must re-register to come back.
    pub fn mark_dead(&self) {
        self.dead.store(true, Ordering::SeqCst);
    }

    /// True once the mount has been declared dead.
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    /// Records that this mount holds or waits on a lease for `inode`.
    pub fn add_interest(&self, inode: InodeNumber) {
        self.interests.lock().unwrap().insert(inode);
    }

    /// Forgets a lease interest once its request retires.
    pub fn remove_interest(&self, inode: InodeNumber) {
        self.interests.lock().unwrap().remove(&inode);
    }

    /// Drains the interest set for mount teardown.
    pub fn take_interests(&self) -> Vec<InodeNumber> {
        let mut set = self.interests.lock().unwrap();
        set.drain().collect()
    }

    /// Number of inodes this mount currently tracks.
    pub fn interest_count(&self) -> usize {
        self.interests.lock().unwrap().len()
    }
}

/// Registry of live mounts, indexed by binary and text id.
pub struct MountRegistry {
    by_id: DashMap<MountId, Arc<Mount>>,
    by_text: DashMap<String, MountId>,
}

impl MountRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            by_id: DashMap::new(),
            by_text: DashMap::new(),
        }
    }

    /// Registers a new mount against `volume`, returning the mount and the
    /// receiving end of its interrupt callback channel.
    pub fn register(&self, volume: &str) -> (Arc<Mount>, mpsc::Receiver<LeaseInterrupt>) {
        let (tx, rx) = mpsc::channel(INTERRUPT_CHANNEL_CAPACITY);
        let mount = Arc::new(Mount::new(volume, tx));
        self.by_text.insert(mount.text_id.clone(), mount.id);
        self.by_id.insert(mount.id, mount.clone());
        (mount, rx)
    }

    /// Looks up a mount by binary id.
    pub fn get(&self, id: MountId) -> Option<Arc<Mount>> {
        self.by_id.get(&id).map(|m| m.clone())
    }

    /// Looks up a mount by its base64url text id.
    pub fn get_text(&self, text: &str) -> Option<Arc<Mount>> {
        let id = *self.by_text.get(text)?;
        self.get(id)
    }

    /// Removes a mount from both indexes.
    pub fn remove(&self, id: MountId) -> Option<Arc<Mount>> {
        let (_, mount) = self.by_id.remove(&id)?;
        self.by_text.remove(&mount.text_id);
        Some(mount)
    }

    /// Number of registered mounts.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// True if no mounts are registered.
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl Default for MountRegistry {
    fn default() -> Self {
        Self::new()
    }
}
