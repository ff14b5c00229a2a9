//! Global lease directory and eviction victim selection.
//!
//! Every coordinator publishes its state class and grant time here after
//! each transition. The directory answers the two global questions: how
//! many leases are live, and which idle leases are the oldest when the
//! high-water mark is crossed.

use dashmap::DashMap;
use tokio::time::Instant;

use crate::types::{InodeNumber, LeaseState};

/// Published snapshot of one live coordinator.
#[derive(Clone, Copy, Debug)]
pub struct DirectoryEntry {
    /// Coordinator state at publish time.
    pub state: LeaseState,
    /// Grant time backing the age promotion and eviction ordering.
    pub granted_at: Instant,
}

/// Per-class live lease counts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DirectoryCounts {
    /// Leases in a shared granted state.
    pub shared: usize,
    /// Leases in an exclusive granted state.
    pub exclusive: usize,
    /// Leases mid-transition (releasing, demoting, expired).
    pub transitional: usize,
}

/// Index of live leases across all volumes.
pub struct LeaseDirectory {
    entries: DashMap<(String, InodeNumber), DirectoryEntry>,
}

impl LeaseDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Publishes a coordinator's current state.
    pub fn publish(&self, volume: &str, inode: InodeNumber, state: LeaseState, granted_at: Instant) {
        self.entries
            .insert((volume.to_string(), inode), DirectoryEntry { state, granted_at });
    }

    /// Removes a retired coordinator.
    pub fn remove(&self, volume: &str, inode: InodeNumber) {
        self.entries.remove(&(volume.to_string(), inode));
    }

    /// Number of live leases.
    pub fn live_count(&self) -> usize {
        self.entries.len()
    }

    /// Live lease counts broken down by class.
    pub fn counts(&self) -> DirectoryCounts {
        let mut counts = DirectoryCounts::default();
        for entry in self.entries.iter() {
            match entry.value().state {
                LeaseState::SharedGrantedRecently | LeaseState::SharedGrantedLongAgo => {
                    counts.shared += 1;
                }
                LeaseState::ExclusiveGrantedRecently | LeaseState::ExclusiveGrantedLongAgo => {
                    counts.exclusive += 1;
                }
                _ => counts.transitional += 1,
            }
        }
        counts
    }

    /// Selects up to `count` eviction victims: the leases with the oldest
    /// grant time among those granted long ago. Leases still inside their
    /// minimum lifetime or already transitioning are never selected.
    pub fn select_victims(&self, count: usize) -> Vec<(String, InodeNumber)> {
        let mut candidates: Vec<((String, InodeNumber), Instant)> = self
            .entries
            .iter()
            .filter(|e| e.value().state.is_granted_long_ago())
            .map(|e| (e.key().clone(), e.value().granted_at))
            .collect();
        candidates.sort_by_key(|(_, granted_at)| *granted_at);
        candidates.truncate(count);
        candidates.into_iter().map(|(key, _)| key).collect()
    }
}

impl Default for LeaseDirectory {
    fn default() -> Self {
        Self::new()
    }
}
