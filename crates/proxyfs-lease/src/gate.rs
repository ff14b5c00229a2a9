//! Volume gate: quiesces API traffic for checkpoints and reconfiguration.
//!
//! API operations enter as readers; the reconfiguration path is the single
//! writer. Taking the write side drains readers and holds off new ones
//! until finished. The gate serializes nothing among the readers
//! themselves.

use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use crate::error::{LeaseError, Result};

/// Read access to the gate for the duration of one API operation.
pub struct GateGuard {
    _guard: OwnedRwLockReadGuard<()>,
}

/// Readers-writer gate with an explicit start/finish writer protocol.
pub struct VolumeGate {
    lock: Arc<RwLock<()>>,
    writer: Mutex<Option<OwnedRwLockWriteGuard<()>>>,
}

impl VolumeGate {
    /// Creates an open gate.
    pub fn new() -> Self {
        Self {
            lock: Arc::new(RwLock::new(())),
            writer: Mutex::new(None),
        }
    }

    /// Enters the gate as an API operation; waits while reconfiguration
    /// holds the write side.
    pub async fn enter(&self) -> GateGuard {
        GateGuard {
            _guard: self.lock.clone().read_owned().await,
        }
    }

    /// Begins reconfiguration: drains readers and blocks new ones until
    /// `signaled_finish`. Fails if reconfiguration is already signaled.
    pub async fn signaled_start(&self) -> Result<()> {
        if self.writer.lock().unwrap().is_some() {
            return Err(LeaseError::InvalidTransition {
                reason: "gate already signaled".to_string(),
            });
        }
        let guard = self.lock.clone().write_owned().await;
        *self.writer.lock().unwrap() = Some(guard);
        Ok(())
    }

    /// Ends reconfiguration, reopening the gate. Idempotent.
    pub fn signaled_finish(&self) {
        self.writer.lock().unwrap().take();
    }

    /// True while reconfiguration holds the gate.
    pub fn is_signaled(&self) -> bool {
        self.writer.lock().unwrap().is_some()
    }
}

impl Default for VolumeGate {
    fn default() -> Self {
        Self::new()
    }
}
