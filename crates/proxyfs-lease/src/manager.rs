//! Global lease manager.
//!
//! Owns the volume registry, the mount registry, and the global lease
//! directory; routes client requests to per-inode coordinators; runs the
//! bulk eviction pass when the live lease count crosses the high-water
//! mark; orchestrates volume teardown and shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::config::LeaseConfig;
use crate::coordinator::{self, CoordinatorContext, LeaseOp};
use crate::error::{LeaseError, Result};
use crate::evict::{DirectoryCounts, LeaseDirectory};
use crate::gate::VolumeGate;
use crate::mount::{LeaseInterrupt, MountRegistry};
use crate::types::{InodeNumber, LeaseReplyType, LeaseRequestType, MountId};
use crate::volume::Volume;

/// Capacity of the dead-mount reaper channel.
const DEAD_MOUNT_CHANNEL_CAPACITY: usize = 1024;

/// Point-in-time snapshot of manager-wide accounting.
#[derive(Debug, Clone, Copy)]
pub struct ManagerStatus {
    /// Served volumes.
    pub volumes: usize,
    /// Registered mounts.
    pub mounts: usize,
    /// Live leases across all volumes.
    pub live_leases: usize,
    /// Live leases broken down by class.
    pub counts: DirectoryCounts,
}

/// The lease manager singleton for one server instance.
pub struct LeaseManager {
    config: Arc<LeaseConfig>,
    registry: Arc<MountRegistry>,
    directory: Arc<LeaseDirectory>,
    volumes: DashMap<String, Arc<Volume>>,
    gate: VolumeGate,
    dead_tx: mpsc::Sender<MountId>,
    evicting: AtomicBool,
    closed: AtomicBool,
}

impl LeaseManager {
    /// Brings the manager up with the given configuration.
    pub fn new(config: LeaseConfig) -> Arc<Self> {
        let (dead_tx, mut dead_rx) = mpsc::channel(DEAD_MOUNT_CHANNEL_CAPACITY);
        let manager = Arc::new(Self {
            config: Arc::new(config),
            registry: Arc::new(MountRegistry::new()),
            directory: Arc::new(LeaseDirectory::new()),
            volumes: DashMap::new(),
            gate: VolumeGate::new(),
            dead_tx,
            evicting: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        // Reaper: mounts declared dead by coordinators are torn down here,
        // off the coordinator's own task.
        let weak = Arc::downgrade(&manager);
        tokio::spawn(async move {
            while let Some(mount_id) = dead_rx.recv().await {
                let Some(manager) = weak.upgrade() else { break };
                manager.teardown_mount(mount_id).await;
            }
        });

        manager
    }

    /// Starts serving a volume.
    pub fn serve_volume(&self, name: &str) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LeaseError::BusyOnShutdown {
                reason: "lease manager is down".to_string(),
            });
        }
        match self.volumes.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(LeaseError::InvalidTransition {
                reason: format!("volume {} already served", name),
            }),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Arc::new(Volume::new(name)));
                info!(volume = name, "serving volume");
                Ok(())
            }
        }
    }

    /// Stops serving a volume: new mounts and requests are refused, every
    /// lease is revoked over the normal interrupt path, and the volume is
    /// removed once its coordinators have drained.
    pub async fn unserve_volume(&self, name: &str) -> Result<()> {
        let volume = self
            .volumes
            .get(name)
            .map(|v| v.clone())
            .ok_or_else(|| LeaseError::VolumeUnknown {
                volume: name.to_string(),
            })?;

        volume.stop_accepting();
        for (_, tx) in volume.coordinator_channels() {
            let _ = tx.send(LeaseOp::ForceRevoke).await;
        }
        volume.live_coordinators().wait_zero().await;

        for mount_id in volume.mount_ids() {
            self.teardown_mount(mount_id).await;
        }
        self.volumes.remove(name);
        info!(volume = name, "volume unserved");
        Ok(())
    }

    /// Registers a new mount against `volume`, returning its id and the
    /// receiving end of the interrupt callback channel.
    pub async fn register_mount(
        &self,
        volume: &str,
    ) -> Result<(MountId, mpsc::Receiver<LeaseInterrupt>)> {
        let _gate = self.gate.enter().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(LeaseError::BusyOnShutdown {
                reason: "lease manager is down".to_string(),
            });
        }
        let vol = self
            .volumes
            .get(volume)
            .map(|v| v.clone())
            .ok_or_else(|| LeaseError::VolumeUnknown {
                volume: volume.to_string(),
            })?;
        if !vol.accepting() {
            return Err(LeaseError::VolumeNotAccepting {
                volume: volume.to_string(),
            });
        }
        let (mount, interrupts) = self.registry.register(volume);
        vol.add_mount(mount.clone());
        info!(volume, mount = mount.text_id(), "mount registered");
        Ok((mount.id(), interrupts))
    }

    /// Drops a mount: all its leases and queued requests are released
    /// implicitly, without client cooperation.
    pub async fn drop_mount(&self, mount_id: MountId) -> Result<()> {
        let _gate = self.gate.enter().await;
        if self.registry.get(mount_id).is_none() {
            return Err(LeaseError::MountGone {
                mount: mount_id.to_text(),
            });
        }
        self.teardown_mount(mount_id).await;
        Ok(())
    }

    async fn teardown_mount(&self, mount_id: MountId) {
        let Some(mount) = self.registry.remove(mount_id) else {
            return;
        };
        mount.mark_dead();
        let volume = self.volumes.get(mount.volume()).map(|v| v.clone());
        if let Some(volume) = &volume {
            volume.remove_mount(mount_id);
        }
        let interests = mount.take_interests();
        info!(
            mount = mount.text_id(),
            leases = interests.len(),
            "tearing down mount"
        );
        if let Some(volume) = &volume {
            for inode in interests {
                if let Some(tx) = volume.coordinator(inode) {
                    let _ = tx.send(LeaseOp::ImplicitRelease { mount_id }).await;
                }
            }
        }
    }

    /// Submits a lease request for `inode` on behalf of `mount_id` and
    /// returns the channel the single terminal reply arrives on.
    pub async fn request(
        self: &Arc<Self>,
        mount_id: MountId,
        inode: InodeNumber,
        request_type: LeaseRequestType,
    ) -> Result<oneshot::Receiver<LeaseReplyType>> {
        let _gate = self.gate.enter().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(LeaseError::BusyOnShutdown {
                reason: "lease manager is down".to_string(),
            });
        }
        let mount = self
            .registry
            .get(mount_id)
            .filter(|m| !m.is_dead())
            .ok_or_else(|| LeaseError::MountGone {
                mount: mount_id.to_text(),
            })?;
        let volume = self
            .volumes
            .get(mount.volume())
            .map(|v| v.clone())
            .ok_or_else(|| LeaseError::VolumeUnknown {
                volume: mount.volume().to_string(),
            })?;
        // Acquisitions are refused on a draining volume, but releases and
        // demotes still flow: they are the acknowledgments the interrupt
        // path is waiting for.
        let acquisition = matches!(
            request_type,
            LeaseRequestType::RequestShared
                | LeaseRequestType::RequestExclusive
                | LeaseRequestType::PromoteToExclusive
        );
        if !volume.accepting() && acquisition {
            return Err(LeaseError::VolumeNotAccepting {
                volume: mount.volume().to_string(),
            });
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let ctx = self.context_for(volume);
        coordinator::submit(
            &ctx,
            inode,
            LeaseOp::Request {
                mount_id,
                request_type,
                reply: reply_tx,
            },
        )
        .await?;
        self.maybe_evict();
        Ok(reply_rx)
    }

    /// `request` with the mount identified by its base64url text form.
    pub async fn request_text(
        self: &Arc<Self>,
        mount_text: &str,
        inode: InodeNumber,
        request_type: LeaseRequestType,
    ) -> Result<oneshot::Receiver<LeaseReplyType>> {
        let mount = self
            .registry
            .get_text(mount_text)
            .ok_or_else(|| LeaseError::MountGone {
                mount: mount_text.to_string(),
            })?;
        self.request(mount.id(), inode, request_type).await
    }

    /// Submits a request and awaits its reply.
    pub async fn request_wait(
        self: &Arc<Self>,
        mount_id: MountId,
        inode: InodeNumber,
        request_type: LeaseRequestType,
    ) -> Result<LeaseReplyType> {
        let reply = self.request(mount_id, inode, request_type).await?;
        reply.await.map_err(|_| LeaseError::Cancelled)
    }

    fn context_for(&self, volume: Arc<Volume>) -> CoordinatorContext {
        CoordinatorContext {
            volume,
            registry: self.registry.clone(),
            directory: self.directory.clone(),
            config: self.config.clone(),
            dead_tx: self.dead_tx.clone(),
        }
    }

    /// Kicks off an eviction pass if the live count crossed the high-water
    /// mark and no pass is already running.
    fn maybe_evict(self: &Arc<Self>) {
        if self.directory.live_count() <= self.config.lease_evict_high_limit {
            return;
        }
        if self.evicting.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            live = self.directory.live_count(),
            high = self.config.lease_evict_high_limit,
            "starting lease eviction pass"
        );
        let manager = self.clone();
        tokio::spawn(manager.eviction_pass());
    }

    /// Revokes the oldest idle leases until the live count reaches the low
    /// limit. Victims that aged back into their minimum lifetime or moved
    /// on are skipped by their coordinators; the pass simply re-selects.
    async fn eviction_pass(self: Arc<Self>) {
        loop {
            let live = self.directory.live_count();
            if live <= self.config.lease_evict_low_limit {
                break;
            }
            let victims = self
                .directory
                .select_victims(live - self.config.lease_evict_low_limit);
            if victims.is_empty() {
                // Nothing currently evictable; the next request re-arms.
                break;
            }
            for (volume_name, inode) in victims {
                let Some(volume) = self.volumes.get(&volume_name).map(|v| v.clone()) else {
                    continue;
                };
                if let Some(tx) = volume.coordinator(inode) {
                    let _ = tx.send(LeaseOp::Evict).await;
                }
            }
            tokio::time::sleep(self.config.lease_interrupt_interval()).await;
        }
        self.evicting.store(false, Ordering::SeqCst);
        debug!(live = self.directory.live_count(), "lease eviction pass finished");
    }

    /// The quiescence gate for API traffic and reconfiguration.
    pub fn gate(&self) -> &VolumeGate {
        &self.gate
    }

    /// Manager-wide accounting snapshot.
    pub fn status(&self) -> ManagerStatus {
        ManagerStatus {
            volumes: self.volumes.len(),
            mounts: self.registry.len(),
            live_leases: self.directory.live_count(),
            counts: self.directory.counts(),
        }
    }

    /// The configuration the manager was brought up with.
    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    /// Takes the manager down. Requires that every volume has been
    /// unserved, every mount dropped, and every lease drained.
    pub fn down(&self) -> Result<()> {
        if !self.volumes.is_empty() {
            return Err(LeaseError::BusyOnShutdown {
                reason: format!("{} volumes still served", self.volumes.len()),
            });
        }
        if !self.registry.is_empty() {
            return Err(LeaseError::BusyOnShutdown {
                reason: format!("{} mounts still registered", self.registry.len()),
            });
        }
        if self.directory.live_count() != 0 {
            return Err(LeaseError::BusyOnShutdown {
                reason: format!("{} leases still live", self.directory.live_count()),
            });
        }
        self.closed.store(true, Ordering::SeqCst);
        info!("lease manager down");
        Ok(())
    }
}
