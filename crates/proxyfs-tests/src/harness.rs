//! Shared test harness for lease protocol suites.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use proxyfs_lease::{
    InodeNumber, LeaseConfig, LeaseInterrupt, LeaseManager, LeaseReplyType, LeaseRequestType,
    MountId,
};

/// Installs a fmt subscriber honoring `RUST_LOG`, once per process.
/// Handy when debugging a failing scenario.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A lease config with short timings for paused-clock tests: grants age
/// after 100ms, interrupts retransmit every 50ms, four attempts.
pub fn fast_config() -> LeaseConfig {
    LeaseConfig {
        min_lease_duration_ms: 100,
        lease_interrupt_interval_ms: 50,
        lease_interrupt_limit: 4,
        ..Default::default()
    }
}

/// A lease manager serving one volume, plus helpers for driving it from
/// simulated mount sessions.
pub struct TestHarness {
    /// The manager under test.
    pub manager: Arc<LeaseManager>,
    /// Name of the served volume.
    pub volume: String,
}

impl TestHarness {
    /// Harness with `fast_config` timings.
    pub fn new(volume: &str) -> Self {
        Self::with_config(volume, fast_config())
    }

    /// Harness with explicit timings.
    pub fn with_config(volume: &str, config: LeaseConfig) -> Self {
        let manager = LeaseManager::new(config);
        manager.serve_volume(volume).expect("serve test volume");
        Self {
            manager,
            volume: volume.to_string(),
        }
    }

    /// Registers a mount, returning its id and interrupt channel.
    pub async fn mount(&self) -> (MountId, mpsc::Receiver<LeaseInterrupt>) {
        self.manager
            .register_mount(&self.volume)
            .await
            .expect("register mount")
    }

    /// Registers a mount with a background responder that answers every
    /// revoke with a release and every demote with a downgrade, the way a
    /// well-behaved client does.
    pub async fn responsive_mount(&self) -> MountId {
        let (mount, mut interrupts) = self.mount().await;
        let manager = self.manager.clone();
        tokio::spawn(async move {
            while let Some(interrupt) = interrupts.recv().await {
                let answer = match interrupt.kind {
                    LeaseReplyType::RevokeInterrupt => LeaseRequestType::Release,
                    LeaseReplyType::DemoteInterrupt => LeaseRequestType::DemoteToShared,
                    _ => continue,
                };
                let _ = manager.request_wait(mount, interrupt.inode, answer).await;
            }
        });
        mount
    }

    /// Submits a request and awaits its terminal reply.
    pub async fn ask(&self, mount: MountId, ino: u64, rtype: LeaseRequestType) -> LeaseReplyType {
        self.manager
            .request_wait(mount, InodeNumber::new(ino), rtype)
            .await
            .expect("request accepted")
    }

    /// Submits a request and returns the pending reply channel.
    pub async fn begin(
        &self,
        mount: MountId,
        ino: u64,
        rtype: LeaseRequestType,
    ) -> oneshot::Receiver<LeaseReplyType> {
        self.manager
            .request(mount, InodeNumber::new(ino), rtype)
            .await
            .expect("request accepted")
    }

    /// Receives the next interrupt, failing the test if none arrives.
    pub async fn next_interrupt(rx: &mut mpsc::Receiver<LeaseInterrupt>) -> LeaseInterrupt {
        timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("interrupt expected")
            .expect("interrupt channel open")
    }

    /// Drains the volume and takes the manager down, verifying the
    /// shutdown preconditions hold.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.manager.unserve_volume(&self.volume).await?;
        self.manager.down()?;
        Ok(())
    }
}
