#![warn(missing_docs)]

//! ProxyFS inode lease manager: cache-coherence leases across mount sessions.
//!
//! Remote mounts cache inode data and metadata under shared or exclusive
//! leases. Each inode with lease activity gets a single-consumer
//! coordinator actor that grants, promotes, demotes, revokes, and expires
//! leases with FIFO fairness; a global manager indexes coordinators,
//! enforces eviction bounds, and orchestrates shutdown.

/// Lease manager configuration parameters
pub mod config;
/// Per-inode lease coordinator actor
pub mod coordinator;
/// Error types
pub mod error;
/// Global lease directory and eviction victim selection
pub mod evict;
/// Quiescence gate for API traffic
pub mod gate;
/// Interrupt escalation state
pub mod interrupt;
/// Global lease manager
pub mod manager;
/// Mount sessions and registry
pub mod mount;
/// Per-(mount, inode) lease request objects
pub mod request;
/// Clock and timer service
pub mod timer;
/// Core identifier and protocol types
pub mod types;
/// Served volumes and coordinator bookkeeping
pub mod volume;

pub use config::LeaseConfig;
pub use coordinator::{CoordinatorContext, LeaseCoordinator, LeaseOp};
pub use error::{LeaseError, Result};
pub use evict::{DirectoryCounts, LeaseDirectory};
pub use gate::{GateGuard, VolumeGate};
pub use manager::{LeaseManager, ManagerStatus};
pub use mount::{LeaseInterrupt, Mount, MountRegistry};
pub use request::LeaseRequest;
pub use types::{
    InodeNumber, LeaseReplyType, LeaseRequestType, LeaseState, MountId, RequestState,
};
pub use volume::{TaskCount, Volume};
