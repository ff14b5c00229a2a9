//! Error types for the lease manager.

use thiserror::Error;

/// Errors surfaced by the lease manager.
///
/// Transition violations and `MountGone` reach waiters as the terminal
/// `Denied` reply; `VolumeUnknown` and `VolumeNotAccepting` fail the
/// enclosing request synchronously. `InternalInvariantViolation` indicates
/// a bug and aborts the coordinator rather than being handled.
#[derive(Error, Debug)]
pub enum LeaseError {
    /// The named volume is not in the registry.
    #[error("Volume unknown: {volume}")]
    VolumeUnknown {
        /// Volume name that was requested.
        volume: String,
    },

    /// The volume exists but is not accepting mounts.
    #[error("Volume not accepting mounts: {volume}")]
    VolumeNotAccepting {
        /// Volume name that was requested.
        volume: String,
    },

    /// The mount has been retired or was never registered.
    #[error("Mount gone: {mount}")]
    MountGone {
        /// Textual form of the mount id.
        mount: String,
    },

    /// The requested transition is not legal from the current state.
    #[error("Invalid transition: {reason}")]
    InvalidTransition {
        /// Why the transition is not legal.
        reason: String,
    },

    /// The caller abandoned its request before a reply was delivered.
    #[error("Request cancelled")]
    Cancelled,

    /// Shutdown preconditions are not met.
    #[error("Busy on shutdown: {reason}")]
    BusyOnShutdown {
        /// Which precondition failed.
        reason: String,
    },

    /// A coordinator invariant was violated; this is a bug.
    #[error("Internal invariant violation: {reason}")]
    InternalInvariantViolation {
        /// Description of the violated invariant.
        reason: String,
    },
}

/// Result type alias for lease operations.
pub type Result<T> = std::result::Result<T, LeaseError>;
