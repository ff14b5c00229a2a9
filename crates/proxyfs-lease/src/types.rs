use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use std::fmt;

/// Represents an inode number within a volume's inode space
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InodeNumber(u64);

impl InodeNumber {
    /// The root inode number (always 1)
    pub const ROOT_INODE: InodeNumber = InodeNumber(1);

    /// Creates a new InodeNumber from a raw u64 value
    pub fn new(ino: u64) -> Self {
        InodeNumber(ino)
    }

    /// Returns the raw u64 value of this inode number
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 16-byte identifier for a mount session.
///
/// The textual form is the base64url (unpadded) encoding of the raw bytes;
/// both forms are accepted by the registry.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MountId([u8; 16]);

impl MountId {
    /// Generates a fresh random mount identifier.
    pub fn generate() -> Self {
        MountId(uuid::Uuid::new_v4().into_bytes())
    }

    /// Creates a MountId from raw bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        MountId(bytes)
    }

    /// Returns the raw 16 bytes of this mount id.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Returns the base64url textual form of this mount id.
    pub fn to_text(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    /// Parses a mount id from its base64url textual form.
    pub fn parse_text(text: &str) -> Option<Self> {
        let decoded = URL_SAFE_NO_PAD.decode(text).ok()?;
        let bytes: [u8; 16] = decoded.try_into().ok()?;
        Some(MountId(bytes))
    }
}

impl fmt::Display for MountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_text())
    }
}

impl fmt::Debug for MountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MountId({})", self.to_text())
    }
}

/// Operation a mount may request against an inode lease.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LeaseRequestType {
    /// Acquire a shared (read-only) lease.
    RequestShared,
    /// Upgrade a held shared lease to exclusive.
    PromoteToExclusive,
    /// Acquire an exclusive (read-write) lease.
    RequestExclusive,
    /// Downgrade a held exclusive lease to shared.
    DemoteToShared,
    /// Give up whatever lease is held or requested.
    Release,
}

/// Reply delivered for a lease request, or pushed as a server interrupt.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LeaseReplyType {
    /// The request was refused and is terminal.
    Denied,
    /// A shared lease is now held.
    SharedGranted,
    /// An exclusive lease is now held.
    ExclusiveGranted,
    /// The shared lease was upgraded to exclusive.
    Promoted,
    /// The exclusive lease was downgraded to shared.
    Demoted,
    /// The lease was released.
    Released,
    /// Server asks the holder to release its lease.
    RevokeInterrupt,
    /// Server asks the exclusive holder to downgrade to shared.
    DemoteInterrupt,
}

/// State of one mount's request against one inode.
///
/// Each state corresponds to exactly one queue or slot inside the
/// per-inode coordinator: requested states live in the FIFO, granted
/// shared lives in the holder list, the promoting/exclusive/demoting
/// states occupy their single slots, and releasing states live in the
/// releasing list.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RequestState {
    /// Waiting in the FIFO for a shared grant.
    SharedRequested,
    /// Holds a shared lease.
    SharedGranted,
    /// Shared holder waiting for its promotion to exclusive.
    SharedPromoting,
    /// Shared holder asked to release, acknowledgment pending.
    SharedReleasing,
    /// Waiting in the FIFO for an exclusive grant.
    ExclusiveRequested,
    /// Holds the exclusive lease.
    ExclusiveGranted,
    /// Exclusive holder asked to downgrade, acknowledgment pending.
    ExclusiveDemoting,
    /// Exclusive holder asked to release, acknowledgment pending.
    ExclusiveReleasing,
}

/// State of a per-inode lease coordinator.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LeaseState {
    /// No lease outstanding; the coordinator may retire.
    None,
    /// Shared lease(s) granted within the minimum lease duration.
    SharedGrantedRecently,
    /// Shared lease(s) granted and past the minimum lease duration.
    SharedGrantedLongAgo,
    /// Shared holders have been asked to release.
    SharedReleasing,
    /// Shared holders failed to answer within the interrupt limit.
    SharedExpired,
    /// Exclusive lease granted within the minimum lease duration.
    ExclusiveGrantedRecently,
    /// Exclusive lease granted and past the minimum lease duration.
    ExclusiveGrantedLongAgo,
    /// Exclusive holder has been asked to release.
    ExclusiveReleasing,
    /// Exclusive holder has been asked to downgrade.
    ExclusiveDemoting,
    /// Exclusive holder failed to answer within the interrupt limit.
    ExclusiveExpired,
}

impl LeaseState {
    /// True for the two states eligible for revocation and eviction.
    pub fn is_granted_long_ago(&self) -> bool {
        matches!(
            self,
            LeaseState::SharedGrantedLongAgo | LeaseState::ExclusiveGrantedLongAgo
        )
    }

    /// True while any grant is outstanding.
    pub fn is_live(&self) -> bool {
        !matches!(self, LeaseState::None)
    }
}
