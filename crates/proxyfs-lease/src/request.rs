//! Per-(mount, inode) lease request objects.

use tokio::sync::oneshot;

use crate::types::{InodeNumber, LeaseReplyType, MountId, RequestState};

/// One mount's interest in one inode.
///
/// Lives in exactly one coordinator queue or slot at a time; its
/// `RequestState` must agree with that placement. The reply slot delivers
/// exactly one terminal reply over the request's lifetime.
#[derive(Debug)]
pub struct LeaseRequest {
    /// Mount this request belongs to.
    pub mount_id: MountId,
    /// Inode this request targets.
    pub inode: InodeNumber,
    /// Current request state; mirrors queue placement.
    pub state: RequestState,
    reply: Option<oneshot::Sender<LeaseReplyType>>,
}

impl LeaseRequest {
    /// Creates a request with a pending reply channel.
    pub fn new(
        mount_id: MountId,
        inode: InodeNumber,
        state: RequestState,
        reply: oneshot::Sender<LeaseReplyType>,
    ) -> Self {
        Self {
            mount_id,
            inode,
            state,
            reply: Some(reply),
        }
    }

    /// Delivers the terminal reply. The first call consumes the channel;
    /// later calls are no-ops, so a holder whose grant reply was already
    /// sent can be dropped without ceremony. Returns true if a waiter
    /// received it.
    pub fn deliver(&mut self, reply: LeaseReplyType) -> bool {
        match self.reply.take() {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Attaches a fresh reply channel for a follow-on operation, e.g. a
    /// promotion by a holder whose original grant reply was consumed.
    ///
    /// A still-pending reply here means two operations raced onto one
    /// request, which the coordinator never allows.
    pub fn attach_reply(&mut self, reply: oneshot::Sender<LeaseReplyType>) {
        assert!(
            !self.has_waiter(),
            "reply channel already pending on lease request"
        );
        self.reply = Some(reply);
    }

    /// True if a waiter existed but has dropped its receiver.
    ///
    /// Such a request is pruned on the coordinator's next pass.
    pub fn is_cancelled(&self) -> bool {
        matches!(&self.reply, Some(tx) if tx.is_closed())
    }

    /// True while a reply is still owed to a live waiter.
    pub fn has_waiter(&self) -> bool {
        matches!(&self.reply, Some(tx) if !tx.is_closed())
    }
}
