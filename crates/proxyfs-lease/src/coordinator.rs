//! Per-inode lease coordinator.
//!
//! One single-consumer actor per inode with live lease activity. All
//! state transitions for an inode are serialized through the actor's
//! bounded request channel; API handlers, timers, and the eviction pass
//! communicate with it exclusively by sending operations.
//!
//! Queue discipline: `promoting_holder` resolves before anything in
//! `requested`; `requested` drains in FIFO order, with a contiguous run
//! of shared requests at the head granted together; an exclusive request
//! at the head blocks everything behind it until its turn.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::LeaseConfig;
use crate::error::{LeaseError, Result};
use crate::evict::LeaseDirectory;
use crate::interrupt::{InterruptState, TickOutcome};
use crate::mount::{LeaseInterrupt, MountRegistry};
use crate::request::LeaseRequest;
use crate::timer::{self, TimerHandle};
use crate::types::{
    InodeNumber, LeaseReplyType, LeaseRequestType, LeaseState, MountId, RequestState,
};
use crate::volume::Volume;

/// Capacity of a coordinator's operation channel.
const OPS_CHANNEL_CAPACITY: usize = 64;

/// Attempts to reach a coordinator before giving up; each failure means a
/// retired actor was replaced, which cannot repeat indefinitely.
const SUBMIT_RETRY_LIMIT: usize = 8;

/// Operations accepted on a coordinator's request channel.
#[derive(Debug)]
pub enum LeaseOp {
    /// Client request carrying its reply channel.
    Request {
        /// Requesting mount.
        mount_id: MountId,
        /// What the mount wants.
        request_type: LeaseRequestType,
        /// Where the single terminal reply goes.
        reply: oneshot::Sender<LeaseReplyType>,
    },
    /// Release on behalf of a mount being torn down; no reply expected.
    ImplicitRelease {
        /// Mount being torn down.
        mount_id: MountId,
    },
    /// Synthetic revoke from the bulk eviction pass; creates no waiter.
    Evict,
    /// Volume teardown: revoke everything and refuse queued work.
    ForceRevoke,
    /// The grant made at `granted_at` reached the minimum lease duration.
    AgePromote {
        /// Grant time the timer was armed for; stale ticks are dropped.
        granted_at: Instant,
    },
    /// Retransmit timer tick for an interrupt cycle.
    InterruptTick {
        /// Cycle the tick belongs to; stale generations are dropped.
        generation: u64,
    },
}

/// Everything a coordinator needs from its surroundings.
#[derive(Clone)]
pub struct CoordinatorContext {
    /// Volume the inode belongs to.
    pub volume: Arc<Volume>,
    /// Mount registry for callback delivery and interest tracking.
    pub registry: Arc<MountRegistry>,
    /// Global lease directory for eviction accounting.
    pub directory: Arc<LeaseDirectory>,
    /// Lease manager configuration.
    pub config: Arc<LeaseConfig>,
    /// Channel to the dead-mount reaper.
    pub dead_tx: mpsc::Sender<MountId>,
}

/// Sends `op` to the inode's coordinator, spawning one if needed.
///
/// A send can fail when the resident coordinator retired concurrently; the
/// stale handle is dropped and a fresh actor spawned, so no operation is
/// lost.
pub async fn submit(ctx: &CoordinatorContext, inode: InodeNumber, op: LeaseOp) -> Result<()> {
    let mut op = op;
    for _ in 0..SUBMIT_RETRY_LIMIT {
        let tx = ctx
            .volume
            .coordinator_or_spawn(inode, || LeaseCoordinator::spawn(ctx.clone(), inode));
        match tx.send(op).await {
            Ok(()) => return Ok(()),
            Err(mpsc::error::SendError(returned)) => {
                op = returned;
                ctx.volume.remove_coordinator(inode, &tx);
            }
        }
    }
    Err(LeaseError::InternalInvariantViolation {
        reason: format!("coordinator for inode {} unreachable", inode),
    })
}

/// Where a mount's request currently lives inside the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Shared(usize),
    Promoting,
    Exclusive,
    Demoting,
    Releasing(usize),
    Requested(usize),
}

/// The per-inode state machine and its queues.
pub struct LeaseCoordinator {
    inode: InodeNumber,
    ctx: CoordinatorContext,
    state: LeaseState,
    shared_holders: VecDeque<LeaseRequest>,
    promoting_holder: Option<LeaseRequest>,
    exclusive_holder: Option<LeaseRequest>,
    demoting_holder: Option<LeaseRequest>,
    releasing_holders: VecDeque<LeaseRequest>,
    requested: VecDeque<LeaseRequest>,
    last_grant_time: Instant,
    interrupts: InterruptState,
    age_timer: Option<TimerHandle>,
    draining: bool,
    ops_tx: mpsc::Sender<LeaseOp>,
}

impl LeaseCoordinator {
    /// Spawns the actor for `inode` and returns its request channel.
    pub fn spawn(ctx: CoordinatorContext, inode: InodeNumber) -> mpsc::Sender<LeaseOp> {
        let (tx, rx) = mpsc::channel(OPS_CHANNEL_CAPACITY);
        ctx.volume.live_coordinators().add(1);
        let draining = !ctx.volume.accepting();
        let coordinator = LeaseCoordinator {
            inode,
            ctx,
            state: LeaseState::None,
            shared_holders: VecDeque::new(),
            promoting_holder: None,
            exclusive_holder: None,
            demoting_holder: None,
            releasing_holders: VecDeque::new(),
            requested: VecDeque::new(),
            last_grant_time: timer::now(),
            interrupts: InterruptState::new(),
            age_timer: None,
            draining,
            ops_tx: tx.clone(),
        };
        tokio::spawn(coordinator.run(rx));
        tx
    }

    async fn run(mut self, mut rx: mpsc::Receiver<LeaseOp>) {
        debug!(inode = %self.inode, volume = self.ctx.volume.name(), "lease coordinator started");
        while let Some(op) = rx.recv().await {
            self.step(op);
            if self.can_retire() {
                // Unregister first so new work spawns a successor, then
                // hand any already-buffered operations over to it.
                self.ctx.volume.remove_coordinator(self.inode, &self.ops_tx);
                rx.close();
                while let Some(op) = rx.recv().await {
                    self.handoff(op).await;
                }
                break;
            }
        }
        self.ctx.directory.remove(self.ctx.volume.name(), self.inode);
        self.ctx.volume.live_coordinators().done();
        debug!(inode = %self.inode, volume = self.ctx.volume.name(), "lease coordinator retired");
    }

    /// Forwards an operation that arrived between the retirement decision
    /// and the channel close. Internal timer ticks and eviction nudges are
    /// meaningless to an empty lease and are dropped.
    async fn handoff(&self, op: LeaseOp) {
        match op {
            LeaseOp::Request { .. } | LeaseOp::ImplicitRelease { .. } => {
                if let Err(err) = submit(&self.ctx, self.inode, op).await {
                    warn!(inode = %self.inode, %err, "lost operation during coordinator handoff");
                }
            }
            LeaseOp::Evict
            | LeaseOp::ForceRevoke
            | LeaseOp::AgePromote { .. }
            | LeaseOp::InterruptTick { .. } => {}
        }
    }

    fn step(&mut self, op: LeaseOp) {
        match op {
            LeaseOp::Request {
                mount_id,
                request_type,
                reply,
            } => match request_type {
                LeaseRequestType::RequestShared => self.handle_acquire(mount_id, false, reply),
                LeaseRequestType::RequestExclusive => self.handle_acquire(mount_id, true, reply),
                LeaseRequestType::PromoteToExclusive => self.handle_promote(mount_id, reply),
                LeaseRequestType::DemoteToShared => self.handle_demote(mount_id, reply),
                LeaseRequestType::Release => self.handle_release(mount_id, Some(reply)),
            },
            LeaseOp::ImplicitRelease { mount_id } => self.handle_release(mount_id, None),
            LeaseOp::Evict => self.handle_evict(),
            LeaseOp::ForceRevoke => self.draining = true,
            LeaseOp::AgePromote { granted_at } => self.handle_age(granted_at),
            LeaseOp::InterruptTick { generation } => self.handle_tick(generation),
        }
        self.prune_cancelled();
        self.resolve();
        self.publish();
    }

    fn placement(&self, mount_id: MountId) -> Option<Placement> {
        if let Some(idx) = self.shared_holders.iter().position(|r| r.mount_id == mount_id) {
            return Some(Placement::Shared(idx));
        }
        if self.promoting_holder.as_ref().is_some_and(|r| r.mount_id == mount_id) {
            return Some(Placement::Promoting);
        }
        if self.exclusive_holder.as_ref().is_some_and(|r| r.mount_id == mount_id) {
            return Some(Placement::Exclusive);
        }
        if self.demoting_holder.as_ref().is_some_and(|r| r.mount_id == mount_id) {
            return Some(Placement::Demoting);
        }
        if let Some(idx) = self
            .releasing_holders
            .iter()
            .position(|r| r.mount_id == mount_id)
        {
            return Some(Placement::Releasing(idx));
        }
        if let Some(idx) = self.requested.iter().position(|r| r.mount_id == mount_id) {
            return Some(Placement::Requested(idx));
        }
        None
    }

    fn handle_acquire(
        &mut self,
        mount_id: MountId,
        exclusive: bool,
        reply: oneshot::Sender<LeaseReplyType>,
    ) {
        if self.placement(mount_id).is_some() {
            debug!(inode = %self.inode, mount = %mount_id, "duplicate lease request denied");
            let _ = reply.send(LeaseReplyType::Denied);
            return;
        }
        let mount = match self.ctx.registry.get(mount_id) {
            Some(m) if !m.is_dead() => m,
            _ => {
                let _ = reply.send(LeaseReplyType::Denied);
                return;
            }
        };
        if self.draining {
            let _ = reply.send(LeaseReplyType::Denied);
            return;
        }
        mount.add_interest(self.inode);

        let initial = if exclusive {
            RequestState::ExclusiveRequested
        } else {
            RequestState::SharedRequested
        };
        let req = LeaseRequest::new(mount_id, self.inode, initial, reply);

        if exclusive {
            if matches!(self.state, LeaseState::None) {
                self.grant_exclusive(req);
                return;
            }
        } else {
            match self.state {
                LeaseState::None => {
                    self.grant_first_shared(req);
                    return;
                }
                LeaseState::SharedGrantedRecently | LeaseState::SharedGrantedLongAgo
                    if self.requested.is_empty() && self.promoting_holder.is_none() =>
                {
                    self.grant_join_shared(req);
                    return;
                }
                _ => {}
            }
        }

        self.requested.push_back(req);
        self.maybe_escalate();
    }

    fn handle_promote(&mut self, mount_id: MountId, reply: oneshot::Sender<LeaseReplyType>) {
        match self.placement(mount_id) {
            Some(Placement::Shared(idx)) => {
                if self.promoting_holder.is_some() {
                    debug!(inode = %self.inode, mount = %mount_id, "competing promotion denied");
                    let _ = reply.send(LeaseReplyType::Denied);
                    return;
                }
                let mut req = self.shared_holders.remove(idx).expect("indexed holder");
                req.state = RequestState::SharedPromoting;
                req.attach_reply(reply);
                self.promoting_holder = Some(req);
                if !self.shared_holders.is_empty()
                    && matches!(self.state, LeaseState::SharedGrantedLongAgo)
                {
                    self.begin_shared_revoke();
                }
                // Sole holder resolves immediately below; a recent grant
                // waits for the age timer before the others are revoked.
            }
            _ => {
                debug!(inode = %self.inode, mount = %mount_id, "promotion from non-shared-holder denied");
                let _ = reply.send(LeaseReplyType::Denied);
            }
        }
    }

    fn handle_demote(&mut self, mount_id: MountId, reply: oneshot::Sender<LeaseReplyType>) {
        match self.placement(mount_id) {
            Some(Placement::Exclusive) => {
                let mut req = self.exclusive_holder.take().expect("exclusive holder");
                req.state = RequestState::SharedGranted;
                let _ = reply.send(LeaseReplyType::Demoted);
                self.shared_holders.push_back(req);
                self.enter_granted(LeaseState::SharedGrantedRecently);
            }
            Some(Placement::Demoting) => {
                let mut req = self.demoting_holder.take().expect("demoting holder");
                req.state = RequestState::SharedGranted;
                let _ = reply.send(LeaseReplyType::Demoted);
                self.shared_holders.push_back(req);
                self.enter_granted(LeaseState::SharedGrantedRecently);
            }
            Some(Placement::Releasing(idx)) => {
                // A revoked holder may answer with a demote; the lease is
                // going away regardless, so it counts as a release ack.
                let req = self.releasing_holders.remove(idx).expect("indexed holder");
                self.drop_interest(req.mount_id);
                let _ = reply.send(LeaseReplyType::Released);
            }
            Some(Placement::Shared(_)) => {
                // Duplicate demote after the first took effect.
                let _ = reply.send(LeaseReplyType::Demoted);
            }
            _ => {
                let _ = reply.send(LeaseReplyType::Denied);
            }
        }
    }

    fn handle_release(&mut self, mount_id: MountId, reply: Option<oneshot::Sender<LeaseReplyType>>) {
        let respond = |reply: Option<oneshot::Sender<LeaseReplyType>>, r: LeaseReplyType| {
            if let Some(tx) = reply {
                let _ = tx.send(r);
            }
        };
        match self.placement(mount_id) {
            Some(Placement::Shared(idx)) => {
                self.shared_holders.remove(idx);
                self.drop_interest(mount_id);
                respond(reply, LeaseReplyType::Released);
            }
            Some(Placement::Releasing(idx)) => {
                self.releasing_holders.remove(idx);
                self.drop_interest(mount_id);
                respond(reply, LeaseReplyType::Released);
            }
            Some(Placement::Exclusive) => {
                self.exclusive_holder = None;
                self.drop_interest(mount_id);
                respond(reply, LeaseReplyType::Released);
            }
            Some(Placement::Demoting) => {
                self.demoting_holder = None;
                self.drop_interest(mount_id);
                respond(reply, LeaseReplyType::Released);
            }
            Some(Placement::Promoting) => {
                let mut req = self.promoting_holder.take().expect("promoting holder");
                req.deliver(LeaseReplyType::Denied);
                self.drop_interest(mount_id);
                respond(reply, LeaseReplyType::Released);
            }
            Some(Placement::Requested(idx)) => {
                let mut req = self.requested.remove(idx).expect("indexed request");
                req.deliver(LeaseReplyType::Denied);
                self.drop_interest(mount_id);
                respond(reply, LeaseReplyType::Released);
            }
            None => {
                // Duplicate or late release; idempotent.
                respond(reply, LeaseReplyType::Released);
            }
        }
    }

    fn handle_evict(&mut self) {
        match self.state {
            LeaseState::SharedGrantedLongAgo => {
                info!(inode = %self.inode, "evicting idle shared lease");
                self.begin_shared_revoke();
            }
            LeaseState::ExclusiveGrantedLongAgo => {
                info!(inode = %self.inode, "evicting idle exclusive lease");
                self.begin_exclusive_revoke();
            }
            // The lease moved on since the victim was selected.
            _ => {}
        }
    }

    fn handle_age(&mut self, granted_at: Instant) {
        if granted_at != self.last_grant_time {
            return;
        }
        match self.state {
            LeaseState::SharedGrantedRecently => self.state = LeaseState::SharedGrantedLongAgo,
            LeaseState::ExclusiveGrantedRecently => {
                self.state = LeaseState::ExclusiveGrantedLongAgo
            }
            _ => return,
        }
        if self.draining {
            match self.state {
                LeaseState::SharedGrantedLongAgo => self.begin_shared_revoke(),
                LeaseState::ExclusiveGrantedLongAgo => self.begin_exclusive_revoke(),
                _ => {}
            }
        } else {
            self.maybe_escalate();
        }
    }

    fn handle_tick(&mut self, generation: u64) {
        match self
            .interrupts
            .tick(generation, self.ctx.config.lease_interrupt_limit)
        {
            TickOutcome::Stale => {}
            TickOutcome::Retransmit => {
                debug!(
                    inode = %self.inode,
                    generation,
                    attempt = self.interrupts.attempts(),
                    "retransmitting lease interrupts"
                );
                self.send_interrupts(generation);
            }
            TickOutcome::Expired => self.expire_holders(),
        }
    }

    /// Starts revocation or demotion for the queue head once the grant is
    /// old enough.
    fn maybe_escalate(&mut self) {
        match self.state {
            LeaseState::SharedGrantedLongAgo => {
                let exclusive_head = matches!(
                    self.requested.front().map(|r| r.state),
                    Some(RequestState::ExclusiveRequested)
                );
                if self.promoting_holder.is_some() || exclusive_head {
                    self.begin_shared_revoke();
                }
            }
            LeaseState::ExclusiveGrantedLongAgo => match self.requested.front().map(|r| r.state) {
                Some(RequestState::SharedRequested) => self.begin_exclusive_demote(),
                Some(RequestState::ExclusiveRequested) => self.begin_exclusive_revoke(),
                _ => {}
            },
            _ => {}
        }
    }

    fn begin_shared_revoke(&mut self) {
        if self.interrupts.is_active() {
            return;
        }
        while let Some(mut req) = self.shared_holders.pop_front() {
            req.state = RequestState::SharedReleasing;
            self.releasing_holders.push_back(req);
        }
        if self.releasing_holders.is_empty() {
            return;
        }
        self.state = LeaseState::SharedReleasing;
        self.age_timer = None;
        let generation = self.begin_interrupt_cycle();
        info!(
            inode = %self.inode,
            holders = self.releasing_holders.len(),
            generation,
            "revoking shared holders"
        );
        self.send_interrupts(generation);
    }

    fn begin_exclusive_revoke(&mut self) {
        if self.interrupts.is_active() {
            return;
        }
        let Some(mut req) = self.exclusive_holder.take() else {
            return;
        };
        req.state = RequestState::ExclusiveReleasing;
        self.releasing_holders.push_back(req);
        self.state = LeaseState::ExclusiveReleasing;
        self.age_timer = None;
        let generation = self.begin_interrupt_cycle();
        info!(inode = %self.inode, generation, "revoking exclusive holder");
        self.send_interrupts(generation);
    }

    fn begin_exclusive_demote(&mut self) {
        if self.interrupts.is_active() {
            return;
        }
        let Some(mut req) = self.exclusive_holder.take() else {
            return;
        };
        req.state = RequestState::ExclusiveDemoting;
        self.demoting_holder = Some(req);
        self.state = LeaseState::ExclusiveDemoting;
        self.age_timer = None;
        let generation = self.begin_interrupt_cycle();
        info!(inode = %self.inode, generation, "demoting exclusive holder");
        self.send_interrupts(generation);
    }

    fn begin_interrupt_cycle(&mut self) -> u64 {
        let interval = self.ctx.config.lease_interrupt_interval();
        self.interrupts
            .begin(interval, self.ops_tx.clone(), |generation| {
                LeaseOp::InterruptTick { generation }
            })
    }

    fn send_interrupts(&self, generation: u64) {
        for req in &self.releasing_holders {
            self.deliver_interrupt(req.mount_id, LeaseReplyType::RevokeInterrupt, generation);
        }
        if let Some(req) = &self.demoting_holder {
            self.deliver_interrupt(req.mount_id, LeaseReplyType::DemoteInterrupt, generation);
        }
    }

    fn deliver_interrupt(&self, mount_id: MountId, kind: LeaseReplyType, generation: u64) {
        if let Some(mount) = self.ctx.registry.get(mount_id) {
            mount.deliver(LeaseInterrupt {
                inode: self.inode,
                kind,
                generation,
            });
        }
    }

    /// The interrupt limit was reached: non-responders are dead. Their
    /// requests are dropped, the mounts are handed to the reaper, and the
    /// queue resolves as if clean releases had arrived.
    fn expire_holders(&mut self) {
        self.state = match self.state {
            LeaseState::SharedReleasing => LeaseState::SharedExpired,
            LeaseState::ExclusiveReleasing | LeaseState::ExclusiveDemoting => {
                LeaseState::ExclusiveExpired
            }
            other => other,
        };
        let mut dead: Vec<MountId> = self
            .releasing_holders
            .drain(..)
            .map(|r| r.mount_id)
            .collect();
        if let Some(req) = self.demoting_holder.take() {
            dead.push(req.mount_id);
        }
        for mount_id in dead {
            warn!(
                inode = %self.inode,
                mount = %mount_id,
                "lease holder unresponsive past interrupt limit, declaring mount dead"
            );
            if let Some(mount) = self.ctx.registry.get(mount_id) {
                mount.mark_dead();
                mount.remove_interest(self.inode);
            }
            if self.ctx.dead_tx.try_send(mount_id).is_err() {
                warn!(mount = %mount_id, "dead-mount reaper backlogged");
            }
        }
    }

    fn grant_first_shared(&mut self, mut req: LeaseRequest) {
        req.state = RequestState::SharedGranted;
        req.deliver(LeaseReplyType::SharedGranted);
        self.shared_holders.push_back(req);
        self.enter_granted(LeaseState::SharedGrantedRecently);
    }

    fn grant_join_shared(&mut self, mut req: LeaseRequest) {
        req.state = RequestState::SharedGranted;
        req.deliver(LeaseReplyType::SharedGranted);
        self.shared_holders.push_back(req);
        // Joining an existing grant leaves the lease age untouched.
    }

    fn grant_exclusive(&mut self, mut req: LeaseRequest) {
        req.state = RequestState::ExclusiveGranted;
        req.deliver(LeaseReplyType::ExclusiveGranted);
        self.exclusive_holder = Some(req);
        self.enter_granted(LeaseState::ExclusiveGrantedRecently);
    }

    fn enter_granted(&mut self, state: LeaseState) {
        self.state = state;
        self.last_grant_time = timer::now();
        self.age_timer = Some(timer::one_shot(
            self.ctx.config.min_lease_duration(),
            self.ops_tx.clone(),
            LeaseOp::AgePromote {
                granted_at: self.last_grant_time,
            },
        ));
        self.interrupts.complete();
    }

    /// Removes waiters whose reply channel went away. A cancelled
    /// promotion reverts the holder to plain shared.
    fn prune_cancelled(&mut self) {
        let mut idx = 0;
        while idx < self.requested.len() {
            if self.requested[idx].is_cancelled() {
                let mut req = self.requested.remove(idx).expect("indexed request");
                debug!(inode = %self.inode, mount = %req.mount_id, "queued lease request cancelled");
                req.deliver(LeaseReplyType::Denied);
                self.drop_interest(req.mount_id);
            } else {
                idx += 1;
            }
        }
        if self
            .promoting_holder
            .as_ref()
            .is_some_and(|r| r.is_cancelled())
        {
            let mut req = self.promoting_holder.take().expect("promoting holder");
            debug!(inode = %self.inode, mount = %req.mount_id, "promotion cancelled, reverting to shared");
            req.deliver(LeaseReplyType::Denied);
            req.state = RequestState::SharedGranted;
            self.shared_holders.push_back(req);
        }
    }

    /// Drains as many waiters as the state permits, in fairness order.
    fn resolve(&mut self) {
        if self.draining {
            self.resolve_draining();
        }

        // Outstanding acknowledgments gate everything else.
        if !self.releasing_holders.is_empty() || self.demoting_holder.is_some() {
            return;
        }
        self.interrupts.complete();

        // A cycle can end with holders still present, e.g. a cancelled
        // promotion reverted to plain shared while the others were being
        // revoked. Restore the granted state and re-evaluate the queue.
        if !self.shared_holders.is_empty()
            && matches!(
                self.state,
                LeaseState::SharedReleasing | LeaseState::SharedExpired
            )
        {
            self.state = LeaseState::SharedGrantedLongAgo;
            self.maybe_escalate();
            if !self.releasing_holders.is_empty() {
                return;
            }
        }

        // Promotion resolves before any queued request.
        if self.exclusive_holder.is_none() && self.shared_holders.is_empty() {
            if let Some(mut req) = self.promoting_holder.take() {
                req.state = RequestState::ExclusiveGranted;
                req.deliver(LeaseReplyType::Promoted);
                self.exclusive_holder = Some(req);
                self.enter_granted(LeaseState::ExclusiveGrantedRecently);
            }
        }

        if self.exclusive_holder.is_none() && self.promoting_holder.is_none() {
            if self.shared_holders.is_empty() {
                match self.requested.front().map(|r| r.state) {
                    Some(RequestState::ExclusiveRequested) => {
                        let req = self.requested.pop_front().expect("queue head");
                        self.grant_exclusive(req);
                    }
                    Some(RequestState::SharedRequested) => {
                        let mut granted = false;
                        while matches!(
                            self.requested.front().map(|r| r.state),
                            Some(RequestState::SharedRequested)
                        ) {
                            let mut req = self.requested.pop_front().expect("queue head");
                            req.state = RequestState::SharedGranted;
                            req.deliver(LeaseReplyType::SharedGranted);
                            self.shared_holders.push_back(req);
                            granted = true;
                        }
                        if granted {
                            self.enter_granted(LeaseState::SharedGrantedRecently);
                        }
                    }
                    _ => {}
                }
            } else {
                // Holders remain (e.g. after a demote): a shared run at
                // the head may join them; an exclusive head keeps waiting.
                while matches!(
                    self.requested.front().map(|r| r.state),
                    Some(RequestState::SharedRequested)
                ) {
                    let req = self.requested.pop_front().expect("queue head");
                    self.grant_join_shared(req);
                }
            }
        }

        if self.is_empty() {
            self.state = LeaseState::None;
            self.age_timer = None;
            self.interrupts.complete();
        }
    }

    /// During volume teardown queued work is refused and holders are
    /// revoked as soon as their minimum lifetime allows.
    fn resolve_draining(&mut self) {
        while let Some(mut req) = self.requested.pop_front() {
            req.deliver(LeaseReplyType::Denied);
            self.drop_interest(req.mount_id);
        }
        if let Some(mut req) = self.promoting_holder.take() {
            req.deliver(LeaseReplyType::Denied);
            req.state = RequestState::SharedGranted;
            self.shared_holders.push_back(req);
        }
        match self.state {
            LeaseState::SharedGrantedLongAgo => self.begin_shared_revoke(),
            LeaseState::ExclusiveGrantedLongAgo => self.begin_exclusive_revoke(),
            // Recent grants keep their minimum lifetime; the age timer
            // finishes the job.
            _ => {}
        }
    }

    fn publish(&self) {
        if self.state.is_live() {
            self.ctx.directory.publish(
                self.ctx.volume.name(),
                self.inode,
                self.state,
                self.last_grant_time,
            );
        } else {
            self.ctx.directory.remove(self.ctx.volume.name(), self.inode);
        }
    }

    fn drop_interest(&self, mount_id: MountId) {
        if let Some(mount) = self.ctx.registry.get(mount_id) {
            mount.remove_interest(self.inode);
        }
    }

    fn is_empty(&self) -> bool {
        self.shared_holders.is_empty()
            && self.exclusive_holder.is_none()
            && self.promoting_holder.is_none()
            && self.demoting_holder.is_none()
            && self.releasing_holders.is_empty()
            && self.requested.is_empty()
    }

    fn can_retire(&self) -> bool {
        matches!(self.state, LeaseState::None) && self.is_empty() && !self.interrupts.is_active()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::Mount;
    use std::time::Duration;
    use tokio::time::timeout;

    struct TestBed {
        ctx: CoordinatorContext,
        dead_rx: Option<mpsc::Receiver<MountId>>,
    }

    fn testbed() -> TestBed {
        let config = Arc::new(LeaseConfig {
            min_lease_duration_ms: 100,
            lease_interrupt_interval_ms: 50,
            lease_interrupt_limit: 4,
            ..Default::default()
        });
        let (dead_tx, dead_rx) = mpsc::channel(64);
        TestBed {
            ctx: CoordinatorContext {
                volume: Arc::new(Volume::new("vol0")),
                registry: Arc::new(MountRegistry::new()),
                directory: Arc::new(LeaseDirectory::new()),
                config,
                dead_tx,
            },
            dead_rx: Some(dead_rx),
        }
    }

    impl TestBed {
        fn mount(&self) -> (Arc<Mount>, mpsc::Receiver<LeaseInterrupt>) {
            let (mount, rx) = self.ctx.registry.register("vol0");
            self.ctx.volume.add_mount(mount.clone());
            (mount, rx)
        }

        async fn request(
            &self,
            mount: &Arc<Mount>,
            ino: u64,
            request_type: LeaseRequestType,
        ) -> oneshot::Receiver<LeaseReplyType> {
            let (tx, rx) = oneshot::channel();
            submit(
                &self.ctx,
                InodeNumber::new(ino),
                LeaseOp::Request {
                    mount_id: mount.id(),
                    request_type,
                    reply: tx,
                },
            )
            .await
            .unwrap();
            rx
        }

        async fn request_wait(
            &self,
            mount: &Arc<Mount>,
            ino: u64,
            request_type: LeaseRequestType,
        ) -> LeaseReplyType {
            self.request(mount, ino, request_type).await.await.unwrap()
        }
    }

    async fn recv_interrupt(rx: &mut mpsc::Receiver<LeaseInterrupt>) -> LeaseInterrupt {
        timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("interrupt expected")
            .expect("channel open")
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_grant_and_release() {
        let bed = testbed();
        let (m1, _i1) = bed.mount();

        let reply = bed
            .request_wait(&m1, 7, LeaseRequestType::RequestShared)
            .await;
        assert_eq!(reply, LeaseReplyType::SharedGranted);
        assert_eq!(bed.ctx.directory.live_count(), 1);

        let reply = bed.request_wait(&m1, 7, LeaseRequestType::Release).await;
        assert_eq!(reply, LeaseReplyType::Released);

        // Coordinator retires once idle.
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(bed.ctx.directory.live_count(), 0);
        assert_eq!(m1.interest_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_shared_holders_coexist() {
        let bed = testbed();
        let (m1, _i1) = bed.mount();
        let (m2, _i2) = bed.mount();

        assert_eq!(
            bed.request_wait(&m1, 7, LeaseRequestType::RequestShared).await,
            LeaseReplyType::SharedGranted
        );
        assert_eq!(
            bed.request_wait(&m2, 7, LeaseRequestType::RequestShared).await,
            LeaseReplyType::SharedGranted
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exclusive_grant_from_none() {
        let bed = testbed();
        let (m1, _i1) = bed.mount();

        assert_eq!(
            bed.request_wait(&m1, 9, LeaseRequestType::RequestExclusive)
                .await,
            LeaseReplyType::ExclusiveGranted
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_request_denied() {
        let bed = testbed();
        let (m1, _i1) = bed.mount();

        bed.request_wait(&m1, 7, LeaseRequestType::RequestShared).await;
        assert_eq!(
            bed.request_wait(&m1, 7, LeaseRequestType::RequestShared).await,
            LeaseReplyType::Denied
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_release_is_idempotent() {
        let bed = testbed();
        let (m1, _i1) = bed.mount();

        bed.request_wait(&m1, 7, LeaseRequestType::RequestShared).await;
        assert_eq!(
            bed.request_wait(&m1, 7, LeaseRequestType::Release).await,
            LeaseReplyType::Released
        );
        assert_eq!(
            bed.request_wait(&m1, 7, LeaseRequestType::Release).await,
            LeaseReplyType::Released
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_revoke_before_min_lease_duration() {
        let bed = testbed();
        let (m1, mut i1) = bed.mount();
        let (m2, _i2) = bed.mount();

        bed.request_wait(&m1, 7, LeaseRequestType::RequestShared).await;
        let _pending = bed.request(&m2, 7, LeaseRequestType::RequestExclusive).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(i1.try_recv().is_err(), "revoke dispatched inside minimum lifetime");

        // Past the minimum lifetime the revoke goes out.
        let interrupt = recv_interrupt(&mut i1).await;
        assert_eq!(interrupt.kind, LeaseReplyType::RevokeInterrupt);
        assert_eq!(interrupt.inode, InodeNumber::new(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exclusive_waits_for_shared_release() {
        let bed = testbed();
        let (m1, mut i1) = bed.mount();
        let (m2, mut i2) = bed.mount();
        let (m3, _i3) = bed.mount();

        bed.request_wait(&m1, 7, LeaseRequestType::RequestShared).await;
        bed.request_wait(&m2, 7, LeaseRequestType::RequestShared).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        let pending = bed.request(&m3, 7, LeaseRequestType::RequestExclusive).await;

        assert_eq!(recv_interrupt(&mut i1).await.kind, LeaseReplyType::RevokeInterrupt);
        assert_eq!(recv_interrupt(&mut i2).await.kind, LeaseReplyType::RevokeInterrupt);

        bed.request_wait(&m1, 7, LeaseRequestType::Release).await;
        bed.request_wait(&m2, 7, LeaseRequestType::Release).await;

        assert_eq!(pending.await.unwrap(), LeaseReplyType::ExclusiveGranted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_demote_interrupt_for_shared_request() {
        let bed = testbed();
        let (m1, mut i1) = bed.mount();
        let (m2, _i2) = bed.mount();

        bed.request_wait(&m1, 9, LeaseRequestType::RequestExclusive).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        let pending = bed.request(&m2, 9, LeaseRequestType::RequestShared).await;
        assert_eq!(recv_interrupt(&mut i1).await.kind, LeaseReplyType::DemoteInterrupt);

        assert_eq!(
            bed.request_wait(&m1, 9, LeaseRequestType::DemoteToShared).await,
            LeaseReplyType::Demoted
        );
        assert_eq!(pending.await.unwrap(), LeaseReplyType::SharedGranted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_promote_sole_holder_immediate() {
        let bed = testbed();
        let (m1, _i1) = bed.mount();

        bed.request_wait(&m1, 11, LeaseRequestType::RequestShared).await;
        assert_eq!(
            bed.request_wait(&m1, 11, LeaseRequestType::PromoteToExclusive)
                .await,
            LeaseReplyType::Promoted
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_promote_revokes_other_holders() {
        let bed = testbed();
        let (m1, _i1) = bed.mount();
        let (m2, mut i2) = bed.mount();
        let (m3, mut i3) = bed.mount();

        bed.request_wait(&m1, 11, LeaseRequestType::RequestShared).await;
        bed.request_wait(&m2, 11, LeaseRequestType::RequestShared).await;
        bed.request_wait(&m3, 11, LeaseRequestType::RequestShared).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        let pending = bed
            .request(&m1, 11, LeaseRequestType::PromoteToExclusive)
            .await;

        assert_eq!(recv_interrupt(&mut i2).await.kind, LeaseReplyType::RevokeInterrupt);
        assert_eq!(recv_interrupt(&mut i3).await.kind, LeaseReplyType::RevokeInterrupt);

        bed.request_wait(&m2, 11, LeaseRequestType::Release).await;
        bed.request_wait(&m3, 11, LeaseRequestType::Release).await;

        assert_eq!(pending.await.unwrap(), LeaseReplyType::Promoted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_promote_from_non_holder_denied() {
        let bed = testbed();
        let (m1, _i1) = bed.mount();
        let (m2, _i2) = bed.mount();

        bed.request_wait(&m1, 11, LeaseRequestType::RequestShared).await;
        assert_eq!(
            bed.request_wait(&m2, 11, LeaseRequestType::PromoteToExclusive)
                .await,
            LeaseReplyType::Denied
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_competing_promotion_denied() {
        let bed = testbed();
        let (m1, _i1) = bed.mount();
        let (m2, _i2) = bed.mount();

        bed.request_wait(&m1, 11, LeaseRequestType::RequestShared).await;
        bed.request_wait(&m2, 11, LeaseRequestType::RequestShared).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        let first = bed
            .request(&m1, 11, LeaseRequestType::PromoteToExclusive)
            .await;
        assert_eq!(
            bed.request_wait(&m2, 11, LeaseRequestType::PromoteToExclusive)
                .await,
            LeaseReplyType::Denied
        );

        bed.request_wait(&m2, 11, LeaseRequestType::Release).await;
        assert_eq!(first.await.unwrap(), LeaseReplyType::Promoted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_holder_expires_after_limit() {
        let mut bed = testbed();
        let mut dead_rx = bed.dead_rx.take().unwrap();
        let (m1, mut i1) = bed.mount();
        let (m2, _i2) = bed.mount();

        bed.request_wait(&m1, 13, LeaseRequestType::RequestShared).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        let start = tokio::time::Instant::now();
        let pending = bed.request(&m2, 13, LeaseRequestType::RequestExclusive).await;
        assert_eq!(recv_interrupt(&mut i1).await.kind, LeaseReplyType::RevokeInterrupt);

        // M1 never answers: 4 attempts at 50ms expire the lease at 200ms.
        assert_eq!(pending.await.unwrap(), LeaseReplyType::ExclusiveGranted);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(200), "expired early: {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(400), "expired late: {:?}", elapsed);

        assert!(m1.is_dead());
        assert_eq!(dead_rx.recv().await, Some(m1.id()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_order_exclusive_blocks_later_shared() {
        let bed = testbed();
        let (m1, _i1) = bed.mount();
        let (m2, _i2) = bed.mount();
        let (m3, _i3) = bed.mount();

        bed.request_wait(&m1, 7, LeaseRequestType::RequestExclusive).await;

        // M2's exclusive queued first, M3's shared behind it.
        let pending_excl = bed.request(&m2, 7, LeaseRequestType::RequestExclusive).await;
        let mut pending_shared = bed.request(&m3, 7, LeaseRequestType::RequestShared).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(pending_shared.try_recv().is_err(), "shared passed queued exclusive");

        bed.request_wait(&m1, 7, LeaseRequestType::Release).await;
        assert_eq!(pending_excl.await.unwrap(), LeaseReplyType::ExclusiveGranted);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(pending_shared.try_recv().is_err(), "shared granted while exclusive held");

        bed.request_wait(&m2, 7, LeaseRequestType::Release).await;
        assert_eq!(pending_shared.await.unwrap(), LeaseReplyType::SharedGranted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_contiguous_shared_run_granted_together() {
        let bed = testbed();
        let (m1, _i1) = bed.mount();
        let (m2, _i2) = bed.mount();
        let (m3, _i3) = bed.mount();

        bed.request_wait(&m1, 7, LeaseRequestType::RequestExclusive).await;

        let pending_a = bed.request(&m2, 7, LeaseRequestType::RequestShared).await;
        let pending_b = bed.request(&m3, 7, LeaseRequestType::RequestShared).await;

        bed.request_wait(&m1, 7, LeaseRequestType::Release).await;

        assert_eq!(pending_a.await.unwrap(), LeaseReplyType::SharedGranted);
        assert_eq!(pending_b.await.unwrap(), LeaseReplyType::SharedGranted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_waiter_is_pruned() {
        let bed = testbed();
        let (m1, _i1) = bed.mount();
        let (m2, _i2) = bed.mount();
        let (m3, _i3) = bed.mount();

        bed.request_wait(&m1, 7, LeaseRequestType::RequestExclusive).await;

        let pending_dropped = bed.request(&m2, 7, LeaseRequestType::RequestExclusive).await;
        let pending_kept = bed.request(&m3, 7, LeaseRequestType::RequestShared).await;
        drop(pending_dropped);

        bed.request_wait(&m1, 7, LeaseRequestType::Release).await;

        // The abandoned exclusive no longer blocks the shared waiter.
        assert_eq!(pending_kept.await.unwrap(), LeaseReplyType::SharedGranted);
        assert_eq!(m2.interest_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_voluntary_demote_lets_shared_join() {
        let bed = testbed();
        let (m1, _i1) = bed.mount();
        let (m2, _i2) = bed.mount();

        bed.request_wait(&m1, 9, LeaseRequestType::RequestExclusive).await;
        let pending = bed.request(&m2, 9, LeaseRequestType::RequestShared).await;

        assert_eq!(
            bed.request_wait(&m1, 9, LeaseRequestType::DemoteToShared).await,
            LeaseReplyType::Demoted
        );
        assert_eq!(pending.await.unwrap(), LeaseReplyType::SharedGranted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_demote_is_noop() {
        let bed = testbed();
        let (m1, _i1) = bed.mount();

        bed.request_wait(&m1, 9, LeaseRequestType::RequestExclusive).await;
        assert_eq!(
            bed.request_wait(&m1, 9, LeaseRequestType::DemoteToShared).await,
            LeaseReplyType::Demoted
        );
        assert_eq!(
            bed.request_wait(&m1, 9, LeaseRequestType::DemoteToShared).await,
            LeaseReplyType::Demoted
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_drives_idle_lease_to_none() {
        let bed = testbed();
        let (m1, mut i1) = bed.mount();
        let ino = InodeNumber::new(21);

        bed.request_wait(&m1, 21, LeaseRequestType::RequestShared).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        submit(&bed.ctx, ino, LeaseOp::Evict).await.unwrap();
        assert_eq!(recv_interrupt(&mut i1).await.kind, LeaseReplyType::RevokeInterrupt);

        bed.request_wait(&m1, 21, LeaseRequestType::Release).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(bed.ctx.directory.live_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_skips_recent_grant() {
        let bed = testbed();
        let (m1, mut i1) = bed.mount();
        let ino = InodeNumber::new(21);

        bed.request_wait(&m1, 21, LeaseRequestType::RequestShared).await;
        submit(&bed.ctx, ino, LeaseOp::Evict).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(i1.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_revoke_drains_and_denies() {
        let bed = testbed();
        let (m1, mut i1) = bed.mount();
        let (m2, _i2) = bed.mount();
        let ino = InodeNumber::new(17);

        let start = tokio::time::Instant::now();
        bed.request_wait(&m1, 17, LeaseRequestType::RequestExclusive).await;
        // Queued while the grant is recent, so no interrupt goes out yet.
        let pending = bed.request(&m2, 17, LeaseRequestType::RequestShared).await;

        bed.ctx.volume.stop_accepting();
        submit(&bed.ctx, ino, LeaseOp::ForceRevoke).await.unwrap();

        // Queued work is refused; the holder is revoked (not demoted) once
        // its minimum lifetime elapses.
        assert_eq!(pending.await.unwrap(), LeaseReplyType::Denied);
        let interrupt = recv_interrupt(&mut i1).await;
        assert_eq!(interrupt.kind, LeaseReplyType::RevokeInterrupt);
        assert!(start.elapsed() >= Duration::from_millis(100));

        bed.request_wait(&m1, 17, LeaseRequestType::Release).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(bed.ctx.volume.live_coordinators().current(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_ack_matches_outstanding_generation() {
        let bed = testbed();
        let (m1, mut i1) = bed.mount();
        let (m2, _i2) = bed.mount();

        bed.request_wait(&m1, 7, LeaseRequestType::RequestShared).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        let pending = bed.request(&m2, 7, LeaseRequestType::RequestExclusive).await;
        let first = recv_interrupt(&mut i1).await;

        // One retransmission, same generation.
        let second = recv_interrupt(&mut i1).await;
        assert_eq!(first.generation, second.generation);

        bed.request_wait(&m1, 7, LeaseRequestType::Release).await;
        assert_eq!(pending.await.unwrap(), LeaseReplyType::ExclusiveGranted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_coordinator_respawns_after_retirement() {
        let bed = testbed();
        let (m1, _i1) = bed.mount();

        bed.request_wait(&m1, 7, LeaseRequestType::RequestShared).await;
        bed.request_wait(&m1, 7, LeaseRequestType::Release).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        // A fresh request after retirement reaches a new actor.
        assert_eq!(
            bed.request_wait(&m1, 7, LeaseRequestType::RequestShared).await,
            LeaseReplyType::SharedGranted
        );
    }
}
