//! Reliable-connected queue pair: handshake and work-request posting.
//!
//! Lifecycle:
//! 1. [`QueuePair::create`]: QP in RESET with a random 24-bit PSN.
//! 2. [`QueuePair::init`]: RESET → INIT (receives may be posted from here on).
//! 3. Exchange [`ConnectionParameters`] with the peer out of band.
//! 4. [`QueuePair::ready_to_receive`] then [`QueuePair::ready_to_send`].
//! 5. Post sends, receives, writes and reads; reap completions on the CQ.
//! 6. [`QueuePair::close`] (or drop).

use crate::config::QpConfig;
use crate::endpoint::{ConnectionParameters, LocalPort};
use crate::error::{QpError, Result};
use crate::psn::{Psn, PsnSource, RandomPsn};
use crate::rdma::{
    CompletionQueue, IbvQp, ProtectionDomain, QpCapabilities, QpHandle, RdmaContext,
};
use crate::transition::{QpState, Transition};
use crate::wr::{
    ReceiveDescriptor, ReceiveWorkRequest, RemoteTarget, SendDescriptor, SendWorkRequest, WrId,
    WrIdCounter,
};
use std::sync::Arc;

/// A reliable-connected queue pair.
///
/// Not internally synchronized: every mutating operation takes `&mut self`.
pub struct QueuePair {
    handle: Option<Box<dyn QpHandle>>,
    qp_num: u32,
    psn: Psn,
    local: LocalPort,
    state: QpState,
    config: QpConfig,
    wr_ids: WrIdCounter,
}

impl QueuePair {
    /// Create a queue pair on `ctx`'s port, drawing its PSN from the
    /// process-wide random source. Globally routed traffic is sent from the GID
    /// index `ctx` was opened with.
    ///
    /// Both queues report to `cq`, and its capacity bounds the outstanding
    /// send and receive requests.
    pub fn create(
        ctx: &RdmaContext,
        pd: &Arc<ProtectionDomain>,
        cq: &Arc<CompletionQueue>,
        config: QpConfig,
    ) -> Result<Self> {
        Self::create_with_psn(ctx, pd, cq, config, RandomPsn::global())
    }

    /// Like [`QueuePair::create`] with an explicit PSN source.
    pub fn create_with_psn(
        ctx: &RdmaContext,
        pd: &Arc<ProtectionDomain>,
        cq: &Arc<CompletionQueue>,
        config: QpConfig,
        psns: &dyn PsnSource,
    ) -> Result<Self> {
        let caps = QpCapabilities {
            max_send_wr: cq.capacity(),
            max_recv_wr: cq.capacity(),
            max_inline_data: config.max_inline_data,
        };
        let handle = IbvQp::create(pd, cq, caps)?;
        Ok(Self::with_handle(
            Box::new(handle),
            ctx.local_port(),
            psns.next_psn(),
            config,
        ))
    }

    /// Wrap an already created hardware queue pair in RESET state.
    pub fn with_handle(
        handle: Box<dyn QpHandle>,
        local: LocalPort,
        psn: Psn,
        config: QpConfig,
    ) -> Self {
        let qp_num = handle.qp_num();
        tracing::debug!(
            qp_num,
            port = local.port,
            gid_index = local.gid_index,
            psn = %psn,
            "created queue pair"
        );
        Self {
            handle: Some(handle),
            qp_num,
            psn,
            local,
            state: QpState::Reset,
            config,
            wr_ids: WrIdCounter::default(),
        }
    }

    pub fn qp_num(&self) -> u32 {
        self.qp_num
    }

    /// Local send-side PSN, fixed at creation.
    pub fn psn(&self) -> Psn {
        self.psn
    }

    pub fn port(&self) -> u8 {
        self.local.port
    }

    pub fn local_port(&self) -> LocalPort {
        self.local
    }

    pub fn state(&self) -> QpState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_none()
    }

    pub fn config(&self) -> &QpConfig {
        &self.config
    }

    /// RESET → INIT.
    pub fn init(&mut self) -> Result<()> {
        self.apply(Transition::init(self.local.port, &self.config))
    }

    /// INIT → RTR, pointing the receive side at `dest`.
    pub fn ready_to_receive(&mut self, dest: &ConnectionParameters) -> Result<()> {
        self.apply(Transition::ready_to_receive(self.local, *dest, &self.config))
    }

    /// RTR → RTS, arming the send side with this queue pair's PSN.
    pub fn ready_to_send(&mut self) -> Result<()> {
        self.apply(Transition::ready_to_send(self.psn, &self.config))
    }

    /// Run whatever handshake steps remain until the queue pair is RTS.
    pub fn connect(&mut self, dest: &ConnectionParameters) -> Result<()> {
        if self.state == QpState::Reset {
            self.init()?;
        }
        if self.state == QpState::Init {
            self.ready_to_receive(dest)?;
        }
        if self.state == QpState::ReadyToReceive {
            self.ready_to_send()?;
        }
        match self.state {
            QpState::ReadyToSend => Ok(()),
            QpState::Closed => Err(QpError::Closed),
            current => Err(QpError::InvalidTransition {
                current,
                attempted: QpState::ReadyToSend,
                required: QpState::ReadyToReceive,
            }),
        }
    }

    fn apply(&mut self, transition: Transition) -> Result<()> {
        let from = self.state;
        from.check(&transition)?;
        transition.validate()?;
        let handle = self.handle.as_mut().ok_or(QpError::Closed)?;
        handle
            .modify(&transition)
            .map_err(|errno| QpError::StateTransition {
                from,
                to: transition.target(),
                errno,
            })?;
        self.state = transition.target();
        tracing::debug!(
            qp_num = self.qp_num,
            from = %from,
            to = %self.state,
            "queue pair transitioned"
        );
        Ok(())
    }

    /// Post a two-sided send of the request's region.
    ///
    /// A request without a region goes out inline with an empty payload.
    ///
    /// # Safety
    /// The region referenced by `wr` must stay registered and alive until the
    /// matching completion has been reaped.
    pub unsafe fn post_send(&mut self, wr: &mut SendWorkRequest) -> Result<WrId> {
        unsafe { self.post_send_imm(wr, 0) }
    }

    /// Post a send carrying `imm` as immediate data; `imm == 0` is a plain send.
    /// Sends with immediate data always go inline, so their region must fit the
    /// queue pair's inline capacity; larger regions fail with
    /// [`QpError::InvalidParameters`] before reaching hardware.
    ///
    /// # Safety
    /// Same contract as [`QueuePair::post_send`].
    pub unsafe fn post_send_imm(&mut self, wr: &mut SendWorkRequest, imm: u32) -> Result<WrId> {
        let id = self.submit_send("post_send", |id| {
            SendDescriptor::send(id, wr.memory_region(), imm)
        })?;
        wr.assign(id);
        Ok(id)
    }

    /// Post a receive buffer. The request must carry a region; the whole
    /// region is offered to the next incoming send.
    ///
    /// # Safety
    /// The region must stay registered and alive until the matching completion
    /// has been reaped; hardware writes into it asynchronously.
    pub unsafe fn post_receive(&mut self, wr: &mut ReceiveWorkRequest) -> Result<WrId> {
        const OP: &str = "post_recv";
        self.ensure_postable(OP, QpState::accepts_receives)?;
        let mr = wr
            .memory_region()
            .ok_or(QpError::MissingMemoryRegion { op: OP })?;
        let desc = ReceiveDescriptor::new(self.wr_ids.next(), mr)?;
        let handle = self.handle.as_mut().ok_or(QpError::Closed)?;
        handle
            .post_recv(&desc)
            .map_err(|errno| QpError::PostFailed { op: OP, errno })?;
        wr.assign(desc.wr_id);
        Ok(desc.wr_id)
    }

    /// One-sided write of the request's region to `remote`.
    ///
    /// # Safety
    /// The local region must stay registered and alive until completion, and
    /// `remote` must name memory the peer registered for remote write.
    pub unsafe fn post_write(
        &mut self,
        wr: &mut SendWorkRequest,
        remote: RemoteTarget,
    ) -> Result<WrId> {
        unsafe { self.post_write_imm(wr, remote, 0) }
    }

    /// One-sided write that also delivers `imm` to the peer's completion queue.
    /// The peer must have a receive posted for the notification to surface.
    /// Signaled like a plain write, so the region may be any size.
    ///
    /// # Safety
    /// Same contract as [`QueuePair::post_write`].
    pub unsafe fn post_write_imm(
        &mut self,
        wr: &mut SendWorkRequest,
        remote: RemoteTarget,
        imm: u32,
    ) -> Result<WrId> {
        const OP: &str = "post_write";
        let id = self.submit_send(OP, |id| {
            let mr = wr
                .memory_region()
                .ok_or(QpError::MissingMemoryRegion { op: OP })?;
            SendDescriptor::write(id, mr, remote, imm)
        })?;
        wr.assign(id);
        Ok(id)
    }

    /// One-sided read of `remote` into the request's region.
    ///
    /// # Safety
    /// The local region must stay registered and alive until completion, and
    /// `remote` must name memory the peer registered for remote read.
    pub unsafe fn post_read(&mut self, wr: &mut SendWorkRequest, remote: RemoteTarget) -> Result<WrId> {
        const OP: &str = "post_read";
        let id = self.submit_send(OP, |id| {
            let mr = wr
                .memory_region()
                .ok_or(QpError::MissingMemoryRegion { op: OP })?;
            SendDescriptor::read(id, mr, remote)
        })?;
        wr.assign(id);
        Ok(id)
    }

    fn submit_send(
        &mut self,
        op: &'static str,
        build: impl FnOnce(WrId) -> Result<SendDescriptor>,
    ) -> Result<WrId> {
        self.ensure_postable(op, QpState::accepts_sends)?;
        let desc = build(self.wr_ids.next())?;
        let handle = self.handle.as_mut().ok_or(QpError::Closed)?;
        desc.check_inline(handle.max_inline_data())?;
        handle
            .post_send(&desc)
            .map_err(|errno| QpError::PostFailed { op, errno })?;
        Ok(desc.wr_id)
    }

    fn ensure_postable(&self, op: &'static str, accepts: fn(QpState) -> bool) -> Result<()> {
        if self.handle.is_none() {
            return Err(QpError::Closed);
        }
        if !accepts(self.state) {
            return Err(QpError::NotReady {
                op,
                state: self.state,
            });
        }
        Ok(())
    }

    /// Destroy the hardware queue pair. Idempotent.
    ///
    /// All posted requests must have completed. If the driver refuses, the
    /// queue pair stays open and the call can be retried.
    pub fn close(&mut self) -> Result<()> {
        let Some(mut handle) = self.handle.take() else {
            return Ok(());
        };
        if let Err(errno) = handle.destroy() {
            self.handle = Some(handle);
            return Err(QpError::Teardown {
                resource: "queue pair",
                errno,
            });
        }
        let from = self.state;
        self.state = QpState::Closed;
        tracing::debug!(qp_num = self.qp_num, from = %from, "queue pair closed");
        Ok(())
    }
}

impl std::fmt::Debug for QueuePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuePair")
            .field("qp_num", &self.qp_num)
            .field("psn", &self.psn)
            .field("local", &self.local)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Drop for QueuePair {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(qp_num = self.qp_num, "failed to close queue pair: {e}");
        }
    }
}
