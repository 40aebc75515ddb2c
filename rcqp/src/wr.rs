//! Work requests and the descriptors built from them at posting time.
//!
//! A [`SendWorkRequest`] / [`ReceiveWorkRequest`] is what callers hand to the
//! queue pair. At posting time it is turned into a [`SendDescriptor`] or
//! [`ReceiveDescriptor`]: a fully decided opcode, completion mode, scatter/gather
//! element and remote target. Only then is it lowered to the raw
//! `ibv_send_wr` / `ibv_recv_wr` the provider consumes.

use crate::error::{QpError, Result};
use crate::rdma::MemoryRegion;
use ibverbs_sys::{ibv_recv_wr, ibv_send_flags, ibv_send_wr, ibv_sge, ibv_wr_opcode};
use std::ptr;

/// Identifier attached to a posted work request and echoed in its completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WrId(u64);

impl WrId {
    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for WrId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic source of work-request ids, one per queue pair. Starts at 1 so a
/// zeroed completion entry never matches a real request.
#[derive(Debug)]
pub(crate) struct WrIdCounter {
    next: u64,
}

impl Default for WrIdCounter {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl WrIdCounter {
    pub(crate) fn next(&mut self) -> WrId {
        let id = WrId(self.next);
        self.next += 1;
        id
    }
}

/// One contiguous local buffer referenced by a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScatterGatherElement {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

impl ScatterGatherElement {
    /// Spans the whole region.
    pub fn from_region(mr: &MemoryRegion) -> Result<Self> {
        // A zero-length SGE is read by hardware as 2^31 bytes.
        if mr.is_empty() {
            return Err(QpError::invalid("memory region is empty"));
        }
        let length = u32::try_from(mr.len()).map_err(|_| {
            QpError::invalid(format!(
                "memory region of {} bytes does not fit one scatter/gather element",
                mr.len()
            ))
        })?;
        Ok(Self {
            addr: mr.addr(),
            length,
            lkey: mr.lkey(),
        })
    }

    fn to_raw(self) -> ibv_sge {
        ibv_sge {
            addr: self.addr,
            length: self.length,
            lkey: self.lkey,
        }
    }
}

/// Where a one-sided operation lands on the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteTarget {
    pub addr: u64,
    pub rkey: u32,
}

/// Send-shaped request: used for send, RDMA write and RDMA read.
#[derive(Debug, Clone, Default)]
pub struct SendWorkRequest {
    mr: Option<MemoryRegion>,
    id: Option<WrId>,
}

impl SendWorkRequest {
    pub fn new(mr: MemoryRegion) -> Self {
        Self {
            mr: Some(mr),
            id: None,
        }
    }

    /// A request with no local buffer; it can only carry immediate data.
    pub fn without_region() -> Self {
        Self::default()
    }

    pub fn memory_region(&self) -> Option<&MemoryRegion> {
        self.mr.as_ref()
    }

    /// Id assigned by the last successful post.
    pub fn id(&self) -> Option<WrId> {
        self.id
    }

    pub(crate) fn assign(&mut self, id: WrId) {
        self.id = Some(id);
    }
}

/// Receive-shaped request.
#[derive(Debug, Clone, Default)]
pub struct ReceiveWorkRequest {
    mr: Option<MemoryRegion>,
    id: Option<WrId>,
}

impl ReceiveWorkRequest {
    pub fn new(mr: MemoryRegion) -> Self {
        Self {
            mr: Some(mr),
            id: None,
        }
    }

    pub fn memory_region(&self) -> Option<&MemoryRegion> {
        self.mr.as_ref()
    }

    pub fn id(&self) -> Option<WrId> {
        self.id
    }

    pub(crate) fn assign(&mut self, id: WrId) {
        self.id = Some(id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOpcode {
    Send,
    SendWithImm,
    RdmaWrite,
    RdmaWriteWithImm,
    RdmaRead,
}

impl SendOpcode {
    fn to_raw(self) -> ibv_wr_opcode::Type {
        match self {
            SendOpcode::Send => ibv_wr_opcode::IBV_WR_SEND,
            SendOpcode::SendWithImm => ibv_wr_opcode::IBV_WR_SEND_WITH_IMM,
            SendOpcode::RdmaWrite => ibv_wr_opcode::IBV_WR_RDMA_WRITE,
            SendOpcode::RdmaWriteWithImm => ibv_wr_opcode::IBV_WR_RDMA_WRITE_WITH_IMM,
            SendOpcode::RdmaRead => ibv_wr_opcode::IBV_WR_RDMA_READ,
        }
    }
}

/// How the payload travels and completes.
///
/// The queue pair is created with every send completion signaled, so an
/// inline post still produces a completion entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// Payload gathered from the SGE by DMA; completion requested explicitly.
    Signaled,
    /// Payload copied into the descriptor at post time.
    Inline,
}

impl SendMode {
    pub const fn is_inline(self) -> bool {
        matches!(self, SendMode::Inline)
    }

    pub const fn is_signaled(self) -> bool {
        matches!(self, SendMode::Signaled)
    }

    fn to_raw(self) -> ibv_send_flags {
        match self {
            SendMode::Signaled => ibv_send_flags::IBV_SEND_SIGNALED,
            SendMode::Inline => ibv_send_flags::IBV_SEND_INLINE,
        }
    }

    // A send carrying immediate data always goes inline; so does a send with
    // nothing to gather. One-sided operations never do.
    fn choose(has_sge: bool, imm: Option<u32>) -> Self {
        if imm.is_some() || !has_sge {
            SendMode::Inline
        } else {
            SendMode::Signaled
        }
    }
}

/// A send-queue descriptor with every field decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendDescriptor {
    pub wr_id: WrId,
    pub opcode: SendOpcode,
    pub mode: SendMode,
    pub sge: Option<ScatterGatherElement>,
    /// Host-order immediate value; `None` when the request carries none.
    pub imm: Option<u32>,
    pub remote: Option<RemoteTarget>,
}

impl SendDescriptor {
    /// Two-sided send. `imm == 0` means no immediate data.
    pub fn send(wr_id: WrId, mr: Option<&MemoryRegion>, imm: u32) -> Result<Self> {
        let sge = mr.map(ScatterGatherElement::from_region).transpose()?;
        let imm = (imm > 0).then_some(imm);
        Ok(Self {
            wr_id,
            opcode: if imm.is_some() {
                SendOpcode::SendWithImm
            } else {
                SendOpcode::Send
            },
            mode: SendMode::choose(sge.is_some(), imm),
            sge,
            imm,
            remote: None,
        })
    }

    /// One-sided write of the whole local region to `remote`.
    pub fn write(wr_id: WrId, mr: &MemoryRegion, remote: RemoteTarget, imm: u32) -> Result<Self> {
        let sge = ScatterGatherElement::from_region(mr)?;
        let imm = (imm > 0).then_some(imm);
        Ok(Self {
            wr_id,
            opcode: if imm.is_some() {
                SendOpcode::RdmaWriteWithImm
            } else {
                SendOpcode::RdmaWrite
            },
            mode: SendMode::Signaled,
            sge: Some(sge),
            imm,
            remote: Some(remote),
        })
    }

    /// One-sided read from `remote` into the whole local region.
    pub fn read(wr_id: WrId, mr: &MemoryRegion, remote: RemoteTarget) -> Result<Self> {
        Ok(Self {
            wr_id,
            opcode: SendOpcode::RdmaRead,
            mode: SendMode::Signaled,
            sge: Some(ScatterGatherElement::from_region(mr)?),
            imm: None,
            remote: Some(remote),
        })
    }

    /// Fails when an inline payload is larger than `max_inline` bytes, the
    /// capacity the queue pair was granted at creation.
    pub fn check_inline(&self, max_inline: u32) -> Result<()> {
        match self.sge {
            Some(sge) if self.mode.is_inline() && sge.length > max_inline => {
                Err(QpError::invalid(format!(
                    "inline payload of {} bytes exceeds the {max_inline}-byte inline capacity",
                    sge.length
                )))
            }
            _ => Ok(()),
        }
    }

    /// Lower to an `ibv_send_wr` and hand it to `f`.
    ///
    /// The SGE lives on this stack frame, so the raw pointer in `sg_list` is
    /// only valid inside `f`.
    pub fn with_raw<R>(&self, f: impl FnOnce(&mut ibv_send_wr) -> R) -> R {
        let mut sge = self.sge.map(ScatterGatherElement::to_raw);
        let mut wr: ibv_send_wr = unsafe { std::mem::zeroed() };
        wr.wr_id = self.wr_id.get();
        wr.next = ptr::null_mut();
        match sge.as_mut() {
            Some(sge) => {
                wr.sg_list = sge;
                wr.num_sge = 1;
            }
            None => {
                wr.sg_list = ptr::null_mut();
                wr.num_sge = 0;
            }
        }
        wr.opcode = self.opcode.to_raw();
        wr.send_flags = self.mode.to_raw().0;
        if let Some(imm) = self.imm {
            wr.__bindgen_anon_1.imm_data = imm.to_be();
        }
        if let Some(remote) = self.remote {
            wr.wr.rdma.remote_addr = remote.addr;
            wr.wr.rdma.rkey = remote.rkey;
        }
        f(&mut wr)
    }
}

/// A receive-queue descriptor: always exactly one SGE spanning the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveDescriptor {
    pub wr_id: WrId,
    pub sge: ScatterGatherElement,
}

impl ReceiveDescriptor {
    pub fn new(wr_id: WrId, mr: &MemoryRegion) -> Result<Self> {
        Ok(Self {
            wr_id,
            sge: ScatterGatherElement::from_region(mr)?,
        })
    }

    pub fn with_raw<R>(&self, f: impl FnOnce(&mut ibv_recv_wr) -> R) -> R {
        let mut sge = self.sge.to_raw();
        let mut wr: ibv_recv_wr = unsafe { std::mem::zeroed() };
        wr.wr_id = self.wr_id.get();
        wr.next = ptr::null_mut();
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        f(&mut wr)
    }
}
