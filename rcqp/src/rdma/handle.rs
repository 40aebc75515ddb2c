//! The hardware side of a queue pair.
//!
//! [`QpHandle`] is the seam between the host-side state machine in
//! [`QueuePair`](crate::QueuePair) and whatever executes its requests.
//! [`IbvQp`] implements it over a raw `ibv_qp` using `ibverbs-sys`.

use super::context::ProtectionDomain;
use super::cq::CompletionQueue;
use crate::error::{QpError, Result};
use crate::transition::Transition;
use crate::wr::{ReceiveDescriptor, SendDescriptor};
use ibverbs_sys::ibv_qp_type;
use std::os::raw::c_int;
use std::ptr;
use std::sync::Arc;

/// Driver error code returned by a rejected verb.
pub type Errno = i32;

/// Operations a queue pair issues against hardware.
///
/// Every method maps to exactly one verb. Implementations report rejection
/// through the raw errno and never retry.
pub trait QpHandle: Send {
    /// Queue pair number assigned by the device.
    fn qp_num(&self) -> u32;

    /// Largest inline payload the device granted, in bytes.
    fn max_inline_data(&self) -> u32;

    /// Apply one handshake step atomically (`ibv_modify_qp`).
    fn modify(&mut self, transition: &Transition) -> std::result::Result<(), Errno>;

    /// Enqueue one send-queue descriptor (`ibv_post_send`).
    fn post_send(&mut self, wr: &SendDescriptor) -> std::result::Result<(), Errno>;

    /// Enqueue one receive-queue descriptor (`ibv_post_recv`).
    fn post_recv(&mut self, wr: &ReceiveDescriptor) -> std::result::Result<(), Errno>;

    /// Release the hardware queue pair. Called at most once after success.
    fn destroy(&mut self) -> std::result::Result<(), Errno>;
}

/// Creation-time sizing for an [`IbvQp`].
#[derive(Debug, Clone, Copy)]
pub struct QpCapabilities {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_inline_data: u32,
}

/// A reliable-connected `ibv_qp`.
///
/// Exclusively owns the queue pair. The protection domain and completion queue
/// are kept alive through `Arc`s and are never destroyed from here.
pub struct IbvQp {
    qp: *mut ibverbs_sys::ibv_qp,
    max_inline_data: u32,
    _cq: Arc<CompletionQueue>,
    _pd: Arc<ProtectionDomain>,
}

unsafe impl Send for IbvQp {}

impl IbvQp {
    /// Create an RC queue pair in RESET, with both queues reporting to `cq`.
    pub fn create(
        pd: &Arc<ProtectionDomain>,
        cq: &Arc<CompletionQueue>,
        caps: QpCapabilities,
    ) -> Result<Self> {
        if caps.max_send_wr == 0 || caps.max_recv_wr == 0 {
            return Err(QpError::invalid("queue pair needs room for at least one request"));
        }
        let mut init_attr: ibverbs_sys::ibv_qp_init_attr = unsafe { std::mem::zeroed() };
        init_attr.qp_type = ibv_qp_type::IBV_QPT_RC;
        init_attr.send_cq = cq.as_ptr();
        init_attr.recv_cq = cq.as_ptr();
        init_attr.cap.max_send_wr = caps.max_send_wr;
        init_attr.cap.max_recv_wr = caps.max_recv_wr;
        init_attr.cap.max_send_sge = 1;
        init_attr.cap.max_recv_sge = 1;
        init_attr.cap.max_inline_data = caps.max_inline_data;
        // Every send completes visibly, so inline sends cannot silently
        // fill up the send queue.
        init_attr.sq_sig_all = 1;

        let qp = unsafe { ibverbs_sys::ibv_create_qp(pd.pd, &mut init_attr) };
        if qp.is_null() {
            return Err(QpError::creation("queue pair"));
        }
        // The provider writes the capacities it actually granted back into
        // `init_attr.cap`.
        let max_inline_data = init_attr.cap.max_inline_data;
        if max_inline_data < caps.max_inline_data {
            tracing::debug!(
                requested = caps.max_inline_data,
                granted = max_inline_data,
                "device reduced inline capacity"
            );
        }
        Ok(Self {
            qp,
            max_inline_data,
            _cq: Arc::clone(cq),
            _pd: Arc::clone(pd),
        })
    }
}

impl QpHandle for IbvQp {
    fn qp_num(&self) -> u32 {
        if self.qp.is_null() {
            return 0;
        }
        unsafe { (*self.qp).qp_num }
    }

    fn max_inline_data(&self) -> u32 {
        self.max_inline_data
    }

    fn modify(&mut self, transition: &Transition) -> std::result::Result<(), Errno> {
        if self.qp.is_null() {
            return Err(EBADF);
        }
        let (mut attr, mask) = transition.to_raw();
        let rc = unsafe { ibverbs_sys::ibv_modify_qp(self.qp, &mut attr, mask.0 as c_int) };
        if rc != 0 { Err(rc) } else { Ok(()) }
    }

    fn post_send(&mut self, wr: &SendDescriptor) -> std::result::Result<(), Errno> {
        if self.qp.is_null() {
            return Err(EBADF);
        }
        wr.with_raw(|raw| unsafe {
            let mut bad_wr: *mut ibverbs_sys::ibv_send_wr = ptr::null_mut();
            let ctx = (*self.qp).context;
            let ops = &mut (*ctx).ops;
            let Some(post_send) = ops.post_send.as_mut() else {
                return Err(ENOSYS);
            };
            let rc = post_send(self.qp, raw as *mut _, &mut bad_wr as *mut _);
            if rc != 0 { Err(rc) } else { Ok(()) }
        })
    }

    fn post_recv(&mut self, wr: &ReceiveDescriptor) -> std::result::Result<(), Errno> {
        if self.qp.is_null() {
            return Err(EBADF);
        }
        wr.with_raw(|raw| unsafe {
            let mut bad_wr: *mut ibverbs_sys::ibv_recv_wr = ptr::null_mut();
            let ctx = (*self.qp).context;
            let ops = &mut (*ctx).ops;
            let Some(post_recv) = ops.post_recv.as_mut() else {
                return Err(ENOSYS);
            };
            let rc = post_recv(self.qp, raw as *mut _, &mut bad_wr as *mut _);
            if rc != 0 { Err(rc) } else { Ok(()) }
        })
    }

    fn destroy(&mut self) -> std::result::Result<(), Errno> {
        if self.qp.is_null() {
            return Ok(());
        }
        let rc = unsafe { ibverbs_sys::ibv_destroy_qp(self.qp) };
        if rc != 0 {
            return Err(rc);
        }
        self.qp = ptr::null_mut();
        Ok(())
    }
}

impl Drop for IbvQp {
    fn drop(&mut self) {
        if let Err(errno) = self.destroy() {
            tracing::warn!(errno, "ibv_destroy_qp failed while dropping queue pair");
        }
    }
}

/// Reported when the queue pair has already been destroyed.
const EBADF: Errno = 9;

/// Reported when the provider did not install a posting op.
const ENOSYS: Errno = 38;
