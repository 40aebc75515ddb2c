//! Device context and protection domain.

use super::cq::CompletionQueue;
use super::mr::RegisteredBuffer;
use crate::endpoint::{ConnectionParameters, Gid, LocalPort};
use crate::error::{QpError, Result};
use crate::qp::QueuePair;
use std::os::raw::c_int;
use std::sync::Arc;

/// An opened RDMA device bound to one physical port.
///
/// Owns the ibverbs context. The port's LID and the GID at the chosen table
/// index are queried once at open time and reported to peers through
/// [`RdmaContext::local_parameters`]. Queue pairs created against this context
/// send from that same GID index.
pub struct RdmaContext {
    pub(super) ctx: *mut ibverbs_sys::ibv_context,
    local: LocalPort,
    lid: u16,
    gid: Gid,
}

unsafe impl Send for RdmaContext {}
unsafe impl Sync for RdmaContext {}

/// The device array returned by `ibv_get_device_list`, released on drop.
struct DeviceList {
    devices: *mut *mut ibverbs_sys::ibv_device,
    len: usize,
}

impl DeviceList {
    fn get() -> Result<Self> {
        let mut len: c_int = 0;
        let devices = unsafe { ibverbs_sys::ibv_get_device_list(&mut len) };
        if devices.is_null() {
            return Err(QpError::device_os("ibv_get_device_list failed"));
        }
        Ok(Self {
            devices,
            len: usize::try_from(len).unwrap_or(0),
        })
    }

    fn open(&self, index: usize) -> Result<*mut ibverbs_sys::ibv_context> {
        if self.len == 0 {
            return Err(QpError::device("no RDMA devices found"));
        }
        if index >= self.len {
            return Err(QpError::device(format!(
                "device index {index} out of range ({} available)",
                self.len
            )));
        }
        let ctx = unsafe { ibverbs_sys::ibv_open_device(*self.devices.add(index)) };
        if ctx.is_null() {
            return Err(QpError::device_os("ibv_open_device failed"));
        }
        Ok(ctx)
    }
}

impl Drop for DeviceList {
    fn drop(&mut self) {
        unsafe { ibverbs_sys::ibv_free_device_list(self.devices) };
    }
}

impl RdmaContext {
    /// Open the device at `device_index` (first device when `None`) and bind
    /// it to `port`, whose GID is read from table entry `gid_index`.
    pub fn open(device_index: Option<usize>, port: u8, gid_index: u8) -> Result<Arc<Self>> {
        if port == 0 {
            return Err(QpError::invalid("port numbers start at 1"));
        }
        let ctx = DeviceList::get()?.open(device_index.unwrap_or(0))?;
        // From here on the context closes itself on any early return.
        let mut opened = Self {
            ctx,
            local: LocalPort { port, gid_index },
            lid: 0,
            gid: Gid::ZERO,
        };
        opened.query_port()?;
        tracing::debug!(
            port,
            gid_index,
            lid = opened.lid,
            gid = %opened.gid,
            "opened RDMA device"
        );
        Ok(Arc::new(opened))
    }

    fn query_port(&mut self) -> Result<()> {
        let LocalPort { port, gid_index } = self.local;
        let mut attr = ibverbs_sys::ibv_port_attr::default();
        let rc = unsafe {
            ibverbs_sys::ibv_query_port(
                self.ctx,
                port,
                &mut attr as *mut ibverbs_sys::ibv_port_attr as *mut _,
            )
        };
        if rc != 0 {
            return Err(QpError::device(format!(
                "ibv_query_port({port}) failed (rc={rc})"
            )));
        }
        // The GID table is indeterminate unless the port is ARMED or ACTIVE.
        match attr.state {
            ibverbs_sys::ibv_port_state::IBV_PORT_ACTIVE
            | ibverbs_sys::ibv_port_state::IBV_PORT_ARMED => {}
            state => {
                return Err(QpError::device(format!(
                    "port {port} is not ACTIVE or ARMED (state={state})"
                )));
            }
        }

        let mut gid: ibverbs_sys::ibv_gid = unsafe { std::mem::zeroed() };
        let rc = unsafe {
            ibverbs_sys::ibv_query_gid(self.ctx, port, c_int::from(gid_index), &mut gid)
        };
        if rc != 0 {
            return Err(QpError::device(format!(
                "ibv_query_gid(port={port}, index={gid_index}) failed (rc={rc})"
            )));
        }
        self.lid = attr.lid;
        self.gid = Gid(unsafe { gid.raw });
        Ok(())
    }

    pub fn port(&self) -> u8 {
        self.local.port
    }

    pub fn gid_index(&self) -> u8 {
        self.local.gid_index
    }

    /// Port and GID index queue pairs on this context are bound to.
    pub fn local_port(&self) -> LocalPort {
        self.local
    }

    pub fn lid(&self) -> u16 {
        self.lid
    }

    pub fn gid(&self) -> Gid {
        self.gid
    }

    /// Allocate a protection domain on this device.
    pub fn alloc_pd(self: &Arc<Self>) -> Result<Arc<ProtectionDomain>> {
        let pd = unsafe { ibverbs_sys::ibv_alloc_pd(self.ctx) };
        if pd.is_null() {
            return Err(QpError::creation("protection domain"));
        }
        Ok(Arc::new(ProtectionDomain {
            pd,
            ctx: Arc::clone(self),
        }))
    }

    /// Create a completion queue with room for `capacity` entries.
    pub fn create_cq(self: &Arc<Self>, capacity: u32) -> Result<Arc<CompletionQueue>> {
        CompletionQueue::create(self, capacity).map(Arc::new)
    }

    /// The parameters a peer needs to connect to `qp` through this device.
    pub fn local_parameters(&self, qp: &QueuePair) -> ConnectionParameters {
        ConnectionParameters {
            qp_num: qp.qp_num(),
            psn: qp.psn(),
            lid: self.lid,
            gid: self.gid,
        }
    }
}

impl Drop for RdmaContext {
    fn drop(&mut self) {
        unsafe {
            if !self.ctx.is_null() {
                let rc = ibverbs_sys::ibv_close_device(self.ctx);
                if rc != 0 {
                    tracing::warn!(errno = rc, "ibv_close_device failed");
                }
            }
        }
    }
}

/// Access-control scope shared by a queue pair and the memory it touches.
pub struct ProtectionDomain {
    pub(crate) pd: *mut ibverbs_sys::ibv_pd,
    ctx: Arc<RdmaContext>,
}

unsafe impl Send for ProtectionDomain {}
unsafe impl Sync for ProtectionDomain {}

impl ProtectionDomain {
    pub fn context(&self) -> &Arc<RdmaContext> {
        &self.ctx
    }

    /// Allocate and register a zeroed host buffer of `size` bytes.
    pub fn register(self: &Arc<Self>, size: usize) -> Result<RegisteredBuffer> {
        RegisteredBuffer::allocate(self, size)
    }
}

impl Drop for ProtectionDomain {
    fn drop(&mut self) {
        unsafe {
            if !self.pd.is_null() {
                let rc = ibverbs_sys::ibv_dealloc_pd(self.pd);
                if rc != 0 {
                    tracing::warn!(errno = rc, "ibv_dealloc_pd failed");
                }
            }
        }
    }
}
