//! Registered memory: the descriptors work requests reference, and an owning
//! host buffer registered with a protection domain.

use super::context::ProtectionDomain;
use crate::error::{QpError, Result};
use crate::wr::RemoteTarget;
use std::os::raw::c_int;
use std::ptr::NonNull;
use std::sync::Arc;

/// Address, length and keys of a registered memory range.
///
/// This is a plain descriptor: it does not keep the memory alive. Whoever
/// posts a work request referencing it must keep the underlying registration
/// valid until the request completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    addr: u64,
    len: usize,
    lkey: u32,
    rkey: u32,
}

impl MemoryRegion {
    pub const fn new(addr: u64, len: usize, lkey: u32, rkey: u32) -> Self {
        Self {
            addr,
            len,
            lkey,
            rkey,
        }
    }

    pub const fn addr(&self) -> u64 {
        self.addr
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub const fn lkey(&self) -> u32 {
        self.lkey
    }

    pub const fn rkey(&self) -> u32 {
        self.rkey
    }

    /// A sub-range of this region, sharing its keys.
    pub fn slice(&self, offset: usize, len: usize) -> Option<MemoryRegion> {
        let end = offset.checked_add(len)?;
        if end > self.len {
            return None;
        }
        Some(MemoryRegion {
            addr: self.addr.checked_add(offset as u64)?,
            len,
            ..*self
        })
    }

    /// What a peer needs to target this region with one-sided operations.
    pub fn remote(&self) -> RemoteBuffer {
        RemoteBuffer {
            addr: self.addr,
            len: self.len as u64,
            rkey: self.rkey,
        }
    }
}

/// A peer's registered region as advertised out of band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteBuffer {
    pub addr: u64,
    pub len: u64,
    pub rkey: u32,
}

/// Serialized size: addr(8) + len(8) + rkey(4).
pub const REMOTE_BUFFER_SIZE: usize = 20;

impl RemoteBuffer {
    /// Target `offset` bytes into the buffer.
    pub fn target(&self, offset: u64) -> Option<RemoteTarget> {
        if offset >= self.len {
            return None;
        }
        Some(RemoteTarget {
            // Decoded buffers come from the peer and may carry any address.
            addr: self.addr.checked_add(offset)?,
            rkey: self.rkey,
        })
    }

    pub fn to_bytes(&self) -> [u8; REMOTE_BUFFER_SIZE] {
        let mut buf = [0u8; REMOTE_BUFFER_SIZE];
        buf[0..8].copy_from_slice(&self.addr.to_le_bytes());
        buf[8..16].copy_from_slice(&self.len.to_le_bytes());
        buf[16..20].copy_from_slice(&self.rkey.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let buf: &[u8; REMOTE_BUFFER_SIZE] = buf.try_into().map_err(|_| {
            QpError::invalid(format!(
                "remote buffer is {REMOTE_BUFFER_SIZE} bytes, got {}",
                buf.len()
            ))
        })?;
        let mut addr = [0u8; 8];
        let mut len = [0u8; 8];
        let mut rkey = [0u8; 4];
        addr.copy_from_slice(&buf[0..8]);
        len.copy_from_slice(&buf[8..16]);
        rkey.copy_from_slice(&buf[16..20]);
        Ok(Self {
            addr: u64::from_le_bytes(addr),
            len: u64::from_le_bytes(len),
            rkey: u32::from_le_bytes(rkey),
        })
    }
}

/// Zeroed host memory owned by this process and registered with a protection
/// domain for local write and remote read/write.
///
/// The keys are read once at registration; [`RegisteredBuffer::region`] hands
/// out the descriptor work requests reference. Dropping deregisters the memory
/// before freeing it, so no request referencing it may still be in flight.
pub struct RegisteredBuffer {
    mr: NonNull<ibverbs_sys::ibv_mr>,
    bytes: NonNull<[u8]>,
    region: MemoryRegion,
    _pd: Arc<ProtectionDomain>,
}

unsafe impl Send for RegisteredBuffer {}
unsafe impl Sync for RegisteredBuffer {}

impl RegisteredBuffer {
    pub(super) fn allocate(pd: &Arc<ProtectionDomain>, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(QpError::invalid("cannot register an empty buffer"));
        }
        let bytes = NonNull::from(Box::leak(vec![0u8; size].into_boxed_slice()));
        let access = crate::transition::qp_access_flags();
        let raw = unsafe {
            ibverbs_sys::ibv_reg_mr(pd.pd, bytes.as_ptr().cast(), size, access.0 as c_int)
        };
        let Some(mr) = NonNull::new(raw) else {
            let err = QpError::creation("memory region");
            drop(unsafe { Box::from_raw(bytes.as_ptr()) });
            return Err(err);
        };
        let (lkey, rkey) = unsafe { (mr.as_ref().lkey, mr.as_ref().rkey) };
        Ok(Self {
            mr,
            bytes,
            region: MemoryRegion::new(bytes.as_ptr().cast::<u8>() as u64, size, lkey, rkey),
            _pd: Arc::clone(pd),
        })
    }

    /// Descriptor of the whole buffer.
    pub fn region(&self) -> MemoryRegion {
        self.region
    }

    pub fn lkey(&self) -> u32 {
        self.region.lkey()
    }

    pub fn rkey(&self) -> u32 {
        self.region.rkey()
    }
}

impl std::ops::Deref for RegisteredBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // Only hardware writes behind our back, and callers must not read a
        // buffer with a request still posted against it.
        unsafe { self.bytes.as_ref() }
    }
}

impl std::ops::DerefMut for RegisteredBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { self.bytes.as_mut() }
    }
}

impl Drop for RegisteredBuffer {
    fn drop(&mut self) {
        let rc = unsafe { ibverbs_sys::ibv_dereg_mr(self.mr.as_ptr()) };
        if rc != 0 {
            // The device may still reference the pages.
            tracing::warn!(
                errno = rc,
                len = self.region.len(),
                "ibv_dereg_mr failed, leaking buffer"
            );
            return;
        }
        drop(unsafe { Box::from_raw(self.bytes.as_ptr()) });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_bounds() {
        let mr = MemoryRegion::new(0x1000, 64, 11, 22);
        let sub = mr.slice(16, 32).unwrap();
        assert_eq!(sub.addr(), 0x1010);
        assert_eq!(sub.len(), 32);
        assert_eq!(sub.lkey(), 11);
        assert_eq!(sub.rkey(), 22);
        assert!(mr.slice(48, 17).is_none());
        assert!(mr.slice(usize::MAX, 2).is_none());
        assert_eq!(mr.slice(64, 0).map(|r| r.is_empty()), Some(true));
    }

    #[test]
    fn test_remote_buffer_target() {
        let remote = MemoryRegion::new(0x8000, 4096, 1, 0xdead).remote();
        assert_eq!(
            remote.target(128),
            Some(RemoteTarget {
                addr: 0x8080,
                rkey: 0xdead,
            })
        );
        assert!(remote.target(4096).is_none());
    }

    #[test]
    fn test_remote_target_near_address_space_end() {
        let mut bytes = RemoteBuffer {
            addr: u64::MAX - 8,
            len: 64,
            rkey: 5,
        }
        .to_bytes();
        let remote = RemoteBuffer::from_bytes(&bytes).unwrap();
        assert_eq!(remote.target(8).map(|t| t.addr), Some(u64::MAX));
        assert!(remote.target(9).is_none());
        assert!(remote.target(63).is_none());

        bytes[0..8].copy_from_slice(&u64::MAX.to_le_bytes());
        let remote = RemoteBuffer::from_bytes(&bytes).unwrap();
        assert_eq!(remote.target(0).map(|t| t.addr), Some(u64::MAX));
        assert!(remote.target(1).is_none());
    }

    #[test]
    fn test_remote_buffer_bytes() {
        let remote = RemoteBuffer {
            addr: 0x7f00_0000_1000,
            len: 8192,
            rkey: 0x1234_5678,
        };
        let bytes = remote.to_bytes();
        assert_eq!(&bytes[16..20], &0x1234_5678u32.to_le_bytes());
        assert_eq!(RemoteBuffer::from_bytes(&bytes).unwrap(), remote);
        assert!(RemoteBuffer::from_bytes(&bytes[..19]).is_err());
    }
}
