//! Completion queue shared by the queue pairs bound to it.

use super::context::RdmaContext;
use crate::error::{QpError, Result};
use crate::wr::WrId;
use std::ptr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Most completion entries reaped by one `poll_cq` call.
pub const POLL_BATCH: usize = 16;

/// One reaped completion entry, as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub wr_id: WrId,
    /// `None` on success, otherwise `(status, vendor_err)`.
    pub error: Option<(u32, u32)>,
    pub opcode: u32,
    pub byte_len: usize,
    /// Host-order immediate value, if the completion carried one.
    pub imm: Option<u32>,
}

impl Completion {
    fn from_raw(wc: &ibverbs_sys::ibv_wc) -> Self {
        Self {
            wr_id: WrId::from_raw(wc.wr_id()),
            error: wc.error().map(|(status, vendor_err)| (status as u32, vendor_err)),
            opcode: wc.opcode() as u32,
            byte_len: wc.len(),
            imm: wc.imm_data().map(u32::from_be),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Convert a failed completion into an error.
    pub fn check(&self) -> Result<()> {
        match self.error {
            None => Ok(()),
            Some((status, vendor_err)) => Err(QpError::CompletionFailed {
                status,
                vendor_err,
                wr_id: self.wr_id.get(),
            }),
        }
    }
}

/// A hardware completion ring.
///
/// Its capacity bounds the outstanding send and receive work requests of every
/// queue pair created against it. Queue pairs hold it through an `Arc` and
/// never destroy it themselves.
pub struct CompletionQueue {
    cq: *mut ibverbs_sys::ibv_cq,
    capacity: u32,
    poll_lock: Mutex<()>,
    _ctx: Arc<RdmaContext>,
}

unsafe impl Send for CompletionQueue {}
unsafe impl Sync for CompletionQueue {}

impl CompletionQueue {
    pub(super) fn create(ctx: &Arc<RdmaContext>, capacity: u32) -> Result<Self> {
        let cqe = c_capacity(capacity)?;
        let cq = unsafe {
            ibverbs_sys::ibv_create_cq(ctx.ctx, cqe, ptr::null_mut(), ptr::null_mut(), 0)
        };
        if cq.is_null() {
            return Err(QpError::creation("completion queue"));
        }
        // The provider may round the ring up; report what it granted.
        let granted = unsafe { (*cq).cqe };
        tracing::debug!(requested = capacity, granted, "created completion queue");
        Ok(Self {
            cq,
            capacity: u32::try_from(granted).unwrap_or(capacity),
            poll_lock: Mutex::new(()),
            _ctx: Arc::clone(ctx),
        })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub(crate) fn as_ptr(&self) -> *mut ibverbs_sys::ibv_cq {
        self.cq
    }

    /// Reap up to `max` entries without blocking, appending them to `out`.
    /// Returns how many were appended.
    ///
    /// Entries are reaped in batches of at most [`POLL_BATCH`] into a stack
    /// buffer, so polling never allocates beyond growing `out`.
    pub fn poll(&self, out: &mut Vec<Completion>, max: usize) -> Result<usize> {
        if max == 0 {
            return Ok(0);
        }
        let mut wcs: [ibverbs_sys::ibv_wc; POLL_BATCH] =
            std::array::from_fn(|_| ibverbs_sys::ibv_wc::default());
        let _guard = self.poll_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut reaped = 0;
        while reaped < max {
            let batch = batch_len(max - reaped);
            let n = unsafe {
                let ctx = (*self.cq).context;
                let ops = &mut (*ctx).ops;
                let poll_cq = ops
                    .poll_cq
                    .as_mut()
                    .ok_or_else(|| QpError::device("provider has no poll_cq"))?;
                poll_cq(self.cq, batch as i32, wcs.as_mut_ptr())
            };
            if n < 0 {
                return Err(QpError::device(format!("poll_cq failed (rc={n})")));
            }
            let n = n as usize;
            out.extend(wcs[..n].iter().map(Completion::from_raw));
            reaped += n;
            if n < batch {
                break;
            }
        }
        Ok(reaped)
    }

    /// Poll until `expected` entries arrive or `timeout` elapses.
    ///
    /// Uses tiered backoff: spin for 1000 iterations, then sleep 10µs for 4000
    /// iterations, then sleep 100µs until timeout. Failed completions are
    /// returned like any other entry.
    pub fn wait_for(&self, expected: usize, timeout: Duration) -> Result<Vec<Completion>> {
        let start = Instant::now();
        let mut done = Vec::with_capacity(expected);
        let mut iter = 0u32;
        while done.len() < expected {
            self.poll(&mut done, expected - done.len())?;
            if done.len() >= expected {
                break;
            }
            if start.elapsed() > timeout {
                return Err(QpError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                    expected,
                    received: done.len(),
                });
            }
            if iter < 1000 {
                std::hint::spin_loop();
            } else if iter < 5000 {
                std::thread::sleep(Duration::from_micros(10));
            } else {
                std::thread::sleep(Duration::from_micros(100));
            }
            iter = iter.saturating_add(1);
        }
        Ok(done)
    }
}

impl Drop for CompletionQueue {
    fn drop(&mut self) {
        unsafe {
            if !self.cq.is_null() {
                let rc = ibverbs_sys::ibv_destroy_cq(self.cq);
                if rc != 0 {
                    tracing::warn!(errno = rc, "ibv_destroy_cq failed");
                }
            }
        }
    }
}

/// Entries to request from the next `poll_cq` call.
fn batch_len(remaining: usize) -> usize {
    remaining.min(POLL_BATCH)
}

fn c_capacity(n: u32) -> Result<i32> {
    if n == 0 {
        return Err(QpError::invalid("completion queue capacity must be non-zero"));
    }
    i32::try_from(n).map_err(|_| QpError::invalid(format!("capacity {n} too large")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_bounds() {
        assert!(c_capacity(0).is_err());
        assert_eq!(c_capacity(256).unwrap(), 256);
        assert!(c_capacity(u32::MAX).is_err());
    }

    #[test]
    fn test_batches_fit_stack_buffer() {
        assert_eq!(batch_len(1), 1);
        assert_eq!(batch_len(POLL_BATCH), POLL_BATCH);
        assert_eq!(batch_len(usize::MAX), POLL_BATCH);
        // Every batch length converts to the provider's `int` argument.
        assert!(i32::try_from(POLL_BATCH).is_ok());
    }

    #[test]
    fn test_completion_check() {
        let ok = Completion {
            wr_id: WrId::from_raw(3),
            error: None,
            opcode: 0,
            byte_len: 64,
            imm: None,
        };
        assert!(ok.is_ok());
        assert!(ok.check().is_ok());

        let failed = Completion {
            error: Some((10, 0x88)),
            ..ok
        };
        assert!(matches!(
            failed.check(),
            Err(QpError::CompletionFailed {
                status: 10,
                vendor_err: 0x88,
                wr_id: 3,
            })
        ));
    }

    #[test]
    fn test_default_wc_decodes_as_success() {
        let c = Completion::from_raw(&ibverbs_sys::ibv_wc::default());
        assert_eq!(c.wr_id.get(), 0);
        assert!(c.is_ok());
        assert_eq!(c.imm, None);
    }
}
