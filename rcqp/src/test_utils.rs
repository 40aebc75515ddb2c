//! Recording queue-pair handle for exercising [`QueuePair`] without hardware.

use crate::config::QpConfig;
use crate::endpoint::{ConnectionParameters, Gid, LocalPort};
use crate::psn::Psn;
use crate::qp::QueuePair;
use crate::rdma::{Errno, QpHandle};
use crate::transition::Transition;
use crate::wr::{ReceiveDescriptor, SendDescriptor};
use std::sync::{Arc, Mutex};

/// Everything the queue pair asked the "hardware" to do.
#[derive(Debug, Default)]
pub(crate) struct Recorded {
    pub modifies: Vec<Transition>,
    pub sends: Vec<SendDescriptor>,
    pub recvs: Vec<ReceiveDescriptor>,
    pub destroys: usize,
}

pub(crate) struct RecordingHandle {
    qp_num: u32,
    max_inline_data: u32,
    log: Arc<Mutex<Recorded>>,
    fail_modify: Option<Errno>,
    fail_post: Option<Errno>,
    fail_destroy: Option<Errno>,
}

impl RecordingHandle {
    pub fn new(qp_num: u32) -> (Self, Arc<Mutex<Recorded>>) {
        let log = Arc::new(Mutex::new(Recorded::default()));
        let handle = Self {
            qp_num,
            max_inline_data: QpConfig::default().max_inline_data,
            log: Arc::clone(&log),
            fail_modify: None,
            fail_post: None,
            fail_destroy: None,
        };
        (handle, log)
    }

    /// Report `bytes` as the granted inline capacity.
    pub fn with_max_inline(mut self, bytes: u32) -> Self {
        self.max_inline_data = bytes;
        self
    }

    /// Record, then reject every modify with `errno`.
    pub fn fail_modify_with(mut self, errno: Errno) -> Self {
        self.fail_modify = Some(errno);
        self
    }

    /// Reject every post with `errno` without recording it.
    pub fn fail_post_with(mut self, errno: Errno) -> Self {
        self.fail_post = Some(errno);
        self
    }

    /// Reject the next destroy only.
    pub fn fail_destroy_once(mut self, errno: Errno) -> Self {
        self.fail_destroy = Some(errno);
        self
    }

    fn log(&self) -> std::sync::MutexGuard<'_, Recorded> {
        self.log.lock().unwrap()
    }
}

impl QpHandle for RecordingHandle {
    fn qp_num(&self) -> u32 {
        self.qp_num
    }

    fn max_inline_data(&self) -> u32 {
        self.max_inline_data
    }

    fn modify(&mut self, transition: &Transition) -> Result<(), Errno> {
        self.log().modifies.push(*transition);
        match self.fail_modify {
            Some(errno) => Err(errno),
            None => Ok(()),
        }
    }

    fn post_send(&mut self, wr: &SendDescriptor) -> Result<(), Errno> {
        if let Some(errno) = self.fail_post {
            return Err(errno);
        }
        self.log().sends.push(*wr);
        Ok(())
    }

    fn post_recv(&mut self, wr: &ReceiveDescriptor) -> Result<(), Errno> {
        if let Some(errno) = self.fail_post {
            return Err(errno);
        }
        self.log().recvs.push(*wr);
        Ok(())
    }

    fn destroy(&mut self) -> Result<(), Errno> {
        if let Some(errno) = self.fail_destroy.take() {
            return Err(errno);
        }
        self.log().destroys += 1;
        Ok(())
    }
}

/// A RESET queue pair on port 1 with a fixed PSN.
pub(crate) fn test_qp(qp_num: u32) -> (QueuePair, Arc<Mutex<Recorded>>) {
    let (handle, log) = RecordingHandle::new(qp_num);
    let qp = QueuePair::with_handle(
        Box::new(handle),
        LocalPort::new(1),
        Psn::truncate(0x00ab_cdef),
        QpConfig::default(),
    );
    (qp, log)
}

/// A queue pair already driven to RTS against [`peer_params`].
pub(crate) fn connected_qp() -> (QueuePair, Arc<Mutex<Recorded>>) {
    let (mut qp, log) = test_qp(0x11);
    qp.connect(&peer_params()).unwrap();
    (qp, log)
}

pub(crate) fn peer_params() -> ConnectionParameters {
    let mut gid = [0u8; 16];
    gid[10] = 0xff;
    gid[11] = 0xff;
    gid[12..].copy_from_slice(&[10, 0, 0, 2]);
    ConnectionParameters {
        qp_num: 0x22,
        psn: Psn::truncate(0x12_3456),
        lid: 0,
        gid: Gid(gid),
    }
}
