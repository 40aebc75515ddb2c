//! Reliable-connected InfiniBand/RoCE queue pairs over raw ibverbs.
//!
//! A [`QueuePair`] walks the RC handshake (RESET → INIT → RTR → RTS) and posts
//! two-sided sends/receives and one-sided RDMA writes/reads against memory
//! registered in a [`ProtectionDomain`]. Completions are reaped from the
//! [`CompletionQueue`] the queue pair was created against.
//!
//! Connection parameters are exchanged out of band; [`ConnectionParameters`]
//! and [`RemoteBuffer`] have fixed little-endian encodings for that purpose.
//!
//! # Usage
//!
//! ```ignore
//! use rcqp::{QpConfig, QueuePair, RdmaContext, ReceiveWorkRequest, SendWorkRequest};
//!
//! let ctx = RdmaContext::open(None, 1, 0)?;
//! let pd = ctx.alloc_pd()?;
//! let cq = ctx.create_cq(256)?;
//! let mut qp = QueuePair::create(&ctx, &pd, &cq, QpConfig::from_env())?;
//!
//! let local = ctx.local_parameters(&qp);
//! let remote = exchange(local)?; // any out-of-band channel
//! qp.connect(&remote)?;
//!
//! let buf = pd.register(4096)?;
//! unsafe { qp.post_receive(&mut ReceiveWorkRequest::new(buf.region()))? };
//! let done = cq.wait_for(1, std::time::Duration::from_secs(5))?;
//! ```

pub mod config;
pub mod endpoint;
pub mod error;
pub mod psn;
pub mod qp;
pub mod rdma;
pub mod transition;
pub mod wr;

#[cfg(test)]
mod test_utils;

pub use config::{PathMtu, QpConfig};
pub use endpoint::{CONNECTION_PARAMETERS_SIZE, ConnectionParameters, Gid, LocalPort};
pub use error::{QpError, Result};
pub use psn::{FixedPsn, Psn, PsnSource, RandomPsn};
pub use qp::QueuePair;
pub use rdma::{
    Completion, CompletionQueue, MemoryRegion, POLL_BATCH, ProtectionDomain, RdmaContext,
    RegisteredBuffer, RemoteBuffer,
};
pub use transition::{QpState, Transition};
pub use wr::{ReceiveWorkRequest, RemoteTarget, SendWorkRequest, WrId};
