mod context;
mod cq;
mod handle;
mod mr;

pub use context::{ProtectionDomain, RdmaContext};
pub use cq::{Completion, CompletionQueue, POLL_BATCH};
pub use handle::{Errno, IbvQp, QpCapabilities, QpHandle};
pub use mr::{MemoryRegion, REMOTE_BUFFER_SIZE, RegisteredBuffer, RemoteBuffer};
