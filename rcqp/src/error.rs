use crate::transition::QpState;

pub type Result<T> = std::result::Result<T, QpError>;

#[derive(Debug, thiserror::Error)]
pub enum QpError {
    #[error("failed to create {resource}: {source}")]
    ResourceCreation {
        resource: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("ibv_modify_qp {from} -> {to} failed (errno={errno})")]
    StateTransition {
        from: QpState,
        to: QpState,
        errno: i32,
    },

    #[error("cannot move queue pair to {attempted}: it is {current}, expected {required}")]
    InvalidTransition {
        current: QpState,
        attempted: QpState,
        required: QpState,
    },

    #[error("queue pair already closed")]
    Closed,

    #[error("{op} failed (errno={errno})")]
    PostFailed { op: &'static str, errno: i32 },

    #[error("{op} is not allowed while the queue pair is {state}")]
    NotReady { op: &'static str, state: QpState },

    #[error("{op} requires a memory region")]
    MissingMemoryRegion { op: &'static str },

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("failed to destroy {resource} (errno={errno})")]
    Teardown { resource: &'static str, errno: i32 },

    #[error("device error: {message}")]
    Device {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("work completion failed (status={status}, vendor_err={vendor_err}, wr_id={wr_id})")]
    CompletionFailed {
        status: u32,
        vendor_err: u32,
        wr_id: u64,
    },

    #[error("timed out after {timeout_ms}ms waiting for {expected} completions ({received} received)")]
    Timeout {
        timeout_ms: u64,
        expected: usize,
        received: usize,
    },
}

impl QpError {
    /// Create a `Device` error with just a message.
    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Device` error from the calling thread's last OS error.
    pub fn device_os(msg: impl Into<String>) -> Self {
        Self::Device {
            message: msg.into(),
            source: Some(std::io::Error::last_os_error()),
        }
    }

    /// Create an `InvalidParameters` error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidParameters(msg.into())
    }

    /// Build a `ResourceCreation` error from the calling thread's last OS error.
    pub(crate) fn creation(resource: &'static str) -> Self {
        let source = std::io::Error::last_os_error();
        tracing::debug!("{resource} creation failed: {source}");
        Self::ResourceCreation { resource, source }
    }

    /// The driver error code carried by this error, if any.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::ResourceCreation { source, .. } => source.raw_os_error(),
            Self::StateTransition { errno, .. }
            | Self::PostFailed { errno, .. }
            | Self::Teardown { errno, .. } => Some(*errno),
            _ => None,
        }
    }
}
