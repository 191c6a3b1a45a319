use std::time::Duration;

use nix::errno::Errno;

use crate::v4l2::BufferState;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures detected while configuring a session. Always fatal and always
/// reported before any node starts streaming.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("{node}: format {requested} rejected, driver chose {actual}")]
    FormatRejected {
        node: String,
        requested: String,
        actual: String,
    },
    #[error("{node}: driver granted {actual} buffers, shared pool needs {expected}")]
    BufferCountMismatch {
        node: String,
        expected: u32,
        actual: u32,
    },
    #[error("no conversion from {from} to {to}")]
    UnsupportedConversion { from: String, to: String },
    #[error("no camera mode covers {width}x{height}@{fps}")]
    NoCameraMode { width: u32, height: u32, fps: u32 },
    #[error("tuning: {0}")]
    Tuning(String),
    #[error("{node}: device lacks {missing}")]
    Capability { node: String, missing: &'static str },
    #[error("{node}: negotiated {actual} is smaller than requested {requested}")]
    Undersized {
        node: String,
        requested: String,
        actual: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Setup(#[from] SetupError),
    #[error("capture timeout: no device ready within {0:?}")]
    CaptureTimeout(Duration),
    #[error("{node}: {op} failed: {source}")]
    Kernel {
        node: String,
        op: &'static str,
        #[source]
        source: Errno,
    },
    #[error("{node}: control {id:#010x} rejected: {source}")]
    HardwareControl {
        node: String,
        id: u32,
        #[source]
        source: Errno,
    },
    #[error("{node}: buffer {index} is {state:?}, hand-off out of order")]
    BufferState {
        node: String,
        index: u32,
        state: BufferState,
    },
    #[error("statistics block truncated: {actual} of {expected} bytes")]
    TruncatedStatistics { expected: usize, actual: usize },
    #[error("embedded data truncated or in an unknown layout")]
    TruncatedMetadata,
    #[error("frame holds {actual} bytes, format needs {expected}")]
    ShortFrame { expected: usize, actual: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    DmaHeap(#[from] dma_heap::Error),
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn kernel(node: &str, op: &'static str, source: Errno) -> Self {
        Self::Kernel {
            node: node.to_owned(),
            op,
            source,
        }
    }

    /// Whether the session can carry on after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::HardwareControl { .. })
    }
}
