//! Error types for the mesh core

use thiserror::Error;

/// Result type for mesh operations.
pub type Result<T> = std::result::Result<T, MeshError>;

/// Errors raised by store, protocol, worker and controller operations.
///
/// Every variant has a fixed wire rendering, see [`crate::Reply::from_error`].
#[derive(Debug, Error)]
pub enum MeshError {
    /// Request bytes were not a JSON envelope
    #[error("decode error: {0}")]
    Decode(String),

    /// `method` missing or not one we serve
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// `run` named a worker type nobody registered
    #[error("unknown worker type: {0}")]
    UnknownWorker(String),

    /// A worker is already bound to this URI
    #[error("worker already running at {0}")]
    WorkerRunning(String),

    /// Controller could not bind a requested port
    #[error("bind failed on port {port}: {reason}")]
    BindFailed { port: u16, reason: String },

    /// The root must stay a mapping
    #[error("root cannot hold a non-object value")]
    RootNotMapping,

    /// Repeating timers need a non-zero interval
    #[error("timer interval must be non-zero")]
    InvalidInterval,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
