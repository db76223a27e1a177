//! Error types for Fornax

use thiserror::Error;

/// Result type alias using Fornax's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Fornax operations
#[derive(Error, Debug)]
pub enum Error {
    /// The waiting queue cannot accept more requests.
    #[error("waiting queue is full: {0}")]
    ExceedCapacity(String),

    /// A prompt is longer than the configured maximum.
    #[error("input length {len} exceeds max_token_len {max}")]
    ExceedLength { len: usize, max: usize },

    /// The device block pool cannot satisfy an allocation.
    #[error("out of device memory: {0}")]
    OutOfDeviceMemory(String),

    /// Host memory cannot back the requested block pool.
    #[error("insufficient host memory: {0}")]
    InsufficientHostMemory(String),

    /// A caller passed an unknown id, a bad shape, or an invalid config.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A code path that is recognized but not yet supported.
    #[error("unimplemented: {0}")]
    Unimplemented(&'static str),

    /// A device copy, kernel, or collective failed.
    #[error("device error: {0}")]
    Device(String),

    #[cfg(feature = "cuda")]
    #[error("CUDA error: {0}")]
    Cuda(#[from] cudarc::driver::DriverError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}
