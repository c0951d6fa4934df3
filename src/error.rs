//! Error types for the camera sharing service
//!
//! Every fallible operation on the public surface returns
//! `Result<T, CameraError>`. The variants form a closed set mirroring the
//! result codes a client of the service can observe.

use thiserror::Error;

/// The canonical error type for camera operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CameraError {
    /// A request argument was malformed or out of range
    #[error("invalid argument")]
    InvalidArg,

    /// The buffer pool could not supply the requested buffers
    #[error("buffer not available")]
    BufferNotAvailable,

    /// The caller no longer owns the resource it tried to use
    /// (device lost, or a master-only operation from a non-master)
    #[error("ownership lost")]
    OwnershipLost,

    /// A stream start was requested while a stream is already running
    #[error("stream already running")]
    StreamAlreadyRunning,

    /// The underlying device or driver reported a failure
    #[error("underlying service error")]
    UnderlyingServiceError,

    /// An unexpected internal inconsistency
    #[error("internal error")]
    InternalError,

    /// A view-dependent operation was invoked before a view was configured
    #[error("view not set")]
    ViewNotSet,
}

impl CameraError {
    /// Whether the condition is tied to lost ownership of the device.
    ///
    /// Once an operation reports a persistent loss, subsequent operations on
    /// the affected client keep failing the same way until it is detached.
    pub fn is_ownership_lost(&self) -> bool {
        matches!(self, CameraError::OwnershipLost)
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, CameraError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(CameraError::InvalidArg.to_string(), "invalid argument");
        assert_eq!(
            CameraError::BufferNotAvailable.to_string(),
            "buffer not available"
        );
        assert_eq!(
            CameraError::StreamAlreadyRunning.to_string(),
            "stream already running"
        );
    }

    #[test]
    fn test_ownership_lost_classification() {
        assert!(CameraError::OwnershipLost.is_ownership_lost());
        assert!(!CameraError::UnderlyingServiceError.is_ownership_lost());
    }
}
