//! Error taxonomy for device, stream and conversion operations.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::traits::ParameterKind;

/// Error type for camera operations.
///
/// Backends map their native failures into these variants at the seam, so
/// no driver error type escapes into callers.
#[derive(Debug, Error)]
pub enum CameraError {
    /// `Library::initialize` was called while another guard is alive.
    #[error("library is already initialized")]
    LibraryAlreadyInitialized,

    /// A producer path could not be registered.
    #[error("producer library {}: {reason}", path.display())]
    ProducerLibrary {
        /// Path that was rejected.
        path: PathBuf,
        /// Why it was rejected.
        reason: String,
    },

    /// No device, or the device cannot be opened (busy, unplugged, no rights).
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The requested data stream is missing or already open.
    #[error("stream unavailable: {0}")]
    StreamUnavailable(String),

    /// The device has no node with this name.
    #[error("parameter '{0}' not found")]
    ParameterNotFound(String),

    /// The node exists but holds a different kind of value.
    #[error("parameter '{name}' is {actual}, not {expected}")]
    ParameterType {
        /// Node name.
        name: String,
        /// Kind the caller asked for.
        expected: ParameterKind,
        /// Kind the device reports.
        actual: ParameterKind,
    },

    /// The value violates the node's range, increment or entry set.
    #[error("parameter '{name}' rejects {value}: {reason}")]
    ParameterRange {
        /// Node name.
        name: String,
        /// Offending value, formatted.
        value: String,
        /// Constraint that was violated.
        reason: String,
    },

    /// The node is not readable/writable with the current access rights.
    #[error("parameter '{name}' is not accessible: {reason}")]
    ParameterAccess {
        /// Node name.
        name: String,
        /// Access restriction.
        reason: String,
    },

    /// A command was executed but never reported completion.
    #[error("command '{name}' did not complete within {timeout:?}")]
    CommandTimeout {
        /// Command node name.
        name: String,
        /// Bound that elapsed.
        timeout: Duration,
    },

    /// Buffer memory could not be reserved, or the requested geometry is invalid.
    #[error("buffer allocation failed: {0}")]
    Allocation(String),

    /// Operation not permitted in the current buffer or stream state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Acquisition was started with fewer buffers than the stream requires.
    #[error("{announced} buffers announced but the stream requires {required}")]
    InsufficientBuffers {
        /// Buffers currently announced.
        announced: usize,
        /// Minimum demanded by the stream.
        required: usize,
    },

    /// The hardware refused to start acquiring.
    #[error("acquisition start rejected: {0}")]
    AcquisitionStart(String),

    /// No buffer was filled before the wait timeout elapsed.
    #[error("no buffer finished within {0:?}")]
    Timeout(Duration),

    /// The transport refused an explicit stop (self-terminating acquisition).
    #[error("acquisition stop rejected: {0}")]
    StopAcquisition(String),

    /// Raw payload could not be converted to the target layout.
    #[error("conversion failed: {0}")]
    Conversion(String),

    /// Failure while streaming that is not one of the cases above.
    #[error("stream error: {0}")]
    Stream(String),

    /// The downstream consumer rejected a frame.
    #[error("sink error: {0}")]
    Sink(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CameraError {
    /// Whether the acquisition loop may continue after this error.
    ///
    /// Per-frame conditions are recoverable; setup and hardware failures end
    /// the session.
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::StopAcquisition(_) | Self::Conversion(_) | Self::Sink(_)
        )
    }
}

/// Result type for camera operations.
pub type Result<T> = std::result::Result<T, CameraError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_frame_errors_are_recoverable() {
        assert!(CameraError::Timeout(Duration::from_millis(5)).is_recoverable());
        assert!(CameraError::Conversion("short payload".to_owned()).is_recoverable());
        assert!(CameraError::StopAcquisition("finite".to_owned()).is_recoverable());
    }

    #[test]
    fn test_session_errors_are_fatal() {
        assert!(!CameraError::DeviceUnavailable("busy".to_owned()).is_recoverable());
        assert!(!CameraError::Allocation("oom".to_owned()).is_recoverable());
        assert!(!CameraError::InsufficientBuffers {
            announced: 1,
            required: 4
        }
        .is_recoverable());
    }

    #[test]
    fn test_parameter_error_names_the_parameter() {
        let err = CameraError::ParameterType {
            name: "Width".to_owned(),
            expected: ParameterKind::Float,
            actual: ParameterKind::Integer,
        };
        assert_eq!(err.to_string(), "parameter 'Width' is integer, not float");
    }
}
