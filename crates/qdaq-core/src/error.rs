//! Error types for the acquisition engine.
//!
//! One crate-level enum, [`QdaqError`], covers every failure the engine can
//! surface. Each variant is a distinct tag so callers can branch on the
//! failure class instead of scraping message strings. Codec-level failures
//! keep their own type ([`crate::codec::CodecError`]) and fold into
//! [`QdaqError::InvalidResponse`] at the controller boundary.

use thiserror::Error;

use crate::codec::CodecError;
use crate::model::ControllerState;

/// Convenience alias for results using the engine error type.
pub type Result<T> = std::result::Result<T, QdaqError>;

/// Primary error type for the acquisition engine.
#[derive(Error, Debug)]
pub enum QdaqError {
    /// Opening the serial port failed.
    #[error("serial port unavailable: {0}")]
    PortUnavailable(String),

    /// Link-level read/write failure mid-session.
    #[error("serial I/O error: {0}")]
    SerialIo(std::io::Error),

    /// An expected menu prompt did not arrive in time.
    ///
    /// Every state-changing menu dialog uses the reappearance of the prompt
    /// as its sole success signal; this is the failure side of that signal.
    #[error("timed out waiting for menu prompt during {0}")]
    MenuTimeout(&'static str),

    /// Argument rejected before any bytes were sent to the device.
    #[error("invalid configuration value: {0}")]
    InvalidConfigValue(String),

    /// The device sent a line that should have matched an expected shape
    /// but did not (includes TAG mismatch in polled mode).
    #[error("invalid device response: {0}")]
    InvalidResponse(#[from] CodecError),

    /// A verb was called from a state that does not permit it.
    #[error("cannot {attempted} while in state {current}")]
    InvalidState {
        current: ControllerState,
        attempted: &'static str,
    },

    /// The link closed or reached EOF mid-session.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Recorder filesystem error.
    #[error("storage I/O error: {0}")]
    StorageIo(std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecError;

    #[test]
    fn invalid_state_display_names_both_states() {
        let err = QdaqError::InvalidState {
            current: ControllerState::Disconnected,
            attempted: "start",
        };
        assert_eq!(err.to_string(), "cannot start while in state disconnected");
    }

    #[test]
    fn codec_error_converts_to_invalid_response() {
        let err: QdaqError = CodecError::TagMismatch {
            expected: 'A',
            got: 'B',
        }
        .into();
        assert!(matches!(err, QdaqError::InvalidResponse(_)));
        assert!(err.to_string().contains("expected 'A'"));
    }
}
