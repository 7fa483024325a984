use thiserror::Error;

/// Failure categories produced by the scanning core.
///
/// Only [`ScanError::InvalidRequest`] and [`ScanError::Resolution`] ever stop a
/// session. Socket and inspector failures are folded into the event stream as
/// data (an `Invalid` port result or an `os_info` string).
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("invalid scan request: {0}")]
    InvalidRequest(String),

    #[error("could not resolve target {target}: {reason}")]
    Resolution { target: String, reason: String },

    #[error("{0}")]
    ProbeSocket(#[from] std::io::Error),

    #[error("inspector failed: {0}")]
    Inspector(String),
}

pub type Result<T, E = ScanError> = std::result::Result<T, E>;
