//! Error module for the spikeline library.
use std::error::Error;
use std::fmt;

/// Error types for the library.
#[derive(Debug, PartialEq, Clone)]
pub enum SpikelineError {
    /// Transient I/O failure, e.g., a flaky recording save. The only retryable class.
    TransientIO(String),
    /// Missing or malformed sorter data, e.g., a template with no matching unit.
    /// Never retried: proceeding would silently corrupt the consensus result.
    DataIntegrity {
        sorter: String,
        unit: usize,
        reason: String,
    },
    /// Invalid setup detected before any stage runs, e.g., a missing sorter executable.
    Configuration(String),
    /// Error for invalid parameters, e.g., a negative tolerance window.
    InvalidParameter(String),
}

impl SpikelineError {
    /// Whether the error is worth retrying. Everything but transient I/O is fatal
    /// on first occurrence.
    pub fn is_transient(&self) -> bool {
        matches!(self, SpikelineError::TransientIO(_))
    }
}

impl fmt::Display for SpikelineError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SpikelineError::TransientIO(e) => write!(f, "Transient I/O error: {}", e),
            SpikelineError::DataIntegrity {
                sorter,
                unit,
                reason,
            } => write!(
                f,
                "Data integrity error for unit {} of sorter {}: {}",
                unit, sorter, reason
            ),
            SpikelineError::Configuration(e) => write!(f, "Configuration error: {}", e),
            SpikelineError::InvalidParameter(e) => write!(f, "Invalid parameters: {}", e),
        }
    }
}

impl Error for SpikelineError {}

impl From<std::io::Error> for SpikelineError {
    fn from(e: std::io::Error) -> Self {
        SpikelineError::TransientIO(e.to_string())
    }
}
