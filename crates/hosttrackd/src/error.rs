//! Error types for the tracking engine.

use crate::entity::FieldSet;
use thiserror::Error;

/// Errors surfaced by the tracking engine.
///
/// Transient races are absorbed internally by the optimistic retry loops;
/// only caller-input problems and retry exhaustion propagate.
#[derive(Debug, Clone, Error)]
pub enum TrackerError {
    /// A lookup omitted a field the active classifier requires.
    #[error("not all key fields specified; required fields: {required}")]
    MissingKeyFields { required: FieldSet },

    /// A learn attempt kept losing conditional updates and was abandoned.
    #[error("learning abandoned after {attempts} contended attempts")]
    RetryExhausted { attempts: u32 },
}

/// Result type alias for tracker operations.
pub type Result<T> = std::result::Result<T, TrackerError>;
