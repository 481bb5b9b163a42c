// In: src/error.rs

//! This module defines the single, unified error type for the entire sliceflow engine.
//! It uses the `thiserror` crate to provide ergonomic, context-aware error handling.
//!
//! Every variant belongs to exactly one [`ErrorClass`]. All classes are fatal: the
//! engine never retries, because a silently retried chunk could desynchronize the
//! deterministic slice ordering shared by all workers.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// The coarse error taxonomy. Callers that only need to know *where* a run
/// failed match on this instead of on individual variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad or missing parameter, unimplemented required override, lifecycle misuse.
    /// Aborts the pipeline before any stage runs.
    Configuration,
    /// Invalid axis mapping, unknown pattern, pattern locked.
    Pattern,
    /// Inconsistent slice counts or worker counts across a stage's datasets.
    Partition,
    /// I/O failure reported by the backing store collaborator.
    BackingStore,
    /// A chunk or region whose shape does not match the dataset.
    Data,
    /// The worker fleet was aborted by a peer.
    Coordination,
}

#[derive(Error, Debug)]
pub enum PipelineError {
    // =========================================================================
    // === Configuration Errors
    // =========================================================================
    #[error("Parameter '{name}' is not a valid parameter for stage '{stage}'")]
    UnknownParameter { stage: String, name: String },

    #[error("Parameter '{name}' expects {expected}, but got '{value}'")]
    TypeMismatch {
        name: String,
        expected: String,
        value: String,
    },

    #[error("Parameter '{0}' has no bound value")]
    MissingParameter(String),

    #[error("Invalid tuning specification for parameter '{name}': {reason}")]
    InvalidTuning { name: String, reason: String },

    #[error("Stage '{stage}' does not implement required method '{method}'")]
    NotImplemented { stage: String, method: &'static str },

    #[error("Stage '{stage}' cannot move from {from} to {to}")]
    LifecycleViolation {
        stage: String,
        from: String,
        to: String,
    },

    #[error("Stage '{stage}' requires {required} input dataset(s), but {available} are available")]
    DatasetCountMismatch {
        stage: String,
        required: usize,
        available: usize,
    },

    #[error("Invalid run configuration: {0}")]
    InvalidConfig(String),

    // =========================================================================
    // === Pattern Errors
    // =========================================================================
    #[error("Invalid pattern '{name}': {reason}")]
    InvalidPattern { name: String, reason: String },

    #[error("Pattern '{0}' not found")]
    PatternNotFound(String),

    #[error("Pattern '{0}' is locked and cannot be redeclared")]
    PatternLocked(String),

    // =========================================================================
    // === Partition Errors
    // =========================================================================
    #[error("Partition error: {0}")]
    Partition(String),

    // =========================================================================
    // === Data Errors
    // =========================================================================
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// An ndarray shape operation failed (stacking, reshaping).
    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    // =========================================================================
    // === Backing Store Errors (Using #[from] for automatic conversion)
    // =========================================================================
    /// An error originating from the underlying I/O subsystem.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An error from the Serde JSON library, typically while reading a store header
    /// or a pipeline definition.
    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("Backing store error: {0}")]
    BackingStore(String),

    // =========================================================================
    // === Coordination Errors
    // =========================================================================
    #[error("Worker fleet aborted: {0}")]
    Aborted(String),

    #[error("Stage '{stage}' failed: {source}")]
    StageFailed {
        stage: String,
        #[source]
        source: Box<PipelineError>,
    },
}

impl PipelineError {
    /// Classifies this error into the engine's taxonomy. Wrapped stage failures
    /// report the class of their root cause.
    pub fn class(&self) -> ErrorClass {
        use PipelineError::*;
        match self {
            UnknownParameter { .. }
            | TypeMismatch { .. }
            | MissingParameter(_)
            | InvalidTuning { .. }
            | NotImplemented { .. }
            | LifecycleViolation { .. }
            | DatasetCountMismatch { .. }
            | InvalidConfig(_) => ErrorClass::Configuration,
            InvalidPattern { .. } | PatternNotFound(_) | PatternLocked(_) => ErrorClass::Pattern,
            Partition(_) => ErrorClass::Partition,
            ShapeMismatch { .. } | Shape(_) => ErrorClass::Data,
            Io(_) | SerdeJson(_) | BackingStore(_) => ErrorClass::BackingStore,
            Aborted(_) => ErrorClass::Coordination,
            StageFailed { source, .. } => source.class(),
        }
    }

    /// Wraps this error with the name of the stage it occurred in. Errors that are
    /// already attributed to a stage are returned unchanged.
    pub fn in_stage(self, stage: &str) -> Self {
        match self {
            err @ PipelineError::StageFailed { .. } => err,
            err => PipelineError::StageFailed {
                stage: stage.to_string(),
                source: Box::new(err),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_failure_reports_root_class() {
        let err = PipelineError::PatternNotFound("SINOGRAM".into()).in_stage("ring_removal");
        assert_eq!(err.class(), ErrorClass::Pattern);
        assert!(err.to_string().contains("ring_removal"));

        // Re-wrapping keeps the original attribution.
        let rewrapped = err.in_stage("other");
        assert!(matches!(
            rewrapped,
            PipelineError::StageFailed { ref stage, .. } if stage == "ring_removal"
        ));
    }

    #[test]
    fn test_io_errors_are_backing_store_class() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: PipelineError = io.into();
        assert_eq!(err.class(), ErrorClass::BackingStore);
    }
}
