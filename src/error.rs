//! Error types for the scan data point pipeline.
//!
//! This module defines the primary error type, `PipelineError`, for the whole
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to report the distinct failure classes of the pipeline,
//! from instrument readout faults to shutdown timeouts.
//!
//! ## Error Hierarchy
//!
//! `PipelineError` is an enum consolidating the pipeline's failure sources:
//!
//! - **`SlotResolution`**: A deferred hardware readout failed while a resolver
//!   worker was resolving a point. Tagged with the sequence number and label
//!   of the owning point; the original driver error is kept as the source so
//!   callers can walk or downcast the cause chain.
//! - **`Persist`**: The sink rejected a point during persistence. Persist
//!   errors are non-retryable and fatal for the collection, so they carry the
//!   same sequence/label tagging as resolution faults.
//! - **`DrainTimeout`**: A graceful shutdown did not drain all in-flight
//!   points within the caller's deadline.
//! - **`Closed`**: A point was submitted after shutdown began. Returned
//!   immediately rather than blocking a producer forever.
//! - **`Finalize`**: The sink failed while closing out the collection.
//! - **`Configuration`**: Semantic errors in pipeline settings, such as a
//!   zero capacity, caught during validation.
//!
//! Faults raised inside the pipeline (`SlotResolution`, `Persist`) are held
//! in a fault cell and surfaced on the producer's next call; see the
//! `pipeline` module for the surfacing contract.

use std::time::Duration;

use thiserror::Error;

/// Convenience alias for results using the pipeline error type.
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Boxed error preserving the original cause chain of a fault.
pub type FaultSource = Box<dyn std::error::Error + Send + Sync>;

/// The consolidated error type for pipeline operations.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A deferred readout failed while a point was being resolved.
    ///
    /// The point identified by `seq`/`label` is lost; points with earlier
    /// sequence numbers still reach the sink, later ones are withheld.
    #[error("failed to resolve point {seq} ('{label}'): {source}")]
    SlotResolution {
        /// Sequence number of the point that failed to resolve.
        seq: u64,
        /// Human-readable label of the failed point.
        label: String,
        /// The underlying driver error.
        source: FaultSource,
    },

    /// The sink failed to persist a fully-resolved point.
    #[error("failed to persist point {seq} ('{label}'): {source}")]
    Persist {
        /// Sequence number of the point the sink rejected.
        seq: u64,
        /// Human-readable label of the rejected point.
        label: String,
        /// The underlying sink error.
        source: FaultSource,
    },

    /// Graceful shutdown timed out with points still in flight.
    #[error("pipeline did not drain within {timeout:?} ({outstanding} point(s) still in flight)")]
    DrainTimeout {
        /// The drain deadline that elapsed.
        timeout: Duration,
        /// Number of admitted points that had not been broadcast.
        outstanding: usize,
    },

    /// A point was submitted after shutdown was initiated.
    #[error("pipeline is shut down and no longer accepts points")]
    Closed,

    /// The sink failed while completing the collection at shutdown.
    #[error("failed to complete the collection: {0}")]
    Finalize(#[source] FaultSource),

    /// Pipeline settings failed validation.
    #[error("configuration validation error: {0}")]
    Configuration(String),
}

impl PipelineError {
    /// Sequence number of the offending point, for fault variants.
    #[must_use]
    pub fn seq(&self) -> Option<u64> {
        match self {
            PipelineError::SlotResolution { seq, .. } | PipelineError::Persist { seq, .. } => {
                Some(*seq)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("detector head unreachable")]
    struct DriverError;

    #[test]
    fn resolution_error_reports_sequence_and_label() {
        let err = PipelineError::SlotResolution {
            seq: 7,
            label: "point 7".into(),
            source: Box::new(DriverError),
        };
        let msg = err.to_string();
        assert!(msg.contains("point 7"), "message was: {msg}");
        assert!(msg.contains("detector head unreachable"), "message was: {msg}");
        assert_eq!(err.seq(), Some(7));
    }

    #[test]
    fn resolution_error_preserves_cause_chain() {
        let err = PipelineError::SlotResolution {
            seq: 0,
            label: "point 0".into(),
            source: Box::new(DriverError),
        };
        let source = std::error::Error::source(&err).expect("source should be present");
        assert!(source.downcast_ref::<DriverError>().is_some());
    }

    #[test]
    fn drain_timeout_reports_outstanding_points() {
        let err = PipelineError::DrainTimeout {
            timeout: Duration::from_secs(5),
            outstanding: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("3 point(s)"), "message was: {msg}");
    }

    #[test]
    fn closed_error_has_no_sequence() {
        assert_eq!(PipelineError::Closed.seq(), None);
    }
}
