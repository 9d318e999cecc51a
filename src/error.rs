//! Error Types
//!
//! Failures surfaced by the coordination engine. Usage errors point at a
//! programming mistake in the collaborator; `Faulted` and `Panicked` carry a
//! failure captured from a continuation step and are replayed to every
//! observer of the machine.

use std::error::Error as StdError;
use std::sync::Arc;

use thiserror::Error;

use crate::barrier::OperationKey;

/// Error type returned by continuation steps.
pub type StepError = Box<dyn StdError + Send + Sync>;

/// Errors reported by machines, barriers and operation handles.
#[derive(Debug, Clone, Error)]
pub enum MachineError {
    /// `start` was called while a previous run is still in progress.
    #[error("machine is already running")]
    AlreadyRunning,

    /// The machine has never been started.
    #[error("machine has not been started")]
    NotStarted,

    /// A result was requested before the machine completed.
    #[error("machine has not completed yet")]
    NotCompleted,

    /// Quorum outside `1..=total` for a non-empty barrier.
    #[error("invalid quorum {quorum} for a barrier of {total} operations")]
    InvalidQuorum { quorum: usize, total: usize },

    /// The barrier was already yielded or already resumed and cannot be reused.
    #[error("barrier has already resumed and cannot be reused")]
    BarrierExhausted,

    /// More operations were issued than the barrier covers.
    #[error("cannot issue operation '{key}': barrier covers only {total} operations")]
    TooManyOperations { key: OperationKey, total: usize },

    /// Keyed operations were requested from the single-operation barrier.
    #[error("the single-operation barrier does not hold keyed operations")]
    SingleOperationBarrier,

    /// A step asked for a second single operation.
    #[error("step {step} already issued its single operation")]
    SingleOperationIssued { step: usize },

    /// A step yielded the single-operation barrier without issuing the operation.
    #[error("step {step} yielded the single-operation barrier without issuing an operation")]
    NoSingleOperation { step: usize },

    /// A step yielded a barrier created by another step or machine.
    #[error("step {step} yielded a barrier created for another suspension point")]
    ForeignBarrier { step: usize },

    /// `end` was called on an operation that did not complete in time.
    #[error("operation '{key}' has not completed; cancel it instead")]
    OperationPending { key: OperationKey },

    /// The operation's finalizer was already supplied.
    #[error("operation '{key}' was already finalized")]
    AlreadyFinalized { key: OperationKey },

    /// The timeout timer could not be scheduled.
    #[error("failed to schedule barrier timeout: {0}")]
    TimerUnavailable(String),

    /// A continuation step returned an error.
    #[error("continuation step {step} failed")]
    Faulted {
        step: usize,
        #[source]
        source: Arc<dyn StdError + Send + Sync>,
    },

    /// A continuation step panicked.
    #[error("continuation step {step} panicked: {message}")]
    Panicked { step: usize, message: String },

    /// A typed machine finished without its continuation setting a result.
    #[error("continuation finished without producing a result")]
    MissingResult,

    /// A typed machine's result was already retrieved.
    #[error("result was already taken")]
    ResultTaken,
}

impl MachineError {
    /// Returns true for errors caused by misuse of the engine's API.
    pub fn is_usage_error(&self) -> bool {
        !matches!(
            self,
            Self::Faulted { .. } | Self::Panicked { .. } | Self::TimerUnavailable(_)
        )
    }

    /// Returns the original error returned by a failed step.
    pub fn step_error(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        match self {
            Self::Faulted { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }

    /// Returns the step number at which the machine faulted.
    pub fn failed_step(&self) -> Option<usize> {
        match self {
            Self::Faulted { step, .. } | Self::Panicked { step, .. } => Some(*step),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("disk on fire")]
    struct DiskOnFire;

    #[test]
    fn test_faulted_preserves_original_error() {
        let original: StepError = Box::new(DiskOnFire);
        let err = MachineError::Faulted {
            step: 3,
            source: Arc::from(original),
        };

        assert_eq!(err.failed_step(), Some(3));
        assert!(!err.is_usage_error());

        let inner = err.step_error().unwrap();
        assert!(inner.downcast_ref::<DiskOnFire>().is_some());

        let via_source = err.source().unwrap();
        assert_eq!(via_source.to_string(), "disk on fire");
    }

    #[test]
    fn test_clone_shares_source() {
        let err = MachineError::Faulted {
            step: 1,
            source: Arc::new(DiskOnFire),
        };
        let copy = err.clone();

        match (&err, &copy) {
            (MachineError::Faulted { source: a, .. }, MachineError::Faulted { source: b, .. }) => {
                assert!(Arc::ptr_eq(a, b));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_usage_error_classification() {
        assert!(MachineError::AlreadyRunning.is_usage_error());
        assert!(MachineError::BarrierExhausted.is_usage_error());
        assert!(MachineError::InvalidQuorum { quorum: 4, total: 3 }.is_usage_error());
        assert!(!MachineError::Panicked {
            step: 1,
            message: "boom".into()
        }
        .is_usage_error());
    }

    #[test]
    fn test_display_messages() {
        let err = MachineError::TooManyOperations {
            key: OperationKey::from("op-9"),
            total: 2,
        };
        assert_eq!(
            err.to_string(),
            "cannot issue operation 'op-9': barrier covers only 2 operations"
        );
        assert_eq!(
            MachineError::Panicked {
                step: 2,
                message: "index out of bounds".into()
            }
            .to_string(),
            "continuation step 2 panicked: index out of bounds"
        );
    }
}
