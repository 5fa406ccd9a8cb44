//! Typed errors raised by the simulators.
//!
//! All fatal conditions carry the id of the offending model; the schedule
//! is left consistent so the host may inspect state before tearing down.

use crate::graph::ModelId;

/// Result alias used across the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type returned by model transition and output functions.
///
/// Models that cannot fail simply return `Ok(())`; the hybrid wrapper uses
/// this channel to surface continuous-subsystem failures such as integrator
/// divergence.
pub type TransitionError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result alias for model transition and output functions.
pub type TransitionResult = std::result::Result<(), TransitionError>;

/// A fatal simulation error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A model's time advance was negative.
    #[error("model {model} returned a negative time advance")]
    NegativeTimeAdvance {
        /// The offending model.
        model: ModelId,
    },

    /// A model routed an event to itself during optimistic execution.
    #[error("model {model} routed an event to itself")]
    SelfInfluence {
        /// The offending model.
        model: ModelId,
    },

    /// A Mealy model received input after its output was finalized in the
    /// current output phase, i.e. the routing graph contains a feedback
    /// loop of Mealy models.
    #[error("feedback loop of Mealy models detected at model {model}")]
    MealyFeedbackLoop {
        /// The Mealy model that was re-targeted after finalization.
        model: ModelId,
    },

    /// A structural operation was issued in a context that cannot honor it.
    #[error("structural misuse: {reason}")]
    StructuralMisuse {
        /// Human-readable description of the misuse.
        reason: String,
    },

    /// The optimistic simulator was given a model whose `save_state`
    /// returns `None`.
    #[error("model {model} does not support state saving")]
    StateSavingUnsupported {
        /// The model lacking checkpoint support.
        model: ModelId,
    },

    /// A model's transition or output function failed. The underlying
    /// cause is typically a continuous-subsystem failure.
    #[error("model {model} failed during a transition")]
    Model {
        /// The model whose transition failed.
        model: ModelId,
        /// The underlying failure.
        #[source]
        source: TransitionError,
    },

    /// The optimistic simulator's worker pool could not be created.
    #[error("failed to build the worker pool: {reason}")]
    WorkerPool {
        /// The pool builder's error message.
        reason: String,
    },
}
