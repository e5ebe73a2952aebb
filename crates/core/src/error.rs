//! Error taxonomy shared by the session adapter and the tutor state machine.

use crate::tutor::Phase;
use thiserror::Error;

/// Failure reported by a generation backend.
///
/// Backends classify their own failures; the session adapter maps them onto
/// [`GenerationError`] and runs overflow recovery where needed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    /// The backend cannot serve requests on this device or configuration.
    #[error("language model unavailable: {0}")]
    Unavailable(String),
    /// Prompt plus history exceeded the model's context window.
    #[error("context window exceeded")]
    ContextWindowExceeded,
    /// The request itself failed (transport, timeout, service error).
    #[error("request failed: {0}")]
    Request(String),
    /// The service answered, but the output did not match the requested schema.
    #[error("malformed model output: {0}")]
    Decode(String),
}

/// Failure surfaced to callers of the session adapter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GenerationError {
    /// The device or platform cannot run the generation service at all.
    #[error("this device does not support on-device generation")]
    Unsupported,
    /// A single request failed; the caller may retry the same action.
    #[error("response generation failed: {0}")]
    GenerationFailed(String),
    /// The session was condensed after exceeding its context window.
    /// The session stays usable; the learner should resend.
    #[error("conversation was condensed after exceeding the context window")]
    ContextOverflow,
}

impl GenerationError {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::GenerationFailed(reason.into())
    }
}

/// Illegal operation for the current state of the tutor.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("operation not allowed in phase {actual:?} (expected {expected:?})")]
    WrongPhase { expected: Phase, actual: Phase },
    #[error("learner name must not be empty")]
    EmptyName,
    #[error("unknown topic '{0}'")]
    UnknownTopic(String),
    #[error("index {index} out of range (len {len})")]
    OutOfRange { index: usize, len: usize },
    #[error("at most {max} words can be selected")]
    SelectionFull { max: usize },
    #[error("select between 1 and {max} words first")]
    InvalidSelection { max: usize },
    #[error("unknown flashcard {0}")]
    UnknownFlashcard(uuid::Uuid),
    #[error("no exercise is waiting for an answer")]
    NoPendingExercise,
    #[error("message must not be empty")]
    EmptyMessage,
}

/// Any failure of a tutor operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TutorError {
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Generation(#[from] GenerationError),
}

impl TutorError {
    /// True when the failure was a recovered context overflow.
    pub fn is_context_overflow(&self) -> bool {
        matches!(self, Self::Generation(GenerationError::ContextOverflow))
    }
}
