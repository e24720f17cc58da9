//! Error taxonomy for the action execution engine.
//!
//! Every subsystem in this crate surfaces errors through one of the typed
//! types below rather than opaque strings, so callers can match on the
//! lifecycle phase a failure occurred in instead of parsing messages.

use std::time::Duration;

/// The lifecycle phase a cancellation was observed in.
///
/// Carried on [`CancellationError`] so callers can distinguish "never ran"
/// from "ran and got aborted" from "was waiting out a retry delay".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CancelState {
    /// Cancelled while still sitting in the scheduler's priority queue.
    Queued,
    /// Cancelled while the handler attempt was in flight.
    Running,
    /// Cancelled while sleeping out a retry delay between attempts.
    RetryDelay,
}

impl std::fmt::Display for CancelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelState::Queued => write!(f, "queued"),
            CancelState::Running => write!(f, "running"),
            CancelState::RetryDelay => write!(f, "retry-delay"),
        }
    }
}

/// Raised when a handler attempt is aborted by its per-attempt timeout.
#[derive(Debug, Clone, thiserror::Error)]
#[error("operation timed out after {duration:?}")]
pub struct TimeoutError {
    pub duration: Duration,
}

/// Raised when an invocation is cancelled, at any lifecycle phase.
#[derive(Debug, Clone, thiserror::Error)]
#[error("operation cancelled{}", .reason.as_ref().map(|r| format!(": {r}")).unwrap_or_default())]
pub struct CancellationError {
    pub reason: Option<String>,
    pub state: CancelState,
}

impl CancellationError {
    pub fn new(reason: Option<String>, state: CancelState) -> Self {
        Self { reason, state }
    }
}

/// Synchronous validation failure raised at option-setting or `invoke` time.
///
/// Validation errors never enter the pipeline: they are returned directly
/// from the builder method or `invoke` call that triggered them.
#[derive(Debug, Clone, thiserror::Error)]
#[error("validation error: {message}")]
pub struct ValidationError {
    pub message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Scheduler-level failures that don't fit the per-invocation taxonomy.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SchedulerError {
    /// `schedule` was called after `shutdown`.
    #[error("scheduler is shutting down")]
    ShuttingDown,
}

/// The terminal error a single invocation attempt can produce, generic over
/// the user handler's own error type `E`.
///
/// This is what a `Handle`'s result future actually resolves to on failure.
/// It keeps the handler's native error type intact (per spec: "any other
/// error returned by the handler, passed through verbatim") while giving
/// cancellation and timeout their own first-class variants so callers can
/// `match` without downcasting.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PipelineError<E> {
    #[error(transparent)]
    Handler(E),
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    #[error(transparent)]
    Cancelled(#[from] CancellationError),
}

impl<E> PipelineError<E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, PipelineError::Timeout(_))
    }

    pub fn as_cancellation(&self) -> Option<&CancellationError> {
        match self {
            PipelineError::Cancelled(c) => Some(c),
            _ => None,
        }
    }
}

/// Type-erased form of a pipeline failure, used internally wherever a
/// heterogeneous error type would otherwise need to cross an API boundary
/// (wide-event serialization, the error sink, the context-warning sink).
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    #[error(transparent)]
    Cancelled(#[from] CancellationError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("handler error: {0}")]
    Handler(Box<dyn std::error::Error + Send + Sync>),
}

impl<E> From<PipelineError<E>> for ActionError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: PipelineError<E>) -> Self {
        match err {
            PipelineError::Handler(e) => ActionError::Handler(Box::new(e)),
            PipelineError::Timeout(e) => ActionError::Timeout(e),
            PipelineError::Cancelled(e) => ActionError::Cancelled(e),
        }
    }
}
