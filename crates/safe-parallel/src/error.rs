//! Error types for bounded runs.

use tokio::sync::Semaphore;

/// Invalid run configuration. Detected before any input is pulled.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("max_parallelism must be at least 1")]
    ZeroParallelism,

    #[error("max_parallelism {requested} exceeds the supported maximum of {max}", max = Semaphore::MAX_PERMITS)]
    ParallelismTooLarge { requested: usize },
}

/// Failure to obtain an admission permit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum GateError {
    #[error("Permit acquisition was cancelled")]
    Cancelled,

    #[error("Admission gate is closed")]
    Closed,
}

/// Failure of a fire-and-forget run.
///
/// `E` is the action's own error type; the first one observed in dispatch
/// order ends the run.
#[derive(Debug, thiserror::Error)]
pub enum RunError<E> {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Action failed: {0}")]
    Action(E),

    #[error("Action panicked: {0}")]
    Panicked(String),

    #[error("Run was cancelled")]
    Cancelled,
}

impl<E> RunError<E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// The action's error, if that is what ended the run.
    pub fn into_action_error(self) -> Option<E> {
        match self {
            Self::Action(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> From<GateError> for RunError<E> {
    fn from(err: GateError) -> Self {
        match err {
            // Gates are owned by the run and never closed while it drives them.
            GateError::Cancelled | GateError::Closed => Self::Cancelled,
        }
    }
}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
