//! Run configuration.

use tokio::sync::Semaphore;
pub use tokio_util::sync::CancellationToken;

use crate::error::ConfigError;

/// Concurrency cap used when neither the caller nor the environment sets one.
pub const DEFAULT_MAX_PARALLELISM: usize = 100;

/// Environment variable overriding [`DEFAULT_MAX_PARALLELISM`].
pub const MAX_PARALLELISM_ENV: &str = "SAFE_PARALLEL_MAX_PARALLELISM";

/// Settings for a single bounded run.
///
/// The cancellation token stops new dispatch; work that has already been
/// dispatched keeps running until it finishes on its own.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub max_parallelism: usize,
    pub cancel_token: CancellationToken,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_parallelism: std::env::var(MAX_PARALLELISM_ENV)
                .ok()
                .and_then(|s| s.trim().parse::<usize>().ok())
                .unwrap_or(DEFAULT_MAX_PARALLELISM),
            cancel_token: CancellationToken::new(),
        }
    }
}

impl RunConfig {
    pub fn new(max_parallelism: usize) -> Self {
        Self {
            max_parallelism,
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn with_max_parallelism(mut self, max_parallelism: usize) -> Self {
        self.max_parallelism = max_parallelism;
        self
    }

    pub fn with_cancel_token(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = cancel_token;
        self
    }

    /// Check the limit and return it.
    pub fn validate(&self) -> Result<usize, ConfigError> {
        match self.max_parallelism {
            0 => Err(ConfigError::ZeroParallelism),
            n if n > Semaphore::MAX_PERMITS => {
                Err(ConfigError::ParallelismTooLarge { requested: n })
            }
            n => Ok(n),
        }
    }
}
