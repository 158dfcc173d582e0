//! Error types for the task processor

use thiserror::Error;
use util::concurrency::{interrupt::Interrupted, pool::PoolError};

/// The error type emitted by a processor
///
/// Rejecting a task is not an error, `execute` reports it by returning
/// `false`
#[derive(Clone, Debug, Error)]
pub enum ProcessorError {
    /// The processor was configured with invalid parameters
    #[error("invalid processor configuration: {0}")]
    InvalidConfig(String),
    /// The calling thread was interrupted while waiting for the processor to
    /// drain
    #[error("interrupted while waiting for the processor to drain")]
    Interrupted,
    /// An error in the underlying worker pool
    #[error("worker pool error: {0}")]
    Pool(#[from] PoolError),
}

impl From<Interrupted> for ProcessorError {
    fn from(_: Interrupted) -> Self {
        ProcessorError::Interrupted
    }
}
