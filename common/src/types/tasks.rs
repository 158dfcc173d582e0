//! Defines the unit of work accepted by a processor

use std::{fmt, time::Duration};

use thiserror::Error;

use super::log_context::LogContext;

/// A boxed task, the form in which tasks are queued
pub type BoxedTask = Box<dyn ProcessorTask>;

/// The error a task may report when it finishes
///
/// Errors are logged by the processor and never reach the submitter
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    /// The task observed an interrupt and stopped early
    ///
    /// A selector thread that runs an interrupted task is retired and
    /// replaced
    #[error("task interrupted")]
    Interrupted,
    /// The task failed
    #[error("task failed: {0}")]
    Failed(String),
}

impl TaskError {
    /// Create a failure from any displayable error
    #[allow(clippy::needless_pass_by_value)]
    pub fn failed<T: ToString>(err: T) -> Self {
        Self::Failed(err.to_string())
    }
}

/// A unit of work executed exactly once by a processor
pub trait ProcessorTask: Send + 'static {
    /// Run the task
    fn run(self: Box<Self>) -> Result<(), TaskError>;

    /// The time the task may run before the watchdog interrupts it
    ///
    /// `None` or a zero duration disables the watchdog for this task
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// The logging context to activate while the task runs
    fn log_context(&self) -> Option<&LogContext> {
        None
    }
}

impl fmt::Debug for dyn ProcessorTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorTask")
            .field("timeout", &self.timeout())
            .field("log_context", &self.log_context())
            .finish()
    }
}

// ------------
// | Fn Tasks |
// ------------

/// A task built from a closure
pub struct FnTask<F> {
    /// The closure to run
    f: F,
    /// The watchdog timeout of the task
    timeout: Option<Duration>,
    /// The logging context of the task
    log_context: Option<LogContext>,
}

impl<F> FnTask<F>
where
    F: FnOnce() -> Result<(), TaskError> + Send + 'static,
{
    /// Create a task from a closure
    pub fn new(f: F) -> Self {
        Self { f, timeout: None, log_context: None }
    }

    /// Set the watchdog timeout of the task
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attach a logging context to the task
    pub fn with_log_context(mut self, ctx: LogContext) -> Self {
        self.log_context = Some(ctx);
        self
    }

    /// Attach the submitting thread's current logging context to the task
    pub fn with_current_log_context(self) -> Self {
        let ctx = LogContext::current();
        if ctx.is_empty() { self } else { self.with_log_context(ctx) }
    }

    /// Box the task for submission
    pub fn boxed(self) -> BoxedTask {
        Box::new(self)
    }
}

impl<F> ProcessorTask for FnTask<F>
where
    F: FnOnce() -> Result<(), TaskError> + Send + 'static,
{
    fn run(self: Box<Self>) -> Result<(), TaskError> {
        (self.f)()
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn log_context(&self) -> Option<&LogContext> {
        self.log_context.as_ref()
    }
}

/// Box a closure that cannot fail as a task
pub fn task_fn<F>(f: F) -> BoxedTask
where
    F: FnOnce() + Send + 'static,
{
    FnTask::new(move || {
        f();
        Ok(())
    })
    .boxed()
}
