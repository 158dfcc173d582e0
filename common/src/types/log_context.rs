//! A key-value logging context that follows a task from its submitter onto
//! the thread that executes it
//!
//! The context of the current thread is kept in a thread local. Submitters
//! snapshot it with [`LogContext::current`] and the executing thread applies
//! the snapshot with [`LogContext::enter`] for the duration of the task.

use std::{
    cell::RefCell,
    collections::BTreeMap,
    fmt::{self, Display},
};

use serde::{Deserialize, Serialize};
use tracing::{info_span, span::EnteredSpan};

thread_local! {
    /// The logging context active on the current thread
    static CURRENT_CONTEXT: RefCell<LogContext> = RefCell::new(LogContext::default());
}

/// An ordered set of string key-value pairs attached to log output
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogContext {
    /// The key-value pairs of the context
    entries: BTreeMap<String, String>,
}

impl LogContext {
    /// Constructor
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the context active on the calling thread
    pub fn current() -> Self {
        CURRENT_CONTEXT.with(|ctx| ctx.borrow().clone())
    }

    /// Add an entry to the context, builder style
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Add an entry to the context, replacing any previous value for the key
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Get the value for a key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Whether the context has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The number of entries in the context
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Iterate over the entries in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Make this the active context of the calling thread until the returned
    /// guard is dropped
    ///
    /// While the guard is alive log events are emitted inside a span that
    /// carries the context. Dropping the guard clears the thread's context,
    /// this also happens when the guard is dropped during a panic unwind
    pub fn enter(self) -> LogContextGuard {
        let span = info_span!("task_context", context = %self).entered();
        CURRENT_CONTEXT.with(|ctx| *ctx.borrow_mut() = self);

        LogContextGuard { _span: span }
    }
}

impl Display for LogContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, value) in self.entries.iter() {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "{key}={value}")?;
            first = false;
        }

        Ok(())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for LogContext {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let entries = iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        Self { entries }
    }
}

/// Clears the thread's logging context when dropped
#[must_use = "the context is cleared when the guard is dropped"]
pub struct LogContextGuard {
    /// The span carrying the context, exited on drop
    _span: EnteredSpan,
}

impl Drop for LogContextGuard {
    fn drop(&mut self) {
        CURRENT_CONTEXT.with(|ctx| *ctx.borrow_mut() = LogContext::default());
    }
}

#[cfg(test)]
mod test {
    use std::panic;

    use super::LogContext;

    /// Tests that entering a context makes it current and dropping the guard
    /// clears it
    #[test]
    fn test_enter_and_clear() {
        assert!(LogContext::current().is_empty());

        let ctx = LogContext::new().with("user", "42").with("session", "abc");
        let guard = ctx.clone().enter();
        assert_eq!(LogContext::current(), ctx);
        assert_eq!(LogContext::current().get("user"), Some("42"));

        drop(guard);
        assert!(LogContext::current().is_empty());
    }

    /// Tests that a panic inside an entered context still clears it
    #[test]
    fn test_cleared_on_panic() {
        let res = panic::catch_unwind(|| {
            let _guard = LogContext::new().with("request", "1").enter();
            panic!("task failure");
        });

        assert!(res.is_err());
        assert!(LogContext::current().is_empty());
    }

    /// Tests the display format and serialization of a context
    #[test]
    fn test_display_and_serde() {
        let ctx: LogContext = [("b", "2"), ("a", "1")].into_iter().collect();
        assert_eq!(ctx.to_string(), "a=1 b=2");

        let json = serde_json::to_string(&ctx).unwrap();
        let parsed: LogContext = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ctx);
    }
}
