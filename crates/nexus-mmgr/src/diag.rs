//! Diagnostic sink.
//!
//! Consistency checks and statistics never return their findings as errors.
//! They report through a [`DiagnosticSink`] instead, because they also run
//! while a failing scope is being cleaned up.

use std::fmt;

use parking_lot::Mutex;

/// Severity of a diagnostic message, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// Developer detail.
    Debug,
    /// Informational output such as statistics.
    Log,
    /// Something is wrong but execution can continue.
    Notice,
    /// Something is likely to fail soon.
    Warning,
}

impl Severity {
    /// Returns the upper-case name used in log lines.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Log => "LOG",
            Self::Notice => "NOTICE",
            Self::Warning => "WARNING",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receiver of non-fatal diagnostic messages.
///
/// Implementations must not allocate from a memory context and must not
/// panic.
pub trait DiagnosticSink: Send + Sync {
    /// Records one message.
    fn emit(&self, severity: Severity, message: &str);
}

/// Sink that forwards every message to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn emit(&self, severity: Severity, message: &str) {
        match severity {
            Severity::Debug => tracing::debug!(target: "nexus_mmgr", "{}", message),
            Severity::Log => tracing::info!(target: "nexus_mmgr", "{}", message),
            Severity::Notice | Severity::Warning => {
                tracing::warn!(target: "nexus_mmgr", "{}: {}", severity, message);
            }
        }
    }
}

/// Sink that keeps every message in memory.
///
/// # Example
///
/// ```rust
/// use nexus_mmgr::{CollectingSink, DiagnosticSink, Severity};
///
/// let sink = CollectingSink::new();
/// sink.emit(Severity::Notice, "detected write past chunk end");
/// assert_eq!(sink.count(Severity::Notice), 1);
/// ```
#[derive(Debug, Default)]
pub struct CollectingSink {
    messages: Mutex<Vec<(Severity, String)>>,
}

impl CollectingSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every message recorded so far.
    #[must_use]
    pub fn messages(&self) -> Vec<(Severity, String)> {
        self.messages.lock().clone()
    }

    /// Returns the messages of one severity.
    #[must_use]
    pub fn messages_at(&self, severity: Severity) -> Vec<String> {
        self.messages
            .lock()
            .iter()
            .filter(|(s, _)| *s == severity)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Returns the number of messages of one severity.
    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.messages.lock().iter().filter(|(s, _)| *s == severity).count()
    }

    /// Returns true if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    /// Drops every recorded message.
    pub fn clear(&self) {
        self.messages.lock().clear();
    }
}

impl DiagnosticSink for CollectingSink {
    fn emit(&self, severity: Severity, message: &str) {
        self.messages.lock().push((severity, message.to_string()));
    }
}
