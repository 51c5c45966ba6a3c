//! Progress reporting
//!
//! Long scans report what they are doing through an optional observer. Each
//! logical task (`key`) emits zero or more status updates and ends with
//! exactly one done or error event. Informational events are side notes
//! (e.g. "cache hint rejected") and never carry an error.

use std::fmt;
use std::sync::Arc;

/// A UI-facing status update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub key: String,
    pub message: String,
    pub done: bool,
    pub error: Option<String>,
    pub informational: bool,
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        self.done || self.error.is_some()
    }

    pub fn icon(&self) -> &'static str {
        match (self.done, &self.error, self.informational) {
            (_, Some(_), _) => "✗",
            (true, None, _) => "✓",
            (false, None, true) => "ℹ",
            (false, None, false) => "↻",
        }
    }
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] {}", self.icon(), self.key, self.message)?;
        if let Some(err) = &self.error {
            write!(f, ": {}", err)?;
        }
        Ok(())
    }
}

/// Receiver of progress events
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn emit(&self, event: ProgressEvent) {
        self(event)
    }
}

/// Cheap, cloneable handle to an optional sink; without one every call is a no-op
#[derive(Clone, Default)]
pub struct Progress {
    sink: Option<Arc<dyn ProgressSink>>,
}

impl Progress {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn new(sink: Arc<dyn ProgressSink>) -> Self {
        Self { sink: Some(sink) }
    }

    fn send(&self, key: &str, message: String, done: bool, error: Option<String>, informational: bool) {
        if let Some(sink) = &self.sink {
            sink.emit(ProgressEvent {
                key: key.to_string(),
                message,
                done,
                error,
                informational,
            });
        }
    }

    pub fn update(&self, key: &str, message: impl Into<String>) {
        self.send(key, message.into(), false, None, false);
    }

    pub fn info(&self, key: &str, message: impl Into<String>) {
        self.send(key, message.into(), false, None, true);
    }

    pub fn done(&self, key: &str, message: impl Into<String>) {
        self.send(key, message.into(), true, None, false);
    }

    pub fn fail(&self, key: &str, message: impl Into<String>, error: &dyn fmt::Display) {
        self.send(key, message.into(), true, Some(error.to_string()), false);
    }
}

impl fmt::Debug for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Progress")
            .field("attached", &self.sink.is_some())
            .finish()
    }
}
