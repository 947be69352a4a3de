//! Compilation lifecycle events.

use std::fmt;

use tracing::{debug, warn};

use crate::jit::api::JitError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JitEvent {
    CompilationStarted { func_index: usize },
    CompilationSucceeded { func_index: usize },
    CompilationFailed { func_index: usize, error: JitError },
}

impl JitEvent {
    pub fn func_index(&self) -> usize {
        match self {
            JitEvent::CompilationStarted { func_index }
            | JitEvent::CompilationSucceeded { func_index }
            | JitEvent::CompilationFailed { func_index, .. } => *func_index,
        }
    }
}

impl fmt::Display for JitEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JitEvent::CompilationStarted { func_index } => {
                write!(f, "compiling function {}", func_index)
            }
            JitEvent::CompilationSucceeded { func_index } => {
                write!(f, "compiled function {}", func_index)
            }
            JitEvent::CompilationFailed { func_index, error } => {
                write!(f, "failed to compile function {}: {}", func_index, error)
            }
        }
    }
}

/// Receives lifecycle events. Called from compile threads.
pub trait JitEventSink: Send + Sync {
    fn emit(&self, event: &JitEvent);
}

impl<F> JitEventSink for F
where
    F: Fn(&JitEvent) + Send + Sync,
{
    fn emit(&self, event: &JitEvent) {
        self(event)
    }
}

/// Logs events through `tracing`. The default sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl JitEventSink for TracingEventSink {
    fn emit(&self, event: &JitEvent) {
        match event {
            JitEvent::CompilationFailed { func_index, error } => {
                warn!(target: "iris::jit", func_index, %error, "compilation failed");
            }
            other => debug!(target: "iris::jit", func_index = other.func_index(), "{}", other),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl JitEventSink for NoopEventSink {
    fn emit(&self, _event: &JitEvent) {}
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    #[test]
    fn test_closure_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        let sink = move |event: &JitEvent| recorder.lock().push(event.clone());

        sink.emit(&JitEvent::CompilationStarted { func_index: 2 });
        sink.emit(&JitEvent::CompilationFailed {
            func_index: 2,
            error: JitError::FunctionOutOfBounds(2),
        });

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|e| e.func_index() == 2));
    }

    #[test]
    fn test_display() {
        let event = JitEvent::CompilationFailed {
            func_index: 1,
            error: JitError::Panicked("boom".into()),
        };
        assert_eq!(
            event.to_string(),
            "failed to compile function 1: compiler panicked: boom"
        );
    }
}
