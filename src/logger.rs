//! Logging capability injected into connections and pools.

use std::sync::Arc;

/// A four-level logging sink.
pub trait Logger: Send + Sync {
    fn error(&self, msg: &str);
    fn warning(&self, msg: &str);
    fn info(&self, msg: &str);
    fn debug(&self, msg: &str);
}

/// Forwards to the `tracing` crate under the `pgdirect` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn error(&self, msg: &str) {
        tracing::error!(target: "pgdirect", "{}", msg);
    }

    fn warning(&self, msg: &str) {
        tracing::warn!(target: "pgdirect", "{}", msg);
    }

    fn info(&self, msg: &str) {
        tracing::info!(target: "pgdirect", "{}", msg);
    }

    fn debug(&self, msg: &str) {
        tracing::debug!(target: "pgdirect", "{}", msg);
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullLogger;

impl Logger for NullLogger {
    fn error(&self, _msg: &str) {}
    fn warning(&self, _msg: &str) {}
    fn info(&self, _msg: &str) {}
    fn debug(&self, _msg: &str) {}
}

/// The logger used when none is supplied.
pub fn default_logger() -> Arc<dyn Logger> {
    Arc::new(TracingLogger)
}

#[cfg(test)]
pub(crate) mod capture {
    use super::Logger;
    use parking_lot::Mutex;

    /// Records every line with its level, for assertions in tests.
    #[derive(Default)]
    pub struct CaptureLogger {
        pub lines: Mutex<Vec<(&'static str, String)>>,
    }

    impl CaptureLogger {
        pub fn contains(&self, level: &str, needle: &str) -> bool {
            self.lines
                .lock()
                .iter()
                .any(|(l, m)| *l == level && m.contains(needle))
        }
    }

    impl Logger for CaptureLogger {
        fn error(&self, msg: &str) {
            self.lines.lock().push(("error", msg.to_string()));
        }
        fn warning(&self, msg: &str) {
            self.lines.lock().push(("warning", msg.to_string()));
        }
        fn info(&self, msg: &str) {
            self.lines.lock().push(("info", msg.to_string()));
        }
        fn debug(&self, msg: &str) {
            self.lines.lock().push(("debug", msg.to_string()));
        }
    }
}
