//! Status reporting for migration runs
//!
//! The engine emits short human-readable lines. Where they go is up to the
//! caller: the tracing pipeline, stdout, or an in-memory buffer for tests.

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use tracing::info;

/// Receives the engine's progress lines
pub trait Reporter: Send + Sync {
    fn report(&self, line: &str);
}

/// Forwards lines to `tracing` at info level
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn report(&self, line: &str) {
        info!(target: "docflow::migration", "{}", line);
    }
}

/// Prints `<timestamp>: <line>` to stdout
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutReporter;

impl Reporter for StdoutReporter {
    fn report(&self, line: &str) {
        println!("{}: {}", Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true), line);
    }
}

/// Collects lines in memory
#[derive(Debug, Default)]
pub struct MemoryReporter {
    lines: Mutex<Vec<String>>,
}

impl MemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything reported so far
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    pub fn clear(&self) {
        self.lines.lock().clear();
    }
}

impl Reporter for MemoryReporter {
    fn report(&self, line: &str) {
        self.lines.lock().push(line.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_reporter_keeps_order() {
        let reporter = MemoryReporter::new();
        reporter.report("1.create-db.json");
        reporter.report("  is being read ...");
        assert_eq!(reporter.lines(), vec!["1.create-db.json", "  is being read ..."]);

        reporter.clear();
        assert!(reporter.lines().is_empty());
    }
}
