//! Per-item progress reporting for batches.

use serde::Serialize;
use tracing::debug;

use satchel_common::Error;

/// One item handled by a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ProgressEvent {
    Processed { path: String },
    /// Already up to date in the vault.
    Unchanged { path: String },
    Skipped { path: String, reason: String },
    Failed { path: String, error: String },
}

/// Receives one event per item of a running batch.
pub trait ProgressObserver: Send + Sync {
    fn on_event(&self, event: &ProgressEvent);
}

/// Discards events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl ProgressObserver for NoopObserver {
    fn on_event(&self, _event: &ProgressEvent) {}
}

/// Logs events through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl ProgressObserver for TracingObserver {
    fn on_event(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::Processed { path } => debug!(path, "Processed"),
            ProgressEvent::Unchanged { path } => debug!(path, "Unchanged"),
            ProgressEvent::Skipped { path, reason } => debug!(path, reason, "Skipped"),
            ProgressEvent::Failed { path, error } => debug!(path, error, "Failed"),
        }
    }
}

/// Summary returned by every batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub processed: usize,
    pub skipped: usize,
    /// Files found identical to their index entry.
    pub unchanged: usize,
    /// `(path, error)` for every item that failed.
    pub failures: Vec<(String, String)>,
    /// Stopped early by cancellation, a cancel decision or exhausted space.
    pub aborted: bool,
}

impl BatchReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && !self.aborted
    }
}

/// Feeds the observer and the report together.
pub(crate) struct Reporter<'a> {
    observer: &'a dyn ProgressObserver,
    report: BatchReport,
}

impl<'a> Reporter<'a> {
    pub(crate) fn new(observer: &'a dyn ProgressObserver) -> Self {
        Self {
            observer,
            report: BatchReport::default(),
        }
    }

    pub(crate) fn processed(&mut self, path: &str) {
        self.report.processed += 1;
        self.observer.on_event(&ProgressEvent::Processed {
            path: path.to_string(),
        });
    }

    pub(crate) fn skipped(&mut self, path: &str, reason: &str) {
        self.report.skipped += 1;
        self.observer.on_event(&ProgressEvent::Skipped {
            path: path.to_string(),
            reason: reason.to_string(),
        });
    }

    pub(crate) fn unchanged(&mut self, path: &str) {
        self.report.unchanged += 1;
        self.observer.on_event(&ProgressEvent::Unchanged {
            path: path.to_string(),
        });
    }

    pub(crate) fn failed(&mut self, path: &str, error: &Error) {
        let error = error.to_string();
        self.observer.on_event(&ProgressEvent::Failed {
            path: path.to_string(),
            error: error.clone(),
        });
        self.report.failures.push((path.to_string(), error));
    }

    pub(crate) fn abort(&mut self) {
        self.report.aborted = true;
    }

    pub(crate) fn finish(self) -> BatchReport {
        self.report
    }
}
