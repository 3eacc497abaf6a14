//! Reporting of counters that went backwards
//!
//! Kernel counters are expected to only increase between samples. When one
//! does not, the delta is clamped and the pair of tables that produced it is
//! handed to a [`NonMonotonicObserver`] so the anomaly is never silently
//! absorbed.

use std::{fmt, sync::Arc};

use metrics::counter;
use tracing::warn;

use crate::stats::NetworkStats;

/// The two tables, and where known the rows, that produced a decrease.
#[derive(Debug, Clone, Copy)]
pub struct NonMonotonicReport<'a> {
    /// Names the snapshot stream, e.g. the recorder prefix
    pub cookie: &'a str,
    /// The newer table
    pub left: &'a NetworkStats,
    /// Row of `left` that decreased, `None` when the clock went backwards
    pub left_index: Option<usize>,
    /// The older table
    pub right: &'a NetworkStats,
    /// Row of `right` that was larger
    pub right_index: Option<usize>,
}

impl fmt::Display for NonMonotonicReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "found non-monotonic values; saving to diagnostics")?;
        writeln!(f, "cookie={}", self.cookie)?;
        match (self.left_index, self.right_index) {
            (Some(left), Some(right)) => {
                writeln!(f, "left index {left}, right index {right}")?;
            }
            _ => writeln!(f, "elapsed realtime went backwards")?,
        }
        writeln!(f, "left={}", self.left)?;
        write!(f, "right={}", self.right)
    }
}

/// Receives non-monotonic anomalies found while subtracting snapshots.
pub trait NonMonotonicObserver: Send + Sync {
    /// Called once per decreasing row, or once when time went backwards.
    fn found_non_monotonic(&self, report: &NonMonotonicReport<'_>);
}

/// A destination for free-form diagnostic text, keyed by tag.
pub trait DiagnosticSink: Send + Sync {
    /// Store `text` under `tag`. Failures are the sink's to absorb.
    fn add_text(&self, tag: &str, text: &str);
}

/// Tag under which non-monotonic reports are stored
pub const TAG_NETSTATS_ERROR: &str = "netstats_error";

/// Logs every anomaly, counts it and forwards the report text to a sink.
#[derive(Clone)]
pub struct ReportingObserver {
    sink: Arc<dyn DiagnosticSink>,
}

impl fmt::Debug for ReportingObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReportingObserver").finish_non_exhaustive()
    }
}

impl ReportingObserver {
    /// Create a new observer writing to `sink`
    #[must_use]
    pub fn new(sink: Arc<dyn DiagnosticSink>) -> Self {
        Self { sink }
    }
}

impl NonMonotonicObserver for ReportingObserver {
    fn found_non_monotonic(&self, report: &NonMonotonicReport<'_>) {
        warn!(
            cookie = report.cookie,
            left_index = ?report.left_index,
            right_index = ?report.right_index,
            "found non-monotonic counters"
        );
        counter!("non_monotonic_total", "cookie" => report.cookie.to_string()).increment(1);
        self.sink.add_text(TAG_NETSTATS_ERROR, &report.to_string());
    }
}

/// A sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl DiagnosticSink for NullSink {
    fn add_text(&self, _tag: &str, _text: &str) {}
}
