//! Transfer progress reporting.

use std::time::{Duration, Instant};

use crate::fanout::HostRef;

/// Default minimum spacing between progress reports.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// One progress report.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferProgress {
    /// Host the transfer runs against.
    pub host: HostRef,
    /// File being transferred (local path for uploads, remote for downloads).
    pub file: String,
    /// Bytes moved so far.
    pub transferred: u64,
    /// Total bytes, 0 if unknown.
    pub total: u64,
    /// Throughput since the previous report.
    pub bytes_per_sec: f64,
}

impl TransferProgress {
    /// Completion percentage in `0.0..=100.0`.
    #[must_use]
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            return if self.transferred == 0 { 0.0 } else { 100.0 };
        }
        (self.transferred as f64 / self.total as f64 * 100.0).min(100.0)
    }
}

/// Receives progress reports.
///
/// Reports for concurrent transfers arrive from different worker threads.
pub trait ProgressSink: Send + Sync {
    /// Called with the latest progress.
    fn on_progress(&self, progress: &TransferProgress);
}

impl<F> ProgressSink for F
where
    F: Fn(&TransferProgress) + Send + Sync,
{
    fn on_progress(&self, progress: &TransferProgress) {
        self(progress);
    }
}

/// Progress state for one streaming transfer.
///
/// Passed by `&mut` into the stream loop, which calls [`advance`] per
/// chunk. Reports are throttled to one per interval; [`finish`] always
/// emits the final state.
///
/// [`advance`]: ProgressTracker::advance
/// [`finish`]: ProgressTracker::finish
pub struct ProgressTracker<'a> {
    host: HostRef,
    file: String,
    total: u64,
    transferred: u64,
    interval: Duration,
    last_emit: Instant,
    last_emit_bytes: u64,
    sink: Option<&'a dyn ProgressSink>,
}

impl<'a> ProgressTracker<'a> {
    /// Creates a tracker; `sink` may be `None` to track silently.
    #[must_use]
    pub fn new(
        host: HostRef,
        file: impl Into<String>,
        total: u64,
        sink: Option<&'a dyn ProgressSink>,
    ) -> Self {
        Self {
            host,
            file: file.into(),
            total,
            transferred: 0,
            interval: DEFAULT_PROGRESS_INTERVAL,
            last_emit: Instant::now(),
            last_emit_bytes: 0,
            sink,
        }
    }

    /// Sets the minimum spacing between reports.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Records `bytes` more and reports if the interval has elapsed.
    pub fn advance(&mut self, bytes: u64) {
        self.transferred = self.transferred.saturating_add(bytes);
        if self.last_emit.elapsed() >= self.interval {
            self.emit();
        }
    }

    /// Emits the final report.
    pub fn finish(&mut self) {
        self.emit();
    }

    /// Bytes recorded so far.
    #[must_use]
    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    fn emit(&mut self) {
        let now = Instant::now();
        let window = now.duration_since(self.last_emit).as_secs_f64();
        let delta = self.transferred - self.last_emit_bytes;
        let bytes_per_sec = if window > 0.0 {
            delta as f64 / window
        } else {
            0.0
        };

        self.last_emit = now;
        self.last_emit_bytes = self.transferred;

        if let Some(sink) = self.sink {
            sink.on_progress(&TransferProgress {
                host: self.host.clone(),
                file: self.file.clone(),
                transferred: self.transferred,
                total: self.total,
                bytes_per_sec,
            });
        }
    }
}

impl std::fmt::Debug for ProgressTracker<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("file", &self.file)
            .field("transferred", &self.transferred)
            .field("total", &self.total)
            .finish_non_exhaustive()
    }
}

/// Formats a byte count, e.g. `1.5 MB`.
#[must_use]
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    let mut size = bytes as f64;
    for unit in UNITS {
        if size < 1024.0 {
            return format!("{:.1} {}", size, unit);
        }
        size /= 1024.0;
    }
    format!("{:.1} PB", size)
}

/// Formats a throughput, e.g. `2.0 MB/s`.
#[must_use]
pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", format_size(bytes_per_sec.max(0.0) as u64))
}
