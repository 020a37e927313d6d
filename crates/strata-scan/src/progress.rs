//! Scan progress reporting.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use strata_core::{ScanSession, SessionCounters, SessionId, SessionStatus};

/// Heartbeat emitted after each directory completes.
#[derive(Debug, Clone)]
pub struct ScanProgress {
    /// Session the heartbeat belongs to.
    pub session: SessionId,
    /// Counters at the time of the heartbeat.
    pub counters: SessionCounters,
    /// Directory that just completed.
    pub current_path: PathBuf,
    /// Time elapsed since scan started.
    pub elapsed: Duration,
}

impl ScanProgress {
    /// Calculate scan rate in files per second.
    pub fn files_per_second(&self) -> f64 {
        if self.elapsed.as_secs_f64() > 0.0 {
            self.counters.files_seen as f64 / self.elapsed.as_secs_f64()
        } else {
            0.0
        }
    }

    /// Calculate scan rate in bytes per second.
    pub fn bytes_per_second(&self) -> f64 {
        if self.elapsed.as_secs_f64() > 0.0 {
            self.counters.bytes_seen as f64 / self.elapsed.as_secs_f64()
        } else {
            0.0
        }
    }

    /// Get total items scanned (files + dirs).
    pub fn total_items(&self) -> u64 {
        self.counters.files_seen + self.counters.dirs_seen
    }
}

/// Totals of the most recent completed scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Baseline {
    pub files: u64,
    pub bytes: u64,
    pub duration: Option<Duration>,
}

impl Baseline {
    /// Baseline from a completed session, `None` for any other state.
    pub fn from_session(session: &ScanSession) -> Option<Self> {
        (session.status == SessionStatus::Completed).then(|| Self {
            files: session.counters.files_seen,
            bytes: session.counters.bytes_seen,
            duration: session.duration(),
        })
    }
}

/// Derived progress fields. Anything that cannot be estimated yet is `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressEstimate {
    /// Percent of the baseline already seen, clamped to 0..=100.
    pub percent: Option<f64>,
    pub files_per_second: Option<f64>,
    pub bytes_per_second: Option<f64>,
    /// Estimated seconds until the baseline amount is reached.
    pub eta_secs: Option<u64>,
    /// Duration of the baseline scan, in seconds.
    pub baseline_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    files: u64,
    bytes: u64,
}

/// Turns raw heartbeat counters into percentage, rate and ETA.
///
/// Rates are computed over a sliding window of heartbeat samples and are
/// only reported once the window holds two samples at different instants.
#[derive(Debug)]
pub struct ProgressReporter {
    window: Duration,
    max_samples: usize,
    session: Option<SessionId>,
    baseline: Option<Baseline>,
    samples: VecDeque<Sample>,
    latest: Option<SessionCounters>,
}

impl ProgressReporter {
    pub const DEFAULT_WINDOW: Duration = Duration::from_secs(30);
    const MAX_SAMPLES: usize = 64;

    /// Create a reporter with the default 30 s window.
    pub fn new() -> Self {
        Self::with_window(Self::DEFAULT_WINDOW)
    }

    /// Create a reporter with a custom window.
    pub fn with_window(window: Duration) -> Self {
        Self {
            window,
            max_samples: Self::MAX_SAMPLES,
            session: None,
            baseline: None,
            samples: VecDeque::new(),
            latest: None,
        }
    }

    /// Reset for a new session.
    pub fn begin(&mut self, session: SessionId, baseline: Option<Baseline>, now: Instant) {
        self.session = Some(session);
        self.baseline = baseline;
        self.samples.clear();
        self.latest = None;
        self.record(&SessionCounters::default(), now);
    }

    /// Forget the current session.
    pub fn clear(&mut self) {
        self.session = None;
        self.baseline = None;
        self.samples.clear();
        self.latest = None;
    }

    /// Session currently tracked.
    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    /// Most recent counters seen by a heartbeat.
    pub fn latest(&self) -> Option<&SessionCounters> {
        self.latest.as_ref()
    }

    /// Add a heartbeat sample.
    pub fn record(&mut self, counters: &SessionCounters, now: Instant) {
        self.latest = Some(*counters);
        self.samples.push_back(Sample {
            at: now,
            files: counters.files_seen,
            bytes: counters.bytes_seen,
        });
        while self.samples.len() > 2 {
            let expired = self
                .samples
                .front()
                .is_some_and(|s| now.duration_since(s.at) > self.window);
            if !expired && self.samples.len() <= self.max_samples {
                break;
            }
            self.samples.pop_front();
        }
    }

    /// Estimate progress for `counters`.
    pub fn estimate(&self, counters: &SessionCounters) -> ProgressEstimate {
        let (files_rate, bytes_rate) = self.rates().unzip();

        let percent = self.baseline.and_then(|b| {
            if b.bytes > 0 {
                Some(ratio(counters.bytes_seen, b.bytes))
            } else if b.files > 0 {
                Some(ratio(counters.files_seen, b.files))
            } else {
                None
            }
        });

        let eta_secs = self.baseline.and_then(|b| {
            let (remaining, rate) = if b.bytes > 0 {
                (b.bytes.saturating_sub(counters.bytes_seen), bytes_rate?)
            } else if b.files > 0 {
                (b.files.saturating_sub(counters.files_seen), files_rate?)
            } else {
                return None;
            };
            if rate <= 0.0 {
                return None;
            }
            Some((remaining as f64 / rate).ceil() as u64)
        });

        ProgressEstimate {
            percent,
            files_per_second: files_rate,
            bytes_per_second: bytes_rate,
            eta_secs,
            baseline_secs: self
                .baseline
                .and_then(|b| b.duration)
                .map(|d| d.as_secs()),
        }
    }

    /// (files/s, bytes/s) across the window.
    fn rates(&self) -> Option<(f64, f64)> {
        let first = self.samples.front()?;
        let last = self.samples.back()?;
        let elapsed = last.at.checked_duration_since(first.at)?.as_secs_f64();
        if self.samples.len() < 2 || elapsed <= 0.0 {
            return None;
        }
        Some((
            last.files.saturating_sub(first.files) as f64 / elapsed,
            last.bytes.saturating_sub(first.bytes) as f64 / elapsed,
        ))
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

fn ratio(seen: u64, total: u64) -> f64 {
    (seen as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
}

/// Everything a status reader needs in one immutable snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanStatusReport {
    /// `Idle` when no session ever ran.
    pub status: SessionStatus,
    /// The running session, or else the most recent one.
    pub session: Option<ScanSession>,
    /// Derived fields, present while a session runs.
    pub progress: Option<ProgressEstimate>,
    /// A worker thread is attached to the running session.
    pub worker_active: bool,
}
