use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

const BYTES_PER_MB: f64 = 1e6;

/// Goodput in Mbit/s, or `None` when no time has elapsed.
pub fn goodput_mbps(bytes: u64, elapsed: Duration) -> Option<f64> {
    if elapsed.is_zero() {
        return None;
    }
    Some(bytes as f64 / BYTES_PER_MB * 8.0 / elapsed.as_secs_f64())
}

/// Wall-clock origin for the `fin time` offsets in frame completion lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Baseline(SystemTime);

impl Baseline {
    pub fn now() -> Baseline {
        Baseline(SystemTime::now())
    }

    /// A baseline at `secs` seconds after the unix epoch. Non-positive,
    /// non-finite or unrepresentable values mean "now".
    pub fn from_unix_secs(secs: f64) -> Baseline {
        if !(secs.is_finite() && secs > 0.0) {
            return Baseline::now();
        }
        Duration::try_from_secs_f64(secs)
            .ok()
            .and_then(|offset| UNIX_EPOCH.checked_add(offset))
            .map_or_else(Baseline::now, Baseline)
    }

    /// Seconds since the baseline; negative if the baseline lies ahead.
    pub fn elapsed_secs(&self) -> f64 {
        match SystemTime::now().duration_since(self.0) {
            Ok(elapsed) => elapsed.as_secs_f64(),
            Err(e) => -e.duration().as_secs_f64(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SessionStats {
    pub total_bytes: u64,
    pub frame_completions: u64,
    pub session_start: Instant,
}

/// Bytes seen in the reporting interval that is currently open.
#[derive(Debug, Clone, Copy)]
struct ThroughputSample {
    bytes: u64,
    start: Instant,
}

#[derive(Debug)]
struct Inner {
    stats: SessionStats,
    sample: ThroughputSample,
}

/// Byte and frame accounting shared by every frame unit of one session.
///
/// All counters live behind one lock, so a report always reads totals that
/// belong together.
#[derive(Debug)]
pub struct ThroughputAccumulator {
    report_interval: Duration,
    inner: Mutex<Inner>,
}

impl ThroughputAccumulator {
    /// Starts the session clock now.
    pub fn new(report_interval: Duration) -> ThroughputAccumulator {
        let now = Instant::now();
        ThroughputAccumulator {
            report_interval,
            inner: Mutex::new(Inner {
                stats: SessionStats {
                    total_bytes: 0,
                    frame_completions: 0,
                    session_start: now,
                },
                sample: ThroughputSample {
                    bytes: 0,
                    start: now,
                },
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds `n` transferred bytes. Returns the report for the interval that
    /// just closed if at least one report interval has passed since the last.
    pub fn record(&self, n: usize) -> Option<IntervalReport> {
        let now = Instant::now();
        let mut inner = self.inner();
        inner.stats.total_bytes += n as u64;
        inner.sample.bytes += n as u64;

        let open_for = now.duration_since(inner.sample.start);
        if open_for < self.report_interval {
            return None;
        }

        let session_start = inner.stats.session_start;
        let report = IntervalReport {
            start: inner.sample.start.duration_since(session_start),
            end: now.duration_since(session_start),
            bytes: inner.sample.bytes,
        };
        inner.sample = ThroughputSample {
            bytes: 0,
            start: now,
        };
        Some(report)
    }

    /// Counts one finished frame and returns its completion ordinal.
    pub fn complete_frame(&self) -> u64 {
        let mut inner = self.inner();
        inner.stats.frame_completions += 1;
        inner.stats.frame_completions
    }

    pub fn snapshot(&self) -> SessionStats {
        self.inner().stats
    }

    pub fn final_report(&self, direction: Direction) -> FinalReport {
        let stats = self.snapshot();
        FinalReport {
            direction,
            total_bytes: stats.total_bytes,
            frames: stats.frame_completions,
            elapsed: stats.session_start.elapsed(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalReport {
    pub start: Duration,
    pub end: Duration,
    pub bytes: u64,
}

impl IntervalReport {
    pub fn mbps(&self) -> Option<f64> {
        goodput_mbps(self.bytes, self.end.saturating_sub(self.start))
    }
}

impl fmt::Display for IntervalReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{} sec   {:.2} MB   {:.2} Mbits/sec",
            self.start.as_secs(),
            self.end.as_secs(),
            self.bytes as f64 / BYTES_PER_MB,
            self.mbps().unwrap_or(0.0)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Recv,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Sent => write!(f, "Sent"),
            Direction::Recv => write!(f, "Recv"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FinalReport {
    pub direction: Direction,
    pub total_bytes: u64,
    pub frames: u64,
    pub elapsed: Duration,
}

impl FinalReport {
    pub fn goodput_mbps(&self) -> Option<f64> {
        goodput_mbps(self.total_bytes, self.elapsed)
    }
}

impl fmt::Display for FinalReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:.2} MB in {:.3} s, goodput {:.2} Mbps",
            self.direction,
            self.total_bytes as f64 / BYTES_PER_MB,
            self.elapsed.as_secs_f64(),
            self.goodput_mbps().unwrap_or(0.0)
        )
    }
}

/// The per-frame `fin time` line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameCompletion {
    pub index: u64,
    pub fin_time: f64,
}

impl FrameCompletion {
    pub fn since(index: u64, baseline: &Baseline) -> FrameCompletion {
        FrameCompletion {
            index,
            fin_time: baseline.elapsed_secs(),
        }
    }
}

impl fmt::Display for FrameCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame {}, fin time: {:.6}", self.index, self.fin_time)
    }
}
