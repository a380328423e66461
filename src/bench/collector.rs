use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::bench::stats::{Baseline, FrameCompletion, ThroughputAccumulator};
use crate::bench::{Outcome, TransferSummary};
use crate::net::{ChannelError, RecvChannel, Session};

/// Collects frames on the client side.
pub struct FrameCollector<S: Session> {
    session: S,
    stats: Arc<ThroughputAccumulator>,
    baseline: Baseline,
    frame_timeout: Option<Duration>,
    frame_size: Option<usize>,
    cancel: CancellationToken,
}

impl<S: Session> Clone for FrameCollector<S> {
    fn clone(&self) -> Self {
        FrameCollector {
            session: self.session.clone(),
            stats: self.stats.clone(),
            baseline: self.baseline,
            frame_timeout: self.frame_timeout,
            frame_size: self.frame_size,
            cancel: self.cancel.clone(),
        }
    }
}

impl<S: Session> FrameCollector<S> {
    pub fn new(
        session: S,
        stats: Arc<ThroughputAccumulator>,
        baseline: Baseline,
        frame_timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> FrameCollector<S> {
        FrameCollector {
            session,
            stats,
            baseline,
            frame_timeout,
            frame_size: None,
            cancel,
        }
    }

    /// Warn about per-frame channels that do not carry exactly `frame_size`
    /// bytes.
    pub fn expecting_frames_of(mut self, frame_size: usize) -> FrameCollector<S> {
        self.frame_size = Some(frame_size);
        self
    }

    /// Spawns `count` acceptance units up front and waits for all of them.
    pub async fn collect(&self, count: u64) -> TransferSummary {
        let mut units = JoinSet::new();
        for unit in 1..=count {
            let collector = self.clone();
            units.spawn(async move { collector.collect_one(unit).await });
        }
        log::debug!("waiting on {count} collector units");

        let mut summary = TransferSummary::default();
        while let Some(joined) = units.join_next().await {
            match joined {
                Ok(outcome) => summary.tally(&outcome),
                Err(e) => {
                    log::warn!("collector unit did not finish: {e}");
                    summary.failed += 1;
                }
            }
        }
        summary
    }

    async fn collect_one(&self, unit: u64) -> Outcome {
        match self.receive(unit).await {
            Ok(bytes) => {
                if let Some(expected) = self.frame_size.filter(|&size| size as u64 != bytes) {
                    log::warn!("unit {unit}: frame carried {bytes} bytes, expected {expected}");
                }
                let ordinal = self.stats.complete_frame();
                log::trace!("unit {unit}: frame of {bytes} bytes complete");
                println!("{}", FrameCompletion::since(ordinal, &self.baseline));
                Outcome::Success
            }
            Err(outcome) => outcome,
        }
    }

    /// Accepts one channel and reads it to the end, returning its byte count.
    async fn receive(&self, unit: u64) -> Result<u64, Outcome> {
        let accepted = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Outcome::BenignClose),
            accepted = self.session.accept_uni() => accepted,
        };

        let channel = match accepted {
            Ok(channel) => channel,
            Err(e) if e.is_benign_close() => {
                log::debug!("unit {unit}: session ended before a frame arrived");
                return Err(Outcome::BenignClose);
            }
            Err(e) => {
                log::warn!(
                    "unit {unit}: accept failed at {:.6}: {e}",
                    self.baseline.elapsed_secs()
                );
                return Err(Outcome::from(e));
            }
        };

        tokio::select! {
            _ = self.cancel.cancelled() => Err(Outcome::BenignClose),
            result = self.drain(channel) => result,
        }
    }

    /// Reads one accepted channel to end-of-stream, within the frame timeout.
    async fn drain(&self, mut channel: S::Recv) -> Result<u64, Outcome> {
        let stats = &self.stats;
        let mut on_read = |n: usize| {
            if let Some(report) = stats.record(n) {
                println!("{report}");
            }
        };
        let read = channel.read_to_end_counting(&mut on_read);

        let result = match self.frame_timeout {
            Some(limit) => match tokio::time::timeout(limit, read).await {
                Ok(result) => result,
                Err(_) => {
                    log::warn!(
                        "frame read timed out after {limit:?} at {:.6}",
                        self.baseline.elapsed_secs()
                    );
                    return Err(Outcome::TransferError(format!("timed out after {limit:?}")));
                }
            },
            None => read.await,
        };

        result.map_err(|e| self.read_failed(e))
    }

    fn read_failed(&self, e: ChannelError) -> Outcome {
        if e.is_benign_close() {
            log::debug!("frame cut short by a benign session close");
        } else {
            log::warn!("frame read failed at {:.6}: {e}", self.baseline.elapsed_secs());
        }
        Outcome::from(e)
    }

    /// Shared-channel delivery: every frame arrives back-to-back on `channel`,
    /// and a frame completes at every `frame_size` boundary.
    ///
    /// Frames that never arrive because the stream ended early are counted as
    /// benign when the stream ended cleanly, as failed otherwise.
    pub async fn collect_shared<R: RecvChannel>(
        &self,
        channel: &mut R,
        count: u64,
        frame_size: usize,
    ) -> Result<TransferSummary, ChannelError> {
        if frame_size == 0 && count > 0 {
            log::warn!("frame size is zero; shared-channel frames cannot be delimited");
        }

        let mut boundaries = FrameBoundaries::new(frame_size);
        let mut completed = 0u64;
        let mut on_read = |n: usize| {
            if let Some(report) = self.stats.record(n) {
                println!("{report}");
            }
            for _ in 0..boundaries.advance(n) {
                let ordinal = self.stats.complete_frame();
                println!("{}", FrameCompletion::since(ordinal, &self.baseline));
                completed += 1;
            }
        };

        let result = tokio::select! {
            _ = self.cancel.cancelled() => Ok(0),
            result = channel.read_to_end_counting(&mut on_read) => result,
        };

        let outstanding = count.saturating_sub(completed);
        let mut summary = TransferSummary {
            completed,
            ..TransferSummary::default()
        };
        match result {
            Ok(_) => summary.benign = outstanding,
            Err(e) if e.is_benign_close() => summary.benign = outstanding,
            Err(e @ ChannelError::Reset { .. }) => return Err(e),
            Err(e) => {
                log::warn!(
                    "shared channel failed after {completed} frames at {:.6}: {e}",
                    self.baseline.elapsed_secs()
                );
                summary.failed = outstanding;
            }
        }
        Ok(summary)
    }
}

/// Finds frame ends in a byte stream of fixed-size frames.
#[derive(Debug)]
struct FrameBoundaries {
    frame_size: usize,
    in_frame: usize,
}

impl FrameBoundaries {
    fn new(frame_size: usize) -> FrameBoundaries {
        FrameBoundaries {
            frame_size,
            in_frame: 0,
        }
    }

    /// Consumes `n` bytes and returns how many frames they completed.
    fn advance(&mut self, n: usize) -> usize {
        if self.frame_size == 0 {
            return 0;
        }
        self.in_frame += n;
        let done = self.in_frame / self.frame_size;
        self.in_frame %= self.frame_size;
        done
    }
}
