use std::sync::Arc;
use std::time::Duration;

use crate::bench::stats::{Baseline, FrameCompletion, ThroughputAccumulator};
use crate::bench::{Frame, Outcome};
use crate::net::{ChannelError, SendChannel, Session};

/// Delivers frames on the server side, one fresh data channel per frame.
pub struct FrameSender<S: Session> {
    session: S,
    stats: Arc<ThroughputAccumulator>,
    baseline: Baseline,
    frame_timeout: Option<Duration>,
}

impl<S: Session> Clone for FrameSender<S> {
    fn clone(&self) -> Self {
        FrameSender {
            session: self.session.clone(),
            stats: self.stats.clone(),
            baseline: self.baseline,
            frame_timeout: self.frame_timeout,
        }
    }
}

impl<S: Session> FrameSender<S> {
    pub fn new(
        session: S,
        stats: Arc<ThroughputAccumulator>,
        baseline: Baseline,
        frame_timeout: Option<Duration>,
    ) -> FrameSender<S> {
        FrameSender {
            session,
            stats,
            baseline,
            frame_timeout,
        }
    }

    /// Opens a channel, writes the whole payload and finishes the channel.
    ///
    /// Failures end this frame only. Nothing is retried.
    pub async fn send(&self, frame: Frame) -> Outcome {
        let index = frame.index;

        let result = match self.frame_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.transfer(&frame)).await {
                Ok(result) => result,
                Err(_) => {
                    log::warn!(
                        "frame {index}: send timed out after {limit:?} at {:.6}",
                        self.baseline.elapsed_secs()
                    );
                    return Outcome::TransferError(format!("timed out after {limit:?}"));
                }
            },
            None => self.transfer(&frame).await,
        };

        match result {
            Ok(()) => {
                if let Some(report) = self.stats.record(frame.payload.len()) {
                    println!("{report}");
                }
                self.stats.complete_frame();
                println!("{}", FrameCompletion::since(index, &self.baseline));
                Outcome::Success
            }
            Err(e) if e.is_benign_close() => {
                log::debug!("frame {index}: session already closed, not sending");
                Outcome::BenignClose
            }
            Err(e) => {
                log::warn!(
                    "frame {index}: transfer failed at {:.6}: {e}",
                    self.baseline.elapsed_secs()
                );
                Outcome::from(e)
            }
        }
    }

    async fn transfer(&self, frame: &Frame) -> Result<(), ChannelError> {
        let mut channel = self.session.open_uni().await?;
        channel.write_all(&frame.payload).await?;
        channel.finish().await?;
        log::trace!("frame {}: wrote {} bytes", frame.index, frame.payload.len());
        Ok(())
    }
}
