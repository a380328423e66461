//! The frame-paced transfer protocol.
//!
//! A client opens a control channel and asks for `n` frames with a `GETN`
//! command. The server releases one frame per pacing slot and, depending on
//! the [`DeliveryMode`], either sends each frame on its own data channel or
//! writes them back-to-back on the control channel. Both sides account bytes
//! and frame completions in a shared [`stats::ThroughputAccumulator`].

use std::fmt;
use std::time::Duration;

use bytes::Bytes;

use crate::net::ChannelError;

pub mod client;
pub mod collector;
pub mod command;
pub mod schedule;
pub mod sender;
pub mod server;
pub mod stats;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeliveryMode {
    /// One fresh unidirectional channel per frame.
    PerFrameChannel,
    /// Every frame written in order on the control channel.
    SharedChannel,
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryMode::PerFrameChannel => write!(f, "per-frame"),
            DeliveryMode::SharedChannel => write!(f, "shared"),
        }
    }
}

/// How a single frame unit ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// The session ended normally before this unit had anything to do.
    BenignClose,
    TransferError(String),
    ProtocolError(String),
}

impl From<ChannelError> for Outcome {
    fn from(e: ChannelError) -> Self {
        match e.is_benign_close() {
            true => Outcome::BenignClose,
            false => Outcome::TransferError(e.to_string()),
        }
    }
}

/// One unit of synthetic payload. The payload is shared, never copied.
#[derive(Debug, Clone)]
pub struct Frame {
    pub index: u64,
    pub payload: Bytes,
}

/// Counts of how every frame unit of a session ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferSummary {
    pub completed: u64,
    pub benign: u64,
    pub failed: u64,
}

impl TransferSummary {
    pub fn tally(&mut self, outcome: &Outcome) {
        self.tally_many(outcome, 1);
    }

    /// Counts `units` units that all ended with `outcome`.
    pub fn tally_many(&mut self, outcome: &Outcome, units: u64) {
        let counter = match outcome {
            Outcome::Success => &mut self.completed,
            Outcome::BenignClose => &mut self.benign,
            Outcome::TransferError(_) | Outcome::ProtocolError(_) => &mut self.failed,
        };
        *counter = counter.saturating_add(units);
    }

    pub fn units(&self) -> u64 {
        self.completed
            .saturating_add(self.benign)
            .saturating_add(self.failed)
    }
}

/// What one side of a finished session reports.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionReport {
    pub summary: TransferSummary,
    pub totals: stats::FinalReport,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub frame_size: usize,
    pub frame_interval: Duration,
    pub mode: DeliveryMode,
    pub report_interval: Duration,
    /// Upper bound on sending one frame, from channel open to finish.
    pub frame_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            frame_size: 5000,
            frame_interval: Duration::from_millis(33),
            mode: DeliveryMode::PerFrameChannel,
            report_interval: Duration::from_secs(1),
            frame_timeout: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub frame_count: u64,
    /// Expected payload size. Used to find frame boundaries in shared mode.
    pub frame_size: usize,
    pub mode: DeliveryMode,
    pub report_interval: Duration,
    /// Upper bound on draining one accepted channel.
    pub frame_timeout: Option<Duration>,
    /// Origin of the `fin time` offsets; `None` means the session start.
    pub baseline: Option<stats::Baseline>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            frame_count: 300,
            frame_size: 5000,
            mode: DeliveryMode::PerFrameChannel,
            report_interval: Duration::from_secs(1),
            frame_timeout: None,
            baseline: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_code_zero_closes_are_benign_outcomes() {
        let benign = ChannelError::ApplicationClosed {
            code: 0,
            reason: String::new(),
        };
        assert_eq!(Outcome::from(benign), Outcome::BenignClose);

        let rejected = ChannelError::ApplicationClosed {
            code: 42,
            reason: String::new(),
        };
        assert!(matches!(Outcome::from(rejected), Outcome::TransferError(_)));
        assert!(matches!(
            Outcome::from(ChannelError::Reset { code: 0 }),
            Outcome::TransferError(_)
        ));
    }

    #[test]
    fn summary_tallies_every_outcome() {
        let mut summary = TransferSummary::default();
        for outcome in [
            Outcome::Success,
            Outcome::Success,
            Outcome::BenignClose,
            Outcome::TransferError(String::from("reset")),
            Outcome::ProtocolError(String::from("bad")),
        ] {
            summary.tally(&outcome);
        }

        assert_eq!(
            summary,
            TransferSummary {
                completed: 2,
                benign: 1,
                failed: 2
            }
        );
        assert_eq!(summary.units(), 5);
    }
}
