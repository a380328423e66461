use std::time::Duration;

use async_trait::async_trait;

pub mod frame;
pub mod mux;

pub use frame::{Deserialize, Serialize};

/// The application close code a peer uses to say "nothing more to send".
pub const CLOSE_CODE_OK: u64 = 0;

const READ_CHUNK_SIZE: usize = 16 * 1024;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("connection closed by peer with application code {code}: {reason:?}")]
    ApplicationClosed { code: u64, reason: String },
    #[error("connection closed locally with application code {code}")]
    LocallyClosed { code: u64 },
    #[error("stream reset by peer with application code {code}")]
    Reset { code: u64 },
    #[error("connection timed out after {0:?} of inactivity")]
    IdleTimeout(Duration),
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("transport protocol violation: {0}")]
    Protocol(String),
}

impl ChannelError {
    /// Returns the application close code when the whole session was closed
    /// by either side, and `None` for every other failure.
    pub fn application_code(&self) -> Option<u64> {
        match self {
            ChannelError::ApplicationClosed { code, .. } => Some(*code),
            ChannelError::LocallyClosed { code } => Some(*code),
            _ => None,
        }
    }

    /// Whether this is the ordinary end-of-session signal.
    pub fn is_benign_close(&self) -> bool {
        self.application_code() == Some(CLOSE_CODE_OK)
    }
}

/// The sending half of a channel. Writes may be partial.
#[async_trait]
pub trait SendChannel: Send + 'static {
    /// Writes some prefix of `buf` and returns how many bytes were accepted.
    async fn write(&mut self, buf: &[u8]) -> Result<usize, ChannelError>;

    /// Cleanly ends the stream; the peer observes end-of-stream.
    async fn finish(&mut self) -> Result<(), ChannelError>;

    /// Abandons the stream with an application error code.
    async fn reset(&mut self, code: u64) -> Result<(), ChannelError>;

    async fn write_all(&mut self, buf: &[u8]) -> Result<(), ChannelError> {
        let mut offset = 0;
        while offset < buf.len() {
            let n = self.write(&buf[offset..]).await?;
            if n == 0 {
                return Err(ChannelError::ConnectionLost(String::from(
                    "channel accepted zero bytes",
                )));
            }
            offset += n;
        }
        Ok(())
    }
}

/// The receiving half of a channel.
#[async_trait]
pub trait RecvChannel: Send + 'static {
    /// Reads into `buf`. Returns `Ok(None)` once the peer finished the stream.
    async fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>, ChannelError>;

    /// Reads until end-of-stream, calling `on_read` with the size of every
    /// successful read. Returns the total byte count.
    async fn read_to_end_counting(
        &mut self,
        on_read: &mut (dyn FnMut(usize) + Send),
    ) -> Result<u64, ChannelError> {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        let mut total = 0u64;
        while let Some(n) = self.read(&mut buf).await? {
            on_read(n);
            total += n as u64;
        }
        Ok(total)
    }
}

/// One established multiplexed connection between a client and a server.
///
/// Handles are cheap to clone and every clone refers to the same connection,
/// so per-frame tasks can each hold their own.
#[async_trait]
pub trait Session: Clone + Send + Sync + 'static {
    type Send: SendChannel;
    type Recv: RecvChannel;

    async fn open_bi(&self) -> Result<(Self::Send, Self::Recv), ChannelError>;
    async fn accept_bi(&self) -> Result<(Self::Send, Self::Recv), ChannelError>;
    async fn open_uni(&self) -> Result<Self::Send, ChannelError>;
    async fn accept_uni(&self) -> Result<Self::Recv, ChannelError>;

    /// Closes the whole connection. Frames queued before the close are still
    /// delivered to the peer ahead of it.
    async fn close(&self, code: u64, reason: &str);

    /// Why the connection is closed, or `None` while it is still open.
    fn close_reason(&self) -> Option<ChannelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn benign_close_is_only_code_zero() {
        let remote = ChannelError::ApplicationClosed { code: 0, reason: String::new() };
        let local = ChannelError::LocallyClosed { code: 0 };
        let rejected = ChannelError::ApplicationClosed { code: 42, reason: String::new() };
        let reset = ChannelError::Reset { code: 0 };

        assert!(remote.is_benign_close());
        assert!(local.is_benign_close());
        assert!(!rejected.is_benign_close());
        assert!(!reset.is_benign_close());
        assert!(!ChannelError::IdleTimeout(Duration::from_secs(1)).is_benign_close());
    }

    struct Trickle {
        max: usize,
        calls: usize,
        written: Vec<u8>,
    }

    #[async_trait]
    impl SendChannel for Trickle {
        async fn write(&mut self, buf: &[u8]) -> Result<usize, ChannelError> {
            self.calls += 1;
            let n = buf.len().min(self.max);
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        async fn finish(&mut self) -> Result<(), ChannelError> {
            Ok(())
        }

        async fn reset(&mut self, _code: u64) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn write_all_loops_over_partial_writes() {
        let mut channel = Trickle { max: 7, calls: 0, written: Vec::new() };
        let payload: Vec<u8> = (0..100u8).collect();

        channel.write_all(&payload).await.unwrap();

        assert_eq!(channel.written, payload);
        assert_eq!(channel.calls, 15);
    }

    struct Scripted(Vec<usize>);

    #[async_trait]
    impl RecvChannel for Scripted {
        async fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>, ChannelError> {
            match self.0.pop() {
                Some(n) => Ok(Some(n.min(buf.len()))),
                None => Ok(None),
            }
        }
    }

    #[tokio::test]
    async fn read_to_end_counting_reports_every_read() {
        let mut channel = Scripted(vec![3, 500, 10]);
        let mut seen = Vec::new();

        let total = channel
            .read_to_end_counting(&mut |n: usize| seen.push(n))
            .await
            .unwrap();

        assert_eq!(total, 513);
        assert_eq!(seen, vec![10, 500, 3]);
    }

    #[tokio::test]
    async fn write_all_fails_when_nothing_is_accepted() {
        let mut channel = Trickle { max: 0, calls: 0, written: Vec::new() };
        let err = channel.write_all(b"abc").await.unwrap_err();
        assert!(matches!(err, ChannelError::ConnectionLost(_)));
    }
}
