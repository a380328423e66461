use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use tokio::sync::mpsc;

use crate::net::mux::{MuxFrame, Shared};
use crate::net::{ChannelError, RecvChannel, SendChannel};

/// What the reader task hands to a receiving stream, in wire order.
#[derive(Debug)]
pub(super) enum Chunk {
    Data(Bytes),
    Fin,
    Reset(u64),
}

pub struct MuxSendStream {
    stream_id: u32,
    shared: Arc<Shared>,
    done: bool,
}

impl MuxSendStream {
    pub(super) fn new(stream_id: u32, shared: Arc<Shared>) -> MuxSendStream {
        MuxSendStream {
            stream_id,
            shared,
            done: false,
        }
    }

    async fn send(&self, frame: MuxFrame) -> Result<(), ChannelError> {
        if let Some(reason) = self.shared.close_reason() {
            return Err(reason);
        }
        self.shared.outbound.send(frame).await.map_err(|_| {
            self.shared
                .close_reason()
                .unwrap_or_else(|| ChannelError::ConnectionLost(String::from("writer stopped")))
        })
    }
}

#[async_trait]
impl SendChannel for MuxSendStream {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, ChannelError> {
        if self.done {
            return Err(ChannelError::Protocol(format!(
                "write on finished stream {}",
                self.stream_id
            )));
        }
        let n = buf.len().min(self.shared.config.max_chunk);
        if n == 0 {
            return Ok(0);
        }

        let payload = Bytes::copy_from_slice(&buf[..n]);
        self.send(MuxFrame::Data {
            stream_id: self.stream_id,
            payload,
        })
        .await?;

        log::trace!("stream {}: queued {n} bytes", self.stream_id);
        Ok(n)
    }

    async fn finish(&mut self) -> Result<(), ChannelError> {
        if self.done {
            return Ok(());
        }
        self.send(MuxFrame::Fin {
            stream_id: self.stream_id,
        })
        .await?;
        self.done = true;
        Ok(())
    }

    async fn reset(&mut self, code: u64) -> Result<(), ChannelError> {
        if self.done {
            return Ok(());
        }
        self.send(MuxFrame::Reset {
            stream_id: self.stream_id,
            code,
        })
        .await?;
        self.done = true;
        Ok(())
    }
}

impl fmt::Debug for MuxSendStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxSendStream")
            .field("stream_id", &self.stream_id)
            .field("done", &self.done)
            .finish()
    }
}

impl Drop for MuxSendStream {
    fn drop(&mut self) {
        if !self.done && self.shared.close_reason().is_none() {
            // Never leave the peer waiting on a stream nobody will finish.
            let _ = self.shared.outbound.try_send(MuxFrame::Reset {
                stream_id: self.stream_id,
                code: 0,
            });
        }
    }
}

pub struct MuxRecvStream {
    stream_id: u32,
    shared: Arc<Shared>,
    rx: mpsc::UnboundedReceiver<Chunk>,
    pending: Bytes,
    finished: bool,
}

impl MuxRecvStream {
    pub(super) fn new(
        stream_id: u32,
        shared: Arc<Shared>,
        rx: mpsc::UnboundedReceiver<Chunk>,
    ) -> MuxRecvStream {
        MuxRecvStream {
            stream_id,
            shared,
            rx,
            pending: Bytes::new(),
            finished: false,
        }
    }

    fn drain_pending(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        n
    }
}

impl fmt::Debug for MuxRecvStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxRecvStream")
            .field("stream_id", &self.stream_id)
            .field("pending", &self.pending.len())
            .field("finished", &self.finished)
            .finish()
    }
}

#[async_trait]
impl RecvChannel for MuxRecvStream {
    async fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>, ChannelError> {
        if buf.is_empty() {
            return Ok(Some(0));
        }

        loop {
            if !self.pending.is_empty() {
                return Ok(Some(self.drain_pending(buf)));
            }
            if self.finished {
                return Ok(None);
            }

            match self.rx.recv().await {
                Some(Chunk::Data(bytes)) => self.pending = bytes,
                Some(Chunk::Fin) => self.finished = true,
                Some(Chunk::Reset(code)) => return Err(ChannelError::Reset { code }),
                None => {
                    return Err(self.shared.close_reason().unwrap_or_else(|| {
                        ChannelError::ConnectionLost(format!(
                            "stream {} dropped by session",
                            self.stream_id
                        ))
                    }));
                }
            }
        }
    }
}
