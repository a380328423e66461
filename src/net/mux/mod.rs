//! A small stream multiplexer carrying the benchmark's channels over one
//! reliable byte stream (TCP in the CLI, an in-memory pipe in tests).
//!
//! Each session runs one reader task and one writer task. Every frame a local
//! channel produces goes through a single bounded queue to the writer, so the
//! wire order matches the order in which frames were queued. The `Close`
//! frame is held aside and written by the writer once the queue is drained,
//! so a `Fin` queued before `close` always reaches the peer first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::net::{CLOSE_CODE_OK, ChannelError, Session};

mod conn;
mod frames;
mod stream;

use conn::{FrameReader, FrameWriter};
pub use frames::MuxFrame;
use stream::Chunk;
pub use stream::{MuxRecvStream, MuxSendStream};

#[derive(thiserror::Error, Debug)]
pub enum FrameError {
    #[error("unknown frame kind {0:#04x}")]
    UnknownKind(u8),
    #[error("frame payload of {0} bytes exceeds the limit")]
    PayloadTooLarge(usize),
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("reached end of stream")]
    Eof,
    #[error("stream ended inside a frame with {0} bytes buffered")]
    TruncatedFrame(usize),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {0}")]
    Frame(#[from] FrameError),
}

impl From<Error> for ChannelError {
    fn from(e: Error) -> Self {
        match e {
            Error::Eof => ChannelError::ConnectionLost(String::from(
                "peer went away without closing the session",
            )),
            Error::Io(e) => ChannelError::ConnectionLost(e.to_string()),
            e @ (Error::TruncatedFrame(_) | Error::Frame(_)) => {
                ChannelError::Protocol(e.to_string())
            }
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn initiator_bit(self) -> u32 {
        match self {
            Role::Client => 0,
            Role::Server => 1,
        }
    }
}

fn stream_id(seq: u32, uni: bool, role: Role) -> u32 {
    (seq << 2) | ((uni as u32) << 1) | role.initiator_bit()
}

fn is_uni(stream_id: u32) -> bool {
    stream_id & 0b10 != 0
}

fn initiator(stream_id: u32) -> Role {
    match stream_id & 0b01 {
        0 => Role::Client,
        _ => Role::Server,
    }
}

#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Tear the session down when nothing arrives for this long.
    pub idle_timeout: Option<Duration>,
    /// Send a ping after this much outbound silence.
    pub keep_alive: Option<Duration>,
    /// Most bytes a single channel write accepts.
    pub max_chunk: usize,
    /// Frames that may wait for the writer before senders block.
    pub outbound_capacity: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        MuxConfig {
            idle_timeout: Some(Duration::from_secs(30)),
            keep_alive: Some(Duration::from_secs(5)),
            max_chunk: 16 * 1024,
            outbound_capacity: 256,
        }
    }
}

/// Longest `close` waits for the writer to flush the `Close` frame.
const CLOSE_LINGER: Duration = Duration::from_secs(1);

type BiStreams = (MuxSendStream, MuxRecvStream);

struct State {
    streams: HashMap<u32, mpsc::UnboundedSender<Chunk>>,
    incoming_bi: Option<mpsc::UnboundedSender<BiStreams>>,
    incoming_uni: Option<mpsc::UnboundedSender<MuxRecvStream>>,
    next_bi: u32,
    next_uni: u32,
    close: Option<ChannelError>,
    /// `Close` frame the writer sends after draining the queue.
    farewell: Option<MuxFrame>,
}

pub(crate) struct Shared {
    role: Role,
    config: MuxConfig,
    outbound: mpsc::Sender<MuxFrame>,
    state: Mutex<State>,
    shutdown: CancellationToken,
    /// Cancelled once the writer task has stopped.
    writer_done: CancellationToken,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn close_reason(&self) -> Option<ChannelError> {
        self.state().close.clone()
    }

    /// Marks the session closed and wakes every task waiting on it. Returns
    /// false when the session was already closed.
    fn teardown(&self, reason: ChannelError) -> bool {
        let released = {
            let mut state = self.state();
            if state.close.is_some() {
                return false;
            }
            log::debug!("{:?} session closing: {reason}", self.role);
            state.close = Some(reason);
            (
                std::mem::take(&mut state.streams),
                state.incoming_bi.take(),
                state.incoming_uni.take(),
            )
        };
        // Queued streams hold handles back into this state, so they must be
        // released after the lock.
        drop(released);
        true
    }

    fn close_now(&self, code: u64, reason: &str) {
        if self.teardown(ChannelError::LocallyClosed { code }) {
            self.state().farewell = Some(MuxFrame::Close {
                code,
                reason: reason.to_string(),
            });
            self.shutdown.cancel();
        }
    }

    fn next_stream_id(&self, uni: bool) -> Result<u32, ChannelError> {
        let mut state = self.state();
        if let Some(reason) = &state.close {
            return Err(reason.clone());
        }
        let seq = match uni {
            true => &mut state.next_uni,
            false => &mut state.next_bi,
        };
        let id = stream_id(*seq, uni, self.role);
        *seq += 1;
        Ok(id)
    }

    async fn send_frame(&self, frame: MuxFrame) -> Result<(), ChannelError> {
        self.outbound.send(frame).await.map_err(|_| {
            self.close_reason()
                .unwrap_or_else(|| ChannelError::ConnectionLost(String::from("writer stopped")))
        })
    }
}

struct Acceptors {
    shared: Arc<Shared>,
    bi: tokio::sync::Mutex<mpsc::UnboundedReceiver<BiStreams>>,
    uni: tokio::sync::Mutex<mpsc::UnboundedReceiver<MuxRecvStream>>,
}

impl Drop for Acceptors {
    fn drop(&mut self) {
        // The last session handle is gone.
        self.shared.close_now(CLOSE_CODE_OK, "");
    }
}

/// Handle to one multiplexed session. Clones share the session.
#[derive(Clone)]
pub struct MuxSession {
    shared: Arc<Shared>,
    acceptors: Arc<Acceptors>,
}

impl MuxSession {
    /// Starts a session over `io`, spawning its reader and writer tasks onto
    /// the current tokio runtime.
    pub fn new<T>(io: T, role: Role, config: MuxConfig) -> MuxSession
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let (outbound, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let (bi_tx, bi_rx) = mpsc::unbounded_channel();
        let (uni_tx, uni_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            role,
            config,
            outbound,
            state: Mutex::new(State {
                streams: HashMap::new(),
                incoming_bi: Some(bi_tx),
                incoming_uni: Some(uni_tx),
                next_bi: 0,
                next_uni: 0,
                close: None,
                farewell: None,
            }),
            shutdown: CancellationToken::new(),
            writer_done: CancellationToken::new(),
        });

        tokio::spawn(run_reader(FrameReader::new(read_half), shared.clone()));
        tokio::spawn(run_writer(
            FrameWriter::new(write_half),
            outbound_rx,
            shared.clone(),
        ));

        MuxSession {
            shared: shared.clone(),
            acceptors: Arc::new(Acceptors {
                shared,
                bi: tokio::sync::Mutex::new(bi_rx),
                uni: tokio::sync::Mutex::new(uni_rx),
            }),
        }
    }

    pub fn client<T>(io: T, config: MuxConfig) -> MuxSession
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        MuxSession::new(io, Role::Client, config)
    }

    pub fn server<T>(io: T, config: MuxConfig) -> MuxSession
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        MuxSession::new(io, Role::Server, config)
    }

    fn closed_error(&self) -> ChannelError {
        self.shared
            .close_reason()
            .unwrap_or_else(|| ChannelError::ConnectionLost(String::from("session gone")))
    }
}

#[async_trait]
impl Session for MuxSession {
    type Send = MuxSendStream;
    type Recv = MuxRecvStream;

    async fn open_bi(&self) -> Result<(MuxSendStream, MuxRecvStream), ChannelError> {
        let stream_id = self.shared.next_stream_id(false)?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.state().streams.insert(stream_id, tx);

        self.shared.send_frame(MuxFrame::Open { stream_id }).await?;
        log::debug!("opened bidirectional stream {stream_id}");

        Ok((
            MuxSendStream::new(stream_id, self.shared.clone()),
            MuxRecvStream::new(stream_id, self.shared.clone(), rx),
        ))
    }

    async fn accept_bi(&self) -> Result<(MuxSendStream, MuxRecvStream), ChannelError> {
        let mut incoming = self.acceptors.bi.lock().await;
        incoming.recv().await.ok_or_else(|| self.closed_error())
    }

    async fn open_uni(&self) -> Result<MuxSendStream, ChannelError> {
        let stream_id = self.shared.next_stream_id(true)?;
        self.shared.send_frame(MuxFrame::Open { stream_id }).await?;
        log::trace!("opened unidirectional stream {stream_id}");
        Ok(MuxSendStream::new(stream_id, self.shared.clone()))
    }

    async fn accept_uni(&self) -> Result<MuxRecvStream, ChannelError> {
        let mut incoming = self.acceptors.uni.lock().await;
        incoming.recv().await.ok_or_else(|| self.closed_error())
    }

    async fn close(&self, code: u64, reason: &str) {
        self.shared.close_now(code, reason);
        // Give the writer a moment to put the close on the wire.
        let _ = tokio::time::timeout(CLOSE_LINGER, self.shared.writer_done.cancelled()).await;
    }

    fn close_reason(&self) -> Option<ChannelError> {
        self.shared.close_reason()
    }
}

async fn run_reader<R>(mut reader: FrameReader<R>, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    let idle_timeout = shared.config.idle_timeout;

    let reason = loop {
        let next = tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            next = read_next(&mut reader, idle_timeout) => next,
        };

        match next.and_then(|frame| dispatch(&shared, frame)) {
            Ok(()) => {}
            Err(reason) => break reason,
        }
    };

    shared.teardown(reason);
    shared.shutdown.cancel();
}

async fn read_next<R>(
    reader: &mut FrameReader<R>,
    idle_timeout: Option<Duration>,
) -> Result<MuxFrame, ChannelError>
where
    R: AsyncRead + Unpin,
{
    match idle_timeout {
        Some(limit) => match tokio::time::timeout(limit, reader.read_frame()).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ChannelError::IdleTimeout(limit)),
        },
        None => Ok(reader.read_frame().await?),
    }
}

/// Applies one inbound frame. An error tears the whole session down.
fn dispatch(shared: &Arc<Shared>, frame: MuxFrame) -> Result<(), ChannelError> {
    log::trace!("{:?} received {frame:?}", shared.role);

    match frame {
        MuxFrame::Open { stream_id } => accept_stream(shared, stream_id),
        MuxFrame::Data { stream_id, payload } => {
            let mut state = shared.state();
            let delivered = match state.streams.get(&stream_id) {
                Some(tx) => tx.send(Chunk::Data(payload)).is_ok(),
                None => true,
            };
            if !delivered {
                // Receiver dropped the stream; discard the rest of it.
                state.streams.remove(&stream_id);
            }
            Ok(())
        }
        MuxFrame::Fin { stream_id } => {
            if let Some(tx) = shared.state().streams.remove(&stream_id) {
                let _ = tx.send(Chunk::Fin);
            }
            Ok(())
        }
        MuxFrame::Reset { stream_id, code } => {
            if let Some(tx) = shared.state().streams.remove(&stream_id) {
                let _ = tx.send(Chunk::Reset(code));
            }
            Ok(())
        }
        MuxFrame::Close { code, reason } => Err(ChannelError::ApplicationClosed { code, reason }),
        MuxFrame::Ping => Ok(()),
    }
}

fn accept_stream(shared: &Arc<Shared>, stream_id: u32) -> Result<(), ChannelError> {
    if initiator(stream_id) == shared.role {
        return Err(ChannelError::Protocol(format!(
            "peer opened stream {stream_id} with our initiator bit"
        )));
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let (incoming_bi, incoming_uni) = {
        let mut state = shared.state();
        if state.close.is_some() {
            return Ok(());
        }
        if state.streams.insert(stream_id, tx).is_some() {
            return Err(ChannelError::Protocol(format!(
                "stream {stream_id} opened twice"
            )));
        }
        (state.incoming_bi.clone(), state.incoming_uni.clone())
    };

    // Streams are built outside the lock because dropping one locks it.
    let recv = MuxRecvStream::new(stream_id, shared.clone(), rx);
    if is_uni(stream_id) {
        if let Some(incoming) = incoming_uni {
            let _ = incoming.send(recv);
        }
    } else {
        let send = MuxSendStream::new(stream_id, shared.clone());
        if let Some(incoming) = incoming_bi {
            let _ = incoming.send((send, recv));
        }
    }
    Ok(())
}

async fn run_writer<W>(
    mut writer: FrameWriter<W>,
    mut outbound: mpsc::Receiver<MuxFrame>,
    shared: Arc<Shared>,
) where
    W: AsyncWrite + Unpin,
{
    let mut keep_alive = shared.config.keep_alive.map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });
    let mut wrote_since_tick = false;

    let result: Result<(), Error> = async {
        loop {
            let (frame, from_tick) = tokio::select! {
                biased;
                frame = outbound.recv() => match frame {
                    Some(frame) => (frame, false),
                    None => return Ok(()),
                },
                _ = tick(&mut keep_alive) => {
                    if std::mem::take(&mut wrote_since_tick) {
                        continue;
                    }
                    (MuxFrame::Ping, true)
                }
                _ = shared.shutdown.cancelled() => break,
            };

            // Batch whatever else is already queued into one flush.
            let mut next = Some(frame);
            while let Some(frame) = next {
                writer.write_frame(&frame).await?;
                next = outbound.try_recv().ok();
            }
            writer.flush().await?;
            wrote_since_tick |= !from_tick;
        }

        // Shutdown is only observed with the queue empty, so the close
        // follows every frame queued before it.
        let farewell = shared.state().farewell.take();
        if let Some(frame) = farewell {
            writer.write_frame(&frame).await?;
            writer.flush().await?;
        }
        Ok(())
    }
    .await;

    if let Err(e) = result {
        shared.teardown(ChannelError::from(e));
        shared.shutdown.cancel();
    }
    let _ = writer.shutdown().await;
    shared.writer_done.cancel();
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
