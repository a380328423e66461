use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use rand::RngCore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::bench::command::{self, CommandError};
use crate::bench::schedule::FrameScheduler;
use crate::bench::sender::FrameSender;
use crate::bench::stats::{Baseline, Direction, FrameCompletion, ThroughputAccumulator};
use crate::bench::{DeliveryMode, Frame, Outcome, ServerConfig, SessionReport, TransferSummary};
use crate::net::{ChannelError, SendChannel, Session};

/// Serves one client session: reads its request, paces out the frames and
/// prints the send report.
///
/// A bad request resets the control channel with the bad-request code and is
/// returned as an error; no frame is sent for it.
pub async fn serve_session<S: Session>(
    session: S,
    config: &ServerConfig,
    cancel: CancellationToken,
) -> anyhow::Result<SessionReport> {
    let (mut control_send, mut control_recv) = tokio::select! {
        _ = cancel.cancelled() => anyhow::bail!("cancelled while waiting for the control channel"),
        accepted = session.accept_bi() => accepted.context("waiting for the control channel")?,
    };

    let request = match command::read_command(&mut control_recv).await {
        Ok(request) => request,
        Err(CommandError::Protocol(e)) => {
            log::warn!("Rejecting request: {e}");
            control_send
                .reset(e.code())
                .await
                .context("resetting the control channel")?;
            return Err(e).context("client sent a bad request");
        }
        Err(CommandError::Channel(e)) => {
            return Err(e).context("reading the request");
        }
    };

    let frame_count = request.frame_count();
    log::info!(
        "RTC Server GetN request: {frame_count} frames, each is {} B",
        config.frame_size
    );

    let stats = Arc::new(ThroughputAccumulator::new(config.report_interval));
    let baseline = Baseline::now();
    let payload = random_payload(config.frame_size);
    let mut schedule = FrameScheduler::new(frame_count, config.frame_interval);

    let summary = match config.mode {
        DeliveryMode::PerFrameChannel => {
            let sender = FrameSender::new(
                session.clone(),
                stats.clone(),
                baseline,
                config.frame_timeout,
            );
            let summary = send_per_frame(&session, &sender, &mut schedule, payload, &cancel).await;
            finish_control(&mut control_send).await;
            summary
        }
        DeliveryMode::SharedChannel => {
            let summary = send_shared(
                &mut control_send,
                &mut schedule,
                payload,
                &stats,
                &baseline,
                config,
                &cancel,
            )
            .await;
            if summary.failed == 0 {
                finish_control(&mut control_send).await;
            }
            summary
        }
    };

    let totals = stats.final_report(Direction::Sent);
    println!("{totals}");
    log::debug!("session summary: {summary:?}");
    Ok(SessionReport { summary, totals })
}

fn random_payload(len: usize) -> Bytes {
    let mut payload = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut payload);
    Bytes::from(payload)
}

/// Paces frames out, one sender task per frame, then waits for every task.
async fn send_per_frame<S: Session>(
    session: &S,
    sender: &FrameSender<S>,
    schedule: &mut FrameScheduler,
    payload: Bytes,
    cancel: &CancellationToken,
) -> TransferSummary {
    let mut units = JoinSet::new();
    let mut summary = TransferSummary::default();
    let mut closed = None;

    loop {
        let index = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = schedule.next() => match next {
                Some(index) => index,
                None => break,
            },
        };

        if let Some(reason) = session.close_reason() {
            log::debug!("session closed before frame {index}: {reason}");
            closed = Some(reason);
            break;
        }

        let sender = sender.clone();
        let frame = Frame {
            index,
            payload: payload.clone(),
        };
        units.spawn(async move { sender.send(frame).await });
    }

    // Frames that were never dispatched end the way the session did.
    let mut undispatched = schedule.remaining();
    let outcome = match closed {
        Some(reason) => {
            undispatched = undispatched.saturating_add(1);
            Outcome::from(reason)
        }
        None => Outcome::BenignClose,
    };
    summary.tally_many(&outcome, undispatched);

    while let Some(joined) = units.join_next().await {
        match joined {
            Ok(outcome) => summary.tally(&outcome),
            Err(e) => {
                log::warn!("sender unit did not finish: {e}");
                summary.failed += 1;
            }
        }
    }
    summary
}

/// Writes every frame back-to-back on the control channel.
async fn send_shared<W: SendChannel>(
    control_send: &mut W,
    schedule: &mut FrameScheduler,
    payload: Bytes,
    stats: &ThroughputAccumulator,
    baseline: &Baseline,
    config: &ServerConfig,
    cancel: &CancellationToken,
) -> TransferSummary {
    let mut summary = TransferSummary::default();

    loop {
        let index = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = schedule.next() => match next {
                Some(index) => index,
                None => break,
            },
        };

        let write = control_send.write_all(&payload);
        let result = match config.frame_timeout {
            Some(limit) => match tokio::time::timeout(limit, write).await {
                Ok(result) => result,
                Err(_) => Err(ChannelError::ConnectionLost(format!(
                    "frame write timed out after {limit:?}"
                ))),
            },
            None => write.await,
        };

        match result {
            Ok(()) => {
                if let Some(report) = stats.record(payload.len()) {
                    println!("{report}");
                }
                stats.complete_frame();
                println!("{}", FrameCompletion::since(index, baseline));
                summary.completed += 1;
            }
            Err(e) => {
                let outcome = Outcome::from(e);
                if let Outcome::TransferError(reason) = &outcome {
                    log::warn!(
                        "frame {index}: shared channel failed at {:.6}: {reason}",
                        baseline.elapsed_secs()
                    );
                }
                summary.tally(&outcome);
                break;
            }
        }
    }

    summary.tally_many(&Outcome::BenignClose, schedule.remaining());
    summary
}

async fn finish_control<W: SendChannel>(control_send: &mut W) {
    match control_send.finish().await {
        Ok(()) => {}
        Err(e) if e.is_benign_close() => {}
        Err(e) => log::warn!("finishing the control channel: {e}"),
    }
}
