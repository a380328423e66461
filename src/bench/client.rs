use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use crate::bench::collector::FrameCollector;
use crate::bench::command::{self, BAD_REQUEST_CODE};
use crate::bench::stats::{Baseline, Direction, ThroughputAccumulator};
use crate::bench::{ClientConfig, DeliveryMode, Outcome, SessionReport};
use crate::net::{CLOSE_CODE_OK, ChannelError, RecvChannel, SendChannel, Session};

/// Requests `config.frame_count` frames, collects them and prints the
/// receive report. Closes the session with code 0 when done.
pub async fn run_session<S: Session>(
    session: S,
    config: &ClientConfig,
    cancel: CancellationToken,
) -> anyhow::Result<SessionReport> {
    let (mut control_send, mut control_recv) = session
        .open_bi()
        .await
        .context("opening the control channel")?;

    let frame_count = config.frame_count;
    log::info!(
        "GetN request: {frame_count} frames ({} seconds)",
        frame_count / 30
    );
    control_send
        .write_all(&command::encode(frame_count))
        .await
        .context("sending the request")?;
    control_send.finish().await.context("sending the request")?;

    // Goodput is measured from the moment the request is out.
    let stats = Arc::new(ThroughputAccumulator::new(config.report_interval));
    let baseline = config.baseline.unwrap_or_else(Baseline::now);
    let units_cancel = cancel.child_token();
    let collector = FrameCollector::new(
        session.clone(),
        stats.clone(),
        baseline,
        config.frame_timeout,
        units_cancel.clone(),
    )
    .expecting_frames_of(config.frame_size);

    let (summary, control) = match config.mode {
        DeliveryMode::PerFrameChannel => {
            let watch = async {
                let outcome = tokio::select! {
                    _ = units_cancel.cancelled() => Outcome::BenignClose,
                    outcome = watch_control(&mut control_recv) => outcome,
                };
                if !matches!(outcome, Outcome::Success | Outcome::BenignClose) {
                    // Nothing more will arrive for this request.
                    units_cancel.cancel();
                }
                outcome
            };
            tokio::join!(collector.collect(frame_count), watch)
        }
        DeliveryMode::SharedChannel => {
            match collector
                .collect_shared(&mut control_recv, frame_count, config.frame_size)
                .await
            {
                Ok(summary) => (summary, Outcome::Success),
                Err(e) => (Default::default(), control_outcome(e)),
            }
        }
    };

    match control {
        Outcome::ProtocolError(reason) => anyhow::bail!("server rejected the request: {reason}"),
        Outcome::TransferError(reason) => log::warn!("control channel failed: {reason}"),
        Outcome::Success | Outcome::BenignClose => {}
    }

    let totals = stats.final_report(Direction::Recv);
    println!("{totals}");
    log::debug!("session summary: {summary:?}");

    session.close(CLOSE_CODE_OK, "").await;
    Ok(SessionReport { summary, totals })
}

/// Waits for the server to end the control channel. Nothing is expected on
/// it in per-frame mode.
async fn watch_control<R: RecvChannel>(control_recv: &mut R) -> Outcome {
    let mut unexpected = 0usize;
    match control_recv
        .read_to_end_counting(&mut |n: usize| unexpected += n)
        .await
    {
        Ok(_) => {
            if unexpected > 0 {
                log::debug!("ignored {unexpected} bytes on the control channel");
            }
            Outcome::Success
        }
        Err(e) => control_outcome(e),
    }
}

fn control_outcome(e: ChannelError) -> Outcome {
    match e {
        ChannelError::Reset {
            code: BAD_REQUEST_CODE,
        } => Outcome::ProtocolError(format!("control channel reset with code {BAD_REQUEST_CODE}")),
        e => Outcome::from(e),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::bench::command::{ProtocolError, read_command};
    use crate::bench::sender::FrameSender;
    use crate::bench::server::serve_session;
    use crate::bench::{Frame, ServerConfig, TransferSummary};
    use crate::common::mock;
    use crate::net::mux::MuxConfig;

    fn server_config(frame_size: usize, mode: DeliveryMode) -> ServerConfig {
        ServerConfig {
            frame_size,
            frame_interval: Duration::from_millis(10),
            mode,
            ..ServerConfig::default()
        }
    }

    fn client_config(frame_count: u64, frame_size: usize, mode: DeliveryMode) -> ClientConfig {
        ClientConfig {
            frame_count,
            frame_size,
            mode,
            ..ClientConfig::default()
        }
    }

    async fn run_pair(
        mux: MuxConfig,
        server: ServerConfig,
        client: ClientConfig,
    ) -> (SessionReport, SessionReport) {
        let (client_session, server_session) = mock::session_pair(mux);

        let serve = tokio::spawn(async move {
            serve_session(server_session, &server, CancellationToken::new()).await
        });
        let received = run_session(client_session, &client, CancellationToken::new())
            .await
            .unwrap();
        let sent = serve.await.unwrap().unwrap();
        (sent, received)
    }

    #[tokio::test]
    async fn three_frames_of_one_hundred_bytes() {
        let (sent, received) = run_pair(
            MuxConfig::default(),
            server_config(100, DeliveryMode::PerFrameChannel),
            client_config(3, 100, DeliveryMode::PerFrameChannel),
        )
        .await;

        assert_eq!(received.summary.completed, 3);
        assert_eq!(received.summary.units(), 3);
        assert_eq!(received.totals.total_bytes, 300);
        assert_eq!(received.totals.frames, 3);

        assert_eq!(sent.summary.completed, 3);
        assert_eq!(sent.totals.total_bytes, 300);
    }

    #[tokio::test]
    async fn frames_larger_than_a_chunk_are_written_in_pieces() {
        let mux = MuxConfig {
            max_chunk: 4096,
            ..MuxConfig::default()
        };
        let (_, received) = run_pair(
            mux,
            server_config(100_000, DeliveryMode::PerFrameChannel),
            client_config(4, 100_000, DeliveryMode::PerFrameChannel),
        )
        .await;

        assert_eq!(received.summary.completed, 4);
        assert_eq!(received.totals.total_bytes, 400_000);
    }

    #[tokio::test]
    async fn zero_frames_report_zero_bytes() {
        let (sent, received) = run_pair(
            MuxConfig::default(),
            server_config(100, DeliveryMode::PerFrameChannel),
            client_config(0, 100, DeliveryMode::PerFrameChannel),
        )
        .await;

        assert_eq!(received.summary, TransferSummary::default());
        assert_eq!(received.totals.total_bytes, 0);
        assert!(received.totals.to_string().starts_with("Recv 0.00 MB in "));
        assert_eq!(sent.totals.frames, 0);
    }

    #[tokio::test]
    async fn shared_channel_delivers_every_frame() {
        let (sent, received) = run_pair(
            MuxConfig::default(),
            server_config(1000, DeliveryMode::SharedChannel),
            client_config(4, 1000, DeliveryMode::SharedChannel),
        )
        .await;

        assert_eq!(received.summary.completed, 4);
        assert_eq!(received.totals.total_bytes, 4000);
        assert_eq!(sent.summary.completed, 4);
    }

    #[tokio::test]
    async fn bad_requests_are_reset_without_frames() {
        for line in [&b"GETN -5\r\n"[..], &b"GETN abc\r\n"[..], &b"GET /\r\n"[..]] {
            let (client, server) = mock::session_pair(MuxConfig::default());
            let serve = tokio::spawn(async move {
                serve_session(server, &ServerConfig::default(), CancellationToken::new()).await
            });

            let (mut send, mut recv) = client.open_bi().await.unwrap();
            send.write_all(line).await.unwrap();
            send.finish().await.unwrap();

            let err = recv.read_to_end_counting(&mut |_: usize| {}).await.unwrap_err();
            assert_eq!(err, ChannelError::Reset { code: 42 });

            let err = serve.await.unwrap().unwrap_err();
            assert!(err.downcast_ref::<ProtocolError>().is_some(), "{err:#}");

            // The server is gone, and it never opened a frame channel.
            let err = client.accept_uni().await.unwrap_err();
            assert!(err.is_benign_close(), "{err}");
        }
    }

    #[tokio::test]
    async fn largest_request_cancelled_mid_run_accounts_every_frame() {
        let (client, server) = mock::session_pair(MuxConfig::default());
        let cancel = CancellationToken::new();
        let serve = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                serve_session(server, &server_config(10, DeliveryMode::PerFrameChannel), cancel)
                    .await
            }
        });

        let (mut send, _recv) = client.open_bi().await.unwrap();
        send.write_all(&command::encode(u64::MAX)).await.unwrap();
        send.finish().await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let sent = serve.await.unwrap().unwrap();
        assert!(sent.summary.completed > 0);
        assert_eq!(sent.summary.failed, 0);
        assert_eq!(sent.summary.units(), u64::MAX);
    }

    #[tokio::test]
    async fn rejected_request_fails_the_client() {
        let (client, server) = mock::session_pair(MuxConfig::default());
        let reject = tokio::spawn(async move {
            let (mut send, mut recv) = server.accept_bi().await.unwrap();
            read_command(&mut recv).await.unwrap();
            send.reset(BAD_REQUEST_CODE).await.unwrap();
            server
        });

        let err = run_session(
            client,
            &client_config(5, 100, DeliveryMode::PerFrameChannel),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("rejected"), "{err:#}");
        let _server = reject.await.unwrap();
    }

    #[tokio::test]
    async fn early_close_leaves_only_delivered_frames() {
        let (client, server) = mock::session_pair(MuxConfig::default());

        // Sends 2 of the 5 requested frames, then ends the session normally.
        let partial = tokio::spawn(async move {
            let (_send, mut recv) = server.accept_bi().await.unwrap();
            assert_eq!(read_command(&mut recv).await.unwrap().frame_count(), 5);

            let stats = Arc::new(ThroughputAccumulator::new(Duration::from_secs(1)));
            let sender = FrameSender::new(server.clone(), stats, Baseline::now(), None);
            for index in 1..=2 {
                let frame = Frame {
                    index,
                    payload: mock::payload(100),
                };
                assert_eq!(sender.send(frame).await, Outcome::Success);
            }
            server.close(CLOSE_CODE_OK, "").await;
        });

        let received = run_session(
            client,
            &client_config(5, 100, DeliveryMode::PerFrameChannel),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        partial.await.unwrap();

        assert_eq!(
            received.summary,
            TransferSummary {
                completed: 2,
                benign: 3,
                failed: 0
            }
        );
        assert_eq!(received.totals.total_bytes, 200);
    }

    #[tokio::test]
    async fn cancelled_client_still_reports() {
        let (client, server) = mock::session_pair(MuxConfig::default());
        // Reads the request and then sends nothing.
        let stall = tokio::spawn(async move {
            let (send, mut recv) = server.accept_bi().await.unwrap();
            read_command(&mut recv).await.unwrap();
            (server, send)
        });

        let cancel = CancellationToken::new();
        let interrupt = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            interrupt.cancel();
        });

        let received = run_session(
            client,
            &client_config(3, 100, DeliveryMode::PerFrameChannel),
            cancel,
        )
        .await
        .unwrap();
        assert_eq!(received.summary.benign, 3);
        assert_eq!(received.totals.total_bytes, 0);
        drop(stall.await.unwrap());
    }
}
