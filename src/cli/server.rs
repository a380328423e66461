use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::args::ServerArgs;
use crate::bench::ServerConfig;
use crate::bench::server::serve_session;
use crate::net::mux::{MuxConfig, MuxSession};

pub async fn run(args: ServerArgs) -> anyhow::Result<()> {
    log::info!("Running in server mode");

    let config = Arc::new(args.bench_config()?);
    let mux_config = args.session.mux_config()?;

    let listener = TcpListener::bind(args.addr)
        .await
        .with_context(|| format!("binding to {}", args.addr))?;
    log::info!(
        "RTC Server listening on {} in {} mode",
        listener.local_addr()?,
        config.mode
    );

    let cancel = CancellationToken::new();
    let mut sessions = JoinSet::new();
    let mut accepted = 0u64;

    // Main loop waiting for client sessions.
    loop {
        if args.max_sessions.is_some_and(|max| accepted >= max) {
            log::info!("Served {accepted} sessions, no longer accepting");
            break;
        }

        let (stream, peer) = tokio::select! {
            _ = super::interrupted() => {
                log::info!("Interrupted, stopping sessions");
                cancel.cancel();
                break;
            }
            accept = listener.accept() => match accept {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!("Failed to accept a connection: {e}");
                    continue;
                }
            },
        };
        accepted += 1;
        log::debug!("Accepted new stream from peer {peer}");

        sessions.spawn(run_session(
            stream,
            peer,
            config.clone(),
            mux_config.clone(),
            cancel.child_token(),
        ));

        // Reap sessions that already ended.
        while sessions.try_join_next().is_some() {}
    }

    while sessions.join_next().await.is_some() {}
    Ok(())
}

async fn run_session(
    stream: TcpStream,
    peer: SocketAddr,
    config: Arc<ServerConfig>,
    mux_config: MuxConfig,
    cancel: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        log::debug!("Unable to disable Nagle for {peer}: {e}");
    }
    let session = MuxSession::server(stream, mux_config);

    match serve_session(session, &config, cancel).await {
        Ok(report) => log::info!(
            "Session with {peer} done: {} frames sent, {} not sent, {} failed",
            report.summary.completed,
            report.summary.benign,
            report.summary.failed
        ),
        Err(e) => log::warn!("Session with {peer} failed: {e:#}"),
    }
}
