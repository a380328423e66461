use anyhow::Context;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use super::args::ClientArgs;
use crate::bench::client::run_session;
use crate::net::mux::MuxSession;

pub async fn run(args: ClientArgs) -> anyhow::Result<()> {
    log::info!("Running in client mode");

    let config = args.bench_config()?;
    let mux_config = args.session.mux_config()?;

    let stream = TcpStream::connect(args.addr)
        .await
        .with_context(|| format!("connecting to {}", args.addr))?;
    stream.set_nodelay(true)?;
    log::info!("Connected to {} in {} mode", args.addr, config.mode);

    let session = MuxSession::client(stream, mux_config);

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    let watcher = tokio::spawn(async move {
        super::interrupted().await;
        log::info!("Interrupted, reporting what arrived so far");
        interrupt.cancel();
    });

    let result = run_session(session, &config, cancel).await;
    watcher.abort();

    let report = result?;
    log::info!(
        "Collected {} of {} frames ({} units ended early, {} failed)",
        report.totals.frames,
        config.frame_count,
        report.summary.benign,
        report.summary.failed
    );
    if report.summary.units() != config.frame_count {
        log::warn!(
            "Accounted for {} units, expected {}",
            report.summary.units(),
            config.frame_count
        );
    }
    Ok(())
}
