use args::CliArgs;
use env_logger::{Builder, Target};

mod args;
mod client;
mod server;

pub async fn run() -> anyhow::Result<()> {
    let args = args::parse_cli_args();
    setup_logging(&args);

    log::debug!("rtcbench {} starting", env!("CARGO_PKG_VERSION"));

    let result = match args.command {
        args::Command::Server(args) => server::run(args).await,
        args::Command::Client(args) => client::run(args).await,
    };

    match &result {
        Ok(()) => log::info!("Benchmark finished"),
        Err(e) => log::error!("{}", failure_report(e)),
    }

    result
}

/// One line naming the failure and, when it differs, its root cause.
fn failure_report(e: &anyhow::Error) -> String {
    let root = e.root_cause().to_string();
    match root == e.to_string() {
        true => format!("Benchmark failed: {e}"),
        false => format!("Benchmark failed: {e} (root cause: {root})"),
    }
}

fn setup_logging(args: &CliArgs) {
    // Set up logger.
    let mut logger = Builder::new();

    if let Some(filters) = &args.log_filter {
        // Configure with the RUST_LOG directives string from the cli arg.
        logger.parse_filters(filters.as_str())
    } else {
        // Configure just the log level.
        logger.filter_level(args.log_level.into())
    };

    // Log to stderr; stdout carries the measurement lines.
    logger.target(Target::Stderr).init();
}

/// Resolves on Ctrl-C. Never resolves if the handler cannot be installed.
async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::warn!("Unable to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
}
