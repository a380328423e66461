mod bench;
mod cli;
mod common;
mod net;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::run().await
}
