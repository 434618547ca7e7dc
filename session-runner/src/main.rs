use clap::Parser;
use session_runner::{cli::Cli, run, telemetry::setup_telemetry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_telemetry();
    let cli = Cli::parse();
    run(cli).await?;
    Ok(())
}
