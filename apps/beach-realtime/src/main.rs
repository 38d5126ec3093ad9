mod cli;
mod telemetry;

use clap::Parser;
use tracing::error;

use crate::cli::Cli;
use crate::telemetry::init_tracing;

#[tokio::main]
async fn main() {
    // A missing .env is fine; the shell environment still applies.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(&cli.log_filter);

    if let Err(err) = cli::run(cli).await {
        error!(error = %err, "beach-realtime failed");
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
