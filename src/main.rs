use anyhow::Result;
use api_cli::{cli, context::AppContext};
use clap::Parser;
use tracing::debug;

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout carries only response bodies
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "api_cli=warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Cli::parse();
    debug!(config = ?args.config, "Starting");

    let ctx = AppContext::load(args.config)?;
    cli::run(&ctx, args.command).await
}
