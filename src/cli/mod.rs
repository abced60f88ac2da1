//! Command-line interface.

mod auth;
mod request;

pub use auth::run_auth;
pub use request::{execute_paged, execute_request, resolve_url};

use crate::context::AppContext;
use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use reqwest::Method;
use tokio::io::AsyncReadExt;

/// HTTP API CLI
#[derive(Debug, Parser)]
#[command(name = "api", version, about = "HTTP API CLI")]
pub struct Cli {
    /// API name for configuration
    #[arg(short = 'c', long = "config", global = true, value_name = "NAME")]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Make a GET request, relative to the API base URL
    Get(UrlArgs),
    /// GET a resource and the pages its Link headers point to, as a JSON array
    GetPaged(PagedArgs),
    /// Make a HEAD request, relative to the API base URL
    Head(UrlArgs),
    /// Make a DELETE request, relative to the API base URL
    Delete(UrlArgs),
    /// Make a POST request with stdin as the body, relative to the API base URL
    Post(UrlArgs),
    /// Make a PUT request with stdin as the body, relative to the API base URL
    Put(UrlArgs),
    /// Open the documentation web site
    Docs,
    /// Do OAuth authorization
    Auth(AuthArgs),
}

#[derive(Debug, Clone, Args)]
pub struct UrlArgs {
    pub url: String,
}

#[derive(Debug, Clone, Args)]
pub struct PagedArgs {
    /// Maximum number of pages to load, 0 for no limit
    #[arg(long, default_value_t = 5)]
    pub max: usize,

    pub url: String,
}

#[derive(Debug, Clone, Args)]
pub struct AuthArgs {
    /// Ignore existing credentials and start over
    #[arg(long)]
    pub reset: bool,

    /// Verification code, or the full redirect URL for OAuth 2.0
    pub code: Option<String>,
}

/// Runs one parsed command against the loaded context.
pub async fn run(ctx: &AppContext, command: Command) -> Result<()> {
    let mut stdout = std::io::stdout();
    match command {
        Command::Get(args) => execute_request(ctx, Method::GET, &args.url, None, &mut stdout).await,
        Command::GetPaged(args) => execute_paged(ctx, &args.url, args.max, &mut stdout).await,
        Command::Head(args) => execute_request(ctx, Method::HEAD, &args.url, None, &mut stdout).await,
        Command::Delete(args) => {
            execute_request(ctx, Method::DELETE, &args.url, None, &mut stdout).await
        }
        Command::Post(args) => {
            let body = read_stdin().await?;
            execute_request(ctx, Method::POST, &args.url, Some(body), &mut stdout).await
        }
        Command::Put(args) => {
            let body = read_stdin().await?;
            execute_request(ctx, Method::PUT, &args.url, Some(body), &mut stdout).await
        }
        Command::Docs => {
            if ctx.config.docs_url.is_empty() {
                println!("no docs defined");
            } else {
                launch_browser(&ctx.config.docs_url);
            }
            Ok(())
        }
        Command::Auth(args) => run_auth(ctx, args.reset, args.code.as_deref(), &mut stdout).await,
    }
}

async fn read_stdin() -> Result<Vec<u8>> {
    use anyhow::Context;
    let mut body = Vec::new();
    tokio::io::stdin()
        .read_to_end(&mut body)
        .await
        .context("Failed to read request body from stdin")?;
    Ok(body)
}

/// Opens `url` in the user's browser. Failure is not fatal: the URL has
/// already been printed.
pub(crate) fn launch_browser(url: &str) {
    if let Err(e) = open::that(url) {
        tracing::warn!(error = %e, "Could not open a browser");
    }
}
