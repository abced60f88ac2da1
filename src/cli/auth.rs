//! The `auth` subcommand: interactive OAuth logins.

use super::launch_browser;
use crate::auth::oauth2::{AuthorizationResponse, GrantType};
use crate::auth::{AuthError, OAuth1Client, OAuth2Client};
use crate::context::AppContext;
use anyhow::{bail, Result};
use std::io::Write;

/// Runs the login flow of the configured OAuth scheme.
///
/// Without `code` a new authorization is started and its URL printed; with
/// `code` the pending authorization is completed.
pub async fn run_auth<W: Write>(
    ctx: &AppContext,
    reset: bool,
    code: Option<&str>,
    out: &mut W,
) -> Result<()> {
    match ctx.config.auth.as_str() {
        "oauth1" => oauth1(ctx, reset, code, out).await,
        "oauth2" => oauth2(ctx, reset, code, out).await,
        "" => Err(AuthError::Config("no auth scheme configured".to_string()).into()),
        other => Err(AuthError::Config(format!(
            "auth command is not available for {} authorization",
            other
        ))
        .into()),
    }
}

async fn oauth1<W: Write>(ctx: &AppContext, reset: bool, code: Option<&str>, out: &mut W) -> Result<()> {
    let config = ctx
        .config
        .oauth1
        .as_ref()
        .ok_or_else(|| AuthError::Config("oauth1 not configured".to_string()))?;
    let command = ctx.command_name();
    let mut client = OAuth1Client::new(config, ctx.state.clone(), ctx.http.clone(), &command)?;

    if reset {
        client.reset_auth()?;
    }
    if client.is_logged_in() {
        writeln!(out, "access token is current")?;
        return Ok(());
    }

    match code {
        None => {
            let url = client.request_access().await?;
            writeln!(out, "URL: {}", url)?;
            writeln!(out, "verify access with {} auth CODE", command)?;
            launch_browser(&url);
        }
        Some(code) => {
            client.verify_access(code).await?;
            writeln!(out, "success")?;
        }
    }
    Ok(())
}

async fn oauth2<W: Write>(ctx: &AppContext, reset: bool, code: Option<&str>, out: &mut W) -> Result<()> {
    let config = ctx
        .config
        .oauth2
        .as_ref()
        .ok_or_else(|| AuthError::Config("oauth2 not configured".to_string()))?;
    let command = ctx.command_name();
    let mut client = OAuth2Client::new(config, ctx.state.clone(), ctx.http.clone(), &command)?;

    if reset {
        client.reset_auth()?;
    }
    if client.has_current_token().await {
        writeln!(out, "access token is current")?;
        return Ok(());
    }

    match client.grant_type() {
        GrantType::AuthorizationCode => match code {
            None => {
                let url = client.auth_code_url()?;
                writeln!(out, "URL: {}", url)?;
                writeln!(out, "verify access with {} auth CODE", command)?;
                launch_browser(&url);
            }
            Some(arg) => {
                let response = AuthorizationResponse::parse(arg)?;
                if let Some(state) = &response.state {
                    if state != client.expected_state() {
                        bail!("state mismatch in redirect URL: got {}", state);
                    }
                }
                if let Some(scopes) = &response.scopes {
                    writeln!(out, "Scopes: {}", scopes)?;
                }
                client.exchange_code(&response.code).await?;
                writeln!(out, "success")?;
            }
        },
        GrantType::ClientCredentials => {
            client.login_client_credentials().await?;
            writeln!(out, "success")?;
        }
        GrantType::PasswordCredentials => {
            client.login_password().await?;
            writeln!(out, "success")?;
        }
    }
    Ok(())
}
