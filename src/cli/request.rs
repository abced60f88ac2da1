use crate::auth::Authenticator;
use crate::context::AppContext;
use anyhow::{bail, Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE, LINK};
use reqwest::{Method, Request, Response};
use std::io::Write;
use url::Url;

/// Resolves `target` against `base_url` (RFC 3986 reference resolution).
/// Without a base URL the target must be absolute.
pub fn resolve_url(base_url: &str, target: &str) -> Result<Url> {
    if base_url.is_empty() {
        return Url::parse(target).with_context(|| format!("invalid URL: {}", target));
    }
    let base = Url::parse(base_url).with_context(|| format!("invalid base_url: {}", base_url))?;
    base.join(target)
        .with_context(|| format!("invalid URL: {}", target))
}

/// Sends one request through the configured authenticator and copies a
/// successful response body to `out`.
///
/// A non-2xx response is dumped to stderr and turned into an error.
pub async fn execute_request<W: Write>(
    ctx: &AppContext,
    method: Method,
    target: &str,
    body: Option<Vec<u8>>,
    out: &mut W,
) -> Result<()> {
    let url = resolve_url(&ctx.config.base_url, target)?;
    let authenticator = ctx.authenticator()?;
    let response = send_checked(ctx, authenticator.as_ref(), method, url, body).await?;
    copy_body(response, out).await?;
    out.flush().context("Failed to write response body")?;
    Ok(())
}

/// Follows `Link: <...>; rel="next"` headers from `target`, writing the
/// pages to `out` as one JSON array.
///
/// # Arguments
/// * `target` - First page, relative to the base URL
/// * `max_pages` - Page limit; 0 loads every page
/// * `out` - Receives `[page1,page2,...]` followed by a newline
///
/// Every page goes through the same authenticator, so an OAuth 2.0 token
/// that expires mid-walk is refreshed once and reused for the rest.
pub async fn execute_paged<W: Write>(
    ctx: &AppContext,
    target: &str,
    max_pages: usize,
    out: &mut W,
) -> Result<()> {
    let authenticator = ctx.authenticator()?;
    let mut next = Some(resolve_url(&ctx.config.base_url, target)?);
    let mut pages = 0;
    let mut separator: &[u8] = b"[";

    while let Some(url) = next.take() {
        if max_pages > 0 && pages >= max_pages {
            break;
        }
        out.write_all(separator).context("Failed to write response body")?;
        separator = b",";

        let response = send_checked(ctx, authenticator.as_ref(), Method::GET, url.clone(), None).await?;
        next = next_link(response.headers())
            .map(|link| url.join(&link).with_context(|| format!("invalid next link: {}", link)))
            .transpose()?;
        copy_body(response, out).await?;
        pages += 1;
        tracing::debug!(pages, has_next = next.is_some(), "Fetched page");
    }

    out.write_all(b"]\n").context("Failed to write response body")?;
    out.flush().context("Failed to write response body")?;
    Ok(())
}

async fn send_checked(
    ctx: &AppContext,
    authenticator: &dyn Authenticator,
    method: Method,
    url: Url,
    body: Option<Vec<u8>>,
) -> Result<Response> {
    let mut request = Request::new(method, url);

    let content_type = &ctx.config.default_content_type;
    if !content_type.is_empty() {
        let value = HeaderValue::from_str(content_type)
            .with_context(|| format!("invalid default_content_type: {}", content_type))?;
        request.headers_mut().insert(ACCEPT, value.clone());
        if body.is_some() {
            request.headers_mut().insert(CONTENT_TYPE, value);
        }
    }
    if let Some(body) = body {
        *request.body_mut() = Some(body.into());
    }

    tracing::debug!(method = %request.method(), url = %crate::auth::redact_query(request.url()), "Sending request");
    let response = authenticator.execute(request).await?;

    let status = response.status();
    if !status.is_success() {
        let dump = dump_response(response).await?;
        std::io::stderr().write_all(&dump).ok();
        bail!("HTTP error {}", status);
    }
    Ok(response)
}

async fn copy_body<W: Write>(mut response: Response, out: &mut W) -> Result<()> {
    while let Some(chunk) = response.chunk().await.context("Failed to read response body")? {
        out.write_all(&chunk).context("Failed to write response body")?;
    }
    Ok(())
}

/// Target of the first `rel="next"` entry across all `Link` headers.
fn next_link(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(LINK)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(next_in_link_value)
        .map(str::to_string)
}

fn next_in_link_value(value: &str) -> Option<&str> {
    let mut rest = value;
    while let Some(start) = rest.find('<') {
        let end = start + rest[start..].find('>')?;
        let target = &rest[start + 1..end];
        let params_end = rest[end..].find('<').map_or(rest.len(), |i| end + i);
        if rest[end + 1..params_end].split(';').any(is_next_rel) {
            return Some(target);
        }
        rest = &rest[params_end..];
    }
    None
}

fn is_next_rel(param: &str) -> bool {
    match param.split_once('=') {
        Some((key, value)) if key.trim().eq_ignore_ascii_case("rel") => value
            .trim()
            .trim_end_matches(',')
            .trim()
            .trim_matches('"')
            .split_whitespace()
            .any(|rel| rel.eq_ignore_ascii_case("next")),
        _ => false,
    }
}

/// Status line, headers and body in wire-like form.
async fn dump_response(response: Response) -> Result<Vec<u8>> {
    let mut dump = format!("{:?} {}\r\n", response.version(), response.status()).into_bytes();
    for (name, value) in response.headers() {
        dump.extend_from_slice(name.as_str().as_bytes());
        dump.extend_from_slice(b": ");
        dump.extend_from_slice(value.as_bytes());
        dump.extend_from_slice(b"\r\n");
    }
    dump.extend_from_slice(b"\r\n");
    let body = response.bytes().await.context("Failed to read error response body")?;
    dump.extend_from_slice(&body);
    Ok(dump)
}
