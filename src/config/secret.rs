//! Secret placeholders in configuration values.
//!
//! - `op://vault/item/field` is read through the 1Password CLI (`op read`)
//! - `env:NAME` is read from the environment
//! - anything else is taken literally

use anyhow::{anyhow, bail, Context, Result};
use std::collections::BTreeMap;
use std::process::Command;

const OP_PREFIX: &str = "op://";
const ENV_PREFIX: &str = "env:";

/// Resolves one configuration value.
pub fn resolve(value: &str) -> Result<String> {
    if value.starts_with(OP_PREFIX) {
        read_op_secret(value)
    } else if let Some(name) = value.strip_prefix(ENV_PREFIX) {
        std::env::var(name).map_err(|_| anyhow!("environment variable {} is not set", name))
    } else {
        Ok(value.to_string())
    }
}

/// Resolves a value, naming `field` in the error.
pub fn resolve_field(field: &str, value: &str) -> Result<String> {
    resolve(value).with_context(|| format!("{}: failed to resolve secret", field))
}

/// Resolves every value of a map, naming `field.key` in the error.
pub fn resolve_map(field: &str, map: &BTreeMap<String, String>) -> Result<BTreeMap<String, String>> {
    map.iter()
        .map(|(k, v)| Ok((k.clone(), resolve_field(&format!("{}.{}", field, k), v)?)))
        .collect()
}

/// Resolves every element of a list.
pub fn resolve_list(field: &str, list: &[String]) -> Result<Vec<String>> {
    list.iter()
        .enumerate()
        .map(|(i, v)| resolve_field(&format!("{}[{}]", field, i), v))
        .collect()
}

fn read_op_secret(reference: &str) -> Result<String> {
    tracing::debug!("Reading secret from 1Password CLI");
    let output = Command::new("op")
        .args(["read", reference])
        .output()
        .context("Failed to run `op read` (is the 1Password CLI installed?)")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("`op read` failed ({}): {}", output.status, stderr.trim());
    }

    let secret = String::from_utf8(output.stdout).context("`op read` returned non-UTF-8 output")?;
    Ok(secret.trim_end_matches(['\r', '\n']).to_string())
}
