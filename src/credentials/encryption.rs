//! AES-256-GCM encryption for stored credential values.
//!
//! Encryption is opt-in: when `API_CLI_ENCRYPTION_KEY` holds a base64-encoded
//! 32-byte key, every value is encrypted with its own nonce before it reaches
//! disk.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

/// Environment variable holding the base64-encoded master key.
pub const ENCRYPTION_KEY_ENV: &str = "API_CLI_ENCRYPTION_KEY";

const KEY_SIZE: usize = 32;

const NONCE_SIZE: usize = 12;

/// Decodes a base64 master key and checks it is 32 bytes.
pub(crate) fn validate_key(key_base64: &str) -> Result<Vec<u8>> {
    let key_bytes = BASE64
        .decode(key_base64.trim())
        .context("Failed to decode base64 encryption key")?;

    if key_bytes.len() != KEY_SIZE {
        return Err(anyhow!(
            "Encryption key must be {} bytes (256 bits), got {} bytes",
            KEY_SIZE,
            key_bytes.len()
        ));
    }

    Ok(key_bytes)
}

/// Reads and validates the master key from [`ENCRYPTION_KEY_ENV`].
///
/// Returns `Ok(None)` when the variable is unset or empty.
pub fn key_from_env() -> Result<Option<Vec<u8>>> {
    match std::env::var(ENCRYPTION_KEY_ENV) {
        Ok(v) if !v.trim().is_empty() => validate_key(&v)
            .with_context(|| format!("Invalid {}", ENCRYPTION_KEY_ENV))
            .map(Some),
        _ => Ok(None),
    }
}

/// Encrypts `plaintext`, returning `(ciphertext, nonce)` both base64-encoded.
pub(crate) fn encrypt(plaintext: &str, key: &[u8]) -> Result<(String, String)> {
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let sealed = cipher(key)?
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|e| anyhow!("Encryption failed: {}", e))?;
    Ok((BASE64.encode(sealed), BASE64.encode(nonce)))
}

/// Decrypts a value produced by [`encrypt`].
pub(crate) fn decrypt(ciphertext: &str, nonce: &str, key: &[u8]) -> Result<String> {
    let sealed = BASE64.decode(ciphertext).context("Stored value is not base64")?;
    let nonce = BASE64.decode(nonce).context("Stored nonce is not base64")?;
    if nonce.len() != NONCE_SIZE {
        return Err(anyhow!("Stored nonce has {} bytes, want {}", nonce.len(), NONCE_SIZE));
    }

    let plain = cipher(key)?
        .decrypt(Nonce::from_slice(&nonce), sealed.as_ref())
        .map_err(|_| anyhow!("Decryption failed: wrong key or corrupted value"))?;
    String::from_utf8(plain).context("Decrypted value is not UTF-8")
}

fn cipher(key: &[u8]) -> Result<Aes256Gcm> {
    if key.len() != KEY_SIZE {
        return Err(anyhow!("Encryption key must be {} bytes, got {}", KEY_SIZE, key.len()));
    }
    Aes256Gcm::new_from_slice(key).map_err(|e| anyhow!("Invalid encryption key: {}", e))
}
