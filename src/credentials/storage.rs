//! SQLite-backed credential records.
//!
//! One database file holds the records of every named configuration. Values
//! are optionally encrypted at rest with AES-256-GCM.

use super::{encryption, StateBackend};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

/// Credential record storage backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE auth_values (
///     config_name TEXT NOT NULL,
///     key         TEXT NOT NULL,
///     value       TEXT NOT NULL,   -- Encrypted when value_nonce is set
///     value_nonce TEXT,
///     updated_at  TEXT NOT NULL,   -- RFC 3339
///     PRIMARY KEY (config_name, key)
/// );
/// ```
///
/// `save` replaces every row of one configuration inside a single
/// transaction, so readers never see a half-written record.
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
    encryption_key: Option<Vec<u8>>,
}

impl SqliteStateStore {
    /// Creates or opens the store.
    ///
    /// # Arguments
    /// * `db_path` - Path to the SQLite file (`:memory:` for tests)
    /// * `encryption_key` - 32-byte key; `None` stores values in plaintext
    pub fn new<P: AsRef<Path>>(db_path: P, encryption_key: Option<Vec<u8>>) -> Result<Self> {
        if let Some(key) = &encryption_key {
            if key.len() != 32 {
                return Err(anyhow!("Encryption key must be 32 bytes, got {}", key.len()));
            }
        }

        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create state directory {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open state database at {}", db_path.display()))?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS auth_values (
                config_name TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                value_nonce TEXT,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (config_name, key)
            )
            "#,
            [],
        )
        .context("Failed to create auth_values table")?;

        Ok(Self {
            conn: Mutex::new(conn),
            encryption_key,
        })
    }

    fn seal(&self, value: &str) -> Result<(String, Option<String>)> {
        match &self.encryption_key {
            Some(key) => {
                let (ciphertext, nonce) = encryption::encrypt(value, key)?;
                Ok((ciphertext, Some(nonce)))
            }
            None => Ok((value.to_string(), None)),
        }
    }

    fn open_value(&self, key_name: &str, value: String, nonce: Option<String>) -> Result<String> {
        match (nonce, &self.encryption_key) {
            (None, _) => Ok(value),
            (Some(nonce), Some(key)) => encryption::decrypt(&value, &nonce, key)
                .with_context(|| format!("Failed to decrypt stored value '{}'", key_name)),
            (Some(_), None) => Err(anyhow!(
                "Stored value '{}' is encrypted; set {} to read it",
                key_name,
                encryption::ENCRYPTION_KEY_ENV
            )),
        }
    }
}

impl StateBackend for SqliteStateStore {
    fn load(&self, name: &str) -> Result<HashMap<String, String>> {
        let rows: Vec<(String, String, Option<String>)> = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn
                .prepare("SELECT key, value, value_nonce FROM auth_values WHERE config_name = ?1")
                .context("Failed to prepare query")?;
            let rows = stmt
                .query_map(params![name], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
                .context("Failed to execute query")?
                .collect::<Result<Vec<_>, _>>()
                .context("Failed to read results")?;
            rows
        };

        let mut values = HashMap::with_capacity(rows.len());
        for (key, value, nonce) in rows {
            let plain = self.open_value(&key, value, nonce)?;
            values.insert(key, plain);
        }
        Ok(values)
    }

    fn save(&self, name: &str, values: &HashMap<String, String>) -> Result<()> {
        // Encrypt before taking the lock so a failure leaves the database untouched
        let mut sealed = Vec::with_capacity(values.len());
        for (key, value) in values {
            let (stored, nonce) = self
                .seal(value)
                .with_context(|| format!("Failed to encrypt value '{}'", key))?;
            sealed.push((key.as_str(), stored, nonce));
        }

        let now = Utc::now().to_rfc3339();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().context("Failed to begin transaction")?;
        tx.execute("DELETE FROM auth_values WHERE config_name = ?1", params![name])
            .context("Failed to clear previous credentials")?;
        for (key, stored, nonce) in &sealed {
            tx.execute(
                r#"
                INSERT INTO auth_values (config_name, key, value, value_nonce, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![name, key, stored, nonce, now],
            )
            .with_context(|| format!("Failed to store value '{}'", key))?;
        }
        tx.commit().context("Failed to commit credentials")?;

        Ok(())
    }
}
