use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};

use crate::db::models::StorageKey;

pub fn read_json<T: DeserializeOwned>(conn: &Connection, key: StorageKey) -> Result<Option<T>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM local_store WHERE key = ?1",
            params![key.as_str()],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("failed to read {}", key.as_str()))?;

    match raw {
        Some(text) => serde_json::from_str(&text)
            .map(Some)
            .with_context(|| format!("failed to decode {}", key.as_str())),
        None => Ok(None),
    }
}

pub fn write_json<T: Serialize + ?Sized>(conn: &Connection, key: StorageKey, value: &T) -> Result<()> {
    let encoded = serde_json::to_string(value)
        .with_context(|| format!("failed to encode {}", key.as_str()))?;
    conn.execute(
        "INSERT INTO local_store (key, value, updated_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key.as_str(), encoded, Utc::now().to_rfc3339()],
    )
    .with_context(|| format!("failed to write {}", key.as_str()))?;
    Ok(())
}

pub fn delete_key(conn: &Connection, key: StorageKey) -> Result<()> {
    conn.execute(
        "DELETE FROM local_store WHERE key = ?1",
        params![key.as_str()],
    )
    .with_context(|| format!("failed to delete {}", key.as_str()))?;
    Ok(())
}
