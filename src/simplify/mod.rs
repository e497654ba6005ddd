//! Client for the remote text-simplification endpoint.

use anyhow::{anyhow, bail, Context, Result};
use log::{info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::db::Database;
use crate::settings::ServiceSettings;

/// Longest text sent in one request, in characters.
pub const MAX_TEXT_CHARS: usize = 10_000;

static PICTOGRAPHS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[\p{Emoji_Presentation}\p{Extended_Pictographic}]")
        .expect("emoji pattern is valid")
});

#[derive(Debug, Serialize)]
struct SimplifyRequest<'a> {
    id: &'a str,
    text: &'a str,
    level: u8,
}

/// Strips pictographs and truncates. `None` when nothing readable is left.
pub fn prepare_text(text: &str) -> Option<String> {
    let cleaned = PICTOGRAPHS.replace_all(text, "");
    if cleaned.trim().is_empty() {
        return None;
    }
    if cleaned.chars().count() > MAX_TEXT_CHARS {
        return Some(cleaned.chars().take(MAX_TEXT_CHARS).collect());
    }
    Some(cleaned.into_owned())
}

#[derive(Clone)]
pub struct SimplificationClient {
    http: reqwest::Client,
    endpoint: String,
    level: u8,
    db: Database,
}

impl SimplificationClient {
    pub fn new(settings: &ServiceSettings, db: Database) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: settings.endpoint("simplify"),
            level: settings.simplification_level,
            db,
        }
    }

    /// Returns the simplified text, or `None` after logging why not.
    pub async fn submit(&self, id: &str, text: &str) -> Option<String> {
        let api_key = match self.db.api_key().await {
            Ok(Some(key)) => key,
            Ok(None) => {
                info!("No API key available for simplification");
                return None;
            }
            Err(err) => {
                warn!("Failed to read API key: {err:#}");
                return None;
            }
        };

        let text = prepare_text(text)?;

        match self.request(&api_key, id, &text).await {
            Ok(simplified) => Some(simplified),
            Err(err) => {
                warn!("Simplification of {id} failed: {err:#}");
                None
            }
        }
    }

    async fn request(&self, api_key: &str, id: &str, text: &str) -> Result<String> {
        let body = SimplifyRequest {
            id,
            text,
            level: self.level,
        };

        let response = self
            .http
            .post(&self.endpoint)
            .header("x-api-key", api_key)
            .json(&body)
            .send()
            .await
            .context("simplify request failed")?;

        let data: Value = response
            .json()
            .await
            .context("simplify response is not JSON")?;

        parse_response(&data)
    }
}

fn parse_response(data: &Value) -> Result<String> {
    if let Some(error) = data.get("error").filter(|e| is_truthy(e)) {
        bail!("server rejected request: {error}");
    }
    data.get(0)
        .and_then(|item| item.get("simplified"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("no simplified text in response"))
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}
