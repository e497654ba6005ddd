//! One-time key exchange for the study API key.

use anyhow::{anyhow, bail, Context, Result};
use log::info;
use serde::{Deserialize, Serialize};

use crate::db::Database;
use crate::settings::ServiceSettings;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeRequest<'a> {
    user_id: &'a str,
    one_time_key: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeResponse {
    api_key: Option<String>,
    user_id: Option<String>,
    error: Option<String>,
}

/// Credentials stored after a successful exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user_id: String,
    pub api_key: String,
}

pub fn validate_user_id(user_id: &str) -> Result<()> {
    if user_id.len() != 6 || !user_id.chars().all(|c| c.is_ascii_digit()) {
        bail!("user id must be exactly 6 digits");
    }
    Ok(())
}

/// Trades a one-time key for an API key and stores both ids.
pub async fn exchange_key(
    settings: &ServiceSettings,
    db: &Database,
    user_id: &str,
    one_time_key: &str,
) -> Result<Credentials> {
    let user_id = user_id.trim();
    validate_user_id(user_id)?;
    let one_time_key = one_time_key.trim().to_uppercase();
    if one_time_key.is_empty() {
        bail!("one-time key must not be empty");
    }

    let response = reqwest::Client::new()
        .post(settings.endpoint("exchange-key"))
        .json(&ExchangeRequest {
            user_id,
            one_time_key: &one_time_key,
        })
        .send()
        .await
        .context("key exchange request failed")?;

    let body: ExchangeResponse = response
        .json()
        .await
        .context("key exchange response is not JSON")?;

    if let Some(error) = body.error {
        return Err(anyhow!(error));
    }
    let api_key = body
        .api_key
        .ok_or_else(|| anyhow!("key exchange response carried no API key"))?;

    let credentials = Credentials {
        user_id: body.user_id.unwrap_or_else(|| user_id.to_string()),
        api_key,
    };
    db.store_credentials(&credentials.user_id, &credentials.api_key)
        .await?;

    info!("Stored API key for user {}", credentials.user_id);
    Ok(credentials)
}
