use std::time::Duration;

use reqwest::StatusCode;
use serde::Serialize;

use crate::db::EventRecord;

#[derive(Debug, Serialize)]
pub struct UploadBatch {
    pub batch_id: String,
    pub events: Vec<EventRecord>,
    #[serde(skip)]
    pub idempotency_key: String,
}

/// How the ingestion endpoint answered one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Accepted,
    RateLimited { retry_after: Duration },
    Rejected { status: u16 },
    Network(String),
}

#[derive(Clone)]
pub struct IngestClient {
    http: reqwest::Client,
    endpoint: String,
    default_retry_after: Duration,
}

impl IngestClient {
    pub fn new(endpoint: String, default_retry_after: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
            default_retry_after,
        }
    }

    pub async fn upload(&self, api_key: &str, batch: &UploadBatch) -> UploadOutcome {
        let response = match self
            .http
            .post(&self.endpoint)
            .header("X-API-Key", api_key)
            .header("Idempotency-Key", &batch.idempotency_key)
            .json(batch)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => return UploadOutcome::Network(err.to_string()),
        };

        match response.status() {
            StatusCode::OK => UploadOutcome::Accepted,
            StatusCode::TOO_MANY_REQUESTS => {
                let header = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|value| value.to_str().ok());
                UploadOutcome::RateLimited {
                    retry_after: parse_retry_after(header, self.default_retry_after),
                }
            }
            status => UploadOutcome::Rejected {
                status: status.as_u16(),
            },
        }
    }
}

/// Seconds from the leading digits of a `Retry-After` value, `default` when
/// there are none.
pub fn parse_retry_after(header: Option<&str>, default: Duration) -> Duration {
    let Some(value) = header else {
        return default;
    };
    let digits: String = value
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits
        .parse::<u64>()
        .map(Duration::from_secs)
        .unwrap_or(default)
}
