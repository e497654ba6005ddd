//! Drains the buffered telemetry lists to the ingestion endpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{error, info, warn};
use serde_json::Value;
use uuid::Uuid;

use crate::db::{Database, EventList, EventRecord};
use crate::settings::{FlushSettings, ServiceSettings};
use crate::telemetry::events::iso_timestamp;

use super::client::{IngestClient, UploadBatch, UploadOutcome};

/// True once the combined buffer has reached the upload threshold.
pub fn should_flush_immediately(raw: usize, survey: usize, threshold: usize) -> bool {
    raw + survey >= threshold
}

/// Single-flight flag plus the rate-limit deadline, shared by every trigger
/// of one pipeline.
#[derive(Debug, Default)]
pub struct FlushGate {
    in_flight: AtomicBool,
    not_before: Mutex<Option<Instant>>,
}

/// Clears the in-flight flag when the flush ends, however it ends.
pub struct FlightGuard<'a> {
    gate: &'a FlushGate,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.gate.in_flight.store(false, Ordering::Release);
    }
}

impl FlushGate {
    pub fn try_begin(&self, now: Instant) -> Result<FlightGuard<'_>, SkipReason> {
        if self.in_flight.load(Ordering::Acquire) {
            return Err(SkipReason::InFlight);
        }
        if let Some(deadline) = self.backoff_deadline() {
            if now < deadline {
                return Err(SkipReason::BackingOff);
            }
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SkipReason::InFlight);
        }
        Ok(FlightGuard { gate: self })
    }

    pub fn back_off_until(&self, deadline: Instant) {
        if let Ok(mut guard) = self.not_before.lock() {
            *guard = Some(deadline);
        }
    }

    pub fn backoff_deadline(&self) -> Option<Instant> {
        self.not_before.lock().ok().and_then(|guard| *guard)
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    InFlight,
    BackingOff,
    Empty,
    NoCredential,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    RateLimited(Duration),
    Status(u16),
    Network(String),
    Storage(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    Skipped(SkipReason),
    Completed { uploaded: usize },
    Aborted { uploaded: usize, reason: AbortReason },
}

#[derive(Clone)]
pub struct FlushPipeline {
    db: Database,
    client: IngestClient,
    gate: Arc<FlushGate>,
    settings: FlushSettings,
}

impl FlushPipeline {
    pub fn new(db: Database, settings: &ServiceSettings) -> Self {
        let flush = settings.flush.clone();
        let client = IngestClient::new(
            settings.endpoint("ingest"),
            Duration::from_secs(flush.default_retry_after_secs),
        );
        Self {
            db,
            client,
            gate: Arc::new(FlushGate::default()),
            settings: flush,
        }
    }

    pub fn gate(&self) -> &FlushGate {
        &self.gate
    }

    pub async fn flush(&self) -> FlushOutcome {
        self.flush_at(Instant::now()).await
    }

    /// Runs one flush as if triggered at `now`.
    pub async fn flush_at(&self, now: Instant) -> FlushOutcome {
        let _flight = match self.gate.try_begin(now) {
            Ok(guard) => guard,
            Err(reason) => return FlushOutcome::Skipped(reason),
        };

        let buffered = match self.db.buffered_events().await {
            Ok(buffered) => buffered,
            Err(err) => {
                error!("Failed to read buffered events: {err:#}");
                return aborted(0, AbortReason::Storage(err.to_string()));
            }
        };
        if buffered.total() == 0 {
            return FlushOutcome::Skipped(SkipReason::Empty);
        }

        let api_key = match self.db.api_key().await {
            Ok(Some(key)) => key,
            Ok(None) => {
                warn!("No API key available for ingestion; skipping flush");
                return FlushOutcome::Skipped(SkipReason::NoCredential);
            }
            Err(err) => {
                error!("Failed to read API key: {err:#}");
                return aborted(0, AbortReason::Storage(err.to_string()));
            }
        };
        let user_id = self.db.user_id().await.ok().flatten();

        // Survey responses first, then raw events; removal below relies on
        // this order matching the storage order within each list.
        let combined: Vec<(EventList, EventRecord)> = buffered
            .survey
            .into_iter()
            .map(|record| (EventList::Survey, record))
            .chain(buffered.raw.into_iter().map(|record| (EventList::Raw, record)))
            .collect();

        let chunk_size = self.settings.chunk_size.max(1);
        let chunk_count = combined.chunks(chunk_size).len();
        let mut uploaded = 0;

        for (index, chunk) in combined.chunks(chunk_size).enumerate() {
            let batch = UploadBatch {
                batch_id: Uuid::new_v4().to_string(),
                idempotency_key: Uuid::new_v4().to_string(),
                events: chunk
                    .iter()
                    .map(|(_, record)| backfill(record.clone(), user_id.as_deref()))
                    .collect(),
            };

            match self.client.upload(&api_key, &batch).await {
                UploadOutcome::Accepted => {
                    let survey = chunk
                        .iter()
                        .filter(|(list, _)| *list == EventList::Survey)
                        .count();
                    let raw = chunk.len() - survey;
                    if let Err(err) = self.db.remove_uploaded(survey, raw).await {
                        error!("Uploaded batch {} but failed to prune storage: {err:#}", batch.batch_id);
                        return aborted(uploaded, AbortReason::Storage(err.to_string()));
                    }
                    uploaded += chunk.len();
                    info!("Uploaded batch {} ({} events)", batch.batch_id, chunk.len());

                    if index + 1 < chunk_count {
                        tokio::time::sleep(self.settings.chunk_pause()).await;
                    }
                }
                UploadOutcome::RateLimited { retry_after } => {
                    self.gate.back_off_until(Instant::now() + retry_after);
                    warn!("Rate limited. Retry after {} seconds", retry_after.as_secs());
                    return aborted(uploaded, AbortReason::RateLimited(retry_after));
                }
                UploadOutcome::Rejected { status } => {
                    error!("Ingestion failed with status {status}");
                    return aborted(uploaded, AbortReason::Status(status));
                }
                UploadOutcome::Network(err) => {
                    warn!("Ingestion network error, will retry later: {err}");
                    return aborted(uploaded, AbortReason::Network(err));
                }
            }
        }

        FlushOutcome::Completed { uploaded }
    }
}

fn aborted(uploaded: usize, reason: AbortReason) -> FlushOutcome {
    FlushOutcome::Aborted { uploaded, reason }
}

/// Fills `user_id`, `timestamp` and `event_id` when missing or empty.
fn backfill(mut record: EventRecord, user_id: Option<&str>) -> EventRecord {
    if let Some(user_id) = user_id {
        if is_blank(record.get("user_id")) {
            record.insert("user_id".into(), Value::String(user_id.to_string()));
        }
    }
    if is_blank(record.get("timestamp")) {
        record.insert("timestamp".into(), Value::String(iso_timestamp(Utc::now())));
    }
    if is_blank(record.get("event_id")) {
        record.insert("event_id".into(), Value::String(Uuid::new_v4().to_string()));
    }
    record
}

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Bool(b)) => !b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_database;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn record(n: usize) -> EventRecord {
        let mut map = EventRecord::new();
        map.insert("n".into(), json!(n));
        map
    }

    fn settings_for(server: &MockServer) -> ServiceSettings {
        ServiceSettings {
            server_url: server.uri(),
            flush: FlushSettings {
                chunk_pause_ms: 0,
                ..FlushSettings::default()
            },
            ..ServiceSettings::default()
        }
    }

    async fn seeded(raw: usize, survey: usize) -> (tempfile::TempDir, Database) {
        let (dir, db) = temp_database();
        db.store_credentials("123456", "KEY").await.unwrap();
        for n in 0..survey {
            db.append_event(EventList::Survey, record(n)).await.unwrap();
        }
        for n in 0..raw {
            db.append_event(EventList::Raw, record(n)).await.unwrap();
        }
        (dir, db)
    }

    #[test]
    fn immediate_flush_threshold() {
        assert!(should_flush_immediately(1500, 600, 2000));
        assert!(!should_flush_immediately(100, 50, 2000));
        assert!(should_flush_immediately(2000, 0, 2000));
    }

    #[test]
    fn gate_drops_concurrent_flushes() {
        let gate = FlushGate::default();
        let now = Instant::now();
        let guard = gate.try_begin(now).unwrap();
        assert_eq!(gate.try_begin(now).err(), Some(SkipReason::InFlight));
        drop(guard);
        assert!(!gate.is_in_flight());
        assert!(gate.try_begin(now).is_ok());
    }

    #[test]
    fn gate_honours_backoff_deadline() {
        let gate = FlushGate::default();
        let now = Instant::now();
        gate.back_off_until(now + Duration::from_secs(30));

        assert_eq!(
            gate.try_begin(now + Duration::from_secs(29)).err(),
            Some(SkipReason::BackingOff)
        );
        assert!(gate.try_begin(now + Duration::from_secs(30)).is_ok());
    }

    #[test]
    fn backfill_only_fills_missing_fields() {
        let mut existing = record(1);
        existing.insert("user_id".into(), json!("654321"));
        existing.insert("event_id".into(), json!("fixed"));
        let filled = backfill(existing, Some("123456"));
        assert_eq!(filled["user_id"], "654321");
        assert_eq!(filled["event_id"], "fixed");
        assert!(filled["timestamp"].is_string());

        let mut anonymous = record(2);
        anonymous.insert("user_id".into(), Value::Null);
        let filled = backfill(anonymous, Some("123456"));
        assert_eq!(filled["user_id"], "123456");
        assert!(filled["event_id"].as_str().map(|s| s.len() == 36).unwrap_or(false));
    }

    #[tokio::test]
    async fn empty_buffer_or_missing_key_skips() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let (_dir, db) = temp_database();
        let pipeline = FlushPipeline::new(db.clone(), &settings_for(&server));
        assert_eq!(pipeline.flush().await, FlushOutcome::Skipped(SkipReason::Empty));

        db.append_event(EventList::Raw, record(0)).await.unwrap();
        assert_eq!(
            pipeline.flush().await,
            FlushOutcome::Skipped(SkipReason::NoCredential)
        );
        assert_eq!(db.buffered_counts().await.unwrap(), (1, 0));
    }

    #[tokio::test]
    async fn uploads_in_chunks_survey_first() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ingest"))
            .respond_with(ResponseTemplate::new(200))
            .expect(2)
            .mount(&server)
            .await;

        let (_dir, db) = seeded(1500, 600).await;
        let pipeline = FlushPipeline::new(db.clone(), &settings_for(&server));

        assert_eq!(pipeline.flush().await, FlushOutcome::Completed { uploaded: 2100 });
        assert_eq!(db.buffered_counts().await.unwrap(), (0, 0));

        let requests = server.received_requests().await.unwrap();
        let first: Value = requests[0].body_json().unwrap();
        let events = first["events"].as_array().unwrap();
        assert_eq!(events.len(), 2000);
        assert!(first["batch_id"].is_string());
        assert_eq!(events[0]["user_id"], "123456");
        assert_ne!(
            requests[0].headers.get("Idempotency-Key"),
            requests[1].headers.get("Idempotency-Key")
        );
    }

    #[tokio::test]
    async fn records_appended_during_upload_survive() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ingest"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(300)))
            .mount(&server)
            .await;

        let (_dir, db) = seeded(2000, 0).await;
        let pipeline = FlushPipeline::new(db.clone(), &settings_for(&server));

        let flush = tokio::spawn({
            let pipeline = pipeline.clone();
            async move { pipeline.flush().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut late = EventRecord::new();
        late.insert("late".into(), json!(true));
        db.append_event(EventList::Raw, late).await.unwrap();

        assert_eq!(flush.await.unwrap(), FlushOutcome::Completed { uploaded: 2000 });
        let remaining = db.buffered_events().await.unwrap();
        assert_eq!(remaining.raw.len(), 1);
        assert_eq!(remaining.raw[0]["late"], true);
    }

    #[tokio::test]
    async fn rate_limit_blocks_until_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ingest"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "30"))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;

        let (_dir, db) = seeded(10, 5).await;
        let pipeline = FlushPipeline::new(db.clone(), &settings_for(&server));

        let outcome = pipeline.flush().await;
        assert_eq!(
            outcome,
            FlushOutcome::Aborted {
                uploaded: 0,
                reason: AbortReason::RateLimited(Duration::from_secs(30))
            }
        );
        assert_eq!(db.buffered_counts().await.unwrap(), (10, 5));

        let now = Instant::now();
        assert_eq!(
            pipeline.flush_at(now + Duration::from_secs(29)).await,
            FlushOutcome::Skipped(SkipReason::BackingOff)
        );
        server.verify().await;

        Mock::given(method("POST"))
            .and(path("/ingest"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        assert_eq!(
            pipeline.flush_at(now + Duration::from_secs(31)).await,
            FlushOutcome::Completed { uploaded: 15 }
        );
    }

    #[tokio::test]
    async fn server_error_keeps_everything() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let (_dir, db) = seeded(3, 2).await;
        let pipeline = FlushPipeline::new(db.clone(), &settings_for(&server));
        assert_eq!(
            pipeline.flush().await,
            FlushOutcome::Aborted {
                uploaded: 0,
                reason: AbortReason::Status(503)
            }
        );
        assert_eq!(db.buffered_counts().await.unwrap(), (3, 2));
        assert!(!pipeline.gate().is_in_flight());
    }
}
