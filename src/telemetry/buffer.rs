use anyhow::Result;
use log::debug;

use crate::background::BackgroundHandle;
use crate::db::{Database, EventList, EventRecord};
use crate::ingest::{should_flush_immediately, FlushTrigger};

/// Persistent append-only telemetry lists.
#[derive(Clone)]
pub struct TelemetryBuffer {
    db: Database,
    immediate_flush: Option<(FlushTrigger, usize)>,
}

impl TelemetryBuffer {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            immediate_flush: None,
        }
    }

    /// Fires `trigger` whenever an append leaves at least `threshold`
    /// records buffered.
    pub fn with_immediate_flush(mut self, trigger: FlushTrigger, threshold: usize) -> Self {
        self.immediate_flush = Some((trigger, threshold));
        self
    }

    pub async fn append(&self, list: EventList, record: EventRecord) -> Result<()> {
        self.db.append_event(list, record).await?;
        self.check_immediate_flush().await?;
        Ok(())
    }

    /// `(raw, survey)` counts.
    pub async fn counts(&self) -> Result<(usize, usize)> {
        self.db.buffered_counts().await
    }

    pub async fn check_immediate_flush(&self) -> Result<bool> {
        let Some((trigger, threshold)) = &self.immediate_flush else {
            return Ok(false);
        };
        let (raw, survey) = self.counts().await?;
        if should_flush_immediately(raw, survey, *threshold) {
            trigger.fire();
            return Ok(true);
        }
        Ok(false)
    }
}

/// Page-side writer for raw events. Sends through the background channel
/// and waits for its acknowledgment; if there is no channel or the ack
/// fails, appends to storage directly.
#[derive(Clone)]
pub struct RawEventSink {
    background: Option<BackgroundHandle>,
    fallback: TelemetryBuffer,
}

impl RawEventSink {
    pub fn new(background: Option<BackgroundHandle>, fallback: TelemetryBuffer) -> Self {
        Self {
            background,
            fallback,
        }
    }

    pub async fn persist(&self, record: EventRecord) -> Result<()> {
        if let Some(background) = &self.background {
            match background.append_raw_event(record.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) => debug!("raw event channel failed, writing directly: {err:#}"),
            }
        }
        self.fallback.append(EventList::Raw, record).await
    }
}
