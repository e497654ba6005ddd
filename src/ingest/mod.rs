//! Uploading buffered telemetry: the HTTP client, the flush pipeline and
//! the schedule that drives it.

pub mod client;
pub mod pipeline;
pub mod scheduler;

pub use client::{IngestClient, UploadOutcome};
pub use pipeline::{should_flush_immediately, FlushGate, FlushOutcome, FlushPipeline, SkipReason};
pub use scheduler::{FlushScheduler, FlushTrigger};
