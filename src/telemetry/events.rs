//! Typed shapes of the records stored in the telemetry lists.
//!
//! Records leave this module as [`EventRecord`] maps: the buffer and the
//! upload path treat them as opaque field maps and only backfill
//! `user_id`, `timestamp` and `event_id`.

use anyhow::{anyhow, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Value};

use crate::db::EventRecord;
use crate::tracking::ViewState;

pub const SCHEMA_VERSION: &str = "1.0";

pub fn iso_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Fields shared by every record emitted from one context. Records written
/// outside a page carry no session ids.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EventContext {
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site_session_id: Option<String>,
    pub study_group: String,
}

impl EventContext {
    pub fn without_session(user_id: Option<String>, study_group: &str) -> Self {
        Self {
            user_id,
            session_id: None,
            site_session_id: None,
            study_group: study_group.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SiteCloseStats {
    pub extension_state: bool,
    pub page_url_hash: Option<String>,
    pub words_total: usize,
    pub scroll_depth_percent: f64,
    pub active_reading_time_ms: u64,
    pub toggles_count: u32,
    pub altered_paragraphs_count: usize,
    pub altered_words_ever: usize,
    pub percent_altered_words_ever: f64,
}

/// Behavioural events, tagged by `event_type`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event_type", rename_all = "camelCase")]
pub enum RawEvent {
    SiteClose(SiteCloseStats),
    ToggleParagraph {
        page_url_hash: String,
        extension_state: bool,
        from_view: ViewState,
        to_view: ViewState,
        wordcount_simplified: usize,
        wordcount_original: usize,
    },
    ToggleAllParagraphs {
        from_view: ViewState,
        to_view: ViewState,
    },
    ExtensionStateChange {
        extension_state: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        page_url_hash: Option<String>,
    },
    BlockSite {
        page_url_hash: String,
    },
}

impl RawEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            RawEvent::SiteClose(_) => "siteClose",
            RawEvent::ToggleParagraph { .. } => "toggleParagraph",
            RawEvent::ToggleAllParagraphs { .. } => "toggleAllParagraphs",
            RawEvent::ExtensionStateChange { .. } => "extensionStateChange",
            RawEvent::BlockSite { .. } => "blockSite",
        }
    }

    pub fn into_record(self, context: &EventContext, at: DateTime<Utc>) -> Result<EventRecord> {
        let mut record = object(serde_json::to_value(&self)?)?;
        merge_context(&mut record, context)?;
        record.insert("timestamp".into(), Value::String(iso_timestamp(at)));
        record.insert("schema_version".into(), Value::String(SCHEMA_VERSION.into()));
        Ok(record)
    }
}

/// Answers to one experience-sampling prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum SurveyAnswers {
    /// Multiple choice after switching a paragraph back to the original.
    ToggleSingleToOriginal {
        choices: Vec<String>,
        free_text: Option<String>,
    },
    DisableExtension {
        choices: Vec<String>,
        free_text: Option<String>,
    },
    /// Three 1-5 Likert ratings plus the page topic.
    SiteSurvey {
        understandable_without: u8,
        understandable_with: u8,
        helpful: u8,
        topic: Option<String>,
    },
}

impl SurveyAnswers {
    pub fn event_type(&self) -> &'static str {
        match self {
            SurveyAnswers::ToggleSingleToOriginal { .. } => "toggleSingleToOriginal",
            SurveyAnswers::DisableExtension { .. } => "disableExtension",
            SurveyAnswers::SiteSurvey { .. } => "siteSurvey",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            SurveyAnswers::ToggleSingleToOriginal { choices, free_text }
            | SurveyAnswers::DisableExtension { choices, free_text } => {
                let has_text = free_text.as_deref().map(|t| !t.trim().is_empty()).unwrap_or(false);
                if choices.is_empty() && !has_text {
                    return Err(anyhow!("at least one answer is required"));
                }
            }
            SurveyAnswers::SiteSurvey {
                understandable_without,
                understandable_with,
                helpful,
                topic,
            } => {
                for rating in [understandable_without, understandable_with, helpful] {
                    if !(1..=5).contains(rating) {
                        return Err(anyhow!("rating {rating} outside 1-5"));
                    }
                }
                if topic.is_none() {
                    return Err(anyhow!("topic is required"));
                }
            }
        }
        Ok(())
    }

    pub fn into_record(
        self,
        context: &EventContext,
        page_url_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<EventRecord> {
        self.validate()?;
        let mut record = EventRecord::new();
        record.insert("event_type".into(), Value::String(self.event_type().into()));
        merge_context(&mut record, context)?;
        record.insert("timestamp".into(), Value::String(iso_timestamp(at)));
        record.insert("base_url_hash".into(), Value::String(page_url_hash.into()));

        match self {
            SurveyAnswers::ToggleSingleToOriginal { choices, free_text }
            | SurveyAnswers::DisableExtension { choices, free_text } => {
                let free_text = free_text
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty());
                record.insert("answers".into(), json!(choices));
                record.insert("free_text".into(), json!(free_text));
            }
            SurveyAnswers::SiteSurvey {
                understandable_without,
                understandable_with,
                helpful,
                topic,
            } => {
                record.insert(
                    "answers".into(),
                    json!({
                        "understandableWithout": understandable_without.to_string(),
                        "understandableWith": understandable_with.to_string(),
                        "helpful": helpful.to_string(),
                        "topic": topic,
                    }),
                );
                record.insert("page_url_hash".into(), Value::String(page_url_hash.into()));
            }
        }
        Ok(record)
    }
}

fn merge_context(record: &mut EventRecord, context: &EventContext) -> Result<()> {
    for (key, value) in object(serde_json::to_value(context)?)? {
        record.insert(key, value);
    }
    Ok(())
}

fn object(value: Value) -> Result<EventRecord> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(anyhow!("expected a JSON object, got {other}")),
    }
}

/// Whitespace-separated word count.
pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}
