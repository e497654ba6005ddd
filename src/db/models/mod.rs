//! Shapes persisted in local storage.

use serde::{Deserialize, Serialize};

/// One buffered telemetry record. Stored verbatim; only the flush pipeline
/// adds fields to a copy before upload.
pub type EventRecord = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKey {
    IsEnabled,
    Settings,
    Blacklist,
    RawDataEvents,
    ExperienceSamplingResponses,
    UserId,
    SimplifyApiKey,
    EsmThrottle,
    EsmSiteSurveyThrottle,
}

impl StorageKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKey::IsEnabled => "isEnabled",
            StorageKey::Settings => "settings",
            StorageKey::Blacklist => "blacklist",
            StorageKey::RawDataEvents => "rawDataEvents",
            StorageKey::ExperienceSamplingResponses => "experienceSamplingResponses",
            StorageKey::UserId => "userId",
            StorageKey::SimplifyApiKey => "simplifyApiKey",
            StorageKey::EsmThrottle => "esmThrottle",
            StorageKey::EsmSiteSurveyThrottle => "esmSiteSurveyThrottle",
        }
    }
}

/// The two persistent telemetry lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventList {
    Raw,
    Survey,
}

impl EventList {
    pub fn key(&self) -> StorageKey {
        match self {
            EventList::Raw => StorageKey::RawDataEvents,
            EventList::Survey => StorageKey::ExperienceSamplingResponses,
        }
    }
}

/// Daily popup bookkeeping, epoch milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThrottleState {
    pub last_shown: i64,
    pub count: u32,
    pub last_reset: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPreferences {
    pub notifications: bool,
}

impl Default for UserPreferences {
    fn default() -> Self {
        Self {
            notifications: true,
        }
    }
}
