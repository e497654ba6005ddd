//! Experience-sampling prompts: when to ask, and what.

use anyhow::Result;
use chrono::{DateTime, Duration, Local};
use rand::Rng;
use serde::Serialize;

use crate::db::{Database, SurveyThrottleKey};

use super::throttle::{local_midnight_ms, ThrottlePolicy};

pub const SITE_SURVEY_MIN_TIME_ON_PAGE_SECS: i64 = 45;
pub const SITE_SURVEY_RECENT_ACTIVITY_SECS: i64 = 10;
pub const SITE_SURVEY_MIN_ALTERED: usize = 5;
pub const SITE_SURVEY_SAMPLE_RATE: f64 = 0.1;

const TOGGLE_ORIGINAL_OPTIONS: &[&str] = &[
    "Ich will die Funktionen der Browsererweiterung ausprobieren.",
    "Ich will überprüfen, ob der Text korrekt umformuliert wurde.",
    "Ich bin mit dem Ergebnis der Vereinfachung unzufrieden.",
    "Etwas in dem Text war unverständlich.",
    "Es ist ein technisches Problem aufgetreten.",
    "Ich finde die Umformulierung nicht nützlich.",
    "Aus Versehen",
];

const DISABLE_OPTIONS: &[&str] = &[
    "Ich brauche sie auf dieser Seite nicht.",
    "Ich möchte sie für die nächste Zeit nicht nutzen.",
    "Ich finde sie störend.",
    "Ich möchte lieber Originaltexte lesen.",
];

pub const SITE_TOPICS: &[&str] = &[
    "Nachrichten / Journalismus",
    "Bildung / Wissen",
    "Unterhaltung / Lifestyle",
    "Technik / IT",
    "Wirtschaft / Finanzen",
    "Kunst / Kultur / Design",
    "Wissenschaft / Forschung",
    "Gesundheit / Medizin",
    "Politik / Gesellschaft",
    "Reisen / Freizeit",
    "E-Commerce / Shopping",
    "Sonstiges",
];

/// A prompt the host should show; answers come back as
/// [`SurveyAnswers`](super::events::SurveyAnswers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SurveyPrompt {
    ToggleSingleToOriginal,
    DisableExtension,
    SiteSurvey,
}

impl SurveyPrompt {
    pub fn question(&self) -> &'static str {
        match self {
            SurveyPrompt::ToggleSingleToOriginal => {
                "Warum haben Sie sich bei diesem Abschnitt den Originaltext anzeigen lassen?"
            }
            SurveyPrompt::DisableExtension => "Warum haben Sie die Erweiterung deaktiviert?",
            SurveyPrompt::SiteSurvey => {
                "Welchem Themenbereich würden Sie diese Webseite am ehesten zuordnen?"
            }
        }
    }

    pub fn options(&self) -> &'static [&'static str] {
        match self {
            SurveyPrompt::ToggleSingleToOriginal => TOGGLE_ORIGINAL_OPTIONS,
            SurveyPrompt::DisableExtension => DISABLE_OPTIONS,
            SurveyPrompt::SiteSurvey => SITE_TOPICS,
        }
    }

    fn throttle(&self) -> (SurveyThrottleKey, ThrottlePolicy) {
        match self {
            SurveyPrompt::ToggleSingleToOriginal | SurveyPrompt::DisableExtension => {
                (SurveyThrottleKey::Esm, ThrottlePolicy::PROMPTS)
            }
            SurveyPrompt::SiteSurvey => (SurveyThrottleKey::SiteSurvey, ThrottlePolicy::SITE_SURVEY),
        }
    }
}

/// What the page knows when deciding on a site survey.
#[derive(Debug, Clone, Copy)]
pub struct SiteSurveySignals {
    pub time_on_page: Duration,
    pub interacted_recently: bool,
    pub altered_paragraphs: usize,
}

/// Page-side preconditions plus the random draw. Throttling is separate.
pub fn site_survey_candidate<R: Rng + ?Sized>(signals: &SiteSurveySignals, rng: &mut R) -> bool {
    if signals.time_on_page < Duration::seconds(SITE_SURVEY_MIN_TIME_ON_PAGE_SECS) {
        return false;
    }
    if !signals.interacted_recently {
        return false;
    }
    if signals.altered_paragraphs < SITE_SURVEY_MIN_ALTERED {
        return false;
    }
    rng.gen::<f64>() < SITE_SURVEY_SAMPLE_RATE
}

/// Applies the persisted daily throttles.
#[derive(Clone)]
pub struct SurveyGate {
    db: Database,
}

impl SurveyGate {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn admit(&self, prompt: SurveyPrompt) -> Result<bool> {
        self.admit_at(prompt, Local::now()).await
    }

    pub async fn admit_at(&self, prompt: SurveyPrompt, now: DateTime<Local>) -> Result<bool> {
        let (key, policy) = prompt.throttle();
        let now_ms = now.timestamp_millis();
        let midnight_ms = local_midnight_ms(now);
        self.db
            .update_throttle(key, move |state| policy.try_admit(state, now_ms, midnight_ms))
            .await
    }
}
