//! Per-page reading session: session ids, user activity, active reading time
//! and scroll depth.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

pub const SESSION_IDLE_TIMEOUT_MINUTES: i64 = 30;
pub const INACTIVITY_THRESHOLD_SECS: i64 = 30;

/// Session id shared by consecutive pages on the same host while the
/// reader stays active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollingSession {
    pub session_id: String,
    pub hostname: String,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    MouseMove,
    Scroll,
    Key,
    Click,
    Touch,
}

/// Viewport geometry reported by the host, in pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub scroll_y: f64,
    pub inner_height: f64,
    pub scroll_height: f64,
}

pub struct SessionTracker {
    hostname: String,
    rolling: Option<RollingSession>,
    site_session_id: String,
    page_started: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    last_interaction: Option<DateTime<Utc>>,
    last_tick: DateTime<Utc>,
    active_reading_ms: u64,
    max_scroll_px: f64,
    scroll_height: f64,
    inner_height: f64,
}

impl SessionTracker {
    /// `previous` is the rolling session left by the last page in this tab.
    pub fn new(hostname: &str, previous: Option<RollingSession>, now: DateTime<Utc>) -> Self {
        Self {
            hostname: hostname.to_string(),
            rolling: previous,
            site_session_id: Uuid::new_v4().to_string(),
            page_started: now,
            last_activity: now,
            last_interaction: None,
            last_tick: now,
            active_reading_ms: 0,
            max_scroll_px: 0.0,
            scroll_height: 0.0,
            inner_height: 0.0,
        }
    }

    pub fn site_session_id(&self) -> &str {
        &self.site_session_id
    }

    /// Current rolling session id, starting a new one when the host changed
    /// or the reader has been idle past the timeout.
    pub fn session_id(&mut self, now: DateTime<Utc>) -> String {
        let idle_limit = Duration::minutes(SESSION_IDLE_TIMEOUT_MINUTES);
        let reusable = self.rolling.as_ref().filter(|session| {
            session.hostname == self.hostname && now - session.last_activity <= idle_limit
        });

        if let Some(session) = reusable {
            return session.session_id.clone();
        }

        let session = RollingSession {
            session_id: Uuid::new_v4().to_string(),
            hostname: self.hostname.clone(),
            last_activity: now,
        };
        let id = session.session_id.clone();
        self.rolling = Some(session);
        id
    }

    pub fn rolling_session(&self) -> Option<RollingSession> {
        self.rolling.clone()
    }

    pub fn record_activity(&mut self, _activity: Activity, now: DateTime<Utc>) {
        self.last_activity = now;
        self.last_interaction = Some(now);
        self.touch_rolling(now);
    }

    /// The page became visible again.
    pub fn page_visible(&mut self, now: DateTime<Utc>) {
        self.touch_rolling(now);
    }

    /// One reading-time tick. The elapsed time counts only while the page is
    /// visible and the reader was active recently.
    pub fn tick(&mut self, now: DateTime<Utc>, visible: bool) {
        let delta = (now - self.last_tick).num_milliseconds().max(0) as u64;
        self.last_tick = now;
        let recently_active =
            now - self.last_activity <= Duration::seconds(INACTIVITY_THRESHOLD_SECS);
        if visible && recently_active {
            self.active_reading_ms += delta;
        }
    }

    pub fn active_reading_ms(&self) -> u64 {
        self.active_reading_ms
    }

    pub fn time_on_page(&self, now: DateTime<Utc>) -> Duration {
        now - self.page_started
    }

    pub fn interacted_within(&self, window: Duration, now: DateTime<Utc>) -> bool {
        self.last_interaction
            .map(|at| now - at <= window)
            .unwrap_or(false)
    }

    pub fn update_scroll(&mut self, viewport: Viewport) {
        let reached = viewport.scroll_y + viewport.inner_height;
        if reached > self.max_scroll_px {
            self.max_scroll_px = reached;
        }
        self.scroll_height = viewport.scroll_height;
        self.inner_height = viewport.inner_height;
    }

    /// Fraction of the page that has been scrolled into view, capped at 1.
    /// Pages that do not scroll count as fully seen.
    pub fn scroll_depth(&self) -> f64 {
        let scrollable = self.scroll_height - self.inner_height;
        if scrollable > 0.0 {
            (self.max_scroll_px / self.scroll_height).min(1.0)
        } else {
            1.0
        }
    }

    fn touch_rolling(&mut self, now: DateTime<Utc>) {
        if let Some(session) = self.rolling.as_mut() {
            session.last_activity = now;
        }
    }
}
