//! Research telemetry: event shapes, the persistent buffer, reading
//! sessions and experience-sampling prompts.

pub mod buffer;
pub mod events;
pub mod session;
pub mod survey;
pub mod throttle;

pub use buffer::{RawEventSink, TelemetryBuffer};
pub use events::{EventContext, RawEvent, SiteCloseStats, SurveyAnswers};
pub use session::{Activity, RollingSession, SessionTracker, Viewport};
pub use survey::{SurveyGate, SurveyPrompt};
