//! The long-lived background context: owns the extension switch, accepts
//! raw events from pages, and broadcasts state changes back to them.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use log::{error, info, warn};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::db::{Database, EventList, EventRecord, UserPreferences};
use crate::page::hash_domain;
use crate::settings::ServiceSettings;
use crate::telemetry::{EventContext, RawEvent, SurveyPrompt, TelemetryBuffer};

const REQUEST_QUEUE: usize = 64;
const PAGE_QUEUE: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionState {
    pub is_enabled: bool,
    pub preferences: UserPreferences,
}

/// Messages pushed to every page context.
#[derive(Debug, Clone, PartialEq)]
pub enum PageMessage {
    ExtensionStateChanged { enabled: bool },
    /// Only the page on `hostname` should show the prompt.
    ShowSurvey {
        prompt: SurveyPrompt,
        hostname: Option<String>,
    },
}

enum BackgroundRequest {
    AppendRawEvent {
        record: EventRecord,
        ack: oneshot::Sender<Result<()>>,
    },
    GetState {
        reply: oneshot::Sender<Result<ExtensionState>>,
    },
    UpdatePreferences {
        preferences: UserPreferences,
        ack: oneshot::Sender<Result<()>>,
    },
    ToggleExtension {
        active_hostname: Option<String>,
        reply: oneshot::Sender<Result<bool>>,
    },
    BlockSite {
        hostname: String,
        reply: oneshot::Sender<Result<bool>>,
    },
}

#[derive(Clone)]
pub struct BackgroundHandle {
    requests: mpsc::Sender<BackgroundRequest>,
    pages: broadcast::Sender<PageMessage>,
}

impl BackgroundHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<PageMessage> {
        self.pages.subscribe()
    }

    /// Resolves once the record is stored.
    pub async fn append_raw_event(&self, record: EventRecord) -> Result<()> {
        self.call(|ack| BackgroundRequest::AppendRawEvent { record, ack })
            .await?
    }

    pub async fn state(&self) -> Result<ExtensionState> {
        self.call(|reply| BackgroundRequest::GetState { reply }).await?
    }

    pub async fn update_preferences(&self, preferences: UserPreferences) -> Result<()> {
        self.call(|ack| BackgroundRequest::UpdatePreferences { preferences, ack })
            .await?
    }

    /// Flips the extension switch and returns the new state.
    pub async fn toggle_extension(&self, active_hostname: Option<&str>) -> Result<bool> {
        let active_hostname = active_hostname.map(str::to_string);
        self.call(|reply| BackgroundRequest::ToggleExtension {
            active_hostname,
            reply,
        })
        .await?
    }

    /// Returns `false` when the host was already blocked.
    pub async fn block_site(&self, hostname: &str) -> Result<bool> {
        let hostname = hostname.to_string();
        self.call(|reply| BackgroundRequest::BlockSite { hostname, reply })
            .await?
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> BackgroundRequest,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(build(tx))
            .await
            .map_err(|_| anyhow!("background context is not running"))?;
        rx.await.context("background context dropped the request")
    }
}

pub struct BackgroundService {
    db: Database,
    buffer: TelemetryBuffer,
    settings: ServiceSettings,
    pages: broadcast::Sender<PageMessage>,
}

impl BackgroundService {
    pub fn new(db: Database, buffer: TelemetryBuffer, settings: ServiceSettings) -> Self {
        let (pages, _) = broadcast::channel(PAGE_QUEUE);
        Self {
            db,
            buffer,
            settings,
            pages,
        }
    }

    /// Aligns the stored switch with the auto-start preference. Returns the
    /// new state when it changed.
    pub async fn apply_auto_start(&self) -> Result<Option<bool>> {
        let enabled = self.db.is_enabled().await?;
        if enabled == self.settings.auto_start {
            info!(
                "Auto-start {} and extension already {}",
                self.settings.auto_start,
                if enabled { "active" } else { "inactive" }
            );
            return Ok(None);
        }

        let target = self.settings.auto_start;
        self.db.set_enabled(target).await?;
        info!("Auto-start set extension enabled={target}");
        self.broadcast(PageMessage::ExtensionStateChanged { enabled: target });
        Ok(Some(target))
    }

    /// Serves requests until `cancel_token` fires or every handle is gone.
    pub fn spawn(self, cancel_token: CancellationToken) -> (BackgroundHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel(REQUEST_QUEUE);
        let handle = BackgroundHandle {
            requests: tx,
            pages: self.pages.clone(),
        };

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    request = rx.recv() => match request {
                        Some(request) => self.handle(request).await,
                        None => break,
                    },
                    _ = cancel_token.cancelled() => {
                        info!("background context shutting down");
                        break;
                    }
                }
            }
        });

        (handle, task)
    }

    async fn handle(&self, request: BackgroundRequest) {
        match request {
            BackgroundRequest::AppendRawEvent { record, ack } => {
                let stored = self.db.append_event(EventList::Raw, record).await.map(|_| ());
                let ok = stored.is_ok();
                let _ = ack.send(stored);
                if ok {
                    if let Err(err) = self.buffer.check_immediate_flush().await {
                        warn!("Immediate flush check failed: {err:#}");
                    }
                }
            }
            BackgroundRequest::GetState { reply } => {
                let _ = reply.send(self.state().await);
            }
            BackgroundRequest::UpdatePreferences { preferences, ack } => {
                let _ = ack.send(self.db.set_preferences(preferences).await);
            }
            BackgroundRequest::ToggleExtension {
                active_hostname,
                reply,
            } => {
                let _ = reply.send(self.toggle_extension(active_hostname).await);
            }
            BackgroundRequest::BlockSite { hostname, reply } => {
                let _ = reply.send(self.block_site(&hostname).await);
            }
        }
    }

    async fn state(&self) -> Result<ExtensionState> {
        Ok(ExtensionState {
            is_enabled: self.db.is_enabled().await?,
            preferences: self.db.preferences().await?,
        })
    }

    async fn toggle_extension(&self, active_hostname: Option<String>) -> Result<bool> {
        let enabled = self.db.toggle_enabled().await?;
        self.broadcast(PageMessage::ExtensionStateChanged { enabled });

        let event = RawEvent::ExtensionStateChange {
            extension_state: enabled,
            page_url_hash: active_hostname.as_deref().map(hash_domain),
        };
        if let Err(err) = self.record(event).await {
            error!("Failed to store extension state change raw event: {err:#}");
        }

        if !enabled {
            self.broadcast(PageMessage::ShowSurvey {
                prompt: SurveyPrompt::DisableExtension,
                hostname: active_hostname,
            });
        }
        Ok(enabled)
    }

    async fn block_site(&self, hostname: &str) -> Result<bool> {
        let added = self.db.add_to_blacklist(hostname).await?;
        if !added {
            return Ok(false);
        }

        let event = RawEvent::BlockSite {
            page_url_hash: hash_domain(hostname),
        };
        if let Err(err) = self.record(event).await {
            error!("Failed to store block site raw event: {err:#}");
        }
        Ok(true)
    }

    async fn record(&self, event: RawEvent) -> Result<()> {
        let user_id = self.db.user_id().await?;
        let context = EventContext::without_session(user_id, &self.settings.study_group);
        let record = event.into_record(&context, Utc::now())?;
        self.buffer.append(EventList::Raw, record).await
    }

    fn broadcast(&self, message: PageMessage) {
        // No subscribers simply means no page is open.
        let _ = self.pages.send(message);
    }
}
