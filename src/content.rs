//! One page context: finds eligible text, swaps in simplifications, and
//! records how the reader uses them.

use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use log::warn;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::background::{BackgroundHandle, PageMessage};
use crate::classifier::{Classifier, MutationWatcher};
use crate::db::{Database, EventList};
use crate::page::{Document, NodeId, PageLocation};
use crate::settings::ServiceSettings;
use crate::simplify::SimplificationClient;
use crate::telemetry::events::word_count;
use crate::telemetry::survey::{
    site_survey_candidate, SiteSurveySignals, SITE_SURVEY_MIN_TIME_ON_PAGE_SECS,
    SITE_SURVEY_RECENT_ACTIVITY_SECS,
};
use crate::telemetry::{
    Activity, EventContext, RawEvent, RawEventSink, RollingSession, SessionTracker,
    SiteCloseStats, SurveyAnswers, SurveyGate, SurveyPrompt, TelemetryBuffer, Viewport,
};
use crate::tracking::{BulkToggle, ControlInput, ParagraphTracker, ToggleOutcome, ViewState};

const ENABLE_LOGS: bool = false;

use crate::log_info;

/// Shared dependencies handed to every page context.
#[derive(Clone)]
pub struct ContentServices {
    pub db: Database,
    pub settings: ServiceSettings,
    pub background: Option<BackgroundHandle>,
}

/// Requests from the page context to its host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostRequest {
    /// Report when this element enters the viewport.
    Observe(NodeId),
    ShowPrompt(SurveyPrompt),
}

/// Input from the host while the page is open.
pub enum PageEvent {
    /// The page changed its own content.
    Edit(Box<dyn FnOnce(&mut Document) + Send>),
    Visible(NodeId),
    ControlInput { control: NodeId, input: ControlInput },
    ToggleAll { reply: oneshot::Sender<BulkToggle> },
    Activity(Activity),
    Scroll(Viewport),
    Visibility(bool),
    SurveyAnswers(SurveyAnswers),
}

/// A claimed paragraph whose simplified text has been requested.
struct SimplificationRequest {
    generation: u64,
    id: String,
    text: String,
}

impl SimplificationRequest {
    async fn send(self, client: SimplificationClient) -> SimplificationReply {
        let simplified = client.submit(&self.id, &self.text).await;
        SimplificationReply {
            generation: self.generation,
            id: self.id,
            simplified,
        }
    }
}

struct SimplificationReply {
    generation: u64,
    id: String,
    simplified: Option<String>,
}

pub struct ContentSession {
    doc: Document,
    location: PageLocation,
    enabled: bool,
    visible: bool,
    study_group: String,
    classifier: Classifier,
    watcher: MutationWatcher,
    tracker: ParagraphTracker,
    simplifier: SimplificationClient,
    session: SessionTracker,
    raw_events: RawEventSink,
    surveys: TelemetryBuffer,
    gate: SurveyGate,
    db: Database,
    host: mpsc::UnboundedSender<HostRequest>,
    site_closed: bool,
    /// Bumped on teardown so replies for forgotten paragraphs are dropped.
    generation: u64,
}

impl ContentSession {
    /// `previous` is the rolling session carried over from the last page.
    pub fn new(
        services: &ContentServices,
        mut doc: Document,
        location: PageLocation,
        previous: Option<RollingSession>,
        now: DateTime<Utc>,
    ) -> (Self, mpsc::UnboundedReceiver<HostRequest>) {
        let (host, requests) = mpsc::unbounded_channel();
        let watcher = MutationWatcher::attach(&mut doc);
        let buffer = TelemetryBuffer::new(services.db.clone());

        let session = Self {
            session: SessionTracker::new(location.hostname(), previous, now),
            doc,
            location,
            enabled: false,
            visible: true,
            study_group: services.settings.study_group.clone(),
            classifier: Classifier::new(services.settings.include_block_containers),
            watcher,
            tracker: ParagraphTracker::new(),
            simplifier: SimplificationClient::new(&services.settings, services.db.clone()),
            raw_events: RawEventSink::new(services.background.clone(), buffer.clone()),
            surveys: buffer,
            gate: SurveyGate::new(services.db.clone()),
            db: services.db.clone(),
            host,
            site_closed: false,
            generation: 0,
        };
        (session, requests)
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    pub fn location(&self) -> &PageLocation {
        &self.location
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn tracker(&self) -> &ParagraphTracker {
        &self.tracker
    }

    pub fn rolling_session(&self) -> Option<RollingSession> {
        self.session.rolling_session()
    }

    /// Reads the extension switch and scans the page when it is on.
    pub async fn start(&mut self) -> Result<()> {
        self.enabled = self.db.is_enabled().await?;
        if self.enabled {
            self.initialize();
        }
        Ok(())
    }

    /// Applies a change the page makes to itself.
    pub fn edit(&mut self, change: impl FnOnce(&mut Document)) {
        change(&mut self.doc);
        self.pump_mutations();
    }

    /// Registers content inserted since the last call.
    pub fn pump_mutations(&mut self) {
        if !self.enabled {
            self.watcher.reset();
            return;
        }
        let registered = self.watcher.drain(&self.doc, &self.classifier);
        self.request_observation(registered);
    }

    /// The host saw `node` enter the viewport. Returns whether the page now
    /// shows a simplification for it. `run` does the same without waiting
    /// on the request.
    pub async fn on_visible(&mut self, node: NodeId, now: DateTime<Utc>) -> Result<bool> {
        let Some(request) = self.claim_visible(node) else {
            return Ok(false);
        };
        let reply = request.send(self.simplifier.clone()).await;
        self.finish_simplification(reply, now).await
    }

    fn claim_visible(&mut self, node: NodeId) -> Option<SimplificationRequest> {
        if !self.enabled {
            return None;
        }
        let claimed = self
            .watcher
            .on_intersection(&self.doc, &mut self.classifier, node)?;
        let paragraph = self.tracker.register(&self.doc, claimed.node);
        Some(SimplificationRequest {
            generation: self.generation,
            id: paragraph.id,
            text: paragraph.original_text,
        })
    }

    async fn finish_simplification(
        &mut self,
        reply: SimplificationReply,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if reply.generation != self.generation || !self.enabled {
            log_info!("dropping stale simplification for {}", reply.id);
            return Ok(false);
        }
        let Some(simplified) = reply.simplified else {
            return Ok(false);
        };

        let applied = self
            .tracker
            .apply_simplification(&mut self.doc, &reply.id, simplified);
        self.pump_mutations();
        if applied {
            log_info!("simplified {}", reply.id);
            self.check_site_survey(now).await?;
        }
        Ok(applied)
    }

    pub async fn on_control_input(
        &mut self,
        control: NodeId,
        input: &ControlInput,
        now: DateTime<Utc>,
    ) -> Result<Option<ToggleOutcome>> {
        let Some(outcome) = self.tracker.on_control_input(&mut self.doc, control, input) else {
            return Ok(None);
        };
        self.pump_mutations();

        self.record(
            RawEvent::ToggleParagraph {
                page_url_hash: self.location.hostname_hash(),
                extension_state: self.enabled,
                from_view: outcome.from,
                to_view: outcome.to,
                wordcount_simplified: outcome.wordcount_simplified,
                wordcount_original: outcome.wordcount_original,
            },
            now,
        )
        .await;

        if outcome.to == ViewState::Original {
            self.offer_prompt(SurveyPrompt::ToggleSingleToOriginal).await?;
        }
        Ok(Some(outcome))
    }

    /// Bulk toggle. Records one event for the whole switch and never asks
    /// for a survey.
    pub async fn toggle_all(&mut self, now: DateTime<Utc>) -> BulkToggle {
        let result = self.tracker.toggle_all(&mut self.doc);
        self.pump_mutations();
        if let BulkToggle::Switched { from, to, .. } = result {
            self.record(
                RawEvent::ToggleAllParagraphs {
                    from_view: from,
                    to_view: to,
                },
                now,
            )
            .await;
        }
        result
    }

    pub fn record_activity(&mut self, activity: Activity, now: DateTime<Utc>) {
        self.session.record_activity(activity, now);
    }

    pub fn update_scroll(&mut self, viewport: Viewport) {
        self.session.update_scroll(viewport);
    }

    pub fn tick(&mut self, now: DateTime<Utc>) {
        self.session.tick(now, self.visible);
    }

    /// Hiding the page closes the site visit.
    pub async fn set_visibility(&mut self, visible: bool, now: DateTime<Utc>) {
        self.visible = visible;
        if visible {
            self.session.page_visible(now);
        } else {
            self.site_close(now).await;
        }
    }

    /// Stores the reader's answers to a prompt.
    pub async fn submit_survey(&mut self, answers: SurveyAnswers, now: DateTime<Utc>) -> Result<()> {
        let context = self.event_context(now).await;
        let record = answers.into_record(&context, &self.location.hostname_hash(), now)?;
        self.surveys.append(EventList::Survey, record).await
    }

    pub async fn handle_page_message(&mut self, message: PageMessage) -> Result<()> {
        match message {
            PageMessage::ExtensionStateChanged { enabled } => {
                let was_enabled = self.enabled;
                self.enabled = enabled;
                if enabled && !was_enabled {
                    self.initialize();
                } else if !enabled {
                    self.teardown();
                }
            }
            PageMessage::ShowSurvey { prompt, hostname } => {
                let for_this_page = hostname
                    .as_deref()
                    .map(|host| host == self.location.hostname())
                    .unwrap_or(true);
                if for_this_page {
                    self.offer_prompt(prompt).await?;
                }
            }
        }
        Ok(())
    }

    /// Site-survey check: page-side preconditions, the random draw, then the
    /// daily throttle.
    pub async fn check_site_survey(&mut self, now: DateTime<Utc>) -> Result<bool> {
        let signals = SiteSurveySignals {
            time_on_page: self.session.time_on_page(now),
            interacted_recently: self
                .session
                .interacted_within(Duration::seconds(SITE_SURVEY_RECENT_ACTIVITY_SECS), now),
            altered_paragraphs: self.tracker.altered_stats().altered_paragraphs,
        };
        let drawn = site_survey_candidate(&signals, &mut rand::thread_rng());
        if !drawn {
            return Ok(false);
        }
        self.offer_prompt(SurveyPrompt::SiteSurvey).await
    }

    /// Emits the `siteClose` summary the first time it is called.
    pub async fn site_close(&mut self, now: DateTime<Utc>) -> bool {
        if self.site_closed {
            return false;
        }
        self.site_closed = true;

        let words_total = word_count(&self.doc.text_content(self.doc.body()));
        let altered = self.tracker.altered_stats();
        let percent_altered_words_ever = if words_total > 0 {
            altered.altered_words as f64 / words_total as f64
        } else {
            0.0
        };

        let stats = SiteCloseStats {
            extension_state: self.enabled,
            page_url_hash: Some(self.location.hostname_hash()),
            words_total,
            scroll_depth_percent: self.session.scroll_depth(),
            active_reading_time_ms: self.session.active_reading_ms(),
            toggles_count: self.tracker.toggle_count(),
            altered_paragraphs_count: altered.altered_paragraphs,
            altered_words_ever: altered.altered_words,
            percent_altered_words_ever,
        };
        self.record(RawEvent::SiteClose(stats), now).await;
        true
    }

    /// Serves host input until the event channel closes or `cancel_token`
    /// fires, then closes the visit. Returns the rolling session for the
    /// next page in the tab. Simplification requests run alongside the loop
    /// and are abandoned on exit.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<PageEvent>,
        mut pages: Option<broadcast::Receiver<PageMessage>>,
        cancel_token: CancellationToken,
    ) -> Result<Option<RollingSession>> {
        self.start().await?;

        let mut ticker = time::interval(StdDuration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let survey_check = time::sleep(StdDuration::from_secs(
            SITE_SURVEY_MIN_TIME_ON_PAGE_SECS as u64,
        ));
        tokio::pin!(survey_check);
        let mut survey_pending = true;
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        if let Err(err) = self.handle_event(event, &mut in_flight, Utc::now()).await {
                            warn!("Page event failed: {err:#}");
                        }
                    }
                    None => break,
                },
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => match joined {
                    Ok(reply) => {
                        if let Err(err) = self.finish_simplification(reply, Utc::now()).await {
                            warn!("Applying simplification failed: {err:#}");
                        }
                    }
                    Err(err) => warn!("Simplification task failed: {err}"),
                },
                message = next_page_message(&mut pages) => {
                    if let Some(message) = message {
                        if let Err(err) = self.handle_page_message(message).await {
                            warn!("Page message failed: {err:#}");
                        }
                    }
                }
                _ = ticker.tick() => self.tick(Utc::now()),
                _ = &mut survey_check, if survey_pending => {
                    survey_pending = false;
                    if self.enabled {
                        if let Err(err) = self.check_site_survey(Utc::now()).await {
                            warn!("Site survey check failed: {err:#}");
                        }
                    }
                }
                _ = cancel_token.cancelled() => break,
            }
        }

        in_flight.abort_all();
        self.site_close(Utc::now()).await;
        Ok(self.rolling_session())
    }

    async fn handle_event(
        &mut self,
        event: PageEvent,
        in_flight: &mut JoinSet<SimplificationReply>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match event {
            PageEvent::Edit(change) => self.edit(change),
            PageEvent::Visible(node) => {
                if let Some(request) = self.claim_visible(node) {
                    in_flight.spawn(request.send(self.simplifier.clone()));
                }
            }
            PageEvent::ControlInput { control, input } => {
                self.on_control_input(control, &input, now).await?;
            }
            PageEvent::ToggleAll { reply } => {
                let result = self.toggle_all(now).await;
                let _ = reply.send(result);
            }
            PageEvent::Activity(activity) => self.record_activity(activity, now),
            PageEvent::Scroll(viewport) => {
                self.record_activity(Activity::Scroll, now);
                self.update_scroll(viewport);
            }
            PageEvent::Visibility(visible) => self.set_visibility(visible, now).await,
            PageEvent::SurveyAnswers(answers) => self.submit_survey(answers, now).await?,
        }
        Ok(())
    }

    fn initialize(&mut self) {
        let registered = self.watcher.initial_scan(&self.doc, &self.classifier);
        log_info!("initial scan registered {} elements", registered.len());
        self.request_observation(registered);
    }

    /// Forgets visited elements, tracked paragraphs and visibility
    /// registrations. The page keeps whatever text it currently shows.
    fn teardown(&mut self) {
        self.generation += 1;
        self.classifier.reset();
        self.tracker.reset();
        self.watcher.reset();
    }

    fn request_observation(&self, nodes: Vec<NodeId>) {
        for node in nodes {
            let _ = self.host.send(HostRequest::Observe(node));
        }
    }

    async fn offer_prompt(&self, prompt: SurveyPrompt) -> Result<bool> {
        if !self.gate.admit(prompt).await? {
            log_info!("{:?} prompt throttled", prompt);
            return Ok(false);
        }
        let _ = self.host.send(HostRequest::ShowPrompt(prompt));
        Ok(true)
    }

    async fn event_context(&mut self, now: DateTime<Utc>) -> EventContext {
        let user_id = match self.db.user_id().await {
            Ok(user_id) => user_id,
            Err(err) => {
                warn!("Failed to read user id: {err:#}");
                None
            }
        };
        EventContext {
            user_id,
            session_id: Some(self.session.session_id(now)),
            site_session_id: Some(self.session.site_session_id().to_string()),
            study_group: self.study_group.clone(),
        }
    }

    async fn record(&mut self, event: RawEvent, now: DateTime<Utc>) {
        let event_type = event.event_type();
        let context = self.event_context(now).await;
        let stored = match event.into_record(&context, now) {
            Ok(record) => self.raw_events.persist(record).await,
            Err(err) => Err(err),
        };
        if let Err(err) = stored {
            warn!("Failed to store {event_type} raw event: {err:#}");
        }
    }
}

async fn next_page_message(
    pages: &mut Option<broadcast::Receiver<PageMessage>>,
) -> Option<PageMessage> {
    let Some(receiver) = pages.as_mut() else {
        return std::future::pending().await;
    };
    match receiver.recv().await {
        Ok(message) => Some(message),
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            warn!("Page context missed {skipped} background messages");
            None
        }
        Err(broadcast::error::RecvError::Closed) => {
            *pages = None;
            None
        }
    }
}
