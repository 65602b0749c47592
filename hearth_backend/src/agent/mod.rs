//! Conversation agent: the summarize → plan → respond pipeline and the
//! orchestrator that drives it on a fixed polling cadence.

pub mod planner;
pub mod prompts;
pub mod responder;
pub mod summarizer;

use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use crate::config::AgentConfig;
use crate::conversation::transcript::preview;
use crate::conversation::{ContactBook, ConversationWindow, Cursor, Event};
use crate::error::ConfigurationError;
use crate::llm_client::Message;
use crate::source::{record_seq, Dispatcher, MessageSource, SourceRecord};

pub use planner::{FixedPlanner, LlmPlanner, Plan, Planner};
pub use responder::{ReplyDecision, Responder, ResponseMode};
pub use summarizer::{Summarizer, Summary};

const LOG_PREVIEW_CHARS: usize = 160;

/// Read-only view of the window handed to each stage.
#[derive(Clone, Copy)]
pub struct WindowView<'a> {
    window: &'a ConversationWindow,
    contacts: &'a ContactBook,
    max_lines: usize,
}

impl<'a> WindowView<'a> {
    pub fn new(window: &'a ConversationWindow, contacts: &'a ContactBook, max_lines: usize) -> Self {
        Self {
            window,
            contacts,
            max_lines,
        }
    }

    pub fn window(&self) -> &'a ConversationWindow {
        self.window
    }

    pub fn contacts(&self) -> &'a ContactBook {
        self.contacts
    }

    /// The most recent `max_lines` events as model turns.
    pub fn chat_messages(&self) -> Vec<Message> {
        self.window.chat_messages(self.max_lines, self.contacts)
    }

    pub fn pending_foreign(&self) -> Vec<&'a Event> {
        self.window.pending_foreign()
    }

    pub fn last_reply(&self) -> Option<&'a str> {
        self.window.last_self_text()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Init,
    Startup,
    Polling,
    Processing,
    Stopped,
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "INIT",
            Self::Startup => "STARTUP",
            Self::Polling => "POLLING",
            Self::Processing => "PROCESSING",
            Self::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

/// Result of one pass through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The source had nothing new.
    Idle,
    /// Only self echoes or unreadable rows arrived.
    NoForeign { ingested: usize },
    Replied(String),
    Skipped(String),
    /// A reply was generated after stop was requested and was not sent.
    Discarded,
    DeliveryFailed(String),
    SourceFailed(String),
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::NoForeign { ingested } => write!(f, "no new foreign events ({} ingested)", ingested),
            Self::Replied(text) => write!(f, "replied: {}", preview(text, LOG_PREVIEW_CHARS)),
            Self::Skipped(reason) => write!(f, "skipped: {}", reason),
            Self::Discarded => write!(f, "reply discarded after stop"),
            Self::DeliveryFailed(reason) => write!(f, "delivery failed: {}", reason),
            Self::SourceFailed(reason) => write!(f, "poll failed: {}", reason),
        }
    }
}

/// Mutable state owned by exactly one orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestrationContext {
    pub state: OrchestratorState,
    pub window: ConversationWindow,
    pub cursor: Cursor,
    pub summary: Summary,
    pub polls_since_summary: u32,
}

impl OrchestrationContext {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: OrchestratorState::Init,
            window: ConversationWindow::new(capacity),
            cursor: Cursor::default(),
            summary: Summary::empty(),
            polls_since_summary: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub check_interval: Duration,
    pub window_capacity: usize,
    pub context_window: usize,
    /// Re-summarize every N polls; 0 disables refresh.
    pub summary_refresh_polls: u32,
    pub startup_reply: bool,
    pub startup_topic: bool,
    pub minimal_ack_skip_probability: f64,
}

impl OrchestratorSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            check_interval: Duration::from_secs(config.check_interval_secs),
            window_capacity: config.max_history_size,
            context_window: config.context_window,
            summary_refresh_polls: config.summary_refresh_polls,
            startup_reply: config.startup_reply,
            startup_topic: config.startup_topic,
            minimal_ack_skip_probability: config.minimal_ack_skip_probability,
        }
    }
}

/// External stop request, observed only between pipeline steps.
#[derive(Clone)]
pub struct StopSignal {
    rx: flume::Receiver<()>,
}

impl StopSignal {
    pub fn channel() -> (flume::Sender<()>, Self) {
        let (tx, rx) = flume::bounded(1);
        (tx, Self { rx })
    }

    /// True once a stop was sent or every sender is gone.
    pub fn is_requested(&self) -> bool {
        !self.rx.is_empty() || self.rx.is_disconnected()
    }

    async fn requested(&self) {
        let _ = self.rx.recv_async().await;
    }

    /// Sends a stop once `signal` fires. If the listener cannot be installed
    /// the sender is held forever, so the run continues.
    pub async fn forward<F>(stop_tx: flume::Sender<()>, signal: F)
    where
        F: Future<Output = io::Result<()>>,
    {
        match signal.await {
            Ok(()) => {
                tracing::info!("Stop requested, finishing current cycle");
                let _ = stop_tx.try_send(());
            }
            Err(e) => {
                tracing::error!("Could not listen for stop requests: {}", e);
                std::future::pending::<()>().await;
                drop(stop_tx);
            }
        }
    }
}

pub struct Orchestrator {
    source: Arc<dyn MessageSource>,
    dispatcher: Arc<dyn Dispatcher>,
    summarizer: Summarizer,
    planner: Box<dyn Planner>,
    responder: Responder,
    contacts: ContactBook,
    settings: OrchestratorSettings,
    ctx: OrchestrationContext,
}

impl Orchestrator {
    pub fn new(
        source: Arc<dyn MessageSource>,
        dispatcher: Arc<dyn Dispatcher>,
        summarizer: Summarizer,
        planner: Box<dyn Planner>,
        responder: Responder,
        contacts: ContactBook,
        settings: OrchestratorSettings,
    ) -> Self {
        let ctx = OrchestrationContext::new(settings.window_capacity);
        Self {
            source,
            dispatcher,
            summarizer,
            planner,
            responder,
            contacts,
            settings,
            ctx,
        }
    }

    pub fn context(&self) -> &OrchestrationContext {
        &self.ctx
    }

    pub fn state(&self) -> OrchestratorState {
        self.ctx.state
    }

    fn transition(&mut self, next: OrchestratorState) {
        if self.ctx.state != next {
            tracing::info!("state: {} -> {}", self.ctx.state, next);
            self.ctx.state = next;
        }
    }

    /// Runs INIT, STARTUP and the polling loop until `stop` fires.
    pub async fn run(&mut self, stop: &StopSignal) -> Result<(), ConfigurationError> {
        self.initialize().await?;

        if !stop.is_requested() {
            self.startup(stop).await;
        }

        while !stop.is_requested() {
            self.transition(OrchestratorState::Polling);
            tokio::select! {
                _ = sleep(self.settings.check_interval) => {}
                _ = stop.requested() => break,
            }

            let outcome = self.poll_once(stop).await;
            match &outcome {
                CycleOutcome::Idle => tracing::debug!("Cycle: {}", outcome),
                _ => tracing::info!("Cycle: {}", outcome),
            }
            if stop.is_requested() {
                break;
            }
            self.maybe_refresh_summary().await;
        }

        self.transition(OrchestratorState::Stopped);
        tracing::info!("Orchestrator stopped at cursor {}", self.ctx.cursor);
        Ok(())
    }

    /// INIT: start from the source's current tail so the backlog is not
    /// treated as new.
    pub async fn initialize(&mut self) -> Result<(), ConfigurationError> {
        let tail = self
            .source
            .latest_cursor()
            .await
            .map_err(|e| ConfigurationError::SourceUnavailable {
                path: "message source".to_string(),
                reason: e.to_string(),
            })?;
        self.ctx.cursor.reset(tail.seq());
        tracing::info!(
            "Initialized: cursor {}, {} contact handle(s), planner '{}'",
            self.ctx.cursor,
            self.contacts.len(),
            self.planner.name()
        );
        Ok(())
    }

    /// STARTUP: load the backlog, summarize it, and optionally catch up on
    /// anything still waiting for a reply.
    pub async fn startup(&mut self, stop: &StopSignal) -> Option<CycleOutcome> {
        self.transition(OrchestratorState::Startup);

        match self.source.bootstrap_tail(self.settings.window_capacity).await {
            Ok(records) => {
                let (events, max_seq) = split_records(records);
                let added = self.ctx.window.ingest(events);
                if let Some(seq) = max_seq {
                    self.ctx.cursor.advance_to(seq);
                }
                tracing::info!("Startup backlog: {} event(s)", added.len());
            }
            Err(e) => tracing::warn!("Startup backlog unavailable: {}", e),
        }

        self.refresh_summary().await;

        if !self.settings.startup_reply || stop.is_requested() {
            return None;
        }

        let outcome = match self.decide(ResponseMode::CatchUp).await {
            ReplyDecision::Skip(reason) if self.settings.startup_topic => {
                tracing::info!("Catch-up skipped ({}), opening a new topic", reason);
                let decision = self
                    .responder
                    .startup_topic(&self.ctx.summary, self.ctx.window.last_self_text())
                    .await;
                self.apply(decision, stop).await
            }
            decision => self.apply(decision, stop).await,
        };
        tracing::info!("Startup: {}", outcome);
        Some(outcome)
    }

    /// One POLLING tick, entering PROCESSING when foreign events arrived.
    pub async fn poll_once(&mut self, stop: &StopSignal) -> CycleOutcome {
        let records = match self.source.poll(self.ctx.cursor).await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!("Poll failed, cursor stays at {}: {}", self.ctx.cursor, e);
                return CycleOutcome::SourceFailed(e.to_string());
            }
        };
        self.ctx.polls_since_summary = self.ctx.polls_since_summary.saturating_add(1);

        if records.is_empty() {
            return CycleOutcome::Idle;
        }

        let (events, max_seq) = split_records(records);
        if !events.iter().any(Event::is_foreign) {
            let added = self.ctx.window.ingest(events);
            self.advance_cursor(max_seq);
            return CycleOutcome::NoForeign {
                ingested: added.len(),
            };
        }

        self.transition(OrchestratorState::Processing);
        let added = self.ctx.window.ingest(events);
        tracing::debug!("Ingested {} new event(s), window holds {}", added.len(), self.ctx.window.len());

        let decision = self.decide(ResponseMode::Live).await;
        let outcome = self.apply(decision, stop).await;

        // Advance even when generation failed so the same rows are not replayed.
        self.advance_cursor(max_seq);
        self.transition(OrchestratorState::Polling);
        outcome
    }

    async fn decide(&self, mode: ResponseMode) -> ReplyDecision {
        let view = WindowView::new(&self.ctx.window, &self.contacts, self.settings.context_window);
        let summary = &self.ctx.summary;

        if let Some(reason) = Responder::skip_before_generation(&view, summary) {
            return ReplyDecision::skip(reason);
        }

        let plan = self.planner.plan(&view, summary).await;
        if let Some(reason) = plan.skip_reason(self.settings.minimal_ack_skip_probability, rand::random::<f64>()) {
            return ReplyDecision::skip(reason);
        }

        self.responder.respond(&view, summary, &plan, mode).await
    }

    async fn apply(&mut self, decision: ReplyDecision, stop: &StopSignal) -> CycleOutcome {
        let text = match decision {
            ReplyDecision::Skip(reason) => return CycleOutcome::Skipped(reason),
            ReplyDecision::Send(text) => text,
        };

        if stop.is_requested() {
            tracing::info!("Stop requested, discarding reply: {}", preview(&text, LOG_PREVIEW_CHARS));
            return CycleOutcome::Discarded;
        }

        match self.dispatcher.send(&text).await {
            Ok(receipt) => {
                let sender = self.contacts.bot_name().to_string();
                self.ctx
                    .window
                    .record_local_reply(sender, receipt.text, receipt.sent_at);
                CycleOutcome::Replied(text)
            }
            Err(e) => {
                tracing::error!("Failed to send reply: {}", e);
                CycleOutcome::DeliveryFailed(e.to_string())
            }
        }
    }

    fn advance_cursor(&mut self, max_seq: Option<i64>) {
        if let Some(seq) = max_seq {
            if self.ctx.cursor.advance_to(seq) {
                tracing::debug!("Cursor advanced to {}", self.ctx.cursor);
            }
        }
    }

    async fn maybe_refresh_summary(&mut self) {
        let every = self.settings.summary_refresh_polls;
        if every > 0 && self.ctx.polls_since_summary >= every {
            self.refresh_summary().await;
        }
    }

    async fn refresh_summary(&mut self) {
        let view = WindowView::new(&self.ctx.window, &self.contacts, self.settings.context_window);
        let summary = self.summarizer.summarize(&view).await;
        self.ctx.summary = summary;
        self.ctx.polls_since_summary = 0;
    }
}

/// Splits a batch into usable events and the highest row id seen, dropping
/// malformed rows with a warning.
fn split_records(records: Vec<SourceRecord>) -> (Vec<Event>, Option<i64>) {
    let max_seq = records.iter().filter_map(record_seq).max();
    let events = records
        .into_iter()
        .filter_map(|record| match record {
            Ok(event) => Some(event),
            Err(malformed) => {
                tracing::warn!("Dropping {}", malformed);
                None
            }
        })
        .collect();
    (events, max_seq)
}
