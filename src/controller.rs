//! Drives one submission from admission to a final state.
//!
//! One `StreamController` is built per application session and shared by
//! reference. It owns the session registry, the per-conversation UI book and
//! transcripts, and the event channel consumers listen on.

use crate::accumulator::{IndicatorBoard, IndicatorPhase, IndicatorWindows, MetaOutcome};
use crate::constants::{EVENT_CHANNEL_CAPACITY, MAX_STREAM_RECORDS, STALL_THRESHOLD};
use crate::decoder::frame_stream;
use crate::events::ControllerEvent;
use crate::frames::Frame;
use crate::recovery::{
    classify_end, PollPolicy, RecoveryCoordinator, RecoveryResult, RecoveryScope, RecoveryState,
    StreamEnd,
};
use crate::registry::{SessionGuard, SessionHandle, SessionKey, SessionRegistry};
use crate::router::{dispatch, Routed, SessionContext};
use crate::snapshot::{ConversationUiState, UiStateBook};
use crate::store::MessageStore;
use crate::timing::ThinkingTiming;
use crate::transcript::Transcript;
use crate::transport::{
    Attachment, ByteStream, ContextMode, ModelOverrides, OutboundRequest, ResponseTransport,
};
use crate::types::{
    lock, ConversationId, MessageKey, ObservedError, ResponseMetadata, Result, StoredMessage,
    StreamKeeperError,
};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;
use tracing::Instrument;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControllerConfig {
    pub poll: PollPolicy,
    pub stall_threshold: Duration,
    pub windows: IndicatorWindows,
    pub max_records: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll: PollPolicy::default(),
            stall_threshold: STALL_THRESHOLD,
            windows: IndicatorWindows::default(),
            max_records: MAX_STREAM_RECORDS,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmitRequest {
    pub conversation_id: ConversationId,
    pub message: String,
    pub model_overrides: ModelOverrides,
    pub attachments: Vec<Attachment>,
    pub location: Option<String>,
    pub context_mode: ContextMode,
}

impl SubmitRequest {
    pub fn new(conversation_id: impl Into<ConversationId>, message: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            message: message.into(),
            model_overrides: ModelOverrides::default(),
            attachments: Vec::new(),
            location: None,
            context_mode: ContextMode::default(),
        }
    }

    pub fn with_overrides(mut self, overrides: ModelOverrides) -> Self {
        self.model_overrides = overrides;
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_location(mut self, location: Option<String>) -> Self {
        self.location = location;
        self
    }

    pub fn with_context_mode(mut self, mode: ContextMode) -> Self {
        self.context_mode = mode;
        self
    }

    fn to_outbound(&self) -> OutboundRequest {
        OutboundRequest {
            conversation_id: self.conversation_id.clone(),
            message: self.message.clone(),
            model_overrides: self.model_overrides.clone(),
            attachments: self.attachments.clone(),
            location: self.location.clone(),
            context_mode: self.context_mode,
        }
    }
}

/// How a session that did not fail ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    Recovered,
    /// Recovery ran out of attempts; the partial content stands.
    Abandoned,
    Cancelled,
}

impl SessionOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Recovered => "recovered",
            Self::Abandoned => "abandoned",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FinishedSession {
    pub key: SessionKey,
    pub conversation_id: ConversationId,
    pub message_id: MessageKey,
    pub content: String,
    pub metadata: ResponseMetadata,
    pub thinking: ThinkingTiming,
    pub outcome: SessionOutcome,
}

#[derive(Default)]
struct ViewState {
    ui: UiStateBook,
    transcripts: HashMap<ConversationId, Transcript>,
    expiry_running: bool,
}

impl ViewState {
    fn transcript(&mut self, conversation_id: &ConversationId) -> &mut Transcript {
        self.transcripts.entry(conversation_id.clone()).or_default()
    }
}

enum Step {
    Cancelled,
    Frame(Option<std::result::Result<Frame, StreamKeeperError>>),
    Tick,
}

enum Flow {
    Continue,
    Terminal,
    Abort(StreamKeeperError),
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending::<()>().await,
    }
}

pub struct StreamController<T, S> {
    transport: Arc<T>,
    store: Arc<S>,
    registry: SessionRegistry,
    recovery: Arc<RecoveryCoordinator<S>>,
    config: ControllerConfig,
    events: broadcast::Sender<ControllerEvent>,
    view: Arc<Mutex<ViewState>>,
    expiry_wakeup: Arc<Notify>,
}

impl<T, S> Clone for StreamController<T, S> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            store: self.store.clone(),
            registry: self.registry.clone(),
            recovery: self.recovery.clone(),
            config: self.config,
            events: self.events.clone(),
            view: self.view.clone(),
            expiry_wakeup: self.expiry_wakeup.clone(),
        }
    }
}

impl<T: ResponseTransport, S: MessageStore> StreamController<T, S> {
    pub fn new(transport: Arc<T>, store: Arc<S>, config: ControllerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            recovery: Arc::new(RecoveryCoordinator::new(store.clone(), config.poll)),
            transport,
            store,
            registry: SessionRegistry::new(),
            config,
            events,
            view: Arc::new(Mutex::new(ViewState::default())),
            expiry_wakeup: Arc::new(Notify::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn is_in_flight(&self, conversation_id: &ConversationId, message: &str) -> bool {
        self.registry
            .contains(&SessionKey::derive(conversation_id, message))
    }

    /// User-requested stop of one submission. Never triggers recovery.
    pub fn stop(&self, conversation_id: &ConversationId, message: &str) -> bool {
        self.registry
            .request_stop(&SessionKey::derive(conversation_id, message))
    }

    pub fn stop_conversation(&self, conversation_id: &ConversationId) -> usize {
        self.registry.stop_conversation(conversation_id)
    }

    /// Called when the application regains foreground visibility. Sessions
    /// that went quiet for longer than the stall threshold are interrupted so
    /// they reconcile with the store instead of waiting on a dead connection.
    pub fn on_foreground(&self) -> usize {
        let now = Instant::now();
        let mut forced = 0;
        for handle in self.registry.stalled(now, self.config.stall_threshold) {
            if handle.force_interrupt() {
                tracing::info!(
                    "[FOREGROUND] Forcing interruption check for {} (idle {:?})",
                    handle.key(),
                    handle.idle_for(now)
                );
                forced += 1;
            }
        }
        forced
    }

    pub fn switch_conversation(&self, conversation_id: &ConversationId) -> ConversationUiState {
        self.with_view(|v| v.ui.switch_to(conversation_id).clone())
    }

    pub fn ui_state(&self, conversation_id: &ConversationId) -> Option<ConversationUiState> {
        self.with_view(|v| v.ui.state_of(conversation_id).cloned())
    }

    pub fn transcript(&self, conversation_id: &ConversationId) -> Option<Transcript> {
        self.with_view(|v| v.transcripts.get(conversation_id).cloned())
    }

    pub async fn submit(&self, request: SubmitRequest) -> Result<FinishedSession> {
        let key = SessionKey::derive(&request.conversation_id, &request.message);
        let guard = self.registry.admit(key.clone(), Instant::now())?;
        let span = tracing::info_span!(
            "session",
            cid = %request.conversation_id.short(),
            key = %key
        );
        self.run(request, guard).instrument(span).await
    }

    async fn run(&self, request: SubmitRequest, guard: SessionGuard) -> Result<FinishedSession> {
        let handle = guard.handle().clone();
        let cid = request.conversation_id.clone();
        let started = Instant::now();
        let wall_started = Utc::now();

        let mut ctx = SessionContext::new(
            handle.key().clone(),
            request.model_overrides.reasoning_effort,
            self.config.windows,
        );
        ctx.timing.start(started);
        let draft_id = ctx.accumulator.draft().ephemeral_id.clone();
        let timing = ctx.thinking(started);
        let pending = ctx.accumulator.display().indicator();

        self.with_view(|v| {
            let transcript = v.transcript(&cid);
            transcript.push_user(&request.message);
            transcript.begin_draft(draft_id.clone());
            transcript.set_timing(&draft_id, timing.clone());
            v.ui.update(&cid, |ui| {
                ui.is_streaming = true;
                ui.indicators = IndicatorBoard::default();
                ui.response_timing = Some(timing);
                ui.pending_thinking = Some(pending);
            });
        });
        self.publish(ControllerEvent::SessionStarted {
            conversation_id: cid.clone(),
            message_id: draft_id,
        });
        tracing::info!("[SESSION] Started ({} chars)", request.message.chars().count());

        let cancel = handle.cancel_token();
        let outbound = request.to_outbound();
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.transport.open(&outbound, cancel.clone()) => Some(result),
        };

        let result = match opened {
            Some(Ok(body)) => {
                let failure = self.read_loop(body, &mut ctx, &handle).await;
                self.conclude(ctx, &handle, wall_started, failure).await
            }
            Some(Err(e)) => Err(self.fail_before_stream(ctx, e.inner)),
            None => self.conclude(ctx, &handle, wall_started, None).await,
        };

        drop(guard);
        self.schedule_indicator_expiry();
        result
    }

    async fn read_loop(
        &self,
        body: ByteStream,
        ctx: &mut SessionContext,
        handle: &SessionHandle,
    ) -> Option<StreamKeeperError> {
        let cancel = handle.cancel_token();
        let mut frames = frame_stream(body);
        let mut records = 0usize;

        loop {
            let deadline = ctx.accumulator.indicators().next_deadline();
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Cancelled,
                item = frames.next() => Step::Frame(item),
                _ = sleep_until_opt(deadline) => Step::Tick,
            };

            match step {
                Step::Cancelled => {
                    tracing::debug!(
                        "[SESSION] Read aborted (stop requested: {})",
                        handle.stop_requested()
                    );
                    return None;
                }
                Step::Tick => self.expire_session_indicators(ctx, Instant::now()),
                Step::Frame(None) => {
                    tracing::debug!("[SESSION] Transport reached end of stream");
                    return None;
                }
                Step::Frame(Some(Err(e))) => {
                    tracing::warn!("[SESSION] Transport read failed: {}", e);
                    return None;
                }
                Step::Frame(Some(Ok(frame))) => {
                    records += 1;
                    if records > self.config.max_records {
                        tracing::error!(
                            "[SESSION] Stream exceeded max record limit ({})",
                            self.config.max_records
                        );
                        return Some(StreamKeeperError::Stream(format!(
                            "Stream exceeded max record limit ({})",
                            self.config.max_records
                        )));
                    }
                    let now = Instant::now();
                    handle.touch(now);
                    let routed = dispatch(frame, ctx, now);
                    match self.apply(ctx, routed, now) {
                        Flow::Continue => {}
                        Flow::Terminal => return None,
                        Flow::Abort(e) => return Some(e),
                    }
                }
            }
        }
    }

    /// The transcript is addressed by the draft's ephemeral id, which keeps
    /// resolving after promotion. Events carry the draft's current key.
    fn apply(&self, ctx: &SessionContext, routed: Routed, now: Instant) -> Flow {
        let cid = &ctx.conversation_id;
        let draft = ctx.accumulator.draft();
        let slot = &draft.ephemeral_id;
        let id = draft.key().clone();

        match routed {
            Routed::Ignored => {}
            Routed::Content { first_token } => {
                self.publish_content(cid, slot, &id, &draft.content);
                if let Some(elapsed) = first_token {
                    let timing = ctx.thinking(now);
                    self.with_view(|v| {
                        let transcript = v.transcript(cid);
                        transcript.set_timing(slot, timing.clone());
                        transcript.set_metadata(slot, &draft.metadata);
                        v.ui.update(cid, |ui| {
                            ui.response_timing = Some(timing.clone());
                            ui.pending_thinking = None;
                        });
                    });
                    self.publish(ControllerEvent::ThinkingRecorded {
                        conversation_id: cid.clone(),
                        message_id: id,
                        elapsed_ms: elapsed.as_millis() as u64,
                        label: timing.label,
                    });
                }
            }
            Routed::Preamble => {
                self.with_view(|v| v.transcript(cid).set_preamble(slot, &draft.preamble));
                self.publish(ControllerEvent::Preamble {
                    conversation_id: cid.clone(),
                    message_id: id,
                    preamble: draft.preamble.clone(),
                });
            }
            Routed::Indicator(channel) => {
                let board = ctx.accumulator.indicators().clone();
                let phase = board.get(channel).phase.clone();
                self.with_view(|v| v.ui.update(cid, |ui| ui.indicators = board));
                self.publish(ControllerEvent::Indicator {
                    conversation_id: cid.clone(),
                    channel,
                    phase,
                });
            }
            Routed::SourceDomain => {
                self.with_view(|v| v.transcript(cid).set_metadata(slot, &draft.metadata));
                self.publish(ControllerEvent::SourceDomains {
                    conversation_id: cid.clone(),
                    domains: ctx.accumulator.domains().as_slice().to_vec(),
                });
            }
            Routed::Routing { indicator_promoted } => {
                let indicator = ctx.accumulator.display().indicator();
                let waiting = ctx.timing.elapsed().is_none();
                self.with_view(|v| {
                    v.transcript(cid).set_metadata(slot, &draft.metadata);
                    if waiting {
                        v.ui.update(cid, |ui| ui.pending_thinking = Some(indicator));
                    }
                });
                if indicator_promoted {
                    tracing::debug!("[SESSION] Thinking indicator promoted to {:?}", indicator);
                }
                self.publish(ControllerEvent::Routing {
                    conversation_id: cid.clone(),
                    metadata: draft.metadata.clone(),
                    indicator,
                });
            }
            Routed::Meta(outcome) => self.apply_meta(ctx, outcome),
            Routed::Terminal => return Flow::Terminal,
            Routed::Failed(fault) => return Flow::Abort(StreamKeeperError::Stream(fault.message)),
            Routed::UsageLimit(message) => {
                return Flow::Abort(StreamKeeperError::UsageLimitExceeded(message))
            }
        }
        Flow::Continue
    }

    fn apply_meta(&self, ctx: &SessionContext, outcome: MetaOutcome) {
        let cid = &ctx.conversation_id;
        let draft = ctx.accumulator.draft();
        let slot = &draft.ephemeral_id;
        let id = draft.key().clone();

        if let Some(promotion) = outcome.promotion {
            let promoted = self.with_view(|v| {
                v.transcript(cid)
                    .promote(&promotion.ephemeral_id, &promotion.persisted_id)
            });
            if promoted {
                tracing::info!(
                    "[SESSION] Promoted {} -> {}",
                    promotion.ephemeral_id,
                    promotion.persisted_id
                );
                self.publish(ControllerEvent::Promoted {
                    conversation_id: cid.clone(),
                    ephemeral_id: promotion.ephemeral_id,
                    persisted_id: promotion.persisted_id,
                });
            }
        }

        self.with_view(|v| v.transcript(cid).set_metadata(slot, &draft.metadata));
        if outcome.content_replaced {
            self.publish_content(cid, slot, &id, &draft.content);
        }
        if let Some(write_back) = outcome.write_back {
            self.spawn_write_back(write_back.message_id, write_back.metadata);
        }
    }

    fn publish_content(
        &self,
        cid: &ConversationId,
        slot: &MessageKey,
        id: &MessageKey,
        content: &str,
    ) {
        let synced = self.with_view(|v| v.transcript(cid).sync_content(slot, content));
        if let Some((delta, replaced)) = synced {
            self.publish(ControllerEvent::Content {
                conversation_id: cid.clone(),
                message_id: id.clone(),
                delta,
                replaced,
            });
        }
    }

    fn expire_session_indicators(&self, ctx: &mut SessionContext, now: Instant) {
        let expired = ctx.accumulator.expire_indicators(now);
        if expired.is_empty() {
            return;
        }
        let board = ctx.accumulator.indicators().clone();
        let cid = ctx.conversation_id.clone();
        self.with_view(|v| v.ui.update(&cid, |ui| ui.indicators = board));
        for channel in expired {
            self.publish(ControllerEvent::Indicator {
                conversation_id: cid.clone(),
                channel,
                phase: IndicatorPhase::Idle,
            });
        }
    }

    /// Best effort: a failed write-back is logged and otherwise ignored.
    fn spawn_write_back(&self, message_id: MessageKey, metadata: ResponseMetadata) {
        let store = self.store.clone();
        tokio::spawn(
            async move {
                match store.write_metadata(&message_id, &metadata).await {
                    Ok(()) => {
                        tracing::debug!("[WRITE-BACK] Persisted client timing for {}", message_id)
                    }
                    Err(e) => tracing::warn!("[WRITE-BACK] Failed for {}: {}", message_id, e.inner),
                }
            }
            .in_current_span(),
        );
    }

    fn fail_before_stream(&self, ctx: SessionContext, error: StreamKeeperError) -> ObservedError {
        let cid = ctx.conversation_id.clone();
        let id = ctx.accumulator.draft().ephemeral_id.clone();
        tracing::error!("[SESSION] Transport failed before any record: {}", error);
        self.with_view(|v| {
            v.transcript(&cid).discard(&id);
            v.ui.update(&cid, |ui| {
                ui.is_streaming = false;
                ui.pending_thinking = None;
                ui.response_timing = None;
            });
        });
        ctx.metric.log_summary(&ctx.key.to_string(), "transport_error");
        self.publish_failure(&cid, &error);
        error.into()
    }

    fn publish_failure(&self, cid: &ConversationId, error: &StreamKeeperError) {
        let event = match error {
            StreamKeeperError::UsageLimitExceeded(message) => ControllerEvent::UsageLimit {
                conversation_id: cid.clone(),
                message: message.clone(),
            },
            other => ControllerEvent::Failed {
                conversation_id: cid.clone(),
                message: other.to_string(),
            },
        };
        self.publish(event);
    }

    async fn conclude(
        &self,
        ctx: SessionContext,
        handle: &SessionHandle,
        wall_started: DateTime<Utc>,
        failure: Option<StreamKeeperError>,
    ) -> Result<FinishedSession> {
        if let Some(error) = failure {
            return Err(self.finalize_failed(ctx, error));
        }

        let end = classify_end(ctx.terminal_seen, handle.stop_requested(), ctx.observed_payload);
        tracing::debug!("[SESSION] Stream ended: {:?}", end);
        match end {
            StreamEnd::Terminal => Ok(self.finalize(ctx, SessionOutcome::Completed)),
            StreamEnd::Stopped => Ok(self.finalize(ctx, SessionOutcome::Cancelled)),
            StreamEnd::Interrupted => Ok(self.recover(ctx, handle, wall_started).await),
            StreamEnd::NothingObserved => Err(self.fail_before_stream(
                ctx,
                StreamKeeperError::Transport("stream ended before any record arrived".to_string()),
            )),
        }
    }

    fn finalize_failed(&self, ctx: SessionContext, error: StreamKeeperError) -> ObservedError {
        let cid = ctx.conversation_id.clone();
        let thinking = ctx.thinking(Instant::now());
        ctx.metric.log_summary(&ctx.key.to_string(), "failed");
        let draft = ctx.accumulator.into_draft();
        let slot = &draft.ephemeral_id;
        tracing::warn!("[SESSION] Ended with error: {}", error);

        self.with_view(|v| {
            let transcript = v.transcript(&cid);
            if draft.content.is_empty() {
                transcript.discard(slot);
            } else {
                transcript.sync_content(slot, &draft.content);
                transcript.set_metadata(slot, &draft.metadata);
                transcript.finish(slot);
            }
            v.ui.update(&cid, |ui| {
                ui.is_streaming = false;
                ui.pending_thinking = None;
                ui.response_timing = Some(thinking);
            });
        });
        self.publish_failure(&cid, &error);
        error.into()
    }

    fn finalize(&self, ctx: SessionContext, outcome: SessionOutcome) -> FinishedSession {
        let thinking = ctx.thinking(Instant::now());
        let key = ctx.key.clone();
        let cid = ctx.conversation_id.clone();
        ctx.metric.log_summary(&key.to_string(), outcome.as_str());
        let draft = ctx.accumulator.into_draft();
        let slot = &draft.ephemeral_id;
        let id = draft.key().clone();
        let discard = outcome == SessionOutcome::Cancelled
            && draft.content.is_empty()
            && draft.persisted_id.is_none();

        self.with_view(|v| {
            let transcript = v.transcript(&cid);
            if discard {
                transcript.discard(slot);
            } else {
                transcript.sync_content(slot, &draft.content);
                transcript.set_preamble(slot, &draft.preamble);
                transcript.set_metadata(slot, &draft.metadata);
                transcript.set_timing(slot, thinking.clone());
                transcript.finish(slot);
            }
        });
        self.settle(&cid, &id, &thinking, outcome);

        FinishedSession {
            key,
            conversation_id: cid,
            message_id: id,
            content: draft.content,
            metadata: draft.metadata,
            thinking,
            outcome,
        }
    }

    async fn recover(
        &self,
        ctx: SessionContext,
        handle: &SessionHandle,
        wall_started: DateTime<Utc>,
    ) -> FinishedSession {
        let cid = ctx.conversation_id.clone();
        tracing::info!(
            "[SESSION] Transport ended without a terminal record after {} records",
            ctx.metric.records
        );
        self.enter(handle, &cid, RecoveryState::Interrupted);
        self.enter(handle, &cid, RecoveryState::Recovering);

        let slot = &ctx.accumulator.draft().ephemeral_id;
        let earlier_replies = self.with_view(|v| v.transcript(&cid).other_assistant_ids(slot));
        let scope = RecoveryScope::new(ctx.accumulator.content_len(), wall_started)
            .with_foreign_ids(earlier_replies);
        let result = self.recovery.recover(&cid, scope).await;

        match result {
            RecoveryResult::Resolved { record, .. } => {
                self.enter(handle, &cid, RecoveryState::Resolved);
                self.resolve(ctx, record)
            }
            RecoveryResult::Abandoned { .. } => {
                self.enter(handle, &cid, RecoveryState::Abandoned);
                self.finalize(ctx, SessionOutcome::Abandoned)
            }
        }
    }

    fn resolve(&self, ctx: SessionContext, record: StoredMessage) -> FinishedSession {
        let thinking = ctx.thinking(Instant::now());
        let key = ctx.key.clone();
        let cid = ctx.conversation_id.clone();
        ctx.metric.log_summary(&key.to_string(), SessionOutcome::Recovered.as_str());
        let draft = ctx.accumulator.into_draft();
        let slot = &draft.ephemeral_id;
        let draft_id = draft.key().clone();

        let mut metadata = record.metadata.clone();
        let client_override = match draft.metadata.thinking_ms {
            Some(ms) if record.metadata.thinking_ms != Some(ms) => {
                metadata.thinking_ms = Some(ms);
                metadata.thinking_label.clone_from(&draft.metadata.thinking_label);
                true
            }
            _ => false,
        };
        metadata.fill_missing_from(&draft.metadata);

        let reconciled = self.with_view(|v| {
            let transcript = v.transcript(&cid);
            let reconciled = transcript.reconcile(slot, &record, &metadata);
            transcript.set_timing(slot, thinking.clone());
            reconciled
        });
        tracing::info!("[SESSION] Reconciled with store record {} ({:?})", record.id, reconciled);

        if draft_id != record.id {
            self.publish(ControllerEvent::Promoted {
                conversation_id: cid.clone(),
                ephemeral_id: draft_id,
                persisted_id: record.id.clone(),
            });
        }
        self.publish(ControllerEvent::Content {
            conversation_id: cid.clone(),
            message_id: record.id.clone(),
            delta: record.content.clone(),
            replaced: true,
        });
        if client_override {
            self.spawn_write_back(record.id.clone(), metadata.clone());
        }
        self.settle(&cid, &record.id, &thinking, SessionOutcome::Recovered);

        FinishedSession {
            key,
            conversation_id: cid,
            message_id: record.id,
            content: record.content,
            metadata,
            thinking,
            outcome: SessionOutcome::Recovered,
        }
    }

    fn enter(&self, handle: &SessionHandle, cid: &ConversationId, state: RecoveryState) {
        handle.set_phase(state);
        self.publish(ControllerEvent::Recovery {
            conversation_id: cid.clone(),
            state,
        });
    }

    fn settle(
        &self,
        cid: &ConversationId,
        id: &MessageKey,
        thinking: &ThinkingTiming,
        outcome: SessionOutcome,
    ) {
        self.with_view(|v| {
            v.ui.update(cid, |ui| {
                ui.is_streaming = false;
                ui.pending_thinking = None;
                ui.response_timing = Some(thinking.clone());
            })
        });
        tracing::info!("[SESSION] Finalized {} as {}", id, outcome.as_str());
        self.publish(ControllerEvent::Finalized {
            conversation_id: cid.clone(),
            message_id: id.clone(),
            outcome,
        });
    }

    /// Indicators left in a complete or error phase when a session ends still
    /// fall back to idle after their window. A single task per controller
    /// does this. Conversations with a session in flight are expired by that
    /// session's read loop instead.
    fn schedule_indicator_expiry(&self) {
        let registry = &self.registry;
        let spawn = self.with_view(|v| {
            if v.expiry_running || v.ui.next_deadline(&registry.busy_conversations()).is_none() {
                return false;
            }
            v.expiry_running = true;
            true
        });
        if !spawn {
            self.expiry_wakeup.notify_one();
            return;
        }

        let view = self.view.clone();
        let events = self.events.clone();
        let registry = self.registry.clone();
        let wakeup = self.expiry_wakeup.clone();
        tokio::spawn(async move {
            loop {
                let (expired, next) = {
                    let mut state = lock(&view);
                    let busy = registry.busy_conversations();
                    let expired = state.ui.expire_indicators(Instant::now(), &busy);
                    let next = state.ui.next_deadline(&busy);
                    if next.is_none() {
                        state.expiry_running = false;
                    }
                    (expired, next)
                };
                for (conversation_id, channel) in expired {
                    let _ = events.send(ControllerEvent::Indicator {
                        conversation_id,
                        channel,
                        phase: IndicatorPhase::Idle,
                    });
                }
                let deadline = match next {
                    Some(d) => d,
                    None => break,
                };
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = wakeup.notified() => {}
                }
            }
            tracing::debug!("[EXPIRY] No indicator deadlines left");
        });
    }

    fn with_view<R>(&self, f: impl FnOnce(&mut ViewState) -> R) -> R {
        let mut state = lock(&self.view);
        f(&mut state)
    }

    fn publish(&self, event: ControllerEvent) {
        let _ = self.events.send(event);
    }
}
