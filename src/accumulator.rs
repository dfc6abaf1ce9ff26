//! Incremental assembly of the assistant draft.
//!
//! Content is append-only while a session is active. Timing metadata is
//! set once and never overwritten: client-measured thinking time takes
//! precedence over whatever the server reports.

use crate::constants::{INDICATOR_COMPLETE_WINDOW, INDICATOR_ERROR_WINDOW};
use crate::frames::{MetaPayload, ModelInfo, StatusEvent, StreamFault};
use crate::timing::{thinking_label, ThinkingDisplay};
use crate::types::{char_len, ConversationId, MessageKey, ReasoningEffort, ResponseMetadata};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndicatorChannel {
    WebSearch,
    FileReading,
    CodeExecution,
}

impl IndicatorChannel {
    pub const ALL: [IndicatorChannel; 3] =
        [Self::WebSearch, Self::FileReading, Self::CodeExecution];

    pub fn label(self) -> &'static str {
        match self {
            Self::WebSearch => "web search",
            Self::FileReading => "file reading",
            Self::CodeExecution => "code execution",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndicatorSignal {
    Start,
    Complete,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum IndicatorPhase {
    #[default]
    Idle,
    Active { detail: Option<String> },
    Complete { detail: Option<String> },
    Error { message: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChannelIndicator {
    pub phase: IndicatorPhase,
    pub expires_at: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndicatorWindows {
    pub complete: Duration,
    pub error: Duration,
}

impl Default for IndicatorWindows {
    fn default() -> Self {
        Self {
            complete: INDICATOR_COMPLETE_WINDOW,
            error: INDICATOR_ERROR_WINDOW,
        }
    }
}

/// Independent indicator state per auxiliary channel:
/// idle -> active -> (complete | error) -> idle after a window, unless
/// re-triggered first.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IndicatorBoard {
    web_search: ChannelIndicator,
    file_reading: ChannelIndicator,
    code_execution: ChannelIndicator,
}

impl IndicatorBoard {
    pub fn get(&self, channel: IndicatorChannel) -> &ChannelIndicator {
        match channel {
            IndicatorChannel::WebSearch => &self.web_search,
            IndicatorChannel::FileReading => &self.file_reading,
            IndicatorChannel::CodeExecution => &self.code_execution,
        }
    }

    fn get_mut(&mut self, channel: IndicatorChannel) -> &mut ChannelIndicator {
        match channel {
            IndicatorChannel::WebSearch => &mut self.web_search,
            IndicatorChannel::FileReading => &mut self.file_reading,
            IndicatorChannel::CodeExecution => &mut self.code_execution,
        }
    }

    pub fn apply(
        &mut self,
        channel: IndicatorChannel,
        signal: IndicatorSignal,
        detail: Option<String>,
        now: Instant,
        windows: IndicatorWindows,
    ) {
        let slot = self.get_mut(channel);
        match signal {
            IndicatorSignal::Start => {
                slot.phase = IndicatorPhase::Active { detail };
                slot.expires_at = None;
            }
            IndicatorSignal::Complete => {
                slot.phase = IndicatorPhase::Complete { detail };
                slot.expires_at = Some(now + windows.complete);
            }
            IndicatorSignal::Fail => {
                slot.phase = IndicatorPhase::Error { message: detail };
                slot.expires_at = Some(now + windows.error);
            }
        }
    }

    /// Returns the channels that fell back to idle.
    pub fn expire(&mut self, now: Instant) -> Vec<IndicatorChannel> {
        let mut expired = Vec::new();
        for channel in IndicatorChannel::ALL {
            let slot = self.get_mut(channel);
            if let Some(deadline) = slot.expires_at {
                if deadline <= now {
                    *slot = ChannelIndicator::default();
                    expired.push(channel);
                }
            }
        }
        expired
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        IndicatorChannel::ALL
            .iter()
            .filter_map(|c| self.get(*c).expires_at)
            .min()
    }

    pub fn is_idle(&self) -> bool {
        IndicatorChannel::ALL
            .iter()
            .all(|c| self.get(*c).phase == IndicatorPhase::Idle)
    }
}

/// Ordered set of source domains, deduplicated case-insensitively. The
/// first-seen spelling is kept.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SearchDomainSet {
    domains: Vec<String>,
}

impl SearchDomainSet {
    pub fn insert(&mut self, domain: &str) -> bool {
        let domain = domain.trim();
        if domain.is_empty() || self.domains.iter().any(|d| d.eq_ignore_ascii_case(domain)) {
            return false;
        }
        self.domains.push(domain.to_string());
        true
    }

    pub fn as_slice(&self) -> &[String] {
        &self.domains
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssistantDraft {
    pub ephemeral_id: MessageKey,
    pub conversation_id: ConversationId,
    pub content: String,
    pub preamble: String,
    pub metadata: ResponseMetadata,
    pub persisted_id: Option<MessageKey>,
}

impl AssistantDraft {
    pub fn new(conversation_id: ConversationId) -> Self {
        Self {
            ephemeral_id: MessageKey::ephemeral(),
            conversation_id,
            content: String::new(),
            preamble: String::new(),
            metadata: ResponseMetadata::default(),
            persisted_id: None,
        }
    }

    /// The key this draft is currently addressed by.
    pub fn key(&self) -> &MessageKey {
        match &self.persisted_id {
            Some(id) => id,
            None => &self.ephemeral_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Promotion {
    pub ephemeral_id: MessageKey,
    pub persisted_id: MessageKey,
}

/// Best-effort write of client-observed metadata back to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteBack {
    pub message_id: MessageKey,
    pub metadata: ResponseMetadata,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MetaOutcome {
    pub promotion: Option<Promotion>,
    pub write_back: Option<WriteBack>,
    pub content_replaced: bool,
    pub indicator_promoted: bool,
}

#[derive(Debug, Clone)]
pub struct ResponseAccumulator {
    draft: AssistantDraft,
    indicators: IndicatorBoard,
    domains: SearchDomainSet,
    display: ThinkingDisplay,
    client_thinking: Option<Duration>,
    windows: IndicatorWindows,
}

impl ResponseAccumulator {
    pub fn new(
        conversation_id: ConversationId,
        initial_effort: Option<ReasoningEffort>,
        windows: IndicatorWindows,
    ) -> Self {
        Self {
            draft: AssistantDraft::new(conversation_id),
            indicators: IndicatorBoard::default(),
            domains: SearchDomainSet::default(),
            display: ThinkingDisplay::new(initial_effort),
            client_thinking: None,
            windows,
        }
    }

    pub fn draft(&self) -> &AssistantDraft {
        &self.draft
    }

    pub fn into_draft(self) -> AssistantDraft {
        self.draft
    }

    pub fn indicators(&self) -> &IndicatorBoard {
        &self.indicators
    }

    pub fn domains(&self) -> &SearchDomainSet {
        &self.domains
    }

    pub fn display(&self) -> &ThinkingDisplay {
        &self.display
    }

    pub fn content_len(&self) -> usize {
        char_len(&self.draft.content)
    }

    pub fn apply_token(&mut self, token: &str) -> bool {
        if token.is_empty() {
            return false;
        }
        self.draft.content.push_str(token);
        true
    }

    /// Client-observed thinking time. Only the first call has any effect.
    pub fn merge_client_timing(&mut self, elapsed: Duration) -> bool {
        if self.client_thinking.is_some() {
            return false;
        }
        self.client_thinking = Some(elapsed);
        if self.draft.metadata.thinking_ms.is_none() {
            self.draft.metadata.thinking_ms = Some(elapsed.as_millis() as u64);
            self.draft.metadata.thinking_label =
                Some(thinking_label(Some(elapsed), self.display.indicator()));
        }
        true
    }

    pub fn apply_preamble_delta(&mut self, delta: &str) -> bool {
        if delta.is_empty() {
            return false;
        }
        self.draft.preamble.push_str(delta);
        true
    }

    pub fn apply_preamble(&mut self, preamble: &str) -> bool {
        if self.draft.preamble == preamble {
            return false;
        }
        self.draft.preamble = preamble.to_string();
        true
    }

    pub fn apply_status(&mut self, event: &StatusEvent, now: Instant) -> Option<IndicatorChannel> {
        let (channel, signal) = event.kind.indicator()?;
        let detail = match signal {
            IndicatorSignal::Start => event.query.clone().or_else(|| event.message.clone()),
            _ => event.message.clone().or_else(|| event.query.clone()),
        };
        self.indicators
            .apply(channel, signal, detail, now, self.windows);
        Some(channel)
    }

    pub fn expire_indicators(&mut self, now: Instant) -> Vec<IndicatorChannel> {
        self.indicators.expire(now)
    }

    pub fn add_domain(&mut self, domain: &str) -> bool {
        if !self.domains.insert(domain) {
            return false;
        }
        self.draft.metadata.search_domains = self.domains.as_slice().to_vec();
        true
    }

    /// Field-level merge of provisional routing info. Returns true when the
    /// thinking indicator was promoted.
    pub fn apply_routing(&mut self, info: &ModelInfo) -> bool {
        let meta = &mut self.draft.metadata;
        if info.model.is_some() {
            meta.model.clone_from(&info.model);
        }
        if info.resolved_family.is_some() {
            meta.resolved_family.clone_from(&info.resolved_family);
        }
        if info.speed_mode_used.is_some() {
            meta.speed_mode_used.clone_from(&info.speed_mode_used);
        }
        match info.reasoning_effort {
            Some(effort) => {
                meta.reasoning_effort = Some(effort);
                self.display.observe_effort(effort)
            }
            None => false,
        }
    }

    /// Applies the authoritative near-final payload.
    pub fn apply_meta(&mut self, meta: &MetaPayload) -> MetaOutcome {
        let mut outcome = MetaOutcome {
            indicator_promoted: self.apply_routing(&meta.routing()),
            ..MetaOutcome::default()
        };

        if meta.context_usage.is_some() {
            self.draft.metadata.context_usage.clone_from(&meta.context_usage);
        }

        let server = ResponseMetadata::from_server_map(meta.server_metadata());
        let client_overrides = match self.client_thinking {
            Some(elapsed) => server.thinking_ms != Some(elapsed.as_millis() as u64),
            None => false,
        };
        self.draft.metadata.fill_missing_from(&server);

        if let Some(final_content) = &meta.final_content {
            if *final_content != self.draft.content
                && char_len(final_content) >= char_len(&self.draft.content)
            {
                self.draft.content = final_content.clone();
                outcome.content_replaced = true;
            }
        }

        if let Some(row_id) = &meta.assistant_message_row_id {
            let persisted = MessageKey::from(row_id.as_str());
            match &self.draft.persisted_id {
                None => {
                    self.draft.persisted_id = Some(persisted.clone());
                    outcome.promotion = Some(Promotion {
                        ephemeral_id: self.draft.ephemeral_id.clone(),
                        persisted_id: persisted,
                    });
                }
                Some(existing) if *existing != persisted => {
                    tracing::warn!(
                        "[ACCUMULATOR] Ignoring second persisted id {} (already {})",
                        persisted,
                        existing
                    );
                }
                Some(_) => {}
            }
        }

        if client_overrides {
            if let Some(id) = &self.draft.persisted_id {
                outcome.write_back = Some(WriteBack {
                    message_id: id.clone(),
                    metadata: self.draft.metadata.clone(),
                });
            }
        }

        outcome
    }

    /// Explicit error replacement: the only way content may shrink.
    pub fn fail(&mut self, fault: &StreamFault) {
        self.draft.content = fault.message.clone();
        self.draft.metadata.error = Some(fault.message.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::StatusKind;
    use serde_json::json;

    fn accumulator() -> ResponseAccumulator {
        ResponseAccumulator::new(
            ConversationId::from("c1"),
            None,
            IndicatorWindows::default(),
        )
    }

    fn meta(value: serde_json::Value) -> MetaPayload {
        match serde_json::from_value(value) {
            Ok(m) => m,
            Err(e) => panic!("bad meta fixture: {}", e),
        }
    }

    #[test]
    fn test_tokens_append_in_order() {
        let mut acc = accumulator();
        assert!(acc.apply_token("Hel"));
        assert!(!acc.apply_token(""));
        assert!(acc.apply_token("lo"));
        assert_eq!(acc.draft().content, "Hello");
    }

    #[test]
    fn test_client_timing_merge_is_idempotent() {
        let mut acc = accumulator();
        assert!(acc.merge_client_timing(Duration::from_millis(800)));
        assert!(!acc.merge_client_timing(Duration::from_millis(5000)));
        assert_eq!(acc.draft().metadata.thinking_ms, Some(800));
    }

    #[test]
    fn test_client_timing_wins_and_schedules_write_back() {
        let mut acc = accumulator();
        acc.apply_token("hi");
        acc.merge_client_timing(Duration::from_millis(1200));
        let outcome = acc.apply_meta(&meta(json!({
            "assistantMessageRowId": "abc",
            "metadata": {"thinkingMs": 300, "tokens": 7}
        })));

        assert_eq!(acc.draft().metadata.thinking_ms, Some(1200));
        assert_eq!(acc.draft().metadata.extra["tokens"], 7);
        let promotion = match outcome.promotion {
            Some(p) => p,
            None => panic!("expected promotion"),
        };
        assert_eq!(promotion.persisted_id, MessageKey::from("abc"));
        match outcome.write_back {
            Some(wb) => {
                assert_eq!(wb.message_id, MessageKey::from("abc"));
                assert_eq!(wb.metadata.thinking_ms, Some(1200));
            }
            None => panic!("expected write-back"),
        }
    }

    #[test]
    fn test_server_timing_used_without_client_timing() {
        let mut acc = accumulator();
        let outcome = acc.apply_meta(&meta(json!({
            "assistantMessageRowId": "abc",
            "metadata": {"thinkingMs": 300}
        })));
        assert_eq!(acc.draft().metadata.thinking_ms, Some(300));
        assert!(outcome.write_back.is_none());
    }

    #[test]
    fn test_matching_server_timing_needs_no_write_back() {
        let mut acc = accumulator();
        acc.merge_client_timing(Duration::from_millis(300));
        let outcome = acc.apply_meta(&meta(json!({
            "assistantMessageRowId": "abc",
            "metadata": {"thinkingMs": 300}
        })));
        assert!(outcome.write_back.is_none());
    }

    #[test]
    fn test_routing_never_discards_timing() {
        let mut acc = accumulator();
        acc.merge_client_timing(Duration::from_millis(450));
        acc.apply_routing(&ModelInfo {
            model: Some("m2".into()),
            resolved_family: Some("fam".into()),
            speed_mode_used: None,
            reasoning_effort: Some(ReasoningEffort::Medium),
        });
        let m = &acc.draft().metadata;
        assert_eq!(m.thinking_ms, Some(450));
        assert_eq!(m.model.as_deref(), Some("m2"));
        assert_eq!(m.reasoning_effort, Some(ReasoningEffort::Medium));
    }

    #[test]
    fn test_final_content_never_shrinks_draft() {
        let mut acc = accumulator();
        acc.apply_token("Hello world");
        let outcome = acc.apply_meta(&meta(json!({"finalContent": "Hello"})));
        assert!(!outcome.content_replaced);
        assert_eq!(acc.draft().content, "Hello world");

        let outcome = acc.apply_meta(&meta(json!({"finalContent": "Hello world!"})));
        assert!(outcome.content_replaced);
        assert_eq!(acc.draft().content, "Hello world!");
    }

    #[test]
    fn test_promotion_happens_once() {
        let mut acc = accumulator();
        let first = acc.apply_meta(&meta(json!({"assistantMessageRowId": "abc"})));
        assert!(first.promotion.is_some());
        let second = acc.apply_meta(&meta(json!({"assistantMessageRowId": "xyz"})));
        assert!(second.promotion.is_none());
        assert_eq!(acc.draft().key(), &MessageKey::from("abc"));
    }

    #[test]
    fn test_indicator_channels_are_independent_and_expire() {
        let mut acc = accumulator();
        let t0 = Instant::now();
        let search = StatusEvent {
            kind: StatusKind::SearchStart,
            query: Some("tokio".into()),
            message: None,
        };
        let exec_err = StatusEvent {
            kind: StatusKind::CodeExecutionError,
            query: None,
            message: Some("timeout".into()),
        };
        assert_eq!(acc.apply_status(&search, t0), Some(IndicatorChannel::WebSearch));
        acc.apply_status(&exec_err, t0);

        let board = acc.indicators();
        assert_eq!(
            board.get(IndicatorChannel::WebSearch).phase,
            IndicatorPhase::Active {
                detail: Some("tokio".into())
            }
        );
        assert_eq!(
            board.get(IndicatorChannel::FileReading).phase,
            IndicatorPhase::Idle
        );

        let done = StatusEvent {
            kind: StatusKind::SearchComplete,
            query: None,
            message: None,
        };
        acc.apply_status(&done, t0 + Duration::from_secs(1));

        // Search completes at 1s and expires 4.5s later; the error lasts 6s.
        let expired = acc.expire_indicators(t0 + Duration::from_millis(5600));
        assert_eq!(expired, vec![IndicatorChannel::WebSearch]);
        let expired = acc.expire_indicators(t0 + Duration::from_secs(6));
        assert_eq!(expired, vec![IndicatorChannel::CodeExecution]);
        assert!(acc.indicators().is_idle());
    }

    #[test]
    fn test_retrigger_cancels_expiry() {
        let mut board = IndicatorBoard::default();
        let t0 = Instant::now();
        let w = IndicatorWindows::default();
        board.apply(IndicatorChannel::FileReading, IndicatorSignal::Complete, None, t0, w);
        board.apply(IndicatorChannel::FileReading, IndicatorSignal::Start, None, t0, w);
        assert!(board.expire(t0 + Duration::from_secs(30)).is_empty());
        assert_eq!(board.next_deadline(), None);
    }

    #[test]
    fn test_domains_dedup_case_insensitively() {
        let mut acc = accumulator();
        assert!(acc.add_domain("Docs.rs"));
        assert!(!acc.add_domain("docs.RS "));
        assert!(acc.add_domain("tokio.rs"));
        assert!(!acc.add_domain("  "));
        assert_eq!(acc.domains().as_slice(), ["Docs.rs", "tokio.rs"]);
        assert_eq!(acc.draft().metadata.search_domains.len(), 2);
    }

    #[test]
    fn test_fail_replaces_content() {
        let mut acc = accumulator();
        acc.apply_token("partial");
        acc.fail(&StreamFault {
            message: "upstream exploded".into(),
            code: None,
        });
        assert_eq!(acc.draft().content, "upstream exploded");
        assert_eq!(
            acc.draft().metadata.error.as_deref(),
            Some("upstream exploded")
        );
    }
}
