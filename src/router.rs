//! Dispatches decoded frames to the timing tracker and the accumulator.
//!
//! All per-session mutable state lives in one [`SessionContext`] that is
//! passed by `&mut` to every dispatch, so frames of one session are applied
//! strictly in arrival order.

use crate::accumulator::{IndicatorChannel, IndicatorWindows, MetaOutcome, ResponseAccumulator};
use crate::frames::{Frame, StatusKind, StreamFault};
use crate::logging::StreamMetric;
use crate::registry::SessionKey;
use crate::timing::{ThinkingTiming, TimingTracker};
use crate::types::{ConversationId, ReasoningEffort};
use std::time::Duration;
use tokio::time::Instant;

pub struct SessionContext {
    pub key: SessionKey,
    pub conversation_id: ConversationId,
    pub timing: TimingTracker,
    pub accumulator: ResponseAccumulator,
    /// Set once a content or metadata record has arrived; an interruption
    /// is only recoverable after that.
    pub observed_payload: bool,
    pub terminal_seen: bool,
    pub last_frame_at: Option<Instant>,
    pub metric: StreamMetric,
}

impl SessionContext {
    pub fn new(
        key: SessionKey,
        effort: Option<ReasoningEffort>,
        windows: IndicatorWindows,
    ) -> Self {
        let conversation_id = key.conversation_id().clone();
        Self {
            accumulator: ResponseAccumulator::new(conversation_id.clone(), effort, windows),
            key,
            conversation_id,
            timing: TimingTracker::new(),
            observed_payload: false,
            terminal_seen: false,
            last_frame_at: None,
            metric: StreamMetric::new(),
        }
    }

    pub fn thinking(&self, now: Instant) -> ThinkingTiming {
        ThinkingTiming::from_parts(&self.timing, self.accumulator.display(), now)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    Content { first_token: Option<Duration> },
    Preamble,
    Indicator(IndicatorChannel),
    SourceDomain,
    Routing { indicator_promoted: bool },
    Meta(MetaOutcome),
    Terminal,
    Failed(StreamFault),
    UsageLimit(String),
    Ignored,
}

pub fn dispatch(frame: Frame, ctx: &mut SessionContext, now: Instant) -> Routed {
    ctx.metric.record(&frame);
    ctx.last_frame_at = Some(now);

    match frame {
        Frame::Content(token) => {
            ctx.observed_payload = true;
            if !ctx.accumulator.apply_token(&token) {
                return Routed::Ignored;
            }
            let first_token = ctx.timing.record_first_content(now);
            if let Some(elapsed) = first_token {
                ctx.accumulator.merge_client_timing(elapsed);
            }
            Routed::Content { first_token }
        }
        Frame::PreambleDelta(delta) => {
            ctx.observed_payload = true;
            if ctx.accumulator.apply_preamble_delta(&delta) {
                Routed::Preamble
            } else {
                Routed::Ignored
            }
        }
        Frame::Preamble(text) => {
            ctx.observed_payload = true;
            if ctx.accumulator.apply_preamble(&text) {
                Routed::Preamble
            } else {
                Routed::Ignored
            }
        }
        Frame::Status(event) => {
            if event.kind == StatusKind::UsageLimitExceeded {
                let message = match event.message {
                    Some(m) => m,
                    None => "Usage limit reached".to_string(),
                };
                return Routed::UsageLimit(message);
            }
            match ctx.accumulator.apply_status(&event, now) {
                Some(channel) => Routed::Indicator(channel),
                None => Routed::Ignored,
            }
        }
        Frame::SourceDomain(domain) => {
            if ctx.accumulator.add_domain(&domain) {
                Routed::SourceDomain
            } else {
                Routed::Ignored
            }
        }
        Frame::ModelInfo(info) => {
            ctx.observed_payload = true;
            Routed::Routing {
                indicator_promoted: ctx.accumulator.apply_routing(&info),
            }
        }
        Frame::Meta(meta) => {
            ctx.observed_payload = true;
            Routed::Meta(ctx.accumulator.apply_meta(&meta))
        }
        Frame::Error(fault) => {
            if fault.is_usage_limit() {
                return Routed::UsageLimit(fault.message);
            }
            ctx.accumulator.fail(&fault);
            Routed::Failed(fault)
        }
        Frame::Done => {
            ctx.terminal_seen = true;
            Routed::Terminal
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::parse_record;
    use crate::types::MessageKey;

    fn context() -> SessionContext {
        let key = SessionKey::derive(&ConversationId::from("c1"), "hello");
        SessionContext::new(key, None, IndicatorWindows::default())
    }

    fn feed(ctx: &mut SessionContext, line: &str, now: Instant) -> Routed {
        match parse_record(line) {
            Some(frame) => dispatch(frame, ctx, now),
            None => Routed::Ignored,
        }
    }

    #[test]
    fn test_example_sequence_builds_content_and_promotes() {
        let mut ctx = context();
        let t0 = Instant::now();
        ctx.timing.start(t0);

        feed(&mut ctx, r#"{"token":"Hel"}"#, t0 + Duration::from_millis(700));
        feed(&mut ctx, r#"{"token":"lo"}"#, t0 + Duration::from_millis(900));
        let routed = feed(
            &mut ctx,
            r#"{"meta":{"assistantMessageRowId":"abc","metadata":{}}}"#,
            t0 + Duration::from_secs(1),
        );
        assert!(matches!(routed, Routed::Meta(MetaOutcome { promotion: Some(_), .. })));
        assert_eq!(
            feed(&mut ctx, r#"{"done":true}"#, t0 + Duration::from_secs(1)),
            Routed::Terminal
        );

        let draft = ctx.accumulator.draft();
        assert_eq!(draft.content, "Hello");
        assert_eq!(draft.key(), &MessageKey::from("abc"));
        assert_eq!(draft.metadata.thinking_ms, Some(700));
        assert!(ctx.terminal_seen);
    }

    #[test]
    fn test_timing_recorded_once_across_fragments() {
        let mut ctx = context();
        let t0 = Instant::now();
        ctx.timing.start(t0);
        let first = feed(&mut ctx, r#"{"token":"a"}"#, t0 + Duration::from_millis(100));
        let second = feed(&mut ctx, r#"{"token":"b"}"#, t0 + Duration::from_millis(900));
        assert_eq!(
            first,
            Routed::Content {
                first_token: Some(Duration::from_millis(100))
            }
        );
        assert_eq!(second, Routed::Content { first_token: None });
    }

    #[test]
    fn test_status_and_domains_do_not_count_as_payload() {
        let mut ctx = context();
        let now = Instant::now();
        feed(&mut ctx, r#"{"status":{"type":"search_start"}}"#, now);
        feed(&mut ctx, r#"{"type":"web_search_domain","domain":"a.com"}"#, now);
        assert!(!ctx.observed_payload);
        feed(&mut ctx, r#"{"model_info":{"model":"m"}}"#, now);
        assert!(ctx.observed_payload);
    }

    #[test]
    fn test_usage_limit_paths() {
        let mut ctx = context();
        let now = Instant::now();
        assert_eq!(
            feed(
                &mut ctx,
                r#"{"status":{"type":"usage_limit_exceeded","message":"daily cap"}}"#,
                now
            ),
            Routed::UsageLimit("daily cap".into())
        );
        assert_eq!(
            feed(
                &mut ctx,
                r#"{"error":{"message":"slow down","code":"rate_limit_exceeded"}}"#,
                now
            ),
            Routed::UsageLimit("slow down".into())
        );
    }

    #[test]
    fn test_effort_escalation_mid_session() {
        let mut ctx = context();
        let now = Instant::now();
        let routed = feed(&mut ctx, r#"{"model_info":{"reasoningEffort":"low"}}"#, now);
        assert_eq!(routed, Routed::Routing { indicator_promoted: false });
        let routed = feed(&mut ctx, r#"{"model_info":{"reasoningEffort":"high"}}"#, now);
        assert_eq!(routed, Routed::Routing { indicator_promoted: true });
    }
}
