use crate::accumulator::{IndicatorChannel, IndicatorPhase};
use crate::controller::SessionOutcome;
use crate::recovery::RecoveryState;
use crate::timing::ThinkingIndicator;
use crate::types::{ConversationId, MessageKey, ResponseMetadata};

/// Notifications published after every controller state change.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    SessionStarted {
        conversation_id: ConversationId,
        message_id: MessageKey,
    },
    Content {
        conversation_id: ConversationId,
        message_id: MessageKey,
        delta: String,
        replaced: bool,
    },
    Preamble {
        conversation_id: ConversationId,
        message_id: MessageKey,
        preamble: String,
    },
    Indicator {
        conversation_id: ConversationId,
        channel: IndicatorChannel,
        phase: IndicatorPhase,
    },
    SourceDomains {
        conversation_id: ConversationId,
        domains: Vec<String>,
    },
    Routing {
        conversation_id: ConversationId,
        metadata: ResponseMetadata,
        indicator: ThinkingIndicator,
    },
    ThinkingRecorded {
        conversation_id: ConversationId,
        message_id: MessageKey,
        elapsed_ms: u64,
        label: String,
    },
    Promoted {
        conversation_id: ConversationId,
        ephemeral_id: MessageKey,
        persisted_id: MessageKey,
    },
    Recovery {
        conversation_id: ConversationId,
        state: RecoveryState,
    },
    Finalized {
        conversation_id: ConversationId,
        message_id: MessageKey,
        outcome: SessionOutcome,
    },
    Failed {
        conversation_id: ConversationId,
        message: String,
    },
    UsageLimit {
        conversation_id: ConversationId,
        message: String,
    },
}

impl ControllerEvent {
    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            Self::SessionStarted { conversation_id, .. }
            | Self::Content { conversation_id, .. }
            | Self::Preamble { conversation_id, .. }
            | Self::Indicator { conversation_id, .. }
            | Self::SourceDomains { conversation_id, .. }
            | Self::Routing { conversation_id, .. }
            | Self::ThinkingRecorded { conversation_id, .. }
            | Self::Promoted { conversation_id, .. }
            | Self::Recovery { conversation_id, .. }
            | Self::Finalized { conversation_id, .. }
            | Self::Failed { conversation_id, .. }
            | Self::UsageLimit { conversation_id, .. } => conversation_id,
        }
    }
}
