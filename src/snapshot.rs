//! Per-conversation transient UI state that survives navigation.
//!
//! Sessions keep running after the user switches away, so updates for a
//! conversation that is not on screen land in its snapshot and show up again
//! when the user returns.

use crate::accumulator::{IndicatorBoard, IndicatorChannel};
use crate::timing::{ThinkingIndicator, ThinkingTiming};
use crate::types::ConversationId;
use std::collections::{HashMap, HashSet};
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConversationUiState {
    pub is_streaming: bool,
    pub indicators: IndicatorBoard,
    pub response_timing: Option<ThinkingTiming>,
    pub pending_thinking: Option<ThinkingIndicator>,
}

#[derive(Debug, Default)]
pub struct UiStateBook {
    active: Option<ConversationId>,
    visible: ConversationUiState,
    snapshots: HashMap<ConversationId, ConversationUiState>,
}

impl UiStateBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> Option<&ConversationId> {
        self.active.as_ref()
    }

    pub fn visible(&self) -> &ConversationUiState {
        &self.visible
    }

    fn is_active(&self, conversation_id: &ConversationId) -> bool {
        self.active.as_ref() == Some(conversation_id)
    }

    pub fn state_of(&self, conversation_id: &ConversationId) -> Option<&ConversationUiState> {
        if self.is_active(conversation_id) {
            Some(&self.visible)
        } else {
            self.snapshots.get(conversation_id)
        }
    }

    /// Captures the outgoing conversation and restores the incoming one, or
    /// installs a clean default if it was never seen.
    pub fn switch_to(&mut self, conversation_id: &ConversationId) -> &ConversationUiState {
        if self.is_active(conversation_id) {
            return &self.visible;
        }
        let incoming = self.snapshots.remove(conversation_id).unwrap_or_default();
        let outgoing = std::mem::replace(&mut self.visible, incoming);
        if let Some(previous) = self.active.replace(conversation_id.clone()) {
            self.snapshots.insert(previous, outgoing);
        }
        tracing::debug!(
            "[UI] Switched to {} ({} snapshots held)",
            conversation_id.short(),
            self.snapshots.len()
        );
        &self.visible
    }

    pub fn update<F>(&mut self, conversation_id: &ConversationId, f: F)
    where
        F: FnOnce(&mut ConversationUiState),
    {
        if self.is_active(conversation_id) {
            f(&mut self.visible);
        } else {
            f(self.snapshots.entry(conversation_id.clone()).or_default());
        }
    }

    fn held_mut(&mut self) -> impl Iterator<Item = (&ConversationId, &mut ConversationUiState)> {
        self.active
            .as_ref()
            .map(|active| (active, &mut self.visible))
            .into_iter()
            .chain(self.snapshots.iter_mut())
    }

    fn held(&self) -> impl Iterator<Item = (&ConversationId, &ConversationUiState)> {
        self.active
            .as_ref()
            .map(|active| (active, &self.visible))
            .into_iter()
            .chain(self.snapshots.iter())
    }

    /// Expires indicators of every held conversation outside `skip`. A
    /// conversation with a session in flight has its board driven by that
    /// session and belongs in `skip`.
    pub fn expire_indicators(
        &mut self,
        now: Instant,
        skip: &HashSet<ConversationId>,
    ) -> Vec<(ConversationId, IndicatorChannel)> {
        let mut expired = Vec::new();
        for (cid, state) in self.held_mut() {
            if skip.contains(cid) {
                continue;
            }
            for channel in state.indicators.expire(now) {
                expired.push((cid.clone(), channel));
            }
        }
        expired
    }

    pub fn next_deadline(&self, skip: &HashSet<ConversationId>) -> Option<Instant> {
        self.held()
            .filter(|(cid, _)| !skip.contains(*cid))
            .filter_map(|(_, s)| s.indicators.next_deadline())
            .min()
    }
}
