//! In-flight request tracking.
//!
//! Admission is keyed by (conversation, exact submitted content). A second
//! submission under a live key is rejected outright. Removal is tied to the
//! lifetime of the [`SessionGuard`] returned by admission, so every exit path
//! (success, error, cancellation, panic) releases the key.

use crate::recovery::RecoveryState;
use crate::types::{lock, ConversationId, Result, StreamKeeperError};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    conversation_id: ConversationId,
    fingerprint: String,
}

impl SessionKey {
    pub fn derive(conversation_id: &ConversationId, content: &str) -> Self {
        let digest = Sha256::digest(content.as_bytes());
        let fingerprint = digest.iter().map(|b| format!("{:02x}", b)).collect();
        Self {
            conversation_id: conversation_id.clone(),
            fingerprint,
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}",
            self.conversation_id.short(),
            crate::types::prefix_chars(&self.fingerprint, 12)
        )
    }
}

/// Shared view of one in-flight session.
#[derive(Debug)]
pub struct StreamSession {
    key: SessionKey,
    started_at: Instant,
    cancel: CancellationToken,
    stop_requested: AtomicBool,
    last_frame_at: Mutex<Instant>,
    phase: Mutex<RecoveryState>,
}

pub type SessionHandle = Arc<StreamSession>;

impl StreamSession {
    fn new(key: SessionKey, now: Instant) -> Self {
        Self {
            key,
            started_at: now,
            cancel: CancellationToken::new(),
            stop_requested: AtomicBool::new(false),
            last_frame_at: Mutex::new(now),
            phase: Mutex::new(RecoveryState::Active),
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// User-initiated stop. The flag is set before the abort is issued so the
    /// read loop can never mistake it for a lost connection.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Aborts the transport without marking a stop, so the session goes
    /// through interruption handling.
    pub fn force_interrupt(&self) -> bool {
        if self.phase() != RecoveryState::Active || self.cancel.is_cancelled() {
            return false;
        }
        self.cancel.cancel();
        true
    }

    pub fn touch(&self, now: Instant) {
        *lock(&self.last_frame_at) = now;
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*lock(&self.last_frame_at))
    }

    pub fn phase(&self) -> RecoveryState {
        *lock(&self.phase)
    }

    pub fn set_phase(&self, phase: RecoveryState) {
        let mut current = lock(&self.phase);
        if *current != phase {
            tracing::debug!("[SESSION {}] {:?} -> {:?}", self.key, *current, phase);
            *current = phase;
        }
    }
}

#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<SessionKey, SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&self, key: SessionKey, now: Instant) -> Result<SessionGuard> {
        let mut sessions = lock(&self.sessions);
        if sessions.contains_key(&key) {
            tracing::warn!("[REGISTRY] Rejecting duplicate submission for {}", key);
            return Err(StreamKeeperError::DuplicateRequest(key.to_string()).into());
        }
        let handle = Arc::new(StreamSession::new(key.clone(), now));
        sessions.insert(key, handle.clone());
        tracing::debug!("[REGISTRY] Admitted {} ({} in flight)", handle.key(), sessions.len());
        Ok(SessionGuard {
            registry: self.clone(),
            handle,
        })
    }

    pub fn get(&self, key: &SessionKey) -> Option<SessionHandle> {
        lock(&self.sessions).get(key).cloned()
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        lock(&self.sessions).contains_key(key)
    }

    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn request_stop(&self, key: &SessionKey) -> bool {
        match self.get(key) {
            Some(handle) => {
                handle.request_stop();
                true
            }
            None => false,
        }
    }

    /// Stops every session of a conversation. Returns how many were stopped.
    pub fn stop_conversation(&self, conversation_id: &ConversationId) -> usize {
        let handles: Vec<SessionHandle> = lock(&self.sessions)
            .values()
            .filter(|h| h.key().conversation_id() == conversation_id)
            .cloned()
            .collect();
        for handle in &handles {
            handle.request_stop();
        }
        handles.len()
    }

    /// Conversations with at least one session in flight.
    pub fn busy_conversations(&self) -> HashSet<ConversationId> {
        lock(&self.sessions)
            .keys()
            .map(|k| k.conversation_id().clone())
            .collect()
    }

    /// Active sessions with no record for longer than `threshold`.
    pub fn stalled(&self, now: Instant, threshold: Duration) -> Vec<SessionHandle> {
        lock(&self.sessions)
            .values()
            .filter(|h| h.phase() == RecoveryState::Active && h.idle_for(now) > threshold)
            .cloned()
            .collect()
    }

    fn release(&self, handle: &SessionHandle) {
        let mut sessions = lock(&self.sessions);
        let owned = match sessions.get(handle.key()) {
            Some(existing) => Arc::ptr_eq(existing, handle),
            None => false,
        };
        if owned {
            sessions.remove(handle.key());
            tracing::debug!("[REGISTRY] Released {} ({} in flight)", handle.key(), sessions.len());
        }
    }
}

/// Keeps a session registered for as long as it lives.
pub struct SessionGuard {
    registry: SessionRegistry,
    handle: SessionHandle,
}

impl SessionGuard {
    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.release(&self.handle);
    }
}
