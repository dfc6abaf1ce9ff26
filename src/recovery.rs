//! Interruption classification and store reconciliation.

use crate::constants::{RECOVERY_MAX_ATTEMPTS, RECOVERY_POLL_INTERVAL, STORE_CLOCK_SKEW};
use crate::store::MessageStore;
use crate::types::{char_len, ConversationId, MessageKey, Result, StoredMessage};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    Active,
    Interrupted,
    Recovering,
    Resolved,
    Abandoned,
}

impl RecoveryState {
    pub fn is_final(self) -> bool {
        matches!(self, Self::Resolved | Self::Abandoned)
    }
}

/// How a session's read loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    Terminal,
    Stopped,
    Interrupted,
    NothingObserved,
}

/// The terminal record wins over everything; a requested stop wins over an
/// interruption so a cancel is never retried as a lost connection.
pub fn classify_end(
    terminal_seen: bool,
    stop_requested: bool,
    observed_payload: bool,
) -> StreamEnd {
    if terminal_seen {
        StreamEnd::Terminal
    } else if stop_requested {
        StreamEnd::Stopped
    } else if observed_payload {
        StreamEnd::Interrupted
    } else {
        StreamEnd::NothingObserved
    }
}

/// Whether a polled record may replace the local draft.
///
/// A terminal marker is always enough. Without one the record must be
/// strictly longer than what was observed locally; an equal-length record
/// is indistinguishable from a still-partial write.
pub fn is_authoritative(record: &StoredMessage, last_len: usize) -> bool {
    record.terminal_marker.is_some() || char_len(&record.content) > last_len
}

/// What a polled record is checked against before it may replace a draft.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryScope {
    /// Characters the session had shown when it was interrupted.
    pub last_len: usize,
    pub session_started: DateTime<Utc>,
    /// Assistant messages already shown for earlier turns.
    pub foreign_ids: HashSet<MessageKey>,
}

impl RecoveryScope {
    pub fn new(last_len: usize, session_started: DateTime<Utc>) -> Self {
        Self {
            last_len,
            session_started,
            foreign_ids: HashSet::new(),
        }
    }

    pub fn with_foreign_ids(mut self, ids: HashSet<MessageKey>) -> Self {
        self.foreign_ids = ids;
        self
    }

    /// A record already shown for another turn is never this session's. One
    /// created before the session started is accepted only with a terminal
    /// marker, and only within the store's clock skew.
    pub fn admits(&self, record: &StoredMessage) -> bool {
        if self.foreign_ids.contains(&record.id) {
            return false;
        }
        if record.created_at < self.session_started {
            let skew = chrono::Duration::seconds(STORE_CLOCK_SKEW.as_secs() as i64);
            if record.terminal_marker.is_none() || record.created_at < self.session_started - skew {
                return false;
            }
        }
        is_authoritative(record, self.last_len)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: RECOVERY_MAX_ATTEMPTS,
            interval: RECOVERY_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome<T> {
    Accepted { value: T, attempt: u32 },
    Exhausted { attempts: u32, last: Option<T> },
}

impl PollPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// Waits `interval`, reads, and stops at the first accepted value or after
    /// `max_attempts` reads. A failed read counts as an attempt.
    pub async fn poll_until<F, Fut, T, A>(&self, mut operation: F, mut accept: A) -> PollOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
        A: FnMut(&T) -> bool,
    {
        let mut last = None;
        for attempt in 1..=self.max_attempts {
            tokio::time::sleep(self.interval).await;
            match operation(attempt).await {
                Ok(Some(value)) => {
                    if accept(&value) {
                        return PollOutcome::Accepted { value, attempt };
                    }
                    tracing::debug!("[POLL] Attempt {} returned a non-qualifying value", attempt);
                    last = Some(value);
                }
                Ok(None) => {
                    tracing::debug!("[POLL] Attempt {} found nothing", attempt);
                }
                Err(e) => {
                    tracing::warn!(
                        "[POLL] Attempt {}/{} failed: {}",
                        attempt,
                        self.max_attempts,
                        e.inner
                    );
                }
            }
        }
        PollOutcome::Exhausted {
            attempts: self.max_attempts,
            last,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryResult {
    Resolved { record: StoredMessage, attempt: u32 },
    Abandoned { attempts: u32 },
}

pub struct RecoveryCoordinator<S> {
    store: Arc<S>,
    policy: PollPolicy,
}

impl<S: MessageStore> RecoveryCoordinator<S> {
    pub fn new(store: Arc<S>, policy: PollPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> PollPolicy {
        self.policy
    }

    /// Polls the store for the conversation's latest assistant record until
    /// `scope` admits one.
    pub async fn recover(
        &self,
        conversation_id: &ConversationId,
        scope: RecoveryScope,
    ) -> RecoveryResult {
        let store: &S = &self.store;
        tracing::info!(
            "[RECOVERY] Polling {} (last length {}, {} earlier replies, {} attempts every {:?})",
            conversation_id,
            scope.last_len,
            scope.foreign_ids.len(),
            self.policy.max_attempts,
            self.policy.interval
        );

        let outcome = self
            .policy
            .poll_until(
                move |_| store.read_latest_assistant_record(conversation_id),
                |record: &StoredMessage| scope.admits(record),
            )
            .await;

        match outcome {
            PollOutcome::Accepted { value, attempt } => {
                tracing::info!(
                    "[RECOVERY] Accepted record {} on attempt {} ({} chars)",
                    value.id,
                    attempt,
                    char_len(&value.content)
                );
                RecoveryResult::Resolved {
                    record: value,
                    attempt,
                }
            }
            PollOutcome::Exhausted { attempts, last } => {
                match last {
                    Some(record) => tracing::warn!(
                        "[RECOVERY] Giving up after {} attempts; candidate {} not accepted",
                        attempts,
                        record.id
                    ),
                    None => tracing::warn!(
                        "[RECOVERY] Giving up after {} attempts; store had nothing",
                        attempts
                    ),
                }
                RecoveryResult::Abandoned { attempts }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MessageKey, ResponseMetadata, StreamKeeperError};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn record(content: &str, marker: Option<&str>) -> StoredMessage {
        StoredMessage {
            id: MessageKey::from("m1"),
            content: content.to_string(),
            metadata: ResponseMetadata::default(),
            created_at: Utc::now(),
            terminal_marker: marker.map(|m| m.to_string()),
        }
    }

    #[test]
    fn test_classification_order() {
        assert_eq!(classify_end(true, true, true), StreamEnd::Terminal);
        assert_eq!(classify_end(false, true, true), StreamEnd::Stopped);
        assert_eq!(classify_end(false, false, true), StreamEnd::Interrupted);
        assert_eq!(classify_end(false, false, false), StreamEnd::NothingObserved);
    }

    #[test]
    fn test_acceptance_predicate() {
        assert!(!is_authoritative(&record("A", None), 1));
        assert!(!is_authoritative(&record("", None), 1));
        assert!(is_authoritative(&record("AB", None), 1));
        assert!(is_authoritative(&record("", Some("resp_123")), 5));

        let mut with_meta = record("A", None);
        with_meta.metadata.model = Some("m".into());
        assert!(!is_authoritative(&with_meta, 1));
        assert!(is_authoritative(&record("A", Some("resp_1")), 1));
    }

    #[test]
    fn test_scope_rejects_replies_already_shown() {
        let started = Utc::now();
        let scope = RecoveryScope::new(1, started)
            .with_foreign_ids([MessageKey::from("m1")].into_iter().collect());
        let mut finished = record("A much longer answer", Some("resp_1"));
        finished.created_at = started + chrono::Duration::seconds(1);
        assert!(!scope.admits(&finished));

        finished.id = MessageKey::from("m2");
        assert!(scope.admits(&finished));
    }

    #[test]
    fn test_scope_rejects_records_older_than_the_session() {
        let started = Utc::now();
        let scope = RecoveryScope::new(1, started);

        let mut earlier = record("A much longer answer", None);
        earlier.created_at = started - chrono::Duration::seconds(2);
        assert!(!scope.admits(&earlier));

        earlier.terminal_marker = Some("resp_1".into());
        assert!(scope.admits(&earlier));

        let skew = chrono::Duration::seconds(STORE_CLOCK_SKEW.as_secs() as i64);
        earlier.created_at = started - skew - chrono::Duration::seconds(1);
        assert!(!scope.admits(&earlier));

        let mut later = record("AB", None);
        later.created_at = started + chrono::Duration::seconds(1);
        assert!(scope.admits(&later));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_stops_at_first_accepted_value() {
        let calls = AtomicU32::new(0);
        let policy = PollPolicy::new(8, Duration::from_millis(650));
        let start = tokio::time::Instant::now();
        let outcome = policy
            .poll_until(
                |attempt| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move { Ok(Some(attempt)) }
                },
                |v: &u32| *v == 3,
            )
            .await;
        assert_eq!(outcome, PollOutcome::Accepted { value: 3, attempt: 3 });
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_millis(1950));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_errors_count_as_attempts() {
        let policy = PollPolicy::new(3, Duration::from_millis(10));
        let outcome: PollOutcome<u32> = policy
            .poll_until(
                |_| async { Err(StreamKeeperError::NotFound("store offline".into()).into()) },
                |_| true,
            )
            .await;
        assert_eq!(
            outcome,
            PollOutcome::Exhausted {
                attempts: 3,
                last: None
            }
        );
    }
}
