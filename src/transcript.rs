//! Displayed messages of one conversation.
//!
//! Everything here is keyed by [`MessageKey`]. Promotion renames the draft
//! to its persisted key and records the ephemeral key as an alias, so the
//! same message and timing resolve under either key afterwards. A promotion
//! never removes or overwrites another message.

use crate::timing::ThinkingTiming;
use crate::types::{MessageKey, ResponseMetadata, StoredMessage};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DisplayedMessage {
    pub id: MessageKey,
    pub role: Role,
    pub content: String,
    pub preamble: String,
    pub metadata: ResponseMetadata,
    pub streaming: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    Updated,
    Inserted,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcript {
    messages: Vec<DisplayedMessage>,
    timings: HashMap<MessageKey, ThinkingTiming>,
    /// Ephemeral key -> persisted key.
    aliases: HashMap<MessageKey, MessageKey>,
}

impl Transcript {
    pub fn messages(&self) -> &[DisplayedMessage] {
        &self.messages
    }

    /// The key a message is currently stored under.
    pub fn resolve<'a>(&'a self, id: &'a MessageKey) -> &'a MessageKey {
        match self.aliases.get(id) {
            Some(persisted) => persisted,
            None => id,
        }
    }

    pub fn get(&self, id: &MessageKey) -> Option<&DisplayedMessage> {
        let id = self.resolve(id);
        self.messages.iter().find(|m| &m.id == id)
    }

    fn get_mut(&mut self, id: &MessageKey) -> Option<&mut DisplayedMessage> {
        let id = self.resolve(id).clone();
        self.messages.iter_mut().find(|m| m.id == id)
    }

    fn contains_key(&self, id: &MessageKey) -> bool {
        self.messages.iter().any(|m| &m.id == id)
    }

    pub fn timing(&self, id: &MessageKey) -> Option<&ThinkingTiming> {
        self.timings.get(self.resolve(id))
    }

    /// Assistant messages other than the one `draft` resolves to.
    pub fn other_assistant_ids(&self, draft: &MessageKey) -> HashSet<MessageKey> {
        let own = self.resolve(draft);
        self.messages
            .iter()
            .filter(|m| m.role == Role::Assistant && &m.id != own)
            .map(|m| m.id.clone())
            .collect()
    }

    pub fn push_user(&mut self, content: &str) -> MessageKey {
        let id = MessageKey::ephemeral();
        self.messages.push(DisplayedMessage {
            id: id.clone(),
            role: Role::User,
            content: content.to_string(),
            preamble: String::new(),
            metadata: ResponseMetadata::default(),
            streaming: false,
        });
        id
    }

    pub fn begin_draft(&mut self, id: MessageKey) {
        self.messages.push(DisplayedMessage {
            id,
            role: Role::Assistant,
            content: String::new(),
            preamble: String::new(),
            metadata: ResponseMetadata::default(),
            streaming: true,
        });
    }

    /// Brings the displayed content in line with `content`. Returns the
    /// appended suffix, or the whole text with `true` when it was replaced.
    pub fn sync_content(&mut self, id: &MessageKey, content: &str) -> Option<(String, bool)> {
        let message = self.get_mut(id)?;
        if message.content == content {
            return None;
        }
        if content.starts_with(message.content.as_str()) {
            let delta = content[message.content.len()..].to_string();
            message.content.push_str(&delta);
            Some((delta, false))
        } else {
            message.content = content.to_string();
            Some((message.content.clone(), true))
        }
    }

    pub fn set_preamble(&mut self, id: &MessageKey, preamble: &str) {
        if let Some(message) = self.get_mut(id) {
            if message.preamble != preamble {
                message.preamble = preamble.to_string();
            }
        }
    }

    pub fn set_metadata(&mut self, id: &MessageKey, metadata: &ResponseMetadata) {
        if let Some(message) = self.get_mut(id) {
            message.metadata.clone_from(metadata);
        }
    }

    pub fn set_timing(&mut self, id: &MessageKey, timing: ThinkingTiming) {
        let id = self.resolve(id).clone();
        self.timings.insert(id, timing);
    }

    /// Renames the message `from` resolves to as `to`. Refused when `to`
    /// already names a different message.
    pub fn promote(&mut self, from: &MessageKey, to: &MessageKey) -> bool {
        let current = self.resolve(from).clone();
        if &current == to || !self.contains_key(&current) {
            return false;
        }
        if self.contains_key(to) {
            tracing::warn!(
                "[TRANSCRIPT] Refusing to promote {} to {}: id already shown for another message",
                from,
                to
            );
            return false;
        }
        if let Some(message) = self.messages.iter_mut().find(|m| m.id == current) {
            message.id = to.clone();
        }
        if let Some(timing) = self.timings.remove(&current) {
            self.timings.insert(to.clone(), timing);
        }
        for target in self.aliases.values_mut() {
            if *target == current {
                *target = to.clone();
            }
        }
        self.aliases.insert(current, to.clone());
        true
    }

    /// Applies an accepted store record. The draft is promoted and updated in
    /// place when it is still shown; a message already under the record's id
    /// is updated when the draft is gone; otherwise the record is appended.
    pub fn reconcile(
        &mut self,
        draft_id: &MessageKey,
        record: &StoredMessage,
        metadata: &ResponseMetadata,
    ) -> Reconciled {
        let target = if self.get(draft_id).is_some() {
            self.promote(draft_id, &record.id);
            draft_id
        } else {
            &record.id
        };
        match self.get_mut(target) {
            Some(message) => {
                message.content.clone_from(&record.content);
                message.metadata.clone_from(metadata);
                message.streaming = false;
                Reconciled::Updated
            }
            None => {
                self.messages.push(DisplayedMessage {
                    id: record.id.clone(),
                    role: Role::Assistant,
                    content: record.content.clone(),
                    preamble: String::new(),
                    metadata: metadata.clone(),
                    streaming: false,
                });
                Reconciled::Inserted
            }
        }
    }

    pub fn finish(&mut self, id: &MessageKey) {
        if let Some(message) = self.get_mut(id) {
            message.streaming = false;
        }
    }

    pub fn discard(&mut self, id: &MessageKey) -> bool {
        let id = self.resolve(id).clone();
        let before = self.messages.len();
        self.messages.retain(|m| m.id != id);
        self.timings.remove(&id);
        self.aliases.retain(|_, target| *target != id);
        before != self.messages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn stored(id: &str, content: &str) -> StoredMessage {
        StoredMessage {
            id: MessageKey::from(id),
            content: content.to_string(),
            metadata: ResponseMetadata::default(),
            created_at: Utc::now(),
            terminal_marker: None,
        }
    }

    #[test]
    fn test_sync_content_appends_suffix() {
        let mut t = Transcript::default();
        let id = MessageKey::ephemeral();
        t.begin_draft(id.clone());
        assert_eq!(t.sync_content(&id, "Hel"), Some(("Hel".into(), false)));
        assert_eq!(t.sync_content(&id, "Hello"), Some(("lo".into(), false)));
        assert_eq!(t.sync_content(&id, "Hello"), None);
        assert_eq!(t.sync_content(&id, "Bye"), Some(("Bye".into(), true)));
    }

    #[test]
    fn test_promote_renames_message_and_timing() {
        let mut t = Transcript::default();
        t.push_user("hi");
        let draft = MessageKey::ephemeral();
        t.begin_draft(draft.clone());
        t.sync_content(&draft, "Hello");
        t.set_timing(
            &draft,
            ThinkingTiming {
                started_at: tokio::time::Instant::now(),
                first_token_at: None,
                elapsed_ms: Some(700),
                label: "Thought for 0.7s".into(),
                effort: None,
            },
        );

        let persisted = MessageKey::from("abc");
        assert!(t.promote(&draft, &persisted));
        assert_eq!(t.messages().len(), 2);
        assert_eq!(t.messages()[1].id, persisted);
        assert_eq!(t.get(&persisted).map(|m| m.content.as_str()), Some("Hello"));
        assert_eq!(t.timing(&persisted).and_then(|x| x.elapsed_ms), Some(700));
    }

    #[test]
    fn test_ephemeral_key_still_resolves_after_promotion() {
        let mut t = Transcript::default();
        let draft = MessageKey::ephemeral();
        t.begin_draft(draft.clone());
        t.sync_content(&draft, "Hel");
        let persisted = MessageKey::from("abc");
        assert!(t.promote(&draft, &persisted));

        assert_eq!(t.sync_content(&draft, "Hello"), Some(("lo".into(), false)));
        t.set_timing(
            &draft,
            ThinkingTiming {
                started_at: tokio::time::Instant::now(),
                first_token_at: None,
                elapsed_ms: Some(300),
                label: "Thought for 0.3s".into(),
                effort: None,
            },
        );
        assert_eq!(t.get(&draft), t.get(&persisted));
        assert_eq!(t.get(&draft).map(|m| m.content.as_str()), Some("Hello"));
        assert_eq!(t.timing(&draft), t.timing(&persisted));
        assert!(t.timing(&draft).is_some());
        assert!(!t.promote(&draft, &persisted));
    }

    #[test]
    fn test_reconcile_updates_in_place_when_draft_present() {
        let mut t = Transcript::default();
        let draft = MessageKey::ephemeral();
        t.begin_draft(draft.clone());
        t.sync_content(&draft, "A");
        let record = stored("m1", "AB");
        let result = t.reconcile(&draft, &record, &record.metadata);
        assert_eq!(result, Reconciled::Updated);
        assert_eq!(t.messages().len(), 1);
        assert_eq!(t.messages()[0].id, MessageKey::from("m1"));
        assert_eq!(t.messages()[0].content, "AB");
        assert!(!t.messages()[0].streaming);
    }

    #[test]
    fn test_reconcile_inserts_when_draft_gone() {
        let mut t = Transcript::default();
        let draft = MessageKey::ephemeral();
        let record = stored("m1", "AB");
        assert_eq!(t.reconcile(&draft, &record, &record.metadata), Reconciled::Inserted);
        assert_eq!(t.messages().len(), 1);
    }

    #[test]
    fn test_promote_never_removes_another_message() {
        let mut t = Transcript::default();
        let first = MessageKey::ephemeral();
        t.begin_draft(first.clone());
        t.sync_content(&first, "first answer");
        assert!(t.promote(&first, &MessageKey::from("abc")));

        let second = MessageKey::ephemeral();
        t.begin_draft(second.clone());
        t.sync_content(&second, "B");
        assert!(!t.promote(&second, &MessageKey::from("abc")));

        assert_eq!(t.messages().len(), 2);
        let first_shown = t.get(&MessageKey::from("abc")).map(|m| m.content.as_str());
        assert_eq!(first_shown, Some("first answer"));
        assert_eq!(t.get(&second).map(|m| m.content.as_str()), Some("B"));
    }

    #[test]
    fn test_reconcile_onto_foreign_id_keeps_both_messages() {
        let mut t = Transcript::default();
        let first = MessageKey::ephemeral();
        t.begin_draft(first.clone());
        t.sync_content(&first, "first answer");
        t.promote(&first, &MessageKey::from("abc"));

        let second = MessageKey::ephemeral();
        t.begin_draft(second.clone());
        let record = stored("abc", "replacement");
        assert_eq!(t.reconcile(&second, &record, &record.metadata), Reconciled::Updated);

        assert_eq!(t.messages().len(), 2);
        assert_eq!(t.messages()[0].content, "first answer");
        assert_eq!(t.messages()[1].id, second);
        assert_eq!(t.messages()[1].content, "replacement");
    }

    #[test]
    fn test_other_assistant_ids_excludes_own_draft() {
        let mut t = Transcript::default();
        t.push_user("one");
        let first = MessageKey::ephemeral();
        t.begin_draft(first.clone());
        t.promote(&first, &MessageKey::from("abc"));
        t.push_user("two");
        let second = MessageKey::ephemeral();
        t.begin_draft(second.clone());
        t.promote(&second, &MessageKey::from("def"));

        let others = t.other_assistant_ids(&second);
        assert_eq!(others.len(), 1);
        assert!(others.contains(&MessageKey::from("abc")));
    }
}
