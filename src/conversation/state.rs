//! The conversation aggregate and its integrity rules.
//!
//! Confirmed messages stay sorted by `sent_date` (ties broken by identifier)
//! and unique by identifier. The in-flight send lives in its own slot, so
//! there can never be more than one, and it always renders after the
//! confirmed history.

use crate::error::ConversationError;
use crate::model::{
    ConversationEntry, ConversationId, LanguagePair, Message, MessageId, Participants,
    PendingMessage, Translation, UserId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use uuid::Uuid;

/// Identifies one placeholder so a late failure cannot remove a newer one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingToken(Uuid);

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingSlot {
    token: PendingToken,
    message: PendingMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    id: Option<ConversationId>,
    hash: String,
    participants: Participants,
    messages: Vec<Message>,
    #[serde(skip)]
    pending: Option<PendingSlot>,
    last_modified: DateTime<Utc>,
}

impl Conversation {
    /// A conversation that has not been created in the store yet
    pub fn new(participants: Participants) -> Self {
        Self::with_messages(None, participants, Vec::new())
    }

    /// Build from existing history; duplicates are dropped (last one wins)
    pub fn with_messages(
        id: Option<ConversationId>,
        participants: Participants,
        messages: Vec<Message>,
    ) -> Self {
        let mut conversation = Self {
            id,
            hash: String::new(),
            participants,
            messages: Vec::new(),
            pending: None,
            last_modified: Utc::now(),
        };
        let mut seen = HashSet::new();
        for message in messages.into_iter().rev() {
            if seen.insert(message.identifier.clone()) {
                conversation.messages.push(message);
            }
        }
        conversation.sort();
        conversation.hash = compute_hash(&conversation.messages);
        conversation
    }

    pub fn id(&self) -> Option<&ConversationId> {
        self.id.as_ref()
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn participants(&self) -> &Participants {
        &self.participants
    }

    pub fn last_modified(&self) -> DateTime<Utc> {
        self.last_modified
    }

    /// Confirmed messages, oldest first
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn pending(&self) -> Option<&PendingMessage> {
        self.pending.as_ref().map(|slot| &slot.message)
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Every row in display order: history first, then the in-flight send
    pub fn entries(&self) -> Vec<ConversationEntry> {
        self.messages
            .iter()
            .cloned()
            .map(ConversationEntry::Confirmed)
            .chain(
                self.pending
                    .iter()
                    .map(|slot| ConversationEntry::Pending(slot.message.clone())),
            )
            .collect()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.position(id).is_some()
    }

    pub fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|m| &m.identifier == id)
    }

    pub fn message(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.identifier == id)
    }

    /// Whether the stored hash still matches the content
    pub fn verify_hash(&self) -> bool {
        self.hash == compute_hash(&self.messages)
    }

    pub fn assign_id(&mut self, id: ConversationId) -> Result<(), ConversationError> {
        match &self.id {
            Some(existing) if existing == &id => Ok(()),
            Some(existing) => Err(ConversationError::AlreadyAssigned(existing.clone())),
            None => {
                self.id = Some(id);
                self.touch();
                Ok(())
            }
        }
    }

    /// Insert or replace a confirmed message.
    ///
    /// A pending entry is dropped only when `message` comes from the same
    /// author, i.e. it is the confirmation of that send. Messages from the
    /// other participant leave an in-flight send alone.
    ///
    /// Returns `false` when nothing changed, which makes re-delivery of the
    /// same message a no-op.
    pub fn append_or_replace(&mut self, message: Message) -> bool {
        let confirms_pending = self
            .pending
            .as_ref()
            .is_some_and(|slot| slot.message.from_user == message.from_user);
        let dropped_pending = confirms_pending && self.pending.take().is_some();
        if self.message(&message.identifier) == Some(&message) {
            if dropped_pending {
                self.touch();
            }
            return dropped_pending;
        }

        self.messages.retain(|m| m.identifier != message.identifier);
        self.messages.push(message);
        self.sort();
        self.commit();
        true
    }

    /// Fold the authoritative store history into this conversation.
    ///
    /// Store content wins, but a later local read date and the display
    /// toggle are kept. Local messages missing from `history` stay.
    /// Returns whether anything changed.
    pub fn merge_history(&mut self, history: Vec<Message>) -> bool {
        let mut changed = false;
        for mut incoming in history {
            if let Some(local) = self.message(&incoming.identifier) {
                incoming.is_displaying_alternate = local.is_displaying_alternate;
                if local.read_date > incoming.read_date {
                    incoming.read_date = local.read_date;
                }
            }
            changed |= self.append_or_replace(incoming);
        }
        changed
    }

    pub fn append_placeholder(
        &mut self,
        text: &str,
        language_pair: LanguagePair,
        from_user: UserId,
    ) -> Result<PendingToken, ConversationError> {
        if self.pending.is_some() {
            return Err(ConversationError::PlaceholderExists);
        }
        let token = PendingToken(Uuid::new_v4());
        self.pending = Some(PendingSlot {
            token,
            message: PendingMessage {
                from_user,
                sent_date: Utc::now(),
                translation: Translation::new(text, "", language_pair),
            },
        });
        self.touch();
        Ok(token)
    }

    /// Drop the placeholder created with `token`. A stale token is ignored.
    pub fn remove_placeholder(&mut self, token: PendingToken) -> bool {
        match &self.pending {
            Some(slot) if slot.token == token => {
                self.pending = None;
                self.touch();
                true
            }
            _ => false,
        }
    }

    /// Record when the recipient read a message. Never moves the message.
    pub fn apply_read_date(
        &mut self,
        id: &MessageId,
        date: DateTime<Utc>,
    ) -> Result<bool, ConversationError> {
        let message = self
            .messages
            .iter_mut()
            .find(|m| &m.identifier == id)
            .ok_or_else(|| ConversationError::MessageNotFound(id.clone()))?;

        match message.read_date {
            Some(existing) if existing >= date => Ok(false),
            _ => {
                message.read_date = Some(date);
                self.commit();
                Ok(true)
            }
        }
    }

    /// Swap in a corrected translation; returns the message's row index
    pub fn update_translation(
        &mut self,
        id: &MessageId,
        translation: Translation,
    ) -> Result<usize, ConversationError> {
        let position = self
            .position(id)
            .ok_or_else(|| ConversationError::MessageNotFound(id.clone()))?;
        if self.messages[position].translation != translation {
            self.messages[position].translation = translation;
            self.commit();
        }
        Ok(position)
    }

    /// Flip between showing input and output. Content and hash are unchanged.
    pub fn toggle_alternate(&mut self, id: &MessageId) -> Result<bool, ConversationError> {
        let message = self
            .messages
            .iter_mut()
            .find(|m| &m.identifier == id)
            .ok_or_else(|| ConversationError::MessageNotFound(id.clone()))?;
        message.is_displaying_alternate = !message.is_displaying_alternate;
        let showing = message.is_displaying_alternate;
        self.touch();
        Ok(showing)
    }

    fn sort(&mut self) {
        self.messages.sort_by(|a, b| {
            a.sent_date
                .cmp(&b.sent_date)
                .then_with(|| a.identifier.cmp(&b.identifier))
        });
    }

    fn commit(&mut self) {
        self.hash = compute_hash(&self.messages);
        self.touch();
    }

    fn touch(&mut self) {
        self.last_modified = Utc::now();
    }
}

/// SHA-256 fingerprint over message content, hex encoded.
///
/// `is_displaying_alternate` is a view toggle and does not contribute.
pub fn compute_hash(messages: &[Message]) -> String {
    let mut hasher = Sha256::new();
    for message in messages {
        let read = message
            .read_date
            .map(|d| d.to_rfc3339())
            .unwrap_or_default();
        let audio = message
            .audio_component
            .as_ref()
            .map(|a| a.path.display().to_string())
            .unwrap_or_default();
        let sent = message.sent_date.to_rfc3339();
        let fields: [&str; 9] = [
            message.identifier.as_str(),
            message.from_user.as_str(),
            &sent,
            &read,
            &message.translation.input,
            &message.translation.output,
            &message.translation.language_pair.from,
            &message.translation.language_pair.to,
            &audio,
        ];
        for field in fields {
            hasher.update(field.as_bytes());
            hasher.update([0x1f]);
        }
        hasher.update([0x1e]);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn participants() -> Participants {
        Participants::new("ana".into(), "ben".into()).unwrap()
    }

    pub(crate) fn message(id: &str, from: &str, minute: u32) -> Message {
        Message {
            identifier: id.into(),
            from_user: from.into(),
            sent_date: Utc.with_ymd_and_hms(2026, 10, 1, 12, minute, 0).unwrap(),
            read_date: None,
            translation: Translation::new(
                format!("hola {id}"),
                format!("hello {id}"),
                LanguagePair::new("es", "en"),
            ),
            is_displaying_alternate: false,
            audio_component: None,
        }
    }

    fn ids(conversation: &Conversation) -> Vec<&str> {
        conversation
            .messages()
            .iter()
            .map(|m| m.identifier.as_str())
            .collect()
    }

    #[test]
    fn test_append_sorts_by_sent_date() {
        let mut conversation = Conversation::new(participants());
        conversation.append_or_replace(message("c", "ben", 3));
        conversation.append_or_replace(message("a", "ana", 1));
        conversation.append_or_replace(message("b", "ben", 2));
        assert_eq!(ids(&conversation), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_append_is_idempotent() {
        let mut conversation = Conversation::new(participants());
        assert!(conversation.append_or_replace(message("a", "ana", 1)));
        let hash = conversation.hash().to_string();
        assert!(!conversation.append_or_replace(message("a", "ana", 1)));
        assert_eq!(conversation.messages().len(), 1);
        assert_eq!(conversation.hash(), hash);
    }

    #[test]
    fn test_append_replaces_same_identifier() {
        let mut conversation = Conversation::new(participants());
        conversation.append_or_replace(message("a", "ana", 1));
        let mut edited = message("a", "ana", 1);
        edited.translation.output = "hi".to_string();
        assert!(conversation.append_or_replace(edited));
        assert_eq!(conversation.messages().len(), 1);
        assert_eq!(conversation.messages()[0].translation.output, "hi");
    }

    #[test]
    fn test_placeholder_round_trip() {
        let mut conversation = Conversation::new(participants());
        conversation
            .append_placeholder("hola", LanguagePair::new("es", "en"), "ana".into())
            .unwrap();
        assert!(conversation.entries().last().unwrap().is_pending());

        let confirmed = message("m1", "ana", 5);
        conversation.append_or_replace(confirmed.clone());
        let entries = conversation.entries();
        assert!(entries.iter().all(|e| !e.is_pending()));
        assert_eq!(
            entries
                .iter()
                .filter(|e| e.identifier() == Some(&confirmed.identifier))
                .count(),
            1
        );
    }

    #[test]
    fn test_second_placeholder_is_rejected() {
        let mut conversation = Conversation::new(participants());
        let pair = LanguagePair::new("es", "en");
        conversation
            .append_placeholder("uno", pair.clone(), "ana".into())
            .unwrap();
        assert_eq!(
            conversation.append_placeholder("dos", pair, "ana".into()),
            Err(ConversationError::PlaceholderExists)
        );
        assert_eq!(conversation.pending().unwrap().translation.input, "uno");
    }

    #[test]
    fn test_stale_token_does_not_remove_newer_placeholder() {
        let mut conversation = Conversation::new(participants());
        let pair = LanguagePair::new("es", "en");
        let first = conversation
            .append_placeholder("uno", pair.clone(), "ana".into())
            .unwrap();
        conversation.append_or_replace(message("m1", "ana", 1));
        let second = conversation
            .append_placeholder("dos", pair, "ana".into())
            .unwrap();

        assert!(!conversation.remove_placeholder(first));
        assert!(conversation.has_pending());
        assert!(conversation.remove_placeholder(second));
        assert!(!conversation.has_pending());
    }

    #[test]
    fn test_remote_message_keeps_local_placeholder() {
        let mut conversation = Conversation::new(participants());
        let pair = LanguagePair::new("es", "en");
        let token = conversation
            .append_placeholder("uno", pair.clone(), "ana".into())
            .unwrap();

        assert!(conversation.append_or_replace(message("r1", "ben", 1)));
        assert!(conversation.has_pending());
        assert_eq!(
            conversation.append_placeholder("dos", pair, "ana".into()),
            Err(ConversationError::PlaceholderExists)
        );
        assert!(matches!(
            conversation.entries().last(),
            Some(ConversationEntry::Pending(p)) if p.translation.input == "uno"
        ));
        assert!(conversation.remove_placeholder(token));
    }

    #[test]
    fn test_read_date_only_moves_forward() {
        let mut conversation = Conversation::new(participants());
        conversation.append_or_replace(message("a", "ana", 1));
        let id = MessageId::new("a");
        let newer = Utc.with_ymd_and_hms(2026, 10, 1, 13, 0, 0).unwrap();
        let older = Utc.with_ymd_and_hms(2026, 10, 1, 12, 30, 0).unwrap();

        assert_eq!(conversation.apply_read_date(&id, newer), Ok(true));
        assert_eq!(conversation.apply_read_date(&id, older), Ok(false));
        assert_eq!(conversation.apply_read_date(&id, newer), Ok(false));
        assert_eq!(conversation.message(&id).unwrap().read_date, Some(newer));
        assert!(matches!(
            conversation.apply_read_date(&"zzz".into(), newer),
            Err(ConversationError::MessageNotFound(_))
        ));
    }

    #[test]
    fn test_toggle_alternate_keeps_hash() {
        let mut conversation = Conversation::new(participants());
        conversation.append_or_replace(message("a", "ana", 1));
        let hash = conversation.hash().to_string();
        assert_eq!(conversation.toggle_alternate(&"a".into()), Ok(true));
        assert_eq!(conversation.hash(), hash);
    }

    #[test]
    fn test_update_translation_changes_hash() {
        let mut conversation = Conversation::new(participants());
        conversation.append_or_replace(message("a", "ana", 1));
        conversation.append_or_replace(message("b", "ana", 2));
        let hash = conversation.hash().to_string();
        let fixed = Translation::new("hola b", "hi b", LanguagePair::new("es", "en"));
        assert_eq!(conversation.update_translation(&"b".into(), fixed), Ok(1));
        assert_ne!(conversation.hash(), hash);
        assert!(conversation.verify_hash());
    }

    #[test]
    fn test_with_messages_deduplicates() {
        let conversation = Conversation::with_messages(
            Some("c1".into()),
            participants(),
            vec![message("b", "ben", 2), message("a", "ana", 1), message("b", "ben", 2)],
        );
        assert_eq!(ids(&conversation), vec!["a", "b"]);
        assert!(conversation.verify_hash());
    }

    #[test]
    fn test_merge_history_adds_missing_and_keeps_local_state() {
        let read = Utc.with_ymd_and_hms(2026, 10, 1, 14, 0, 0).unwrap();
        let mut local = message("a", "ana", 1);
        local.read_date = Some(read);
        local.is_displaying_alternate = true;
        let mut conversation =
            Conversation::with_messages(Some("c1".into()), participants(), vec![local]);

        let history = vec![message("a", "ana", 1), message("b", "ben", 2)];
        assert!(conversation.merge_history(history.clone()));
        assert_eq!(ids(&conversation), vec!["a", "b"]);
        let a = conversation.message(&"a".into()).unwrap();
        assert_eq!(a.read_date, Some(read));
        assert!(a.is_displaying_alternate);
        assert!(conversation.verify_hash());

        assert!(!conversation.merge_history(history));
    }

    #[test]
    fn test_assign_id_once() {
        let mut conversation = Conversation::new(participants());
        conversation.assign_id("c1".into()).unwrap();
        assert!(conversation.assign_id("c1".into()).is_ok());
        assert!(matches!(
            conversation.assign_id("c2".into()),
            Err(ConversationError::AlreadyAssigned(_))
        ));
    }

    #[test]
    fn test_hash_is_deterministic() {
        let a = vec![message("a", "ana", 1), message("b", "ben", 2)];
        assert_eq!(compute_hash(&a), compute_hash(&a.clone()));
        assert_ne!(compute_hash(&a), compute_hash(&a[..1]));
    }
}
