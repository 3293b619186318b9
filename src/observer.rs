//! Merges remote mutations into the open conversation.
//!
//! The observer drains the three channels of a [`RemoteSubscription`] and
//! turns each event into a command on the conversation task. Nothing here
//! can take the stream down: malformed payloads and stream errors are
//! logged and dropped, and the loop only ends when every channel has closed
//! or the subscription is cancelled.

use crate::archive::{Archive, write_through};
use crate::conversation::ConversationHandle;
use crate::error::{ConversationError, DeliveryError, DeliveryResult};
use crate::model::{MessageId, UserId};
use crate::refresh::{RefreshRequest, RefreshSignal};
use crate::remote::{NewMessagePayload, RemoteChannel, RemoteEvent, RemoteSubscription, StreamItem};
use crate::store::MessageStore;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::{Arc, LazyLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

static TYPING_PAYLOAD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<user>[^|]+)\|(?P<device>[^|]*)\|(?P<typing>true|false|1|0)$")
        .unwrap_or_else(|err| panic!("invalid typing pattern: {err}"))
});

/// What a new-message event amounted to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NewMessageOutcome {
    Appended(MessageId),
    AlreadyPresent,
    /// Applied optimistically when it was sent from this device
    OwnMessage,
    /// For a conversation that is not open; a missed-notification flag was set
    OtherConversation,
}

/// A parsed typing-indicator payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingEvent {
    pub user: UserId,
    pub device: String,
    pub is_typing: bool,
}

impl TypingEvent {
    pub fn parse(payload: &str) -> DeliveryResult<Self> {
        let captures = TYPING_PAYLOAD
            .captures(payload.trim())
            .ok_or_else(|| DeliveryError::MalformedRemoteEvent(format!("typing payload '{payload}'")))?;
        Ok(Self {
            user: UserId::new(&captures["user"]),
            device: captures["device"].to_string(),
            is_typing: matches!(&captures["typing"], "true" | "1"),
        })
    }
}

/// Read dates arrive either as RFC 3339 text or as epoch milliseconds
pub fn parse_read_date(payload: &str) -> DeliveryResult<DateTime<Utc>> {
    let payload = payload.trim();
    if let Ok(date) = DateTime::parse_from_rfc3339(payload) {
        return Ok(date.with_timezone(&Utc));
    }
    payload
        .parse::<i64>()
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .ok_or_else(|| DeliveryError::MalformedRemoteEvent(format!("read date '{payload}'")))
}

pub struct SyncObserver {
    conversation: ConversationHandle,
    store: Arc<dyn MessageStore>,
    archive: Arc<dyn Archive>,
    refresh: RefreshSignal,
    local_user: UserId,
    typing: watch::Sender<bool>,
}

impl SyncObserver {
    pub fn new(
        conversation: ConversationHandle,
        store: Arc<dyn MessageStore>,
        archive: Arc<dyn Archive>,
        refresh: RefreshSignal,
    ) -> Self {
        let local_user = conversation.snapshot().participants().local.clone();
        let (typing, _) = watch::channel(false);
        Self {
            conversation,
            store,
            archive,
            refresh,
            local_user,
            typing,
        }
    }

    /// Whether the other participant is typing right now
    pub fn typing(&self) -> watch::Receiver<bool> {
        self.typing.subscribe()
    }

    pub fn spawn(self, subscription: RemoteSubscription) -> JoinHandle<()> {
        tokio::spawn(self.run(subscription))
    }

    pub async fn run(self, mut subscription: RemoteSubscription) {
        let cancel = subscription.cancel_token();
        let (mut messages_open, mut receipts_open, mut typing_open) = (true, true, true);
        info!(conversation_id = ?self.conversation.snapshot().id(), "remote observer started");

        while messages_open || receipts_open || typing_open {
            tokio::select! {
                _ = cancel.cancelled() => break,
                item = subscription.new_messages.recv(), if messages_open => match item {
                    Some(item) => self.dispatch(RemoteChannel::NewMessage, item).await,
                    None => messages_open = false,
                },
                item = subscription.read_receipts.recv(), if receipts_open => match item {
                    Some(item) => self.dispatch(RemoteChannel::ReadReceipt, item).await,
                    None => receipts_open = false,
                },
                item = subscription.typing.recv(), if typing_open => match item {
                    Some(item) => self.dispatch(RemoteChannel::Typing, item).await,
                    None => typing_open = false,
                },
            }
        }

        self.typing.send_replace(false);
        info!("remote observer stopped");
    }

    async fn dispatch(&self, channel: RemoteChannel, item: StreamItem) {
        let event = match item {
            Ok(event) => event,
            Err(err) => {
                warn!(%channel, "remote stream error: {err}");
                return;
            }
        };
        let result = match channel {
            RemoteChannel::NewMessage => self.handle_new_message(&event).await.map(drop),
            RemoteChannel::ReadReceipt => self.handle_read_receipt(&event).await.map(drop),
            RemoteChannel::Typing => self.handle_typing(&event).map(drop),
        };
        if let Err(err) = result {
            warn!(%channel, key = %event.key, "dropping remote event: {err}");
        }
    }

    pub async fn handle_new_message(&self, event: &RemoteEvent) -> DeliveryResult<NewMessageOutcome> {
        let body: NewMessagePayload = serde_json::from_str(&event.payload)
            .map_err(|err| DeliveryError::MalformedRemoteEvent(format!("new-message payload: {err}")))?;

        let snapshot = self.conversation.snapshot();
        if snapshot.id() != Some(&body.conversation_id) {
            self.archive
                .flag_missed_notification(&body.conversation_id)
                .await?;
            debug!(conversation_id = %body.conversation_id, "missed notification recorded");
            return Ok(NewMessageOutcome::OtherConversation);
        }
        if snapshot.contains(&body.message_id) {
            return Ok(NewMessageOutcome::AlreadyPresent);
        }

        let message = self
            .store
            .get_message(&body.message_id)
            .await
            .map_err(DeliveryError::StoreLookup)?;
        if message.from_user == self.local_user {
            return Ok(NewMessageOutcome::OwnMessage);
        }

        let id = message.identifier.clone();
        if !self.conversation.append_or_replace(message).await? {
            return Ok(NewMessageOutcome::AlreadyPresent);
        }
        write_through(self.archive.as_ref(), &self.conversation.snapshot()).await;
        self.refresh.signal(RefreshRequest::All);
        debug!(message_id = %id, "merged remote message");
        Ok(NewMessageOutcome::Appended(id))
    }

    /// Returns whether the read date moved forward
    pub async fn handle_read_receipt(&self, event: &RemoteEvent) -> DeliveryResult<bool> {
        let id = MessageId::new(event.key.as_str());
        let date = parse_read_date(&event.payload)?;
        match self.conversation.apply_read_date(&id, date).await {
            Ok(true) => {
                write_through(self.archive.as_ref(), &self.conversation.snapshot()).await;
                self.refresh.signal(RefreshRequest::Row(id));
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(ConversationError::MessageNotFound(_)) => {
                debug!(message_id = %id, "read receipt for a message not loaded here");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Returns the new typing state, or `None` for self-originated events
    pub fn handle_typing(&self, event: &RemoteEvent) -> DeliveryResult<Option<bool>> {
        let typing = TypingEvent::parse(&event.payload)?;
        if typing.user == self.local_user {
            return Ok(None);
        }
        self.typing.send_replace(typing.is_typing);
        Ok(Some(typing.is_typing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::MemoryArchive;
    use crate::conversation::{Conversation, ConversationActor};
    use crate::model::{LanguagePair, Participants, Translation};
    use crate::remote::{LocalEventHub, RemoteEventSource, StreamError};
    use crate::store::InMemoryStore;
    use chrono::TimeZone;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Harness {
        observer: SyncObserver,
        handle: ConversationHandle,
        store: Arc<InMemoryStore>,
        archive: Arc<MemoryArchive>,
        refresh: RefreshSignal,
        id: crate::model::ConversationId,
    }

    async fn harness() -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let participants = Participants::new("ana".into(), "ben".into()).unwrap();
        let id = store.create_conversation(&participants).await.unwrap();
        let (handle, _) = ConversationActor::spawn(
            Conversation::with_messages(Some(id.clone()), participants, Vec::new()),
            16,
            CancellationToken::new(),
        );
        let archive = Arc::new(MemoryArchive::new());
        let refresh = RefreshSignal::new();
        let observer = SyncObserver::new(handle.clone(), store.clone(), archive.clone(), refresh.clone());
        Harness {
            observer,
            handle,
            store,
            archive,
            refresh,
            id,
        }
    }

    async fn remote_message(h: &Harness, from: &str) -> crate::model::Message {
        h.store
            .create_message(
                &h.id,
                &from.into(),
                Translation::new("Hello", "Hola", LanguagePair::new("en", "es")),
                None,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_new_message_is_idempotent() {
        let h = harness().await;
        let message = remote_message(&h, "ben").await;
        let event = RemoteEvent::new_message(&h.id, &message.identifier);

        assert_eq!(
            h.observer.handle_new_message(&event).await.unwrap(),
            NewMessageOutcome::Appended(message.identifier.clone())
        );
        assert!(h.refresh.take());
        assert_eq!(
            h.observer.handle_new_message(&event).await.unwrap(),
            NewMessageOutcome::AlreadyPresent
        );
        assert!(!h.refresh.should_reload_data());
        assert_eq!(h.handle.snapshot().messages(), &[message]);
        assert!(h.archive.load(&h.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_own_message_is_skipped() {
        let h = harness().await;
        let message = remote_message(&h, "ana").await;
        let event = RemoteEvent::new_message(&h.id, &message.identifier);
        assert_eq!(
            h.observer.handle_new_message(&event).await.unwrap(),
            NewMessageOutcome::OwnMessage
        );
        assert!(h.handle.snapshot().messages().is_empty());
    }

    #[tokio::test]
    async fn test_other_conversation_sets_missed_flag() {
        let h = harness().await;
        let event = RemoteEvent::new_message(&"elsewhere".into(), &"m9".into());
        assert_eq!(
            h.observer.handle_new_message(&event).await.unwrap(),
            NewMessageOutcome::OtherConversation
        );
        assert_eq!(
            h.archive.missed_notifications().await.unwrap(),
            vec![crate::model::ConversationId::from("elsewhere")]
        );
        assert!(h.handle.snapshot().messages().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_new_message_is_rejected() {
        let h = harness().await;
        let result = h
            .observer
            .handle_new_message(&RemoteEvent::new("k", "not json"))
            .await;
        assert!(matches!(result, Err(DeliveryError::MalformedRemoteEvent(_))));
    }

    #[tokio::test]
    async fn test_stale_read_receipt_is_noop() {
        let h = harness().await;
        let message = remote_message(&h, "ben").await;
        h.handle.append_or_replace(message.clone()).await.unwrap();

        let newer = Utc.with_ymd_and_hms(2026, 10, 2, 9, 0, 0).unwrap();
        let older = Utc.with_ymd_and_hms(2026, 10, 2, 8, 0, 0).unwrap();
        let id = &message.identifier;
        assert!(h.observer.handle_read_receipt(&RemoteEvent::read_receipt(id, newer)).await.unwrap());
        assert!(!h.observer.handle_read_receipt(&RemoteEvent::read_receipt(id, older)).await.unwrap());
        assert!(!h.observer.handle_read_receipt(&RemoteEvent::read_receipt(id, newer)).await.unwrap());
        assert_eq!(h.handle.snapshot().message(id).unwrap().read_date, Some(newer));
    }

    #[tokio::test]
    async fn test_read_receipt_for_unknown_message_is_ignored() {
        let h = harness().await;
        let event = RemoteEvent::new("missing", "1791000000000");
        assert!(!h.observer.handle_read_receipt(&event).await.unwrap());
    }

    #[test]
    fn test_read_date_formats() {
        let rfc = parse_read_date("2026-10-02T09:00:00Z").unwrap();
        let millis = parse_read_date(&rfc.timestamp_millis().to_string()).unwrap();
        assert_eq!(rfc, millis);
        assert!(parse_read_date("yesterday").is_err());
    }

    #[test]
    fn test_typing_payload_parse() {
        let event = TypingEvent::parse("ben|Pixel 8|true").unwrap();
        assert_eq!(event.user, UserId::from("ben"));
        assert_eq!(event.device, "Pixel 8");
        assert!(event.is_typing);
        assert!(TypingEvent::parse("ben|true").is_err());
        assert!(TypingEvent::parse("ben|phone|maybe").is_err());
    }

    #[tokio::test]
    async fn test_self_typing_is_ignored() {
        let h = harness().await;
        let typing = h.observer.typing();
        let own = RemoteEvent::typing(&"ana".into(), "phone", true);
        assert_eq!(h.observer.handle_typing(&own).unwrap(), None);
        assert!(!*typing.borrow());

        let theirs = RemoteEvent::typing(&"ben".into(), "phone", true);
        assert_eq!(h.observer.handle_typing(&theirs).unwrap(), Some(true));
        assert!(*typing.borrow());
    }

    #[tokio::test]
    async fn test_run_survives_bad_events_and_stops_on_cancel() {
        let h = harness().await;
        let hub = LocalEventHub::default();
        let cancel = CancellationToken::new();
        let subscription = hub.subscribe(&h.id, cancel.clone()).await.unwrap();
        let message = remote_message(&h, "ben").await;
        let handle = h.handle.clone();
        let task = h.observer.spawn(subscription);

        hub.publish(&h.id, RemoteChannel::NewMessage, Ok(RemoteEvent::new("x", "{")))
            .await;
        hub.publish(
            &h.id,
            RemoteChannel::ReadReceipt,
            Err(StreamError::Disconnected("reset".into())),
        )
        .await;
        hub.publish(
            &h.id,
            RemoteChannel::NewMessage,
            Ok(RemoteEvent::new_message(&h.id, &message.identifier)),
        )
        .await;

        let mut snapshots = handle.subscribe();
        tokio::time::timeout(Duration::from_secs(1), async {
            while snapshots.borrow_and_update().messages().is_empty() {
                snapshots.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
