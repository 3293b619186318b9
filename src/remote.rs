//! Remote event subscription.
//!
//! A subscription carries three independent channels for one conversation:
//! new messages, read receipts and typing state. The channels share one
//! cancellation token, so closing the screen tears them down together.

use crate::error::DeliveryResult;
use crate::model::{ConversationId, MessageId, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteChannel {
    NewMessage,
    ReadReceipt,
    Typing,
}

impl fmt::Display for RemoteChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteChannel::NewMessage => f.write_str("new-message"),
            RemoteChannel::ReadReceipt => f.write_str("read-receipt"),
            RemoteChannel::Typing => f.write_str("typing"),
        }
    }
}

/// One raw event as delivered by the push stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEvent {
    pub key: String,
    pub payload: String,
}

/// Body of a new-message event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessagePayload {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
}

impl RemoteEvent {
    pub fn new(key: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            payload: payload.into(),
        }
    }

    pub fn new_message(conversation_id: &ConversationId, message_id: &MessageId) -> Self {
        let body = NewMessagePayload {
            conversation_id: conversation_id.clone(),
            message_id: message_id.clone(),
        };
        // Two string fields cannot fail to serialize.
        let payload = serde_json::to_string(&body).unwrap_or_default();
        Self::new(message_id.as_str(), payload)
    }

    /// Keyed by the message that was read
    pub fn read_receipt(message_id: &MessageId, read_date: DateTime<Utc>) -> Self {
        Self::new(message_id.as_str(), read_date.to_rfc3339())
    }

    /// `user|device|isTyping`
    pub fn typing(user: &UserId, device: &str, is_typing: bool) -> Self {
        Self::new(user.as_str(), format!("{}|{}|{}", user, device, is_typing))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("stream disconnected: {0}")]
    Disconnected(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

pub type StreamItem = Result<RemoteEvent, StreamError>;

pub struct RemoteSubscription {
    pub new_messages: mpsc::Receiver<StreamItem>,
    pub read_receipts: mpsc::Receiver<StreamItem>,
    pub typing: mpsc::Receiver<StreamItem>,
    cancel: CancellationToken,
}

impl RemoteSubscription {
    pub fn new(
        new_messages: mpsc::Receiver<StreamItem>,
        read_receipts: mpsc::Receiver<StreamItem>,
        typing: mpsc::Receiver<StreamItem>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            new_messages,
            read_receipts,
            typing,
            cancel,
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop all three channels
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Something that can open the three channels for a conversation.
///
/// Implementations do not reconnect on their own; the caller subscribes again
/// when the conversation screen is re-entered.
#[async_trait]
pub trait RemoteEventSource: Send + Sync {
    async fn subscribe(
        &self,
        conversation_id: &ConversationId,
        cancel: CancellationToken,
    ) -> DeliveryResult<RemoteSubscription>;
}

#[derive(Debug, Clone)]
struct Taps {
    new_messages: mpsc::Sender<StreamItem>,
    read_receipts: mpsc::Sender<StreamItem>,
    typing: mpsc::Sender<StreamItem>,
}

impl Taps {
    fn sender(&self, channel: RemoteChannel) -> &mpsc::Sender<StreamItem> {
        match channel {
            RemoteChannel::NewMessage => &self.new_messages,
            RemoteChannel::ReadReceipt => &self.read_receipts,
            RemoteChannel::Typing => &self.typing,
        }
    }
}

/// In-process fan-out of remote events, used by tests and the offline demo
#[derive(Debug)]
pub struct LocalEventHub {
    buffer: usize,
    taps: Mutex<HashMap<ConversationId, Vec<Taps>>>,
}

impl LocalEventHub {
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
            taps: Mutex::new(HashMap::new()),
        }
    }

    /// Deliver `item` to every live subscriber of `conversation_id`.
    /// Returns how many subscribers received it.
    pub async fn publish(
        &self,
        conversation_id: &ConversationId,
        channel: RemoteChannel,
        item: StreamItem,
    ) -> usize {
        let taps: Vec<Taps> = self
            .taps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(conversation_id)
            .cloned()
            .unwrap_or_default();

        let mut delivered = 0;
        for tap in &taps {
            if tap.sender(channel).send(item.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        self.prune(conversation_id);
        debug!(conversation_id = %conversation_id, %channel, delivered, "published remote event");
        delivered
    }

    /// Drop every subscriber of `conversation_id`, ending their streams
    pub fn disconnect(&self, conversation_id: &ConversationId) {
        self.taps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(conversation_id);
    }

    fn prune(&self, conversation_id: &ConversationId) {
        let mut taps = self.taps.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(list) = taps.get_mut(conversation_id) {
            list.retain(|tap| !tap.new_messages.is_closed());
            if list.is_empty() {
                taps.remove(conversation_id);
            }
        }
    }
}

impl Default for LocalEventHub {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl RemoteEventSource for LocalEventHub {
    async fn subscribe(
        &self,
        conversation_id: &ConversationId,
        cancel: CancellationToken,
    ) -> DeliveryResult<RemoteSubscription> {
        let (new_tx, new_rx) = mpsc::channel(self.buffer);
        let (read_tx, read_rx) = mpsc::channel(self.buffer);
        let (typing_tx, typing_rx) = mpsc::channel(self.buffer);
        self.taps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(conversation_id.clone())
            .or_default()
            .push(Taps {
                new_messages: new_tx,
                read_receipts: read_tx,
                typing: typing_tx,
            });
        Ok(RemoteSubscription::new(new_rx, read_rx, typing_rx, cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hub_routes_by_channel() {
        let hub = LocalEventHub::default();
        let conversation: ConversationId = "c1".into();
        let mut subscription = hub
            .subscribe(&conversation, CancellationToken::new())
            .await
            .unwrap();

        let event = RemoteEvent::typing(&"ben".into(), "phone", true);
        assert_eq!(
            hub.publish(&conversation, RemoteChannel::Typing, Ok(event.clone()))
                .await,
            1
        );
        assert_eq!(subscription.typing.recv().await.unwrap(), Ok(event));
        assert!(subscription.new_messages.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned() {
        let hub = LocalEventHub::default();
        let conversation: ConversationId = "c1".into();
        let subscription = hub
            .subscribe(&conversation, CancellationToken::new())
            .await
            .unwrap();
        drop(subscription);

        let event = RemoteEvent::new_message(&conversation, &"m1".into());
        assert_eq!(
            hub.publish(&conversation, RemoteChannel::NewMessage, Ok(event))
                .await,
            0
        );
    }

    #[tokio::test]
    async fn test_disconnect_ends_streams() {
        let hub = LocalEventHub::default();
        let conversation: ConversationId = "c1".into();
        let mut subscription = hub
            .subscribe(&conversation, CancellationToken::new())
            .await
            .unwrap();
        hub.disconnect(&conversation);
        assert!(subscription.read_receipts.recv().await.is_none());
    }

    #[test]
    fn test_new_message_payload_shape() {
        let event = RemoteEvent::new_message(&"c1".into(), &"m1".into());
        let body: NewMessagePayload = serde_json::from_str(&event.payload).unwrap();
        assert_eq!(body.conversation_id.as_str(), "c1");
        assert_eq!(event.key, "m1");
    }
}
