//! One owning task per open conversation.
//!
//! Every mutation arrives as a [`Command`] on an mpsc channel and is applied
//! in arrival order, so an optimistic append and a concurrently-arriving
//! remote append can never interleave their read-modify-write. After each
//! command the task publishes an immutable snapshot on a watch channel;
//! readers never wait on the task.

use crate::conversation::state::{Conversation, PendingToken};
use crate::error::ConversationError;
use crate::model::{ConversationId, LanguagePair, Message, MessageId, Translation, UserId};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

type Reply<T> = oneshot::Sender<T>;

#[derive(Debug)]
pub enum Command {
    AppendOrReplace {
        message: Message,
        reply: Reply<bool>,
    },
    AppendPlaceholder {
        text: String,
        language_pair: LanguagePair,
        from_user: UserId,
        reply: Reply<Result<PendingToken, ConversationError>>,
    },
    RemovePlaceholder {
        token: PendingToken,
        reply: Reply<bool>,
    },
    ApplyReadDate {
        id: MessageId,
        date: DateTime<Utc>,
        reply: Reply<Result<bool, ConversationError>>,
    },
    UpdateTranslation {
        id: MessageId,
        translation: Translation,
        reply: Reply<Result<usize, ConversationError>>,
    },
    ToggleAlternate {
        id: MessageId,
        reply: Reply<Result<bool, ConversationError>>,
    },
    AssignId {
        id: ConversationId,
        reply: Reply<Result<(), ConversationError>>,
    },
}

pub struct ConversationActor {
    conversation: Conversation,
    commands: mpsc::Receiver<Command>,
    snapshots: watch::Sender<Arc<Conversation>>,
    cancel: CancellationToken,
}

impl ConversationActor {
    /// Start the owning task. It stops when `cancel` fires or every handle
    /// has been dropped.
    pub fn spawn(
        conversation: Conversation,
        buffer: usize,
        cancel: CancellationToken,
    ) -> (ConversationHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let (snapshots, snapshot_rx) = watch::channel(Arc::new(conversation.clone()));
        let actor = Self {
            conversation,
            commands: rx,
            snapshots,
            cancel,
        };
        let join = tokio::spawn(actor.run());
        (
            ConversationHandle {
                commands: tx,
                snapshot: snapshot_rx,
            },
            join,
        )
    }

    async fn run(mut self) {
        let id = self.conversation.id().cloned();
        debug!(conversation_id = ?id, "conversation task started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
            }
        }
        info!(conversation_id = ?id, "conversation task stopped");
    }

    fn handle(&mut self, command: Command) {
        // Publish before replying so a caller that resumes on another worker
        // already sees its own mutation. A dropped reply receiver means the
        // caller gave up; the mutation still stands.
        match command {
            Command::AppendOrReplace { message, reply } => {
                let changed = self.conversation.append_or_replace(message);
                self.publish();
                let _ = reply.send(changed);
            }
            Command::AppendPlaceholder {
                text,
                language_pair,
                from_user,
                reply,
            } => {
                let result = self
                    .conversation
                    .append_placeholder(&text, language_pair, from_user);
                self.publish();
                let _ = reply.send(result);
            }
            Command::RemovePlaceholder { token, reply } => {
                let removed = self.conversation.remove_placeholder(token);
                self.publish();
                let _ = reply.send(removed);
            }
            Command::ApplyReadDate { id, date, reply } => {
                let result = self.conversation.apply_read_date(&id, date);
                self.publish();
                let _ = reply.send(result);
            }
            Command::UpdateTranslation {
                id,
                translation,
                reply,
            } => {
                let result = self.conversation.update_translation(&id, translation);
                self.publish();
                let _ = reply.send(result);
            }
            Command::ToggleAlternate { id, reply } => {
                let result = self.conversation.toggle_alternate(&id);
                self.publish();
                let _ = reply.send(result);
            }
            Command::AssignId { id, reply } => {
                let result = self.conversation.assign_id(id);
                self.publish();
                let _ = reply.send(result);
            }
        }
    }

    fn publish(&self) {
        let current = self.snapshots.borrow().clone();
        if *current != self.conversation {
            self.snapshots.send_replace(Arc::new(self.conversation.clone()));
        }
    }
}

/// Cloneable access to a running conversation task
#[derive(Debug, Clone)]
pub struct ConversationHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<Arc<Conversation>>,
}

impl ConversationHandle {
    /// The state as of the last applied command
    pub fn snapshot(&self) -> Arc<Conversation> {
        self.snapshot.borrow().clone()
    }

    /// Receiver that wakes on every published snapshot
    pub fn subscribe(&self) -> watch::Receiver<Arc<Conversation>> {
        self.snapshot.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, ConversationError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| ConversationError::Closed)?;
        rx.await.map_err(|_| ConversationError::Closed)
    }

    pub async fn append_or_replace(&self, message: Message) -> Result<bool, ConversationError> {
        self.request(|reply| Command::AppendOrReplace { message, reply })
            .await
    }

    pub async fn append_placeholder(
        &self,
        text: &str,
        language_pair: LanguagePair,
        from_user: UserId,
    ) -> Result<PendingToken, ConversationError> {
        let text = text.to_string();
        self.request(|reply| Command::AppendPlaceholder {
            text,
            language_pair,
            from_user,
            reply,
        })
        .await?
    }

    pub async fn remove_placeholder(&self, token: PendingToken) -> Result<bool, ConversationError> {
        self.request(|reply| Command::RemovePlaceholder { token, reply })
            .await
    }

    pub async fn apply_read_date(
        &self,
        id: &MessageId,
        date: DateTime<Utc>,
    ) -> Result<bool, ConversationError> {
        let id = id.clone();
        self.request(|reply| Command::ApplyReadDate { id, date, reply })
            .await?
    }

    pub async fn update_translation(
        &self,
        id: &MessageId,
        translation: Translation,
    ) -> Result<usize, ConversationError> {
        let id = id.clone();
        self.request(|reply| Command::UpdateTranslation {
            id,
            translation,
            reply,
        })
        .await?
    }

    pub async fn toggle_alternate(&self, id: &MessageId) -> Result<bool, ConversationError> {
        let id = id.clone();
        self.request(|reply| Command::ToggleAlternate { id, reply })
            .await?
    }

    pub async fn assign_id(&self, id: ConversationId) -> Result<(), ConversationError> {
        self.request(|reply| Command::AssignId { id, reply }).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::state::tests::{message, participants};
    use std::collections::HashSet;

    fn spawn() -> (ConversationHandle, CancellationToken) {
        let cancel = CancellationToken::new();
        let (handle, _join) =
            ConversationActor::spawn(Conversation::new(participants()), 16, cancel.clone());
        (handle, cancel)
    }

    #[tokio::test]
    async fn test_snapshot_reflects_commands() {
        let (handle, _cancel) = spawn();
        assert!(handle.append_or_replace(message("a", "ben", 1)).await.unwrap());
        assert_eq!(handle.snapshot().messages().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_appends_keep_invariants() {
        let (handle, _cancel) = spawn();
        let pair = LanguagePair::new("es", "en");

        let optimistic = {
            let handle = handle.clone();
            let pair = pair.clone();
            tokio::spawn(async move {
                let token = handle
                    .append_placeholder("hola", pair, "ana".into())
                    .await
                    .unwrap();
                tokio::task::yield_now().await;
                handle.append_or_replace(message("local", "ana", 30)).await.unwrap();
                token
            })
        };
        let remotes: Vec<_> = (0..20)
            .map(|i| {
                let handle = handle.clone();
                tokio::spawn(async move {
                    // every remote id is delivered twice
                    let id = format!("r{}", i % 10);
                    handle
                        .append_or_replace(message(&id, "ben", i % 10))
                        .await
                        .unwrap();
                })
            })
            .collect();

        optimistic.await.unwrap();
        for remote in remotes {
            remote.await.unwrap();
        }

        let snapshot = handle.snapshot();
        let messages = snapshot.messages();
        assert_eq!(messages.len(), 11);
        assert!(messages.windows(2).all(|w| w[0].sent_date <= w[1].sent_date));
        let unique: HashSet<_> = messages.iter().map(|m| &m.identifier).collect();
        assert_eq!(unique.len(), messages.len());
        assert!(snapshot.entries().iter().filter(|e| e.is_pending()).count() <= 1);
        assert!(!snapshot.has_pending());
    }

    #[tokio::test]
    async fn test_second_placeholder_rejected_through_handle() {
        let (handle, _cancel) = spawn();
        let pair = LanguagePair::new("es", "en");
        handle
            .append_placeholder("uno", pair.clone(), "ana".into())
            .await
            .unwrap();
        assert_eq!(
            handle.append_placeholder("dos", pair, "ana".into()).await,
            Err(ConversationError::PlaceholderExists)
        );
    }

    #[tokio::test]
    async fn test_cancel_closes_handle() {
        let (handle, cancel) = spawn();
        cancel.cancel();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(
            handle.append_or_replace(message("a", "ben", 1)).await,
            Err(ConversationError::Closed)
        );
    }
}
