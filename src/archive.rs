//! Local write-through archive of open conversations.
//!
//! Entries are keyed by conversation id and carry the content hash they were
//! written with. A write whose hash matches the archived one is skipped, and
//! an entry whose content no longer matches its hash is treated as diverged
//! and ignored on load.
//!
//! The archive also keeps the durable "missed notification" flags raised when
//! a new-message event arrives for a conversation that is not on screen. The
//! conversation list consults them; nothing else does.

use crate::conversation::Conversation;
use crate::error::{ArchiveError, ArchiveResult};
use crate::model::ConversationId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[async_trait]
pub trait Archive: Send + Sync {
    async fn add_to_archive(&self, conversation: &Conversation) -> ArchiveResult<()>;

    async fn clear_archive(&self) -> ArchiveResult<()>;

    async fn load(&self, id: &ConversationId) -> ArchiveResult<Option<Conversation>>;

    async fn flag_missed_notification(&self, id: &ConversationId) -> ArchiveResult<()>;

    async fn missed_notifications(&self) -> ArchiveResult<Vec<ConversationId>>;

    async fn clear_missed_notification(&self, id: &ConversationId) -> ArchiveResult<()>;
}

/// Archive the current state, logging instead of failing. Used after every
/// committed mutation, where an archive failure must not undo the mutation.
pub async fn write_through(archive: &dyn Archive, conversation: &Conversation) {
    if let Err(err) = archive.add_to_archive(conversation).await {
        warn!(conversation_id = ?conversation.id(), "failed to archive conversation: {err}");
    }
}

fn verified(id: &ConversationId, conversation: Conversation) -> Option<Conversation> {
    if conversation.verify_hash() {
        Some(conversation)
    } else {
        warn!(conversation_id = %id, "archived conversation diverged from its hash; ignoring");
        None
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    conversations: HashMap<ConversationId, Conversation>,
    missed: BTreeSet<ConversationId>,
}

#[derive(Debug, Default)]
pub struct MemoryArchive {
    inner: Mutex<MemoryInner>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Archive for MemoryArchive {
    async fn add_to_archive(&self, conversation: &Conversation) -> ArchiveResult<()> {
        let id = conversation.id().ok_or(ArchiveError::Unkeyed)?;
        let mut inner = self.inner.lock().await;
        if inner
            .conversations
            .get(id)
            .is_some_and(|archived| archived.hash() == conversation.hash())
        {
            return Ok(());
        }
        inner.conversations.insert(id.clone(), conversation.clone());
        Ok(())
    }

    async fn clear_archive(&self) -> ArchiveResult<()> {
        self.inner.lock().await.conversations.clear();
        Ok(())
    }

    async fn load(&self, id: &ConversationId) -> ArchiveResult<Option<Conversation>> {
        let archived = self.inner.lock().await.conversations.get(id).cloned();
        Ok(archived.and_then(|conversation| verified(id, conversation)))
    }

    async fn flag_missed_notification(&self, id: &ConversationId) -> ArchiveResult<()> {
        self.inner.lock().await.missed.insert(id.clone());
        Ok(())
    }

    async fn missed_notifications(&self) -> ArchiveResult<Vec<ConversationId>> {
        Ok(self.inner.lock().await.missed.iter().cloned().collect())
    }

    async fn clear_missed_notification(&self, id: &ConversationId) -> ArchiveResult<()> {
        self.inner.lock().await.missed.remove(id);
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ArchivedConversation {
    hash: String,
    conversation: Conversation,
}

const MISSED_FILE: &str = "missed_notifications.json";

/// One JSON file per conversation under a directory
#[derive(Debug)]
pub struct JsonFileArchive {
    dir: PathBuf,
    // serializes read-modify-write of the missed-notification file
    missed_lock: Mutex<()>,
}

impl JsonFileArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            missed_lock: Mutex::new(()),
        }
    }

    fn entry_path(&self, id: &ConversationId) -> PathBuf {
        self.dir.join(format!("conversation-{}.json", id))
    }

    async fn write_atomic(&self, path: &Path, bytes: Vec<u8>) -> ArchiveResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn read_entry(&self, id: &ConversationId) -> ArchiveResult<Option<ArchivedConversation>> {
        match tokio::fs::read(self.entry_path(id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn read_missed(&self) -> ArchiveResult<BTreeSet<ConversationId>> {
        match tokio::fs::read(self.dir.join(MISSED_FILE)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(BTreeSet::new()),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_missed(&self, missed: &BTreeSet<ConversationId>) -> ArchiveResult<()> {
        let bytes = serde_json::to_vec_pretty(missed)?;
        self.write_atomic(&self.dir.join(MISSED_FILE), bytes).await
    }
}

#[async_trait]
impl Archive for JsonFileArchive {
    async fn add_to_archive(&self, conversation: &Conversation) -> ArchiveResult<()> {
        let id = conversation.id().ok_or(ArchiveError::Unkeyed)?;
        if let Ok(Some(existing)) = self.read_entry(id).await {
            if existing.hash == conversation.hash() {
                debug!(conversation_id = %id, "archive already current");
                return Ok(());
            }
        }
        let entry = ArchivedConversation {
            hash: conversation.hash().to_string(),
            conversation: conversation.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&entry)?;
        self.write_atomic(&self.entry_path(id), bytes).await
    }

    async fn clear_archive(&self) -> ArchiveResult<()> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with("conversation-") {
                tokio::fs::remove_file(entry.path()).await?;
            }
        }
        Ok(())
    }

    async fn load(&self, id: &ConversationId) -> ArchiveResult<Option<Conversation>> {
        let Some(entry) = self.read_entry(id).await? else {
            return Ok(None);
        };
        if entry.hash != entry.conversation.hash() {
            warn!(conversation_id = %id, "archived hash does not match entry; ignoring");
            return Ok(None);
        }
        Ok(verified(id, entry.conversation))
    }

    async fn flag_missed_notification(&self, id: &ConversationId) -> ArchiveResult<()> {
        let _guard = self.missed_lock.lock().await;
        let mut missed = self.read_missed().await?;
        if missed.insert(id.clone()) {
            self.write_missed(&missed).await?;
        }
        Ok(())
    }

    async fn missed_notifications(&self) -> ArchiveResult<Vec<ConversationId>> {
        let _guard = self.missed_lock.lock().await;
        Ok(self.read_missed().await?.into_iter().collect())
    }

    async fn clear_missed_notification(&self, id: &ConversationId) -> ArchiveResult<()> {
        let _guard = self.missed_lock.lock().await;
        let mut missed = self.read_missed().await?;
        if missed.remove(id) {
            self.write_missed(&missed).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::state::tests::{message, participants};

    fn conversation() -> Conversation {
        Conversation::with_messages(
            Some("c1".into()),
            participants(),
            vec![message("a", "ana", 1), message("b", "ben", 2)],
        )
    }

    #[tokio::test]
    async fn test_memory_archive_round_trip() {
        let archive = MemoryArchive::new();
        archive.add_to_archive(&conversation()).await.unwrap();
        let loaded = archive.load(&"c1".into()).await.unwrap().unwrap();
        assert_eq!(loaded.messages().len(), 2);

        archive.clear_archive().await.unwrap();
        assert!(archive.load(&"c1".into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unkeyed_conversation_is_rejected() {
        let archive = MemoryArchive::new();
        let result = archive.add_to_archive(&Conversation::new(participants())).await;
        assert!(matches!(result, Err(ArchiveError::Unkeyed)));
    }

    #[tokio::test]
    async fn test_file_archive_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let archive = JsonFileArchive::new(dir.path());
        let original = conversation();
        archive.add_to_archive(&original).await.unwrap();

        let loaded = archive.load(&"c1".into()).await.unwrap().unwrap();
        assert_eq!(loaded.hash(), original.hash());
        assert_eq!(loaded.messages(), original.messages());

        archive.clear_archive().await.unwrap();
        assert!(archive.load(&"c1".into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_archive_ignores_diverged_entry() {
        let dir = tempfile::tempdir().unwrap();
        let archive = JsonFileArchive::new(dir.path());
        archive.add_to_archive(&conversation()).await.unwrap();

        let path = archive.entry_path(&"c1".into());
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, text.replace("hello a", "tampered")).unwrap();

        assert!(archive.load(&"c1".into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missed_notifications_are_durable() {
        let dir = tempfile::tempdir().unwrap();
        {
            let archive = JsonFileArchive::new(dir.path());
            archive.flag_missed_notification(&"c2".into()).await.unwrap();
            archive.flag_missed_notification(&"c2".into()).await.unwrap();
        }
        let reopened = JsonFileArchive::new(dir.path());
        assert_eq!(
            reopened.missed_notifications().await.unwrap(),
            vec![ConversationId::from("c2")]
        );
        reopened.clear_missed_notification(&"c2".into()).await.unwrap();
        assert!(reopened.missed_notifications().await.unwrap().is_empty());
    }
}
