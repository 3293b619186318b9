//! One open conversation screen.
//!
//! [`ChatSession`] wires the conversation task, the delivery and retry
//! pipelines, the remote observer and the pagination window together, and
//! tears all of them down with a single cancellation token on close.

use crate::archive::Archive;
use crate::config::EngineConfig;
use crate::conversation::{Conversation, ConversationActor, ConversationHandle, compute_hash};
use crate::delivery::{AudioSynthesizer, Composition, DeliveryPipeline, PushNotifier};
use crate::error::{DeliveryError, DeliveryResult};
use crate::model::{
    ConversationEntry, ConversationId, LanguagePreferences, Message, MessageId, Participants,
    Translation,
};
use crate::mt::TranslationGateway;
use crate::observer::SyncObserver;
use crate::pagination::{LoadTrigger, PaginationWindow};
use crate::refresh::{RefreshRequest, RefreshSignal};
use crate::remote::RemoteEventSource;
use crate::retry::RetryPipeline;
use crate::store::MessageStore;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// External collaborators a session calls into
#[derive(Clone)]
pub struct SessionServices {
    pub gateway: TranslationGateway,
    pub store: Arc<dyn MessageStore>,
    pub archive: Arc<dyn Archive>,
    pub events: Arc<dyn RemoteEventSource>,
    pub audio: Option<Arc<dyn AudioSynthesizer>>,
    pub push: Option<Arc<dyn PushNotifier>>,
}

pub struct ChatSession {
    conversation: ConversationHandle,
    delivery: DeliveryPipeline,
    retry: RetryPipeline,
    refresh: RefreshSignal,
    window: PaginationWindow,
    archive: Arc<dyn Archive>,
    events: Arc<dyn RemoteEventSource>,
    /// Held until the conversation has an id to subscribe with
    observer: Option<SyncObserver>,
    typing: watch::Receiver<bool>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ChatSession {
    /// Open a conversation. With `id` set, history comes from the archive
    /// when it is current, otherwise from the store. Without an id the
    /// conversation is created on the first send.
    pub async fn open(
        services: SessionServices,
        participants: Participants,
        id: Option<ConversationId>,
        languages: LanguagePreferences,
        config: &EngineConfig,
    ) -> DeliveryResult<Self> {
        let conversation = match &id {
            Some(id) => Self::restore(&services, participants, id).await?,
            None => Conversation::new(participants),
        };

        let cancel = CancellationToken::new();
        let (handle, actor) =
            ConversationActor::spawn(conversation, config.command_buffer, cancel.child_token());
        let refresh = RefreshSignal::new();

        let mut delivery = DeliveryPipeline::new(
            handle.clone(),
            services.gateway.clone(),
            services.store.clone(),
            services.archive.clone(),
            refresh.clone(),
            languages,
        )
        .with_timeout(config.send_timeout())
        .with_cancellation(cancel.child_token());
        if let Some(audio) = &services.audio {
            let dir = config.audio_dir.clone().unwrap_or_else(std::env::temp_dir);
            delivery = delivery.with_audio(audio.clone(), dir);
        }
        if let Some(push) = &services.push {
            delivery = delivery.with_push(push.clone());
        }

        let retry = RetryPipeline::new(
            handle.clone(),
            services.gateway.clone(),
            services.store.clone(),
            services.archive.clone(),
            refresh.clone(),
        )
        .with_bridge_language(&config.bridge_language);

        let observer = SyncObserver::new(
            handle.clone(),
            services.store.clone(),
            services.archive.clone(),
            refresh.clone(),
        );
        let typing = observer.typing();

        let mut session = Self {
            conversation: handle,
            delivery,
            retry,
            refresh,
            window: PaginationWindow::new(config.page_size, config.pagination_cooldown()),
            archive: services.archive,
            events: services.events,
            observer: Some(observer),
            typing,
            cancel,
            tasks: vec![actor],
        };
        session.start_observer().await?;
        Ok(session)
    }

    /// The store is authoritative: archived history is checked against it
    /// and anything that arrived while the screen was closed is merged in.
    /// The missed-notification flag is cleared only once that succeeded.
    async fn restore(
        services: &SessionServices,
        participants: Participants,
        id: &ConversationId,
    ) -> DeliveryResult<Conversation> {
        let archived = match services.archive.load(id).await {
            Ok(archived) => archived,
            Err(err) => {
                warn!(conversation_id = %id, "archive unreadable, using store: {err}");
                None
            }
        };
        let history = match services.store.messages(id).await {
            Ok(history) => history,
            Err(err) => match archived {
                Some(archived) => {
                    warn!(conversation_id = %id, "store unreachable, showing archived copy: {err}");
                    return Ok(archived);
                }
                None => return Err(DeliveryError::StoreLookup(err)),
            },
        };

        let (conversation, archived_ok) = match archived {
            Some(archived) if archived.hash() == compute_hash(&history) => {
                debug!(conversation_id = %id, "archive matches store");
                (archived, true)
            }
            Some(mut archived) => {
                if archived.merge_history(history) {
                    info!(conversation_id = %id, "merged store history into archived copy");
                }
                let written = Self::rewrite_archive(services, &archived).await;
                (archived, written)
            }
            None => {
                let conversation =
                    Conversation::with_messages(Some(id.clone()), participants, history);
                let written = Self::rewrite_archive(services, &conversation).await;
                (conversation, written)
            }
        };

        if archived_ok {
            if let Err(err) = services.archive.clear_missed_notification(id).await {
                warn!(conversation_id = %id, "could not clear missed notification: {err}");
            }
        }
        Ok(conversation)
    }

    async fn rewrite_archive(services: &SessionServices, conversation: &Conversation) -> bool {
        match services.archive.add_to_archive(conversation).await {
            Ok(()) => true,
            Err(err) => {
                warn!(conversation_id = ?conversation.id(), "failed to archive restored conversation: {err}");
                false
            }
        }
    }

    /// Subscribe to remote events once the conversation has an id
    async fn start_observer(&mut self) -> DeliveryResult<()> {
        let Some(id) = self.conversation.snapshot().id().cloned() else {
            return Ok(());
        };
        let Some(observer) = self.observer.take() else {
            return Ok(());
        };
        let subscription = self.events.subscribe(&id, self.cancel.child_token()).await?;
        self.tasks.push(observer.spawn(subscription));
        info!(conversation_id = %id, "session subscribed to remote events");
        Ok(())
    }

    pub async fn send(&mut self, composition: Composition) -> DeliveryResult<Message> {
        let message = self.delivery.send(composition).await?;
        if self.observer.is_some() {
            if let Err(err) = self.start_observer().await {
                warn!("could not subscribe after first send: {err}");
            }
        }
        Ok(message)
    }

    pub async fn retry(&self, id: &MessageId) -> DeliveryResult<Translation> {
        self.retry.retranslate(id).await
    }

    /// Flip a message between its original and translated text
    pub async fn toggle_alternate(&self, id: &MessageId) -> DeliveryResult<bool> {
        let showing = self.conversation.toggle_alternate(id).await?;
        self.refresh.signal(RefreshRequest::Row(id.clone()));
        Ok(showing)
    }

    pub fn snapshot(&self) -> Arc<Conversation> {
        self.conversation.snapshot()
    }

    pub fn entries(&self) -> Vec<ConversationEntry> {
        self.conversation.snapshot().entries()
    }

    pub fn conversation(&self) -> &ConversationHandle {
        &self.conversation
    }

    pub fn refresh(&self) -> &RefreshSignal {
        &self.refresh
    }

    pub fn typing(&self) -> watch::Receiver<bool> {
        self.typing.clone()
    }

    pub fn progress(&self) -> watch::Receiver<f32> {
        self.delivery.progress()
    }

    pub fn load_older(&mut self, trigger: LoadTrigger) -> Vec<Message> {
        let snapshot = self.conversation.snapshot();
        self.window.sync(snapshot.messages());
        self.window.load_older(snapshot.messages(), trigger)
    }

    pub fn visible(&mut self) -> &[Message] {
        let snapshot = self.conversation.snapshot();
        self.window.sync(snapshot.messages());
        self.window.visible()
    }

    pub async fn missed_notifications(&self) -> DeliveryResult<Vec<ConversationId>> {
        Ok(self.archive.missed_notifications().await?)
    }

    /// Stop every task of this session and wait for them to finish
    pub async fn close(mut self) {
        self.cancel.cancel();
        for task in std::mem::take(&mut self.tasks) {
            if let Err(err) = task.await {
                warn!("session task ended abnormally: {err}");
            }
        }
        debug!("session closed");
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
