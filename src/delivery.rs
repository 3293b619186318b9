//! Optimistic delivery of locally composed messages.
//!
//! A send shows a placeholder immediately, translates the text, optionally
//! renders spoken audio, persists the message and finally swaps the
//! placeholder for the confirmed message. Progress is published in steps of
//! 0.2 on a watch channel:
//!
//! | stage       | progress |
//! |-------------|----------|
//! | placeholder | 0.2      |
//! | translate   | 0.4      |
//! | audio       | 0.6      |
//! | persist     | 0.8      |
//! | finalize    | 1.0      |
//!
//! Translation, audio and persistence run under one timeout. Any failure in
//! that span removes the placeholder and discards a partially written audio
//! file, so a failed send leaves no trace in the conversation.

use crate::archive::{Archive, write_through};
use crate::conversation::{ConversationHandle, PendingToken};
use crate::error::{ConversationError, DeliveryError, DeliveryResult};
use crate::model::{
    AudioRef, ConversationId, LanguagePair, LanguagePreferences, Message, Participants,
    Translation, UserId,
};
use crate::mt::TranslationGateway;
use crate::refresh::{RefreshRequest, RefreshSignal};
use crate::store::MessageStore;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const PROGRESS_STEP: f32 = 0.2;

/// Whether a composition carries spoken audio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioMode {
    #[default]
    None,
    /// Text message with best-effort audio
    Attached,
    /// Audio is the payload; failing to produce it fails the send
    AudioOnly,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Composition {
    pub text: String,
    pub audio: AudioMode,
}

impl Composition {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            audio: AudioMode::None,
        }
    }

    pub fn with_audio(mut self, audio: AudioMode) -> Self {
        self.audio = audio;
        self
    }
}

/// Renders translated text as speech
#[async_trait]
pub trait AudioSynthesizer: Send + Sync {
    /// Write the spoken rendition of `text` to `destination`
    async fn synthesize(
        &self,
        text: &str,
        language: &str,
        destination: &Path,
    ) -> DeliveryResult<AudioRef>;
}

/// Tells the other participant that a message arrived
#[async_trait]
pub trait PushNotifier: Send + Sync {
    async fn notify(&self, recipient: &UserId, message: &Message) -> DeliveryResult<()>;
}

/// Held for the whole of one send; a second send is refused while it lives
struct SendGuard(Arc<AtomicBool>);

impl SendGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(Arc::clone(flag)))
    }
}

impl Drop for SendGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct DeliveryPipeline {
    conversation: ConversationHandle,
    gateway: TranslationGateway,
    store: Arc<dyn MessageStore>,
    archive: Arc<dyn Archive>,
    refresh: RefreshSignal,
    languages: LanguagePreferences,
    audio: Option<Arc<dyn AudioSynthesizer>>,
    push: Option<Arc<dyn PushNotifier>>,
    audio_dir: PathBuf,
    timeout: Duration,
    cancel: CancellationToken,
    progress: watch::Sender<f32>,
    sending: Arc<AtomicBool>,
}

impl DeliveryPipeline {
    pub fn new(
        conversation: ConversationHandle,
        gateway: TranslationGateway,
        store: Arc<dyn MessageStore>,
        archive: Arc<dyn Archive>,
        refresh: RefreshSignal,
        languages: LanguagePreferences,
    ) -> Self {
        let (progress, _) = watch::channel(0.0);
        Self {
            conversation,
            gateway,
            store,
            archive,
            refresh,
            languages,
            audio: None,
            push: None,
            audio_dir: std::env::temp_dir(),
            timeout: Duration::from_secs(30),
            cancel: CancellationToken::new(),
            progress,
            sending: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_audio(mut self, synthesizer: Arc<dyn AudioSynthesizer>, dir: impl Into<PathBuf>) -> Self {
        self.audio = Some(synthesizer);
        self.audio_dir = dir.into();
        self
    }

    pub fn with_push(mut self, notifier: Arc<dyn PushNotifier>) -> Self {
        self.push = Some(notifier);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Stop mutating state once `cancel` fires (e.g. the screen closed)
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Progress of the current send, from 0.0 to 1.0
    pub fn progress(&self) -> watch::Receiver<f32> {
        self.progress.subscribe()
    }

    fn report(&self, stages_done: u8) {
        self.progress
            .send_replace(f32::from(stages_done) * PROGRESS_STEP);
    }

    /// Whether a send is between its placeholder and its outcome
    pub fn is_sending(&self) -> bool {
        self.sending.load(Ordering::Acquire)
    }

    pub async fn send(&self, composition: Composition) -> DeliveryResult<Message> {
        if self.cancel.is_cancelled() {
            return Err(DeliveryError::Cancelled);
        }
        let _guard = SendGuard::acquire(&self.sending)
            .ok_or(DeliveryError::Conversation(ConversationError::PlaceholderExists))?;
        self.report(0);
        if composition.audio == AudioMode::AudioOnly && self.audio.is_none() {
            return Err(DeliveryError::DependencyUnavailable(
                "audio-only send without an audio synthesizer".to_string(),
            ));
        }

        let snapshot = self.conversation.snapshot();
        let participants = snapshot.participants().clone();
        let conversation_id = match snapshot.id() {
            Some(id) => id.clone(),
            None => self.create_conversation(&participants).await?,
        };

        let pair = self.languages.outgoing();
        let token = self
            .conversation
            .append_placeholder(&composition.text, pair.clone(), participants.local.clone())
            .await?;
        self.refresh.signal(RefreshRequest::All);
        self.report(1);

        let audio_path = self.audio_dir.join(format!("{}.mp3", Uuid::new_v4()));
        let delivery = self.deliver(
            &conversation_id,
            &participants.local,
            &composition,
            &pair,
            &audio_path,
        );
        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(DeliveryError::Cancelled),
            result = tokio::time::timeout(self.timeout, delivery) => match result {
                Ok(result) => result,
                Err(_) => Err(DeliveryError::Timeout(self.timeout.as_secs())),
            },
        };

        match outcome {
            Ok(message) => Ok(self.finalize(message, &participants.remote).await),
            Err(err) => {
                warn!(conversation_id = %conversation_id, "send failed: {err}");
                self.rollback(token, &audio_path).await;
                Err(err)
            }
        }
    }

    async fn create_conversation(&self, participants: &Participants) -> DeliveryResult<ConversationId> {
        let id = self
            .store
            .create_conversation(participants)
            .await
            .map_err(DeliveryError::PersistFailed)?;
        self.conversation.assign_id(id.clone()).await?;
        info!(conversation_id = %id, "created conversation for first message");
        Ok(id)
    }

    /// Translate, render audio and persist. Runs under the send timeout.
    async fn deliver(
        &self,
        conversation_id: &ConversationId,
        from_user: &UserId,
        composition: &Composition,
        pair: &LanguagePair,
        audio_path: &Path,
    ) -> DeliveryResult<Message> {
        let translation = self.translate(&composition.text, pair).await?;
        self.report(2);

        let audio = self
            .render_audio(composition.audio, &translation, audio_path)
            .await?;
        self.report(3);

        let message = self
            .store
            .create_message(conversation_id, from_user, translation, audio)
            .await
            .map_err(DeliveryError::PersistFailed)?;
        self.report(4);
        Ok(message)
    }

    /// Serve from the translation cache, or translate and cache the result.
    /// Cache trouble is logged and never fails the send.
    async fn translate(&self, text: &str, pair: &LanguagePair) -> DeliveryResult<Translation> {
        match self.store.cached_translation(text, pair).await {
            Ok(Some(cached)) => {
                debug!(%pair, "translation served from cache");
                return Ok(cached);
            }
            Ok(None) => {}
            Err(err) => warn!(%pair, "translation cache lookup failed: {err}"),
        }

        let output = self
            .gateway
            .translate(text, pair, None)
            .await
            .map_err(DeliveryError::TranslationFailed)?;
        let translation = Translation::new(text, output, pair.clone());
        if let Err(err) = self.store.save_translation(translation.clone()).await {
            warn!(%pair, "failed to cache translation: {err}");
        }
        Ok(translation)
    }

    async fn render_audio(
        &self,
        mode: AudioMode,
        translation: &Translation,
        destination: &Path,
    ) -> DeliveryResult<Option<AudioRef>> {
        if mode == AudioMode::None {
            return Ok(None);
        }
        let Some(synthesizer) = &self.audio else {
            warn!("audio requested but no synthesizer configured; sending text only");
            return Ok(None);
        };
        let language = &translation.language_pair.to;
        match synthesizer
            .synthesize(&translation.output, language, destination)
            .await
        {
            Ok(audio) => Ok(Some(audio)),
            Err(err) if mode == AudioMode::Attached => {
                warn!("audio synthesis failed, sending text only: {err}");
                discard_audio(destination).await;
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn finalize(&self, message: Message, recipient: &UserId) -> Message {
        if self.cancel.is_cancelled() {
            debug!(message_id = %message.identifier, "persisted after cancellation; state left alone");
        } else {
            self.apply_confirmed(&message).await;
        }
        self.report(5);

        if let Some(push) = &self.push {
            if let Err(err) = push.notify(recipient, &message).await {
                warn!(message_id = %message.identifier, "push notification failed: {err}");
            }
        }
        message
    }

    async fn apply_confirmed(&self, message: &Message) {
        match self.conversation.append_or_replace(message.clone()).await {
            Ok(_) => {
                write_through(self.archive.as_ref(), &self.conversation.snapshot()).await;
                self.refresh.signal(RefreshRequest::All);
            }
            Err(ConversationError::Closed) => {
                debug!(message_id = %message.identifier, "conversation closed before finalize");
            }
            Err(err) => warn!(message_id = %message.identifier, "finalize failed: {err}"),
        }
    }

    async fn rollback(&self, token: PendingToken, audio_path: &Path) {
        match self.conversation.remove_placeholder(token).await {
            Ok(true) => self.refresh.signal(RefreshRequest::All),
            Ok(false) => debug!("placeholder already gone"),
            Err(err) => debug!("could not remove placeholder: {err}"),
        }
        discard_audio(audio_path).await;
    }
}

async fn discard_audio(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "discarded partial audio"),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), "failed to discard audio: {err}"),
    }
}
