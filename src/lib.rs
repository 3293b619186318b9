//! A conversation engine that keeps a translated chat view consistent while
//! local sends, retries and remote events all mutate it at once.
//!
//! Each open conversation is owned by one task ([`ConversationActor`]); the
//! delivery pipeline, the retry pipeline and the remote observer hand their
//! mutations to it as commands. [`ChatSession`] wires these together.

pub mod archive;
pub mod config;
pub mod conversation;
pub mod delivery;
pub mod error;
pub mod model;
pub mod mt;
pub mod observer;
pub mod pagination;
pub mod refresh;
pub mod remote;
pub mod retry;
pub mod session;
pub mod store;

pub use archive::{Archive, JsonFileArchive, MemoryArchive, write_through};
pub use config::{DEFAULT_CONFIG_PATH, EngineConfig, load_config, save_config};
pub use conversation::{Conversation, ConversationActor, ConversationHandle, PendingToken};
pub use delivery::{AudioMode, AudioSynthesizer, Composition, DeliveryPipeline, PushNotifier};
pub use error::{
    ArchiveError, ConversationError, DeliveryError, DeliveryResult, StoreError, StoreResult,
};
pub use model::{
    AudioRef, ConversationEntry, ConversationId, LanguagePair, LanguagePreferences, Message,
    MessageId, Participants, PendingMessage, Translation, UserId,
};
pub use mt::{
    GoogleTranslateProvider, MachineTranslator, MockMode, MockTranslator, MtError, Provider,
    TranslationGateway,
};
pub use observer::{NewMessageOutcome, SyncObserver, TypingEvent};
pub use pagination::{LoadTrigger, PaginationWindow};
pub use refresh::{RefreshRequest, RefreshSignal};
pub use remote::{
    LocalEventHub, RemoteChannel, RemoteEvent, RemoteEventSource, RemoteSubscription, StreamError,
};
pub use retry::{RetryPipeline, RetryStep, StepOutcome, match_case};
pub use session::{ChatSession, SessionServices};
pub use store::{InMemoryStore, MessageStore};
