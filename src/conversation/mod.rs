//! Conversation aggregate and the task that owns it.
pub mod actor;
pub mod state;

pub use actor::{ConversationActor, ConversationHandle};
pub use state::{Conversation, PendingToken, compute_hash};
