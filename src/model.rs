//! Core data types shared by every part of the conversation engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }
    };
}

string_id!(
    /// Identity of a chat participant
    UserId
);
string_id!(
    /// Store-assigned identifier of a confirmed message
    MessageId
);
string_id!(
    /// Store-assigned identifier of a conversation
    ConversationId
);

/// Source and target language of a translation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LanguagePair {
    pub from: String,
    pub to: String,
}

impl LanguagePair {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

impl fmt::Display for LanguagePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}→{}", self.from, self.to)
    }
}

/// The text a user typed and what the translation gateway made of it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Translation {
    pub input: String,
    pub output: String,
    pub language_pair: LanguagePair,
}

impl Translation {
    pub fn new(input: impl Into<String>, output: impl Into<String>, language_pair: LanguagePair) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            language_pair,
        }
    }

    /// A translation whose output equals its input was never translated.
    /// This is the trigger for the retry pipeline.
    pub fn is_untranslated(&self) -> bool {
        self.input == self.output
    }
}

/// Spoken rendition of a message's translated text, stored as a local file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioRef {
    pub path: PathBuf,
    pub language: String,
}

/// A message the store has confirmed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub identifier: MessageId,
    pub from_user: UserId,
    pub sent_date: DateTime<Utc>,
    pub read_date: Option<DateTime<Utc>>,
    pub translation: Translation,
    /// View toggle between input and output; not part of the content
    #[serde(default)]
    pub is_displaying_alternate: bool,
    pub audio_component: Option<AudioRef>,
}

impl Message {
    pub fn language_pair(&self) -> &LanguagePair {
        &self.translation.language_pair
    }
}

/// Unconfirmed message shown while a send is in flight
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMessage {
    pub from_user: UserId,
    pub sent_date: DateTime<Utc>,
    /// `output` stays empty until the send is confirmed
    pub translation: Translation,
}

/// One row of the conversation as the presentation layer sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationEntry {
    Pending(PendingMessage),
    Confirmed(Message),
}

impl ConversationEntry {
    pub fn identifier(&self) -> Option<&MessageId> {
        match self {
            ConversationEntry::Pending(_) => None,
            ConversationEntry::Confirmed(message) => Some(&message.identifier),
        }
    }

    pub fn sent_date(&self) -> DateTime<Utc> {
        match self {
            ConversationEntry::Pending(pending) => pending.sent_date,
            ConversationEntry::Confirmed(message) => message.sent_date,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, ConversationEntry::Pending(_))
    }
}

/// The two people in a conversation, seen from this device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participants {
    pub local: UserId,
    pub remote: UserId,
}

impl Participants {
    /// Returns `None` when both sides are the same user
    pub fn new(local: UserId, remote: UserId) -> Option<Self> {
        (local != remote).then_some(Self { local, remote })
    }

    pub fn contains(&self, user: &UserId) -> bool {
        &self.local == user || &self.remote == user
    }
}

/// Language preferences used to build the pair for outgoing messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguagePreferences {
    pub local: String,
    pub remote: String,
}

impl LanguagePreferences {
    /// Pair for a message written by the local user to the remote one
    pub fn outgoing(&self) -> LanguagePair {
        LanguagePair::new(&self.local, &self.remote)
    }
}
