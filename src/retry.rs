//! Retranslation of messages that came back untranslated.
//!
//! A message whose translation output equals its input was never translated.
//! Retrying walks a small state machine:
//!
//! ```text
//! TryPrimary --unchanged--> TrySecondary --unchanged--> Bridge
//!     |                         |                         |
//!     +------ translated -------+------- translated ------+--> Done
//!     +------ error ------------+------- error / mismatch +--> Failed
//! ```
//!
//! Each transition is a pure function of the step's outcome, see
//! [`RetryStep::transition`]. The bridge translates through an intermediate
//! language (English by default) and checks the detected language of the
//! result; its intermediate cache entries are retracted if it fails.

use crate::archive::{Archive, write_through};
use crate::conversation::ConversationHandle;
use crate::error::{ConversationError, DeliveryError, DeliveryResult};
use crate::model::{LanguagePair, MessageId, Translation};
use crate::mt::{Provider, TranslationGateway, same_language};
use crate::refresh::{RefreshRequest, RefreshSignal};
use crate::store::MessageStore;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Why a retry gave up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryFailure {
    StillUntranslated,
    LanguageMismatch { expected: String, detected: String },
    Provider(String),
}

impl From<RetryFailure> for DeliveryError {
    fn from(failure: RetryFailure) -> Self {
        match failure {
            RetryFailure::StillUntranslated => DeliveryError::RetryStillUntranslated,
            RetryFailure::LanguageMismatch { expected, detected } => {
                DeliveryError::RetryLanguageMismatch { expected, detected }
            }
            RetryFailure::Provider(reason) => DeliveryError::RetryFailed(reason),
        }
    }
}

/// Result of running one step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Translated(String),
    /// The provider handed the text back as it was
    Unchanged,
    Mismatch { expected: String, detected: String },
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryStep {
    TryPrimary,
    TrySecondary,
    Bridge,
    Done(String),
    Failed(RetryFailure),
}

impl RetryStep {
    pub fn transition(self, outcome: StepOutcome) -> RetryStep {
        if self.is_terminal() {
            return self;
        }
        match (self, outcome) {
            (_, StepOutcome::Translated(output)) => RetryStep::Done(output),
            (RetryStep::TryPrimary, StepOutcome::Unchanged) => RetryStep::TrySecondary,
            (RetryStep::TrySecondary, StepOutcome::Unchanged) => RetryStep::Bridge,
            (_, StepOutcome::Unchanged) => RetryStep::Failed(RetryFailure::StillUntranslated),
            (_, StepOutcome::Mismatch { expected, detected }) => {
                RetryStep::Failed(RetryFailure::LanguageMismatch { expected, detected })
            }
            (_, StepOutcome::Error(reason)) => RetryStep::Failed(RetryFailure::Provider(reason)),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RetryStep::Done(_) | RetryStep::Failed(_))
    }
}

/// Give `output` the capitalization style of `input`.
///
/// All-caps input yields all-caps output; otherwise the first letter of the
/// output takes the case of the first letter of the input.
pub fn match_case(output: &str, input: &str) -> String {
    let letters: Vec<char> = input.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.len() > 1 && letters.iter().all(|c| c.is_uppercase()) {
        return output.to_uppercase();
    }
    let Some(first) = letters.first() else {
        return output.to_string();
    };

    let mut matched = String::with_capacity(output.len());
    let mut adjusted = false;
    for c in output.chars() {
        if !adjusted && c.is_alphabetic() {
            adjusted = true;
            if first.is_uppercase() {
                matched.extend(c.to_uppercase());
            } else if first.is_lowercase() {
                matched.extend(c.to_lowercase());
            } else {
                matched.push(c);
            }
        } else {
            matched.push(c);
        }
    }
    matched
}

/// Marks a message as having a retry in flight until dropped
struct InFlightGuard {
    set: Arc<Mutex<HashSet<MessageId>>>,
    id: MessageId,
}

impl InFlightGuard {
    fn acquire(set: &Arc<Mutex<HashSet<MessageId>>>, id: &MessageId) -> Option<Self> {
        let inserted = set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone());
        inserted.then(|| Self {
            set: Arc::clone(set),
            id: id.clone(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

pub struct RetryPipeline {
    conversation: ConversationHandle,
    gateway: TranslationGateway,
    store: Arc<dyn MessageStore>,
    archive: Arc<dyn Archive>,
    refresh: RefreshSignal,
    bridge_language: String,
    in_flight: Arc<Mutex<HashSet<MessageId>>>,
}

impl RetryPipeline {
    pub fn new(
        conversation: ConversationHandle,
        gateway: TranslationGateway,
        store: Arc<dyn MessageStore>,
        archive: Arc<dyn Archive>,
        refresh: RefreshSignal,
    ) -> Self {
        Self {
            conversation,
            gateway,
            store,
            archive,
            refresh,
            bridge_language: "en".to_string(),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn with_bridge_language(mut self, language: impl Into<String>) -> Self {
        self.bridge_language = language.into();
        self
    }

    pub fn is_in_flight(&self, id: &MessageId) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }

    /// Produce a corrected translation for `id` and apply it everywhere.
    ///
    /// A message that is already translated is returned untouched.
    pub async fn retranslate(&self, id: &MessageId) -> DeliveryResult<Translation> {
        let _guard = InFlightGuard::acquire(&self.in_flight, id)
            .ok_or_else(|| DeliveryError::RetryInFlight(id.clone()))?;

        let message = self
            .conversation
            .snapshot()
            .message(id)
            .cloned()
            .ok_or_else(|| ConversationError::MessageNotFound(id.clone()))?;
        let stale = message.translation;
        if !stale.is_untranslated() {
            debug!(message_id = %id, "already translated; nothing to retry");
            return Ok(stale);
        }

        let text = stale.input.as_str();
        let pair = &stale.language_pair;
        self.store
            .remove_translation(text, pair)
            .await
            .map_err(DeliveryError::PersistFailed)?;

        let mut bridged = Vec::new();
        let mut step = RetryStep::TryPrimary;
        let output = loop {
            debug!(message_id = %id, ?step, "retry step");
            step = match step {
                RetryStep::TryPrimary => {
                    let outcome = self.direct(text, pair, Provider::Primary).await;
                    RetryStep::TryPrimary.transition(outcome)
                }
                RetryStep::TrySecondary => {
                    let outcome = self.direct(text, pair, Provider::Secondary).await;
                    RetryStep::TrySecondary.transition(outcome)
                }
                RetryStep::Bridge => {
                    let outcome = self.bridge(text, pair, &mut bridged).await;
                    RetryStep::Bridge.transition(outcome)
                }
                RetryStep::Done(output) => break output,
                RetryStep::Failed(failure) => {
                    warn!(message_id = %id, ?failure, "retry failed");
                    return Err(failure.into());
                }
            };
        };

        let translation = Translation::new(text, output, pair.clone());
        if let Err(err) = self.apply(id, translation.clone()).await {
            warn!(message_id = %id, "could not apply retried translation: {err}");
            self.retract(&bridged).await;
            return Err(err);
        }
        info!(message_id = %id, "retry produced a translation");
        Ok(translation)
    }

    /// Cache last, so a failed update leaves no corrected entry behind
    async fn apply(&self, id: &MessageId, translation: Translation) -> DeliveryResult<()> {
        self.store
            .update_translation(id, translation.clone())
            .await
            .map_err(DeliveryError::PersistFailed)?;
        self.conversation
            .update_translation(id, translation.clone())
            .await?;
        if let Err(err) = self.store.save_translation(translation).await {
            warn!(message_id = %id, "failed to cache retried translation: {err}");
        }
        write_through(self.archive.as_ref(), &self.conversation.snapshot()).await;
        self.refresh.signal(RefreshRequest::Row(id.clone()));
        Ok(())
    }

    async fn direct(&self, text: &str, pair: &LanguagePair, provider: Provider) -> StepOutcome {
        match self.gateway.translate(text, pair, Some(provider)).await {
            Ok(output) if output != text => StepOutcome::Translated(output),
            Ok(_) => StepOutcome::Unchanged,
            Err(err) => StepOutcome::Error(format!("{provider} provider: {err}")),
        }
    }

    async fn bridge(
        &self,
        text: &str,
        pair: &LanguagePair,
        cached: &mut Vec<(String, LanguagePair)>,
    ) -> StepOutcome {
        let outcome = self.bridge_legs(text, pair, cached).await;
        if !matches!(outcome, StepOutcome::Translated(_)) {
            self.retract(cached).await;
            cached.clear();
        }
        outcome
    }

    /// Run one bridge leg, caching its result. Identity legs are skipped.
    async fn leg(
        &self,
        text: &str,
        pair: LanguagePair,
        cached: &mut Vec<(String, LanguagePair)>,
    ) -> Result<String, String> {
        if same_language(&pair.from, &pair.to) {
            return Ok(text.to_string());
        }
        let output = self
            .gateway
            .translate(text, &pair, None)
            .await
            .map_err(|err| format!("bridge leg {pair}: {err}"))?;
        self.store
            .save_translation(Translation::new(text, output.clone(), pair.clone()))
            .await
            .map_err(|err| format!("caching bridge leg {pair}: {err}"))?;
        cached.push((text.to_string(), pair));
        Ok(output)
    }

    async fn bridge_legs(
        &self,
        text: &str,
        pair: &LanguagePair,
        cached: &mut Vec<(String, LanguagePair)>,
    ) -> StepOutcome {
        let bridge = self.bridge_language.as_str();
        let intermediate = match self
            .leg(text, LanguagePair::new(&pair.from, bridge), cached)
            .await
        {
            Ok(output) => output,
            Err(reason) => return StepOutcome::Error(reason),
        };
        let output = match self
            .leg(&intermediate, LanguagePair::new(bridge, &pair.to), cached)
            .await
        {
            Ok(output) => output,
            Err(reason) => return StepOutcome::Error(reason),
        };

        let detected = match self.gateway.detect_language(&output).await {
            Ok(language) => language,
            Err(err) => return StepOutcome::Error(format!("detecting bridge output: {err}")),
        };
        if !same_language(&detected, &pair.to) {
            return StepOutcome::Mismatch {
                expected: pair.to.clone(),
                detected,
            };
        }
        if output == text {
            return StepOutcome::Unchanged;
        }
        StepOutcome::Translated(match_case(&output, text))
    }

    async fn retract(&self, cached: &[(String, LanguagePair)]) {
        for (input, pair) in cached {
            match self.store.remove_translation(input, pair).await {
                Ok(_) => debug!(%pair, "retracted bridge translation"),
                Err(err) => warn!(%pair, "failed to retract bridge translation: {err}"),
            }
        }
    }
}
