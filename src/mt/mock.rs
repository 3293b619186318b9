//! Mock Machine Translator for testing
//!
//! This module provides a deterministic, API-free translator for testing
//! the delivery and retry pipelines without requiring API keys or network
//! access.
//!
//! # Example
//!
//! ```ignore
//! use babel_chat::mt::{MachineTranslator, MockTranslator, MockMode};
//!
//! #[tokio::test]
//! async fn test_translation() {
//!     let mock = MockTranslator::new(MockMode::Suffix);
//!     let result = mock.translate("hola", "es", "en").await.unwrap();
//!     assert_eq!(result, "hola_en");
//! }
//! ```

use crate::mt::error::{MtError, MtResult};
use crate::mt::translator::{MachineTranslator, normalize_locale};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Mock translation modes for testing different scenarios
#[derive(Debug, Clone)]
pub enum MockMode {
    /// Append locale suffix: "hola" → "hola_en"
    Suffix,

    /// Use predefined mappings for realistic translations
    /// (text, target_locale) → translation. Unknown keys come back unchanged,
    /// which is how a real provider reports text it could not translate.
    Mappings(HashMap<(String, String), String>),

    /// Simulate API errors
    Error(String),

    /// No-op: return input unchanged
    NoOp,
}

/// Mock translator that simulates various translation scenarios
///
/// Clones share the call counter, so a test can hand a clone to the gateway
/// and keep one to assert how often the provider was consulted.
#[derive(Debug, Clone)]
pub struct MockTranslator {
    mode: MockMode,
    /// Optional simulated network delay (in milliseconds)
    delay_ms: u64,
    /// text → detected language
    detections: HashMap<String, String>,
    name: String,
    calls: Arc<AtomicUsize>,
}

impl MockTranslator {
    /// Create a new MockTranslator with the given mode
    pub fn new(mode: MockMode) -> Self {
        Self {
            mode,
            delay_ms: 0,
            detections: HashMap::new(),
            name: "Mock Translator".to_string(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Create a MockTranslator with simulated network delay
    pub fn with_delay(mode: MockMode, delay_ms: u64) -> Self {
        Self {
            delay_ms,
            ..Self::new(mode)
        }
    }

    /// Convenience constructor for a mapping-mode translator
    pub fn with_mappings<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str, &'a str)>) -> Self {
        let map = pairs
            .into_iter()
            .map(|(text, target, out)| ((text.to_string(), target.to_string()), out.to_string()))
            .collect();
        Self::new(MockMode::Mappings(map))
    }

    /// Register the language `detect_language` reports for `text`
    pub fn detects(mut self, text: &str, language: &str) -> Self {
        self.detections
            .insert(text.to_string(), normalize_locale(language));
        self
    }

    /// Override the reported provider name
    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Number of `translate` calls served so far
    pub fn translate_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn apply_delay(&self) {
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
    }

    fn apply_translation(&self, text: &str, _source: &str, target: &str) -> MtResult<String> {
        match &self.mode {
            MockMode::Suffix => Ok(format!("{}_{}", text, target)),
            MockMode::Mappings(map) => {
                let key = (text.to_string(), target.to_string());
                Ok(map.get(&key).cloned().unwrap_or_else(|| text.to_string()))
            }
            MockMode::Error(msg) => Err(MtError::TranslationError(msg.clone())),
            MockMode::NoOp => Ok(text.to_string()),
        }
    }
}

#[async_trait]
impl MachineTranslator for MockTranslator {
    async fn translate(
        &self,
        text: &str,
        source_locale: &str,
        target_locale: &str,
    ) -> MtResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.apply_delay().await;
        self.apply_translation(text, source_locale, target_locale)
    }

    async fn detect_language(&self, text: &str) -> MtResult<String> {
        self.apply_delay().await;
        self.detections
            .get(text)
            .cloned()
            .ok_or_else(|| MtError::DetectionError(format!("No detection registered for '{}'", text)))
    }

    fn provider_name(&self) -> &str {
        &self.name
    }
}
