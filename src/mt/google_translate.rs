//! Google Translate API provider for machine translation
//!
//! This module integrates with Google Translate API v2 to provide real
//! translation and language detection for chat messages.
//!
//! # Authentication
//!
//! The provider loads the API key from the `GOOGLE_TRANSLATE_API_KEY`
//! environment variable. Obtain a key from:
//! https://console.cloud.google.com/
//!
//! # Models
//!
//! The v2 API serves two engines: `nmt` (neural, the default) and `base`
//! (phrase-based). The conversation engine uses `nmt` as its primary provider
//! and `base` as the secondary fallback when the neural model hands a message
//! back untranslated.

use crate::mt::error::{MtError, MtResult};
use crate::mt::translator::{MachineTranslator, normalize_locale, validate_locale};
use async_trait::async_trait;
use serde_json::json;

/// Google Translate API v2 provider
#[derive(Clone)]
pub struct GoogleTranslateProvider {
    /// API key for authentication
    api_key: String,
    /// HTTP client for async requests
    client: reqwest::Client,
    /// Base URL for Google Translate API
    base_url: String,
    /// Translation model (`nmt` or `base`); `None` lets the API choose
    model: Option<String>,
    /// Name reported through `provider_name`
    name: String,
}

impl GoogleTranslateProvider {
    /// Maximum characters per string (30KB per Google Translate API limits)
    const MAX_CHARS_PER_STRING: usize = 30_000;

    /// Create a new GoogleTranslateProvider with an explicit API key
    ///
    /// # Returns
    ///
    /// * `Ok(Self)` - New provider instance
    /// * `Err(MtError)` - If API key is empty or HTTP client creation fails
    pub fn new(api_key: String) -> MtResult<Self> {
        if api_key.trim().is_empty() {
            return Err(MtError::ConfigError("API key cannot be empty".to_string()));
        }

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| MtError::NetworkError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            api_key,
            client,
            base_url: "https://translation.googleapis.com/language/translate/v2".to_string(),
            model: None,
            name: "Google Translate".to_string(),
        })
    }

    /// Create a GoogleTranslateProvider from the `GOOGLE_TRANSLATE_API_KEY` environment variable
    pub fn from_env() -> MtResult<Self> {
        let api_key = std::env::var("GOOGLE_TRANSLATE_API_KEY").map_err(|_| {
            MtError::ConfigError(
                "GOOGLE_TRANSLATE_API_KEY environment variable not set".to_string(),
            )
        })?;

        Self::new(api_key)
    }

    /// Pin the translation model used for every request
    pub fn with_model(mut self, model: &str) -> Self {
        self.name = format!("Google Translate ({})", model);
        self.model = Some(model.to_string());
        self
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> MtResult<serde_json::Value> {
        let url = format!("{}{}?key={}", self.base_url, path, self.api_key);
        let response = self.client.post(&url).json(&body).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());

            return Err(if status.is_client_error() {
                MtError::ConfigError(format!("API client error ({}): {}", status, error_text))
            } else {
                MtError::TranslationError(format!("API server error ({}): {}", status, error_text))
            });
        }

        response.json().await.map_err(|e| {
            MtError::TranslationError(format!("Failed to parse API response: {}", e))
        })
    }

    fn translate_body(&self, text: &str, source_locale: &str, target_locale: &str) -> serde_json::Value {
        let mut body = json!({
            "q": [text],
            "source": normalize_locale(source_locale),
            "target": normalize_locale(target_locale),
            "format": "text"
        });
        if let Some(model) = &self.model {
            body["model"] = json!(model);
        }
        body
    }

    fn parse_translation(json: &serde_json::Value) -> MtResult<String> {
        json["data"]["translations"][0]["translatedText"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| {
                MtError::TranslationError(
                    "Invalid API response: missing 'data.translations[0].translatedText'"
                        .to_string(),
                )
            })
    }

    fn parse_detection(json: &serde_json::Value) -> MtResult<String> {
        json["data"]["detections"][0][0]["language"]
            .as_str()
            .filter(|lang| !lang.is_empty() && *lang != "und")
            .map(normalize_locale)
            .ok_or_else(|| {
                MtError::DetectionError("API could not determine the language".to_string())
            })
    }
}

impl std::fmt::Debug for GoogleTranslateProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoogleTranslateProvider")
            .field("api_key", &"***")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

#[async_trait]
impl MachineTranslator for GoogleTranslateProvider {
    async fn translate(
        &self,
        text: &str,
        source_locale: &str,
        target_locale: &str,
    ) -> MtResult<String> {
        validate_locale(source_locale)?;
        validate_locale(target_locale)?;

        if text.is_empty() {
            return Ok(String::new());
        }

        if text.len() > Self::MAX_CHARS_PER_STRING {
            return Err(MtError::TranslationError(format!(
                "Text exceeds maximum length of {} characters",
                Self::MAX_CHARS_PER_STRING
            )));
        }

        let body = self.translate_body(text, source_locale, target_locale);
        let json = self.post("", body).await?;
        Self::parse_translation(&json)
    }

    async fn detect_language(&self, text: &str) -> MtResult<String> {
        if text.trim().is_empty() {
            return Err(MtError::DetectionError("Cannot detect language of empty text".to_string()));
        }
        let json = self.post("/detect", json!({ "q": text })).await?;
        Self::parse_detection(&json)
    }

    fn provider_name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_with_empty_key() {
        match GoogleTranslateProvider::new("   ".to_string()) {
            Err(MtError::ConfigError(msg)) => assert!(msg.contains("empty")),
            _ => panic!("Expected ConfigError"),
        }
    }

    #[test]
    fn test_with_model_sets_name_and_body() {
        let provider = GoogleTranslateProvider::new("test-key".to_string())
            .unwrap()
            .with_model("base");
        assert_eq!(provider.provider_name(), "Google Translate (base)");

        let body = provider.translate_body("Hola", "es-MX", "en");
        assert_eq!(body["model"], "base");
        assert_eq!(body["source"], "es");
        assert_eq!(body["q"][0], "Hola");
    }

    #[test]
    fn test_parse_translation() {
        let json = json!({"data": {"translations": [{"translatedText": "Hello"}]}});
        assert_eq!(GoogleTranslateProvider::parse_translation(&json).unwrap(), "Hello");

        let broken = json!({"data": {}});
        assert!(GoogleTranslateProvider::parse_translation(&broken).is_err());
    }

    #[test]
    fn test_parse_detection() {
        let json = json!({"data": {"detections": [[{"language": "es-419", "confidence": 0.9}]]}});
        assert_eq!(GoogleTranslateProvider::parse_detection(&json).unwrap(), "es");

        let undetermined = json!({"data": {"detections": [[{"language": "und"}]]}});
        assert!(matches!(
            GoogleTranslateProvider::parse_detection(&undetermined),
            Err(MtError::DetectionError(_))
        ));
    }

    #[tokio::test]
    async fn test_translate_empty_text() {
        let provider = GoogleTranslateProvider::new("test-key".to_string()).unwrap();
        assert_eq!(provider.translate("", "en", "fr").await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_translate_invalid_locale() {
        let provider = GoogleTranslateProvider::new("test-key".to_string()).unwrap();
        assert!(provider.translate("hello", "invalid@code", "fr").await.is_err());
    }

    #[tokio::test]
    async fn test_detect_empty_text() {
        let provider = GoogleTranslateProvider::new("test-key".to_string()).unwrap();
        assert!(matches!(
            provider.detect_language("  ").await,
            Err(MtError::DetectionError(_))
        ));
    }

    #[test]
    fn test_debug_output_masks_key() {
        let provider = GoogleTranslateProvider::new("test-key".to_string()).unwrap();
        let debug_str = format!("{:?}", provider);
        assert!(debug_str.contains("***"));
        assert!(!debug_str.contains("test-key"));
    }

    #[tokio::test]
    #[ignore] // Run with: cargo test --ignored
    async fn test_real_api_round_trip() {
        if std::env::var("GOOGLE_TRANSLATE_API_KEY").is_err() {
            eprintln!("Skipping: GOOGLE_TRANSLATE_API_KEY not set");
            return;
        }

        let provider = GoogleTranslateProvider::from_env().unwrap();
        let result = provider.translate("Hola", "es", "en").await.unwrap();
        println!("Translation: Hola → {}", result);
        assert!(!result.is_empty());
        assert_eq!(provider.detect_language(&result).await.unwrap(), "en");
    }
}
