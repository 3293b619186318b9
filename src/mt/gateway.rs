//! Provider routing for the conversation engine.
//!
//! The gateway owns a primary and a secondary [`MachineTranslator`]. Ordinary
//! sends go through the provider default (primary); the retry pipeline picks
//! a provider explicitly.

use crate::model::LanguagePair;
use crate::mt::error::MtResult;
use crate::mt::translator::MachineTranslator;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Which backend serves a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    Primary,
    Secondary,
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::Primary => f.write_str("primary"),
            Provider::Secondary => f.write_str("secondary"),
        }
    }
}

#[derive(Clone)]
pub struct TranslationGateway {
    primary: Arc<dyn MachineTranslator>,
    secondary: Arc<dyn MachineTranslator>,
}

impl TranslationGateway {
    pub fn new(primary: Arc<dyn MachineTranslator>, secondary: Arc<dyn MachineTranslator>) -> Self {
        Self { primary, secondary }
    }

    fn provider(&self, provider: Provider) -> &dyn MachineTranslator {
        match provider {
            Provider::Primary => self.primary.as_ref(),
            Provider::Secondary => self.secondary.as_ref(),
        }
    }

    /// Translate `text` along `pair`. `None` means provider default.
    pub async fn translate(
        &self,
        text: &str,
        pair: &LanguagePair,
        provider: Option<Provider>,
    ) -> MtResult<String> {
        let backend = self.provider(provider.unwrap_or(Provider::Primary));
        debug!(provider = backend.provider_name(), %pair, "translating");
        backend.translate(text, &pair.from, &pair.to).await
    }

    pub async fn detect_language(&self, text: &str) -> MtResult<String> {
        self.primary.detect_language(text).await
    }
}

impl fmt::Debug for TranslationGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranslationGateway")
            .field("primary", &self.primary.provider_name())
            .field("secondary", &self.secondary.provider_name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mt::mock::{MockMode, MockTranslator};

    #[tokio::test]
    async fn test_default_routes_to_primary() {
        let primary = MockTranslator::new(MockMode::Suffix);
        let secondary = MockTranslator::new(MockMode::NoOp);
        let gateway = TranslationGateway::new(Arc::new(primary.clone()), Arc::new(secondary.clone()));
        let pair = LanguagePair::new("es", "en");

        assert_eq!(gateway.translate("hola", &pair, None).await.unwrap(), "hola_en");
        assert_eq!(
            gateway.translate("hola", &pair, Some(Provider::Secondary)).await.unwrap(),
            "hola"
        );
        assert_eq!(primary.translate_calls(), 1);
        assert_eq!(secondary.translate_calls(), 1);
    }
}
