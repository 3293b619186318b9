//! Translation gateway
//!
//! Chat messages are translated from the sender's language into the
//! recipient's before they are stored. This module provides:
//!
//! 1. **MT Trait & Providers** - `MachineTranslator` with a Google Translate
//!    implementation and a deterministic mock
//! 2. **Gateway** - routes a request to the primary or secondary provider
pub mod error;
pub mod gateway;
pub mod google_translate;
pub mod mock;
pub mod translator;

pub use error::{MtError, MtResult};
pub use gateway::{Provider, TranslationGateway};
pub use google_translate::GoogleTranslateProvider;
pub use mock::{MockMode, MockTranslator};
pub use translator::{MachineTranslator, normalize_locale, same_language, validate_locale};
