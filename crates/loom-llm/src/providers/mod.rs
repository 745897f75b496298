//! Concrete provider adapters.

pub mod azure;
pub mod ollama;
pub mod openai;
pub mod threads;

pub use azure::*;
pub use ollama::*;
pub use openai::*;
pub use threads::*;

use crate::provider::ProviderFactory;
use std::sync::Arc;

/// Factories for every built-in provider, in default-preference order.
pub fn default_factories() -> Vec<Arc<dyn ProviderFactory>> {
    vec![
        Arc::new(OpenAiFactory),
        Arc::new(AzureAgentsFactory),
        Arc::new(OllamaFactory),
    ]
}
