pub mod echo;
pub mod mock;
pub mod openai;
pub mod sse;

pub use echo::EchoBackend;
pub use mock::{MockBackend, MockResponse};
pub use openai::OpenAiBackend;

use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;

use parley_core::backend::ModelBackend;
use parley_settings::{BackendKind, DefaultsSettings};

#[derive(Debug, thiserror::Error)]
pub enum BackendConfigError {
    #[error("backend api key env var {0} is not set")]
    MissingApiKey(String),
    #[error("failed to build http client: {0}")]
    Http(#[from] reqwest::Error),
}

/// Build the configured model backend.
pub fn backend_from_settings(defaults: &DefaultsSettings) -> Result<Arc<dyn ModelBackend>, BackendConfigError> {
    match defaults.backend {
        BackendKind::Echo => Ok(Arc::new(EchoBackend::default())),
        BackendKind::Openai => {
            let key = std::env::var(&defaults.backend_api_key_env)
                .ok()
                .filter(|k| !k.is_empty())
                .ok_or_else(|| BackendConfigError::MissingApiKey(defaults.backend_api_key_env.clone()))?;
            let backend = OpenAiBackend::new(
                &defaults.backend_base_url,
                SecretString::from(key),
                Duration::from_secs(defaults.backend_idle_timeout_secs),
            )?;
            Ok(Arc::new(backend))
        }
    }
}
