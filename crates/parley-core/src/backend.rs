use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::context::TurnPackage;
use crate::errors::UpstreamError;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Events a model backend produces for one run. `Complete` and `Error` are
/// terminal; anything after them is ignored by the run controller.
#[derive(Clone, Debug)]
pub enum BackendEvent {
    Chunk { text: String },
    Complete { usage: Option<TokenUsage> },
    Error { error: UpstreamError },
}

impl BackendEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }
}

pub type BackendStream = Pin<Box<dyn Stream<Item = BackendEvent> + Send>>;

/// A model backend that turns an assembled turn into a stream of events.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(&self, package: &TurnPackage) -> Result<BackendStream, UpstreamError>;
}
