use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use parley_core::backend::{BackendEvent, BackendStream, ModelBackend, TokenUsage};
use parley_core::context::TurnPackage;
use parley_core::errors::UpstreamError;

/// Offline backend that streams the user's message back word by word.
pub struct EchoBackend {
    pace: Duration,
}

impl EchoBackend {
    pub fn new(pace: Duration) -> Self {
        Self { pace }
    }
}

impl Default for EchoBackend {
    fn default() -> Self {
        Self::new(Duration::from_millis(20))
    }
}

/// Split `text` into word-sized pieces that concatenate back to `text`.
pub fn word_pieces(text: &str) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if ch.is_whitespace() {
            pieces.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

#[async_trait]
impl ModelBackend for EchoBackend {
    fn name(&self) -> &str {
        "echo"
    }

    async fn invoke(&self, package: &TurnPackage) -> Result<BackendStream, UpstreamError> {
        let prompt = package
            .current_message()
            .map(|m| m.content.clone())
            .ok_or_else(|| UpstreamError::InvalidRequest("turn has no user message".into()))?;

        let reply = format!("You said: {prompt}");
        let pieces = word_pieces(&reply);
        let usage = TokenUsage {
            input_tokens: package.budget.estimated_after as u32,
            output_tokens: pieces.len() as u32,
        };
        let pace = self.pace;

        let chunks = stream::iter(pieces).then(move |text| async move {
            tokio::time::sleep(pace).await;
            BackendEvent::Chunk { text }
        });
        let done = stream::once(async move { BackendEvent::Complete { usage: Some(usage) } });
        Ok(Box::pin(chunks.chain(done)))
    }
}
