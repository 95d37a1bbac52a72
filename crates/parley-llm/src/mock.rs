use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;

use parley_core::backend::{BackendEvent, BackendStream, ModelBackend, TokenUsage};
use parley_core::context::TurnPackage;
use parley_core::errors::UpstreamError;

/// Pre-programmed responses for deterministic testing without API calls.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Yield a sequence of events.
    Events(Vec<BackendEvent>),
    /// Yield events with a pause before each one.
    Paced(Duration, Vec<BackendEvent>),
    /// Fail the `invoke()` call itself.
    Error(UpstreamError),
    /// Wait a duration, then resolve the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    /// One chunk per piece, then `Complete`.
    pub fn chunks(pieces: &[&str]) -> Self {
        let mut events: Vec<BackendEvent> = pieces
            .iter()
            .map(|p| BackendEvent::Chunk { text: p.to_string() })
            .collect();
        events.push(BackendEvent::Complete {
            usage: Some(TokenUsage {
                input_tokens: 10,
                output_tokens: pieces.len() as u32,
            }),
        });
        Self::Events(events)
    }

    pub fn text(text: &str) -> Self {
        Self::chunks(&[text])
    }

    /// `Complete` with no chunks at all.
    pub fn empty() -> Self {
        Self::Events(vec![BackendEvent::Complete { usage: None }])
    }

    /// Some chunks, then a terminal error.
    pub fn fail_after(pieces: &[&str], error: UpstreamError) -> Self {
        let mut events: Vec<BackendEvent> = pieces
            .iter()
            .map(|p| BackendEvent::Chunk { text: p.to_string() })
            .collect();
        events.push(BackendEvent::Error { error });
        Self::Events(events)
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Backend that returns pre-programmed responses in call order.
pub struct MockBackend {
    responses: Vec<MockResponse>,
    call_count: AtomicUsize,
    seen: Mutex<Vec<TurnPackage>>,
}

impl MockBackend {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses,
            call_count: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Turn packages received so far, in call order.
    pub fn packages(&self) -> Vec<TurnPackage> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl ModelBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn invoke(&self, package: &TurnPackage) -> Result<BackendStream, UpstreamError> {
        self.seen.lock().push(package.clone());
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        let Some(response) = self.responses.get(idx) else {
            return Err(UpstreamError::InvalidRequest(format!(
                "MockBackend: no response configured for call {idx}"
            )));
        };
        resolve_response(response).await
    }
}

/// Unrolls nested delays iteratively to avoid recursive async.
async fn resolve_response(response: &MockResponse) -> Result<BackendStream, UpstreamError> {
    let mut current = response;
    loop {
        match current {
            MockResponse::Events(events) => return Ok(Box::pin(stream::iter(events.clone()))),
            MockResponse::Paced(pause, events) => {
                let pause = *pause;
                let paced = stream::iter(events.clone()).then(move |event| async move {
                    tokio::time::sleep(pause).await;
                    event
                });
                return Ok(Box::pin(paced));
            }
            MockResponse::Error(e) => return Err(e.clone()),
            MockResponse::Delay(duration, inner) => {
                tokio::time::sleep(*duration).await;
                current = inner;
            }
        }
    }
}
