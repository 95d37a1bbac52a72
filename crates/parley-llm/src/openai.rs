use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::instrument;

use parley_core::backend::{BackendEvent, BackendStream, ModelBackend};
use parley_core::context::TurnPackage;
use parley_core::errors::UpstreamError;
use parley_core::messages::{Role, TurnMessage};

use crate::sse::{self, ChatChunkParser};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Streaming client for OpenAI-compatible `/chat/completions` endpoints.
pub struct OpenAiBackend {
    client: Client,
    base_url: String,
    api_key: SecretString,
    idle_timeout: Duration,
}

impl OpenAiBackend {
    pub fn new(base_url: &str, api_key: SecretString, idle_timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            idle_timeout,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

/// Request body for one turn.
pub fn request_body(package: &TurnPackage) -> Value {
    let mut messages = Vec::new();
    if let Some(prompt) = package.system_prompt.as_deref().filter(|p| !p.is_empty()) {
        messages.push(json!({ "role": "system", "content": prompt }));
    }
    for message in &package.messages {
        messages.push(json!({
            "role": message.role.as_str(),
            "content": render_content(message),
        }));
    }

    let mut body = json!({
        "model": package.model,
        "messages": messages,
        "stream": true,
        "stream_options": { "include_usage": true },
    });

    if !package.tools.is_empty() {
        let tools: Vec<Value> = package
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters_schema,
                    }
                })
            })
            .collect();
        body["tools"] = Value::Array(tools);
    }
    body
}

fn render_content(message: &TurnMessage) -> String {
    if message.attachments.is_empty() || message.role != Role::User {
        return message.content.clone();
    }
    let mut out = message.content.clone();
    for attachment in &message.attachments {
        out.push_str(&format!("\n\n<attachment source=\"{}\">\n{}\n</attachment>", attachment.source, attachment.content));
    }
    out
}

#[async_trait]
impl ModelBackend for OpenAiBackend {
    fn name(&self) -> &str {
        "openai"
    }

    #[instrument(skip(self, package), fields(model = %package.model, conversation_id = %package.conversation_id))]
    async fn invoke(&self, package: &TurnPackage) -> Result<BackendStream, UpstreamError> {
        let resp = self
            .client
            .post(self.endpoint())
            .bearer_auth(self.api_key.expose_secret())
            .json(&request_body(package))
            .send()
            .await
            .map_err(|e| UpstreamError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(UpstreamError::from_status(status, body));
        }

        Ok(Box::pin(SseStream::with_idle_timeout(resp.bytes_stream(), self.idle_timeout)))
    }
}

/// Wraps a byte stream and yields backend events. If no data arrives within
/// `idle_duration` the stream yields a terminal error.
struct SseStream {
    inner: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
    parser: ChatChunkParser,
    buffer: String,
    pending: Vec<BackendEvent>,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
    done: bool,
}

impl SseStream {
    fn with_idle_timeout(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            parser: ChatChunkParser::new(),
            buffer: String::new(),
            pending: Vec::new(),
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
            done: false,
        }
    }

    fn drain_frames(&mut self, final_flush: bool) {
        while let Some(pos) = self.buffer.find("\n\n") {
            let chunk: String = self.buffer.drain(..pos + 2).collect();
            for frame in sse::parse_sse_lines(&chunk) {
                let events = self.parser.parse_frame(&frame);
                self.pending.extend(events);
            }
        }
        if final_flush && !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            for frame in sse::parse_sse_lines(&rest) {
                let events = self.parser.parse_frame(&frame);
                self.pending.extend(events);
            }
        }
    }

    fn next_pending(&mut self) -> Option<BackendEvent> {
        if self.pending.is_empty() {
            return None;
        }
        let event = self.pending.remove(0);
        if event.is_terminal() {
            self.done = true;
            self.pending.clear();
        }
        Some(event)
    }
}

impl Stream for SseStream {
    type Item = BackendEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(event) = self.next_pending() {
            return Poll::Ready(Some(event));
        }
        if self.done {
            return Poll::Ready(None);
        }

        loop {
            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    let deadline = tokio::time::Instant::now() + self.idle_duration;
                    self.idle_deadline.as_mut().reset(deadline);

                    let text = String::from_utf8_lossy(&bytes);
                    self.buffer.push_str(&text);
                    self.drain_frames(false);

                    if let Some(event) = self.next_pending() {
                        return Poll::Ready(Some(event));
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    self.done = true;
                    return Poll::Ready(Some(BackendEvent::Error {
                        error: UpstreamError::StreamInterrupted(e.to_string()),
                    }));
                }
                Poll::Ready(None) => {
                    self.drain_frames(true);
                    if let Some(event) = self.next_pending() {
                        return Poll::Ready(Some(event));
                    }
                    self.done = true;
                    return Poll::Ready(None);
                }
                Poll::Pending => {
                    if self.idle_deadline.as_mut().poll(cx).is_ready() {
                        self.done = true;
                        return Poll::Ready(Some(BackendEvent::Error {
                            error: UpstreamError::Timeout(self.idle_duration),
                        }));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use parley_core::context::BudgetStats;
    use parley_core::ids::{ConversationId, MessageId, UserId};
    use parley_core::messages::Attachment;
    use parley_core::tools::ToolDefinition;

    fn package() -> TurnPackage {
        let conv = ConversationId::from_raw("conv_1");
        let mut user = TurnMessage::user(MessageId::from_raw("m1"), conv.clone(), UserId::from_raw("u1"), "read this");
        user.attachments.push(Attachment {
            source: "file:a.txt".into(),
            content: "alpha".into(),
            truncated: false,
        });
        TurnPackage {
            conversation_id: conv,
            turn_id: MessageId::from_raw("m1"),
            agent_id: None,
            model: "gpt-4o-mini".into(),
            system_prompt: Some("be brief".into()),
            messages: vec![user],
            tools: vec![ToolDefinition {
                name: "search".into(),
                description: "web search".into(),
                parameters_schema: json!({"type": "object"}),
            }],
            budget: BudgetStats::default(),
            annotations: Vec::new(),
        }
    }

    #[test]
    fn body_includes_system_attachments_and_tools() {
        let body = request_body(&package());
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "system");
        let user = body["messages"][1]["content"].as_str().unwrap();
        assert!(user.contains("read this"));
        assert!(user.contains("alpha"));
        assert_eq!(body["tools"][0]["function"]["name"], "search");
    }

    #[test]
    fn empty_system_prompt_is_omitted() {
        let mut p = package();
        p.system_prompt = Some(String::new());
        let body = request_body(&p);
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[tokio::test]
    async fn stream_parses_split_frames() {
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<bytes::Bytes, reqwest::Error>>(8);
        let mut stream = Box::pin(SseStream::with_idle_timeout(
            tokio_stream::wrappers::ReceiverStream::new(rx),
            Duration::from_secs(5),
        ));

        tx.send(Ok(bytes::Bytes::from("data: {\"choices\":[{\"delta\":{\"con"))).await.unwrap();
        tx.send(Ok(bytes::Bytes::from("tent\":\"Hel\"}}]}\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n")))
            .await
            .unwrap();
        tx.send(Ok(bytes::Bytes::from("data: [DONE]\n\n"))).await.unwrap();
        drop(tx);

        let events: Vec<BackendEvent> = stream.by_ref().collect().await;
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], BackendEvent::Chunk { text } if text == "Hel"));
        assert!(matches!(&events[1], BackendEvent::Chunk { text } if text == "lo"));
        assert!(matches!(&events[2], BackendEvent::Complete { .. }));
    }

    #[tokio::test]
    async fn idle_timeout_yields_terminal_error() {
        tokio::time::pause();
        let byte_stream = futures::stream::pending::<Result<bytes::Bytes, reqwest::Error>>();
        let mut stream = Box::pin(SseStream::with_idle_timeout(byte_stream, Duration::from_secs(5)));

        tokio::time::advance(Duration::from_secs(6)).await;

        let event = stream.next().await;
        assert!(
            matches!(&event, Some(BackendEvent::Error { error: UpstreamError::Timeout(_) })),
            "expected idle timeout, got: {event:?}"
        );
        assert!(stream.next().await.is_none());
    }
}
