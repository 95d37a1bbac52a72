use serde::Deserialize;

use parley_core::backend::{BackendEvent, TokenUsage};
use parley_core::errors::UpstreamError;

/// One server-sent event frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Split raw SSE text into frames. Multiple `data:` lines are joined with `\n`.
pub fn parse_sse_lines(raw: &str) -> Vec<SseFrame> {
    let mut frames = Vec::new();
    let mut event: Option<String> = None;
    let mut data: Vec<&str> = Vec::new();

    for line in raw.lines() {
        if let Some(name) = line.strip_prefix("event:") {
            event = Some(name.trim().to_string());
        } else if let Some(payload) = line.strip_prefix("data:") {
            data.push(payload.strip_prefix(' ').unwrap_or(payload));
        } else if line.is_empty() && (event.is_some() || !data.is_empty()) {
            frames.push(SseFrame {
                event: event.take(),
                data: data.join("\n"),
            });
            data.clear();
        }
    }

    if event.is_some() || !data.is_empty() {
        frames.push(SseFrame {
            event,
            data: data.join("\n"),
        });
    }

    frames
}

/// Turns OpenAI-style chat completion chunks into backend events.
#[derive(Default)]
pub struct ChatChunkParser {
    usage: Option<TokenUsage>,
    finished: bool,
}

impl ChatChunkParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn parse_frame(&mut self, frame: &SseFrame) -> Vec<BackendEvent> {
        if self.finished {
            return Vec::new();
        }
        let data = frame.data.trim();
        if data.is_empty() {
            return Vec::new();
        }
        if data == "[DONE]" {
            self.finished = true;
            return vec![BackendEvent::Complete {
                usage: self.usage.take(),
            }];
        }

        let chunk: ChatChunk = match serde_json::from_str(data) {
            Ok(c) => c,
            Err(e) => {
                tracing::debug!(error = %e, "skipping unparseable stream frame");
                return Vec::new();
            }
        };

        if let Some(err) = chunk.error {
            self.finished = true;
            return vec![BackendEvent::Error {
                error: UpstreamError::StreamInterrupted(err.message.unwrap_or_else(|| "backend error".into())),
            }];
        }

        if let Some(usage) = chunk.usage {
            self.usage = Some(TokenUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            });
        }

        chunk
            .choices
            .into_iter()
            .filter_map(|c| c.delta.and_then(|d| d.content))
            .filter(|text| !text.is_empty())
            .map(|text| BackendEvent::Chunk { text })
            .collect()
    }
}

#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
    #[serde(default)]
    error: Option<ChatError>,
}

#[derive(Deserialize)]
struct ChatChoice {
    #[serde(default)]
    delta: Option<ChatDelta>,
}

#[derive(Deserialize)]
struct ChatDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct ChatError {
    #[serde(default)]
    message: Option<String>,
}
