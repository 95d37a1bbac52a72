use chrono::{DateTime, Utc};
use parley_core::backend::{BackendEvent, TokenUsage};
use parley_core::context::TurnPackage;
use parley_core::errors::{GatewayError, UpstreamError};
use parley_core::events::{
    ChunkPayload, CompletePayload, CompletionMetadata, ErrorPayload, ServerEvent, TypingPayload,
};
use parley_core::ids::{ConversationId, MessageId, RunId};
use parley_core::messages::{MessageStatus, TurnMessage};

use crate::reconcile::ephemeral::{StreamingState, StreamingStatus};

const PREVIEW_CHARS: usize = 200;

/// Used when the configured fallback text is blank.
pub const BUILTIN_FALLBACK: &str = "I don't have a response for that.";
/// Used when the configured failure text is blank.
pub const BUILTIN_FAILURE: &str = "Sorry, something went wrong. Please try again.";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunPhase {
    Pending,
    Streaming,
    Completed,
    Errored,
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Errored)
    }
}

#[derive(Clone, Debug)]
pub struct RunConfig {
    /// Checkpoint streaming state every N chunks.
    pub checkpoint_every: u32,
    /// Content used when a run completes without producing any text.
    pub fallback_content: String,
    /// Content of the replacement message shown when a run fails.
    pub failure_content: String,
}

impl RunConfig {
    /// Replace blank texts with the built-in ones so a turn never ends empty.
    fn normalized(mut self) -> Self {
        if self.fallback_content.trim().is_empty() {
            self.fallback_content = BUILTIN_FALLBACK.to_string();
        }
        if self.failure_content.trim().is_empty() {
            self.failure_content = BUILTIN_FAILURE.to_string();
        }
        self
    }
}

/// Side effects requested by the controller, executed by the driver in order.
#[derive(Clone, Debug)]
pub enum RunOutput {
    Emit(ServerEvent),
    Checkpoint(StreamingState),
    /// The canonical assistant message to make durable.
    Finalize(TurnMessage),
    /// Streamed text that must not become durable. Diagnostic logs only.
    DiscardPartial { partial_len: usize, preview: String },
}

/// Drives one assistant turn: `Pending -> Streaming -> Completed | Errored`.
///
/// Pure: it consumes backend events and returns the outputs to perform, with
/// timestamps supplied by the caller. It never performs IO.
pub struct RunController {
    run_id: RunId,
    placeholder: TurnMessage,
    config: RunConfig,
    phase: RunPhase,
    buffer: String,
    chunk_count: u32,
    started_at: Option<DateTime<Utc>>,
    last_update: DateTime<Utc>,
}

impl RunController {
    pub fn new(package: &TurnPackage, config: RunConfig) -> Self {
        let run_id = RunId::new();
        let placeholder =
            TurnMessage::streaming_placeholder(MessageId::new(), package.conversation_id.clone(), run_id.clone());
        Self {
            run_id,
            placeholder,
            config: config.normalized(),
            phase: RunPhase::Pending,
            buffer: String::new(),
            chunk_count: 0,
            started_at: None,
            last_update: Utc::now(),
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn message_id(&self) -> &MessageId {
        &self.placeholder.id
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.placeholder.conversation_id
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    pub fn content(&self) -> &str {
        &self.buffer
    }

    fn state(&self, status: StreamingStatus) -> StreamingState {
        StreamingState {
            run_id: self.run_id.clone(),
            message_id: self.placeholder.id.clone(),
            conversation_id: self.placeholder.conversation_id.clone(),
            chunk_count: self.chunk_count,
            cumulative_length: self.buffer.len(),
            last_update: self.last_update,
            status,
        }
    }

    fn typing(&self, is_typing: bool) -> RunOutput {
        RunOutput::Emit(ServerEvent::Typing(TypingPayload {
            conversation_id: Some(self.placeholder.conversation_id.clone()),
            thread_id: None,
            user_id: None,
            is_assistant: true,
            is_typing,
        }))
    }

    fn chunk_event(&self, text: String, index: u32, at: DateTime<Utc>) -> RunOutput {
        RunOutput::Emit(ServerEvent::MessageChunk(ChunkPayload {
            message_id: self.placeholder.id.clone(),
            run_id: self.run_id.clone(),
            conversation_id: self.placeholder.conversation_id.clone(),
            chunk: text,
            chunk_index: index,
            cumulative_length: self.buffer.len(),
            timestamp: at.to_rfc3339(),
        }))
    }

    fn elapsed_ms(&self, at: DateTime<Utc>) -> u64 {
        self.started_at
            .map(|s| (at - s).num_milliseconds().max(0) as u64)
            .unwrap_or(0)
    }

    /// Enter `Streaming`: placeholder, typing indicator and a first checkpoint.
    /// A no-op unless the run is still pending.
    pub fn start(&mut self, at: DateTime<Utc>) -> Vec<RunOutput> {
        if self.phase != RunPhase::Pending {
            return Vec::new();
        }
        self.phase = RunPhase::Streaming;
        self.started_at = Some(at);
        self.last_update = at;
        vec![
            RunOutput::Emit(ServerEvent::MessageNew(self.placeholder.clone())),
            self.typing(true),
            RunOutput::Checkpoint(self.state(StreamingStatus::Streaming)),
        ]
    }

    /// Feed one backend event. Events after a terminal state are ignored.
    pub fn apply(&mut self, event: BackendEvent, at: DateTime<Utc>) -> Vec<RunOutput> {
        if self.phase.is_terminal() {
            return Vec::new();
        }
        let mut outputs = self.start(at);
        match event {
            BackendEvent::Chunk { text } => outputs.extend(self.on_chunk(text, at)),
            BackendEvent::Complete { usage } => outputs.extend(self.on_complete(usage, at)),
            BackendEvent::Error { error } => outputs.extend(self.on_error(error, at)),
        }
        outputs
    }

    fn on_chunk(&mut self, text: String, at: DateTime<Utc>) -> Vec<RunOutput> {
        if text.is_empty() {
            return Vec::new();
        }
        self.buffer.push_str(&text);
        let index = self.chunk_count;
        self.chunk_count += 1;
        self.last_update = at;

        let mut outputs = vec![self.chunk_event(text, index, at)];
        if self.config.checkpoint_every > 0 && self.chunk_count % self.config.checkpoint_every == 0 {
            outputs.push(RunOutput::Checkpoint(self.state(StreamingStatus::Streaming)));
        }
        outputs
    }

    fn on_complete(&mut self, usage: Option<TokenUsage>, at: DateTime<Utc>) -> Vec<RunOutput> {
        let mut outputs = Vec::new();
        let fallback = self.buffer.trim().is_empty();
        if fallback {
            self.buffer = self.config.fallback_content.clone();
            let index = self.chunk_count;
            self.chunk_count += 1;
            outputs.push(self.chunk_event(self.buffer.clone(), index, at));
        }
        self.phase = RunPhase::Completed;
        self.last_update = at;

        outputs.push(RunOutput::Checkpoint(self.state(StreamingStatus::Completed)));
        outputs.push(RunOutput::Finalize(
            self.placeholder.finalized(self.buffer.clone(), MessageStatus::Sent),
        ));
        outputs.push(RunOutput::Emit(ServerEvent::MessageComplete(CompletePayload {
            message_id: self.placeholder.id.clone(),
            run_id: self.run_id.clone(),
            conversation_id: self.placeholder.conversation_id.clone(),
            metadata: CompletionMetadata {
                chunk_count: self.chunk_count,
                duration_ms: self.elapsed_ms(at),
                fallback,
                usage,
            },
        })));
        outputs.push(self.typing(false));
        outputs
    }

    fn on_error(&mut self, error: UpstreamError, at: DateTime<Utc>) -> Vec<RunOutput> {
        let mut outputs = Vec::new();
        self.phase = RunPhase::Errored;
        self.last_update = at;

        if !self.buffer.is_empty() {
            outputs.push(RunOutput::DiscardPartial {
                partial_len: self.buffer.len(),
                preview: self.buffer.chars().take(PREVIEW_CHARS).collect(),
            });
        }
        outputs.push(RunOutput::Checkpoint(self.state(StreamingStatus::Errored)));

        let replacement = self
            .placeholder
            .finalized(self.config.failure_content.clone(), MessageStatus::Error);
        outputs.push(RunOutput::Finalize(replacement.clone()));

        let gateway = GatewayError::from(error);
        outputs.push(RunOutput::Emit(ServerEvent::MessageError(ErrorPayload {
            message_id: Some(self.placeholder.id.clone()),
            run_id: Some(self.run_id.clone()),
            conversation_id: Some(self.placeholder.conversation_id.clone()),
            code: gateway.code().to_string(),
            message: gateway.user_message(),
        })));
        outputs.push(RunOutput::Emit(ServerEvent::MessageNew(replacement)));
        outputs.push(self.typing(false));
        outputs
    }
}
