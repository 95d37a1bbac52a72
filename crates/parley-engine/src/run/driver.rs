use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use parley_core::backend::{BackendEvent, ModelBackend};
use parley_core::context::TurnPackage;
use parley_core::errors::UpstreamError;
use parley_core::events::{OutboundEvent, Topic};
use parley_core::ids::{ConversationId, MessageId, RunId};
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};

use super::controller::{RunConfig, RunController, RunOutput, RunPhase};
use crate::bus::EventBus;
use crate::reconcile::StateReconciler;

/// Result of driving one run to a terminal state.
#[derive(Clone, Debug)]
pub struct RunSummary {
    pub run_id: RunId,
    pub message_id: MessageId,
    pub phase: RunPhase,
    pub chunk_count: u32,
    /// Whether the final assistant message (or failure replacement) is durable.
    pub persisted: bool,
}

/// Executes a [`RunController`] against a model backend: publishes its
/// events, checkpoints its state and persists its final message.
pub struct RunDriver {
    backend: Arc<dyn ModelBackend>,
    reconciler: Arc<StateReconciler>,
    bus: EventBus,
    config: RunConfig,
    purge_grace: Duration,
}

impl RunDriver {
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        reconciler: Arc<StateReconciler>,
        bus: EventBus,
        config: RunConfig,
        purge_grace: Duration,
    ) -> Self {
        Self {
            backend,
            reconciler,
            bus,
            config,
            purge_grace,
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Allocate a controller for `package` without starting it, so callers
    /// can learn the run id before the first event is published.
    pub fn prepare(&self, package: &TurnPackage) -> RunController {
        RunController::new(package, self.config.clone())
    }

    /// Drive the run to completion or error. Never fails: every outcome is
    /// reported to clients as events.
    pub async fn drive(&self, mut controller: RunController, package: TurnPackage, topics: Vec<Topic>) -> RunSummary {
        let span = info_span!(
            "run",
            run_id = %controller.run_id(),
            conversation_id = %package.conversation_id,
            backend = self.backend.name(),
        );
        async {
            let mut persisted = false;
            let mut checkpoints = JoinSet::new();
            let outputs = controller.start(Utc::now());
            self.execute(outputs, &topics, &mut persisted, &mut checkpoints).await;

            match self.backend.invoke(&package).await {
                Ok(mut stream) => {
                    while let Some(event) = stream.next().await {
                        let outputs = controller.apply(event, Utc::now());
                        self.execute(outputs, &topics, &mut persisted, &mut checkpoints).await;
                        if controller.is_terminal() {
                            break;
                        }
                    }
                    if !controller.is_terminal() {
                        warn!(chunks = controller.chunk_count(), "backend stream ended without a terminal event");
                        let error = UpstreamError::StreamInterrupted("stream ended early".into());
                        let outputs = controller.apply(BackendEvent::Error { error }, Utc::now());
                        self.execute(outputs, &topics, &mut persisted, &mut checkpoints).await;
                    }
                }
                Err(error) => {
                    warn!(kind = error.kind(), error = %error, "backend invocation failed");
                    let outputs = controller.apply(BackendEvent::Error { error }, Utc::now());
                    self.execute(outputs, &topics, &mut persisted, &mut checkpoints).await;
                }
            }

            info!(
                phase = ?controller.phase(),
                chunks = controller.chunk_count(),
                persisted,
                "run finished"
            );
            RunSummary {
                run_id: controller.run_id().clone(),
                message_id: controller.message_id().clone(),
                phase: controller.phase(),
                chunk_count: controller.chunk_count(),
                persisted,
            }
        }
        .instrument(span)
        .await
    }

    /// Intermediate checkpoints run in the background on `checkpoints`; the
    /// terminal one waits for them so no stale write lands after it.
    async fn execute(
        &self,
        outputs: Vec<RunOutput>,
        topics: &[Topic],
        persisted: &mut bool,
        checkpoints: &mut JoinSet<()>,
    ) {
        for output in outputs {
            match output {
                RunOutput::Emit(event) => {
                    self.bus.publish(OutboundEvent::to_topics(topics.to_vec(), event));
                }
                RunOutput::Checkpoint(state) if state.is_terminal() => {
                    while checkpoints.join_next().await.is_some() {}
                    if let Err(e) = self.reconciler.ephemeral().checkpoint(state).await {
                        warn!(error = %e, "final checkpoint failed");
                    }
                }
                RunOutput::Checkpoint(state) => {
                    let ephemeral = self.reconciler.ephemeral().clone();
                    let chunks = state.chunk_count;
                    checkpoints.spawn(
                        async move {
                            if let Err(e) = ephemeral.checkpoint(state).await {
                                warn!(error = %e, chunks, "checkpoint failed");
                            }
                        }
                        .in_current_span(),
                    );
                }
                RunOutput::Finalize(message) => {
                    self.reconciler.observe(&message);
                    if self.reconciler.persist_assistant(&message).await.is_ok() {
                        *persisted = true;
                        self.schedule_purge(message.run_id.clone(), message.conversation_id.clone());
                    }
                }
                RunOutput::DiscardPartial { partial_len, preview } => {
                    warn!(partial_len, preview = %preview, "discarding partial content from failed run");
                }
            }
        }
    }

    /// Drop streaming state after the grace period, along with the
    /// conversation's live view if nothing touched it meanwhile. Only called
    /// once the durable write has succeeded.
    fn schedule_purge(&self, run_id: Option<RunId>, conversation_id: ConversationId) {
        let Some(run_id) = run_id else { return };
        let reconciler = self.reconciler.clone();
        let grace = self.purge_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if reconciler.ephemeral().purge(&run_id).await {
                debug!(run_id = %run_id, "streaming state purged");
            }
            if reconciler.release_idle_thread(&conversation_id, grace).await {
                debug!(conversation_id = %conversation_id, "thread state released");
            }
        });
    }
}
