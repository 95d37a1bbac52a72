//! Turn ingress: connects `send-message` to the engine.
//!
//! A send is deduplicated by its client-supplied id, assembled, made durable
//! (user half), announced, and then handed to a background run. The run is
//! not tied to the sending connection; a disconnect leaves it running.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parley_core::errors::{GatewayError, NotFoundKind, ProtocolViolation};
use parley_core::events::{Delivery, OutboundEvent, ServerEvent, Topic};
use parley_core::ids::{ClientId, ConversationId, MessageId, RunId};
use parley_core::messages::{Conversation, TurnMessage};
use parley_core::store::{ConversationStore, MessageStore};
use parley_engine::{AssembleRequest, ContextAssembler, EventBus, RunDriver, StateReconciler};
use serde::Serialize;
use tokio_util::task::TaskTracker;

use crate::auth::Identity;
use crate::client::ConnectionRegistry;
use crate::ledger::{Reservation, TurnLedger};
use crate::protocol::SendMessageParams;
use crate::server::GatewayServices;

const TITLE_CHARS: usize = 60;

/// Acknowledgement data for an accepted (or already accepted) send.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Accepted {
    pub message_id: MessageId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<TurnMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub duplicate: bool,
}

/// A run in flight.
#[derive(Clone, Debug)]
pub struct ActiveRun {
    pub conversation_id: ConversationId,
    pub turn_id: MessageId,
    pub client_id: ClientId,
    pub started_at: Instant,
}

#[async_trait]
pub trait TurnOrchestrator: Send + Sync {
    async fn submit(
        &self,
        client_id: &ClientId,
        identity: &Identity,
        params: SendMessageParams,
    ) -> Result<Accepted, GatewayError>;

    fn active_runs(&self) -> usize;

    /// Wait for in-flight runs to finish, up to `timeout`. Returns false if
    /// some were still running.
    async fn drain(&self, timeout: Duration) -> bool;
}

/// Production orchestrator backed by the engine crate.
pub struct EngineOrchestrator {
    assembler: Arc<ContextAssembler>,
    driver: Arc<RunDriver>,
    reconciler: Arc<StateReconciler>,
    conversations: Arc<dyn ConversationStore>,
    messages: Arc<dyn MessageStore>,
    bus: EventBus,
    registry: Arc<ConnectionRegistry>,
    ledger: Arc<TurnLedger>,
    active_runs: Arc<DashMap<RunId, ActiveRun>>,
    tracker: TaskTracker,
}

impl EngineOrchestrator {
    pub fn new(services: &GatewayServices, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            assembler: Arc::clone(&services.assembler),
            driver: Arc::clone(&services.driver),
            reconciler: Arc::clone(&services.reconciler),
            conversations: Arc::clone(&services.conversations),
            messages: Arc::clone(&services.messages),
            bus: services.bus.clone(),
            registry,
            ledger: Arc::new(TurnLedger::new()),
            active_runs: Arc::new(DashMap::new()),
            tracker: TaskTracker::new(),
        }
    }

    pub fn ledger(&self) -> &Arc<TurnLedger> {
        &self.ledger
    }

    pub fn active_for(&self, conversation_id: &ConversationId) -> Vec<RunId> {
        self.active_runs
            .iter()
            .filter(|r| r.conversation_id == *conversation_id)
            .map(|r| r.key().clone())
            .collect()
    }

    async fn accept(
        &self,
        client_id: &ClientId,
        identity: &Identity,
        params: SendMessageParams,
    ) -> Result<Accepted, GatewayError> {
        // Turns accepted before a restart are only known to the durable store.
        // Message ids are unique store-wide, so another user's row is a conflict.
        if let Some(existing) = self.messages.find(&params.id).await.map_err(persistence)? {
            let same_sender = existing.user_id.as_ref() == Some(&identity.user_id);
            if !same_sender || existing.content != params.content {
                return Err(ProtocolViolation::DuplicateTurn {
                    turn_id: params.id.to_string(),
                }
                .into());
            }
            self.ledger.release(&identity.user_id, &params.id);
            return Ok(Accepted {
                message_id: params.id,
                conversation_id: Some(existing.conversation_id.clone()),
                message: Some(existing),
                run_id: None,
                duplicate: true,
            });
        }

        let (conversation_id, new_conversation) = match params.conversation_id {
            Some(id) => match self.conversations.get(&id).await.map_err(persistence)? {
                Some(conversation) if conversation.owner == identity.user_id => (id, None),
                Some(_) => return Err(GatewayError::Forbidden(format!("conversation {id} belongs to another user"))),
                None => return Err(GatewayError::not_found(NotFoundKind::Conversation, id.as_str())),
            },
            None => {
                let mut conversation = Conversation::new(identity.user_id.clone());
                conversation.title = Some(title_from(&params.content));
                (conversation.id.clone(), Some(conversation))
            }
        };

        let turn = TurnMessage::user(
            params.id.clone(),
            conversation_id.clone(),
            identity.user_id.clone(),
            params.content,
        );
        turn.validate().map_err(|e| GatewayError::Validation(e.to_string()))?;

        let assembled = self
            .assembler
            .assemble(AssembleRequest {
                turn,
                agent_id: params.agent_id,
                model: params.model,
                system_prompt: None,
            })
            .await
            .map_err(GatewayError::from)?;

        if let Some(conversation) = &new_conversation {
            self.conversations.create(conversation).await.map_err(persistence)?;
            tracing::info!(conversation_id = %conversation.id, "conversation created");
        }

        if let Err(e) = self.reconciler.ensure_seeded(&conversation_id).await {
            tracing::warn!(conversation_id = %conversation_id, error = %e, "could not seed thread state");
        }
        let user_message = assembled.user_message;
        if let Err(e) = self.reconciler.persist_user_message(&user_message).await {
            if let Some(conversation) = &new_conversation {
                self.reconciler.forget_thread(&conversation.id);
                match self.conversations.discard_empty(&conversation.id).await {
                    Ok(_) => tracing::info!(conversation_id = %conversation.id, "discarded unused conversation"),
                    Err(cleanup) => {
                        tracing::warn!(conversation_id = %conversation.id, error = %cleanup, "could not discard unused conversation")
                    }
                }
            }
            return Err(persistence(e));
        }
        self.reconciler.observe(&user_message);

        let mut topics = vec![Topic::Conversation(conversation_id.clone())];
        if let Some(thread_id) = params.thread_id.filter(|t| !t.trim().is_empty()) {
            topics.push(Topic::Thread(thread_id));
        }
        for topic in &topics {
            self.registry.join(client_id, topic.clone());
        }
        self.bus.publish(OutboundEvent {
            delivery: Delivery::Topics {
                topics: topics.clone(),
                except: Some(client_id.clone()),
            },
            event: ServerEvent::MessageNew(user_message.clone()),
        });

        let package = assembled.package;
        let controller = self.driver.prepare(&package);
        let run_id = controller.run_id().clone();
        self.ledger
            .accept(&identity.user_id, &params.id, user_message.clone(), run_id.clone());
        self.active_runs.insert(
            run_id.clone(),
            ActiveRun {
                conversation_id: conversation_id.clone(),
                turn_id: params.id.clone(),
                client_id: client_id.clone(),
                started_at: Instant::now(),
            },
        );

        let driver = Arc::clone(&self.driver);
        let active_runs = Arc::clone(&self.active_runs);
        let ledger = Arc::clone(&self.ledger);
        let sender = identity.user_id.clone();
        let turn_id = params.id.clone();
        self.tracker.spawn(async move {
            let summary = driver.drive(controller, package, topics).await;
            if let Some((_, run)) = active_runs.remove(&summary.run_id) {
                tracing::debug!(
                    run_id = %summary.run_id,
                    elapsed_ms = u64::try_from(run.started_at.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "run released"
                );
            }
            ledger.finish(&sender, &turn_id);
        });

        tracing::info!(
            client_id = %client_id,
            user_id = %identity.user_id,
            conversation_id = %conversation_id,
            message_id = %params.id,
            run_id = %run_id,
            "turn accepted"
        );
        Ok(Accepted {
            message_id: params.id,
            conversation_id: Some(conversation_id),
            message: Some(user_message),
            run_id: Some(run_id),
            duplicate: false,
        })
    }
}

#[async_trait]
impl TurnOrchestrator for EngineOrchestrator {
    async fn submit(
        &self,
        client_id: &ClientId,
        identity: &Identity,
        params: SendMessageParams,
    ) -> Result<Accepted, GatewayError> {
        if params.id.as_str().trim().is_empty() {
            return Err(GatewayError::Validation("message id is required".into()));
        }
        if params.content.trim().is_empty() {
            return Err(GatewayError::Validation("message content is empty".into()));
        }

        match self.ledger.reserve(&identity.user_id, &params.id, &params.content) {
            Reservation::Fresh => {}
            Reservation::Duplicate(entry) => {
                tracing::info!(message_id = %params.id, "duplicate send ignored");
                return Ok(Accepted {
                    message_id: params.id,
                    conversation_id: entry.accepted.as_ref().map(|m| m.conversation_id.clone()),
                    message: entry.accepted,
                    run_id: entry.run_id,
                    duplicate: true,
                });
            }
            Reservation::Conflict => {
                return Err(ProtocolViolation::DuplicateTurn {
                    turn_id: params.id.to_string(),
                }
                .into());
            }
        }

        let turn_id = params.id.clone();
        let result = self.accept(client_id, identity, params).await;
        if let Err(e) = &result {
            self.ledger.release(&identity.user_id, &turn_id);
            tracing::info!(message_id = %turn_id, code = e.code(), error = %e, "turn rejected");
        }
        result
    }

    fn active_runs(&self) -> usize {
        self.active_runs.len()
    }

    async fn drain(&self, timeout: Duration) -> bool {
        self.tracker.close();
        let drained = tokio::time::timeout(timeout, self.tracker.wait()).await.is_ok();
        self.tracker.reopen();
        if !drained {
            tracing::warn!(remaining = self.active_runs.len(), "runs still active after drain timeout");
        }
        drained
    }
}

fn persistence(e: impl std::fmt::Display) -> GatewayError {
    GatewayError::Persistence(e.to_string())
}

/// First line of the message, cut to a title-sized prefix.
fn title_from(content: &str) -> String {
    let line = content.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or_default();
    let mut title: String = line.chars().take(TITLE_CHARS).collect();
    if line.chars().count() > TITLE_CHARS {
        title.push('…');
    }
    title
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{identity, Fixture};
    use parley_core::agents::AgentConfig;
    use parley_core::errors::UpstreamError;
    use parley_core::ids::UserId;
    use parley_core::messages::{MessageStatus, Role};
    use parley_llm::mock::MockResponse;

    fn send(id: &str, content: &str) -> SendMessageParams {
        SendMessageParams {
            id: MessageId::from_raw(id),
            content: content.into(),
            conversation_id: None,
            thread_id: None,
            agent_id: None,
            model: None,
        }
    }

    #[test]
    fn titles_use_first_line() {
        assert_eq!(title_from("\n  Plan the trip \nmore"), "Plan the trip");
        let long = "a".repeat(80);
        assert_eq!(title_from(&long).chars().count(), TITLE_CHARS + 1);
    }

    #[tokio::test]
    async fn accepted_turn_runs_and_persists() {
        let fx = Fixture::new(vec![MockResponse::chunks(&["Hi", " there"])]);
        let orch = fx.orchestrator();
        let client = fx.connect("u1");

        let accepted = orch.submit(&client, &identity("u1"), send("m1", "Hello")).await.unwrap();
        assert!(!accepted.duplicate);
        assert!(accepted.run_id.is_some());
        let conv = accepted.conversation_id.clone().unwrap();
        assert!(fx
            .registry
            .topics(&client)
            .contains(&Topic::Conversation(conv.clone())));

        assert!(orch.drain(Duration::from_secs(5)).await);
        assert_eq!(orch.active_runs(), 0);

        let history = fx.history(&conv).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].role, Role::Assistant);
        assert_eq!(history[1].content, "Hi there");
        assert_eq!(history[1].status, MessageStatus::Sent);

        let created = fx.store.conversations.find(&conv).unwrap().unwrap();
        assert_eq!(created.title.as_deref(), Some("Hello"));
    }

    #[tokio::test]
    async fn duplicate_send_starts_one_run() {
        let fx = Fixture::new(vec![MockResponse::text("once"), MockResponse::text("twice")]);
        let orch = fx.orchestrator();
        let client = fx.connect("u1");

        let first = orch.submit(&client, &identity("u1"), send("m1", "Hello")).await.unwrap();
        let second = orch.submit(&client, &identity("u1"), send("m1", "Hello")).await.unwrap();
        assert!(second.duplicate);
        assert_eq!(second.run_id, first.run_id);

        assert!(orch.drain(Duration::from_secs(5)).await);
        assert_eq!(fx.backend.call_count(), 1);
        assert_eq!(fx.history(&first.conversation_id.unwrap()).await.len(), 2);
    }

    #[tokio::test]
    async fn reused_id_with_new_content_is_rejected() {
        let fx = Fixture::new(vec![MockResponse::text("ok")]);
        let orch = fx.orchestrator();
        let client = fx.connect("u1");

        orch.submit(&client, &identity("u1"), send("m1", "Hello")).await.unwrap();
        let err = orch.submit(&client, &identity("u1"), send("m1", "Goodbye")).await.unwrap_err();
        assert_eq!(err.code(), "DUPLICATE_TURN");
        orch.drain(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn durable_duplicate_is_recognised_after_ledger_prune() {
        let fx = Fixture::new(vec![MockResponse::text("ok")]);
        let orch = fx.orchestrator();
        let client = fx.connect("u1");

        orch.submit(&client, &identity("u1"), send("m1", "Hello")).await.unwrap();
        assert!(orch.drain(Duration::from_secs(5)).await);
        assert_eq!(orch.ledger().prune(Duration::ZERO), 1);

        let again = orch.submit(&client, &identity("u1"), send("m1", "Hello")).await.unwrap();
        assert!(again.duplicate);
        assert!(again.run_id.is_none());
        assert_eq!(fx.backend.call_count(), 1);
    }

    #[tokio::test]
    async fn missing_agent_creates_nothing() {
        let fx = Fixture::new(vec![MockResponse::text("unused")]);
        let orch = fx.orchestrator();
        let client = fx.connect("u1");

        let mut params = send("m1", "Hello");
        params.agent_id = Some("missing-agent".parse().unwrap());
        let err = orch.submit(&client, &identity("u1"), params).await.unwrap_err();
        assert_eq!(err.code(), "AGENT_NOT_FOUND");

        assert_eq!(orch.active_runs(), 0);
        assert_eq!(fx.backend.call_count(), 0);
        assert!(fx.store.messages.get(&MessageId::from_raw("m1")).unwrap().is_none());
        assert!(matches!(
            orch.ledger().reserve(&UserId::from_raw("u1"), &MessageId::from_raw("m1"), "Hello"),
            Reservation::Fresh
        ));
    }

    #[tokio::test]
    async fn known_agent_overrides_model() {
        let mut agent = AgentConfig::new("helper");
        agent.model = Some("agent-model".into());
        let fx = Fixture::with_agents(vec![MockResponse::text("ok")], vec![agent]);
        let orch = fx.orchestrator();
        let client = fx.connect("u1");

        let mut params = send("m1", "Hello");
        params.agent_id = Some("helper".parse().unwrap());
        orch.submit(&client, &identity("u1"), params).await.unwrap();
        assert!(orch.drain(Duration::from_secs(5)).await);
        assert_eq!(fx.backend.packages()[0].model, "agent-model");
    }

    #[tokio::test]
    async fn unknown_conversation_is_not_found() {
        let fx = Fixture::new(Vec::new());
        let orch = fx.orchestrator();
        let client = fx.connect("u1");

        let mut params = send("m1", "Hello");
        params.conversation_id = Some(ConversationId::from_raw("nope"));
        let err = orch.submit(&client, &identity("u1"), params).await.unwrap_err();
        assert_eq!(err.code(), "CONVERSATION_NOT_FOUND");
    }

    #[tokio::test]
    async fn cannot_post_into_another_users_conversation() {
        let fx = Fixture::new(vec![MockResponse::text("for alice"), MockResponse::text("unused")]);
        let orch = fx.orchestrator();
        let alice = fx.connect("alice");
        let bob = fx.connect("bob");

        let accepted = orch.submit(&alice, &identity("alice"), send("a1", "my plan")).await.unwrap();
        let conv = accepted.conversation_id.unwrap();
        assert!(orch.drain(Duration::from_secs(5)).await);

        let mut params = send("b1", "what did alice say?");
        params.conversation_id = Some(conv.clone());
        let err = orch.submit(&bob, &identity("bob"), params).await.unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN");

        assert!(!fx.registry.topics(&bob).contains(&Topic::Conversation(conv.clone())));
        assert_eq!(fx.backend.call_count(), 1);
        assert_eq!(fx.history(&conv).await.len(), 2);
    }

    #[tokio::test]
    async fn message_id_of_another_user_is_a_conflict() {
        let fx = Fixture::new(vec![MockResponse::text("ok"), MockResponse::text("unused")]);
        let orch = fx.orchestrator();
        let alice = fx.connect("alice");
        let bob = fx.connect("bob");

        orch.submit(&alice, &identity("alice"), send("m1", "Hello")).await.unwrap();
        let err = orch.submit(&bob, &identity("bob"), send("m1", "Hello")).await.unwrap_err();
        assert_eq!(err.code(), "DUPLICATE_TURN");
        assert!(!err.user_message().contains("conv_"));

        assert!(orch.drain(Duration::from_secs(5)).await);
        assert_eq!(fx.backend.call_count(), 1);
        assert_eq!(fx.store.conversations.count_for_owner(&UserId::from_raw("bob")).unwrap(), 0);
    }

    struct RejectingAppends(parley_store::MessageRepo);

    #[async_trait]
    impl MessageStore for RejectingAppends {
        async fn append(&self, _message: &TurnMessage) -> Result<(), parley_core::store::PersistenceFailure> {
            Err(parley_core::store::PersistenceFailure::new("disk full"))
        }

        async fn list(
            &self,
            conversation_id: &ConversationId,
            limit: usize,
        ) -> Result<Vec<TurnMessage>, parley_core::store::PersistenceFailure> {
            MessageStore::list(&self.0, conversation_id, limit).await
        }

        async fn count(&self, conversation_id: &ConversationId) -> Result<usize, parley_core::store::PersistenceFailure> {
            MessageStore::count(&self.0, conversation_id).await
        }

        async fn find(&self, message_id: &MessageId) -> Result<Option<TurnMessage>, parley_core::store::PersistenceFailure> {
            MessageStore::find(&self.0, message_id).await
        }
    }

    #[tokio::test]
    async fn failed_user_write_leaves_no_conversation() {
        let fx = Fixture::new(vec![MockResponse::text("unused")]);
        let mut services = fx.services.clone();
        services.reconciler = Arc::new(
            parley_engine::StateReconciler::new(
                Arc::new(RejectingAppends(fx.store.messages.clone())),
                Arc::new(parley_engine::reconcile::ephemeral::InMemoryEphemeralStore::new()),
            )
            .with_retry_delay(Duration::from_millis(1)),
        );
        let orch = EngineOrchestrator::new(&services, Arc::clone(&fx.registry));
        let client = fx.connect("u1");

        let err = orch.submit(&client, &identity("u1"), send("m1", "Hello")).await.unwrap_err();
        assert_eq!(err.code(), "PERSISTENCE_ERROR");
        assert_eq!(fx.store.conversations.count_for_owner(&UserId::from_raw("u1")).unwrap(), 0);
        assert_eq!(fx.backend.call_count(), 0);
        assert_eq!(orch.active_runs(), 0);
    }

    #[tokio::test]
    async fn blank_content_is_invalid() {
        let fx = Fixture::new(Vec::new());
        let orch = fx.orchestrator();
        let err = orch
            .submit(&fx.connect("u1"), &identity("u1"), send("m1", "   "))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn failed_run_keeps_user_message_and_replacement() {
        let fx = Fixture::new(vec![MockResponse::fail_after(
            &["par", "tial", "!"],
            UpstreamError::ServerError {
                status: 500,
                body: "boom".into(),
            },
        )]);
        let orch = fx.orchestrator();
        let client = fx.connect("u1");

        let accepted = orch.submit(&client, &identity("u1"), send("m1", "Hello")).await.unwrap();
        assert!(orch.drain(Duration::from_secs(5)).await);

        let history = fx.history(&accepted.conversation_id.unwrap()).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "Hello");
        assert_eq!(history[1].status, MessageStatus::Error);
        assert!(!history[1].content.contains("partial"));
    }

    #[tokio::test]
    async fn run_survives_sender_disconnect() {
        let fx = Fixture::new(vec![MockResponse::Paced(
            Duration::from_millis(5),
            vec![
                parley_core::backend::BackendEvent::Chunk { text: "late".into() },
                parley_core::backend::BackendEvent::Complete { usage: None },
            ],
        )]);
        let orch = fx.orchestrator();
        let client = fx.connect("u1");

        let accepted = orch.submit(&client, &identity("u1"), send("m1", "Hello")).await.unwrap();
        fx.registry.unregister(&client, "closed");
        assert!(orch.drain(Duration::from_secs(5)).await);

        let history = fx.history(&accepted.conversation_id.unwrap()).await;
        assert_eq!(history[1].content, "late");
    }
}
