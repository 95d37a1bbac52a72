//! Client frame dispatch.
//!
//! Every frame passes through the legacy adapter first, so handlers only see
//! canonical event names and camelCase keys.

use std::sync::Arc;

use parley_core::errors::{GatewayError, NotFoundKind, ProtocolViolation};
use parley_core::events::{ErrorPayload, ServerEvent, Topic, TypingPayload};
use parley_core::ids::{ClientId, ConversationId};
use parley_core::messages::Conversation;
use parley_core::store::{ConversationStore, MessageStore};
use serde_json::{json, Value};

use crate::auth::{Authenticator, Identity};
use crate::client::ConnectionRegistry;
use crate::compat;
use crate::diagnostics::DiagnosticDesk;
use crate::orchestrator::TurnOrchestrator;
use crate::protocol::{
    self, AckFrame, ClientCommand, ClientFrame, DiagnosticCall, HistoryParams, SendMessageParams, TypingParams,
};

const DEFAULT_HISTORY_LIMIT: usize = 100;
const MAX_HISTORY_LIMIT: usize = 1000;

/// Shared state available to all frame handlers.
pub struct HandlerState {
    pub registry: Arc<ConnectionRegistry>,
    pub orchestrator: Arc<dyn TurnOrchestrator>,
    pub diagnostics: DiagnosticDesk,
    pub authenticator: Authenticator,
    pub conversations: Arc<dyn ConversationStore>,
    pub messages: Arc<dyn MessageStore>,
}

/// Handle one raw text frame from `client_id`. Returns the direct reply, if
/// any; broadcasts go out through the registry.
pub async fn handle_frame(state: &Arc<HandlerState>, client_id: &ClientId, raw: &str) -> Option<String> {
    let frame: ClientFrame = match serde_json::from_str(raw) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!(client_id = %client_id, error = %e, "malformed frame");
            let err = GatewayError::from(ProtocolViolation::MalformedFrame(e.to_string()));
            return protocol::encode_error(None, &err);
        }
    };

    let (event, data) = compat::translate(&frame.event, frame.data);
    if event != frame.event {
        tracing::trace!(client_id = %client_id, legacy = %frame.event, canonical = %event, "translated legacy event");
    }

    let result = dispatch(state, client_id, &event, data).await;
    reply(&event, frame.ack_id, result)
}

/// Success data, or `None` for commands with nothing to report.
type Outcome = Result<Option<Value>, GatewayError>;

async fn dispatch(state: &Arc<HandlerState>, client_id: &ClientId, event: &str, data: Value) -> Outcome {
    let command = ClientCommand::decode(event, data)?;

    if let ClientCommand::Auth(params) = &command {
        return match state.authenticator.authenticate(params) {
            Ok(identity) => {
                state.registry.set_identity(client_id, identity.clone());
                Ok(Some(json!({ "clientId": client_id, "identity": identity })))
            }
            Err(rejection) => {
                state.registry.record_auth_rejected(client_id, &rejection.to_string());
                tracing::info!(client_id = %client_id, reason = %rejection, "authentication rejected");
                Err(GatewayError::Unauthenticated)
            }
        };
    }

    let Some(identity) = state.registry.identity(client_id) else {
        return Err(GatewayError::Unauthenticated);
    };

    match command {
        ClientCommand::Auth(_) => Ok(None),
        ClientCommand::SendMessage(params) => send_message(state, client_id, &identity, params).await,
        ClientCommand::Subscribe(topic) => subscribe(state, client_id, &identity, topic).await,
        ClientCommand::Unsubscribe(topic) => {
            let left = state.registry.leave(client_id, &topic);
            Ok(Some(json!({ "topic": topic.to_string(), "left": left })))
        }
        ClientCommand::Typing(params) => typing(state, client_id, &identity, params),
        ClientCommand::History(params) => history(state, &identity, params).await,
        ClientCommand::Diagnostic(call) => diagnostic(state, client_id, &identity, call).await,
    }
}

async fn send_message(
    state: &Arc<HandlerState>,
    client_id: &ClientId,
    identity: &Identity,
    params: SendMessageParams,
) -> Outcome {
    let message_id = params.id.clone();
    let conversation_id = params.conversation_id.clone();

    match state.orchestrator.submit(client_id, identity, params).await {
        Ok(accepted) => Ok(Some(serde_json::to_value(accepted).unwrap_or_default())),
        Err(err) => {
            // The sender sees the failure as a turn event too, not only in the ack.
            let event = ServerEvent::MessageError(ErrorPayload {
                message_id: Some(message_id),
                run_id: None,
                conversation_id,
                code: err.code().to_string(),
                message: err.user_message(),
            });
            state.registry.send_event(client_id, &event);
            Err(err)
        }
    }
}

async fn subscribe(state: &Arc<HandlerState>, client_id: &ClientId, identity: &Identity, topic: Topic) -> Outcome {
    match &topic {
        Topic::DiagnosticLogs if !identity.operator => {
            return Err(GatewayError::Forbidden("diagnostics:logs".into()));
        }
        Topic::Conversation(id) => {
            readable_conversation(state, identity, id).await?;
        }
        _ => {}
    }
    let joined = state.registry.join(client_id, topic.clone());
    tracing::debug!(client_id = %client_id, topic = %topic, joined, "subscribe");
    Ok(Some(json!({ "topic": topic.to_string(), "joined": joined })))
}

fn typing(state: &Arc<HandlerState>, client_id: &ClientId, identity: &Identity, params: TypingParams) -> Outcome {
    let mut topics = Vec::with_capacity(2);
    if let Some(conversation_id) = &params.conversation_id {
        topics.push(Topic::Conversation(conversation_id.clone()));
    }
    if let Some(thread_id) = &params.thread_id {
        topics.push(Topic::Thread(thread_id.clone()));
    }
    if topics.is_empty() {
        return Err(GatewayError::Validation("typing needs a conversationId or threadId".into()));
    }
    // Conversation topics are only joined through an ownership check.
    let joined = state.registry.topics(client_id);
    if let Some(topic) = topics
        .iter()
        .find(|t| matches!(t, Topic::Conversation(_)) && !joined.contains(t))
    {
        return Err(GatewayError::Forbidden(format!("not subscribed to {topic}")));
    }

    let event = ServerEvent::Typing(TypingPayload {
        conversation_id: params.conversation_id,
        thread_id: params.thread_id,
        user_id: Some(identity.user_id.clone()),
        is_assistant: false,
        is_typing: params.is_typing,
    });
    let delivered = protocol::encode_event(&event)
        .map(|frame| state.registry.broadcast(&topics, Some(client_id), &frame))
        .unwrap_or(0);
    Ok(Some(json!({ "delivered": delivered })))
}

/// The conversation, if `identity` owns it or is an operator.
async fn readable_conversation(
    state: &Arc<HandlerState>,
    identity: &Identity,
    id: &ConversationId,
) -> Result<Conversation, GatewayError> {
    let conversation = state
        .conversations
        .get(id)
        .await
        .map_err(|e| GatewayError::Persistence(e.to_string()))?
        .ok_or_else(|| GatewayError::not_found(NotFoundKind::Conversation, id.as_str()))?;
    if conversation.owner != identity.user_id && !identity.operator {
        return Err(GatewayError::Forbidden(format!("conversation {}", conversation.id)));
    }
    Ok(conversation)
}

async fn history(state: &Arc<HandlerState>, identity: &Identity, params: HistoryParams) -> Outcome {
    let conversation = readable_conversation(state, identity, &params.conversation_id).await?;

    let limit = params.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, MAX_HISTORY_LIMIT);
    let messages = state
        .messages
        .list(&conversation.id, limit)
        .await
        .map_err(|e| GatewayError::Persistence(e.to_string()))?;
    Ok(Some(json!({
        "conversationId": conversation.id,
        "title": conversation.title,
        "messages": messages,
    })))
}

async fn diagnostic(
    state: &Arc<HandlerState>,
    client_id: &ClientId,
    identity: &Identity,
    call: DiagnosticCall,
) -> Outcome {
    if !identity.operator {
        tracing::info!(client_id = %client_id, user_id = %identity.user_id, operation = call.operation(), "diagnostic call refused");
        return Err(GatewayError::Forbidden(format!("diagnostic:{}", call.operation())));
    }

    match call {
        DiagnosticCall::SubscribeLogs => {
            let joined = state.registry.join(client_id, Topic::DiagnosticLogs);
            Ok(Some(json!({ "subscribed": true, "joined": joined })))
        }
        DiagnosticCall::UnsubscribeLogs => {
            state.registry.leave(client_id, &Topic::DiagnosticLogs);
            Ok(Some(json!({ "subscribed": false })))
        }
        call => state.diagnostics.run(client_id, call).await.map(Some),
    }
}

/// Frames with an `ackId` always get an ack. Without one, failures become an
/// `error` frame and query results are sent under the request's event name.
fn reply(event: &str, ack_id: Option<Value>, result: Outcome) -> Option<String> {
    match (ack_id, result) {
        (Some(ack_id), Ok(data)) => protocol::encode_ack(&AckFrame::ok(ack_id, data.unwrap_or(Value::Null))),
        (Some(ack_id), Err(err)) => protocol::encode_ack(&AckFrame::err(ack_id, &err)),
        (None, Ok(Some(data))) if is_query(event) => protocol::encode_frame(event, data),
        (None, Ok(_)) => None,
        (None, Err(err)) => protocol::encode_error(Some(event), &err),
    }
}

fn is_query(event: &str) -> bool {
    event == "conversation:history" || event == "auth" || event.starts_with("diagnostic:")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Fixture, FAILURE_CONTENT};
    use parley_llm::mock::MockResponse;
    use std::time::Duration;

    fn state(fx: &Fixture) -> Arc<HandlerState> {
        Arc::new(HandlerState {
            registry: Arc::clone(&fx.registry),
            orchestrator: Arc::new(fx.orchestrator()),
            diagnostics: DiagnosticDesk::new(Arc::clone(&fx.services.reconciler), Duration::from_secs(5)),
            authenticator: Authenticator::new(vec!["ops-1".to_string()]),
            conversations: Arc::clone(&fx.services.conversations),
            messages: Arc::clone(&fx.services.messages),
        })
    }

    async fn call(state: &Arc<HandlerState>, client: &ClientId, frame: Value) -> Value {
        let raw = handle_frame(state, client, &frame.to_string()).await.unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn malformed_frame_is_protocol_error() {
        let fx = Fixture::new(vec![]);
        let state = state(&fx);
        let client = fx.connect("u1");

        let raw = handle_frame(&state, &client, "{not json").await.unwrap();
        let v: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(v["event"], "error");
        assert_eq!(v["data"]["code"], "PROTOCOL_ERROR");
    }

    #[tokio::test]
    async fn unknown_event_is_reported() {
        let fx = Fixture::new(vec![]);
        let state = state(&fx);
        let client = fx.connect("u1");

        let v = call(&state, &client, json!({"event": "teleport", "ackId": 1})).await;
        assert_eq!(v["success"], false);
        assert_eq!(v["error"]["code"], "UNKNOWN_EVENT");
    }

    #[tokio::test]
    async fn commands_require_auth() {
        let fx = Fixture::new(vec![]);
        let state = state(&fx);
        let (client, _rx) = fx.registry.register();

        let v = call(
            &state,
            &client,
            json!({"event": "send-message", "data": {"id": "m1", "content": "hi"}, "ackId": 1}),
        )
        .await;
        assert_eq!(v["error"]["code"], "UNAUTHENTICATED");

        let v = call(&state, &client, json!({"event": "auth", "data": {"userId": "u1"}, "ackId": 2})).await;
        assert_eq!(v["success"], true);
        assert_eq!(v["data"]["identity"]["userId"], "u1");
        assert!(fx.registry.identity(&client).is_some());
    }

    #[tokio::test]
    async fn legacy_authenticate_without_user_is_rejected() {
        let fx = Fixture::new(vec![]);
        let state = state(&fx);
        let (client, _rx) = fx.registry.register();

        let v = call(&state, &client, json!({"event": "authenticate", "data": {"username": "x"}})).await;
        assert_eq!(v["event"], "error");
        assert_eq!(v["data"]["code"], "UNAUTHENTICATED");
        assert_eq!(v["data"]["event"], "auth");
        assert!(fx.registry.identity(&client).is_none());
    }

    #[tokio::test]
    async fn send_message_acks_accepted_turn() {
        let fx = Fixture::new(vec![MockResponse::text("Hi there")]);
        let state = state(&fx);
        let client = fx.connect("u1");

        let v = call(
            &state,
            &client,
            json!({"event": "send-message", "data": {"id": "m1", "content": "Hello"}, "ackId": "a1"}),
        )
        .await;
        assert_eq!(v["event"], "ack");
        assert_eq!(v["ackId"], "a1");
        assert_eq!(v["success"], true);
        assert_eq!(v["data"]["messageId"], "m1");
        assert!(v["data"]["runId"].is_string());

        settle().await;
        let events: Vec<String> = fx
            .frames(&client)
            .iter()
            .map(|f| f["event"].as_str().unwrap_or_default().to_string())
            .collect();
        assert!(events.contains(&"message:chunk".to_string()));
        assert!(events.contains(&"message:complete".to_string()));
    }

    #[tokio::test]
    async fn missing_agent_sends_message_error() {
        let fx = Fixture::new(vec![]);
        let state = state(&fx);
        let client = fx.connect("u1");

        let v = call(
            &state,
            &client,
            json!({"event": "send-message", "data": {"id": "m1", "content": "hi", "agentId": "missing-agent"}, "ackId": 1}),
        )
        .await;
        assert_eq!(v["error"]["code"], "AGENT_NOT_FOUND");

        let frames = fx.frames(&client);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["event"], "message:error");
        assert_eq!(frames[0]["data"]["messageId"], "m1");
        assert_eq!(frames[0]["data"]["code"], "AGENT_NOT_FOUND");
        assert_eq!(fx.backend.call_count(), 0);
    }

    #[tokio::test]
    async fn typing_is_relayed_to_others() {
        let fx = Fixture::new(vec![]);
        let state = state(&fx);
        let alice = fx.connect("alice");
        let bob = fx.connect("bob");
        let conv = ConversationId::from_raw("c1");
        fx.registry.join(&alice, Topic::Conversation(conv.clone()));
        fx.registry.join(&bob, Topic::Conversation(conv.clone()));

        let reply = handle_frame(
            &state,
            &alice,
            &json!({"event": "typing:start", "data": {"conversationId": "c1"}}).to_string(),
        )
        .await;
        assert!(reply.is_none());

        assert!(fx.frames(&alice).is_empty());
        let bob_frames = fx.frames(&bob);
        assert_eq!(bob_frames[0]["event"], "typing");
        assert_eq!(bob_frames[0]["data"]["userId"], "alice");
        assert_eq!(bob_frames[0]["data"]["isTyping"], true);
    }

    #[tokio::test]
    async fn typing_into_an_unjoined_conversation_is_refused() {
        let fx = Fixture::new(vec![]);
        let state = state(&fx);
        let alice = fx.connect("alice");
        let mallory = fx.connect("mallory");
        let conv = ConversationId::from_raw("c1");
        fx.registry.join(&alice, Topic::Conversation(conv.clone()));

        let v = call(
            &state,
            &mallory,
            json!({"event": "typing", "data": {"conversationId": "c1", "isTyping": true}, "ackId": 1}),
        )
        .await;
        assert_eq!(v["error"]["code"], "FORBIDDEN");
        assert!(fx.frames(&alice).is_empty());
    }

    #[tokio::test]
    async fn conversation_topic_requires_owner_or_operator() {
        let fx = Fixture::new(vec![MockResponse::text("Hi there")]);
        let state = state(&fx);
        let alice = fx.connect("alice");
        let mallory = fx.connect("mallory");
        let ops = fx.connect("ops-1");

        let ack = call(
            &state,
            &alice,
            json!({"event": "send-message", "data": {"id": "m1", "content": "Hello"}, "ackId": 1}),
        )
        .await;
        let conv = ack["data"]["conversationId"].as_str().unwrap().to_string();
        let topic = format!("conversation:{conv}");
        settle().await;

        let v = call(&state, &mallory, json!({"event": "subscribe", "data": {"topic": topic}, "ackId": 2})).await;
        assert_eq!(v["error"]["code"], "FORBIDDEN");
        assert!(fx.registry.topics(&mallory).is_empty());

        let v = call(&state, &ops, json!({"event": "subscribe", "data": {"topic": topic}, "ackId": 3})).await;
        assert_eq!(v["data"]["joined"], true);

        let v = call(
            &state,
            &mallory,
            json!({"event": "subscribe", "data": {"topic": "conversation:nope"}, "ackId": 4}),
        )
        .await;
        assert_eq!(v["error"]["code"], "CONVERSATION_NOT_FOUND");
    }

    #[tokio::test]
    async fn typing_without_scope_is_invalid() {
        let fx = Fixture::new(vec![]);
        let state = state(&fx);
        let client = fx.connect("u1");

        let v = call(&state, &client, json!({"event": "typing", "data": {"isTyping": true}, "ackId": 1})).await;
        assert_eq!(v["error"]["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn legacy_join_subscribes() {
        let fx = Fixture::new(vec![]);
        let state = state(&fx);
        let client = fx.connect("u1");

        let v = call(&state, &client, json!({"event": "join-thread", "data": {"threadId": "t9"}, "ackId": 1})).await;
        assert_eq!(v["data"]["topic"], "thread:t9");
        assert_eq!(fx.registry.topics(&client), vec![Topic::Thread("t9".into())]);

        let v = call(&state, &client, json!({"event": "leave-thread", "data": {"threadId": "t9"}, "ackId": 2})).await;
        assert_eq!(v["data"]["left"], true);
        assert!(fx.registry.topics(&client).is_empty());
    }

    #[tokio::test]
    async fn log_topic_is_operator_only() {
        let fx = Fixture::new(vec![]);
        let state = state(&fx);
        let user = fx.connect("u1");
        let ops = fx.connect("ops-1");

        let v = call(&state, &user, json!({"event": "subscribe", "data": {"topic": "diagnostics:logs"}, "ackId": 1})).await;
        assert_eq!(v["error"]["code"], "FORBIDDEN");

        let v = call(&state, &ops, json!({"event": "diagnostic:subscribe-logs", "ackId": 2})).await;
        assert_eq!(v["success"], true);
        assert_eq!(fx.registry.members(&Topic::DiagnosticLogs), vec![ops]);
    }

    #[tokio::test]
    async fn history_returns_durable_messages() {
        let fx = Fixture::new(vec![MockResponse::text("Hi there")]);
        let state = state(&fx);
        let client = fx.connect("u1");

        let ack = call(
            &state,
            &client,
            json!({"event": "send-message", "data": {"id": "m1", "content": "Hello"}, "ackId": 1}),
        )
        .await;
        let conv = ack["data"]["conversationId"].as_str().unwrap().to_string();
        settle().await;

        let v = call(&state, &client, json!({"event": "get-history", "data": {"conversation_id": conv}})).await;
        assert_eq!(v["event"], "conversation:history");
        let messages = v["data"]["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["content"], "Hello");
        assert_eq!(messages[1]["content"], "Hi there");

        let stranger = fx.connect("u2");
        let v = call(
            &state,
            &stranger,
            json!({"event": "conversation:history", "data": {"conversationId": conv}, "ackId": 2}),
        )
        .await;
        assert_eq!(v["error"]["code"], "FORBIDDEN");
    }

    #[tokio::test]
    async fn history_of_unknown_conversation() {
        let fx = Fixture::new(vec![]);
        let state = state(&fx);
        let client = fx.connect("u1");

        let v = call(
            &state,
            &client,
            json!({"event": "conversation:history", "data": {"conversationId": "nope"}, "ackId": 1}),
        )
        .await;
        assert_eq!(v["error"]["code"], "CONVERSATION_NOT_FOUND");
    }

    #[tokio::test]
    async fn diagnostics_are_operator_only() {
        let fx = Fixture::new(vec![MockResponse::text("Hi there")]);
        let state = state(&fx);
        let user = fx.connect("u1");
        let ops = fx.connect("ops-1");

        let ack = call(
            &state,
            &user,
            json!({"event": "send-message", "data": {"id": "m1", "content": "Hello"}, "ackId": 1}),
        )
        .await;
        let conv = ack["data"]["conversationId"].as_str().unwrap().to_string();
        settle().await;

        let v = call(&state, &user, json!({"event": "check-state", "data": {"conversationId": conv}, "ackId": 2})).await;
        assert_eq!(v["error"]["code"], "FORBIDDEN");

        let v = call(&state, &ops, json!({"event": "checkState", "data": {"conversationId": conv}})).await;
        assert_eq!(v["event"], "diagnostic:check-state");
        assert_eq!(v["data"]["durableCount"], 2);
        assert_eq!(v["data"]["mismatch"], false);
    }

    #[tokio::test]
    async fn failed_turn_is_visible_in_history() {
        let fx = Fixture::new(vec![MockResponse::fail_after(
            &["a", "b", "c"],
            parley_core::errors::UpstreamError::StreamInterrupted("reset".into()),
        )]);
        let state = state(&fx);
        let client = fx.connect("u1");

        let ack = call(
            &state,
            &client,
            json!({"event": "send-message", "data": {"id": "m1", "content": "Hello"}, "ackId": 1}),
        )
        .await;
        let conv = ack["data"]["conversationId"].as_str().unwrap().to_string();
        settle().await;

        let v = call(&state, &client, json!({"event": "conversation:history", "data": {"conversationId": conv}, "ackId": 2})).await;
        let messages = v["data"]["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1]["content"], FAILURE_CONTENT);
    }
}
