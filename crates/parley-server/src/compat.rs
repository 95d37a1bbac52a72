//! Legacy client compatibility.
//!
//! Older clients use several names for the same event and snake_case or
//! per-topic payloads. Everything is rewritten here into one canonical
//! event name and payload shape; nothing past this module sees legacy input.

use serde_json::{Map, Value};

/// Legacy event name to canonical event name.
const LEGACY_EVENTS: &[(&str, &str)] = &[
    ("authenticate", "auth"),
    ("connect", "auth"),
    ("message:send", "send-message"),
    ("sendMessage", "send-message"),
    ("chat:message", "send-message"),
    ("typing:start", "typing"),
    ("typing:stop", "typing"),
    ("get-history", "conversation:history"),
    ("messages:history", "conversation:history"),
    ("check-state", "diagnostic:check-state"),
    ("checkState", "diagnostic:check-state"),
    ("check-streaming", "diagnostic:check-streaming"),
    ("message-check", "diagnostic:message-check"),
    ("get-conversation-state", "diagnostic:conversation-state"),
];

/// Per-topic membership events that become `subscribe` / `unsubscribe`.
/// `(legacy name, canonical name, topic kind, id key)`.
const LEGACY_MEMBERSHIP: &[(&str, &str, &str, &str)] = &[
    ("join-thread", "subscribe", "thread", "threadId"),
    ("thread:join", "subscribe", "thread", "threadId"),
    ("subscribe:thread", "subscribe", "thread", "threadId"),
    ("leave-thread", "unsubscribe", "thread", "threadId"),
    ("thread:leave", "unsubscribe", "thread", "threadId"),
    ("unsubscribe:thread", "unsubscribe", "thread", "threadId"),
    ("join-conversation", "subscribe", "conversation", "conversationId"),
    ("subscribe:conversation", "subscribe", "conversation", "conversationId"),
    ("leave-conversation", "unsubscribe", "conversation", "conversationId"),
    ("unsubscribe:conversation", "unsubscribe", "conversation", "conversationId"),
];

/// Legacy payload keys to canonical camelCase keys.
const LEGACY_KEYS: &[(&str, &str)] = &[
    ("user_id", "userId"),
    ("conversation_id", "conversationId"),
    ("thread_id", "threadId"),
    ("agent_id", "agentId"),
    ("message_id", "messageId"),
    ("typing", "isTyping"),
    ("text", "content"),
];

/// Rename legacy keys. If the canonical key is already present it wins and
/// the legacy duplicate is dropped.
pub fn normalize_params(params: &Value) -> Value {
    let Some(obj) = params.as_object() else {
        return params.clone();
    };
    let mut result = obj.clone();
    for &(legacy, canonical) in LEGACY_KEYS {
        if result.contains_key(canonical) {
            result.remove(legacy);
        } else if let Some(val) = result.remove(legacy) {
            result.insert(canonical.to_string(), val);
        }
    }
    Value::Object(result)
}

/// Translate a wire event into its canonical name and payload.
pub fn translate(event: &str, data: Value) -> (String, Value) {
    let mut data = normalize_params(&data);

    if let Some(&(_, canonical, kind, key)) = LEGACY_MEMBERSHIP.iter().find(|(name, ..)| *name == event) {
        let id = data.get(key).or_else(|| data.get("id")).and_then(Value::as_str).unwrap_or_default();
        let mut obj = Map::new();
        obj.insert("topic".into(), Value::String(format!("{kind}:{id}")));
        return (canonical.to_string(), Value::Object(obj));
    }

    let forced_typing = match event {
        "typing:start" => Some(true),
        "typing:stop" => Some(false),
        _ => None,
    };
    if let Some(typing) = forced_typing {
        if let Value::Object(obj) = &mut data {
            obj.insert("isTyping".into(), Value::Bool(typing));
        } else {
            data = serde_json::json!({ "isTyping": typing });
        }
    }

    let name = LEGACY_EVENTS
        .iter()
        .find(|(legacy, _)| *legacy == event)
        .map_or(event, |&(_, canonical)| canonical);
    (name.to_string(), data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_names_pass_through() {
        let (name, data) = translate("send-message", json!({"id": "m1", "content": "hi"}));
        assert_eq!(name, "send-message");
        assert_eq!(data["content"], "hi");
    }

    #[test]
    fn legacy_send_names_map_to_one_event() {
        for legacy in ["message:send", "sendMessage", "chat:message"] {
            let (name, _) = translate(legacy, json!({}));
            assert_eq!(name, "send-message", "{legacy}");
        }
    }

    #[test]
    fn snake_case_keys_are_renamed() {
        let (_, data) = translate("send-message", json!({"id": "m1", "text": "hi", "conversation_id": "c1"}));
        assert_eq!(data["content"], "hi");
        assert_eq!(data["conversationId"], "c1");
        assert!(data.get("conversation_id").is_none());
    }

    #[test]
    fn canonical_key_wins_over_legacy() {
        let out = normalize_params(&json!({"conversationId": "new", "conversation_id": "old"}));
        assert_eq!(out["conversationId"], "new");
        assert!(out.get("conversation_id").is_none());
    }

    #[test]
    fn membership_events_become_topics() {
        let (name, data) = translate("join-thread", json!({"threadId": "42"}));
        assert_eq!(name, "subscribe");
        assert_eq!(data["topic"], "thread:42");

        let (name, data) = translate("leave-conversation", json!({"conversation_id": "c1"}));
        assert_eq!(name, "unsubscribe");
        assert_eq!(data["topic"], "conversation:c1");
    }

    #[test]
    fn typing_start_stop_set_flag() {
        let (name, data) = translate("typing:start", json!({"conversationId": "c1"}));
        assert_eq!(name, "typing");
        assert_eq!(data["isTyping"], true);

        let (_, data) = translate("typing:stop", Value::Null);
        assert_eq!(data["isTyping"], false);
    }

    #[test]
    fn non_object_params_unchanged() {
        assert_eq!(normalize_params(&json!([1, 2])), json!([1, 2]));
    }
}
