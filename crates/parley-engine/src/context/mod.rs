pub mod budget;
pub mod mentions;
pub mod relevance;
pub mod tokens;

use std::sync::Arc;

use parley_core::agents::{AgentConfig, AgentRegistry};
use parley_core::context::{Annotation, AnnotationKind, TurnPackage};
use parley_core::ids::AgentId;
use parley_core::messages::{MessageStatus, TurnMessage};
use parley_core::store::{AuditEntry, AuditLog, MessageStore};
use parley_core::tools::{ToolCatalog, ToolDefinition};
use tracing::{debug, info, instrument, warn};

use self::budget::{fit_to_budget, BudgetLimits};
use self::mentions::MentionResolver;
use crate::error::EngineError;
use crate::registry::ToolFilter;

/// Static inputs to assembly, usually derived from settings.
#[derive(Clone, Debug)]
pub struct AssemblerConfig {
    pub default_model: String,
    /// `None` sends no system prompt when neither request nor agent sets one.
    pub default_system_prompt: Option<String>,
    pub limits: BudgetLimits,
    pub max_tools: usize,
    pub history_limit: usize,
}

/// One user turn to assemble. The turn must already carry its client id.
#[derive(Clone, Debug)]
pub struct AssembleRequest {
    pub turn: TurnMessage,
    pub agent_id: Option<AgentId>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
}

#[derive(Clone, Debug)]
pub struct AssembledTurn {
    pub package: TurnPackage,
    /// The user message as it should be persisted: original text plus any
    /// resolved (and possibly truncated) attachments.
    pub user_message: TurnMessage,
    pub agent: Option<AgentConfig>,
}

/// Builds a ready-to-run [`TurnPackage`] from a user message.
pub struct ContextAssembler {
    agents: Arc<dyn AgentRegistry>,
    tools: Arc<dyn ToolCatalog>,
    mentions: MentionResolver,
    messages: Arc<dyn MessageStore>,
    audit: Arc<dyn AuditLog>,
    config: AssemblerConfig,
}

fn first_non_blank(candidates: [Option<&str>; 2]) -> Option<&str> {
    candidates.into_iter().flatten().find(|s| !s.trim().is_empty())
}

impl ContextAssembler {
    pub fn new(
        agents: Arc<dyn AgentRegistry>,
        tools: Arc<dyn ToolCatalog>,
        mentions: MentionResolver,
        messages: Arc<dyn MessageStore>,
        audit: Arc<dyn AuditLog>,
        config: AssemblerConfig,
    ) -> Self {
        Self {
            agents,
            tools,
            mentions,
            messages,
            audit,
            config,
        }
    }

    pub fn config(&self) -> &AssemblerConfig {
        &self.config
    }

    /// Request value, then agent value, then configured default.
    fn effective_model(&self, request: &AssembleRequest, agent: Option<&AgentConfig>) -> String {
        first_non_blank([request.model.as_deref(), agent.and_then(|a| a.model.as_deref())])
            .unwrap_or(self.config.default_model.as_str())
            .to_string()
    }

    /// Same precedence as the model. An explicit empty value at any level
    /// means "no system prompt" rather than falling through.
    fn effective_system_prompt(&self, request: &AssembleRequest, agent: Option<&AgentConfig>) -> Option<String> {
        let chosen = request
            .system_prompt
            .as_deref()
            .or_else(|| agent.and_then(|a| a.system_prompt.as_deref()))
            .or(self.config.default_system_prompt.as_deref())?;
        (!chosen.trim().is_empty()).then(|| chosen.to_string())
    }

    /// Registry intersected with the agent allow-list. Invalid definitions
    /// are dropped with an annotation instead of failing the turn.
    fn candidate_tools(&self, agent: Option<&AgentConfig>, annotations: &mut Vec<Annotation>) -> Vec<ToolDefinition> {
        let all = match self.tools.list() {
            Ok(all) => all,
            Err(e) => {
                warn!(error = %e, "tool catalog unavailable, continuing without tools");
                annotations.push(Annotation::new(AnnotationKind::ToolDegraded, e.to_string()));
                return Vec::new();
            }
        };

        let allow = agent.and_then(|a| a.tools.as_deref());
        let filter = ToolFilter::from_allow_list(allow);
        if let Some(names) = allow {
            for name in names.iter().filter(|n| !all.iter().any(|t| &t.name == *n)) {
                annotations.push(Annotation::new(
                    AnnotationKind::ToolDegraded,
                    format!("{name}: not registered"),
                ));
            }
        }

        all.into_iter()
            .filter(|t| filter.allows(&t.name))
            .filter(|t| match t.validate() {
                Ok(()) => true,
                Err(e) => {
                    warn!(tool = %t.name, error = %e, "dropping invalid tool");
                    annotations.push(Annotation::new(AnnotationKind::ToolDegraded, e.to_string()));
                    false
                }
            })
            .collect()
    }

    #[instrument(skip_all, fields(conversation_id = %request.turn.conversation_id, turn_id = %request.turn.id))]
    pub async fn assemble(&self, request: AssembleRequest) -> Result<AssembledTurn, EngineError> {
        let agent = match &request.agent_id {
            Some(id) => Some(self.agents.get(id).await?),
            None => None,
        };
        let model = self.effective_model(&request, agent.as_ref());
        let system_prompt = self.effective_system_prompt(&request, agent.as_ref());

        let mut annotations = Vec::new();
        let candidates = self.candidate_tools(agent.as_ref(), &mut annotations);

        let mentioned = self.mentions.resolve(&request.turn.content).await;
        annotations.extend(mentioned.annotations);
        let mut mentioned_names = Vec::new();
        for tool in &mentioned.tools {
            if candidates.iter().any(|c| c.name == tool.name) {
                mentioned_names.push(tool.name.clone());
            } else {
                annotations.push(Annotation::new(
                    AnnotationKind::ToolDegraded,
                    format!("{}: not available to this agent", tool.name),
                ));
            }
        }
        let tools = relevance::narrow_tools(candidates, &request.turn.content, &mentioned_names, self.config.max_tools);

        let mut history: Vec<TurnMessage> = self
            .messages
            .list(&request.turn.conversation_id, self.config.history_limit)
            .await?
            .into_iter()
            .filter(|m| m.id != request.turn.id)
            .filter(|m| !matches!(m.status, MessageStatus::Error | MessageStatus::Streaming))
            .collect();

        let mut current = request.turn.clone();
        current.content = mentioned.text;
        current.attachments.extend(mentioned.attachments);
        history.push(current);

        let fitted = fit_to_budget(
            system_prompt.as_deref(),
            &tools,
            history,
            &request.turn.id,
            self.config.limits,
        )?;
        annotations.extend(fitted.annotations);

        for t in fitted.truncated {
            let entry = AuditEntry {
                conversation_id: request.turn.conversation_id.clone(),
                turn_id: t.message_id,
                source: t.source,
                original: t.original,
                original_bytes: t.original_bytes,
                truncated_bytes: t.truncated_bytes,
            };
            if let Err(e) = self.audit.record(entry).await {
                warn!(error = %e, "failed to audit truncated output");
            }
        }

        let attachments = fitted
            .messages
            .iter()
            .rev()
            .find(|m| m.id == request.turn.id)
            .map(|m| m.attachments.clone())
            .unwrap_or_default();
        let mut user_message = request.turn;
        user_message.attachments = attachments;

        info!(
            model = %model,
            tools = tools.len(),
            messages = fitted.messages.len(),
            estimated = fitted.stats.estimated_after,
            pruned = fitted.stats.pruned_messages,
            annotations = annotations.len(),
            "turn assembled"
        );
        debug!(?annotations, "assembly annotations");

        Ok(AssembledTurn {
            package: TurnPackage {
                conversation_id: user_message.conversation_id.clone(),
                turn_id: user_message.id.clone(),
                agent_id: agent.as_ref().map(|a| a.id.clone()),
                model,
                system_prompt,
                messages: fitted.messages,
                tools,
                budget: fitted.stats,
                annotations,
            },
            user_message,
            agent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::InMemoryAgentRegistry;
    use crate::context::mentions::ToolMentionProvider;
    use crate::registry::{ToolRegistry, ToolSource};
    use parley_core::ids::{ConversationId, MessageId, UserId};
    use parley_core::messages::{Attachment, Conversation, Role};
    use parley_core::store::ConversationStore;
    use parley_store::Store;

    fn tool(name: &str, description: &str) -> ToolDefinition {
        ToolDefinition {
            name: name.into(),
            description: description.into(),
            parameters_schema: serde_json::json!({"type": "object"}),
        }
    }

    fn config() -> AssemblerConfig {
        AssemblerConfig {
            default_model: "default-model".into(),
            default_system_prompt: Some("default prompt".into()),
            limits: BudgetLimits {
                max_context_tokens: 10_000,
                max_tool_output_tokens: 50,
            },
            max_tools: 8,
            history_limit: 100,
        }
    }

    struct Fixture {
        store: Store,
        conversation: ConversationId,
    }

    async fn fixture() -> Fixture {
        let store = Store::in_memory().unwrap();
        let conversation = Conversation::new(UserId::from_raw("u1"));
        store.conversations.create(&conversation).await.unwrap();
        Fixture {
            store,
            conversation: conversation.id,
        }
    }

    fn assembler(f: &Fixture, agents: InMemoryAgentRegistry, registry: ToolRegistry, config: AssemblerConfig) -> ContextAssembler {
        let catalog: Arc<dyn ToolCatalog> = Arc::new(registry);
        let mentions = MentionResolver::new().with_provider(Arc::new(ToolMentionProvider::new(catalog.clone())));
        ContextAssembler::new(
            Arc::new(agents),
            catalog,
            mentions,
            Arc::new(f.store.messages.clone()),
            Arc::new(f.store.audit.clone()),
            config,
        )
    }

    fn turn(f: &Fixture, id: &str, text: &str) -> TurnMessage {
        TurnMessage::user(MessageId::from_raw(id), f.conversation.clone(), UserId::from_raw("u1"), text)
    }

    fn request(turn: TurnMessage) -> AssembleRequest {
        AssembleRequest {
            turn,
            agent_id: None,
            model: None,
            system_prompt: None,
        }
    }

    #[tokio::test]
    async fn defaults_apply_without_agent() {
        let f = fixture().await;
        let a = assembler(&f, InMemoryAgentRegistry::new(), ToolRegistry::new(), config());
        let out = a.assemble(request(turn(&f, "m1", "Hello"))).await.unwrap();

        assert_eq!(out.package.model, "default-model");
        assert_eq!(out.package.system_prompt.as_deref(), Some("default prompt"));
        assert_eq!(out.package.messages.len(), 1);
        assert_eq!(out.package.current_message().unwrap().content, "Hello");
        assert!(out.agent.is_none());
    }

    #[tokio::test]
    async fn request_beats_agent_beats_default() {
        let f = fixture().await;
        let mut agent = AgentConfig::new("helper");
        agent.model = Some("agent-model".into());
        agent.system_prompt = Some("agent prompt".into());
        let a = assembler(&f, InMemoryAgentRegistry::with_agents([agent]), ToolRegistry::new(), config());

        let mut req = request(turn(&f, "m1", "hi"));
        req.agent_id = Some(AgentId::from_raw("helper"));
        let out = a.assemble(req.clone()).await.unwrap();
        assert_eq!(out.package.model, "agent-model");
        assert_eq!(out.package.system_prompt.as_deref(), Some("agent prompt"));

        req.model = Some("request-model".into());
        req.system_prompt = Some("request prompt".into());
        let out = a.assemble(req).await.unwrap();
        assert_eq!(out.package.model, "request-model");
        assert_eq!(out.package.system_prompt.as_deref(), Some("request prompt"));
    }

    #[tokio::test]
    async fn empty_configured_prompt_sends_none() {
        let f = fixture().await;
        let mut cfg = config();
        cfg.default_system_prompt = Some(String::new());
        let a = assembler(&f, InMemoryAgentRegistry::new(), ToolRegistry::new(), cfg);
        let out = a.assemble(request(turn(&f, "m1", "hi"))).await.unwrap();
        assert!(out.package.system_prompt.is_none());
    }

    #[tokio::test]
    async fn missing_agent_is_a_typed_failure() {
        let f = fixture().await;
        let a = assembler(&f, InMemoryAgentRegistry::new(), ToolRegistry::new(), config());
        let mut req = request(turn(&f, "m1", "hi"));
        req.agent_id = Some(AgentId::from_raw("missing-agent"));
        let err = a.assemble(req).await.unwrap_err();
        assert!(matches!(err, EngineError::AgentNotFound(id) if id == "missing-agent"));
    }

    #[tokio::test]
    async fn agent_allow_list_intersects_registry() {
        let f = fixture().await;
        let mut registry = ToolRegistry::new();
        registry.register(tool("search", "web"), ToolSource::BuiltIn);
        registry.register(tool("weather", "forecast"), ToolSource::BuiltIn);
        let mut agent = AgentConfig::new("helper");
        agent.tools = Some(vec!["weather".into(), "calendar".into()]);
        let a = assembler(&f, InMemoryAgentRegistry::with_agents([agent]), registry, config());

        let mut req = request(turn(&f, "m1", "hi"));
        req.agent_id = Some(AgentId::from_raw("helper"));
        let out = a.assemble(req).await.unwrap();
        let names: Vec<_> = out.package.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["weather"]);
        assert!(out
            .package
            .annotations
            .iter()
            .any(|a| a.kind == AnnotationKind::ToolDegraded && a.detail.contains("calendar")));
    }

    #[tokio::test]
    async fn invalid_tool_degrades() {
        let f = fixture().await;
        let mut registry = ToolRegistry::new();
        registry.register(tool("search", "web"), ToolSource::BuiltIn);
        let mut broken = tool("broken", "");
        broken.parameters_schema = serde_json::json!([]);
        registry.register(broken, ToolSource::BuiltIn);
        let a = assembler(&f, InMemoryAgentRegistry::new(), registry, config());

        let out = a.assemble(request(turn(&f, "m1", "hi"))).await.unwrap();
        assert_eq!(out.package.tools.len(), 1);
        assert_eq!(out.package.tools[0].name, "search");
        assert!(out.package.annotations.iter().any(|a| a.kind == AnnotationKind::ToolDegraded));
    }

    #[tokio::test]
    async fn unresolved_tool_mention_is_annotated_and_turn_proceeds() {
        let f = fixture().await;
        let a = assembler(&f, InMemoryAgentRegistry::new(), ToolRegistry::new(), config());
        let out = a
            .assemble(request(turn(&f, "m1", "use @tools/search to find cats")))
            .await
            .unwrap();

        assert!(out.package.tools.is_empty());
        let current = out.package.current_message().unwrap();
        assert!(current.content.contains("@tools/search [unresolved: not found]"));
        assert_eq!(out.user_message.content, "use @tools/search to find cats");
        assert!(out
            .package
            .annotations
            .iter()
            .any(|a| a.kind == AnnotationKind::UnresolvedMention));
    }

    #[tokio::test]
    async fn history_excludes_errored_and_streaming_messages() {
        let f = fixture().await;
        let messages = &f.store.messages;
        messages.append(&turn(&f, "m0", "earlier")).await.unwrap();
        let mut failed = turn(&f, "a0", "Sorry");
        failed.role = Role::Assistant;
        failed.status = MessageStatus::Error;
        failed.user_id = None;
        messages.append(&failed).await.unwrap();

        let a = assembler(&f, InMemoryAgentRegistry::new(), ToolRegistry::new(), config());
        let out = a.assemble(request(turn(&f, "m1", "again"))).await.unwrap();
        let ids: Vec<_> = out.package.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m0", "m1"]);
    }

    #[tokio::test]
    async fn truncated_attachment_is_audited() {
        let f = fixture().await;
        let a = assembler(&f, InMemoryAgentRegistry::new(), ToolRegistry::new(), config());
        let mut t = turn(&f, "m1", "look");
        t.attachments.push(Attachment {
            source: "tool:search".into(),
            content: "z".repeat(1000),
            truncated: false,
        });
        let out = a.assemble(request(t)).await.unwrap();

        assert!(out.user_message.attachments[0].truncated);
        assert!(out.user_message.attachments[0].content.contains("[truncated:"));
        let audited = f
            .store
            .audit
            .list_for_turn(&f.conversation, &MessageId::from_raw("m1"))
            .unwrap();
        assert_eq!(audited.len(), 1);
        assert_eq!(audited[0].original.len(), 1000);
    }

    #[tokio::test]
    async fn truncation_is_audited_once_across_turns() {
        let f = fixture().await;
        let a = assembler(&f, InMemoryAgentRegistry::new(), ToolRegistry::new(), config());
        let mut t = turn(&f, "m1", "look");
        t.attachments.push(Attachment {
            source: "tool:search".into(),
            content: "z".repeat(1000),
            truncated: false,
        });
        let first = a.assemble(request(t)).await.unwrap();
        f.store.messages.append(&first.user_message).await.unwrap();

        for id in ["m2", "m3"] {
            let out = a.assemble(request(turn(&f, id, "more"))).await.unwrap();
            f.store.messages.append(&out.user_message).await.unwrap();
            assert!(!out
                .package
                .annotations
                .iter()
                .any(|a| a.kind == AnnotationKind::OutputTruncated));
            let earlier = &out.package.messages[0];
            assert_eq!(earlier.attachments[0].content, first.user_message.attachments[0].content);
            assert!(earlier.attachments[0].content.len() <= 200);
            assert!(f
                .store
                .audit
                .list_for_turn(&f.conversation, &MessageId::from_raw(id))
                .unwrap()
                .is_empty());
        }
        let audited = f
            .store
            .audit
            .list_for_turn(&f.conversation, &MessageId::from_raw("m1"))
            .unwrap();
        assert_eq!(audited.len(), 1);
    }

    #[tokio::test]
    async fn oversized_turn_is_rejected() {
        let f = fixture().await;
        let mut cfg = config();
        cfg.limits.max_context_tokens = 20;
        let a = assembler(&f, InMemoryAgentRegistry::new(), ToolRegistry::new(), cfg);
        let err = a
            .assemble(request(turn(&f, "m1", &"word ".repeat(100))))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::BudgetExceededAfterPruning { .. }));
    }
}
