use parley_core::agents::AgentLookupError;
use parley_core::errors::{GatewayError, NotFoundKind};
use parley_core::store::PersistenceFailure;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("agent {id} is unusable: {reason}")]
    AgentInvalid { id: String, reason: String },

    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("context budget exceeded after pruning: {estimated} > {budget}")]
    BudgetExceededAfterPruning { estimated: usize, budget: usize },

    #[error("persistence failure: {0}")]
    Persistence(#[from] PersistenceFailure),

    #[error("{0}")]
    Validation(String),
}

impl From<AgentLookupError> for EngineError {
    fn from(e: AgentLookupError) -> Self {
        match e {
            AgentLookupError::NotFound(id) => Self::AgentNotFound(id),
            AgentLookupError::Malformed { id, reason } => Self::AgentInvalid { id, reason },
            AgentLookupError::InvalidId(id) => Self::AgentInvalid {
                reason: "invalid agent id".into(),
                id,
            },
            AgentLookupError::Io(io) => Self::Persistence(PersistenceFailure::new(format!("agent load: {io}"))),
        }
    }
}

impl From<EngineError> for GatewayError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::AgentNotFound(id) => GatewayError::not_found(NotFoundKind::Agent, id),
            EngineError::AgentInvalid { id, reason } => {
                GatewayError::Validation(format!("agent '{id}' cannot be used: {reason}"))
            }
            EngineError::ConversationNotFound(id) => GatewayError::not_found(NotFoundKind::Conversation, id),
            EngineError::BudgetExceededAfterPruning { estimated, budget } => {
                GatewayError::BudgetExceeded { estimated, budget }
            }
            EngineError::Persistence(f) => GatewayError::Persistence(f.0),
            EngineError::Validation(msg) => GatewayError::Validation(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_errors_split_by_cause() {
        let nf: EngineError = AgentLookupError::NotFound("missing-agent".into()).into();
        assert_eq!(GatewayError::from(nf).code(), "AGENT_NOT_FOUND");

        let bad: EngineError = AgentLookupError::Malformed {
            id: "a".into(),
            reason: "expected object".into(),
        }
        .into();
        assert_eq!(GatewayError::from(bad).code(), "VALIDATION_ERROR");
    }

    #[test]
    fn budget_maps_to_budget_code() {
        let e = EngineError::BudgetExceededAfterPruning {
            estimated: 20,
            budget: 10,
        };
        assert_eq!(GatewayError::from(e).code(), "BUDGET_EXCEEDED");
    }
}
