//! Error taxonomy (§7). Boundary-matchable errors are distinguished from
//! fatal ones by how `errorCode` is derived from them in [`Self::error_code`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("exclusive gateway {gateway_id} matched no flow and has no default")]
    NoMatchingFlow { gateway_id: String },

    #[error("condition on flow {flow_id} failed to evaluate: {source}")]
    ConditionEvaluation {
        flow_id: String,
        #[source]
        source: crate::expr::ExprError,
    },

    #[error("receive task {element_id} timed out waiting for correlated message")]
    CorrelationTimeout { element_id: String },

    #[error("task {element_id} raised: {message}")]
    TaskExecution {
        element_id: String,
        error_code: String,
        message: String,
    },

    #[error("task {element_id} cancelled: {reason}")]
    Cancelled { element_id: String, reason: String },

    #[error("process graph invalid: {0}")]
    GraphInvalid(String),

    #[error("instance not found: {0}")]
    InstanceNotFound(uuid::Uuid),

    #[error("element not found: {0}")]
    ElementNotFound(String),

    #[error("event store write failed: {0}")]
    Persistence(#[from] anyhow::Error),
}

impl EngineError {
    /// The `errorCode` an error-boundary's declaration-order match walks
    /// against (§4.3: "empty (catch-all) or matches exception type name, or
    /// a substring of the exception message").
    pub fn error_code(&self) -> String {
        match self {
            EngineError::NoMatchingFlow { .. } => "NoMatchingFlow".to_string(),
            EngineError::ConditionEvaluation { .. } => "ConditionEvaluationError".to_string(),
            EngineError::CorrelationTimeout { .. } => "CorrelationTimeout".to_string(),
            EngineError::TaskExecution { error_code, .. } => error_code.clone(),
            EngineError::Cancelled { .. } => "Cancellation".to_string(),
            EngineError::GraphInvalid(_) => "GraphInvalid".to_string(),
            EngineError::InstanceNotFound(_) => "InstanceNotFound".to_string(),
            EngineError::ElementNotFound(_) => "ElementNotFound".to_string(),
            EngineError::Persistence(_) => "PersistenceError".to_string(),
        }
    }

    pub fn message(&self) -> String {
        self.to_string()
    }
}
