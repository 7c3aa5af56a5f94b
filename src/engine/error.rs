use crate::model::ConflictInfo;
use crate::pool::PoolError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("conflict with {} existing reservation(s)", .0.len())]
    Conflict(Vec<ConflictInfo>),
    #[error("illegal transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("pool exhausted: {0}")]
    PoolExhausted(#[from] PoolError),
    #[error("audit write failure: {0}")]
    AuditWriteFailure(String),
    #[error("agent disabled: {0}")]
    AgentDisabled(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
}

impl EngineError {
    /// Stable discriminator for the wire protocol and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::Conflict(_) => "conflict",
            EngineError::IllegalTransition { .. } => "illegal_transition",
            EngineError::Unauthorized(_) => "unauthorized",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::PoolExhausted(_) => "pool_exhausted",
            EngineError::AuditWriteFailure(_) => "audit_write_failure",
            EngineError::AgentDisabled(_) => "agent_disabled",
            EngineError::LimitExceeded(_) => "limit_exceeded",
        }
    }

    pub(crate) fn not_found(what: &str, id: impl std::fmt::Display) -> Self {
        EngineError::NotFound(format!("{what} {id}"))
    }
}
