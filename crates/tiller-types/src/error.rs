use serde::{Deserialize, Serialize};

/// Machine-readable error discriminator carried by error observations and
/// surfaced in `state.last_error`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Storage,
    RuntimeUnavailable,
    RuntimeInternal,
    ActionNotPermitted,
    ConfirmationRequired,
    Execution,
    Timeout,
    Agent,
    BudgetExceeded,
    IterationsExceeded,
    ConversationLimitReached,
    NotSupported,
    NotFound,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Storage => "storage",
            ErrorKind::RuntimeUnavailable => "runtime_unavailable",
            ErrorKind::RuntimeInternal => "runtime_internal",
            ErrorKind::ActionNotPermitted => "action_not_permitted",
            ErrorKind::ConfirmationRequired => "confirmation_required",
            ErrorKind::Execution => "execution",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Agent => "agent",
            ErrorKind::BudgetExceeded => "budget_exceeded",
            ErrorKind::IterationsExceeded => "iterations_exceeded",
            ErrorKind::ConversationLimitReached => "conversation_limit_reached",
            ErrorKind::NotSupported => "not_supported",
            ErrorKind::NotFound => "not_found",
        }
    }
}

/// Structured error recorded when a controller lands in a terminal `error`
/// or `stopped` state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateError {
    pub kind: ErrorKind,
    pub message: String,
}

impl StateError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TillerError {
    Configuration(String),
    Storage(String),
    RuntimeUnavailable(String),
    RuntimeInternal(String),
    ActionNotPermitted(String),
    ConfirmationRequired { action_id: u64 },
    Execution(String),
    Agent(String),
    BudgetExceeded { spent: f64, max: f64 },
    IterationsExceeded { iterations: u32, max: u32 },
    ConversationLimitReached(String),
    NotSupported(String),
    NotFound(String),
}

impl TillerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TillerError::Configuration(_) => ErrorKind::Configuration,
            TillerError::Storage(_) => ErrorKind::Storage,
            TillerError::RuntimeUnavailable(_) => ErrorKind::RuntimeUnavailable,
            TillerError::RuntimeInternal(_) => ErrorKind::RuntimeInternal,
            TillerError::ActionNotPermitted(_) => ErrorKind::ActionNotPermitted,
            TillerError::ConfirmationRequired { .. } => ErrorKind::ConfirmationRequired,
            TillerError::Execution(_) => ErrorKind::Execution,
            TillerError::Agent(_) => ErrorKind::Agent,
            TillerError::BudgetExceeded { .. } => ErrorKind::BudgetExceeded,
            TillerError::IterationsExceeded { .. } => ErrorKind::IterationsExceeded,
            TillerError::ConversationLimitReached(_) => ErrorKind::ConversationLimitReached,
            TillerError::NotSupported(_) => ErrorKind::NotSupported,
            TillerError::NotFound(_) => ErrorKind::NotFound,
        }
    }
}

impl std::fmt::Display for TillerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TillerError::Configuration(msg) => write!(f, "configuration error: {msg}"),
            TillerError::Storage(msg) => write!(f, "storage error: {msg}"),
            TillerError::RuntimeUnavailable(msg) => write!(f, "runtime unavailable: {msg}"),
            TillerError::RuntimeInternal(msg) => write!(f, "runtime internal error: {msg}"),
            TillerError::ActionNotPermitted(msg) => write!(f, "action not permitted: {msg}"),
            TillerError::ConfirmationRequired { action_id } => {
                write!(f, "action {action_id} requires user confirmation")
            }
            TillerError::Execution(msg) => write!(f, "execution failed: {msg}"),
            TillerError::Agent(msg) => write!(f, "agent error: {msg}"),
            TillerError::BudgetExceeded { spent, max } => {
                write!(f, "budget exceeded: spent {spent:.4} of {max:.4}")
            }
            TillerError::IterationsExceeded { iterations, max } => {
                write!(f, "iteration limit exceeded: {iterations} of {max}")
            }
            TillerError::ConversationLimitReached(msg) => {
                write!(f, "conversation limit reached: {msg}")
            }
            TillerError::NotSupported(msg) => write!(f, "not supported: {msg}"),
            TillerError::NotFound(msg) => write!(f, "not found: {msg}"),
        }
    }
}

impl std::error::Error for TillerError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_match_variants() {
        assert_eq!(
            TillerError::ConfirmationRequired { action_id: 5 }.kind(),
            ErrorKind::ConfirmationRequired
        );
        assert_eq!(
            TillerError::BudgetExceeded { spent: 1.5, max: 1.0 }.kind(),
            ErrorKind::BudgetExceeded
        );
    }

    #[test]
    fn error_kind_serializes_snake_case() {
        let raw = serde_json::to_string(&ErrorKind::RuntimeInternal).expect("serialize");
        assert_eq!(raw, "\"runtime_internal\"");
    }
}
