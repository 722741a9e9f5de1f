use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use tiller_types::{Action, Event, Observation};

pub mod images;
pub mod local;

pub use images::*;
pub use local::LocalRuntime;

/// Errors a runtime surfaces as *errors* rather than observations. Execution
/// failures inside the sandbox (non-zero exits, timeouts, missing files) are
/// values: they come back as error observations, not as this type.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeError {
    /// The sandbox cannot be made ready.
    Unavailable(String),
    /// The sandbox crashed or violated the protocol mid-call.
    Internal(String),
    /// Action kind outside the configured allowlist.
    NotPermitted(String),
    /// The action is unconfirmed and the controller requires confirmation.
    ConfirmationRequired { action_id: u64 },
    /// Optional capability the implementation does not provide.
    NotSupported(String),
    /// Worth retrying: network blips and similar short faults.
    Transient(String),
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeError::Unavailable(msg) => write!(f, "runtime unavailable: {msg}"),
            RuntimeError::Internal(msg) => write!(f, "runtime internal error: {msg}"),
            RuntimeError::NotPermitted(msg) => write!(f, "action not permitted: {msg}"),
            RuntimeError::ConfirmationRequired { action_id } => {
                write!(f, "action {action_id} requires confirmation before dispatch")
            }
            RuntimeError::NotSupported(msg) => write!(f, "not supported: {msg}"),
            RuntimeError::Transient(msg) => write!(f, "transient runtime fault: {msg}"),
        }
    }
}

impl std::error::Error for RuntimeError {}

/// Per-dispatch context handed to the runtime alongside the action event.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Effective timeout: min of the action's own and the runtime default.
    pub timeout: Duration,
    pub cancel: CancellationToken,
    /// Mirrors the controller's confirmation mode; unconfirmed actions are
    /// rejected when set.
    pub confirmation_required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimePhase {
    Created,
    Connecting,
    Ready,
    Closing,
    Closed,
}

/// The contract by which actions are dispatched to a sandboxed execution
/// environment. One runtime instance serves one session; operations are
/// serialized by the caller, a runtime need not be concurrent-safe.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Config tag this instance was created under.
    fn id(&self) -> &str;

    /// Idempotent; resolves once the sandbox is ready.
    async fn connect(&self) -> Result<(), RuntimeError>;

    /// Execute exactly one action, producing one observation whose cause is
    /// the action event's id.
    async fn run_action(
        &self,
        event: &Event,
        ctx: &ExecutionContext,
    ) -> Result<Observation, RuntimeError>;

    /// Idempotent; must not lose observations already published.
    async fn close(&self);

    async fn pause(&self) -> Result<(), RuntimeError> {
        Err(RuntimeError::NotSupported("pause".to_string()))
    }

    async fn resume(&self) -> Result<(), RuntimeError> {
        Err(RuntimeError::NotSupported("resume".to_string()))
    }

    // Read-only auxiliary operations; none of these produce events.
    async fn list_files(&self, path: Option<&str>) -> anyhow::Result<Vec<String>>;
    async fn get_file(&self, path: &str) -> anyhow::Result<Vec<u8>>;
    fn vscode_url(&self) -> Option<String> {
        None
    }
    async fn get_trajectory(&self) -> anyhow::Result<Vec<Event>>;
}

/// Read access to the session's ordered event log. The stream implementation
/// lives a crate above; runtimes only ever read through this.
#[async_trait]
pub trait EventLog: Send + Sync {
    async fn events(&self) -> Vec<Event>;
}

/// Per-session construction options derived from the sandbox config section.
#[derive(Clone)]
pub struct RuntimeConfig {
    pub workspace_root: std::path::PathBuf,
    pub default_timeout: Duration,
    pub allowed_actions: Option<Vec<String>>,
    pub startup_env: std::collections::BTreeMap<String, String>,
    /// The session's event log, for `get_trajectory`.
    pub event_log: Option<Arc<dyn EventLog>>,
}

pub type RuntimeFactory =
    Arc<dyn Fn(RuntimeConfig, String) -> anyhow::Result<Arc<dyn Runtime>> + Send + Sync>;

/// Explicit registry keyed by the `core.runtime` config tag; registrations
/// happen at startup, never by reflection.
pub struct RuntimeRegistry {
    factories: HashMap<String, RuntimeFactory>,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register(
            "local",
            Arc::new(|config, session_id| {
                Ok(Arc::new(LocalRuntime::new(config, session_id)) as Arc<dyn Runtime>)
            }),
        );
        registry
    }

    pub fn register(&mut self, tag: &str, factory: RuntimeFactory) {
        self.factories.insert(tag.to_string(), factory);
    }

    pub fn create(
        &self,
        tag: &str,
        config: RuntimeConfig,
        session_id: &str,
    ) -> anyhow::Result<Arc<dyn Runtime>> {
        let factory = self
            .factories
            .get(tag)
            .ok_or_else(|| anyhow::anyhow!("unknown runtime tag `{tag}`"))?;
        factory(config, session_id.to_string())
    }

    pub fn tags(&self) -> Vec<String> {
        let mut tags = self.factories.keys().cloned().collect::<Vec<_>>();
        tags.sort();
        tags
    }
}

impl Default for RuntimeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared guard: allowlist plus confirmation gate, applied before any
/// implementation-specific execution.
pub fn check_dispatchable(
    event: &Event,
    action: &Action,
    allowed: Option<&[String]>,
    confirmation_required: bool,
) -> Result<(), RuntimeError> {
    if let Some(allowed) = allowed {
        if !allowed.iter().any(|kind| kind == action.kind()) {
            return Err(RuntimeError::NotPermitted(format!(
                "action kind `{}` is outside the allowlist",
                action.kind()
            )));
        }
    }
    if confirmation_required
        && event.confirmation_state == Some(tiller_types::ConfirmationState::Unconfirmed)
    {
        return Err(RuntimeError::ConfirmationRequired {
            action_id: event.id,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiller_types::{ConfirmationState, EventSource};

    fn read_event() -> Event {
        Event::action(
            EventSource::Agent,
            Action::Read {
                path: "a.txt".to_string(),
            },
        )
    }

    #[test]
    fn allowlist_rejects_unlisted_kinds() {
        let event = read_event();
        let action = event.as_action().unwrap().clone();
        let allowed = vec!["run".to_string()];
        let err = check_dispatchable(&event, &action, Some(&allowed), false).unwrap_err();
        assert!(matches!(err, RuntimeError::NotPermitted(_)));
    }

    #[test]
    fn unconfirmed_actions_are_held_in_confirmation_mode() {
        let mut event = read_event();
        event.id = 4;
        event.confirmation_state = Some(ConfirmationState::Unconfirmed);
        let action = event.as_action().unwrap().clone();
        let err = check_dispatchable(&event, &action, None, true).unwrap_err();
        assert_eq!(err, RuntimeError::ConfirmationRequired { action_id: 4 });
        // without confirmation mode the same action passes
        assert!(check_dispatchable(&event, &action, None, false).is_ok());
    }
}
