use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorKind;
use crate::state::AgentState;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Agent,
    User,
    Environment,
}

/// Risk level stamped onto an action by a security analyzer. Ordered so
/// threshold comparisons read as `risk >= threshold`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum SecurityRisk {
    Unknown,
    Low,
    Medium,
    High,
}

impl SecurityRisk {
    pub fn as_str(self) -> &'static str {
        match self {
            SecurityRisk::Unknown => "unknown",
            SecurityRisk::Low => "low",
            SecurityRisk::Medium => "medium",
            SecurityRisk::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationState {
    Unconfirmed,
    Confirmed,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BrowseOp {
    Navigate { url: String },
    Click { selector: String },
    Type { selector: String, text: String },
    Snapshot,
}

/// Something the agent (or user) proposes to do. The kind set is closed;
/// consumers dispatch on the serde tag rather than downcasting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Action {
    Run {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
        #[serde(default)]
        stream_output: bool,
    },
    Write {
        path: String,
        content: String,
    },
    Read {
        path: String,
    },
    Edit {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        end: Option<u64>,
        replacement: String,
    },
    Browse {
        op: BrowseOp,
    },
    Ipython {
        code: String,
    },
    Message {
        text: String,
        #[serde(default)]
        wait_for_response: bool,
    },
    AgentStateChange {
        state: AgentState,
    },
    Delegate {
        task: String,
        #[serde(default)]
        inputs: BTreeMap<String, Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_iterations: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_budget: Option<f64>,
    },
    Finish {
        #[serde(default)]
        outputs: BTreeMap<String, Value>,
    },
    Reject {
        reason: String,
    },
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Run { .. } => "run",
            Action::Write { .. } => "write",
            Action::Read { .. } => "read",
            Action::Edit { .. } => "edit",
            Action::Browse { .. } => "browse",
            Action::Ipython { .. } => "ipython",
            Action::Message { .. } => "message",
            Action::AgentStateChange { .. } => "agent_state_change",
            Action::Delegate { .. } => "delegate",
            Action::Finish { .. } => "finish",
            Action::Reject { .. } => "reject",
        }
    }

    /// True for actions the controller resolves itself; only the rest are
    /// handed to the runtime.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Action::AgentStateChange { .. }
                | Action::Delegate { .. }
                | Action::Finish { .. }
                | Action::Reject { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    Iterations,
    Budget,
}

/// A result produced by the runtime or environment. `Error` carries a
/// machine-readable kind so consumers never parse messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Observation {
    RunOutput {
        exit_code: i64,
        stdout: String,
        stderr: String,
        #[serde(default)]
        truncated: bool,
    },
    FileContent {
        path: String,
        content: String,
    },
    FileWritten {
        path: String,
        bytes_written: u64,
    },
    BrowserSnapshot {
        url: String,
        content: String,
    },
    IpythonResult {
        output: String,
    },
    UserMessage {
        text: String,
    },
    AgentStateChanged {
        state: AgentState,
    },
    AgentDelegate {
        summary: String,
        #[serde(default)]
        outputs: BTreeMap<String, Value>,
    },
    Error {
        error_kind: ErrorKind,
        message: String,
    },
    Rejected {
        reason: String,
    },
    LimitReached {
        limit: LimitKind,
        detail: String,
    },
    Condensation {
        summary: String,
        start_id: u64,
        end_id: u64,
    },
    Null,
}

impl Observation {
    pub fn kind(&self) -> &'static str {
        match self {
            Observation::RunOutput { .. } => "run_output",
            Observation::FileContent { .. } => "file_content",
            Observation::FileWritten { .. } => "file_written",
            Observation::BrowserSnapshot { .. } => "browser_snapshot",
            Observation::IpythonResult { .. } => "ipython_result",
            Observation::UserMessage { .. } => "user_message",
            Observation::AgentStateChanged { .. } => "agent_state_changed",
            Observation::AgentDelegate { .. } => "agent_delegate",
            Observation::Error { .. } => "error",
            Observation::Rejected { .. } => "rejected",
            Observation::LimitReached { .. } => "limit_reached",
            Observation::Condensation { .. } => "condensation",
            Observation::Null => "null",
        }
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Observation::Error {
            error_kind: kind,
            message: message.into(),
        }
    }
}

/// The two event variants are disjoint on their serde `kind` tags, so the
/// untagged wrapper round-trips deterministically.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum EventPayload {
    Action(Action),
    Observation(Observation),
}

/// The atomic unit of the log. Immutable after append; the stream stamps
/// `id` and `timestamp` at append time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    #[serde(default)]
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub source: EventSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<u64>,
    #[serde(flatten)]
    pub payload: EventPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_risk: Option<SecurityRisk>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation_state: Option<ConfirmationState>,
}

impl Event {
    pub fn action(source: EventSource, action: Action) -> Self {
        Self {
            id: 0,
            timestamp: Utc::now(),
            source,
            cause: None,
            payload: EventPayload::Action(action),
            security_risk: None,
            confirmation_state: None,
        }
    }

    pub fn observation(source: EventSource, cause: Option<u64>, observation: Observation) -> Self {
        Self {
            id: 0,
            timestamp: Utc::now(),
            source,
            cause,
            payload: EventPayload::Observation(observation),
            security_risk: None,
            confirmation_state: None,
        }
    }

    pub fn user_message(text: impl Into<String>) -> Self {
        Self::observation(
            EventSource::User,
            None,
            Observation::UserMessage { text: text.into() },
        )
    }

    pub fn is_action(&self) -> bool {
        matches!(self.payload, EventPayload::Action(_))
    }

    pub fn as_action(&self) -> Option<&Action> {
        match &self.payload {
            EventPayload::Action(action) => Some(action),
            EventPayload::Observation(_) => None,
        }
    }

    pub fn as_observation(&self) -> Option<&Observation> {
        match &self.payload {
            EventPayload::Action(_) => None,
            EventPayload::Observation(observation) => Some(observation),
        }
    }

    pub fn kind(&self) -> &'static str {
        match &self.payload {
            EventPayload::Action(action) => action.kind(),
            EventPayload::Observation(observation) => observation.kind(),
        }
    }
}
