use serde::{Deserialize, Serialize};

/// Controller phase. Terminal states are absorbing; only `close` leaves them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Loading,
    Running,
    Paused,
    AwaitingUserInput,
    AwaitingUserConfirmation,
    Finished,
    Rejected,
    Error,
    Stopped,
}

impl AgentState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AgentState::Finished | AgentState::Rejected | AgentState::Error | AgentState::Stopped
        )
    }

    /// States in which the controller parks instead of stepping.
    pub fn is_waiting(self) -> bool {
        matches!(
            self,
            AgentState::Paused | AgentState::AwaitingUserInput | AgentState::AwaitingUserConfirmation
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentState::Loading => "loading",
            AgentState::Running => "running",
            AgentState::Paused => "paused",
            AgentState::AwaitingUserInput => "awaiting_user_input",
            AgentState::AwaitingUserConfirmation => "awaiting_user_confirmation",
            AgentState::Finished => "finished",
            AgentState::Rejected => "rejected",
            AgentState::Error => "error",
            AgentState::Stopped => "stopped",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_exactly_the_absorbing_ones() {
        for state in [
            AgentState::Finished,
            AgentState::Rejected,
            AgentState::Error,
            AgentState::Stopped,
        ] {
            assert!(state.is_terminal(), "{} should be terminal", state.as_str());
        }
        for state in [
            AgentState::Loading,
            AgentState::Running,
            AgentState::Paused,
            AgentState::AwaitingUserInput,
            AgentState::AwaitingUserConfirmation,
        ] {
            assert!(!state.is_terminal(), "{} should not be terminal", state.as_str());
        }
    }

    #[test]
    fn serde_uses_snake_case_tags() {
        let raw = serde_json::to_string(&AgentState::AwaitingUserConfirmation).expect("serialize");
        assert_eq!(raw, "\"awaiting_user_confirmation\"");
    }
}
