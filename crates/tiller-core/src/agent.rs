use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use tiller_types::{Action, Event, EventPayload, Observation};

/// The history window handed to an agent for one decision.
#[derive(Debug, Clone)]
pub struct AgentView {
    pub events: Vec<Event>,
    pub inputs: BTreeMap<String, Value>,
    pub iteration: u32,
}

impl AgentView {
    pub fn last_user_message(&self) -> Option<&str> {
        self.events.iter().rev().find_map(|event| match &event.payload {
            EventPayload::Observation(Observation::UserMessage { text }) => Some(text.as_str()),
            _ => None,
        })
    }
}

/// Token/cost usage of one agent step, accounted against the controller's
/// budget.
#[derive(Debug, Clone, Copy, Default)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost: f64,
}

#[derive(Debug, Clone)]
pub struct AgentDecision {
    pub action: Action,
    pub usage: Usage,
}

impl AgentDecision {
    pub fn free(action: Action) -> Self {
        Self {
            action,
            usage: Usage::default(),
        }
    }
}

/// Given a view of history, produce the next action. Stateless between calls
/// except for caches the implementation owns itself.
#[async_trait]
pub trait Agent: Send + Sync {
    async fn step(&mut self, view: &AgentView) -> anyhow::Result<AgentDecision>;
}

pub type AgentFactory = Arc<dyn Fn() -> Box<dyn Agent + Send> + Send + Sync>;

/// Explicit process-scoped registry, built at startup from configuration.
pub struct AgentRegistry {
    factories: HashMap<String, AgentFactory>,
    default_agent: String,
}

impl AgentRegistry {
    pub fn new(default_agent: impl Into<String>) -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
            default_agent: default_agent.into(),
        };
        registry.register("echo", Arc::new(|| Box::new(EchoAgent::default())));
        registry
    }

    pub fn register(&mut self, tag: &str, factory: AgentFactory) {
        self.factories.insert(tag.to_string(), factory);
    }

    pub fn create(&self, tag: Option<&str>) -> anyhow::Result<Box<dyn Agent + Send>> {
        let wanted = tag.unwrap_or(&self.default_agent);
        let factory = self
            .factories
            .get(wanted)
            .ok_or_else(|| anyhow::anyhow!("unknown agent tag `{wanted}`"))?;
        Ok(factory())
    }

    pub fn tags(&self) -> Vec<String> {
        let mut tags = self.factories.keys().cloned().collect::<Vec<_>>();
        tags.sort();
        tags
    }
}

/// Plays back a fixed list of actions, then finishes. The vehicle for seeded
/// scenario tests and scripted smoke runs.
pub struct ScriptedAgent {
    script: Vec<Action>,
    cursor: usize,
    usage_per_step: Usage,
}

impl ScriptedAgent {
    pub fn new(script: Vec<Action>) -> Self {
        Self {
            script,
            cursor: 0,
            usage_per_step: Usage::default(),
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage_per_step = usage;
        self
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    async fn step(&mut self, _view: &AgentView) -> anyhow::Result<AgentDecision> {
        let action = match self.script.get(self.cursor) {
            Some(action) => action.clone(),
            None => Action::Finish {
                outputs: BTreeMap::new(),
            },
        };
        self.cursor += 1;
        Ok(AgentDecision {
            action,
            usage: self.usage_per_step,
        })
    }
}

/// Replies to the latest user message with an echo, then finishes. Useful as
/// a wiring check when no LLM-backed agent is plugged in.
#[derive(Default)]
pub struct EchoAgent {
    replied: bool,
}

#[async_trait]
impl Agent for EchoAgent {
    async fn step(&mut self, view: &AgentView) -> anyhow::Result<AgentDecision> {
        if self.replied {
            return Ok(AgentDecision::free(Action::Finish {
                outputs: BTreeMap::new(),
            }));
        }
        self.replied = true;
        let text = view.last_user_message().unwrap_or("").to_string();
        Ok(AgentDecision::free(Action::Message {
            text,
            wait_for_response: false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_view() -> AgentView {
        AgentView {
            events: Vec::new(),
            inputs: BTreeMap::new(),
            iteration: 0,
        }
    }

    #[tokio::test]
    async fn scripted_agent_finishes_after_its_script() {
        let mut agent = ScriptedAgent::new(vec![Action::Read {
            path: "README.md".to_string(),
        }]);
        let first = agent.step(&empty_view()).await.expect("step");
        assert_eq!(first.action.kind(), "read");
        let second = agent.step(&empty_view()).await.expect("step");
        assert_eq!(second.action.kind(), "finish");
    }

    #[tokio::test]
    async fn echo_agent_mirrors_the_last_user_message() {
        let mut agent = EchoAgent::default();
        let view = AgentView {
            events: vec![Event::user_message("hello")],
            inputs: BTreeMap::new(),
            iteration: 0,
        };
        let decision = agent.step(&view).await.expect("step");
        match decision.action {
            Action::Message { text, .. } => assert_eq!(text, "hello"),
            other => panic!("expected message action, got {}", other.kind()),
        }
        let next = agent.step(&view).await.expect("step");
        assert_eq!(next.action.kind(), "finish");
    }

    #[test]
    fn registry_rejects_unknown_tags() {
        let registry = AgentRegistry::new("echo");
        assert!(registry.create(Some("missing")).is_err());
        assert!(registry.create(None).is_ok());
    }
}
