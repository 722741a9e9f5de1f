use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use tiller_types::{AgentState, Event, EventSource, Observation, StateError};

use crate::event_stream::EventStream;
use crate::file_store::FileStore;
use crate::storage_paths::state_key;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
pub struct Metrics {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DelegationFrame {
    pub parent_session: String,
    pub task: String,
}

/// Mutable snapshot of controller progress. Owned exclusively by one
/// controller and mutated only inside its step loop; everything external
/// reads persisted snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    pub session_id: String,
    pub iteration: u32,
    pub max_iterations: u32,
    pub budget_spent: f64,
    /// `None` = unlimited. `Some(0.0)` is a real cap: the controller stops
    /// before issuing any action.
    pub max_budget: Option<f64>,
    pub agent_state: AgentState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<StateError>,
    /// Condensation cursor: the agent's view starts at this event id.
    pub start_id: u64,
    #[serde(default)]
    pub delegation_stack: Vec<DelegationFrame>,
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub metrics: Metrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsView {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost: f64,
    pub iteration: u32,
}

impl State {
    pub fn new(
        session_id: impl Into<String>,
        max_iterations: u32,
        max_budget: Option<f64>,
        inputs: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            iteration: 0,
            max_iterations,
            budget_spent: 0.0,
            max_budget,
            agent_state: AgentState::Loading,
            last_error: None,
            start_id: 0,
            delegation_stack: Vec::new(),
            inputs,
            metrics: Metrics::default(),
        }
    }

    pub fn iterations_exhausted(&self) -> bool {
        self.iteration >= self.max_iterations
    }

    pub fn budget_exhausted(&self) -> bool {
        matches!(self.max_budget, Some(max) if self.budget_spent >= max)
    }

    pub fn remaining_iterations(&self) -> u32 {
        self.max_iterations.saturating_sub(self.iteration)
    }

    pub fn remaining_budget(&self) -> Option<f64> {
        self.max_budget.map(|max| (max - self.budget_spent).max(0.0))
    }

    /// The agent's history window: all events with id >= `start_id`, passed
    /// through the condenser. Never mutates the stream.
    pub async fn view(&self, stream: &EventStream, condenser: &dyn Condenser) -> Vec<Event> {
        let events = stream.get_events(self.start_id, None, None).await;
        condenser.condense(events)
    }

    pub fn metrics(&self) -> MetricsView {
        MetricsView {
            prompt_tokens: self.metrics.prompt_tokens,
            completion_tokens: self.metrics.completion_tokens,
            cost: self.metrics.cost,
            iteration: self.iteration,
        }
    }

    pub async fn save(&self, store: &Arc<dyn FileStore>) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        store.put(&state_key(&self.session_id), &bytes).await
    }

    pub async fn load(
        session_id: &str,
        store: &Arc<dyn FileStore>,
    ) -> anyhow::Result<Option<Self>> {
        let Some(bytes) = store.get(&state_key(session_id)).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

/// Pure view transform over an event range. Condensation collapses older
/// segments into summary observations for the prompt without touching the
/// underlying stream.
pub trait Condenser: Send + Sync {
    fn condense(&self, events: Vec<Event>) -> Vec<Event>;
}

pub struct NoopCondenser;

impl Condenser for NoopCondenser {
    fn condense(&self, events: Vec<Event>) -> Vec<Event> {
        events
    }
}

/// Keeps the most recent `keep_last` events and replaces everything older
/// with a single condensation marker carrying the forgotten range.
pub struct WindowCondenser {
    pub keep_last: usize,
}

impl Condenser for WindowCondenser {
    fn condense(&self, events: Vec<Event>) -> Vec<Event> {
        if events.len() <= self.keep_last || self.keep_last == 0 {
            return events;
        }
        let split = events.len() - self.keep_last;
        let (old, recent) = events.split_at(split);
        let start_id = old.first().map(|e| e.id).unwrap_or(0);
        let end_id = old.last().map(|e| e.id).unwrap_or(start_id);
        let mut summary = Event::observation(
            EventSource::Environment,
            None,
            Observation::Condensation {
                summary: format!("{} earlier events condensed", old.len()),
                start_id,
                end_id,
            },
        );
        summary.id = start_id;
        let mut out = Vec::with_capacity(recent.len() + 1);
        out.push(summary);
        out.extend_from_slice(recent);
        out
    }
}
