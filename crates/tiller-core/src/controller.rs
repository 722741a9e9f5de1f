use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tiller_observability::{ObsEvent, ProcessKind};

use tiller_runtime::{ExecutionContext, Runtime, RuntimeError};
use tiller_types::{
    Action, AgentState, ConfirmationState, ErrorKind, Event, EventSource, Observation,
    SecurityRisk, StateError,
};

use crate::agent::{Agent, AgentRegistry, AgentView};
use crate::config::TillerConfig;
use crate::event_stream::EventStream;
use crate::file_store::FileStore;
use crate::security::SecurityAnalyzer;
use crate::state::{Condenser, DelegationFrame, State};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub num_retries: u32,
    pub min_wait: Duration,
    pub max_wait: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            num_retries: 4,
            min_wait: Duration::from_secs(1),
            max_wait: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub max_iterations: u32,
    /// `None` = unlimited.
    pub max_budget: Option<f64>,
    pub confirmation_mode: bool,
    pub risk_threshold: SecurityRisk,
    pub retry: RetryPolicy,
    /// Agent-step failures tracked over this many recent steps; reaching
    /// `error_threshold` inside the window escalates to the error state.
    pub error_window: usize,
    pub error_threshold: usize,
    pub default_action_timeout: Duration,
}

impl ControllerConfig {
    pub fn from_config(config: &TillerConfig) -> Self {
        Self {
            max_iterations: config.core.max_iterations,
            max_budget: (config.core.max_budget_per_task > 0.0)
                .then_some(config.core.max_budget_per_task),
            confirmation_mode: config.security.confirmation_mode,
            risk_threshold: config.security.risk_threshold,
            retry: RetryPolicy {
                num_retries: config.llm.num_retries,
                min_wait: Duration::from_secs(config.llm.retry_min_wait),
                max_wait: Duration::from_secs(config.llm.retry_max_wait),
                multiplier: config.llm.retry_multiplier,
            },
            error_window: 10,
            error_threshold: 3,
            default_action_timeout: Duration::from_secs(config.sandbox.timeout),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::from_config(&TillerConfig::default())
    }
}

enum ControlMsg {
    Pause,
    Resume,
    Stop,
    UserMessage(String),
    Confirm { action_id: u64, accept: bool },
}

/// External face of a running controller. Cheap to clone; every operation is
/// safe at any time and ignored once the controller is terminal.
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::UnboundedSender<ControlMsg>,
    state_rx: watch::Receiver<AgentState>,
    cancel: CancellationToken,
}

impl ControllerHandle {
    pub fn agent_state(&self) -> AgentState {
        *self.state_rx.borrow()
    }

    pub fn pause(&self) {
        let _ = self.tx.send(ControlMsg::Pause);
    }

    pub fn resume(&self) {
        let _ = self.tx.send(ControlMsg::Resume);
    }

    /// Sets the cancel flag so an in-flight runtime call is asked to stop,
    /// then requests the stopped transition. Repeat stops are no-ops.
    pub fn stop(&self) {
        self.cancel.cancel();
        let _ = self.tx.send(ControlMsg::Stop);
    }

    pub fn send_user_message(&self, text: impl Into<String>) {
        let _ = self.tx.send(ControlMsg::UserMessage(text.into()));
    }

    pub fn confirm(&self, action_id: u64, accept: bool) {
        let _ = self.tx.send(ControlMsg::Confirm { action_id, accept });
    }

    /// Resolves with the terminal state once the controller is done.
    pub async fn wait_terminal(&self) -> AgentState {
        let mut rx = self.state_rx.clone();
        loop {
            let state = *rx.borrow();
            if state.is_terminal() {
                return state;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }

    pub fn state_receiver(&self) -> watch::Receiver<AgentState> {
        self.state_rx.clone()
    }
}

/// Drives the perceive -> decide -> act cycle for exactly one agent against
/// one event stream and one runtime. Owns its `State` exclusively; everything
/// external talks through the [`ControllerHandle`].
pub struct AgentController {
    state: State,
    stream: Arc<EventStream>,
    runtime: Arc<dyn Runtime>,
    agent: Box<dyn Agent + Send>,
    agents: Arc<AgentRegistry>,
    store: Arc<dyn FileStore>,
    analyzer: Option<Arc<dyn SecurityAnalyzer>>,
    condenser: Arc<dyn Condenser>,
    config: ControllerConfig,
    rx: mpsc::UnboundedReceiver<ControlMsg>,
    state_tx: watch::Sender<AgentState>,
    cancel: CancellationToken,
    pending_confirmation: Option<Event>,
    answered: HashSet<u64>,
    recent_step_errors: VecDeque<bool>,
    delegate_count: u32,
}

impl AgentController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: State,
        stream: Arc<EventStream>,
        runtime: Arc<dyn Runtime>,
        agent: Box<dyn Agent + Send>,
        agents: Arc<AgentRegistry>,
        store: Arc<dyn FileStore>,
        analyzer: Option<Arc<dyn SecurityAnalyzer>>,
        condenser: Arc<dyn Condenser>,
        config: ControllerConfig,
        cancel: CancellationToken,
    ) -> (Self, ControllerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(state.agent_state);
        let handle = ControllerHandle {
            tx,
            state_rx,
            cancel: cancel.clone(),
        };
        let controller = Self {
            state,
            stream,
            runtime,
            agent,
            agents,
            store,
            analyzer,
            condenser,
            config,
            rx,
            state_tx,
            cancel,
            pending_confirmation: None,
            answered: HashSet::new(),
            recent_step_errors: VecDeque::new(),
            delegate_count: 0,
        };
        (controller, handle)
    }

    /// Append the initial user message, enter `running`, and drive the loop
    /// to a terminal state. Returns the final state snapshot.
    pub async fn start(mut self, initial_user_message: Option<String>) -> State {
        if let Some(text) = initial_user_message {
            if let Err(err) = self.stream.append(Event::user_message(text)).await {
                self.fail(ErrorKind::Storage, err.to_string());
                return self.finish_up().await;
            }
        }
        self.set_state(AgentState::Running);
        self.run().await
    }

    async fn run(mut self) -> State {
        loop {
            while let Ok(msg) = self.rx.try_recv() {
                self.handle_control(msg).await;
            }
            if self.state.agent_state.is_terminal() {
                break;
            }
            if self.cancel.is_cancelled() {
                self.transition_stopped("stop requested").await;
                break;
            }
            if self.state.agent_state.is_waiting() {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        self.transition_stopped("stop requested").await;
                        break;
                    }
                    msg = self.rx.recv() => match msg {
                        Some(msg) => self.handle_control(msg).await,
                        None => {
                            // Every handle is gone; nothing can ever wake us.
                            self.transition_stopped("controller detached").await;
                            break;
                        }
                    }
                }
                continue;
            }
            self.step().await;
            if let Err(err) = self.state.save(&self.store).await {
                warn!(session_id = %self.state.session_id, error = %err, "state snapshot failed");
            }
        }
        self.finish_up().await
    }

    async fn finish_up(mut self) -> State {
        if let Err(err) = self.state.save(&self.store).await {
            warn!(session_id = %self.state.session_id, error = %err, "final state save failed");
        }
        ObsEvent::ControllerTerminal {
            conversation_id: &self.state.session_id,
            state: self.state.agent_state.as_str(),
            error_code: self.state.last_error.as_ref().map(|e| e.kind.as_str()),
            detail: self.state.last_error.as_ref().map(|e| e.message.as_str()),
        }
        .emit(ProcessKind::Engine);
        self.set_state(self.state.agent_state);
        self.state.clone()
    }

    /// One iteration of the loop: halting predicates, agent decision, then
    /// action handling.
    async fn step(&mut self) {
        if self.state.iterations_exhausted() {
            let detail = format!(
                "iteration limit of {} reached",
                self.state.max_iterations
            );
            self.append_limit(
                tiller_types::LimitKind::Iterations,
                &detail,
                ErrorKind::IterationsExceeded,
            )
            .await;
            return;
        }
        if self.state.budget_exhausted() {
            let detail = format!(
                "budget of {:.4} exhausted (spent {:.4})",
                self.state.max_budget.unwrap_or_default(),
                self.state.budget_spent
            );
            self.append_limit(
                tiller_types::LimitKind::Budget,
                &detail,
                ErrorKind::BudgetExceeded,
            )
            .await;
            return;
        }

        let view = AgentView {
            events: self.state.view(&self.stream, self.condenser.as_ref()).await,
            inputs: self.state.inputs.clone(),
            iteration: self.state.iteration,
        };
        self.state.iteration += 1;

        let decision = match self.agent.step(&view).await {
            Ok(decision) => {
                self.record_step_outcome(false);
                decision
            }
            Err(err) => {
                self.record_step_outcome(true);
                let message = format!("agent step failed: {err}");
                warn!(session_id = %self.state.session_id, error = %err, "agent step error");
                if self.append_event(Event::observation(
                    EventSource::Environment,
                    None,
                    Observation::error(ErrorKind::Agent, message),
                ))
                .await
                .is_none()
                {
                    return;
                }
                if self.step_errors_in_window() >= self.config.error_threshold {
                    self.fail(ErrorKind::Agent, "agent failed repeatedly; giving up");
                }
                return;
            }
        };

        self.state.metrics.prompt_tokens += decision.usage.prompt_tokens;
        self.state.metrics.completion_tokens += decision.usage.completion_tokens;
        self.state.metrics.cost += decision.usage.cost;
        self.state.budget_spent += decision.usage.cost;

        match decision.action {
            Action::Finish { outputs } => {
                let event = Event::action(EventSource::Agent, Action::Finish { outputs });
                if self.append_action(event).await.is_some() {
                    self.set_state(AgentState::Finished);
                }
            }
            Action::Reject { reason } => {
                let event = Event::action(EventSource::Agent, Action::Reject { reason });
                if self.append_action(event).await.is_some() {
                    self.set_state(AgentState::Rejected);
                }
            }
            Action::AgentStateChange { state } => {
                self.apply_state_change(state).await;
            }
            Action::Delegate {
                task,
                inputs,
                agent,
                max_iterations,
                max_budget,
            } => {
                self.handle_delegate(task, inputs, agent, max_iterations, max_budget)
                    .await;
            }
            Action::Message { text, wait_for_response } => {
                let wait = wait_for_response;
                let event = Event::action(
                    EventSource::Agent,
                    Action::Message {
                        text,
                        wait_for_response: wait,
                    },
                );
                let Some(id) = self.append_action(event).await else {
                    return;
                };
                if wait {
                    self.set_state(AgentState::AwaitingUserInput);
                    self.append_event(Event::observation(
                        EventSource::Environment,
                        Some(id),
                        Observation::AgentStateChanged {
                            state: AgentState::AwaitingUserInput,
                        },
                    ))
                    .await;
                } else {
                    self.append_event(Event::observation(
                        EventSource::Environment,
                        Some(id),
                        Observation::Null,
                    ))
                    .await;
                }
            }
            action => {
                self.dispatch(action).await;
            }
        }
    }

    /// Stamp, append, and dispatch an executable action, then append its
    /// observation. Confirmation gating happens here, before dispatch.
    async fn dispatch(&mut self, action: Action) {
        let mut event = Event::action(EventSource::Agent, action);
        let risk = self.assess(&event);
        event.security_risk = risk;

        let needs_confirmation = self.config.confirmation_mode
            && risk.map(|r| r >= self.config.risk_threshold).unwrap_or(false);
        if needs_confirmation {
            event.confirmation_state = Some(ConfirmationState::Unconfirmed);
            let Some(id) = self.append_action(event.clone()).await else {
                return;
            };
            event.id = id;
            self.pending_confirmation = Some(event);
            self.set_state(AgentState::AwaitingUserConfirmation);
            return;
        }
        if self.config.confirmation_mode {
            event.confirmation_state = Some(ConfirmationState::Confirmed);
        }

        let Some(id) = self.append_action(event.clone()).await else {
            return;
        };
        event.id = id;
        self.dispatch_appended(event).await;
    }

    /// Run an already-appended action against the runtime and record the
    /// resulting observation. Transient faults retry with backoff first.
    async fn dispatch_appended(&mut self, event: Event) {
        let id = event.id;
        if self.answered.contains(&id) {
            debug!(action_id = id, "duplicate dispatch suppressed");
            return;
        }
        let ctx = ExecutionContext {
            timeout: self.config.default_action_timeout,
            cancel: self.cancel.clone(),
            confirmation_required: self.config.confirmation_mode,
        };
        let action_kind = event.as_action().map(|a| a.kind()).unwrap_or("unknown");
        ObsEvent::DispatchStarted {
            conversation_id: &self.state.session_id,
            action_id: id,
            action_kind,
            runtime: self.runtime.id(),
        }
        .emit(ProcessKind::Engine);

        let result = self.run_with_retries(&event, &ctx).await;
        if let Err(err) = &result {
            let detail = err.to_string();
            ObsEvent::DispatchFailed {
                conversation_id: &self.state.session_id,
                action_id: id,
                action_kind,
                runtime: self.runtime.id(),
                detail: &detail,
            }
            .emit(ProcessKind::Engine);
        }
        let observation = match result {
            Ok(observation) => observation,
            Err(RuntimeError::NotPermitted(msg)) => {
                Observation::error(ErrorKind::ActionNotPermitted, msg)
            }
            Err(RuntimeError::NotSupported(msg)) => {
                Observation::error(ErrorKind::NotSupported, msg)
            }
            Err(RuntimeError::ConfirmationRequired { action_id }) => {
                // The gate above should have held this back; honor the
                // runtime's refusal rather than looping on it.
                self.pending_confirmation = Some(event.clone());
                self.set_state(AgentState::AwaitingUserConfirmation);
                debug!(action_id, "runtime demanded confirmation");
                return;
            }
            Err(RuntimeError::Transient(msg)) => Observation::error(ErrorKind::Execution, msg),
            Err(RuntimeError::Unavailable(msg)) => {
                self.append_event(Event::observation(
                    EventSource::Environment,
                    Some(id),
                    Observation::error(ErrorKind::RuntimeUnavailable, msg.clone()),
                ))
                .await;
                self.answered.insert(id);
                self.fail(ErrorKind::RuntimeUnavailable, msg);
                return;
            }
            Err(RuntimeError::Internal(msg)) => {
                self.append_event(Event::observation(
                    EventSource::Environment,
                    Some(id),
                    Observation::error(ErrorKind::RuntimeInternal, msg.clone()),
                ))
                .await;
                self.answered.insert(id);
                self.fail(ErrorKind::RuntimeInternal, msg);
                return;
            }
        };

        self.append_event(Event::observation(
            EventSource::Environment,
            Some(id),
            observation,
        ))
        .await;
        self.answered.insert(id);
    }

    async fn run_with_retries(
        &self,
        event: &Event,
        ctx: &ExecutionContext,
    ) -> Result<Observation, RuntimeError> {
        let mut attempt = 0u32;
        let mut wait = self.config.retry.min_wait;
        loop {
            match self.runtime.run_action(event, ctx).await {
                Err(RuntimeError::Transient(msg))
                    if attempt < self.config.retry.num_retries && !ctx.cancel.is_cancelled() =>
                {
                    attempt += 1;
                    warn!(
                        session_id = %self.state.session_id,
                        action_id = event.id,
                        attempt,
                        error = %msg,
                        "transient runtime fault; retrying"
                    );
                    tokio::time::sleep(wait).await;
                    let scaled = wait.as_secs_f64() * self.config.retry.multiplier;
                    wait = Duration::from_secs_f64(scaled).min(self.config.retry.max_wait);
                }
                other => return other,
            }
        }
    }

    async fn handle_delegate(
        &mut self,
        task: String,
        inputs: BTreeMap<String, Value>,
        agent_tag: Option<String>,
        max_iterations: Option<u32>,
        max_budget: Option<f64>,
    ) {
        let event = Event::action(
            EventSource::Agent,
            Action::Delegate {
                task: task.clone(),
                inputs: inputs.clone(),
                agent: agent_tag.clone(),
                max_iterations,
                max_budget,
            },
        );
        let Some(delegate_id) = self.append_action(event).await else {
            return;
        };

        let child_agent = match self.agents.create(agent_tag.as_deref()) {
            Ok(agent) => agent,
            Err(err) => {
                self.append_event(Event::observation(
                    EventSource::Environment,
                    Some(delegate_id),
                    Observation::error(ErrorKind::Configuration, err.to_string()),
                ))
                .await;
                self.answered.insert(delegate_id);
                return;
            }
        };

        let child_session = format!("{}/d{}", self.state.session_id, self.delegate_count);
        self.delegate_count += 1;
        let child_stream = EventStream::new(child_session.clone(), Arc::clone(&self.store));

        // Child limits never exceed what the parent has left.
        let remaining_iterations = self.state.remaining_iterations();
        let child_iterations = max_iterations
            .unwrap_or(remaining_iterations)
            .min(remaining_iterations);
        let child_budget = match (self.state.remaining_budget(), max_budget) {
            (Some(remaining), Some(requested)) => Some(requested.min(remaining)),
            (Some(remaining), None) => Some(remaining),
            (None, requested) => requested,
        };

        let mut child_inputs = self.state.inputs.clone();
        child_inputs.extend(inputs);
        child_inputs.insert("task".to_string(), Value::String(task.clone()));

        let mut child_state = State::new(
            child_session.clone(),
            child_iterations,
            child_budget,
            child_inputs,
        );
        child_state.delegation_stack = self.state.delegation_stack.clone();
        child_state.delegation_stack.push(DelegationFrame {
            parent_session: self.state.session_id.clone(),
            task: task.clone(),
        });

        let mut child_config = self.config.clone();
        child_config.max_iterations = child_iterations;
        child_config.max_budget = child_budget;

        let (child, _child_handle) = AgentController::new(
            child_state,
            Arc::clone(&child_stream),
            Arc::clone(&self.runtime),
            child_agent,
            Arc::clone(&self.agents),
            Arc::clone(&self.store),
            self.analyzer.clone(),
            Arc::clone(&self.condenser),
            child_config,
            self.cancel.child_token(),
        );

        self.state.delegation_stack.push(DelegationFrame {
            parent_session: self.state.session_id.clone(),
            task: task.clone(),
        });
        let final_state = Box::pin(child.start(Some(task.clone()))).await;
        self.state.delegation_stack.pop();

        self.state.budget_spent += final_state.budget_spent;
        self.state.metrics.prompt_tokens += final_state.metrics.prompt_tokens;
        self.state.metrics.completion_tokens += final_state.metrics.completion_tokens;
        self.state.metrics.cost += final_state.metrics.cost;

        let (summary, outputs) = summarize_delegate(&child_stream, &final_state).await;
        self.append_event(Event::observation(
            EventSource::Environment,
            Some(delegate_id),
            Observation::AgentDelegate { summary, outputs },
        ))
        .await;
        self.answered.insert(delegate_id);
        child_stream.close().await;
    }

    async fn apply_state_change(&mut self, target: AgentState) {
        let event = Event::action(
            EventSource::Agent,
            Action::AgentStateChange { state: target },
        );
        let Some(id) = self.append_action(event).await else {
            return;
        };
        let applied = match target {
            AgentState::Paused | AgentState::AwaitingUserInput => {
                self.set_state(target);
                target
            }
            AgentState::Stopped => {
                self.transition_stopped("agent requested stop").await;
                AgentState::Stopped
            }
            other => {
                warn!(
                    session_id = %self.state.session_id,
                    requested = other.as_str(),
                    "ignoring illegal agent-requested transition"
                );
                self.state.agent_state
            }
        };
        self.append_event(Event::observation(
            EventSource::Environment,
            Some(id),
            Observation::AgentStateChanged { state: applied },
        ))
        .await;
        self.answered.insert(id);
    }

    async fn handle_control(&mut self, msg: ControlMsg) {
        match msg {
            ControlMsg::Pause => {
                if self.state.agent_state == AgentState::Running {
                    self.set_state(AgentState::Paused);
                }
            }
            ControlMsg::Resume => {
                if self.state.agent_state == AgentState::Paused {
                    self.set_state(AgentState::Running);
                }
            }
            ControlMsg::Stop => {
                if !self.state.agent_state.is_terminal() {
                    self.transition_stopped("stop requested").await;
                }
            }
            ControlMsg::UserMessage(text) => {
                // The stream is the source of truth: the message lands now
                // and is observed at the next loop turn. A pending
                // confirmation stays pending.
                if self.append_event(Event::user_message(text)).await.is_some()
                    && self.state.agent_state == AgentState::AwaitingUserInput
                {
                    self.set_state(AgentState::Running);
                }
            }
            ControlMsg::Confirm { action_id, accept } => {
                self.resolve_confirmation(action_id, accept).await;
            }
        }
    }

    async fn resolve_confirmation(&mut self, action_id: u64, accept: bool) {
        let Some(pending) = self.pending_confirmation.clone() else {
            warn!(action_id, "confirm with no pending action");
            return;
        };
        if pending.id != action_id {
            warn!(
                action_id,
                pending = pending.id,
                "confirm targets a different action"
            );
            return;
        }
        self.pending_confirmation = None;
        if accept {
            let mut confirmed = pending;
            confirmed.confirmation_state = Some(ConfirmationState::Confirmed);
            self.dispatch_appended(confirmed).await;
        } else {
            self.append_event(Event::observation(
                EventSource::User,
                Some(action_id),
                Observation::Rejected {
                    reason: "action rejected by user".to_string(),
                },
            ))
            .await;
            self.answered.insert(action_id);
        }
        if !self.state.agent_state.is_terminal() {
            self.set_state(AgentState::Running);
        }
    }

    fn assess(&self, event: &Event) -> Option<SecurityRisk> {
        let analyzer = self.analyzer.as_ref()?;
        let action = event.as_action()?;
        // Fail closed: an analyzer fault is treated as high risk.
        Some(analyzer.risk(action).unwrap_or_else(|err| {
            warn!(error = %err, "security analyzer failed; assuming high risk");
            SecurityRisk::High
        }))
    }

    /// Appends an agent action, stamping the risk tag when an analyzer is
    /// configured so every action in the stream carries one.
    async fn append_action(&mut self, mut event: Event) -> Option<u64> {
        if event.security_risk.is_none() {
            event.security_risk = self.assess(&event);
        }
        self.append_event(event).await
    }

    async fn append_event(&mut self, event: Event) -> Option<u64> {
        match self.stream.append(event).await {
            Ok(id) => Some(id),
            Err(err) => {
                self.fail(ErrorKind::Storage, err.to_string());
                None
            }
        }
    }

    async fn append_limit(&mut self, limit: tiller_types::LimitKind, detail: &str, kind: ErrorKind) {
        self.append_event(Event::observation(
            EventSource::Environment,
            None,
            Observation::LimitReached {
                limit,
                detail: detail.to_string(),
            },
        ))
        .await;
        if !self.state.agent_state.is_terminal() {
            self.state.last_error = Some(StateError::new(kind, detail));
            self.set_state(AgentState::Stopped);
        }
    }

    async fn transition_stopped(&mut self, reason: &str) {
        if self.state.agent_state.is_terminal() {
            return;
        }
        debug!(session_id = %self.state.session_id, reason, "stopping");
        self.set_state(AgentState::Stopped);
    }

    fn fail(&mut self, kind: ErrorKind, message: impl Into<String>) {
        if self.state.agent_state.is_terminal() {
            return;
        }
        self.state.last_error = Some(StateError::new(kind, message));
        self.set_state(AgentState::Error);
    }

    fn set_state(&mut self, state: AgentState) {
        self.state.agent_state = state;
        let _ = self.state_tx.send(state);
    }

    fn record_step_outcome(&mut self, errored: bool) {
        self.recent_step_errors.push_back(errored);
        while self.recent_step_errors.len() > self.config.error_window {
            self.recent_step_errors.pop_front();
        }
    }

    fn step_errors_in_window(&self) -> usize {
        self.recent_step_errors.iter().filter(|e| **e).count()
    }
}

async fn summarize_delegate(
    stream: &EventStream,
    final_state: &State,
) -> (String, BTreeMap<String, Value>) {
    let events = stream.get_events(0, None, None).await;
    let mut outputs = BTreeMap::new();
    let mut last_message = None;
    for event in events.iter().rev() {
        match &event.payload {
            tiller_types::EventPayload::Action(Action::Finish { outputs: finish }) => {
                outputs = finish.clone();
                break;
            }
            tiller_types::EventPayload::Action(Action::Message { text, .. })
                if last_message.is_none() =>
            {
                last_message = Some(text.clone());
            }
            _ => {}
        }
    }
    let summary = if let Some(Value::String(summary)) = outputs.get("summary") {
        summary.clone()
    } else if let Some(message) = last_message {
        message
    } else {
        format!(
            "delegate ended in state `{}` after {} iterations",
            final_state.agent_state.as_str(),
            final_state.iteration
        )
    };
    (summary, outputs)
}
