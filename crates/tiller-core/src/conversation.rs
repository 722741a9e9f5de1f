use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use tiller_observability::{ObsEvent, ProcessKind};

use tiller_runtime::{Runtime, RuntimeConfig, RuntimeError, RuntimeRegistry};
use tiller_types::{
    AgentState, ConversationPage, ConversationSnapshot, CreateConversationRequest, Event,
    TillerError, Trajectory,
};

use crate::agent::AgentRegistry;
use crate::config::TillerConfig;
use crate::controller::{AgentController, ControllerConfig, ControllerHandle};
use crate::event_stream::{EventStream, SubscriberCallback};
use crate::file_store::{store_for, FileStore};
use crate::security::AnalyzerRegistry;
use crate::state::{Condenser, NoopCondenser, State, WindowCondenser};
use crate::storage_paths::metadata_key;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMetadata {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub agent: String,
    pub runtime: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

pub struct ConversationEntry {
    pub id: String,
    pub stream: Arc<EventStream>,
    pub runtime: Arc<dyn Runtime>,
    pub handle: ControllerHandle,
    pub metadata: ConversationMetadata,
    task: Mutex<Option<JoinHandle<State>>>,
    last_activity: std::sync::Mutex<Instant>,
}

impl ConversationEntry {
    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }
}

/// Owns every active (stream, controller, runtime) triple and routes external
/// operations to the right one. The only component that creates and destroys
/// conversations.
pub struct ConversationManager {
    config: TillerConfig,
    store: Arc<dyn FileStore>,
    agents: Arc<AgentRegistry>,
    runtimes: Arc<RuntimeRegistry>,
    analyzers: Arc<AnalyzerRegistry>,
    active: RwLock<HashMap<String, Arc<ConversationEntry>>>,
}

impl ConversationManager {
    pub fn new(config: TillerConfig) -> anyhow::Result<Arc<Self>> {
        let store = store_for(&config.core.file_store, &config.core.file_store_path)?;
        Ok(Self::with_registries(
            config,
            store,
            Arc::new(AgentRegistry::new("echo")),
            Arc::new(RuntimeRegistry::new()),
            Arc::new(AnalyzerRegistry::new()),
        ))
    }

    pub fn with_registries(
        config: TillerConfig,
        store: Arc<dyn FileStore>,
        agents: Arc<AgentRegistry>,
        runtimes: Arc<RuntimeRegistry>,
        analyzers: Arc<AnalyzerRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            agents,
            runtimes,
            analyzers,
            active: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &TillerConfig {
        &self.config
    }

    pub async fn create(
        &self,
        req: CreateConversationRequest,
    ) -> Result<String, TillerError> {
        {
            let active = self.active.read().await;
            if active.len() >= self.config.core.max_concurrent_conversations {
                return Err(TillerError::ConversationLimitReached(format!(
                    "{} active conversations",
                    active.len()
                )));
            }
            if let Some(Value::String(user)) = req.inputs.get("user") {
                let owned = active
                    .values()
                    .filter(|entry| {
                        entry.metadata.inputs.get("user")
                            == Some(&Value::String(user.clone()))
                    })
                    .count();
                if owned >= self.config.core.max_conversations_per_user {
                    return Err(TillerError::ConversationLimitReached(format!(
                        "user `{user}` already owns {owned} conversations"
                    )));
                }
            }
        }

        let id = Uuid::new_v4().to_string();
        let stream = EventStream::new(id.clone(), Arc::clone(&self.store));

        if let Some(path) = self.config.core.replay_trajectory_path.clone() {
            replay_trajectory(&stream, &path)
                .await
                .map_err(|err| TillerError::Configuration(err.to_string()))?;
        }

        let runtime_tag = req.runtime.clone().unwrap_or_else(|| self.config.core.runtime.clone());
        let workspace_root = match &self.config.sandbox.workspace_root {
            Some(root) => std::path::PathBuf::from(root),
            None => std::path::PathBuf::from(&self.config.core.file_store_path)
                .join("workspaces")
                .join(&id),
        };
        let runtime_config = RuntimeConfig {
            workspace_root,
            default_timeout: Duration::from_secs(self.config.sandbox.timeout),
            allowed_actions: self.config.sandbox.allowed_actions.clone(),
            startup_env: self.config.sandbox.runtime_startup_env_vars.clone(),
            event_log: Some(stream.clone()),
        };
        let runtime = self
            .runtimes
            .create(&runtime_tag, runtime_config, &id)
            .map_err(|err| TillerError::Configuration(err.to_string()))?;
        match runtime.connect().await {
            Ok(()) => {}
            Err(RuntimeError::Unavailable(msg)) => {
                return Err(TillerError::RuntimeUnavailable(msg))
            }
            Err(err) => return Err(TillerError::RuntimeUnavailable(err.to_string())),
        }

        let agent_tag = req
            .agent
            .clone()
            .unwrap_or_else(|| self.config.core.default_agent.clone());
        let agent = self
            .agents
            .create(Some(&agent_tag))
            .map_err(|err| TillerError::Configuration(err.to_string()))?;

        let analyzer = match self.config.security.security_analyzer.as_deref() {
            Some(tag) => Some(self.analyzers.get(tag).ok_or_else(|| {
                TillerError::Configuration(format!("unknown security analyzer `{tag}`"))
            })?),
            None => None,
        };

        let mut controller_config = ControllerConfig::from_config(&self.config);
        if let Some(max_iterations) = req.max_iterations {
            controller_config.max_iterations = max_iterations;
        }
        if let Some(max_budget) = req.max_budget {
            controller_config.max_budget = Some(max_budget);
        }

        let mut inputs = req.inputs.clone();
        if let Some(repository) = &req.repository {
            inputs.insert("repository".to_string(), Value::String(repository.clone()));
        }
        if let Some(branch) = &req.branch {
            inputs.insert("branch".to_string(), Value::String(branch.clone()));
        }

        let state = State::new(
            id.clone(),
            controller_config.max_iterations,
            controller_config.max_budget,
            inputs.clone(),
        );

        let metadata = ConversationMetadata {
            id: id.clone(),
            created_at: Utc::now(),
            agent: agent_tag,
            runtime: runtime_tag,
            inputs,
            repository: req.repository.clone(),
            branch: req.branch.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&metadata)
            .map_err(|err| TillerError::Storage(err.to_string()))?;
        self.store
            .put(&metadata_key(&id), &bytes)
            .await
            .map_err(|err| TillerError::Storage(err.to_string()))?;

        let condenser: Arc<dyn Condenser> = match self.config.core.history_window {
            Some(keep_last) => Arc::new(WindowCondenser { keep_last }),
            None => Arc::new(NoopCondenser),
        };
        let (controller, handle) = AgentController::new(
            state,
            Arc::clone(&stream),
            Arc::clone(&runtime),
            agent,
            Arc::clone(&self.agents),
            Arc::clone(&self.store),
            analyzer,
            condenser,
            controller_config,
            tokio_util::sync::CancellationToken::new(),
        );
        // An empty initial message is still appended, so the stream always
        // opens with the user turn.
        let initial = req.initial_message.clone().unwrap_or_default();
        let task = tokio::spawn(controller.start(Some(initial)));

        ObsEvent::ConversationCreated {
            conversation_id: &id,
            agent: &metadata.agent,
            runtime: &metadata.runtime,
        }
        .emit(ProcessKind::Engine);
        let entry = Arc::new(ConversationEntry {
            id: id.clone(),
            stream,
            runtime,
            handle,
            metadata,
            task: Mutex::new(Some(task)),
            last_activity: std::sync::Mutex::new(Instant::now()),
        });
        self.active.write().await.insert(id.clone(), entry);
        Ok(id)
    }

    async fn entry(&self, id: &str) -> Result<Arc<ConversationEntry>, TillerError> {
        self.active
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| TillerError::NotFound(format!("conversation `{id}`")))
    }

    pub async fn get(&self, id: &str) -> Result<ConversationSnapshot, TillerError> {
        let entry = self.entry(id).await?;
        Ok(self.snapshot(&entry).await)
    }

    pub async fn list(&self, page: usize, page_size: usize) -> ConversationPage {
        let entries = {
            let active = self.active.read().await;
            let mut entries = active.values().cloned().collect::<Vec<_>>();
            entries.sort_by(|a, b| a.metadata.created_at.cmp(&b.metadata.created_at));
            entries
        };
        let total = entries.len();
        let page_size = page_size.clamp(1, 100);
        let mut items = Vec::new();
        for entry in entries.into_iter().skip(page * page_size).take(page_size) {
            items.push(self.snapshot(&entry).await);
        }
        ConversationPage {
            items,
            page,
            page_size,
            total,
        }
    }

    async fn snapshot(&self, entry: &ConversationEntry) -> ConversationSnapshot {
        // The controller owns its state exclusively; reads go through the
        // persisted snapshot plus the live state channel.
        let persisted = State::load(&entry.id, &self.store).await.ok().flatten();
        let (iteration, budget_spent) = persisted
            .map(|state| (state.iteration, state.budget_spent))
            .unwrap_or((0, 0.0));
        ConversationSnapshot {
            id: entry.id.clone(),
            agent_state: entry.handle.agent_state(),
            iteration,
            budget_spent,
            created_at: entry.metadata.created_at,
            updated_at: Utc::now(),
            title: entry
                .metadata
                .inputs
                .get("title")
                .and_then(|v| v.as_str())
                .map(ToString::to_string),
        }
    }

    pub async fn send_message(&self, id: &str, text: &str) -> Result<(), TillerError> {
        let entry = self.entry(id).await?;
        entry.touch();
        entry.handle.send_user_message(text);
        Ok(())
    }

    pub async fn confirm(&self, id: &str, action_id: u64, accept: bool) -> Result<(), TillerError> {
        let entry = self.entry(id).await?;
        entry.touch();
        entry.handle.confirm(action_id, accept);
        Ok(())
    }

    pub async fn pause(&self, id: &str) -> Result<(), TillerError> {
        let entry = self.entry(id).await?;
        entry.touch();
        entry.handle.pause();
        if let Err(err) = entry.runtime.pause().await {
            if !matches!(err, RuntimeError::NotSupported(_)) {
                warn!(conversation_id = %id, error = %err, "runtime pause failed");
            }
        }
        Ok(())
    }

    pub async fn resume(&self, id: &str) -> Result<(), TillerError> {
        let entry = self.entry(id).await?;
        entry.touch();
        if let Err(err) = entry.runtime.resume().await {
            if !matches!(err, RuntimeError::NotSupported(_)) {
                warn!(conversation_id = %id, error = %err, "runtime resume failed");
            }
        }
        entry.handle.resume();
        Ok(())
    }

    pub async fn stop(&self, id: &str) -> Result<(), TillerError> {
        let entry = self.entry(id).await?;
        entry.touch();
        entry.handle.stop();
        Ok(())
    }

    /// Stop, drain the controller, close the runtime, then the stream.
    pub async fn close(&self, id: &str) -> Result<(), TillerError> {
        let entry = self.entry(id).await?;
        entry.handle.stop();
        let task = entry.task.lock().await.take();
        if let Some(task) = task {
            match tokio::time::timeout(Duration::from_secs(10), task).await {
                Ok(Ok(state)) => {
                    info!(
                        conversation_id = %id,
                        final_state = state.agent_state.as_str(),
                        "controller drained"
                    );
                }
                Ok(Err(err)) => warn!(conversation_id = %id, error = %err, "controller task failed"),
                Err(_) => warn!(conversation_id = %id, "controller drain timed out"),
            }
        }
        entry.runtime.close().await;
        if let Some(path) = self.config.core.save_trajectory_path.clone() {
            if let Err(err) = save_trajectory(&entry.stream, &path).await {
                warn!(conversation_id = %id, error = %err, "trajectory save failed");
            }
        }
        entry.stream.close().await;
        self.active.write().await.remove(id);
        Ok(())
    }

    pub async fn close_all(&self) {
        let ids = self.active.read().await.keys().cloned().collect::<Vec<_>>();
        for id in ids {
            let _ = self.close(&id).await;
        }
    }

    pub async fn attach_subscriber(
        &self,
        id: &str,
        name: &str,
        callback: SubscriberCallback,
        start_id: Option<u64>,
    ) -> Result<(), TillerError> {
        let entry = self.entry(id).await?;
        entry.stream.subscribe(name, callback, start_id).await;
        Ok(())
    }

    pub async fn detach_subscriber(&self, id: &str, name: &str) -> Result<(), TillerError> {
        let entry = self.entry(id).await?;
        entry.stream.unsubscribe(name).await;
        Ok(())
    }

    pub async fn events(
        &self,
        id: &str,
        start_id: u64,
        end_id: Option<u64>,
    ) -> Result<Vec<Event>, TillerError> {
        let entry = self.entry(id).await?;
        Ok(entry.stream.get_events(start_id, end_id, None).await)
    }

    pub async fn list_files(&self, id: &str, path: Option<&str>) -> Result<Vec<String>, TillerError> {
        let entry = self.entry(id).await?;
        entry
            .runtime
            .list_files(path)
            .await
            .map_err(|err| TillerError::Execution(err.to_string()))
    }

    pub async fn get_file(&self, id: &str, path: &str) -> Result<Vec<u8>, TillerError> {
        let entry = self.entry(id).await?;
        entry
            .runtime
            .get_file(path)
            .await
            .map_err(|err| TillerError::Execution(err.to_string()))
    }

    pub async fn vscode_url(&self, id: &str) -> Result<Option<String>, TillerError> {
        let entry = self.entry(id).await?;
        Ok(entry.runtime.vscode_url())
    }

    pub async fn get_trajectory(&self, id: &str) -> Result<Trajectory, TillerError> {
        let entry = self.entry(id).await?;
        let events = entry
            .runtime
            .get_trajectory()
            .await
            .map_err(|err| TillerError::Execution(err.to_string()))?;
        Ok(Trajectory {
            session_id: id.to_string(),
            events,
        })
    }

    pub async fn wait_terminal(&self, id: &str) -> Result<AgentState, TillerError> {
        let entry = self.entry(id).await?;
        Ok(entry.handle.wait_terminal().await)
    }

    /// One pass of the idle/retention policy: idle running conversations are
    /// paused, terminal ones past retention are closed.
    pub async fn sweep_once(&self) {
        let idle_after = Duration::from_secs(self.config.core.idle_timeout_secs);
        let retire_after = Duration::from_secs(self.config.core.retention_secs);
        let entries = self
            .active
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        for entry in entries {
            let state = entry.handle.agent_state();
            let idle = entry.idle_for();
            if state.is_terminal() && idle >= retire_after {
                info!(conversation_id = %entry.id, "retiring terminal conversation");
                let _ = self.close(&entry.id).await;
            } else if state == AgentState::Running && idle >= idle_after {
                info!(conversation_id = %entry.id, "pausing idle conversation");
                let _ = self.pause(&entry.id).await;
            }
        }
    }
}

/// Background loop the server spawns; cadence is coarse on purpose.
pub async fn run_sweeper(manager: Arc<ConversationManager>) {
    loop {
        tokio::time::sleep(Duration::from_secs(30)).await;
        manager.sweep_once().await;
    }
}

/// Re-append a recorded trajectory as the stream prefix. Ids are freshly
/// assigned; cause pointers are remapped so pairs stay linked.
async fn replay_trajectory(stream: &Arc<EventStream>, path: &str) -> anyhow::Result<()> {
    let raw = tokio::fs::read_to_string(path).await?;
    let events = match serde_json::from_str::<Trajectory>(&raw) {
        Ok(trajectory) => trajectory.events,
        Err(_) => serde_json::from_str::<Vec<Event>>(&raw)?,
    };
    let mut id_map: HashMap<u64, u64> = HashMap::new();
    for event in events {
        let old_id = event.id;
        let mut replayed = event;
        replayed.cause = match replayed.cause {
            Some(old_cause) => Some(
                id_map
                    .get(&old_cause)
                    .copied()
                    .ok_or_else(|| anyhow::anyhow!("trajectory cause {old_cause} precedes its action"))?,
            ),
            None => None,
        };
        let new_id = stream.append(replayed).await?;
        id_map.insert(old_id, new_id);
    }
    Ok(())
}

async fn save_trajectory(stream: &Arc<EventStream>, path: &str) -> anyhow::Result<()> {
    let trajectory = Trajectory {
        session_id: stream.session_id().to_string(),
        events: stream.get_events(0, None, None).await,
    };
    let target = std::path::Path::new(path);
    let file = if path.ends_with(".json") {
        target.to_path_buf()
    } else {
        tokio::fs::create_dir_all(target).await?;
        target.join(format!("{}.json", sanitize_id(stream.session_id())))
    };
    if let Some(parent) = file.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let raw = serde_json::to_vec_pretty(&trajectory)?;
    tokio::fs::write(&file, raw).await?;
    Ok(())
}

fn sanitize_id(id: &str) -> String {
    id.replace(['/', '\\'], "_")
}
