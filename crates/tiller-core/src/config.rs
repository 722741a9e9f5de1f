use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use tiller_types::SecurityRisk;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Runtime implementation tag (`local`, `docker`, ...).
    pub runtime: String,
    pub default_agent: String,
    pub max_iterations: u32,
    /// 0 = unlimited.
    pub max_budget_per_task: f64,
    pub file_store: String,
    pub file_store_path: String,
    pub save_trajectory_path: Option<String>,
    pub replay_trajectory_path: Option<String>,
    /// When set, the agent's view keeps only this many recent events and
    /// condenses the rest. `None` disables condensation.
    pub history_window: Option<usize>,
    pub max_concurrent_conversations: usize,
    pub max_conversations_per_user: usize,
    pub idle_timeout_secs: u64,
    pub retention_secs: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            runtime: "local".to_string(),
            default_agent: "echo".to_string(),
            max_iterations: 100,
            max_budget_per_task: 0.0,
            file_store: "local".to_string(),
            file_store_path: default_store_path(),
            save_trajectory_path: None,
            replay_trajectory_path: None,
            history_window: None,
            max_concurrent_conversations: 16,
            max_conversations_per_user: 4,
            idle_timeout_secs: 900,
            retention_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub base_container_image: Option<String>,
    pub runtime_container_image: Option<String>,
    /// Default per-action timeout in seconds.
    pub timeout: u64,
    /// `host:guest[:mode]` mount items.
    pub volumes: Vec<String>,
    pub runtime_extra_deps: Option<String>,
    pub runtime_startup_env_vars: BTreeMap<String, String>,
    pub platform: Option<String>,
    pub workspace_root: Option<String>,
    /// Action-kind allowlist; `None` permits every kind.
    pub allowed_actions: Option<Vec<String>>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            base_container_image: None,
            runtime_container_image: None,
            timeout: 120,
            volumes: Vec::new(),
            runtime_extra_deps: None,
            runtime_startup_env_vars: BTreeMap::new(),
            platform: None,
            workspace_root: None,
            allowed_actions: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub confirmation_mode: bool,
    /// Analyzer tag; absent = no analyzer.
    pub security_analyzer: Option<String>,
    pub risk_threshold: SecurityRisk,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            confirmation_mode: false,
            security_analyzer: None,
            risk_threshold: SecurityRisk::Medium,
        }
    }
}

/// Consumed by the LLM collaborator; carried here as pass-through only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub api_version: Option<String>,
    pub num_retries: u32,
    pub retry_min_wait: u64,
    pub retry_max_wait: u64,
    pub retry_multiplier: f64,
    pub max_input_tokens: Option<u64>,
    pub max_output_tokens: Option<u64>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub caching_prompt: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: None,
            api_key: None,
            base_url: None,
            api_version: None,
            num_retries: 4,
            retry_min_wait: 1,
            retry_max_wait: 30,
            retry_multiplier: 2.0,
            max_input_tokens: None,
            max_output_tokens: None,
            temperature: None,
            top_p: None,
            caching_prompt: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TillerConfig {
    pub core: CoreConfig,
    pub sandbox: SandboxConfig,
    pub security: SecurityConfig,
    pub llm: LlmConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub host: String,
    pub guest: String,
    pub mode: String,
}

impl TillerConfig {
    /// Layered resolution: file -> environment -> caller overrides, merged
    /// deep, later layers winning. Validation failures are configuration
    /// errors, fatal for whatever is being created.
    pub fn load(path: Option<&Path>, overrides: Option<Value>) -> anyhow::Result<Self> {
        let mut merged = serde_json::to_value(TillerConfig::default())?;
        if let Some(path) = path {
            let raw = std::fs::read_to_string(path)
                .map_err(|err| anyhow::anyhow!("cannot read config file {path:?}: {err}"))?;
            let file_layer: Value = serde_json::from_str(&raw)
                .map_err(|err| anyhow::anyhow!("invalid config file {path:?}: {err}"))?;
            deep_merge(&mut merged, file_layer);
        }
        deep_merge(&mut merged, env_layer());
        if let Some(overrides) = overrides {
            deep_merge(&mut merged, overrides);
        }
        let config: TillerConfig = serde_json::from_value(merged)
            .map_err(|err| anyhow::anyhow!("invalid configuration: {err}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.core.runtime.trim().is_empty() {
            anyhow::bail!("core.runtime must not be empty");
        }
        if self.core.default_agent.trim().is_empty() {
            anyhow::bail!("core.default_agent must not be empty");
        }
        if !matches!(self.core.file_store.as_str(), "local" | "memory") {
            anyhow::bail!("unknown core.file_store `{}`", self.core.file_store);
        }
        if self.core.max_budget_per_task < 0.0 {
            anyhow::bail!("core.max_budget_per_task must not be negative");
        }
        for raw in &self.sandbox.volumes {
            parse_volume(raw)?;
        }
        Ok(())
    }

    pub fn volume_mounts(&self) -> anyhow::Result<Vec<VolumeMount>> {
        self.sandbox.volumes.iter().map(|raw| parse_volume(raw)).collect()
    }
}

pub fn parse_volume(raw: &str) -> anyhow::Result<VolumeMount> {
    let parts = raw.split(':').collect::<Vec<_>>();
    match parts.as_slice() {
        [host, guest] if !host.is_empty() && !guest.is_empty() => Ok(VolumeMount {
            host: host.to_string(),
            guest: guest.to_string(),
            mode: "rw".to_string(),
        }),
        [host, guest, mode]
            if !host.is_empty() && !guest.is_empty() && matches!(*mode, "ro" | "rw") =>
        {
            Ok(VolumeMount {
                host: host.to_string(),
                guest: guest.to_string(),
                mode: mode.to_string(),
            })
        }
        _ => anyhow::bail!("invalid volume spec `{raw}`, expected host:guest[:mode]"),
    }
}

fn default_store_path() -> String {
    dirs::data_dir()
        .map(|dir| dir.join("tiller").display().to_string())
        .unwrap_or_else(|| ".tiller".to_string())
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Environment variables mirror config keys with a section prefix:
/// `CORE_*`, `SANDBOX_*`, `SECURITY_*`, `LLM_*`. Environment values override
/// file values; front-door overrides beat both.
fn env_layer() -> Value {
    let mut root = empty_object();

    set_env_str(&mut root, "core", "runtime", "CORE_RUNTIME");
    set_env_str(&mut root, "core", "default_agent", "CORE_DEFAULT_AGENT");
    set_env_u64(&mut root, "core", "max_iterations", "CORE_MAX_ITERATIONS");
    set_env_f64(&mut root, "core", "max_budget_per_task", "CORE_MAX_BUDGET_PER_TASK");
    set_env_str(&mut root, "core", "file_store", "CORE_FILE_STORE");
    set_env_str(&mut root, "core", "file_store_path", "CORE_FILE_STORE_PATH");
    set_env_str(&mut root, "core", "save_trajectory_path", "CORE_SAVE_TRAJECTORY_PATH");
    set_env_str(
        &mut root,
        "core",
        "replay_trajectory_path",
        "CORE_REPLAY_TRAJECTORY_PATH",
    );
    set_env_u64(
        &mut root,
        "core",
        "max_concurrent_conversations",
        "CORE_MAX_CONCURRENT_CONVERSATIONS",
    );

    set_env_str(
        &mut root,
        "sandbox",
        "base_container_image",
        "SANDBOX_BASE_CONTAINER_IMAGE",
    );
    set_env_str(
        &mut root,
        "sandbox",
        "runtime_container_image",
        "SANDBOX_RUNTIME_CONTAINER_IMAGE",
    );
    set_env_u64(&mut root, "sandbox", "timeout", "SANDBOX_TIMEOUT");
    set_env_str(&mut root, "sandbox", "platform", "SANDBOX_PLATFORM");
    set_env_str(&mut root, "sandbox", "workspace_root", "SANDBOX_WORKSPACE_ROOT");
    set_env_str(
        &mut root,
        "sandbox",
        "runtime_extra_deps",
        "SANDBOX_RUNTIME_EXTRA_DEPS",
    );
    if let Ok(raw) = std::env::var("SANDBOX_VOLUMES") {
        let volumes = parse_csv(&raw);
        if !volumes.is_empty() {
            deep_merge(&mut root, json!({ "sandbox": { "volumes": volumes } }));
        }
    }

    if let Ok(raw) = std::env::var("SECURITY_CONFIRMATION_MODE") {
        if let Some(enabled) = parse_bool_like(&raw) {
            deep_merge(
                &mut root,
                json!({ "security": { "confirmation_mode": enabled } }),
            );
        }
    }
    set_env_str(
        &mut root,
        "security",
        "security_analyzer",
        "SECURITY_SECURITY_ANALYZER",
    );
    set_env_str(&mut root, "security", "risk_threshold", "SECURITY_RISK_THRESHOLD");

    set_env_str(&mut root, "llm", "model", "LLM_MODEL");
    set_env_str(&mut root, "llm", "api_key", "LLM_API_KEY");
    set_env_str(&mut root, "llm", "base_url", "LLM_BASE_URL");
    set_env_str(&mut root, "llm", "api_version", "LLM_API_VERSION");
    set_env_u64(&mut root, "llm", "num_retries", "LLM_NUM_RETRIES");
    set_env_u64(&mut root, "llm", "retry_min_wait", "LLM_RETRY_MIN_WAIT");
    set_env_u64(&mut root, "llm", "retry_max_wait", "LLM_RETRY_MAX_WAIT");
    set_env_f64(&mut root, "llm", "retry_multiplier", "LLM_RETRY_MULTIPLIER");
    set_env_u64(&mut root, "llm", "max_input_tokens", "LLM_MAX_INPUT_TOKENS");
    set_env_u64(&mut root, "llm", "max_output_tokens", "LLM_MAX_OUTPUT_TOKENS");
    set_env_f64(&mut root, "llm", "temperature", "LLM_TEMPERATURE");
    set_env_f64(&mut root, "llm", "top_p", "LLM_TOP_P");

    root
}

fn set_env_str(root: &mut Value, section: &str, key: &str, env: &str) {
    if let Ok(value) = std::env::var(env) {
        if !value.trim().is_empty() {
            deep_merge(root, json!({ section: { key: value } }));
        }
    }
}

fn set_env_u64(root: &mut Value, section: &str, key: &str, env: &str) {
    if let Ok(raw) = std::env::var(env) {
        if let Ok(value) = raw.trim().parse::<u64>() {
            deep_merge(root, json!({ section: { key: value } }));
        }
    }
}

fn set_env_f64(root: &mut Value, section: &str, key: &str, env: &str) {
    if let Ok(raw) = std::env::var(env) {
        if let Ok(value) = raw.trim().parse::<f64>() {
            deep_merge(root, json!({ section: { key: value } }));
        }
    }
}

fn parse_bool_like(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Overlay a config layer onto an accumulated one. Objects merge key by key
/// through the map's entry API (the overlay is consumed, nothing is cloned),
/// null never overwrites, and any other value replaces its slot wholesale.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match overlay {
        Value::Null => {}
        Value::Object(incoming) => {
            if let Value::Object(target) = base {
                for (key, value) in incoming {
                    if value.is_null() {
                        continue;
                    }
                    match target.entry(key) {
                        serde_json::map::Entry::Occupied(mut slot) => {
                            deep_merge(slot.get_mut(), value)
                        }
                        serde_json::map::Entry::Vacant(slot) => {
                            slot.insert(value);
                        }
                    }
                }
            } else {
                *base = Value::Object(incoming);
            }
        }
        other => *base = other,
    }
}

pub fn resolve_state_dir(explicit: Option<&str>) -> PathBuf {
    if let Some(dir) = explicit {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("TILLER_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    PathBuf::from(default_store_path())
}
