use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use ignore::WalkBuilder;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::Mutex;

use tiller_types::{Action, ErrorKind, Event, Observation};

use crate::{check_dispatchable, EventLog, ExecutionContext, Runtime, RuntimeConfig, RuntimeError, RuntimePhase};

const MAX_CAPTURED_OUTPUT: usize = 64 * 1024;

/// In-process runtime rooted at a workspace directory. Shell commands run
/// through `/bin/sh`; file operations stay inside the workspace root.
pub struct LocalRuntime {
    session_id: String,
    workspace_root: PathBuf,
    default_timeout: Duration,
    allowed_actions: Option<Vec<String>>,
    startup_env: std::collections::BTreeMap<String, String>,
    event_log: Option<Arc<dyn EventLog>>,
    phase: Mutex<RuntimePhase>,
}

impl LocalRuntime {
    pub fn new(config: RuntimeConfig, session_id: String) -> Self {
        Self {
            session_id,
            workspace_root: config.workspace_root,
            default_timeout: config.default_timeout,
            allowed_actions: config.allowed_actions,
            startup_env: config.startup_env,
            event_log: config.event_log,
            phase: Mutex::new(RuntimePhase::Created),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, Observation> {
        let candidate = Path::new(path);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.workspace_root.join(candidate)
        };
        if !is_within_root(&joined, &self.workspace_root) {
            return Err(Observation::error(
                ErrorKind::Execution,
                format!("path `{path}` escapes the workspace root"),
            ));
        }
        Ok(joined)
    }

    async fn run_command(
        &self,
        command: &str,
        cwd: Option<&str>,
        env: &std::collections::BTreeMap<String, String>,
        timeout: Duration,
        ctx: &ExecutionContext,
    ) -> Result<Observation, RuntimeError> {
        let cwd = match cwd {
            Some(dir) => match self.resolve(dir) {
                Ok(dir) => dir,
                Err(observation) => return Ok(observation),
            },
            None => self.workspace_root.clone(),
        };

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.startup_env {
            cmd.env(key, value);
        }
        for (key, value) in env {
            cmd.env(key, value);
        }

        tracing::debug!(
            session_id = %self.session_id,
            command = %tiller_observability::redact_secrets(command),
            "running shell command"
        );
        let mut child = cmd
            .spawn()
            .map_err(|err| RuntimeError::Internal(format!("spawn failed: {err}")))?;
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let output = async {
            // Both pipes drain concurrently; draining one at a time can
            // deadlock once the other pipe's buffer fills.
            let stdout_fut = async {
                let mut stdout = Vec::new();
                if let Some(pipe) = stdout_pipe.as_mut() {
                    let _ = pipe.read_to_end(&mut stdout).await;
                }
                stdout
            };
            let stderr_fut = async {
                let mut stderr = Vec::new();
                if let Some(pipe) = stderr_pipe.as_mut() {
                    let _ = pipe.read_to_end(&mut stderr).await;
                }
                stderr
            };
            let (stdout, stderr) = tokio::join!(stdout_fut, stderr_fut);
            let status = child.wait().await;
            (status, stdout, stderr)
        };

        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                Ok(Observation::error(ErrorKind::Execution, "command cancelled"))
            }
            result = tokio::time::timeout(timeout, output) => match result {
                Err(_) => Ok(Observation::error(
                    ErrorKind::Timeout,
                    format!("command timed out after {}s", timeout.as_secs()),
                )),
                Ok((Err(err), _, _)) => {
                    Err(RuntimeError::Internal(format!("wait failed: {err}")))
                }
                Ok((Ok(status), stdout, stderr)) => {
                    let (stdout, out_truncated) = clip(stdout);
                    let (stderr, err_truncated) = clip(stderr);
                    Ok(Observation::RunOutput {
                        exit_code: status.code().map(i64::from).unwrap_or(-1),
                        stdout,
                        stderr,
                        truncated: out_truncated || err_truncated,
                    })
                }
            }
        }
    }

    async fn read_file(&self, path: &str) -> Observation {
        let resolved = match self.resolve(path) {
            Ok(resolved) => resolved,
            Err(observation) => return observation,
        };
        match fs::read_to_string(&resolved).await {
            Ok(content) => Observation::FileContent {
                path: path.to_string(),
                content,
            },
            Err(err) => Observation::error(
                ErrorKind::Execution,
                format!("cannot read `{path}`: {err}"),
            ),
        }
    }

    async fn write_file(&self, path: &str, content: &str) -> Observation {
        let resolved = match self.resolve(path) {
            Ok(resolved) => resolved,
            Err(observation) => return observation,
        };
        if let Some(parent) = resolved.parent() {
            if let Err(err) = fs::create_dir_all(parent).await {
                return Observation::error(
                    ErrorKind::Execution,
                    format!("cannot create parent of `{path}`: {err}"),
                );
            }
        }
        match fs::write(&resolved, content).await {
            Ok(()) => Observation::FileWritten {
                path: path.to_string(),
                bytes_written: content.len() as u64,
            },
            Err(err) => Observation::error(
                ErrorKind::Execution,
                format!("cannot write `{path}`: {err}"),
            ),
        }
    }

    /// Byte-range edit: replace `[start, end)` with the replacement. With no
    /// range the whole file is replaced.
    async fn edit_file(
        &self,
        path: &str,
        start: Option<u64>,
        end: Option<u64>,
        replacement: &str,
    ) -> Observation {
        let resolved = match self.resolve(path) {
            Ok(resolved) => resolved,
            Err(observation) => return observation,
        };
        let existing = match fs::read(&resolved).await {
            Ok(bytes) => bytes,
            Err(err) => {
                return Observation::error(
                    ErrorKind::Execution,
                    format!("cannot read `{path}` for edit: {err}"),
                )
            }
        };
        let len = existing.len() as u64;
        let start = start.unwrap_or(0).min(len) as usize;
        let end = end.unwrap_or(len).min(len) as usize;
        if end < start {
            return Observation::error(
                ErrorKind::Execution,
                format!("invalid byte range {start}..{end} for `{path}`"),
            );
        }
        let mut updated = Vec::with_capacity(existing.len() + replacement.len());
        updated.extend_from_slice(&existing[..start]);
        updated.extend_from_slice(replacement.as_bytes());
        updated.extend_from_slice(&existing[end..]);
        match fs::write(&resolved, &updated).await {
            Ok(()) => Observation::FileWritten {
                path: path.to_string(),
                bytes_written: updated.len() as u64,
            },
            Err(err) => Observation::error(
                ErrorKind::Execution,
                format!("cannot write `{path}`: {err}"),
            ),
        }
    }
}

#[async_trait::async_trait]
impl Runtime for LocalRuntime {
    fn id(&self) -> &str {
        "local"
    }

    async fn connect(&self) -> Result<(), RuntimeError> {
        let mut phase = self.phase.lock().await;
        match *phase {
            RuntimePhase::Ready => return Ok(()),
            RuntimePhase::Closing | RuntimePhase::Closed => {
                return Err(RuntimeError::Unavailable("runtime is closed".to_string()))
            }
            RuntimePhase::Created | RuntimePhase::Connecting => {}
        }
        *phase = RuntimePhase::Connecting;
        if let Err(err) = fs::create_dir_all(&self.workspace_root).await {
            *phase = RuntimePhase::Created;
            return Err(RuntimeError::Unavailable(format!(
                "cannot prepare workspace {:?}: {err}",
                self.workspace_root
            )));
        }
        *phase = RuntimePhase::Ready;
        Ok(())
    }

    async fn run_action(
        &self,
        event: &Event,
        ctx: &ExecutionContext,
    ) -> Result<Observation, RuntimeError> {
        {
            let phase = self.phase.lock().await;
            if *phase != RuntimePhase::Ready {
                return Err(RuntimeError::Unavailable(format!(
                    "runtime not ready (phase {:?})",
                    *phase
                )));
            }
        }
        let action = event
            .as_action()
            .ok_or_else(|| RuntimeError::Internal("dispatched event is not an action".to_string()))?;
        check_dispatchable(event, action, self.allowed_actions.as_deref(), ctx.confirmation_required)?;

        match action {
            Action::Run {
                command,
                cwd,
                env,
                timeout_secs,
                stream_output: _,
            } => {
                let timeout = timeout_secs
                    .map(Duration::from_secs)
                    .map(|requested| requested.min(ctx.timeout))
                    .unwrap_or(ctx.timeout);
                self.run_command(command, cwd.as_deref(), env, timeout, ctx).await
            }
            Action::Read { path } => Ok(self.read_file(path).await),
            Action::Write { path, content } => Ok(self.write_file(path, content).await),
            Action::Edit {
                path,
                start,
                end,
                replacement,
            } => Ok(self.edit_file(path, *start, *end, replacement).await),
            Action::Browse { .. } => Ok(Observation::error(
                ErrorKind::NotSupported,
                "browser plugin is not available in the local runtime",
            )),
            Action::Ipython { .. } => Ok(Observation::error(
                ErrorKind::NotSupported,
                "ipython plugin is not available in the local runtime",
            )),
            other => Err(RuntimeError::Internal(format!(
                "control action `{}` reached the runtime",
                other.kind()
            ))),
        }
    }

    async fn close(&self) {
        let mut phase = self.phase.lock().await;
        *phase = RuntimePhase::Closed;
    }

    async fn list_files(&self, path: Option<&str>) -> anyhow::Result<Vec<String>> {
        let base = match path {
            Some(path) => self
                .resolve(path)
                .map_err(|_| anyhow::anyhow!("path `{path}` escapes the workspace root"))?,
            None => self.workspace_root.clone(),
        };
        let root = self.workspace_root.clone();
        let files = tokio::task::spawn_blocking(move || {
            let mut files = Vec::new();
            for entry in WalkBuilder::new(&base).hidden(false).build().flatten() {
                let entry_path = entry.path();
                if entry_path.is_dir() {
                    continue;
                }
                if let Ok(rel) = entry_path.strip_prefix(&root) {
                    files.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
            files.sort();
            files
        })
        .await
        .context("file walk task failed")?;
        Ok(files)
    }

    async fn get_file(&self, path: &str) -> anyhow::Result<Vec<u8>> {
        let resolved = self
            .resolve(path)
            .map_err(|_| anyhow::anyhow!("path `{path}` escapes the workspace root"))?;
        fs::read(&resolved)
            .await
            .with_context(|| format!("cannot read `{path}`"))
    }

    async fn get_trajectory(&self) -> anyhow::Result<Vec<Event>> {
        match &self.event_log {
            Some(log) => Ok(log.events().await),
            None => Ok(Vec::new()),
        }
    }
}

fn clip(bytes: Vec<u8>) -> (String, bool) {
    let truncated = bytes.len() > MAX_CAPTURED_OUTPUT;
    let slice = if truncated {
        &bytes[..MAX_CAPTURED_OUTPUT]
    } else {
        &bytes[..]
    };
    (String::from_utf8_lossy(slice).to_string(), truncated)
}

fn is_within_root(candidate: &Path, root: &Path) -> bool {
    let mut normalized = PathBuf::new();
    for component in candidate.components() {
        match component {
            std::path::Component::ParentDir => {
                if !normalized.pop() {
                    return false;
                }
            }
            std::path::Component::CurDir => {}
            other => normalized.push(other),
        }
    }
    normalized.starts_with(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tiller_types::EventSource;
    use tokio_util::sync::CancellationToken;

    fn runtime_in(dir: &Path) -> LocalRuntime {
        LocalRuntime::new(
            RuntimeConfig {
                workspace_root: dir.to_path_buf(),
                default_timeout: Duration::from_secs(10),
                allowed_actions: None,
                startup_env: BTreeMap::new(),
                event_log: None,
            },
            "ses_test".to_string(),
        )
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext {
            timeout: Duration::from_secs(10),
            cancel: CancellationToken::new(),
            confirmation_required: false,
        }
    }

    fn action_event(action: Action) -> Event {
        let mut event = Event::action(EventSource::Agent, action);
        event.id = 1;
        event
    }

    #[tokio::test]
    async fn shell_commands_capture_stdout_and_exit_code() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runtime = runtime_in(dir.path());
        runtime.connect().await.expect("connect");

        let event = action_event(Action::Run {
            command: "echo hi".to_string(),
            cwd: None,
            env: BTreeMap::new(),
            timeout_secs: None,
            stream_output: false,
        });
        let observation = runtime.run_action(&event, &ctx()).await.expect("run");
        match observation {
            Observation::RunOutput {
                exit_code, stdout, ..
            } => {
                assert_eq!(exit_code, 0);
                assert_eq!(stdout, "hi\n");
            }
            other => panic!("expected run output, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_value_not_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runtime = runtime_in(dir.path());
        runtime.connect().await.expect("connect");

        let event = action_event(Action::Run {
            command: "exit 3".to_string(),
            cwd: None,
            env: BTreeMap::new(),
            timeout_secs: None,
            stream_output: false,
        });
        let observation = runtime.run_action(&event, &ctx()).await.expect("run");
        match observation {
            Observation::RunOutput { exit_code, .. } => assert_eq!(exit_code, 3),
            other => panic!("expected run output, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn timeouts_become_timeout_observations() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runtime = runtime_in(dir.path());
        runtime.connect().await.expect("connect");

        let event = action_event(Action::Run {
            command: "sleep 5".to_string(),
            cwd: None,
            env: BTreeMap::new(),
            timeout_secs: Some(1),
            stream_output: false,
        });
        let started = std::time::Instant::now();
        let observation = runtime.run_action(&event, &ctx()).await.expect("run");
        assert!(started.elapsed() < Duration::from_secs(4));
        match observation {
            Observation::Error { error_kind, .. } => assert_eq!(error_kind, ErrorKind::Timeout),
            other => panic!("expected timeout error, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn file_roundtrip_and_byte_range_edit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runtime = runtime_in(dir.path());
        runtime.connect().await.expect("connect");

        let write = action_event(Action::Write {
            path: "notes/hello.txt".to_string(),
            content: "hello world".to_string(),
        });
        runtime.run_action(&write, &ctx()).await.expect("write");

        let edit = action_event(Action::Edit {
            path: "notes/hello.txt".to_string(),
            start: Some(6),
            end: Some(11),
            replacement: "tiller".to_string(),
        });
        runtime.run_action(&edit, &ctx()).await.expect("edit");

        let read = action_event(Action::Read {
            path: "notes/hello.txt".to_string(),
        });
        let observation = runtime.run_action(&read, &ctx()).await.expect("read");
        match observation {
            Observation::FileContent { content, .. } => assert_eq!(content, "hello tiller"),
            other => panic!("expected file content, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn paths_cannot_escape_the_workspace() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runtime = runtime_in(dir.path());
        runtime.connect().await.expect("connect");

        let read = action_event(Action::Read {
            path: "../outside.txt".to_string(),
        });
        let observation = runtime.run_action(&read, &ctx()).await.expect("read");
        match observation {
            Observation::Error { error_kind, .. } => {
                assert_eq!(error_kind, ErrorKind::Execution)
            }
            other => panic!("expected error observation, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn browser_actions_report_missing_plugin() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runtime = runtime_in(dir.path());
        runtime.connect().await.expect("connect");

        let browse = action_event(Action::Browse {
            op: tiller_types::BrowseOp::Snapshot,
        });
        let observation = runtime.run_action(&browse, &ctx()).await.expect("browse");
        match observation {
            Observation::Error { error_kind, .. } => {
                assert_eq!(error_kind, ErrorKind::NotSupported)
            }
            other => panic!("expected not_supported, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn closed_runtime_refuses_actions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runtime = runtime_in(dir.path());
        runtime.connect().await.expect("connect");
        runtime.close().await;

        let read = action_event(Action::Read {
            path: "a.txt".to_string(),
        });
        let err = runtime.run_action(&read, &ctx()).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Unavailable(_)));
        assert!(runtime.connect().await.is_err());
    }

    #[tokio::test]
    async fn list_files_walks_the_workspace() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runtime = runtime_in(dir.path());
        runtime.connect().await.expect("connect");
        fs::create_dir_all(dir.path().join("src")).await.expect("mkdir");
        fs::write(dir.path().join("src/main.rs"), "fn main() {}")
            .await
            .expect("write");
        fs::write(dir.path().join("README.md"), "# hi").await.expect("write");

        let files = runtime.list_files(None).await.expect("list");
        assert_eq!(files, vec!["README.md".to_string(), "src/main.rs".to_string()]);
    }
}
