//! Structured logging for the Tiller engine.
//!
//! Lifecycle milestones (conversation created, action dispatched, controller
//! terminal) are emitted as one typed event each; the severity is a property
//! of the event, not something call sites pick. Shell command text is passed
//! through [`redact_secrets`] before it may reach a log line.

use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};

use regex::Regex;
use serde::Serialize;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Engine,
    Headless,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Engine => "engine",
            ProcessKind::Headless => "headless",
        }
    }
}

/// One lifecycle milestone. Serialized whole into the log record, so the
/// jsonl sink carries exactly the fields each milestone actually has.
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ObsEvent<'a> {
    ConversationCreated {
        conversation_id: &'a str,
        agent: &'a str,
        runtime: &'a str,
    },
    DispatchStarted {
        conversation_id: &'a str,
        action_id: u64,
        action_kind: &'a str,
        runtime: &'a str,
    },
    DispatchFailed {
        conversation_id: &'a str,
        action_id: u64,
        action_kind: &'a str,
        runtime: &'a str,
        detail: &'a str,
    },
    ControllerTerminal {
        conversation_id: &'a str,
        state: &'a str,
        error_code: Option<&'a str>,
        detail: Option<&'a str>,
    },
}

impl ObsEvent<'_> {
    /// Severity follows from what happened: failed dispatches warn, a
    /// controller that died with an error code is an error, the rest is info.
    pub fn level(&self) -> Level {
        match self {
            ObsEvent::DispatchFailed { .. } => Level::WARN,
            ObsEvent::ControllerTerminal {
                error_code: Some(_),
                ..
            } => Level::ERROR,
            _ => Level::INFO,
        }
    }

    pub fn emit(&self, process: ProcessKind) {
        let payload = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        match self.level() {
            Level::ERROR => tracing::error!(
                target: "tiller::lifecycle",
                process = process.as_str(),
                %payload,
                "lifecycle"
            ),
            Level::WARN => tracing::warn!(
                target: "tiller::lifecycle",
                process = process.as_str(),
                %payload,
                "lifecycle"
            ),
            _ => tracing::info!(
                target: "tiller::lifecycle",
                process = process.as_str(),
                %payload,
                "lifecycle"
            ),
        }
    }
}

/// Masks secret-bearing fragments of a command line or env dump: `KEY=value`
/// assignments whose key looks like a credential, bearer headers, and
/// provider-token-shaped literals. Everything else passes through untouched.
pub fn redact_secrets(input: &str) -> String {
    static ASSIGNMENT: OnceLock<Regex> = OnceLock::new();
    static BEARER: OnceLock<Regex> = OnceLock::new();
    static TOKEN: OnceLock<Regex> = OnceLock::new();

    let assignment = ASSIGNMENT.get_or_init(|| {
        Regex::new(r"(?i)\b([A-Za-z0-9_-]*(?:key|token|secret|password|credential)[A-Za-z0-9_-]*)\s*=\s*\S+")
            .expect("valid builtin rule")
    });
    let bearer = BEARER.get_or_init(|| {
        Regex::new(r"(?i)\bbearer\s+[A-Za-z0-9._~+/=-]+").expect("valid builtin rule")
    });
    let token = TOKEN.get_or_init(|| {
        Regex::new(r"\b(?:sk|ghp|gho|glpat|xox[a-z])-[A-Za-z0-9-]{10,}\b")
            .expect("valid builtin rule")
    });

    let masked = assignment.replace_all(input, "$1=[redacted]");
    let masked = bearer.replace_all(&masked, "bearer [redacted]");
    token.replace_all(&masked, "[redacted]").into_owned()
}

/// Install the process-wide subscriber: a daily-rolling jsonl sink under
/// `logs_dir` plus a compact console layer, filtered by `RUST_LOG` with an
/// `info` fallback. Returns the guard that flushes the sink on drop.
pub fn init_logging(
    process: ProcessKind,
    logs_dir: &Path,
    keep_days: u32,
) -> anyhow::Result<WorkerGuard> {
    fs::create_dir_all(logs_dir)?;
    let retention = Duration::from_secs(u64::from(keep_days) * 24 * 60 * 60);
    if let Some(cutoff) = SystemTime::now().checked_sub(retention) {
        sweep_stale_logs(logs_dir, process, cutoff)?;
    }

    let appender =
        tracing_appender::rolling::daily(logs_dir, format!("tiller-{}", process.as_str()));
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false),
        )
        .with(tracing_subscriber::fmt::layer().compact())
        .try_init()
        .ok();

    Ok(guard)
}

/// Delete rolled files for this process last written before `cutoff`.
/// Judged by filesystem modification time, so rotated names never need
/// parsing. Returns how many files went away.
pub fn sweep_stale_logs(
    logs_dir: &Path,
    process: ProcessKind,
    cutoff: SystemTime,
) -> anyhow::Result<usize> {
    let prefix = format!("tiller-{}", process.as_str());
    let mut removed = 0;
    for entry in fs::read_dir(logs_dir)? {
        let Ok(entry) = entry else { continue };
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(&prefix) {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_file() {
            continue;
        }
        let Ok(modified) = meta.modified() else { continue };
        if modified < cutoff && fs::remove_file(entry.path()).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}
