use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use tiller_core::{resolve_state_dir, ConversationManager, SubscriberCallback, TillerConfig};
use tiller_observability::{init_logging, ProcessKind};
use tiller_server::{serve, AppState};
use tiller_types::{AgentState, CreateConversationRequest, Event, Observation, TillerError};

const EXIT_FINISHED: i32 = 0;
const EXIT_CAPPED: i32 = 2;
const EXIT_ERROR: i32 = 3;
const EXIT_CONFIG: i32 = 4;
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser, Debug)]
#[command(name = "tiller-engine")]
#[command(about = "Headless Tiller agent runtime")]
struct Cli {
    /// Optional JSON config file; environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP engine service.
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 3000)]
        port: u16,
        #[arg(long)]
        state_dir: Option<String>,
    },
    /// Drive a single task to a terminal state and exit.
    Run {
        /// Initial task text for the agent.
        task: String,
        #[arg(long)]
        agent: Option<String>,
        #[arg(long)]
        max_iterations: Option<u32>,
        #[arg(long)]
        state_dir: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match cli.command {
        Command::Serve {
            hostname,
            port,
            state_dir,
        } => run_serve(cli.config.as_deref(), hostname, port, state_dir).await,
        Command::Run {
            task,
            agent,
            max_iterations,
            state_dir,
        } => run_headless(cli.config.as_deref(), task, agent, max_iterations, state_dir).await,
    };
    std::process::exit(code);
}

async fn run_serve(
    config_path: Option<&Path>,
    hostname: String,
    port: u16,
    state_dir: Option<String>,
) -> i32 {
    let state_dir = resolve_state_dir(state_dir.as_deref());
    let config = match load_config(config_path, &state_dir) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return EXIT_CONFIG;
        }
    };
    let _log_guard = init_logging(ProcessKind::Engine, &state_dir.join("logs"), 14).ok();

    let manager = match ConversationManager::new(config) {
        Ok(manager) => manager,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return EXIT_CONFIG;
        }
    };
    let addr: SocketAddr = match format!("{hostname}:{port}")
        .parse()
        .context("invalid hostname or port")
    {
        Ok(addr) => addr,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return EXIT_CONFIG;
        }
    };
    info!(state_dir = %state_dir.display(), "starting tiller-engine on http://{addr}");
    match serve(addr, AppState::new(manager)).await {
        Ok(()) => EXIT_FINISHED,
        Err(err) => {
            eprintln!("server error: {err}");
            EXIT_ERROR
        }
    }
}

async fn run_headless(
    config_path: Option<&Path>,
    task: String,
    agent: Option<String>,
    max_iterations: Option<u32>,
    state_dir: Option<String>,
) -> i32 {
    let state_dir = resolve_state_dir(state_dir.as_deref());
    let config = match load_config(config_path, &state_dir) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return EXIT_CONFIG;
        }
    };
    let _log_guard = init_logging(ProcessKind::Headless, &state_dir.join("logs"), 14).ok();

    let manager = match ConversationManager::new(config) {
        Ok(manager) => manager,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return EXIT_CONFIG;
        }
    };

    let id = match manager
        .create(CreateConversationRequest {
            agent,
            initial_message: Some(task),
            max_iterations,
            ..Default::default()
        })
        .await
    {
        Ok(id) => id,
        Err(TillerError::Configuration(msg)) => {
            eprintln!("configuration error: {msg}");
            return EXIT_CONFIG;
        }
        Err(err) => {
            eprintln!("create failed: {err}");
            return EXIT_ERROR;
        }
    };

    // mirror observations to stdout so a headless run is followable
    let printer: SubscriberCallback = Arc::new(|event: Event| {
        Box::pin(async move {
            print_event(&event);
            Ok(())
        })
    });
    let _ = manager.attach_subscriber(&id, "headless", printer, Some(0)).await;

    let final_state = tokio::select! {
        state = manager.wait_terminal(&id) => state,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("interrupted; stopping conversation");
            let _ = manager.stop(&id).await;
            let _ = manager.close(&id).await;
            return EXIT_INTERRUPTED;
        }
    };
    let _ = manager.close(&id).await;

    match final_state {
        Ok(AgentState::Finished) => EXIT_FINISHED,
        Ok(AgentState::Stopped) => EXIT_CAPPED,
        Ok(_) => EXIT_ERROR,
        Err(err) => {
            eprintln!("wait failed: {err}");
            EXIT_ERROR
        }
    }
}

fn load_config(explicit: Option<&Path>, state_dir: &Path) -> anyhow::Result<TillerConfig> {
    let default_path = state_dir.join("config.json");
    let path = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None if default_path.exists() => Some(default_path),
        None => None,
    };
    TillerConfig::load(path.as_deref(), None)
}

fn print_event(event: &Event) {
    match event.as_observation() {
        Some(Observation::RunOutput {
            exit_code, stdout, ..
        }) => {
            println!("[{}] exit={exit_code}", event.id);
            if !stdout.is_empty() {
                print!("{stdout}");
            }
        }
        Some(Observation::Error { error_kind, message }) => {
            println!("[{}] error {}: {message}", event.id, error_kind.as_str());
        }
        Some(Observation::LimitReached { detail, .. }) => {
            println!("[{}] limit reached: {detail}", event.id);
        }
        _ => {
            println!("[{}] {}", event.id, event.kind());
        }
    }
}
