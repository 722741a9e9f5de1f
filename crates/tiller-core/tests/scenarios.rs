//! End-to-end scenarios over a full (stream, controller, runtime) triple,
//! driven through the conversation manager.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use tiller_core::{
    AgentRegistry, AnalyzerRegistry, ConversationManager, EventStream, MemoryFileStore,
    ScriptedAgent, TillerConfig,
};
use tiller_runtime::{
    ExecutionContext, Runtime, RuntimeError, RuntimeRegistry,
};
use tiller_types::{
    Action, AgentState, ConfirmationState, CreateConversationRequest, ErrorKind, Event,
    EventPayload, Observation, SecurityRisk,
};

fn run_action(command: &str) -> Action {
    Action::Run {
        command: command.to_string(),
        cwd: None,
        env: BTreeMap::new(),
        timeout_secs: None,
        stream_output: false,
    }
}

/// Universal stream invariants: dense ids, backward cause pointers, and every
/// answered action preceding its observation.
fn assert_stream_invariants(events: &[Event]) {
    for (offset, event) in events.iter().enumerate() {
        assert_eq!(event.id, offset as u64, "ids must be dense");
        if let Some(cause) = event.cause {
            assert!(cause < event.id, "cause must point backward");
            assert!(
                events[cause as usize].is_action(),
                "cause {cause} must name an action"
            );
        }
    }
}

fn base_config(dir: &std::path::Path) -> TillerConfig {
    let mut config = TillerConfig::default();
    config.core.file_store = "memory".to_string();
    config.core.max_iterations = 10;
    config.sandbox.workspace_root = Some(dir.display().to_string());
    config
}

fn manager_with_agents(
    config: TillerConfig,
    register: impl FnOnce(&mut AgentRegistry),
) -> Arc<ConversationManager> {
    let mut agents = AgentRegistry::new("echo");
    register(&mut agents);
    ConversationManager::with_registries(
        config,
        Arc::new(MemoryFileStore::new()),
        Arc::new(agents),
        Arc::new(RuntimeRegistry::new()),
        Arc::new(AnalyzerRegistry::new()),
    )
}

#[tokio::test]
async fn s1_shell_echo_runs_to_finished() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = base_config(dir.path());
    config.core.max_iterations = 2;
    config.core.default_agent = "s1".to_string();
    let manager = manager_with_agents(config, |agents| {
        agents.register(
            "s1",
            Arc::new(|| Box::new(ScriptedAgent::new(vec![run_action("echo hi")]))),
        );
    });

    let id = manager
        .create(CreateConversationRequest {
            initial_message: Some("start".to_string()),
            ..Default::default()
        })
        .await
        .expect("create");
    let final_state = manager.wait_terminal(&id).await.expect("terminal");
    assert_eq!(final_state, AgentState::Finished);

    let events = manager.events(&id, 0, None).await.expect("events");
    assert_stream_invariants(&events);
    let kinds = events.iter().map(|e| e.kind()).collect::<Vec<_>>();
    assert_eq!(kinds, vec!["user_message", "run", "run_output", "finish"]);
    match events[2].as_observation() {
        Some(Observation::RunOutput {
            exit_code, stdout, ..
        }) => {
            assert_eq!(*exit_code, 0);
            assert_eq!(stdout, "hi\n");
        }
        other => panic!("expected run output, got {other:?}"),
    }
    assert_eq!(events[2].cause, Some(1));
}

#[tokio::test]
async fn s2_iteration_cap_stops_with_reason() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = base_config(dir.path());
    config.core.max_iterations = 1;
    config.core.default_agent = "s2".to_string();
    let manager = manager_with_agents(config, |agents| {
        agents.register(
            "s2",
            Arc::new(|| {
                Box::new(ScriptedAgent::new(vec![
                    run_action("true"),
                    run_action("true"),
                    run_action("true"),
                ]))
            }),
        );
    });

    let id = manager
        .create(CreateConversationRequest {
            initial_message: Some("start".to_string()),
            ..Default::default()
        })
        .await
        .expect("create");
    let final_state = manager.wait_terminal(&id).await.expect("terminal");
    assert_eq!(final_state, AgentState::Stopped);

    let events = manager.events(&id, 0, None).await.expect("events");
    assert_stream_invariants(&events);
    let kinds = events.iter().map(|e| e.kind()).collect::<Vec<_>>();
    assert_eq!(
        kinds,
        vec!["user_message", "run", "run_output", "limit_reached"]
    );
}

#[tokio::test]
async fn s3_risky_action_waits_for_confirmation() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = base_config(dir.path());
    config.core.default_agent = "s3".to_string();
    config.security.confirmation_mode = true;
    config.security.security_analyzer = Some("pattern".to_string());
    config.security.risk_threshold = SecurityRisk::Medium;
    let manager = manager_with_agents(config, |agents| {
        agents.register(
            "s3",
            Arc::new(|| Box::new(ScriptedAgent::new(vec![run_action("rm -rf /")]))),
        );
    });

    let id = manager
        .create(CreateConversationRequest {
            initial_message: Some("clean up".to_string()),
            ..Default::default()
        })
        .await
        .expect("create");

    // wait for the confirmation park
    let action = loop {
        let snapshot = manager.get(&id).await.expect("get");
        if snapshot.agent_state == AgentState::AwaitingUserConfirmation {
            let events = manager.events(&id, 0, None).await.expect("events");
            break events
                .into_iter()
                .find(|e| e.kind() == "run")
                .expect("held action");
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    };
    assert_eq!(action.confirmation_state, Some(ConfirmationState::Unconfirmed));
    assert_eq!(action.security_risk, Some(SecurityRisk::High));

    // nothing answers the action while it is held
    let events = manager.events(&id, 0, None).await.expect("events");
    assert!(events.iter().all(|e| e.cause != Some(action.id)));

    manager.confirm(&id, action.id, false).await.expect("confirm");
    let final_state = manager.wait_terminal(&id).await.expect("terminal");
    assert_eq!(final_state, AgentState::Finished);

    let events = manager.events(&id, 0, None).await.expect("events");
    assert_stream_invariants(&events);
    let rejected = events
        .iter()
        .find(|e| e.kind() == "rejected")
        .expect("rejected observation");
    assert_eq!(rejected.cause, Some(action.id));
    // analyzer configured: every action carries a risk tag
    for event in events.iter().filter(|e| e.is_action()) {
        assert!(event.security_risk.is_some());
    }
}

/// Runtime that works once, then crashes.
struct CrashOnSecondRuntime {
    calls: AtomicUsize,
}

#[async_trait]
impl Runtime for CrashOnSecondRuntime {
    fn id(&self) -> &str {
        "crashy"
    }

    async fn connect(&self) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn run_action(
        &self,
        _event: &Event,
        _ctx: &ExecutionContext,
    ) -> Result<Observation, RuntimeError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok(Observation::RunOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
                truncated: false,
            })
        } else {
            Err(RuntimeError::Internal("sandbox crashed".to_string()))
        }
    }

    async fn close(&self) {}

    async fn list_files(&self, _path: Option<&str>) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn get_file(&self, _path: &str) -> anyhow::Result<Vec<u8>> {
        Ok(Vec::new())
    }

    async fn get_trajectory(&self) -> anyhow::Result<Vec<Event>> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn s4_runtime_crash_is_terminal_with_error_observation() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = base_config(dir.path());
    config.core.default_agent = "s4".to_string();
    config.core.runtime = "crashy".to_string();

    let mut agents = AgentRegistry::new("echo");
    agents.register(
        "s4",
        Arc::new(|| {
            Box::new(ScriptedAgent::new(vec![
                run_action("true"),
                run_action("true"),
            ]))
        }),
    );
    let mut runtimes = RuntimeRegistry::new();
    runtimes.register(
        "crashy",
        Arc::new(|_config, _session| {
            Ok(Arc::new(CrashOnSecondRuntime {
                calls: AtomicUsize::new(0),
            }) as Arc<dyn Runtime>)
        }),
    );
    let manager = ConversationManager::with_registries(
        config,
        Arc::new(MemoryFileStore::new()),
        Arc::new(agents),
        Arc::new(runtimes),
        Arc::new(AnalyzerRegistry::new()),
    );

    let id = manager
        .create(CreateConversationRequest {
            initial_message: Some("start".to_string()),
            ..Default::default()
        })
        .await
        .expect("create");
    let final_state = manager.wait_terminal(&id).await.expect("terminal");
    assert_eq!(final_state, AgentState::Error);

    let events = manager.events(&id, 0, None).await.expect("events");
    assert_stream_invariants(&events);
    // first action answered normally
    assert!(events.iter().any(|e| e.kind() == "run_output"));
    // second action answered by a runtime_internal error observation
    let crash = events
        .iter()
        .filter_map(|e| e.as_observation())
        .find_map(|o| match o {
            Observation::Error { error_kind, message } => Some((*error_kind, message.clone())),
            _ => None,
        })
        .expect("error observation");
    assert_eq!(crash.0, ErrorKind::RuntimeInternal);
    assert!(crash.1.contains("sandbox crashed"));
}

#[tokio::test]
async fn s5_delegation_splices_summary_and_hides_child_events() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = base_config(dir.path());
    config.core.default_agent = "s5".to_string();
    let manager = manager_with_agents(config, |agents| {
        agents.register(
            "s5",
            Arc::new(|| {
                Box::new(ScriptedAgent::new(vec![Action::Delegate {
                    task: "sub".to_string(),
                    inputs: BTreeMap::new(),
                    agent: Some("sub-worker".to_string()),
                    max_iterations: Some(1),
                    max_budget: None,
                }]))
            }),
        );
        agents.register(
            "sub-worker",
            Arc::new(|| Box::new(ScriptedAgent::new(vec![run_action("true")]))),
        );
    });

    let id = manager
        .create(CreateConversationRequest {
            initial_message: Some("start".to_string()),
            ..Default::default()
        })
        .await
        .expect("create");
    let final_state = manager.wait_terminal(&id).await.expect("terminal");
    assert_eq!(final_state, AgentState::Finished);

    let events = manager.events(&id, 0, None).await.expect("events");
    assert_stream_invariants(&events);
    let delegate = events
        .iter()
        .find(|e| e.kind() == "delegate")
        .expect("delegate action");
    let summary = events
        .iter()
        .find(|e| e.kind() == "agent_delegate")
        .expect("delegate observation");
    assert_eq!(summary.id, delegate.id + 1);
    assert_eq!(summary.cause, Some(delegate.id));
    match summary.as_observation() {
        Some(Observation::AgentDelegate { summary, .. }) => assert!(!summary.is_empty()),
        other => panic!("unexpected payload {other:?}"),
    }
    // the child's own run/observation pairs never surface in the parent range
    assert!(events.iter().all(|e| e.kind() != "run"));
    assert!(events.iter().all(|e| e.kind() != "run_output"));
}

#[tokio::test]
async fn s6_replay_prefix_then_live_execution() {
    let dir = tempfile::tempdir().expect("tempdir");
    let trajectory_file = dir.path().join("prefix.json");

    let mut recorded_action = Event::action(
        tiller_types::EventSource::Agent,
        run_action("echo recorded"),
    );
    recorded_action.id = 3;
    let mut recorded_obs = Event::observation(
        tiller_types::EventSource::Environment,
        Some(3),
        Observation::RunOutput {
            exit_code: 0,
            stdout: "recorded\n".to_string(),
            stderr: String::new(),
            truncated: false,
        },
    );
    recorded_obs.id = 4;
    std::fs::write(
        &trajectory_file,
        serde_json::to_vec(&vec![recorded_action, recorded_obs]).expect("serialize"),
    )
    .expect("write trajectory");

    let mut config = base_config(dir.path());
    config.core.replay_trajectory_path = Some(trajectory_file.display().to_string());
    config.core.default_agent = "s6".to_string();
    let manager = manager_with_agents(config, |agents| {
        agents.register(
            "s6",
            Arc::new(|| Box::new(ScriptedAgent::new(vec![run_action("echo live")]))),
        );
    });

    let id = manager
        .create(CreateConversationRequest {
            initial_message: Some("go".to_string()),
            ..Default::default()
        })
        .await
        .expect("create");
    let final_state = manager.wait_terminal(&id).await.expect("terminal");
    assert_eq!(final_state, AgentState::Finished);

    let events = manager.events(&id, 0, None).await.expect("events");
    assert_stream_invariants(&events);
    // replayed pair first, with fresh ids and intact cause linkage
    assert_eq!(events[0].kind(), "run");
    assert_eq!(events[1].kind(), "run_output");
    assert_eq!(events[1].cause, Some(0));
    // then the live conversation proceeds
    assert_eq!(events[2].kind(), "user_message");
    let live_output = events
        .iter()
        .filter_map(|e| e.as_observation())
        .find_map(|o| match o {
            Observation::RunOutput { stdout, .. } if stdout == "live\n" => Some(()),
            _ => None,
        });
    assert!(live_output.is_some(), "live action must have executed");
}

#[tokio::test]
async fn persisted_stream_roundtrips_byte_identically() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store: Arc<dyn tiller_core::FileStore> =
        Arc::new(tiller_core::LocalFileStore::new(dir.path()));

    let before = {
        let stream = EventStream::new("ses_rt", Arc::clone(&store));
        stream
            .append(Event::user_message("hello"))
            .await
            .expect("append");
        stream
            .append(Event::action(
                tiller_types::EventSource::Agent,
                run_action("true"),
            ))
            .await
            .expect("append");
        stream
            .append(Event::observation(
                tiller_types::EventSource::Environment,
                Some(1),
                Observation::RunOutput {
                    exit_code: 0,
                    stdout: String::new(),
                    stderr: String::new(),
                    truncated: false,
                },
            ))
            .await
            .expect("append");
        let events = stream.get_events(0, None, None).await;
        stream.close().await;
        serde_json::to_vec(&events).expect("serialize")
    };

    let reloaded = EventStream::load("ses_rt", Arc::clone(&store))
        .await
        .expect("load");
    let events = reloaded.get_events(0, None, None).await;
    assert_stream_invariants(&events);
    let after = serde_json::to_vec(&events).expect("serialize");
    assert_eq!(before, after, "derived view must be byte-identical");
}

#[tokio::test]
async fn observation_precedes_next_action_in_stream_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = base_config(dir.path());
    config.core.default_agent = "pairs".to_string();
    let manager = manager_with_agents(config, |agents| {
        agents.register(
            "pairs",
            Arc::new(|| {
                Box::new(ScriptedAgent::new(vec![
                    run_action("echo one"),
                    run_action("echo two"),
                    run_action("echo three"),
                ]))
            }),
        );
    });

    let id = manager
        .create(CreateConversationRequest {
            initial_message: Some("go".to_string()),
            ..Default::default()
        })
        .await
        .expect("create");
    manager.wait_terminal(&id).await.expect("terminal");

    let events = manager.events(&id, 0, None).await.expect("events");
    assert_stream_invariants(&events);
    let mut open_action: Option<u64> = None;
    for event in &events {
        match &event.payload {
            EventPayload::Action(action) if !action.is_control() => {
                assert!(
                    open_action.is_none(),
                    "action {} issued before the previous one was answered",
                    event.id
                );
                open_action = Some(event.id);
            }
            EventPayload::Observation(_) => {
                if event.cause == open_action {
                    open_action = None;
                }
            }
            _ => {}
        }
    }
    assert!(open_action.is_none(), "every dispatched action is answered");
}

#[tokio::test]
async fn inputs_flow_into_metadata_and_state() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = manager_with_agents(base_config(dir.path()), |_| {});
    let mut inputs = BTreeMap::new();
    inputs.insert("trigger".to_string(), json!("api"));
    let id = manager
        .create(CreateConversationRequest {
            inputs,
            repository: Some("tillerhq/tiller".to_string()),
            branch: Some("main".to_string()),
            ..Default::default()
        })
        .await
        .expect("create");
    manager.wait_terminal(&id).await.expect("terminal");
    let snapshot = manager.get(&id).await.expect("get");
    assert_eq!(snapshot.id, id);
}
