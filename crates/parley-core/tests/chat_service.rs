//! `ChatService` driving a real `CommandSession` and fake model.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parley_core::{
    AdapterInfo, ChatService, CommandSession, FilterConfig, ModelPaths, ProcessEvent,
    ServiceEvent, SessionConfig, SpecialCommand, SupervisorConfig,
};
use parley_test_utils::FakeModel;
use tokio_util::sync::CancellationToken;

struct Harness {
    model: FakeModel,
    service: ChatService,
    adapter: AdapterInfo,
}

async fn harness() -> Harness {
    let model = FakeModel::chat();
    let adapter_dir = model.dir().join("adapters").join("support-bot");
    std::fs::create_dir_all(&adapter_dir).unwrap();
    std::fs::write(
        adapter_dir.join("adapter_config.json"),
        r#"{"peft_type": "LORA"}"#,
    )
    .unwrap();
    let base_config = model.dir().join("config.yaml");
    std::fs::write(&base_config, "model_name: tiny\nadapter_path: \"\"\n").unwrap();

    let session = CommandSession::new(
        SupervisorConfig {
            init_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(2),
            ..SupervisorConfig::default()
        },
        SessionConfig {
            response_timeout: Duration::from_secs(2),
            inactivity_window: Duration::from_millis(300),
            ..SessionConfig::default()
        },
    );
    let service = ChatService::new(
        Arc::new(session),
        ModelPaths {
            python: FakeModel::shell(),
            script: model.script().to_path_buf(),
            base_config,
        },
        FilterConfig::default(),
    );
    let adapter = AdapterInfo::from_dir(&adapter_dir).await.unwrap();
    Harness {
        model,
        service,
        adapter,
    }
}

fn temp_configs(dir: &std::path::Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("config_"))
        })
        .collect()
}

#[tokio::test]
async fn initialize_starts_chat_mode_and_cleans_up_temp_config() {
    let h = harness().await;
    let mut raw = h.service.process_events();

    h.service.initialize(h.adapter.clone(), None).await.unwrap();
    assert!(h.service.is_initialized().await);
    assert_eq!(
        h.service.current_adapter().await.unwrap().metadata["peft_type"],
        "LORA"
    );
    assert!(temp_configs(h.model.dir()).is_empty());

    let mut args_line = None;
    while let Ok(event) = raw.try_recv() {
        if let ProcessEvent::Stdout(line) = event {
            if line.starts_with("[System] args:") {
                args_line = Some(line);
            }
        }
    }
    let args_line = args_line.expect("fake model should echo its arguments");
    assert!(args_line.contains("--mode chat --config "));
    assert!(args_line.contains("config_"));

    h.service.shutdown().await.unwrap();
    assert!(!h.service.is_initialized().await);
}

#[tokio::test]
async fn generate_returns_complete_response() {
    let h = harness().await;
    h.service.initialize(h.adapter.clone(), None).await.unwrap();

    let reply = h
        .service
        .generate("hello there", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(reply, "You said: hello there");
}

#[tokio::test]
async fn streaming_yields_only_the_assistant_turn() {
    let h = harness().await;
    h.service.initialize(h.adapter.clone(), None).await.unwrap();

    let chunks: Vec<String> = h
        .service
        .generate_streaming("transcript", &CancellationToken::new())
        .await
        .unwrap()
        .map(|c| c.unwrap())
        .collect()
        .await;
    assert_eq!(chunks.concat(), "Hello from the model.\nHow can I help?\n");
}

#[tokio::test]
async fn streaming_without_turn_markers_passes_through() {
    let h = harness().await;
    h.service.initialize(h.adapter.clone(), None).await.unwrap();

    let chunks: Vec<String> = h
        .service
        .generate_streaming("ping", &CancellationToken::new())
        .await
        .unwrap()
        .map(|c| c.unwrap())
        .collect()
        .await;
    assert_eq!(chunks.concat(), "You said: ping\n");
}

#[tokio::test]
async fn special_commands_reach_the_model() {
    let h = harness().await;
    h.service.initialize(h.adapter.clone(), None).await.unwrap();
    let mut events = h.service.subscribe();

    let reply = h
        .service
        .execute_special(&SpecialCommand::Clear, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(reply, "Chat history cleared.");
    assert_eq!(
        events.try_recv().unwrap(),
        ServiceEvent::Status("Chat history cleared.".into())
    );
}

#[tokio::test]
async fn slash_commands_can_be_cancelled() {
    let h = harness().await;
    h.service.initialize(h.adapter.clone(), None).await.unwrap();
    let mut events = h.service.subscribe();
    let cancel = CancellationToken::new();

    let canceller = {
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        }
    };
    let command = SpecialCommand::LoadRag("docs/manual.pdf".into());
    let (result, ()) = tokio::join!(
        h.service.execute_special(&command, &cancel),
        canceller
    );
    assert!(result.unwrap_err().is_cancelled());
    assert_eq!(
        events.try_recv().unwrap(),
        ServiceEvent::Status("Loading RAG documents...".into())
    );
    assert!(events.try_recv().is_err(), "cancellation is not an error event");

    // The abandoned reply arrives later and must not leak into the next command.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    let reply = h
        .service
        .execute_special(&SpecialCommand::Clear, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(reply, "Chat history cleared.");
}

#[tokio::test]
async fn reinitialize_replaces_the_running_model() {
    let h = harness().await;
    h.service.initialize(h.adapter.clone(), None).await.unwrap();
    h.service.initialize(h.adapter.clone(), None).await.unwrap();

    let reply = h
        .service
        .generate("again", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(reply, "You said: again");
    assert!(temp_configs(h.model.dir()).is_empty());
}

#[tokio::test]
async fn failed_generation_emits_error_event() {
    let h = harness().await;
    h.service.initialize(h.adapter.clone(), None).await.unwrap();
    let mut events = h.service.subscribe();

    let err = h
        .service
        .generate("silent", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    match events.try_recv().unwrap() {
        ServiceEvent::Error(message) => assert!(message.starts_with("Error generating response")),
        other => panic!("expected error event, got {other:?}"),
    }
}
