use super::*;

use serde_json::json;
use strand_core::tool_call::{ConfirmationKind, ConfirmationOutcome};

use crate::llm::{ScriptedBackend, ScriptedTurn};
use crate::model_router::{DefaultStrategy, FallbackStrategy, OverrideStrategy};
use crate::registry::tests::NamedTool;
use crate::scheduler::CANCELLED_BY_USER;

fn runtime(kind: &str, backend: Arc<ScriptedBackend>) -> ChatRuntime {
    let mut registry = ToolRegistry::new();
    for name in ["read_file", "write_file", WRITE_TODOS_TOOL_NAME] {
        registry.register(NamedTool::arc(name)).expect("register");
    }
    ChatRuntime {
        backends: Arc::new(BackendTable::single(kind, backend)),
        router: Arc::new(ModelRouter::new(vec![
            Arc::new(FallbackStrategy),
            Arc::new(OverrideStrategy),
            Arc::new(DefaultStrategy::new(Some("gemini-2.5-pro".into()))),
        ])),
        registry: Arc::new(registry),
        store: InMemorySessionStore::new(),
        broker: Arc::new(ApprovalBroker::new()),
        settings: ChatSettings {
            dangerous_tools: vec!["write_file".into()],
            system_prompt: Some("You are a helpful assistant.".into()),
            requested_model: None,
        }
        .fixed(),
    }
}

async fn collect(mut rx: mpsc::UnboundedReceiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

/// Drain events, answering every confirmation request with `outcome`.
async fn collect_answering(
    mut rx: mpsc::UnboundedReceiver<StreamEvent>,
    broker: &ApprovalBroker,
    outcome: ConfirmationOutcome,
) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        if let StreamEvent::ToolConfirmationRequest { id, .. } = &event {
            assert!(broker.resolve(id, outcome));
        }
        events.push(event);
    }
    events
}

fn kinds(events: &[StreamEvent]) -> Vec<&'static str> {
    events.iter().map(StreamEvent::kind).collect()
}

#[tokio::test]
async fn plain_reply_streams_and_finishes() {
    let backend = Arc::new(ScriptedBackend::new(
        "gemini",
        vec![ScriptedTurn::text("Hello there")],
    ));
    let rt = runtime("gemini", backend.clone());
    let store = rt.store.clone();
    let chat = ChatService::open(rt, "s1").await;

    let events = collect(chat.send_message("hi", CancellationToken::new())).await;
    assert_eq!(
        kinds(&events),
        vec!["streaming_started", "thinking", "chunk", "token_count", "final_response"]
    );
    assert_eq!(
        events.last(),
        Some(&StreamEvent::FinalResponse {
            content: "Hello there".into()
        })
    );
    assert_eq!(chat.model().as_deref(), Some("gemini-2.5-pro"));
    assert_eq!(
        backend.requests()[0].system_instruction.as_deref(),
        Some("You are a helpful assistant.")
    );
    assert_eq!(store.get("s1").await.map(|s| s.history.len()), Some(2));
}

#[tokio::test]
async fn tool_results_are_fed_back_before_the_answer() {
    let backend = Arc::new(ScriptedBackend::new(
        "gemini",
        vec![
            ScriptedTurn::calls(vec![("read_file", json!({"path": "src/lib.rs"}))]),
            ScriptedTurn::text("The file defines the library root."),
        ],
    ));
    let chat = ChatService::open(runtime("gemini", backend.clone()), "s1").await;

    let events = collect(chat.send_message("what is in lib.rs?", CancellationToken::new())).await;
    assert_eq!(
        kinds(&events),
        vec![
            "streaming_started",
            "thinking",
            "token_count",
            "tool_call_start",
            "tool_call_end",
            "thinking",
            "chunk",
            "token_count",
            "final_response",
        ]
    );
    assert!(events.contains(&StreamEvent::ToolCallEnd {
        id: "s1#0-0".into(),
        name: "read_file".into(),
        result: "read_file ran".into(),
        err: None,
    }));

    let second = &backend.requests()[1];
    assert_eq!(second.prompt_id, "s1#1");
    assert_eq!(second.history.len(), 3);
    assert!(matches!(
        second.history[2].parts[0],
        Part::FunctionResponse(ref r) if r.id == "s1#0-0"
    ));
    assert_eq!(chat.tool_call_count(), 1);
    assert_eq!(chat.tool_error_count(), 0);
    assert_eq!(chat.history().len(), 4);
}

#[tokio::test]
async fn quota_error_switches_to_fallback_model() {
    let backend = Arc::new(ScriptedBackend::new(
        "gemini",
        vec![
            ScriptedTurn::RateLimited {
                provider: "gemini".into(),
            },
            ScriptedTurn::text("ok"),
        ],
    ));
    let chat = ChatService::open(runtime("gemini", backend.clone()), "s1").await;

    let events = collect(chat.send_message("hi", CancellationToken::new())).await;
    assert_eq!(
        kinds(&events),
        vec![
            "streaming_started",
            "thinking",
            "model_switch",
            "final_response",
            "thinking",
            "chunk",
            "token_count",
            "final_response",
        ]
    );
    assert!(matches!(
        &events[2],
        StreamEvent::ModelSwitch { old_model, new_model, .. }
            if old_model == "gemini-2.5-pro" && new_model == "gemini-flash"
    ));
    assert_eq!(
        events[3],
        StreamEvent::FinalResponse {
            content: "Automatically switched to model **gemini-flash**.".into()
        }
    );
    assert_eq!(chat.model().as_deref(), Some("gemini-flash"));
    assert_eq!(backend.requests()[1].model, "gemini-flash");
}

#[tokio::test]
async fn quota_error_without_fallback_ends_the_stream() {
    let backend = Arc::new(ScriptedBackend::new(
        "mock",
        vec![ScriptedTurn::RateLimited {
            provider: "mock".into(),
        }],
    ));
    let chat = ChatService::open(runtime("mock", backend), "s1").await;

    let events = collect(chat.send_message("hi", CancellationToken::new())).await;
    match events.last() {
        Some(StreamEvent::Error { err }) => {
            assert!(err.starts_with("Quota Exceeded for gemini-2.5-pro. No fallback model found."))
        }
        other => panic!("expected error, got {other:?}"),
    }
    assert_eq!(chat.model().as_deref(), Some("gemini-2.5-pro"));
}

#[tokio::test]
async fn transport_error_names_the_executor() {
    let backend = Arc::new(ScriptedBackend::new(
        "mock",
        vec![ScriptedTurn::Transport {
            provider: "mock".into(),
            reason: "connection reset".into(),
        }],
    ));
    let chat = ChatService::open(runtime("mock", backend), "s1").await;

    let events = collect(chat.send_message("hi", CancellationToken::new())).await;
    match events.last() {
        Some(StreamEvent::Error { err }) => {
            assert!(err.starts_with("Error from executor 'mock':"));
            assert!(err.contains("connection reset"));
        }
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn dangerous_tool_waits_for_confirmation() {
    let backend = Arc::new(ScriptedBackend::new(
        "gemini",
        vec![
            ScriptedTurn::calls(vec![(
                "write_file",
                json!({"file_path": "notes.md", "content": "hi"}),
            )]),
            ScriptedTurn::text("Understood, leaving the file alone."),
        ],
    ));
    let rt = runtime("gemini", backend);
    let broker = rt.broker.clone();
    let chat = ChatService::open(rt, "s1").await;

    let rx = chat.send_message("write notes", CancellationToken::new());
    let events = collect_answering(rx, &broker, ConfirmationOutcome::Cancel).await;

    assert!(events.iter().any(|e| matches!(
        e,
        StreamEvent::ToolConfirmationRequest { kind: ConfirmationKind::Edit, name, .. } if name == "write_file"
    )));
    assert!(events.contains(&StreamEvent::ToolCallEnd {
        id: "s1#0-0".into(),
        name: "write_file".into(),
        result: CANCELLED_BY_USER.into(),
        err: Some(CANCELLED_BY_USER.into()),
    }));
    assert_eq!(chat.tool_error_count(), 1);
    assert!(broker.pending().is_empty());
}

#[tokio::test]
async fn proceed_always_skips_later_confirmations() {
    let backend = Arc::new(ScriptedBackend::new(
        "gemini",
        vec![
            ScriptedTurn::calls(vec![("write_file", json!({"file_path": "a"}))]),
            ScriptedTurn::text("first done"),
            ScriptedTurn::calls(vec![("write_file", json!({"file_path": "b"}))]),
            ScriptedTurn::text("second done"),
        ],
    ));
    let rt = runtime("gemini", backend);
    let broker = rt.broker.clone();
    let chat = ChatService::open(rt, "s1").await;

    let first = collect_answering(
        chat.send_message("write a", CancellationToken::new()),
        &broker,
        ConfirmationOutcome::ProceedAlways,
    )
    .await;
    assert_eq!(
        first.iter().filter(|e| e.kind() == "tool_confirmation_request").count(),
        1
    );

    let second = collect(chat.send_message("write b", CancellationToken::new())).await;
    assert!(!second.iter().any(|e| e.kind() == "tool_confirmation_request"));
    assert_eq!(chat.tool_call_count(), 2);
    assert_eq!(chat.tool_error_count(), 0);
}

#[tokio::test]
async fn write_todos_reports_progress() {
    let backend = Arc::new(ScriptedBackend::new(
        "gemini",
        vec![
            ScriptedTurn::calls(vec![(
                WRITE_TODOS_TOOL_NAME,
                json!({"todos": [
                    {"description": "read code", "status": "completed"},
                    {"description": "write tests", "status": "in_progress"},
                    {"description": "ship", "status": "pending"}
                ]}),
            )]),
            ScriptedTurn::text("Plan recorded."),
        ],
    ));
    let chat = ChatService::open(runtime("gemini", backend), "s1").await;

    let events = collect(chat.send_message("plan it", CancellationToken::new())).await;
    assert!(events.contains(&StreamEvent::TodosSummaryUpdate {
        summary: "Todos 1/3".into()
    }));
}

#[tokio::test]
async fn cancelled_request_reports_error() {
    let backend = Arc::new(ScriptedBackend::new("gemini", vec![ScriptedTurn::text("unused")]));
    let chat = ChatService::open(runtime("gemini", backend.clone()), "s1").await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let events = collect(chat.send_message("hi", cancel)).await;
    assert_eq!(kinds(&events), vec!["streaming_started", "error"]);
    assert!(backend.requests().is_empty());
}

#[tokio::test]
async fn compress_and_clear_rewrite_stored_history() {
    let backend = Arc::new(
        ScriptedBackend::new(
            "gemini",
            vec![
                ScriptedTurn::text("Rust ownership means each value has one owner."),
                ScriptedTurn::text("Borrowing lends access without moving the value."),
            ],
        )
        .with_generated(vec!["Talked about ownership and borrowing.".into()]),
    );
    let rt = runtime("gemini", backend);
    let store = rt.store.clone();
    let chat = ChatService::open(rt, "s1").await;

    collect(chat.send_message("explain ownership", CancellationToken::new())).await;
    collect(chat.send_message("and borrowing?", CancellationToken::new())).await;
    assert_eq!(chat.history().len(), 4);

    let outcome = chat.compress().await.expect("compressed");
    assert!(outcome.new_token_count < outcome.original_token_count);
    assert_eq!(
        chat.history(),
        vec![Content::model("Talked about ownership and borrowing.")]
    );
    assert_eq!(store.get("s1").await.map(|s| s.history.len()), Some(1));

    chat.clear().await;
    assert!(chat.history().is_empty());
    assert_eq!(store.get("s1").await.map(|s| s.history.len()), Some(0));
}

#[tokio::test]
async fn hub_reuses_sessions_and_restores_history() {
    let backend = Arc::new(ScriptedBackend::new("gemini", vec![ScriptedTurn::text("hello")]));
    let rt = runtime("gemini", backend);
    rt.store
        .save_history("old", vec![Content::user("earlier"), Content::model("reply")])
        .await;
    let hub = ChatHub::new(rt);

    assert!(hub.existing("s1").await.is_none());
    let a = hub.session("s1").await;
    let b = hub.session("s1").await;
    collect(a.send_message("hi", CancellationToken::new())).await;
    assert_eq!(b.history().len(), 2);

    let restored = hub.session("old").await;
    assert_eq!(restored.history().len(), 2);
    assert_eq!(hub.session_ids().await, vec!["old".to_string(), "s1".to_string()]);
}

#[tokio::test]
async fn reloaded_settings_apply_to_the_next_turn() {
    let backend = Arc::new(ScriptedBackend::new(
        "gemini",
        vec![
            ScriptedTurn::calls(vec![("write_file", json!({"file_path": "a"}))]),
            ScriptedTurn::text("first done"),
            ScriptedTurn::calls(vec![("write_file", json!({"file_path": "b"}))]),
            ScriptedTurn::text("second done"),
        ],
    ));
    let (settings_tx, settings_rx) = watch::channel(ChatSettings {
        dangerous_tools: vec!["write_file".into()],
        system_prompt: Some("before".into()),
        requested_model: None,
    });
    let mut rt = runtime("gemini", backend.clone());
    rt.settings = settings_rx;
    let broker = rt.broker.clone();
    let chat = ChatService::open(rt, "s1").await;

    let first = collect_answering(
        chat.send_message("write a", CancellationToken::new()),
        &broker,
        ConfirmationOutcome::ProceedOnce,
    )
    .await;
    assert!(kinds(&first).contains(&"tool_confirmation_request"));

    settings_tx.send_replace(ChatSettings {
        dangerous_tools: Vec::new(),
        system_prompt: Some("after".into()),
        requested_model: None,
    });
    let second = collect(chat.send_message("write b", CancellationToken::new())).await;
    assert!(!kinds(&second).contains(&"tool_confirmation_request"));
    assert!(second.contains(&StreamEvent::FinalResponse {
        content: "second done".into()
    }));

    let requests = backend.requests();
    assert_eq!(requests[0].system_instruction.as_deref(), Some("before"));
    assert_eq!(requests[2].system_instruction.as_deref(), Some("after"));
}
