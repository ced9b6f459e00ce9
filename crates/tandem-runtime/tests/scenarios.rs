//! End-to-end scenarios driven through the runtime facade with a mock
//! provider.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use tandem_agents::{AgentDefinition, RegistryBuilder};
use tandem_core::testing::{MockProvider, RecordingSink};
use tandem_core::{
    ApprovalCallback, ApprovalDecision, ApprovalPolicy, ApprovalRequest, Error, EventPayload,
    FrameState, Role, ToolCall,
};
use tandem_runtime::{Runtime, RuntimeConfig};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn agent(name: &str, toolsets: &[&str]) -> AgentDefinition {
    AgentDefinition {
        name: name.to_string(),
        description: None,
        model: None,
        toolsets: toolsets.iter().map(|s| s.to_string()).collect(),
        input_model_ref: None,
        compatible_models: Vec::new(),
        server_side_tools: Vec::new(),
        calls_require_approval: None,
        accepts_attachments: true,
        instructions: format!("You are {name}."),
    }
}

struct Recording {
    runtime: Runtime,
    provider: Arc<MockProvider>,
    sink: Arc<RecordingSink>,
}

fn runtime_with(
    definitions: Vec<AgentDefinition>,
    configure: impl FnOnce(RuntimeConfig) -> RuntimeConfig,
    project_root: &std::path::Path,
) -> Recording {
    init_tracing();
    let mut builder = RegistryBuilder::new().with_project_root(project_root);
    for definition in definitions {
        builder = builder.add_agent_definition(definition, "test");
    }
    let registry = Arc::new(builder.build().unwrap());

    let provider = Arc::new(MockProvider::new());
    let sink = Arc::new(RecordingSink::new());
    let config = configure(
        RuntimeConfig::new()
            .with_sink(Arc::clone(&sink) as Arc<dyn tandem_core::EventSink>)
            .with_project_root(project_root),
    );

    Recording {
        runtime: Runtime::new(registry, Arc::clone(&provider) as Arc<dyn tandem_core::Provider>, config),
        provider,
        sink,
    }
}

struct DecideWith {
    decision: ApprovalDecision,
    calls: AtomicUsize,
}

impl DecideWith {
    fn new(decision: ApprovalDecision) -> Arc<Self> {
        Arc::new(Self {
            decision,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ApprovalCallback for DecideWith {
    async fn on_request(&self, _request: &ApprovalRequest) -> ApprovalDecision {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.decision
    }
}

// An agent with no toolsets echoes a response.
#[tokio::test]
async fn simple_echo() {
    let dir = tempfile::tempdir().unwrap();
    let rt = runtime_with(vec![agent("greeter", &[])], |c| c, dir.path());

    rt.provider.queue_response("Hello!");

    let (output, frame) = rt.runtime.run_entry("greeter", "hi", None).await.unwrap();
    assert_eq!(output, "Hello!");
    assert_eq!(frame.depth(), 0);
    assert_eq!(frame.state, FrameState::Completed);

    let payloads = rt.sink.payloads();
    assert!(matches!(
        &payloads[0],
        EventPayload::UserMessage { content } if content == "hi"
    ));
    assert!(matches!(
        &payloads[1],
        EventPayload::TextResponseComplete { full } if full == "Hello!"
    ));
    assert_eq!(payloads.len(), 2);
}

// An AllowSession decision suppresses the callback for the rest of the
// session; both writes land.
#[tokio::test]
async fn tool_approval_allow_session() {
    let dir = tempfile::tempdir().unwrap();
    let callback = DecideWith::new(ApprovalDecision::AllowSession);
    let cb = Arc::clone(&callback);
    let rt = runtime_with(
        vec![agent("coder", &["filesystem"])],
        move |c| {
            c.with_approval_policy(ApprovalPolicy::Prompt)
                .with_approval_callback(cb as Arc<dyn ApprovalCallback>)
        },
        dir.path(),
    );

    rt.provider.queue_tool_calls(vec![ToolCall::new(
        "c1",
        "write_file",
        json!({"path": "a", "content": "x"}),
    )]);
    rt.provider.queue_tool_calls(vec![ToolCall::new(
        "c2",
        "write_file",
        json!({"path": "b", "content": "y"}),
    )]);
    rt.provider.queue_response("both written");

    let (output, _) = rt.runtime.run_entry("coder", "write two files", None).await.unwrap();
    assert_eq!(output, "both written");

    // The second write must not consult the callback again.
    assert_eq!(callback.calls.load(Ordering::SeqCst), 1);
    assert!(dir.path().join("a").exists());
    assert!(dir.path().join("b").exists());

    let events = rt.sink.events();
    let results: Vec<&str> = events
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::ToolResult { result, .. } => Some(result.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(results.len(), 2);
    for result in results {
        let parsed: Value = serde_json::from_str(result).unwrap();
        assert_eq!(parsed["ok"], json!(true));
    }

    // Exactly one approval request was published.
    let approvals = rt
        .sink
        .payloads()
        .iter()
        .filter(|p| matches!(p, EventPayload::ApprovalRequested { .. }))
        .count();
    assert_eq!(approvals, 1);
}

// A self-referencing agent terminates at the depth limit, with exactly
// three delegation ToolCall events before the error.
#[tokio::test]
async fn depth_limit() {
    let dir = tempfile::tempdir().unwrap();
    let rt = runtime_with(
        vec![agent("loop", &["loop"])],
        |c| {
            c.with_max_depth(3)
                .with_approval_policy(ApprovalPolicy::ApproveAll)
        },
        dir.path(),
    );

    for i in 0..4 {
        rt.provider.queue_tool_calls(vec![ToolCall::new(
            format!("c{i}"),
            "loop",
            json!({"input": "again"}),
        )]);
    }

    let err = rt.runtime.run_entry("loop", "go", None).await.unwrap_err();
    match err {
        Error::MaxDepthExceeded {
            caller,
            callee,
            depth,
            max,
        } => {
            assert_eq!(caller, "loop");
            assert_eq!(callee, "loop");
            assert_eq!(depth, 4);
            assert_eq!(max, 3);
        }
        other => panic!("expected MaxDepthExceeded, got {other}"),
    }

    assert_eq!(rt.sink.count_tool_calls("loop"), 3);
    assert!(rt.sink.payloads().iter().any(|p| matches!(
        p,
        EventPayload::Error { kind, .. } if kind == "max_depth_exceeded"
    )));
}

// With reject_all and returned permission errors, the denial becomes a
// structured tool result and the run still completes.
#[tokio::test]
async fn permission_denied_returning() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("x"), "data").unwrap();

    let rt = runtime_with(
        vec![agent("reader", &["filesystem_ro"])],
        |c| {
            c.with_approval_policy(ApprovalPolicy::RejectAll)
                .with_return_permission_errors(true)
        },
        dir.path(),
    );

    rt.provider
        .queue_tool_calls(vec![ToolCall::new("c1", "read_file", json!({"path": "x"}))]);
    rt.provider.queue_response("the read was denied");

    let (output, frame) = rt.runtime.run_entry("reader", "read x", None).await.unwrap();
    assert_eq!(output, "the read was denied");
    assert_eq!(frame.state, FrameState::Completed);

    let result = rt
        .sink
        .events()
        .iter()
        .find_map(|e| match &e.payload {
            EventPayload::ToolResult { result, .. } => Some(result.clone()),
            _ => None,
        })
        .unwrap();
    let parsed: Value = serde_json::from_str(&result).unwrap();
    assert_eq!(parsed["error"], "permission_denied");
    assert_eq!(parsed["tool"], "read_file");
    assert!(parsed["description"].is_string());
}

// With return_permission_errors=false the denial terminates
// the run.
#[tokio::test]
async fn permission_denied_terminal() {
    let dir = tempfile::tempdir().unwrap();
    let rt = runtime_with(
        vec![agent("reader", &["filesystem_ro"])],
        |c| c.with_approval_policy(ApprovalPolicy::RejectAll),
        dir.path(),
    );

    rt.provider
        .queue_tool_calls(vec![ToolCall::new("c1", "read_file", json!({"path": "x"}))]);

    let err = rt.runtime.run_entry("reader", "read x", None).await.unwrap_err();
    assert!(err.is_permission_denied());
}

// A forced CLI model that violates compatible_models fails the run and
// publishes an Error envelope first.
#[tokio::test]
async fn incompatible_model() {
    let dir = tempfile::tempdir().unwrap();
    let mut picky = agent("picky", &[]);
    picky.compatible_models = vec!["anthropic:*".to_string()];

    let rt = runtime_with(
        vec![picky],
        |c| c.with_cli_model("openai:gpt-4"),
        dir.path(),
    );

    let err = rt.runtime.run_entry("picky", "hi", None).await.unwrap_err();
    assert!(matches!(err, Error::IncompatibleModel { .. }));

    assert!(rt.sink.payloads().iter().any(|p| matches!(
        p,
        EventPayload::Error { kind, .. } if kind == "incompatible_model"
    )));
}

// Dynamic agent creation, invocation, and duplicate rejection.
#[tokio::test]
async fn dynamic_agent_create_and_call() {
    let dir = tempfile::tempdir().unwrap();
    let rt = runtime_with(
        vec![agent("bootstrap", &["agents"])],
        |c| c.with_approval_policy(ApprovalPolicy::ApproveAll),
        dir.path(),
    );

    rt.provider.queue_tool_calls(vec![ToolCall::new(
        "c1",
        "agent_create",
        json!({"name": "helper", "instructions": "Help briefly.", "toolsets": []}),
    )]);
    rt.provider.queue_tool_calls(vec![ToolCall::new(
        "c2",
        "agent_call",
        json!({"name": "helper", "input": "hi"}),
    )]);
    rt.provider.queue_response("hello from helper");
    rt.provider.queue_tool_calls(vec![ToolCall::new(
        "c3",
        "agent_create",
        json!({"name": "helper", "instructions": "again", "toolsets": []}),
    )]);
    rt.provider.queue_response("done");

    let (output, _) = rt.runtime.run_entry("bootstrap", "make a helper", None).await.unwrap();
    assert_eq!(output, "done");
    assert!(rt.runtime.registry().is_generated("helper"));

    let results: Vec<String> = rt
        .sink
        .events()
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::ToolResult { result, .. } => Some(result.clone()),
            _ => None,
        })
        .collect();
    assert!(results[0].contains("created"));
    assert_eq!(results[1], "hello from helper");
    let dup: Value = serde_json::from_str(&results[2]).unwrap();
    assert_eq!(dup["error"], "duplicate_name");
}

// A delegated child starts with an empty history and leaves the parent's
// messages untouched.
#[tokio::test]
async fn delegation_isolates_history() {
    let dir = tempfile::tempdir().unwrap();
    let rt = runtime_with(
        vec![agent("lead", &["helper"]), agent("helper", &[])],
        |c| c.with_approval_policy(ApprovalPolicy::ApproveAll),
        dir.path(),
    );

    rt.provider.queue_tool_calls(vec![ToolCall::new(
        "c1",
        "helper",
        json!({"input": "sub-task"}),
    )]);
    rt.provider.queue_response("sub-result");
    rt.provider.queue_response("final");

    let history = vec![tandem_core::Message::user("earlier context")];
    let (_, frame) = rt
        .runtime
        .run_entry("lead", "do the thing", Some(history))
        .await
        .unwrap();

    // The child (second) request saw only its own system + user messages.
    let requests = rt.provider.captured_requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 3);
    let child_request = &requests[1];
    assert_eq!(child_request.messages.len(), 2);
    assert_eq!(child_request.messages[0].role, Role::System);
    assert_eq!(child_request.messages[1].role, Role::User);
    assert_eq!(child_request.messages[1].content.as_text(), Some("sub-task"));

    // The parent's top-level request carried the supplied history.
    let parent_request = &requests[0];
    assert!(parent_request
        .messages
        .iter()
        .any(|m| m.content.as_text() == Some("earlier context")));

    // The parent's final messages contain its own run only.
    assert!(frame
        .messages
        .iter()
        .all(|m| m.content.as_text() != Some("sub-task")));
}

// Delegation events nest at the tool-call boundary with correct depths.
#[tokio::test]
async fn delegation_event_ordering() {
    let dir = tempfile::tempdir().unwrap();
    let rt = runtime_with(
        vec![agent("lead", &["helper"]), agent("helper", &[])],
        |c| c.with_approval_policy(ApprovalPolicy::ApproveAll),
        dir.path(),
    );

    rt.provider
        .queue_tool_calls(vec![ToolCall::new("c1", "helper", json!({"input": "go"}))]);
    rt.provider.queue_response("child says hi");
    rt.provider.queue_response("parent done");

    rt.runtime.run_entry("lead", "start", None).await.unwrap();

    let events = rt.sink.events();
    let kinds: Vec<(String, u32, &'static str)> = events
        .iter()
        .map(|e| {
            let kind = match &e.payload {
                EventPayload::UserMessage { .. } => "user",
                EventPayload::ToolCall { .. } => "tool_call",
                EventPayload::ToolResult { .. } => "tool_result",
                EventPayload::TextResponseComplete { .. } => "complete",
                EventPayload::TextResponseDelta { .. } => "delta",
                EventPayload::ApprovalRequested { .. } => "approval",
                EventPayload::Error { .. } => "error",
            };
            (e.agent.clone(), e.depth, kind)
        })
        .collect();

    assert_eq!(
        kinds,
        vec![
            ("lead".to_string(), 0, "user"),
            ("lead".to_string(), 0, "tool_call"),
            ("helper".to_string(), 1, "complete"),
            ("lead".to_string(), 0, "tool_result"),
            ("lead".to_string(), 0, "complete"),
        ]
    );
}

// Unknown entries fail cleanly.
#[tokio::test]
async fn unknown_entry() {
    let dir = tempfile::tempdir().unwrap();
    let rt = runtime_with(vec![agent("greeter", &[])], |c| c, dir.path());
    let err = rt.runtime.run_entry("ghost", "hi", None).await.unwrap_err();
    assert!(matches!(err, Error::UnknownEntry(_)));
}

/// Provider that replays queued chunk sequences through `stream()`.
struct StreamingProvider {
    runs: std::sync::Mutex<Vec<Vec<tandem_core::StreamChunk>>>,
}

#[async_trait]
impl tandem_core::Provider for StreamingProvider {
    fn name(&self) -> &str {
        "streaming-mock"
    }

    fn default_model(&self) -> Option<&str> {
        None
    }

    async fn complete(
        &self,
        _request: tandem_core::CompletionRequest,
    ) -> Result<tandem_core::CompletionResponse, Error> {
        Err(Error::Unknown("streaming only".to_string()))
    }

    async fn stream(
        &self,
        _request: tandem_core::CompletionRequest,
    ) -> Result<tandem_core::StreamResult, Error> {
        let chunks = self
            .runs
            .lock()
            .unwrap()
            .pop()
            .ok_or_else(|| Error::Unknown("no chunks queued".to_string()))?;
        Ok(Box::pin(futures::stream::iter(
            chunks.into_iter().map(Ok::<_, Error>),
        )))
    }
}

// Streamed text arrives as contiguous deltas, always closed by a
// completion event carrying the full text.
#[tokio::test]
async fn streamed_deltas_end_with_completion() {
    use tandem_core::StreamChunk;

    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(
        RegistryBuilder::new()
            .with_project_root(dir.path())
            .add_agent_definition(agent("narrator", &[]), "test")
            .build()
            .unwrap(),
    );

    let provider = Arc::new(StreamingProvider {
        runs: std::sync::Mutex::new(vec![vec![
            StreamChunk::Start { model: None },
            StreamChunk::Delta {
                content: "Once ".to_string(),
            },
            StreamChunk::Delta {
                content: "upon a time".to_string(),
            },
            StreamChunk::Done { usage: None },
        ]]),
    });

    let sink = Arc::new(RecordingSink::new());
    let runtime = Runtime::new(
        registry,
        provider as Arc<dyn tandem_core::Provider>,
        RuntimeConfig::new()
            .with_sink(Arc::clone(&sink) as Arc<dyn tandem_core::EventSink>)
            .with_stream_responses(true)
            .with_project_root(dir.path()),
    );

    let (output, _) = runtime.run_entry("narrator", "tell me", None).await.unwrap();
    assert_eq!(output, "Once upon a time");

    let payloads = sink.payloads();
    let texts: Vec<String> = payloads
        .iter()
        .filter_map(|p| match p {
            EventPayload::TextResponseDelta { partial } => Some(format!("d:{partial}")),
            EventPayload::TextResponseComplete { full } => Some(format!("c:{full}")),
            _ => None,
        })
        .collect();
    assert_eq!(
        texts,
        vec![
            "d:Once ".to_string(),
            "d:upon a time".to_string(),
            "c:Once upon a time".to_string(),
        ]
    );
}

// Tool execution failures surface to the model as structured results, and
// the run recovers.
#[tokio::test]
async fn tool_error_is_recoverable() {
    let dir = tempfile::tempdir().unwrap();
    let rt = runtime_with(
        vec![agent("reader", &["filesystem_ro"])],
        |c| c.with_approval_policy(ApprovalPolicy::ApproveAll),
        dir.path(),
    );

    rt.provider.queue_tool_calls(vec![ToolCall::new(
        "c1",
        "read_file",
        json!({"path": "missing.txt"}),
    )]);
    rt.provider.queue_response("the file was missing");

    let (output, _) = rt.runtime.run_entry("reader", "read it", None).await.unwrap();
    assert_eq!(output, "the file was missing");

    let result = rt
        .sink
        .events()
        .iter()
        .find_map(|e| match &e.payload {
            EventPayload::ToolResult { result, .. } => Some(result.clone()),
            _ => None,
        })
        .unwrap();
    let parsed: Value = serde_json::from_str(&result).unwrap();
    assert_eq!(parsed["error"], "tool_execution");
}
