//! Assembly-level scenarios: manifest-driven builds from disk, code-module
//! entries and toolsets, scope cleanup, and model selection sources.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use tandem_agents::{
    CodeModule, CodeRegistry, CodeSymbol, EntryFn, FunctionEntry, Manifest, RegistryBuilder,
};
use tandem_core::testing::{MockProvider, RecordingSink};
use tandem_core::{
    Capability, Error, InputSchema, PropertySchema, ToolCall, ToolContext, ToolDefinition,
    ToolOutput, ToolParameters, Toolset, ToolsetFactory, WorkerRuntime,
};
use tandem_runtime::{Runtime, RuntimeConfig};

fn write_agent_file(dir: &std::path::Path, name: &str, body: &str) -> std::path::PathBuf {
    let path = dir.join(format!("{name}.md"));
    std::fs::write(&path, body).unwrap();
    path
}

#[tokio::test]
async fn manifest_driven_run() {
    let dir = tempfile::tempdir().unwrap();
    write_agent_file(
        dir.path(),
        "greeter",
        "---\nname: greeter\ndescription: Greets people.\n---\nGreet warmly.\n",
    );
    std::fs::write(
        dir.path().join("tandem.toml"),
        "agent_files = [\"greeter.md\"]\n\n[entry]\nname = \"greeter\"\n",
    )
    .unwrap();

    let manifest = Manifest::load(dir.path().join("tandem.toml")).unwrap();
    let registry = Arc::new(RegistryBuilder::new().with_manifest(manifest).build().unwrap());
    assert_eq!(registry.default_entry(), Some("greeter"));

    let provider = Arc::new(MockProvider::new());
    provider.queue_response("Welcome!");

    let runtime = Runtime::new(
        Arc::clone(&registry),
        Arc::clone(&provider) as Arc<dyn tandem_core::Provider>,
        RuntimeConfig::new()
            .with_policy_defaults(registry.policy())
            .with_project_root(dir.path()),
    );

    let (output, _) = runtime.run_default("hello").await.unwrap();
    assert_eq!(output, "Welcome!");

    // The agent's instructions came from the file body.
    let request = provider.last_request().unwrap();
    assert_eq!(request.messages[0].content.as_text(), Some("Greet warmly."));
}

struct Summarize;

#[async_trait]
impl EntryFn for Summarize {
    async fn call(&self, input: Value, worker: &mut WorkerRuntime<'_>) -> Result<String, Error> {
        let topic = input
            .get("topic")
            .and_then(Value::as_str)
            .unwrap_or("nothing");
        let detail = worker
            .spawn_child("expert", Value::String(format!("explain {topic}")), Vec::new())
            .await?;
        Ok(format!("summary: {detail}"))
    }
}

#[tokio::test]
async fn function_entry_delegates() {
    let dir = tempfile::tempdir().unwrap();

    let schema = InputSchema::new(
        ToolParameters::new().add_property("topic", PropertySchema::string("Topic"), true),
    );
    let entry = FunctionEntry::new("summarize", Arc::new(Summarize)).with_input_schema(schema);

    let mut code = CodeRegistry::new();
    code.register_module(CodeModule::new("entries").insert("summarize", CodeSymbol::Entry(entry)))
        .unwrap();

    let registry = Arc::new(
        RegistryBuilder::new()
            .with_code(code)
            .with_project_root(dir.path())
            .add_agent_definition(
                tandem_agents::parse_agent_file("---\nname: expert\n---\nExplain things.\n")
                    .unwrap(),
                "inline",
            )
            .build()
            .unwrap(),
    );

    let provider = Arc::new(MockProvider::new());
    provider.queue_response("a thorough explanation");

    let sink = Arc::new(RecordingSink::new());
    let runtime = Runtime::new(
        registry,
        Arc::clone(&provider) as Arc<dyn tandem_core::Provider>,
        RuntimeConfig::new()
            .with_sink(Arc::clone(&sink) as Arc<dyn tandem_core::EventSink>)
            .with_project_root(dir.path()),
    );

    let (output, frame) = runtime
        .run_entry("summarize", r#"{"topic": "lifetimes"}"#, None)
        .await
        .unwrap();
    assert_eq!(output, "summary: a thorough explanation");
    assert_eq!(frame.depth(), 0);

    // The delegated expert ran at depth 1 with the constructed prompt.
    let request = provider.last_request().unwrap();
    assert_eq!(
        request.messages[1].content.as_text(),
        Some("explain lifetimes")
    );
    assert!(sink
        .events()
        .iter()
        .any(|e| e.agent == "expert" && e.depth == 1));
}

#[tokio::test]
async fn function_entry_validates_input() {
    let dir = tempfile::tempdir().unwrap();
    let schema = InputSchema::new(
        ToolParameters::new().add_property("topic", PropertySchema::string("Topic"), true),
    );
    let entry = FunctionEntry::new("summarize", Arc::new(Summarize)).with_input_schema(schema);

    let mut code = CodeRegistry::new();
    code.register_module(CodeModule::new("entries").insert("summarize", CodeSymbol::Entry(entry)))
        .unwrap();

    let registry = Arc::new(
        RegistryBuilder::new()
            .with_code(code)
            .with_project_root(dir.path())
            .build()
            .unwrap(),
    );
    let provider = Arc::new(MockProvider::new());
    let runtime = Runtime::new(
        registry,
        provider as Arc<dyn tandem_core::Provider>,
        RuntimeConfig::new().with_project_root(dir.path()),
    );

    // Not a JSON record at all.
    let err = runtime.run_entry("summarize", "plain text", None).await.unwrap_err();
    assert!(matches!(err, Error::InputValidation { .. }));

    // A record missing the required field.
    let err = runtime.run_entry("summarize", "{}", None).await.unwrap_err();
    assert!(matches!(err, Error::InputValidation { .. }));
}

/// A toolset that counts teardown calls, registered through a code module.
struct Probe {
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl Toolset for Probe {
    fn name(&self) -> &str {
        "probe"
    }

    fn tools(&self) -> Vec<ToolDefinition> {
        vec![ToolDefinition::new("probe", "Return a constant")]
    }

    async fn call_tool(
        &self,
        _tool: &str,
        _args: Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, Error> {
        Ok(ToolOutput::success("probed"))
    }

    fn needs_approval(&self, _tool: &str, _args: &Value, _ctx: &ToolContext) -> bool {
        false
    }

    fn capabilities(&self, _tool: &str, _args: &Value) -> Vec<Capability> {
        Vec::new()
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

struct ProbeFactory {
    closes: Arc<AtomicUsize>,
    instances: Arc<AtomicUsize>,
}

impl ToolsetFactory for ProbeFactory {
    fn name(&self) -> &str {
        "probe"
    }

    fn make(&self) -> Result<Arc<dyn Toolset>, Error> {
        self.instances.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(Probe {
            closes: Arc::clone(&self.closes),
        }))
    }
}

// Every instantiated toolset's teardown hook runs exactly once per call,
// on success and on failure.
#[tokio::test]
async fn scope_teardown_runs_once_per_call() {
    let dir = tempfile::tempdir().unwrap();
    let closes = Arc::new(AtomicUsize::new(0));
    let instances = Arc::new(AtomicUsize::new(0));

    let mut code = CodeRegistry::new();
    code.register_module(CodeModule::new("probes").insert(
        "probe",
        CodeSymbol::ToolsetFactory(Arc::new(ProbeFactory {
            closes: Arc::clone(&closes),
            instances: Arc::clone(&instances),
        })),
    ))
    .unwrap();

    let registry = Arc::new(
        RegistryBuilder::new()
            .with_code(code)
            .with_project_root(dir.path())
            .add_agent_definition(
                tandem_agents::parse_agent_file("---\nname: prober\ntoolsets: [probe]\n---\nProbe.\n")
                    .unwrap(),
                "inline",
            )
            .build()
            .unwrap(),
    );

    let provider = Arc::new(MockProvider::new());
    provider.queue_tool_calls(vec![ToolCall::new("c1", "probe", json!({}))]);
    provider.queue_response("done");

    let runtime = Runtime::new(
        Arc::clone(&registry),
        Arc::clone(&provider) as Arc<dyn tandem_core::Provider>,
        RuntimeConfig::new().with_project_root(dir.path()),
    );

    runtime.run_entry("prober", "go", None).await.unwrap();
    assert_eq!(instances.load(Ordering::SeqCst), 1);
    assert_eq!(closes.load(Ordering::SeqCst), 1);

    // A failing run (no queued response) still tears the scope down.
    let _ = runtime.run_entry("prober", "again", None).await.unwrap_err();
    assert_eq!(instances.load(Ordering::SeqCst), 2);
    assert_eq!(closes.load(Ordering::SeqCst), 2);
}

// An agent that opts out of attachments neither advertises the field nor
// accepts it.
#[tokio::test]
async fn attachment_opt_out_is_enforced() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(
        RegistryBuilder::new()
            .with_project_root(dir.path())
            .add_agent_definition(
                tandem_agents::parse_agent_file(
                    "---\nname: hermit\naccepts_attachments: false\n---\nWork alone.\n",
                )
                .unwrap(),
                "inline",
            )
            .add_agent_definition(
                tandem_agents::parse_agent_file(
                    "---\nname: lead\ntoolsets: [hermit]\n---\nDelegate.\n",
                )
                .unwrap(),
                "inline",
            )
            .build()
            .unwrap(),
    );

    let provider = Arc::new(MockProvider::new());
    provider.queue_tool_calls(vec![ToolCall::new(
        "c1",
        "hermit",
        serde_json::json!({"input": "go", "attachments": ["notes.txt"]}),
    )]);
    provider.queue_response("done");

    let runtime = Runtime::new(
        registry,
        Arc::clone(&provider) as Arc<dyn tandem_core::Provider>,
        RuntimeConfig::new()
            .with_approval_policy(tandem_core::ApprovalPolicy::ApproveAll)
            .with_project_root(dir.path()),
    );

    // The first request advertised the hermit tool without an attachments
    // field.
    runtime.run_entry("lead", "go", None).await.unwrap();
    let requests = provider.captured_requests.lock().unwrap();
    let hermit_tool = requests[0]
        .tools
        .iter()
        .find(|t| t.name == "hermit")
        .unwrap();
    assert!(!hermit_tool.parameters.properties.contains_key("attachments"));

    // The call that sent attachments anyway was refused with a structured
    // error, and the run recovered.
    assert_eq!(requests.len(), 2);
    let refusal = requests[1]
        .messages
        .iter()
        .find(|m| m.tool_call_id.is_some())
        .unwrap();
    assert!(refusal
        .content
        .to_string_lossy()
        .contains("does not accept attachments"));
}

// An agent's declared model reaches the provider request.
#[tokio::test]
async fn declared_model_reaches_provider() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(
        RegistryBuilder::new()
            .with_project_root(dir.path())
            .add_agent_definition(
                tandem_agents::parse_agent_file(
                    "---\nname: modeled\nmodel: anthropic:claude-sonnet-4\n---\nBe helpful.\n",
                )
                .unwrap(),
                "inline",
            )
            .build()
            .unwrap(),
    );

    let provider = Arc::new(MockProvider::new());
    provider.queue_response("ok");

    let runtime = Runtime::new(
        registry,
        Arc::clone(&provider) as Arc<dyn tandem_core::Provider>,
        RuntimeConfig::new().with_project_root(dir.path()),
    );

    runtime.run_entry("modeled", "hi", None).await.unwrap();
    let request = provider.last_request().unwrap();
    assert_eq!(request.model.as_deref(), Some("anthropic:claude-sonnet-4"));
}

// An agent-as-tool call validates the extra schema fields and folds the
// coerced record into the child's prompt.
#[tokio::test]
async fn delegated_call_validates_schema_fields() {
    let dir = tempfile::tempdir().unwrap();

    let mut code = CodeRegistry::new();
    code.register_module(CodeModule::new("schemas").insert(
        "Review",
        CodeSymbol::Schema(InputSchema::new(ToolParameters::new().add_property(
            "severity",
            PropertySchema::string("minimum severity"),
            true,
        ))),
    ))
    .unwrap();

    let mut reviewer =
        tandem_agents::parse_agent_file("---\nname: reviewer\n---\nReview code.\n").unwrap();
    reviewer.input_model_ref = Some("schemas:Review".to_string());

    let registry = Arc::new(
        RegistryBuilder::new()
            .with_code(code)
            .with_project_root(dir.path())
            .add_agent_definition(reviewer, "inline")
            .add_agent_definition(
                tandem_agents::parse_agent_file(
                    "---\nname: lead\ntoolsets: [reviewer]\n---\nDelegate reviews.\n",
                )
                .unwrap(),
                "inline",
            )
            .build()
            .unwrap(),
    );

    let provider = Arc::new(MockProvider::new());
    provider.queue_tool_calls(vec![ToolCall::new(
        "c1",
        "reviewer",
        serde_json::json!({"input": "check the diff", "severity": "high"}),
    )]);
    provider.queue_response("looks fine");
    provider.queue_response("review done");

    let runtime = Runtime::new(
        Arc::clone(&registry),
        Arc::clone(&provider) as Arc<dyn tandem_core::Provider>,
        RuntimeConfig::new()
            .with_approval_policy(tandem_core::ApprovalPolicy::ApproveAll)
            .with_project_root(dir.path()),
    );

    runtime.run_entry("lead", "review this", None).await.unwrap();

    // The child prompt carries both the input text and the coerced record.
    let requests = provider.captured_requests.lock().unwrap();
    let child_prompt = requests[1].messages[1].content.to_string_lossy();
    assert!(child_prompt.starts_with("check the diff"));
    assert!(child_prompt.contains("\"severity\":\"high\""));
}

// Attachments on a delegated call materialize into the child's user
// message exactly once.
#[tokio::test]
async fn delegated_attachments_materialize() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("notes.txt"), "meeting notes").unwrap();

    let registry = Arc::new(
        RegistryBuilder::new()
            .with_project_root(dir.path())
            .add_agent_definition(
                tandem_agents::parse_agent_file("---\nname: scribe\n---\nSummarize notes.\n")
                    .unwrap(),
                "inline",
            )
            .add_agent_definition(
                tandem_agents::parse_agent_file(
                    "---\nname: lead\ntoolsets: [scribe]\n---\nDelegate.\n",
                )
                .unwrap(),
                "inline",
            )
            .build()
            .unwrap(),
    );

    let provider = Arc::new(MockProvider::new());
    provider.queue_tool_calls(vec![ToolCall::new(
        "c1",
        "scribe",
        serde_json::json!({"input": "summarize", "attachments": ["notes.txt"]}),
    )]);
    provider.queue_response("summary");
    provider.queue_response("done");

    let runtime = Runtime::new(
        registry,
        Arc::clone(&provider) as Arc<dyn tandem_core::Provider>,
        RuntimeConfig::new()
            .with_approval_policy(tandem_core::ApprovalPolicy::ApproveAll)
            .with_project_root(dir.path()),
    );

    runtime.run_entry("lead", "go", None).await.unwrap();

    let requests = provider.captured_requests.lock().unwrap();
    match &requests[1].messages[1].content {
        tandem_core::Content::Parts(parts) => {
            assert_eq!(parts.len(), 2);
            match &parts[1] {
                tandem_core::ContentPart::Text { text } => assert_eq!(text, "meeting notes"),
                other => panic!("expected text part, got {other:?}"),
            }
        }
        other => panic!("expected multipart content, got {other:?}"),
    }
}

// The environment model is consulted only when no other source supplies
// one, and whitespace-only values are treated as unset.
#[test]
fn env_model_blank_is_unset() {
    std::env::set_var(tandem_core::model::MODEL_ENV_VAR, "   ");
    assert_eq!(tandem_core::model::env_default_model(), None);
    std::env::set_var(tandem_core::model::MODEL_ENV_VAR, "anthropic:claude-haiku-4");
    assert_eq!(
        tandem_core::model::env_default_model().as_deref(),
        Some("anthropic:claude-haiku-4")
    );
    std::env::remove_var(tandem_core::model::MODEL_ENV_VAR);
}

// server_side_tools records pass through to the provider verbatim.
#[tokio::test]
async fn server_side_tools_pass_through() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(
        RegistryBuilder::new()
            .with_project_root(dir.path())
            .add_agent_definition(
                tandem_agents::parse_agent_file(
                    "---\nname: searcher\nserver_side_tools:\n  - {\"type\": \"web_search\"}\n---\nSearch.\n",
                )
                .unwrap(),
                "inline",
            )
            .build()
            .unwrap(),
    );

    let provider = Arc::new(MockProvider::new());
    provider.queue_response("found it");

    let runtime = Runtime::new(
        registry,
        Arc::clone(&provider) as Arc<dyn tandem_core::Provider>,
        RuntimeConfig::new().with_project_root(dir.path()),
    );

    runtime.run_entry("searcher", "find x", None).await.unwrap();
    let request = provider.last_request().unwrap();
    assert_eq!(
        request.extra["server_side_tools"],
        json!([{"type": "web_search"}])
    );
}
