//! The toolset capability: a named group of tools behind one dispatch,
//! approval, and teardown surface.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Error;
use crate::event::{EventPayload, EventSink, RuntimeEvent};
use crate::tool::{ToolDefinition, ToolOutput};

/// Coarse capability classification for a tool invocation, consumed by the
/// approval layer and by the scheduler's delegation pre-checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ReadFs,
    WriteFs,
    Exec,
    Network,
    Delegate,
}

/// Per-invocation context handed to toolsets.
///
/// Carries the identity of the calling frame and the event emitter; toolsets
/// never see concrete UI event types, only `EventPayload` values.
#[derive(Clone)]
pub struct ToolContext {
    pub agent: String,
    pub depth: u32,
    pub project_root: PathBuf,
    sink: Arc<dyn EventSink>,
}

impl ToolContext {
    pub fn new(
        agent: impl Into<String>,
        depth: u32,
        project_root: PathBuf,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            agent: agent.into(),
            depth,
            project_root,
            sink,
        }
    }

    /// Publish an event from this call's frame.
    pub async fn emit(&self, payload: EventPayload) {
        self.sink
            .on_event(RuntimeEvent::new(&self.agent, self.depth, payload))
            .await;
    }
}

/// A group of tools exposed to one model loop.
///
/// Instances are per-call: the scheduler materializes them when a frame is
/// built and the owning `CallScope` closes them when the call ends.
#[async_trait]
pub trait Toolset: Send + Sync {
    fn name(&self) -> &str;

    /// Lazy snapshot of the tools this set currently exposes.
    fn tools(&self) -> Vec<ToolDefinition>;

    async fn call_tool(
        &self,
        tool: &str,
        args: Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, Error>;

    /// Whether this invocation must be confirmed by the approval callback.
    fn needs_approval(&self, tool: &str, args: &Value, ctx: &ToolContext) -> bool;

    /// The arguments that define this invocation's approval scope.
    ///
    /// A session-tier approval caches `(tool, approval_args)`; fields that
    /// vary per prompt without changing what the user consented to should
    /// be excluded. The default strips the `description` field only.
    fn approval_args(&self, tool: &str, args: &Value) -> Value {
        let _ = tool;
        match args {
            Value::Object(map) => Value::Object(
                map.iter()
                    .filter(|(k, _)| k.as_str() != "description")
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Human-readable description shown in the approval request.
    fn describe_approval(&self, tool: &str, args: &Value, ctx: &ToolContext) -> String {
        let _ = ctx;
        format!("{}({})", tool, args)
    }

    fn capabilities(&self, tool: &str, args: &Value) -> Vec<Capability>;

    /// Whether a `call_tool` failure should abort the run instead of being
    /// surfaced to the model as a structured error result.
    fn error_is_fatal(&self, err: &Error) -> bool {
        let _ = err;
        false
    }

    /// Teardown hook. Must be idempotent; called exactly once per scope by
    /// the owning `CallScope`, on every exit path including cancellation.
    async fn close(&self) {}
}

/// Produces a fresh toolset instance for one call.
pub trait ToolsetFactory: Send + Sync {
    fn name(&self) -> &str;

    fn make(&self) -> Result<Arc<dyn Toolset>, Error>;
}

/// A factory wrapping a plain closure.
pub struct FnToolsetFactory<F> {
    name: String,
    make_fn: F,
}

impl<F> FnToolsetFactory<F>
where
    F: Fn() -> Result<Arc<dyn Toolset>, Error> + Send + Sync,
{
    pub fn new(name: impl Into<String>, make_fn: F) -> Self {
        Self {
            name: name.into(),
            make_fn,
        }
    }
}

impl<F> ToolsetFactory for FnToolsetFactory<F>
where
    F: Fn() -> Result<Arc<dyn Toolset>, Error> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn make(&self) -> Result<Arc<dyn Toolset>, Error> {
        (self.make_fn)()
    }
}
