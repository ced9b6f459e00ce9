//! Declarative definitions owned by the registry: agent specs, function
//! entries, and registered function tools.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tandem_core::{Error, InputSchema, ToolDefinition, ToolOutput, WorkerRuntime};

fn default_true() -> bool {
    true
}

/// Declarative configuration for an LLM agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    /// Unique within the registry.
    pub name: String,

    /// Surface description used when the agent is exposed as a tool.
    #[serde(default)]
    pub description: Option<String>,

    /// System prompt text.
    pub instructions: String,

    /// Provider-qualified model identifier, e.g. `anthropic:claude-sonnet-4`.
    #[serde(default)]
    pub model: Option<String>,

    /// Ordered names of toolsets this agent may use.
    #[serde(default)]
    pub toolset_refs: Vec<String>,

    /// Structured-record schema the input must conform to, if any.
    #[serde(default)]
    pub input_schema: Option<InputSchema>,

    /// Glob patterns the effective model must match, when non-empty.
    #[serde(default)]
    pub compatible_models: Vec<String>,

    /// Opaque records passed through to the provider verbatim.
    #[serde(default)]
    pub server_side_tools: Vec<Value>,

    /// Per-agent override of the manifest's agent-call approval default.
    #[serde(default)]
    pub calls_require_approval: Option<bool>,

    /// Whether the agent's tool surface advertises an attachments field.
    #[serde(default = "default_true")]
    pub accepts_attachments: bool,
}

impl AgentSpec {
    pub fn new(name: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            instructions: instructions.into(),
            model: None,
            toolset_refs: Vec::new(),
            input_schema: None,
            compatible_models: Vec::new(),
            server_side_tools: Vec::new(),
            calls_require_approval: None,
            accepts_attachments: true,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_toolsets<I, S>(mut self, refs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.toolset_refs = refs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_compatible_models<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.compatible_models = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Description used on the agent's tool surface: the declared
    /// description, or a prefix of the instructions.
    pub fn tool_description(&self, max_len: usize) -> String {
        let source = self
            .description
            .as_deref()
            .unwrap_or(self.instructions.as_str());
        let trimmed = source.trim().replace('\n', " ");
        if trimmed.chars().count() <= max_len {
            trimmed
        } else {
            let cut: String = trimmed.chars().take(max_len).collect();
            format!("{cut}…")
        }
    }
}

/// Async handler behind a function entry.
#[async_trait]
pub trait EntryFn: Send + Sync {
    async fn call(&self, input: Value, worker: &mut WorkerRuntime<'_>) -> Result<String, Error>;
}

/// A declarative code-callable entry.
#[derive(Clone)]
pub struct FunctionEntry {
    pub name: String,
    pub handler: Arc<dyn EntryFn>,
    pub toolset_refs: Vec<String>,
    pub input_schema: Option<InputSchema>,
}

impl FunctionEntry {
    pub fn new(name: impl Into<String>, handler: Arc<dyn EntryFn>) -> Self {
        Self {
            name: name.into(),
            handler,
            toolset_refs: Vec::new(),
            input_schema: None,
        }
    }

    pub fn with_toolsets<I, S>(mut self, refs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.toolset_refs = refs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_input_schema(mut self, schema: InputSchema) -> Self {
        self.input_schema = Some(schema);
        self
    }
}

impl std::fmt::Debug for FunctionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionEntry")
            .field("name", &self.name)
            .field("toolset_refs", &self.toolset_refs)
            .finish_non_exhaustive()
    }
}

/// Async handler behind a registered function tool.
#[async_trait]
pub trait ToolFn: Send + Sync {
    async fn call(&self, args: Value) -> Result<ToolOutput, Error>;
}

/// A reference-able standalone tool registered from code.
#[derive(Clone)]
pub struct FunctionTool {
    pub definition: ToolDefinition,
    pub handler: Arc<dyn ToolFn>,
    /// Whether invocations require approval (defaults to false; plain
    /// function tools are assumed side-effect free unless declared).
    pub requires_approval: bool,
}

impl FunctionTool {
    pub fn new(definition: ToolDefinition, handler: Arc<dyn ToolFn>) -> Self {
        Self {
            definition,
            handler,
            requires_approval: false,
        }
    }

    pub fn with_approval(mut self, required: bool) -> Self {
        self.requires_approval = required;
        self
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }
}

impl std::fmt::Debug for FunctionTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionTool")
            .field("name", &self.definition.name)
            .finish_non_exhaustive()
    }
}
