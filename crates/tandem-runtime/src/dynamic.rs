//! Dynamic agent creation: a toolset that lets a running agent define new
//! agents and call them within the same process run.
//!
//! Created definitions are written to a per-process scratch area and
//! registered in the live registry's generated section, which only grows.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tempfile::TempDir;

use tandem_agents::{to_agent_file, AgentDefinition};
use tandem_core::{
    Capability, Error, PropertySchema, ToolContext, ToolDefinition, ToolOutput, ToolParameters,
    Toolset,
};

use crate::runtime::{CallerInfo, RuntimeInner};

/// Per-process directory holding generated agent definition files.
pub struct GeneratedAgentsArea {
    dir: Mutex<Option<TempDir>>,
}

impl GeneratedAgentsArea {
    pub fn new() -> Self {
        Self {
            dir: Mutex::new(None),
        }
    }

    /// Write a definition file; the directory is created on first use and
    /// lives until the process exits.
    pub fn write(&self, definition: &AgentDefinition) -> Result<PathBuf, Error> {
        let mut guard = self
            .dir
            .lock()
            .map_err(|_| Error::Unknown("generated agents area lock poisoned".to_string()))?;
        if guard.is_none() {
            *guard = Some(tempfile::tempdir().map_err(|e| {
                Error::config(format!("failed to create generated agents area: {e}"))
            })?);
        }
        let dir = guard
            .as_ref()
            .ok_or_else(|| Error::Unknown("generated agents area unavailable".to_string()))?;
        let path = dir.path().join(format!("{}.md", definition.name));
        std::fs::write(&path, to_agent_file(definition))
            .map_err(|e| Error::tool("agent_create", format!("failed to write definition: {e}")))?;
        Ok(path)
    }
}

impl Default for GeneratedAgentsArea {
    fn default() -> Self {
        Self::new()
    }
}

pub struct DynamicAgentToolset {
    runtime: Arc<RuntimeInner>,
    caller: CallerInfo,
}

#[derive(Deserialize)]
struct CreateArgs {
    name: String,
    instructions: String,
    #[serde(default)]
    toolsets: Vec<String>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Deserialize)]
struct CallArgs {
    name: String,
    input: String,
    #[serde(default)]
    attachments: Vec<String>,
}

impl DynamicAgentToolset {
    pub(crate) fn new(runtime: Arc<RuntimeInner>, caller: CallerInfo) -> Self {
        Self { runtime, caller }
    }

    async fn agent_create(&self, args: CreateArgs) -> Result<ToolOutput, Error> {
        let definition = AgentDefinition {
            name: args.name.clone(),
            description: None,
            model: args.model,
            toolsets: args.toolsets,
            input_model_ref: None,
            compatible_models: Vec::new(),
            server_side_tools: Vec::new(),
            calls_require_approval: None,
            accepts_attachments: true,
            instructions: args.instructions,
        };

        self.runtime.registry.add_generated(definition.clone())?;
        let path = self.runtime.generated_area.write(&definition)?;

        tracing::info!(agent = %args.name, path = %path.display(), "created dynamic agent");
        Ok(ToolOutput::success(
            json!({"created": args.name, "path": path.display().to_string()}).to_string(),
        ))
    }

    async fn agent_call(&self, args: CallArgs) -> Result<ToolOutput, Error> {
        let output = self
            .runtime
            .spawn_child(&self.caller, &args.name, args.input, None, args.attachments)
            .await?;
        Ok(ToolOutput::success(output))
    }
}

#[async_trait]
impl Toolset for DynamicAgentToolset {
    fn name(&self) -> &str {
        "agents"
    }

    fn tools(&self) -> Vec<ToolDefinition> {
        vec![
            ToolDefinition::new(
                "agent_create",
                "Define and register a new agent for this run",
            )
            .with_parameters(
                ToolParameters::new()
                    .add_property("name", PropertySchema::string("Unique agent name"), true)
                    .add_property(
                        "instructions",
                        PropertySchema::string("System prompt for the new agent"),
                        true,
                    )
                    .add_property(
                        "toolsets",
                        PropertySchema::array(
                            "Toolset names the new agent may use",
                            PropertySchema::string("Toolset name"),
                        ),
                        false,
                    )
                    .add_property(
                        "model",
                        PropertySchema::string("Optional model override"),
                        false,
                    ),
            ),
            ToolDefinition::new("agent_call", "Invoke a previously created agent")
                .with_parameters(
                    ToolParameters::new()
                        .add_property("name", PropertySchema::string("Agent to call"), true)
                        .add_property(
                            "input",
                            PropertySchema::string("The task or question for the agent"),
                            true,
                        )
                        .add_property(
                            "attachments",
                            PropertySchema::array(
                                "Paths or URLs of attachments to pass along",
                                PropertySchema::string("Attachment path or URL"),
                            ),
                            false,
                        ),
                ),
        ]
    }

    async fn call_tool(
        &self,
        tool: &str,
        args: Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, Error> {
        match tool {
            "agent_create" => {
                let args: CreateArgs = serde_json::from_value(args)
                    .map_err(|e| Error::tool("agent_create", format!("invalid arguments: {e}")))?;
                self.agent_create(args).await
            }
            "agent_call" => {
                let args: CallArgs = serde_json::from_value(args)
                    .map_err(|e| Error::tool("agent_call", format!("invalid arguments: {e}")))?;
                self.agent_call(args).await
            }
            other => Err(Error::UnknownTool(other.to_string())),
        }
    }

    fn needs_approval(&self, tool: &str, args: &Value, _ctx: &ToolContext) -> bool {
        match tool {
            // Calls to agents created earlier in this run are pre-approved;
            // creation implies consent.
            "agent_call" => {
                let name = args.get("name").and_then(Value::as_str).unwrap_or("");
                if self.runtime.registry.is_generated(name) {
                    false
                } else {
                    self.runtime.config.agent_calls_require_approval
                }
            }
            _ => self.runtime.config.agent_calls_require_approval,
        }
    }

    fn approval_args(&self, tool: &str, args: &Value) -> Value {
        let name = args.get("name").and_then(Value::as_str).unwrap_or("");
        json!({"op": tool, "agent": name})
    }

    fn describe_approval(&self, tool: &str, args: &Value, _ctx: &ToolContext) -> String {
        match tool {
            "agent_create" => {
                let name = args.get("name").and_then(Value::as_str).unwrap_or("?");
                format!("create agent '{name}'")
            }
            "agent_call" => {
                let name = args.get("name").and_then(Value::as_str).unwrap_or("?");
                let input = args.get("input").and_then(Value::as_str).unwrap_or("");
                let preview: String = input.chars().take(120).collect();
                format!("call agent '{name}': {preview}")
            }
            other => format!("{other}({args})"),
        }
    }

    fn capabilities(&self, tool: &str, _args: &Value) -> Vec<Capability> {
        match tool {
            "agent_call" => vec![Capability::Delegate],
            _ => Vec::new(),
        }
    }
}
