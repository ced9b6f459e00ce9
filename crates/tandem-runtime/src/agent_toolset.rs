//! Agent-as-tool: each registered agent is exposed to other agents as a
//! toolset with a single tool named for the agent. Invoking it forks a
//! child call frame.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use tandem_agents::ResolvedAgent;
use tandem_core::{
    Capability, Error, PropertySchema, ToolContext, ToolDefinition, ToolOutput, ToolParameters,
    Toolset,
};

use crate::runtime::{CallerInfo, RuntimeInner};

/// Cap on the tool-surface description derived from agent instructions.
const TOOL_DESCRIPTION_MAX_CHARS: usize = 200;

pub struct AgentToolset {
    runtime: Arc<RuntimeInner>,
    target: Arc<ResolvedAgent>,
    caller: CallerInfo,
}

impl AgentToolset {
    pub(crate) fn new(
        runtime: Arc<RuntimeInner>,
        target: Arc<ResolvedAgent>,
        caller: CallerInfo,
    ) -> Self {
        Self {
            runtime,
            target,
            caller,
        }
    }

    fn split_args(&self, args: Value) -> Result<(String, Option<Value>, Vec<String>), Error> {
        let name = &self.target.spec.name;
        let Value::Object(mut map) = args else {
            return Err(Error::tool(name.clone(), "arguments must be an object"));
        };

        let input = match map.remove("input") {
            Some(Value::String(s)) => s,
            Some(other) => other.to_string(),
            None => {
                return Err(Error::tool(name.clone(), "missing required field 'input'"));
            }
        };

        let attachments = match map.remove("attachments") {
            None | Some(Value::Null) => Vec::new(),
            Some(_) if !self.target.spec.accepts_attachments => {
                return Err(Error::tool(
                    name.clone(),
                    format!("agent '{name}' does not accept attachments"),
                ));
            }
            Some(Value::Array(items)) => items
                .into_iter()
                .map(|v| match v {
                    Value::String(s) => Ok(s),
                    other => Err(Error::tool(
                        name.clone(),
                        format!("attachment entries must be strings, got {other}"),
                    )),
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(other) => {
                return Err(Error::tool(
                    name.clone(),
                    format!("'attachments' must be a list, got {other}"),
                ));
            }
        };

        let extra = if map.is_empty() {
            None
        } else {
            Some(Value::Object(map))
        };
        Ok((input, extra, attachments))
    }
}

#[async_trait]
impl Toolset for AgentToolset {
    fn name(&self) -> &str {
        &self.target.spec.name
    }

    fn tools(&self) -> Vec<ToolDefinition> {
        let spec = &self.target.spec;
        let mut parameters = ToolParameters::new().add_property(
            "input",
            PropertySchema::string(
                "The task or question for the agent. Describe what you want \
                 to achieve; the agent decides how.",
            ),
            true,
        );

        // The attachments field exists only for agents whose policy
        // permits them.
        if spec.accepts_attachments {
            parameters = parameters.add_property(
                "attachments",
                PropertySchema::array(
                    "Paths or URLs of attachments to pass along",
                    PropertySchema::string("Attachment path or URL"),
                ),
                false,
            );
        }

        if let Some(schema) = &spec.input_schema {
            for (field, property) in &schema.record.properties {
                let required = schema.record.required.contains(field);
                parameters = parameters.add_property(field.clone(), property.clone(), required);
            }
        }

        vec![
            ToolDefinition::new(&spec.name, spec.tool_description(TOOL_DESCRIPTION_MAX_CHARS))
                .with_parameters(parameters),
        ]
    }

    async fn call_tool(
        &self,
        tool: &str,
        args: Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, Error> {
        if tool != self.target.spec.name {
            return Err(Error::UnknownTool(tool.to_string()));
        }
        let (input, extra, attachments) = self.split_args(args)?;
        let output = self
            .runtime
            .spawn_child(&self.caller, &self.target.spec.name, input, extra, attachments)
            .await?;
        Ok(ToolOutput::success(output))
    }

    fn needs_approval(&self, _tool: &str, args: &Value, _ctx: &ToolContext) -> bool {
        let spec = &self.target.spec;
        let base = spec
            .calls_require_approval
            .unwrap_or(self.runtime.config.agent_calls_require_approval);
        if base {
            return true;
        }
        // Attachments may carry files out of the project; they can be
        // gated independently of plain agent calls.
        let has_attachments = args
            .get("attachments")
            .and_then(Value::as_array)
            .map(|a| !a.is_empty())
            .unwrap_or(false);
        has_attachments && self.runtime.config.agent_attachments_require_approval
    }

    fn approval_args(&self, _tool: &str, _args: &Value) -> Value {
        // Approving an agent for the session approves the agent, not one
        // specific task.
        serde_json::json!({"agent": self.target.spec.name})
    }

    fn describe_approval(&self, _tool: &str, args: &Value, _ctx: &ToolContext) -> String {
        let input = args.get("input").and_then(Value::as_str).unwrap_or("?");
        let preview: String = input.chars().take(120).collect();
        format!("call agent '{}': {preview}", self.target.spec.name)
    }

    fn capabilities(&self, _tool: &str, _args: &Value) -> Vec<Capability> {
        vec![Capability::Delegate]
    }
}
