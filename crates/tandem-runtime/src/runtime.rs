//! The runtime facade and call-frame scheduler.
//!
//! `Runtime::run_entry` materializes an entry's toolset plane inside a fresh
//! `CallScope`, wraps every member with the approval gate, builds the
//! top-level `CallFrame`, and dispatches. Delegation forks child frames with
//! incremented depth and empty message history; the `max_depth` invariant is
//! the sole termination guarantee for cyclic agent references.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use tandem_agents::{Entry, Registry, ResolvedAgent, ToolsetRef};
use tandem_core::{
    model, CallConfig, CallFrame, CallScope, Capability, Delegator, Error, EventPayload,
    FrameState, Message, Provider, RuntimeEvent, SessionApprovals, ToolContext, ToolDefinition,
    ToolOutput, Toolset, WorkerRuntime,
};
use tandem_tools::ApprovalGate;

use crate::agent_toolset::AgentToolset;
use crate::config::RuntimeConfig;
use crate::dynamic::{DynamicAgentToolset, GeneratedAgentsArea};
use crate::runner;

/// Identity of the frame issuing a delegation: everything a child needs
/// from its caller.
#[derive(Clone)]
pub struct CallerInfo {
    pub name: String,
    pub depth: u32,
    pub model: Option<String>,
}

pub(crate) struct RuntimeInner {
    pub registry: Arc<Registry>,
    pub config: RuntimeConfig,
    pub provider: Arc<dyn Provider>,
    pub session: Arc<SessionApprovals>,
    pub generated_area: GeneratedAgentsArea,
}

/// One runtime per top-level user request. Not re-entrant; concurrent runs
/// need independent instances.
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    pub fn new(registry: Arc<Registry>, provider: Arc<dyn Provider>, config: RuntimeConfig) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                registry,
                config,
                provider,
                session: Arc::new(SessionApprovals::new()),
                generated_area: GeneratedAgentsArea::new(),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    /// Run the registry's default entry.
    pub async fn run_default(&self, prompt: &str) -> Result<(String, CallFrame), Error> {
        let entry = self
            .inner
            .registry
            .default_entry()
            .ok_or_else(|| Error::config("manifest declares no default entry"))?
            .to_string();
        self.run_entry(&entry, prompt, None).await
    }

    /// Execute a named entry against a prompt.
    ///
    /// `message_history` seeds the top-level frame only; delegated calls
    /// always start from an empty history. An `Error` event is published
    /// before any failure propagates.
    pub async fn run_entry(
        &self,
        entry: &str,
        prompt: &str,
        message_history: Option<Vec<Message>>,
    ) -> Result<(String, CallFrame), Error> {
        if self.inner.config.verbosity > 0 {
            tracing::info!(entry, prompt_len = prompt.len(), "run_entry");
        }
        let result = self.run_entry_inner(entry, prompt, message_history).await;
        if let Err(e) = &result {
            self.inner
                .config
                .sink
                .on_event(RuntimeEvent::new(
                    entry,
                    0,
                    EventPayload::Error {
                        kind: e.kind().to_string(),
                        message: e.to_string(),
                    },
                ))
                .await;
        }
        result
    }

    async fn run_entry_inner(
        &self,
        entry: &str,
        prompt: &str,
        message_history: Option<Vec<Message>>,
    ) -> Result<(String, CallFrame), Error> {
        let inner = &self.inner;
        match inner.registry.entry(entry)? {
            Entry::Agent(agent) => self.run_agent_entry(agent, prompt, message_history).await,
            Entry::Function(function) => {
                let caller = CallerInfo {
                    name: function.entry.name.clone(),
                    depth: 0,
                    model: inner.config.cli_model.clone(),
                };
                let plane = inner.materialize_plane(&function.plane, &caller)?;
                let scope = CallScope::new(plane.clone());
                let config = CallConfig::new(
                    plane,
                    caller.model.clone(),
                    0,
                    function.entry.name.clone(),
                );
                let mut frame =
                    CallFrame::new(config, prompt, message_history.unwrap_or_default());

                let input = match &function.entry.input_schema {
                    Some(schema) => {
                        let parsed: Value = serde_json::from_str(prompt).map_err(|e| {
                            Error::input_validation(
                                &function.entry.name,
                                format!("prompt is not a JSON record: {e}"),
                            )
                        })?;
                        schema.validate(&function.entry.name, &parsed)?
                    }
                    None => Value::String(prompt.to_string()),
                };

                let ctx = inner.tool_context(&frame.config);
                ctx.emit(EventPayload::UserMessage {
                    content: prompt.to_string(),
                })
                .await;

                frame.state = FrameState::Dispatched;
                let delegator: Arc<dyn Delegator> = Arc::new(RuntimeDelegator {
                    inner: Arc::clone(inner),
                    caller,
                });

                frame.state = FrameState::Running;
                let result = {
                    let mut worker = WorkerRuntime::new(&mut frame, ctx, delegator);
                    function.entry.handler.call(input, &mut worker).await
                };
                scope.close().await;

                match result {
                    Ok(output) => {
                        frame.state = FrameState::Completed;
                        Ok((output, frame))
                    }
                    Err(e) => {
                        frame.state = terminal_state(&e);
                        Err(e)
                    }
                }
            }
        }
    }

    async fn run_agent_entry(
        &self,
        agent: Arc<ResolvedAgent>,
        prompt: &str,
        message_history: Option<Vec<Message>>,
    ) -> Result<(String, CallFrame), Error> {
        let inner = &self.inner;
        let spec = &agent.spec;

        let model = inner.select_model(spec, None, true)?;

        if let Some(schema) = &spec.input_schema {
            let parsed: Value = serde_json::from_str(prompt).map_err(|e| {
                Error::input_validation(&spec.name, format!("prompt is not a JSON record: {e}"))
            })?;
            schema.validate(&spec.name, &parsed)?;
        }

        let caller = CallerInfo {
            name: spec.name.clone(),
            depth: 0,
            model: model.clone(),
        };
        let plane = inner.materialize_plane(&agent.plane, &caller)?;
        let scope = CallScope::new(plane.clone());
        let config = CallConfig::new(plane, model, 0, spec.name.clone());
        let mut frame = CallFrame::new(config, prompt, message_history.unwrap_or_default());

        inner
            .tool_context(&frame.config)
            .emit(EventPayload::UserMessage {
                content: prompt.to_string(),
            })
            .await;

        frame.state = FrameState::Dispatched;
        let result = runner::run_agent_frame(inner, spec, &mut frame, Vec::new()).await;
        scope.close().await;

        match result {
            Ok(output) => {
                frame.state = FrameState::Completed;
                Ok((output, frame))
            }
            Err(e) => {
                frame.state = terminal_state(&e);
                Err(e)
            }
        }
    }
}

fn terminal_state(err: &Error) -> FrameState {
    if err.is_permission_denied() {
        FrameState::Denied
    } else {
        FrameState::Failed
    }
}

impl RuntimeInner {
    pub(crate) fn tool_context(&self, config: &CallConfig) -> ToolContext {
        ToolContext::new(
            config.invocation_name.clone(),
            config.depth,
            self.config.project_root.clone(),
            Arc::clone(&self.config.sink),
        )
    }

    /// Effective model selection: the forced CLI override (skipped on
    /// delegation when it violates the agent's compatibility patterns),
    /// then the agent's declared model, then the caller's, then the
    /// environment default. The final choice must satisfy
    /// `compatible_models`.
    pub(crate) fn select_model(
        &self,
        spec: &tandem_agents::AgentSpec,
        inherited: Option<&str>,
        top_level: bool,
    ) -> Result<Option<String>, Error> {
        let patterns = &spec.compatible_models;
        let fits = |m: &str| patterns.is_empty() || model::matches_any(patterns, m);

        let mut selected: Option<String> = None;
        if let Some(cli) = &self.config.cli_model {
            if top_level || fits(cli) {
                selected = Some(cli.clone());
            }
        }
        if selected.is_none() {
            selected = spec.model.clone();
        }
        if selected.is_none() {
            selected = inherited.map(str::to_string);
        }
        if selected.is_none() {
            selected = model::env_default_model();
        }

        if let Some(chosen) = &selected {
            if !fits(chosen) {
                return Err(Error::IncompatibleModel {
                    agent: spec.name.clone(),
                    model: chosen.clone(),
                    allowed: patterns.clone(),
                });
            }
        }
        Ok(selected)
    }

    /// Materialize a resolved plane into per-call toolset instances, each
    /// wrapped with the approval gate. Duplicate tool names across the
    /// plane are a build error.
    pub(crate) fn materialize_plane(
        self: &Arc<Self>,
        refs: &[ToolsetRef],
        caller: &CallerInfo,
    ) -> Result<Vec<Arc<dyn Toolset>>, Error> {
        let mut plane: Vec<Arc<dyn Toolset>> = Vec::with_capacity(refs.len());

        for toolset_ref in refs {
            let raw: Arc<dyn Toolset> = match toolset_ref {
                ToolsetRef::Factory(factory) => factory.make()?,
                // Pre-instantiated toolsets outlive any one call; the scope
                // must not tear them down.
                ToolsetRef::Instance(shared) => Arc::new(SharedToolset {
                    inner: Arc::clone(shared),
                }),
                ToolsetRef::Agent(name) => {
                    let target = self
                        .registry
                        .agent(name)
                        .ok_or_else(|| Error::UnknownEntry(name.clone()))?;
                    Arc::new(AgentToolset::new(Arc::clone(self), target, caller.clone()))
                }
                ToolsetRef::DynamicAgents => {
                    Arc::new(DynamicAgentToolset::new(Arc::clone(self), caller.clone()))
                }
            };

            plane.push(Arc::new(ApprovalGate::new(
                raw,
                self.config.policy,
                self.config.approval_callback.clone(),
                Arc::clone(&self.session),
                self.config.return_permission_errors,
            )));
        }

        let mut seen: std::collections::HashMap<String, String> = std::collections::HashMap::new();
        for toolset in &plane {
            for tool in toolset.tools() {
                if let Some(previous) = seen.insert(tool.name.clone(), toolset.name().to_string()) {
                    return Err(Error::config(format!(
                        "'{}': tool '{}' provided by both '{previous}' and '{}'",
                        caller.name,
                        tool.name,
                        toolset.name()
                    )));
                }
            }
        }

        Ok(plane)
    }

    /// Fork and run a child frame for `target`.
    ///
    /// The child starts with an empty message list; the delegation never
    /// shares the caller's conversation history.
    pub(crate) async fn spawn_child(
        self: &Arc<Self>,
        caller: &CallerInfo,
        target: &str,
        input: String,
        extra_input: Option<Value>,
        attachments: Vec<String>,
    ) -> Result<String, Error> {
        let depth = caller.depth + 1;
        if depth > self.config.max_depth {
            return Err(Error::MaxDepthExceeded {
                caller: caller.name.clone(),
                callee: target.to_string(),
                depth,
                max: self.config.max_depth,
            });
        }

        let resolved = self
            .registry
            .agent(target)
            .ok_or_else(|| Error::UnknownEntry(target.to_string()))?;
        let spec = &resolved.spec;

        let model = self.select_model(spec, caller.model.as_deref(), false)?;

        let mut prompt = input;
        if let Some(schema) = &spec.input_schema {
            let record = extra_input.unwrap_or_else(|| Value::Object(Default::default()));
            let coerced = schema.validate(&spec.name, &record)?;
            if coerced.as_object().map(|o| !o.is_empty()).unwrap_or(false) {
                prompt = format!("{prompt}\n\nInput:\n{coerced}");
            }
        }

        let child_caller = CallerInfo {
            name: spec.name.clone(),
            depth,
            model: model.clone(),
        };
        let plane = self.materialize_plane(&resolved.plane, &child_caller)?;
        let scope = CallScope::new(plane.clone());
        let config = CallConfig::new(plane, model, depth, spec.name.clone());
        let mut frame = CallFrame::new(config, prompt, Vec::new());

        tracing::debug!(
            caller = %caller.name,
            callee = %spec.name,
            depth,
            "delegating to agent"
        );

        frame.state = FrameState::Dispatched;
        let result = runner::run_agent_frame(self, spec, &mut frame, attachments).await;
        scope.close().await;

        frame.state = match &result {
            Ok(_) => FrameState::Completed,
            Err(e) => terminal_state(e),
        };
        result
    }
}

/// `Delegator` handle issued to function entries through `WorkerRuntime`.
struct RuntimeDelegator {
    inner: Arc<RuntimeInner>,
    caller: CallerInfo,
}

#[async_trait]
impl Delegator for RuntimeDelegator {
    async fn spawn_child(
        &self,
        agent: &str,
        input: Value,
        attachments: Vec<String>,
    ) -> Result<String, Error> {
        let (text, extra) = match input {
            Value::String(s) => (s, None),
            other => (String::new(), Some(other)),
        };
        self.inner
            .spawn_child(&self.caller, agent, text, extra, attachments)
            .await
    }
}

/// Adapter that exempts a shared (pre-instantiated) toolset from per-scope
/// teardown.
struct SharedToolset {
    inner: Arc<dyn Toolset>,
}

#[async_trait]
impl Toolset for SharedToolset {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn tools(&self) -> Vec<ToolDefinition> {
        self.inner.tools()
    }

    async fn call_tool(
        &self,
        tool: &str,
        args: Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, Error> {
        self.inner.call_tool(tool, args, ctx).await
    }

    fn needs_approval(&self, tool: &str, args: &Value, ctx: &ToolContext) -> bool {
        self.inner.needs_approval(tool, args, ctx)
    }

    fn describe_approval(&self, tool: &str, args: &Value, ctx: &ToolContext) -> String {
        self.inner.describe_approval(tool, args, ctx)
    }

    fn approval_args(&self, tool: &str, args: &Value) -> Value {
        self.inner.approval_args(tool, args)
    }

    fn capabilities(&self, tool: &str, args: &Value) -> Vec<Capability> {
        self.inner.capabilities(tool, args)
    }

    fn error_is_fatal(&self, err: &Error) -> bool {
        self.inner.error_is_fatal(err)
    }

    async fn close(&self) {
        // Owned by the registry, not this scope.
    }
}
