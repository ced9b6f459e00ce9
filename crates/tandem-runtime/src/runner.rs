//! The agent runner: drives one model agent against a call frame.
//!
//! Builds the per-call message list (instructions, history at depth 0 only,
//! the prompt with materialized attachments), runs the model loop, routes
//! tool calls through the plane with events on both sides, and overwrites
//! the frame's messages with the final list on completion.

use std::sync::Arc;

use futures::StreamExt;
use serde_json::{json, Value};

use tandem_agents::AgentSpec;
use tandem_core::{
    CallFrame, Capability, CompletionRequest, Content, ContentPart, Error, EventPayload, Message,
    StreamChunk, ToolCall, ToolContext, Toolset,
};
use tandem_tools::AttachmentsToolset;

use crate::runtime::RuntimeInner;

pub(crate) async fn run_agent_frame(
    inner: &Arc<RuntimeInner>,
    spec: &AgentSpec,
    frame: &mut CallFrame,
    attachments: Vec<String>,
) -> Result<String, Error> {
    // The effective model was selected by the scheduler; the runner
    // re-validates it against the agent's compatibility patterns before
    // any provider call.
    if let Some(model) = &frame.config.model {
        if !spec.compatible_models.is_empty()
            && !tandem_core::model::matches_any(&spec.compatible_models, model)
        {
            return Err(Error::IncompatibleModel {
                agent: spec.name.clone(),
                model: model.clone(),
                allowed: spec.compatible_models.clone(),
            });
        }
    }

    let ctx = inner.tool_context(&frame.config);

    tracing::debug!(
        agent = %spec.name,
        depth = frame.config.depth,
        history = frame.messages.len(),
        toolsets = frame.config.active_toolsets.len(),
        "agent run starting"
    );

    let mut messages = Vec::new();
    messages.push(Message::system(spec.instructions.as_str()));

    // Delegated calls never receive the caller's conversation history.
    if frame.config.depth == 0 {
        messages.extend(frame.messages.clone());
    }

    // Attachment materialization happens exactly once, here.
    messages.push(user_message(inner, &frame.prompt, &attachments).await?);

    let tool_definitions: Vec<_> = frame
        .config
        .active_toolsets
        .iter()
        .flat_map(|ts| ts.tools())
        .collect();

    let mut extra = std::collections::HashMap::new();
    if !spec.server_side_tools.is_empty() {
        extra.insert(
            "server_side_tools".to_string(),
            Value::Array(spec.server_side_tools.clone()),
        );
    }

    frame.state = tandem_core::FrameState::Running;

    for iteration in 0..inner.config.max_iterations {
        let mut request =
            CompletionRequest::new(messages.clone()).with_tools(tool_definitions.clone());
        if let Some(model) = &frame.config.model {
            request = request.with_model(model.clone());
        }
        if !extra.is_empty() {
            request = request.with_extra(extra.clone());
        }

        let (content, tool_calls) = if inner.config.stream_responses {
            run_streaming_iteration(inner, &ctx, request).await?
        } else {
            run_complete_iteration(inner, request).await?
        };

        if !tool_calls.is_empty() {
            // Close out any streamed text so its deltas are always followed
            // by a completion event.
            if inner.config.stream_responses && !content.is_empty() {
                ctx.emit(EventPayload::TextResponseComplete {
                    full: content.clone(),
                })
                .await;
            }

            tracing::debug!(
                agent = %spec.name,
                iteration,
                tool_count = tool_calls.len(),
                "agent executing tools"
            );

            messages.push(Message::assistant_with_tool_calls("", tool_calls.clone()));

            // Sibling tool calls are fulfilled sequentially, in arrival
            // order.
            for call in &tool_calls {
                let result = dispatch_tool(inner, frame, &ctx, call).await?;
                messages.push(Message::tool_result(&call.id, result));
            }

            continue;
        }

        ctx.emit(EventPayload::TextResponseComplete {
            full: content.clone(),
        })
        .await;

        messages.push(Message::assistant(content.as_str()));
        frame.messages = messages;

        tracing::debug!(
            agent = %spec.name,
            iterations = iteration + 1,
            response_len = content.len(),
            "agent completed"
        );
        return Ok(content);
    }

    Err(Error::Unknown(format!(
        "agent {} exceeded max iterations ({})",
        spec.name, inner.config.max_iterations
    )))
}

async fn user_message(
    inner: &Arc<RuntimeInner>,
    prompt: &str,
    attachments: &[String],
) -> Result<Message, Error> {
    if attachments.is_empty() {
        return Ok(Message::user(prompt));
    }
    let materializer = AttachmentsToolset::new(inner.config.project_root.clone());
    let mut parts = vec![ContentPart::Text {
        text: prompt.to_string(),
    }];
    parts.extend(materializer.materialize(attachments).await?);
    Ok(Message::user(Content::Parts(parts)))
}

/// Dispatch one tool call through the plane: locate the owning toolset,
/// emit `ToolCall`, run the gated call, emit `ToolResult`, and translate
/// recoverable failures into structured results the model can observe.
async fn dispatch_tool(
    inner: &Arc<RuntimeInner>,
    frame: &CallFrame,
    ctx: &ToolContext,
    call: &ToolCall,
) -> Result<String, Error> {
    let Some(owner) = find_owner(&frame.config.active_toolsets, &call.name) else {
        // Unknown tools surface to the model, not to the caller.
        return Ok(format!("Error: unknown tool '{}'", call.name));
    };

    // Delegations are refused before their ToolCall event is published, so
    // a depth-limited run never advertises a call it will not make.
    if owner
        .capabilities(&call.name, &call.arguments)
        .contains(&Capability::Delegate)
    {
        let attempted = frame.config.depth + 1;
        if attempted > inner.config.max_depth {
            let callee = call
                .arguments
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or(&call.name);
            return Err(Error::MaxDepthExceeded {
                caller: frame.config.invocation_name.clone(),
                callee: callee.to_string(),
                depth: attempted,
                max: inner.config.max_depth,
            });
        }
    }

    ctx.emit(EventPayload::ToolCall {
        tool: call.name.clone(),
        args: call.arguments.clone(),
        call_id: call.id.clone(),
    })
    .await;

    match owner.call_tool(&call.name, call.arguments.clone(), ctx).await {
        Ok(output) => {
            ctx.emit(EventPayload::ToolResult {
                call_id: call.id.clone(),
                result: output.content.clone(),
                truncated: output.truncated,
            })
            .await;
            Ok(output.content)
        }
        Err(e) if is_fatal(&owner, &e) => Err(e),
        Err(e) => {
            // Recoverable: the model observes the failure and continues.
            let result = json!({"error": e.kind(), "message": e.to_string()}).to_string();
            ctx.emit(EventPayload::ToolResult {
                call_id: call.id.clone(),
                result: result.clone(),
                truncated: false,
            })
            .await;
            Ok(result)
        }
    }
}

fn find_owner(plane: &[Arc<dyn Toolset>], tool: &str) -> Option<Arc<dyn Toolset>> {
    plane
        .iter()
        .find(|ts| ts.tools().iter().any(|t| t.name == tool))
        .map(Arc::clone)
}

/// Failures that terminate the branch instead of becoming a structured
/// tool result.
fn is_fatal(owner: &Arc<dyn Toolset>, err: &Error) -> bool {
    matches!(
        err,
        Error::PermissionDenied { .. }
            | Error::MaxDepthExceeded { .. }
            | Error::IncompatibleModel { .. }
            | Error::Cancelled
            | Error::Transport(_)
    ) || owner.error_is_fatal(err)
}

async fn run_complete_iteration(
    inner: &Arc<RuntimeInner>,
    mut request: CompletionRequest,
) -> Result<(String, Vec<ToolCall>), Error> {
    request.stream = false;
    let response = inner.provider.complete(request).await?;
    let content = response.message.content.to_string_lossy();
    Ok((content, response.message.tool_calls))
}

/// Streamed iteration: publish a delta event per text chunk and assemble
/// tool calls from their argument fragments.
async fn run_streaming_iteration(
    inner: &Arc<RuntimeInner>,
    ctx: &ToolContext,
    mut request: CompletionRequest,
) -> Result<(String, Vec<ToolCall>), Error> {
    request.stream = true;
    let mut stream = inner.provider.stream(request).await?;

    let mut content = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    let mut pending: Option<(String, String, String)> = None;

    while let Some(chunk) = stream.next().await {
        match chunk? {
            StreamChunk::Start { .. } => {}
            StreamChunk::Delta { content: delta } => {
                ctx.emit(EventPayload::TextResponseDelta {
                    partial: delta.clone(),
                })
                .await;
                content.push_str(&delta);
            }
            StreamChunk::ToolCallStart { id, name } => {
                if let Some(call) = finish_pending(pending.take()) {
                    tool_calls.push(call);
                }
                pending = Some((id, name, String::new()));
            }
            StreamChunk::ToolCallDelta { arguments } => {
                if let Some((_, _, ref mut args)) = pending {
                    args.push_str(&arguments);
                }
            }
            StreamChunk::Done { .. } => {
                if let Some(call) = finish_pending(pending.take()) {
                    tool_calls.push(call);
                }
            }
            StreamChunk::Error { message } => {
                return Err(Error::stream(message));
            }
        }
    }

    Ok((content, tool_calls))
}

fn finish_pending(pending: Option<(String, String, String)>) -> Option<ToolCall> {
    pending.map(|(id, name, args)| {
        let arguments: Value = serde_json::from_str(&args).unwrap_or(Value::Null);
        ToolCall::new(id, name, arguments)
    })
}
