//! The facade handed to code entries and custom tools.
//!
//! Holds only the frame, the call context, and a delegation handle; every
//! other access routes through those two references.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Error;
use crate::event::EventPayload;
use crate::frame::CallFrame;
use crate::toolset::ToolContext;

/// Forks and runs a child call frame for a named agent. Implemented by the
/// runtime; the caller's identity, model, and depth are baked in when the
/// handle is issued.
#[async_trait]
pub trait Delegator: Send + Sync {
    async fn spawn_child(
        &self,
        agent: &str,
        input: Value,
        attachments: Vec<String>,
    ) -> Result<String, Error>;
}

/// Per-call facade over the runtime for code entries.
pub struct WorkerRuntime<'a> {
    pub frame: &'a mut CallFrame,
    ctx: ToolContext,
    delegator: Arc<dyn Delegator>,
}

impl<'a> WorkerRuntime<'a> {
    pub fn new(frame: &'a mut CallFrame, ctx: ToolContext, delegator: Arc<dyn Delegator>) -> Self {
        Self {
            frame,
            ctx,
            delegator,
        }
    }

    pub fn ctx(&self) -> &ToolContext {
        &self.ctx
    }

    /// Publish an event from this frame.
    pub async fn emit(&self, payload: EventPayload) {
        self.ctx.emit(payload).await;
    }

    /// Delegate to another agent; returns its text output.
    pub async fn spawn_child(
        &self,
        agent: &str,
        input: Value,
        attachments: Vec<String>,
    ) -> Result<String, Error> {
        self.delegator.spawn_child(agent, input, attachments).await
    }
}
