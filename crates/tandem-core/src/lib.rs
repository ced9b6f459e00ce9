//! tandem-core: Core types and traits for the tandem agent runtime
//!
//! This crate provides the foundational types used throughout the tandem
//! multi-agent execution runtime: messages, the provider seam, tool and
//! toolset capabilities, runtime events, call frames, and approval types.

pub mod approval;
pub mod error;
pub mod event;
pub mod frame;
pub mod message;
pub mod model;
pub mod provider;
pub mod tool;
pub mod toolset;
pub mod worker;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use approval::{
    request_fingerprint, ApprovalCallback, ApprovalDecision, ApprovalPolicy, ApprovalRequest,
    SessionApprovals,
};
pub use error::Error;
pub use event::{EventPayload, EventSink, NullSink, RuntimeEvent};
pub use frame::{CallConfig, CallFrame, CallScope, FrameState};
pub use message::{Content, ContentPart, Message, Role, StreamChunk, ToolCall, ToolResult, Usage};
pub use provider::{CompletionRequest, CompletionResponse, FinishReason, Provider, StreamResult};
pub use tool::{InputSchema, PropertySchema, ToolDefinition, ToolOutput, ToolParameters};
pub use toolset::{Capability, FnToolsetFactory, ToolContext, Toolset, ToolsetFactory};
pub use worker::{Delegator, WorkerRuntime};

pub type Result<T> = std::result::Result<T, Error>;
