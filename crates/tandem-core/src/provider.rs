use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::message::{Message, StreamChunk, Usage};
use crate::tool::ToolDefinition;

pub type StreamResult = Pin<Box<dyn Stream<Item = Result<StreamChunk, Error>> + Send>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tools: Vec<ToolDefinition>,
    #[serde(default)]
    pub stream: bool,
    /// Extra parameters passed through to the provider verbatim
    /// (e.g. server-side tool records from an agent definition).
    #[serde(default, skip_serializing_if = "std::collections::HashMap::is_empty")]
    pub extra: std::collections::HashMap<String, serde_json::Value>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            model: None,
            tools: Vec::new(),
            stream: false,
            extra: std::collections::HashMap::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_extra(
        mut self,
        extra: std::collections::HashMap<String, serde_json::Value>,
    ) -> Self {
        self.extra = extra;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub message: Message,
    pub usage: Usage,
    pub model: String,
    pub finish_reason: FinishReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Error,
}

/// The model invocation primitive. The runtime drives the agent loop;
/// implementations only translate one completion request into one response
/// (or a chunk stream). Transport failures propagate unretried.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Default model when neither the call chain nor the environment
    /// supplies one.
    fn default_model(&self) -> Option<&str>;

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, Error>;

    async fn stream(&self, request: CompletionRequest) -> Result<StreamResult, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_request_builder() {
        let request = CompletionRequest::new(vec![Message::user("Hello")])
            .with_model("anthropic:claude-sonnet-4")
            .with_stream(true);

        assert_eq!(request.model.as_deref(), Some("anthropic:claude-sonnet-4"));
        assert!(request.stream);
        assert!(request.tools.is_empty());
    }

    #[test]
    fn test_extra_passthrough() {
        let mut extra = std::collections::HashMap::new();
        extra.insert(
            "server_side_tools".to_string(),
            serde_json::json!([{"type": "web_search"}]),
        );
        let request = CompletionRequest::new(vec![]).with_extra(extra);
        assert!(request.extra.contains_key("server_side_tools"));
    }
}
