//! Test utilities shared across the workspace.
//! Only compiled when running tests or with the `testing` feature.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::Error;
use crate::event::{EventPayload, EventSink, RuntimeEvent};
use crate::message::{Message, ToolCall, Usage};
use crate::provider::{
    CompletionRequest, CompletionResponse, FinishReason, Provider, StreamResult,
};

/// Scripted provider: hand it the completions a run should see, in order,
/// and assert afterwards on the requests it captured.
pub struct MockProvider {
    script: Mutex<VecDeque<CompletionResponse>>,
    /// Captured requests (for assertion).
    pub captured_requests: Mutex<Vec<CompletionRequest>>,
    pub name: String,
    pub default_model: Option<String>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            captured_requests: Mutex::new(Vec::new()),
            name: "scripted".to_string(),
            default_model: None,
        }
    }

    /// Queue a plain-text response. Responses are returned in FIFO order.
    pub fn queue_response(&self, content: &str) {
        self.queue_raw_response(CompletionResponse {
            message: Message::assistant(content),
            usage: Usage::new(0, 0),
            model: "scripted".to_string(),
            finish_reason: FinishReason::Stop,
        });
    }

    /// Queue a response that invokes tools.
    pub fn queue_tool_calls(&self, tool_calls: Vec<ToolCall>) {
        self.queue_raw_response(CompletionResponse {
            message: Message::assistant_with_tool_calls("", tool_calls),
            usage: Usage::new(0, 0),
            model: "scripted".to_string(),
            finish_reason: FinishReason::ToolCalls,
        });
    }

    /// Queue a raw CompletionResponse.
    pub fn queue_raw_response(&self, response: CompletionResponse) {
        self.script.lock().unwrap().push_back(response);
    }

    pub fn request_count(&self) -> usize {
        self.captured_requests.lock().unwrap().len()
    }

    pub fn last_request(&self) -> Option<CompletionRequest> {
        self.captured_requests.lock().unwrap().last().cloned()
    }

    fn next_scripted(&self) -> Option<CompletionResponse> {
        self.script.lock().unwrap().pop_front()
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_model(&self) -> Option<&str> {
        self.default_model.as_deref()
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, Error> {
        let step = self.captured_requests.lock().unwrap().len();
        self.captured_requests.lock().unwrap().push(request);
        self.next_scripted().ok_or_else(|| {
            Error::transport(format!("scripted provider ran out of completions at step {step}"))
        })
    }

    async fn stream(&self, _request: CompletionRequest) -> Result<StreamResult, Error> {
        Err(Error::stream(
            "scripted provider is completion-only; script a streaming provider instead",
        ))
    }
}

/// Sink that records every event for assertion.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<RuntimeEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RuntimeEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Payloads only, in publication order.
    pub fn payloads(&self) -> Vec<EventPayload> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.payload.clone())
            .collect()
    }

    pub fn count_tool_calls(&self, tool: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(&e.payload, EventPayload::ToolCall { tool: t, .. } if t == tool))
            .count()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn on_event(&self, event: RuntimeEvent) {
        self.events.lock().unwrap().push(event);
    }
}
