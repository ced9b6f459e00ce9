//! Per-run runtime configuration.

use std::path::PathBuf;
use std::sync::Arc;

use tandem_agents::Policy;
use tandem_core::{ApprovalCallback, ApprovalPolicy, EventSink, NullSink};

fn default_max_iterations() -> usize {
    20
}

/// Shared, immutable configuration for one `Runtime`.
#[derive(Clone)]
pub struct RuntimeConfig {
    /// Forced model override from the caller (e.g. a `--model` flag).
    pub cli_model: Option<String>,
    /// Maximum delegation depth.
    pub max_depth: u32,
    /// Blanket approval policy.
    pub policy: ApprovalPolicy,
    /// Callback consulted when a tool call needs consent.
    pub approval_callback: Option<Arc<dyn ApprovalCallback>>,
    /// Event sink; publication must not block the call path.
    pub sink: Arc<dyn EventSink>,
    pub verbosity: u8,
    /// Materialize denials as structured tool results instead of failing
    /// the run.
    pub return_permission_errors: bool,
    /// Stream text deltas from the provider when it supports it.
    pub stream_responses: bool,
    /// Cap on model-loop iterations per agent call.
    pub max_iterations: usize,
    /// Anchors attachment resolution and relative toolset paths.
    pub project_root: PathBuf,
    /// Manifest default: do agent-as-tool calls require approval?
    pub agent_calls_require_approval: bool,
    /// Manifest default: do agent calls carrying attachments require
    /// approval?
    pub agent_attachments_require_approval: bool,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self {
            cli_model: None,
            max_depth: 5,
            policy: ApprovalPolicy::default(),
            approval_callback: None,
            sink: Arc::new(NullSink),
            verbosity: 0,
            return_permission_errors: false,
            stream_responses: false,
            max_iterations: default_max_iterations(),
            project_root: PathBuf::from("."),
            agent_calls_require_approval: true,
            agent_attachments_require_approval: false,
        }
    }

    /// Apply the registry's manifest policy defaults.
    pub fn with_policy_defaults(mut self, policy: &Policy) -> Self {
        self.max_depth = policy.max_depth;
        self.agent_calls_require_approval = policy.agent_calls_require_approval;
        self.agent_attachments_require_approval = policy.agent_attachments_require_approval;
        self
    }

    pub fn with_cli_model(mut self, model: impl Into<String>) -> Self {
        self.cli_model = Some(model.into());
        self
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_approval_policy(mut self, policy: ApprovalPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_approval_callback(mut self, callback: Arc<dyn ApprovalCallback>) -> Self {
        self.approval_callback = Some(callback);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_return_permission_errors(mut self, enabled: bool) -> Self {
        self.return_permission_errors = enabled;
        self
    }

    pub fn with_stream_responses(mut self, enabled: bool) -> Self {
        self.stream_responses = enabled;
        self
    }

    pub fn with_project_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.project_root = root.into();
        self
    }

    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}
