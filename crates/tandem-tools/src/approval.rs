//! The approval pipeline: a wrapper toolset that gates every call placed
//! into an active plane through the session cache, the blanket policy, and
//! the user's approval callback.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use tandem_core::{
    ApprovalCallback, ApprovalDecision, ApprovalPolicy, ApprovalRequest, Capability, Error,
    EventPayload, SessionApprovals, ToolContext, ToolDefinition, ToolOutput, Toolset,
};

/// Wraps a toolset with the policy pipeline. One gate per toolset instance;
/// the session cache is shared across a run.
pub struct ApprovalGate {
    inner: Arc<dyn Toolset>,
    policy: ApprovalPolicy,
    callback: Option<Arc<dyn ApprovalCallback>>,
    session: Arc<SessionApprovals>,
    return_permission_errors: bool,
}

impl ApprovalGate {
    pub fn new(
        inner: Arc<dyn Toolset>,
        policy: ApprovalPolicy,
        callback: Option<Arc<dyn ApprovalCallback>>,
        session: Arc<SessionApprovals>,
        return_permission_errors: bool,
    ) -> Self {
        Self {
            inner,
            policy,
            callback,
            session,
            return_permission_errors,
        }
    }

    /// Run the pipeline. `Ok(None)` means proceed; `Ok(Some(output))` is a
    /// structured denial result; `Err` is a terminal denial.
    async fn check(
        &self,
        tool: &str,
        args: &Value,
        ctx: &ToolContext,
    ) -> Result<Option<ToolOutput>, Error> {
        // 1. A cached AllowSession decision proceeds silently.
        let fingerprint =
            tandem_core::request_fingerprint(tool, &self.inner.approval_args(tool, args));
        if self.session.contains(&fingerprint) {
            return Ok(None);
        }

        // 2. Blanket policies short-circuit the callback entirely.
        match self.policy {
            ApprovalPolicy::ApproveAll => return Ok(None),
            ApprovalPolicy::RejectAll => {
                let description = self.inner.describe_approval(tool, args, ctx);
                return self.deny(tool, &description);
            }
            ApprovalPolicy::Prompt => {}
        }

        // 3. No callback to ask: proceed.
        let Some(callback) = &self.callback else {
            return Ok(None);
        };

        // 4. Consult the toolset's own predicate.
        if !self.inner.needs_approval(tool, args, ctx) {
            return Ok(None);
        }

        let description = self.inner.describe_approval(tool, args, ctx);
        let capabilities = self.inner.capabilities(tool, args);

        ctx.emit(EventPayload::ApprovalRequested {
            tool: tool.to_string(),
            args: args.clone(),
            description: description.clone(),
            capabilities: capabilities.clone(),
        })
        .await;

        let request = ApprovalRequest {
            tool: tool.to_string(),
            args: args.clone(),
            description: description.clone(),
            capabilities,
        };

        match callback.on_request(&request).await {
            ApprovalDecision::Allow => Ok(None),
            ApprovalDecision::AllowSession => {
                self.session.insert(fingerprint);
                Ok(None)
            }
            // Denials are never cached.
            ApprovalDecision::Deny => {
                tracing::info!(tool, "tool call denied by user");
                self.deny(tool, &description)
            }
        }
    }

    fn deny(&self, tool: &str, description: &str) -> Result<Option<ToolOutput>, Error> {
        if self.return_permission_errors {
            Ok(Some(ToolOutput::error(
                json!({
                    "error": "permission_denied",
                    "tool": tool,
                    "description": description,
                })
                .to_string(),
            )))
        } else {
            Err(Error::permission_denied(tool, description))
        }
    }
}

#[async_trait]
impl Toolset for ApprovalGate {
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
        if let Some(denied) = self.check(tool, &args, ctx).await? {
            return Ok(denied);
        }
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
        self.inner.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tandem_core::{NullSink, ToolParameters};

    struct StubToolset {
        approval_required: bool,
    }

    #[async_trait]
    impl Toolset for StubToolset {
        fn name(&self) -> &str {
            "stub"
        }

        fn tools(&self) -> Vec<ToolDefinition> {
            vec![ToolDefinition::new("poke", "Poke").with_parameters(ToolParameters::new())]
        }

        async fn call_tool(
            &self,
            _tool: &str,
            _args: Value,
            _ctx: &ToolContext,
        ) -> Result<ToolOutput, Error> {
            Ok(ToolOutput::success("poked"))
        }

        fn needs_approval(&self, _tool: &str, _args: &Value, _ctx: &ToolContext) -> bool {
            self.approval_required
        }

        fn capabilities(&self, _tool: &str, _args: &Value) -> Vec<Capability> {
            vec![Capability::Exec]
        }
    }

    struct CountingCallback {
        decision: ApprovalDecision,
        calls: AtomicUsize,
    }

    impl CountingCallback {
        fn new(decision: ApprovalDecision) -> Arc<Self> {
            Arc::new(Self {
                decision,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ApprovalCallback for CountingCallback {
        async fn on_request(&self, _request: &ApprovalRequest) -> ApprovalDecision {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.decision
        }
    }

    fn ctx() -> ToolContext {
        ToolContext::new("tester", 0, PathBuf::from("."), Arc::new(NullSink))
    }

    fn gate(
        approval_required: bool,
        policy: ApprovalPolicy,
        callback: Option<Arc<CountingCallback>>,
        session: Arc<SessionApprovals>,
        return_permission_errors: bool,
    ) -> ApprovalGate {
        ApprovalGate::new(
            Arc::new(StubToolset { approval_required }),
            policy,
            callback.map(|c| c as Arc<dyn ApprovalCallback>),
            session,
            return_permission_errors,
        )
    }

    #[tokio::test]
    async fn test_approve_all_skips_callback() {
        let callback = CountingCallback::new(ApprovalDecision::Deny);
        let g = gate(
            true,
            ApprovalPolicy::ApproveAll,
            Some(Arc::clone(&callback)),
            Arc::new(SessionApprovals::new()),
            false,
        );
        let out = g.call_tool("poke", json!({}), &ctx()).await.unwrap();
        assert_eq!(out.content, "poked");
        assert_eq!(callback.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reject_all_denies_even_silent_tools() {
        let g = gate(
            false,
            ApprovalPolicy::RejectAll,
            None,
            Arc::new(SessionApprovals::new()),
            false,
        );
        let err = g.call_tool("poke", json!({}), &ctx()).await.unwrap_err();
        assert!(err.is_permission_denied());
    }

    #[tokio::test]
    async fn test_reject_all_with_returned_errors() {
        let g = gate(
            false,
            ApprovalPolicy::RejectAll,
            None,
            Arc::new(SessionApprovals::new()),
            true,
        );
        let out = g.call_tool("poke", json!({}), &ctx()).await.unwrap();
        let parsed: Value = serde_json::from_str(&out.content).unwrap();
        assert_eq!(parsed["error"], "permission_denied");
        assert_eq!(parsed["tool"], "poke");
    }

    #[tokio::test]
    async fn test_allow_session_caches_fingerprint() {
        let callback = CountingCallback::new(ApprovalDecision::AllowSession);
        let session = Arc::new(SessionApprovals::new());
        let g = gate(
            true,
            ApprovalPolicy::Prompt,
            Some(Arc::clone(&callback)),
            session,
            false,
        );

        let args = json!({"target": "a"});
        g.call_tool("poke", args.clone(), &ctx()).await.unwrap();
        g.call_tool("poke", args.clone(), &ctx()).await.unwrap();
        // Second identical call is served from the cache.
        assert_eq!(callback.calls.load(Ordering::SeqCst), 1);

        // A different fingerprint consults the callback again.
        g.call_tool("poke", json!({"target": "b"}), &ctx()).await.unwrap();
        assert_eq!(callback.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_deny_is_not_cached() {
        let callback = CountingCallback::new(ApprovalDecision::Deny);
        let session = Arc::new(SessionApprovals::new());
        let g = gate(
            true,
            ApprovalPolicy::Prompt,
            Some(Arc::clone(&callback)),
            session,
            true,
        );

        let args = json!({"target": "a"});
        g.call_tool("poke", args.clone(), &ctx()).await.unwrap();
        g.call_tool("poke", args, &ctx()).await.unwrap();
        assert_eq!(callback.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_silent_tool_skips_callback() {
        let callback = CountingCallback::new(ApprovalDecision::Deny);
        let g = gate(
            false,
            ApprovalPolicy::Prompt,
            Some(Arc::clone(&callback)),
            Arc::new(SessionApprovals::new()),
            false,
        );
        let out = g.call_tool("poke", json!({}), &ctx()).await.unwrap();
        assert_eq!(out.content, "poked");
        assert_eq!(callback.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_callback_proceeds() {
        let g = gate(
            true,
            ApprovalPolicy::Prompt,
            None,
            Arc::new(SessionApprovals::new()),
            false,
        );
        let out = g.call_tool("poke", json!({}), &ctx()).await.unwrap();
        assert_eq!(out.content, "poked");
    }
}
