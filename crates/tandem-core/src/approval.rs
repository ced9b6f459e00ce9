//! User-consent types shared by the approval pipeline.

use std::collections::HashSet;
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;

use crate::toolset::Capability;

/// Blanket policy applied before the per-tool approval predicate runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApprovalPolicy {
    /// Every call proceeds without consulting the callback.
    ApproveAll,
    /// Every call is denied outright.
    RejectAll,
    /// Ask the callback whenever the toolset requires approval.
    #[default]
    Prompt,
}

/// User's response to an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    /// Allow this single execution.
    Allow,
    /// Allow and cache the request fingerprint for the rest of the session.
    AllowSession,
    /// Deny execution.
    Deny,
}

/// What the user is asked to approve.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub tool: String,
    pub args: Value,
    pub description: String,
    pub capabilities: Vec<Capability>,
}

/// Callback consulted when a tool call requires consent.
#[async_trait]
pub trait ApprovalCallback: Send + Sync {
    async fn on_request(&self, request: &ApprovalRequest) -> ApprovalDecision;
}

/// Normalized cache key for an approved request: the tool name plus a
/// stable serialization of its approval-scope arguments. Object keys are
/// serialized in sorted order, so equal scopes fingerprint equally.
pub fn request_fingerprint(tool: &str, approval_args: &Value) -> String {
    format!("{tool}:{approval_args}")
}

/// Per-session store of `AllowSession` decisions. Denials are never cached.
#[derive(Default)]
pub struct SessionApprovals {
    approved: RwLock<HashSet<String>>,
}

impl SessionApprovals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.approved
            .read()
            .map(|set| set.contains(fingerprint))
            .unwrap_or(false)
    }

    pub fn insert(&self, fingerprint: String) {
        if let Ok(mut set) = self.approved.write() {
            set.insert(fingerprint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fingerprint_is_order_insensitive() {
        let a = request_fingerprint("shell", &json!({"command": "ls", "timeout": 5}));
        let b = request_fingerprint("shell", &json!({"timeout": 5, "command": "ls"}));
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_distinguishes_tools() {
        let args = json!({"path": "/work/a"});
        assert_ne!(
            request_fingerprint("read_file", &args),
            request_fingerprint("write_file", &args)
        );
    }

    #[test]
    fn test_session_cache() {
        let cache = SessionApprovals::new();
        let fp = request_fingerprint("write_file", &json!({"path": "/work/a"}));
        assert!(!cache.contains(&fp));
        cache.insert(fp.clone());
        assert!(cache.contains(&fp));
        assert!(!cache.contains("write_file:other"));
    }
}
