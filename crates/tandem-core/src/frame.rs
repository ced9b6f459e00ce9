//! Per-call execution state: the immutable call configuration, the mutable
//! call frame, and the scope that owns toolset instances for one call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::message::Message;
use crate::toolset::Toolset;

/// Frame lifecycle. Terminal states always tear the owning scope down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Built,
    Dispatched,
    Running,
    Completed,
    Failed,
    Denied,
}

/// Immutable configuration shared along one call chain.
#[derive(Clone)]
pub struct CallConfig {
    /// The ordered toolset plane the model loop can call.
    pub active_toolsets: Arc<[Arc<dyn Toolset>]>,
    /// Effective model for this call, if any source supplied one.
    pub model: Option<String>,
    pub depth: u32,
    pub invocation_name: String,
}

impl std::fmt::Debug for CallConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallConfig")
            .field("active_toolsets_count", &self.active_toolsets.len())
            .field("model", &self.model)
            .field("depth", &self.depth)
            .field("invocation_name", &self.invocation_name)
            .finish()
    }
}

impl CallConfig {
    pub fn new(
        active_toolsets: Vec<Arc<dyn Toolset>>,
        model: Option<String>,
        depth: u32,
        invocation_name: impl Into<String>,
    ) -> Self {
        Self {
            active_toolsets: active_toolsets.into(),
            model,
            depth,
            invocation_name: invocation_name.into(),
        }
    }
}

/// Mutable per-call state. Each frame owns its message list; delegation
/// never shares history between parent and child.
pub struct CallFrame {
    pub config: CallConfig,
    pub prompt: String,
    pub messages: Vec<Message>,
    pub state: FrameState,
}

impl std::fmt::Debug for CallFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallFrame")
            .field("config", &self.config)
            .field("prompt", &self.prompt)
            .field("messages", &self.messages)
            .field("state", &self.state)
            .finish()
    }
}

impl CallFrame {
    pub fn new(config: CallConfig, prompt: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            config,
            prompt: prompt.into(),
            messages,
            state: FrameState::Built,
        }
    }

    pub fn depth(&self) -> u32 {
        self.config.depth
    }

    /// Fork an independent child frame: depth + 1, fresh message list.
    pub fn fork(
        &self,
        new_toolsets: Vec<Arc<dyn Toolset>>,
        new_model: Option<String>,
        new_name: impl Into<String>,
        prompt: impl Into<String>,
    ) -> CallFrame {
        CallFrame::new(
            CallConfig::new(new_toolsets, new_model, self.config.depth + 1, new_name),
            prompt,
            Vec::new(),
        )
    }
}

/// Owns the toolset instances materialized for one call and guarantees each
/// teardown hook runs exactly once, on every exit path.
pub struct CallScope {
    toolsets: Vec<Arc<dyn Toolset>>,
    closed: AtomicBool,
}

impl CallScope {
    pub fn new(toolsets: Vec<Arc<dyn Toolset>>) -> Self {
        Self {
            toolsets,
            closed: AtomicBool::new(false),
        }
    }

    pub fn toolsets(&self) -> &[Arc<dyn Toolset>] {
        &self.toolsets
    }

    /// Run every toolset's teardown hook. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for toolset in &self.toolsets {
            toolset.close().await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for CallScope {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            // Cancellation can drop a scope before the async teardown ran;
            // toolset teardown must tolerate being skipped here and callers
            // are expected to close() on every ordinary path.
            tracing::warn!("call scope dropped without close()");
        }
    }
}
