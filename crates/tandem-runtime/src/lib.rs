//! tandem-runtime: Execution engine for the tandem multi-agent runtime
//!
//! The runtime facade, call-frame scheduler, agent runner, agent-as-tool
//! wrapping, dynamic agent creation, and the broadcast event sink.

pub mod agent_toolset;
pub mod config;
pub mod dynamic;
pub mod event_bus;
mod runner;
pub mod runtime;

pub use agent_toolset::AgentToolset;
pub use config::RuntimeConfig;
pub use dynamic::DynamicAgentToolset;
pub use event_bus::EventBus;
pub use runtime::{CallerInfo, Runtime};
