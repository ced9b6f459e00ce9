//! tandem-agents: Declarative inputs for the tandem runtime
//!
//! Agent-file parsing, manifest loading, `module:symbol` reference
//! resolution, and the two-pass registry builder.

pub mod agent_file;
pub mod definition;
pub mod manifest;
pub mod refs;
pub mod registry;

pub use agent_file::{parse_agent_file, to_agent_file, AgentDefinition};
pub use definition::{AgentSpec, EntryFn, FunctionEntry, FunctionTool, ToolFn};
pub use manifest::{EntryDescriptor, Manifest, ToolsetSettings};
pub use refs::{CodeModule, CodeRegistry, CodeSymbol, ModulePath, SymbolRef};
pub use registry::{
    Entry, Policy, Registry, RegistryBuilder, ResolvedAgent, ResolvedFunction, ToolsetRef,
    BUILTIN_TOOLSETS,
};
