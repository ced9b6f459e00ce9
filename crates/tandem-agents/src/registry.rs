//! Two-pass registry construction.
//!
//! The collection pass walks agent files and code modules into name-indexed
//! maps and rejects collisions (across categories too). The resolution pass
//! turns every agent's toolset references into concrete plane entries:
//! built-ins, registered toolsets, registered tools promoted to singleton
//! toolsets, and other agents promoted to agent-as-tool.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use tandem_core::{
    model, Capability, Error, FnToolsetFactory, ToolContext, ToolDefinition, ToolOutput, Toolset,
    ToolsetFactory,
};
use tandem_tools::{
    AttachmentsToolset, FilesystemConfig, FilesystemSettings, FilesystemToolset, ShellSettings,
    ShellToolset,
};

use crate::agent_file::{parse_agent_file, AgentDefinition};
use crate::definition::{AgentSpec, FunctionEntry, FunctionTool};
use crate::manifest::Manifest;
use crate::refs::{CodeRegistry, CodeSymbol};

/// Reserved names of the built-in toolsets.
pub const BUILTIN_TOOLSETS: &[&str] =
    &["filesystem", "filesystem_ro", "shell", "attachments", "agents"];

/// A resolved plane member. `Agent` and `DynamicAgents` are materialized by
/// the runtime at scope-build time; the rest carry their factory or
/// instance directly.
#[derive(Clone)]
pub enum ToolsetRef {
    Instance(Arc<dyn Toolset>),
    Factory(Arc<dyn ToolsetFactory>),
    /// Agent-as-tool: fork a child frame for the named agent.
    Agent(String),
    /// The dynamic-agent-creation toolset.
    DynamicAgents,
}

impl std::fmt::Debug for ToolsetRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolsetRef::Instance(_) => f.debug_tuple("Instance").finish_non_exhaustive(),
            ToolsetRef::Factory(_) => f.debug_tuple("Factory").finish_non_exhaustive(),
            ToolsetRef::Agent(name) => f.debug_tuple("Agent").field(name).finish(),
            ToolsetRef::DynamicAgents => write!(f, "DynamicAgents"),
        }
    }
}

/// An agent with its toolset references resolved.
pub struct ResolvedAgent {
    pub spec: Arc<AgentSpec>,
    pub plane: Vec<ToolsetRef>,
}

impl std::fmt::Debug for ResolvedAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedAgent")
            .field("spec", &self.spec)
            .field("plane", &self.plane)
            .finish()
    }
}

/// A function entry with its toolset references resolved.
pub struct ResolvedFunction {
    pub entry: FunctionEntry,
    pub plane: Vec<ToolsetRef>,
}

impl std::fmt::Debug for ResolvedFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedFunction")
            .field("entry", &self.entry)
            .field("plane", &self.plane)
            .finish()
    }
}

/// A named, runnable item an outside caller can select.
#[derive(Clone, Debug)]
pub enum Entry {
    Agent(Arc<ResolvedAgent>),
    Function(Arc<ResolvedFunction>),
}

impl Entry {
    pub fn name(&self) -> &str {
        match self {
            Entry::Agent(agent) => &agent.spec.name,
            Entry::Function(function) => &function.entry.name,
        }
    }
}

/// Policy defaults carried from the manifest.
#[derive(Debug, Clone)]
pub struct Policy {
    pub max_depth: u32,
    pub agent_calls_require_approval: bool,
    pub agent_attachments_require_approval: bool,
    pub allow_cli_input: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_depth: 5,
            agent_calls_require_approval: true,
            agent_attachments_require_approval: false,
            allow_cli_input: true,
        }
    }
}

/// The built registry: immutable after `build`, except the generated-agents
/// section which only grows within one process run.
pub struct Registry {
    agents: HashMap<String, Arc<ResolvedAgent>>,
    tools: HashMap<String, FunctionTool>,
    toolsets: HashMap<String, ToolsetRef>,
    entries: HashMap<String, Entry>,
    generated: RwLock<HashMap<String, Arc<ResolvedAgent>>>,
    default_entry: Option<String>,
    policy: Policy,
    project_root: PathBuf,
    filesystem_settings: FilesystemSettings,
    shell_settings: ShellSettings,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("agents", &self.agents.keys().collect::<Vec<_>>())
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .field("toolsets", &self.toolsets)
            .field("entries", &self.entries.keys().collect::<Vec<_>>())
            .field("default_entry", &self.default_entry)
            .field("policy", &self.policy)
            .field("project_root", &self.project_root)
            .finish_non_exhaustive()
    }
}

impl Registry {
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn project_root(&self) -> &PathBuf {
        &self.project_root
    }

    pub fn default_entry(&self) -> Option<&str> {
        self.default_entry.as_deref()
    }

    pub fn agent_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.keys().cloned().collect();
        if let Ok(generated) = self.generated.read() {
            names.extend(generated.keys().cloned());
        }
        names.sort();
        names
    }

    pub fn entry_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    /// Look up an agent, static or generated.
    pub fn agent(&self, name: &str) -> Option<Arc<ResolvedAgent>> {
        if let Some(agent) = self.agents.get(name) {
            return Some(Arc::clone(agent));
        }
        self.generated
            .read()
            .ok()
            .and_then(|g| g.get(name).map(Arc::clone))
    }

    /// True if the named agent was created by the dynamic toolset in this
    /// process run.
    pub fn is_generated(&self, name: &str) -> bool {
        self.generated
            .read()
            .map(|g| g.contains_key(name))
            .unwrap_or(false)
    }

    /// Look up a runnable entry: static entries first, then generated
    /// agents.
    pub fn entry(&self, name: &str) -> Result<Entry, Error> {
        if let Some(entry) = self.entries.get(name) {
            return Ok(entry.clone());
        }
        if let Some(agent) = self.agent(name) {
            return Ok(Entry::Agent(agent));
        }
        Err(Error::UnknownEntry(name.to_string()))
    }

    /// Register a dynamically-created agent. Adds only; an existing name
    /// anywhere in the registry is a collision.
    pub fn add_generated(&self, definition: AgentDefinition) -> Result<Arc<ResolvedAgent>, Error> {
        let name = definition.name.clone();
        if self.name_is_taken(&name) {
            return Err(Error::DuplicateName {
                name,
                sources: vec!["registry".to_string(), "agent_create".to_string()],
            });
        }

        let spec = self.spec_from_definition(&definition)?;
        let plane = self.resolve_plane(&spec.name, &spec.toolset_refs)?;
        let resolved = Arc::new(ResolvedAgent {
            spec: Arc::new(spec),
            plane,
        });

        let mut generated = self
            .generated
            .write()
            .map_err(|_| Error::Unknown("generated agents lock poisoned".to_string()))?;
        // A concurrent create may have won the race for this name.
        if generated.contains_key(&name) {
            return Err(Error::DuplicateName {
                name,
                sources: vec!["agent_create".to_string(), "agent_create".to_string()],
            });
        }
        tracing::info!(agent = %name, "registered generated agent");
        generated.insert(name, Arc::clone(&resolved));
        Ok(resolved)
    }

    fn name_is_taken(&self, name: &str) -> bool {
        self.agents.contains_key(name)
            || self.tools.contains_key(name)
            || self.toolsets.contains_key(name)
            || self.entries.contains_key(name)
            || BUILTIN_TOOLSETS.contains(&name)
            || self.is_generated(name)
    }

    fn spec_from_definition(&self, def: &AgentDefinition) -> Result<AgentSpec, Error> {
        model::validate_patterns(&def.name, &def.compatible_models)?;
        // Generated definitions carry no schema ref; static ones resolved
        // theirs at build time.
        if def.input_model_ref.is_some() {
            return Err(Error::config(format!(
                "agent '{}': input_model_ref is not supported on generated agents",
                def.name
            )));
        }
        Ok(AgentSpec {
            name: def.name.clone(),
            description: def.description.clone(),
            instructions: def.instructions.clone(),
            model: def.model.clone(),
            toolset_refs: def.toolsets.clone(),
            input_schema: None,
            compatible_models: def.compatible_models.clone(),
            server_side_tools: def.server_side_tools.clone(),
            calls_require_approval: def.calls_require_approval,
            accepts_attachments: def.accepts_attachments,
        })
    }

    /// Resolve toolset references, in order, against built-ins, registered
    /// toolsets, registered tools, and agents.
    pub fn resolve_plane(&self, owner: &str, refs: &[String]) -> Result<Vec<ToolsetRef>, Error> {
        let mut plane = Vec::with_capacity(refs.len());
        let mut seen_tools: HashMap<String, String> = HashMap::new();

        for name in refs {
            let resolved = self.resolve_toolset_ref(name)?;
            // Duplicate tool names across one plane are a build error, not
            // runtime ambiguity; agent and dynamic planes are checked when
            // the runtime materializes them.
            if let ToolsetRef::Instance(ts) = &resolved {
                for tool in ts.tools() {
                    if let Some(previous) = seen_tools.insert(tool.name.clone(), name.clone()) {
                        return Err(Error::config(format!(
                            "agent '{owner}': tool '{}' provided by both '{previous}' and '{name}'",
                            tool.name
                        )));
                    }
                }
            }
            plane.push(resolved);
        }
        Ok(plane)
    }

    fn resolve_toolset_ref(&self, name: &str) -> Result<ToolsetRef, Error> {
        if let Some(builtin) = self.builtin_toolset(name) {
            return Ok(builtin);
        }
        if let Some(toolset) = self.toolsets.get(name) {
            return Ok(toolset.clone());
        }
        if let Some(tool) = self.tools.get(name) {
            return Ok(ToolsetRef::Instance(Arc::new(SingletonToolset {
                tool: tool.clone(),
            })));
        }
        if self.agents.contains_key(name) || self.is_generated(name) {
            return Ok(ToolsetRef::Agent(name.to_string()));
        }
        Err(Error::UnknownToolset(name.to_string()))
    }

    fn builtin_toolset(&self, name: &str) -> Option<ToolsetRef> {
        match name {
            "filesystem" => {
                let config =
                    FilesystemConfig::from_settings(&self.filesystem_settings, &self.project_root);
                Some(factory(name, move || {
                    Arc::new(FilesystemToolset::new(config.clone())) as Arc<dyn Toolset>
                }))
            }
            "filesystem_ro" => {
                let config =
                    FilesystemConfig::from_settings(&self.filesystem_settings, &self.project_root)
                        .read_only();
                Some(factory(name, move || {
                    Arc::new(FilesystemToolset::new(config.clone())) as Arc<dyn Toolset>
                }))
            }
            "shell" => {
                let settings = self.shell_settings.clone();
                Some(factory(name, move || {
                    Arc::new(ShellToolset::new(settings.clone())) as Arc<dyn Toolset>
                }))
            }
            "attachments" => {
                let root = self.project_root.clone();
                Some(factory(name, move || {
                    Arc::new(AttachmentsToolset::new(root.clone())) as Arc<dyn Toolset>
                }))
            }
            "agents" => Some(ToolsetRef::DynamicAgents),
            _ => None,
        }
    }
}

fn factory<F>(name: &str, make: F) -> ToolsetRef
where
    F: Fn() -> Arc<dyn Toolset> + Send + Sync + 'static,
{
    ToolsetRef::Factory(Arc::new(FnToolsetFactory::new(name, move || Ok(make()))))
}

/// A registered standalone tool exposed as a one-tool toolset.
struct SingletonToolset {
    tool: FunctionTool,
}

#[async_trait]
impl Toolset for SingletonToolset {
    fn name(&self) -> &str {
        self.tool.name()
    }

    fn tools(&self) -> Vec<ToolDefinition> {
        vec![self.tool.definition.clone()]
    }

    async fn call_tool(
        &self,
        tool: &str,
        args: Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, Error> {
        if tool != self.tool.name() {
            return Err(Error::UnknownTool(tool.to_string()));
        }
        self.tool.handler.call(args).await
    }

    fn needs_approval(&self, _tool: &str, _args: &Value, _ctx: &ToolContext) -> bool {
        self.tool.requires_approval
    }

    fn capabilities(&self, _tool: &str, _args: &Value) -> Vec<Capability> {
        Vec::new()
    }
}

/// Two-pass registry builder.
#[derive(Default)]
pub struct RegistryBuilder {
    manifest: Option<Manifest>,
    code: CodeRegistry,
    inline_definitions: Vec<(AgentDefinition, String)>,
    project_root: Option<PathBuf>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_manifest(mut self, manifest: Manifest) -> Self {
        self.manifest = Some(manifest);
        self
    }

    pub fn with_code(mut self, code: CodeRegistry) -> Self {
        self.code = code;
        self
    }

    pub fn with_project_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.project_root = Some(root.into());
        self
    }

    /// Add a parsed agent definition directly (bypassing file loading).
    pub fn add_agent_definition(
        mut self,
        definition: AgentDefinition,
        source: impl Into<String>,
    ) -> Self {
        self.inline_definitions.push((definition, source.into()));
        self
    }

    pub fn build(self) -> Result<Registry, Error> {
        let project_root = self
            .project_root
            .clone()
            .or_else(|| self.manifest.as_ref().map(|m| m.root.clone()))
            .unwrap_or_else(|| PathBuf::from("."));

        // ---- Collection pass ----

        let mut definitions: Vec<(AgentDefinition, String)> = Vec::new();

        if let Some(manifest) = &self.manifest {
            for module in &manifest.code_modules {
                if !self.code.contains_module(module) {
                    return Err(Error::UnknownRef(format!(
                        "manifest code module '{module}' is not registered"
                    )));
                }
            }
            for path in &manifest.agent_files {
                let content = std::fs::read_to_string(path)
                    .map_err(|_| Error::FileNotFound(path.display().to_string()))?;
                let definition = parse_agent_file(&content).map_err(|e| match e {
                    Error::MalformedAgentFile { reason } => Error::MalformedAgentFile {
                        reason: format!("{}: {reason}", path.display()),
                    },
                    other => other,
                })?;
                definitions.push((definition, path.display().to_string()));
            }
        }
        definitions.extend(self.inline_definitions);

        let mut tools: HashMap<String, FunctionTool> = HashMap::new();
        let mut toolsets: HashMap<String, ToolsetRef> = HashMap::new();
        let mut functions: Vec<(FunctionEntry, String)> = Vec::new();

        // name -> sources, for collision reporting across all categories.
        let mut sources: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut claim = |name: &str, source: String| {
            sources.entry(name.to_string()).or_default().push(source);
        };

        for builtin in BUILTIN_TOOLSETS {
            claim(builtin, "builtin toolset".to_string());
        }

        for (definition, source) in &definitions {
            claim(&definition.name, format!("agent file {source}"));
        }

        for module in self.code.modules() {
            for (symbol, value) in module.symbols() {
                let source = format!("module {}:{symbol}", module.name());
                match value {
                    CodeSymbol::Tool(tool) => {
                        claim(tool.name(), source);
                        tools.insert(tool.name().to_string(), tool.clone());
                    }
                    CodeSymbol::ToolsetFactory(f) => {
                        claim(f.name(), source);
                        toolsets.insert(f.name().to_string(), ToolsetRef::Factory(Arc::clone(f)));
                    }
                    CodeSymbol::ToolsetInstance(ts) => {
                        claim(ts.name(), source);
                        toolsets.insert(ts.name().to_string(), ToolsetRef::Instance(Arc::clone(ts)));
                    }
                    CodeSymbol::Agent(spec) => {
                        claim(&spec.name, source.clone());
                        definitions.push((definition_from_spec(spec), source));
                    }
                    CodeSymbol::Entry(entry) => {
                        claim(&entry.name, source);
                        functions.push((entry.clone(), module.name().to_string()));
                    }
                    CodeSymbol::Schema(_) => {}
                }
            }
        }

        for (name, claimed) in &sources {
            if claimed.len() > 1 {
                return Err(Error::DuplicateName {
                    name: name.clone(),
                    sources: claimed.clone(),
                });
            }
        }

        // ---- Resolution pass ----

        let policy = match &self.manifest {
            Some(m) => Policy {
                max_depth: m.max_depth,
                agent_calls_require_approval: m.agent_calls_require_approval,
                agent_attachments_require_approval: m.agent_attachments_require_approval,
                allow_cli_input: m.allow_cli_input,
            },
            None => Policy::default(),
        };

        let (filesystem_settings, shell_settings) = match &self.manifest {
            Some(m) => (
                m.toolsets.filesystem.clone().unwrap_or_default(),
                m.toolsets.shell.clone().unwrap_or_default(),
            ),
            None => (FilesystemSettings::default(), ShellSettings::default()),
        };

        let mut registry = Registry {
            agents: HashMap::new(),
            tools,
            toolsets,
            entries: HashMap::new(),
            generated: RwLock::new(HashMap::new()),
            default_entry: None,
            policy,
            project_root: project_root.clone(),
            filesystem_settings,
            shell_settings,
        };

        // Specs first, so agent-as-tool references resolve regardless of
        // declaration order (cycles included).
        let mut specs: Vec<Arc<AgentSpec>> = Vec::new();
        for (definition, _source) in &definitions {
            model::validate_patterns(&definition.name, &definition.compatible_models)?;

            let input_schema = match &definition.input_model_ref {
                None => None,
                Some(reference) => {
                    match self.code.resolve_str(reference, Some(&project_root))? {
                        CodeSymbol::Schema(schema) => Some(schema),
                        other => {
                            return Err(Error::config(format!(
                                "agent '{}': input_model_ref '{reference}' names a {}, not a schema",
                                definition.name,
                                other.kind()
                            )));
                        }
                    }
                }
            };

            let spec = Arc::new(AgentSpec {
                name: definition.name.clone(),
                description: definition.description.clone(),
                instructions: definition.instructions.clone(),
                model: definition.model.clone(),
                toolset_refs: definition.toolsets.clone(),
                input_schema,
                compatible_models: definition.compatible_models.clone(),
                server_side_tools: definition.server_side_tools.clone(),
                calls_require_approval: definition.calls_require_approval,
                accepts_attachments: definition.accepts_attachments,
            });
            registry.agents.insert(
                spec.name.clone(),
                Arc::new(ResolvedAgent {
                    spec: Arc::clone(&spec),
                    plane: Vec::new(),
                }),
            );
            specs.push(spec);
        }

        for spec in specs {
            let plane = registry.resolve_plane(&spec.name, &spec.toolset_refs)?;
            registry
                .agents
                .insert(spec.name.clone(), Arc::new(ResolvedAgent { spec, plane }));
        }

        for agent in registry.agents.values() {
            registry
                .entries
                .insert(agent.spec.name.clone(), Entry::Agent(Arc::clone(agent)));
        }

        for (function, _module) in functions {
            let plane = registry.resolve_plane(&function.name, &function.toolset_refs)?;
            registry.entries.insert(
                function.name.clone(),
                Entry::Function(Arc::new(ResolvedFunction {
                    entry: function,
                    plane,
                })),
            );
        }

        if let Some(manifest) = &self.manifest {
            if let Some(descriptor) = &manifest.entry {
                if let Some(reference) = &descriptor.function_ref {
                    match self.code.resolve_str(reference, Some(&project_root))? {
                        CodeSymbol::Entry(function) => {
                            if registry.entries.contains_key(&descriptor.name) {
                                return Err(Error::DuplicateName {
                                    name: descriptor.name.clone(),
                                    sources: vec![
                                        "registry".to_string(),
                                        format!("manifest entry {reference}"),
                                    ],
                                });
                            }
                            let plane =
                                registry.resolve_plane(&descriptor.name, &function.toolset_refs)?;
                            registry.entries.insert(
                                descriptor.name.clone(),
                                Entry::Function(Arc::new(ResolvedFunction {
                                    entry: function,
                                    plane,
                                })),
                            );
                        }
                        other => {
                            return Err(Error::config(format!(
                                "manifest entry '{reference}' names a {}, not an entry",
                                other.kind()
                            )));
                        }
                    }
                } else if !registry.entries.contains_key(&descriptor.name) {
                    return Err(Error::UnknownEntry(descriptor.name.clone()));
                }
                registry.default_entry = Some(descriptor.name.clone());
            }
        }

        tracing::debug!(
            agents = registry.agents.len(),
            tools = registry.tools.len(),
            toolsets = registry.toolsets.len(),
            entries = registry.entries.len(),
            "registry built"
        );

        Ok(registry)
    }
}

fn definition_from_spec(spec: &AgentSpec) -> AgentDefinition {
    AgentDefinition {
        name: spec.name.clone(),
        description: spec.description.clone(),
        model: spec.model.clone(),
        toolsets: spec.toolset_refs.clone(),
        input_model_ref: None,
        compatible_models: spec.compatible_models.clone(),
        server_side_tools: spec.server_side_tools.clone(),
        calls_require_approval: spec.calls_require_approval,
        accepts_attachments: spec.accepts_attachments,
        instructions: spec.instructions.clone(),
    }
}
