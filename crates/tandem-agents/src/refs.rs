//! `module:symbol` reference resolution.
//!
//! The embedding application registers named code modules (symbol tables of
//! toolset factories, function tools, input schemas, entries, and agent
//! specs); manifests and agent files refer to their contents with
//! `<modpath>:<symbol>` strings, where `<modpath>` is either a dotted module
//! name or a filesystem path. A module is resolved at most once per process:
//! path lookups are cached by canonical absolute path, and a path ref and a
//! dotted ref reaching the same registration share one module instance.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, RwLock};

use tandem_core::{Error, InputSchema, Toolset, ToolsetFactory};

use crate::definition::{AgentSpec, FunctionEntry, FunctionTool};

/// A symbol registered by the embedding application.
#[derive(Clone)]
pub enum CodeSymbol {
    ToolsetFactory(Arc<dyn ToolsetFactory>),
    ToolsetInstance(Arc<dyn Toolset>),
    Tool(FunctionTool),
    Schema(InputSchema),
    Entry(FunctionEntry),
    Agent(AgentSpec),
}

impl std::fmt::Debug for CodeSymbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple(match self {
            CodeSymbol::ToolsetFactory(_) => "ToolsetFactory",
            CodeSymbol::ToolsetInstance(_) => "ToolsetInstance",
            CodeSymbol::Tool(_) => "Tool",
            CodeSymbol::Schema(_) => "Schema",
            CodeSymbol::Entry(_) => "Entry",
            CodeSymbol::Agent(_) => "Agent",
        })
        .finish()
    }
}

impl CodeSymbol {
    pub fn kind(&self) -> &'static str {
        match self {
            CodeSymbol::ToolsetFactory(_) | CodeSymbol::ToolsetInstance(_) => "toolset",
            CodeSymbol::Tool(_) => "tool",
            CodeSymbol::Schema(_) => "schema",
            CodeSymbol::Entry(_) => "entry",
            CodeSymbol::Agent(_) => "agent",
        }
    }
}

/// A named symbol table contributed from code.
pub struct CodeModule {
    name: String,
    symbols: HashMap<String, CodeSymbol>,
}

impl CodeModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            symbols: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn insert(mut self, symbol: impl Into<String>, value: CodeSymbol) -> Self {
        self.symbols.insert(symbol.into(), value);
        self
    }

    pub fn get(&self, symbol: &str) -> Option<&CodeSymbol> {
        self.symbols.get(symbol)
    }

    pub fn symbols(&self) -> impl Iterator<Item = (&str, &CodeSymbol)> {
        self.symbols.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// A parsed `<modpath>:<symbol>` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolRef {
    pub module: ModulePath,
    pub symbol: String,
}

/// Either a dotted module name or a filesystem path. A modpath containing a
/// path separator is a path; everything else is a name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModulePath {
    Name(String),
    Path(PathBuf),
}

impl SymbolRef {
    pub fn parse(input: &str) -> Result<Self, Error> {
        let colon = input
            .rfind(':')
            .ok_or_else(|| Error::UnknownRef(format!("'{input}' is not of the form module:symbol")))?;
        let (modpath, symbol) = (input[..colon].trim(), input[colon + 1..].trim());

        if modpath.is_empty() || symbol.is_empty() {
            return Err(Error::UnknownRef(format!(
                "'{input}' is not of the form module:symbol"
            )));
        }

        let module = if modpath.contains('/') || modpath.contains('\\') {
            ModulePath::Path(PathBuf::from(modpath))
        } else {
            ModulePath::Name(modpath.to_string())
        };

        Ok(Self {
            module,
            symbol: symbol.to_string(),
        })
    }
}

impl std::fmt::Display for SymbolRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.module {
            ModulePath::Name(name) => write!(f, "{}:{}", name, self.symbol),
            ModulePath::Path(path) => write!(f, "{}:{}", path.display(), self.symbol),
        }
    }
}

struct ModuleSlot {
    by_name: Option<Arc<CodeModule>>,
    by_path: Option<Arc<CodeModule>>,
}

/// Registry of code modules plus the resolve-once caches.
#[derive(Default)]
pub struct CodeRegistry {
    slots: HashMap<String, ModuleSlot>,
    paths: HashMap<PathBuf, String>,
    /// Raw path string -> canonical path, filled on first resolution.
    canonical_cache: RwLock<HashMap<String, PathBuf>>,
}

impl CodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module under its dotted name.
    pub fn register_module(&mut self, module: CodeModule) -> Result<(), Error> {
        let name = module.name.clone();
        let slot = self.slots.entry(name.clone()).or_insert(ModuleSlot {
            by_name: None,
            by_path: None,
        });
        if slot.by_name.is_some() {
            return Err(Error::config(format!(
                "code module '{name}' registered twice"
            )));
        }
        slot.by_name = Some(Arc::new(module));
        Ok(())
    }

    /// Register a module reachable through a filesystem path. The module is
    /// also reachable by its own name; when the same name was registered
    /// from code, symbols present in both registrations become ambiguous.
    pub fn register_path_module(
        &mut self,
        path: impl Into<PathBuf>,
        module: CodeModule,
    ) -> Result<(), Error> {
        let path = normalize(&path.into());
        let name = module.name.clone();
        if let Some(existing) = self.paths.get(&path) {
            if existing != &name {
                return Err(Error::config(format!(
                    "path '{}' already registered as module '{existing}'",
                    path.display()
                )));
            }
        }
        self.paths.insert(path, name.clone());

        let slot = self.slots.entry(name.clone()).or_insert(ModuleSlot {
            by_name: None,
            by_path: None,
        });
        if slot.by_path.is_some() {
            return Err(Error::config(format!(
                "code module '{name}' registered twice by path"
            )));
        }
        slot.by_path = Some(Arc::new(module));
        Ok(())
    }

    pub fn contains_module(&self, name: &str) -> bool {
        self.slots.contains_key(name)
    }

    pub fn module_names(&self) -> Vec<&str> {
        self.slots.keys().map(|s| s.as_str()).collect()
    }

    /// Iterate every registered module (a name registered both ways and
    /// sharing one instance yields once).
    pub fn modules(&self) -> Vec<Arc<CodeModule>> {
        let mut out = Vec::new();
        for slot in self.slots.values() {
            match (&slot.by_name, &slot.by_path) {
                (Some(a), Some(b)) if Arc::ptr_eq(a, b) => out.push(Arc::clone(a)),
                (by_name, by_path) => {
                    if let Some(m) = by_name {
                        out.push(Arc::clone(m));
                    }
                    if let Some(m) = by_path {
                        out.push(Arc::clone(m));
                    }
                }
            }
        }
        out
    }

    /// Resolve a reference to a registered symbol.
    ///
    /// `base_path` anchors relative path refs; a relative path ref with no
    /// base is an error rather than a CWD lookup.
    pub fn resolve(&self, r: &SymbolRef, base_path: Option<&Path>) -> Result<CodeSymbol, Error> {
        match &r.module {
            ModulePath::Name(name) => {
                let slot = self
                    .slots
                    .get(name)
                    .ok_or_else(|| Error::UnknownRef(r.to_string()))?;
                self.lookup(slot, &r.symbol, &r.to_string())
            }
            ModulePath::Path(path) => {
                let canonical = self.canonicalize(path, base_path)?;
                let name = self
                    .paths
                    .get(&canonical)
                    .ok_or_else(|| Error::UnknownRef(r.to_string()))?;
                let slot = self
                    .slots
                    .get(name)
                    .ok_or_else(|| Error::UnknownRef(r.to_string()))?;
                self.lookup(slot, &r.symbol, &r.to_string())
            }
        }
    }

    /// Parse and resolve in one step.
    pub fn resolve_str(&self, input: &str, base_path: Option<&Path>) -> Result<CodeSymbol, Error> {
        self.resolve(&SymbolRef::parse(input)?, base_path)
    }

    fn lookup(&self, slot: &ModuleSlot, symbol: &str, display: &str) -> Result<CodeSymbol, Error> {
        match (&slot.by_name, &slot.by_path) {
            (Some(a), Some(b)) if !Arc::ptr_eq(a, b) => {
                // Two distinct registrations for one module name: a symbol
                // present in both has no single meaning.
                match (a.get(symbol), b.get(symbol)) {
                    (Some(_), Some(_)) => Err(Error::AmbiguousRef {
                        symbol: display.to_string(),
                    }),
                    (Some(found), None) | (None, Some(found)) => Ok(found.clone()),
                    (None, None) => Err(Error::UnknownRef(display.to_string())),
                }
            }
            (Some(module), _) | (None, Some(module)) => module
                .get(symbol)
                .cloned()
                .ok_or_else(|| Error::UnknownRef(display.to_string())),
            (None, None) => Err(Error::UnknownRef(display.to_string())),
        }
    }

    fn canonicalize(&self, path: &Path, base_path: Option<&Path>) -> Result<PathBuf, Error> {
        let key = path.display().to_string();
        if let Some(cached) = self.canonical_cache.read().ok().and_then(|c| c.get(&key).cloned()) {
            return Ok(cached);
        }

        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            let base = base_path.ok_or_else(|| {
                Error::config(format!(
                    "relative path ref '{}' requires an explicit base path",
                    path.display()
                ))
            })?;
            base.join(path)
        };
        let canonical = normalize(&absolute);

        if let Ok(mut cache) = self.canonical_cache.write() {
            cache.insert(key, canonical.clone());
        }
        Ok(canonical)
    }
}

/// Logical normalization: strip `.` and resolve `..` without touching the
/// filesystem, so registrations and lookups agree on non-existent paths too.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            c => out.push(c),
        }
    }
    out
}
