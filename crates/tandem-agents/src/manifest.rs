//! Project manifest: the TOML descriptor listing agent files, code modules,
//! policy defaults, and optional per-toolset settings.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use tandem_core::Error;
use tandem_tools::{FilesystemSettings, ShellSettings};

fn default_max_depth() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

/// Names the default entry. `function_ref` points at a registered
/// `EntryFn` for code entries; agents are referenced by name alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntryDescriptor {
    pub name: String,
    #[serde(default)]
    pub function_ref: Option<String>,
}

/// Per-toolset settings tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolsetSettings {
    #[serde(default)]
    pub filesystem: Option<FilesystemSettings>,
    #[serde(default)]
    pub shell: Option<ShellSettings>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawManifest {
    #[serde(default)]
    agent_files: Vec<PathBuf>,
    #[serde(default)]
    code_modules: Vec<String>,
    #[serde(default = "default_max_depth")]
    max_depth: u32,
    #[serde(default = "default_true")]
    agent_calls_require_approval: bool,
    #[serde(default)]
    agent_attachments_require_approval: bool,
    #[serde(default = "default_true")]
    allow_cli_input: bool,
    #[serde(default)]
    entry: Option<EntryDescriptor>,
    #[serde(default)]
    toolsets: ToolsetSettings,
}

/// Loaded manifest. File paths are absolute, resolved against the
/// manifest's own directory.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub root: PathBuf,
    pub agent_files: Vec<PathBuf>,
    pub code_modules: Vec<String>,
    pub max_depth: u32,
    pub agent_calls_require_approval: bool,
    pub agent_attachments_require_approval: bool,
    pub allow_cli_input: bool,
    pub entry: Option<EntryDescriptor>,
    pub toolsets: ToolsetSettings,
}

impl Manifest {
    /// Load a manifest from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|_| Error::FileNotFound(path.display().to_string()))?;
        let root = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::parse(&content, root)
    }

    /// Parse manifest text; `root` anchors relative member paths.
    pub fn parse(content: &str, root: impl Into<PathBuf>) -> Result<Self, Error> {
        let raw: RawManifest =
            toml::from_str(content).map_err(|e| Error::malformed_manifest(e.to_string()))?;
        let root = root.into();

        let agent_files = raw
            .agent_files
            .into_iter()
            .map(|p| if p.is_absolute() { p } else { root.join(p) })
            .collect();

        Ok(Self {
            root,
            agent_files,
            code_modules: raw.code_modules,
            max_depth: raw.max_depth,
            agent_calls_require_approval: raw.agent_calls_require_approval,
            agent_attachments_require_approval: raw.agent_attachments_require_approval,
            allow_cli_input: raw.allow_cli_input,
            entry: raw.entry,
            toolsets: raw.toolsets,
        })
    }

    /// An empty manifest rooted at `root`, for programmatic assembly.
    pub fn empty(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            agent_files: Vec::new(),
            code_modules: Vec::new(),
            max_depth: default_max_depth(),
            agent_calls_require_approval: true,
            agent_attachments_require_approval: false,
            allow_cli_input: true,
            entry: None,
            toolsets: ToolsetSettings::default(),
        }
    }
}
