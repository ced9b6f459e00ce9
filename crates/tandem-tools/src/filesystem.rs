//! Filesystem toolset: read, write, and glob under a configured base path.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::fs;
use tokio::io::AsyncReadExt;

use tandem_core::{
    Capability, Error, PropertySchema, ToolContext, ToolDefinition, ToolOutput, ToolParameters,
    Toolset,
};

/// Manifest-level settings for the filesystem toolset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilesystemSettings {
    /// Base path; resolved against the project root when relative.
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default)]
    pub read_only: bool,
}

/// Per-instance configuration (the security boundary).
#[derive(Clone)]
pub struct FilesystemConfig {
    pub root: PathBuf,
    pub read_only: bool,
}

impl FilesystemConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn from_settings(settings: &FilesystemSettings, project_root: &Path) -> Self {
        let root = match &settings.root {
            Some(root) if root.is_absolute() => root.clone(),
            Some(root) => project_root.join(root),
            None => project_root.to_path_buf(),
        };
        Self {
            root,
            read_only: settings.read_only,
        }
    }
}

/// A resolved path plus whether it left the configured base.
struct ResolvedPath {
    path: PathBuf,
    escapes_root: bool,
}

pub struct FilesystemToolset {
    config: FilesystemConfig,
}

#[derive(Deserialize)]
struct ReadFileArgs {
    path: String,
    #[serde(default)]
    max_chars: Option<usize>,
}

#[derive(Deserialize)]
struct WriteFileArgs {
    path: String,
    content: String,
}

#[derive(Deserialize)]
struct GlobArgs {
    pattern: String,
}

/// Upper bound on glob results returned in one call.
const MAX_GLOB_MATCHES: usize = 1000;

impl FilesystemToolset {
    pub fn new(config: FilesystemConfig) -> Self {
        Self { config }
    }

    /// Resolve a path against the base. Relative paths stay inside the
    /// base by construction (`..` is normalized away before the check);
    /// absolute paths are accepted but flagged when they escape it.
    fn resolve(&self, path: &str) -> ResolvedPath {
        let requested = Path::new(path);
        let joined = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            self.config.root.join(requested)
        };

        let normalized = normalize(&joined);
        let root = normalize(&self.config.root);
        let escapes_root = !normalized.starts_with(&root);

        ResolvedPath {
            path: normalized,
            escapes_root,
        }
    }

    async fn read_file(&self, args: ReadFileArgs) -> Result<ToolOutput, Error> {
        let resolved = self.resolve(&args.path);

        let metadata = fs::metadata(&resolved.path).await.map_err(|e| {
            Error::tool("read_file", format!("failed to stat '{}': {e}", args.path))
        })?;
        let total_bytes = metadata.len();

        match args.max_chars {
            None => {
                let content = fs::read_to_string(&resolved.path).await.map_err(|e| {
                    Error::tool("read_file", format!("failed to read '{}': {e}", args.path))
                })?;
                Ok(ToolOutput::success(content))
            }
            Some(max_chars) => self.read_capped(&resolved.path, &args.path, max_chars, total_bytes).await,
        }
    }

    /// Read at most `max_chars` characters without slurping the file: the
    /// read stops once enough bytes for the cap have arrived.
    async fn read_capped(
        &self,
        path: &Path,
        display: &str,
        max_chars: usize,
        total_bytes: u64,
    ) -> Result<ToolOutput, Error> {
        let mut file = tokio::fs::File::open(path).await.map_err(|e| {
            Error::tool("read_file", format!("failed to open '{display}': {e}"))
        })?;

        // A char is at most 4 bytes; max_chars * 4 bounds the buffer.
        let byte_budget = max_chars.saturating_mul(4).saturating_add(4);
        let mut buf = Vec::with_capacity(byte_budget.min(64 * 1024));
        let mut chunk = [0u8; 8 * 1024];

        while buf.len() < byte_budget {
            let n = file.read(&mut chunk).await.map_err(|e| {
                Error::tool("read_file", format!("failed to read '{display}': {e}"))
            })?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }

        let decoded = String::from_utf8_lossy(&buf);
        let mut content: String = decoded.chars().take(max_chars).collect();
        let truncated =
            decoded.chars().nth(max_chars).is_some() || (buf.len() as u64) < total_bytes;

        if truncated {
            content.push_str(&format!(
                "\n[truncated after {max_chars} chars; file is {total_bytes} bytes total]"
            ));
            Ok(ToolOutput::success(content).truncated())
        } else {
            Ok(ToolOutput::success(content))
        }
    }

    async fn write_file(&self, args: WriteFileArgs) -> Result<ToolOutput, Error> {
        let resolved = self.resolve(&args.path);

        if let Some(parent) = resolved.path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                Error::tool("write_file", format!("failed to create '{}': {e}", parent.display()))
            })?;
        }
        fs::write(&resolved.path, args.content.as_bytes())
            .await
            .map_err(|e| {
                Error::tool("write_file", format!("failed to write '{}': {e}", args.path))
            })?;

        Ok(ToolOutput::success(
            json!({"ok": true, "path": args.path, "bytes": args.content.len()}).to_string(),
        ))
    }

    async fn glob(&self, args: GlobArgs) -> Result<ToolOutput, Error> {
        let resolved = self.resolve(&args.pattern);
        let pattern = resolved.path.display().to_string();

        let paths = glob::glob(&pattern)
            .map_err(|e| Error::tool("glob", format!("invalid pattern '{}': {e}", args.pattern)))?;

        let root = normalize(&self.config.root);
        let mut matches: Vec<String> = Vec::new();
        let mut capped = false;
        for entry in paths {
            let path = entry.map_err(|e| Error::tool("glob", e.to_string()))?;
            if matches.len() >= MAX_GLOB_MATCHES {
                capped = true;
                break;
            }
            let display = path
                .strip_prefix(&root)
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| path.display().to_string());
            matches.push(display);
        }
        matches.sort();

        let mut content = matches.join("\n");
        if content.is_empty() {
            content = "(no matches)".to_string();
        }
        if capped {
            content.push_str(&format!("\n[capped at {MAX_GLOB_MATCHES} matches]"));
        }
        Ok(ToolOutput::success(content))
    }
}

#[async_trait]
impl Toolset for FilesystemToolset {
    fn name(&self) -> &str {
        if self.config.read_only {
            "filesystem_ro"
        } else {
            "filesystem"
        }
    }

    fn tools(&self) -> Vec<ToolDefinition> {
        let mut tools = vec![
            ToolDefinition::new("read_file", "Read a file's contents").with_parameters(
                ToolParameters::new()
                    .add_property("path", PropertySchema::string("Path to the file to read"), true)
                    .add_property(
                        "max_chars",
                        PropertySchema::integer("Maximum characters to return"),
                        false,
                    ),
            ),
            ToolDefinition::new("glob", "List files matching a glob pattern").with_parameters(
                ToolParameters::new().add_property(
                    "pattern",
                    PropertySchema::string("Glob pattern, resolved against the base path"),
                    true,
                ),
            ),
        ];
        if !self.config.read_only {
            tools.push(
                ToolDefinition::new("write_file", "Write content to a file").with_parameters(
                    ToolParameters::new()
                        .add_property("path", PropertySchema::string("Path to write"), true)
                        .add_property("content", PropertySchema::string("Content to write"), true),
                ),
            );
        }
        tools
    }

    async fn call_tool(
        &self,
        tool: &str,
        args: Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, Error> {
        match tool {
            "read_file" => {
                let args: ReadFileArgs = serde_json::from_value(args)
                    .map_err(|e| Error::tool("read_file", format!("invalid arguments: {e}")))?;
                self.read_file(args).await
            }
            "write_file" if !self.config.read_only => {
                let args: WriteFileArgs = serde_json::from_value(args)
                    .map_err(|e| Error::tool("write_file", format!("invalid arguments: {e}")))?;
                self.write_file(args).await
            }
            "glob" => {
                let args: GlobArgs = serde_json::from_value(args)
                    .map_err(|e| Error::tool("glob", format!("invalid arguments: {e}")))?;
                self.glob(args).await
            }
            other => Err(Error::UnknownTool(other.to_string())),
        }
    }

    fn needs_approval(&self, tool: &str, args: &Value, _ctx: &ToolContext) -> bool {
        match tool {
            // Writes always require approval.
            "write_file" => true,
            // Reads require approval only when they leave the base path.
            "read_file" | "glob" => {
                let path = args
                    .get("path")
                    .or_else(|| args.get("pattern"))
                    .and_then(Value::as_str)
                    .unwrap_or("");
                self.resolve(path).escapes_root
            }
            _ => true,
        }
    }

    fn approval_args(&self, tool: &str, args: &Value) -> Value {
        let path = args
            .get("path")
            .or_else(|| args.get("pattern"))
            .and_then(Value::as_str)
            .unwrap_or("");
        match tool {
            // A session approval for writes covers the whole base path;
            // escaping paths stay per-path.
            "write_file" if !self.resolve(path).escapes_root => Value::Null,
            _ => json!({"path": path}),
        }
    }

    fn describe_approval(&self, tool: &str, args: &Value, _ctx: &ToolContext) -> String {
        let path = args
            .get("path")
            .or_else(|| args.get("pattern"))
            .and_then(Value::as_str)
            .unwrap_or("?");
        let suffix = if self.resolve(path).escapes_root {
            " (outside base path)"
        } else {
            ""
        };
        match tool {
            "write_file" => {
                let bytes = args
                    .get("content")
                    .and_then(Value::as_str)
                    .map(|c| c.len())
                    .unwrap_or(0);
                format!("write {bytes} bytes to {path}{suffix}")
            }
            "read_file" => format!("read {path}{suffix}"),
            "glob" => format!("glob {path}{suffix}"),
            other => format!("{other}({args})"),
        }
    }

    fn capabilities(&self, tool: &str, _args: &Value) -> Vec<Capability> {
        match tool {
            "write_file" => vec![Capability::WriteFs],
            _ => vec![Capability::ReadFs],
        }
    }
}

/// Logical normalization: strip `.` and resolve `..` without hitting the
/// filesystem, so not-yet-existing write targets resolve too.
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tandem_core::NullSink;

    fn ctx() -> ToolContext {
        ToolContext::new("tester", 0, PathBuf::from("."), Arc::new(NullSink))
    }

    fn toolset(root: &Path) -> FilesystemToolset {
        FilesystemToolset::new(FilesystemConfig::new(root))
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let ts = toolset(dir.path());

        let out = ts
            .call_tool(
                "write_file",
                json!({"path": "a.txt", "content": "hello"}),
                &ctx(),
            )
            .await
            .unwrap();
        assert!(out.content.contains("\"ok\":true"));

        let out = ts
            .call_tool("read_file", json!({"path": "a.txt"}), &ctx())
            .await
            .unwrap();
        assert_eq!(out.content, "hello");
        assert!(!out.truncated);
    }

    #[tokio::test]
    async fn test_read_with_max_chars_reports_truncation() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big.txt"), "abcdefghij".repeat(100)).unwrap();
        let ts = toolset(dir.path());

        let out = ts
            .call_tool(
                "read_file",
                json!({"path": "big.txt", "max_chars": 10}),
                &ctx(),
            )
            .await
            .unwrap();
        assert!(out.truncated);
        assert!(out.content.starts_with("abcdefghij"));
        assert!(out.content.contains("truncated after 10 chars"));
        assert!(out.content.contains("1000 bytes total"));
    }

    #[tokio::test]
    async fn test_glob_lists_relative_matches() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("one.rs"), "").unwrap();
        std::fs::write(dir.path().join("two.rs"), "").unwrap();
        std::fs::write(dir.path().join("other.txt"), "").unwrap();
        let ts = toolset(dir.path());

        let out = ts
            .call_tool("glob", json!({"pattern": "*.rs"}), &ctx())
            .await
            .unwrap();
        assert_eq!(out.content, "one.rs\ntwo.rs");
    }

    #[tokio::test]
    async fn test_read_only_variant_hides_write() {
        let dir = tempfile::tempdir().unwrap();
        let ts = FilesystemToolset::new(FilesystemConfig::new(dir.path()).read_only());

        assert!(!ts.tools().iter().any(|t| t.name == "write_file"));
        let err = ts
            .call_tool("write_file", json!({"path": "a", "content": "x"}), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownTool(_)));
    }

    #[test]
    fn test_approval_policy() {
        let ts = toolset(Path::new("/work"));
        let c = ctx();

        assert!(ts.needs_approval("write_file", &json!({"path": "a", "content": "x"}), &c));
        assert!(!ts.needs_approval("read_file", &json!({"path": "a.txt"}), &c));
        assert!(ts.needs_approval("read_file", &json!({"path": "/etc/passwd"}), &c));
        // `..` inside a relative path is normalized before the base check.
        assert!(ts.needs_approval("read_file", &json!({"path": "../secrets"}), &c));
    }

    #[test]
    fn test_capabilities() {
        let ts = toolset(Path::new("/work"));
        assert_eq!(ts.capabilities("write_file", &json!({})), vec![Capability::WriteFs]);
        assert_eq!(ts.capabilities("read_file", &json!({})), vec![Capability::ReadFs]);
    }
}
