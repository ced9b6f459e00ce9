//! Attachments toolset: materializes attachment references (local paths or
//! URLs) into multimodal message parts.
//!
//! Internal-only: it exposes no model-facing tools. The agent runner resolves
//! attachments exactly once, before dispatch, through `materialize`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::Engine;
use serde_json::Value;
use tokio::fs;

use tandem_core::{
    Capability, ContentPart, Error, ToolContext, ToolDefinition, ToolOutput, Toolset,
};

pub struct AttachmentsToolset {
    project_root: PathBuf,
}

impl AttachmentsToolset {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
        }
    }

    /// Materialize attachment references into message parts.
    ///
    /// URLs pass through untouched (the provider fetches them); local paths
    /// resolve against the project root and are inlined as data URIs for
    /// recognized image types, or as text otherwise.
    pub async fn materialize(&self, refs: &[String]) -> Result<Vec<ContentPart>, Error> {
        let mut parts = Vec::with_capacity(refs.len());
        for reference in refs {
            parts.push(self.materialize_one(reference).await?);
        }
        Ok(parts)
    }

    async fn materialize_one(&self, reference: &str) -> Result<ContentPart, Error> {
        if reference.starts_with("http://") || reference.starts_with("https://") {
            return Ok(ContentPart::Image {
                url: reference.to_string(),
            });
        }

        let path = self.resolve(reference);
        let bytes = fs::read(&path).await.map_err(|_| Error::AttachmentUnavailable {
            path: reference.to_string(),
        })?;

        match infer::get(&bytes) {
            Some(kind) if kind.mime_type().starts_with("image/") => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
                Ok(ContentPart::Image {
                    url: format!("data:{};base64,{encoded}", kind.mime_type()),
                })
            }
            _ => Ok(ContentPart::Text {
                text: String::from_utf8_lossy(&bytes).into_owned(),
            }),
        }
    }

    fn resolve(&self, reference: &str) -> PathBuf {
        let requested = Path::new(reference);
        if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            self.project_root.join(requested)
        }
    }
}

#[async_trait]
impl Toolset for AttachmentsToolset {
    fn name(&self) -> &str {
        "attachments"
    }

    fn tools(&self) -> Vec<ToolDefinition> {
        Vec::new()
    }

    async fn call_tool(
        &self,
        tool: &str,
        _args: Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, Error> {
        Err(Error::UnknownTool(tool.to_string()))
    }

    fn needs_approval(&self, _tool: &str, _args: &Value, _ctx: &ToolContext) -> bool {
        false
    }

    fn capabilities(&self, _tool: &str, _args: &Value) -> Vec<Capability> {
        vec![Capability::ReadFs]
    }
}
