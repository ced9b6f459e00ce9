use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("duplicate name '{name}' declared by {}", sources.join(", "))]
    DuplicateName { name: String, sources: Vec<String> },

    #[error("unknown reference '{0}'")]
    UnknownRef(String),

    #[error("ambiguous reference '{symbol}': module ref and path ref disagree")]
    AmbiguousRef { symbol: String },

    #[error("unknown entry '{0}'")]
    UnknownEntry(String),

    #[error("unknown toolset '{0}'")]
    UnknownToolset(String),

    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("max depth exceeded: {caller} -> {callee} would reach depth {depth} (max {max})")]
    MaxDepthExceeded {
        caller: String,
        callee: String,
        depth: u32,
        max: u32,
    },

    #[error("model '{model}' is not compatible with agent '{agent}' (allowed: {})", allowed.join(", "))]
    IncompatibleModel {
        agent: String,
        model: String,
        allowed: Vec<String>,
    },

    #[error("permission denied: {tool} - {description}")]
    PermissionDenied { tool: String, description: String },

    #[error("tool error: {tool} - {message}")]
    Tool { tool: String, message: String },

    #[error("input validation failed for '{target}': {reason}")]
    InputValidation { target: String, reason: String },

    #[error("malformed agent file: {reason}")]
    MalformedAgentFile { reason: String },

    #[error("malformed manifest: {reason}")]
    MalformedManifest { reason: String },

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("attachment unavailable: {path}")]
    AttachmentUnavailable { path: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("cancelled")]
    Cancelled,

    #[error("unknown error: {0}")]
    Unknown(String),
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    pub fn permission_denied(tool: impl Into<String>, description: impl Into<String>) -> Self {
        Self::PermissionDenied {
            tool: tool.into(),
            description: description.into(),
        }
    }

    pub fn input_validation(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InputValidation {
            target: target.into(),
            reason: reason.into(),
        }
    }

    pub fn malformed_agent_file(reason: impl Into<String>) -> Self {
        Self::MalformedAgentFile {
            reason: reason.into(),
        }
    }

    pub fn malformed_manifest(reason: impl Into<String>) -> Self {
        Self::MalformedManifest {
            reason: reason.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn stream(message: impl Into<String>) -> Self {
        Self::Stream(message.into())
    }

    /// Stable kind label used in `Error` event payloads and log shipping.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::DuplicateName { .. } => "duplicate_name",
            Error::UnknownRef(_) => "unknown_ref",
            Error::AmbiguousRef { .. } => "ambiguous_ref",
            Error::UnknownEntry(_) => "unknown_entry",
            Error::UnknownToolset(_) => "unknown_toolset",
            Error::UnknownTool(_) => "unknown_tool",
            Error::MaxDepthExceeded { .. } => "max_depth_exceeded",
            Error::IncompatibleModel { .. } => "incompatible_model",
            Error::PermissionDenied { .. } => "permission_denied",
            Error::Tool { .. } => "tool_execution",
            Error::InputValidation { .. } => "input_validation",
            Error::MalformedAgentFile { .. } => "malformed_agent_file",
            Error::MalformedManifest { .. } => "malformed_manifest",
            Error::FileNotFound(_) => "file_not_found",
            Error::AttachmentUnavailable { .. } => "attachment_unavailable",
            Error::Config(_) => "configuration",
            Error::Serialization(_) => "serialization",
            Error::Transport(_) => "transport",
            Error::Stream(_) => "stream",
            Error::Cancelled => "cancelled",
            Error::Unknown(_) => "unknown",
        }
    }

    /// True for failures that are fatal at registry build time.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::DuplicateName { .. }
                | Error::UnknownRef(_)
                | Error::AmbiguousRef { .. }
                | Error::MalformedAgentFile { .. }
                | Error::MalformedManifest { .. }
                | Error::Config(_)
        )
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Error::PermissionDenied { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
