//! tandem-tools: Built-in toolsets for the tandem runtime
//!
//! Filesystem, shell, and attachment toolsets, plus the approval gate that
//! wraps every toolset placed into an active plane.

pub mod approval;
pub mod attachments;
pub mod filesystem;
pub mod shell;

pub use approval::ApprovalGate;
pub use attachments::AttachmentsToolset;
pub use filesystem::{FilesystemConfig, FilesystemSettings, FilesystemToolset};
pub use shell::{RuleAction, ShellRule, ShellSettings, ShellToolset};
