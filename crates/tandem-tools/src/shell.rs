//! Shell toolset: classify a command against configured rules, then run it
//! as a direct argv spawn with captured output.
//!
//! Commands never pass through a shell. Metacharacters (pipes, redirects,
//! substitution) are rejected at classification time so the approval UX is
//! never asked to approve a command that could not run.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;

use tandem_core::{
    Capability, Error, PropertySchema, ToolContext, ToolDefinition, ToolOutput, ToolParameters,
    Toolset,
};

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_output_bytes() -> usize {
    512 * 1024
}

/// What a matched rule decides for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    /// Pre-approved; runs without consulting the approval callback.
    Allow,
    /// Requires approval per invocation.
    Prompt,
    /// Cannot be executed at all.
    Block,
}

/// A classification rule: command name plus an optional argv prefix.
///
/// Rules match tokenized argv, never substrings, so `git` cannot match
/// `gitx` and `git push` cannot match `git pushx`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellRule {
    pub command: String,
    #[serde(default)]
    pub args_prefix: Vec<String>,
    pub action: RuleAction,
}

impl ShellRule {
    fn matches(&self, argv: &[String]) -> bool {
        if argv.is_empty() || argv[0] != self.command {
            return false;
        }
        let rest = &argv[1..];
        rest.len() >= self.args_prefix.len()
            && rest[..self.args_prefix.len()] == self.args_prefix[..]
    }
}

/// Manifest-level settings for the shell toolset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellSettings {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default)]
    pub rules: Vec<ShellRule>,
}

impl Default for ShellSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_output_bytes: default_max_output_bytes(),
            rules: Vec::new(),
        }
    }
}

/// Commands considered read-only when no configured rule matches.
const DEFAULT_ALLOWED: &[&str] = &[
    "ls", "cat", "head", "tail", "wc", "sort", "uniq", "diff", "cut", "tr", "grep", "rg", "find",
    "file", "stat", "du", "df", "basename", "dirname", "realpath", "pwd", "uname", "whoami",
    "which", "env", "printenv", "echo", "printf", "date", "true", "false",
];

/// Result of classifying one command line.
#[derive(Debug, PartialEq, Eq)]
enum Classification {
    Allowed,
    NeedsApproval(String),
    Blocked(String),
}

pub struct ShellToolset {
    settings: ShellSettings,
}

#[derive(Deserialize)]
struct ShellArgs {
    command: String,
    #[serde(default)]
    timeout: Option<u64>,
}

impl ShellToolset {
    pub fn new(settings: ShellSettings) -> Self {
        Self { settings }
    }

    fn classify(&self, command: &str) -> Result<Classification, Error> {
        if let Some(operator) = find_shell_operator(command) {
            return Ok(Classification::Blocked(format!(
                "shell operator '{operator}' is not supported"
            )));
        }

        let argv = tokenize(command).map_err(|e| Error::tool("shell", e))?;

        for rule in &self.settings.rules {
            if rule.matches(&argv) {
                return Ok(match rule.action {
                    RuleAction::Allow => Classification::Allowed,
                    RuleAction::Prompt => Classification::NeedsApproval(argv[0].clone()),
                    RuleAction::Block => {
                        Classification::Blocked(format!("command '{}' is blocked", argv[0]))
                    }
                });
            }
        }

        if DEFAULT_ALLOWED.contains(&argv[0].as_str()) {
            Ok(Classification::Allowed)
        } else {
            // Unknown commands default to requiring approval.
            Ok(Classification::NeedsApproval(argv[0].clone()))
        }
    }

    async fn run(&self, args: ShellArgs) -> Result<ToolOutput, Error> {
        let command = args.command.trim();
        if command.is_empty() {
            return Ok(ToolOutput::error("command cannot be empty"));
        }

        match self.classify(command)? {
            Classification::Blocked(reason) => {
                return Ok(ToolOutput::error(format!("cannot execute: {reason}")));
            }
            Classification::Allowed | Classification::NeedsApproval(_) => {}
        }

        let argv = tokenize(command).map_err(|e| Error::tool("shell", e))?;
        let timeout_secs = args
            .timeout
            .map(|t| t.min(300))
            .unwrap_or(self.settings.timeout_secs);

        tracing::info!(command = %command, timeout_secs, "executing shell command");

        let child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(Duration::from_secs(timeout_secs), child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Ok(ToolOutput::error(format!(
                    "failed to spawn '{}': {e}",
                    argv[0]
                )))
            }
            Err(_) => {
                return Ok(ToolOutput::error(format!(
                    "[command timed out after {timeout_secs}s]"
                )))
            }
        };

        Ok(format_output(
            &String::from_utf8_lossy(&output.stdout),
            &String::from_utf8_lossy(&output.stderr),
            output.status.code().unwrap_or(-1),
            self.settings.max_output_bytes,
        ))
    }
}

#[async_trait]
impl Toolset for ShellToolset {
    fn name(&self) -> &str {
        "shell"
    }

    fn tools(&self) -> Vec<ToolDefinition> {
        vec![ToolDefinition::new(
            "shell",
            "Execute a command and capture its output",
        )
        .with_parameters(
            ToolParameters::new()
                .add_property(
                    "command",
                    PropertySchema::string(
                        "The command to execute. Runs as a direct process spawn; \
                         pipes, redirects, and substitution are not supported.",
                    ),
                    true,
                )
                .add_property(
                    "timeout",
                    PropertySchema::integer("Timeout in seconds (default 30, max 300)"),
                    false,
                ),
        )]
    }

    async fn call_tool(
        &self,
        tool: &str,
        args: Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, Error> {
        if tool != "shell" {
            return Err(Error::UnknownTool(tool.to_string()));
        }
        let args: ShellArgs = serde_json::from_value(args)
            .map_err(|e| Error::tool("shell", format!("invalid arguments: {e}")))?;
        self.run(args).await
    }

    fn needs_approval(&self, _tool: &str, args: &Value, _ctx: &ToolContext) -> bool {
        let command = args.get("command").and_then(Value::as_str).unwrap_or("");
        matches!(
            self.classify(command),
            Ok(Classification::NeedsApproval(_))
        )
    }

    fn approval_args(&self, _tool: &str, args: &Value) -> Value {
        // Session approvals promote the triggering command name, not the
        // full command line.
        let command = args.get("command").and_then(Value::as_str).unwrap_or("");
        match self.classify(command) {
            Ok(Classification::NeedsApproval(trigger)) => {
                serde_json::json!({"command": trigger})
            }
            _ => serde_json::json!({"command": command}),
        }
    }

    fn describe_approval(&self, _tool: &str, args: &Value, _ctx: &ToolContext) -> String {
        let command = args.get("command").and_then(Value::as_str).unwrap_or("?");
        match self.classify(command) {
            Ok(Classification::NeedsApproval(trigger)) => {
                format!("run: {command} (requires approval: {trigger})")
            }
            _ => format!("run: {command}"),
        }
    }

    fn capabilities(&self, _tool: &str, _args: &Value) -> Vec<Capability> {
        vec![Capability::Exec]
    }
}

/// Find the first unquoted shell operator in a command string.
fn find_shell_operator(input: &str) -> Option<&'static str> {
    let mut in_single_quote = false;
    let mut in_double_quote = false;
    let mut prev = '\0';
    let chars: Vec<char> = input.chars().collect();

    for (i, &ch) in chars.iter().enumerate() {
        match ch {
            '\'' if !in_double_quote && prev != '\\' => {
                in_single_quote = !in_single_quote;
            }
            '"' if !in_single_quote && prev != '\\' => {
                in_double_quote = !in_double_quote;
            }
            '|' if !in_single_quote && !in_double_quote => {
                return Some(if chars.get(i + 1) == Some(&'|') { "||" } else { "|" });
            }
            ';' if !in_single_quote && !in_double_quote => return Some(";"),
            '&' if !in_single_quote && !in_double_quote => {
                if chars.get(i + 1) == Some(&'&') {
                    return Some("&&");
                }
            }
            '>' if !in_single_quote && !in_double_quote => return Some(">"),
            '<' if !in_single_quote && !in_double_quote => return Some("<"),
            '$' if !in_single_quote && !in_double_quote => {
                if chars.get(i + 1) == Some(&'(') {
                    return Some("$(");
                }
            }
            '`' if !in_single_quote && !in_double_quote => return Some("`"),
            _ => {}
        }
        prev = ch;
    }

    None
}

/// Tokenize a command string into argv, respecting single/double quotes and
/// backslash escapes.
fn tokenize(input: &str) -> Result<Vec<String>, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("empty command".to_string());
    }

    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_single_quote = false;
    let mut in_double_quote = false;
    let chars: Vec<char> = trimmed.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];

        if in_single_quote {
            if ch == '\'' {
                in_single_quote = false;
            } else {
                current.push(ch);
            }
        } else if in_double_quote {
            if ch == '\\' && i + 1 < chars.len() {
                let next = chars[i + 1];
                match next {
                    '"' | '\\' | '$' | '`' => {
                        current.push(next);
                        i += 1;
                    }
                    _ => current.push(ch),
                }
            } else if ch == '"' {
                in_double_quote = false;
            } else {
                current.push(ch);
            }
        } else {
            match ch {
                '\'' => in_single_quote = true,
                '"' => in_double_quote = true,
                '\\' if i + 1 < chars.len() => {
                    current.push(chars[i + 1]);
                    i += 1;
                }
                ' ' | '\t' => {
                    if !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                    }
                }
                _ => current.push(ch),
            }
        }

        i += 1;
    }

    if in_single_quote || in_double_quote {
        return Err("unterminated quote".to_string());
    }

    if !current.is_empty() {
        tokens.push(current);
    }

    if tokens.is_empty() {
        return Err("no command found".to_string());
    }

    Ok(tokens)
}

/// Format captured output: stdout, a labelled stderr section, the exit code
/// when non-zero, and a truncation marker past the byte cap.
fn format_output(stdout: &str, stderr: &str, exit_code: i32, max_bytes: usize) -> ToolOutput {
    let mut output = String::new();

    let stdout = stdout.trim();
    let stderr = stderr.trim();

    if !stdout.is_empty() {
        output.push_str(stdout);
    }

    if !stderr.is_empty() {
        if !output.is_empty() {
            output.push_str("\n\n");
        }
        output.push_str("[stderr]\n");
        output.push_str(stderr);
    }

    if output.is_empty() {
        if exit_code == 0 {
            output.push_str("(no output)");
        } else {
            output.push_str(&format!("(no output, exit code {exit_code})"));
        }
    } else if exit_code != 0 {
        output.push_str(&format!("\n\n[exit code {exit_code}]"));
    }

    let mut truncated = false;
    if output.len() > max_bytes {
        let cut = output
            .char_indices()
            .take_while(|(i, _)| *i <= max_bytes)
            .last()
            .map(|(i, _)| i)
            .unwrap_or(0);
        let cut_point = output[..cut].rfind('\n').unwrap_or(cut);
        let total = output.len();
        output.truncate(cut_point);
        output.push_str(&format!(
            "\n\n[output truncated at {cut_point} bytes, total was {total} bytes]"
        ));
        truncated = true;
    }

    let result = if exit_code != 0 {
        ToolOutput::error(output)
    } else {
        ToolOutput::success(output)
    };
    if truncated {
        result.truncated()
    } else {
        result
    }
}
