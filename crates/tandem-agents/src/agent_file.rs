//! Agent-file parser.
//!
//! An agent file is a frontmatter block delimited by `---` lines followed by
//! a free-text body used as the agent's instructions:
//!
//! ```text
//! ---
//! name: researcher
//! description: Finds and summarizes sources.
//! model: anthropic:claude-sonnet-4
//! toolsets: [filesystem_ro, shell]
//! compatible_models:
//!   - anthropic:*
//! ---
//!
//! You are a careful researcher...
//! ```
//!
//! The parser validates shape only; reference resolution is the registry
//! builder's job.

use serde::Deserialize;
use serde_json::Value;

use tandem_core::Error;

/// Parsed agent file, before reference resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentDefinition {
    pub name: String,
    pub description: Option<String>,
    pub model: Option<String>,
    pub toolsets: Vec<String>,
    pub input_model_ref: Option<String>,
    pub compatible_models: Vec<String>,
    pub server_side_tools: Vec<Value>,
    pub calls_require_approval: Option<bool>,
    /// Whether this agent's tool surface accepts attachments (default true).
    pub accepts_attachments: bool,
    pub instructions: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFrontmatter {
    name: Option<String>,
    description: Option<String>,
    model: Option<String>,
    #[serde(default)]
    toolsets: Option<Vec<String>>,
    input_model_ref: Option<String>,
    #[serde(default)]
    compatible_models: Option<Vec<String>>,
    #[serde(default)]
    server_side_tools: Option<Vec<Value>>,
    calls_require_approval: Option<bool>,
    accepts_attachments: Option<bool>,
}

/// Split an agent file into its frontmatter and instruction body.
fn split_frontmatter(content: &str) -> Result<(&str, &str), Error> {
    let content = content.trim_start();

    if !content.starts_with("---") {
        return Err(Error::malformed_agent_file(
            "missing frontmatter (file must start with ---)",
        ));
    }

    let after_first = &content[3..];
    let end = after_first.find("\n---").ok_or_else(|| {
        Error::malformed_agent_file("unterminated frontmatter (no closing ---)")
    })?;
    let block = after_first[..end].trim();
    let body = after_first[end + 4..].trim_start_matches(['\n', '\r']);

    Ok((block, body))
}

/// Parse an agent file's text content.
pub fn parse_agent_file(content: &str) -> Result<AgentDefinition, Error> {
    let (block, body) = split_frontmatter(content)?;

    let map = frontmatter_to_map(block)?;
    let raw: RawFrontmatter = serde_json::from_value(Value::Object(map))
        .map_err(|e| Error::malformed_agent_file(e.to_string()))?;

    let name = raw
        .name
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| Error::malformed_agent_file("missing required key 'name'"))?;

    Ok(AgentDefinition {
        name,
        description: raw.description,
        model: raw.model,
        toolsets: raw.toolsets.unwrap_or_default(),
        input_model_ref: raw.input_model_ref,
        compatible_models: raw.compatible_models.unwrap_or_default(),
        server_side_tools: raw.server_side_tools.unwrap_or_default(),
        calls_require_approval: raw.calls_require_approval,
        accepts_attachments: raw.accepts_attachments.unwrap_or(true),
        instructions: body.trim().to_string(),
    })
}

/// Serialize a definition back to agent-file form. Re-parsing the output
/// yields an equivalent definition.
pub fn to_agent_file(def: &AgentDefinition) -> String {
    let mut out = String::from("---\n");
    push_scalar(&mut out, "name", &def.name);
    if let Some(description) = &def.description {
        push_scalar(&mut out, "description", description);
    }
    if let Some(model) = &def.model {
        push_scalar(&mut out, "model", model);
    }
    if !def.toolsets.is_empty() {
        push_list(&mut out, "toolsets", &def.toolsets);
    }
    if let Some(input_model_ref) = &def.input_model_ref {
        push_scalar(&mut out, "input_model_ref", input_model_ref);
    }
    if !def.compatible_models.is_empty() {
        push_list(&mut out, "compatible_models", &def.compatible_models);
    }
    if !def.server_side_tools.is_empty() {
        out.push_str("server_side_tools:\n");
        for record in &def.server_side_tools {
            out.push_str("  - ");
            out.push_str(&record.to_string());
            out.push('\n');
        }
    }
    if let Some(required) = def.calls_require_approval {
        out.push_str(&format!("calls_require_approval: {required}\n"));
    }
    if !def.accepts_attachments {
        out.push_str("accepts_attachments: false\n");
    }
    out.push_str("---\n\n");
    out.push_str(&def.instructions);
    out.push('\n');
    out
}

fn push_scalar(out: &mut String, key: &str, value: &str) {
    out.push_str(&format!("{key}: {}\n", Value::String(value.to_string())));
}

fn push_list(out: &mut String, key: &str, items: &[String]) {
    out.push_str(&format!("{key}:\n"));
    for item in items {
        out.push_str(&format!("  - {}\n", Value::String(item.clone())));
    }
}

/// Parse the frontmatter block into a JSON map.
///
/// The accepted grammar is deliberately small: `key: scalar`,
/// `key: [inline, list]`, and `key:` followed by indented `- item` lines
/// where an item is a quoted string, a bare word, or an inline JSON record.
fn frontmatter_to_map(block: &str) -> Result<serde_json::Map<String, Value>, Error> {
    let mut map = serde_json::Map::new();
    let lines: Vec<&str> = block.lines().collect();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        let trimmed = line.trim();

        if trimmed.is_empty() || trimmed.starts_with('#') {
            i += 1;
            continue;
        }

        if line.starts_with([' ', '\t']) {
            return Err(Error::malformed_agent_file(format!(
                "unexpected indented line: '{trimmed}'"
            )));
        }

        let colon = trimmed.find(':').ok_or_else(|| {
            Error::malformed_agent_file(format!("expected 'key: value', got '{trimmed}'"))
        })?;
        let key = trimmed[..colon].trim().to_string();
        let rest = trimmed[colon + 1..].trim();

        if rest.is_empty() {
            // Block list follows.
            let mut items = Vec::new();
            i += 1;
            while i < lines.len() {
                let item_line = lines[i];
                let item_trimmed = item_line.trim();
                if item_trimmed.is_empty() {
                    i += 1;
                    continue;
                }
                if !item_line.starts_with([' ', '\t']) {
                    break;
                }
                let item = item_trimmed.strip_prefix("- ").ok_or_else(|| {
                    Error::malformed_agent_file(format!(
                        "expected '- item' under '{key}', got '{item_trimmed}'"
                    ))
                })?;
                items.push(parse_item(item));
                i += 1;
            }
            if items.is_empty() {
                return Err(Error::malformed_agent_file(format!(
                    "key '{key}' has no value"
                )));
            }
            map.insert(key, Value::Array(items));
        } else {
            map.insert(key, parse_value(rest));
            i += 1;
        }
    }

    Ok(map)
}

fn parse_value(s: &str) -> Value {
    if s.starts_with('[') && s.ends_with(']') {
        // Inline list; accept both quoted and bare items.
        if let Ok(v) = serde_json::from_str::<Value>(s) {
            return v;
        }
        let inner = s[1..s.len() - 1].trim();
        if inner.is_empty() {
            return Value::Array(Vec::new());
        }
        return Value::Array(
            inner.split(',').map(|item| parse_item(item.trim())).collect(),
        );
    }
    parse_item(s)
}

fn parse_item(s: &str) -> Value {
    let s = s.trim();
    if (s.starts_with('{') && s.ends_with('}')) || (s.starts_with('[') && s.ends_with(']')) {
        if let Ok(v) = serde_json::from_str::<Value>(s) {
            return v;
        }
    }
    if (s.starts_with('"') && s.ends_with('"') && s.len() >= 2)
        || (s.starts_with('\'') && s.ends_with('\'') && s.len() >= 2)
    {
        return Value::String(s[1..s.len() - 1].to_string());
    }
    match s {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(n) = s.parse::<i64>() {
        return Value::Number(n.into());
    }
    Value::String(s.to_string())
}
