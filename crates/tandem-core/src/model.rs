//! Model selection helpers: compatibility patterns and the environment
//! fallback.

use glob::Pattern;

use crate::error::Error;

/// Environment variable naming a default model when no other source
/// supplies one.
pub const MODEL_ENV_VAR: &str = "TANDEM_MODEL";

/// True when `model` matches at least one of the glob `patterns`.
pub fn matches_any(patterns: &[String], model: &str) -> bool {
    patterns.iter().any(|p| {
        Pattern::new(p)
            .map(|pattern| pattern.matches(model))
            .unwrap_or(false)
    })
}

/// Validate a `compatible_models` pattern list: every entry must be a
/// non-empty, well-formed glob.
pub fn validate_patterns(agent: &str, patterns: &[String]) -> Result<(), Error> {
    for p in patterns {
        if p.trim().is_empty() {
            return Err(Error::config(format!(
                "agent '{agent}': empty compatible_models pattern"
            )));
        }
        Pattern::new(p).map_err(|e| {
            Error::config(format!(
                "agent '{agent}': invalid compatible_models pattern '{p}': {e}"
            ))
        })?;
    }
    Ok(())
}

/// Default model from the environment. Empty or whitespace-only values are
/// treated as unset, not as a literal empty model name.
pub fn env_default_model() -> Option<String> {
    std::env::var(MODEL_ENV_VAR)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
