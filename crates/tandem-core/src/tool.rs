use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: ToolParameters,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: ToolParameters::default(),
        }
    }

    pub fn with_parameters(mut self, parameters: ToolParameters) -> Self {
        self.parameters = parameters;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParameters {
    #[serde(rename = "type")]
    pub schema_type: String,
    #[serde(default)]
    pub properties: std::collections::HashMap<String, PropertySchema>,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(rename = "additionalProperties", default)]
    pub additional_properties: bool,
}

impl Default for ToolParameters {
    fn default() -> Self {
        Self {
            schema_type: "object".to_string(),
            properties: std::collections::HashMap::new(),
            required: Vec::new(),
            additional_properties: false,
        }
    }
}

impl ToolParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_property(
        mut self,
        name: impl Into<String>,
        schema: PropertySchema,
        required: bool,
    ) -> Self {
        let name = name.into();
        self.properties.insert(name.clone(), schema);
        if required {
            self.required.push(name);
        }
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertySchema {
    #[serde(rename = "type")]
    pub schema_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<PropertySchema>>,
}

impl PropertySchema {
    pub fn string(description: impl Into<String>) -> Self {
        Self {
            schema_type: "string".to_string(),
            description: Some(description.into()),
            enum_values: None,
            default: None,
            items: None,
        }
    }

    pub fn integer(description: impl Into<String>) -> Self {
        Self {
            schema_type: "integer".to_string(),
            description: Some(description.into()),
            enum_values: None,
            default: None,
            items: None,
        }
    }

    pub fn number(description: impl Into<String>) -> Self {
        Self {
            schema_type: "number".to_string(),
            description: Some(description.into()),
            enum_values: None,
            default: None,
            items: None,
        }
    }

    pub fn boolean(description: impl Into<String>) -> Self {
        Self {
            schema_type: "boolean".to_string(),
            description: Some(description.into()),
            enum_values: None,
            default: None,
            items: None,
        }
    }

    pub fn array(description: impl Into<String>, items: PropertySchema) -> Self {
        Self {
            schema_type: "array".to_string(),
            description: Some(description.into()),
            enum_values: None,
            default: None,
            items: Some(Box::new(items)),
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
    /// Set when the content was cut at a byte/char cap.
    pub truncated: bool,
}

impl ToolOutput {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
            truncated: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
            truncated: false,
        }
    }

    pub fn truncated(mut self) -> Self {
        self.truncated = true;
        self
    }
}

/// A structured-record input schema attached to an agent or function entry.
///
/// Reuses the tool-parameter schema shape; `validate` coerces scalar string
/// inputs into the declared types and checks required fields before an
/// invocation is dispatched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSchema {
    pub record: ToolParameters,
}

impl InputSchema {
    pub fn new(record: ToolParameters) -> Self {
        Self { record }
    }

    /// Validate and coerce `input` against this schema.
    ///
    /// Returns the coerced record. Fails with `InputValidation` for a
    /// non-object input, a missing required field, an uncoercible value, or
    /// an unexpected field when `additionalProperties` is false.
    pub fn validate(&self, target: &str, input: &Value) -> Result<Value, Error> {
        let obj = input
            .as_object()
            .ok_or_else(|| Error::input_validation(target, "input is not a record"))?;

        let mut coerced = serde_json::Map::new();

        for (key, value) in obj {
            match self.record.properties.get(key) {
                Some(schema) => {
                    coerced.insert(key.clone(), coerce_value(target, key, schema, value)?);
                }
                None if self.record.additional_properties => {
                    coerced.insert(key.clone(), value.clone());
                }
                None => {
                    return Err(Error::input_validation(
                        target,
                        format!("unexpected field '{key}'"),
                    ));
                }
            }
        }

        for required in &self.record.required {
            if !coerced.contains_key(required) {
                match self.record.properties.get(required).and_then(|s| s.default.clone()) {
                    Some(default) => {
                        coerced.insert(required.clone(), default);
                    }
                    None => {
                        return Err(Error::input_validation(
                            target,
                            format!("missing required field '{required}'"),
                        ));
                    }
                }
            }
        }

        Ok(Value::Object(coerced))
    }
}

fn coerce_value(
    target: &str,
    field: &str,
    schema: &PropertySchema,
    value: &Value,
) -> Result<Value, Error> {
    let mismatch = || {
        Error::input_validation(
            target,
            format!(
                "field '{field}' expected {}, got {value}",
                schema.schema_type
            ),
        )
    };

    match schema.schema_type.as_str() {
        "string" => match value {
            Value::String(s) => {
                if let Some(allowed) = &schema.enum_values {
                    if !allowed.iter().any(|a| a == s) {
                        return Err(Error::input_validation(
                            target,
                            format!("field '{field}' must be one of {allowed:?}"),
                        ));
                    }
                }
                Ok(value.clone())
            }
            _ => Err(mismatch()),
        },
        "integer" => match value {
            Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value.clone()),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(|n| Value::Number(n.into()))
                .map_err(|_| mismatch()),
            _ => Err(mismatch()),
        },
        "number" => match value {
            Value::Number(_) => Ok(value.clone()),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(mismatch),
            _ => Err(mismatch()),
        },
        "boolean" => match value {
            Value::Bool(_) => Ok(value.clone()),
            Value::String(s) => match s.trim() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(mismatch()),
            },
            _ => Err(mismatch()),
        },
        "array" => match value {
            Value::Array(items) => {
                if let Some(item_schema) = &schema.items {
                    let coerced: Result<Vec<Value>, Error> = items
                        .iter()
                        .map(|v| coerce_value(target, field, item_schema, v))
                        .collect();
                    Ok(Value::Array(coerced?))
                } else {
                    Ok(value.clone())
                }
            }
            _ => Err(mismatch()),
        },
        _ => Ok(value.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> InputSchema {
        InputSchema::new(
            ToolParameters::new()
                .add_property("query", PropertySchema::string("search query"), true)
                .add_property("limit", PropertySchema::integer("max results"), false),
        )
    }

    #[test]
    fn test_validate_accepts_and_coerces() {
        let out = schema()
            .validate("search", &json!({"query": "rust", "limit": "5"}))
            .unwrap();
        assert_eq!(out["limit"], json!(5));
    }

    #[test]
    fn test_validate_missing_required() {
        let err = schema().validate("search", &json!({"limit": 2})).unwrap_err();
        assert!(matches!(err, Error::InputValidation { .. }));
    }

    #[test]
    fn test_validate_rejects_unknown_field() {
        let err = schema()
            .validate("search", &json!({"query": "x", "extra": 1}))
            .unwrap_err();
        assert!(err.to_string().contains("extra"));
    }

    #[test]
    fn test_validate_rejects_non_record() {
        assert!(schema().validate("search", &json!("plain")).is_err());
    }

    #[test]
    fn test_required_default_fills_in() {
        let schema = InputSchema::new(ToolParameters::new().add_property(
            "mode",
            PropertySchema::string("mode").with_default(json!("fast")),
            true,
        ));
        let out = schema.validate("t", &json!({})).unwrap();
        assert_eq!(out["mode"], json!("fast"));
    }

    #[test]
    fn test_tool_definition() {
        let def = ToolDefinition::new("read_file", "Read contents of a file").with_parameters(
            ToolParameters::new().add_property("path", PropertySchema::string("Path"), true),
        );
        assert_eq!(def.name, "read_file");
        assert!(def.parameters.required.contains(&"path".to_string()));
    }
}
