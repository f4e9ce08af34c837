use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{Tool, ToolContext, ToolInfo, ToolInvocation, ToolResponse};
use crate::{CoreError, Result};

pub const STRUCT_OUTPUT_TOOL: &str = "struct_output";

/// Synthetic tool whose parameters are a caller-supplied JSON schema.
///
/// A successful call is the only valid way to finish a run that asked for
/// structured output.
pub struct StructOutputTool {
    schema: Value,
    validator: jsonschema::Validator,
}

impl StructOutputTool {
    pub fn new(schema: Value) -> Result<Self> {
        let validator = jsonschema::validator_for(&schema)
            .map_err(|e| CoreError::InvalidArgs(format!("invalid output schema: {e}")))?;
        Ok(Self { schema, validator })
    }

    /// Validate raw tool input, returning the parsed value or every violation.
    pub fn validate(&self, input: &str) -> std::result::Result<Value, String> {
        let value: Value = serde_json::from_str(input).map_err(|e| format!("output is not valid JSON: {e}"))?;
        if self.validator.is_valid(&value) {
            return Ok(value);
        }
        let errors: Vec<String> = self
            .validator
            .iter_errors(&value)
            .map(|e| e.to_string())
            .collect();
        Err(format!("output does not match the schema: {}", errors.join("; ")))
    }
}

#[async_trait]
impl Tool for StructOutputTool {
    fn info(&self) -> ToolInfo {
        let properties = self
            .schema
            .get("properties")
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()));
        let required = self
            .schema
            .get("required")
            .and_then(Value::as_array)
            .map(|r| r.iter().filter_map(Value::as_str).map(String::from).collect())
            .unwrap_or_default();
        ToolInfo {
            name: STRUCT_OUTPUT_TOOL.into(),
            description: "Return the final answer as structured output. Call this exactly once, when the task is complete, with arguments matching the schema.".into(),
            parameters: properties,
            required,
        }
    }

    async fn run(&self, _ctx: &ToolContext, call: &ToolInvocation) -> Result<ToolResponse> {
        match self.validate(&call.input) {
            Ok(value) => Ok(ToolResponse::text("Structured output recorded").with_metadata(value)),
            Err(e) => Ok(ToolResponse::error(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {"name": {"type": "string"}, "age": {"type": "integer"}},
            "required": ["name", "age"]
        })
    }

    #[test]
    fn test_info_mirrors_schema() {
        let tool = StructOutputTool::new(schema()).unwrap();
        let info = tool.info();
        assert_eq!(info.name, STRUCT_OUTPUT_TOOL);
        assert_eq!(info.required, vec!["name", "age"]);
        assert!(info.parameters.get("age").is_some());
    }

    #[test]
    fn test_validation() {
        let tool = StructOutputTool::new(schema()).unwrap();
        assert!(tool.validate(r#"{"name":"Ada","age":36}"#).is_ok());
        let err = tool.validate(r#"{"name":"Ada"}"#).unwrap_err();
        assert!(err.contains("age"));
        assert!(tool.validate("not json").is_err());
    }

    #[test]
    fn test_invalid_schema_rejected() {
        assert!(StructOutputTool::new(json!({"type": 12})).is_err());
    }
}
