//! `-f/--output-format` parsing and response rendering.

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, bail};
use serde_json::{Value, json};

#[derive(Debug, Clone, PartialEq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    /// Answer must be a JSON object matching the schema.
    JsonSchema(Value),
}

impl FromStr for OutputFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            other => match other.strip_prefix("json_schema=") {
                Some(spec) => Ok(OutputFormat::JsonSchema(load_schema(spec)?)),
                None => bail!("invalid output format '{other}': use text, json or json_schema=..."),
            },
        }
    }
}

/// Inline JSON, `{"$ref": path}`, or a bare path to a schema file.
fn load_schema(spec: &str) -> anyhow::Result<Value> {
    let spec = unquote(spec.trim());
    if spec.is_empty() {
        bail!("json_schema needs a schema");
    }
    let schema = if spec.starts_with('{') {
        let value: Value = serde_json::from_str(spec).context("invalid inline JSON schema")?;
        match value.get("$ref").and_then(Value::as_str) {
            Some(path) if value.as_object().is_some_and(|o| o.len() == 1) => read_schema(Path::new(path))?,
            _ => value,
        }
    } else {
        read_schema(Path::new(spec))?
    };
    if !schema.is_object() {
        bail!("JSON schema must be an object");
    }
    Ok(schema)
}

fn read_schema(path: &Path) -> anyhow::Result<Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read schema {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("invalid JSON schema in {}", path.display()))
}

fn unquote(s: &str) -> &str {
    for q in ['\'', '"'] {
        if let Some(inner) = s.strip_prefix(q).and_then(|r| r.strip_suffix(q)) {
            return inner;
        }
    }
    s
}

impl OutputFormat {
    pub fn schema(&self) -> Option<&Value> {
        match self {
            OutputFormat::JsonSchema(schema) => Some(schema),
            _ => None,
        }
    }

    /// Render the final answer for stdout.
    pub fn render(&self, content: &str, structured: Option<&Value>) -> anyhow::Result<String> {
        match self {
            OutputFormat::Text => Ok(content.to_string()),
            OutputFormat::Json => Ok(serde_json::to_string_pretty(&json!({ "response": content }))?),
            OutputFormat::JsonSchema(_) => match structured {
                Some(value) => Ok(serde_json::to_string_pretty(value)?),
                None => bail!("agent finished without structured output"),
            },
        }
    }
}
