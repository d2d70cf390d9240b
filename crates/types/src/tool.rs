use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool parameter schema expressed as a raw JSON Schema value.
///
/// Construct schemas with `serde_json::json!({...})`:
///
/// ```rust,ignore
/// use serde_json::json;
/// let schema = json!({
///     "type": "object",
///     "required": ["location"],
///     "properties": {
///         "location": { "type": "string", "minLength": 1 }
///     }
/// });
/// ```
pub type ToolParameterSchema = Value;

/// A tool advertised to the model for one streaming call. `name` is expected
/// to already carry its namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: ToolParameterSchema,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: Option<String>,
        input_schema: ToolParameterSchema,
    ) -> Self {
        Self {
            name: name.into(),
            description,
            input_schema,
        }
    }

    pub fn metadata(&self) -> ToolMetadata {
        ToolMetadata {
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
        }
    }
}

/// Definition details copied onto a finalized tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: ToolParameterSchema,
}

/// Finds the definition matching a namespaced tool name.
pub fn find_tool<'a>(tools: &'a [ToolDefinition], name: &str) -> Option<&'a ToolDefinition> {
    tools.iter().find(|tool| tool.name == name)
}
