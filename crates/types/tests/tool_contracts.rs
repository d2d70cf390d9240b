use serde_json::json;
use types::{ToolDefinition, find_tool};

#[test]
fn tool_definition_serializes_to_expected_json_shape() {
    let tool = ToolDefinition::new(
        "weather__get_weather",
        Some("Look up current weather".to_owned()),
        json!({
            "type": "object",
            "properties": {
                "location": { "type": "string" }
            },
            "required": ["location"]
        }),
    );

    let encoded = serde_json::to_value(tool).expect("tool definition should serialize");
    assert_eq!(
        encoded,
        json!({
            "name": "weather__get_weather",
            "description": "Look up current weather",
            "input_schema": {
                "type": "object",
                "properties": {
                    "location": { "type": "string" }
                },
                "required": ["location"]
            }
        })
    );
}

#[test]
fn metadata_copies_description_and_schema() {
    let tool = ToolDefinition::new("fs__read", None, json!({"type": "object"}));
    let metadata = tool.metadata();
    assert_eq!(metadata.description, None);
    assert_eq!(metadata.input_schema, json!({"type": "object"}));
}

#[test]
fn find_tool_matches_on_full_namespaced_name() {
    let tools = vec![
        ToolDefinition::new("a__search", None, json!({})),
        ToolDefinition::new("b__search", None, json!({})),
    ];
    assert_eq!(
        find_tool(&tools, "b__search").map(|tool| tool.name.as_str()),
        Some("b__search")
    );
    assert!(find_tool(&tools, "search").is_none());
}
