use std::collections::HashMap;

use serde_json::Value;
use types::{ProviderError, ProviderId, ToolCall, ToolDefinition, find_tool};

/// In-progress reconstruction of one tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PartialToolCall {
    /// Order in which the call was first observed.
    sequence: usize,
    id: String,
    call_id: String,
    name: String,
    arguments: String,
}

/// Rebuilds tool calls from protocols that report identity, argument
/// fragments and completion as separate events.
///
/// Finished calls are returned in first-observed order regardless of the
/// order in which their terminating events arrive.
#[derive(Debug, Default)]
pub(crate) struct ToolCallAccumulator {
    partials: HashMap<String, PartialToolCall>,
    finished: Vec<(usize, ToolCall)>,
    next_sequence: usize,
}

impl ToolCallAccumulator {
    /// Opens an entry for `item_id`. Re-opening an existing item keeps its
    /// original position and accumulated arguments.
    pub(crate) fn open(&mut self, item_id: &str, call_id: String, name: String) {
        if let Some(partial) = self.partials.get_mut(item_id) {
            partial.call_id = call_id;
            partial.name = name;
            return;
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.partials.insert(
            item_id.to_owned(),
            PartialToolCall {
                sequence,
                id: item_id.to_owned(),
                call_id,
                name,
                arguments: String::new(),
            },
        );
    }

    /// Appends an argument fragment. Returns `false` (and drops the fragment)
    /// when no entry is open for `item_id`.
    pub(crate) fn append(&mut self, item_id: &str, fragment: &str) -> bool {
        match self.partials.get_mut(item_id) {
            Some(partial) => {
                partial.arguments.push_str(fragment);
                true
            }
            None => false,
        }
    }

    /// Replaces the accumulated arguments with the authoritative final text.
    pub(crate) fn replace(&mut self, item_id: &str, arguments: String) -> bool {
        match self.partials.get_mut(item_id) {
            Some(partial) => {
                partial.arguments = arguments;
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_open(&self, item_id: &str) -> bool {
        self.partials.contains_key(item_id)
    }

    /// Finalizes the entry for `item_id`. Returns `Ok(false)` when nothing
    /// was open under that id.
    pub(crate) fn finish(
        &mut self,
        item_id: &str,
        provider: &ProviderId,
        tools: &[ToolDefinition],
    ) -> Result<bool, ProviderError> {
        let Some(partial) = self.partials.remove(item_id) else {
            return Ok(false);
        };
        self.push_finished(partial, provider, tools)?;
        Ok(true)
    }

    /// Finalizes every still-open entry, in first-observed order, and returns
    /// all finished calls.
    pub(crate) fn finish_all(
        mut self,
        provider: &ProviderId,
        tools: &[ToolDefinition],
    ) -> Result<Vec<ToolCall>, ProviderError> {
        let mut remaining = self.partials.drain().map(|(_, partial)| partial).collect::<Vec<_>>();
        remaining.sort_by_key(|partial| partial.sequence);
        for partial in remaining {
            tracing::debug!(
                provider = %provider,
                item_id = %partial.id,
                "finalizing tool call that never received its done event"
            );
            self.push_finished(partial, provider, tools)?;
        }
        self.finished.sort_by_key(|(sequence, _)| *sequence);
        Ok(self.finished.into_iter().map(|(_, call)| call).collect())
    }

    fn push_finished(
        &mut self,
        partial: PartialToolCall,
        provider: &ProviderId,
        tools: &[ToolDefinition],
    ) -> Result<(), ProviderError> {
        let call_id = if partial.call_id.is_empty() {
            partial.id
        } else {
            partial.call_id
        };
        let call = tool_call_from_arguments(
            provider,
            call_id,
            partial.name,
            &partial.arguments,
            tools,
        )?;
        self.finished.push((partial.sequence, call));
        Ok(())
    }
}

/// Parses an argument string into a [`ToolCall`]. Blank arguments decode to
/// an empty object.
pub(crate) fn tool_call_from_arguments(
    provider: &ProviderId,
    call_id: String,
    name: String,
    arguments: &str,
    tools: &[ToolDefinition],
) -> Result<ToolCall, ProviderError> {
    let args = if arguments.trim().is_empty() {
        Value::Object(Default::default())
    } else {
        serde_json::from_str::<Value>(arguments).map_err(|error| ProviderError::ToolArguments {
            provider: provider.clone(),
            call_id: call_id.clone(),
            tool: name.clone(),
            message: error.to_string(),
        })?
    };
    Ok(tool_call_from_value(call_id, name, args, tools))
}

/// Builds a [`ToolCall`], copying metadata from the matching definition when
/// one exists.
pub(crate) fn tool_call_from_value(
    call_id: String,
    name: String,
    args: Value,
    tools: &[ToolDefinition],
) -> ToolCall {
    let tool_metadata = find_tool(tools, &name).map(ToolDefinition::metadata);
    ToolCall {
        id: call_id,
        namespaced_tool_name: name,
        args,
        tool_metadata,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn provider() -> ProviderId {
        ProviderId::from("test")
    }

    fn weather_tool() -> ToolDefinition {
        ToolDefinition::new(
            "get_weather",
            Some("Current weather".to_owned()),
            json!({"type": "object", "properties": {"location": {"type": "string"}}}),
        )
    }

    #[test]
    fn fragments_concatenate_into_parsed_arguments() {
        let mut accumulator = ToolCallAccumulator::default();
        accumulator.open("fc_1", "call_1".to_owned(), "get_weather".to_owned());
        assert!(accumulator.append("fc_1", "{\"a\":"));
        assert!(accumulator.append("fc_1", "1}"));
        assert!(
            accumulator
                .finish("fc_1", &provider(), &[])
                .expect("arguments should parse")
        );

        let calls = accumulator
            .finish_all(&provider(), &[])
            .expect("nothing left to parse");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].args, json!({"a": 1}));
        assert_eq!(calls[0].tool_metadata, None);
    }

    #[test]
    fn unknown_item_deltas_are_dropped() {
        let mut accumulator = ToolCallAccumulator::default();
        assert!(!accumulator.append("missing", "{}"));
        assert!(!accumulator.replace("missing", "{}".to_owned()));
        assert!(
            !accumulator
                .finish("missing", &provider(), &[])
                .expect("finishing unknown items is not an error")
        );
        assert!(
            accumulator
                .finish_all(&provider(), &[])
                .expect("empty accumulator finishes")
                .is_empty()
        );
    }

    #[test]
    fn final_arguments_replace_accumulated_deltas() {
        let mut accumulator = ToolCallAccumulator::default();
        accumulator.open("fc_1", "call_1".to_owned(), "get_weather".to_owned());
        accumulator.append("fc_1", "{\"location\":\"Par");
        accumulator.replace("fc_1", "{\"location\":\"Paris\"}".to_owned());
        accumulator
            .finish("fc_1", &provider(), &[weather_tool()])
            .expect("arguments should parse");

        let calls = accumulator
            .finish_all(&provider(), &[weather_tool()])
            .expect("nothing left to parse");
        assert_eq!(calls[0].args, json!({"location": "Paris"}));
        assert_eq!(
            calls[0].tool_metadata.as_ref().and_then(|meta| meta.description.as_deref()),
            Some("Current weather")
        );
    }

    #[test]
    fn calls_keep_first_observed_order_when_finished_out_of_order() {
        let mut accumulator = ToolCallAccumulator::default();
        accumulator.open("fc_b", "call_b".to_owned(), "second".to_owned());
        accumulator.open("fc_a", "call_a".to_owned(), "first".to_owned());
        accumulator.append("fc_a", "{}");
        accumulator.append("fc_b", "{}");
        accumulator
            .finish("fc_a", &provider(), &[])
            .expect("arguments should parse");
        accumulator
            .finish("fc_b", &provider(), &[])
            .expect("arguments should parse");

        let names = accumulator
            .finish_all(&provider(), &[])
            .expect("nothing left to parse")
            .into_iter()
            .map(|call| call.namespaced_tool_name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["second", "first"]);
    }

    #[test]
    fn unparsable_arguments_fail_finalization() {
        let mut accumulator = ToolCallAccumulator::default();
        accumulator.open("fc_1", "call_1".to_owned(), "get_weather".to_owned());
        accumulator.append("fc_1", "{\"location\":");
        let error = accumulator
            .finish("fc_1", &provider(), &[])
            .expect_err("truncated JSON should fail");
        assert!(matches!(
            error,
            ProviderError::ToolArguments { call_id, tool, .. }
                if call_id == "call_1" && tool == "get_weather"
        ));
    }

    #[test]
    fn blank_arguments_decode_to_empty_object() {
        let call = tool_call_from_arguments(
            &provider(),
            "call_1".to_owned(),
            "list_files".to_owned(),
            "  ",
            &[],
        )
        .expect("blank arguments are valid");
        assert_eq!(call.args, json!({}));
    }
}
