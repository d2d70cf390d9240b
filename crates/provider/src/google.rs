use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use types::{
    AdapterConfig, AttachmentResolver, Completion, ModelId, ProviderError, ProviderId,
    StreamRequest, StreamSink, ToolCall, ToolDefinition,
};

use crate::{
    GOOGLE_DEFAULT_BASE_URL, TextEmitter,
    accumulator::{tool_call_from_arguments, tool_call_from_value},
    dispatch::ProviderConnection,
    encode::{EncodedAttachment, ResolvedMessage, pdf_placeholder_text, resolve_conversation},
    next_chunk, open_stream, until_cancelled,
    sse::{LineBuffer, field_value},
};

const GOOGLE_API_KEY_HEADER: &str = "x-goog-api-key";

/// Adapter for the Google Interactions streaming protocol.
///
/// The body is consumed as raw newline-delimited records rather than
/// through the SSE event parser: each line is parsed on its own and lines
/// that are not JSON are skipped. Tool calls come only from the terminal
/// `interaction.complete` record.
#[derive(Debug, Clone)]
pub struct GoogleInteractionsAdapter {
    client: Client,
    provider_id: ProviderId,
    base_url: String,
    api_key: String,
    api_version: String,
}

impl GoogleInteractionsAdapter {
    pub fn new(connection: ProviderConnection, config: &AdapterConfig) -> Self {
        Self {
            base_url: connection.base_url_or(GOOGLE_DEFAULT_BASE_URL),
            client: connection.client,
            provider_id: connection.provider_id,
            api_key: connection.api_key,
            api_version: config.google_api_version.trim().trim_matches('/').to_owned(),
        }
    }

    fn interactions_url(&self) -> String {
        format!("{}/{}/interactions?alt=sse", self.base_url, self.api_version)
    }

    pub async fn stream_response(
        &self,
        request: &StreamRequest<'_>,
        resolver: &dyn AttachmentResolver,
        sink: &mut dyn StreamSink,
    ) -> Result<Completion, ProviderError> {
        let messages = until_cancelled(
            resolve_conversation(request.conversation, resolver),
            &self.provider_id,
            &request.cancellation,
        )
        .await?;
        let body = InteractionRequest::build(
            &request.model,
            request.system_prompt.as_deref(),
            &messages,
            request.tools,
        )?;
        tracing::debug!(
            provider = %self.provider_id,
            model = %request.model,
            turns = body.input.len(),
            tools = body.tools.len(),
            "sending Google interactions streaming request"
        );

        let builder = self
            .client
            .post(self.interactions_url())
            .header(GOOGLE_API_KEY_HEADER, &self.api_key)
            .json(&body);
        let mut http_response =
            open_stream(builder, &self.provider_id, &request.cancellation).await?;

        let mut parser = RawEventParser::default();
        let mut emitter = TextEmitter::new(sink);
        let mut completed = None;
        while let Some(chunk) =
            next_chunk(&mut http_response, &self.provider_id, &request.cancellation).await?
        {
            completed = apply_records(parser.push(&chunk), &mut emitter, &self.provider_id)?;
            if completed.is_some() {
                break;
            }
        }
        if completed.is_none() {
            completed = apply_records(parser.finish(), &mut emitter, &self.provider_id)?;
        }

        let Some(interaction) = completed else {
            return Err(ProviderError::Transport {
                provider: self.provider_id.clone(),
                message: "interaction stream ended before interaction.complete".to_owned(),
            });
        };
        complete_interaction(interaction, &self.provider_id, request.tools)
    }
}

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub(crate) struct InteractionRequest {
    model: String,
    input: Vec<InteractionTurn>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<InteractionTool>,
    stream: bool,
}

impl InteractionRequest {
    pub(crate) fn build(
        model: &ModelId,
        system_prompt: Option<&str>,
        messages: &[ResolvedMessage<'_>],
        tools: &[ToolDefinition],
    ) -> Result<Self, ProviderError> {
        let input = messages
            .iter()
            .map(InteractionTurn::from)
            .collect::<Vec<_>>();
        Ok(Self {
            model: model.0.clone(),
            input,
            system_instruction: system_prompt
                .filter(|prompt| !prompt.trim().is_empty())
                .map(str::to_owned),
            tools: tools.iter().map(InteractionTool::from).collect(),
            stream: true,
        })
    }
}

#[derive(Debug, Serialize)]
struct InteractionTurn {
    role: &'static str,
    content: Vec<InteractionContent>,
}

impl From<&ResolvedMessage<'_>> for InteractionTurn {
    fn from(value: &ResolvedMessage<'_>) -> Self {
        match value {
            ResolvedMessage::User { text, attachments } => {
                let mut content = Vec::with_capacity(attachments.len() + 1);
                if let Some(text) = text {
                    content.push(InteractionContent::Text {
                        text: (*text).to_owned(),
                    });
                }
                content.extend(attachments.iter().map(InteractionContent::from));
                Self {
                    role: "user",
                    content,
                }
            }
            ResolvedMessage::Assistant { text, tool_calls } => {
                let mut content = Vec::with_capacity(tool_calls.len() + 1);
                if let Some(text) = text {
                    content.push(InteractionContent::Text {
                        text: (*text).to_owned(),
                    });
                }
                content.extend(tool_calls.iter().map(|call| InteractionContent::FunctionCall {
                    id: call.id.clone(),
                    name: call.namespaced_tool_name.clone(),
                    arguments: call.args.clone(),
                }));
                Self {
                    role: "model",
                    content,
                }
            }
            ResolvedMessage::ToolResults(results) => Self {
                role: "user",
                content: results
                    .iter()
                    .map(|result| InteractionContent::FunctionResult {
                        call_id: result.id.clone(),
                        name: result.namespaced_tool_name.clone(),
                        result: result.content.clone(),
                    })
                    .collect(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InteractionContent {
    Text {
        text: String,
    },
    Image {
        data: String,
        mime_type: &'static str,
    },
    FunctionCall {
        id: String,
        name: String,
        arguments: Value,
    },
    FunctionResult {
        call_id: String,
        name: String,
        result: String,
    },
}

impl From<&EncodedAttachment> for InteractionContent {
    fn from(value: &EncodedAttachment) -> Self {
        match value {
            EncodedAttachment::Image { media_type, base64 } => Self::Image {
                data: base64.clone(),
                mime_type: *media_type,
            },
            // No document block in this protocol.
            EncodedAttachment::Pdf { name, .. } => Self::Text {
                text: pdf_placeholder_text(name),
            },
            EncodedAttachment::Text { text } => Self::Text { text: text.clone() },
        }
    }
}

#[derive(Debug, Serialize)]
struct InteractionTool {
    #[serde(rename = "type")]
    kind: &'static str,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    parameters: Value,
}

impl From<&ToolDefinition> for InteractionTool {
    fn from(value: &ToolDefinition) -> Self {
        Self {
            kind: "function",
            name: value.name.clone(),
            description: value.description.clone(),
            parameters: value.input_schema.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Raw event stream
// ---------------------------------------------------------------------------

/// Line-oriented record parser. Partial trailing lines are retained across
/// reads, so any split of the body yields the same records.
#[derive(Debug, Default)]
pub(crate) struct RawEventParser {
    lines: LineBuffer,
}

impl RawEventParser {
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.lines
            .push(chunk)
            .iter()
            .filter_map(|line| parse_record(line))
            .collect()
    }

    pub(crate) fn finish(&mut self) -> Vec<Value> {
        self.lines
            .finish()
            .and_then(|line| parse_record(&line))
            .into_iter()
            .collect()
    }
}

fn parse_record(line: &[u8]) -> Option<Value> {
    let payload = field_value(line, b"data:").unwrap_or(line);
    let Ok(payload) = std::str::from_utf8(payload) else {
        tracing::trace!("skipping non UTF-8 interaction record");
        return None;
    };
    let payload = payload.trim();
    if payload.is_empty()
        || payload == "[DONE]"
        || payload.starts_with(':')
        || payload.starts_with("event:")
        || payload.starts_with("id:")
        || payload.starts_with("retry:")
    {
        return None;
    }
    match serde_json::from_str(payload) {
        Ok(value) => Some(value),
        Err(error) => {
            tracing::trace!(%error, "skipping unparsable interaction record");
            None
        }
    }
}

#[derive(Debug, Deserialize)]
struct InteractionEvent {
    #[serde(default, alias = "type")]
    event_type: Option<String>,
    #[serde(default)]
    delta: Option<InteractionDelta>,
    #[serde(default)]
    interaction: Option<Interaction>,
    #[serde(default)]
    error: Option<InteractionError>,
}

#[derive(Debug, Deserialize)]
struct InteractionDelta {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Interaction {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    outputs: Vec<InteractionOutput>,
    #[serde(default)]
    usage: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct InteractionOutput {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct InteractionError {
    #[serde(default)]
    message: Option<String>,
}

/// Applies parsed records. Returns the terminal interaction once
/// `interaction.complete` arrives; later records in the batch are ignored.
fn apply_records(
    records: Vec<Value>,
    emitter: &mut TextEmitter<'_>,
    provider: &ProviderId,
) -> Result<Option<Interaction>, ProviderError> {
    for record in records {
        let event = match serde_json::from_value::<InteractionEvent>(record) {
            Ok(event) => event,
            Err(error) => {
                tracing::trace!(
                    provider = %provider,
                    %error,
                    "skipping unrecognized interaction record"
                );
                continue;
            }
        };
        match event.event_type.as_deref() {
            Some("content.delta") => {
                if let Some(delta) = event.delta {
                    match delta.kind.as_deref() {
                        Some("text") | None => {
                            emitter.emit(delta.text.as_deref().unwrap_or_default())
                        }
                        Some(other) => {
                            tracing::trace!(
                                provider = %provider,
                                kind = other,
                                "ignoring non-text content delta"
                            );
                        }
                    }
                }
            }
            Some("interaction.complete") => {
                let Some(interaction) = event.interaction else {
                    return Err(ProviderError::ResponseParse {
                        provider: provider.clone(),
                        message: "interaction.complete record carried no interaction".to_owned(),
                    });
                };
                return Ok(Some(interaction));
            }
            Some("error") => {
                return Err(ProviderError::StreamFailed {
                    provider: provider.clone(),
                    message: event
                        .error
                        .and_then(|error| error.message)
                        .unwrap_or_else(|| "interaction stream reported an error".to_owned()),
                });
            }
            other => {
                tracing::trace!(
                    provider = %provider,
                    event = ?other,
                    "ignoring interaction record"
                );
            }
        }
    }
    Ok(None)
}

fn complete_interaction(
    interaction: Interaction,
    provider: &ProviderId,
    tools: &[ToolDefinition],
) -> Result<Completion, ProviderError> {
    if let Some(usage) = &interaction.usage {
        tracing::debug!(
            provider = %provider,
            interaction_id = ?interaction.id,
            usage = %usage,
            "interaction usage"
        );
    }
    if let Some(status @ ("failed" | "cancelled")) = interaction.status.as_deref() {
        return Err(ProviderError::StreamFailed {
            provider: provider.clone(),
            message: format!("interaction finished with status `{status}`"),
        });
    }

    let tool_calls = interaction
        .outputs
        .into_iter()
        .filter(|output| output.kind == "function_call")
        .enumerate()
        .map(|(position, output)| function_call_output(output, position, provider, tools))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Completion::new(interaction.status, tool_calls))
}

fn function_call_output(
    output: InteractionOutput,
    position: usize,
    provider: &ProviderId,
    tools: &[ToolDefinition],
) -> Result<ToolCall, ProviderError> {
    let id = output
        .id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| format!("call_{position}"));
    let name = output.name.unwrap_or_default();
    match output.arguments {
        Some(Value::String(arguments)) => {
            tool_call_from_arguments(provider, id, name, &arguments, tools)
        }
        Some(Value::Null) | None => Ok(tool_call_from_value(
            id,
            name,
            Value::Object(Default::default()),
            tools,
        )),
        Some(arguments) => Ok(tool_call_from_value(id, name, arguments, tools)),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use types::StreamEvent;

    use super::*;
    use crate::tests::RecordingSink;

    const BODY: &[u8] = b"event: content.delta\n\
data: {\"event_type\":\"content.delta\",\"delta\":{\"type\":\"text\",\"text\":\"Hel\"}}\n\
\n\
: keep-alive\n\
data: not json at all\n\
data: {\"event_type\":\"content.delta\",\"delta\":{\"type\":\"text\",\"text\":\"lo \\u00e9\"}}\r\n\
\n\
data: {\"event_type\":\"interaction.complete\",\"interaction\":{\"id\":\"int_1\",\"status\":\"completed\",\"outputs\":[]}}";

    fn parse_split(splits: &[usize]) -> Vec<Value> {
        let mut parser = RawEventParser::default();
        let mut records = Vec::new();
        let mut start = 0;
        for &end in splits {
            records.extend(parser.push(&BODY[start..end]));
            start = end;
        }
        records.extend(parser.push(&BODY[start..]));
        records.extend(parser.finish());
        records
    }

    #[test]
    fn arbitrary_read_boundaries_yield_identical_records() {
        let whole = parse_split(&[]);
        assert_eq!(whole.len(), 3);
        for split in 1..BODY.len() {
            assert_eq!(parse_split(&[split]), whole, "split at byte {split}");
        }
        let every_byte = (1..BODY.len()).collect::<Vec<_>>();
        assert_eq!(parse_split(&every_byte), whole);
    }

    #[test]
    fn records_emit_text_and_stop_at_completion() {
        let mut sink = RecordingSink::default();
        let interaction = {
            let mut emitter = TextEmitter::new(&mut sink);
            apply_records(parse_split(&[]), &mut emitter, &ProviderId::from("google"))
                .expect("records should apply")
        };
        assert_eq!(
            sink.events,
            vec![
                StreamEvent::Chunk("Hel".to_owned()),
                StreamEvent::Chunk("lo é".to_owned()),
            ]
        );
        assert_eq!(
            interaction.and_then(|interaction| interaction.status).as_deref(),
            Some("completed")
        );
    }

    #[test]
    fn function_call_outputs_become_tool_calls_in_order() {
        let interaction: Interaction = serde_json::from_value(json!({
            "status": "requires_action",
            "outputs": [
                {"type": "text", "text": "checking"},
                {"type": "function_call", "id": "fc_1", "name": "get_weather", "arguments": {"location": "Paris"}},
                {"type": "function_call", "name": "get_time", "arguments": "{\"tz\":"}
            ]
        }))
        .expect("interaction should deserialize");
        let error = complete_interaction(interaction, &ProviderId::from("google"), &[])
            .expect_err("truncated string arguments should fail");
        assert!(matches!(
            error,
            ProviderError::ToolArguments { call_id, .. } if call_id == "call_1"
        ));

        let interaction: Interaction = serde_json::from_value(json!({
            "status": "requires_action",
            "outputs": [
                {"type": "function_call", "id": "fc_1", "name": "get_weather", "arguments": {"location": "Paris"}},
                {"type": "function_call", "name": "get_time"}
            ]
        }))
        .expect("interaction should deserialize");
        let completion = complete_interaction(interaction, &ProviderId::from("google"), &[])
            .expect("interaction should complete");
        assert_eq!(completion.finish_reason.as_deref(), Some("requires_action"));
        let calls = completion.tool_calls.expect("tool calls should be present");
        assert_eq!(calls[0].args, json!({"location": "Paris"}));
        assert_eq!(calls[1].id, "call_1");
        assert_eq!(calls[1].args, json!({}));
    }

    #[test]
    fn failed_interaction_is_an_error() {
        let interaction: Interaction =
            serde_json::from_value(json!({"status": "failed", "outputs": []}))
                .expect("interaction should deserialize");
        assert!(matches!(
            complete_interaction(interaction, &ProviderId::from("google"), &[]),
            Err(ProviderError::StreamFailed { .. })
        ));
    }

    #[test]
    fn error_record_fails_the_stream() {
        let mut sink = RecordingSink::default();
        let mut emitter = TextEmitter::new(&mut sink);
        let result = apply_records(
            vec![json!({"event_type": "error", "error": {"code": 429, "message": "quota exhausted"}})],
            &mut emitter,
            &ProviderId::from("google"),
        );
        assert!(matches!(
            result,
            Err(ProviderError::StreamFailed { message, .. }) if message == "quota exhausted"
        ));
    }
}
