use std::collections::HashMap;

use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use types::{
    AdapterConfig, AttachmentResolver, Completion, ModelId, ProviderError, ProviderId,
    StreamRequest, StreamSink, ToolCall, ToolDefinition,
};

use crate::{
    OPENAI_CHAT_COMPLETIONS_PATH, OPENAI_DEFAULT_BASE_URL, TextEmitter,
    accumulator::tool_call_from_arguments,
    dispatch::ProviderConnection,
    encode::{EncodedAttachment, PDF_MEDIA_TYPE, ResolvedMessage, resolve_conversation},
    next_chunk, open_stream, response_parse_error, until_cancelled,
    sse::SseEventParser,
};

/// Adapter for the chunk-framed `/v1/chat/completions` streaming protocol.
///
/// Text deltas are forwarded as soon as a frame arrives. Tool-call fragments
/// are held until the `[DONE]` sentinel and folded into complete calls in a
/// single pass.
#[derive(Debug, Clone)]
pub struct ChatCompletionsAdapter {
    client: Client,
    provider_id: ProviderId,
    base_url: String,
    api_key: String,
    max_buffered_tool_frames: usize,
}

impl ChatCompletionsAdapter {
    pub fn new(connection: ProviderConnection, config: &AdapterConfig) -> Self {
        Self {
            base_url: connection.base_url_or(OPENAI_DEFAULT_BASE_URL),
            client: connection.client,
            provider_id: connection.provider_id,
            api_key: connection.api_key,
            max_buffered_tool_frames: config.max_buffered_tool_frames,
        }
    }

    fn chat_completions_url(&self) -> String {
        format!("{}{}", self.base_url, OPENAI_CHAT_COMPLETIONS_PATH)
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
        let body = ChatCompletionRequest::build(
            &request.model,
            request.system_prompt.as_deref(),
            &messages,
            request.tools,
        )?;
        tracing::debug!(
            provider = %self.provider_id,
            model = %request.model,
            messages = body.messages.len(),
            tools = body.tools.len(),
            "sending chat completions streaming request"
        );

        let builder = self
            .client
            .post(self.chat_completions_url())
            .bearer_auth(&self.api_key)
            .json(&body);
        let mut http_response =
            open_stream(builder, &self.provider_id, &request.cancellation).await?;

        let mut parser = SseEventParser::default();
        let mut state = ChatStreamState::new(self.max_buffered_tool_frames);
        let mut emitter = TextEmitter::new(sink);
        let mut done = false;
        while let Some(chunk) =
            next_chunk(&mut http_response, &self.provider_id, &request.cancellation).await?
        {
            let events = parser
                .push_chunk(&chunk)
                .map_err(|message| response_parse_error(&self.provider_id, message))?;
            if state.consume(
                events.iter().map(|event| event.data.as_str()),
                &mut emitter,
                &self.provider_id,
            )? {
                done = true;
                break;
            }
        }
        if !done {
            let events = parser
                .finish()
                .map_err(|message| response_parse_error(&self.provider_id, message))?;
            done = state.consume(
                events.iter().map(|event| event.data.as_str()),
                &mut emitter,
                &self.provider_id,
            )?;
        }

        state.finish(done, &self.provider_id, request.tools)
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ChatToolDefinition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
    stream: bool,
    stream_options: ChatStreamOptions,
}

impl ChatCompletionRequest {
    pub(crate) fn build(
        model: &ModelId,
        system_prompt: Option<&str>,
        messages: &[ResolvedMessage<'_>],
        tools: &[ToolDefinition],
    ) -> Result<Self, ProviderError> {
        let mut encoded = Vec::with_capacity(messages.len() + 1);
        if let Some(system_prompt) = system_prompt.filter(|prompt| !prompt.trim().is_empty()) {
            encoded.push(ChatMessage::System {
                content: system_prompt.to_owned(),
            });
        }
        for message in messages {
            encode_message(message, &mut encoded)?;
        }

        let tools = tools
            .iter()
            .map(ChatToolDefinition::from)
            .collect::<Vec<_>>();
        let tool_choice = (!tools.is_empty()).then_some("auto");
        Ok(Self {
            model: model.0.clone(),
            messages: encoded,
            tools,
            tool_choice,
            stream: true,
            stream_options: ChatStreamOptions {
                include_usage: true,
            },
        })
    }
}

fn encode_message(
    message: &ResolvedMessage<'_>,
    encoded: &mut Vec<ChatMessage>,
) -> Result<(), ProviderError> {
    match message {
        ResolvedMessage::User { text, attachments } => {
            let content = if attachments.is_empty() {
                ChatUserContent::Text(text.unwrap_or_default().to_owned())
            } else {
                let mut parts = Vec::with_capacity(attachments.len() + 1);
                if let Some(text) = text {
                    parts.push(ChatContentPart::Text {
                        text: (*text).to_owned(),
                    });
                }
                parts.extend(attachments.iter().map(ChatContentPart::from));
                ChatUserContent::Parts(parts)
            };
            encoded.push(ChatMessage::User { content });
        }
        ResolvedMessage::Assistant { text, tool_calls } => {
            let tool_calls = tool_calls
                .iter()
                .map(ChatRequestToolCall::try_from)
                .collect::<Result<Vec<_>, _>>()?;
            encoded.push(ChatMessage::Assistant {
                content: text.map(str::to_owned),
                tool_calls,
            });
        }
        ResolvedMessage::ToolResults(results) => {
            encoded.extend(results.iter().map(|result| ChatMessage::Tool {
                tool_call_id: result.id.clone(),
                content: result.content.clone(),
            }));
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct ChatStreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
#[serde(tag = "role", rename_all = "snake_case")]
enum ChatMessage {
    System {
        content: String,
    },
    User {
        content: ChatUserContent,
    },
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ChatRequestToolCall>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ChatUserContent {
    Text(String),
    Parts(Vec<ChatContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ChatContentPart {
    Text { text: String },
    ImageUrl { image_url: ChatImageUrl },
    File { file: ChatFile },
}

impl From<&EncodedAttachment> for ChatContentPart {
    fn from(value: &EncodedAttachment) -> Self {
        match value {
            EncodedAttachment::Image { media_type, base64 } => Self::ImageUrl {
                image_url: ChatImageUrl {
                    url: EncodedAttachment::data_url(media_type, base64),
                },
            },
            EncodedAttachment::Pdf { name, base64 } => Self::File {
                file: ChatFile {
                    filename: name.clone(),
                    file_data: EncodedAttachment::data_url(PDF_MEDIA_TYPE, base64),
                },
            },
            EncodedAttachment::Text { text } => Self::Text { text: text.clone() },
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatImageUrl {
    url: String,
}

#[derive(Debug, Serialize)]
struct ChatFile {
    filename: String,
    file_data: String,
}

#[derive(Debug, Serialize)]
struct ChatRequestToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: &'static str,
    function: ChatRequestFunction,
}

impl TryFrom<&ToolCall> for ChatRequestToolCall {
    type Error = ProviderError;

    fn try_from(value: &ToolCall) -> Result<Self, Self::Error> {
        Ok(Self {
            id: value.id.clone(),
            kind: "function",
            function: ChatRequestFunction {
                name: value.namespaced_tool_name.clone(),
                arguments: serde_json::to_string(&value.args)?,
            },
        })
    }
}

#[derive(Debug, Serialize)]
struct ChatRequestFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct ChatToolDefinition {
    #[serde(rename = "type")]
    kind: &'static str,
    function: ChatFunctionDecl,
}

impl From<&ToolDefinition> for ChatToolDefinition {
    fn from(value: &ToolDefinition) -> Self {
        Self {
            kind: "function",
            function: ChatFunctionDecl {
                name: value.name.clone(),
                description: value.description.clone(),
                parameters: value.input_schema.clone(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatFunctionDecl {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    parameters: Value,
}

#[derive(Debug, Deserialize)]
struct ChatStreamFrame {
    #[serde(default, deserialize_with = "null_as_default")]
    choices: Vec<ChatStreamChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
    #[serde(default)]
    error: Option<ChatStreamError>,
}

#[derive(Debug, Deserialize)]
struct ChatStreamChoice {
    #[serde(default, deserialize_with = "null_as_default")]
    delta: ChatStreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ChatStreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    tool_calls: Vec<ChatToolCallFrame>,
}

/// Compatible servers send explicit `null` for absent collections.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Deserialize)]
struct ChatToolCallFrame {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<ChatFunctionFrame>,
}

#[derive(Debug, Deserialize, Default)]
struct ChatFunctionFrame {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: Option<u64>,
    #[serde(default)]
    completion_tokens: Option<u64>,
    #[serde(default)]
    total_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ChatStreamError {
    #[serde(default)]
    message: Option<String>,
}

/// Per-call state of one chat completions stream.
#[derive(Debug)]
pub(crate) struct ChatStreamState {
    frames: Vec<ChatToolCallFrame>,
    max_frames: usize,
    finish_reason: Option<String>,
}

impl ChatStreamState {
    pub(crate) fn new(max_frames: usize) -> Self {
        Self {
            frames: Vec::new(),
            max_frames,
            finish_reason: None,
        }
    }

    /// Handles a batch of SSE payloads. Returns `true` once `[DONE]` is seen;
    /// payloads after the sentinel are ignored.
    pub(crate) fn consume<'p>(
        &mut self,
        payloads: impl IntoIterator<Item = &'p str>,
        emitter: &mut TextEmitter<'_>,
        provider: &ProviderId,
    ) -> Result<bool, ProviderError> {
        for payload in payloads {
            let trimmed = payload.trim();
            if trimmed.is_empty() {
                continue;
            }
            if trimmed == "[DONE]" {
                return Ok(true);
            }
            let frame: ChatStreamFrame = serde_json::from_str(trimmed).map_err(|error| {
                response_parse_error(
                    provider,
                    format!("failed to parse chat completions streaming payload: {error}"),
                )
            })?;
            self.apply(frame, emitter, provider)?;
        }
        Ok(false)
    }

    fn apply(
        &mut self,
        frame: ChatStreamFrame,
        emitter: &mut TextEmitter<'_>,
        provider: &ProviderId,
    ) -> Result<(), ProviderError> {
        if let Some(error) = frame.error {
            return Err(ProviderError::StreamFailed {
                provider: provider.clone(),
                message: error
                    .message
                    .unwrap_or_else(|| "provider reported a stream error".to_owned()),
            });
        }
        if let Some(usage) = frame.usage {
            tracing::debug!(
                provider = %provider,
                prompt_tokens = ?usage.prompt_tokens,
                completion_tokens = ?usage.completion_tokens,
                total_tokens = ?usage.total_tokens,
                "chat completions usage"
            );
        }

        for choice in frame.choices {
            if let Some(content) = choice.delta.content.as_deref() {
                emitter.emit(content);
            }
            for tool_frame in choice.delta.tool_calls {
                if self.frames.len() >= self.max_frames {
                    return Err(ProviderError::BufferLimitExceeded {
                        provider: provider.clone(),
                        limit: self.max_frames,
                    });
                }
                self.frames.push(tool_frame);
            }
            if let Some(finish_reason) = choice.finish_reason.filter(|reason| !reason.is_empty()) {
                self.finish_reason = Some(finish_reason);
            }
        }
        Ok(())
    }

    /// Folds buffered tool-call frames into complete calls. A stream that
    /// ended without `[DONE]` is accepted only if a finish reason arrived.
    pub(crate) fn finish(
        self,
        saw_done: bool,
        provider: &ProviderId,
        tools: &[ToolDefinition],
    ) -> Result<Completion, ProviderError> {
        if !saw_done && self.finish_reason.is_none() {
            return Err(ProviderError::Transport {
                provider: provider.clone(),
                message: "chat completions stream ended before [DONE] sentinel".to_owned(),
            });
        }

        let tool_calls = fold_tool_call_frames(self.frames, provider, tools)?;
        Ok(Completion::new(self.finish_reason, tool_calls))
    }
}

#[derive(Debug, Default)]
struct FoldedToolCall {
    index: usize,
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

fn fold_tool_call_frames(
    frames: Vec<ChatToolCallFrame>,
    provider: &ProviderId,
    tools: &[ToolDefinition],
) -> Result<Vec<ToolCall>, ProviderError> {
    let mut folded: Vec<FoldedToolCall> = Vec::new();
    let mut positions: HashMap<usize, usize> = HashMap::new();
    for frame in frames {
        let position = *positions.entry(frame.index).or_insert_with(|| {
            folded.push(FoldedToolCall {
                index: frame.index,
                ..FoldedToolCall::default()
            });
            folded.len() - 1
        });
        let entry = &mut folded[position];
        if let Some(id) = frame.id.filter(|id| !id.is_empty()) {
            entry.id = Some(id);
        }
        let function = frame.function.unwrap_or_default();
        if let Some(name) = function.name.filter(|name| !name.is_empty()) {
            entry.name = Some(name);
        }
        if let Some(arguments) = function.arguments {
            entry.arguments.push_str(&arguments);
        }
    }

    folded
        .into_iter()
        .map(|call| {
            let name = call.name.ok_or_else(|| {
                response_parse_error(
                    provider,
                    format!("tool call at index {} has no function name", call.index),
                )
            })?;
            let id = call.id.unwrap_or_else(|| format!("call_{}", call.index));
            tool_call_from_arguments(provider, id, name, &call.arguments, tools)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use types::{StreamEvent, ToolDefinition};

    use super::*;
    use crate::tests::RecordingSink;

    fn provider() -> ProviderId {
        ProviderId::from("openai")
    }

    fn run(
        payloads: &[&str],
        max_frames: usize,
    ) -> (Vec<StreamEvent>, Result<Completion, ProviderError>) {
        let mut sink = RecordingSink::default();
        let mut state = ChatStreamState::new(max_frames);
        let result = {
            let mut emitter = TextEmitter::new(&mut sink);
            state
                .consume(payloads.iter().copied(), &mut emitter, &provider())
                .and_then(|done| state.finish(done, &provider(), &[]))
        };
        (sink.events, result)
    }

    #[test]
    fn tool_call_frames_fold_by_first_seen_index() {
        let (events, result) = run(
            &[
                r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"id":"call_b","function":{"name":"second","arguments":""}}]}}]}"#,
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_a","function":{"name":"first","arguments":"{\"a\":"}}]}}]}"#,
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"1}"}}]}}]}"#,
                r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
                "[DONE]",
            ],
            16,
        );
        assert!(events.is_empty());
        let completion = result.expect("stream should complete");
        assert_eq!(completion.finish_reason.as_deref(), Some("tool_calls"));
        let calls = completion.tool_calls.expect("tool calls should be present");
        assert_eq!(calls[0].id, "call_b");
        assert_eq!(calls[0].args, json!({}));
        assert_eq!(calls[1].namespaced_tool_name, "first");
        assert_eq!(calls[1].args, json!({"a": 1}));
    }

    #[test]
    fn missing_tool_call_id_falls_back_to_index() {
        let (_, result) = run(
            &[
                r#"{"choices":[{"delta":{"tool_calls":[{"index":3,"function":{"name":"noop","arguments":"{}"}}]},"finish_reason":"tool_calls"}]}"#,
            ],
            16,
        );
        let calls = result
            .expect("finish reason without [DONE] is accepted")
            .tool_calls
            .expect("tool call should be present");
        assert_eq!(calls[0].id, "call_3");
    }

    #[test]
    fn buffered_frames_are_bounded() {
        let frame = r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"x"}}]}}]}"#;
        let (_, result) = run(&[frame, frame, frame], 2);
        assert!(matches!(
            result,
            Err(ProviderError::BufferLimitExceeded { limit: 2, .. })
        ));
    }

    #[test]
    fn stream_without_sentinel_or_finish_reason_is_transport_error() {
        let (events, result) = run(&[r#"{"choices":[{"delta":{"content":"partial"}}]}"#], 16);
        assert_eq!(events, vec![StreamEvent::Chunk("partial".to_owned())]);
        assert!(matches!(result, Err(ProviderError::Transport { .. })));
    }

    #[test]
    fn explicit_null_collections_are_treated_as_empty() {
        let (events, result) = run(
            &[
                r#"{"choices":[{"delta":{"content":"4","tool_calls":null}}]}"#,
                r#"{"choices":[{"delta":null,"finish_reason":"stop"}]}"#,
                r#"{"choices":null,"usage":{"total_tokens":10}}"#,
                "[DONE]",
            ],
            16,
        );
        assert_eq!(events, vec![StreamEvent::Chunk("4".to_owned())]);
        let completion = result.expect("null collections should not fail the stream");
        assert_eq!(completion.finish_reason.as_deref(), Some("stop"));
        assert_eq!(completion.tool_calls, None);
    }

    #[test]
    fn error_frame_fails_the_stream() {
        let (_, result) = run(&[r#"{"error":{"message":"overloaded"}}"#], 16);
        assert!(matches!(
            result,
            Err(ProviderError::StreamFailed { message, .. }) if message == "overloaded"
        ));
    }

    #[test]
    fn tool_definitions_request_auto_choice() {
        let tools = vec![ToolDefinition::new(
            "get_weather",
            None,
            json!({"type": "object"}),
        )];
        let request = ChatCompletionRequest::build(&ModelId::from("gpt-4o"), None, &[], &tools)
            .expect("request should build");
        let value = serde_json::to_value(&request).expect("request should serialize");
        assert_eq!(value["tool_choice"], json!("auto"));
        assert_eq!(value["tools"][0]["function"]["name"], json!("get_weather"));
        assert!(value["tools"][0]["function"].get("description").is_none());
    }
}
