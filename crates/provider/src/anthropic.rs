use std::collections::{BTreeMap, VecDeque};

use reqwest::{
    Client,
    header::{HeaderMap, HeaderName, HeaderValue},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use types::{
    AdapterConfig, AttachmentResolver, Completion, ModelId, ProviderError, ProviderId,
    StreamRequest, StreamSink, ToolDefinition,
};

use crate::{
    ANTHROPIC_DEFAULT_BASE_URL, ANTHROPIC_MESSAGES_PATH, TextEmitter,
    accumulator::tool_call_from_value,
    dispatch::ProviderConnection,
    encode::{EncodedAttachment, PDF_MEDIA_TYPE, ResolvedMessage, resolve_conversation},
    next_chunk, normalize_base_url_or_default, open_stream, response_parse_error,
    sse::{SseEvent, SseEventParser},
    until_cancelled,
};

const API_KEY_HEADER: &str = "x-api-key";
const VERSION_HEADER: &str = "anthropic-version";

/// Messages API client. The credential, API version and endpoint are fixed
/// when the client is built.
#[derive(Debug, Clone)]
pub struct AnthropicClient {
    client: Client,
    messages_url: String,
    headers: HeaderMap,
}

impl AnthropicClient {
    pub fn new(
        client: Client,
        provider: &ProviderId,
        api_key: &str,
        base_url: Option<&str>,
        version: &str,
    ) -> Result<Self, ProviderError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static(API_KEY_HEADER),
            header_value(provider, API_KEY_HEADER, api_key)?,
        );
        headers.insert(
            HeaderName::from_static(VERSION_HEADER),
            header_value(provider, VERSION_HEADER, version)?,
        );
        Ok(Self {
            client,
            messages_url: format!(
                "{}{}",
                normalize_base_url_or_default(base_url, ANTHROPIC_DEFAULT_BASE_URL),
                ANTHROPIC_MESSAGES_PATH
            ),
            headers,
        })
    }

    /// Starts a streaming Messages request.
    pub async fn messages_stream(
        &self,
        body: &AnthropicMessagesRequest,
        provider: &ProviderId,
        cancellation: &CancellationToken,
    ) -> Result<AnthropicMessageStream, ProviderError> {
        let builder = self
            .client
            .post(&self.messages_url)
            .headers(self.headers.clone())
            .json(body);
        let response = open_stream(builder, provider, cancellation).await?;
        Ok(AnthropicMessageStream::new(
            response,
            provider.clone(),
            cancellation.clone(),
        ))
    }
}

fn header_value(
    provider: &ProviderId,
    name: &str,
    value: &str,
) -> Result<HeaderValue, ProviderError> {
    let mut value = HeaderValue::from_str(value.trim()).map_err(|error| ProviderError::Transport {
        provider: provider.clone(),
        message: format!("invalid `{name}` header value: {error}"),
    })?;
    value.set_sensitive(name == API_KEY_HEADER);
    Ok(value)
}

/// Incremental event surfaced while a message streams.
#[derive(Debug, Clone, PartialEq)]
pub enum AnthropicStreamEvent {
    Text(String),
    ToolUseStart { id: String, name: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnthropicContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
}

/// The message aggregated from a complete stream.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AnthropicFinalMessage {
    pub content: Vec<AnthropicContentBlock>,
    pub stop_reason: Option<String>,
}

#[derive(Debug)]
enum BlockState {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        input: Value,
        partial_json: String,
    },
    Other,
}

/// Handle over a streaming Messages response.
///
/// [`next_event`](Self::next_event) yields text as it arrives;
/// [`final_message_with`](Self::final_message_with) drains the stream and
/// returns the aggregated message.
#[derive(Debug)]
pub struct AnthropicMessageStream {
    response: reqwest::Response,
    parser: SseEventParser,
    provider: ProviderId,
    cancellation: CancellationToken,
    pending: VecDeque<AnthropicStreamEvent>,
    blocks: BTreeMap<usize, BlockState>,
    stop_reason: Option<String>,
    stopped: bool,
    exhausted: bool,
}

impl AnthropicMessageStream {
    fn new(
        response: reqwest::Response,
        provider: ProviderId,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            response,
            parser: SseEventParser::default(),
            provider,
            cancellation,
            pending: VecDeque::new(),
            blocks: BTreeMap::new(),
            stop_reason: None,
            stopped: false,
            exhausted: false,
        }
    }

    /// Returns the next incremental event, or `None` after `message_stop`.
    /// A body that ends before `message_stop` is a transport error.
    pub async fn next_event(&mut self) -> Result<Option<AnthropicStreamEvent>, ProviderError> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }
            if self.stopped {
                return Ok(None);
            }
            if self.exhausted {
                return Err(ProviderError::Transport {
                    provider: self.provider.clone(),
                    message: "Anthropic stream ended before message_stop".to_owned(),
                });
            }

            match next_chunk(&mut self.response, &self.provider, &self.cancellation).await? {
                Some(chunk) => {
                    let events = self
                        .parser
                        .push_chunk(&chunk)
                        .map_err(|message| response_parse_error(&self.provider, message))?;
                    self.apply_all(&events)?;
                }
                None => {
                    self.exhausted = true;
                    let events = self
                        .parser
                        .finish()
                        .map_err(|message| response_parse_error(&self.provider, message))?;
                    self.apply_all(&events)?;
                }
            }
        }
    }

    /// Drains the stream, passing each text delta to `on_text`.
    pub async fn final_message_with<F>(
        mut self,
        mut on_text: F,
    ) -> Result<AnthropicFinalMessage, ProviderError>
    where
        F: FnMut(&str),
    {
        while let Some(event) = self.next_event().await? {
            match event {
                AnthropicStreamEvent::Text(text) => on_text(&text),
                AnthropicStreamEvent::ToolUseStart { id, name } => {
                    tracing::trace!(
                        provider = %self.provider,
                        %id,
                        %name,
                        "tool_use block started"
                    );
                }
            }
        }
        self.into_final_message()
    }

    fn apply_all(&mut self, events: &[SseEvent]) -> Result<(), ProviderError> {
        for event in events {
            let data = event.data.trim();
            if data.is_empty() {
                continue;
            }
            let wire: AnthropicWireEvent = serde_json::from_str(data).map_err(|error| {
                response_parse_error(
                    &self.provider,
                    format!("failed to parse Anthropic stream event: {error}"),
                )
            })?;
            self.apply(wire)?;
        }
        Ok(())
    }

    fn apply(&mut self, event: AnthropicWireEvent) -> Result<(), ProviderError> {
        match event {
            AnthropicWireEvent::MessageStart { message } => {
                log_usage(&self.provider, message.usage.as_ref());
            }
            AnthropicWireEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                let state = match content_block {
                    AnthropicWireBlock::Text { text } => {
                        if !text.is_empty() {
                            self.pending
                                .push_back(AnthropicStreamEvent::Text(text.clone()));
                        }
                        BlockState::Text(text)
                    }
                    AnthropicWireBlock::ToolUse { id, name, input } => {
                        self.pending.push_back(AnthropicStreamEvent::ToolUseStart {
                            id: id.clone(),
                            name: name.clone(),
                        });
                        BlockState::ToolUse {
                            id,
                            name,
                            input,
                            partial_json: String::new(),
                        }
                    }
                    AnthropicWireBlock::Other => BlockState::Other,
                };
                self.blocks.insert(index, state);
            }
            AnthropicWireEvent::ContentBlockDelta { index, delta } => match delta {
                AnthropicWireDelta::TextDelta { text } => {
                    if let Some(BlockState::Text(buffer)) = self.blocks.get_mut(&index) {
                        buffer.push_str(&text);
                    }
                    if !text.is_empty() {
                        self.pending.push_back(AnthropicStreamEvent::Text(text));
                    }
                }
                AnthropicWireDelta::InputJsonDelta { partial_json } => {
                    match self.blocks.get_mut(&index) {
                        Some(BlockState::ToolUse {
                            partial_json: buffer,
                            ..
                        }) => buffer.push_str(&partial_json),
                        _ => tracing::warn!(
                            provider = %self.provider,
                            index,
                            "dropping input_json_delta for unknown content block"
                        ),
                    }
                }
                AnthropicWireDelta::Other => {}
            },
            AnthropicWireEvent::ContentBlockStop { index } => {
                if let Some(block) = self.blocks.get_mut(&index) {
                    settle_tool_input(block, &self.provider)?;
                }
            }
            AnthropicWireEvent::MessageDelta { delta, usage } => {
                if let Some(stop_reason) = delta.stop_reason {
                    self.stop_reason = Some(stop_reason);
                }
                log_usage(&self.provider, usage.as_ref());
            }
            AnthropicWireEvent::MessageStop => self.stopped = true,
            AnthropicWireEvent::Ping => {}
            AnthropicWireEvent::Error { error } => {
                return Err(ProviderError::StreamFailed {
                    provider: self.provider.clone(),
                    message: error
                        .message
                        .unwrap_or_else(|| "Anthropic stream reported an error".to_owned()),
                });
            }
            AnthropicWireEvent::Unknown => {
                tracing::trace!(provider = %self.provider, "ignoring unknown Anthropic event");
            }
        }
        Ok(())
    }

    fn into_final_message(mut self) -> Result<AnthropicFinalMessage, ProviderError> {
        let mut content = Vec::with_capacity(self.blocks.len());
        for block in self.blocks.values_mut() {
            settle_tool_input(block, &self.provider)?;
        }
        for block in std::mem::take(&mut self.blocks).into_values() {
            match block {
                BlockState::Text(text) => content.push(AnthropicContentBlock::Text { text }),
                BlockState::ToolUse { id, name, input, .. } => {
                    content.push(AnthropicContentBlock::ToolUse { id, name, input })
                }
                BlockState::Other => {}
            }
        }
        Ok(AnthropicFinalMessage {
            content,
            stop_reason: self.stop_reason.take(),
        })
    }
}

/// Replaces a tool_use block's initial input with its streamed JSON, if any
/// was received.
fn settle_tool_input(block: &mut BlockState, provider: &ProviderId) -> Result<(), ProviderError> {
    let BlockState::ToolUse {
        id,
        name,
        input,
        partial_json,
    } = block
    else {
        return Ok(());
    };
    if partial_json.trim().is_empty() {
        return Ok(());
    }
    *input = serde_json::from_str(partial_json).map_err(|error| ProviderError::ToolArguments {
        provider: provider.clone(),
        call_id: id.clone(),
        tool: name.clone(),
        message: error.to_string(),
    })?;
    partial_json.clear();
    Ok(())
}

fn log_usage(provider: &ProviderId, usage: Option<&AnthropicUsage>) {
    if let Some(usage) = usage {
        tracing::debug!(
            provider = %provider,
            input_tokens = ?usage.input_tokens,
            output_tokens = ?usage.output_tokens,
            "Anthropic usage"
        );
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicWireEvent {
    MessageStart {
        message: AnthropicWireMessage,
    },
    ContentBlockStart {
        index: usize,
        content_block: AnthropicWireBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: AnthropicWireDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        delta: AnthropicWireMessageDelta,
        #[serde(default)]
        usage: Option<AnthropicUsage>,
    },
    MessageStop,
    Ping,
    Error {
        error: AnthropicWireError,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct AnthropicWireMessage {
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicWireBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default = "empty_object")]
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicWireDelta {
    TextDelta {
        text: String,
    },
    InputJsonDelta {
        partial_json: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicWireMessageDelta {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct AnthropicWireError {
    #[serde(default)]
    message: Option<String>,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

/// Adapter for the Anthropic Messages protocol, driven through
/// [`AnthropicClient`] and its [`AnthropicMessageStream`] handle.
#[derive(Debug, Clone)]
pub struct AnthropicMessagesAdapter {
    client: AnthropicClient,
    provider_id: ProviderId,
    max_tokens: u32,
}

impl AnthropicMessagesAdapter {
    pub fn new(
        connection: ProviderConnection,
        config: &AdapterConfig,
    ) -> Result<Self, ProviderError> {
        let client = AnthropicClient::new(
            connection.client,
            &connection.provider_id,
            &connection.api_key,
            connection.base_url.as_deref(),
            &config.anthropic_version,
        )?;
        Ok(Self {
            client,
            provider_id: connection.provider_id,
            max_tokens: config.anthropic_max_tokens.max(1),
        })
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
        let body = AnthropicMessagesRequest::build(
            &request.model,
            self.max_tokens,
            request.system_prompt.as_deref(),
            &messages,
            request.tools,
        );
        tracing::debug!(
            provider = %self.provider_id,
            model = %request.model,
            messages = body.messages.len(),
            tools = body.tools.len(),
            "sending Anthropic messages streaming request"
        );

        let stream = self
            .client
            .messages_stream(&body, &self.provider_id, &request.cancellation)
            .await?;
        let mut emitter = TextEmitter::new(sink);
        let message = stream.final_message_with(|text| emitter.emit(text)).await?;

        let tool_calls = message
            .content
            .into_iter()
            .filter_map(|block| match block {
                AnthropicContentBlock::ToolUse { id, name, input } => {
                    Some(tool_call_from_value(id, name, input, request.tools))
                }
                AnthropicContentBlock::Text { .. } => None,
            })
            .collect::<Vec<_>>();
        Ok(Completion::new(message.stop_reason, tool_calls))
    }
}

#[derive(Debug, Serialize)]
pub struct AnthropicMessagesRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessageRequest>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<AnthropicRequestToolDefinition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<AnthropicToolChoice>,
    stream: bool,
}

impl AnthropicMessagesRequest {
    pub(crate) fn build(
        model: &ModelId,
        max_tokens: u32,
        system_prompt: Option<&str>,
        messages: &[ResolvedMessage<'_>],
        tools: &[ToolDefinition],
    ) -> Self {
        let mut encoded: Vec<AnthropicMessageRequest> = Vec::with_capacity(messages.len());
        for message in messages {
            match message {
                ResolvedMessage::User { text, attachments } => {
                    let mut content = Vec::with_capacity(attachments.len() + 1);
                    if let Some(text) = text {
                        content.push(AnthropicRequestContentBlock::Text {
                            text: (*text).to_owned(),
                        });
                    }
                    content.extend(attachments.iter().map(AnthropicRequestContentBlock::from));
                    encoded.push(AnthropicMessageRequest {
                        role: "user",
                        content,
                    });
                }
                ResolvedMessage::Assistant { text, tool_calls } => {
                    let mut content = Vec::with_capacity(tool_calls.len() + 1);
                    if let Some(text) = text {
                        content.push(AnthropicRequestContentBlock::Text {
                            text: (*text).to_owned(),
                        });
                    }
                    content.extend(tool_calls.iter().map(|call| {
                        AnthropicRequestContentBlock::ToolUse {
                            id: call.id.clone(),
                            name: call.namespaced_tool_name.clone(),
                            input: call.args.clone(),
                        }
                    }));
                    encoded.push(AnthropicMessageRequest {
                        role: "assistant",
                        content,
                    });
                }
                ResolvedMessage::ToolResults(results) => {
                    let blocks = results.iter().map(|result| {
                        AnthropicRequestContentBlock::ToolResult {
                            tool_use_id: result.id.clone(),
                            content: result.content.clone(),
                        }
                    });
                    // Consecutive result batches share one user turn.
                    let merge = encoded
                        .last()
                        .is_some_and(AnthropicMessageRequest::is_tool_results);
                    if let Some(previous) = encoded.last_mut().filter(|_| merge) {
                        previous.content.extend(blocks);
                    } else {
                        encoded.push(AnthropicMessageRequest {
                            role: "user",
                            content: blocks.collect(),
                        });
                    }
                }
            }
        }

        let tools = tools
            .iter()
            .map(AnthropicRequestToolDefinition::from)
            .collect::<Vec<_>>();
        let tool_choice = (!tools.is_empty()).then_some(AnthropicToolChoice { kind: "auto" });
        Self {
            model: model.0.clone(),
            max_tokens,
            system: system_prompt
                .filter(|prompt| !prompt.trim().is_empty())
                .map(str::to_owned),
            messages: encoded,
            tools,
            tool_choice,
            stream: true,
        }
    }
}

#[derive(Debug, Serialize)]
struct AnthropicMessageRequest {
    role: &'static str,
    content: Vec<AnthropicRequestContentBlock>,
}

impl AnthropicMessageRequest {
    fn is_tool_results(&self) -> bool {
        self.role == "user"
            && !self.content.is_empty()
            && self
                .content
                .iter()
                .all(|block| matches!(block, AnthropicRequestContentBlock::ToolResult { .. }))
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicRequestContentBlock {
    Text {
        text: String,
    },
    Image {
        source: AnthropicBase64Source,
    },
    Document {
        source: AnthropicBase64Source,
        title: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

impl From<&EncodedAttachment> for AnthropicRequestContentBlock {
    fn from(value: &EncodedAttachment) -> Self {
        match value {
            EncodedAttachment::Image { media_type, base64 } => Self::Image {
                source: AnthropicBase64Source::new(media_type, base64),
            },
            EncodedAttachment::Pdf { name, base64 } => Self::Document {
                source: AnthropicBase64Source::new(PDF_MEDIA_TYPE, base64),
                title: name.clone(),
            },
            EncodedAttachment::Text { text } => Self::Text { text: text.clone() },
        }
    }
}

#[derive(Debug, Serialize)]
struct AnthropicBase64Source {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: String,
    data: String,
}

impl AnthropicBase64Source {
    fn new(media_type: &str, data: &str) -> Self {
        Self {
            kind: "base64",
            media_type: media_type.to_owned(),
            data: data.to_owned(),
        }
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequestToolDefinition {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    input_schema: Value,
}

impl From<&ToolDefinition> for AnthropicRequestToolDefinition {
    fn from(value: &ToolDefinition) -> Self {
        Self {
            name: value.name.clone(),
            description: value.description.clone(),
            input_schema: value.input_schema.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct AnthropicToolChoice {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use types::{ToolCall, ToolResult};

    use super::*;

    #[test]
    fn consecutive_tool_results_share_one_user_turn() {
        let calls = vec![ToolCall {
            id: "toolu_1".to_owned(),
            namespaced_tool_name: "lookup".to_owned(),
            args: json!({"q": "a"}),
            tool_metadata: None,
        }];
        let first = vec![ToolResult {
            id: "toolu_1".to_owned(),
            namespaced_tool_name: "lookup".to_owned(),
            content: "one".to_owned(),
        }];
        let second = vec![ToolResult {
            id: "toolu_2".to_owned(),
            namespaced_tool_name: "lookup".to_owned(),
            content: "two".to_owned(),
        }];
        let messages = vec![
            ResolvedMessage::Assistant {
                text: None,
                tool_calls: &calls,
            },
            ResolvedMessage::ToolResults(&first),
            ResolvedMessage::ToolResults(&second),
        ];
        let request = AnthropicMessagesRequest::build(
            &ModelId::from("claude-sonnet-4-5"),
            1024,
            None,
            &messages,
            &[],
        );
        let value = serde_json::to_value(&request).expect("request should serialize");
        assert_eq!(value["messages"].as_array().map(Vec::len), Some(2));
        assert_eq!(
            value["messages"][1]["content"],
            json!([
                {"type": "tool_result", "tool_use_id": "toolu_1", "content": "one"},
                {"type": "tool_result", "tool_use_id": "toolu_2", "content": "two"}
            ])
        );
        assert!(value.get("tool_choice").is_none());
    }

    #[test]
    fn streamed_tool_input_replaces_initial_input() {
        let mut block = BlockState::ToolUse {
            id: "toolu_1".to_owned(),
            name: "get_weather".to_owned(),
            input: json!({}),
            partial_json: "{\"location\":\"Paris\"}".to_owned(),
        };
        settle_tool_input(&mut block, &ProviderId::from("anthropic"))
            .expect("streamed JSON should parse");
        assert!(matches!(
            block,
            BlockState::ToolUse { input, partial_json, .. }
                if input == json!({"location": "Paris"}) && partial_json.is_empty()
        ));
    }

    #[test]
    fn truncated_tool_input_is_a_tool_argument_error() {
        let mut block = BlockState::ToolUse {
            id: "toolu_1".to_owned(),
            name: "get_weather".to_owned(),
            input: json!({}),
            partial_json: "{\"location\":".to_owned(),
        };
        assert!(matches!(
            settle_tool_input(&mut block, &ProviderId::from("anthropic")),
            Err(ProviderError::ToolArguments { tool, .. }) if tool == "get_weather"
        ));
    }

    #[test]
    fn unknown_wire_events_and_blocks_are_tolerated() {
        let event: AnthropicWireEvent =
            serde_json::from_value(json!({"type": "brand_new_event", "payload": 1}))
                .expect("unknown events should deserialize");
        assert!(matches!(event, AnthropicWireEvent::Unknown));

        let event: AnthropicWireEvent = serde_json::from_value(json!({
            "type": "content_block_start",
            "index": 0,
            "content_block": {"type": "thinking", "thinking": ""}
        }))
        .expect("unknown blocks should deserialize");
        assert!(matches!(
            event,
            AnthropicWireEvent::ContentBlockStart {
                content_block: AnthropicWireBlock::Other,
                ..
            }
        ));
    }
}
