use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use types::{
    AttachmentResolver, Completion, ModelId, ProviderError, ProviderId, StreamRequest, StreamSink,
    ToolDefinition,
};

use crate::{
    OPENAI_DEFAULT_BASE_URL, OPENAI_RESPONSES_PATH, TextEmitter,
    accumulator::ToolCallAccumulator,
    dispatch::ProviderConnection,
    encode::{EncodedAttachment, PDF_MEDIA_TYPE, ResolvedMessage, resolve_conversation},
    next_chunk, open_stream, response_parse_error, until_cancelled,
    sse::{SseEvent, SseEventParser},
};

/// Adapter for the item-event `/v1/responses` streaming protocol.
///
/// Function calls are rebuilt from `output_item.added`,
/// `function_call_arguments.*` and `output_item.done` events and only handed
/// out once the response reaches a terminal event.
#[derive(Debug, Clone)]
pub struct ResponsesAdapter {
    client: Client,
    provider_id: ProviderId,
    base_url: String,
    api_key: String,
}

impl ResponsesAdapter {
    pub fn new(connection: ProviderConnection) -> Self {
        Self {
            base_url: connection.base_url_or(OPENAI_DEFAULT_BASE_URL),
            client: connection.client,
            provider_id: connection.provider_id,
            api_key: connection.api_key,
        }
    }

    fn responses_url(&self) -> String {
        format!("{}{}", self.base_url, OPENAI_RESPONSES_PATH)
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
        let body = ResponsesApiRequest::build(
            &request.model,
            request.system_prompt.as_deref(),
            &messages,
            request.tools,
        )?;
        tracing::debug!(
            provider = %self.provider_id,
            model = %request.model,
            input_items = body.input.len(),
            tools = body.tools.len(),
            "sending Responses streaming request"
        );

        let builder = self
            .client
            .post(self.responses_url())
            .bearer_auth(&self.api_key)
            .json(&body);
        let mut http_response =
            open_stream(builder, &self.provider_id, &request.cancellation).await?;

        let mut parser = SseEventParser::default();
        let mut state = ResponsesStreamState::default();
        let mut emitter = TextEmitter::new(sink);
        let mut finish_reason = None;
        while let Some(chunk) =
            next_chunk(&mut http_response, &self.provider_id, &request.cancellation).await?
        {
            let events = parser
                .push_chunk(&chunk)
                .map_err(|message| response_parse_error(&self.provider_id, message))?;
            if let Some(reason) =
                state.consume(&events, &mut emitter, &self.provider_id, request.tools)?
            {
                finish_reason = Some(reason);
                break;
            }
        }
        if finish_reason.is_none() {
            let events = parser
                .finish()
                .map_err(|message| response_parse_error(&self.provider_id, message))?;
            finish_reason = state.consume(&events, &mut emitter, &self.provider_id, request.tools)?;
        }

        let Some(finish_reason) = finish_reason else {
            return Err(ProviderError::Transport {
                provider: self.provider_id.clone(),
                message: "Responses stream ended before a terminal response event".to_owned(),
            });
        };
        let tool_calls = state
            .accumulator
            .finish_all(&self.provider_id, request.tools)?;
        Ok(Completion::new(finish_reason, tool_calls))
    }
}

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub(crate) struct ResponsesApiRequest {
    model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<String>,
    input: Vec<ResponsesInputItem>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ResponsesToolDeclaration>,
    store: bool,
    stream: bool,
}

impl ResponsesApiRequest {
    pub(crate) fn build(
        model: &ModelId,
        system_prompt: Option<&str>,
        messages: &[ResolvedMessage<'_>],
        tools: &[ToolDefinition],
    ) -> Result<Self, ProviderError> {
        let mut input = Vec::with_capacity(messages.len());
        for message in messages {
            match message {
                ResolvedMessage::User { text, attachments } => {
                    let mut content = Vec::with_capacity(attachments.len() + 1);
                    if let Some(text) = text {
                        content.push(ResponsesContentPart::InputText {
                            text: (*text).to_owned(),
                        });
                    }
                    content.extend(attachments.iter().map(ResponsesContentPart::from));
                    input.push(ResponsesInputItem::Message {
                        role: "user",
                        content,
                    });
                }
                ResolvedMessage::Assistant { text, tool_calls } => {
                    if let Some(text) = text {
                        input.push(ResponsesInputItem::Message {
                            role: "assistant",
                            content: vec![ResponsesContentPart::OutputText {
                                text: (*text).to_owned(),
                            }],
                        });
                    }
                    for tool_call in tool_calls.iter() {
                        input.push(ResponsesInputItem::FunctionCall {
                            call_id: tool_call.id.clone(),
                            name: tool_call.namespaced_tool_name.clone(),
                            arguments: serde_json::to_string(&tool_call.args)?,
                        });
                    }
                }
                ResolvedMessage::ToolResults(results) => {
                    input.extend(results.iter().map(|result| {
                        ResponsesInputItem::FunctionCallOutput {
                            call_id: result.id.clone(),
                            output: result.content.clone(),
                        }
                    }));
                }
            }
        }

        Ok(Self {
            model: model.0.clone(),
            instructions: system_prompt
                .filter(|prompt| !prompt.trim().is_empty())
                .map(str::to_owned),
            input,
            tools: tools.iter().map(ResponsesToolDeclaration::from).collect(),
            store: false,
            stream: true,
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponsesInputItem {
    Message {
        role: &'static str,
        content: Vec<ResponsesContentPart>,
    },
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    FunctionCallOutput {
        call_id: String,
        output: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponsesContentPart {
    InputText { text: String },
    OutputText { text: String },
    InputImage { image_url: String },
    InputFile { filename: String, file_data: String },
}

impl From<&EncodedAttachment> for ResponsesContentPart {
    fn from(value: &EncodedAttachment) -> Self {
        match value {
            EncodedAttachment::Image { media_type, base64 } => Self::InputImage {
                image_url: EncodedAttachment::data_url(media_type, base64),
            },
            EncodedAttachment::Pdf { name, base64 } => Self::InputFile {
                filename: name.clone(),
                file_data: EncodedAttachment::data_url(PDF_MEDIA_TYPE, base64),
            },
            EncodedAttachment::Text { text } => Self::InputText { text: text.clone() },
        }
    }
}

#[derive(Debug, Serialize)]
struct ResponsesToolDeclaration {
    #[serde(rename = "type")]
    kind: &'static str,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    parameters: Value,
}

impl From<&ToolDefinition> for ResponsesToolDeclaration {
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
// Streaming events
// ---------------------------------------------------------------------------

/// Union of the fields used across the Responses event family. Unused
/// fields are absent on any given event.
#[derive(Debug, Deserialize)]
struct ResponsesStreamEvent {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    delta: Option<String>,
    #[serde(default)]
    item_id: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
    #[serde(default)]
    item: Option<ResponsesOutputItem>,
    #[serde(default)]
    response: Option<ResponsesEnvelope>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponsesOutputItem {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    call_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponsesEnvelope {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    incomplete_details: Option<ResponsesIncompleteDetails>,
    #[serde(default)]
    error: Option<ResponsesErrorBody>,
    #[serde(default)]
    usage: Option<ResponsesUsage>,
}

#[derive(Debug, Deserialize)]
struct ResponsesIncompleteDetails {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponsesErrorBody {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponsesUsage {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
    #[serde(default)]
    total_tokens: Option<u64>,
}

const FUNCTION_CALL_ITEM: &str = "function_call";

fn non_blank_arguments(arguments: Option<String>) -> Option<String> {
    arguments.filter(|arguments| !arguments.trim().is_empty())
}

/// Per-call state of one Responses stream.
#[derive(Debug, Default)]
pub(crate) struct ResponsesStreamState {
    accumulator: ToolCallAccumulator,
}

impl ResponsesStreamState {
    /// Applies a batch of SSE events. Returns `Some(finish_reason)` once a
    /// terminal event arrives; the inner `Option` is the reason itself.
    pub(crate) fn consume(
        &mut self,
        events: &[SseEvent],
        emitter: &mut TextEmitter<'_>,
        provider: &ProviderId,
        tools: &[ToolDefinition],
    ) -> Result<Option<Option<String>>, ProviderError> {
        for event in events {
            if let Some(finish_reason) = self.apply(event, emitter, provider, tools)? {
                return Ok(Some(finish_reason));
            }
        }
        Ok(None)
    }

    fn apply(
        &mut self,
        event: &SseEvent,
        emitter: &mut TextEmitter<'_>,
        provider: &ProviderId,
        tools: &[ToolDefinition],
    ) -> Result<Option<Option<String>>, ProviderError> {
        let data = event.data.trim();
        if data.is_empty() || data == "[DONE]" {
            return Ok(None);
        }
        let parsed: ResponsesStreamEvent = serde_json::from_str(data).map_err(|error| {
            response_parse_error(
                provider,
                format!("failed to parse Responses streaming event: {error}"),
            )
        })?;
        let Some(kind) = parsed.kind.clone().or_else(|| event.event_type.clone()) else {
            tracing::trace!(provider = %provider, "skipping untyped Responses event");
            return Ok(None);
        };

        match kind.as_str() {
            "response.output_text.delta" => {
                if let Some(delta) = parsed.delta.as_deref() {
                    emitter.emit(delta);
                }
            }
            "response.output_item.added" => {
                if let Some(item) = parsed.item.filter(|item| item.kind == FUNCTION_CALL_ITEM) {
                    let item_id = item_key(&item);
                    self.accumulator.open(
                        &item_id,
                        item.call_id.unwrap_or_default(),
                        item.name.unwrap_or_default(),
                    );
                    if let Some(arguments) = non_blank_arguments(item.arguments) {
                        self.accumulator.replace(&item_id, arguments);
                    }
                }
            }
            "response.function_call_arguments.delta" => {
                let (Some(item_id), Some(delta)) =
                    (parsed.item_id.as_deref(), parsed.delta.as_deref())
                else {
                    return Ok(None);
                };
                if !self.accumulator.append(item_id, delta) {
                    tracing::warn!(
                        provider = %provider,
                        item_id,
                        "dropping arguments delta for unknown Responses item"
                    );
                }
            }
            "response.function_call_arguments.done" => {
                if let (Some(item_id), Some(arguments)) =
                    (parsed.item_id.as_deref(), non_blank_arguments(parsed.arguments))
                {
                    self.accumulator.replace(item_id, arguments);
                }
            }
            "response.output_item.done" => {
                if let Some(item) = parsed.item.filter(|item| item.kind == FUNCTION_CALL_ITEM) {
                    let item_id = item_key(&item);
                    if !self.accumulator.is_open(&item_id) {
                        self.accumulator.open(
                            &item_id,
                            item.call_id.clone().unwrap_or_default(),
                            item.name.clone().unwrap_or_default(),
                        );
                    }
                    // A blank payload here must not wipe streamed deltas.
                    if let Some(arguments) = non_blank_arguments(item.arguments) {
                        self.accumulator.replace(&item_id, arguments);
                    }
                    self.accumulator.finish(&item_id, provider, tools)?;
                }
            }
            "response.completed" | "response.incomplete" => {
                let response = parsed.response;
                if let Some(usage) = response
                    .as_ref()
                    .and_then(|response| response.usage.as_ref())
                {
                    tracing::debug!(
                        provider = %provider,
                        input_tokens = ?usage.input_tokens,
                        output_tokens = ?usage.output_tokens,
                        total_tokens = ?usage.total_tokens,
                        "Responses usage"
                    );
                }
                let finish_reason = response.and_then(|response| {
                    response
                        .incomplete_details
                        .and_then(|details| details.reason)
                        .or(response.status)
                });
                return Ok(Some(finish_reason));
            }
            "response.failed" => {
                let message = parsed
                    .response
                    .and_then(|response| response.error)
                    .and_then(|error| error.message)
                    .unwrap_or_else(|| "Responses request failed".to_owned());
                return Err(ProviderError::StreamFailed {
                    provider: provider.clone(),
                    message,
                });
            }
            "error" => {
                return Err(ProviderError::StreamFailed {
                    provider: provider.clone(),
                    message: parsed
                        .message
                        .unwrap_or_else(|| "Responses stream reported an error".to_owned()),
                });
            }
            other => {
                tracing::trace!(provider = %provider, event = other, "ignoring Responses event");
            }
        }
        Ok(None)
    }
}

/// Argument events reference the item `id`; fall back to `call_id` for
/// servers that omit it.
fn item_key(item: &ResponsesOutputItem) -> String {
    item.id
        .clone()
        .or_else(|| item.call_id.clone())
        .unwrap_or_default()
}
