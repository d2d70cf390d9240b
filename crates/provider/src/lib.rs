use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use types::{ProviderError, ProviderId, StreamSink};

mod accumulator;
mod anthropic;
mod dispatch;
mod encode;
mod google;
mod openai;
mod registry;
mod resolver;
mod responses;
mod sse;

pub use anthropic::{
    AnthropicClient, AnthropicContentBlock, AnthropicFinalMessage, AnthropicMessageStream,
    AnthropicMessagesAdapter, AnthropicMessagesRequest, AnthropicStreamEvent,
};
pub use dispatch::{FormatAdapter, ProviderConnection, StreamDispatcher};
pub use google::GoogleInteractionsAdapter;
pub use openai::ChatCompletionsAdapter;
pub use registry::{StaticProviderStore, resolve_api_key_for_entry};
pub use resolver::FsAttachmentResolver;
pub use responses::ResponsesAdapter;

pub(crate) const OPENAI_DEFAULT_BASE_URL: &str = "https://api.openai.com";
pub(crate) const OPENAI_CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";
pub(crate) const OPENAI_RESPONSES_PATH: &str = "/v1/responses";
pub(crate) const ANTHROPIC_DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub(crate) const ANTHROPIC_MESSAGES_PATH: &str = "/v1/messages";
pub(crate) const GOOGLE_DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub(crate) const EVENT_STREAM_CONTENT_TYPE: &str = "text/event-stream";

/// Forwards text deltas to a sink, dropping empty fragments.
pub(crate) struct TextEmitter<'a> {
    sink: &'a mut dyn StreamSink,
}

impl<'a> TextEmitter<'a> {
    pub(crate) fn new(sink: &'a mut dyn StreamSink) -> Self {
        Self { sink }
    }

    pub(crate) fn emit(&mut self, text: &str) {
        if !text.is_empty() {
            self.sink.on_chunk(text);
        }
    }
}

/// Sends a streaming request, racing it against cancellation, and maps
/// non-success statuses to [`ProviderError::HttpStatus`].
pub(crate) async fn open_stream(
    request: reqwest::RequestBuilder,
    provider: &ProviderId,
    cancellation: &CancellationToken,
) -> Result<reqwest::Response, ProviderError> {
    let http_response = tokio::select! {
        biased;
        _ = cancellation.cancelled() => {
            return Err(ProviderError::Cancelled {
                provider: provider.clone(),
            });
        }
        response = request.header(reqwest::header::ACCEPT, EVENT_STREAM_CONTENT_TYPE).send() => {
            response.map_err(|error| ProviderError::Transport {
                provider: provider.clone(),
                message: error.to_string(),
            })?
        }
    };

    if !http_response.status().is_success() {
        let status = http_response.status().as_u16();
        let body = until_cancelled(
            async {
                Ok(match http_response.text().await {
                    Ok(text) => text,
                    Err(error) => format!("unable to read error body: {error}"),
                })
            },
            provider,
            cancellation,
        )
        .await?;
        return Err(ProviderError::HttpStatus {
            provider: provider.clone(),
            status,
            message: extract_http_error_message(&body),
        });
    }

    Ok(http_response)
}

/// Runs `future` unless the request is cancelled first.
pub(crate) async fn until_cancelled<T>(
    future: impl Future<Output = Result<T, ProviderError>>,
    provider: &ProviderId,
    cancellation: &CancellationToken,
) -> Result<T, ProviderError> {
    tokio::select! {
        biased;
        _ = cancellation.cancelled() => Err(ProviderError::Cancelled {
            provider: provider.clone(),
        }),
        result = future => result,
    }
}

/// Reads the next body chunk. `Ok(None)` marks the end of the body.
pub(crate) async fn next_chunk(
    http_response: &mut reqwest::Response,
    provider: &ProviderId,
    cancellation: &CancellationToken,
) -> Result<Option<Bytes>, ProviderError> {
    tokio::select! {
        biased;
        _ = cancellation.cancelled() => Err(ProviderError::Cancelled {
            provider: provider.clone(),
        }),
        chunk = http_response.chunk() => chunk.map_err(|error| ProviderError::Transport {
            provider: provider.clone(),
            message: format!("stream transport dropped: {error}"),
        }),
    }
}

pub(crate) fn response_parse_error(
    provider: &ProviderId,
    message: impl Into<String>,
) -> ProviderError {
    ProviderError::ResponseParse {
        provider: provider.clone(),
        message: message.into(),
    }
}

pub(crate) fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}

pub(crate) fn normalize_base_url_or_default(
    base_url: Option<&str>,
    default_base_url: &str,
) -> String {
    let trimmed = base_url.map(str::trim).unwrap_or_default();
    if trimmed.is_empty() {
        default_base_url.to_owned()
    } else {
        trimmed.trim_end_matches('/').to_owned()
    }
}

/// Vendor error envelopes all nest the human-readable message under
/// `error.message`; Anthropic may also put it at the top level.
#[derive(Debug, serde::Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    error: Option<ErrorBody>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(untagged)]
enum ErrorBody {
    Detailed {
        #[serde(default)]
        message: Option<String>,
    },
    Plain(String),
}

pub(crate) fn extract_http_error_message(body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<ErrorEnvelope>(body) {
        let nested = match parsed.error {
            Some(ErrorBody::Detailed { message }) => message,
            Some(ErrorBody::Plain(message)) => Some(message),
            None => None,
        };
        if let Some(message) = nested.or(parsed.message).and_then(non_empty) {
            return truncate_message(&message);
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "empty error response from provider".to_owned()
    } else {
        truncate_message(trimmed)
    }
}

fn truncate_message(message: &str) -> String {
    const MAX_LEN: usize = 512;
    if message.chars().count() <= MAX_LEN {
        return message.to_owned();
    }
    let prefix = message.chars().take(MAX_LEN).collect::<String>();
    format!("{prefix}...")
}
