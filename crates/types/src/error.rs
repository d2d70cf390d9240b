use thiserror::Error;

use crate::{ModelId, ProviderId};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("unknown provider `{provider}`")]
    UnknownProvider { provider: ProviderId },
    #[error("unsupported api format `{format}` for provider `{provider}`")]
    UnsupportedFormat { provider: ProviderId, format: String },
    #[error("missing API key for provider `{provider}`")]
    MissingApiKey { provider: ProviderId },
    #[error("invalid model id `{model}` for provider `{provider}`: {message}")]
    InvalidModel {
        provider: ProviderId,
        model: ModelId,
        message: String,
    },
    #[error("provider transport failed for `{provider}`: {message}")]
    Transport {
        provider: ProviderId,
        message: String,
    },
    #[error("provider `{provider}` returned HTTP {status}: {message}")]
    HttpStatus {
        provider: ProviderId,
        status: u16,
        message: String,
    },
    #[error("provider response parsing failed for `{provider}`: {message}")]
    ResponseParse {
        provider: ProviderId,
        message: String,
    },
    #[error("provider `{provider}` reported a stream error: {message}")]
    StreamFailed {
        provider: ProviderId,
        message: String,
    },
    #[error("invalid arguments for tool call `{call_id}` ({tool}) from `{provider}`: {message}")]
    ToolArguments {
        provider: ProviderId,
        call_id: String,
        tool: String,
        message: String,
    },
    #[error("provider `{provider}` exceeded the buffered tool-call frame limit of {limit}")]
    BufferLimitExceeded { provider: ProviderId, limit: usize },
    #[error(transparent)]
    Attachment(#[from] AttachmentError),
    #[error("stream for provider `{provider}` was cancelled")]
    Cancelled { provider: ProviderId },
    #[error("provider serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("attachment `{name}` could not be found")]
    NotFound { name: String },
    #[error("attachment `{name}` could not be read: {message}")]
    Read { name: String, message: String },
    #[error("attachment `{name}` resolved to unsupported data: {message}")]
    UnsupportedData { name: String, message: String },
}
