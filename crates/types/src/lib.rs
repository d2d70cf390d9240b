mod attachment;
mod config;
mod error;
mod model;
mod provider;
mod stream;
mod tool;
mod tracing;

pub use attachment::{AttachmentData, AttachmentResolver, ResolvedAttachment};
pub use config::{
    AdapterConfig, ConfigError, DEFAULT_ANTHROPIC_MAX_TOKENS, DEFAULT_ANTHROPIC_VERSION,
    DEFAULT_GOOGLE_API_VERSION, DEFAULT_MAX_BUFFERED_TOOL_FRAMES, ProviderEntry,
    SUPPORTED_CONFIG_MAJOR_VERSION, SwitchboardConfig, validate_config_version,
};
pub use error::{AttachmentError, ProviderError};
pub use model::{
    Attachment, AttachmentKind, Conversation, Message, ModelId, ProviderId, ToolCall, ToolResult,
};
pub use provider::{
    ANTHROPIC_MESSAGES_FORMAT, ApiFormat, GOOGLE_INTERACTIONS_FORMAT,
    OPENAI_CHAT_COMPLETIONS_FORMAT, OPENAI_RESPONSES_FORMAT, ProviderRecord, ProviderStore,
};
pub use stream::{CallbackSink, ChannelSink, Completion, StreamEvent, StreamRequest, StreamSink};
pub use tool::{ToolDefinition, ToolMetadata, ToolParameterSchema, find_tool};
pub use tracing::init_tracing;
