use std::{fmt, str::FromStr};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{ProviderError, ProviderId};

pub const OPENAI_CHAT_COMPLETIONS_FORMAT: &str = "openai_chat_completions";
pub const OPENAI_RESPONSES_FORMAT: &str = "openai_responses";
pub const GOOGLE_INTERACTIONS_FORMAT: &str = "google_interactions";
pub const ANTHROPIC_MESSAGES_FORMAT: &str = "anthropic_messages";

/// The wire protocol a provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiFormat {
    #[default]
    OpenaiChatCompletions,
    OpenaiResponses,
    GoogleInteractions,
    AnthropicMessages,
}

impl ApiFormat {
    pub const ALL: [ApiFormat; 4] = [
        ApiFormat::OpenaiChatCompletions,
        ApiFormat::OpenaiResponses,
        ApiFormat::GoogleInteractions,
        ApiFormat::AnthropicMessages,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenaiChatCompletions => OPENAI_CHAT_COMPLETIONS_FORMAT,
            Self::OpenaiResponses => OPENAI_RESPONSES_FORMAT,
            Self::GoogleInteractions => GOOGLE_INTERACTIONS_FORMAT,
            Self::AnthropicMessages => ANTHROPIC_MESSAGES_FORMAT,
        }
    }

    /// Resolves a stored format tag. A missing tag selects the default
    /// format; an unrecognized one is returned unchanged as the error.
    pub fn from_tag(tag: Option<&str>) -> Result<Self, String> {
        match tag.map(str::trim) {
            None => Ok(Self::default()),
            Some(tag) => tag.parse(),
        }
    }
}

impl FromStr for ApiFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|format| format.as_str() == value)
            .ok_or_else(|| value.to_owned())
    }
}

impl fmt::Display for ApiFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored provider settings. The API key is deliberately not part of the
/// record; it is fetched through [`ProviderStore::api_key`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub id: ProviderId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_format: Option<String>,
}

#[async_trait]
pub trait ProviderStore: Send + Sync {
    async fn provider(&self, id: &ProviderId) -> Result<Option<ProviderRecord>, ProviderError>;

    async fn api_key(&self, id: &ProviderId) -> Result<Option<String>, ProviderError>;
}
