use std::{collections::BTreeMap, env};

use async_trait::async_trait;
use types::{
    ApiFormat, ConfigError, ProviderEntry, ProviderError, ProviderId, ProviderRecord,
    ProviderStore, SwitchboardConfig,
};

use crate::non_empty;

/// [`ProviderStore`] backed by the `[providers]` table of a loaded config.
///
/// Keys are resolved once when the store is built.
#[derive(Debug, Clone, Default)]
pub struct StaticProviderStore {
    providers: BTreeMap<ProviderId, StoredProvider>,
}

#[derive(Debug, Clone)]
struct StoredProvider {
    record: ProviderRecord,
    api_key: Option<String>,
}

impl StaticProviderStore {
    pub fn from_config(config: &SwitchboardConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let providers = config
            .providers
            .iter()
            .map(|(id, entry)| {
                let provider_id = ProviderId::from(id.as_str());
                let stored = StoredProvider {
                    record: ProviderRecord {
                        id: provider_id.clone(),
                        display_name: entry.display_name.clone().unwrap_or_else(|| id.clone()),
                        base_url: entry.base_url.clone().and_then(non_empty),
                        api_format: entry.api_format.clone(),
                    },
                    api_key: resolve_api_key_for_entry(entry),
                };
                (provider_id, stored)
            })
            .collect();
        Ok(Self { providers })
    }

    /// Adds or replaces one provider. Useful for callers that manage
    /// records themselves.
    pub fn insert(&mut self, record: ProviderRecord, api_key: Option<String>) {
        self.providers.insert(
            record.id.clone(),
            StoredProvider {
                record,
                api_key: api_key.and_then(non_empty),
            },
        );
    }

    pub fn provider_ids(&self) -> impl Iterator<Item = &ProviderId> {
        self.providers.keys()
    }
}

#[async_trait]
impl ProviderStore for StaticProviderStore {
    async fn provider(&self, id: &ProviderId) -> Result<Option<ProviderRecord>, ProviderError> {
        Ok(self.providers.get(id).map(|stored| stored.record.clone()))
    }

    async fn api_key(&self, id: &ProviderId) -> Result<Option<String>, ProviderError> {
        Ok(self.providers.get(id).and_then(|stored| stored.api_key.clone()))
    }
}

/// Resolve an API key for the given provider entry.
///
/// Resolution order:
/// 1. Explicit `api_key` from the entry
/// 2. Custom env var named by `api_key_env`
/// 3. Format-specific default env var (`OPENAI_API_KEY`, `GEMINI_API_KEY`,
///    `ANTHROPIC_API_KEY`)
/// 4. Generic `API_KEY` fallback
pub fn resolve_api_key_for_entry(entry: &ProviderEntry) -> Option<String> {
    let format_env = entry
        .effective_format()
        .ok()
        .and_then(|format| env::var(default_api_key_env(format)).ok());
    let custom_env = entry
        .api_key_env
        .as_ref()
        .and_then(|var| env::var(var).ok());
    resolve_api_key_from_sources(
        entry.api_key.clone(),
        custom_env,
        format_env,
        env::var("API_KEY").ok(),
    )
}

fn default_api_key_env(format: ApiFormat) -> &'static str {
    match format {
        ApiFormat::OpenaiChatCompletions | ApiFormat::OpenaiResponses => "OPENAI_API_KEY",
        ApiFormat::GoogleInteractions => "GEMINI_API_KEY",
        ApiFormat::AnthropicMessages => "ANTHROPIC_API_KEY",
    }
}

fn resolve_api_key_from_sources(
    explicit_api_key: Option<String>,
    custom_env_key: Option<String>,
    format_env_key: Option<String>,
    fallback_env_key: Option<String>,
) -> Option<String> {
    explicit_api_key
        .and_then(non_empty)
        .or_else(|| custom_env_key.and_then(non_empty))
        .or_else(|| format_env_key.and_then(non_empty))
        .or_else(|| fallback_env_key.and_then(non_empty))
}
