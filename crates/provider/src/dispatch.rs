use std::sync::Arc;

use reqwest::Client;
use types::{
    AdapterConfig, ApiFormat, AttachmentResolver, Completion, ModelId, ProviderError, ProviderId,
    ProviderStore, StreamRequest, StreamSink,
};

use crate::{
    AnthropicMessagesAdapter, ChatCompletionsAdapter, GoogleInteractionsAdapter, ResponsesAdapter,
    non_empty, normalize_base_url_or_default,
};

/// Resolved endpoint and credential for one provider.
#[derive(Debug, Clone)]
pub struct ProviderConnection {
    pub provider_id: ProviderId,
    pub base_url: Option<String>,
    pub api_key: String,
    pub client: Client,
}

impl ProviderConnection {
    pub fn new(provider_id: ProviderId, api_key: impl Into<String>) -> Self {
        Self {
            provider_id,
            base_url: None,
            api_key: api_key.into(),
            client: Client::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    pub(crate) fn base_url_or(&self, default_base_url: &str) -> String {
        normalize_base_url_or_default(self.base_url.as_deref(), default_base_url)
    }
}

/// One adapter per wire protocol.
#[derive(Debug, Clone)]
pub enum FormatAdapter {
    ChatCompletions(ChatCompletionsAdapter),
    Responses(ResponsesAdapter),
    GoogleInteractions(GoogleInteractionsAdapter),
    AnthropicMessages(AnthropicMessagesAdapter),
}

impl FormatAdapter {
    pub fn for_format(
        format: ApiFormat,
        connection: ProviderConnection,
        config: &AdapterConfig,
    ) -> Result<Self, ProviderError> {
        Ok(match format {
            ApiFormat::OpenaiChatCompletions => {
                Self::ChatCompletions(ChatCompletionsAdapter::new(connection, config))
            }
            ApiFormat::OpenaiResponses => Self::Responses(ResponsesAdapter::new(connection)),
            ApiFormat::GoogleInteractions => {
                Self::GoogleInteractions(GoogleInteractionsAdapter::new(connection, config))
            }
            ApiFormat::AnthropicMessages => {
                Self::AnthropicMessages(AnthropicMessagesAdapter::new(connection, config)?)
            }
        })
    }

    /// Selects an adapter from a configured format tag. A missing tag means
    /// chat completions; an unrecognized one is
    /// [`ProviderError::UnsupportedFormat`].
    pub fn from_tag(
        tag: Option<&str>,
        connection: ProviderConnection,
        config: &AdapterConfig,
    ) -> Result<Self, ProviderError> {
        let format =
            ApiFormat::from_tag(tag).map_err(|format| ProviderError::UnsupportedFormat {
                provider: connection.provider_id.clone(),
                format,
            })?;
        Self::for_format(format, connection, config)
    }

    pub fn format(&self) -> ApiFormat {
        match self {
            Self::ChatCompletions(_) => ApiFormat::OpenaiChatCompletions,
            Self::Responses(_) => ApiFormat::OpenaiResponses,
            Self::GoogleInteractions(_) => ApiFormat::GoogleInteractions,
            Self::AnthropicMessages(_) => ApiFormat::AnthropicMessages,
        }
    }

    /// Runs one streaming call. Text is delivered through `sink.on_chunk`;
    /// the terminal outcome is returned rather than delivered.
    pub async fn stream_response(
        &self,
        request: &StreamRequest<'_>,
        resolver: &dyn AttachmentResolver,
        sink: &mut dyn StreamSink,
    ) -> Result<Completion, ProviderError> {
        match self {
            Self::ChatCompletions(adapter) => {
                adapter.stream_response(request, resolver, sink).await
            }
            Self::Responses(adapter) => adapter.stream_response(request, resolver, sink).await,
            Self::GoogleInteractions(adapter) => {
                adapter.stream_response(request, resolver, sink).await
            }
            Self::AnthropicMessages(adapter) => {
                adapter.stream_response(request, resolver, sink).await
            }
        }
    }

    /// Runs one streaming call and reports its outcome through exactly one
    /// of `on_complete` or `on_error`.
    pub async fn stream_to_sink(
        &self,
        request: &StreamRequest<'_>,
        resolver: &dyn AttachmentResolver,
        sink: &mut dyn StreamSink,
    ) {
        let result = self.stream_response(request, resolver, sink).await;
        deliver(result, sink);
    }
}

/// Single entry point: looks up the provider, selects its adapter and
/// streams the request.
#[derive(Clone)]
pub struct StreamDispatcher {
    store: Arc<dyn ProviderStore>,
    resolver: Arc<dyn AttachmentResolver>,
    config: AdapterConfig,
    client: Client,
}

impl StreamDispatcher {
    pub fn new(
        store: Arc<dyn ProviderStore>,
        resolver: Arc<dyn AttachmentResolver>,
        config: AdapterConfig,
    ) -> Self {
        Self {
            store,
            resolver,
            config,
            client: Client::new(),
        }
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    /// Streams `request` against `provider`. After zero or more `on_chunk`
    /// calls, exactly one of `on_complete` or `on_error` is invoked.
    pub async fn stream_response(
        &self,
        provider: &ProviderId,
        request: StreamRequest<'_>,
        sink: &mut dyn StreamSink,
    ) {
        let result = self.try_stream_response(provider, &request, sink).await;
        if let Err(error) = &result {
            tracing::warn!(provider = %provider, model = %request.model, %error, "stream failed");
        }
        deliver(result, sink);
    }

    async fn try_stream_response(
        &self,
        provider: &ProviderId,
        request: &StreamRequest<'_>,
        sink: &mut dyn StreamSink,
    ) -> Result<Completion, ProviderError> {
        let adapter = self.adapter_for(provider, &request.model).await?;
        tracing::debug!(
            provider = %provider,
            model = %request.model,
            format = %adapter.format(),
            "dispatching stream request"
        );
        let completion = adapter
            .stream_response(request, self.resolver.as_ref(), sink)
            .await?;
        tracing::debug!(
            provider = %provider,
            finish_reason = ?completion.finish_reason,
            tool_calls = completion.tool_calls.as_ref().map_or(0, Vec::len),
            "stream completed"
        );
        Ok(completion)
    }

    /// Everything that can fail before a network call happens here.
    async fn adapter_for(
        &self,
        provider: &ProviderId,
        model: &ModelId,
    ) -> Result<FormatAdapter, ProviderError> {
        let record = self
            .store
            .provider(provider)
            .await?
            .ok_or_else(|| ProviderError::UnknownProvider {
                provider: provider.clone(),
            })?;
        let format = ApiFormat::from_tag(record.api_format.as_deref()).map_err(|format| {
            ProviderError::UnsupportedFormat {
                provider: provider.clone(),
                format,
            }
        })?;
        validate_model(provider, model)?;
        let api_key = self
            .store
            .api_key(provider)
            .await?
            .and_then(non_empty)
            .ok_or_else(|| ProviderError::MissingApiKey {
                provider: provider.clone(),
            })?;

        let connection = ProviderConnection {
            provider_id: provider.clone(),
            base_url: record.base_url,
            api_key,
            client: self.client.clone(),
        };
        FormatAdapter::for_format(format, connection, &self.config)
    }
}

fn deliver(result: Result<Completion, ProviderError>, sink: &mut dyn StreamSink) {
    match result {
        Ok(completion) => sink.on_complete(completion.finish_reason, completion.tool_calls),
        Err(error) => sink.on_error(error.to_string()),
    }
}

/// Model identifiers are interpolated into request bodies and, for some
/// vendors, URLs.
pub(crate) fn validate_model(provider: &ProviderId, model: &ModelId) -> Result<(), ProviderError> {
    let invalid = |message: &str| ProviderError::InvalidModel {
        provider: provider.clone(),
        model: model.clone(),
        message: message.to_owned(),
    };
    if model.0.trim().is_empty() {
        return Err(invalid("model identifier is empty"));
    }
    if model.0.chars().any(char::is_whitespace) {
        return Err(invalid("model identifier contains whitespace"));
    }
    if model.0.contains(['?', '#']) {
        return Err(invalid("model identifier contains URL delimiters"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_identifiers_are_validated() {
        let provider = ProviderId::from("openai");
        assert!(validate_model(&provider, &ModelId::from("gpt-4o-mini")).is_ok());
        assert!(validate_model(&provider, &ModelId::from("models/gemini-2.5-flash")).is_ok());
        for model in ["", "  ", "gpt 4o", "gpt-4o?x=1", "gpt#4"] {
            assert!(
                matches!(
                    validate_model(&provider, &ModelId::from(model)),
                    Err(ProviderError::InvalidModel { .. })
                ),
                "`{model}` should be rejected"
            );
        }
    }

    #[test]
    fn format_tags_select_matching_adapter() {
        let config = AdapterConfig::default();
        let connection = ProviderConnection::new(ProviderId::from("p"), "key");
        for format in ApiFormat::ALL {
            let adapter =
                FormatAdapter::from_tag(Some(format.as_str()), connection.clone(), &config)
                    .expect("known tags should select an adapter");
            assert_eq!(adapter.format(), format);
        }
        let adapter = FormatAdapter::from_tag(None, connection.clone(), &config)
            .expect("missing tag should default");
        assert_eq!(adapter.format(), ApiFormat::OpenaiChatCompletions);

        let error = FormatAdapter::from_tag(Some("soap_rpc"), connection, &config)
            .expect_err("unknown tags should fail");
        assert!(error.to_string().contains("soap_rpc"));
    }
}
