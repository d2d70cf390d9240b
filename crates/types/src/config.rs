use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ApiFormat;

pub const SUPPORTED_CONFIG_MAJOR_VERSION: u64 = 1;
pub const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";
pub const DEFAULT_ANTHROPIC_MAX_TOKENS: u32 = 4_096;
pub const DEFAULT_GOOGLE_API_VERSION: &str = "v1beta";
pub const DEFAULT_MAX_BUFFERED_TOOL_FRAMES: usize = 4_096;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchboardConfig {
    #[serde(default = "default_config_version")]
    pub config_version: String,
    #[serde(default)]
    pub adapter: AdapterConfig,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderEntry>,
}

impl Default for SwitchboardConfig {
    fn default() -> Self {
        Self {
            config_version: default_config_version(),
            adapter: AdapterConfig::default(),
            providers: BTreeMap::new(),
        }
    }
}

impl SwitchboardConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_config_version(&self.config_version)?;
        self.adapter.validate()?;
        for (id, entry) in &self.providers {
            entry.validate(id)?;
        }
        Ok(())
    }
}

/// Protocol knobs shared by every adapter instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterConfig {
    #[serde(default = "default_anthropic_max_tokens")]
    pub anthropic_max_tokens: u32,
    #[serde(default = "default_anthropic_version")]
    pub anthropic_version: String,
    #[serde(default = "default_google_api_version")]
    pub google_api_version: String,
    /// Upper bound on tool-call frames a deferred adapter holds before
    /// materializing calls at stream end.
    #[serde(default = "default_max_buffered_tool_frames")]
    pub max_buffered_tool_frames: usize,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            anthropic_max_tokens: default_anthropic_max_tokens(),
            anthropic_version: default_anthropic_version(),
            google_api_version: default_google_api_version(),
            max_buffered_tool_frames: default_max_buffered_tool_frames(),
        }
    }
}

impl AdapterConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.anthropic_max_tokens == 0 {
            return Err(ConfigError::InvalidAdapterLimit {
                field: "anthropic_max_tokens",
                value: 0,
            });
        }
        if self.max_buffered_tool_frames == 0 {
            return Err(ConfigError::InvalidAdapterLimit {
                field: "max_buffered_tool_frames",
                value: 0,
            });
        }
        if self.anthropic_version.trim().is_empty() {
            return Err(ConfigError::EmptyAdapterSetting {
                field: "anthropic_version",
            });
        }
        if self.google_api_version.trim().is_empty() {
            return Err(ConfigError::EmptyAdapterSetting {
                field: "google_api_version",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProviderEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

impl ProviderEntry {
    pub fn effective_format(&self) -> Result<ApiFormat, String> {
        ApiFormat::from_tag(self.api_format.as_deref())
    }

    fn validate(&self, id: &str) -> Result<(), ConfigError> {
        self.effective_format()
            .map_err(|format| ConfigError::UnknownApiFormat {
                provider: id.to_owned(),
                format,
            })?;
        if let Some(base_url) = &self.base_url {
            let trimmed = base_url.trim();
            if !trimmed.is_empty()
                && !(trimmed.starts_with("http://") || trimmed.starts_with("https://"))
            {
                return Err(ConfigError::InvalidBaseUrl {
                    provider: id.to_owned(),
                    base_url: base_url.clone(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("unsupported config_version `{version}`; supported major is {supported_major}")]
    UnsupportedConfigVersion {
        version: String,
        supported_major: u64,
    },
    #[error("invalid config_version format `{version}`")]
    InvalidConfigVersionFormat { version: String },
    #[error("provider `{provider}` has unknown api_format `{format}`")]
    UnknownApiFormat { provider: String, format: String },
    #[error("provider `{provider}` has invalid base_url `{base_url}`")]
    InvalidBaseUrl { provider: String, base_url: String },
    #[error("adapter limit `{field}` must be greater than zero; got {value}")]
    InvalidAdapterLimit { field: &'static str, value: u64 },
    #[error("adapter setting `{field}` must not be empty")]
    EmptyAdapterSetting { field: &'static str },
}

pub fn validate_config_version(config_version: &str) -> Result<(), ConfigError> {
    let major = parse_major_version(config_version)?;
    if major != SUPPORTED_CONFIG_MAJOR_VERSION {
        return Err(ConfigError::UnsupportedConfigVersion {
            version: config_version.trim().to_owned(),
            supported_major: SUPPORTED_CONFIG_MAJOR_VERSION,
        });
    }
    Ok(())
}

fn parse_major_version(config_version: &str) -> Result<u64, ConfigError> {
    let trimmed = config_version.trim();
    let invalid = || ConfigError::InvalidConfigVersionFormat {
        version: trimmed.to_owned(),
    };
    if trimmed.is_empty() {
        return Err(invalid());
    }

    let mut parts = trimmed.split('.');
    let first = parts.next().ok_or_else(invalid)?;
    if first.is_empty() || !first.chars().all(|ch| ch.is_ascii_digit()) {
        return Err(invalid());
    }
    for part in parts {
        if part.is_empty() || !part.chars().all(|ch| ch.is_ascii_digit()) {
            return Err(invalid());
        }
    }

    first.parse::<u64>().map_err(|_| invalid())
}

fn default_config_version() -> String {
    "1.0.0".to_owned()
}

fn default_anthropic_max_tokens() -> u32 {
    DEFAULT_ANTHROPIC_MAX_TOKENS
}

fn default_anthropic_version() -> String {
    DEFAULT_ANTHROPIC_VERSION.to_owned()
}

fn default_google_api_version() -> String {
    DEFAULT_GOOGLE_API_VERSION.to_owned()
}

fn default_max_buffered_tool_frames() -> usize {
    DEFAULT_MAX_BUFFERED_TOOL_FRAMES
}
