use std::{
    env, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use provider::{FsAttachmentResolver, StaticProviderStore, StreamDispatcher};
use thiserror::Error;
use types::{Attachment, AttachmentKind, ConfigError, SwitchboardConfig};

const SYSTEM_CONFIG_DIR: &str = "/etc/switchboard";
const USER_CONFIG_DIR: &str = ".config/switchboard";
const WORKSPACE_CONFIG_DIR: &str = ".switchboard";
const PROVIDERS_CONFIG_FILE: &str = "providers.toml";
const CONFIG_ENV_PREFIX: &str = "SWITCHBOARD__";

#[derive(Debug, Clone)]
pub struct ConfigSearchPaths {
    pub system_dir: PathBuf,
    pub user_dir: Option<PathBuf>,
    pub workspace_dir: PathBuf,
}

impl ConfigSearchPaths {
    pub fn discover() -> Result<Self, CliError> {
        let workspace_dir = env::current_dir()?.join(WORKSPACE_CONFIG_DIR);
        let user_dir = env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| home.join(USER_CONFIG_DIR));
        Ok(Self {
            system_dir: PathBuf::from(SYSTEM_CONFIG_DIR),
            user_dir,
            workspace_dir,
        })
    }
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("failed to resolve configuration path: {0}")]
    Io(#[from] io::Error),
    #[error("failed to load configuration: {0}")]
    ConfigExtract(#[source] Box<figment::Error>),
    #[error(transparent)]
    ConfigValidation(#[from] ConfigError),
    #[error("no provider `{provider}` is configured")]
    UnknownProvider { provider: String },
}

impl From<figment::Error> for CliError {
    fn from(value: figment::Error) -> Self {
        Self::ConfigExtract(Box::new(value))
    }
}

pub fn load_config() -> Result<SwitchboardConfig, CliError> {
    let paths = ConfigSearchPaths::discover()?;
    load_config_with_paths(&paths)
}

/// Layers defaults, system, user and workspace `providers.toml` files, then
/// `SWITCHBOARD__`-prefixed environment variables. Later layers win.
pub fn load_config_with_paths(paths: &ConfigSearchPaths) -> Result<SwitchboardConfig, CliError> {
    let mut figment = Figment::from(Serialized::defaults(SwitchboardConfig::default()));
    figment = merge_directory(figment, &paths.system_dir);
    if let Some(user_dir) = &paths.user_dir {
        figment = merge_directory(figment, user_dir);
    }
    figment = merge_directory(figment, &paths.workspace_dir);
    figment = figment.merge(Env::prefixed(CONFIG_ENV_PREFIX).split("__"));

    let config: SwitchboardConfig = figment.extract()?;
    config.validate()?;
    Ok(config)
}

/// Builds a dispatcher over the configured providers. Attachment paths are
/// read relative to `attachment_root` when given.
pub fn build_dispatcher(
    config: &SwitchboardConfig,
    attachment_root: Option<&Path>,
) -> Result<StreamDispatcher, CliError> {
    let store = StaticProviderStore::from_config(config)?;
    let resolver = match attachment_root {
        Some(root) => FsAttachmentResolver::with_root(root),
        None => FsAttachmentResolver::new(),
    };
    Ok(StreamDispatcher::new(
        Arc::new(store),
        Arc::new(resolver),
        config.adapter.clone(),
    ))
}

pub fn ensure_provider_configured(
    config: &SwitchboardConfig,
    provider: &str,
) -> Result<(), CliError> {
    if config.providers.contains_key(provider) {
        Ok(())
    } else {
        Err(CliError::UnknownProvider {
            provider: provider.to_owned(),
        })
    }
}

/// Builds an attachment reference for a local path, choosing its kind from
/// the extension. Unknown extensions are sent as text.
pub fn attachment_for_path(path: &Path) -> Attachment {
    let extension = path
        .extension()
        .and_then(|extension| extension.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    let kind = match extension.as_str() {
        "png" | "jpg" | "jpeg" | "gif" | "webp" => AttachmentKind::Image,
        "pdf" => AttachmentKind::Pdf,
        "html" | "htm" => AttachmentKind::Webpage,
        _ => AttachmentKind::Text,
    };
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    Attachment::new(kind, name, path.to_string_lossy())
}

fn merge_directory(figment: Figment, directory: &Path) -> Figment {
    let path = directory.join(PROVIDERS_CONFIG_FILE);
    if path.is_file() {
        tracing::debug!(path = %path.display(), "merging configuration file");
        figment.merge(Toml::file(path))
    } else {
        figment
    }
}
