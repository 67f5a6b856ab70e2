//! Configuration System
//!
//! Layered configuration built with the `config` crate. Precedence, lowest to
//! highest: built-in defaults, `$XDG_CONFIG_HOME/skein/config.toml`,
//! `<workspace>/.skein/config.toml`, then `SKEIN__*` environment variables
//! (`SKEIN__CONTEXT__MAX_TOTAL_TOKENS=64000`).

use crate::context::ContextBudget;
use crate::error::{EngineError, StorageError};
use crate::fs::WatchConfig;
use crate::logging::LoggingConfig;
use crate::provider::TransportConfig;
use config::Environment;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

mod merge {
    pub mod merge_policy;
}
mod sources {
    pub mod global_file;
    pub mod workspace_file;
}

pub use sources::global_file::global_config_path;
pub use sources::workspace_file::{workspace_config_path, WORKSPACE_CONFIG_DIR};

const ENV_PREFIX: &str = "SKEIN";
const ENV_SEPARATOR: &str = "__";

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkeinConfig {
    #[serde(default)]
    pub context: ContextBudget,

    #[serde(default)]
    pub conversations: ConversationsConfig,

    #[serde(default)]
    pub watch: WatchConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Conversation cache and store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationsConfig {
    /// Maximum number of conversations kept in memory
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// Sled database directory; defaults to `<data dir>/conversations`
    #[serde(default)]
    pub store_path: Option<PathBuf>,
}

fn default_cache_capacity() -> usize {
    crate::conversation::DEFAULT_CACHE_CAPACITY
}

impl Default for ConversationsConfig {
    fn default() -> Self {
        Self {
            cache_capacity: default_cache_capacity(),
            store_path: None,
        }
    }
}

impl ConversationsConfig {
    pub fn resolved_store_path(&self) -> Result<PathBuf, StorageError> {
        match &self.store_path {
            Some(path) => Ok(path.clone()),
            None => Ok(data_dir()?.join("conversations")),
        }
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub section: &'static str,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.section, self.message)
    }
}

impl std::error::Error for ValidationError {}

impl SkeinConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        let mut push = |section: &'static str, message: String| {
            errors.push(ValidationError { section, message });
        };

        if let Err(e) = self.context.validate() {
            push("context", e);
        }
        if self.conversations.cache_capacity == 0 {
            push("conversations", "cache_capacity must be at least 1".to_string());
        }
        if self.watch.channel_capacity == 0 {
            push("watch", "channel_capacity must be at least 1".to_string());
        }
        if self.watch.max_batch_size == 0 {
            push("watch", "max_batch_size must be at least 1".to_string());
        }
        if self.transport.base_url.trim().is_empty() {
            push("transport", "base_url cannot be empty".to_string());
        }
        if self.transport.model.trim().is_empty() {
            push("transport", "model cannot be empty".to_string());
        }
        if !matches!(self.logging.format.as_str(), "text" | "json") {
            push(
                "logging",
                format!("Invalid log format: {} (must be 'json' or 'text')", self.logging.format),
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Loads [`SkeinConfig`] from every layer
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    workspace_root: Option<PathBuf>,
    skip_global: bool,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Include `<root>/.skein/config.toml`
    pub fn with_workspace(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = Some(root.into());
        self
    }

    /// Ignore the user-level file (tests)
    pub fn without_global(mut self) -> Self {
        self.skip_global = true;
        self
    }

    pub fn load(&self) -> Result<SkeinConfig, EngineError> {
        let mut builder = merge::merge_policy::builder_with_defaults()?;
        if !self.skip_global {
            builder = sources::global_file::add_to_builder(builder)?;
        }
        if let Some(root) = &self.workspace_root {
            builder = sources::workspace_file::add_to_builder(builder, root)?;
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator(ENV_SEPARATOR)
                .try_parsing(true),
        );

        let config: SkeinConfig = builder.build()?.try_deserialize()?;
        config.validate().map_err(|errors| {
            let joined: Vec<String> = errors.iter().map(ToString::to_string).collect();
            EngineError::ConfigError(joined.join("; "))
        })?;
        debug!(
            workspace = ?self.workspace_root,
            model = %config.transport.model,
            "Loaded configuration"
        );
        Ok(config)
    }
}

/// Load configuration for a workspace, including the global file
pub fn load_for_workspace(root: &Path) -> Result<SkeinConfig, EngineError> {
    ConfigLoader::new().with_workspace(root).load()
}

/// Platform data directory (`$XDG_DATA_HOME/skein` on Linux)
pub fn data_dir() -> Result<PathBuf, StorageError> {
    ProjectDirs::from("", "", "skein")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| StorageError::InvalidPath("Could not determine a home directory".to_string()))
}
