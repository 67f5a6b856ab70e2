//! Merge rules: built-in defaults under every file and environment layer.

use config::builder::DefaultState;
use config::Config;
use config::ConfigBuilder;
use config::ConfigError;

/// Create a Config builder seeded with the scalar defaults that files commonly override.
/// Anything not set here falls back to the serde defaults on [`crate::config::SkeinConfig`].
pub fn builder_with_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Config::builder()
        .set_default("conversations.cache_capacity", 32)?
        .set_default("logging.level", "info")?
        .set_default("logging.format", "text")?
        .set_default("logging.output", "stderr")
}
