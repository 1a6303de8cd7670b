//! Configuration loading from files and configuration providers.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, Result};

use super::ControlConfig;

/// Read, parse and validate a machine TOML file.
///
/// # Errors
///
/// [`ConfigError::Io`] when the file is unreadable, otherwise whatever
/// [`parse_config`] reports.
///
/// # Example
///
/// ```rust,ignore
/// use laserclean_core::load_config;
///
/// let config = load_config("machine.toml")?;
/// ```
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<ControlConfig> {
    let content =
        fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io(e.to_string()))?;

    parse_config(&content)
}

/// Parse and validate machine TOML held in memory.
///
/// # Errors
///
/// [`ConfigError::Parse`] for malformed TOML, or the first validation failure.
pub fn parse_config(content: &str) -> Result<ControlConfig> {
    let config: ControlConfig =
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.message().into()))?;

    super::validation::validate_config(&config)?;

    Ok(config)
}

/// Source of configuration that can be re-read during a session.
pub trait ConfigProvider: Send + Sync {
    /// Read and validate the current configuration.
    fn load(&self) -> Result<ControlConfig>;
}

/// Configuration provider backed by a TOML file.
#[derive(Debug, Clone)]
pub struct FileConfigProvider {
    path: PathBuf,
}

impl FileConfigProvider {
    /// Create a provider for `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigProvider for FileConfigProvider {
    fn load(&self) -> Result<ControlConfig> {
        load_config(&self.path)
    }
}

/// Provider that always returns a fixed configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticConfigProvider(pub ControlConfig);

impl ConfigProvider for StaticConfigProvider {
    fn load(&self) -> Result<ControlConfig> {
        super::validation::validate_config(&self.0)?;
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_parse_minimal_config() {
        let config = parse_config("").unwrap();
        assert_eq!(config.motion.index_distance, 15842);
        assert!(config.presets.is_empty());
    }

    #[test]
    fn test_parse_with_presets() {
        let toml = r#"
[motion]
max_steps = 30000

[motion.jog]
speed = 800.0
acceleration = 1500.0
deceleration = 3000.0

[presets]
"Position 1" = 1200
start = 0
"#;

        let config = parse_config(toml).unwrap();
        assert_eq!(config.preset("Position 1"), Some(1200));
        assert!(config.motion.jog.is_asymmetric());
    }

    #[test]
    fn test_parse_error_reported() {
        let result = parse_config("[motion]\nindex_distance = \"far\"");
        assert!(matches!(result, Err(Error::Config(ConfigError::Parse(_)))));
    }

    #[test]
    fn test_missing_file() {
        let result = FileConfigProvider::new("/nonexistent/machine.toml").load();
        assert!(matches!(result, Err(Error::Config(ConfigError::Io(_)))));
    }
}
