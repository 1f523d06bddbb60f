//! This module provides functionality for loading and saving the application's configuration.
//!
//! It defines the [`AskAiConfig`] struct, read from `<vault>/config.yaml`, and the
//! [`ConfigOverrides`] that command-line flags and environment variables layer on top of it.
//!
//! Precedence, highest first: command-line flag, environment variable, config file, default.
//! Flags and environment variables are both resolved by clap, so they arrive here as one set of
//! overrides.
//!
//! # Examples
//!
//! ```no_run
//! use askai::config::{AskAiConfig, load_or_default};
//! use std::path::Path;
//!
//! let mut config: AskAiConfig = load_or_default(Path::new("/home/me/.askAI/config.yaml")).unwrap();
//! config.adjust_temperature(0.1);
//! println!("{:?}", config);
//! ```

use std::{error::Error, fs, path::Path};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::AskAiError;

/// File name of the config inside the vault.
pub const CONFIG_FILE: &str = "config.yaml";

pub const MIN_TEMPERATURE: f32 = 0.1;
pub const MAX_TEMPERATURE: f32 = 2.0;
pub const TEMPERATURE_STEP: f32 = 0.1;

/// Which wire protocol the generation service speaks.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Ollama `/api/generate`, newline-delimited JSON.
    #[default]
    Ollama,
    /// OpenAI-compatible `/v1/chat/completions`, server-sent events.
    Openai,
}

/// Represents the application's configuration.
///
/// Every field has a default, so a partial file (or no file at all) is valid.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct AskAiConfig {
    /// Model used for generation.
    pub model_name: String,

    /// Sampling temperature, kept within [`MIN_TEMPERATURE`]..=[`MAX_TEMPERATURE`].
    pub temperature: f32,

    /// Base URL of the generation service.
    pub api_url: String,

    pub backend: Backend,

    /// Only sent by the OpenAI-compatible backend.
    pub api_key: Option<String>,

    /// Base URL of the embedding service; `api_url` when unset.
    pub embedding_url: Option<String>,

    pub embedding_model: String,

    pub embedding_dimension: usize,

    // Qdrant REST endpoint
    pub qdrant_url: String,

    pub qdrant_api_key: Option<String>,

    pub collection: String,

    // Token channel capacity per session
    pub token_buffer: usize,
}

impl Default for AskAiConfig {
    fn default() -> Self {
        Self {
            model_name: "gemma3:1b".to_string(),
            temperature: 1.5,
            api_url: "http://localhost:11434".to_string(),
            backend: Backend::Ollama,
            api_key: None,
            embedding_url: None,
            embedding_model: "mxbai-embed-large".to_string(),
            embedding_dimension: 1024,
            qdrant_url: "http://localhost:6333".to_string(),
            qdrant_api_key: None,
            collection: "askai_questions".to_string(),
            token_buffer: 64,
        }
    }
}

/// Values resolved by clap from flags or environment variables. `None` leaves the file value.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ConfigOverrides {
    pub model_name: Option<String>,
    pub api_url: Option<String>,
    pub temperature: Option<f32>,
    pub backend: Option<Backend>,
    pub embedding_url: Option<String>,
    pub qdrant_url: Option<String>,
}

impl AskAiConfig {
    /// Layer `overrides` on top of this config. Temperature is clamped into range.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(model) = &overrides.model_name {
            self.model_name = model.clone();
        }
        if let Some(url) = &overrides.api_url {
            self.api_url = url.clone();
        }
        if let Some(temperature) = overrides.temperature {
            let clamped = clamp_temperature(temperature);
            if clamped != temperature {
                warn!(requested = temperature, used = clamped, "temperature out of range");
            }
            self.temperature = clamped;
        }
        if let Some(backend) = overrides.backend {
            self.backend = backend;
        }
        if let Some(url) = &overrides.embedding_url {
            self.embedding_url = Some(url.clone());
        }
        if let Some(url) = &overrides.qdrant_url {
            self.qdrant_url = url.clone();
        }
    }

    /// Move the temperature by `delta`, staying in range and on one decimal.
    ///
    /// # Returns
    /// The new temperature.
    pub fn adjust_temperature(&mut self, delta: f32) -> f32 {
        self.temperature = clamp_temperature(self.temperature + delta);
        self.temperature
    }

    pub fn embedding_base(&self) -> &str {
        self.embedding_url.as_deref().unwrap_or(&self.api_url)
    }

    /// Reject values no component can work with.
    pub fn validate(&self) -> Result<(), AskAiError> {
        if self.model_name.trim().is_empty() {
            return Err(AskAiError::Config("model_name is empty".into()));
        }
        if self.embedding_dimension == 0 {
            return Err(AskAiError::Config("embedding_dimension must be positive".into()));
        }
        if self.token_buffer == 0 {
            return Err(AskAiError::Config("token_buffer must be positive".into()));
        }
        if self.collection.trim().is_empty() {
            return Err(AskAiError::Config("collection is empty".into()));
        }
        Ok(())
    }
}

/// Clamp into range and round to one decimal.
pub fn clamp_temperature(value: f32) -> f32 {
    if !value.is_finite() {
        return MIN_TEMPERATURE;
    }
    let rounded = (value * 10.0).round() / 10.0;
    rounded.clamp(MIN_TEMPERATURE, MAX_TEMPERATURE)
}

/// Loads the application's configuration from a YAML file.
///
/// # Parameters
///
/// - `file`: The path to the YAML configuration file.
///
/// # Returns
///
/// - `Ok(AskAiConfig)`: The loaded configuration.
/// - `Err(Box<dyn Error>)`: The file could not be read or is not valid YAML.
pub fn load_config(file: &Path) -> Result<AskAiConfig, Box<dyn Error>> {
    debug!(path = %file.display(), "loading config");
    let content = fs::read_to_string(file)?;
    let config: AskAiConfig = serde_yaml::from_str(&content)?;
    Ok(config)
}

/// Like [`load_config`], but a missing file gives the defaults.
pub fn load_or_default(file: &Path) -> Result<AskAiConfig, Box<dyn Error>> {
    if !file.exists() {
        debug!(path = %file.display(), "no config file, using defaults");
        return Ok(AskAiConfig::default());
    }
    load_config(file)
}

/// Writes the configuration as YAML, replacing any existing file.
pub fn save_config(config: &AskAiConfig, file: &Path) -> Result<(), Box<dyn Error>> {
    let content = serde_yaml::to_string(config)?;
    fs::write(file, content)?;
    debug!(path = %file.display(), "saved config");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_config_valid_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(
            temp_file,
            r#"
model_name: "llama3.2"
temperature: 0.7
api_url: "http://gpu-box:11434"
backend: openai
api_key: "sk-local"
qdrant_url: "http://qdrant:6333"
"#
        )
        .unwrap();

        let config = load_config(temp_file.path()).unwrap();

        assert_eq!(config.model_name, "llama3.2");
        assert_eq!(config.temperature, 0.7);
        assert_eq!(config.api_url, "http://gpu-box:11434");
        assert_eq!(config.backend, Backend::Openai);
        assert_eq!(config.api_key.as_deref(), Some("sk-local"));
        assert_eq!(config.qdrant_url, "http://qdrant:6333");
        // Unset fields keep their defaults.
        assert_eq!(config.collection, "askai_questions");
        assert_eq!(config.embedding_dimension, 1024);
        assert_eq!(config.embedding_base(), "http://gpu-box:11434");
    }

    #[test]
    fn test_load_config_invalid_file() {
        let config = load_config(Path::new("non/existent/path"));
        assert!(config.is_err());
    }

    #[test]
    fn test_load_config_invalid_format() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, r#"invalid: config: format"#).unwrap();

        let config = load_config(temp_file.path());
        assert!(config.is_err());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_or_default(&dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(config, AskAiConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut config = AskAiConfig::default();
        config.model_name = "qwen2.5".into();
        config.embedding_url = Some("http://embedder:11434".into());

        save_config(&config, &path).unwrap();
        let loaded = load_config(&path).unwrap();

        assert_eq!(loaded, config);
        assert_eq!(loaded.embedding_base(), "http://embedder:11434");
    }

    #[test]
    fn test_overrides_take_precedence() {
        let mut config = AskAiConfig::default();
        config.apply_overrides(&ConfigOverrides {
            model_name: Some("phi4".into()),
            temperature: Some(5.0),
            qdrant_url: Some("http://other:6333".into()),
            ..Default::default()
        });

        assert_eq!(config.model_name, "phi4");
        assert_eq!(config.temperature, MAX_TEMPERATURE, "clamped");
        assert_eq!(config.qdrant_url, "http://other:6333");
        assert_eq!(config.api_url, "http://localhost:11434", "untouched");
    }

    #[test]
    fn test_adjust_temperature_bounds_and_steps() {
        let mut config = AskAiConfig::default();
        assert_eq!(config.adjust_temperature(TEMPERATURE_STEP), 1.6);
        for _ in 0..10 {
            config.adjust_temperature(TEMPERATURE_STEP);
        }
        assert_eq!(config.temperature, 2.0);

        for _ in 0..30 {
            config.adjust_temperature(-TEMPERATURE_STEP);
        }
        assert_eq!(config.temperature, 0.1);
        assert_eq!(config.adjust_temperature(TEMPERATURE_STEP), 0.2);
    }

    #[test]
    fn test_validate_rejects_zero_dimension() {
        let config = AskAiConfig {
            embedding_dimension: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(AskAiError::Config(_))));
    }
}
