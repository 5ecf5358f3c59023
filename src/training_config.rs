//! Training hyper-parameters and engine limits, loadable from JSON.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::arena::ArenaLimits;
use crate::errors::ConfigError;

/// Step size of the gradient descent update.
pub const DEFAULT_LEARNING_RATE: f32 = 0.5;
pub const DEFAULT_SEED: u64 = 0x5EED;

/// Configuration of a [`crate::Network`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub learning_rate: f32,
    /// Seeds weight initialization and the dropout mask draws.
    pub seed: u64,
    /// Largest number of elements any single arena may hold.
    pub max_arena_elements: usize,
    /// Multiplies the `1 / sqrt(fan_in)` bound of the uniform weight init.
    pub weight_init_scale: f32,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: DEFAULT_LEARNING_RATE,
            seed: DEFAULT_SEED,
            max_arena_elements: ArenaLimits::default().max_arena_elements,
            weight_init_scale: 1.0,
        }
    }
}

impl TrainingConfig {
    /// Loads a JSON configuration, falling back to the defaults when the file does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config: Self = match fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
                path: path.display().to_string(),
                source: e,
            })?,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(
                    "Config file '{}' not found, using default training configuration",
                    path.display()
                );
                Self::default()
            }
            Err(e) => {
                return Err(ConfigError::Io {
                    path: path.display().to_string(),
                    source: e,
                });
            }
        };
        config.validate()?;
        info!("Loaded training configuration from '{}'", path.display());
        Ok(config)
    }

    pub fn with_learning_rate(mut self, learning_rate: f32) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_max_arena_elements(mut self, max_arena_elements: usize) -> Self {
        self.max_arena_elements = max_arena_elements;
        self
    }

    pub fn arena_limits(&self) -> ArenaLimits {
        ArenaLimits::new(self.max_arena_elements)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "learning_rate",
                message: format!("must be a positive finite number, got {}", self.learning_rate),
            });
        }
        if !self.weight_init_scale.is_finite() || self.weight_init_scale <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "weight_init_scale",
                message: format!(
                    "must be a positive finite number, got {}",
                    self.weight_init_scale
                ),
            });
        }
        if self.max_arena_elements == 0 {
            return Err(ConfigError::Invalid {
                field: "max_arena_elements",
                message: "must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = TrainingConfig::load("does/not/exist.json").unwrap();
        assert_eq!(config, TrainingConfig::default());
        assert_eq!(config.learning_rate, 0.5);
    }

    #[test]
    fn test_partial_json_keeps_other_defaults() {
        let config: TrainingConfig = serde_json::from_str(r#"{"learning_rate": 0.1}"#).unwrap();
        assert_eq!(config.learning_rate, 0.1);
        assert_eq!(config.seed, DEFAULT_SEED);
    }

    #[test]
    fn test_validate_rejects_bad_learning_rate() {
        let config = TrainingConfig::default().with_learning_rate(-1.0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "learning_rate",
                ..
            })
        ));
        assert!(TrainingConfig::default()
            .with_learning_rate(f32::NAN)
            .validate()
            .is_err());
    }

    #[test]
    fn test_malformed_file_is_a_parse_error() {
        let path = std::env::temp_dir().join("arena_cnn_malformed_config.json");
        fs::write(&path, "{ learning_rate: ").unwrap();
        let result = TrainingConfig::load(&path);
        fs::remove_file(&path).unwrap();
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }
}
