use thiserror::Error;

/// Errors raised while loading or validating a [`crate::TrainingConfig`].
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid value for '{field}': {message}")]
    Invalid { field: &'static str, message: String },
}
