//! Error types for buildwatch
//!
//! Centralized error handling using thiserror. Per-request provider failures
//! live in [`crate::provider::ProviderError`] and never surface through here.

use thiserror::Error;

/// All error types that can escape a buildwatch operation
#[derive(Debug, Error)]
pub enum BuildWatchError {
    /// Provider name not configured
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    /// Settings could not be loaded or saved
    #[error("Settings error: {0}")]
    Settings(String),

    /// A sweep task died instead of completing
    #[error("Sweep failed: {0}")]
    Sweep(String),

    /// HTTP client could not be constructed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type alias for buildwatch operations
pub type Result<T> = std::result::Result<T, BuildWatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_provider_error() {
        let err = BuildWatchError::UnknownProvider("gitlab".to_string());
        assert_eq!(err.to_string(), "Unknown provider: gitlab");
    }

    #[test]
    fn test_settings_error() {
        let err = BuildWatchError::Settings("file locked".to_string());
        assert_eq!(err.to_string(), "Settings error: file locked");
    }

    #[test]
    fn test_sweep_error() {
        let err = BuildWatchError::Sweep("task panicked".to_string());
        assert_eq!(err.to_string(), "Sweep failed: task panicked");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: BuildWatchError = io_err.into();
        assert!(matches!(err, BuildWatchError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_yaml_error_conversion() {
        let yaml_err = serde_yaml::from_str::<Vec<u32>>("{not: a list").unwrap_err();
        let err: BuildWatchError = yaml_err.into();
        assert!(matches!(err, BuildWatchError::Yaml(_)));
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }

        fn returns_err() -> Result<i32> {
            Err(BuildWatchError::Sweep("test".to_string()))
        }

        assert!(returns_ok().is_ok());
        assert!(returns_err().is_err());
    }
}
