use thiserror::Error;

/// Localizer error types
///
/// Only storage, configuration and setup paths return these. The positioning
/// loop never surfaces an error; it logs and skips the cycle instead.
#[derive(Error, Debug)]
pub enum LocalizerError {
    #[error("Fingerprint root not found: {0}")]
    MissingRoot(String),

    #[error("Invalid map name pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Malformed data: {0}")]
    Format(#[from] serde_json::Error),

    #[error("Reload cancelled")]
    ReloadCancelled,

    #[error("No scan data to save")]
    EmptyScan,

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for localizer operations
pub type LResult<T> = Result<T, LocalizerError>;
