// Storefront error type

use assoc_types::AssocError;

use crate::config::ConfigError;

/// Result type alias
pub type Result<T> = std::result::Result<T, StorefrontError>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum StorefrontError {
    #[error(transparent)]
    Assoc(#[from] AssocError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Listing task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Not found: {0}")]
    NotFound(String),
}
