//! Storefront Configuration
//!
//! Loaded from `storefront.toml`. Every section has defaults, so a missing
//! file or an empty one yields a working setup.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration file (storefront.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorefrontConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub listing: ListingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the database file
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/storefront.redb")
}

/// Listing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingConfig {
    /// Rows per admin listing page
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Ceiling on owner ids per aggregate call
    #[serde(default = "default_max_aggregate_batch")]
    pub max_aggregate_batch: usize,
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            max_aggregate_batch: default_max_aggregate_batch(),
        }
    }
}

fn default_page_size() -> usize {
    25
}

fn default_max_aggregate_batch() -> usize {
    assoc_store::aggregate::DEFAULT_MAX_BATCH
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directives, overridden by `RUST_LOG`
    #[serde(default = "default_filter")]
    pub filter: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            format: LogFormat::default(),
        }
    }
}

fn default_filter() -> String {
    "storefront=info,assoc_store=info".to_string()
}

impl StorefrontConfig {
    /// Load from a file, falling back to defaults when it does not exist
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Ok(Self::load_file(path)?.unwrap_or_default())
    }

    /// Load from a file; `None` when there is no file
    ///
    /// Nothing is logged here, since configuration is read before logging
    /// is set up.
    pub fn load_file(path: impl AsRef<Path>) -> Result<Option<Self>, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(path)?;
        Ok(Some(Self::parse(&content)?))
    }

    /// Parse and validate TOML content
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let listing = &self.listing;
        if listing.page_size == 0 {
            return Err(ConfigError::Invalid("listing.page_size must be positive".into()));
        }
        // A full page must fit in one aggregate call
        if listing.page_size > listing.max_aggregate_batch {
            return Err(ConfigError::Invalid(format!(
                "listing.page_size ({}) exceeds listing.max_aggregate_batch ({})",
                listing.page_size, listing.max_aggregate_batch
            )));
        }
        Ok(())
    }
}
