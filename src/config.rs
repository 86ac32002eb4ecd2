// Ledger configuration
// Loaded from TOML; every field has a default so an empty file is valid.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use crate::error::{LedgerError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Default collation for `name_pattern` matching (false = case-insensitive)
    pub case_sensitive_names: bool,

    /// Transaction rows fetched per aggregation chunk
    pub aggregation_chunk_size: usize,

    /// Run `PRAGMA quick_check` on every opened image
    pub verify_integrity: bool,

    /// File name used when the store image is exported
    pub export_file_name: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            case_sensitive_names: false,
            aggregation_chunk_size: 500,
            verify_integrity: true,
            export_file_name: "sql.db".to_string(),
        }
    }
}

impl LedgerConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: LedgerConfig =
            toml::from_str(text).map_err(|e| LedgerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(LedgerConfig::default());
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.aggregation_chunk_size == 0 {
            return Err(LedgerError::Config(
                "aggregation_chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.export_file_name.trim().is_empty() {
            return Err(LedgerError::Config(
                "export_file_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.aggregation_chunk_size = chunk_size;
        self
    }

    pub fn with_case_sensitive_names(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive_names = case_sensitive;
        self
    }
}
