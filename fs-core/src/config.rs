//! Mount and format configuration

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{FsError, Result};

/// Options applied when mounting a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    /// Entries kept by the LRU block cache; 0 disables it
    pub cache_capacity: usize,
    /// Reject every mutating operation
    pub read_only: bool,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 16,
            read_only: false,
        }
    }
}

impl FsConfig {
    /// Load a configuration from a JSON file; missing fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        serde_json::from_str(&text).map_err(|e| {
            FsError::InvalidArgument(format!("bad config {}: {}", path.as_ref().display(), e))
        })
    }
}

/// Content of the welcome file laid down by the formatter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatOptions {
    pub welcome_name: String,
    pub welcome_body: String,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            welcome_name: "README.txt".to_string(),
            welcome_body: "Hello world, greetings from a flatfs filesystem.\n".to_string(),
        }
    }
}
