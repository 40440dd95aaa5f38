//! cpm.yml: the small flat key-value descriptor shipped with every packet.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{CpmError, Result};

/// Flat descriptor for humans and metadata-only tooling. List-valued fields
/// (tags, entrypoints) are CSV strings to keep the file one-key-per-line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CpmYaml {
    pub cpm_schema: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub tags: String,
    pub entrypoints: String,
    pub embedding_model: String,
    pub embedding_dim: u32,
    pub embedding_normalized: bool,
    /// RFC 3339 UTC, sourced from the builder's clock.
    pub created_at: String,
}

impl CpmYaml {
    pub fn new(
        name: &str,
        version: &str,
        description: &str,
        tags: &[String],
        entrypoints: &[String],
        embedding_model: &str,
        embedding_dim: u32,
        embedding_normalized: bool,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            cpm_schema: "1.0".to_string(),
            name: name.to_string(),
            version: version.to_string(),
            description: description.to_string(),
            tags: tags.join(","),
            entrypoints: entrypoints.join(","),
            embedding_model: embedding_model.to_string(),
            embedding_dim,
            embedding_normalized,
            created_at: created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

/// Write cpm.yml. Field order follows the struct, one key per line.
pub fn write_cpm_yaml(path: &Path, meta: &CpmYaml) -> Result<()> {
    let yaml = serde_yaml_ng::to_string(meta)
        .map_err(|e| CpmError::Parse(format!("failed to serialize cpm.yml: {}", e)))?;
    std::fs::write(path, yaml.as_bytes())?;
    Ok(())
}

/// Read cpm.yml.
pub fn read_cpm_yaml(path: &Path) -> Result<CpmYaml> {
    let content = std::fs::read_to_string(path)?;
    serde_yaml_ng::from_str(&content)
        .map_err(|e| CpmError::Parse(format!("invalid cpm.yml {}: {}", path.display(), e)))
}
