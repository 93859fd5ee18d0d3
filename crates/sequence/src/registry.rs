//! Versioned sequence registry.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;

use crate::dag::{DagError, validate_dag};
use crate::definition::SequenceDefinition;

/// Read side used by the scheduler; write side used by configuration.
pub trait SequenceRegistry: Send + Sync {
    /// Publish a new sequence version. The DAG is validated here; a
    /// `(key, version)` pair can be published exactly once.
    fn publish(&self, definition: SequenceDefinition) -> Result<(), RegistryError>;

    /// A specific published version.
    fn get(&self, sequence_key: &str, version: u32) -> Result<Arc<SequenceDefinition>, RegistryError>;

    /// The highest published version for a key.
    fn latest(&self, sequence_key: &str) -> Result<Arc<SequenceDefinition>, RegistryError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("sequence not found: {0}")]
    NotFound(String),
    #[error("sequence {key} version {version} already published")]
    AlreadyPublished { key: String, version: u32 },
    #[error("invalid sequence definition: {0}")]
    InvalidDag(#[from] DagError),
    #[error("storage error: {0}")]
    Storage(String),
}

/// In-memory registry. Published definitions are shared as `Arc` so many
/// running jobs can pin one version without copying it.
#[derive(Debug, Default)]
pub struct InMemorySequenceRegistry {
    versions: RwLock<HashMap<String, Vec<Arc<SequenceDefinition>>>>,
}

impl InMemorySequenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SequenceRegistry for InMemorySequenceRegistry {
    fn publish(&self, definition: SequenceDefinition) -> Result<(), RegistryError> {
        validate_dag(&definition.steps)?;

        let mut versions = self
            .versions
            .write()
            .map_err(|e| RegistryError::Storage(e.to_string()))?;

        let entry = versions.entry(definition.sequence_key.clone()).or_default();
        if entry.iter().any(|d| d.version == definition.version) {
            return Err(RegistryError::AlreadyPublished {
                key: definition.sequence_key,
                version: definition.version,
            });
        }

        entry.push(Arc::new(definition));
        entry.sort_by_key(|d| d.version);
        Ok(())
    }

    fn get(
        &self,
        sequence_key: &str,
        version: u32,
    ) -> Result<Arc<SequenceDefinition>, RegistryError> {
        let versions = self
            .versions
            .read()
            .map_err(|e| RegistryError::Storage(e.to_string()))?;

        versions
            .get(sequence_key)
            .and_then(|v| v.iter().find(|d| d.version == version))
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(format!("{sequence_key}@v{version}")))
    }

    fn latest(&self, sequence_key: &str) -> Result<Arc<SequenceDefinition>, RegistryError> {
        let versions = self
            .versions
            .read()
            .map_err(|e| RegistryError::Storage(e.to_string()))?;

        versions
            .get(sequence_key)
            .and_then(|v| v.last())
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(sequence_key.to_string()))
    }
}
