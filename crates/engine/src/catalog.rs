//! Metadata/catalog collaborator, consumed only by re-attempt recovery.

use std::fmt::Debug;

use qf_common::Result;
use serde::{Deserialize, Serialize};

/// Discovered schema for a dataset.
///
/// Opaque to the coordination core; produced by the execution engine and
/// round-tripped into the catalog unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub payload: Vec<u8>,
}

impl SchemaDescriptor {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
        }
    }
}

/// Metadata/catalog service.
///
/// Calls are blocking client calls; both are best-effort recovery actions and
/// never sit on a hot path.
pub trait DatasetCatalog: Send + Sync + Debug {
    /// Durably records a newly discovered schema against a dataset.
    fn update_dataset_schema(&self, path: &[String], schema: &SchemaDescriptor) -> Result<()>;

    /// Flags a dataset's cached metadata as stale so the next planning pass
    /// refreshes it.
    fn mark_dataset_invalid(&self, path: &[String]) -> Result<()>;
}
