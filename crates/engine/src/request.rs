use serde::{Deserialize, Serialize};

/// Submitted query request as seen by the coordination core.
///
/// The SQL text itself is opaque here; planning happens behind the
/// [`ExecutionEngine`](crate::engine::ExecutionEngine) seam.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Human-readable description (SQL text or job label) used in profiles and logs.
    pub description: String,
    /// Runs startup on the calling thread instead of the submission pool.
    ///
    /// Internal/test-only escape hatch: it bypasses the pool and changes
    /// backpressure behavior under load. General-purpose submission paths
    /// must leave this false.
    pub run_in_same_thread: bool,
}

impl QueryRequest {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            run_in_same_thread: false,
        }
    }

    /// Marks the request for same-thread startup.
    pub fn in_same_thread(mut self) -> Self {
        self.run_in_same_thread = true;
        self
    }
}
