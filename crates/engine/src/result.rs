//! Terminal results, failure contexts, and attempt-visible states.

use std::collections::HashSet;
use std::fmt;

use qf_common::ids::AttemptId;
use serde::{Deserialize, Serialize};

use crate::catalog::SchemaDescriptor;

/// Path identifying a dataset in the catalog.
pub type DatasetPath = Vec<String>;

/// Terminal state of one query attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryState {
    Completed,
    Failed,
    Canceled,
}

/// Observable state of a live attempt, as reported by the execution engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptState {
    Starting,
    Enqueued,
    Running,
    Canceled,
    Completed,
    Failed,
}

impl AttemptState {
    /// Attempt profiles are engine-owned and must not be read once the
    /// attempt object is torn down; only these states are observable.
    pub fn profile_observable(&self) -> bool {
        matches!(
            self,
            AttemptState::Starting
                | AttemptState::Enqueued
                | AttemptState::Running
                | AttemptState::Canceled
        )
    }
}

/// Cause of a failure-driven re-attempt. [`AttemptReason::None`] is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptReason {
    None,
    SchemaLearned,
    InvalidDatasetMetadata,
    OutOfMemoryLowMemRetry,
}

impl AttemptReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptReason::None => "none",
            AttemptReason::SchemaLearned => "schema_learned",
            AttemptReason::InvalidDatasetMetadata => "invalid_dataset_metadata",
            AttemptReason::OutOfMemoryLowMemRetry => "out_of_memory_low_mem_retry",
        }
    }
}

impl fmt::Display for AttemptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured failure context attached to a failed attempt.
///
/// A tagged union instead of error-type reflection so the re-attempt policy
/// can dispatch by exhaustive match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureContext {
    /// The dataset's schema changed underneath the running attempt; the
    /// engine discovered the new schema while scanning.
    SchemaDrift {
        dataset: DatasetPath,
        new_schema: SchemaDescriptor,
    },
    /// Cached metadata for these datasets turned out stale/invalid.
    InvalidMetadata { paths: Vec<DatasetPath> },
    /// The attempt ran out of memory.
    OutOfMemory,
    /// Admission control rejected the query before any attempt ran.
    ResourceExhausted,
    /// Anything else.
    Other,
}

/// Structured error carried by a failed attempt's terminal result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryError {
    pub message: String,
    pub context: FailureContext,
}

impl QueryError {
    pub fn system(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            context: FailureContext::Other,
        }
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            context: FailureContext::ResourceExhausted,
        }
    }
}

/// Cancellation details captured on the first cancel call for a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelInfo {
    /// Description of the cancellation shown to the user.
    pub reason: String,
    /// The client application explicitly issued the cancellation.
    pub client_initiated: bool,
    /// The query exceeded its max allowed runtime.
    pub runtime_exceeded: bool,
    /// The client connection closed; cancellation was implicit.
    pub connection_closed: bool,
}

impl CancelInfo {
    pub fn client(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            client_initiated: true,
            runtime_exceeded: false,
            connection_closed: false,
        }
    }

    pub fn runtime_exceeded(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            client_initiated: false,
            runtime_exceeded: true,
            connection_closed: false,
        }
    }

    pub fn connection_closed() -> Self {
        Self {
            reason: "connection closed".to_string(),
            client_initiated: false,
            runtime_exceeded: false,
            connection_closed: true,
        }
    }
}

/// Point-in-time snapshot of an attempt's progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryProfile {
    pub attempt_id: AttemptId,
    pub state: AttemptState,
    /// Query description as submitted.
    pub query: String,
    pub start_ms: u64,
    pub end_ms: Option<u64>,
    pub error: Option<String>,
}

/// Terminal outcome of one attempt. Produced exactly once per attempt by the
/// execution engine; the supervisor of the final attempt delivers it to the
/// submitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub attempt_id: AttemptId,
    pub state: QueryState,
    pub error: Option<QueryError>,
    pub profile: Option<QueryProfile>,
    /// Filled in by the supervisor when the query was cancelled.
    pub cancel: Option<CancelInfo>,
}

impl QueryResult {
    pub fn completed(attempt_id: AttemptId, profile: Option<QueryProfile>) -> Self {
        Self {
            attempt_id,
            state: QueryState::Completed,
            error: None,
            profile,
            cancel: None,
        }
    }

    pub fn failed(attempt_id: AttemptId, error: QueryError, profile: Option<QueryProfile>) -> Self {
        Self {
            attempt_id,
            state: QueryState::Failed,
            error: Some(error),
            profile,
            cancel: None,
        }
    }

    pub fn canceled(attempt_id: AttemptId, profile: Option<QueryProfile>) -> Self {
        Self {
            attempt_id,
            state: QueryState::Canceled,
            error: None,
            profile,
            cancel: None,
        }
    }
}

/// Dataset-validity predicate applied by the next attempt's planning phase.
///
/// Carried as a cloneable tagged value rather than a boxed closure so it can
/// be compared in tests and serialized across the planner seam.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatasetValidity {
    /// Every cached catalog entry may be trusted.
    AllValid,
    /// Datasets at these paths must be treated as stale and refreshed.
    StalePaths(HashSet<DatasetPath>),
}

impl DatasetValidity {
    pub fn stale(paths: impl IntoIterator<Item = DatasetPath>) -> Self {
        DatasetValidity::StalePaths(paths.into_iter().collect())
    }

    pub fn is_valid(&self, path: &[String]) -> bool {
        match self {
            DatasetValidity::AllValid => true,
            DatasetValidity::StalePaths(stale) => !stale.contains(path),
        }
    }
}
