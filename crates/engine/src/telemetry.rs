//! Telemetry collaborator for query-profile reporting.

use std::fmt::Debug;

use futures::future::BoxFuture;
use qf_common::ids::AttemptId;
use qf_common::Result;

use crate::result::QueryProfile;

/// Persists query profiles out of process.
///
/// Strictly best effort: failures are logged and counted by callers, never
/// propagated into query processing.
pub trait TelemetrySink: Send + Sync + Debug {
    fn persist_profile(
        &self,
        attempt_id: AttemptId,
        profile: QueryProfile,
    ) -> BoxFuture<'_, Result<()>>;
}
