//! Execution-engine collaborator contracts.
//!
//! The coordination core treats planning and execution as one opaque service:
//! "plan and run this attempt, then emit exactly one terminal event".

use std::fmt::Debug;
use std::sync::Arc;

use qf_common::ids::AttemptId;
use qf_common::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::request::QueryRequest;
use crate::result::{
    AttemptReason, AttemptState, CancelInfo, DatasetValidity, QueryProfile, QueryResult,
};
use crate::transport::{ResponseSender, ResultBatch};

/// Per-attempt planner/executor options adjusted between attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptOptions {
    /// Allows hash-based aggregation in the physical plan.
    ///
    /// Cleared for low-memory re-attempts after an out-of-memory failure.
    pub enable_hash_aggregate: bool,
}

impl Default for AttemptOptions {
    fn default() -> Self {
        Self {
            enable_hash_aggregate: true,
        }
    }
}

/// Summary of a finished attempt's physical plan, reported alongside the
/// terminal result and consumed by the re-attempt policy.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AttemptPlanSummary {
    /// The physical plan contained a hash-based aggregation.
    pub used_hash_aggregate: bool,
}

/// Single terminal notification produced by the engine for one attempt.
#[derive(Debug)]
pub struct TerminalEvent {
    pub result: QueryResult,
    pub plan: AttemptPlanSummary,
}

/// Sender half handed to the engine inside an [`AttemptSpec`].
///
/// The engine must deliver exactly one event per attempt through it.
#[derive(Clone, Debug)]
pub struct TerminalSender {
    tx: mpsc::UnboundedSender<TerminalEvent>,
}

impl TerminalSender {
    pub fn new(tx: mpsc::UnboundedSender<TerminalEvent>) -> Self {
        Self { tx }
    }

    pub fn send(&self, event: TerminalEvent) {
        if let Err(err) = self.tx.send(event) {
            debug!(
                attempt_id = %err.0.result.attempt_id,
                operator = "TerminalSender",
                "terminal event dropped; supervisor already finalized"
            );
        }
    }
}

/// Everything the engine needs to plan and run one attempt.
#[derive(Debug)]
pub struct AttemptSpec {
    pub attempt_id: AttemptId,
    /// Why this attempt exists; `None` for attempt 0.
    pub reason: AttemptReason,
    pub request: QueryRequest,
    pub options: AttemptOptions,
    /// Datasets whose cached metadata must be refreshed during planning.
    pub validity: DatasetValidity,
    pub terminal: TerminalSender,
}

/// Plans and executes query attempts.
pub trait ExecutionEngine: Send + Sync + Debug {
    /// Constructs and starts one attempt.
    ///
    /// On `Ok` the engine owns the attempt and must emit exactly one
    /// [`TerminalEvent`] through `spec.terminal`, whatever happens later. On
    /// `Err` nothing was started and no event will be emitted.
    fn launch(&self, spec: AttemptSpec) -> Result<Arc<dyn AttemptHandle>>;
}

/// Live attempt owned by the execution engine.
pub trait AttemptHandle: Send + Sync + Debug {
    /// Cooperatively requests the attempt to stop. Does not kill threads.
    fn cancel(&self, cancel: &CancelInfo);

    /// Resumes an attempt paused on admission/backpressure.
    fn resume(&self);

    fn state(&self) -> AttemptState;

    /// Progress snapshot; engine-owned and unavailable once the attempt is
    /// torn down.
    fn profile(&self) -> Option<QueryProfile>;

    /// Routes an inbound result batch into the attempt. Must answer `sender`
    /// exactly once.
    fn data_arrived(&self, batch: ResultBatch, sender: ResponseSender);
}
