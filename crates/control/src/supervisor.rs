//! Attempt supervisor: owns one logical query from submission to its single
//! terminal outcome, across however many physical attempts that takes.
//!
//! Architecture role: the fleet manager routes every external signal for a
//! query (cancel, resume, inbound data, profile reads) to its supervisor;
//! the supervisor in turn holds the handle of the currently running attempt
//! and consults the re-attempt policy on each failure.
//!
//! Concurrency model:
//! - terminal events from the engine arrive on an unbounded channel and are
//!   applied by one per-query transition task, so a retry decision and a
//!   finalization can never interleave;
//! - the cancel flag is a monotonic atomic, flipped exactly once;
//! - routing entry points take the state lock with a bounded wait so a stuck
//!   transition degrades a single query instead of the calling thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use qf_common::ids::{AttemptId, ExternalId};
use qf_common::metrics::global_metrics;
use qf_common::{QfError, Result};
use qf_engine::{
    AttemptHandle, AttemptOptions, AttemptPlanSummary, AttemptReason, AttemptSpec, AttemptState,
    CancelInfo, DatasetCatalog, DatasetValidity, ExecutionEngine, FailureContext, QueryError,
    QueryObserver, QueryProfile, QueryRequest, QueryResult, QueryState, ResponseSender,
    ResultBatch, TelemetrySink, TerminalEvent, TerminalSender,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::reattempt::{ReattemptContext, ReattemptPolicy};

/// Notified exactly once when a supervised query reaches its terminal state,
/// after the submitter's observer has been told. The fleet uses this to
/// drop the query from its registry.
pub trait CompletionListener: Send + Sync {
    fn completed(&self, external_id: ExternalId);
}

/// Mutable per-query state, guarded by one lock.
struct QuerySlot {
    attempt_id: AttemptId,
    /// Handle of the attempt currently running, if any. Cleared while a
    /// transition (retry decision or finalization) is in flight.
    current: Option<Arc<dyn AttemptHandle>>,
    /// Details captured on the first cancel call.
    cancel: Option<CancelInfo>,
    oom_retries_used: u32,
    /// A non-empty result batch has been forwarded to the client.
    results_sent: bool,
}

enum Transition {
    Reattempt,
    Finalize(QueryResult),
}

pub struct AttemptSupervisor {
    external_id: ExternalId,
    request: QueryRequest,
    base_options: AttemptOptions,
    policy: ReattemptPolicy,
    engine: Arc<dyn ExecutionEngine>,
    catalog: Arc<dyn DatasetCatalog>,
    telemetry: Arc<dyn TelemetrySink>,
    lock_timeout: Duration,
    /// Monotonic: set once by the first cancel call, never cleared.
    canceled: AtomicBool,
    slot: Mutex<QuerySlot>,
    terminal_tx: mpsc::UnboundedSender<TerminalEvent>,
    /// Taken by `start`; present only before the transition task exists.
    terminal_rx: Mutex<Option<mpsc::UnboundedReceiver<TerminalEvent>>>,
}

impl std::fmt::Debug for AttemptSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttemptSupervisor")
            .field("external_id", &self.external_id)
            .field("canceled", &self.canceled.load(Ordering::Relaxed))
            .finish()
    }
}

impl AttemptSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        external_id: ExternalId,
        request: QueryRequest,
        options: AttemptOptions,
        policy: ReattemptPolicy,
        engine: Arc<dyn ExecutionEngine>,
        catalog: Arc<dyn DatasetCatalog>,
        telemetry: Arc<dyn TelemetrySink>,
        lock_timeout: Duration,
    ) -> Arc<Self> {
        let (terminal_tx, terminal_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            external_id,
            request,
            base_options: options,
            policy,
            engine,
            catalog,
            telemetry,
            lock_timeout,
            canceled: AtomicBool::new(false),
            slot: Mutex::new(QuerySlot {
                attempt_id: AttemptId::first(external_id),
                current: None,
                cancel: None,
                oom_retries_used: 0,
                results_sent: false,
            }),
            terminal_tx,
            terminal_rx: Mutex::new(Some(terminal_rx)),
        })
    }

    pub fn external_id(&self) -> ExternalId {
        self.external_id
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Launches attempt 0 and the transition task. Must be called on a tokio
    /// runtime. `observer` receives exactly one `completed` call, even when
    /// the first launch fails; in that case `start` also returns the error so
    /// the submission path can reject synchronously.
    pub fn start(
        self: &Arc<Self>,
        observer: Box<dyn QueryObserver>,
        listener: Arc<dyn CompletionListener>,
    ) -> Result<()> {
        let rx = self.terminal_rx.lock().take().ok_or_else(|| {
            QfError::InvalidConfig(format!("query {} was already started", self.external_id))
        })?;
        observer.attempt_started(AttemptId::first(self.external_id), AttemptReason::None);
        tokio::spawn(Self::run_transitions(
            Arc::clone(self),
            rx,
            observer,
            listener,
        ));

        if let Err(err) = self.launch(AttemptReason::None, DatasetValidity::AllValid) {
            warn!(
                external_id = %self.external_id,
                error = %err,
                operator = "AttemptSupervisorStart",
                "attempt failed before being registered with the engine"
            );
            // The engine started nothing, so no terminal event will ever
            // arrive. Synthesize one so the transition task still delivers
            // exactly one notification.
            let result = self.failed_submission_result(&err);
            self.push_tail_profile(&result);
            TerminalSender::new(self.terminal_tx.clone()).send(TerminalEvent {
                result,
                plan: AttemptPlanSummary::default(),
            });
            return Err(err);
        }
        Ok(())
    }

    fn launch(&self, reason: AttemptReason, validity: DatasetValidity) -> Result<()> {
        let mut slot = self.slot.lock();
        self.launch_locked(&mut slot, reason, validity)
    }

    fn launch_locked(
        &self,
        slot: &mut QuerySlot,
        reason: AttemptReason,
        validity: DatasetValidity,
    ) -> Result<()> {
        let mut options = self.base_options.clone();
        if slot.oom_retries_used > 0 {
            // Every attempt after an OOM failure plans in low-memory mode.
            options.enable_hash_aggregate = false;
        }
        let spec = AttemptSpec {
            attempt_id: slot.attempt_id,
            reason,
            request: self.request.clone(),
            options,
            validity,
            terminal: TerminalSender::new(self.terminal_tx.clone()),
        };
        let handle = self.engine.launch(spec)?;
        // A cancel that raced in while no handle existed must still reach
        // this attempt.
        if self.canceled.load(Ordering::Acquire) {
            let cancel = slot
                .cancel
                .clone()
                .unwrap_or_else(|| CancelInfo::client("query cancelled"));
            handle.cancel(&cancel);
        }
        slot.current = Some(handle);
        Ok(())
    }

    async fn run_transitions(
        supervisor: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<TerminalEvent>,
        observer: Box<dyn QueryObserver>,
        listener: Arc<dyn CompletionListener>,
    ) {
        while let Some(event) = rx.recv().await {
            match supervisor.apply_terminal(event, observer.as_ref()) {
                Transition::Reattempt => continue,
                Transition::Finalize(result) => {
                    info!(
                        external_id = %supervisor.external_id,
                        attempt = result.attempt_id.attempt,
                        state = ?result.state,
                        operator = "AttemptSupervisorFinalize",
                        "query reached terminal state"
                    );
                    observer.completed(result);
                    listener.completed(supervisor.external_id);
                    return;
                }
            }
        }
    }

    /// Applies one terminal event: either schedules a corrected re-attempt
    /// or produces the query's final result. Runs only on the transition
    /// task.
    fn apply_terminal(&self, event: TerminalEvent, observer: &dyn QueryObserver) -> Transition {
        let TerminalEvent { mut result, plan } = event;
        let mut slot = self.slot.lock();
        // Stale-event guard: anything not from the current attempt was
        // already superseded by a retry decision.
        if result.attempt_id != slot.attempt_id {
            debug!(
                attempt_id = %result.attempt_id,
                current = %slot.attempt_id,
                operator = "AttemptSupervisorTransition",
                "ignoring terminal event from a superseded attempt"
            );
            return Transition::Reattempt;
        }
        slot.current = None;

        if result.state == QueryState::Failed {
            if self.canceled.load(Ordering::Acquire) {
                info!(
                    external_id = %self.external_id,
                    operator = "AttemptSupervisorTransition",
                    "not re-attempting, user already cancelled the query"
                );
            } else if let Some(transition) =
                self.try_reattempt(&mut slot, &mut result, plan, observer)
            {
                return transition;
            }
        }

        if let Some(cancel) = slot.cancel.clone() {
            result.cancel = Some(cancel);
        }
        Transition::Finalize(result)
    }

    /// Returns `Some(Transition::Reattempt)` when a corrected attempt was
    /// launched, `None` when the failure is terminal. May rewrite the error
    /// message inside `result` when a discovered schema was recorded.
    fn try_reattempt(
        &self,
        slot: &mut QuerySlot,
        result: &mut QueryResult,
        plan: AttemptPlanSummary,
        observer: &dyn QueryObserver,
    ) -> Option<Transition> {
        let mut query_error = result
            .error
            .clone()
            .unwrap_or_else(|| QueryError::system("query failed without error detail"));

        // Schema recording happens even when the retry is later vetoed (by
        // the results-sent guard, say), so the next submission benefits.
        let schema_recorded = self.record_schema_change(&mut query_error);
        if schema_recorded {
            result.error = Some(query_error.clone());
        }

        let decision = self.policy.classify(&ReattemptContext {
            error: &query_error,
            plan,
            canceled: false,
            schema_recorded,
            oom_retries_used: slot.oom_retries_used,
            results_sent: slot.results_sent,
        });
        if !decision.is_reattempt() {
            return None;
        }
        if decision.reason == AttemptReason::OutOfMemoryLowMemRetry {
            slot.oom_retries_used += 1;
        }
        self.flag_stale_datasets(&decision.validity);

        slot.attempt_id = slot.attempt_id.next();
        // The cancel flag may have flipped since the transition began.
        // Cancellation always wins over a retry decision.
        if self.canceled.load(Ordering::Acquire) {
            info!(
                external_id = %self.external_id,
                operator = "AttemptSupervisorTransition",
                "cancel arrived during the retry decision; finalizing instead"
            );
            return None;
        }
        info!(
            attempt_id = %slot.attempt_id,
            reason = %decision.reason,
            operator = "AttemptSupervisorTransition",
            "starting a new attempt"
        );
        observer.attempt_started(slot.attempt_id, decision.reason);
        match self.launch_locked(slot, decision.reason, decision.validity) {
            Ok(()) => {
                global_metrics().inc_reattempts(decision.reason.as_str());
                Some(Transition::Reattempt)
            }
            Err(launch_err) => {
                // The user sees the original failure; the retry machinery
                // must never mask it with its own error.
                error!(
                    external_id = %self.external_id,
                    error = %launch_err,
                    operator = "AttemptSupervisorTransition",
                    "re-attempt launch failed, finalizing with the original failure (secondary error suppressed)"
                );
                None
            }
        }
    }

    /// Records a schema discovered by a drift failure into the catalog.
    /// Returns true when the write succeeded; only then is a retry safe.
    fn record_schema_change(&self, query_error: &mut QueryError) -> bool {
        let (dataset, new_schema) = match &query_error.context {
            FailureContext::SchemaDrift {
                dataset,
                new_schema,
            } => (dataset.clone(), new_schema.clone()),
            _ => return false,
        };
        match self.catalog.update_dataset_schema(&dataset, &new_schema) {
            Ok(()) => {
                query_error.message = format!(
                    "new schema found for dataset {}; the query will be re-attempted \
                     (multiple attempts may be necessary to fully learn the schema)",
                    dataset.join(".")
                );
                true
            }
            Err(err) => {
                error!(
                    external_id = %self.external_id,
                    error = %err,
                    operator = "AttemptSupervisorTransition",
                    "could not record the discovered schema, not re-attempting"
                );
                false
            }
        }
    }

    /// Best effort: tells the catalog which entries the next attempt will
    /// refuse to trust, so background refresh can start early.
    fn flag_stale_datasets(&self, validity: &DatasetValidity) {
        let DatasetValidity::StalePaths(paths) = validity else {
            return;
        };
        for path in paths {
            if let Err(err) = self.catalog.mark_dataset_invalid(path) {
                warn!(
                    external_id = %self.external_id,
                    dataset = %path.join("."),
                    error = %err,
                    operator = "AttemptSupervisorTransition",
                    "suppressed failure while flagging stale dataset metadata"
                );
            }
        }
    }

    /// Requests cancellation. Idempotent: only the first call carries the
    /// given `cancel` details; later calls are logged and dropped.
    pub fn cancel(&self, cancel: CancelInfo) {
        if self.canceled.swap(true, Ordering::AcqRel) {
            debug!(
                external_id = %self.external_id,
                operator = "AttemptSupervisorCancel",
                "cancel was already requested, ignoring"
            );
            return;
        }
        info!(
            external_id = %self.external_id,
            reason = %cancel.reason,
            client_initiated = cancel.client_initiated,
            connection_closed = cancel.connection_closed,
            operator = "AttemptSupervisorCancel",
            "cancelling query"
        );
        match self.slot.try_lock_for(self.lock_timeout) {
            Some(mut slot) => {
                slot.cancel = Some(cancel.clone());
                if let Some(handle) = &slot.current {
                    handle.cancel(&cancel);
                }
                // No running handle: launch_locked forwards the flag to the
                // next one.
            }
            None => warn!(
                external_id = %self.external_id,
                operator = "AttemptSupervisorCancel",
                "cancel flag set but not forwarded, attempt transition still in progress"
            ),
        }
    }

    /// Resume signal for a paused attempt. Dropped when no attempt is
    /// running.
    pub fn resume(&self) {
        let Some(slot) = self.slot.try_lock_for(self.lock_timeout) else {
            warn!(
                external_id = %self.external_id,
                operator = "AttemptSupervisorResume",
                "resume dropped, attempt transition still in progress"
            );
            return;
        };
        if let Some(handle) = &slot.current {
            handle.resume();
        }
    }

    /// Routes an inbound result batch to the running attempt. The sender is
    /// always answered exactly once: by the attempt on success, or with a
    /// failure ack here when the query is between attempts or already gone.
    pub fn data_arrived(&self, batch: ResultBatch, sender: ResponseSender) {
        let handle = {
            let Some(mut slot) = self.slot.try_lock_for(self.lock_timeout) else {
                sender.fail("query state unavailable, attempt transition in progress");
                return;
            };
            match &slot.current {
                Some(handle) => {
                    let handle = Arc::clone(handle);
                    if !batch.is_empty() {
                        slot.results_sent = true;
                    }
                    handle
                }
                None => {
                    debug!(
                        external_id = %self.external_id,
                        operator = "AttemptSupervisorData",
                        "dropping data batch, no attempt is running"
                    );
                    sender.fail("query already terminated");
                    return;
                }
            }
        };
        // Forwarded outside the lock; the attempt may block on flow control.
        handle.data_arrived(batch, sender);
    }

    /// State of the running attempt, if one is running.
    pub fn attempt_state(&self) -> Option<AttemptState> {
        let slot = self.slot.try_lock_for(self.lock_timeout)?;
        slot.current.as_ref().map(|handle| handle.state())
    }

    /// Snapshot of the running attempt's profile. None while the attempt is
    /// in a phase where reading the profile is unsafe, or between attempts.
    pub fn current_profile(&self) -> Option<QueryProfile> {
        let slot = self.slot.try_lock_for(self.lock_timeout)?;
        let handle = slot.current.as_ref()?;
        if handle.state().profile_observable() {
            handle.profile()
        } else {
            None
        }
    }

    /// Attempt id the supervisor is currently on. Diagnostics only.
    pub fn current_attempt(&self) -> AttemptId {
        self.slot.lock().attempt_id
    }

    fn failed_submission_result(&self, err: &QfError) -> QueryResult {
        let attempt_id = AttemptId::first(self.external_id);
        let message = format!("failure while submitting the query: {err}");
        let now = now_ms();
        let profile = QueryProfile {
            attempt_id,
            state: AttemptState::Failed,
            query: self.request.description.clone(),
            start_ms: now,
            end_ms: Some(now),
            error: Some(message.clone()),
        };
        QueryResult::failed(attempt_id, QueryError::system(message), Some(profile))
    }

    /// Pushes the profile of a query that died before the engine saw it.
    /// Running attempts report their own tail profiles through the engine.
    fn push_tail_profile(&self, result: &QueryResult) {
        let Some(profile) = result.profile.clone() else {
            return;
        };
        let attempt_id = result.attempt_id;
        let telemetry = Arc::clone(&self.telemetry);
        tokio::spawn(async move {
            if let Err(err) = telemetry.persist_profile(attempt_id, profile).await {
                global_metrics().inc_profile_send_failures(&attempt_id.external.to_string());
                warn!(
                    attempt_id = %attempt_id,
                    error = %err,
                    operator = "AttemptSupervisorTelemetry",
                    "suppressed failure while reporting a failed submission"
                );
            }
        });
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;
