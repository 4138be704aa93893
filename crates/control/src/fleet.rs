//! Fleet manager: the registry of every query this coordinator is running,
//! and the routing layer in front of it.
//!
//! Architecture role: owns admission control and the `ExternalId` to
//! supervisor map. Transport and admin surfaces talk to the fleet; the fleet
//! finds (or refuses to find) the supervisor and delegates. A background
//! task pushes a profile snapshot of every live query to the telemetry sink
//! on a fixed interval.
//!
//! Registry discipline:
//! - supervisors are registered before their first attempt launches, so a
//!   cancel or data batch arriving mid-startup still finds its query;
//! - entries are removed only by the supervisor's completion callback (or
//!   the `force_remove` escape hatch), so a registered query is always
//!   eventually retired exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use qf_common::config::FleetConfig;
use qf_common::ids::ExternalId;
use qf_common::metrics::global_metrics;
use qf_common::{QfError, Result};
use qf_engine::{
    AttemptOptions, CancelInfo, DatasetCatalog, ExecutionEngine, QueryObserver, QueryProfile,
    QueryRequest, ResponseSender, ResultBatch, ResultForwarder, TelemetrySink,
    TerminationRegistry,
};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::reattempt::ReattemptPolicy;
use crate::supervisor::{AttemptSupervisor, CompletionListener};

struct QueryEntry {
    supervisor: Arc<AttemptSupervisor>,
    /// Task watching the submitting connection; aborted when the query is
    /// retired.
    close_watch: Option<JoinHandle<()>>,
}

pub struct FleetManager {
    config: FleetConfig,
    policy: ReattemptPolicy,
    engine: Arc<dyn ExecutionEngine>,
    catalog: Arc<dyn DatasetCatalog>,
    telemetry: Arc<dyn TelemetrySink>,
    /// Peer delivery for batches belonging to queries this coordinator does
    /// not know (multi-coordinator deployments).
    forwarder: Option<Arc<dyn ResultForwarder>>,
    queries: DashMap<ExternalId, QueryEntry>,
    accepting: AtomicBool,
    started: AtomicBool,
    /// Signalled whenever the registry becomes empty.
    drained: Notify,
    profile_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for FleetManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetManager")
            .field("active", &self.queries.len())
            .field("accepting", &self.accepting.load(Ordering::Relaxed))
            .finish()
    }
}

impl FleetManager {
    pub fn new(
        config: FleetConfig,
        engine: Arc<dyn ExecutionEngine>,
        catalog: Arc<dyn DatasetCatalog>,
        telemetry: Arc<dyn TelemetrySink>,
        forwarder: Option<Arc<dyn ResultForwarder>>,
    ) -> Result<Arc<Self>> {
        if config.max_active_queries == 0 {
            return Err(QfError::InvalidConfig(
                "max_active_queries must be at least 1".to_string(),
            ));
        }
        if config.profile_send_interval_ms == 0 {
            return Err(QfError::InvalidConfig(
                "profile_send_interval_ms must be positive".to_string(),
            ));
        }
        let policy = ReattemptPolicy::from_config(&config);
        Ok(Arc::new(Self {
            config,
            policy,
            engine,
            catalog,
            telemetry,
            forwarder,
            queries: DashMap::new(),
            accepting: AtomicBool::new(true),
            started: AtomicBool::new(false),
            drained: Notify::new(),
            profile_task: Mutex::new(None),
        }))
    }

    /// Brings the fleet online. Must be called on a tokio runtime; starts
    /// the periodic profile broadcast.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(QfError::InvalidConfig("fleet already started".to_string()));
        }
        let fleet = Arc::downgrade(self);
        let interval_ms = self.config.profile_send_interval_ms;
        *self.profile_task.lock() = Some(tokio::spawn(Self::broadcast_profiles(
            fleet,
            interval_ms,
        )));
        info!(
            max_active_queries = self.config.max_active_queries,
            operator = "FleetStart",
            "fleet manager online"
        );
        Ok(())
    }

    /// Takes the fleet offline: no new queries, no more profile broadcasts.
    /// Running queries are left to finish; pair with [`wait_to_exit`].
    ///
    /// [`wait_to_exit`]: FleetManager::wait_to_exit
    pub fn shutdown(&self) {
        self.stop_accepting();
        if let Some(task) = self.profile_task.lock().take() {
            task.abort();
        }
    }

    /// Submits a query under `external_id`.
    ///
    /// On `Ok` the query is registered and the observer will receive exactly
    /// one `completed` call, even when the first attempt fails to launch.
    /// On `Err` the query was never registered and the observer was dropped
    /// without notification: the fleet is offline, admission turned the
    /// query away, or the id is already taken.
    pub fn submit(
        self: &Arc<Self>,
        external_id: ExternalId,
        request: QueryRequest,
        options: AttemptOptions,
        observer: Box<dyn QueryObserver>,
        termination: TerminationRegistry,
    ) -> Result<()> {
        if !self.started.load(Ordering::Acquire) {
            return Err(QfError::InvalidConfig(
                "fleet manager is not started".to_string(),
            ));
        }
        if !self.can_accept() {
            global_metrics().inc_submissions("rejected");
            info!(
                external_id = %external_id,
                active = self.queries.len(),
                operator = "FleetSubmit",
                "query rejected, coordinator is not accepting work"
            );
            return Err(QfError::Rejected(
                "coordinator is not accepting new queries".to_string(),
            ));
        }

        let same_thread = request.run_in_same_thread;
        let supervisor = AttemptSupervisor::new(
            external_id,
            request,
            options,
            self.policy.clone(),
            Arc::clone(&self.engine),
            Arc::clone(&self.catalog),
            Arc::clone(&self.telemetry),
            Duration::from_millis(self.config.transition_lock_timeout_ms),
        );

        // Registered before the first attempt launches. The watch handle
        // goes in with the entry itself, so a query can never retire while
        // its watch is still unrecorded.
        match self.queries.entry(external_id) {
            Entry::Occupied(_) => {
                global_metrics().inc_submissions("duplicate");
                return Err(QfError::InvalidConfig(format!(
                    "query {external_id} is already registered"
                )));
            }
            Entry::Vacant(slot) => {
                let close_watch = if termination.is_watching() {
                    let fleet = Arc::downgrade(self);
                    Some(tokio::spawn(async move {
                        termination.closed().await;
                        if let Some(fleet) = fleet.upgrade() {
                            fleet.connection_closed(external_id);
                        }
                    }))
                } else {
                    None
                };
                slot.insert(QueryEntry {
                    supervisor: Arc::clone(&supervisor),
                    close_watch,
                });
            }
        }
        global_metrics().inc_submissions("accepted");
        global_metrics().set_active_queries(self.queries.len() as u64);

        let listener: Arc<dyn CompletionListener> = Arc::new(FleetCompletion {
            fleet: Arc::downgrade(self),
        });
        if same_thread {
            // Startup on the calling thread, for tools that need the first
            // attempt launched before submit returns.
            if let Err(err) = supervisor.start(observer, listener) {
                debug!(
                    external_id = %external_id,
                    error = %err,
                    operator = "FleetSubmit",
                    "first attempt failed at launch, result delivered through the observer"
                );
            }
        } else {
            tokio::spawn(async move {
                if let Err(err) = supervisor.start(observer, listener) {
                    debug!(
                        external_id = %external_id,
                        error = %err,
                        operator = "FleetSubmit",
                        "first attempt failed at launch, result delivered through the observer"
                    );
                }
            });
        }
        Ok(())
    }

    /// Routes a cancellation to the query's supervisor. Returns false when
    /// the query is unknown (never registered, or already retired).
    pub fn cancel_query(&self, external_id: ExternalId, cancel: CancelInfo) -> bool {
        let Some(supervisor) = self.supervisor_of(external_id) else {
            debug!(
                external_id = %external_id,
                operator = "FleetCancel",
                "cancel for unknown query ignored"
            );
            return false;
        };
        global_metrics().inc_cancellations(cancel_origin(&cancel));
        supervisor.cancel(cancel);
        true
    }

    /// Routes a resume signal to the query's supervisor.
    pub fn resume_query(&self, external_id: ExternalId) -> bool {
        let Some(supervisor) = self.supervisor_of(external_id) else {
            debug!(
                external_id = %external_id,
                operator = "FleetResume",
                "resume for unknown query ignored"
            );
            return false;
        };
        supervisor.resume();
        true
    }

    /// Routes an inbound result batch. Batches for unknown queries go to the
    /// peer forwarder when one is configured, otherwise the sender is
    /// answered with a terminated-query failure so its flow control never
    /// hangs.
    pub fn data_arrived(&self, batch: ResultBatch, sender: ResponseSender) {
        match self.supervisor_of(batch.external_id) {
            Some(supervisor) => supervisor.data_arrived(batch, sender),
            None => match &self.forwarder {
                Some(forwarder) => forwarder.forward(batch, sender),
                None => {
                    debug!(
                        external_id = %batch.external_id,
                        operator = "FleetData",
                        "data batch for unknown query refused"
                    );
                    sender.fail("query already terminated");
                }
            },
        }
    }

    fn connection_closed(&self, external_id: ExternalId) {
        info!(
            external_id = %external_id,
            operator = "FleetConnection",
            "client connection closed, cancelling its query"
        );
        self.cancel_query(external_id, CancelInfo::connection_closed());
    }

    pub fn can_accept(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
            && self.queries.len() < self.config.max_active_queries
    }

    pub fn stop_accepting(&self) {
        if self.accepting.swap(false, Ordering::AcqRel) {
            info!(operator = "FleetAdmission", "no longer accepting new queries");
        }
    }

    pub fn resume_accepting(&self) {
        if !self.accepting.swap(true, Ordering::AcqRel) {
            info!(operator = "FleetAdmission", "accepting new queries again");
        }
    }

    /// Stops admission and waits for running queries to retire, up to the
    /// configured grace period. Returns whether the registry drained.
    pub async fn wait_to_exit(&self) -> bool {
        self.stop_accepting();
        let deadline =
            Instant::now() + Duration::from_millis(self.config.exit_grace_period_ms);
        while !self.queries.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(
                    active = self.queries.len(),
                    operator = "FleetExit",
                    "exit grace period expired with queries still active"
                );
                return false;
            }
            // Re-check on a tick as well as on the drained signal; the
            // signal may fire between the emptiness check and this await.
            let tick = remaining.min(Duration::from_millis(50));
            let _ = tokio::time::timeout(tick, self.drained.notified()).await;
        }
        info!(operator = "FleetExit", "all queries retired");
        true
    }

    pub fn active_count(&self) -> usize {
        self.queries.len()
    }

    pub fn active_queries(&self) -> Vec<ExternalId> {
        self.queries.iter().map(|entry| *entry.key()).collect()
    }

    /// Profile snapshot of one live query, when its current attempt is in an
    /// observable state.
    pub fn query_profile(&self, external_id: ExternalId) -> Option<QueryProfile> {
        self.supervisor_of(external_id)?.current_profile()
    }

    /// Profile snapshots of every live query whose attempt is observable.
    pub fn active_profiles(&self) -> Vec<QueryProfile> {
        let supervisors: Vec<_> = self
            .queries
            .iter()
            .map(|entry| Arc::clone(&entry.supervisor))
            .collect();
        supervisors
            .iter()
            .filter_map(|supervisor| supervisor.current_profile())
            .collect()
    }

    /// Diagnostic escape hatch: cancels and drops a registry entry without
    /// waiting for its supervisor to finish. Returns false when the query is
    /// unknown.
    pub fn force_remove(&self, external_id: ExternalId) -> bool {
        let Some(supervisor) = self.supervisor_of(external_id) else {
            return false;
        };
        warn!(
            external_id = %external_id,
            operator = "FleetForceRemove",
            "forcibly retiring query from the registry"
        );
        supervisor.cancel(CancelInfo::client("forcibly removed by an administrator"));
        self.retire(external_id);
        true
    }

    fn supervisor_of(&self, external_id: ExternalId) -> Option<Arc<AttemptSupervisor>> {
        // The guard is dropped before the supervisor is used so no shard
        // lock is held across supervisor calls.
        self.queries
            .get(&external_id)
            .map(|entry| Arc::clone(&entry.supervisor))
    }

    fn retire(&self, external_id: ExternalId) {
        if let Some((_, entry)) = self.queries.remove(&external_id) {
            if let Some(watch) = entry.close_watch {
                watch.abort();
            }
            global_metrics().set_active_queries(self.queries.len() as u64);
            debug!(
                external_id = %external_id,
                operator = "FleetRetire",
                "query retired from the registry"
            );
            if self.queries.is_empty() {
                self.drained.notify_waiters();
            }
        }
    }

    async fn broadcast_profiles(fleet: Weak<FleetManager>, interval_ms: u64) {
        let mut ticker = interval(Duration::from_millis(interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately; skip it so a fresh fleet is quiet.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(fleet) = fleet.upgrade() else {
                return;
            };
            fleet.send_all_profiles().await;
        }
    }

    /// One broadcast round. A failing query never blocks the others; send
    /// errors are counted and suppressed.
    async fn send_all_profiles(&self) {
        let snapshot: Vec<(ExternalId, Arc<AttemptSupervisor>)> = self
            .queries
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(&entry.supervisor)))
            .collect();
        let mut sends = Vec::with_capacity(snapshot.len());
        for (external_id, supervisor) in snapshot {
            let Some(profile) = supervisor.current_profile() else {
                continue;
            };
            let telemetry = Arc::clone(&self.telemetry);
            sends.push(async move {
                let attempt_id = profile.attempt_id;
                if let Err(err) = telemetry.persist_profile(attempt_id, profile).await {
                    global_metrics().inc_profile_send_failures(&external_id.to_string());
                    warn!(
                        external_id = %external_id,
                        error = %err,
                        operator = "FleetProfiles",
                        "suppressed profile send failure"
                    );
                }
            });
        }
        join_all(sends).await;
    }
}

/// Removes a finished query from the fleet registry. Holds only a weak
/// reference so a retired fleet never lingers behind its queries.
struct FleetCompletion {
    fleet: Weak<FleetManager>,
}

impl CompletionListener for FleetCompletion {
    fn completed(&self, external_id: ExternalId) {
        if let Some(fleet) = self.fleet.upgrade() {
            fleet.retire(external_id);
        }
    }
}

fn cancel_origin(cancel: &CancelInfo) -> &'static str {
    if cancel.connection_closed {
        "connection"
    } else if cancel.runtime_exceeded {
        "runtime"
    } else if cancel.client_initiated {
        "client"
    } else {
        "system"
    }
}

#[cfg(test)]
#[path = "fleet_tests.rs"]
mod tests;
