//! Scripted collaborators shared by the supervisor and fleet tests.
//!
//! The mock engine never runs anything: tests drive each attempt to its
//! terminal state by hand through the captured [`LaunchRecord`]s, which
//! makes every interleaving reproducible.

use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use qf_common::ids::{AttemptId, ExternalId};
use qf_common::{QfError, Result};
use qf_engine::{
    AttemptHandle, AttemptOptions, AttemptReason, AttemptSpec, AttemptState, CancelInfo,
    DatasetCatalog, DatasetValidity, ExecutionEngine, QueryError, QueryObserver, QueryProfile,
    QueryResult, ResponseSender, ResultBatch, SchemaDescriptor, TelemetrySink, TerminalEvent,
    TerminalSender,
};
use tokio::sync::mpsc;

use crate::supervisor::CompletionListener;

/// One captured launch, with everything a test needs to finish the attempt.
#[derive(Clone, Debug)]
pub struct LaunchRecord {
    pub attempt_id: AttemptId,
    pub reason: AttemptReason,
    pub options: AttemptOptions,
    pub validity: DatasetValidity,
    pub handle: Arc<MockHandle>,
    terminal: TerminalSender,
}

impl LaunchRecord {
    pub fn complete(&self) {
        self.terminal.send(TerminalEvent {
            result: QueryResult::completed(self.attempt_id, None),
            plan: Default::default(),
        });
    }

    pub fn fail(&self, error: QueryError) {
        self.fail_with_plan(error, Default::default());
    }

    pub fn fail_with_plan(&self, error: QueryError, plan: qf_engine::AttemptPlanSummary) {
        self.terminal.send(TerminalEvent {
            result: QueryResult::failed(self.attempt_id, error, None),
            plan,
        });
    }

    pub fn cancelled(&self) {
        self.terminal.send(TerminalEvent {
            result: QueryResult::canceled(self.attempt_id, None),
            plan: Default::default(),
        });
    }
}

#[derive(Debug)]
pub struct MockHandle {
    pub state: Mutex<AttemptState>,
    pub cancels: Mutex<Vec<CancelInfo>>,
    pub resumes: AtomicUsize,
    pub batches: Mutex<Vec<ResultBatch>>,
    pub profile: Mutex<Option<QueryProfile>>,
}

impl MockHandle {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(AttemptState::Running),
            cancels: Mutex::new(Vec::new()),
            resumes: AtomicUsize::new(0),
            batches: Mutex::new(Vec::new()),
            profile: Mutex::new(None),
        })
    }

    pub fn set_profile(&self, profile: QueryProfile) {
        *self.profile.lock() = Some(profile);
    }

    pub fn set_state(&self, state: AttemptState) {
        *self.state.lock() = state;
    }

    pub fn cancel_count(&self) -> usize {
        self.cancels.lock().len()
    }
}

impl AttemptHandle for MockHandle {
    fn cancel(&self, cancel: &CancelInfo) {
        self.cancels.lock().push(cancel.clone());
        *self.state.lock() = AttemptState::Canceled;
    }

    fn resume(&self) {
        self.resumes.fetch_add(1, Ordering::SeqCst);
    }

    fn state(&self) -> AttemptState {
        *self.state.lock()
    }

    fn profile(&self) -> Option<QueryProfile> {
        self.profile.lock().clone()
    }

    fn data_arrived(&self, batch: ResultBatch, sender: ResponseSender) {
        self.batches.lock().push(batch);
        sender.ack();
    }
}

/// Engine double that records launches instead of executing them.
#[derive(Debug, Default)]
pub struct MockEngine {
    launches: Mutex<Vec<LaunchRecord>>,
    refuse_attempts: Mutex<HashSet<u32>>,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes `launch` fail for the given attempt index.
    pub fn refuse_attempt(&self, attempt: u32) {
        self.refuse_attempts.lock().insert(attempt);
    }

    pub fn launch_count(&self) -> usize {
        self.launches.lock().len()
    }

    pub fn launch_at(&self, index: usize) -> LaunchRecord {
        self.launches.lock()[index].clone()
    }

    pub fn last_launch(&self) -> LaunchRecord {
        self.launches
            .lock()
            .last()
            .cloned()
            .expect("no launches recorded")
    }
}

impl ExecutionEngine for MockEngine {
    fn launch(&self, spec: AttemptSpec) -> Result<Arc<dyn AttemptHandle>> {
        if self.refuse_attempts.lock().contains(&spec.attempt_id.attempt) {
            return Err(QfError::Execution(format!(
                "engine refused attempt {}",
                spec.attempt_id
            )));
        }
        let handle = MockHandle::new();
        self.launches.lock().push(LaunchRecord {
            attempt_id: spec.attempt_id,
            reason: spec.reason,
            options: spec.options,
            validity: spec.validity,
            handle: Arc::clone(&handle),
            terminal: spec.terminal,
        });
        Ok(handle)
    }
}

/// Catalog double recording schema updates and invalidation flags.
#[derive(Debug, Default)]
pub struct MockCatalog {
    pub schema_updates: Mutex<Vec<(Vec<String>, SchemaDescriptor)>>,
    pub invalidated: Mutex<Vec<Vec<String>>>,
    pub fail_schema_updates: AtomicBool,
}

impl MockCatalog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl DatasetCatalog for MockCatalog {
    fn update_dataset_schema(&self, path: &[String], schema: &SchemaDescriptor) -> Result<()> {
        if self.fail_schema_updates.load(Ordering::SeqCst) {
            return Err(QfError::Execution("catalog write failed".to_string()));
        }
        self.schema_updates
            .lock()
            .push((path.to_vec(), schema.clone()));
        Ok(())
    }

    fn mark_dataset_invalid(&self, path: &[String]) -> Result<()> {
        self.invalidated.lock().push(path.to_vec());
        Ok(())
    }
}

/// Telemetry double. Flip `fail` to reject everything, or add specific
/// queries to `fail_for` to exercise per-query error isolation.
#[derive(Debug, Default)]
pub struct MockTelemetry {
    pub persisted: Mutex<Vec<(AttemptId, QueryProfile)>>,
    pub fail: AtomicBool,
    pub fail_for: Mutex<HashSet<ExternalId>>,
}

impl MockTelemetry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn persisted_count(&self) -> usize {
        self.persisted.lock().len()
    }

    pub fn persisted_for(&self, external_id: ExternalId) -> usize {
        self.persisted
            .lock()
            .iter()
            .filter(|(attempt_id, _)| attempt_id.external == external_id)
            .count()
    }
}

impl TelemetrySink for MockTelemetry {
    fn persist_profile(
        &self,
        attempt_id: AttemptId,
        profile: QueryProfile,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.fail.load(Ordering::SeqCst)
                || self.fail_for.lock().contains(&attempt_id.external)
            {
                return Err(QfError::Execution("telemetry sink unavailable".to_string()));
            }
            self.persisted.lock().push((attempt_id, profile));
            Ok(())
        })
    }
}

#[derive(Debug)]
pub enum ObserverEvent {
    Started(AttemptId, AttemptReason),
    Completed(QueryResult),
}

struct ChannelObserver {
    tx: mpsc::UnboundedSender<ObserverEvent>,
}

impl QueryObserver for ChannelObserver {
    fn attempt_started(&self, attempt_id: AttemptId, reason: AttemptReason) {
        let _ = self.tx.send(ObserverEvent::Started(attempt_id, reason));
    }

    fn completed(&self, result: QueryResult) {
        let _ = self.tx.send(ObserverEvent::Completed(result));
    }
}

/// Observer whose notifications can be awaited from the test body.
pub fn channel_observer() -> (
    Box<dyn QueryObserver>,
    mpsc::UnboundedReceiver<ObserverEvent>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Box::new(ChannelObserver { tx }), rx)
}

struct ChannelListener {
    tx: mpsc::UnboundedSender<ExternalId>,
}

impl CompletionListener for ChannelListener {
    fn completed(&self, external_id: ExternalId) {
        let _ = self.tx.send(external_id);
    }
}

pub fn channel_listener() -> (
    Arc<dyn CompletionListener>,
    mpsc::UnboundedReceiver<ExternalId>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(ChannelListener { tx }), rx)
}

/// Awaits the final `Completed` notification, skipping `Started` events.
pub async fn await_completion(rx: &mut mpsc::UnboundedReceiver<ObserverEvent>) -> QueryResult {
    loop {
        match rx.recv().await.expect("observer channel closed early") {
            ObserverEvent::Started(..) => continue,
            ObserverEvent::Completed(result) => return result,
        }
    }
}
