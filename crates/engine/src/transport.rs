//! Transport-facing contracts: inbound result batches, acks, connection
//! watches, and the submitter's outcome observer.
//!
//! The wire protocol itself is external; these types are the seam it talks
//! through.

use std::fmt::Debug;

use qf_common::ids::{AttemptId, ExternalId};
use tokio::sync::{oneshot, watch};

use crate::result::{AttemptReason, QueryResult};

/// Inbound result batch keyed by the query it belongs to.
#[derive(Debug)]
pub struct ResultBatch {
    pub external_id: ExternalId,
    /// Attempt the sender believes it is talking to.
    pub attempt: u32,
    /// Encoded record batch payload, opaque to the coordination core.
    pub payload: Vec<u8>,
}

impl ResultBatch {
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Ack outcome for one inbound batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataAck {
    Ok,
    Failed { message: String },
}

/// One-shot reply handle for an inbound batch.
///
/// Every batch must be answered exactly once, whatever happened to the query,
/// so the remote sender's flow control never hangs.
#[derive(Debug)]
pub struct ResponseSender {
    tx: oneshot::Sender<DataAck>,
}

impl ResponseSender {
    pub fn channel() -> (Self, oneshot::Receiver<DataAck>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    pub fn ack(self) {
        let _ = self.tx.send(DataAck::Ok);
    }

    pub fn fail(self, message: impl Into<String>) {
        let _ = self.tx.send(DataAck::Failed {
            message: message.into(),
        });
    }
}

/// Forwards batches for queries not running on this coordinator to a peer
/// coordinator (multi-coordinator deployments).
pub trait ResultForwarder: Send + Sync + Debug {
    /// Takes ownership of the batch and its reply handle; must answer the
    /// sender exactly once.
    fn forward(&self, batch: ResultBatch, sender: ResponseSender);
}

/// Connection-close watch registered by the transport layer.
///
/// The transport flips the watch to `true` when the client connection goes
/// away; the fleet turns that into an implicit cancellation. Internal
/// submissions use [`TerminationRegistry::noop`].
#[derive(Clone, Debug)]
pub struct TerminationRegistry {
    closed: Option<watch::Receiver<bool>>,
}

impl TerminationRegistry {
    /// Registry that never fires; for internal/test submissions.
    pub fn noop() -> Self {
        Self { closed: None }
    }

    pub fn watching(rx: watch::Receiver<bool>) -> Self {
        Self { closed: Some(rx) }
    }

    /// Convenience pair for transports and tests: flip the sender to `true`
    /// on disconnect.
    pub fn channel() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self::watching(rx))
    }

    pub fn is_watching(&self) -> bool {
        self.closed.is_some()
    }

    /// Resolves when the client connection closes.
    ///
    /// A dropped transport side counts as closed. Pends forever for no-op
    /// registries.
    pub async fn closed(self) {
        match self.closed {
            Some(mut rx) => {
                let _ = rx.wait_for(|closed| *closed).await;
            }
            None => std::future::pending().await,
        }
    }
}

/// Caller-supplied terminal-outcome observer for one submitted query.
///
/// Receives exactly one [`QueryObserver::completed`] call per external id,
/// however many attempts ran.
pub trait QueryObserver: Send {
    /// A new attempt is being launched for the query.
    fn attempt_started(&self, attempt_id: AttemptId, reason: AttemptReason) {
        let _ = (attempt_id, reason);
    }

    /// Terminal notification for the whole query.
    fn completed(&self, result: QueryResult);
}
