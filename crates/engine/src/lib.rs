//! Collaborator contracts consumed by the QueryFleet coordination core.
//!
//! Architecture role:
//! - defines the execution-engine seam ("plan and run one attempt, emit one
//!   terminal event") and the attempt handle surface
//! - defines catalog and telemetry collaborator traits
//! - defines the transport-facing data model: result batches, acks,
//!   connection-close watches, and the submitter's outcome observer
//!
//! Key modules:
//! - [`engine`]
//! - [`result`]
//! - [`catalog`]
//! - [`telemetry`]
//! - [`transport`]
//! - [`request`]

pub mod catalog;
pub mod engine;
pub mod request;
pub mod result;
pub mod telemetry;
pub mod transport;

pub use catalog::{DatasetCatalog, SchemaDescriptor};
pub use engine::{
    AttemptHandle, AttemptOptions, AttemptPlanSummary, AttemptSpec, ExecutionEngine, TerminalEvent,
    TerminalSender,
};
pub use request::QueryRequest;
pub use result::{
    AttemptReason, AttemptState, CancelInfo, DatasetPath, DatasetValidity, FailureContext,
    QueryError, QueryProfile, QueryResult, QueryState,
};
pub use telemetry::TelemetrySink;
pub use transport::{
    DataAck, QueryObserver, ResponseSender, ResultBatch, ResultForwarder, TerminationRegistry,
};
