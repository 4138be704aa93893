//! Coordination core of the query fleet.
//!
//! Three layers, outermost first:
//! - [`fleet`]: admission control, the query registry, and routing of
//!   cancellation, resume, and data signals to the right query;
//! - [`supervisor`]: per-query lifecycle across one or more attempts, with
//!   exactly-one terminal notification to the submitter;
//! - [`reattempt`]: pure classification of failures into retry decisions.
//!
//! Execution itself lives behind the [`qf_engine::ExecutionEngine`] seam;
//! this crate never plans or runs a query, it only decides when and how
//! often one runs.

pub mod fleet;
pub mod reattempt;
pub mod supervisor;

#[cfg(test)]
pub mod test_support;

pub use fleet::FleetManager;
pub use reattempt::{ReattemptContext, ReattemptDecision, ReattemptPolicy};
pub use supervisor::{AttemptSupervisor, CompletionListener};
