use thiserror::Error;

/// Canonical QueryFleet error taxonomy used across crates.
///
/// Classification guidance:
/// - [`QfError::InvalidConfig`]: lifecycle/config contract violations discovered before any work
/// - [`QfError::Rejected`]: admission control turned the request away; clients may back off and resubmit
/// - [`QfError::Execution`]: attempt launch/transition failures after the request was accepted
/// - [`QfError::Unsupported`]: syntactically valid but intentionally unimplemented behavior
/// - [`QfError::Io`]: raw filesystem/network IO failures from std APIs
#[derive(Debug, Error)]
pub enum QfError {
    /// Invalid or inconsistent configuration/lifecycle state.
    ///
    /// Examples:
    /// - submitting before the fleet manager was started
    /// - registering a supervisor twice for the same external id
    /// - invalid ceiling/interval option values
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Admission control rejected the request before any planning work.
    ///
    /// Distinct from [`QfError::Execution`] so submission paths can apply
    /// their own backoff instead of treating the rejection as a query bug.
    #[error("query rejected: {0}")]
    Rejected(String),

    /// Attempt launch or transition failures after admission succeeded.
    ///
    /// Examples:
    /// - the execution engine refused to construct an attempt
    /// - a re-attempt could not be started
    /// - a supervisor state transition could not complete in time
    #[error("execution error: {0}")]
    Execution(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Valid request for a feature/shape not implemented in current version.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Standard QueryFleet result alias.
pub type Result<T> = std::result::Result<T, QfError>;
