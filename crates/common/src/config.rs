use serde::{Deserialize, Serialize};

/// Fleet manager behavior/configuration knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Max queries a single coordinator node may run concurrently.
    pub max_active_queries: usize,
    /// Enables silent re-attempts after recoverable failures.
    ///
    /// When disabled every failure is final, regardless of classification.
    pub reattempts_enabled: bool,
    /// Max OOM-triggered low-memory re-attempts per query before giving up.
    pub oom_retry_limit: u32,
    /// Refuse a re-attempt once result batches already reached the client.
    pub fail_reattempt_if_results_sent: bool,
    /// Interval between best-effort profile broadcasts to telemetry.
    pub profile_send_interval_ms: u64,
    /// Bounded wait for a supervisor's state lock on cancel/resume/data paths.
    ///
    /// On timeout the caller is told the operation could not complete instead
    /// of blocking behind a slow attempt transition.
    pub transition_lock_timeout_ms: u64,
    /// Graceful-shutdown wait for in-flight queries to drain.
    pub exit_grace_period_ms: u64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            max_active_queries: 1000,
            reattempts_enabled: true,
            oom_retry_limit: 1,
            fail_reattempt_if_results_sent: true,
            profile_send_interval_ms: 30_000,
            transition_lock_timeout_ms: 30_000,
            exit_grace_period_ms: 30_000,
        }
    }
}
