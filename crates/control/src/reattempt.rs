//! Re-attempt policy: decides whether a failed attempt is worth running
//! again, and with what corrections.
//!
//! Architecture role: pure decision logic. The policy owns no state beyond
//! its configuration and touches no registries, catalogs, or handles; the
//! supervisor gathers the facts into a [`ReattemptContext`] and applies the
//! side effects the returned [`ReattemptDecision`] calls for.
//!
//! Recoverable failures:
//! - schema drift, once the discovered schema has been durably recorded;
//! - invalid dataset metadata, retried with the stale paths flagged for
//!   re-resolution;
//! - out-of-memory while hash aggregation was in the plan, retried in
//!   low-memory mode within a bounded budget.
//!
//! Cancellation always wins: a cancelled query is never re-attempted no
//! matter what its failure looks like.

use qf_common::config::FleetConfig;
use qf_engine::{
    AttemptPlanSummary, AttemptReason, DatasetValidity, FailureContext, QueryError,
};

/// The facts about one failed attempt, assembled by the supervisor.
#[derive(Debug)]
pub struct ReattemptContext<'a> {
    pub error: &'a QueryError,
    pub plan: AttemptPlanSummary,
    /// A cancel request has been observed for this query.
    pub canceled: bool,
    /// The schema carried by a drift failure was recorded before this call.
    pub schema_recorded: bool,
    /// Low-memory retries already spent on this query.
    pub oom_retries_used: u32,
    /// Result data has already reached the client.
    pub results_sent: bool,
}

/// What to do about a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReattemptDecision {
    pub reason: AttemptReason,
    pub validity: DatasetValidity,
}

impl ReattemptDecision {
    fn fail() -> Self {
        Self {
            reason: AttemptReason::None,
            validity: DatasetValidity::AllValid,
        }
    }

    pub fn is_reattempt(&self) -> bool {
        self.reason != AttemptReason::None
    }
}

/// Pure, deterministic classifier. Built once per fleet from [`FleetConfig`]
/// and shared by every supervisor.
#[derive(Debug, Clone)]
pub struct ReattemptPolicy {
    enabled: bool,
    oom_retry_limit: u32,
    fail_if_results_sent: bool,
}

impl ReattemptPolicy {
    pub fn from_config(config: &FleetConfig) -> Self {
        Self {
            enabled: config.reattempts_enabled,
            oom_retry_limit: config.oom_retry_limit,
            fail_if_results_sent: config.fail_reattempt_if_results_sent,
        }
    }

    /// Kill switch: every failure is terminal.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            oom_retry_limit: 0,
            fail_if_results_sent: true,
        }
    }

    /// Classifies a failed attempt. Same context in, same decision out.
    pub fn classify(&self, ctx: &ReattemptContext<'_>) -> ReattemptDecision {
        if !self.enabled || ctx.canceled {
            return ReattemptDecision::fail();
        }
        // Once rows have left the building, a silent retry would hand the
        // client duplicate data.
        if ctx.results_sent && self.fail_if_results_sent {
            return ReattemptDecision::fail();
        }
        match &ctx.error.context {
            FailureContext::SchemaDrift { .. } => {
                if ctx.schema_recorded {
                    ReattemptDecision {
                        reason: AttemptReason::SchemaLearned,
                        validity: DatasetValidity::AllValid,
                    }
                } else {
                    ReattemptDecision::fail()
                }
            }
            FailureContext::InvalidMetadata { paths } => ReattemptDecision {
                reason: AttemptReason::InvalidDatasetMetadata,
                validity: DatasetValidity::stale(paths.clone()),
            },
            FailureContext::OutOfMemory => {
                if ctx.plan.used_hash_aggregate && ctx.oom_retries_used < self.oom_retry_limit {
                    ReattemptDecision {
                        reason: AttemptReason::OutOfMemoryLowMemRetry,
                        validity: DatasetValidity::AllValid,
                    }
                } else {
                    ReattemptDecision::fail()
                }
            }
            FailureContext::ResourceExhausted | FailureContext::Other => ReattemptDecision::fail(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qf_engine::SchemaDescriptor;

    fn policy() -> ReattemptPolicy {
        ReattemptPolicy::from_config(&FleetConfig::default())
    }

    fn ctx<'a>(error: &'a QueryError) -> ReattemptContext<'a> {
        ReattemptContext {
            error,
            plan: AttemptPlanSummary {
                used_hash_aggregate: true,
            },
            canceled: false,
            schema_recorded: false,
            oom_retries_used: 0,
            results_sent: false,
        }
    }

    fn schema_drift_error() -> QueryError {
        QueryError {
            message: "schema changed during execution".to_string(),
            context: FailureContext::SchemaDrift {
                dataset: vec!["s3".to_string(), "events".to_string()],
                new_schema: SchemaDescriptor::new(vec![1, 2, 3]),
            },
        }
    }

    fn oom_error() -> QueryError {
        QueryError {
            message: "query ran out of memory".to_string(),
            context: FailureContext::OutOfMemory,
        }
    }

    #[test]
    fn schema_drift_retries_only_after_schema_is_recorded() {
        let error = schema_drift_error();
        let mut context = ctx(&error);

        let decision = policy().classify(&context);
        assert!(!decision.is_reattempt());

        context.schema_recorded = true;
        let decision = policy().classify(&context);
        assert_eq!(decision.reason, AttemptReason::SchemaLearned);
        assert_eq!(decision.validity, DatasetValidity::AllValid);
    }

    #[test]
    fn invalid_metadata_retries_with_stale_paths() {
        let error = QueryError {
            message: "dataset metadata out of date".to_string(),
            context: FailureContext::InvalidMetadata {
                paths: vec![vec!["lake".to_string(), "orders".to_string()]],
            },
        };
        let decision = policy().classify(&ctx(&error));
        assert_eq!(decision.reason, AttemptReason::InvalidDatasetMetadata);
        assert!(!decision.validity.is_valid(&["lake".to_string(), "orders".to_string()]));
        assert!(decision.validity.is_valid(&["lake".to_string(), "customers".to_string()]));
    }

    #[test]
    fn oom_retry_respects_budget_and_plan_shape() {
        let error = oom_error();
        let mut context = ctx(&error);

        let decision = policy().classify(&context);
        assert_eq!(decision.reason, AttemptReason::OutOfMemoryLowMemRetry);

        // Budget spent.
        context.oom_retries_used = 1;
        assert!(!policy().classify(&context).is_reattempt());

        // Nothing to disable: the plan never used hash aggregation.
        context.oom_retries_used = 0;
        context.plan.used_hash_aggregate = false;
        assert!(!policy().classify(&context).is_reattempt());
    }

    #[test]
    fn cancellation_wins_over_any_recoverable_failure() {
        let error = oom_error();
        let mut context = ctx(&error);
        context.canceled = true;
        assert!(!policy().classify(&context).is_reattempt());
    }

    #[test]
    fn results_already_sent_blocks_retries() {
        let error = oom_error();
        let mut context = ctx(&error);
        context.results_sent = true;
        assert!(!policy().classify(&context).is_reattempt());

        let mut config = FleetConfig::default();
        config.fail_reattempt_if_results_sent = false;
        let lenient = ReattemptPolicy::from_config(&config);
        assert!(lenient.classify(&context).is_reattempt());
    }

    #[test]
    fn disabled_policy_never_retries() {
        let error = oom_error();
        assert!(!ReattemptPolicy::disabled().classify(&ctx(&error)).is_reattempt());
    }

    #[test]
    fn same_context_always_yields_same_decision() {
        let error = schema_drift_error();
        let mut context = ctx(&error);
        context.schema_recorded = true;
        let first = policy().classify(&context);
        let second = policy().classify(&context);
        assert_eq!(first, second);
    }

    #[test]
    fn generic_failures_are_terminal() {
        let error = QueryError::system("executor lost");
        assert!(!policy().classify(&ctx(&error)).is_reattempt());

        let error = QueryError::resource("work queue full");
        assert!(!policy().classify(&ctx(&error)).is_reattempt());
    }
}
