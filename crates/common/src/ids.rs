//! Typed identifiers shared across fleet/supervisor components.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Client-visible query identifier.
///
/// Created once per submitted query, never reused; all messages belonging to
/// one query across attempts carry this id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalId(
    /// Raw numeric id value.
    pub u64,
);

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one physical attempt of a query.
///
/// Attempt numbers start at 0 and increment by one per re-attempt; only the
/// owning attempt supervisor ever advances them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptId {
    /// Query the attempt belongs to.
    pub external: ExternalId,
    /// Zero-based attempt number.
    pub attempt: u32,
}

impl AttemptId {
    /// First attempt of a query.
    pub fn first(external: ExternalId) -> Self {
        Self {
            external,
            attempt: 0,
        }
    }

    /// Id of the attempt following this one.
    pub fn next(&self) -> Self {
        Self {
            external: self.external,
            attempt: self.attempt + 1,
        }
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.external, self.attempt)
    }
}
