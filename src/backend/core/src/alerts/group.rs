//! Alert group record and its resolution state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{AutoResolveError, Result};

/// Unique identifier for an alert group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub Uuid);

impl GroupId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for GroupId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies the one pending evaluation a group currently authorizes.
///
/// A fresh token is issued on every schedule; any earlier token stops
/// matching the instant the new one is stamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EvaluationToken(pub Uuid);

impl EvaluationToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EvaluationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EvaluationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Auto-resolution eligibility of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionState {
    /// Accepting evaluations
    #[default]
    Open,
    /// Size breaker tripped; the automatic path is closed for good
    AutoResolveSuspended,
    /// Resolved, by source or by hand
    Resolved,
}

impl ResolutionState {
    /// Check if transition to another state is valid.
    pub fn can_transition_to(&self, target: &ResolutionState) -> bool {
        use ResolutionState::*;
        matches!(
            (self, target),
            (Open, AutoResolveSuspended) | (Open, Resolved) | (AutoResolveSuspended, Resolved)
        )
    }

    /// No automatic evaluation may change a group in this state.
    pub fn is_terminal_for_auto(&self) -> bool {
        !matches!(self, ResolutionState::Open)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionState::Open => "open",
            ResolutionState::AutoResolveSuspended => "auto_resolve_suspended",
            ResolutionState::Resolved => "resolved",
        }
    }
}

impl std::fmt::Display for ResolutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionState {
    type Err = AutoResolveError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "open" => Ok(ResolutionState::Open),
            "auto_resolve_suspended" => Ok(ResolutionState::AutoResolveSuspended),
            "resolved" => Ok(ResolutionState::Resolved),
            other => Err(AutoResolveError::invariant_violation(format!(
                "unknown resolution state '{}'",
                other
            ))),
        }
    }
}

/// Who resolved a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedBy {
    /// The automatic path, triggered by a resolve signal from the source
    Source,
    /// The manual path
    User,
}

impl ResolvedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolvedBy::Source => "source",
            ResolvedBy::User => "user",
        }
    }
}

impl FromStr for ResolvedBy {
    type Err = AutoResolveError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "source" => Ok(ResolvedBy::Source),
            "user" => Ok(ResolvedBy::User),
            other => Err(AutoResolveError::invariant_violation(format!(
                "unknown resolver '{}'",
                other
            ))),
        }
    }
}

/// An event recorded against a group. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Position in the group, increasing with insertion order
    pub seq: u64,
    /// Raw payload as received from the integration
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

/// The resolution-relevant record of an alert group.
///
/// Member events are reached through the store (`size`, `last_event`), not
/// carried on the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertGroup {
    pub id: GroupId,
    pub resolution_state: ResolutionState,
    /// Owned by the scheduler; written only through `GroupStore::stamp_token`
    pub active_evaluation_token: Option<EvaluationToken>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<ResolvedBy>,
    pub suspended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl AlertGroup {
    /// A new, open group with no pending evaluation.
    pub fn new(id: GroupId) -> Self {
        Self {
            id,
            resolution_state: ResolutionState::Open,
            active_evaluation_token: None,
            resolved_at: None,
            resolved_by: None,
            suspended_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolution_state == ResolutionState::Resolved
    }

    /// Whether `token` is the one evaluation this group currently authorizes.
    pub fn authorizes(&self, token: &EvaluationToken) -> bool {
        self.active_evaluation_token.as_ref() == Some(token)
    }

    /// Strict transition. Errors on anything the state machine forbids.
    pub fn transition_to(&mut self, target: ResolutionState) -> Result<()> {
        if !self.resolution_state.can_transition_to(&target) {
            return Err(AutoResolveError::invalid_state_transition(
                self.resolution_state,
                target,
            ));
        }

        let now = Utc::now();
        match target {
            ResolutionState::AutoResolveSuspended => self.suspended_at = Some(now),
            ResolutionState::Resolved => self.resolved_at = Some(now),
            ResolutionState::Open => {}
        }
        self.resolution_state = target;
        Ok(())
    }

    /// Automatic resolve. Returns `false` without touching anything if the
    /// group is already resolved; a suspended group is refused.
    pub fn resolve_by_source(&mut self) -> Result<bool> {
        match self.resolution_state {
            ResolutionState::Resolved => return Ok(false),
            ResolutionState::AutoResolveSuspended => {
                return Err(AutoResolveError::invariant_violation(format!(
                    "automatic resolve attempted on suspended group {}",
                    self.id
                )))
            }
            ResolutionState::Open => {}
        }
        self.transition_to(ResolutionState::Resolved)?;
        self.resolved_by = Some(ResolvedBy::Source);
        Ok(true)
    }

    /// Trip the size breaker. Returns `false` if already suspended.
    pub fn suspend_auto_resolve(&mut self) -> Result<bool> {
        if self.resolution_state == ResolutionState::AutoResolveSuspended {
            return Ok(false);
        }
        self.transition_to(ResolutionState::AutoResolveSuspended)?;
        Ok(true)
    }

    /// Manual resolve, allowed from open or suspended. Returns `false` if
    /// the group is already resolved.
    pub fn force_resolve(&mut self) -> Result<bool> {
        if self.is_resolved() {
            return Ok(false);
        }
        self.transition_to(ResolutionState::Resolved)?;
        self.resolved_by = Some(ResolvedBy::User);
        Ok(true)
    }
}
