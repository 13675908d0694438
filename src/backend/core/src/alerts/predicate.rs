//! Resolve predicates: does an event signal that its group is resolved?

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::group::{AlertGroup, Event};
use crate::error::{AutoResolveError, Result};

/// Decides whether an event is a resolve signal for its group.
///
/// Errors are treated as transient and retried by the evaluation job.
#[async_trait]
pub trait ResolvePredicate: Send + Sync {
    async fn is_resolve_signal(&self, group: &AlertGroup, event: &Event) -> Result<bool>;
}

/// Condition applied to an event payload.
///
/// `pointer` selects a field with JSON pointer syntax. Exactly one of
/// `equals` (exact JSON value) or `matches` (regex over the string form)
/// must be set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolveCondition {
    pub pointer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equals: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matches: Option<String>,
}

impl Default for ResolveCondition {
    /// `/status == "resolved"`, the Alertmanager webhook convention.
    fn default() -> Self {
        Self {
            pointer: "/status".to_string(),
            equals: Some(serde_json::Value::String("resolved".to_string())),
            matches: None,
        }
    }
}

impl ResolveCondition {
    pub fn equals(pointer: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            pointer: pointer.into(),
            equals: Some(value.into()),
            matches: None,
        }
    }

    pub fn matches(pointer: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            pointer: pointer.into(),
            equals: None,
            matches: Some(pattern.into()),
        }
    }

    /// Validate and compile the condition.
    pub fn compile(&self) -> Result<CompiledCondition> {
        if !self.pointer.is_empty() && !self.pointer.starts_with('/') {
            return Err(AutoResolveError::invalid_condition(format!(
                "pointer '{}' must be empty or start with '/'",
                self.pointer
            )));
        }

        let matcher = match (&self.equals, &self.matches) {
            (Some(value), None) => Matcher::Equals(value.clone()),
            (None, Some(pattern)) => Matcher::Regex(Regex::new(pattern)?),
            (Some(_), Some(_)) => {
                return Err(AutoResolveError::invalid_condition(
                    "set either 'equals' or 'matches', not both",
                ))
            }
            (None, None) => {
                return Err(AutoResolveError::invalid_condition(
                    "one of 'equals' or 'matches' is required",
                ))
            }
        };

        Ok(CompiledCondition {
            pointer: self.pointer.clone(),
            matcher,
        })
    }
}

#[derive(Debug, Clone)]
enum Matcher {
    Equals(serde_json::Value),
    Regex(Regex),
}

/// A validated [`ResolveCondition`].
#[derive(Debug, Clone)]
pub struct CompiledCondition {
    pointer: String,
    matcher: Matcher,
}

impl CompiledCondition {
    /// A missing field never matches.
    pub fn evaluate(&self, payload: &serde_json::Value) -> bool {
        let Some(field) = payload.pointer(&self.pointer) else {
            return false;
        };

        match &self.matcher {
            Matcher::Equals(expected) => field == expected,
            Matcher::Regex(re) => match field {
                serde_json::Value::String(s) => re.is_match(s),
                other => re.is_match(&other.to_string()),
            },
        }
    }
}

/// Predicate that evaluates a [`ResolveCondition`] against the event payload.
#[derive(Debug, Clone)]
pub struct PayloadConditionPredicate {
    condition: CompiledCondition,
}

impl PayloadConditionPredicate {
    pub fn new(condition: &ResolveCondition) -> Result<Self> {
        Ok(Self {
            condition: condition.compile()?,
        })
    }
}

#[async_trait]
impl ResolvePredicate for PayloadConditionPredicate {
    async fn is_resolve_signal(&self, group: &AlertGroup, event: &Event) -> Result<bool> {
        let signal = self.condition.evaluate(&event.payload);
        tracing::trace!(group_id = %group.id, seq = event.seq, signal, "Resolve condition evaluated");
        Ok(signal)
    }
}
