//! Error handling for the auto-resolve engine.
//!
//! This module provides:
//! - A single error type with a stable, machine-readable code
//! - Severity and retryability derived from the code
//! - User-facing vs internal messages
//! - Error logging with tracing integration
//! - Metrics integration for error tracking
//!
//! # Usage
//!
//! ```rust,ignore
//! use autoresolve_core::error::{AutoResolveError, ErrorContext, Result};
//!
//! fn load() -> Result<()> {
//!     std::fs::read_to_string("groups.json")
//!         .context("Failed to read group snapshot")?;
//!     Ok(())
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for engine operations.
pub type Result<T> = std::result::Result<T, AutoResolveError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// These codes are stable and are used as metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Group Errors (1000-1099)
    GroupNotFound,
    GroupAlreadyExists,
    InvalidStateTransition,
    InvariantViolation,

    // Store Errors (2000-2099)
    StoreError,
    StoreUnavailable,
    StoreQueryFailed,

    // Queue Errors (2100-2199)
    QueueError,
    QueueUnavailable,

    // Serialization Errors (2200-2299)
    SerializationError,
    DeserializationError,

    // Predicate Errors (3000-3099)
    PredicateFailed,
    PredicateTimeout,
    InvalidCondition,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    MissingConfiguration,
    InvalidConfiguration,

    // Internal Errors (9000-9099)
    InternalError,
    UnknownError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::GroupNotFound => 1000,
            Self::GroupAlreadyExists => 1001,
            Self::InvalidStateTransition => 1002,
            Self::InvariantViolation => 1003,

            Self::StoreError => 2000,
            Self::StoreUnavailable => 2001,
            Self::StoreQueryFailed => 2002,

            Self::QueueError => 2100,
            Self::QueueUnavailable => 2101,

            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,

            Self::PredicateFailed => 3000,
            Self::PredicateTimeout => 3001,
            Self::InvalidCondition => 3002,

            Self::ConfigurationError => 5000,
            Self::MissingConfiguration => 5001,
            Self::InvalidConfiguration => 5002,

            Self::InternalError => 9000,
            Self::UnknownError => 9099,
        }
    }

    /// Check if this error is transient and worth retrying.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable
                | Self::StoreQueryFailed
                | Self::QueueError
                | Self::QueueUnavailable
                | Self::PredicateFailed
                | Self::PredicateTimeout
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "group",
            2000..=2099 => "store",
            2100..=2199 => "queue",
            2200..=2299 => "serialization",
            3000..=3099 => "predicate",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging and alerting).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Expected conditions (missing records, bad input)
    Low,
    /// Operational issues (timeouts, predicate failures)
    Medium,
    /// System errors (store failures, serialization bugs)
    High,
    /// Errors requiring immediate attention
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::GroupNotFound
            | ErrorCode::GroupAlreadyExists
            | ErrorCode::InvalidCondition => Self::Low,

            ErrorCode::PredicateFailed
            | ErrorCode::PredicateTimeout
            | ErrorCode::QueueError
            | ErrorCode::StoreQueryFailed => Self::Medium,

            ErrorCode::StoreError
            | ErrorCode::SerializationError
            | ErrorCode::DeserializationError
            | ErrorCode::InvalidStateTransition
            | ErrorCode::ConfigurationError
            | ErrorCode::MissingConfiguration
            | ErrorCode::InvalidConfiguration => Self::High,

            ErrorCode::StoreUnavailable
            | ErrorCode::QueueUnavailable
            | ErrorCode::InvariantViolation
            | ErrorCode::InternalError
            | ErrorCode::UnknownError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related entity ID (group, job, etc.)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for the engine.
#[derive(Error, Debug)]
pub struct AutoResolveError {
    /// Machine-readable error code
    code: ErrorCode,

    /// Short description, safe to surface to operators
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for AutoResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl AutoResolveError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// Create a group-not-found error.
    pub fn group_not_found(group_id: impl fmt::Display) -> Self {
        let id = group_id.to_string();
        Self::new(ErrorCode::GroupNotFound, format!("Alert group not found: {}", id))
            .with_details(ErrorDetails::new().with_entity("alert_group", id))
    }

    /// Create an invalid state transition error.
    pub fn invalid_state_transition(from: impl fmt::Display, to: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::InvalidStateTransition,
            format!("Invalid resolution state transition: {} -> {}", from, to),
        )
        .with_context("from", from.to_string())
        .with_context("to", to.to_string())
    }

    /// Create an invariant violation error.
    pub fn invariant_violation(message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::InvariantViolation,
            "Engine invariant violated",
            message,
        )
    }

    /// Create a store error; `retryable` selects between a transient and a hard failure.
    pub fn store(message: impl Into<String>, retryable: bool) -> Self {
        let code = if retryable {
            ErrorCode::StoreUnavailable
        } else {
            ErrorCode::StoreError
        };
        Self::with_internal(code, "Group store operation failed", message)
    }

    /// Create a predicate failure error.
    pub fn predicate_failed(message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::PredicateFailed,
            "Resolve predicate evaluation failed",
            message,
        )
    }

    /// Create an invalid resolve-condition error.
    pub fn invalid_condition(message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::InvalidCondition,
            "Resolve condition is invalid",
            message,
        )
    }

    /// Create a queue error.
    pub fn queue(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::QueueError, "Job queue operation failed", message)
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidConfiguration, message.into())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    details = ?self.details,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    fn record_metrics(&self) {
        counter!(
            "autoresolve_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "severity" => format!("{:?}", self.severity()),
            "retryable" => self.is_retryable().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context with error code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| AutoResolveError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| AutoResolveError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| AutoResolveError::new(ErrorCode::GroupNotFound, message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| AutoResolveError::new(code, "Resource not found"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<sqlx::Error> for AutoResolveError {
    fn from(error: sqlx::Error) -> Self {
        let (code, user_msg) = match &error {
            sqlx::Error::RowNotFound => (ErrorCode::GroupNotFound, "Record not found"),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => (
                ErrorCode::StoreUnavailable,
                "Group store is temporarily unavailable",
            ),
            sqlx::Error::Database(_) => (ErrorCode::StoreQueryFailed, "Group store query failed"),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => (
                ErrorCode::DeserializationError,
                "Failed to decode stored group",
            ),
            _ => (ErrorCode::StoreError, "A group store error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<redis::RedisError> for AutoResolveError {
    fn from(error: redis::RedisError) -> Self {
        let (code, user_msg) = if error.is_connection_refusal()
            || error.is_connection_dropped()
            || error.is_timeout()
        {
            (ErrorCode::QueueUnavailable, "Job queue is temporarily unavailable")
        } else {
            (ErrorCode::QueueError, "A job queue error occurred")
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for AutoResolveError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() || error.is_eof() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string())
            .with_source(error)
    }
}

impl From<regex::Error> for AutoResolveError {
    fn from(error: regex::Error) -> Self {
        Self::invalid_condition(error.to_string()).with_source(error)
    }
}

impl From<tokio::time::error::Elapsed> for AutoResolveError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Self::with_internal(
            ErrorCode::PredicateTimeout,
            "Resolve predicate timed out",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<anyhow::Error> for AutoResolveError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<AutoResolveError>() {
            Ok(inner) => inner,
            Err(error) => Self::internal(error.to_string()),
        }
    }
}

impl From<config::ConfigError> for AutoResolveError {
    fn from(error: config::ConfigError) -> Self {
        let (code, user_msg) = match &error {
            config::ConfigError::NotFound(_) => (
                ErrorCode::MissingConfiguration,
                "Required configuration not found",
            ),
            config::ConfigError::PathParse(_) | config::ConfigError::FileParse { .. } => (
                ErrorCode::InvalidConfiguration,
                "Configuration file is invalid",
            ),
            _ => (ErrorCode::ConfigurationError, "Configuration error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
