//! Error taxonomy for query execution.
//!
//! Every variant carries the offending input or, for backend failures,
//! the [`RetryState`] the controller had reached when it gave up.

use std::time::Duration;

use kibana_harness_core::chunk::SummarizeError;
use kibana_harness_core::time_filter::TimeFilterError;
use thiserror::Error;

use crate::retry::RetryState;

#[derive(Debug, Clone, Error)]
pub enum QueryError {
    #[error(transparent)]
    InvalidTimeFilter(#[from] TimeFilterError),

    #[error("invalid {field} '{value}': {reason}")]
    InvalidRequest {
        field: &'static str,
        value: String,
        reason: String,
    },

    /// The backend rejected the query schema and no fallback remained.
    #[error("schema mismatch on field '{field}' (state: {state})")]
    SchemaMismatch { field: String, state: RetryState },

    #[error("authentication failed: {message} (state: {state}); supply a fresh token")]
    Auth { message: String, state: RetryState },

    #[error("backend unavailable after {attempts} attempt(s): {last_error} (state: {state})")]
    BackendUnavailable {
        attempts: u32,
        last_error: String,
        state: RetryState,
    },

    #[error("backend error{}: {message} (state: {state})", .status.map(|s| format!(" {}", s)).unwrap_or_default())]
    Backend {
        status: Option<u16>,
        message: String,
        state: RetryState,
    },

    #[error("query timed out after {after:?} (state: {state})")]
    Timeout { after: Duration, state: RetryState },

    /// Failure of a shared in-flight fetch, as seen by a waiter.
    #[error("in-flight fetch {fingerprint} failed: {cause}")]
    CacheStampedeFailure {
        fingerprint: String,
        cause: Box<QueryError>,
    },

    #[error("connection pool error: {message}")]
    Pool { message: String },

    #[error(transparent)]
    Summarization(#[from] SummarizeError),

    #[error("no index pattern selected; pass one explicitly or run `kh use-index <pattern>`")]
    NoIndexSelected,
}

impl QueryError {
    pub fn invalid(field: &'static str, value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            field,
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// The originating error, looking through stampede wrapping.
    pub fn root(&self) -> &QueryError {
        match self {
            Self::CacheStampedeFailure { cause, .. } => cause.root(),
            other => other,
        }
    }

    /// Retry state reached, for backend-originated failures.
    pub fn state(&self) -> Option<RetryState> {
        match self.root() {
            Self::SchemaMismatch { state, .. }
            | Self::Auth { state, .. }
            | Self::BackendUnavailable { state, .. }
            | Self::Backend { state, .. }
            | Self::Timeout { state, .. } => Some(*state),
            _ => None,
        }
    }
}
