use serde::Serialize;
use thiserror::Error;

/// All errors generated in `pairs-analytics`.
///
/// `Clone` so a single in-flight computation result can be handed to every waiter of the
/// [`ResultCache`](crate::cache::ResultCache).
#[derive(Debug, Clone, PartialEq, Serialize, Error)]
pub enum AnalyticsError {
    #[error("malformed trade event: {0}")]
    MalformedEvent(String),

    #[error("insufficient data for {stage}: required {required}, available {available}")]
    InsufficientData {
        stage: &'static str,
        required: usize,
        available: usize,
    },

    #[error("degenerate input: {0}")]
    DegenerateInput(String),

    #[error("series store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("analytics computation exceeded {timeout_ms}ms")]
    ComputeTimeout { timeout_ms: u64 },

    /// Computation task panicked or was cancelled.
    #[error("analytics computation failed: {0}")]
    ComputeFailed(String),
}

impl AnalyticsError {
    /// Construct an [`AnalyticsError::InsufficientData`] for the provided computation stage.
    pub fn insufficient(stage: &'static str, required: usize, available: usize) -> Self {
        Self::InsufficientData {
            stage,
            required,
            available,
        }
    }

    /// Determine if an error only means "not ready yet", ie/ retrying later with more data
    /// (or after the store / in-flight computation recovers) may succeed.
    #[allow(clippy::match_like_matches_macro)]
    pub fn is_not_ready(&self) -> bool {
        match self {
            AnalyticsError::InsufficientData { .. } => true,
            AnalyticsError::StoreUnavailable(_) => true,
            AnalyticsError::ComputeTimeout { .. } => true,
            _ => false,
        }
    }

    /// Short machine readable label used in outbound messages.
    pub fn kind(&self) -> &'static str {
        match self {
            AnalyticsError::MalformedEvent(_) => "malformed_event",
            AnalyticsError::InsufficientData { .. } => "insufficient_data",
            AnalyticsError::DegenerateInput(_) => "degenerate_input",
            AnalyticsError::StoreUnavailable(_) => "store_unavailable",
            AnalyticsError::ComputeTimeout { .. } => "compute_timeout",
            AnalyticsError::ComputeFailed(_) => "compute_failed",
        }
    }
}

/// Errors generated by a [`SeriesStore`](crate::store::SeriesStore) implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt row for {symbol} {interval}: {reason}")]
    Corrupt {
        symbol: String,
        interval: String,
        reason: String,
    },
}

impl From<StoreError> for AnalyticsError {
    fn from(value: StoreError) -> Self {
        Self::StoreUnavailable(value.to_string())
    }
}
