use crate::types::PairStatus;
use thiserror::Error;

/// Desk-wide error taxonomy. Every failure is scoped to the pair index that
/// triggered it and surfaces as a `PairStatus` on that slot; nothing here is
/// allowed to halt the scheduler or touch sibling slots.
#[derive(Debug, Clone, Error)]
pub enum DeskError {
    /// Network/connectivity failure for a single request.
    #[error("Network Error: {0}")]
    Network(String),

    /// The upstream source rejected the pair configuration itself.
    #[error("Invalid Pair: {0}")]
    InvalidPair(String),

    /// The upstream source throttled the request.
    #[error("Rate Limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: f64 },

    /// Channel-level failure of the streamed multi-pair fetch.
    #[error("Stream Error: {0}")]
    Stream(String),

    /// Malformed payloads from the upstream source.
    #[error("Parse Error: {0}")]
    Parse(String),

    /// Configuration errors (env vars, URLs).
    #[error("Config Error: {0}")]
    Config(String),

    /// Slot index outside the contiguous 0..N-1 range.
    #[error("Index out of range: {0}")]
    IndexOutOfRange(usize),
}

impl DeskError {
    /// Whether the next explicit refresh cycle (manual or background) may
    /// reasonably retry the operation. There is never an automatic inline
    /// retry; this only drives background-refresh eligibility and logging.
    pub fn is_recoverable(&self) -> bool {
        match self {
            DeskError::Network(_) => true,
            DeskError::InvalidPair(_) => false,
            DeskError::RateLimited { .. } => true,
            DeskError::Stream(_) => true,
            DeskError::Parse(_) => false,
            DeskError::Config(_) => false,
            DeskError::IndexOutOfRange(_) => false,
        }
    }

    /// The status value a failing slot should carry.
    pub fn pair_status(&self) -> PairStatus {
        match self {
            DeskError::InvalidPair(_) => PairStatus::Invalid,
            DeskError::RateLimited { .. } => PairStatus::RateLimited,
            _ => PairStatus::Error,
        }
    }

    /// Seconds to hold off when rate limited, zero otherwise.
    pub fn retry_after(&self) -> f64 {
        match self {
            DeskError::RateLimited { retry_after_secs } => *retry_after_secs,
            _ => 0.0,
        }
    }
}

impl From<reqwest::Error> for DeskError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DeskError::Network(format!("request timed out: {}", err))
        } else if err.is_decode() {
            DeskError::Parse(format!("response decode error: {}", err))
        } else {
            DeskError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for DeskError {
    fn from(err: serde_json::Error) -> Self {
        DeskError::Parse(format!("JSON serialization/deserialization error: {}", err))
    }
}

impl From<url::ParseError> for DeskError {
    fn from(err: url::ParseError) -> Self {
        DeskError::Config(format!("invalid URL: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, DeskError>;
