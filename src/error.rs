use thiserror::Error;

/// A confidence or threshold value outside its legal range.
///
/// Confidences live in `[0, 1]`, thresholds in `[0, 100]`. Values are never
/// clamped; callers get this error instead.
#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum RangeError {
    #[error("confidence {0} is outside [0, 1]")]
    Confidence(f64),

    #[error("threshold {0} is outside [0, 100]")]
    Threshold(i64),
}

/// Errors that can occur in the tagging pipeline.
#[derive(Error, Debug)]
pub enum TaggerError {
    #[error("A batch is already running")]
    AlreadyRunning,

    #[error("Invalid item identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Value out of range: {0}")]
    OutOfRange(#[from] RangeError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Analysis of item {item_id} failed: {message}")]
    Analysis { item_id: String, message: String },

    #[error("Worker failed: {0}")]
    WorkerFatal(String),

    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for TaggerError {
    fn from(err: anyhow::Error) -> Self {
        TaggerError::Other(format!("{:#}", err))
    }
}

impl TaggerError {
    /// Shorthand for a per-item analysis failure.
    pub fn analysis(item_id: impl Into<String>, message: impl Into<String>) -> Self {
        TaggerError::Analysis {
            item_id: item_id.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TaggerError>;
