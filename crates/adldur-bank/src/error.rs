//! Error types for the bank database.

use thiserror::Error;

/// Result type for bank operations.
pub type BankResult<T> = Result<T, BankError>;

/// Errors that can occur while loading or saving a bank database.
#[derive(Debug, Error)]
pub enum BankError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed database JSON.
    #[error("database parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// An instrument references an operator slot that does not exist.
    #[error("instrument {instrument} references operator {index}, but the bank has {count}")]
    OperatorOutOfRange {
        /// Index of the offending instrument.
        instrument: usize,
        /// The out-of-range operator index.
        index: i32,
        /// Number of operators in the bank.
        count: usize,
    },
}
