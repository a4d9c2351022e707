//! Error types for the measurement engine.

use thiserror::Error;

/// Result type for measurement operations.
pub type MeasureResult<T> = Result<T, MeasureError>;

/// Errors that can occur while measuring instrument durations.
#[derive(Debug, Error)]
pub enum MeasureError {
    /// An instrument references an operator slot that does not resolve.
    #[error("instrument references unknown operator index {index}")]
    UnknownOperator {
        /// The unresolvable operator index.
        index: i32,
    },

    /// A synthesizer call arrived out of sequence.
    #[error("synthesizer call '{call}' out of order: requires state {requires}, found {found}")]
    OutOfOrder {
        /// The rejected call.
        call: &'static str,
        /// The state the call requires.
        requires: &'static str,
        /// The state the synthesizer was actually in.
        found: &'static str,
    },

    /// Cache file does not start with a known magic header.
    #[error("cache file has an unrecognized magic header")]
    CacheMagic,

    /// Cache file ended mid-record.
    #[error("cache file is truncated or corrupt ({context})")]
    CacheTruncated {
        /// Which part of the file could not be read.
        context: &'static str,
    },

    /// Measured and declared silence verdicts disagree.
    #[error("{count} instruments disagree with their declared silence flags")]
    SilenceMismatch {
        /// Number of disagreeing instruments.
        count: usize,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
