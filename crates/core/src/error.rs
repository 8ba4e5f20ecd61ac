//! Error types for the cta-trader system.

use thiserror::Error;

use crate::types::{ReservationId, TimestampMs};

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the cta-trader system.
#[derive(Error, Debug)]
pub enum Error {
    /// Not enough available cash to reserve for a buy.
    #[error("Insufficient funds: required {required:.8}, available {available:.8}")]
    InsufficientFunds { required: f64, available: f64 },

    /// Not enough unreserved long quantity to sell.
    #[error("Insufficient position in {symbol}: requested {requested}, available {available}")]
    InsufficientPosition {
        symbol: String,
        requested: f64,
        available: f64,
    },

    /// Reservation handle is not outstanding.
    #[error("Unknown reservation: {0}")]
    UnknownReservation(ReservationId),

    /// Backtest range is empty or inverted.
    #[error("Invalid range: start {start} is not before end {end}")]
    InvalidRange { start: TimestampMs, end: TimestampMs },

    /// Bar sequence is not strictly increasing.
    #[error("Out-of-order bar for {symbol}: {current} does not follow {previous}")]
    OutOfOrderBar {
        symbol: String,
        previous: TimestampMs,
        current: TimestampMs,
    },

    /// Ledger invariant broken. Indicates a logic defect.
    #[error("Invariant violation: {0}")]
    Invariant(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data error (invalid or missing data).
    #[error("Data error: {0}")]
    Data(String),

    /// Malformed order intent or fill.
    #[error("Order error: {0}")]
    Order(String),

    /// Database error.
    #[error("Database error: {0}")]
    Database(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a data error.
    pub fn data(msg: impl Into<String>) -> Self {
        Error::Data(msg.into())
    }

    /// Create an order error.
    pub fn order(msg: impl Into<String>) -> Self {
        Error::Order(msg.into())
    }

    /// Create a database error.
    pub fn database(msg: impl Into<String>) -> Self {
        Error::Database(msg.into())
    }

    /// Create an invariant violation.
    pub fn invariant(msg: impl Into<String>) -> Self {
        Error::Invariant(msg.into())
    }

    /// Business-rule rejection that a strategy is expected to handle.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::InsufficientFunds { .. } | Error::InsufficientPosition { .. }
        )
    }

    /// Errors that must halt a run instead of being reported to the strategy.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Invariant(_) | Error::OutOfOrderBar { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let funds = Error::InsufficientFunds {
            required: 10.0,
            available: 5.0,
        };
        assert!(funds.is_rejection());
        assert!(!funds.is_fatal());

        let broken = Error::invariant("negative cash");
        assert!(broken.is_fatal());
        assert!(!broken.is_rejection());

        assert!(!Error::UnknownReservation(ReservationId(3)).is_rejection());
    }

    #[test]
    fn test_display() {
        let err = Error::InvalidRange { start: 10, end: 5 };
        assert_eq!(err.to_string(), "Invalid range: start 10 is not before end 5");
    }
}
