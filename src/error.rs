use thiserror::Error;

/// Every failure the ledger core can surface to a caller.
///
/// Storage-level failures are typed here as well so that callers never have to
/// downcast. Only `Publish` is absorbed internally by the event dispatcher.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("State conflict: {0}")]
    StateConflict(String),
    #[error("Concurrency conflict on {aggregate_id}: expected sequence {expected}, found {actual}")]
    ConcurrencyConflict {
        aggregate_id: String,
        expected: u64,
        actual: u64,
    },
    #[error("Idempotency key '{key}' reused for {operation} with a different request")]
    IdempotencyKeyReuse { operation: String, key: String },
    #[error("Request with idempotency key '{key}' for {operation} is already in flight")]
    DuplicateInFlight { operation: String, key: String },
    #[error("Payment declined: {0}")]
    PaymentDeclined(String),
    #[error("Payment gateway unavailable: {0}")]
    GatewayUnavailable(String),
    #[error("Storage failure: {0}")]
    Storage(String),
    #[error("Publish failure: {0}")]
    Publish(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(feature = "storage-rocksdb")]
impl From<rocksdb::Error> for LedgerError {
    fn from(err: rocksdb::Error) -> Self {
        LedgerError::Storage(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrency_conflict_display() {
        let err = LedgerError::ConcurrencyConflict {
            aggregate_id: "lease-1".to_string(),
            expected: 3,
            actual: 5,
        };
        let display = err.to_string();
        assert!(display.contains("expected sequence 3"));
        assert!(display.contains("found 5"));
    }

    #[test]
    fn test_key_reuse_display() {
        let err = LedgerError::IdempotencyKeyReuse {
            operation: "CREATE_LEASE".to_string(),
            key: "k-1".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Idempotency key 'k-1' reused for CREATE_LEASE with a different request"
        );
    }

    #[test]
    fn test_io_from_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing script");
        let err = LedgerError::from(io_err);
        assert!(err.to_string().contains("missing script"));
    }
}
