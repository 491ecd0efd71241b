use thiserror::Error;
use tokio_postgres::error::SqlState;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Malformed or constraint-violating row. The enclosing batch is not applied.
    #[error("validation error: {0}")]
    Validation(String),

    /// A required row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Concurrent writers raced for the same row. Retry with a fresh unit of work.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Storage cannot be reached or stopped responding.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// An earlier operation failed and the unit of work only accepts `close`.
    #[error("unit of work aborted by an earlier failure")]
    Aborted,
}

impl From<tokio_postgres::Error> for StoreError {
    fn from(err: tokio_postgres::Error) -> Self {
        if err.is_closed() {
            return StoreError::Unavailable(err.to_string());
        }
        let Some(code) = err.code() else {
            return StoreError::Unavailable(err.to_string());
        };
        let constraint = err
            .as_db_error()
            .and_then(|e| e.constraint())
            .unwrap_or_default()
            .to_owned();
        if code == &SqlState::UNIQUE_VIOLATION {
            // Primary keys are assigned from max(id) + 1, so a clash on
            // one means another writer got there first.
            if constraint.ends_with("_pkey") {
                StoreError::Conflict(err.to_string())
            } else {
                StoreError::Validation(err.to_string())
            }
        } else if code == &SqlState::T_R_SERIALIZATION_FAILURE
            || code == &SqlState::T_R_DEADLOCK_DETECTED
        {
            StoreError::Conflict(err.to_string())
        } else if code == &SqlState::CHECK_VIOLATION
            || code == &SqlState::NOT_NULL_VIOLATION
            || code == &SqlState::FOREIGN_KEY_VIOLATION
            || code == &SqlState::NUMERIC_VALUE_OUT_OF_RANGE
            || code == &SqlState::STRING_DATA_RIGHT_TRUNCATION
            || code == &SqlState::CARDINALITY_VIOLATION
        {
            StoreError::Validation(err.to_string())
        } else {
            StoreError::Unavailable(err.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}
