use diesel::result::{DatabaseErrorKind, Error as DieselError};
use ledger_shared::{ApprovalStatus, UnknownCode};
use thiserror::Error;
use uuid::Uuid;

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// Bad input shape, rejected before any transaction opens.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Approval request {id} is already {status}")]
    AlreadyResolved { id: Uuid, status: ApprovalStatus },

    #[error("Insufficient stock for product {product} (current: {have}, requested: {want})")]
    InsufficientStock {
        product_id: Uuid,
        product: String,
        have: i32,
        want: i32,
    },

    #[error("Duplicate reference: {0}")]
    DuplicateReference(String),

    /// Lock timeout, deadlock or lost connection. Retry the whole operation.
    #[error("Transient store error: {0}")]
    Transient(String),

    #[error("Deadline exceeded before the unit of work could commit")]
    DeadlineExceeded,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// An invariant was violated. Never corrected silently.
    #[error("Fatal: {0}")]
    Fatal(String),
}

impl LedgerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Transient(_) | LedgerError::DeadlineExceeded)
    }

    pub fn not_found(entity: &str, id: impl std::fmt::Display) -> Self {
        LedgerError::NotFound(format!("{} {}", entity, id))
    }
}

impl From<DieselError> for LedgerError {
    fn from(err: DieselError) -> Self {
        match err {
            DieselError::NotFound => LedgerError::NotFound("record not found".to_string()),
            DieselError::DatabaseError(kind, info) => {
                let message = info.message().to_string();
                match kind {
                    DatabaseErrorKind::UniqueViolation => {
                        let constraint = info.constraint_name().unwrap_or("unique constraint");
                        LedgerError::DuplicateReference(format!("{}: {}", constraint, message))
                    }
                    DatabaseErrorKind::SerializationFailure
                    | DatabaseErrorKind::ClosedConnection
                    | DatabaseErrorKind::UnableToSendCommand => LedgerError::Transient(message),
                    _ if is_lock_conflict(&message) => LedgerError::Transient(message),
                    _ => LedgerError::Fatal(message),
                }
            }
            DieselError::BrokenTransactionManager => {
                LedgerError::Transient("broken transaction manager".to_string())
            }
            other => LedgerError::Fatal(other.to_string()),
        }
    }
}

fn is_lock_conflict(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("deadlock detected")
        || message.contains("lock timeout")
        || message.contains("canceling statement due to")
        || message.contains("could not obtain lock")
}

impl<E: std::error::Error + 'static> From<bb8::RunError<E>> for LedgerError {
    fn from(err: bb8::RunError<E>) -> Self {
        LedgerError::Transient(format!("connection pool: {}", err))
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        LedgerError::Validation(format!("malformed JSON: {}", err))
    }
}

impl From<UnknownCode> for LedgerError {
    /// Codes read back from storage; request input is validated separately.
    fn from(err: UnknownCode) -> Self {
        LedgerError::Fatal(err.to_string())
    }
}
