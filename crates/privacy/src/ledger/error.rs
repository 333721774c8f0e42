//! Errors surfaced by the consent ledger.

use common::ServiceError;
use thiserror::Error;
use uuid::Uuid;

use crate::store::StoreError;

/// Ledger failures. Store errors are translated into
/// [`LedgerError::Persistence`] and never escape in raw form.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The store failed; the consent transition was not recorded.
    #[error("consent store failure: {0}")]
    Persistence(String),

    /// There is no consent to act on.
    #[error("no consent record for student {0}")]
    NoConsentRecord(Uuid),

    /// The current consent is already withdrawn.
    #[error("consent for student {0} is already withdrawn")]
    AlreadyWithdrawn(Uuid),

    /// A stored row could not be read as a consent record or event.
    #[error("malformed consent data: {0}")]
    CorruptRecord(String),
}

impl From<StoreError> for LedgerError {
    fn from(e: StoreError) -> Self {
        LedgerError::Persistence(e.to_string())
    }
}

impl From<LedgerError> for ServiceError {
    /// Callers get a generic message; the detailed cause is only logged.
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::Persistence(_) => {
                ServiceError::Unavailable("failed to save or load consent".into())
            }
            LedgerError::NoConsentRecord(_) => {
                ServiceError::NotFound("no consent has been given for this student".into())
            }
            LedgerError::AlreadyWithdrawn(_) => {
                ServiceError::Conflict("consent is already withdrawn".into())
            }
            LedgerError::CorruptRecord(_) => {
                ServiceError::Internal("failed to save or load consent".into())
            }
        }
    }
}
