//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use crate::codec::ProfileCodec;
use crate::config::DEFAULT_CONSENT_TEXT;
use crate::crypto::FieldCipher;
use crate::ledger::ConsentLedger;
use crate::store::MemoryStore;

/// Application state shared across all request handlers.
///
/// All fields are cheaply cloneable so that Axum can clone the state for each
/// request.
#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<ConsentLedger>,
    pub codec: ProfileCodec,
    /// Page size of `GET /consents` when the query has none.
    pub default_page_size: usize,
}

impl AppState {
    pub fn new(ledger: ConsentLedger, codec: ProfileCodec, default_page_size: usize) -> Self {
        Self {
            ledger: Arc::new(ledger),
            codec,
            default_page_size,
        }
    }
}

impl Default for AppState {
    /// An in-memory store with a passthrough cipher, suitable for tests.
    fn default() -> Self {
        let codec = ProfileCodec::new(Arc::new(FieldCipher::passthrough()));
        let ledger = ConsentLedger::new(
            Arc::new(MemoryStore::with_schema()),
            codec.clone(),
            DEFAULT_CONSENT_TEXT,
        );
        Self::new(ledger, codec, 20)
    }
}
