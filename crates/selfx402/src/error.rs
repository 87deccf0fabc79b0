use thiserror::Error;

/// Errors returned by facilitator operations.
///
/// Rejections that are part of normal protocol flow (bad signature, expired
/// authorization, duplicate nonce) are NOT errors; they travel as
/// [`crate::reason::RejectReason`] inside successful responses. This enum is
/// for genuine failures: unreachable chain, broken store, malformed input
/// that cannot be mapped to a rejection.
#[derive(Debug, Error)]
pub enum FacilitatorError {
    #[error("unsupported chain: {0}")]
    UnsupportedChain(String),

    #[error("signature error: {0}")]
    Signature(String),

    #[error("chain error: {0}")]
    Chain(String),

    /// Confirmation wait exceeded its bound. The transaction may still
    /// confirm later, so callers must poll by hash, never re-submit.
    #[error("settlement timeout: {0}")]
    SettlementTimeout(String),

    #[error("invalid payment: {0}")]
    InvalidPayment(String),

    #[error("store error: {0}")]
    Store(String),

    /// A voucher with this nonce already exists. Surfaced from the store's
    /// UNIQUE constraint, never resolved silently.
    #[error("duplicate nonce")]
    DuplicateNonce,

    /// A non-expired record already exists for this (nullifier, scope).
    #[error("nullifier already exists for this scope")]
    DuplicateNullifier,

    /// Durable store not configured or unreachable; uniqueness cannot be
    /// enforced, so the operation is refused rather than degraded silently.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("identity service error: {0}")]
    IdentityService(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for FacilitatorError {
    fn from(e: rusqlite::Error) -> Self {
        FacilitatorError::Store(e.to_string())
    }
}
