//! Typed rejection reasons.
//!
//! Every rejected verification or settlement carries one of these; the wire
//! representation is the human-readable `Display` string, so callers always
//! see a stable, descriptive reason and never a bare HTTP 200.

use std::fmt;

/// Why a payment, voucher, or identity proof was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    PayeeMismatch,
    AmountMismatch,
    AssetMismatch,
    SignatureMismatch,
    AuthorizationNotYetValid,
    AuthorizationExpired,
    /// The authorization window is inverted (validAfter >= validBefore).
    InvalidWindow,
    /// This nonce was already claimed by a prior settlement attempt.
    AlreadySettled,
    DuplicateNonce,
    DuplicateNullifier,
    VoucherExpired,
    UnsupportedChain(String),
    UnsupportedScheme(String),
    UnsupportedVersion(u32),
    SelfPayment,
    ZeroAddress,
    InvalidAmount(String),
    InvalidNonce,
    InvalidSignatureFormat,
    /// Aggregated value does not justify the on-chain cost.
    NotViable(String),
    StoreUnavailable,
    SettlementTimeout,
    SettlementFailed(String),
    IdentityRejected(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PayeeMismatch => write!(f, "payee mismatch"),
            Self::AmountMismatch => write!(f, "amount mismatch"),
            Self::AssetMismatch => write!(f, "asset contract mismatch"),
            Self::SignatureMismatch => write!(f, "signature mismatch: signer is not the payer"),
            Self::AuthorizationNotYetValid => write!(f, "authorization not yet valid"),
            Self::AuthorizationExpired => write!(f, "authorization expired"),
            Self::InvalidWindow => write!(f, "invalid validity window"),
            Self::AlreadySettled => write!(f, "authorization already settled"),
            Self::DuplicateNonce => write!(f, "duplicate nonce"),
            Self::DuplicateNullifier => {
                write!(f, "duplicate verification: nullifier already used for this scope")
            }
            Self::VoucherExpired => write!(f, "voucher expired"),
            Self::UnsupportedChain(n) => write!(f, "unsupported network: {n}"),
            Self::UnsupportedScheme(s) => write!(f, "unsupported scheme: {s}"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported x402 version: {v}"),
            Self::SelfPayment => write!(f, "payer and payee must differ"),
            Self::ZeroAddress => write!(f, "zero address not allowed"),
            Self::InvalidAmount(m) => write!(f, "invalid amount: {m}"),
            Self::InvalidNonce => write!(f, "invalid nonce format (must be 32 bytes)"),
            Self::InvalidSignatureFormat => {
                write!(f, "invalid signature format (must be 65 bytes)")
            }
            Self::NotViable(m) => write!(f, "settlement not viable: {m}"),
            Self::StoreUnavailable => write!(f, "durable store unavailable"),
            Self::SettlementTimeout => {
                write!(f, "settlement timeout: transaction status indeterminate")
            }
            Self::SettlementFailed(m) => write!(f, "settlement failed: {m}"),
            Self::IdentityRejected(m) => write!(f, "identity verification failed: {m}"),
        }
    }
}
