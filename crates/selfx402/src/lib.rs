//! x402 payment facilitator core for Celo.
//!
//! Implements HTTP 402 pay-per-request using EIP-712 signed EIP-3009
//! authorizations settled against USDC, an off-chain deferred voucher
//! scheme that aggregates sub-cent payments into single settlements, and
//! Self-protocol nullifier tracking for proof-of-unique-human gating.
//!
//! # Subsystems
//!
//! - [`Facilitator`] — verifies signatures and settles payments on-chain
//! - [`VoucherStore`] + [`DeferredSettlementCoordinator`] — deferred scheme
//! - [`NullifierStore`] + [`IdentityGate`] — Sybil-resistant identity gating
//!
//! # Quick example (verification is pure, no RPC needed)
//!
//! ```no_run
//! use selfx402::{ChainConfig, eip3009};
//! use alloy::primitives::{Address, U256};
//!
//! let chain = ChainConfig::celo_mainnet();
//! let payee: Address = "0x000000000000000000000000000000000000dEaD".parse().unwrap();
//! # let envelope: selfx402::ExactPaymentData = todo!();
//! let outcome = eip3009::verify_envelope(&envelope, &chain, payee, U256::from(1000u64));
//! ```

pub mod chains;
pub mod error;
pub mod hmac;
pub mod payment;
pub mod reason;
pub mod response;

pub mod coordinator;
pub mod eip3009;
pub mod facilitator;
pub mod identity;
pub mod nonce_ledger;
pub mod nullifier_store;
pub mod usdc;
pub mod voucher;
pub mod voucher_store;

use alloy::sol;

// EIP-3009 struct signed by payers. The sol! macro derives SolStruct,
// which provides eip712_signing_hash().
sol! {
    #[derive(Debug, serde::Serialize, serde::Deserialize)]
    struct TransferWithAuthorization {
        address from;
        address to;
        uint256 value;
        uint256 validAfter;
        uint256 validBefore;
        bytes32 nonce;
    }
}

// Off-chain voucher struct. Distinct signing schema from the on-chain
// authorization, identical recovery algorithm.
sol! {
    #[derive(Debug, serde::Serialize, serde::Deserialize)]
    struct PaymentVoucher {
        address payer;
        address payee;
        uint256 amount;
        bytes32 nonce;
        uint256 validUntil;
    }
}

// USDC surface used by the facilitator: EIP-3009 settlement for the
// immediate path, allowance-based transferFrom for aggregated settlement.
sol! {
    #[sol(rpc)]
    interface IUSDC {
        function balanceOf(address owner) external view returns (uint256);
        function allowance(address owner, address spender) external view returns (uint256);
        function transferFrom(address from, address to, uint256 value) external returns (bool);
        function transferWithAuthorization(
            address from,
            address to,
            uint256 value,
            uint256 validAfter,
            uint256 validBefore,
            bytes32 nonce,
            uint8 v,
            bytes32 r,
            bytes32 s
        ) external;
    }
}

// Re-exports
pub use chains::{ChainConfig, ChainRegistry, USDC_DECIMALS};
pub use coordinator::{DeferredConfig, DeferredOutcome, DeferredSettlementCoordinator};
pub use error::FacilitatorError;
pub use facilitator::{Facilitator, EXACT_SCHEME, X402_VERSION};
pub use identity::{
    DisclosurePolicy, IdentityGate, IdentityPolicy, IdentityVerification, NullifierPersistence,
    ProofVerifier, RemoteProofVerifier, ScopeConfig,
};
pub use nullifier_store::NullifierStore;
pub use payment::*;
pub use reason::RejectReason;
pub use response::{SettleResponse, Tier, VerifyResponse};
pub use voucher::{
    AccumulatedBalance, DeferredEnvelope, SettlementRecord, VoucherData, VoucherRecord,
    DEFERRED_SCHEME,
};
pub use voucher_store::VoucherStore;
