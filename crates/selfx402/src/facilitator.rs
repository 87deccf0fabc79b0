//! The facilitator orchestrator: verifies payment envelopes and settles
//! them on-chain.
//!
//! Per authorization the state machine is Received → Verified → Settled,
//! or Received → Verified → SettlementFailed, or Received →
//! VerificationFailed. Nothing ever leaves Settled: the durable nonce
//! ledger is claimed immediately before submission and a replayed nonce
//! surfaces `AlreadySettled` instead of a second transaction.

use std::sync::Arc;

use alloy::primitives::{Address, U256};
use alloy::providers::Provider;
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::chains::ChainConfig;
use crate::eip3009;
use crate::error::FacilitatorError;
use crate::nonce_ledger::{InMemoryNonceLedger, NonceLedger};
use crate::payment::{PaymentPayload, PaymentRequirements};
use crate::reason::RejectReason;
use crate::response::{SettleResponse, VerifyResponse};
use crate::usdc;
use crate::TransferWithAuthorization;

/// Wire scheme identifier for immediate payments.
pub const EXACT_SCHEME: &str = "exact";

/// Supported x402 protocol version.
pub const X402_VERSION: u32 = 1;

/// How long settled-nonce claims are retained before purging. The token
/// contract's own authorizer state still rejects reuse after this.
const NONCE_RETENTION_SECS: u64 = 30 * 24 * 60 * 60;

pub struct Facilitator<P> {
    provider: P,
    chain: ChainConfig,
    /// Durable replay barrier for the immediate path.
    nonce_ledger: Arc<dyn NonceLedger>,
    /// Per-payer mutex serializing verify+claim+submit (prevents TOCTOU).
    payer_locks: Arc<DashMap<Address, Arc<Mutex<()>>>>,
}

impl<P> Facilitator<P> {
    /// Create a facilitator with an in-memory nonce ledger.
    ///
    /// # Warning
    /// In-memory claims vanish on restart, reopening the replay window.
    /// Production deployments must chain `.with_nonce_ledger(sqlite)`.
    pub fn new(provider: P, chain: ChainConfig) -> Self {
        Self {
            provider,
            chain,
            nonce_ledger: Arc::new(InMemoryNonceLedger::new()),
            payer_locks: Arc::new(DashMap::new()),
        }
    }

    /// Swap in a durable nonce ledger.
    pub fn with_nonce_ledger(mut self, ledger: Arc<dyn NonceLedger>) -> Self {
        self.nonce_ledger = ledger;
        self
    }

    pub fn chain(&self) -> &ChainConfig {
        &self.chain
    }

    /// Background task purging stale nonce claims and idle payer locks.
    pub fn start_nonce_cleanup(&self)
    where
        P: Send + Sync + 'static,
    {
        let ledger = Arc::clone(&self.nonce_ledger);
        let payer_locks = Arc::clone(&self.payer_locks);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(3600));
            loop {
                interval.tick().await;
                let purged = ledger.purge_expired(NONCE_RETENTION_SECS);
                if purged > 0 {
                    tracing::info!(purged, "purged stale nonce claims");
                }

                // Reclaim payer locks nobody holds. strong_count alone is
                // racy against a concurrent payer_lock() clone, so also
                // require the mutex to be free.
                let before = payer_locks.len();
                payer_locks
                    .retain(|_, lock| Arc::strong_count(lock) > 1 || lock.try_lock().is_err());
                let removed = before - payer_locks.len();
                if removed > 0 {
                    tracing::debug!(removed, "reclaimed idle payer locks");
                }
            }
        });
    }

    /// Bound on concurrent payer-lock entries.
    const MAX_PAYER_LOCKS: usize = 100_000;

    fn payer_lock(&self, payer: Address) -> Result<Arc<Mutex<()>>, FacilitatorError> {
        if self.payer_locks.len() >= Self::MAX_PAYER_LOCKS && !self.payer_locks.contains_key(&payer)
        {
            return Err(FacilitatorError::Chain(
                "too many concurrent payers, try again later".to_string(),
            ));
        }
        Ok(self
            .payer_locks
            .entry(payer)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }

    fn reject(&self, reason: RejectReason, payer: Option<Address>) -> VerifyResponse {
        VerifyResponse {
            is_valid: false,
            invalid_reason: Some(reason.to_string()),
            payer,
            tier: None,
        }
    }

    /// Verify a payment envelope against the requirements.
    ///
    /// Pure CPU work plus one local nonce-ledger read (no chain I/O), so
    /// verification and settlement can be separated by arbitrary delay.
    /// The validity window is deliberately NOT checked here; see
    /// [`Self::settle`].
    pub fn verify(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> VerifyResponse {
        if payload.x402_version != X402_VERSION {
            return self.reject(RejectReason::UnsupportedVersion(payload.x402_version), None);
        }
        if payload.scheme != EXACT_SCHEME {
            return self.reject(RejectReason::UnsupportedScheme(payload.scheme.clone()), None);
        }
        if requirements.scheme != EXACT_SCHEME {
            return self.reject(
                RejectReason::UnsupportedScheme(requirements.scheme.clone()),
                None,
            );
        }
        if payload.network != self.chain.network {
            return self.reject(RejectReason::UnsupportedChain(payload.network.clone()), None);
        }
        if requirements.network != self.chain.network {
            return self.reject(
                RejectReason::UnsupportedChain(requirements.network.clone()),
                None,
            );
        }
        if requirements.asset != self.chain.usdc_address {
            return self.reject(RejectReason::AssetMismatch, None);
        }

        let auth = &payload.payload.authorization;

        // Cheap structural rejects before the ecrecover
        if auth.from == Address::ZERO || auth.to == Address::ZERO {
            return self.reject(RejectReason::ZeroAddress, None);
        }
        if auth.from == auth.to {
            return self.reject(RejectReason::SelfPayment, Some(auth.from));
        }
        if auth.valid_after >= auth.valid_before {
            return self.reject(RejectReason::InvalidWindow, Some(auth.from));
        }

        // Replay check against the durable ledger
        if self.nonce_ledger.is_settled(&auth.nonce) {
            tracing::warn!(
                nonce = %format!("{:.8}", auth.nonce),
                payer = %auth.from,
                "replayed nonce rejected"
            );
            return self.reject(RejectReason::AlreadySettled, Some(auth.from));
        }

        let expected_amount = match requirements.max_amount_required.parse::<U256>() {
            Ok(amount) if !amount.is_zero() => amount,
            Ok(_) => {
                return self.reject(
                    RejectReason::InvalidAmount("required amount must be non-zero".into()),
                    Some(auth.from),
                )
            }
            Err(e) => {
                return self.reject(RejectReason::InvalidAmount(e.to_string()), Some(auth.from))
            }
        };

        match eip3009::verify_envelope(
            &payload.payload,
            &self.chain,
            requirements.pay_to,
            expected_amount,
        ) {
            Ok(payer) => {
                tracing::info!(
                    payer = %payer,
                    amount = %expected_amount,
                    nonce = %format!("{:.8}", auth.nonce),
                    "payment verification succeeded"
                );
                VerifyResponse {
                    is_valid: true,
                    invalid_reason: None,
                    payer: Some(payer),
                    tier: None,
                }
            }
            Err(reason) => self.reject(reason, Some(auth.from)),
        }
    }
}

impl<P> Facilitator<P>
where
    P: Provider + Send + Sync,
{
    /// Settle a verified envelope on-chain.
    ///
    /// Re-verifies under the per-payer lock, applies the authoritative
    /// validity-window check, claims the nonce, then submits. The claim is
    /// never released on failure: a submission that timed out may still
    /// mine, and releasing would allow replay.
    pub async fn settle(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> Result<SettleResponse, FacilitatorError> {
        let auth = &payload.payload.authorization;

        let lock = self.payer_lock(auth.from)?;
        let _guard = lock.lock().await;

        // Callers must not settle an authorization they never verified;
        // re-running the check under the lock enforces it regardless.
        let check = self.verify(payload, requirements);
        if !check.is_valid {
            tracing::warn!(
                payer = %auth.from,
                reason = check.invalid_reason.as_deref().unwrap_or("unknown"),
                "settlement rejected after re-verification"
            );
            return Ok(self.settle_failure(check.invalid_reason, check.payer));
        }

        // Authoritative window check, immediately before submission. An
        // authorization that verified days ago can die here.
        let now = usdc::unix_now()?;
        if let Err(reason) = usdc::check_window(auth.valid_after, auth.valid_before, now) {
            return Ok(self.settle_failure(Some(reason.to_string()), Some(auth.from)));
        }

        // Claim the nonce before submitting. Atomic at the store layer,
        // safe across processes.
        if !self.nonce_ledger.try_claim(auth.nonce) {
            tracing::warn!(
                nonce = %format!("{:.8}", auth.nonce),
                payer = %auth.from,
                "nonce already claimed"
            );
            return Ok(self.settle_failure(
                Some(RejectReason::AlreadySettled.to_string()),
                Some(auth.from),
            ));
        }

        let value = auth
            .value
            .parse::<U256>()
            .map_err(|e| FacilitatorError::InvalidPayment(format!("invalid value: {e}")))?;
        let typed = TransferWithAuthorization {
            from: auth.from,
            to: auth.to,
            value,
            validAfter: U256::from(auth.valid_after),
            validBefore: U256::from(auth.valid_before),
            nonce: auth.nonce,
        };
        let sig_bytes = eip3009::decode_signature_hex(&payload.payload.signature)?;

        match usdc::transfer_with_authorization(&self.provider, &self.chain, &typed, &sig_bytes)
            .await
        {
            Ok(confirmation) => {
                let tx = format!("{}", confirmation.tx_hash);
                tracing::info!(
                    payer = %auth.from,
                    amount = %value,
                    tx = %tx,
                    block = confirmation.block_number,
                    "payment settled"
                );
                Ok(SettleResponse {
                    success: true,
                    error_reason: None,
                    payer: Some(auth.from),
                    explorer_url: Some(self.chain.explorer_tx(&tx)),
                    transaction: Some(tx),
                    block_number: Some(confirmation.block_number),
                    network: self.chain.network.clone(),
                })
            }
            Err(FacilitatorError::SettlementTimeout(m)) => {
                // Indeterminate: the transaction may still confirm. The
                // nonce stays claimed; callers poll by hash.
                tracing::error!(payer = %auth.from, "settlement timed out: {m}");
                Ok(self.settle_failure(
                    Some(RejectReason::SettlementTimeout.to_string()),
                    Some(auth.from),
                ))
            }
            Err(e) => {
                // The nonce stays claimed: the submission may have reached
                // the mempool, and the payer retries with a fresh nonce.
                tracing::error!(
                    payer = %auth.from,
                    nonce = %format!("{:.8}", auth.nonce),
                    error = %e,
                    "settlement failed; nonce remains claimed"
                );
                Ok(self.settle_failure(
                    Some(RejectReason::SettlementFailed(e.to_string()).to_string()),
                    Some(auth.from),
                ))
            }
        }
    }

    /// RPC liveness probe: latest block number.
    pub async fn health_check(&self) -> Result<u64, FacilitatorError> {
        usdc::block_number(&self.provider).await
    }
}

impl<P> Facilitator<P> {
    fn settle_failure(&self, reason: Option<String>, payer: Option<Address>) -> SettleResponse {
        SettleResponse {
            success: false,
            error_reason: reason,
            payer,
            transaction: None,
            block_number: None,
            explorer_url: None,
            network: self.chain.network.clone(),
        }
    }
}
