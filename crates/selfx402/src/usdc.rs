//! On-chain USDC operations: EIP-3009 settlement for the immediate path,
//! allowance-based `transferFrom` for aggregated deferred settlement, and
//! read helpers.
//!
//! Submissions are never retried here: a resubmission that races a
//! still-pending transaction would double-spend the nonce. Bounded retry
//! is applied only to idempotent reads.

use alloy::primitives::{Address, BlockNumber, TxHash, U256};
use alloy::providers::Provider;
use std::time::Duration;

use crate::chains::ChainConfig;
use crate::error::FacilitatorError;
use crate::reason::RejectReason;
use crate::{eip3009, IUSDC, TransferWithAuthorization};

/// Upper bound on submitting a transaction to the RPC.
const SEND_TIMEOUT: Duration = Duration::from_secs(30);
/// Upper bound on waiting for one confirmation. Exceeding it is
/// indeterminate; the transaction may still mine.
const RECEIPT_TIMEOUT: Duration = Duration::from_secs(60);

/// Bounded retry for transient transport failures on reads.
const READ_ATTEMPTS: u32 = 3;
const READ_BACKOFF: Duration = Duration::from_millis(500);

/// One confirmed on-chain transfer.
#[derive(Debug, Clone)]
pub struct Confirmation {
    pub tx_hash: TxHash,
    pub block_number: BlockNumber,
}

/// Authoritative validity-window check, evaluated immediately before
/// submission so an arbitrary verify-to-settle delay cannot widen the
/// race window.
pub fn check_window(valid_after: u64, valid_before: u64, now: u64) -> Result<(), RejectReason> {
    if valid_after >= valid_before {
        return Err(RejectReason::InvalidWindow);
    }
    if now < valid_after {
        return Err(RejectReason::AuthorizationNotYetValid);
    }
    if now > valid_before {
        return Err(RejectReason::AuthorizationExpired);
    }
    Ok(())
}

/// Current unix time in seconds.
pub fn unix_now() -> Result<u64, FacilitatorError> {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|e| FacilitatorError::Config(format!("system time error: {e}")))
}

/// Execute `transferWithAuthorization` with the payer's signature and wait
/// for one confirmation.
///
/// Errors distinguish [`FacilitatorError::SettlementTimeout`] (receipt wait
/// exceeded; callers must poll by hash, never re-submit) from ordinary
/// chain failures (revert, insufficient balance, RPC refusal).
pub async fn transfer_with_authorization<P: Provider>(
    provider: &P,
    chain: &ChainConfig,
    auth: &TransferWithAuthorization,
    signature_bytes: &[u8],
) -> Result<Confirmation, FacilitatorError> {
    let (v, r, s) = eip3009::split_signature(signature_bytes)?;
    let contract = IUSDC::new(chain.usdc_address, provider);

    let call = contract.transferWithAuthorization(
        auth.from,
        auth.to,
        auth.value,
        auth.validAfter,
        auth.validBefore,
        auth.nonce,
        v,
        r,
        s,
    );

    let pending = tokio::time::timeout(SEND_TIMEOUT, call.send())
        .await
        .map_err(|_| {
            FacilitatorError::SettlementTimeout("transferWithAuthorization send timed out".into())
        })?
        .map_err(|e| {
            FacilitatorError::Chain(format!("transferWithAuthorization send failed: {e}"))
        })?;

    let tx_hash = *pending.tx_hash();

    let receipt = tokio::time::timeout(RECEIPT_TIMEOUT, pending.get_receipt())
        .await
        .map_err(|_| {
            FacilitatorError::SettlementTimeout(format!(
                "no confirmation for {tx_hash} within {}s",
                RECEIPT_TIMEOUT.as_secs()
            ))
        })?
        .map_err(|e| {
            FacilitatorError::Chain(format!("transferWithAuthorization receipt failed: {e}"))
        })?;

    if !receipt.status() {
        return Err(FacilitatorError::Chain(
            "transferWithAuthorization reverted".to_string(),
        ));
    }

    Ok(Confirmation {
        tx_hash: receipt.transaction_hash,
        block_number: receipt.block_number.unwrap_or_default(),
    })
}

/// Execute `transferFrom(payer, payee, total)` for an aggregated deferred
/// settlement. Requires a prior allowance from the payer to the
/// facilitator wallet.
pub async fn transfer_from<P: Provider>(
    provider: &P,
    chain: &ChainConfig,
    payer: Address,
    payee: Address,
    total: U256,
) -> Result<Confirmation, FacilitatorError> {
    let contract = IUSDC::new(chain.usdc_address, provider);

    let pending = tokio::time::timeout(SEND_TIMEOUT, contract.transferFrom(payer, payee, total).send())
        .await
        .map_err(|_| FacilitatorError::SettlementTimeout("transferFrom send timed out".into()))?
        .map_err(|e| FacilitatorError::Chain(format!("transferFrom send failed: {e}")))?;

    let tx_hash = *pending.tx_hash();

    let receipt = tokio::time::timeout(RECEIPT_TIMEOUT, pending.get_receipt())
        .await
        .map_err(|_| {
            FacilitatorError::SettlementTimeout(format!(
                "no confirmation for {tx_hash} within {}s",
                RECEIPT_TIMEOUT.as_secs()
            ))
        })?
        .map_err(|e| FacilitatorError::Chain(format!("transferFrom receipt failed: {e}")))?;

    if !receipt.status() {
        return Err(FacilitatorError::Chain("transferFrom reverted".to_string()));
    }

    Ok(Confirmation {
        tx_hash: receipt.transaction_hash,
        block_number: receipt.block_number.unwrap_or_default(),
    })
}

/// USDC balance of `owner`, with bounded retry on transport failure.
pub async fn balance_of<P: Provider>(
    provider: &P,
    chain: &ChainConfig,
    owner: Address,
) -> Result<U256, FacilitatorError> {
    with_read_retry(|| async {
        let contract = IUSDC::new(chain.usdc_address, provider);
        contract
            .balanceOf(owner)
            .call()
            .await
            .map_err(|e| FacilitatorError::Chain(format!("balanceOf failed: {e}")))
    })
    .await
}

/// Latest block number; used by health checks.
pub async fn block_number<P: Provider>(provider: &P) -> Result<u64, FacilitatorError> {
    with_read_retry(|| async {
        provider
            .get_block_number()
            .await
            .map_err(|e| FacilitatorError::Chain(format!("block number query failed: {e}")))
    })
    .await
}

async fn with_read_retry<T, F, Fut>(mut call: F) -> Result<T, FacilitatorError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, FacilitatorError>>,
{
    let mut last_err = None;
    for attempt in 1..=READ_ATTEMPTS {
        match call().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt < READ_ATTEMPTS {
                    tracing::debug!(attempt, error = %e, "read failed, retrying");
                    tokio::time::sleep(READ_BACKOFF).await;
                }
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| FacilitatorError::Chain("read failed".into())))
}
