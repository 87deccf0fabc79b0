//! Deferred settlement: turning accumulated vouchers into one on-chain
//! transfer.
//!
//! The chain and the ledger are separate systems of record, so the
//! transaction hash doubles as the idempotency key: finalization checks
//! for an existing settlement referencing the hash before writing, and the
//! ledger write retries to completion rather than assuming atomicity with
//! the transfer.

use std::sync::Arc;

use alloy::primitives::{Address, U256};
use alloy::providers::Provider;

use crate::chains::ChainConfig;
use crate::error::FacilitatorError;
use crate::usdc;
use crate::voucher::{
    self, SettlementRecord, DEFAULT_MIN_SETTLEMENT_AMOUNT, DEFAULT_MIN_VOUCHER_COUNT,
};
use crate::voucher_store::VoucherStore;

/// Thresholds and economics knobs for deferred settlement.
#[derive(Debug, Clone)]
pub struct DeferredConfig {
    /// Settle once accumulated value reaches this (smallest unit).
    pub min_settlement_amount: U256,
    /// Settle once this many vouchers accumulate.
    pub min_voucher_count: usize,
    /// Estimated on-chain cost of one settlement, in the asset's smallest
    /// unit.
    pub estimated_gas_cost: U256,
    /// Warn when total/gas falls below this ratio.
    pub min_profit_ratio: u64,
}

impl Default for DeferredConfig {
    fn default() -> Self {
        Self {
            min_settlement_amount: U256::from(DEFAULT_MIN_SETTLEMENT_AMOUNT),
            min_voucher_count: DEFAULT_MIN_VOUCHER_COUNT,
            // Roughly $0.02 at 6 decimals
            estimated_gas_cost: U256::from(20_000u64),
            min_profit_ratio: 2,
        }
    }
}

/// Result of one settlement attempt for a payer/payee pair.
#[derive(Debug)]
pub enum DeferredOutcome {
    /// Thresholds or economics not met. Not an error; vouchers keep
    /// accumulating.
    NoAction { reason: String },
    Settled(SettlementRecord),
}

/// Composes the voucher ledger with on-chain execution.
pub struct DeferredSettlementCoordinator<P> {
    provider: P,
    chain: ChainConfig,
    store: Arc<VoucherStore>,
    config: DeferredConfig,
}

impl<P> DeferredSettlementCoordinator<P> {
    pub fn new(provider: P, chain: ChainConfig, store: Arc<VoucherStore>, config: DeferredConfig) -> Self {
        Self {
            provider,
            chain,
            store,
            config,
        }
    }

    pub fn config(&self) -> &DeferredConfig {
        &self.config
    }
}

impl<P> DeferredSettlementCoordinator<P>
where
    P: Provider + Send + Sync,
{
    /// Settle all viable payers owing the given payee. Pairs that are not
    /// yet worth settling report `NoAction` individually.
    pub async fn settle_payee(
        &self,
        payee: Address,
    ) -> Result<Vec<(Address, DeferredOutcome)>, FacilitatorError> {
        let balances = self.store.accumulated_balances(payee, &self.chain.network)?;
        let mut outcomes = Vec::with_capacity(balances.len());
        for balance in balances {
            let outcome = self.settle_pair(balance.payer, payee).await?;
            outcomes.push((balance.payer, outcome));
        }
        Ok(outcomes)
    }

    /// Settle one payer/payee pair if the accumulated vouchers justify it.
    ///
    /// At most one on-chain transfer per candidate set: vouchers stay
    /// unsettled on chain failure (retry at the next trigger), and the
    /// ledger write after a confirmed transfer is idempotent on the
    /// transaction hash.
    pub async fn settle_pair(
        &self,
        payer: Address,
        payee: Address,
    ) -> Result<DeferredOutcome, FacilitatorError> {
        let unsettled = self.store.get_unsettled(payer, payee, &self.chain.network)?;

        let candidates = voucher::settlement_candidates(
            unsettled,
            self.config.min_settlement_amount,
            self.config.min_voucher_count,
        );
        if !candidates.should_settle {
            return Ok(DeferredOutcome::NoAction {
                reason: candidates.reason,
            });
        }

        let aggregation = voucher::can_aggregate(&candidates.candidates);
        if !aggregation.is_valid() {
            // Ledger invariant breach; refuse to touch the chain.
            return Err(FacilitatorError::InvalidPayment(format!(
                "candidate set cannot aggregate: {}",
                aggregation.error_strings().join("; ")
            )));
        }

        let total = voucher::calculate_aggregated_amount(&candidates.candidates);
        let viability = voucher::is_settlement_viable(
            total,
            self.config.estimated_gas_cost,
            self.config.min_profit_ratio,
        );
        if !viability.is_valid() {
            return Ok(DeferredOutcome::NoAction {
                reason: viability.error_strings().join("; "),
            });
        }
        for warning in &viability.warnings {
            tracing::warn!(payer = %payer, payee = %payee, "{warning}");
        }

        let voucher_ids: Vec<String> = candidates
            .candidates
            .iter()
            .map(|r| r.id.clone())
            .collect();

        tracing::info!(
            payer = %payer,
            payee = %payee,
            total = %total,
            count = voucher_ids.len(),
            "executing aggregated settlement"
        );

        // One transfer for the sum; the stored voucher signatures are the
        // off-chain proof of authorization, not replayed individually.
        let confirmation =
            usdc::transfer_from(&self.provider, &self.chain, payer, payee, total).await?;
        let tx_hash = format!("{}", confirmation.tx_hash);

        // The transfer is confirmed; the ledger write must now reach
        // completion. Bounded retry before surfacing the hash for manual
        // reconciliation.
        let mut last_err = None;
        for attempt in 1..=3u32 {
            match self.store.finalize_settlement(
                &tx_hash,
                payer,
                payee,
                total,
                &voucher_ids,
                &self.chain.network,
            ) {
                Ok(record) => {
                    tracing::info!(
                        tx = %tx_hash,
                        count = record.voucher_count,
                        "settlement finalized"
                    );
                    return Ok(DeferredOutcome::Settled(record));
                }
                Err(e) => {
                    tracing::error!(
                        attempt,
                        tx = %tx_hash,
                        error = %e,
                        "failed to finalize settlement after confirmed transfer"
                    );
                    last_err = Some(e);
                }
            }
        }

        Err(FacilitatorError::Store(format!(
            "settlement {tx_hash} confirmed on-chain but ledger write failed: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}
