//! Off-chain payment vouchers: wire types, business validation,
//! aggregation rules, and settlement-viability heuristics.
//!
//! A voucher is a small signed payment promise. Many vouchers accumulate
//! in the [`crate::voucher_store`] before one aggregated on-chain transfer
//! settles them, amortizing gas across the batch.

use alloy::primitives::{Address, FixedBytes, B256, U256};
use alloy::sol_types::SolStruct;
use serde::{Deserialize, Serialize};

use crate::chains::ChainConfig;
use crate::eip3009;
use crate::reason::RejectReason;
use crate::PaymentVoucher;

/// Wire scheme identifier for deferred payments.
pub const DEFERRED_SCHEME: &str = "deferred";

/// Amount above which a voucher earns a "use immediate settlement" warning
/// ($1000 at 6 decimals).
pub const LARGE_VOUCHER_WARNING: u64 = 1_000_000_000;

/// Warn when a voucher's validity window exceeds this (7 days).
pub const MAX_VALIDITY_SECS: u64 = 7 * 24 * 60 * 60;

/// Warn when a voucher expires sooner than this (5 minutes).
pub const MIN_VALIDITY_SECS: u64 = 5 * 60;

/// Default settlement threshold by value ($10 at 6 decimals).
pub const DEFAULT_MIN_SETTLEMENT_AMOUNT: u64 = 10_000_000;

/// Default settlement threshold by count.
pub const DEFAULT_MIN_VOUCHER_COUNT: usize = 5;

/// A voucher as submitted by a client. Address and nonce well-formedness
/// is enforced by the types at deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoucherData {
    pub payer: Address,
    pub payee: Address,
    /// Amount in USDC smallest unit, as a decimal string.
    pub amount: String,
    pub nonce: FixedBytes<32>,
    /// Unix seconds after which the voucher is void.
    pub valid_until: u64,
}

/// The envelope wrapping a signed voucher on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeferredEnvelope {
    pub scheme: String,
    pub network: String,
    pub voucher: VoucherData,
    pub signature: String,
}

/// A voucher once accepted and persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoucherRecord {
    pub id: String,
    pub payer: Address,
    pub payee: Address,
    pub amount: U256,
    pub nonce: FixedBytes<32>,
    pub signature: String,
    pub valid_until: u64,
    pub settled: bool,
    pub network: String,
    pub created_at: i64,
}

/// One aggregated on-chain settlement and the vouchers it covered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementRecord {
    pub id: String,
    pub tx_hash: String,
    pub payer: Address,
    pub payee: Address,
    pub total_amount: String,
    pub voucher_count: usize,
    pub voucher_ids: Vec<String>,
    pub network: String,
    pub settled_at: i64,
}

/// Unsettled value owed by one payer to one payee. Derived on demand,
/// never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccumulatedBalance {
    pub payer: Address,
    pub payee: Address,
    pub total_amount: String,
    pub voucher_count: usize,
    pub voucher_ids: Vec<String>,
}

/// Outcome of a validation pass. Errors reject; warnings travel back to
/// the caller but do not block acceptance.
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub errors: Vec<RejectReason>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn error_strings(&self) -> Vec<String> {
        self.errors.iter().map(|e| e.to_string()).collect()
    }
}

/// Business-rule validation applied before a voucher is accepted.
pub fn validate_voucher(voucher: &VoucherData, now: u64) -> ValidationReport {
    let mut report = ValidationReport::default();

    match voucher.amount.parse::<U256>() {
        Ok(amount) => {
            if amount.is_zero() {
                report
                    .errors
                    .push(RejectReason::InvalidAmount("must be greater than zero".into()));
            } else if amount > U256::from(LARGE_VOUCHER_WARNING) {
                report.warnings.push(
                    "amount exceeds $1000 — consider immediate settlement instead".to_string(),
                );
            }
        }
        Err(e) => report.errors.push(RejectReason::InvalidAmount(e.to_string())),
    }

    if voucher.payer == voucher.payee {
        report.errors.push(RejectReason::SelfPayment);
    }
    if voucher.payer == Address::ZERO || voucher.payee == Address::ZERO {
        report.errors.push(RejectReason::ZeroAddress);
    }

    if voucher.valid_until <= now {
        report.errors.push(RejectReason::VoucherExpired);
    } else {
        let remaining = voucher.valid_until - now;
        if remaining > MAX_VALIDITY_SECS {
            report
                .warnings
                .push("expiration is more than 7 days in the future".to_string());
        }
        if remaining < MIN_VALIDITY_SECS {
            report
                .warnings
                .push("voucher expires in less than 5 minutes".to_string());
        }
    }

    report
}

/// Validate the full deferred envelope: scheme, network, signature format,
/// then the voucher itself.
pub fn validate_envelope(
    envelope: &DeferredEnvelope,
    known_networks: &[&str],
    now: u64,
) -> ValidationReport {
    let mut report = validate_voucher(&envelope.voucher, now);

    if envelope.scheme != DEFERRED_SCHEME {
        report
            .errors
            .push(RejectReason::UnsupportedScheme(envelope.scheme.clone()));
    }
    if !known_networks.contains(&envelope.network.as_str()) {
        report
            .errors
            .push(RejectReason::UnsupportedChain(envelope.network.clone()));
    }

    let hex = envelope
        .signature
        .strip_prefix("0x")
        .unwrap_or(&envelope.signature);
    if hex.len() != 130 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        report.errors.push(RejectReason::InvalidSignatureFormat);
    }

    report
}

/// EIP-712 domain for voucher signing. Distinct from the USDC domain so a
/// voucher signature can never double as a transfer authorization.
pub fn voucher_domain(chain: &ChainConfig) -> alloy::sol_types::Eip712Domain {
    alloy::sol_types::Eip712Domain {
        name: Some(std::borrow::Cow::Borrowed("Selfx402 Deferred Payment")),
        version: Some(std::borrow::Cow::Borrowed("1")),
        chain_id: Some(U256::from(chain.chain_id)),
        verifying_contract: Some(chain.usdc_address),
        salt: None,
    }
}

/// Signing hash of a voucher under the deferred-payment domain.
pub fn voucher_signing_hash(voucher: &PaymentVoucher, chain: &ChainConfig) -> B256 {
    voucher.eip712_signing_hash(&voucher_domain(chain))
}

/// Recover and check the voucher signer. Same recovery algorithm as the
/// payment path, different domain.
pub fn verify_voucher_signature(
    voucher: &VoucherData,
    signature: &str,
    chain: &ChainConfig,
) -> Result<Address, RejectReason> {
    let amount = voucher
        .amount
        .parse::<U256>()
        .map_err(|e| RejectReason::InvalidAmount(e.to_string()))?;

    let typed = PaymentVoucher {
        payer: voucher.payer,
        payee: voucher.payee,
        amount,
        nonce: voucher.nonce,
        validUntil: U256::from(voucher.valid_until),
    };

    let sig_bytes =
        eip3009::decode_signature_hex(signature).map_err(|_| RejectReason::InvalidSignatureFormat)?;
    let sig = eip3009::parse_signature(&sig_bytes).map_err(|_| RejectReason::InvalidSignatureFormat)?;

    let hash = voucher_signing_hash(&typed, chain);
    let recovered = sig
        .recover_address_from_prehash(&hash)
        .map_err(|_| RejectReason::InvalidSignatureFormat)?;

    if recovered != voucher.payer {
        return Err(RejectReason::SignatureMismatch);
    }
    Ok(recovered)
}

/// Whether a set of voucher records can settle as one transfer: shared
/// payer, payee, and network; none already settled; nonces pairwise
/// distinct.
pub fn can_aggregate(records: &[VoucherRecord]) -> ValidationReport {
    let mut report = ValidationReport::default();

    let Some(first) = records.first() else {
        report
            .errors
            .push(RejectReason::NotViable("no vouchers to aggregate".into()));
        return report;
    };

    if records.len() == 1 {
        report
            .warnings
            .push("only one voucher — aggregation unnecessary".to_string());
    }

    if records.iter().any(|r| r.payer != first.payer) {
        report
            .errors
            .push(RejectReason::NotViable("vouchers span multiple payers".into()));
    }
    if records.iter().any(|r| r.payee != first.payee) {
        report
            .errors
            .push(RejectReason::NotViable("vouchers span multiple payees".into()));
    }
    if records.iter().any(|r| r.network != first.network) {
        report
            .errors
            .push(RejectReason::NotViable("vouchers span multiple networks".into()));
    }

    let settled = records.iter().filter(|r| r.settled).count();
    if settled > 0 {
        report.errors.push(RejectReason::NotViable(format!(
            "{settled} voucher(s) already settled"
        )));
    }

    let mut nonces: Vec<_> = records.iter().map(|r| r.nonce).collect();
    nonces.sort();
    nonces.dedup();
    if nonces.len() != records.len() {
        report.errors.push(RejectReason::DuplicateNonce);
    }

    report
}

/// Exact integer sum of voucher amounts.
pub fn calculate_aggregated_amount(records: &[VoucherRecord]) -> U256 {
    records
        .iter()
        .fold(U256::ZERO, |total, r| total.saturating_add(r.amount))
}

/// Advisory economics check: settlement must recover more than it costs.
/// Not a security boundary.
pub fn is_settlement_viable(
    total: U256,
    estimated_gas_cost: U256,
    min_profit_ratio: u64,
) -> ValidationReport {
    let mut report = ValidationReport::default();

    if total.is_zero() {
        report
            .errors
            .push(RejectReason::InvalidAmount("total must be greater than zero".into()));
    }
    if estimated_gas_cost.is_zero() {
        report
            .errors
            .push(RejectReason::NotViable("gas cost estimate required".into()));
    }

    if !total.is_zero() && !estimated_gas_cost.is_zero() && total <= estimated_gas_cost {
        report.errors.push(RejectReason::NotViable(format!(
            "total ({total}) does not exceed gas cost ({estimated_gas_cost})"
        )));
    }

    // Net recovery below the profit ratio is legal but barely worth it
    if report.is_valid()
        && total.saturating_sub(estimated_gas_cost)
            < estimated_gas_cost.saturating_mul(U256::from(min_profit_ratio))
    {
        report.warnings.push(format!(
            "low profit ratio: net recovery below {min_profit_ratio}x gas cost {estimated_gas_cost}"
        ));
    }

    report
}

/// Which unsettled vouchers should settle now, if any.
#[derive(Debug)]
pub struct SettlementCandidates {
    pub should_settle: bool,
    pub candidates: Vec<VoucherRecord>,
    pub reason: String,
}

/// Threshold heuristic: settle once either the accumulated value or the
/// voucher count crosses its minimum.
pub fn settlement_candidates(
    records: Vec<VoucherRecord>,
    min_amount: U256,
    min_count: usize,
) -> SettlementCandidates {
    let unsettled: Vec<VoucherRecord> = records.into_iter().filter(|r| !r.settled).collect();
    let total = calculate_aggregated_amount(&unsettled);

    if unsettled.is_empty() {
        return SettlementCandidates {
            should_settle: false,
            candidates: vec![],
            reason: "no unsettled vouchers".to_string(),
        };
    }

    if total >= min_amount {
        return SettlementCandidates {
            should_settle: true,
            reason: format!("total ({total}) meets amount threshold ({min_amount})"),
            candidates: unsettled,
        };
    }

    if unsettled.len() >= min_count {
        return SettlementCandidates {
            should_settle: true,
            reason: format!(
                "count ({}) meets voucher-count threshold ({min_count})",
                unsettled.len()
            ),
            candidates: unsettled,
        };
    }

    SettlementCandidates {
        should_settle: false,
        reason: format!(
            "below thresholds: total {total} < {min_amount}, count {} < {min_count}",
            unsettled.len()
        ),
        candidates: unsettled,
    }
}
