//! Deferred payment routes: voucher intake, aggregated settlement, and
//! balance queries.
//!
//! Every handler branches explicitly on [`DeferredCapability`]; when the
//! voucher store is unavailable the scheme is off, never silently
//! in-memory.

use actix_web::{get, post, web, HttpRequest, HttpResponse};
use alloy::primitives::Address;
use serde::Deserialize;

use selfx402::voucher::{self, DeferredEnvelope};
use selfx402::{DeferredOutcome, FacilitatorError};

use crate::metrics;
use crate::routes::validate_hmac;
use crate::state::{AppState, DeferredCapability};

fn disabled_response() -> HttpResponse {
    HttpResponse::ServiceUnavailable().json(serde_json::json!({
        "error": "deferred payments disabled",
        "message": "voucher store not configured",
    }))
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Verify and store a signed voucher.
#[post("/deferred/verify")]
pub async fn deferred_verify(state: web::Data<AppState>, body: web::Bytes) -> HttpResponse {
    let DeferredCapability::Enabled { store, .. } = &state.deferred else {
        return disabled_response();
    };

    let envelope: DeferredEnvelope = match serde_json::from_slice(&body) {
        Ok(e) => e,
        Err(e) => {
            metrics::VOUCHER_REQUESTS.with_label_values(&["malformed"]).inc();
            return HttpResponse::BadRequest().json(serde_json::json!({
                "accepted": false,
                "errors": [format!("invalid request body: {e}")],
                "warnings": [],
            }));
        }
    };

    let chain = state.facilitator.chain();
    let report = voucher::validate_envelope(&envelope, &[chain.network.as_str()], unix_now());
    if !report.is_valid() {
        metrics::VOUCHER_REQUESTS.with_label_values(&["rejected"]).inc();
        return HttpResponse::BadRequest().json(serde_json::json!({
            "accepted": false,
            "errors": report.error_strings(),
            "warnings": report.warnings,
        }));
    }

    if let Err(reason) =
        voucher::verify_voucher_signature(&envelope.voucher, &envelope.signature, chain)
    {
        metrics::VOUCHER_REQUESTS.with_label_values(&["rejected"]).inc();
        return HttpResponse::BadRequest().json(serde_json::json!({
            "accepted": false,
            "errors": [reason.to_string()],
            "warnings": report.warnings,
        }));
    }

    match store.store(&envelope.voucher, &envelope.signature, &envelope.network) {
        Ok(record) => {
            metrics::VOUCHER_REQUESTS.with_label_values(&["accepted"]).inc();
            tracing::info!(
                voucher = %record.id,
                payer = %record.payer,
                payee = %record.payee,
                amount = %record.amount,
                "voucher accepted"
            );
            HttpResponse::Ok().json(serde_json::json!({
                "accepted": true,
                "voucherId": record.id,
                "warnings": report.warnings,
            }))
        }
        Err(FacilitatorError::DuplicateNonce) => {
            metrics::VOUCHER_REQUESTS.with_label_values(&["duplicate"]).inc();
            HttpResponse::Conflict().json(serde_json::json!({
                "accepted": false,
                "errors": ["duplicate nonce"],
                "warnings": [],
            }))
        }
        Err(e) => {
            metrics::VOUCHER_REQUESTS.with_label_values(&["error"]).inc();
            tracing::error!(error = %e, "voucher store failed");
            HttpResponse::InternalServerError().json(serde_json::json!({
                "accepted": false,
                "errors": ["voucher could not be persisted"],
                "warnings": [],
            }))
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeferredSettleRequest {
    pub payee: Address,
    /// Restrict settlement to one payer; defaults to every payer with a
    /// viable accumulated balance.
    #[serde(default)]
    pub payer: Option<Address>,
}

fn outcome_json(payer: Address, outcome: &DeferredOutcome) -> serde_json::Value {
    match outcome {
        DeferredOutcome::Settled(record) => serde_json::json!({
            "payer": payer,
            "settled": true,
            "settlement": record,
        }),
        DeferredOutcome::NoAction { reason } => serde_json::json!({
            "payer": payer,
            "settled": false,
            "reason": reason,
        }),
    }
}

/// Trigger aggregated settlement for a payee. "Not yet viable" is a
/// successful response, not an error.
#[post("/deferred/settle")]
pub async fn deferred_settle(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Bytes,
) -> HttpResponse {
    if let Err(resp) = validate_hmac(&req, &body, &state) {
        return resp;
    }

    let DeferredCapability::Enabled { coordinator, .. } = &state.deferred else {
        return disabled_response();
    };

    let parsed: DeferredSettleRequest = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            return HttpResponse::BadRequest().json(serde_json::json!({
                "error": format!("invalid request body: {e}"),
            }));
        }
    };

    let result = match parsed.payer {
        Some(payer) => coordinator
            .settle_pair(payer, parsed.payee)
            .await
            .map(|outcome| vec![(payer, outcome)]),
        None => coordinator.settle_payee(parsed.payee).await,
    };

    match result {
        Ok(outcomes) => {
            let settled = outcomes
                .iter()
                .filter(|(_, o)| matches!(o, DeferredOutcome::Settled(_)))
                .count();
            let label = if settled > 0 { "settled" } else { "no_action" };
            metrics::DEFERRED_SETTLEMENTS.with_label_values(&[label]).inc();

            HttpResponse::Ok().json(serde_json::json!({
                "payee": parsed.payee,
                "outcomes": outcomes
                    .iter()
                    .map(|(payer, o)| outcome_json(*payer, o))
                    .collect::<Vec<_>>(),
            }))
        }
        Err(FacilitatorError::SettlementTimeout(m)) => {
            metrics::DEFERRED_SETTLEMENTS.with_label_values(&["timeout"]).inc();
            tracing::error!("deferred settlement timed out: {m}");
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "settlement timeout: transaction status indeterminate",
            }))
        }
        Err(e) => {
            metrics::DEFERRED_SETTLEMENTS.with_label_values(&["error"]).inc();
            tracing::error!(error = %e, "deferred settlement failed");
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "deferred settlement failed",
            }))
        }
    }
}

/// Accumulated unsettled balances owed to a payee, grouped by payer.
#[get("/deferred/balance/{payee}")]
pub async fn deferred_balance(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> HttpResponse {
    let DeferredCapability::Enabled { store, .. } = &state.deferred else {
        return disabled_response();
    };

    let payee: Address = match path.into_inner().parse() {
        Ok(a) => a,
        Err(_) => {
            return HttpResponse::BadRequest().json(serde_json::json!({
                "error": "invalid payee address",
            }));
        }
    };

    match store.accumulated_balances(payee, &state.facilitator.chain().network) {
        Ok(balances) => HttpResponse::Ok().json(serde_json::json!({
            "payee": payee,
            "balances": balances,
        })),
        Err(e) => {
            tracing::error!(error = %e, "balance query failed");
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "balance query failed",
            }))
        }
    }
}
