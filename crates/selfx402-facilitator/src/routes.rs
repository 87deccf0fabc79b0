use actix_web::{get, post, web, HttpRequest, HttpResponse};
use serde::Deserialize;

use selfx402::identity::DisclosurePolicy;
use selfx402::{IdentityPolicy, PaymentPayload, PaymentRequirements, Tier};

use crate::metrics;
use crate::state::{AppState, DeferredCapability};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    pub payment_payload: PaymentPayload,
    pub payment_requirements: PaymentRequirements,
    /// Optional Self proof accompanying the payment.
    #[serde(default)]
    pub identity_proof: Option<IdentityProofRequest>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityProofRequest {
    /// base64(proof|publicSignals)
    pub proof: String,
    pub attestation_id: u32,
    #[serde(default)]
    pub user_context_data: Option<String>,
    /// Per-request disclosure policy (e.g. fetched from the vendor's
    /// discovery document). Falls back to the scope default.
    #[serde(default)]
    pub policy: Option<DisclosurePolicy>,
}

/// Validate the HMAC header on a money-moving request. The shared secret
/// is mandatory at startup, so authentication is never skipped.
pub(crate) fn validate_hmac(
    req: &HttpRequest,
    body_bytes: &[u8],
    state: &AppState,
) -> Result<(), HttpResponse> {
    let header_value = req
        .headers()
        .get("X-Facilitator-Auth")
        .and_then(|v| v.to_str().ok());

    match header_value {
        Some(sig) => {
            if selfx402::hmac::verify_hmac(&state.hmac_secret, body_bytes, sig) {
                Ok(())
            } else {
                tracing::warn!("HMAC verification failed");
                metrics::HMAC_FAILURES.with_label_values(&["invalid"]).inc();
                Err(HttpResponse::Unauthorized().json(serde_json::json!({
                    "error": "authentication failed"
                })))
            }
        }
        None => {
            metrics::HMAC_FAILURES.with_label_values(&["missing"]).inc();
            Err(HttpResponse::Unauthorized().json(serde_json::json!({
                "error": "authentication required"
            })))
        }
    }
}

#[get("/health")]
pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    let chain = state.facilitator.chain();
    match state.facilitator.health_check().await {
        Ok(block) => HttpResponse::Ok().json(serde_json::json!({
            "status": "healthy",
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "latestBlock": block.to_string(),
            "network": {
                "name": chain.network,
                "chainId": chain.chain_id,
                "usdc": format!("{:#x}", chain.usdc_address),
                "rpcUrl": chain.rpc_url,
                "explorer": chain.explorer_base,
            },
            "deferredPayments": state.deferred.is_enabled(),
            "identityGating": state.identity.persistence_available(),
        })),
        Err(_) => HttpResponse::ServiceUnavailable().json(serde_json::json!({
            "status": "degraded",
            "error": "RPC unreachable",
            "network": { "name": chain.network, "chainId": chain.chain_id },
        })),
    }
}

#[get("/metrics")]
pub async fn metrics_endpoint(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    match &state.metrics_token {
        Some(token) => {
            let authorized = req
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(|t| selfx402::hmac::constant_time_eq(t.as_bytes(), token))
                .unwrap_or(false);

            if !authorized {
                return HttpResponse::Unauthorized().json(serde_json::json!({
                    "error": "unauthorized",
                    "message": "Valid Bearer token required for /metrics"
                }));
            }
        }
        None => {
            return HttpResponse::Forbidden().json(serde_json::json!({
                "error": "forbidden",
                "message": "Set METRICS_TOKEN to enable /metrics"
            }));
        }
    }
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(metrics::metrics_output())
}

#[get("/supported")]
pub async fn supported(state: web::Data<AppState>) -> HttpResponse {
    let chain = state.facilitator.chain();
    let mut kinds = vec![serde_json::json!({
        "scheme": selfx402::EXACT_SCHEME,
        "networkId": chain.network,
        "extra": {
            "name": chain.usdc_name,
            "version": chain.usdc_domain_version,
        },
    })];

    if let DeferredCapability::Enabled { coordinator, .. } = &state.deferred {
        let config = coordinator.config();
        kinds.push(serde_json::json!({
            "scheme": selfx402::DEFERRED_SCHEME,
            "networkId": chain.network,
            "extra": {
                "name": chain.usdc_name,
                "version": chain.usdc_domain_version,
                "description": "Deferred payment with voucher aggregation for micro-payment batching",
                "minSettlementAmount": config.min_settlement_amount.to_string(),
                "minVoucherCount": config.min_voucher_count,
                "maxVoucherValiditySeconds": selfx402::voucher::MAX_VALIDITY_SECS,
                "endpoints": {
                    "verify": "/deferred/verify",
                    "settle": "/deferred/settle",
                    "balance": "/deferred/balance/:payee",
                },
                "features": [
                    "off_chain_voucher_storage",
                    "batch_settlement",
                    "eip712_signatures",
                    "automatic_aggregation",
                    "nullifier_tracking",
                ],
            },
        }));
    }

    HttpResponse::Ok().json(serde_json::json!({
        "x402Version": selfx402::X402_VERSION,
        "kind": kinds,
        "identity": {
            "enabled": state.identity.persistence_available(),
            "required": state.identity.policy() == IdentityPolicy::Required,
            "scope": state.identity_scope,
        },
    }))
}

#[post("/verify")]
pub async fn verify(state: web::Data<AppState>, body: web::Bytes) -> HttpResponse {
    let parsed: PaymentRequest = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            metrics::VERIFY_REQUESTS.with_label_values(&["malformed"]).inc();
            return HttpResponse::BadRequest().json(serde_json::json!({
                "isValid": false,
                "invalidReason": format!("invalid request body: {e}"),
            }));
        }
    };

    let mut response = state
        .facilitator
        .verify(&parsed.payment_payload, &parsed.payment_requirements);

    if !response.is_valid {
        metrics::VERIFY_REQUESTS.with_label_values(&["rejected"]).inc();
        return HttpResponse::BadRequest().json(response);
    }

    // Identity gating: a failed proof either downgrades the tier or
    // rejects the payment, per the configured policy.
    match &parsed.identity_proof {
        Some(proof) => {
            let identity = state
                .identity
                .verify_proof(
                    &state.identity_scope,
                    &proof.proof,
                    proof.attestation_id,
                    proof.user_context_data.as_deref(),
                    proof.policy.clone(),
                )
                .await;

            if !identity.valid && !state.identity.policy().allows_unverified() {
                metrics::VERIFY_REQUESTS
                    .with_label_values(&["identity_rejected"])
                    .inc();
                return HttpResponse::BadRequest().json(serde_json::json!({
                    "isValid": false,
                    "invalidReason": selfx402::RejectReason::IdentityRejected(
                        identity.reason.unwrap_or_default()
                    ).to_string(),
                    "payer": response.payer,
                }));
            }
            response.tier = Some(identity.tier);
        }
        None => {
            if !state.identity.policy().allows_unverified() {
                metrics::VERIFY_REQUESTS
                    .with_label_values(&["identity_rejected"])
                    .inc();
                return HttpResponse::BadRequest().json(serde_json::json!({
                    "isValid": false,
                    "invalidReason": selfx402::RejectReason::IdentityRejected(
                        "identity proof required".to_string()
                    ).to_string(),
                    "payer": response.payer,
                }));
            }
        }
    }

    metrics::VERIFY_REQUESTS.with_label_values(&["valid"]).inc();
    HttpResponse::Ok().json(response)
}

#[post("/settle")]
pub async fn settle(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Bytes,
) -> HttpResponse {
    if let Err(resp) = validate_hmac(&req, &body, &state) {
        return resp;
    }

    let parsed: PaymentRequest = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            metrics::SETTLE_REQUESTS.with_label_values(&["malformed"]).inc();
            return HttpResponse::BadRequest().json(serde_json::json!({
                "success": false,
                "errorReason": format!("invalid request body: {e}"),
                "network": state.facilitator.chain().network,
            }));
        }
    };

    let start = std::time::Instant::now();
    match state
        .facilitator
        .settle(&parsed.payment_payload, &parsed.payment_requirements)
        .await
    {
        Ok(result) => {
            let elapsed = start.elapsed().as_secs_f64();
            let label = if result.success { "success" } else { "rejected" };
            metrics::SETTLE_REQUESTS.with_label_values(&[label]).inc();
            metrics::SETTLE_LATENCY
                .with_label_values(&[label])
                .observe(elapsed);

            if result.success {
                tracing::info!(payer = ?result.payer, tx = ?result.transaction, "settlement completed");
                HttpResponse::Ok().json(result)
            } else {
                tracing::warn!(
                    payer = ?result.payer,
                    reason = result.error_reason.as_deref().unwrap_or("unknown"),
                    "settlement rejected"
                );
                HttpResponse::BadRequest().json(result)
            }
        }
        Err(e) => {
            metrics::SETTLE_REQUESTS.with_label_values(&["error"]).inc();
            tracing::error!(error = %e, "settlement internal error");
            HttpResponse::InternalServerError().json(serde_json::json!({
                "success": false,
                "errorReason": "internal settlement error",
                "network": state.facilitator.chain().network,
            }))
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityVerifyRequest {
    pub proof: String,
    pub attestation_id: u32,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub user_context_data: Option<String>,
    #[serde(default)]
    pub policy: Option<DisclosurePolicy>,
}

/// Consume a Self proof outside the payment path: verify it remotely,
/// claim the nullifier, report the tier.
#[post("/identity/verify")]
pub async fn identity_verify(state: web::Data<AppState>, body: web::Bytes) -> HttpResponse {
    let parsed: IdentityVerifyRequest = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            return HttpResponse::BadRequest().json(serde_json::json!({
                "valid": false,
                "tier": Tier::Unverified,
                "reason": format!("invalid request body: {e}"),
            }));
        }
    };

    let scope = parsed.scope.as_deref().unwrap_or(&state.identity_scope);
    let result = state
        .identity
        .verify_proof(
            scope,
            &parsed.proof,
            parsed.attestation_id,
            parsed.user_context_data.as_deref(),
            parsed.policy,
        )
        .await;

    let label = if result.valid { "valid" } else { "rejected" };
    metrics::IDENTITY_VERIFICATIONS
        .with_label_values(&[label])
        .inc();

    if result.valid {
        HttpResponse::Ok().json(result)
    } else {
        HttpResponse::BadRequest().json(result)
    }
}
