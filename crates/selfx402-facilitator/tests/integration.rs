use actix_web::{test, web, App};
use alloy::network::EthereumWallet;
use alloy::primitives::{Address, U256};
use alloy::providers::ProviderBuilder;
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use std::sync::Arc;

use selfx402::identity::RemoteProofVerifier;
use selfx402::voucher::{voucher_signing_hash, VoucherData};
use selfx402::{
    eip3009, AuthorizationData, ChainConfig, DeferredConfig, DeferredSettlementCoordinator,
    ExactPaymentData, Facilitator, IdentityGate, IdentityPolicy, NullifierPersistence,
    PaymentPayload, PaymentRequirements, PaymentVoucher, ScopeConfig, VoucherStore,
};

use selfx402_facilitator::state::{AppState, DeferredCapability, WalletProvider};
use selfx402_facilitator::{deferred, routes};

fn wallet_provider() -> WalletProvider {
    let signer = PrivateKeySigner::random();
    ProviderBuilder::new()
        .wallet(EthereumWallet::from(signer))
        .connect_http("http://localhost:1".parse().unwrap())
}

fn identity_gate(persistence: NullifierPersistence) -> IdentityGate<RemoteProofVerifier> {
    IdentityGate::new(
        RemoteProofVerifier::new(),
        vec![ScopeConfig {
            scope: "self-x402-facilitator".to_string(),
            // Unreachable in tests; proof consumption degrades to unverified
            endpoint: "http://localhost:1/api/verify".to_string(),
            default_policy: Default::default(),
        }],
        persistence,
        IdentityPolicy::Optional,
    )
}

/// AppState with a dummy wallet provider, tempdir-backed voucher store,
/// and unreachable identity service.
fn make_state(dir: &tempfile::TempDir, hmac_secret: Vec<u8>) -> web::Data<AppState> {
    let provider = wallet_provider();
    let chain = ChainConfig::celo_mainnet();

    let store = Arc::new(
        VoucherStore::open(dir.path().join("vouchers.db").to_str().unwrap()).unwrap(),
    );
    let coordinator = DeferredSettlementCoordinator::new(
        provider.clone(),
        chain.clone(),
        Arc::clone(&store),
        DeferredConfig::default(),
    );

    web::Data::new(AppState {
        facilitator: Facilitator::new(provider, chain),
        deferred: DeferredCapability::Enabled { store, coordinator },
        identity: identity_gate(NullifierPersistence::Unavailable),
        identity_scope: "self-x402-facilitator".to_string(),
        hmac_secret,
        metrics_token: None,
    })
}

fn payee() -> Address {
    "0x000000000000000000000000000000000000dEaD".parse().unwrap()
}

fn signed_payment(signer: &PrivateKeySigner, value: u64) -> (PaymentPayload, PaymentRequirements) {
    let chain = ChainConfig::celo_mainnet();
    let nonce = eip3009::random_nonce();
    let typed = selfx402::TransferWithAuthorization {
        from: signer.address(),
        to: payee(),
        value: U256::from(value),
        validAfter: U256::ZERO,
        validBefore: U256::from(u64::MAX),
        nonce,
    };
    let sig = signer
        .sign_hash_sync(&eip3009::signing_hash(&typed, &chain))
        .unwrap();

    let payload = PaymentPayload {
        x402_version: 1,
        scheme: "exact".to_string(),
        network: "celo".to_string(),
        payload: ExactPaymentData {
            signature: format!("0x{}", alloy::hex::encode(sig.as_bytes())),
            authorization: AuthorizationData {
                from: signer.address(),
                to: payee(),
                value: value.to_string(),
                valid_after: 0,
                valid_before: u64::MAX,
                nonce,
            },
        },
    };
    let requirements = PaymentRequirements {
        scheme: "exact".to_string(),
        network: "celo".to_string(),
        asset: chain.usdc_address,
        pay_to: payee(),
        max_amount_required: value.to_string(),
        description: None,
        extra: None,
    };
    (payload, requirements)
}

fn signed_voucher(signer: &PrivateKeySigner, amount: u64) -> serde_json::Value {
    let chain = ChainConfig::celo_mainnet();
    let voucher = VoucherData {
        payer: signer.address(),
        payee: payee(),
        amount: amount.to_string(),
        nonce: eip3009::random_nonce(),
        valid_until: 4_000_000_000,
    };
    let typed = PaymentVoucher {
        payer: voucher.payer,
        payee: voucher.payee,
        amount: U256::from(amount),
        nonce: voucher.nonce,
        validUntil: U256::from(voucher.valid_until),
    };
    let sig = signer
        .sign_hash_sync(&voucher_signing_hash(&typed, &chain))
        .unwrap();

    serde_json::json!({
        "scheme": "deferred",
        "network": "celo",
        "voucher": voucher,
        "signature": format!("0x{}", alloy::hex::encode(sig.as_bytes())),
    })
}

#[actix_rt::test]
async fn supported_lists_exact_and_deferred_schemes() {
    let dir = tempfile::tempdir().unwrap();
    let state = make_state(&dir, b"test-secret".to_vec());
    let app = test::init_service(App::new().app_data(state).service(routes::supported)).await;

    let req = test::TestRequest::get().uri("/supported").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["x402Version"], 1);
    assert_eq!(body["kind"][0]["scheme"], "exact");
    assert_eq!(body["kind"][0]["networkId"], "celo");
    assert_eq!(body["kind"][1]["scheme"], "deferred");
    assert_eq!(body["kind"][1]["extra"]["minSettlementAmount"], "10000000");
    assert_eq!(body["kind"][1]["extra"]["minVoucherCount"], 5);
    assert_eq!(body["identity"]["required"], false);
}

#[actix_rt::test]
async fn verify_accepts_valid_payment_offline() {
    let dir = tempfile::tempdir().unwrap();
    let state = make_state(&dir, b"test-secret".to_vec());
    let app = test::init_service(App::new().app_data(state).service(routes::verify)).await;

    let signer = PrivateKeySigner::random();
    let (payload, requirements) = signed_payment(&signer, 1_000_000);

    let req = test::TestRequest::post()
        .uri("/verify")
        .set_json(serde_json::json!({
            "paymentPayload": payload,
            "paymentRequirements": requirements,
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["isValid"], true);
    assert_eq!(
        body["payer"].as_str().unwrap().to_lowercase(),
        format!("{:#x}", signer.address())
    );
}

#[actix_rt::test]
async fn verify_rejects_amount_mismatch_with_400() {
    let dir = tempfile::tempdir().unwrap();
    let state = make_state(&dir, b"test-secret".to_vec());
    let app = test::init_service(App::new().app_data(state).service(routes::verify)).await;

    let signer = PrivateKeySigner::random();
    let (payload, mut requirements) = signed_payment(&signer, 1_000_000);
    requirements.max_amount_required = "2000000".to_string();

    let req = test::TestRequest::post()
        .uri("/verify")
        .set_json(serde_json::json!({
            "paymentPayload": payload,
            "paymentRequirements": requirements,
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);

    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["isValid"], false);
    assert_eq!(body["invalidReason"], "amount mismatch");
}

#[actix_rt::test]
async fn settle_requires_hmac() {
    let dir = tempfile::tempdir().unwrap();
    let state = make_state(&dir, b"test-secret".to_vec());
    let app = test::init_service(App::new().app_data(state).service(routes::settle)).await;

    // Missing header
    let req = test::TestRequest::post()
        .uri("/settle")
        .set_payload("{}")
        .insert_header(("Content-Type", "application/json"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);

    // Wrong signature
    let req = test::TestRequest::post()
        .uri("/settle")
        .set_payload("{}")
        .insert_header(("Content-Type", "application/json"))
        .insert_header(("X-Facilitator-Auth", "deadbeef"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);
}

#[actix_rt::test]
async fn settle_with_valid_hmac_rejects_malformed_body() {
    let dir = tempfile::tempdir().unwrap();
    let state = make_state(&dir, b"test-secret".to_vec());
    let app = test::init_service(App::new().app_data(state).service(routes::settle)).await;

    let body = b"not json";
    let sig = selfx402::hmac::compute_hmac(b"test-secret", body);
    let req = test::TestRequest::post()
        .uri("/settle")
        .set_payload(&body[..])
        .insert_header(("Content-Type", "application/json"))
        .insert_header(("X-Facilitator-Auth", sig))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);

    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["success"], false);
}

#[actix_rt::test]
async fn deferred_verify_stores_voucher_and_rejects_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let state = make_state(&dir, b"test-secret".to_vec());
    let app =
        test::init_service(App::new().app_data(state).service(deferred::deferred_verify)).await;

    let signer = PrivateKeySigner::random();
    let envelope = signed_voucher(&signer, 250_000);

    let req = test::TestRequest::post()
        .uri("/deferred/verify")
        .set_json(&envelope)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["accepted"], true);
    assert!(body["voucherId"].as_str().is_some());

    // Same nonce again: 409, not silently overwritten
    let req = test::TestRequest::post()
        .uri("/deferred/verify")
        .set_json(&envelope)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 409);
}

#[actix_rt::test]
async fn deferred_verify_rejects_foreign_signature() {
    let dir = tempfile::tempdir().unwrap();
    let state = make_state(&dir, b"test-secret".to_vec());
    let app =
        test::init_service(App::new().app_data(state).service(deferred::deferred_verify)).await;

    let signer = PrivateKeySigner::random();
    let imposter = PrivateKeySigner::random();
    let mut envelope = signed_voucher(&signer, 250_000);
    // Claim the voucher is from someone who never signed it
    envelope["voucher"]["payer"] = serde_json::json!(imposter.address());

    let req = test::TestRequest::post()
        .uri("/deferred/verify")
        .set_json(&envelope)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["accepted"], false);
}

#[actix_rt::test]
async fn deferred_settle_below_thresholds_is_not_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let state = make_state(&dir, b"test-secret".to_vec());
    let app = test::init_service(
        App::new()
            .app_data(state)
            .service(deferred::deferred_verify)
            .service(deferred::deferred_settle),
    )
    .await;

    let signer = PrivateKeySigner::random();
    let envelope = signed_voucher(&signer, 1_000);
    let req = test::TestRequest::post()
        .uri("/deferred/verify")
        .set_json(&envelope)
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 200);

    let body = serde_json::json!({ "payee": payee() }).to_string();
    let sig = selfx402::hmac::compute_hmac(b"test-secret", body.as_bytes());
    let req = test::TestRequest::post()
        .uri("/deferred/settle")
        .set_payload(body)
        .insert_header(("Content-Type", "application/json"))
        .insert_header(("X-Facilitator-Auth", sig))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["outcomes"][0]["settled"], false);
}

#[actix_rt::test]
async fn deferred_balance_lists_accumulated_vouchers() {
    let dir = tempfile::tempdir().unwrap();
    let state = make_state(&dir, b"test-secret".to_vec());
    let app = test::init_service(
        App::new()
            .app_data(state)
            .service(deferred::deferred_verify)
            .service(deferred::deferred_balance),
    )
    .await;

    let signer = PrivateKeySigner::random();
    for amount in [100_000u64, 200_000] {
        let req = test::TestRequest::post()
            .uri("/deferred/verify")
            .set_json(&signed_voucher(&signer, amount))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 200);
    }

    let req = test::TestRequest::get()
        .uri(&format!("/deferred/balance/{:#x}", payee()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["balances"][0]["totalAmount"], "300000");
    assert_eq!(body["balances"][0]["voucherCount"], 2);
}

#[actix_rt::test]
async fn deferred_endpoints_return_503_when_disabled() {
    let provider = wallet_provider();
    let state = web::Data::new(AppState {
        facilitator: Facilitator::new(provider, ChainConfig::celo_mainnet()),
        deferred: DeferredCapability::Disabled,
        identity: identity_gate(NullifierPersistence::Unavailable),
        identity_scope: "self-x402-facilitator".to_string(),
        hmac_secret: b"test-secret".to_vec(),
        metrics_token: None,
    });
    let app =
        test::init_service(App::new().app_data(state).service(deferred::deferred_balance)).await;

    let req = test::TestRequest::get()
        .uri(&format!("/deferred/balance/{:#x}", payee()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 503);
}

#[actix_rt::test]
async fn identity_verify_degrades_to_unverified_when_service_unreachable() {
    let dir = tempfile::tempdir().unwrap();
    let state = make_state(&dir, b"test-secret".to_vec());
    let app =
        test::init_service(App::new().app_data(state).service(routes::identity_verify)).await;

    let req = test::TestRequest::post()
        .uri("/identity/verify")
        .set_json(serde_json::json!({
            // base64("{}|[]")
            "proof": "e318W10=",
            "attestationId": 1,
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);

    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["valid"], false);
    assert_eq!(body["tier"], "unverified");
    assert!(body["reason"].as_str().is_some());
}

#[actix_rt::test]
async fn metrics_is_bearer_gated() {
    let dir = tempfile::tempdir().unwrap();
    let provider = wallet_provider();
    let store = Arc::new(
        VoucherStore::open(dir.path().join("vouchers.db").to_str().unwrap()).unwrap(),
    );
    let coordinator = DeferredSettlementCoordinator::new(
        provider.clone(),
        ChainConfig::celo_mainnet(),
        Arc::clone(&store),
        DeferredConfig::default(),
    );
    let state = web::Data::new(AppState {
        facilitator: Facilitator::new(provider, ChainConfig::celo_mainnet()),
        deferred: DeferredCapability::Enabled { store, coordinator },
        identity: identity_gate(NullifierPersistence::Unavailable),
        identity_scope: "self-x402-facilitator".to_string(),
        hmac_secret: b"hmac-secret".to_vec(),
        metrics_token: Some(b"metrics-token-123".to_vec()),
    });
    let app =
        test::init_service(App::new().app_data(state).service(routes::metrics_endpoint)).await;

    let req = test::TestRequest::get().uri("/metrics").to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 401);

    let req = test::TestRequest::get()
        .uri("/metrics")
        .insert_header(("Authorization", "Bearer hmac-secret"))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 401);

    let req = test::TestRequest::get()
        .uri("/metrics")
        .insert_header(("Authorization", "Bearer metrics-token-123"))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 200);
}
