use actix_cors::Cors;
use actix_governor::{Governor, GovernorConfigBuilder};
use actix_web::{web, App, HttpServer};
use alloy::providers::ProviderBuilder;
use alloy::signers::local::PrivateKeySigner;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use selfx402::identity::RemoteProofVerifier;
use selfx402::nonce_ledger::{NonceLedger, SqliteNonceLedger};
use selfx402::{
    ChainRegistry, DeferredConfig, DeferredSettlementCoordinator, Facilitator, IdentityGate,
    IdentityPolicy, NullifierPersistence, NullifierStore, ScopeConfig, VoucherStore,
};

use selfx402_facilitator::state::{AppState, DeferredCapability};
use selfx402_facilitator::{deferred, routes};

fn parse_cors_origins() -> Vec<String> {
    match std::env::var("ALLOWED_ORIGINS") {
        Ok(origins) => origins
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Err(_) => vec![],
    }
}

fn build_cors(origins: &[String]) -> Cors {
    if origins.is_empty() {
        // Default: allow localhost on any port
        Cors::default()
            .allowed_origin_fn(|origin, _| {
                origin
                    .to_str()
                    .map(|o| o == "http://localhost" || o.starts_with("http://localhost:"))
                    .unwrap_or(false)
            })
            .allow_any_method()
            .allowed_headers(vec!["content-type", "authorization", "x-facilitator-auth"])
            .max_age(3600)
    } else {
        let mut cors = Cors::default();
        for origin in origins {
            cors = cors.allowed_origin(origin);
        }
        cors.allow_any_method()
            .allowed_headers(vec!["content-type", "authorization", "x-facilitator-auth"])
            .max_age(3600)
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let key = std::env::var("FACILITATOR_PRIVATE_KEY")
        .expect("FACILITATOR_PRIVATE_KEY environment variable is required");
    let signer: PrivateKeySigner = key.parse().expect("invalid FACILITATOR_PRIVATE_KEY");
    let facilitator_address = signer.address();

    let registry = ChainRegistry::new();
    let network = env_or("NETWORK", "celo");
    let mut chain = registry
        .resolve_network(&network)
        .unwrap_or_else(|e| panic!("{e}"))
        .clone();
    if let Ok(rpc_url) = std::env::var("RPC_URL") {
        chain.rpc_url = rpc_url;
    }

    let provider = ProviderBuilder::new()
        .wallet(alloy::network::EthereumWallet::from(signer))
        .connect_http(chain.rpc_url.parse().expect("invalid RPC_URL"));

    // Settled-nonce ledger is mandatory: an in-memory fallback would lose
    // claims on restart and reopen the replay window.
    let nonce_db_path = env_or("NONCE_DB_PATH", "./selfx402-nonces.db");
    let nonce_ledger: Arc<dyn NonceLedger> = match SqliteNonceLedger::open(&nonce_db_path) {
        Ok(ledger) => {
            tracing::info!("Nonce ledger: SQLite at {nonce_db_path}");
            Arc::new(ledger)
        }
        Err(e) => {
            tracing::error!("Failed to open nonce ledger at {nonce_db_path}: {e}");
            tracing::error!("Refusing to start — in-memory claims would enable replay on restart");
            std::process::exit(1);
        }
    };

    let facilitator =
        Facilitator::new(provider.clone(), chain.clone()).with_nonce_ledger(nonce_ledger);
    facilitator.start_nonce_cleanup();

    // Voucher store is optional; without it the deferred scheme is OFF,
    // never silently in-memory.
    let voucher_db_path = env_or("VOUCHER_DB_PATH", "./selfx402-vouchers.db");
    let deferred_capability = match VoucherStore::open(&voucher_db_path) {
        Ok(store) => {
            tracing::info!("Voucher store: SQLite at {voucher_db_path}");
            let store = Arc::new(store);
            let config = DeferredConfig {
                min_settlement_amount: env_or("MIN_SETTLEMENT_AMOUNT", "10000000")
                    .parse()
                    .expect("invalid MIN_SETTLEMENT_AMOUNT"),
                min_voucher_count: env_or("MIN_VOUCHER_COUNT", "5")
                    .parse()
                    .expect("invalid MIN_VOUCHER_COUNT"),
                estimated_gas_cost: env_or("ESTIMATED_GAS_COST", "20000")
                    .parse()
                    .expect("invalid ESTIMATED_GAS_COST"),
                ..DeferredConfig::default()
            };
            let coordinator = DeferredSettlementCoordinator::new(
                provider.clone(),
                chain.clone(),
                Arc::clone(&store),
                config,
            );
            DeferredCapability::Enabled { store, coordinator }
        }
        Err(e) => {
            tracing::warn!("Voucher store unavailable ({e}) — deferred payments DISABLED");
            DeferredCapability::Disabled
        }
    };

    // Nullifier store is optional; without it the identity gate refuses
    // the verified tier rather than skipping the uniqueness check.
    let nullifier_db_path = env_or("NULLIFIER_DB_PATH", "./selfx402-nullifiers.db");
    let persistence = match NullifierStore::open(&nullifier_db_path) {
        Ok(store) => {
            tracing::info!("Nullifier store: SQLite at {nullifier_db_path}");
            NullifierPersistence::Available(Arc::new(store))
        }
        Err(e) => {
            tracing::warn!(
                "Nullifier store unavailable ({e}) — verified_human tier will be refused"
            );
            NullifierPersistence::Unavailable
        }
    };

    let identity_scope = env_or("SELF_SCOPE", "self-x402-facilitator");
    let identity_endpoint = env_or("SELF_ENDPOINT", "http://localhost:3005/api/verify");
    let identity_policy = match env_or("IDENTITY_POLICY", "optional").as_str() {
        "required" => IdentityPolicy::Required,
        "optional" => IdentityPolicy::Optional,
        other => {
            tracing::error!("invalid IDENTITY_POLICY '{other}' (use 'required' or 'optional')");
            std::process::exit(1);
        }
    };

    let identity = IdentityGate::new(
        RemoteProofVerifier::new(),
        vec![ScopeConfig {
            scope: identity_scope.clone(),
            endpoint: identity_endpoint,
            default_policy: Default::default(),
        }],
        persistence.clone(),
        identity_policy,
    );

    let hmac_secret: Vec<u8> = match std::env::var("FACILITATOR_SHARED_SECRET")
        .ok()
        .filter(|s| !s.is_empty())
    {
        Some(s) => {
            let bytes = s.into_bytes();
            if bytes.len() < 32 {
                tracing::warn!(
                    "FACILITATOR_SHARED_SECRET is only {} bytes (minimum 32 recommended)",
                    bytes.len()
                );
            }
            bytes
        }
        None => {
            tracing::error!(
                "FACILITATOR_SHARED_SECRET is required. \
                 Set it to a secure random value (e.g. `openssl rand -hex 32`)."
            );
            std::process::exit(1);
        }
    };

    let metrics_token = std::env::var("METRICS_TOKEN")
        .ok()
        .filter(|s| !s.is_empty())
        .map(|s| s.into_bytes());
    if metrics_token.is_none() {
        tracing::warn!("METRICS_TOKEN not set — /metrics endpoint is disabled");
    }

    // Periodic cleanup off the request path: expired nullifiers and
    // expired unsettled vouchers.
    {
        let persistence = persistence.clone();
        let voucher_store = match &deferred_capability {
            DeferredCapability::Enabled { store, .. } => Some(Arc::clone(store)),
            DeferredCapability::Disabled => None,
        };
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(3600));
            loop {
                interval.tick().await;
                if let NullifierPersistence::Available(store) = &persistence {
                    if let Err(e) = store.cleanup_expired() {
                        tracing::error!(error = %e, "nullifier cleanup failed");
                    }
                }
                if let Some(store) = &voucher_store {
                    let now = std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .map(|d| d.as_secs())
                        .unwrap_or(0);
                    match store.delete_expired(now) {
                        Ok(n) if n > 0 => tracing::info!(deleted = n, "expired vouchers removed"),
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "voucher cleanup failed"),
                    }
                }
            }
        });
    }

    let deferred_enabled = deferred_capability.is_enabled();
    let state = web::Data::new(AppState {
        facilitator,
        deferred: deferred_capability,
        identity,
        identity_scope,
        hmac_secret,
        metrics_token,
    });

    let port: u16 = env_or("PORT", "3005").parse().expect("invalid PORT");
    let rate_limit_rpm: u64 = env_or("RATE_LIMIT_RPM", "120")
        .parse()
        .expect("invalid RATE_LIMIT_RPM");
    let cors_origins = parse_cors_origins();

    tracing::info!("Selfx402 facilitator listening on port {port}");
    tracing::info!("Facilitator address: {facilitator_address}");
    tracing::info!("Network: {} (chain id {})", chain.network, chain.chain_id);
    tracing::info!("USDC: {:#x}", chain.usdc_address);
    tracing::info!("Deferred payments: {}", if deferred_enabled { "enabled" } else { "disabled" });
    tracing::info!("Identity policy: {identity_policy:?}");

    let governor_conf = GovernorConfigBuilder::default()
        .requests_per_minute(rate_limit_rpm)
        .finish()
        .expect("failed to build rate limiter config");

    HttpServer::new(move || {
        App::new()
            .wrap(build_cors(&cors_origins))
            .wrap(Governor::new(&governor_conf))
            .app_data(state.clone())
            .app_data(web::JsonConfig::default().limit(65_536))
            .service(routes::health)
            .service(routes::metrics_endpoint)
            .service(routes::supported)
            .service(routes::verify)
            .service(routes::settle)
            .service(routes::identity_verify)
            .service(deferred::deferred_verify)
            .service(deferred::deferred_settle)
            .service(deferred::deferred_balance)
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}
