use std::sync::Arc;

use alloy::network::EthereumWallet;
use alloy::providers::{
    fillers::{
        BlobGasFiller, ChainIdFiller, FillProvider, GasFiller, JoinFill, NonceFiller, WalletFiller,
    },
    Identity, RootProvider,
};

use selfx402::identity::RemoteProofVerifier;
use selfx402::{DeferredSettlementCoordinator, Facilitator, IdentityGate, VoucherStore};

/// Concrete provider type from `ProviderBuilder::new().wallet(...).connect_http(...)`.
pub type WalletProvider = FillProvider<
    JoinFill<
        JoinFill<
            Identity,
            JoinFill<GasFiller, JoinFill<BlobGasFiller, JoinFill<NonceFiller, ChainIdFiller>>>,
        >,
        WalletFiller<EthereumWallet>,
    >,
    RootProvider,
>;

/// Whether the deferred voucher scheme is usable. The voucher store is a
/// capability, not a nullable field: every deferred route branches on
/// this, and `Disabled` answers with an explicit 503 instead of silently
/// skipping durable uniqueness checks.
pub enum DeferredCapability {
    Enabled {
        store: Arc<VoucherStore>,
        coordinator: DeferredSettlementCoordinator<WalletProvider>,
    },
    Disabled,
}

impl DeferredCapability {
    pub fn is_enabled(&self) -> bool {
        matches!(self, DeferredCapability::Enabled { .. })
    }
}

/// Shared application state for the facilitator server.
pub struct AppState {
    pub facilitator: Facilitator<WalletProvider>,
    pub deferred: DeferredCapability,
    pub identity: IdentityGate<RemoteProofVerifier>,
    /// Scope used for payment-path identity proofs.
    pub identity_scope: String,
    /// HMAC shared secret authenticating money-moving endpoints.
    /// Mandatory; the facilitator will not start without it.
    pub hmac_secret: Vec<u8>,
    /// Separate bearer token for /metrics (not the HMAC secret).
    pub metrics_token: Option<Vec<u8>>,
}
