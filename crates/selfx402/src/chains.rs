//! Supported chain table.
//!
//! Only chains whose USDC deployment supports EIP-3009
//! `transferWithAuthorization` are listed. The registry is built once at
//! startup and is read-only afterwards; every component that needs the
//! asset address, signing-domain name, or RPC endpoint resolves through it.

use alloy::primitives::{address, Address};

use crate::error::FacilitatorError;

/// USDC has 6 decimal places on every supported chain.
pub const USDC_DECIMALS: u32 = 6;

/// Runtime chain configuration.
///
/// `usdc_name` must exactly match the token contract's own EIP-712 domain
/// name; a mismatch makes every signature recovery fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainConfig {
    pub chain_id: u64,
    /// Network identifier used on the wire (e.g. "celo").
    pub network: String,
    pub usdc_address: Address,
    pub usdc_name: String,
    /// EIP-712 domain version of the USDC deployment.
    pub usdc_domain_version: String,
    pub rpc_url: String,
    pub explorer_base: String,
    pub testnet: bool,
}

impl ChainConfig {
    /// Celo mainnet. EIP-3009 confirmed on the native USDC deployment.
    pub fn celo_mainnet() -> Self {
        Self {
            chain_id: 42220,
            network: "celo".to_string(),
            usdc_address: address!("0xcebA9300f2b948710d2653dD7B07f33A8B32118C"),
            usdc_name: "USDC".to_string(),
            usdc_domain_version: "2".to_string(),
            rpc_url: "https://forno.celo.org".to_string(),
            explorer_base: "https://celoscan.io".to_string(),
            testnet: false,
        }
    }

    /// Celo Sepolia testnet.
    pub fn celo_sepolia() -> Self {
        Self {
            chain_id: 11142220,
            network: "celo-sepolia".to_string(),
            usdc_address: address!("0x01C5C0122039549AD1493B8220cABEdD739BC44E"),
            usdc_name: "USDC".to_string(),
            usdc_domain_version: "2".to_string(),
            rpc_url: "https://celo-sepolia.g.alchemy.com/v2/demo".to_string(),
            explorer_base: "https://celo-sepolia.blockscout.com".to_string(),
            testnet: true,
        }
    }

    /// Block explorer URL for a transaction hash.
    pub fn explorer_tx(&self, tx_hash: &str) -> String {
        format!("{}/tx/{}", self.explorer_base, tx_hash)
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self::celo_mainnet()
    }
}

/// Static lookup table of supported chains. Pure, no I/O.
#[derive(Debug, Clone)]
pub struct ChainRegistry {
    chains: Vec<ChainConfig>,
}

impl ChainRegistry {
    /// Registry with all supported chains.
    pub fn new() -> Self {
        Self {
            chains: vec![ChainConfig::celo_mainnet(), ChainConfig::celo_sepolia()],
        }
    }

    /// Resolve a chain by numeric chain id.
    pub fn resolve(&self, chain_id: u64) -> Result<&ChainConfig, FacilitatorError> {
        self.chains
            .iter()
            .find(|c| c.chain_id == chain_id)
            .ok_or(FacilitatorError::UnsupportedChain(chain_id.to_string()))
    }

    /// Resolve a chain by wire network name (e.g. "celo", "celo-sepolia").
    pub fn resolve_network(&self, network: &str) -> Result<&ChainConfig, FacilitatorError> {
        self.chains
            .iter()
            .find(|c| c.network == network)
            .ok_or_else(|| FacilitatorError::UnsupportedChain(network.to_string()))
    }

    pub fn chains(&self) -> &[ChainConfig] {
        &self.chains
    }
}

impl Default for ChainRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_by_chain_id() {
        let registry = ChainRegistry::new();
        assert_eq!(registry.resolve(42220).unwrap().network, "celo");
        assert_eq!(registry.resolve(11142220).unwrap().network, "celo-sepolia");
    }

    #[test]
    fn resolve_unknown_chain_fails() {
        let registry = ChainRegistry::new();
        assert!(matches!(
            registry.resolve(1),
            Err(FacilitatorError::UnsupportedChain(_))
        ));
    }

    #[test]
    fn resolve_by_network_name() {
        let registry = ChainRegistry::new();
        let config = registry.resolve_network("celo").unwrap();
        assert_eq!(config.chain_id, 42220);
        assert!(!config.testnet);
        assert!(registry.resolve_network("base").is_err());
    }

    #[test]
    fn explorer_url_construction() {
        let config = ChainConfig::celo_mainnet();
        assert_eq!(
            config.explorer_tx("0xabc"),
            "https://celoscan.io/tx/0xabc"
        );
    }
}
