//! EIP-712 typed-data construction and signature recovery for EIP-3009
//! transfer authorizations.
//!
//! Everything in this module is pure, synchronous CPU work (no I/O), so
//! the immediate-settlement path and voucher verification share the same
//! recovery algorithm, and verification can run arbitrarily far ahead of
//! settlement in the deferred path.

use alloy::primitives::{Address, FixedBytes, Signature, B256, U256};
use alloy::sol_types::SolStruct;

use crate::chains::ChainConfig;
use crate::error::FacilitatorError;
use crate::payment::ExactPaymentData;
use crate::reason::RejectReason;
use crate::TransferWithAuthorization;

/// Build the EIP-712 domain of the USDC deployment on the given chain.
pub fn transfer_domain(chain: &ChainConfig) -> alloy::sol_types::Eip712Domain {
    alloy::sol_types::Eip712Domain {
        name: Some(std::borrow::Cow::Owned(chain.usdc_name.clone())),
        version: Some(std::borrow::Cow::Owned(chain.usdc_domain_version.clone())),
        chain_id: Some(U256::from(chain.chain_id)),
        verifying_contract: Some(chain.usdc_address),
        salt: None,
    }
}

/// Compute the EIP-712 signing hash of an authorization.
pub fn signing_hash(auth: &TransferWithAuthorization, chain: &ChainConfig) -> B256 {
    auth.eip712_signing_hash(&transfer_domain(chain))
}

/// secp256k1 curve order N / 2. Signatures with s above this are
/// malleable (EIP-2) and rejected.
pub(crate) const SECP256K1_N_DIV_2: U256 = U256::from_limbs([
    0xBFD25E8CD0364140,
    0xBAAEDCE6AF48A03B,
    0xFFFFFFFFFFFFFFFE,
    0x7FFFFFFFFFFFFFFF,
]);

/// Parse and sanity-check a 65-byte signature.
pub(crate) fn parse_signature(signature_bytes: &[u8]) -> Result<Signature, FacilitatorError> {
    if signature_bytes.len() != 65 {
        return Err(FacilitatorError::Signature(format!(
            "signature must be 65 bytes, got {}",
            signature_bytes.len()
        )));
    }

    let sig = Signature::from_raw(signature_bytes)
        .map_err(|e| FacilitatorError::Signature(format!("invalid signature: {e}")))?;

    if sig.s() > SECP256K1_N_DIV_2 {
        return Err(FacilitatorError::Signature(
            "high-s signature rejected (EIP-2 malleability)".to_string(),
        ));
    }

    Ok(sig)
}

/// Recover the signer address of an authorization signature.
pub fn recover_signer(
    auth: &TransferWithAuthorization,
    signature_bytes: &[u8],
    chain: &ChainConfig,
) -> Result<Address, FacilitatorError> {
    let sig = parse_signature(signature_bytes)?;
    let hash = signing_hash(auth, chain);
    sig.recover_address_from_prehash(&hash)
        .map_err(|e| FacilitatorError::Signature(format!("recovery failed: {e}")))
}

/// Decompose a signature into the (v, r, s) components that
/// `transferWithAuthorization` takes on-chain. v is Electrum notation
/// (27/28).
pub fn split_signature(signature_bytes: &[u8]) -> Result<(u8, B256, B256), FacilitatorError> {
    let sig = parse_signature(signature_bytes)?;
    let v = if sig.v() { 28 } else { 27 };
    Ok((v, sig.r().into(), sig.s().into()))
}

/// Decode a 0x-prefixed hex signature into raw bytes.
pub fn decode_signature_hex(signature: &str) -> Result<Vec<u8>, FacilitatorError> {
    alloy::hex::decode(signature.strip_prefix("0x").unwrap_or(signature))
        .map_err(|e| FacilitatorError::Signature(format!("invalid hex signature: {e}")))
}

/// Generate a random 32-byte nonce via the OS CSPRNG.
pub fn random_nonce() -> FixedBytes<32> {
    use alloy::primitives::keccak256;
    let mut bytes = [0u8; 32];
    rand::fill(&mut bytes);
    keccak256(bytes)
}

/// Check a payment envelope against what the resource server required.
///
/// Returns the recovered payer on success. Deliberately does NOT check
/// the validity window; that is a settlement-time concern, evaluated
/// immediately before submission (see [`crate::usdc`]).
pub fn verify_envelope(
    data: &ExactPaymentData,
    chain: &ChainConfig,
    expected_payee: Address,
    expected_amount: U256,
) -> Result<Address, RejectReason> {
    let auth = &data.authorization;

    if auth.to != expected_payee {
        return Err(RejectReason::PayeeMismatch);
    }

    let value = auth
        .value
        .parse::<U256>()
        .map_err(|e| RejectReason::InvalidAmount(e.to_string()))?;
    if value != expected_amount {
        return Err(RejectReason::AmountMismatch);
    }

    let typed = TransferWithAuthorization {
        from: auth.from,
        to: auth.to,
        value,
        validAfter: U256::from(auth.valid_after),
        validBefore: U256::from(auth.valid_before),
        nonce: auth.nonce,
    };

    let sig_bytes =
        decode_signature_hex(&data.signature).map_err(|_| RejectReason::InvalidSignatureFormat)?;
    let recovered = recover_signer(&typed, &sig_bytes, chain)
        .map_err(|_| RejectReason::InvalidSignatureFormat)?;

    if recovered != auth.from {
        return Err(RejectReason::SignatureMismatch);
    }

    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payment::AuthorizationData;
    use alloy::signers::local::PrivateKeySigner;
    use alloy::signers::SignerSync;

    fn signed_envelope(
        signer: &PrivateKeySigner,
        to: Address,
        value: u64,
        chain: &ChainConfig,
    ) -> ExactPaymentData {
        let nonce = random_nonce();
        let typed = TransferWithAuthorization {
            from: signer.address(),
            to,
            value: U256::from(value),
            validAfter: U256::ZERO,
            validBefore: U256::from(u64::MAX),
            nonce,
        };
        let hash = signing_hash(&typed, chain);
        let sig = signer.sign_hash_sync(&hash).unwrap();

        ExactPaymentData {
            signature: format!("0x{}", alloy::hex::encode(sig.as_bytes())),
            authorization: AuthorizationData {
                from: signer.address(),
                to,
                value: value.to_string(),
                valid_after: 0,
                valid_before: u64::MAX,
                nonce,
            },
        }
    }

    #[test]
    fn sign_and_verify_roundtrip() {
        let chain = ChainConfig::celo_mainnet();
        let signer = PrivateKeySigner::random();
        let payee: Address = "0x000000000000000000000000000000000000dEaD".parse().unwrap();

        let envelope = signed_envelope(&signer, payee, 1_000_000, &chain);
        let payer = verify_envelope(&envelope, &chain, payee, U256::from(1_000_000u64)).unwrap();
        assert_eq!(payer, signer.address());
    }

    #[test]
    fn wrong_signer_rejected() {
        let chain = ChainConfig::celo_mainnet();
        let signer = PrivateKeySigner::random();
        let imposter = PrivateKeySigner::random();
        let payee: Address = "0x000000000000000000000000000000000000dEaD".parse().unwrap();

        let mut envelope = signed_envelope(&signer, payee, 1000, &chain);
        // Claim the authorization came from someone else
        envelope.authorization.from = imposter.address();

        assert_eq!(
            verify_envelope(&envelope, &chain, payee, U256::from(1000u64)),
            Err(RejectReason::SignatureMismatch)
        );
    }

    #[test]
    fn payee_mismatch_rejected_before_recovery() {
        let chain = ChainConfig::celo_mainnet();
        let signer = PrivateKeySigner::random();
        let payee: Address = "0x000000000000000000000000000000000000dEaD".parse().unwrap();
        let other: Address = "0x000000000000000000000000000000000000bEEF".parse().unwrap();

        let envelope = signed_envelope(&signer, payee, 1000, &chain);
        assert_eq!(
            verify_envelope(&envelope, &chain, other, U256::from(1000u64)),
            Err(RejectReason::PayeeMismatch)
        );
    }

    #[test]
    fn amount_mismatch_is_exact_integer_compare() {
        let chain = ChainConfig::celo_mainnet();
        let signer = PrivateKeySigner::random();
        let payee: Address = "0x000000000000000000000000000000000000dEaD".parse().unwrap();

        let envelope = signed_envelope(&signer, payee, 1000, &chain);
        // Overpayment is still a mismatch; equality is exact
        assert_eq!(
            verify_envelope(&envelope, &chain, payee, U256::from(999u64)),
            Err(RejectReason::AmountMismatch)
        );
    }

    #[test]
    fn tampered_amount_fails_recovery() {
        let chain = ChainConfig::celo_mainnet();
        let signer = PrivateKeySigner::random();
        let payee: Address = "0x000000000000000000000000000000000000dEaD".parse().unwrap();

        let mut envelope = signed_envelope(&signer, payee, 1000, &chain);
        envelope.authorization.value = "9999".to_string();

        assert_eq!(
            verify_envelope(&envelope, &chain, payee, U256::from(9999u64)),
            Err(RejectReason::SignatureMismatch)
        );
    }

    #[test]
    fn garbage_signature_rejected() {
        let chain = ChainConfig::celo_mainnet();
        let signer = PrivateKeySigner::random();
        let payee: Address = "0x000000000000000000000000000000000000dEaD".parse().unwrap();

        let mut envelope = signed_envelope(&signer, payee, 1000, &chain);
        envelope.signature = "0xdead".to_string();

        assert_eq!(
            verify_envelope(&envelope, &chain, payee, U256::from(1000u64)),
            Err(RejectReason::InvalidSignatureFormat)
        );
    }

    #[test]
    fn domain_binds_chain_id() {
        // The same authorization signed for mainnet must not verify
        // against the sepolia domain.
        let mainnet = ChainConfig::celo_mainnet();
        let sepolia = ChainConfig::celo_sepolia();
        let signer = PrivateKeySigner::random();
        let payee: Address = "0x000000000000000000000000000000000000dEaD".parse().unwrap();

        let envelope = signed_envelope(&signer, payee, 1000, &mainnet);
        assert!(verify_envelope(&envelope, &sepolia, payee, U256::from(1000u64)).is_err());
    }

    #[test]
    fn split_signature_components() {
        let chain = ChainConfig::celo_mainnet();
        let signer = PrivateKeySigner::random();
        let payee: Address = "0x000000000000000000000000000000000000dEaD".parse().unwrap();

        let envelope = signed_envelope(&signer, payee, 1000, &chain);
        let bytes = decode_signature_hex(&envelope.signature).unwrap();
        let (v, r, s) = split_signature(&bytes).unwrap();
        assert!(v == 27 || v == 28);
        assert_eq!(r.as_slice(), &bytes[..32]);
        assert_eq!(s.as_slice(), &bytes[32..64]);
    }

    #[test]
    fn random_nonces_are_unique() {
        assert_ne!(random_nonce(), random_nonce());
    }
}
