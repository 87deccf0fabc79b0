//! Proof-of-unique-human gating.
//!
//! The zero-knowledge proof system itself is an external collaborator: it
//! receives a proof and public signals and reports validity plus disclosed
//! attributes. This module consumes that result and turns it into durable
//! nullifier state: check before trusting the verified tier, store after,
//! with the registry's UNIQUE insert acting as the atomic
//! check-then-store.

use std::future::Future;
use std::sync::Arc;

use base64::Engine;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::FacilitatorError;
use crate::nullifier_store::NullifierStore;
use crate::response::Tier;

/// Disclosure requirements for one verification. A value object passed
/// per call (possibly fetched from a vendor's discovery document), never
/// ambient mutable state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisclosurePolicy {
    pub minimum_age: u8,
    /// ISO 3166-1 alpha-3 codes.
    #[serde(default)]
    pub excluded_countries: Vec<String>,
    #[serde(default)]
    pub ofac: bool,
}

impl Default for DisclosurePolicy {
    fn default() -> Self {
        Self {
            minimum_age: 18,
            excluded_countries: vec![],
            ofac: false,
        }
    }
}

/// What a failed identity check does to an otherwise-valid payment.
/// Vendor-configurable; the two behaviors in the original codebase made
/// explicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityPolicy {
    /// Proof failure rejects the payment outright.
    Required,
    /// Proof failure downgrades the caller to the unverified tier.
    Optional,
}

impl IdentityPolicy {
    pub fn allows_unverified(self) -> bool {
        matches!(self, IdentityPolicy::Optional)
    }
}

/// Result reported by the external proof-verification service.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofOutcome {
    pub valid: bool,
    #[serde(default)]
    pub minimum_age_valid: bool,
    #[serde(default)]
    pub ofac_valid: bool,
    pub nullifier: Option<String>,
    pub user_id: Option<String>,
    pub nationality: Option<String>,
    #[serde(default)]
    pub disclosed: serde_json::Value,
}

/// One call to the proof service.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofRequest {
    pub scope: String,
    pub attestation_id: u32,
    pub proof: serde_json::Value,
    pub public_signals: serde_json::Value,
    pub user_context_data: String,
    pub policy: DisclosurePolicy,
}

/// External proof-verification collaborator. Possibly slow, possibly
/// failing; always remote from this process's perspective.
pub trait ProofVerifier: Send + Sync {
    fn verify(
        &self,
        endpoint: &str,
        request: ProofRequest,
    ) -> impl Future<Output = Result<ProofOutcome, FacilitatorError>> + Send;
}

/// HTTP implementation of [`ProofVerifier`].
pub struct RemoteProofVerifier {
    http: reqwest::Client,
}

impl RemoteProofVerifier {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for RemoteProofVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ProofVerifier for RemoteProofVerifier {
    async fn verify(
        &self,
        endpoint: &str,
        request: ProofRequest,
    ) -> Result<ProofOutcome, FacilitatorError> {
        let response = self
            .http
            .post(endpoint)
            .json(&request)
            .timeout(std::time::Duration::from_secs(15))
            .send()
            .await
            .map_err(|e| FacilitatorError::IdentityService(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(FacilitatorError::IdentityService(format!(
                "verification service returned {}",
                response.status()
            )));
        }

        response
            .json::<ProofOutcome>()
            .await
            .map_err(|e| FacilitatorError::IdentityService(format!("invalid response: {e}")))
    }
}

/// Per-scope verifier configuration, registered once at startup. Requests
/// naming an unknown scope are rejected instead of growing the registry.
#[derive(Debug, Clone)]
pub struct ScopeConfig {
    pub scope: String,
    /// Proof-service endpoint for this scope.
    pub endpoint: String,
    pub default_policy: DisclosurePolicy,
}

/// Whether the durable nullifier registry is usable. Modeled as a
/// capability, not a nullable field: every call site branches on it
/// visibly, and a missing store rejects verified-tier claims rather than
/// skipping the uniqueness check.
#[derive(Clone)]
pub enum NullifierPersistence {
    Available(Arc<NullifierStore>),
    Unavailable,
}

impl NullifierPersistence {
    pub fn is_available(&self) -> bool {
        matches!(self, NullifierPersistence::Available(_))
    }
}

/// Outcome of consuming one identity proof.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityVerification {
    pub valid: bool,
    pub tier: Tier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nullifier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disclosed: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl IdentityVerification {
    fn unverified(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            tier: Tier::Unverified,
            nullifier: None,
            disclosed: None,
            reason: Some(reason.into()),
        }
    }
}

/// Composes the external proof service with the nullifier registry.
pub struct IdentityGate<V> {
    verifier: V,
    scopes: DashMap<String, Arc<ScopeConfig>>,
    persistence: NullifierPersistence,
    policy: IdentityPolicy,
}

impl<V: ProofVerifier> IdentityGate<V> {
    /// Build the gate with its full scope registry. Scopes cannot be added
    /// later; a bounded table beats races on first-use creation.
    pub fn new(
        verifier: V,
        scopes: Vec<ScopeConfig>,
        persistence: NullifierPersistence,
        policy: IdentityPolicy,
    ) -> Self {
        let registry = DashMap::new();
        for config in scopes {
            registry.insert(config.scope.clone(), Arc::new(config));
        }
        Self {
            verifier,
            scopes: registry,
            persistence,
            policy,
        }
    }

    pub fn policy(&self) -> IdentityPolicy {
        self.policy
    }

    pub fn persistence_available(&self) -> bool {
        self.persistence.is_available()
    }

    /// Consume a proof: verify it externally, then check-and-claim the
    /// nullifier. Never returns an error for proof rejection; every
    /// failure mode becomes an unverified result with a reason.
    pub async fn verify_proof(
        &self,
        scope: &str,
        proof_header: &str,
        attestation_id: u32,
        user_context: Option<&str>,
        policy_override: Option<DisclosurePolicy>,
    ) -> IdentityVerification {
        let Some(config) = self.scopes.get(scope).map(|entry| entry.value().clone()) else {
            return IdentityVerification::unverified(format!("unknown scope: {scope}"));
        };

        let (proof, public_signals) = match decode_proof_header(proof_header) {
            Ok(parts) => parts,
            Err(e) => return IdentityVerification::unverified(e.to_string()),
        };

        let policy = policy_override.unwrap_or_else(|| config.default_policy.clone());

        let request = ProofRequest {
            scope: config.scope.clone(),
            attestation_id,
            proof,
            public_signals,
            user_context_data: user_context.unwrap_or(&config.scope).to_string(),
            policy: policy.clone(),
        };

        let outcome = match self.verifier.verify(&config.endpoint, request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(scope, error = %e, "identity proof verification errored");
                return IdentityVerification::unverified(format!("identity service error: {e}"));
            }
        };

        if !outcome.valid {
            return IdentityVerification::unverified("invalid cryptographic proof");
        }
        if !outcome.minimum_age_valid {
            return IdentityVerification::unverified(format!(
                "age verification failed (minimum: {})",
                policy.minimum_age
            ));
        }
        if policy.ofac && !outcome.ofac_valid {
            return IdentityVerification::unverified("OFAC sanctions check failed");
        }

        let Some(nullifier) = outcome.nullifier else {
            return IdentityVerification::unverified("nullifier missing from verification result");
        };

        if let Some(nationality) = &outcome.nationality {
            if policy.excluded_countries.iter().any(|c| c == nationality) {
                return IdentityVerification::unverified(format!("country excluded: {nationality}"));
            }
        }

        // The registry is the Sybil barrier; without it the verified tier
        // cannot be granted.
        let store = match &self.persistence {
            NullifierPersistence::Available(store) => store,
            NullifierPersistence::Unavailable => {
                tracing::warn!(scope, "nullifier store unavailable, refusing verified tier");
                return IdentityVerification::unverified(
                    crate::reason::RejectReason::StoreUnavailable.to_string(),
                );
            }
        };

        match store.exists(&nullifier, scope) {
            Ok(true) => {
                return IdentityVerification::unverified(
                    "duplicate verification: one identity, one verification per scope",
                )
            }
            Ok(false) => {}
            Err(e) => {
                return IdentityVerification::unverified(format!("nullifier check failed: {e}"))
            }
        }

        let metadata = serde_json::json!({
            "ageValid": outcome.minimum_age_valid,
            "ofacValid": outcome.ofac_valid,
            "attestationId": attestation_id,
        });

        match store.store(
            &nullifier,
            scope,
            outcome.user_id.as_deref(),
            outcome.nationality.as_deref(),
            &metadata,
        ) {
            Ok(_) => IdentityVerification {
                valid: true,
                tier: Tier::VerifiedHuman,
                nullifier: Some(nullifier),
                disclosed: Some(outcome.disclosed),
                reason: None,
            },
            // Lost the race to a concurrent verification of the same identity
            Err(FacilitatorError::DuplicateNullifier) => IdentityVerification::unverified(
                "duplicate verification: one identity, one verification per scope",
            ),
            Err(e) => IdentityVerification::unverified(format!("nullifier store failed: {e}")),
        }
    }
}

/// Decode the `base64(proof|publicSignals)` header format into its two
/// JSON documents.
pub fn decode_proof_header(
    header: &str,
) -> Result<(serde_json::Value, serde_json::Value), FacilitatorError> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(header)
        .map_err(|e| FacilitatorError::IdentityService(format!("invalid base64 proof: {e}")))?;
    let text = String::from_utf8(decoded)
        .map_err(|e| FacilitatorError::IdentityService(format!("invalid proof encoding: {e}")))?;

    let (proof, signals) = text.split_once('|').ok_or_else(|| {
        FacilitatorError::IdentityService(
            "invalid proof format (expected base64(proof|publicSignals))".to_string(),
        )
    })?;

    let proof = serde_json::from_str(proof)
        .map_err(|e| FacilitatorError::IdentityService(format!("invalid proof JSON: {e}")))?;
    let signals = serde_json::from_str(signals)
        .map_err(|e| FacilitatorError::IdentityService(format!("invalid signals JSON: {e}")))?;
    Ok((proof, signals))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Stub proof service returning a queued outcome per call.
    struct StubVerifier {
        outcomes: Mutex<Vec<Result<ProofOutcome, FacilitatorError>>>,
    }

    impl StubVerifier {
        fn returning(outcome: ProofOutcome) -> Self {
            Self {
                outcomes: Mutex::new(vec![Ok(outcome)]),
            }
        }

        fn returning_many(outcomes: Vec<ProofOutcome>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into_iter().rev().map(Ok).collect()),
            }
        }
    }

    impl ProofVerifier for StubVerifier {
        async fn verify(
            &self,
            _endpoint: &str,
            _request: ProofRequest,
        ) -> Result<ProofOutcome, FacilitatorError> {
            self.outcomes
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(FacilitatorError::IdentityService("exhausted".into())))
        }
    }

    fn good_outcome(nullifier: &str) -> ProofOutcome {
        ProofOutcome {
            valid: true,
            minimum_age_valid: true,
            ofac_valid: true,
            nullifier: Some(nullifier.to_string()),
            user_id: Some("user-1".to_string()),
            nationality: Some("FRA".to_string()),
            disclosed: serde_json::json!({"ageValid": true}),
        }
    }

    fn proof_header() -> String {
        base64::engine::general_purpose::STANDARD.encode(r#"{"pi_a":[]}|["1","2"]"#)
    }

    fn gate_with(
        verifier: StubVerifier,
        persistence: NullifierPersistence,
    ) -> IdentityGate<StubVerifier> {
        IdentityGate::new(
            verifier,
            vec![ScopeConfig {
                scope: "marketplace".to_string(),
                endpoint: "http://localhost:1/api/verify".to_string(),
                default_policy: DisclosurePolicy::default(),
            }],
            persistence,
            IdentityPolicy::Optional,
        )
    }

    fn store() -> (tempfile::TempDir, Arc<NullifierStore>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nullifiers.db");
        let store = Arc::new(NullifierStore::open(path.to_str().unwrap()).unwrap());
        (dir, store)
    }

    #[tokio::test]
    async fn valid_proof_yields_verified_human() {
        let (_dir, store) = store();
        let gate = gate_with(
            StubVerifier::returning(good_outcome("n1")),
            NullifierPersistence::Available(Arc::clone(&store)),
        );

        let result = gate
            .verify_proof("marketplace", &proof_header(), 1, None, None)
            .await;
        assert!(result.valid);
        assert_eq!(result.tier, Tier::VerifiedHuman);
        assert_eq!(result.nullifier.as_deref(), Some("n1"));
        assert!(store.exists("n1", "marketplace").unwrap());
    }

    #[tokio::test]
    async fn second_verification_of_same_identity_rejected() {
        let (_dir, store) = store();
        let gate = gate_with(
            StubVerifier::returning_many(vec![good_outcome("n1"), good_outcome("n1")]),
            NullifierPersistence::Available(store),
        );

        let first = gate
            .verify_proof("marketplace", &proof_header(), 1, None, None)
            .await;
        assert!(first.valid);

        let second = gate
            .verify_proof("marketplace", &proof_header(), 1, None, None)
            .await;
        assert!(!second.valid);
        assert_eq!(second.tier, Tier::Unverified);
        assert!(second.reason.unwrap().contains("duplicate"));
    }

    #[tokio::test]
    async fn store_unavailable_refuses_verified_tier() {
        let gate = gate_with(
            StubVerifier::returning(good_outcome("n1")),
            NullifierPersistence::Unavailable,
        );

        let result = gate
            .verify_proof("marketplace", &proof_header(), 1, None, None)
            .await;
        assert!(!result.valid);
        assert!(result.reason.unwrap().contains("store unavailable"));
    }

    #[tokio::test]
    async fn under_age_proof_rejected() {
        let (_dir, store) = store();
        let mut outcome = good_outcome("n1");
        outcome.minimum_age_valid = false;
        let gate = gate_with(
            StubVerifier::returning(outcome),
            NullifierPersistence::Available(Arc::clone(&store)),
        );

        let result = gate
            .verify_proof("marketplace", &proof_header(), 1, None, None)
            .await;
        assert!(!result.valid);
        // A rejected proof must not consume the nullifier
        assert!(!store.exists("n1", "marketplace").unwrap());
    }

    #[tokio::test]
    async fn excluded_nationality_rejected_by_override_policy() {
        let (_dir, store) = store();
        let gate = gate_with(
            StubVerifier::returning(good_outcome("n1")),
            NullifierPersistence::Available(store),
        );

        let policy = DisclosurePolicy {
            excluded_countries: vec!["FRA".to_string()],
            ..DisclosurePolicy::default()
        };
        let result = gate
            .verify_proof("marketplace", &proof_header(), 1, None, Some(policy))
            .await;
        assert!(!result.valid);
        assert!(result.reason.unwrap().contains("country excluded"));
    }

    #[tokio::test]
    async fn unknown_scope_rejected() {
        let (_dir, store) = store();
        let gate = gate_with(
            StubVerifier::returning(good_outcome("n1")),
            NullifierPersistence::Available(store),
        );

        let result = gate
            .verify_proof("other-app", &proof_header(), 1, None, None)
            .await;
        assert!(!result.valid);
        assert!(result.reason.unwrap().contains("unknown scope"));
    }

    #[tokio::test]
    async fn malformed_proof_header_rejected() {
        let (_dir, store) = store();
        let gate = gate_with(
            StubVerifier::returning(good_outcome("n1")),
            NullifierPersistence::Available(store),
        );

        let result = gate
            .verify_proof("marketplace", "!!not-base64!!", 1, None, None)
            .await;
        assert!(!result.valid);
    }

    #[test]
    fn decode_proof_header_splits_parts() {
        let header = base64::engine::general_purpose::STANDARD.encode(r#"{"a":1}|[2,3]"#);
        let (proof, signals) = decode_proof_header(&header).unwrap();
        assert_eq!(proof["a"], 1);
        assert_eq!(signals[0], 2);

        let missing_bar = base64::engine::general_purpose::STANDARD.encode(r#"{"a":1}"#);
        assert!(decode_proof_header(&missing_bar).is_err());
    }
}
