use alloy::primitives::{Address, FixedBytes};
use serde::{Deserialize, Serialize};

/// EIP-3009 authorization fields as they appear on the wire.
///
/// `value` stays a string end-to-end; it is parsed to `U256` exactly once,
/// at verification time. Never compared as floating point.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationData {
    pub from: Address,
    pub to: Address,
    pub value: String,
    pub valid_after: u64,
    pub valid_before: u64,
    pub nonce: FixedBytes<32>,
}

/// Signature + authorization pair inside a payment payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExactPaymentData {
    pub signature: String,
    pub authorization: AuthorizationData,
}

/// The x402 payment payload submitted by a client. Ephemeral: the
/// immediate-settlement path never persists it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    pub x402_version: u32,
    pub scheme: String,
    pub network: String,
    pub payload: ExactPaymentData,
}

/// What the resource server requires a payment to satisfy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    pub scheme: String,
    pub network: String,
    pub asset: Address,
    pub pay_to: Address,
    /// Required amount in the asset's smallest unit, as a decimal string.
    pub max_amount_required: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_roundtrips_camel_case() {
        let json = r#"{
            "x402Version": 1,
            "scheme": "exact",
            "network": "celo",
            "payload": {
                "signature": "0xab",
                "authorization": {
                    "from": "0x0000000000000000000000000000000000000001",
                    "to": "0x0000000000000000000000000000000000000002",
                    "value": "1000000",
                    "validAfter": 0,
                    "validBefore": 2000000000,
                    "nonce": "0x0101010101010101010101010101010101010101010101010101010101010101"
                }
            }
        }"#;
        let payload: PaymentPayload = serde_json::from_str(json).unwrap();
        assert_eq!(payload.scheme, "exact");
        assert_eq!(payload.payload.authorization.value, "1000000");

        let out = serde_json::to_value(&payload).unwrap();
        assert_eq!(out["payload"]["authorization"]["validBefore"], 2000000000u64);
    }
}
