//! Typed channel envelopes.
//!
//! Everything crossing the websocket is validated here, at the boundary,
//! before any dispatch logic runs. Outbound envelopes carry an `action` tag
//! and the engine's exact field names; inbound text that is not valid JSON or
//! not a recognized shape becomes a `MalformedMessage` value, never a crash.

use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ClientError;
use crate::field::{fr_to_dec, fr_to_hex};
use crate::order::OrderCommitment;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransparentWire {
    pub side: String,
    pub token: String,
    pub denomination: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShieldedWire {
    pub price: String,
    pub volume: String,
    #[serde(rename = "accessKey")]
    pub access_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderData {
    pub transparent: TransparentWire,
    pub shielded: ShieldedWire,
}

impl OrderData {
    /// Wire form of a commitment: side/price/volume as decimal strings,
    /// access key as unprefixed hex, matching the engine's parser.
    pub fn from_commitment(commitment: &OrderCommitment) -> Self {
        OrderData {
            transparent: TransparentWire {
                side: commitment.transparent.side.wire(),
                token: commitment.transparent.token.clone(),
                denomination: commitment.transparent.denomination.clone(),
            },
            shielded: ShieldedWire {
                price: fr_to_dec(&commitment.shielded.price),
                volume: fr_to_dec(&commitment.shielded.volume),
                access_key: fr_to_hex(&commitment.shielded.access_key),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action")]
pub enum Outbound {
    #[serde(rename = "sendorder")]
    SendOrder { data: OrderData, hash: String },
    #[serde(rename = "clearorderbook")]
    ClearOrderbook,
    #[serde(rename = "openorders")]
    OpenOrders,
    #[serde(rename = "getcrossedorders")]
    GetCrossedOrders { data: OrderData, hash: String },
    #[serde(rename = "upgradelisteningcontract")]
    UpgradeListeningContract { data: UpgradeData },
}

#[derive(Debug, Clone, Serialize)]
pub struct UpgradeData {
    #[serde(rename = "newAddress")]
    pub new_address: String,
}

impl Outbound {
    pub fn send_order(commitment: &OrderCommitment) -> Self {
        Outbound::SendOrder {
            data: OrderData::from_commitment(commitment),
            hash: fr_to_hex(&commitment.hash),
        }
    }

    pub fn get_crossed_orders(commitment: &OrderCommitment) -> Self {
        Outbound::GetCrossedOrders {
            data: OrderData::from_commitment(commitment),
            hash: fr_to_hex(&commitment.hash),
        }
    }

    pub fn upgrade_listening_contract(new_address: String) -> Self {
        Outbound::UpgradeListeningContract {
            data: UpgradeData { new_address },
        }
    }
}

/// Commitment echo the engine attaches to acknowledgements and crossed-order
/// pushes; `shielded` is the commitment hash in hex.
#[derive(Debug, Clone, Deserialize)]
pub struct CommitmentEcho {
    pub transparent: TransparentWire,
    pub shielded: String,
}

/// Enclave co-signature over a shielded commitment hash. Verified once by the
/// dispatcher, then discarded.
#[derive(Debug, Clone, Deserialize)]
pub struct EnclaveSignature {
    #[serde(rename = "signatureValue")]
    pub signature_value: String,
    #[serde(rename = "orderCommitment")]
    pub order_commitment: CommitmentEcho,
    #[serde(rename = "enclavePublicAddress")]
    pub enclave_public_address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CrossedOrders {
    #[serde(rename = "orderCommitment")]
    pub order_commitment: CommitmentEcho,
    pub data: CrossedData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CrossedData {
    pub orders: Vec<CrossedRow>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CrossedRow {
    pub raw_order_commitment: RawCommitmentWire,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawCommitmentWire {
    pub private: String,
}

#[derive(Debug, Clone, Deserialize)]
struct AckEnvelope {
    #[serde(rename = "enclaveSignature")]
    enclave_signature: EnclaveSignature,
}

#[derive(Debug, Clone, Deserialize)]
struct UpgradeAckEnvelope {
    status: String,
    #[serde(rename = "newAddress")]
    new_address: String,
}

/// The finite set of inbound envelopes the dispatcher recognizes.
#[derive(Debug, Clone)]
pub enum Inbound {
    OrderAck(EnclaveSignature),
    CrossedOrders(CrossedOrders),
    OpenOrders(Value),
    UpgradeAck { status: String, new_address: String },
}

pub fn parse_inbound(text: &str) -> Result<Inbound, ClientError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| ClientError::MalformedMessage(format!("not JSON: {e}")))?;
    let action = value
        .get("action")
        .and_then(Value::as_str)
        .ok_or_else(|| ClientError::MalformedMessage("missing action tag".into()))?
        .to_owned();
    match action.as_str() {
        "sendorder" => {
            let ack: AckEnvelope = serde_json::from_value(value)
                .map_err(|e| ClientError::MalformedMessage(format!("bad sendorder ack: {e}")))?;
            Ok(Inbound::OrderAck(ack.enclave_signature))
        }
        "getcrossedorders" => {
            let crossed: CrossedOrders = serde_json::from_value(value).map_err(|e| {
                ClientError::MalformedMessage(format!("bad crossed-orders push: {e}"))
            })?;
            Ok(Inbound::CrossedOrders(crossed))
        }
        "openorders" => Ok(Inbound::OpenOrders(value)),
        "upgradelisteningcontract" => {
            let ack: UpgradeAckEnvelope = serde_json::from_value(value)
                .map_err(|e| ClientError::MalformedMessage(format!("bad upgrade ack: {e}")))?;
            Ok(Inbound::UpgradeAck {
                status: ack.status,
                new_address: ack.new_address,
            })
        }
        other => Err(ClientError::MalformedMessage(format!(
            "unrecognized action {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::{build_commitment, RawOrderSpec, Side};
    use serde_json::json;

    fn commitment() -> OrderCommitment {
        let raw = RawOrderSpec {
            price: 3.0,
            volume: 4.5,
            side: Side::Ask,
        };
        build_commitment(&raw, "92bf25", "0x1").unwrap()
    }

    #[test]
    fn send_order_matches_the_engine_wire_shape() {
        let commitment = commitment();
        let value = serde_json::to_value(Outbound::send_order(&commitment)).unwrap();
        assert_eq!(
            value,
            json!({
                "action": "sendorder",
                "data": {
                    "transparent": {
                        "side": "1",
                        "token": "92bf25",
                        "denomination": "0x1"
                    },
                    "shielded": {
                        "price": "3000000000",
                        "volume": "4500000000",
                        "accessKey": fr_to_hex(&commitment.shielded.access_key)
                    }
                },
                "hash": fr_to_hex(&commitment.hash)
            })
        );
    }

    #[test]
    fn unit_actions_serialize_with_only_the_tag() {
        assert_eq!(
            serde_json::to_value(Outbound::ClearOrderbook).unwrap(),
            json!({"action": "clearorderbook"})
        );
        assert_eq!(
            serde_json::to_value(Outbound::OpenOrders).unwrap(),
            json!({"action": "openorders"})
        );
    }

    #[test]
    fn parses_an_enclave_acknowledgement() {
        let text = json!({
            "action": "sendorder",
            "enclaveSignature": {
                "orderCommitment": {
                    "transparent": {"side": "0", "token": "92bf25", "denomination": "0x1"},
                    "shielded": "1a2b3c"
                },
                "signatureValue": "00ff",
                "enclavePublicAddress": "0xa2c03BbE8Ce76d0c93D428A0f913F10b7acCfa9F"
            }
        })
        .to_string();
        match parse_inbound(&text).unwrap() {
            Inbound::OrderAck(sig) => {
                assert_eq!(sig.order_commitment.shielded, "1a2b3c");
                assert_eq!(sig.signature_value, "00ff");
            }
            other => panic!("expected order ack, got {other:?}"),
        }
    }

    #[test]
    fn parses_a_crossed_orders_push() {
        let text = json!({
            "action": "getcrossedorders",
            "orderCommitment": {
                "transparent": {"side": "0", "token": "92bf25", "denomination": "0x1"},
                "shielded": "aa11"
            },
            "data": {
                "orders": [
                    {"raw_order_commitment": {"private": "bb22"}},
                    {"raw_order_commitment": {"private": "cc33"}}
                ]
            }
        })
        .to_string();
        match parse_inbound(&text).unwrap() {
            Inbound::CrossedOrders(crossed) => {
                assert_eq!(crossed.order_commitment.shielded, "aa11");
                let privates: Vec<_> = crossed
                    .data
                    .orders
                    .iter()
                    .map(|row| row.raw_order_commitment.private.as_str())
                    .collect();
                assert_eq!(privates, ["bb22", "cc33"]);
            }
            other => panic!("expected crossed orders, got {other:?}"),
        }
    }

    #[test]
    fn rejects_unrecognized_and_malformed_input() {
        assert!(matches!(
            parse_inbound("Hello from the server!"),
            Err(ClientError::MalformedMessage(_))
        ));
        assert!(matches!(
            parse_inbound(r#"{"action":"definitelynotathing"}"#),
            Err(ClientError::MalformedMessage(_))
        ));
        assert!(matches!(
            parse_inbound(r#"{"no":"action"}"#),
            Err(ClientError::MalformedMessage(_))
        ));
        // Recognized tag but missing payload is malformed too.
        assert!(matches!(
            parse_inbound(r#"{"action":"sendorder"}"#),
            Err(ClientError::MalformedMessage(_))
        ));
    }
}
