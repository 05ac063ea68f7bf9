//! Proof requests, the prover seam, and verifier calldata formatting.
//!
//! The prover is an external collaborator consumed as an opaque "produce a
//! proof for these inputs" operation. Requests carry the circuits' named
//! signals; results come back in the snarkjs JSON shape and are reordered
//! into the `(a, b, c, input)` tuple the Solidity verifier expects, with the
//! G2 coordinate pairs of `pi_b` swapped.

use ark_bn254::Fr;
use ark_ff::One;
use async_trait::async_trait;
use ethers::types::U256;
use serde_derive::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

use crate::error::ClientError;
use crate::field::fr_to_dec;
use crate::order::zero_hash;

/// The fill circuit takes the own hash plus exactly this many match slots.
pub const FILL_MATCH_SLOTS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProofKind {
    Place,
    Cancel,
    Fill,
}

impl ProofKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProofKind::Place => "place",
            ProofKind::Cancel => "cancel",
            ProofKind::Fill => "fill",
        }
    }
}

impl fmt::Display for ProofKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum ProofRequest {
    Place { order_hash: Fr },
    Cancel { order_hash: Fr },
    Fill { own_hash: Fr, matched: [Fr; FILL_MATCH_SLOTS] },
}

impl ProofRequest {
    pub fn place(order_hash: Fr) -> Self {
        ProofRequest::Place { order_hash }
    }

    pub fn cancel(order_hash: Fr) -> Self {
        ProofRequest::Cancel { order_hash }
    }

    /// Shapes a fill request: the first ten matched hashes in received order,
    /// zero-padded to exactly ten slots. Non-negotiable circuit arity.
    pub fn fill(own_hash: Fr, matched: &[Fr]) -> Self {
        let mut slots = [zero_hash(); FILL_MATCH_SLOTS];
        for (slot, hash) in slots.iter_mut().zip(matched.iter()) {
            *slot = *hash;
        }
        ProofRequest::Fill {
            own_hash,
            matched: slots,
        }
    }

    pub fn kind(&self) -> ProofKind {
        match self {
            ProofRequest::Place { .. } => ProofKind::Place,
            ProofRequest::Cancel { .. } => ProofKind::Cancel,
            ProofRequest::Fill { .. } => ProofKind::Fill,
        }
    }

    /// The hash the at-most-once submission guard is keyed on.
    pub fn primary_hash(&self) -> Fr {
        match self {
            ProofRequest::Place { order_hash } | ProofRequest::Cancel { order_hash } => *order_hash,
            ProofRequest::Fill { own_hash, .. } => *own_hash,
        }
    }

    /// Ordered public signal values: the hash slots followed by the fixed
    /// auxiliary scalar the circuits require.
    pub fn public_signals(&self) -> Vec<Fr> {
        match self {
            ProofRequest::Place { order_hash } | ProofRequest::Cancel { order_hash } => {
                vec![*order_hash, Fr::one()]
            }
            ProofRequest::Fill { own_hash, matched } => {
                let mut signals = Vec::with_capacity(FILL_MATCH_SLOTS + 2);
                signals.push(*own_hash);
                signals.extend_from_slice(matched);
                signals.push(Fr::one());
                signals
            }
        }
    }

    /// Named witness signals in the prover's JSON convention, all decimal.
    pub fn prover_inputs(&self) -> Value {
        match self {
            ProofRequest::Place { order_hash } | ProofRequest::Cancel { order_hash } => json!({
                "orderhash": fr_to_dec(order_hash),
                "dummy": "1",
            }),
            ProofRequest::Fill { own_hash, matched } => json!({
                "orderhash_own": fr_to_dec(own_hash),
                "orderhash_filled": matched.iter().map(fr_to_dec).collect::<Vec<_>>(),
                "dummy": "1",
            }),
        }
    }
}

/// Groth16 proof as snarkjs emits it: projective G1 points (three decimal
/// coordinates) and a 3x2 G2 point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawGroth16Proof {
    pub pi_a: [String; 3],
    pub pi_b: [[String; 2]; 3],
    pub pi_c: [String; 3],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProveResponse {
    pub proof: RawGroth16Proof,
    #[serde(rename = "publicSignals")]
    pub public_signals: Vec<String>,
}

/// Proof tuple in the order the on-chain verifier expects.
#[derive(Debug, Clone)]
pub struct ProofCalldata {
    pub a: [U256; 2],
    pub b: [[U256; 2]; 2],
    pub c: [U256; 2],
    pub input: Vec<U256>,
}

impl ProofCalldata {
    pub fn from_snarkjs(
        proof: &RawGroth16Proof,
        public_signals: &[String],
    ) -> Result<Self, ClientError> {
        let dec = |text: &str| {
            U256::from_dec_str(text)
                .map_err(|e| ClientError::ProofGeneration(format!("bad proof value {text:?}: {e}")))
        };
        Ok(ProofCalldata {
            a: [dec(&proof.pi_a[0])?, dec(&proof.pi_a[1])?],
            // The verifier consumes G2 with the inner coordinate pairs
            // swapped relative to snarkjs output.
            b: [
                [dec(&proof.pi_b[0][1])?, dec(&proof.pi_b[0][0])?],
                [dec(&proof.pi_b[1][1])?, dec(&proof.pi_b[1][0])?],
            ],
            c: [dec(&proof.pi_c[0])?, dec(&proof.pi_c[1])?],
            input: public_signals
                .iter()
                .map(|signal| dec(signal))
                .collect::<Result<_, _>>()?,
        })
    }

    /// Public signals as the fixed-size array of the verifier function's ABI.
    pub fn input_array<const N: usize>(&self) -> Result<[U256; N], ClientError> {
        self.input.clone().try_into().map_err(|_| {
            ClientError::ProofGeneration(format!(
                "verifier expects {N} public signals, prover returned {}",
                self.input.len()
            ))
        })
    }
}

/// The external proving collaborator.
#[async_trait]
pub trait Prover: Send + Sync {
    async fn prove(&self, request: &ProofRequest) -> Result<ProveResponse, ClientError>;
}

/// Talks to a snarkjs prover sidecar: `POST {base}/prove/{kind}` with the
/// named witness signals, answered with `{proof, publicSignals}`.
pub struct HttpProver {
    http: reqwest::Client,
    base: String,
}

impl HttpProver {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.into(),
        }
    }
}

#[async_trait]
impl Prover for HttpProver {
    async fn prove(&self, request: &ProofRequest) -> Result<ProveResponse, ClientError> {
        let url = format!("{}/prove/{}", self.base, request.kind());
        let response = self
            .http
            .post(&url)
            .json(&request.prover_inputs())
            .send()
            .await
            .map_err(|e| ClientError::ProofGeneration(format!("prover unreachable: {e}")))?;
        if !response.status().is_success() {
            return Err(ClientError::ProofGeneration(format!(
                "prover answered {} for {}",
                response.status(),
                request.kind()
            )));
        }
        response
            .json::<ProveResponse>()
            .await
            .map_err(|e| ClientError::ProofGeneration(format!("unparseable proof: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ark_ff::Zero;

    fn hashes(n: u64) -> Vec<Fr> {
        (1..=n).map(Fr::from).collect()
    }

    #[test]
    fn fill_pads_to_eleven_slots_plus_aux() {
        for n in [0usize, 1, 3, 10] {
            let matched = hashes(n as u64);
            let request = ProofRequest::fill(Fr::from(99u64), &matched);
            let signals = request.public_signals();
            assert_eq!(signals.len(), FILL_MATCH_SLOTS + 2);
            assert_eq!(signals[0], Fr::from(99u64));
            for (i, matched_hash) in matched.iter().enumerate() {
                assert_eq!(signals[1 + i], *matched_hash);
            }
            for slot in &signals[1 + n..=FILL_MATCH_SLOTS] {
                assert!(slot.is_zero());
            }
            assert_eq!(*signals.last().unwrap(), Fr::one());
        }
    }

    #[test]
    fn fill_truncates_to_the_first_ten_received() {
        let matched = hashes(14);
        let request = ProofRequest::fill(Fr::from(7u64), &matched);
        let signals = request.public_signals();
        assert_eq!(signals.len(), FILL_MATCH_SLOTS + 2);
        assert_eq!(signals[1..=FILL_MATCH_SLOTS], matched[..FILL_MATCH_SLOTS]);
    }

    #[test]
    fn prover_inputs_carry_the_named_signals() {
        let place = ProofRequest::place(Fr::from(5u64)).prover_inputs();
        assert_eq!(place["orderhash"], "5");
        assert_eq!(place["dummy"], "1");

        let fill = ProofRequest::fill(Fr::from(5u64), &hashes(2)).prover_inputs();
        assert_eq!(fill["orderhash_own"], "5");
        assert_eq!(fill["orderhash_filled"].as_array().unwrap().len(), 10);
    }

    #[test]
    fn calldata_swaps_g2_coordinate_pairs() {
        let proof = RawGroth16Proof {
            pi_a: ["1".into(), "2".into(), "1".into()],
            pi_b: [
                ["3".into(), "4".into()],
                ["5".into(), "6".into()],
                ["1".into(), "0".into()],
            ],
            pi_c: ["7".into(), "8".into(), "1".into()],
        };
        let calldata = ProofCalldata::from_snarkjs(&proof, &["9".into(), "1".into()]).unwrap();
        assert_eq!(calldata.a, [U256::from(1), U256::from(2)]);
        assert_eq!(
            calldata.b,
            [
                [U256::from(4), U256::from(3)],
                [U256::from(6), U256::from(5)]
            ]
        );
        assert_eq!(calldata.c, [U256::from(7), U256::from(8)]);
        assert_eq!(calldata.input, vec![U256::from(9), U256::from(1)]);
        assert_eq!(
            calldata.input_array::<2>().unwrap(),
            [U256::from(9), U256::from(1)]
        );
        assert!(calldata.input_array::<12>().is_err());
    }

    #[test]
    fn calldata_rejects_non_numeric_values() {
        let proof = RawGroth16Proof {
            pi_a: ["x".into(), "2".into(), "1".into()],
            pi_b: [
                ["3".into(), "4".into()],
                ["5".into(), "6".into()],
                ["1".into(), "0".into()],
            ],
            pi_c: ["7".into(), "8".into(), "1".into()],
        };
        assert!(matches!(
            ProofCalldata::from_snarkjs(&proof, &[]),
            Err(ClientError::ProofGeneration(_))
        ));
    }
}
