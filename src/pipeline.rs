//! Proof submission pipeline: prove, format, simulate-then-submit, with an
//! at-most-once guard per `(kind, primary hash)`.
//!
//! A duplicate on-chain submission for the same commitment would be rejected
//! by the verifier as a double-use of the hash and wastes a transaction, so a
//! second request for a pair that is in flight or already submitted is
//! coalesced. Failures free the slot: proof generation is a pure function of
//! its inputs and chain submission is recoverable, so the same action may be
//! retried by a redelivered event.

use ark_bn254::Fr;
use ethers::types::{Bytes, H256};
use log::{error, info};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::chain::VerifierClient;
use crate::error::ClientError;
use crate::field::{fr_to_hex, fr_to_u256};
use crate::order::PendingOrder;
use crate::proof::{ProofCalldata, ProofKind, ProofRequest, Prover};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    InFlight,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The proof went out as a transaction.
    Submitted(H256),
    /// A submission for the same `(kind, hash)` was already in flight or
    /// already done; this request was dropped.
    Coalesced,
}

pub struct ProofPipeline {
    prover: Arc<dyn Prover>,
    verifier: Arc<dyn VerifierClient>,
    slots: Mutex<HashMap<(ProofKind, Fr), SlotState>>,
}

impl ProofPipeline {
    pub fn new(prover: Arc<dyn Prover>, verifier: Arc<dyn VerifierClient>) -> Self {
        Self {
            prover,
            verifier,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub async fn submit_place(
        &self,
        order: &PendingOrder,
        enclave_signature_hex: &str,
    ) -> Result<SubmitOutcome, ClientError> {
        let signature = hex::decode(enclave_signature_hex.trim_start_matches("0x"))
            .map_err(|e| ClientError::MalformedMessage(format!("undecodable signature: {e}")))?;
        self.run(
            order,
            ProofRequest::place(order.commitment.hash),
            Some(Bytes::from(signature)),
        )
        .await
    }

    pub async fn submit_cancel(&self, order: &PendingOrder) -> Result<SubmitOutcome, ClientError> {
        self.run(order, ProofRequest::cancel(order.commitment.hash), None)
            .await
    }

    pub async fn submit_fill(
        &self,
        order: &PendingOrder,
        matched: &[Fr],
    ) -> Result<SubmitOutcome, ClientError> {
        self.run(order, ProofRequest::fill(order.commitment.hash, matched), None)
            .await
    }

    async fn run(
        &self,
        order: &PendingOrder,
        request: ProofRequest,
        place_signature: Option<Bytes>,
    ) -> Result<SubmitOutcome, ClientError> {
        let key = (request.kind(), request.primary_hash());
        {
            let mut slots = self.slots.lock().await;
            match slots.get(&key) {
                Some(SlotState::InFlight) => {
                    info!(
                        "{} for {} already in flight, coalescing",
                        key.0,
                        fr_to_hex(&key.1)
                    );
                    return Ok(SubmitOutcome::Coalesced);
                }
                Some(SlotState::Done) => {
                    info!(
                        "{} for {} already submitted, coalescing",
                        key.0,
                        fr_to_hex(&key.1)
                    );
                    return Ok(SubmitOutcome::Coalesced);
                }
                None => {
                    slots.insert(key, SlotState::InFlight);
                }
            }
        }

        let result = self.prove_and_send(order, &request, place_signature).await;
        let mut slots = self.slots.lock().await;
        match result {
            Ok(tx_hash) => {
                slots.insert(key, SlotState::Done);
                info!(
                    "{} proof for {} submitted as {tx_hash:?}",
                    key.0,
                    fr_to_hex(&key.1)
                );
                Ok(SubmitOutcome::Submitted(tx_hash))
            }
            Err(e) => {
                slots.remove(&key);
                error!("{} submission for {} failed: {e}", key.0, fr_to_hex(&key.1));
                Err(e)
            }
        }
    }

    async fn prove_and_send(
        &self,
        order: &PendingOrder,
        request: &ProofRequest,
        place_signature: Option<Bytes>,
    ) -> Result<H256, ClientError> {
        let response = self.prover.prove(request).await?;
        let calldata = ProofCalldata::from_snarkjs(&response.proof, &response.public_signals)?;
        match request.kind() {
            ProofKind::Place => {
                self.verifier
                    .place(
                        order.owner,
                        fr_to_u256(&request.primary_hash()),
                        place_signature.unwrap_or_default(),
                        calldata,
                    )
                    .await
            }
            ProofKind::Cancel => self.verifier.cancel(order.owner, calldata).await,
            ProofKind::Fill => self.verifier.fill(order.owner, calldata).await,
        }
    }
}
