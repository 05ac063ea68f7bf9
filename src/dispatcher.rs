//! Per-channel protocol state machine.
//!
//! Messages are parsed and verified strictly in arrival order; the long
//! per-order actions (waiting for the local insert, proving, submitting) are
//! spawned off the dispatch path so the channel loop never blocks on them.
//! Anything unparseable or unverifiable is logged and dropped; it never
//! aborts the session.

use ark_bn254::Fr;
use ethers::types::Address;
use log::{info, warn};
use std::sync::Arc;
use tokio::time::Duration;
use web3::signing::{keccak256, recover};

use crate::envelope::{parse_inbound, CrossedOrders, EnclaveSignature, Inbound};
use crate::error::ClientError;
use crate::field::{fr_from_hex, fr_to_hex};
use crate::order::OrderStatus;
use crate::pipeline::ProofPipeline;
use crate::store::{PendingOrderStore, Transition};

/// A crossed-orders event may arrive before the placement confirmation; it is
/// retried this many times before being dropped.
const CROSS_RETRY_LIMIT: u32 = 5;
const CROSS_RETRY_DELAY: Duration = Duration::from_secs(2);

pub struct EventDispatcher {
    store: Arc<PendingOrderStore>,
    pipeline: Arc<ProofPipeline>,
    enclave_address: Address,
    await_timeout: Duration,
}

impl EventDispatcher {
    pub fn new(
        store: Arc<PendingOrderStore>,
        pipeline: Arc<ProofPipeline>,
        enclave_address: Address,
        await_timeout: Duration,
    ) -> Self {
        Self {
            store,
            pipeline,
            enclave_address,
            await_timeout,
        }
    }

    /// Processes one inbound envelope. Never fails: per-order errors are
    /// logged and confined to that order.
    pub async fn handle_message(self: &Arc<Self>, text: &str) {
        let envelope = match parse_inbound(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("dropping inbound message: {e}");
                return;
            }
        };
        match envelope {
            Inbound::OrderAck(signature) => self.handle_order_ack(signature),
            Inbound::CrossedOrders(crossed) => self.handle_crossed_orders(crossed),
            Inbound::OpenOrders(payload) => info!("open orders: {payload}"),
            Inbound::UpgradeAck { status, new_address } => {
                info!("listening contract upgraded to {new_address}: {status}")
            }
        }
    }

    /// order-acknowledged: verify the enclave co-signature, then drive the
    /// place proof for the referenced order.
    fn handle_order_ack(self: &Arc<Self>, signature: EnclaveSignature) {
        let hash = match verify_enclave_signature(&signature, self.enclave_address) {
            Ok(hash) => hash,
            Err(e) => {
                warn!("dropping acknowledgement: {e}");
                return;
            }
        };
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.place_acknowledged(hash, signature.signature_value).await {
                warn!("place flow for order {} failed: {e}", fr_to_hex(&hash));
            }
        });
    }

    async fn place_acknowledged(
        &self,
        hash: Fr,
        signature_hex: String,
    ) -> Result<(), ClientError> {
        // The ack may have raced the local insert; wait for it.
        let order = self.store.await_order(hash, self.await_timeout).await?;
        self.store
            .transition(
                hash,
                &[OrderStatus::Constructed, OrderStatus::Submitted],
                OrderStatus::Acknowledged,
            )
            .await?;
        match self
            .store
            .transition(hash, &[OrderStatus::Acknowledged], OrderStatus::Placing)
            .await?
        {
            Transition::Skipped { current } => {
                info!(
                    "duplicate acknowledgement for {} ignored in status {current}",
                    fr_to_hex(&hash)
                );
                return Ok(());
            }
            Transition::Applied { .. } => {}
        }
        if let Err(e) = self.pipeline.submit_place(&order, &signature_hex).await {
            // Leave the order retryable by a redelivered ack.
            let _ = self
                .store
                .transition(hash, &[OrderStatus::Placing], OrderStatus::Acknowledged)
                .await;
            return Err(e);
        }
        Ok(())
    }

    /// crossed-orders-found: resolve the own hash, require the order to be at
    /// least Placed, then drive the fill proof with the counterparty hashes.
    fn handle_crossed_orders(self: &Arc<Self>, crossed: CrossedOrders) {
        let own_hash = match fr_from_hex(&crossed.order_commitment.shielded) {
            Ok(hash) => hash,
            Err(e) => {
                warn!("dropping crossed-orders event: {e}");
                return;
            }
        };
        let mut matched = Vec::with_capacity(crossed.data.orders.len());
        for row in &crossed.data.orders {
            match fr_from_hex(&row.raw_order_commitment.private) {
                Ok(hash) => matched.push(hash),
                Err(e) => {
                    warn!("dropping crossed-orders event with bad counterparty hash: {e}");
                    return;
                }
            }
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.fill_crossed(own_hash, matched).await {
                warn!("fill flow for order {} failed: {e}", fr_to_hex(&own_hash));
            }
        });
    }

    async fn fill_crossed(&self, own_hash: Fr, matched: Vec<Fr>) -> Result<(), ClientError> {
        let order = self.store.await_order(own_hash, self.await_timeout).await?;

        // The fill proof must not go out before the order is Placed on-chain.
        // An early event is retried a bounded number of times, then dropped.
        let mut attempts = 0;
        loop {
            let status = self
                .store
                .status(own_hash)
                .await
                .ok_or_else(|| ClientError::UnknownOrder {
                    hash: fr_to_hex(&own_hash),
                })?;
            if status >= OrderStatus::Placed {
                break;
            }
            attempts += 1;
            if attempts > CROSS_RETRY_LIMIT {
                warn!(
                    "crossed-orders event for {} arrived before placement (status {status}), dropping",
                    fr_to_hex(&own_hash)
                );
                return Ok(());
            }
            tokio::time::sleep(CROSS_RETRY_DELAY).await;
        }

        match self
            .store
            .transition(own_hash, &[OrderStatus::Placed], OrderStatus::Filling)
            .await?
        {
            Transition::Skipped { current } => {
                info!(
                    "duplicate crossed-orders event for {} ignored in status {current}",
                    fr_to_hex(&own_hash)
                );
                return Ok(());
            }
            Transition::Applied { .. } => {}
        }
        if let Err(e) = self.pipeline.submit_fill(&order, &matched).await {
            let _ = self
                .store
                .transition(own_hash, &[OrderStatus::Filling], OrderStatus::Placed)
                .await;
            return Err(e);
        }
        Ok(())
    }
}

/// keccak256 of the EIP-191 personal-message envelope around `message`.
pub fn eth_message(message: &str) -> [u8; 32] {
    keccak256(
        format!("\x19Ethereum Signed Message:\n{}{}", message.len(), message).as_bytes(),
    )
}

/// Recovers the signer of an EIP-191 personal-message signature.
pub fn recover_personal(message: &str, signature_hex: &str) -> Result<Address, ClientError> {
    let bytes = hex::decode(signature_hex.trim_start_matches("0x"))
        .map_err(|e| ClientError::Auth(format!("undecodable signature: {e}")))?;
    if bytes.len() != 65 {
        return Err(ClientError::Auth(format!(
            "signature must be 65 bytes, got {}",
            bytes.len()
        )));
    }
    let recovery_id = bytes[64] as i32 - 27;
    let recovered = recover(&eth_message(message), &bytes[..64], recovery_id)
        .map_err(|e| ClientError::Auth(format!("signature recovery failed: {e}")))?;
    Ok(Address::from_slice(recovered.as_bytes()))
}

/// Checks that the enclave signature recovers to the configured enclave
/// identity over the canonical shielded-commitment hash string. Returns the
/// commitment hash on success.
pub fn verify_enclave_signature(
    signature: &EnclaveSignature,
    enclave_address: Address,
) -> Result<Fr, ClientError> {
    let hash = fr_from_hex(&signature.order_commitment.shielded)?;
    let recovered = recover_personal(
        &signature.order_commitment.shielded,
        &signature.signature_value,
    )?;
    if recovered != enclave_address {
        return Err(ClientError::Auth(format!(
            "enclave signature recovered to {recovered:?}, expected {enclave_address:?}"
        )));
    }
    Ok(hash)
}
