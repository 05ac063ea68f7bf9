//! On-chain verifier collaborator and confirmation listener.
//!
//! The verifier contract owns the semantics; this module only drives its
//! entry points (simulate-then-submit, so malformed calldata is caught before
//! spending gas) and folds its events back into the pending-order store as
//! the authoritative Placed/Cancelled/Filled confirmations.

use ark_bn254::Fr;
use async_trait::async_trait;
use ethers::contract::ContractCall;
use ethers::core::types::ValueOrArray;
use ethers::middleware::SignerMiddleware;
use ethers::prelude::abigen;
use ethers::providers::{Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes, H256, U256};
use ethers_providers::Ws;
use futures_util::stream::StreamExt;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ClientError;
use crate::field::{fr_to_hex, u256_to_fr};
use crate::order::OrderStatus;
use crate::proof::ProofCalldata;
use crate::store::{PendingOrderStore, Transition};

abigen!(
    UnyfyDev,
    r#"[
        function place(uint256 orderhash, bytes signature, uint256[2] a, uint256[2][2] b, uint256[2] c, uint256[2] input)
        function cancel(uint256[2] a, uint256[2][2] b, uint256[2] c, uint256[2] input)
        function fill(uint256[2] a, uint256[2][2] b, uint256[2] c, uint256[12] input)
        event orderPlaced(address indexed pubaddr, uint256 indexed orderhash)
        event orderCancelled(address indexed pubaddr, uint256 indexed orderhash)
        event orderDelete(uint256 indexed orderhash)
        event orderFilled(address indexed pubaddr, uint256 indexed orderhash, uint256[] indexed filledorderhashes)
    ]"#,
);

/// The chain collaborator: submit a formatted proof as a transaction, signed
/// by the order's owner.
#[async_trait]
pub trait VerifierClient: Send + Sync {
    async fn place(
        &self,
        owner: Address,
        order_hash: U256,
        enclave_signature: Bytes,
        calldata: ProofCalldata,
    ) -> Result<H256, ClientError>;

    async fn cancel(&self, owner: Address, calldata: ProofCalldata) -> Result<H256, ClientError>;

    async fn fill(&self, owner: Address, calldata: ProofCalldata) -> Result<H256, ClientError>;
}

type OwnedContract = UnyfyDev<SignerMiddleware<Provider<Ws>, LocalWallet>>;

/// Verifier client over a websocket provider, one signing middleware per
/// registered owner so each order's transaction is signed by its own wallet.
pub struct EthersVerifier {
    provider: Arc<Provider<Ws>>,
    address: Address,
    chain_id: u64,
    gas_price: U256,
    gas_limit: U256,
    contracts: HashMap<Address, OwnedContract>,
}

impl EthersVerifier {
    pub fn new(
        provider: Arc<Provider<Ws>>,
        address: Address,
        chain_id: u64,
        gas_price_gwei: u64,
        gas_limit: u64,
    ) -> Self {
        Self {
            provider,
            address,
            chain_id,
            gas_price: U256::from(gas_price_gwei) * U256::exp10(9),
            gas_limit: U256::from(gas_limit),
            contracts: HashMap::new(),
        }
    }

    pub fn register_owner(&mut self, wallet: LocalWallet) {
        let wallet = wallet.with_chain_id(self.chain_id);
        let owner = wallet.address();
        let middleware = SignerMiddleware::new((*self.provider).clone(), wallet);
        self.contracts
            .insert(owner, UnyfyDev::new(self.address, Arc::new(middleware)));
    }

    fn contract_for(&self, owner: &Address) -> Result<&OwnedContract, ClientError> {
        self.contracts.get(owner).ok_or_else(|| {
            ClientError::Broadcast(format!("no signer registered for owner {owner:?}"))
        })
    }
}

async fn simulate_then_send<M: Middleware + 'static>(
    call: ContractCall<M, ()>,
) -> Result<H256, ClientError> {
    call.call()
        .await
        .map_err(|e| ClientError::Simulation(e.to_string()))?;
    let pending = call
        .send()
        .await
        .map_err(|e| ClientError::Broadcast(e.to_string()))?;
    Ok(pending.tx_hash())
}

#[async_trait]
impl VerifierClient for EthersVerifier {
    async fn place(
        &self,
        owner: Address,
        order_hash: U256,
        enclave_signature: Bytes,
        calldata: ProofCalldata,
    ) -> Result<H256, ClientError> {
        let contract = self.contract_for(&owner)?;
        let call = contract
            .place(
                order_hash,
                enclave_signature,
                calldata.a,
                calldata.b,
                calldata.c,
                calldata.input_array::<2>()?,
            )
            .gas_price(self.gas_price)
            .gas(self.gas_limit);
        simulate_then_send(call).await
    }

    async fn cancel(&self, owner: Address, calldata: ProofCalldata) -> Result<H256, ClientError> {
        let contract = self.contract_for(&owner)?;
        let call = contract
            .cancel(
                calldata.a,
                calldata.b,
                calldata.c,
                calldata.input_array::<2>()?,
            )
            .gas_price(self.gas_price)
            .gas(self.gas_limit);
        simulate_then_send(call).await
    }

    async fn fill(&self, owner: Address, calldata: ProofCalldata) -> Result<H256, ClientError> {
        let contract = self.contract_for(&owner)?;
        let call = contract
            .fill(
                calldata.a,
                calldata.b,
                calldata.c,
                calldata.input_array::<12>()?,
            )
            .gas_price(self.gas_price)
            .gas(self.gas_limit);
        simulate_then_send(call).await
    }
}

/// orderPlaced: the verifier accepted the place proof.
pub async fn apply_order_placed(store: &PendingOrderStore, owner: Address, hash: Fr) {
    let Some(order) = store.lookup(hash).await else {
        debug!("orderPlaced for foreign hash {}, skipping", fr_to_hex(&hash));
        return;
    };
    if order.owner != owner {
        warn!(
            "orderPlaced for {} names owner {owner:?}, local owner is {:?}",
            fr_to_hex(&hash),
            order.owner
        );
        return;
    }
    match store
        .transition(hash, &[OrderStatus::Placing], OrderStatus::Placed)
        .await
    {
        Ok(Transition::Applied { .. }) => info!("order {} placed", fr_to_hex(&hash)),
        Ok(Transition::Skipped { current }) => {
            debug!(
                "orderPlaced for {} ignored in status {current}",
                fr_to_hex(&hash)
            )
        }
        Err(e) => warn!("orderPlaced for {} not applied: {e}", fr_to_hex(&hash)),
    }
}

/// orderCancelled: terminal; the order leaves the store.
pub async fn apply_order_cancelled(store: &PendingOrderStore, hash: Fr) {
    match store
        .transition(hash, &[OrderStatus::Cancelling], OrderStatus::Cancelled)
        .await
    {
        Ok(Transition::Applied { .. }) => {
            store.remove(hash).await;
            info!("order {} cancelled", fr_to_hex(&hash));
        }
        Ok(Transition::Skipped { current }) => debug!(
            "orderCancelled for {} ignored in status {current}",
            fr_to_hex(&hash)
        ),
        Err(e) => debug!("orderCancelled for unknown order: {e}"),
    }
}

/// orderFilled: terminal for the named order. A locally-owned counterparty
/// order still in Placed is finalized by its own orderFilled event.
pub async fn apply_order_filled(store: &PendingOrderStore, hash: Fr) {
    match store
        .transition(
            hash,
            &[OrderStatus::Filling, OrderStatus::Placed],
            OrderStatus::Filled,
        )
        .await
    {
        Ok(Transition::Applied { .. }) => {
            store.remove(hash).await;
            info!("order {} filled", fr_to_hex(&hash));
        }
        Ok(Transition::Skipped { current }) => debug!(
            "orderFilled for {} ignored in status {current}",
            fr_to_hex(&hash)
        ),
        Err(e) => debug!("orderFilled for unknown order: {e}"),
    }
}

/// orderDelete: book-keeping removal without a lifecycle transition.
pub async fn apply_order_delete(store: &PendingOrderStore, hash: Fr) {
    if store.remove(hash).await.is_some() {
        info!("order {} deleted from the book", fr_to_hex(&hash));
    } else {
        debug!("orderDelete for foreign hash {}", fr_to_hex(&hash));
    }
}

/// Watches the verifier contract's events and folds them into the store.
pub fn spawn_confirmation_listener(
    provider: Arc<Provider<Ws>>,
    verifier: Address,
    from_block: u64,
    store: Arc<PendingOrderStore>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let placed = ethers::contract::Contract::event_of_type::<OrderPlacedFilter>(
            provider.clone(),
        )
        .from_block(from_block)
        .address(ValueOrArray::Value(verifier));
        let cancelled = ethers::contract::Contract::event_of_type::<OrderCancelledFilter>(
            provider.clone(),
        )
        .from_block(from_block)
        .address(ValueOrArray::Value(verifier));
        let deleted =
            ethers::contract::Contract::event_of_type::<OrderDeleteFilter>(provider.clone())
                .from_block(from_block)
                .address(ValueOrArray::Value(verifier));
        let filled =
            ethers::contract::Contract::event_of_type::<OrderFilledFilter>(provider.clone())
                .from_block(from_block)
                .address(ValueOrArray::Value(verifier));

        let (placed, cancelled, deleted, filled) = match tokio::try_join!(
            placed.subscribe_with_meta(),
            cancelled.subscribe_with_meta(),
            deleted.subscribe_with_meta(),
            filled.subscribe_with_meta(),
        ) {
            Ok(streams) => streams,
            Err(e) => {
                error!("confirmation listener could not subscribe: {e}");
                return;
            }
        };
        tokio::pin!(placed, cancelled, deleted, filled);

        loop {
            tokio::select! {
                Some(Ok((log, _meta))) = placed.next() => {
                    apply_order_placed(&store, log.pubaddr, u256_to_fr(&log.orderhash)).await;
                }
                Some(Ok((log, _meta))) = cancelled.next() => {
                    apply_order_cancelled(&store, u256_to_fr(&log.orderhash)).await;
                }
                Some(Ok((log, _meta))) = filled.next() => {
                    apply_order_filled(&store, u256_to_fr(&log.orderhash)).await;
                }
                Some(Ok((log, _meta))) = deleted.next() => {
                    apply_order_delete(&store, u256_to_fr(&log.orderhash)).await;
                }
                else => {
                    warn!("confirmation event streams ended");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::{build_commitment, PendingOrder, RawOrderSpec, Side};

    async fn stored_order(store: &PendingOrderStore, status: OrderStatus) -> (Address, Fr) {
        let raw = RawOrderSpec {
            price: 5.0,
            volume: 2.0,
            side: Side::Bid,
        };
        let owner = Address::random();
        let order = PendingOrder::new(build_commitment(&raw, "tok", "0x1").unwrap(), owner);
        let hash = order.commitment.hash;
        store.insert(order).await.unwrap();
        store
            .transition(hash, &[OrderStatus::Constructed], status)
            .await
            .unwrap();
        (owner, hash)
    }

    #[tokio::test]
    async fn placed_confirmation_advances_placing_orders() {
        let store = PendingOrderStore::new();
        let (owner, hash) = stored_order(&store, OrderStatus::Placing).await;
        apply_order_placed(&store, owner, hash).await;
        assert_eq!(store.status(hash).await, Some(OrderStatus::Placed));
    }

    #[tokio::test]
    async fn placed_confirmation_checks_the_owner() {
        let store = PendingOrderStore::new();
        let (_owner, hash) = stored_order(&store, OrderStatus::Placing).await;
        apply_order_placed(&store, Address::random(), hash).await;
        assert_eq!(store.status(hash).await, Some(OrderStatus::Placing));
    }

    #[tokio::test]
    async fn terminal_confirmations_remove_the_order() {
        let store = PendingOrderStore::new();
        let (_owner, cancelled) = stored_order(&store, OrderStatus::Cancelling).await;
        apply_order_cancelled(&store, cancelled).await;
        assert!(store.lookup(cancelled).await.is_none());

        let (_owner, filled) = stored_order(&store, OrderStatus::Filling).await;
        apply_order_filled(&store, filled).await;
        assert!(store.lookup(filled).await.is_none());
    }

    #[tokio::test]
    async fn counterparty_fill_finalizes_a_placed_order() {
        let store = PendingOrderStore::new();
        let (_owner, hash) = stored_order(&store, OrderStatus::Placed).await;
        apply_order_filled(&store, hash).await;
        assert!(store.lookup(hash).await.is_none());
    }

    #[tokio::test]
    async fn foreign_hashes_are_skipped() {
        let store = PendingOrderStore::new();
        let foreign = Fr::from(424_242u64);
        apply_order_placed(&store, Address::random(), foreign).await;
        apply_order_cancelled(&store, foreign).await;
        apply_order_filled(&store, foreign).await;
        apply_order_delete(&store, foreign).await;
        assert_eq!(store.order_count().await, 0);
    }
}
