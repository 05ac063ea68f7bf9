//! Concurrent registry of pending orders, partitioned per owning wallet.
//!
//! Server events referencing a hash can race the local insertion of that hash
//! when the two are not ordered by the transport, so point lookups are not
//! enough: `await_order` suspends until the hash appears in some partition or
//! a timeout elapses. A single `Notify` re-armed before every lookup closes
//! the window between the check and the sleep, so an insert can never be
//! missed.

use ark_bn254::Fr;
use ethers::types::Address;
use log::debug;
use std::collections::HashMap;
use tokio::sync::{Notify, RwLock};
use tokio::time::{Duration, Instant};

use crate::error::ClientError;
use crate::field::fr_to_hex;
use crate::order::{OrderStatus, PendingOrder};

/// Outcome of a conditional status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The order was in an allowed source status and now carries the target.
    Applied { from: OrderStatus },
    /// The order was in some other status; nothing changed. Duplicate events
    /// land here.
    Skipped { current: OrderStatus },
}

#[derive(Default)]
pub struct PendingOrderStore {
    partitions: RwLock<HashMap<Address, HashMap<Fr, PendingOrder>>>,
    inserted: Notify,
}

impl PendingOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pending order under its owner's partition.
    ///
    /// Re-inserting a hash already present in the same partition is a no-op,
    /// so retransmission of a submission cannot corrupt state. The same hash
    /// under a different owner is a consistency violation and is fatal.
    pub async fn insert(&self, order: PendingOrder) -> Result<(), ClientError> {
        let hash = order.commitment.hash;
        let owner = order.owner;
        {
            let mut partitions = self.partitions.write().await;
            for (other, partition) in partitions.iter() {
                if *other != owner && partition.contains_key(&hash) {
                    return Err(ClientError::HashCollision {
                        hash: fr_to_hex(&hash),
                    });
                }
            }
            let partition = partitions.entry(owner).or_default();
            if partition.contains_key(&hash) {
                debug!("order {} already registered, insert ignored", fr_to_hex(&hash));
                return Ok(());
            }
            partition.insert(hash, order);
        }
        self.inserted.notify_waiters();
        Ok(())
    }

    /// Resolves to the order for `hash` as soon as any partition contains it,
    /// or fails with `UnknownOrder` once `timeout` elapses.
    pub async fn await_order(
        &self,
        hash: Fr,
        timeout: Duration,
    ) -> Result<PendingOrder, ClientError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.inserted.notified();
            tokio::pin!(notified);
            // Register for the wakeup before looking, otherwise an insert
            // landing between the lookup and the sleep would be lost.
            notified.as_mut().enable();
            if let Some(order) = self.lookup(hash).await {
                return Ok(order);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(ClientError::UnknownOrder {
                    hash: fr_to_hex(&hash),
                });
            }
        }
    }

    pub async fn lookup(&self, hash: Fr) -> Option<PendingOrder> {
        let partitions = self.partitions.read().await;
        partitions
            .values()
            .find_map(|partition| partition.get(&hash))
            .cloned()
    }

    pub async fn status(&self, hash: Fr) -> Option<OrderStatus> {
        self.lookup(hash).await.map(|order| order.status)
    }

    /// Atomic check-and-set on the order's status. This is the exactly-once
    /// claim primitive: of two concurrent claims with the same target, one
    /// observes `Applied` and the other `Skipped`.
    pub async fn transition(
        &self,
        hash: Fr,
        allowed_from: &[OrderStatus],
        to: OrderStatus,
    ) -> Result<Transition, ClientError> {
        let mut partitions = self.partitions.write().await;
        let order = partitions
            .values_mut()
            .find_map(|partition| partition.get_mut(&hash))
            .ok_or_else(|| ClientError::UnknownOrder {
                hash: fr_to_hex(&hash),
            })?;
        if allowed_from.contains(&order.status) {
            let from = order.status;
            order.status = to;
            debug!("order {} {from} -> {to}", fr_to_hex(&hash));
            Ok(Transition::Applied { from })
        } else {
            Ok(Transition::Skipped {
                current: order.status,
            })
        }
    }

    /// Drops the order from its partition. Called by the owning flow once a
    /// terminal status is reached.
    pub async fn remove(&self, hash: Fr) -> Option<PendingOrder> {
        let mut partitions = self.partitions.write().await;
        partitions
            .values_mut()
            .find_map(|partition| partition.remove(&hash))
    }

    pub async fn order_count(&self) -> usize {
        let partitions = self.partitions.read().await;
        partitions.values().map(HashMap::len).sum()
    }

    /// All hashes currently pending for `owner`, in no particular order.
    pub async fn hashes_for(&self, owner: Address) -> Vec<Fr> {
        let partitions = self.partitions.read().await;
        partitions
            .get(&owner)
            .map(|partition| partition.keys().copied().collect())
            .unwrap_or_default()
    }
}
