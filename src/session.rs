//! An authenticated trading session: one wallet, one channel, one dispatcher.

use ark_bn254::Fr;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::Address;
use futures_util::stream::{SplitSink, StreamExt};
use futures_util::{SinkExt, Stream};
use log::{debug, error, info};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::auth::{open_channel, SessionAuthenticator, WsStream};
use crate::config::ClientConfig;
use crate::dispatcher::EventDispatcher;
use crate::envelope::Outbound;
use crate::error::ClientError;
use crate::field::fr_to_hex;
use crate::order::{build_commitment, OrderStatus, PendingOrder, RawOrderSpec};
use crate::pipeline::{ProofPipeline, SubmitOutcome};
use crate::store::{PendingOrderStore, Transition};

pub struct TradingSession {
    owner: Address,
    token: String,
    denomination: String,
    sink: Mutex<SplitSink<WsStream, Message>>,
    store: Arc<PendingOrderStore>,
    pipeline: Arc<ProofPipeline>,
    reader: tokio::task::JoinHandle<()>,
    closed: watch::Receiver<bool>,
}

impl TradingSession {
    /// Authenticates `wallet` against the engine, opens the persistent
    /// channel, and spawns the per-channel dispatcher. Bootstrap failures are
    /// fatal; the caller must restart from scratch.
    pub async fn connect(
        config: &ClientConfig,
        wallet: LocalWallet,
        store: Arc<PendingOrderStore>,
        pipeline: Arc<ProofPipeline>,
    ) -> Result<Self, ClientError> {
        let owner = wallet.address();
        let authenticator = SessionAuthenticator::new(config.engine_http.clone(), wallet);
        let credential = authenticator.authenticate().await?;
        let stream = open_channel(&config.engine_ws, &credential).await?;
        let (sink, source) = stream.split();

        let dispatcher = Arc::new(EventDispatcher::new(
            store.clone(),
            pipeline.clone(),
            config.enclave_address,
            config.await_order_timeout,
        ));
        let (closed_tx, closed) = watch::channel(false);
        let reader = tokio::spawn(async move {
            read_loop(source, dispatcher).await;
            let _ = closed_tx.send(true);
        });
        info!("session established for {owner:?}");

        Ok(Self {
            owner,
            token: config.default_token.clone(),
            denomination: config.denomination.clone(),
            sink: Mutex::new(sink),
            store,
            pipeline,
            reader,
            closed,
        })
    }

    /// Resolves once the channel reader has stopped, whether from a transport
    /// failure or an orderly server close. The session cannot receive events
    /// past this point; the caller re-establishes it with a fresh `connect`,
    /// backing off between attempts. Pending orders survive in the store.
    pub async fn closed(&self) {
        channel_closed(self.closed.clone()).await;
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub fn owner(&self) -> Address {
        self.owner
    }

    /// Builds a commitment for `raw`, registers it, and sends it over the
    /// channel. Returns the commitment hash.
    pub async fn submit_order(&self, raw: &RawOrderSpec) -> Result<Fr, ClientError> {
        let commitment = build_commitment(raw, &self.token, &self.denomination)?;
        let hash = commitment.hash;
        self.store
            .insert(PendingOrder::new(commitment.clone(), self.owner))
            .await?;
        self.send(&Outbound::send_order(&commitment)).await?;
        // The acknowledgement may already have claimed the order; a Skipped
        // transition here is fine.
        let _ = self
            .store
            .transition(hash, &[OrderStatus::Constructed], OrderStatus::Submitted)
            .await?;
        info!("submitted order {}", fr_to_hex(&hash));
        Ok(hash)
    }

    /// Drives a cancel proof for an order this session placed.
    pub async fn cancel_order(&self, hash: Fr) -> Result<SubmitOutcome, ClientError> {
        drive_cancel(&self.store, &self.pipeline, self.owner, hash).await
    }

    /// Asks the engine for all orders crossing one of ours; the reply comes
    /// back asynchronously as a crossed-orders event.
    pub async fn request_crossed_orders(&self, hash: Fr) -> Result<(), ClientError> {
        let order = self
            .store
            .lookup(hash)
            .await
            .filter(|order| order.owner == self.owner)
            .ok_or_else(|| ClientError::UnknownOrder {
                hash: fr_to_hex(&hash),
            })?;
        self.send(&Outbound::get_crossed_orders(&order.commitment))
            .await
    }

    /// Asks for the pre-images of all open orders owned by this session.
    pub async fn open_orders(&self) -> Result<(), ClientError> {
        self.send(&Outbound::OpenOrders).await
    }

    /// Resets the engine's book. Development only.
    pub async fn clear_orderbook(&self) -> Result<(), ClientError> {
        self.send(&Outbound::ClearOrderbook).await
    }

    pub async fn upgrade_listening_contract(&self, new_address: Address) -> Result<(), ClientError> {
        self.send(&Outbound::upgrade_listening_contract(format!(
            "{new_address:?}"
        )))
        .await
    }

    async fn send(&self, envelope: &Outbound) -> Result<(), ClientError> {
        let text = serde_json::to_string(envelope)
            .map_err(|e| ClientError::MalformedMessage(format!("unserializable envelope: {e}")))?;
        debug!("sending {text}");
        self.sink.lock().await.send(Message::Text(text)).await?;
        Ok(())
    }

    /// Tears down the channel reader. Pending orders stay in the store.
    pub fn shutdown(self) {
        self.reader.abort();
    }
}

/// Claims Placed → Cancelling and hands the cancel proof to the pipeline; a
/// pipeline failure reverts the claim so the cancel can be retried.
async fn drive_cancel(
    store: &PendingOrderStore,
    pipeline: &ProofPipeline,
    owner: Address,
    hash: Fr,
) -> Result<SubmitOutcome, ClientError> {
    let order = store
        .lookup(hash)
        .await
        .filter(|order| order.owner == owner)
        .ok_or_else(|| ClientError::UnknownOrder {
            hash: fr_to_hex(&hash),
        })?;
    match store
        .transition(hash, &[OrderStatus::Placed], OrderStatus::Cancelling)
        .await?
    {
        Transition::Skipped { current } => {
            info!("cancel of {} skipped in status {current}", fr_to_hex(&hash));
            return Ok(SubmitOutcome::Coalesced);
        }
        Transition::Applied { .. } => {}
    }
    match pipeline.submit_cancel(&order).await {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            let _ = store
                .transition(hash, &[OrderStatus::Cancelling], OrderStatus::Placed)
                .await;
            Err(e)
        }
    }
}

async fn channel_closed(mut closed: watch::Receiver<bool>) {
    while !*closed.borrow_and_update() {
        if closed.changed().await.is_err() {
            return;
        }
    }
}

async fn read_loop<S>(mut source: S, dispatcher: Arc<EventDispatcher>)
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(frame) = source.next().await {
        match frame {
            Ok(message) if message.is_text() => {
                if let Ok(text) = message.into_text() {
                    dispatcher.handle_message(&text).await;
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!("channel transport failure: {e}");
                break;
            }
        }
    }
    debug!("channel closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::VerifierClient;
    use crate::proof::{ProofCalldata, ProofRequest, ProveResponse, Prover, RawGroth16Proof};
    use async_trait::async_trait;
    use ethers::types::{Bytes, H256, U256};
    use futures_util::stream;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::time::{timeout, Duration};

    use crate::order::{build_commitment, PendingOrder, RawOrderSpec, Side};

    /// Fails the first request, then produces a well-formed proof.
    struct FlakyProver {
        failed: AtomicBool,
    }

    #[async_trait]
    impl Prover for FlakyProver {
        async fn prove(&self, request: &ProofRequest) -> Result<ProveResponse, ClientError> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Err(ClientError::ProofGeneration("witness rejected".into()));
            }
            Ok(ProveResponse {
                proof: RawGroth16Proof {
                    pi_a: ["1".into(), "2".into(), "1".into()],
                    pi_b: [
                        ["3".into(), "4".into()],
                        ["5".into(), "6".into()],
                        ["1".into(), "0".into()],
                    ],
                    pi_c: ["7".into(), "8".into(), "1".into()],
                },
                public_signals: request
                    .public_signals()
                    .iter()
                    .map(crate::field::fr_to_dec)
                    .collect(),
            })
        }
    }

    #[derive(Default)]
    struct CountingVerifier {
        cancels: AtomicUsize,
    }

    #[async_trait]
    impl VerifierClient for CountingVerifier {
        async fn place(
            &self,
            _owner: Address,
            _order_hash: U256,
            _enclave_signature: Bytes,
            _calldata: ProofCalldata,
        ) -> Result<H256, ClientError> {
            Ok(H256::zero())
        }

        async fn cancel(
            &self,
            _owner: Address,
            _calldata: ProofCalldata,
        ) -> Result<H256, ClientError> {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            Ok(H256::zero())
        }

        async fn fill(
            &self,
            _owner: Address,
            _calldata: ProofCalldata,
        ) -> Result<H256, ClientError> {
            Ok(H256::zero())
        }
    }

    async fn placed_order(store: &PendingOrderStore, owner: Address) -> Fr {
        let raw = RawOrderSpec {
            price: 10.0,
            volume: 1.0,
            side: Side::Bid,
        };
        let order = PendingOrder::new(build_commitment(&raw, "tok", "0x1").unwrap(), owner);
        let hash = order.commitment.hash;
        store.insert(order).await.unwrap();
        store
            .transition(hash, &[OrderStatus::Constructed], OrderStatus::Placed)
            .await
            .unwrap();
        hash
    }

    #[tokio::test]
    async fn failed_cancel_reverts_to_placed_and_is_retryable() {
        let store = PendingOrderStore::new();
        let verifier = Arc::new(CountingVerifier::default());
        let pipeline = ProofPipeline::new(
            Arc::new(FlakyProver {
                failed: AtomicBool::new(false),
            }),
            verifier.clone(),
        );
        let owner = Address::random();
        let hash = placed_order(&store, owner).await;

        let err = drive_cancel(&store, &pipeline, owner, hash)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::ProofGeneration(_)));
        assert_eq!(store.status(hash).await, Some(OrderStatus::Placed));
        assert_eq!(verifier.cancels.load(Ordering::SeqCst), 0);

        // The claim was reverted and the pipeline slot freed, so the retry
        // goes through.
        let retry = drive_cancel(&store, &pipeline, owner, hash).await.unwrap();
        assert!(matches!(retry, SubmitOutcome::Submitted(_)));
        assert_eq!(store.status(hash).await, Some(OrderStatus::Cancelling));
        assert_eq!(verifier.cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_checks_the_owner() {
        let store = PendingOrderStore::new();
        let verifier = Arc::new(CountingVerifier::default());
        let pipeline = ProofPipeline::new(
            Arc::new(FlakyProver {
                failed: AtomicBool::new(true),
            }),
            verifier.clone(),
        );
        let hash = placed_order(&store, Address::random()).await;

        let result = drive_cancel(&store, &pipeline, Address::random(), hash).await;
        assert!(matches!(result, Err(ClientError::UnknownOrder { .. })));
        assert_eq!(store.status(hash).await, Some(OrderStatus::Placed));
    }

    #[tokio::test]
    async fn channel_death_is_observable() {
        let store = Arc::new(PendingOrderStore::new());
        let verifier = Arc::new(CountingVerifier::default());
        let pipeline = Arc::new(ProofPipeline::new(
            Arc::new(FlakyProver {
                failed: AtomicBool::new(true),
            }),
            verifier,
        ));
        let dispatcher = Arc::new(EventDispatcher::new(
            store,
            pipeline,
            Address::random(),
            Duration::from_millis(50),
        ));

        // A frame the dispatcher drops, then the transport dies.
        let frames = stream::iter(vec![
            Ok(Message::Text("Hello from the server!".to_string())),
            Err(WsError::ConnectionClosed),
        ]);
        let (closed_tx, closed) = watch::channel(false);
        tokio::spawn(async move {
            read_loop(frames, dispatcher).await;
            let _ = closed_tx.send(true);
        });

        timeout(Duration::from_secs(1), channel_closed(closed))
            .await
            .expect("channel death was never surfaced");
    }
}
