//! Two-wallet demo driver: authenticates a trader and their counterparty,
//! resets the dev book, submits both wallets' order files, cancels one order,
//! and asks the engine for crossings of the trader's first order. The
//! dispatcher and confirmation listener do the rest in the background.

use dotenv::dotenv;
use ethers::providers::Provider;
use ethers::signers::LocalWallet;
use ethers_providers::Ws;
use eyre::{Result, WrapErr};
use log::{info, warn};
use std::fs;
use std::sync::Arc;
use tokio::time::Duration;

use unyfy_client::chain::{spawn_confirmation_listener, EthersVerifier};
use unyfy_client::config::ClientConfig;
use unyfy_client::order::RawOrderSpec;
use unyfy_client::pipeline::ProofPipeline;
use unyfy_client::proof::HttpProver;
use unyfy_client::session::TradingSession;
use unyfy_client::store::PendingOrderStore;

fn load_orders(path: &str) -> Result<Vec<RawOrderSpec>> {
    let text = fs::read_to_string(path).wrap_err_with(|| format!("cannot read {path}"))?;
    serde_json::from_str(&text).wrap_err_with(|| format!("cannot parse {path}"))
}

fn var_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

async fn sleep(secs: u64) {
    tokio::time::sleep(Duration::from_secs(secs)).await;
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    pretty_env_logger::init();

    let config = ClientConfig::from_env()?;
    let wallet1: LocalWallet = std::env::var("W1_PRIV_KEY")
        .wrap_err("W1_PRIV_KEY must be set")?
        .parse()?;
    let wallet2: LocalWallet = std::env::var("W2_PRIV_KEY")
        .wrap_err("W2_PRIV_KEY must be set")?
        .parse()?;

    let provider = Arc::new(Provider::<Ws>::connect(&config.chain_ws_url).await?);
    let store = Arc::new(PendingOrderStore::new());

    let mut verifier = EthersVerifier::new(
        provider.clone(),
        config.verifier_address,
        config.chain_id,
        config.gas_price_gwei,
        config.gas_limit,
    );
    verifier.register_owner(wallet1.clone());
    verifier.register_owner(wallet2.clone());
    let pipeline = Arc::new(ProofPipeline::new(
        Arc::new(HttpProver::new(config.prover_url.clone())),
        Arc::new(verifier),
    ));

    let _listener = spawn_confirmation_listener(
        provider.clone(),
        config.verifier_address,
        config.event_start_block,
        store.clone(),
    );

    let session1 =
        TradingSession::connect(&config, wallet1, store.clone(), pipeline.clone()).await?;
    let session2 =
        TradingSession::connect(&config, wallet2, store.clone(), pipeline.clone()).await?;

    session1
        .upgrade_listening_contract(config.verifier_address)
        .await?;
    sleep(5).await;

    // Blank slate for the demo.
    session1.clear_orderbook().await?;
    sleep(5).await;

    let w1_orders = load_orders(&var_or("W1_ORDERS", "artifacts/wallet1_orders.json"))?;
    let w2_orders = load_orders(&var_or("W2_ORDERS", "artifacts/wallet2_orders.json"))?;
    eyre::ensure!(
        !w1_orders.is_empty() && !w2_orders.is_empty(),
        "both order files must contain at least one order"
    );

    let mut w1_hashes = Vec::new();
    for raw in &w1_orders {
        w1_hashes.push(session1.submit_order(raw).await?);
        sleep(5).await;
    }
    let mut w2_hashes = Vec::new();
    for raw in &w2_orders {
        w2_hashes.push(session2.submit_order(raw).await?);
        sleep(5).await;
    }

    // Give the enclave acknowledgements and placements time to land, then
    // confirm the orders were logged in the book.
    sleep(20).await;
    session1.open_orders().await?;
    sleep(1).await;
    session2.open_orders().await?;

    // Cancel the third order sent by the counterparty, if it has one.
    if let Some(hash) = w2_hashes.get(2) {
        session2.cancel_order(*hash).await?;
        sleep(20).await;
        session2.open_orders().await?;
    }

    sleep(5).await;
    // Ask for crossings of the trader's first order; the crossed-orders event
    // drives the fill proof.
    session1.request_crossed_orders(w1_hashes[0]).await?;

    info!("demo flow sent, waiting for events (ctrl-c to exit)");
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = session1.closed() => warn!("trader channel closed by the engine, exiting"),
        _ = session2.closed() => warn!("counterparty channel closed by the engine, exiting"),
    }
    Ok(())
}
