//! Environment-backed configuration. Defaults mirror the dev deployment on
//! Sepolia; any value can be overridden through the environment (a `.env`
//! file is honored when the binary loads it with dotenv).

use ethers::types::Address;
use eyre::{Result, WrapErr};
use tokio::time::Duration;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the engine's challenge/response endpoints.
    pub engine_http: String,
    /// URL of the engine's authenticated websocket.
    pub engine_ws: String,
    /// Identity the enclave co-signatures must recover to.
    pub enclave_address: Address,
    /// The on-chain verifier contract.
    pub verifier_address: Address,
    pub chain_ws_url: String,
    pub chain_id: u64,
    /// Base URL of the proving sidecar.
    pub prover_url: String,
    pub gas_price_gwei: u64,
    pub gas_limit: u64,
    pub default_token: String,
    pub denomination: String,
    /// How long the dispatcher waits for a referenced order to appear
    /// locally before treating the event as foreign.
    pub await_order_timeout: Duration,
    /// First block the confirmation listener scans for verifier events.
    pub event_start_block: u64,
}

fn var_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl ClientConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            engine_http: var_or("ENGINE_HTTP_URL", "http://127.0.0.1:8000"),
            engine_ws: var_or("ENGINE_WS_URL", "ws://127.0.0.1:8000/ws"),
            enclave_address: var_or(
                "ENCLAVE_ADDRESS",
                "0xa2c03BbE8Ce76d0c93D428A0f913F10b7acCfa9F",
            )
            .parse()
            .wrap_err("ENCLAVE_ADDRESS is not an address")?,
            verifier_address: var_or(
                "VERIFIER_ADDRESS",
                "0x3C3EF8652c104f57acd42D077F060cf00cFc53B5",
            )
            .parse()
            .wrap_err("VERIFIER_ADDRESS is not an address")?,
            chain_ws_url: var_or("CHAIN_WS_URL", "wss://ethereum-sepolia.publicnode.com"),
            chain_id: var_or("CHAIN_ID", "11155111")
                .parse()
                .wrap_err("CHAIN_ID is not a number")?,
            prover_url: var_or("PROVER_URL", "http://127.0.0.1:9000"),
            gas_price_gwei: var_or("GAS_PRICE_GWEI", "100")
                .parse()
                .wrap_err("GAS_PRICE_GWEI is not a number")?,
            gas_limit: var_or("GAS_LIMIT", "500000")
                .parse()
                .wrap_err("GAS_LIMIT is not a number")?,
            default_token: var_or(
                "DEFAULT_TOKEN",
                "92bf259f558808106e4840e2642352b156a31bc41e5b4283df2937278f0a7a65",
            ),
            denomination: var_or("DENOMINATION", "0x1"),
            await_order_timeout: Duration::from_secs(
                var_or("AWAIT_ORDER_TIMEOUT_SECS", "30")
                    .parse()
                    .wrap_err("AWAIT_ORDER_TIMEOUT_SECS is not a number")?,
            ),
            event_start_block: var_or("EVENT_START_BLOCK", "4980382")
                .parse()
                .wrap_err("EVENT_START_BLOCK is not a number")?,
        })
    }
}
