use thiserror::Error;

/// Failure taxonomy for the client protocol.
///
/// Only authentication failures and cross-owner hash collisions are fatal to a
/// session. Everything else is isolated to the order that produced it: the
/// dispatcher logs the diagnostic and keeps processing subsequent messages.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid order spec: {0}")]
    InvalidOrderSpec(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("authentication failure: {0}")]
    Auth(String),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// An event referenced a hash never created locally, or `await_order`
    /// timed out waiting for it. May indicate a foreign session's event
    /// misrouted to this client.
    #[error("unknown order {hash}")]
    UnknownOrder { hash: String },

    /// The same commitment hash showed up under two owners. Either a hash
    /// collision or a protocol bug; never silently resolved.
    #[error("order hash {hash} already registered under a different owner")]
    HashCollision { hash: String },

    /// The prover failed for valid inputs. Retryable: proof generation is a
    /// pure function of its inputs.
    #[error("proof generation failed: {0}")]
    ProofGeneration(String),

    /// The pre-flight `eth_call` of the verifier transaction reverted.
    #[error("transaction simulation reverted: {0}")]
    Simulation(String),

    /// Broadcasting the verifier transaction failed (nonce, gas, network).
    #[error("transaction broadcast failed: {0}")]
    Broadcast(String),
}

impl ClientError {
    /// Whether the whole session must be torn down.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::Auth(_) | ClientError::HashCollision { .. }
        )
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        ClientError::Transport(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::Transport(err.to_string())
    }
}
