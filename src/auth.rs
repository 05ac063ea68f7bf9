//! Challenge-response session bootstrap.
//!
//! Three steps, never reused after the channel is up: fetch a challenge,
//! sign its exact bytes with the wallet key (EIP-191 personal message), and
//! exchange challenge + signature + address for a bearer credential. Any
//! failure is fatal to session establishment; there is no retry policy here.

use ethers::signers::{LocalWallet, Signer};
use log::debug;
use serde_derive::Serialize;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::ClientError;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opaque time-bounded credential. The engine mints and validates it; the
/// client only carries it into the channel handshake.
#[derive(Debug, Clone)]
pub struct BearerToken(String);

impl BearerToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Serialize)]
struct ChallengeResponse {
    challenge_id: String,
    signature: String,
    pub_key: String,
}

pub struct SessionAuthenticator {
    http: reqwest::Client,
    base: String,
    wallet: LocalWallet,
}

impl SessionAuthenticator {
    pub fn new(base: impl Into<String>, wallet: LocalWallet) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.into(),
            wallet,
        }
    }

    /// Runs the full bootstrap. The engine answers `submit_response` with
    /// HTTP 200 for rejections too, carrying an error sentence instead of a
    /// token, so anything that does not look like a JWT is an auth failure.
    pub async fn authenticate(&self) -> Result<BearerToken, ClientError> {
        let challenge: String = self
            .http
            .post(format!("{}/request_challenge", self.base))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        debug!("received challenge {challenge}");

        let signature = self
            .wallet
            .sign_message(challenge.as_bytes())
            .await
            .map_err(|e| ClientError::Auth(format!("challenge signing failed: {e}")))?;

        let response = ChallengeResponse {
            challenge_id: challenge,
            signature: format!("0x{signature}"),
            pub_key: format!("{:?}", self.wallet.address()),
        };
        let credential: String = self
            .http
            .post(format!("{}/submit_response", self.base))
            .json(&response)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if !looks_like_jwt(&credential) {
            return Err(ClientError::Auth(credential));
        }
        debug!("received bearer credential");
        Ok(BearerToken(credential))
    }
}

fn looks_like_jwt(token: &str) -> bool {
    token.split('.').count() == 3 && !token.contains(char::is_whitespace)
}

/// Opens the persistent channel authorized by `token`. One channel per
/// credential.
pub async fn open_channel(ws_url: &str, token: &BearerToken) -> Result<WsStream, ClientError> {
    let mut request = ws_url
        .into_client_request()
        .map_err(|e| ClientError::Transport(format!("bad channel url {ws_url:?}: {e}")))?;
    let header = format!("Bearer {}", token.as_str())
        .parse()
        .map_err(|_| ClientError::Auth("credential is not a valid header value".into()))?;
    request.headers_mut().insert(AUTHORIZATION, header);
    let (stream, _response) = connect_async(request).await?;
    Ok(stream)
}
