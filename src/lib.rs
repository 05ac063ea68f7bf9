//! Client for the Unyfy confidential trading protocol.
//!
//! Authenticates to the matching engine with a challenge-response handshake,
//! submits hiding order commitments, correlates the engine's asynchronous
//! events with locally pending orders, and drives Groth16 proof submission to
//! the on-chain verifier for place/cancel/fill actions.

pub mod auth;
pub mod chain;
pub mod config;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod field;
pub mod order;
pub mod pipeline;
pub mod proof;
pub mod session;
pub mod store;

pub use config::ClientConfig;
pub use error::ClientError;
pub use session::TradingSession;
