//! Order commitments and the pending-order lifecycle.
//!
//! A raw `{price, volume, side}` spec is scaled into the fixed-point domain of
//! the proof circuits, blinded with a uniformly sampled access key, and bound
//! to a single field element by a circom-compatible poseidon-4 hash. The hash
//! alone reveals nothing about the shielded fields; the engine and the
//! verifier only ever see it.

use ark_bn254::Fr;
use ark_ff::Zero;
use chrono::{DateTime, Utc};
use ethers::types::Address;
use light_poseidon::{Poseidon, PoseidonHasher};
use num_bigint::BigUint;
use rand::Rng;
use serde::Deserialize;
use std::fmt;

use crate::error::ClientError;
use crate::field;

/// Prices and volumes are multiplied by 10^9 before entering the field.
pub const FIXED_POINT_SCALE: f64 = 1e9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "u64")]
pub enum Side {
    Bid,
    Ask,
}

impl Side {
    pub fn as_u64(self) -> u64 {
        match self {
            Side::Bid => 0,
            Side::Ask => 1,
        }
    }

    pub fn as_fr(self) -> Fr {
        Fr::from(self.as_u64())
    }

    /// Wire encoding: "0" for bid, "1" for ask.
    pub fn wire(self) -> String {
        self.as_u64().to_string()
    }
}

impl TryFrom<u64> for Side {
    type Error = String;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Side::Bid),
            1 => Ok(Side::Ask),
            other => Err(format!("side must be 0 (bid) or 1 (ask), got {other}")),
        }
    }
}

/// User-provided order, as read from an orders file. Never stored after
/// commitment construction.
#[derive(Debug, Clone, Deserialize)]
pub struct RawOrderSpec {
    pub price: f64,
    pub volume: f64,
    pub side: Side,
}

/// Cleartext half of a commitment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransparentFields {
    pub side: Side,
    pub token: String,
    pub denomination: String,
}

/// Intended-private half of a commitment. Leaves the client only inside the
/// authenticated channel and the prover's witness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShieldedFields {
    pub price: Fr,
    pub volume: Fr,
    pub access_key: Fr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderCommitment {
    pub transparent: TransparentFields,
    pub shielded: ShieldedFields,
    /// poseidon4(price, volume, side, access_key)
    pub hash: Fr,
}

/// Builds a hiding commitment for `raw`. Rejects non-positive or non-finite
/// prices and volumes; never coerces.
pub fn build_commitment(
    raw: &RawOrderSpec,
    token: &str,
    denomination: &str,
) -> Result<OrderCommitment, ClientError> {
    let price = scale_to_fixed_point(raw.price, "price")?;
    let volume = scale_to_fixed_point(raw.volume, "volume")?;
    let shielded = ShieldedFields {
        price: Fr::from(price),
        volume: Fr::from(volume),
        access_key: uniform_scalar(),
    };
    let hash = commitment_hash(&shielded, raw.side)?;
    Ok(OrderCommitment {
        transparent: TransparentFields {
            side: raw.side,
            token: token.to_owned(),
            denomination: denomination.to_owned(),
        },
        shielded,
        hash,
    })
}

/// Recomputes the commitment hash from its preimage. Must stay bit-for-bit
/// compatible with the hash the verifier circuits compute.
pub fn commitment_hash(shielded: &ShieldedFields, side: Side) -> Result<Fr, ClientError> {
    let mut hasher = Poseidon::<Fr>::new_circom(4)
        .map_err(|e| ClientError::InvalidOrderSpec(format!("poseidon setup: {e}")))?;
    hasher
        .hash(&[shielded.price, shielded.volume, side.as_fr(), shielded.access_key])
        .map_err(|e| ClientError::InvalidOrderSpec(format!("poseidon hash: {e}")))
}

fn scale_to_fixed_point(value: f64, name: &str) -> Result<u64, ClientError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ClientError::InvalidOrderSpec(format!(
            "{name} must be a positive finite number, got {value}"
        )));
    }
    let scaled = (value * FIXED_POINT_SCALE).round();
    if scaled < 1.0 || scaled > 9e18 {
        return Err(ClientError::InvalidOrderSpec(format!(
            "{name} {value} is outside the fixed-point domain"
        )));
    }
    Ok(scaled as u64)
}

/// Uniform scalar below the BN254 modulus via rejection sampling: draw 256
/// uniform bits, resample while >= modulus. No modulo bias.
pub fn uniform_scalar() -> Fr {
    let modulus = field::modulus();
    let mut rng = rand::thread_rng();
    loop {
        let mut bytes = [0u8; 32];
        rng.fill(&mut bytes);
        let candidate = BigUint::from_bytes_be(&bytes);
        if candidate < modulus {
            return Fr::from(candidate);
        }
    }
}

/// Lifecycle of a locally created order. The declared order backs the
/// `>= Placed` precondition checks, so variants must stay in protocol order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OrderStatus {
    Constructed,
    Submitted,
    Acknowledged,
    Placing,
    Placed,
    Filling,
    Cancelling,
    Filled,
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Cancelled)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OrderStatus::Constructed => "constructed",
            OrderStatus::Submitted => "submitted",
            OrderStatus::Acknowledged => "acknowledged",
            OrderStatus::Placing => "placing",
            OrderStatus::Placed => "placed",
            OrderStatus::Filling => "filling",
            OrderStatus::Cancelling => "cancelling",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// A locally created order awaiting protocol events. Owned exclusively by the
/// wallet that created it.
#[derive(Debug, Clone)]
pub struct PendingOrder {
    pub commitment: OrderCommitment,
    pub owner: Address,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

impl PendingOrder {
    pub fn new(commitment: OrderCommitment, owner: Address) -> Self {
        Self {
            commitment,
            owner,
            status: OrderStatus::Constructed,
            created_at: Utc::now(),
        }
    }
}

/// Zero sentinel used to pad fill batches.
pub fn zero_hash() -> Fr {
    Fr::zero()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(price: f64, volume: f64, side: Side) -> RawOrderSpec {
        RawOrderSpec { price, volume, side }
    }

    #[test]
    fn rejects_invalid_specs() {
        for raw in [
            spec(0.0, 1.0, Side::Bid),
            spec(-2.0, 1.0, Side::Bid),
            spec(1.0, 0.0, Side::Ask),
            spec(f64::NAN, 1.0, Side::Bid),
            spec(1.0, f64::INFINITY, Side::Ask),
        ] {
            assert!(matches!(
                build_commitment(&raw, "tok", "0x1"),
                Err(ClientError::InvalidOrderSpec(_))
            ));
        }
    }

    #[test]
    fn scales_by_ten_to_the_ninth() {
        let commitment = build_commitment(&spec(2.5, 0.75, Side::Bid), "tok", "0x1").unwrap();
        assert_eq!(commitment.shielded.price, Fr::from(2_500_000_000u64));
        assert_eq!(commitment.shielded.volume, Fr::from(750_000_000u64));
    }

    #[test]
    fn fresh_access_keys_give_distinct_hashes() {
        let raw = spec(100.0, 3.0, Side::Ask);
        let first = build_commitment(&raw, "tok", "0x1").unwrap();
        let second = build_commitment(&raw, "tok", "0x1").unwrap();
        assert_ne!(first.shielded.access_key, second.shielded.access_key);
        assert_ne!(first.hash, second.hash);
    }

    #[test]
    fn hash_recomputes_from_stored_fields() {
        let commitment = build_commitment(&spec(42.0, 7.0, Side::Bid), "tok", "0x1").unwrap();
        let recomputed = commitment_hash(&commitment.shielded, Side::Bid).unwrap();
        assert_eq!(recomputed, commitment.hash);
    }

    #[test]
    fn sampled_scalars_stay_below_the_modulus() {
        let modulus = field::modulus();
        for _ in 0..32 {
            let sample = uniform_scalar();
            assert!(BigUint::from(ark_ff::PrimeField::into_bigint(sample)) < modulus);
        }
    }

    #[test]
    fn status_order_backs_placed_precondition() {
        use OrderStatus::*;
        assert!(Placed >= Placed);
        assert!(Filling >= Placed);
        assert!(Filled >= Placed);
        assert!(Placing < Placed);
        assert!(Submitted < Placed);
        assert!(Filled.is_terminal());
        assert!(Cancelled.is_terminal());
        assert!(!Filling.is_terminal());
    }

    #[test]
    fn side_parses_from_numeric_wire_form() {
        assert_eq!(Side::try_from(0u64).unwrap(), Side::Bid);
        assert_eq!(Side::try_from(1u64).unwrap(), Side::Ask);
        assert!(Side::try_from(2u64).is_err());
        assert_eq!(Side::Ask.wire(), "1");
    }
}
