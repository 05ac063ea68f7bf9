//! BN254 scalar-field helpers.
//!
//! Wire formats follow the matching engine's parser: hashes and access keys
//! travel as lowercase hex with no `0x` prefix and no padding, prices and
//! volumes as decimal strings. On-chain values are `uint256` in little-endian
//! byte order relative to the field representation.

use ark_bn254::Fr;
use ark_ff::{BigInteger, PrimeField};
use ethers::types::U256;
use num_bigint::BigUint;

use crate::error::ClientError;

/// The BN254 scalar modulus as a big integer, for range checks and rejection
/// sampling.
pub fn modulus() -> BigUint {
    Fr::MODULUS.into()
}

pub fn fr_to_hex(value: &Fr) -> String {
    BigUint::from(value.into_bigint()).to_str_radix(16)
}

pub fn fr_to_dec(value: &Fr) -> String {
    BigUint::from(value.into_bigint()).to_str_radix(10)
}

pub fn fr_from_hex(text: &str) -> Result<Fr, ClientError> {
    fr_from_radix(text.trim_start_matches("0x"), 16)
}

pub fn fr_from_dec(text: &str) -> Result<Fr, ClientError> {
    fr_from_radix(text, 10)
}

fn fr_from_radix(text: &str, radix: u32) -> Result<Fr, ClientError> {
    let value = BigUint::parse_bytes(text.as_bytes(), radix).ok_or_else(|| {
        ClientError::MalformedMessage(format!("not a base-{radix} field element: {text:?}"))
    })?;
    if value >= modulus() {
        return Err(ClientError::MalformedMessage(format!(
            "value exceeds the scalar modulus: {text:?}"
        )));
    }
    Ok(Fr::from(value))
}

pub fn fr_to_u256(value: &Fr) -> U256 {
    U256::from_little_endian(&value.into_bigint().to_bytes_le())
}

pub fn u256_to_fr(value: &U256) -> Fr {
    let mut bytes = [0u8; 32];
    value.to_little_endian(&mut bytes);
    Fr::from_le_bytes_mod_order(&bytes)
}
