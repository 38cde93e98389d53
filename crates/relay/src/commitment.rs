//! Commitment engine.
//!
//! Derives the Merkle root the proof circuit attests to from the fields of a lock event:
//!
//! ```text
//!                     root
//!               /             \
//!           hash_a           hash_b
//!           /    \           /     \
//!  H(be32(v1)) H(be32(block)) H(be32(ts)) H(nonce)
//! ```
//!
//! Every parent is the SHA-256 of its two children concatenated in ascending byte order,
//! so each pairing is insensitive to the order its inputs arrive in. Only the low 32
//! bits of `encryptedData` enter the tree; the circuit takes a single 32-bit word for it.

use alloy_primitives::{B256, hex};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zkbridge_types::{Commitment, LIMB_COUNT, LockEvent, split_limbs};

/// Errors from building a commitment.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommitmentError {
    /// A hex field is not valid hex (bad digit or odd length).
    #[error("invalid hex in {field}: {reason}")]
    InvalidHex {
        /// Name of the offending field.
        field: &'static str,
        /// Decoder message.
        reason: String,
    },

    /// A hex field is empty.
    #[error("{field} is empty")]
    EmptyHex {
        /// Name of the offending field.
        field: &'static str,
    },

    /// A numeric field does not fit the 4-byte encoding.
    #[error("{field} {value} does not fit in 32 bits")]
    FieldOverflow {
        /// Name of the offending field.
        field: &'static str,
        /// The value.
        value: u64,
    },
}

/// Computes the commitment from hex-encoded `encrypted_data` and `nonce_hash`.
///
/// Both hex inputs accept an optional `0x` prefix.
pub fn compute_commitment(
    encrypted_data: &str,
    block_number: u64,
    timestamp: u64,
    nonce_hash: &str,
) -> Result<Commitment, CommitmentError> {
    let value1 = value1_as_u32(encrypted_data)?;
    let nonce = decode_hex("nonce_hash", nonce_hash)?;
    let block_number = fit_u32("block_number", block_number)?;
    let timestamp = fit_u32("timestamp", timestamp)?;

    Ok(Commitment::from_root(merkle_root(
        value1,
        block_number,
        timestamp,
        &nonce,
    )))
}

/// Computes the commitment of a decoded lock event.
pub fn commitment_for_event(event: &LockEvent) -> Result<Commitment, CommitmentError> {
    let block_number = fit_u32("block_number", event.block_number)?;
    let timestamp = fit_u32("timestamp", event.timestamp)?;

    Ok(Commitment::from_root(merkle_root(
        event.value1_u32(),
        block_number,
        timestamp,
        event.nonce_hash.as_slice(),
    )))
}

/// Returns the Merkle root over already reduced fields.
pub fn merkle_root(value1: u32, block_number: u32, timestamp: u32, nonce: &[u8]) -> B256 {
    let h1 = sha256(&value1.to_be_bytes());
    let h2 = sha256(&block_number.to_be_bytes());
    let hash_a = hash_sorted_pair(&h1, &h2);

    let hashed_nonce = sha256(nonce);
    let h3 = sha256(&timestamp.to_be_bytes());
    let hash_b = hash_sorted_pair(&h3, &hashed_nonce);

    B256::from(hash_sorted_pair(&hash_a, &hash_b))
}

/// Returns the low 32 bits of a hex-encoded value.
pub fn value1_as_u32(encrypted_data: &str) -> Result<u32, CommitmentError> {
    let bytes = decode_hex("encrypted_data", encrypted_data)?;

    let mut low = [0u8; 4];
    let tail = &bytes[bytes.len().saturating_sub(4)..];
    low[4 - tail.len()..].copy_from_slice(tail);
    Ok(u32::from_be_bytes(low))
}

/// Splits a hex-encoded 32-byte value into eight 32-bit hex limbs.
pub fn split_into_limbs(value: &str) -> Result<[String; LIMB_COUNT], CommitmentError> {
    let bytes = decode_hex("nonce_hash", value)?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|bytes: Vec<u8>| CommitmentError::InvalidHex {
            field: "nonce_hash",
            reason: format!("expected 32 bytes, got {}", bytes.len()),
        })?;
    Ok(split_limbs(&bytes))
}

/// Converts a hex limb to its decimal representation.
pub fn limb_to_decimal(limb: &str) -> Result<String, CommitmentError> {
    let digits = limb.strip_prefix("0x").unwrap_or(limb);
    if digits.is_empty() {
        return Err(CommitmentError::EmptyHex { field: "limb" });
    }
    u64::from_str_radix(digits, 16)
        .map(|value| value.to_string())
        .map_err(|e| CommitmentError::InvalidHex {
            field: "limb",
            reason: e.to_string(),
        })
}

fn hash_sorted_pair(lhs: &[u8; 32], rhs: &[u8; 32]) -> [u8; 32] {
    let (first, second) = if lhs <= rhs { (lhs, rhs) } else { (rhs, lhs) };

    let mut hasher = Sha256::new();
    hasher.update(first);
    hasher.update(second);
    hasher.finalize().into()
}

fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

fn decode_hex(field: &'static str, value: &str) -> Result<Vec<u8>, CommitmentError> {
    let bytes = hex::decode(value).map_err(|e| CommitmentError::InvalidHex {
        field,
        reason: e.to_string(),
    })?;
    if bytes.is_empty() {
        return Err(CommitmentError::EmptyHex { field });
    }
    Ok(bytes)
}

fn fit_u32(field: &'static str, value: u64) -> Result<u32, CommitmentError> {
    u32::try_from(value).map_err(|_| CommitmentError::FieldOverflow { field, value })
}
