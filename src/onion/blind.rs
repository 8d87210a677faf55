//! Time-period key blinding
//!
//! Derives the per-period blinded identity key, the subcredential, and the
//! shared-random-value choice that anchor every v3 hidden service lookup.
//! The time period rotates at 12:00 UTC: the period number subtracts a
//! 12-hour offset before dividing by the period length.

use crate::consensus::Consensus;
use crate::error::{Error, OnionAddrError, Result};
use curve25519_dalek::edwards::CompressedEdwardsY;
use curve25519_dalek::scalar::Scalar;
use sha3::{Digest, Sha3_256};
use std::time::{SystemTime, UNIX_EPOCH};

/// Default time period length in minutes (one day).
pub const DEFAULT_PERIOD_LENGTH: u64 = 1440;

/// Rotation offset: 12 voting periods of 60 minutes.
const ROTATION_OFFSET_MINUTES: u64 = 720;

/// BLIND_STRING constant, null terminator included.
const BLIND_STRING: &[u8] = b"Derive temporary signing key\x00";

/// The Ed25519 basepoint in the string form fixed by rend-spec-v3.
const ED25519_BASEPOINT_STR: &[u8] = b"(15112221349535400772501151409588531511454012693041857206046113283949847762202, 46316835694926478169428394003475163141307993866256225615783033603165251855960)";

/// Computes the time period number for a point in time:
/// `(minutes_since_epoch - 720) / period_length`.
pub fn time_period(at: SystemTime, period_length: u64) -> u64 {
    let period_length = if period_length == 0 {
        DEFAULT_PERIOD_LENGTH
    } else {
        period_length
    };
    let minutes = at
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        / 60;
    minutes.saturating_sub(ROTATION_OFFSET_MINUTES) / period_length
}

/// Derives the blinded public key `A' = h·A` for a time period, where the
/// blinding scalar `h` is a clamped SHA3-256 over the identity key, the
/// basepoint string, and the period nonce.
pub fn blind_public_key(pubkey: &[u8; 32], period_num: u64, period_length: u64) -> Result<[u8; 32]> {
    let h = blinding_factor(pubkey, period_num, period_length);
    let scalar = Scalar::from_bytes_mod_order(clamp(h));

    let point = CompressedEdwardsY(*pubkey)
        .decompress()
        .ok_or(OnionAddrError::InvalidPoint)?;

    Ok((scalar * point).compress().to_bytes())
}

/// `h = SHA3-256(BLIND_STRING | A | B | N)` with
/// `N = "key-blind" | INT_8(period_num) | INT_8(period_length)`.
/// The shared secret `s` between BLIND_STRING and A is empty for clients.
fn blinding_factor(pubkey: &[u8; 32], period_num: u64, period_length: u64) -> [u8; 32] {
    let mut h = Sha3_256::new();
    h.update(BLIND_STRING);
    h.update(pubkey);
    h.update(ED25519_BASEPOINT_STR);
    h.update(b"key-blind");
    h.update(period_num.to_be_bytes());
    h.update(period_length.to_be_bytes());
    h.finalize().into()
}

/// Standard Ed25519 scalar clamping.
fn clamp(mut h: [u8; 32]) -> [u8; 32] {
    h[0] &= 248;
    h[31] &= 63;
    h[31] |= 64;
    h
}

/// Subcredential for a period:
/// `SHA3-256("subcredential" | SHA3-256("credential" | A) | A')`.
pub fn subcredential(pubkey: &[u8; 32], blinded_key: &[u8; 32]) -> [u8; 32] {
    let mut cred = Sha3_256::new();
    cred.update(b"credential");
    cred.update(pubkey);
    let credential = cred.finalize();

    let mut sub = Sha3_256::new();
    sub.update(b"subcredential");
    sub.update(credential);
    sub.update(blinded_key);
    sub.finalize().into()
}

/// Picks the shared random value a client must use, per rend-spec-v3
/// §2.2.4.1. The SRV rotates at 00:00 UTC and the time period at 12:00
/// UTC, so a consensus from the first half of the UTC day pairs with the
/// previous SRV.
pub fn srv_for_client(consensus: &Consensus) -> Result<[u8; 32]> {
    let hour = consensus.valid_after_hour().ok_or(Error::NoSharedRandom)?;
    if hour >= 12 {
        return consensus.srv_current.ok_or(Error::NoSharedRandom);
    }
    if let Some(srv) = consensus.srv_previous {
        return Ok(srv);
    }
    consensus.srv_current.ok_or(Error::NoSharedRandom)
}
