//! v3 onion address encoding
//!
//! `base32(pubkey[32] || checksum[2] || version)` with a SHA3-256 checksum,
//! lowercased, `.onion` suffix. Decoding rejects wrong length, wrong
//! version, checksum mismatch, and pubkeys that are not valid Ed25519
//! points.

use crate::error::{OnionAddrError, Result};
use curve25519_dalek::edwards::CompressedEdwardsY;
use data_encoding::BASE32_NOPAD;
use sha3::{Digest, Sha3_256};

const ONION_VERSION: u8 = 0x03;
const CHECKSUM_PREFIX: &[u8] = b".onion checksum";

/// Decodes a v3 `.onion` address (suffix optional) into the service's
/// Ed25519 public identity key.
pub fn decode_onion(address: &str) -> Result<[u8; 32]> {
    let address = address.to_ascii_lowercase();
    let body = address.strip_suffix(".onion").unwrap_or(&address);

    let decoded = BASE32_NOPAD
        .decode(body.to_ascii_uppercase().as_bytes())
        .map_err(|e| OnionAddrError::Encoding(e.to_string()))?;

    if decoded.len() != 35 {
        return Err(OnionAddrError::Length(decoded.len()).into());
    }

    let mut pubkey = [0u8; 32];
    pubkey.copy_from_slice(&decoded[..32]);
    let checksum = &decoded[32..34];
    let version = decoded[34];

    // The checksum covers the version byte, so it is checked first: any
    // corruption of the trailing bytes reads as a checksum failure.
    if checksum != onion_checksum(&pubkey, version) {
        return Err(OnionAddrError::Checksum.into());
    }

    if version != ONION_VERSION {
        return Err(OnionAddrError::Version(version).into());
    }

    // The pubkey must be a valid point, or blinding would fail later.
    if CompressedEdwardsY(pubkey).decompress().is_none() {
        return Err(OnionAddrError::InvalidPoint.into());
    }

    Ok(pubkey)
}

/// Encodes a service identity key as its canonical `.onion` address.
pub fn encode_onion(pubkey: &[u8; 32]) -> String {
    let mut buf = [0u8; 35];
    buf[..32].copy_from_slice(pubkey);
    buf[32..34].copy_from_slice(&onion_checksum(pubkey, ONION_VERSION));
    buf[34] = ONION_VERSION;
    let mut addr = BASE32_NOPAD.encode(&buf).to_ascii_lowercase();
    addr.push_str(".onion");
    addr
}

/// True if `target` ("host" or "host:port") names an onion service.
pub fn is_onion_address(target: &str) -> bool {
    let host = match target.rsplit_once(':') {
        Some((host, _port)) => host,
        None => target,
    };
    host.to_ascii_lowercase().ends_with(".onion")
}

fn onion_checksum(pubkey: &[u8; 32], version: u8) -> [u8; 2] {
    let mut h = Sha3_256::new();
    h.update(CHECKSUM_PREFIX);
    h.update(pubkey);
    h.update([version]);
    let sum = h.finalize();
    [sum[0], sum[1]]
}
