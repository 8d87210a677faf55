//! Circuit cryptography primitives
//!
//! Wrappers over the cipher and digest states a circuit hop carries:
//! AES-CTR keystreams that persist across cells, and running digests that
//! authenticate relay cells (SHA-1 for regular hops, SHA3-256 for the
//! virtual onion-service hop). Also the SHAKE-256 KDF and the hs-ntor MAC
//! construction shared by the onion service modules.
//!
//! The ciphers own their keys; their key schedules are zeroized on drop.

use aes::{Aes128, Aes256};
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use sha1::{Digest, Sha1};
use sha3::digest::{ExtendableOutput, Update, XofReader};
use sha3::{Sha3_256, Shake256};
use subtle::ConstantTimeEq;

type Aes128Ctr = Ctr128BE<Aes128>;
type Aes256Ctr = Ctr128BE<Aes256>;

/// A hop's per-direction cipher stream.
///
/// The keystream position persists across cells: each relay cell consumes
/// up to 509 bytes from exactly where the previous one left off. Regular
/// hops use AES-128, the virtual onion-service hop AES-256. The IV is zero
/// in both cases.
pub struct RelayCipher(CipherInner);

enum CipherInner {
    Aes128(Aes128Ctr),
    Aes256(Aes256Ctr),
}

impl RelayCipher {
    /// AES-128-CTR with zero IV, as keyed by the ntor KDF.
    pub fn aes128(key: &[u8; 16]) -> Self {
        let iv = [0u8; 16];
        RelayCipher(CipherInner::Aes128(Aes128Ctr::new(key.into(), (&iv).into())))
    }

    /// AES-256-CTR with zero IV, as keyed by the hs-ntor KDF.
    pub fn aes256(key: &[u8; 32]) -> Self {
        let iv = [0u8; 16];
        RelayCipher(CipherInner::Aes256(Aes256Ctr::new(key.into(), (&iv).into())))
    }

    /// XORs the next keystream bytes into `buf`, advancing the stream.
    pub fn apply(&mut self, buf: &mut [u8]) {
        match &mut self.0 {
            CipherInner::Aes128(c) => c.apply_keystream(buf),
            CipherInner::Aes256(c) => c.apply_keystream(buf),
        }
    }
}

/// A hop's per-direction running digest.
///
/// Append-only over the lifetime of the hop; never reset between cells.
/// `Clone` gives the snapshot/restore needed on the inbound path: probe a
/// candidate cell against a clone, commit the clone only on a match.
#[derive(Clone)]
pub struct RunningDigest(DigestInner);

#[derive(Clone)]
enum DigestInner {
    Sha1(Sha1),
    Sha3(Sha3_256),
}

impl RunningDigest {
    /// SHA-1 seeded with Df/Db from the ntor KDF (regular hops).
    pub fn sha1(seed: &[u8]) -> Self {
        let mut h = Sha1::new();
        Digest::update(&mut h, seed);
        RunningDigest(DigestInner::Sha1(h))
    }

    /// SHA3-256 seeded with Df/Db from the hs-ntor KDF (virtual hop).
    pub fn sha3(seed: &[u8]) -> Self {
        let mut h = Sha3_256::new();
        Digest::update(&mut h, seed);
        RunningDigest(DigestInner::Sha3(h))
    }

    /// Absorbs more bytes into the running hash.
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.0 {
            DigestInner::Sha1(h) => Digest::update(h, data),
            DigestInner::Sha3(h) => Digest::update(h, data),
        }
    }

    /// Returns the current hash value without disturbing the running state.
    pub fn sum(&self) -> Vec<u8> {
        match &self.0 {
            DigestInner::Sha1(h) => h.clone().finalize().to_vec(),
            DigestInner::Sha3(h) => h.clone().finalize().to_vec(),
        }
    }
}

/// MAC(key, message) = SHA3-256(INT_8(len(key)) || key || message), the MAC
/// construction used throughout the v3 onion service protocol.
pub fn hs_mac(key: &[u8], message: &[u8]) -> [u8; 32] {
    let mut h = Sha3_256::new();
    Digest::update(&mut h, (key.len() as u64).to_be_bytes());
    Digest::update(&mut h, key);
    Digest::update(&mut h, message);
    h.finalize().into()
}

/// Reads `out.len()` bytes of SHAKE-256 output over the concatenation of
/// `parts`.
pub fn shake256(parts: &[&[u8]], out: &mut [u8]) {
    let mut shake = Shake256::default();
    for part in parts {
        shake.update(part);
    }
    shake.finalize_xof().read(out);
}

/// Constant-time equality for digests and MACs.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// True if every byte is zero. Used for the contributory checks on X25519
/// shared secrets; accumulates so the scan is not data-dependent.
pub fn is_all_zeros(b: &[u8]) -> bool {
    let mut acc = 0u8;
    for &v in b {
        acc |= v;
    }
    acc == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cipher_keystream_persists_across_calls() {
        // Two applications of n bytes must equal one application of 2n.
        let key = [7u8; 16];
        let mut one = RelayCipher::aes128(&key);
        let mut two = RelayCipher::aes128(&key);

        let mut whole = [0u8; 64];
        one.apply(&mut whole);

        let mut halves = [0u8; 64];
        two.apply(&mut halves[..32]);
        two.apply(&mut halves[32..]);

        assert_eq!(whole, halves);
    }

    #[test]
    fn cipher_is_symmetric() {
        let key = [3u8; 32];
        let mut enc = RelayCipher::aes256(&key);
        let mut dec = RelayCipher::aes256(&key);

        let mut data = b"relay cell payload".to_vec();
        enc.apply(&mut data);
        assert_ne!(&data, b"relay cell payload");
        dec.apply(&mut data);
        assert_eq!(&data, b"relay cell payload");
    }

    #[test]
    fn running_digest_sum_does_not_reset() {
        let mut d = RunningDigest::sha1(b"seed");
        d.update(b"cell one");
        let first = d.sum();
        assert_eq!(first, d.sum());

        d.update(b"cell two");
        let second = d.sum();
        assert_ne!(first, second);

        // Equivalent to hashing the whole transcript at once.
        let mut all = Sha1::new();
        Digest::update(&mut all, b"seed");
        Digest::update(&mut all, b"cell one");
        Digest::update(&mut all, b"cell two");
        assert_eq!(second, all.finalize().to_vec());
    }

    #[test]
    fn running_digest_clone_is_independent() {
        let mut d = RunningDigest::sha3(&[0xAA; 32]);
        d.update(b"committed");
        let snapshot = d.clone();

        let mut probe = snapshot.clone();
        probe.update(b"speculative");
        assert_ne!(probe.sum(), d.sum());
        assert_eq!(snapshot.sum(), d.sum());
    }

    #[test]
    fn hs_mac_matches_manual_construction() {
        let mac = hs_mac(b"key", b"message");
        let mut h = Sha3_256::new();
        Digest::update(&mut h, 3u64.to_be_bytes());
        Digest::update(&mut h, b"key");
        Digest::update(&mut h, b"message");
        let expected: [u8; 32] = h.finalize().into();
        assert_eq!(mac, expected);
    }

    #[test]
    fn zeros_check() {
        assert!(is_all_zeros(&[0; 32]));
        assert!(!is_all_zeros(&[0, 0, 1, 0]));
        assert!(ct_eq(b"abc", b"abc"));
        assert!(!ct_eq(b"abc", b"abd"));
    }
}
