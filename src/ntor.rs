//! ntor handshake (CREATE2/CREATED2)
//!
//! Client side of the `ntor-curve25519-sha256-1` key agreement. The client
//! sends `ID || B || X` (84 bytes) in CREATE2/EXTEND2 and completes against
//! the relay's `Y || AUTH` (64 bytes), deriving the hop key material via
//! HKDF-SHA256.
//!
//! The ephemeral scalar and all intermediate secrets are zeroized on every
//! exit path.

use crate::crypto::{ct_eq, is_all_zeros};
use crate::error::{NtorError, Result};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

const PROTOID: &[u8] = b"ntor-curve25519-sha256-1";
const T_KEY: &[u8] = b"ntor-curve25519-sha256-1:key_extract";
const T_MAC: &[u8] = b"ntor-curve25519-sha256-1:mac";
const T_VERIFY: &[u8] = b"ntor-curve25519-sha256-1:verify";
const M_EXPAND: &[u8] = b"ntor-curve25519-sha256-1:key_expand";

/// Length of the client handshake data in CREATE2/EXTEND2.
pub const CLIENT_DATA_LEN: usize = 84;
/// Length of the server response in CREATED2/EXTENDED2.
pub const SERVER_DATA_LEN: usize = 64;

type HmacSha256 = Hmac<Sha256>;

/// Hop key material derived from a completed ntor handshake.
#[derive(Zeroize, zeroize::ZeroizeOnDrop)]
pub struct KeyMaterial {
    /// Forward digest seed (client -> relay).
    pub df: [u8; 20],
    /// Backward digest seed (relay -> client).
    pub db: [u8; 20],
    /// Forward AES-128-CTR key.
    pub kf: [u8; 16],
    /// Backward AES-128-CTR key.
    pub kb: [u8; 16],
}

/// Client state for one ntor handshake.
pub struct NtorHandshake {
    node_id: [u8; 20],
    onion_key: PublicKey,
    secret: StaticSecret,
    public: PublicKey,
}

impl NtorHandshake {
    /// Creates handshake state with a fresh ephemeral keypair.
    ///
    /// `node_id` is the SHA-1 of the relay's RSA identity; `onion_key` is
    /// the relay's Curve25519 onion key (B) from its microdescriptor.
    pub fn new(node_id: [u8; 20], onion_key: [u8; 32]) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            node_id,
            onion_key: PublicKey::from(onion_key),
            secret,
            public,
        }
    }

    /// The 84-byte CREATE2/EXTEND2 HDATA: `ID || B || X`.
    pub fn client_data(&self) -> [u8; CLIENT_DATA_LEN] {
        let mut data = [0u8; CLIENT_DATA_LEN];
        data[0..20].copy_from_slice(&self.node_id);
        data[20..52].copy_from_slice(self.onion_key.as_bytes());
        data[52..84].copy_from_slice(self.public.as_bytes());
        data
    }

    /// Processes the server's `Y || AUTH` response, verifies AUTH in
    /// constant time, and derives the hop keys.
    ///
    /// Consumes the handshake; the ephemeral scalar is zeroized when the
    /// state drops, on success and failure alike.
    pub fn complete(self, server_data: &[u8]) -> Result<KeyMaterial> {
        if server_data.len() < SERVER_DATA_LEN {
            return Err(NtorError::BadResponseLen(server_data.len()).into());
        }
        let mut y_bytes = [0u8; 32];
        y_bytes.copy_from_slice(&server_data[0..32]);
        let auth_received = &server_data[32..64];
        let server_public = PublicKey::from(y_bytes);

        // EXP(Y,x) and EXP(B,x), with contributory checks.
        let exp_xy = self.secret.diffie_hellman(&server_public);
        if is_all_zeros(exp_xy.as_bytes()) {
            return Err(NtorError::ZeroPoint.into());
        }
        let exp_xb = self.secret.diffie_hellman(&self.onion_key);
        if is_all_zeros(exp_xb.as_bytes()) {
            return Err(NtorError::ZeroPoint.into());
        }

        // secret_input = EXP(Y,x) || EXP(B,x) || ID || B || X || Y || PROTOID (204 bytes)
        let mut secret_input = Zeroizing::new(Vec::with_capacity(204));
        secret_input.extend_from_slice(exp_xy.as_bytes());
        secret_input.extend_from_slice(exp_xb.as_bytes());
        secret_input.extend_from_slice(&self.node_id);
        secret_input.extend_from_slice(self.onion_key.as_bytes());
        secret_input.extend_from_slice(self.public.as_bytes());
        secret_input.extend_from_slice(server_public.as_bytes());
        secret_input.extend_from_slice(PROTOID);

        // verify = HMAC-SHA256(t_verify, secret_input)
        let verify = Zeroizing::new(hmac_sha256(T_VERIFY, &secret_input));

        // auth_input = verify || ID || B || Y || X || PROTOID || "Server"
        let mut auth_input = Zeroizing::new(Vec::with_capacity(178));
        auth_input.extend_from_slice(&*verify);
        auth_input.extend_from_slice(&self.node_id);
        auth_input.extend_from_slice(self.onion_key.as_bytes());
        auth_input.extend_from_slice(server_public.as_bytes());
        auth_input.extend_from_slice(self.public.as_bytes());
        auth_input.extend_from_slice(PROTOID);
        auth_input.extend_from_slice(b"Server");

        let expected_auth = hmac_sha256(T_MAC, &auth_input);
        if !ct_eq(&expected_auth, auth_received) {
            return Err(NtorError::BadAuth.into());
        }

        // Df(20) || Db(20) || Kf(16) || Kb(16) via HKDF-SHA256.
        let hkdf = Hkdf::<Sha256>::new(Some(T_KEY), &secret_input);
        let mut okm = Zeroizing::new([0u8; 72]);
        hkdf.expand(M_EXPAND, &mut *okm)
            .expect("72 bytes is a valid HKDF-SHA256 output length");

        let mut km = KeyMaterial {
            df: [0; 20],
            db: [0; 20],
            kf: [0; 16],
            kb: [0; 16],
        };
        km.df.copy_from_slice(&okm[0..20]);
        km.db.copy_from_slice(&okm[20..40]);
        km.kf.copy_from_slice(&okm[40..56]);
        km.kb.copy_from_slice(&okm[56..72]);

        Ok(km)
    }
}

fn hmac_sha256(key: &[u8], msg: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(msg);
    mac.finalize().into_bytes().into()
}
