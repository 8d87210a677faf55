//! hs-ntor handshake
//!
//! The `tor-hs-ntor-curve25519-sha3-256-1` key agreement run inside the
//! INTRODUCE1 envelope and completed by RENDEZVOUS2. It derives the
//! encryption/MAC keys for the INTRODUCE1 body on the way out and the
//! virtual hop's key material (AES-256-CTR keys, SHA3-256 digest seeds) on
//! the way back.

use crate::crypto::{ct_eq, hs_mac, is_all_zeros, shake256, RelayCipher};
use crate::error::{HsNtorError, Result};
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

const PROTOID: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1";
const T_HSENC: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1:hs_key_extract";
const T_HSVERIFY: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1:hs_verify";
const T_HSMAC: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1:hs_mac";
const M_HSEXPAND: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1:hs_key_expand";

/// Fixed plaintext length of the INTRODUCE1 encrypted section.
const INTRODUCE1_PLAINTEXT_LEN: usize = 246;

/// Rendezvous cookie length.
pub const REND_COOKIE_LEN: usize = 20;

/// Key material for the virtual onion-service hop.
#[derive(Zeroize, zeroize::ZeroizeOnDrop)]
pub struct HsKeyMaterial {
    /// Forward SHA3-256 digest seed.
    pub df: [u8; 32],
    /// Backward SHA3-256 digest seed.
    pub db: [u8; 32],
    /// Forward AES-256-CTR key.
    pub kf: [u8; 32],
    /// Backward AES-256-CTR key.
    pub kb: [u8; 32],
}

/// Client state carried from INTRODUCE1 to RENDEZVOUS2.
pub struct HsNtorClient {
    secret: StaticSecret,
    public: PublicKey,
    /// Service encryption key B (enc-key ntor from the descriptor).
    enc_key: PublicKey,
    /// Introduction point auth key.
    auth_key: [u8; 32],
}

impl HsNtorClient {
    /// Starts the handshake: generates the ephemeral keypair and derives
    /// the INTRODUCE1 body keys `(ENC_KEY, MAC_KEY)`.
    fn start(
        enc_key: [u8; 32],
        auth_key: [u8; 32],
        subcredential: &[u8; 32],
    ) -> Result<(Self, Zeroizing<[u8; 32]>, Zeroizing<[u8; 32]>)> {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        let enc_key = PublicKey::from(enc_key);

        let exp_bx = secret.diffie_hellman(&enc_key);
        if is_all_zeros(exp_bx.as_bytes()) {
            return Err(HsNtorError::ZeroPoint.into());
        }

        // intro_secret = EXP(B,x) | AUTH_KEY | X | B | PROTOID
        let mut intro_secret = Zeroizing::new(Vec::with_capacity(32 * 4 + PROTOID.len()));
        intro_secret.extend_from_slice(exp_bx.as_bytes());
        intro_secret.extend_from_slice(&auth_key);
        intro_secret.extend_from_slice(public.as_bytes());
        intro_secret.extend_from_slice(enc_key.as_bytes());
        intro_secret.extend_from_slice(PROTOID);

        // (ENC_KEY, MAC_KEY) = SHAKE-256(intro_secret | t_hsenc | info, 64)
        // with info = m_hsexpand | subcredential.
        let mut keys = Zeroizing::new([0u8; 64]);
        shake256(
            &[&intro_secret, T_HSENC, M_HSEXPAND, subcredential],
            &mut *keys,
        );

        let mut enc = Zeroizing::new([0u8; 32]);
        let mut mac = Zeroizing::new([0u8; 32]);
        enc.copy_from_slice(&keys[..32]);
        mac.copy_from_slice(&keys[32..]);

        Ok((
            Self {
                secret,
                public,
                enc_key,
                auth_key,
            },
            enc,
            mac,
        ))
    }

    /// Completes the handshake against the RENDEZVOUS2 body `Y || AUTH`.
    /// Verifies AUTH in constant time and expands the virtual hop keys.
    pub fn complete(self, rendezvous2_body: &[u8]) -> Result<HsKeyMaterial> {
        if rendezvous2_body.len() < 64 {
            return Err(crate::error::Error::ProtocolViolation(format!(
                "RENDEZVOUS2 body too short: {} bytes",
                rendezvous2_body.len()
            )));
        }
        let mut y_bytes = [0u8; 32];
        y_bytes.copy_from_slice(&rendezvous2_body[..32]);
        let auth = &rendezvous2_body[32..64];
        let server_public = PublicKey::from(y_bytes);

        let exp_yx = self.secret.diffie_hellman(&server_public);
        if is_all_zeros(exp_yx.as_bytes()) {
            return Err(HsNtorError::ZeroPoint.into());
        }
        let exp_bx = self.secret.diffie_hellman(&self.enc_key);
        if is_all_zeros(exp_bx.as_bytes()) {
            return Err(HsNtorError::ZeroPoint.into());
        }

        // rend_secret = EXP(Y,x) | EXP(B,x) | AUTH_KEY | B | X | Y | PROTOID
        let mut rend_secret = Zeroizing::new(Vec::with_capacity(32 * 6 + PROTOID.len()));
        rend_secret.extend_from_slice(exp_yx.as_bytes());
        rend_secret.extend_from_slice(exp_bx.as_bytes());
        rend_secret.extend_from_slice(&self.auth_key);
        rend_secret.extend_from_slice(self.enc_key.as_bytes());
        rend_secret.extend_from_slice(self.public.as_bytes());
        rend_secret.extend_from_slice(server_public.as_bytes());
        rend_secret.extend_from_slice(PROTOID);

        let ntor_key_seed = Zeroizing::new(hs_mac(&rend_secret, T_HSENC));
        let verify = Zeroizing::new(hs_mac(&rend_secret, T_HSVERIFY));

        // auth_input = verify | AUTH_KEY | B | Y | X | PROTOID | "Server"
        let mut auth_input = Zeroizing::new(Vec::with_capacity(32 * 5 + PROTOID.len() + 6));
        auth_input.extend_from_slice(&*verify);
        auth_input.extend_from_slice(&self.auth_key);
        auth_input.extend_from_slice(self.enc_key.as_bytes());
        auth_input.extend_from_slice(server_public.as_bytes());
        auth_input.extend_from_slice(self.public.as_bytes());
        auth_input.extend_from_slice(PROTOID);
        auth_input.extend_from_slice(b"Server");

        let expected_auth = hs_mac(&auth_input, T_HSMAC);
        if !ct_eq(&expected_auth, auth) {
            return Err(HsNtorError::BadAuth.into());
        }

        Ok(expand_keys(&*ntor_key_seed))
    }
}

/// `K = SHAKE-256(NTOR_KEY_SEED | m_hsexpand, 128)`, split as
/// `Df(32) | Db(32) | Kf(32) | Kb(32)`.
fn expand_keys(ntor_key_seed: &[u8; 32]) -> HsKeyMaterial {
    let mut okm = Zeroizing::new([0u8; 128]);
    shake256(&[ntor_key_seed, M_HSEXPAND], &mut *okm);

    let mut km = HsKeyMaterial {
        df: [0; 32],
        db: [0; 32],
        kf: [0; 32],
        kb: [0; 32],
    };
    km.df.copy_from_slice(&okm[0..32]);
    km.db.copy_from_slice(&okm[32..64]);
    km.kf.copy_from_slice(&okm[64..96]);
    km.kb.copy_from_slice(&okm[96..128]);
    km
}

/// Builds the INTRODUCE1 relay payload and the client state needed to
/// complete the handshake when RENDEZVOUS2 arrives.
///
/// The plaintext carries the rendezvous cookie, the rendezvous point's
/// ntor onion key, and its link specifiers; it is padded to 246 bytes and
/// encrypted under the derived ENC_KEY with a zero IV.
pub fn build_introduce1(
    auth_key: [u8; 32],
    enc_key: [u8; 32],
    subcredential: &[u8; 32],
    rend_cookie: &[u8; REND_COOKIE_LEN],
    rend_onion_key: &[u8; 32],
    rend_link_specs: &[u8],
) -> Result<(Vec<u8>, HsNtorClient)> {
    let (state, body_enc_key, body_mac_key) = HsNtorClient::start(enc_key, auth_key, subcredential)?;

    // Plaintext: cookie | N_EXT=0 | key_type=ntor | u16 keylen | key | specs.
    let mut plaintext = Zeroizing::new(Vec::with_capacity(INTRODUCE1_PLAINTEXT_LEN));
    plaintext.extend_from_slice(rend_cookie);
    plaintext.push(0x00);
    plaintext.push(0x01);
    plaintext.extend_from_slice(&32u16.to_be_bytes());
    plaintext.extend_from_slice(rend_onion_key);
    plaintext.extend_from_slice(rend_link_specs);
    if plaintext.len() < INTRODUCE1_PLAINTEXT_LEN {
        plaintext.resize(INTRODUCE1_PLAINTEXT_LEN, 0);
    }

    let mut ciphertext = plaintext.to_vec();
    RelayCipher::aes256(&body_enc_key).apply(&mut ciphertext);

    // Header: LEGACY_KEY_ID(20 zeros) | AUTH_KEY_TYPE=ed25519 | u16 len |
    // AUTH_KEY | N_EXT=0.
    let mut header = Vec::with_capacity(20 + 1 + 2 + 32 + 1);
    header.extend_from_slice(&[0u8; 20]);
    header.push(0x02);
    header.extend_from_slice(&32u16.to_be_bytes());
    header.extend_from_slice(&auth_key);
    header.push(0x00);

    // MAC over H | X | ciphertext binds the envelope to this handshake.
    let mut mac_input = Vec::with_capacity(header.len() + 32 + ciphertext.len());
    mac_input.extend_from_slice(&header);
    mac_input.extend_from_slice(state.public.as_bytes());
    mac_input.extend_from_slice(&ciphertext);
    let mac = hs_mac(&*body_mac_key, &mac_input);

    let mut payload = Vec::with_capacity(header.len() + 32 + ciphertext.len() + 32);
    payload.extend_from_slice(&header);
    payload.extend_from_slice(state.public.as_bytes());
    payload.extend_from_slice(&ciphertext);
    payload.extend_from_slice(&mac);

    Ok((payload, state))
}

/// Generates a fresh 20-byte rendezvous cookie.
pub fn generate_rend_cookie() -> [u8; REND_COOKIE_LEN] {
    let mut cookie = [0u8; REND_COOKIE_LEN];
    OsRng.fill_bytes(&mut cookie);
    cookie
}

/// Encodes the rendezvous point's link specifiers for the INTRODUCE1
/// plaintext: IPv4, legacy RSA identity, and the Ed25519 identity when
/// known.
pub fn build_rend_link_specs(
    identity: &[u8; 20],
    address: std::net::Ipv4Addr,
    or_port: u16,
    ed25519_id: Option<&[u8; 32]>,
) -> Vec<u8> {
    let mut specs = Vec::with_capacity(1 + 8 + 22 + 34);
    specs.push(if ed25519_id.is_some() { 3 } else { 2 });

    specs.push(0x00);
    specs.push(0x06);
    specs.extend_from_slice(&address.octets());
    specs.extend_from_slice(&or_port.to_be_bytes());

    specs.push(0x02);
    specs.push(0x14);
    specs.extend_from_slice(identity);

    if let Some(ed) = ed25519_id {
        specs.push(0x03);
        specs.push(0x20);
        specs.extend_from_slice(ed);
    }
    specs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::RunningDigest;

    /// The service/rendezvous-point side of the exchange, straight from the
    /// rend-spec equations.
    struct TestService {
        enc_secret: StaticSecret,
        enc_public: PublicKey,
        auth_key: [u8; 32],
        subcred: [u8; 32],
    }

    impl TestService {
        fn new() -> Self {
            let enc_secret = StaticSecret::random_from_rng(OsRng);
            let enc_public = PublicKey::from(&enc_secret);
            Self {
                enc_secret,
                enc_public,
                auth_key: [0x41; 32],
                subcred: [0x51; 32],
            }
        }

        /// Produces `Y || AUTH` and the server's NTOR_KEY_SEED for a client
        /// public key X.
        fn rendezvous2(&self, client_public: &PublicKey) -> ([u8; 64], [u8; 32]) {
            let y_secret = StaticSecret::random_from_rng(OsRng);
            let y_public = PublicKey::from(&y_secret);

            let exp_yx = y_secret.diffie_hellman(client_public);
            let exp_bx = self.enc_secret.diffie_hellman(client_public);

            let mut rend_secret = Vec::new();
            rend_secret.extend_from_slice(exp_yx.as_bytes());
            rend_secret.extend_from_slice(exp_bx.as_bytes());
            rend_secret.extend_from_slice(&self.auth_key);
            rend_secret.extend_from_slice(self.enc_public.as_bytes());
            rend_secret.extend_from_slice(client_public.as_bytes());
            rend_secret.extend_from_slice(y_public.as_bytes());
            rend_secret.extend_from_slice(PROTOID);

            let seed = hs_mac(&rend_secret, T_HSENC);
            let verify = hs_mac(&rend_secret, T_HSVERIFY);

            let mut auth_input = Vec::new();
            auth_input.extend_from_slice(&verify);
            auth_input.extend_from_slice(&self.auth_key);
            auth_input.extend_from_slice(self.enc_public.as_bytes());
            auth_input.extend_from_slice(y_public.as_bytes());
            auth_input.extend_from_slice(client_public.as_bytes());
            auth_input.extend_from_slice(PROTOID);
            auth_input.extend_from_slice(b"Server");
            let auth = hs_mac(&auth_input, T_HSMAC);

            let mut body = [0u8; 64];
            body[..32].copy_from_slice(y_public.as_bytes());
            body[32..].copy_from_slice(&auth);
            (body, seed)
        }
    }

    fn client_for(service: &TestService) -> (Vec<u8>, HsNtorClient) {
        build_introduce1(
            service.auth_key,
            *service.enc_public.as_bytes(),
            &service.subcred,
            &[0x71; REND_COOKIE_LEN],
            &[0x72; 32],
            &build_rend_link_specs(&[0x73; 20], std::net::Ipv4Addr::new(192, 0, 2, 1), 443, None),
        )
        .unwrap()
    }

    #[test]
    fn introduce1_payload_layout() {
        let service = TestService::new();
        let (payload, state) = client_for(&service);

        // H(56) | X(32) | ciphertext(246) | MAC(32)
        assert_eq!(payload.len(), 56 + 32 + 246 + 32);
        assert_eq!(&payload[..20], &[0u8; 20]); // legacy key id
        assert_eq!(payload[20], 0x02); // auth key type
        assert_eq!(&payload[21..23], &[0, 32]);
        assert_eq!(&payload[23..55], &service.auth_key);
        assert_eq!(payload[55], 0x00); // no extensions
        assert_eq!(&payload[56..88], state.public.as_bytes());
    }

    #[test]
    fn mutual_key_agreement() {
        let service = TestService::new();
        let (_payload, state) = client_for(&service);
        let (body, server_seed) = service.rendezvous2(&state.public.clone());

        // The client accepts the legitimate AUTH and derives the same key
        // schedule the server expands from its seed.
        let km = state.complete(&body).unwrap();
        let server_km = expand_keys(&server_seed);
        assert_eq!(km.df, server_km.df);
        assert_eq!(km.db, server_km.db);
        assert_eq!(km.kf, server_km.kf);
        assert_eq!(km.kb, server_km.kb);
    }

    #[test]
    fn forged_auth_rejected() {
        let service = TestService::new();
        let (_payload, state) = client_for(&service);
        let (mut body, _) = service.rendezvous2(&state.public.clone());

        // A legitimate ephemeral Y with attacker-chosen AUTH bytes.
        body[40] ^= 0xFF;
        assert!(matches!(
            state.complete(&body),
            Err(crate::error::Error::HsNtor(HsNtorError::BadAuth))
        ));
    }

    #[test]
    fn zero_server_key_rejected() {
        let service = TestService::new();
        let (_payload, state) = client_for(&service);
        let body = [0u8; 64];
        assert!(matches!(
            state.complete(&body),
            Err(crate::error::Error::HsNtor(HsNtorError::ZeroPoint))
        ));
    }

    #[test]
    fn short_rendezvous2_rejected() {
        let service = TestService::new();
        let (_payload, state) = client_for(&service);
        assert!(state.complete(&[0u8; 63]).is_err());
    }

    #[test]
    fn derived_keys_drive_a_virtual_hop() {
        // The expanded material plugs straight into AES-256/SHA3-256 hop
        // state; sanity-check the pieces fit together.
        let km = expand_keys(&[0x61; 32]);
        let mut cipher = RelayCipher::aes256(&km.kf);
        let mut digest = RunningDigest::sha3(&km.df);
        let mut buf = [0u8; 64];
        cipher.apply(&mut buf);
        digest.update(&buf);
        assert_eq!(digest.sum().len(), 32);
    }

    #[test]
    fn rend_link_specs_layout() {
        let specs = build_rend_link_specs(
            &[0xAB; 20],
            std::net::Ipv4Addr::new(198, 51, 100, 3),
            9001,
            Some(&[0xCD; 32]),
        );
        assert_eq!(specs[0], 3);
        assert_eq!(&specs[1..3], &[0x00, 0x06]);
        assert_eq!(&specs[3..7], &[198, 51, 100, 3]);
        assert_eq!(&specs[7..9], &9001u16.to_be_bytes());
        assert_eq!(&specs[9..11], &[0x02, 0x14]);
        assert_eq!(&specs[11..31], &[0xAB; 20]);
        assert_eq!(&specs[31..33], &[0x03, 0x20]);
        assert_eq!(&specs[33..65], &[0xCD; 32]);
    }

    #[test]
    fn cookies_are_random() {
        assert_ne!(generate_rend_cookie(), generate_rend_cookie());
    }
}
