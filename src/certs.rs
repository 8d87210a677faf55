//! Ed25519 Tor certificates and CERTS cell validation
//!
//! Validates the certificate chain a relay presents during the link
//! handshake: cert type 4 (identity key certifies signing key) and cert
//! type 5 (signing key certifies the SHA-256 of the peer's TLS
//! certificate). This binds the TLS connection to the relay's Ed25519
//! identity without trusting TLS PKI.

use crate::crypto::ct_eq;
use crate::error::{HandshakeError, Result};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use std::time::{SystemTime, UNIX_EPOCH};

/// IDENTITY_V_SIGNING: identity key certifies the medium-term signing key.
const CERT_TYPE_IDENTITY_SIGNING: u8 = 4;
/// SIGNING_V_TLS_CERT: signing key certifies the TLS certificate hash.
const CERT_TYPE_SIGNING_TLS: u8 = 5;

/// Key type for cert type 5: SHA-256 digest of an X.509 certificate.
const KEY_TYPE_SHA256_OF_X509: u8 = 0x03;

/// Extension type carrying the signing key.
const EXT_SIGNED_WITH_ED25519_KEY: u8 = 0x04;
/// Extension flag: unrecognized extensions with this bit set invalidate the cert.
const EXT_FLAG_AFFECTS_VALIDATION: u8 = 0x01;

/// A parsed Ed25519 Tor certificate (cert-spec v1 format).
#[derive(Debug, Clone)]
pub struct TorCert {
    pub cert_type: u8,
    pub expiration_hours: u32,
    pub key_type: u8,
    pub certified_key: [u8; 32],
    /// Signing key from the 0x04 extension, when present.
    pub signing_key: Option<[u8; 32]>,
    signature: [u8; 64],
    raw: Vec<u8>,
}

impl TorCert {
    /// Parses a certificate blob.
    ///
    /// Rejects any unrecognized extension carrying the AFFECTS_VALIDATION
    /// flag, per cert-spec.
    pub fn parse(data: &[u8]) -> Result<Self> {
        // Minimum: 39-byte header + extension count + 64-byte signature.
        if data.len() < 40 + 64 {
            return Err(bad_cert(format!("cert too short: {} bytes", data.len())));
        }
        if data[0] != 1 {
            return Err(bad_cert(format!("unsupported cert version {}", data[0])));
        }

        let mut cert = TorCert {
            cert_type: data[1],
            expiration_hours: u32::from_be_bytes([data[2], data[3], data[4], data[5]]),
            key_type: data[6],
            certified_key: [0; 32],
            signing_key: None,
            signature: [0; 64],
            raw: data.to_vec(),
        };
        cert.certified_key.copy_from_slice(&data[7..39]);

        let n_ext = data[39];
        let sig_start = data.len() - 64;
        let mut pos = 40;
        for i in 0..n_ext {
            if pos + 4 > sig_start {
                return Err(bad_cert(format!("extension {i} overflows cert")));
            }
            let ext_len = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;
            let ext_type = data[pos + 2];
            let ext_flags = data[pos + 3];
            pos += 4;
            if pos + ext_len > sig_start {
                return Err(bad_cert(format!("extension {i} data overflows cert")));
            }
            let ext_data = &data[pos..pos + ext_len];
            if ext_type == EXT_SIGNED_WITH_ED25519_KEY && ext_len == 32 {
                let mut key = [0u8; 32];
                key.copy_from_slice(ext_data);
                cert.signing_key = Some(key);
            } else if ext_flags & EXT_FLAG_AFFECTS_VALIDATION != 0 {
                return Err(bad_cert(format!(
                    "unrecognized critical extension type 0x{ext_type:02x}"
                )));
            }
            pos += ext_len;
        }

        cert.signature.copy_from_slice(&data[sig_start..]);
        Ok(cert)
    }

    /// Checks expiration and the Ed25519 signature. When `signing_key` is
    /// `None` the embedded 0x04 extension key is used.
    pub fn verify(&self, signing_key: Option<&[u8; 32]>, now: SystemTime) -> Result<()> {
        let expires = UNIX_EPOCH + std::time::Duration::from_secs(self.expiration_hours as u64 * 3600);
        if now > expires {
            return Err(HandshakeError::Expired.into());
        }

        let key_bytes = match signing_key {
            Some(k) => k,
            None => self
                .signing_key
                .as_ref()
                .ok_or_else(|| bad_cert("no signing key extension and none provided".into()))?,
        };
        let key = VerifyingKey::from_bytes(key_bytes)
            .map_err(|e| bad_cert(format!("invalid signing key: {e}")))?;

        let signed = &self.raw[..self.raw.len() - 64];
        let sig = Signature::from_bytes(&self.signature);
        key.verify(signed, &sig)
            .map_err(|_| bad_cert("signature verification failed".into()).into())
    }
}

/// Validates a CERTS cell payload against the peer's TLS certificate hash.
/// Returns the relay's Ed25519 identity key.
pub fn validate_certs(payload: &[u8], peer_cert_sha256: &[u8; 32]) -> Result<[u8; 32]> {
    validate_certs_at(payload, peer_cert_sha256, SystemTime::now())
}

fn validate_certs_at(
    payload: &[u8],
    peer_cert_sha256: &[u8; 32],
    now: SystemTime,
) -> Result<[u8; 32]> {
    if payload.is_empty() {
        return Err(bad_cert("empty CERTS payload".into()));
    }
    let n_certs = payload[0];
    log::debug!("CERTS cell with {n_certs} certificates");

    let mut cert4: Option<TorCert> = None;
    let mut cert5: Option<TorCert> = None;

    let mut pos = 1;
    for i in 0..n_certs {
        if pos + 3 > payload.len() {
            return Err(bad_cert(format!("CERTS cell truncated at cert {i}")));
        }
        let cert_type = payload[pos];
        let cert_len = u16::from_be_bytes([payload[pos + 1], payload[pos + 2]]) as usize;
        pos += 3;
        if pos + cert_len > payload.len() {
            return Err(bad_cert(format!(
                "cert {i} data overflows (type={cert_type}, len={cert_len})"
            )));
        }
        let cert_data = &payload[pos..pos + cert_len];
        pos += cert_len;

        match cert_type {
            CERT_TYPE_IDENTITY_SIGNING => cert4 = Some(TorCert::parse(cert_data)?),
            CERT_TYPE_SIGNING_TLS => cert5 = Some(TorCert::parse(cert_data)?),
            // RSA-era certificate types are not part of the Ed25519 chain.
            other => log::trace!("skipping cert type {other}"),
        }
    }

    let cert4 = cert4.ok_or_else(|| bad_cert("missing cert type 4 (IDENTITY_V_SIGNING)".into()))?;
    let cert5 = cert5.ok_or_else(|| bad_cert("missing cert type 5 (SIGNING_V_TLS_CERT)".into()))?;

    // Cert 4: the extension key is the identity, the certified key is the
    // signing key, and the identity signed the cert.
    cert4.verify(None, now)?;
    let identity_key = cert4
        .signing_key
        .ok_or_else(|| bad_cert("cert type 4 has no identity key extension".into()))?;
    let signing_key = cert4.certified_key;

    // Cert 5: signed by the signing key, certifies the TLS cert digest.
    cert5.verify(Some(&signing_key), now)?;
    if cert5.key_type != KEY_TYPE_SHA256_OF_X509 {
        return Err(bad_cert(format!(
            "cert type 5 key type 0x{:02x}, expected 0x03",
            cert5.key_type
        )));
    }
    if !ct_eq(&cert5.certified_key, peer_cert_sha256) {
        return Err(bad_cert(
            "cert type 5 certified key does not match TLS certificate hash".into(),
        ));
    }

    log::debug!(
        "certificate chain valid, identity {}",
        hex::encode(&identity_key[..8])
    );
    Ok(identity_key)
}

fn bad_cert(msg: String) -> crate::error::Error {
    HandshakeError::BadCert(msg).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use std::time::Duration;

    const FAR_FUTURE_HOURS: u32 = 1_000_000; // ~2084

    fn build_cert(
        cert_type: u8,
        key_type: u8,
        certified_key: &[u8; 32],
        expiration_hours: u32,
        extensions: &[(u8, u8, Vec<u8>)], // (type, flags, data)
        signer: &SigningKey,
    ) -> Vec<u8> {
        let mut cert = vec![1u8, cert_type];
        cert.extend_from_slice(&expiration_hours.to_be_bytes());
        cert.push(key_type);
        cert.extend_from_slice(certified_key);
        cert.push(extensions.len() as u8);
        for (ext_type, ext_flags, data) in extensions {
            cert.extend_from_slice(&(data.len() as u16).to_be_bytes());
            cert.push(*ext_type);
            cert.push(*ext_flags);
            cert.extend_from_slice(data);
        }
        let sig = signer.sign(&cert);
        cert.extend_from_slice(&sig.to_bytes());
        cert
    }

    fn test_chain(peer_hash: [u8; 32]) -> (Vec<u8>, [u8; 32]) {
        let identity = SigningKey::from_bytes(&[11; 32]);
        let signing = SigningKey::from_bytes(&[22; 32]);

        let cert4 = build_cert(
            4,
            0x01,
            signing.verifying_key().as_bytes(),
            FAR_FUTURE_HOURS,
            &[(0x04, 0x00, identity.verifying_key().as_bytes().to_vec())],
            &identity,
        );
        let cert5 = build_cert(5, 0x03, &peer_hash, FAR_FUTURE_HOURS, &[], &signing);

        let mut payload = vec![2u8];
        for (cert_type, cert) in [(4u8, cert4), (5u8, cert5)] {
            payload.push(cert_type);
            payload.extend_from_slice(&(cert.len() as u16).to_be_bytes());
            payload.extend_from_slice(&cert);
        }
        (payload, *identity.verifying_key().as_bytes())
    }

    #[test]
    fn valid_chain_yields_identity() {
        let peer_hash = [0x5A; 32];
        let (payload, identity) = test_chain(peer_hash);
        let got = validate_certs(&payload, &peer_hash).unwrap();
        assert_eq!(got, identity);
    }

    #[test]
    fn tls_hash_mismatch_rejected() {
        let (payload, _) = test_chain([0x5A; 32]);
        assert!(validate_certs(&payload, &[0x5B; 32]).is_err());
    }

    #[test]
    fn unknown_critical_extension_rejected() {
        let signer = SigningKey::from_bytes(&[33; 32]);
        let cert = build_cert(
            4,
            0x01,
            &[9; 32],
            FAR_FUTURE_HOURS,
            &[(0x77, EXT_FLAG_AFFECTS_VALIDATION, vec![1, 2, 3])],
            &signer,
        );
        let err = TorCert::parse(&cert).unwrap_err();
        assert!(err.to_string().contains("critical extension"));
    }

    #[test]
    fn unknown_noncritical_extension_ignored() {
        let signer = SigningKey::from_bytes(&[33; 32]);
        let cert = build_cert(
            4,
            0x01,
            &[9; 32],
            FAR_FUTURE_HOURS,
            &[(0x77, 0x00, vec![1, 2, 3])],
            &signer,
        );
        assert!(TorCert::parse(&cert).is_ok());
    }

    #[test]
    fn wrong_version_rejected() {
        let signer = SigningKey::from_bytes(&[33; 32]);
        let mut cert = build_cert(4, 0x01, &[9; 32], FAR_FUTURE_HOURS, &[], &signer);
        cert[0] = 2;
        assert!(TorCert::parse(&cert).is_err());
    }

    #[test]
    fn expired_cert_rejected() {
        let identity = SigningKey::from_bytes(&[11; 32]);
        let cert = build_cert(
            4,
            0x01,
            &[9; 32],
            1, // expired one hour after the epoch
            &[(0x04, 0x00, identity.verifying_key().as_bytes().to_vec())],
            &identity,
        );
        let parsed = TorCert::parse(&cert).unwrap();
        let err = parsed
            .verify(None, UNIX_EPOCH + Duration::from_secs(7200))
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Handshake(HandshakeError::Expired)
        ));
    }

    #[test]
    fn tampered_signature_rejected() {
        let identity = SigningKey::from_bytes(&[11; 32]);
        let mut cert = build_cert(
            4,
            0x01,
            &[9; 32],
            FAR_FUTURE_HOURS,
            &[(0x04, 0x00, identity.verifying_key().as_bytes().to_vec())],
            &identity,
        );
        let last = cert.len() - 1;
        cert[last] ^= 0x01;
        let parsed = TorCert::parse(&cert).unwrap();
        assert!(parsed.verify(None, SystemTime::now()).is_err());
    }
}
