//! Link layer: TLS connection and handshake
//!
//! Dials a relay's ORPort, wraps it in TLS, and runs the version >= 4 link
//! handshake: VERSIONS exchange, CERTS/AUTH_CHALLENGE/NETINFO from the
//! relay, client NETINFO back. TLS PKI validation is disabled; the peer's
//! identity is bound afterwards through the Ed25519 chain in the CERTS
//! cell. The client never sends AUTHENTICATE.
//!
//! A live link is mutated by at most one reader and one writer at a time;
//! the two halves are guarded independently.

use crate::cell::{Cell, CellCommand, CellReader, CellWriter};
use crate::certs::validate_certs;
use crate::error::{Error, HandshakeError, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// Deadline for the whole link handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Link protocol versions this client offers.
const OFFERED_VERSIONS: [u16; 2] = [4, 5];

/// Cap on padding cells tolerated while waiting for a handshake cell.
const MAX_PADDING_CELLS: usize = 100;

type LinkRead = ReadHalf<TlsStream<TcpStream>>;
type LinkWrite = WriteHalf<TlsStream<TcpStream>>;

/// An established link to one relay, carrying cells for zero or more
/// circuits.
pub struct Link {
    reader: Mutex<CellReader<LinkRead>>,
    writer: Mutex<CellWriter<LinkWrite>>,
    version: u16,
    peer_identity: [u8; 32],
    addr: SocketAddr,
    circ_ids: std::sync::Mutex<HashSet<u32>>,
}

impl Link {
    /// Connects to a relay and performs the full link handshake.
    pub async fn handshake(addr: SocketAddr) -> Result<Arc<Link>> {
        tokio::time::timeout(HANDSHAKE_TIMEOUT, Self::handshake_inner(addr))
            .await
            .map_err(|_| Error::Timeout)?
    }

    async fn handshake_inner(addr: SocketAddr) -> Result<Arc<Link>> {
        let relay_ip = match addr.ip() {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(_) => {
                return Err(Error::ProtocolViolation(
                    "IPv6 link addresses are not supported".into(),
                ))
            }
        };

        log::info!("connecting to {addr}");
        let tcp = TcpStream::connect(addr).await?;

        // Tor relays use self-signed certs; identity is verified via the
        // CERTS cell Ed25519 chain, not TLS PKI. Default rustls cipher
        // suites keep the TLS fingerprint unremarkable.
        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoPkiVerifier))
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));
        let tls = connector
            .connect(ServerName::from(addr.ip()), tcp)
            .await?;

        let peer_cert_sha256: [u8; 32] = {
            let (_, conn) = tls.get_ref();
            let certs = conn
                .peer_certificates()
                .ok_or(Error::LinkClosed)?;
            let first = certs.first().ok_or(Error::LinkClosed)?;
            Sha256::digest(first.as_ref()).into()
        };
        log::debug!("tls established, peer cert sha256 {}", hex::encode(&peer_cert_sha256[..8]));

        let (read_half, write_half) = tokio::io::split(tls);
        let mut reader = CellReader::new(read_half);
        let mut writer = CellWriter::new(write_half);

        // VERSIONS exchange.
        writer.write_versions(&OFFERED_VERSIONS).await?;
        let server_versions = reader.read_versions().await?;
        log::debug!("server offered versions {server_versions:?}");
        let version = negotiate_version(&server_versions)
            .ok_or(HandshakeError::NoCommonVersion(server_versions))?;
        log::info!("link version {version} negotiated");

        // CERTS, AUTH_CHALLENGE, NETINFO, in that order.
        let certs_cell = read_expected(&mut reader, CellCommand::Certs).await?;
        let peer_identity = validate_certs(certs_cell.payload(), &peer_cert_sha256)?;

        // AUTH_CHALLENGE is read and discarded: clients do not authenticate
        // at the link layer.
        read_expected(&mut reader, CellCommand::AuthChallenge).await?;

        let netinfo = read_expected(&mut reader, CellCommand::Netinfo).await?;
        if netinfo.payload().len() < 11 {
            return Err(HandshakeError::NetInfoMissing.into());
        }

        writer.write_cell(&build_netinfo(relay_ip)).await?;
        log::info!("link handshake complete, identity {}", hex::encode(&peer_identity[..8]));

        Ok(Arc::new(Link {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            version,
            peer_identity,
            addr,
            circ_ids: std::sync::Mutex::new(HashSet::new()),
        }))
    }

    /// Negotiated link protocol version (always >= 4).
    pub fn version(&self) -> u16 {
        self.version
    }

    /// The relay's verified Ed25519 identity key.
    pub fn peer_identity(&self) -> &[u8; 32] {
        &self.peer_identity
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Registers a circuit id on this link. Returns false on collision.
    pub fn claim_circ_id(&self, id: u32) -> bool {
        self.circ_ids.lock().expect("circ id lock").insert(id)
    }

    /// Removes a circuit id from this link's tracking.
    pub fn release_circ_id(&self, id: u32) {
        self.circ_ids.lock().expect("circ id lock").remove(&id);
    }

    pub async fn send_cell(&self, cell: &Cell) -> Result<()> {
        self.writer.lock().await.write_cell(cell).await
    }

    pub async fn recv_cell(&self) -> Result<Cell> {
        self.reader.lock().await.read_cell().await
    }

    /// Closes the write side. The relay tears the connection down, which
    /// fails any pending read and propagates to every circuit on the link.
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            log::debug!("link shutdown: {e}");
        }
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("addr", &self.addr)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Picks the highest version offered by both sides, if it is >= 4.
fn negotiate_version(server_versions: &[u16]) -> Option<u16> {
    server_versions
        .iter()
        .copied()
        .filter(|v| OFFERED_VERSIONS.contains(v))
        .max()
}

/// Reads cells until the expected command arrives, skipping padding.
async fn read_expected<R: AsyncRead + Unpin>(
    reader: &mut CellReader<R>,
    expected: CellCommand,
) -> Result<Cell> {
    for _ in 0..MAX_PADDING_CELLS {
        let cell = reader.read_cell().await?;
        match cell.command {
            CellCommand::Padding | CellCommand::Vpadding => continue,
            cmd if cmd == expected => return Ok(cell),
            cmd => {
                return Err(HandshakeError::UnexpectedCell {
                    expected: expected as u8,
                    got: cmd as u8,
                }
                .into())
            }
        }
    }
    Err(Error::ProtocolViolation(format!(
        "too many padding cells before {expected:?}"
    )))
}

/// Client NETINFO: zero timestamp (anti-fingerprinting), the relay's own
/// IPv4 as OTHERADDR, no addresses of our own.
fn build_netinfo(relay_ip: std::net::Ipv4Addr) -> Cell {
    let mut cell = Cell::fixed(0, CellCommand::Netinfo);
    let p = cell.payload_mut();
    // p[0..4]: timestamp, left zero
    p[4] = 0x04; // ATYPE: IPv4
    p[5] = 0x04; // ALEN
    p[6..10].copy_from_slice(&relay_ip.octets());
    p[10] = 0x00; // NMYADDR
    cell
}

/// Accepts any TLS certificate; identity is bound via the CERTS cell.
#[derive(Debug)]
struct NoPkiVerifier;

impl ServerCertVerifier for NoPkiVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
