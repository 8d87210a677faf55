//! Error types for the Tor protocol engine
//!
//! One crate-level [`Error`] enum with typed sub-kinds for the failure modes
//! that callers dispatch on (handshake, ntor, cell framing, onion services).
//! Cryptographic verification failures are fatal for the operation that hit
//! them and are never retried on the same credentials.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Tor protocol operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("link handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("ntor handshake failed: {0}")]
    Ntor(#[from] NtorError),

    #[error("malformed cell: {0}")]
    MalformedCell(#[from] CellError),

    /// The circuit was torn down, either by a DESTROY from the relay or by
    /// local teardown. Carries the DESTROY reason byte.
    #[error("circuit destroyed (reason {0})")]
    CircuitDestroyed(u8),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The relay answered RELAY_BEGIN with RELAY_END. Carries the END reason.
    #[error("stream rejected: RELAY_END reason {0}")]
    StreamRejected(u8),

    #[error("RELAY_EARLY budget exhausted")]
    RelayEarlyExhausted,

    #[error("resource exhausted: {0}")]
    ResourceExhausted(Resource),

    /// Send window exhausted. Only surfaced by the non-blocking write path;
    /// the default write path suspends until a SENDME lifts the window.
    #[error("send window exhausted, waiting on SENDME")]
    FlowControl,

    #[error("invalid onion address: {0}")]
    OnionAddr(#[from] OnionAddrError),

    #[error("hidden service descriptor: {0}")]
    HsDescriptor(#[from] HsDescriptorError),

    #[error("hs-ntor handshake failed: {0}")]
    HsNtor(#[from] HsNtorError),

    #[error("introduction failed: {0}")]
    HsIntro(#[from] HsIntroError),

    /// No usable shared random value in the consensus for HSDir selection.
    #[error("no shared random value available")]
    NoSharedRandom,

    #[error("link closed")]
    LinkClosed,

    #[error("operation timed out")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
}

/// Link handshake failures during VERSIONS/CERTS/AUTH_CHALLENGE/NETINFO bring-up.
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("no common link protocol version >= 4 (server offered {0:?})")]
    NoCommonVersion(Vec<u16>),

    #[error("bad certificate: {0}")]
    BadCert(String),

    #[error("certificate expired")]
    Expired,

    #[error("NETINFO missing or truncated")]
    NetInfoMissing,

    #[error("expected cell command {expected}, got {got}")]
    UnexpectedCell { expected: u8, got: u8 },
}

/// ntor (CREATE2/CREATED2) handshake failures.
#[derive(Error, Debug)]
pub enum NtorError {
    #[error("AUTH verification failed")]
    BadAuth,

    #[error("shared secret is the all-zeros point")]
    ZeroPoint,

    #[error("handshake response has bad length {0}")]
    BadResponseLen(usize),
}

/// Cell codec failures.
#[derive(Error, Debug)]
pub enum CellError {
    #[error("cell truncated")]
    Short,

    #[error("variable-length payload of {0} bytes exceeds cap")]
    Oversized(usize),

    #[error("relay cell not recognized by any hop")]
    Unrecognized,

    #[error("unknown cell command {0}")]
    UnknownCommand(u8),
}

/// Which id space ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    CircIds,
    StreamIds,
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resource::CircIds => write!(f, "circuit ids"),
            Resource::StreamIds => write!(f, "stream ids"),
        }
    }
}

/// v3 onion address decoding failures.
#[derive(Error, Debug)]
pub enum OnionAddrError {
    #[error("decoded length {0}, expected 35")]
    Length(usize),

    #[error("unsupported address version {0}")]
    Version(u8),

    #[error("checksum mismatch")]
    Checksum,

    #[error("public key is not a valid Ed25519 point")]
    InvalidPoint,

    #[error("not base32: {0}")]
    Encoding(String),
}

/// Hidden service descriptor fetch/parse/decrypt failures.
#[derive(Error, Debug)]
pub enum HsDescriptorError {
    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("parse failed: {0}")]
    Parse(String),

    #[error("layer MAC verification failed")]
    MacMismatch,
}

/// hs-ntor handshake failures.
#[derive(Error, Debug)]
pub enum HsNtorError {
    #[error("AUTH verification failed")]
    BadAuth,

    #[error("shared secret is the all-zeros point")]
    ZeroPoint,
}

/// Introduction protocol failures.
#[derive(Error, Debug)]
pub enum HsIntroError {
    #[error("INTRODUCE_ACK status {0}")]
    Status(u16),

    #[error("all introduction points failed")]
    AllPointsFailed,
}

impl Error {
    /// True for errors that fail the enclosing circuit; the caller may retry
    /// with a fresh path. Verification failures are not retryable.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Tls(_) | Error::Timeout | Error::LinkClosed
        )
    }
}
