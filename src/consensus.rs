//! Consensus data model
//!
//! The directory layer (consensus fetch, microdescriptor fetch, authority
//! signature checks) lives outside this crate. These types are the data it
//! feeds in: a list of relays with identities, ntor keys, bandwidth weights,
//! and flags.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{SystemTime, UNIX_EPOCH};

/// A parsed network consensus, as supplied by the directory collaborator.
#[derive(Debug, Clone, Default)]
pub struct Consensus {
    pub valid_after: Option<SystemTime>,
    pub fresh_until: Option<SystemTime>,
    pub valid_until: Option<SystemTime>,
    /// Current shared random value, if the consensus carries one.
    pub srv_current: Option<[u8; 32]>,
    /// Previous shared random value, if the consensus carries one.
    pub srv_previous: Option<[u8; 32]>,
    pub relays: Vec<Relay>,
    /// Wgg, Wgm, Wmg, Wmm, ... from the "bandwidth-weights" line.
    pub bandwidth_weights: HashMap<String, i64>,
}

impl Consensus {
    /// UTC hour (0..24) of the consensus valid-after time. Used for shared
    /// random value selection.
    pub fn valid_after_hour(&self) -> Option<u8> {
        let t = self.valid_after?;
        let secs = t.duration_since(UNIX_EPOCH).ok()?.as_secs();
        Some(((secs % 86_400) / 3_600) as u8)
    }
}

/// One router entry in the consensus.
#[derive(Debug, Clone)]
pub struct Relay {
    pub nickname: String,
    /// SHA-1 of the relay's RSA identity key.
    pub identity: [u8; 20],
    /// Ed25519 identity, when the microdescriptor provided one.
    pub ed25519_id: Option<[u8; 32]>,
    pub address: Ipv4Addr,
    pub or_port: u16,
    pub dir_port: u16,
    pub bandwidth: i64,
    pub flags: RelayFlags,
    /// Curve25519 onion key, when the microdescriptor provided one.
    pub ntor_onion_key: Option<[u8; 32]>,
}

/// Flags assigned to a relay in the consensus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayFlags {
    pub authority: bool,
    pub bad_exit: bool,
    pub exit: bool,
    pub fast: bool,
    pub guard: bool,
    pub hsdir: bool,
    pub running: bool,
    pub stable: bool,
    pub valid: bool,
}

/// The fields of a relay needed to dial it and run the ntor handshake.
#[derive(Debug, Clone)]
pub struct RelayInfo {
    /// SHA-1 of the relay's RSA identity key (the ntor node id).
    pub node_id: [u8; 20],
    /// Curve25519 onion key (B).
    pub ntor_onion_key: [u8; 32],
    pub address: Ipv4Addr,
    pub or_port: u16,
}

impl RelayInfo {
    /// Extracts dialing info from a consensus relay. Returns `None` when the
    /// relay's microdescriptor fields have not been populated.
    pub fn from_relay(relay: &Relay) -> Option<Self> {
        Some(Self {
            node_id: relay.identity,
            ntor_onion_key: relay.ntor_onion_key?,
            address: relay.address,
            or_port: relay.or_port,
        })
    }

    /// "ip:port" form used for dialing and logging.
    pub fn addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.address.into(), self.or_port)
    }
}
