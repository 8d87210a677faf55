//! Circuit layer
//!
//! A circuit is an ordered chain of hops over one link. Every outbound
//! RELAY cell is onion-encrypted from the last hop back to the first;
//! every inbound cell is peeled front to back until a hop recognizes it
//! and its embedded digest matches that hop's running backward digest.
//!
//! Locking: the forward tuple (forward ciphers, forward digests,
//! RELAY_EARLY counter, link writer) is mutated atomically under the
//! forward mutex; the backward tuple (backward ciphers, backward digests,
//! link reader) under the backward mutex. The ciphers are stateful and
//! per-cell, so encrypt+write and read+decrypt must not interleave.

use crate::cell::{Cell, CellCommand, PAYLOAD_LEN};
use crate::consensus::RelayInfo;
use crate::crypto::{ct_eq, RelayCipher, RunningDigest};
use crate::error::{CellError, Error, Resource, Result};
use crate::flow::{SendWindow, CIRC_WINDOW_INITIAL};
use crate::link::Link;
use crate::ntor::{KeyMaterial, NtorHandshake};
use crate::stream::StreamTable;
use rand::rngs::OsRng;
use rand::RngCore;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

// Relay cell commands (tor-spec §6.1 and rend-spec-v3).
pub const RELAY_BEGIN: u8 = 1;
pub const RELAY_DATA: u8 = 2;
pub const RELAY_END: u8 = 3;
pub const RELAY_CONNECTED: u8 = 4;
pub const RELAY_SENDME: u8 = 5;
pub const RELAY_BEGIN_DIR: u8 = 13;
pub const RELAY_EXTEND2: u8 = 14;
pub const RELAY_EXTENDED2: u8 = 15;
pub const RELAY_ESTABLISH_RENDEZVOUS: u8 = 33;
pub const RELAY_INTRODUCE1: u8 = 34;
pub const RELAY_RENDEZVOUS2: u8 = 37;
pub const RELAY_RENDEZVOUS_ESTABLISHED: u8 = 39;
pub const RELAY_INTRODUCE_ACK: u8 = 40;

/// Maximum RELAY_EARLY cells per circuit.
pub const MAX_RELAY_EARLY: u8 = 8;

/// Maximum data bytes in one relay cell: 509 minus the 11-byte header.
pub const MAX_RELAY_DATA_LEN: usize = PAYLOAD_LEN - DATA_OFF;

/// Deadline for one CREATE2 or EXTEND2 round-trip.
const CIRCUIT_OP_TIMEOUT: Duration = Duration::from_secs(30);

// Relay header offsets within the 509-byte payload.
const CMD_OFF: usize = 0;
const RECOGNIZED_OFF: usize = 1;
const STREAM_ID_OFF: usize = 3;
const DIGEST_OFF: usize = 5;
const LENGTH_OFF: usize = 9;
const DATA_OFF: usize = 11;

/// One decrypted inbound relay cell.
#[derive(Debug)]
pub struct RelayMsg {
    /// Index of the hop that recognized the cell.
    pub hop: usize,
    pub cmd: u8,
    pub stream_id: u16,
    pub data: Vec<u8>,
}

/// Client-to-relay half of a hop's state.
pub(crate) struct ForwardHop {
    pub(crate) cipher: RelayCipher,
    pub(crate) digest: RunningDigest,
}

/// Relay-to-client half of a hop's state.
pub(crate) struct BackwardHop {
    pub(crate) cipher: RelayCipher,
    pub(crate) digest: RunningDigest,
}

impl ForwardHop {
    fn from_ntor(km: &KeyMaterial) -> Self {
        Self {
            cipher: RelayCipher::aes128(&km.kf),
            digest: RunningDigest::sha1(&km.df),
        }
    }
}

impl BackwardHop {
    fn from_ntor(km: &KeyMaterial) -> Self {
        Self {
            cipher: RelayCipher::aes128(&km.kb),
            digest: RunningDigest::sha1(&km.db),
        }
    }
}

struct ForwardState {
    hops: Vec<ForwardHop>,
    relay_early_sent: u8,
}

impl ForwardState {
    /// Spends one unit of the RELAY_EARLY budget.
    fn note_relay_early(&mut self) -> Result<()> {
        if self.relay_early_sent >= MAX_RELAY_EARLY {
            return Err(Error::RelayEarlyExhausted);
        }
        self.relay_early_sent += 1;
        Ok(())
    }
}

struct BackwardState {
    hops: Vec<BackwardHop>,
}

/// An established circuit over a link.
pub struct Circuit {
    id: u32,
    link: Arc<Link>,
    forward: Mutex<ForwardState>,
    backward: Mutex<BackwardState>,
    destroyed: std::sync::Mutex<Option<u8>>,
    /// Circuit-level send window, shared by all streams on the circuit.
    pub(crate) circ_window: SendWindow,
    pub(crate) streams: std::sync::Mutex<StreamTable>,
    pub(crate) reader_started: AtomicBool,
}

impl Circuit {
    /// Builds a single-hop circuit with a CREATE2/CREATED2 handshake.
    pub async fn create(link: Arc<Link>, first_hop: &RelayInfo) -> Result<Arc<Circuit>> {
        let id = allocate_circ_id(&link)?;
        log::info!("circuit 0x{id:08x}: CREATE2 to {}", first_hop.addr());

        let hs = NtorHandshake::new(first_hop.node_id, first_hop.ntor_onion_key);

        let mut create2 = Cell::fixed(id, CellCommand::Create2);
        {
            let p = create2.payload_mut();
            p[0..2].copy_from_slice(&0x0002u16.to_be_bytes()); // HTYPE: ntor
            p[2..4].copy_from_slice(&(crate::ntor::CLIENT_DATA_LEN as u16).to_be_bytes());
            p[4..88].copy_from_slice(&hs.client_data());
        }

        let result = tokio::time::timeout(CIRCUIT_OP_TIMEOUT, async {
            link.send_cell(&create2).await?;
            link.recv_cell().await
        })
        .await
        .map_err(|_| Error::Timeout)
        .and_then(|r| r);

        let response = match result {
            Ok(cell) => cell,
            Err(e) => {
                link.release_circ_id(id);
                return Err(e);
            }
        };

        let km = match parse_created2(&response) {
            Ok(server_data) => match hs.complete(server_data) {
                Ok(km) => km,
                Err(e) => {
                    // Best effort: let the relay reclaim the id.
                    send_destroy(&link, id).await;
                    link.release_circ_id(id);
                    return Err(e);
                }
            },
            Err(e) => {
                link.release_circ_id(id);
                return Err(e);
            }
        };

        log::info!("circuit 0x{id:08x}: ntor handshake complete");

        Ok(Arc::new(Circuit {
            id,
            link,
            forward: Mutex::new(ForwardState {
                hops: vec![ForwardHop::from_ntor(&km)],
                relay_early_sent: 0,
            }),
            backward: Mutex::new(BackwardState {
                hops: vec![BackwardHop::from_ntor(&km)],
            }),
            destroyed: std::sync::Mutex::new(None),
            circ_window: SendWindow::new(CIRC_WINDOW_INITIAL),
            streams: std::sync::Mutex::new(StreamTable::default()),
            reader_started: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn link(&self) -> &Arc<Link> {
        &self.link
    }

    pub async fn num_hops(&self) -> usize {
        self.forward.lock().await.hops.len()
    }

    /// Extends the circuit by one relay with EXTEND2/EXTENDED2. The EXTEND2
    /// travels as RELAY_EARLY and spends the circuit's budget.
    pub async fn extend(&self, relay: &RelayInfo) -> Result<()> {
        self.check_destroyed()?;
        log::info!("circuit 0x{:08x}: EXTEND2 to {}", self.id, relay.addr());

        let hs = NtorHandshake::new(relay.node_id, relay.ntor_onion_key);
        let payload = build_extend2_payload(relay, &hs.client_data());

        let result = tokio::time::timeout(CIRCUIT_OP_TIMEOUT, async {
            self.send_relay_cell(RELAY_EXTEND2, 0, &payload, true).await?;
            self.recv_relay().await
        })
        .await
        .map_err(|_| Error::Timeout)
        .and_then(|r| r);

        let msg = match result {
            Ok(msg) => msg,
            Err(e) => {
                self.teardown().await;
                return Err(e);
            }
        };

        let km = match parse_extended2(&msg).and_then(|data| hs.complete(data)) {
            Ok(km) => km,
            Err(e) => {
                self.teardown().await;
                return Err(e);
            }
        };

        // Forward lock first, then backward, so neither path observes a
        // half-appended hop.
        let mut fwd = self.forward.lock().await;
        let mut bwd = self.backward.lock().await;
        fwd.hops.push(ForwardHop::from_ntor(&km));
        bwd.hops.push(BackwardHop::from_ntor(&km));
        log::info!("circuit 0x{:08x}: extended to {} hops", self.id, fwd.hops.len());
        Ok(())
    }

    /// Appends the virtual onion-service hop (AES-256-CTR, SHA3-256) after
    /// a completed rendezvous.
    pub(crate) async fn add_virtual_hop(
        &self,
        kf: &[u8; 32],
        kb: &[u8; 32],
        df: &[u8; 32],
        db: &[u8; 32],
    ) {
        let mut fwd = self.forward.lock().await;
        let mut bwd = self.backward.lock().await;
        fwd.hops.push(ForwardHop {
            cipher: RelayCipher::aes256(kf),
            digest: RunningDigest::sha3(df),
        });
        bwd.hops.push(BackwardHop {
            cipher: RelayCipher::aes256(kb),
            digest: RunningDigest::sha3(db),
        });
        log::info!(
            "circuit 0x{:08x}: virtual hop attached ({} hops)",
            self.id,
            fwd.hops.len()
        );
    }

    /// Onion-encrypts and sends a RELAY cell. Encrypt and link write happen
    /// under one lock acquisition: the keystream advances per cell, and an
    /// interleaved writer would desynchronize the relay.
    pub async fn send_relay(&self, cmd: u8, stream_id: u16, data: &[u8]) -> Result<()> {
        self.send_relay_cell(cmd, stream_id, data, false).await
    }

    /// As [`send_relay`], but wrapped in RELAY_EARLY (circuit-building
    /// relay commands).
    pub async fn send_relay_early(&self, cmd: u8, stream_id: u16, data: &[u8]) -> Result<()> {
        self.send_relay_cell(cmd, stream_id, data, true).await
    }

    async fn send_relay_cell(
        &self,
        cmd: u8,
        stream_id: u16,
        data: &[u8],
        early: bool,
    ) -> Result<()> {
        self.check_destroyed()?;
        let mut fwd = self.forward.lock().await;
        if fwd.hops.is_empty() {
            return Err(Error::ProtocolViolation("circuit has no hops".into()));
        }
        if early {
            fwd.note_relay_early()?;
        }

        let mut payload = build_relay_payload(cmd, stream_id, data)?;
        seal_relay_payload(&mut fwd.hops, &mut payload);

        let command = if early {
            CellCommand::RelayEarly
        } else {
            CellCommand::Relay
        };
        let mut cell = Cell::fixed(self.id, command);
        cell.payload_mut().copy_from_slice(&payload);
        self.link.send_cell(&cell).await
    }

    /// Reads and decrypts the next relay cell on this circuit. Skips
    /// PADDING; DESTROY tears the circuit down and surfaces as
    /// [`Error::CircuitDestroyed`], as does any later call.
    pub async fn recv_relay(&self) -> Result<RelayMsg> {
        self.check_destroyed()?;
        let mut bwd = self.backward.lock().await;
        loop {
            let cell = self.link.recv_cell().await?;
            match cell.command {
                CellCommand::Padding => continue,
                CellCommand::Destroy => {
                    let reason = cell.payload().first().copied().unwrap_or(0);
                    log::warn!("circuit 0x{:08x}: DESTROY from relay (reason {reason})", self.id);
                    self.mark_destroyed(reason);
                    self.link.release_circ_id(self.id);
                    return Err(Error::CircuitDestroyed(reason));
                }
                CellCommand::Relay | CellCommand::RelayEarly => {
                    let mut payload = [0u8; PAYLOAD_LEN];
                    payload.copy_from_slice(&cell.payload()[..PAYLOAD_LEN]);
                    return open_relay_payload(&mut bwd.hops, &mut payload);
                }
                other => {
                    return Err(Error::ProtocolViolation(format!(
                        "unexpected cell command {other:?} on circuit"
                    )))
                }
            }
        }
    }

    /// Current backward running digest of the last hop, for SENDME v1.
    pub async fn backward_digest(&self) -> Vec<u8> {
        let bwd = self.backward.lock().await;
        match bwd.hops.last() {
            Some(hop) => hop.digest.sum(),
            None => Vec::new(),
        }
    }

    /// Sends DESTROY and marks the circuit dead locally. Further sends and
    /// receives fail with [`Error::CircuitDestroyed`].
    pub async fn destroy(&self) -> Result<()> {
        self.mark_destroyed(0);
        let result = send_destroy_cell(&self.link, self.id).await;
        self.link.release_circ_id(self.id);
        result
    }

    /// Best-effort teardown for a half-built circuit.
    async fn teardown(&self) {
        if let Err(e) = self.destroy().await {
            log::debug!("circuit 0x{:08x}: teardown: {e}", self.id);
        }
    }

    fn check_destroyed(&self) -> Result<()> {
        match *self.destroyed.lock().expect("destroyed lock") {
            Some(reason) => Err(Error::CircuitDestroyed(reason)),
            None => Ok(()),
        }
    }

    fn mark_destroyed(&self, reason: u8) {
        let mut d = self.destroyed.lock().expect("destroyed lock");
        d.get_or_insert(reason);
    }
}

impl std::fmt::Debug for Circuit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Circuit")
            .field("id", &format_args!("0x{:08x}", self.id))
            .finish_non_exhaustive()
    }
}

/// Picks a fresh 32-bit circuit id with the high bit set (client side) and
/// claims it on the link.
fn allocate_circ_id(link: &Link) -> Result<u32> {
    for _ in 0..16 {
        let mut buf = [0u8; 4];
        OsRng.fill_bytes(&mut buf);
        let id = u32::from_be_bytes(buf) | 0x8000_0000;
        if link.claim_circ_id(id) {
            return Ok(id);
        }
    }
    Err(Error::ResourceExhausted(Resource::CircIds))
}

fn parse_created2(cell: &Cell) -> Result<&[u8]> {
    match cell.command {
        CellCommand::Created2 => {}
        CellCommand::Destroy => {
            let reason = cell.payload().first().copied().unwrap_or(0);
            return Err(Error::CircuitDestroyed(reason));
        }
        other => {
            return Err(Error::ProtocolViolation(format!(
                "expected CREATED2, got {other:?}"
            )))
        }
    }
    let p = cell.payload();
    let hlen = u16::from_be_bytes([p[0], p[1]]) as usize;
    if hlen != crate::ntor::SERVER_DATA_LEN {
        return Err(Error::ProtocolViolation(format!(
            "CREATED2 HLEN {hlen}, expected 64"
        )));
    }
    Ok(&p[2..2 + hlen])
}

fn parse_extended2(msg: &RelayMsg) -> Result<&[u8]> {
    if msg.cmd != RELAY_EXTENDED2 {
        return Err(Error::ProtocolViolation(format!(
            "expected EXTENDED2, got relay command {}",
            msg.cmd
        )));
    }
    if msg.data.len() < 2 {
        return Err(CellError::Short.into());
    }
    let hlen = u16::from_be_bytes([msg.data[0], msg.data[1]]) as usize;
    if hlen != crate::ntor::SERVER_DATA_LEN || msg.data.len() < 2 + hlen {
        return Err(Error::ProtocolViolation(format!(
            "EXTENDED2 HLEN {hlen} with {} bytes",
            msg.data.len()
        )));
    }
    Ok(&msg.data[2..2 + hlen])
}

async fn send_destroy(link: &Link, id: u32) {
    if let Err(e) = send_destroy_cell(link, id).await {
        log::debug!("circuit 0x{id:08x}: DESTROY send failed: {e}");
    }
}

async fn send_destroy_cell(link: &Link, id: u32) -> Result<()> {
    // reason 0 = NONE; clients are expected not to leak a more specific one.
    let cell = Cell::fixed(id, CellCommand::Destroy);
    link.send_cell(&cell).await
}

/// EXTEND2 payload: NSPEC | link specifiers | HTYPE | HLEN | HDATA, with
/// IPv4 (type 0x00) and RSA identity (type 0x02) specifiers in that order.
fn build_extend2_payload(relay: &RelayInfo, client_data: &[u8; 84]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(1 + 8 + 22 + 2 + 2 + 84);
    payload.push(2); // NSPEC

    payload.push(0x00); // TLS-over-TCP, IPv4
    payload.push(6);
    payload.extend_from_slice(&relay.address.octets());
    payload.extend_from_slice(&relay.or_port.to_be_bytes());

    payload.push(0x02); // legacy RSA identity
    payload.push(20);
    payload.extend_from_slice(&relay.node_id);

    payload.extend_from_slice(&0x0002u16.to_be_bytes()); // HTYPE: ntor
    payload.extend_from_slice(&84u16.to_be_bytes()); // HLEN
    payload.extend_from_slice(client_data);
    payload
}

/// Lays out a 509-byte relay payload with a zeroed digest field: command,
/// recognized, stream id, length, data, four zero bytes, random padding.
pub(crate) fn build_relay_payload(
    cmd: u8,
    stream_id: u16,
    data: &[u8],
) -> Result<[u8; PAYLOAD_LEN]> {
    if data.len() > MAX_RELAY_DATA_LEN {
        return Err(Error::ProtocolViolation(format!(
            "relay data too large: {} > {MAX_RELAY_DATA_LEN}",
            data.len()
        )));
    }

    let mut payload = [0u8; PAYLOAD_LEN];
    payload[CMD_OFF] = cmd;
    // recognized at 1..3 stays zero
    payload[STREAM_ID_OFF..STREAM_ID_OFF + 2].copy_from_slice(&stream_id.to_be_bytes());
    payload[LENGTH_OFF..LENGTH_OFF + 2].copy_from_slice(&(data.len() as u16).to_be_bytes());
    payload[DATA_OFF..DATA_OFF + data.len()].copy_from_slice(data);

    // Four zero bytes after the data, then random padding.
    let pad_start = DATA_OFF + data.len();
    if pad_start + 4 < PAYLOAD_LEN {
        OsRng.fill_bytes(&mut payload[pad_start + 4..]);
    }
    Ok(payload)
}

/// Computes the running forward digest at the last hop, embeds its first
/// four bytes, and applies every hop's forward keystream from the last hop
/// inwards.
pub(crate) fn seal_relay_payload(hops: &mut [ForwardHop], payload: &mut [u8; PAYLOAD_LEN]) {
    let last = hops.len() - 1;
    hops[last].digest.update(payload);
    let digest = hops[last].digest.sum();
    payload[DIGEST_OFF..DIGEST_OFF + 4].copy_from_slice(&digest[..4]);

    for hop in hops.iter_mut().rev() {
        hop.cipher.apply(payload);
    }
}

/// Peels inbound onion layers front to back. A hop claims the cell when its
/// recognized field is zero and the embedded digest matches the hop's
/// running backward digest; the digest is probed on a clone so a
/// coincidental zero recognized field cannot corrupt the running hash.
pub(crate) fn open_relay_payload(
    hops: &mut [BackwardHop],
    payload: &mut [u8; PAYLOAD_LEN],
) -> Result<RelayMsg> {
    if hops.is_empty() {
        return Err(Error::ProtocolViolation("circuit has no hops".into()));
    }

    for (i, hop) in hops.iter_mut().enumerate() {
        hop.cipher.apply(payload);

        if payload[RECOGNIZED_OFF] != 0 || payload[RECOGNIZED_OFF + 1] != 0 {
            continue;
        }

        let mut saved_digest = [0u8; 4];
        saved_digest.copy_from_slice(&payload[DIGEST_OFF..DIGEST_OFF + 4]);
        payload[DIGEST_OFF..DIGEST_OFF + 4].fill(0);

        let mut probe = hop.digest.clone();
        probe.update(payload);
        if ct_eq(&probe.sum()[..4], &saved_digest) {
            hop.digest = probe;

            let cmd = payload[CMD_OFF];
            let stream_id =
                u16::from_be_bytes([payload[STREAM_ID_OFF], payload[STREAM_ID_OFF + 1]]);
            let len = u16::from_be_bytes([payload[LENGTH_OFF], payload[LENGTH_OFF + 1]]) as usize;
            if len > MAX_RELAY_DATA_LEN {
                return Err(CellError::Oversized(len).into());
            }
            return Ok(RelayMsg {
                hop: i,
                cmd,
                stream_id,
                data: payload[DATA_OFF..DATA_OFF + len].to_vec(),
            });
        }

        // False recognition: put the digest bytes back so the next layer
        // decrypts the payload the relay actually sent.
        payload[DIGEST_OFF..DIGEST_OFF + 4].copy_from_slice(&saved_digest);
    }

    Err(CellError::Unrecognized.into())
}
