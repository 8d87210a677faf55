//! Onion service connection choreography
//!
//! Drives a `.onion` connect attempt through its states: resolve the
//! descriptor, build and arm a rendezvous circuit, introduce through each
//! introduction point until one accepts, complete the hs-ntor handshake
//! from RENDEZVOUS2, attach the virtual hop, and open the stream.

use crate::circuit::{
    Circuit, RELAY_ESTABLISH_RENDEZVOUS, RELAY_INTRODUCE1, RELAY_INTRODUCE_ACK,
    RELAY_RENDEZVOUS2, RELAY_RENDEZVOUS_ESTABLISHED,
};
use crate::consensus::{Consensus, RelayInfo};
use crate::error::{Error, HsDescriptorError, HsIntroError, Result};
use crate::onion::blind::{blind_public_key, srv_for_client, subcredential, time_period,
    DEFAULT_PERIOD_LENGTH};
use crate::onion::descriptor::{
    self, decrypt_descriptor, parse_link_specifiers, parse_outer, IntroPoint,
};
use crate::onion::hsdir::select_hsdirs;
use crate::onion::hsntor::{build_introduce1, build_rend_link_specs, generate_rend_cookie,
    REND_COOKIE_LEN};
use crate::onion::address::decode_onion;
use crate::stream::Stream;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Deadline for the RENDEZVOUS2 wait after a successful introduction.
const RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(30);

/// A circuit produced by the path-selection collaborator, together with
/// the relay at its far end.
pub struct BuiltCircuit {
    pub circuit: Arc<Circuit>,
    pub last_hop: RelayInfo,
}

/// Builds 3-hop circuits. Path selection is the collaborator's concern;
/// the onion service protocol only asks for "a circuit ending at this
/// relay" (or at any suitable exit when `target` is `None`).
#[async_trait]
pub trait CircuitBuilder: Send + Sync {
    async fn build_circuit(&self, target: Option<&RelayInfo>) -> Result<BuiltCircuit>;
}

/// Plain HTTP client used for descriptor fetches from HSDirs that expose a
/// DirPort. Optional; without one, every fetch goes through BEGIN_DIR
/// circuits.
#[async_trait]
pub trait DirHttpClient: Send + Sync {
    /// Issues a GET for `path` against `addr` and returns the body.
    async fn get(&self, addr: SocketAddr, path: &str) -> Result<String>;
}

/// Everything learned from a successfully resolved descriptor.
#[derive(Debug)]
pub(crate) struct ResolvedService {
    pub intro_points: Vec<IntroPoint>,
    pub subcredential: [u8; 32],
}

/// Resolve state: fetch and decrypt the service descriptor.
pub(crate) async fn resolve(
    address: &str,
    consensus: &Consensus,
    http_client: Option<&dyn DirHttpClient>,
    builder: Option<&dyn CircuitBuilder>,
) -> Result<ResolvedService> {
    let pubkey = decode_onion(address)?;

    let reference_time = consensus.valid_after.unwrap_or_else(SystemTime::now);
    let period_num = time_period(reference_time, DEFAULT_PERIOD_LENGTH);
    let blinded_key = blind_public_key(&pubkey, period_num, DEFAULT_PERIOD_LENGTH)?;
    let subcred = subcredential(&pubkey, &blinded_key);
    let srv = srv_for_client(consensus)?;

    let hsdirs = select_hsdirs(consensus, &blinded_key, period_num, DEFAULT_PERIOD_LENGTH, &srv)?;
    log::info!("resolving {address}: period {period_num}, {} HSDirs", hsdirs.len());

    // HSDirs are tried in selection order; the first successful fetch wins.
    let mut last_err: Option<Error> = None;
    let mut descriptor_text = None;
    for hsdir in hsdirs {
        let attempt = match (http_client, builder) {
            (Some(http), _) if hsdir.dir_port > 0 => {
                let addr = SocketAddr::new(hsdir.address.into(), hsdir.dir_port);
                http.get(addr, &descriptor::descriptor_path(&blinded_key)).await
            }
            (_, Some(builder)) => match RelayInfo::from_relay(hsdir) {
                Some(info) => fetch_over_circuit(builder, &info, &blinded_key).await,
                None => Err(HsDescriptorError::Fetch(format!(
                    "HSDir {} has no ntor key",
                    hsdir.nickname
                ))
                .into()),
            },
            _ => Err(HsDescriptorError::Fetch("no fetch path to HSDir".into()).into()),
        };

        match attempt {
            Ok(text) => {
                descriptor_text = Some(text);
                break;
            }
            Err(e) => {
                log::debug!("HSDir {} fetch failed: {e}", hsdir.nickname);
                last_err = Some(e);
            }
        }
    }

    let text = match descriptor_text {
        Some(text) => text,
        None => {
            return Err(last_err.unwrap_or_else(|| {
                HsDescriptorError::Fetch("no reachable HSDirs".into()).into()
            }))
        }
    };

    let outer = parse_outer(&text)?;
    let intro_points = decrypt_descriptor(&outer, &blinded_key, &subcred)?;
    if intro_points.is_empty() {
        return Err(HsDescriptorError::Parse("no introduction points".into()).into());
    }
    log::info!("resolved {address}: {} introduction points", intro_points.len());

    Ok(ResolvedService {
        intro_points,
        subcredential: subcred,
    })
}

async fn fetch_over_circuit(
    builder: &dyn CircuitBuilder,
    hsdir: &RelayInfo,
    blinded_key: &[u8; 32],
) -> Result<String> {
    let built = builder.build_circuit(Some(hsdir)).await?;
    let result = descriptor::fetch_via_circuit(&built.circuit, blinded_key).await;
    let _ = built.circuit.destroy().await;
    built.circuit.link().close().await;
    result
}

/// Connects to a v3 onion service and returns a ready stream.
///
/// The returned stream owns its rendezvous circuit: closing it destroys
/// the circuit and the underlying link.
pub async fn connect_onion_service(
    address: &str,
    port: u16,
    consensus: &Consensus,
    http_client: Option<&dyn DirHttpClient>,
    builder: &dyn CircuitBuilder,
) -> Result<Stream> {
    // Resolve.
    let resolved = resolve(address, consensus, http_client, Some(builder)).await?;

    // RendBuild: any suitable relay works as the rendezvous point.
    log::info!("building rendezvous circuit");
    let rend = builder.build_circuit(None).await?;

    // EstablishRend.
    let cookie = generate_rend_cookie();
    if let Err(e) = establish_rendezvous(&rend, &cookie).await {
        abandon(&rend).await;
        return Err(e);
    }

    let rend_link_specs = build_rend_link_specs(
        &rend.last_hop.node_id,
        rend.last_hop.address,
        rend.last_hop.or_port,
        None, // Ed25519 id is not always known from the consensus
    );

    // Introducing: walk the intro points until one carries the request.
    let mut last_err: Option<Error> = None;
    for (idx, intro_point) in resolved.intro_points.iter().enumerate() {
        log::info!("trying introduction point {idx}");
        match try_intro_point(
            intro_point,
            &resolved.subcredential,
            &cookie,
            &rend,
            &rend_link_specs,
            builder,
        )
        .await
        {
            Ok(()) => {
                // Connected: the rendezvous circuit now carries the virtual
                // hop; open the stream through all four hops.
                let target = format!("{address}:{port}");
                let mut stream = match Stream::begin(&rend.circuit, &target).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        abandon(&rend).await;
                        return Err(e);
                    }
                };
                stream.set_owns_circuit();
                return Ok(stream);
            }
            Err(e) => {
                log::warn!("introduction point {idx} failed: {e}");
                last_err = Some(e);
            }
        }
    }

    abandon(&rend).await;
    if let Some(e) = last_err {
        log::warn!("all introduction points failed, last error: {e}");
    }
    Err(HsIntroError::AllPointsFailed.into())
}

/// EstablishRend: park a cookie at the rendezvous point.
async fn establish_rendezvous(rend: &BuiltCircuit, cookie: &[u8; REND_COOKIE_LEN]) -> Result<()> {
    log::info!("sending ESTABLISH_RENDEZVOUS");
    rend.circuit
        .send_relay(RELAY_ESTABLISH_RENDEZVOUS, 0, cookie)
        .await?;

    let msg = rend.circuit.recv_relay().await?;
    if msg.cmd != RELAY_RENDEZVOUS_ESTABLISHED {
        return Err(Error::ProtocolViolation(format!(
            "expected RENDEZVOUS_ESTABLISHED, got relay command {}",
            msg.cmd
        )));
    }
    log::info!("rendezvous established");
    Ok(())
}

/// One introduction attempt: intro circuit, INTRODUCE1, INTRODUCE_ACK,
/// then RENDEZVOUS2 on the rendezvous circuit and the virtual hop attach.
async fn try_intro_point(
    intro_point: &IntroPoint,
    subcred: &[u8; 32],
    cookie: &[u8; REND_COOKIE_LEN],
    rend: &BuiltCircuit,
    rend_link_specs: &[u8],
    builder: &dyn CircuitBuilder,
) -> Result<()> {
    let specs = parse_link_specifiers(&intro_point.link_specifiers)?;
    let intro_info = specs.to_relay_info(intro_point.onion_key);

    log::info!("building introduction circuit to {}", intro_info.addr());
    let intro = builder.build_circuit(Some(&intro_info)).await?;

    let (payload, hs_state) = build_introduce1(
        intro_point.auth_key,
        intro_point.enc_key,
        subcred,
        cookie,
        &rend.last_hop.ntor_onion_key,
        rend_link_specs,
    )?;

    // The intro circuit is single-purpose: deliver INTRODUCE1, read the
    // ack, abandon.
    let ack_status = async {
        intro
            .circuit
            .send_relay(RELAY_INTRODUCE1, 0, &payload)
            .await?;
        let msg = intro.circuit.recv_relay().await?;
        if msg.cmd != RELAY_INTRODUCE_ACK {
            return Err(Error::ProtocolViolation(format!(
                "expected INTRODUCE_ACK, got relay command {}",
                msg.cmd
            )));
        }
        if msg.data.len() < 2 {
            return Ok(0u16);
        }
        Ok(u16::from_be_bytes([msg.data[0], msg.data[1]]))
    }
    .await;
    abandon(&intro).await;

    match ack_status? {
        0 => log::info!("INTRODUCE_ACK success"),
        status => return Err(HsIntroError::Status(status).into()),
    }

    // WaitingRend: nothing but RENDEZVOUS2 is legitimate on this circuit.
    let msg = tokio::time::timeout(RENDEZVOUS_TIMEOUT, rend.circuit.recv_relay())
        .await
        .map_err(|_| Error::Timeout)??;
    if msg.cmd != RELAY_RENDEZVOUS2 {
        return Err(Error::ProtocolViolation(format!(
            "expected RENDEZVOUS2, got relay command {}",
            msg.cmd
        )));
    }
    log::info!("RENDEZVOUS2 received");

    let km = hs_state.complete(&msg.data)?;
    rend.circuit
        .add_virtual_hop(&km.kf, &km.kb, &km.df, &km.db)
        .await;
    Ok(())
}

/// Best-effort teardown of a circuit and its link.
async fn abandon(built: &BuiltCircuit) {
    if let Err(e) = built.circuit.destroy().await {
        log::debug!("abandoning circuit: {e}");
    }
    built.circuit.link().close().await;
}
