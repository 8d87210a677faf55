//! HSDir hash-ring selection
//!
//! Builds the ring of HSDir relays keyed by their per-period relay index
//! and walks it from each replica's service index, per rend-spec-v3
//! §2.2.3. Clients fetch from the first `spread_fetch` distinct relays at
//! or after each index, wrapping around the ring.

use crate::consensus::{Consensus, Relay};
use crate::error::{Error, Result};
use sha3::{Digest, Sha3_256};

const N_REPLICAS: u64 = 2;
const SPREAD_FETCH: usize = 3;

/// Selects the HSDirs responsible for a blinded key this period, in fetch
/// order. Returns at most `n_replicas * spread_fetch` distinct relays.
pub fn select_hsdirs<'a>(
    consensus: &'a Consensus,
    blinded_key: &[u8; 32],
    period_num: u64,
    period_length: u64,
    srv: &[u8; 32],
) -> Result<Vec<&'a Relay>> {
    // The ring holds every usable HSDir, sorted by relay index.
    let mut ring: Vec<(usize, [u8; 32])> = Vec::new();
    for (i, relay) in consensus.relays.iter().enumerate() {
        let flags = relay.flags;
        if !flags.hsdir || !flags.running || !flags.valid {
            continue;
        }
        let Some(ed25519) = relay.ed25519_id else {
            continue;
        };
        ring.push((i, relay_index(&ed25519, srv, period_num, period_length)));
    }
    if ring.is_empty() {
        return Err(Error::HsDescriptor(crate::error::HsDescriptorError::Fetch(
            "no HSDir relays in consensus".into(),
        )));
    }
    ring.sort_by(|a, b| a.1.cmp(&b.1));

    let mut selected_positions: Vec<usize> = Vec::new();
    let mut result: Vec<&Relay> = Vec::new();

    for replica in 1..=N_REPLICAS {
        let svc_idx = service_index(blinded_key, replica, period_length, period_num);

        // First ring slot at or after the service index, wrapping.
        let start = ring.partition_point(|(_, idx)| idx < &svc_idx);

        let mut picked = 0;
        for offset in 0..ring.len() {
            if picked == SPREAD_FETCH {
                break;
            }
            let pos = (start + offset) % ring.len();
            if selected_positions.contains(&pos) {
                continue;
            }
            selected_positions.push(pos);
            result.push(&consensus.relays[ring[pos].0]);
            picked += 1;
        }
    }

    log::debug!("selected {} HSDirs for descriptor fetch", result.len());
    Ok(result)
}

/// `SHA3-256("node-idx" | ed25519_id | SRV | INT_8(period_num) | INT_8(period_length))`
fn relay_index(ed25519_id: &[u8; 32], srv: &[u8], period_num: u64, period_length: u64) -> [u8; 32] {
    let mut h = Sha3_256::new();
    h.update(b"node-idx");
    h.update(ed25519_id);
    h.update(srv);
    h.update(period_num.to_be_bytes());
    h.update(period_length.to_be_bytes());
    h.finalize().into()
}

/// `SHA3-256("store-at-idx" | blinded_key | INT_8(replica) | INT_8(period_length) | INT_8(period_num))`
fn service_index(
    blinded_key: &[u8; 32],
    replica: u64,
    period_length: u64,
    period_num: u64,
) -> [u8; 32] {
    let mut h = Sha3_256::new();
    h.update(b"store-at-idx");
    h.update(blinded_key);
    h.update(replica.to_be_bytes());
    h.update(period_length.to_be_bytes());
    h.update(period_num.to_be_bytes());
    h.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::RelayFlags;
    use std::net::Ipv4Addr;

    fn hsdir_relay(seed: u8, hsdir: bool) -> Relay {
        Relay {
            nickname: format!("relay{seed}"),
            identity: [seed; 20],
            ed25519_id: Some([seed; 32]),
            address: Ipv4Addr::new(10, 0, 0, seed),
            or_port: 9001,
            dir_port: if seed % 2 == 0 { 9030 } else { 0 },
            bandwidth: 1000,
            flags: RelayFlags {
                hsdir,
                running: true,
                valid: true,
                ..Default::default()
            },
            ntor_onion_key: Some([seed; 32]),
        }
    }

    fn test_consensus(n: u8) -> Consensus {
        Consensus {
            relays: (1..=n).map(|i| hsdir_relay(i, true)).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn selection_is_deterministic() {
        let consensus = test_consensus(20);
        let a = select_hsdirs(&consensus, &[7; 32], 100, 1440, &[9; 32]).unwrap();
        let b = select_hsdirs(&consensus, &[7; 32], 100, 1440, &[9; 32]).unwrap();
        let names_a: Vec<_> = a.iter().map(|r| &r.nickname).collect();
        let names_b: Vec<_> = b.iter().map(|r| &r.nickname).collect();
        assert_eq!(names_a, names_b);
    }

    #[test]
    fn selection_returns_distinct_relays_capped_at_six() {
        let consensus = test_consensus(20);
        let dirs = select_hsdirs(&consensus, &[7; 32], 100, 1440, &[9; 32]).unwrap();
        assert_eq!(dirs.len(), 6);
        let mut ids: Vec<_> = dirs.iter().map(|r| r.identity).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 6);
    }

    #[test]
    fn small_ring_is_exhausted_without_duplicates() {
        let consensus = test_consensus(4);
        let dirs = select_hsdirs(&consensus, &[7; 32], 100, 1440, &[9; 32]).unwrap();
        assert_eq!(dirs.len(), 4);
    }

    #[test]
    fn non_hsdir_relays_are_excluded() {
        let mut consensus = test_consensus(8);
        for relay in consensus.relays.iter_mut().take(4) {
            relay.flags.hsdir = false;
        }
        let dirs = select_hsdirs(&consensus, &[7; 32], 100, 1440, &[9; 32]).unwrap();
        assert!(dirs.iter().all(|r| r.flags.hsdir));
        assert_eq!(dirs.len(), 4);
    }

    #[test]
    fn relays_without_ed25519_are_excluded() {
        let mut consensus = test_consensus(3);
        consensus.relays[0].ed25519_id = None;
        let dirs = select_hsdirs(&consensus, &[7; 32], 100, 1440, &[9; 32]).unwrap();
        assert_eq!(dirs.len(), 2);
    }

    #[test]
    fn empty_ring_fails() {
        let consensus = test_consensus(0);
        assert!(select_hsdirs(&consensus, &[7; 32], 100, 1440, &[9; 32]).is_err());
    }

    #[test]
    fn different_periods_move_the_ring() {
        let consensus = test_consensus(30);
        let a = select_hsdirs(&consensus, &[7; 32], 100, 1440, &[9; 32]).unwrap();
        let b = select_hsdirs(&consensus, &[7; 32], 101, 1440, &[9; 32]).unwrap();
        let names_a: Vec<_> = a.iter().map(|r| &r.nickname).collect();
        let names_b: Vec<_> = b.iter().map(|r| &r.nickname).collect();
        assert_ne!(names_a, names_b);
    }
}
