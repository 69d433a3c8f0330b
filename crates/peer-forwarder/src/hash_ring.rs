// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Consistent hashing of identification keys onto cluster peers.
//!
//! Each peer is placed on a 64-bit ring at `virtual_nodes` positions. A key is owned by the
//! first position at or clockwise after the key's hash.

use arc_swap::ArcSwap;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::Arc;
use tracing::debug;

use crate::config::PeerForwarderConfiguration;

pub const DEFAULT_PEER_PORT: u16 = 4994;

/// Normalizes a peer address to `host:port`, lowercasing the host and filling in
/// `default_port` when none is given. Returns `None` for blank input.
pub fn normalize_address(address: &str, default_port: u16) -> Option<String> {
    let address = address.trim();
    if address.is_empty() {
        return None;
    }
    let address = address
        .strip_prefix("https://")
        .or_else(|| address.strip_prefix("http://"))
        .unwrap_or(address)
        .trim_end_matches('/');

    // Bracketed IPv6, with or without a port
    if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = tail.strip_prefix(':').unwrap_or("");
        let port = if port.is_empty() {
            default_port
        } else {
            port.parse::<u16>().ok()?
        };
        return Some(format!("[{}]:{port}", host.to_lowercase()));
    }

    // Bare IPv6 has more than one colon and no port
    if address.matches(':').count() > 1 {
        return Some(format!("[{}]:{default_port}", address.to_lowercase()));
    }

    match address.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().ok()?;
            Some(format!("{}:{port}", host.to_lowercase()))
        }
        None => Some(format!("{}:{default_port}", address.to_lowercase())),
    }
}

/// Normalizes and de-duplicates a discovered peer list. The result is sorted so that two
/// nodes discovering the same peers in a different order build identical rings.
pub fn normalize_peers<I, S>(peers: I, default_port: u16) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    peers
        .into_iter()
        .filter_map(|peer| normalize_address(peer.as_ref(), default_port))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn hash_to_u64(bytes: &[u8]) -> u64 {
    let digest = Sha256::digest(bytes);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashRing {
    ring: BTreeMap<u64, Arc<str>>,
    peers: Vec<String>,
    virtual_nodes: usize,
}

impl HashRing {
    /// Builds a ring over `peers`, giving `default_port` to any peer listed without one. The
    /// same peers and replica count always produce the same ring, regardless of input order
    /// or duplicates.
    pub fn build<I, S>(peers: I, default_port: u16, virtual_nodes: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let peers = normalize_peers(peers, default_port);
        let virtual_nodes = virtual_nodes.max(1);
        let mut ring = BTreeMap::new();

        for peer in &peers {
            let shared: Arc<str> = Arc::from(peer.as_str());
            for i in 0..virtual_nodes {
                let position = hash_to_u64(format!("{peer}-{i}").as_bytes());
                // On the rare position collision the lexically smaller peer wins, which keeps
                // the build independent of iteration order.
                ring.entry(position)
                    .and_modify(|existing: &mut Arc<str>| {
                        if shared.as_ref() < existing.as_ref() {
                            *existing = Arc::clone(&shared);
                        }
                    })
                    .or_insert_with(|| Arc::clone(&shared));
            }
        }

        HashRing {
            ring,
            peers,
            virtual_nodes,
        }
    }

    pub fn empty() -> Self {
        HashRing {
            ring: BTreeMap::new(),
            peers: Vec::new(),
            virtual_nodes: 0,
        }
    }

    /// Returns the peer owning `key`, or `None` when the ring has no peers.
    pub fn owner(&self, key: &str) -> Option<&str> {
        let hash = hash_to_u64(key.as_bytes());
        self.ring
            .range(hash..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, peer)| peer.as_ref())
    }

    pub fn peers(&self) -> &[String] {
        &self.peers
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn virtual_nodes(&self) -> usize {
        self.virtual_nodes
    }
}

/// The discovered peer set and the ring built from it.
///
/// Readers load the current ring with a single atomic pointer read, so an `owner()` call
/// always sees one complete ring. Updates build a new ring off to the side and swap it in.
pub struct ClusterState {
    local_address: String,
    port: u16,
    virtual_nodes: usize,
    membership: ArcSwap<Membership>,
}

/// A ring together with the subset of its peers that resolve to this node.
struct Membership {
    ring: Arc<HashRing>,
    local_peers: BTreeSet<String>,
}

impl Membership {
    fn new(ring: HashRing, local_address: &str) -> Self {
        let local_peers = ring
            .peers()
            .iter()
            .filter(|peer| refers_to_this_node(peer, local_address))
            .cloned()
            .collect();
        Membership {
            ring: Arc::new(ring),
            local_peers,
        }
    }
}

impl ClusterState {
    /// `port` is the forwarding port every peer listens on. It fills in any peer or local
    /// address given without one.
    pub fn new(local_address: impl AsRef<str>, port: u16, virtual_nodes: usize) -> Self {
        let local_address = normalize_address(local_address.as_ref(), port)
            .unwrap_or_else(|| format!("127.0.0.1:{port}"));
        let membership = Membership::new(HashRing::empty(), &local_address);
        ClusterState {
            local_address,
            port,
            virtual_nodes,
            membership: ArcSwap::from_pointee(membership),
        }
    }

    pub fn from_config(config: &PeerForwarderConfiguration) -> Self {
        ClusterState::new(
            config.local_address(),
            config.port(),
            config.virtual_nodes_per_peer,
        )
    }

    pub fn with_peers<I, S>(
        local_address: impl AsRef<str>,
        port: u16,
        virtual_nodes: usize,
        peers: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let state = ClusterState::new(local_address, port, virtual_nodes);
        state.update_peers(peers);
        state
    }

    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Rebuilds the ring for `peers` and swaps it in. Returns `false` when the peer set is
    /// unchanged and the current ring was kept.
    pub fn update_peers<I, S>(&self, peers: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let peers = normalize_peers(peers, self.port);
        if self.membership.load().ring.peers() == peers.as_slice() {
            return false;
        }
        debug!("Rebuilding hash ring for {} peers: {:?}", peers.len(), peers);
        let ring = HashRing::build(peers, self.port, self.virtual_nodes);
        self.membership
            .store(Arc::new(Membership::new(ring, &self.local_address)));
        true
    }

    pub fn ring(&self) -> Arc<HashRing> {
        Arc::clone(&self.membership.load().ring)
    }

    pub fn peer_count(&self) -> usize {
        self.membership.load().ring.peer_count()
    }

    /// Owner of `key`. An empty ring means a single-node cluster, so the key is ours.
    pub fn owner(&self, key: &str) -> String {
        let membership = self.membership.load();
        match membership.ring.owner(key) {
            Some(peer) => peer.to_string(),
            None => self.local_address.clone(),
        }
    }

    /// Whether `address` refers to this node: our configured address, or a loopback,
    /// unspecified or interface address on our port. Ring members are classified once per
    /// ring build.
    pub fn is_local(&self, address: &str) -> bool {
        let membership = self.membership.load();
        if membership
            .ring
            .peers()
            .binary_search_by(|peer| peer.as_str().cmp(address))
            .is_ok()
        {
            return membership.local_peers.contains(address);
        }
        refers_to_this_node(address, &self.local_address)
    }
}

fn refers_to_this_node(address: &str, local_address: &str) -> bool {
    if address == local_address {
        return true;
    }
    let Some((host, port)) = address.rsplit_once(':') else {
        return false;
    };
    let local_port = local_address.rsplit_once(':').map(|(_, port)| port);
    if local_port != Some(port) {
        return false;
    }
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    match host.parse::<IpAddr>() {
        Ok(ip) => ip.is_loopback() || ip.is_unspecified() || is_interface_address(ip),
        Err(_) => false,
    }
}

/// Binding only succeeds for an address assigned to one of this host's interfaces.
fn is_interface_address(ip: IpAddr) -> bool {
    UdpSocket::bind(SocketAddr::new(ip, 0)).is_ok()
}

impl std::fmt::Debug for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterState")
            .field("local_address", &self.local_address)
            .field("port", &self.port)
            .field("peers", &self.membership.load().ring.peers())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const PEERS: [&str; 3] = ["10.0.0.1:4994", "10.0.0.2:4994", "10.0.0.3:4994"];

    #[test]
    fn test_normalize_address() {
        assert_eq!(
            normalize_address(" 10.0.0.1 ", 4994),
            Some("10.0.0.1:4994".to_string())
        );
        assert_eq!(
            normalize_address("Node-A.Example.com:21890", 4994),
            Some("node-a.example.com:21890".to_string())
        );
        assert_eq!(
            normalize_address("https://10.0.0.1:443/", 4994),
            Some("10.0.0.1:443".to_string())
        );
        assert_eq!(normalize_address("::1", 4994), Some("[::1]:4994".to_string()));
        assert_eq!(
            normalize_address("[::1]:21890", 4994),
            Some("[::1]:21890".to_string())
        );
        assert_eq!(normalize_address("", 4994), None);
        assert_eq!(normalize_address("10.0.0.1:notaport", 4994), None);
    }

    #[test]
    fn test_normalize_peers_removes_duplicates() {
        let peers = normalize_peers(["10.0.0.2", "10.0.0.1:4994", "10.0.0.1", ""], 4994);
        assert_eq!(peers, vec!["10.0.0.1:4994", "10.0.0.2:4994"]);
    }

    #[test]
    fn test_empty_ring_has_no_owner() {
        let ring = HashRing::build(Vec::<String>::new(), DEFAULT_PEER_PORT, 128);
        assert!(ring.is_empty());
        assert_eq!(ring.owner("trace-id"), None);
    }

    #[test]
    fn test_single_peer_owns_everything() {
        let ring = HashRing::build(["10.0.0.1"], DEFAULT_PEER_PORT, 128);
        for i in 0..100 {
            assert_eq!(ring.owner(&format!("key-{i}")), Some("10.0.0.1:4994"));
        }
    }

    #[test]
    fn test_build_is_independent_of_input_order() {
        let forward = HashRing::build(PEERS, DEFAULT_PEER_PORT, 128);
        let reversed = HashRing::build(PEERS.iter().rev(), DEFAULT_PEER_PORT, 128);
        assert_eq!(forward, reversed);
    }

    #[test]
    fn test_owner_is_deterministic_across_rings() {
        let first = HashRing::build(&PEERS[..2], DEFAULT_PEER_PORT, 128);
        let second = HashRing::build(&PEERS[..2], DEFAULT_PEER_PORT, 128);
        for i in 0..1000 {
            let key = format!("trace-{i}");
            assert_eq!(first.owner(&key), first.owner(&key));
            assert_eq!(first.owner(&key), second.owner(&key));
        }
    }

    #[test]
    fn test_adding_a_peer_moves_a_minority_of_keys() {
        let before = HashRing::build(&PEERS[..2], DEFAULT_PEER_PORT, 128);
        let after = HashRing::build(PEERS, DEFAULT_PEER_PORT, 128);
        let total = 10_000;
        let moved = (0..total)
            .map(|i| format!("trace-{i}"))
            .filter(|key| before.owner(key) != after.owner(key))
            .count();

        // Ideal is one third. Anything under half is consistent-hashing behavior; a modulo
        // scheme would move about two thirds.
        assert!(moved > 0);
        assert!(moved < total / 2, "{moved} of {total} keys moved");

        // Keys that moved must have moved to the new peer.
        for i in 0..total {
            let key = format!("trace-{i}");
            if before.owner(&key) != after.owner(&key) {
                assert_eq!(after.owner(&key), Some("10.0.0.3:4994"));
            }
        }
    }

    #[test]
    fn test_load_is_spread_across_peers() {
        let ring = HashRing::build(PEERS, DEFAULT_PEER_PORT, 128);
        let mut counts = std::collections::HashMap::new();
        for i in 0..9_000 {
            let owner = ring.owner(&format!("span-{i}")).unwrap().to_string();
            *counts.entry(owner).or_insert(0usize) += 1;
        }
        assert_eq!(counts.len(), 3);
        for count in counts.values() {
            assert!(*count > 1_500, "unbalanced ring: {counts:?}");
        }
    }

    #[test]
    fn test_cluster_state_empty_ring_routes_to_self() {
        let state = ClusterState::new("10.0.0.9:4994", 4994, 128);
        assert_eq!(state.owner("anything"), "10.0.0.9:4994");
        assert_eq!(state.peer_count(), 0);
    }

    #[test]
    fn test_cluster_state_update_swaps_ring() {
        let state = ClusterState::with_peers("10.0.0.1:4994", DEFAULT_PEER_PORT, 64, &PEERS[..1]);
        let old_ring = state.ring();

        assert!(state.update_peers(PEERS));
        assert!(!state.update_peers(PEERS.iter().rev()));

        // A ring loaded before the swap is still complete and usable.
        assert_eq!(old_ring.peer_count(), 1);
        assert_eq!(state.peer_count(), 3);
    }

    #[test]
    fn test_is_local() {
        let state = ClusterState::new("10.0.0.1:4994", 4994, 64);
        assert!(state.is_local("10.0.0.1:4994"));
        assert!(state.is_local("127.0.0.1:4994"));
        assert!(state.is_local("localhost:4994"));
        assert!(state.is_local("[::1]:4994"));
        assert!(state.is_local("0.0.0.0:4994"));
        assert!(!state.is_local("10.0.0.2:4994"));
        assert!(!state.is_local("peer.example.com:4994"));
        // Another node on the same host
        assert!(!state.is_local("127.0.0.1:5994"));
    }

    #[test]
    fn test_missing_ports_use_cluster_port() {
        let state = ClusterState::with_peers("10.0.0.1", 21890, 16, ["10.0.0.2", "10.0.0.3:4994"]);
        assert_eq!(state.local_address(), "10.0.0.1:21890");
        assert_eq!(state.ring().peers(), ["10.0.0.2:21890", "10.0.0.3:4994"]);
        assert!(!state.update_peers(["10.0.0.2:21890", "10.0.0.3:4994"]));
    }

    #[test]
    fn test_interface_address_is_local() {
        // The address this host would use to reach the outside, if it has one
        let Some(ip) = std::net::UdpSocket::bind("0.0.0.0:0")
            .and_then(|socket| {
                socket.connect("203.0.113.1:9")?;
                socket.local_addr()
            })
            .ok()
            .map(|addr| addr.ip())
            .filter(|ip| !ip.is_unspecified() && !ip.is_loopback())
        else {
            return;
        };
        let own = format!("{ip}:4994");
        let state = ClusterState::with_peers("127.0.0.1:4994", 4994, 16, [own.as_str()]);
        assert!(state.is_local(&own));
        assert!(!state.is_local(&format!("{ip}:5994")));
    }

    proptest! {
        #[test]
        fn prop_owner_is_a_member(
            peers in proptest::collection::vec("[a-z]{1,8}", 1..8),
            key in ".*",
        ) {
            let ring = HashRing::build(&peers, DEFAULT_PEER_PORT, 16);
            let owner = ring.owner(&key).unwrap();
            prop_assert!(ring.peers().iter().any(|peer| peer == owner));
        }
    }
}
