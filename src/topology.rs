/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::address::Address;
use crate::applicationlayer::NodeHost;
use crate::identity::Identity;
use crate::inetaddress::InetAddress;
use crate::peer::Peer;
use crate::proto::{PEER_EXPIRATION, ROOT_SWITCH_LATENCY_MARGIN_PCT};
use crate::runtime::RuntimeEnvironment;
use crate::world::World;

/// The in-memory peer directory plus the signed root set ("world") and the
/// trusted physical path table.
pub struct Topology {
    peers: RwLock<HashMap<Address, Arc<Peer>>>,
    world: RwLock<Option<World>>,
    // Current best root, kept sticky so latency jitter doesn't flap it.
    best_root: Mutex<Option<Address>>,
    trusted_paths: RwLock<Vec<(InetAddress, u64)>>,
}

impl Topology {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            world: RwLock::new(None),
            best_root: Mutex::new(None),
            trusted_paths: RwLock::new(Vec::new()),
        }
    }

    /* World / roots */

    /// Install a world unconditionally (startup / host-provided).
    pub fn set_world<App: NodeHost>(&self, rt: &RuntimeEnvironment<App>, world: World) {
        for root in world.roots() {
            if root.identity.address() != rt.address() {
                self.add_peer(rt, root.identity.clone());
            }
        }
        *self.world.write().unwrap() = Some(world);
    }

    /// Consider a world update received on the wire. Applied only if the
    /// stored world vouches for it (same ID, newer timestamp, valid
    /// signature by the embedded update key).
    pub fn consider_world_update<App: NodeHost>(&self, rt: &RuntimeEnvironment<App>, candidate: World) -> bool {
        let accept = match self.world.read().unwrap().as_ref() {
            Some(current) => current.should_be_replaced_by(&candidate),
            None => false,
        };
        if accept {
            rt.trace(format!("world updated to timestamp {}", candidate.timestamp()));
            self.set_world(rt, candidate);
        }
        accept
    }

    pub fn world(&self) -> Option<World> {
        self.world.read().unwrap().clone()
    }

    pub fn world_id_timestamp(&self) -> (u64, i64) {
        match self.world.read().unwrap().as_ref() {
            Some(w) => (w.id(), w.timestamp()),
            None => (0, 0),
        }
    }

    pub fn is_root_address(&self, address: Address) -> bool {
        self.world.read().unwrap().as_ref().is_some_and(|w| w.is_root_address(address))
    }

    pub fn am_root<App: NodeHost>(&self, rt: &RuntimeEnvironment<App>) -> bool {
        self.is_root_address(rt.address())
    }

    /// Static bootstrap endpoints of every root, for reaching them with no
    /// learned path.
    pub fn root_stable_endpoints(&self) -> Vec<(Address, Vec<InetAddress>)> {
        match self.world.read().unwrap().as_ref() {
            Some(w) => w
                .roots()
                .iter()
                .map(|r| (r.identity.address(), r.stable_endpoints.clone()))
                .collect(),
            None => Vec::new(),
        }
    }

    /// The root with the lowest latency among those we can hear. A new root
    /// has to beat the incumbent by a margin before we move; measurement
    /// noise shouldn't bounce all our relayed traffic around.
    pub fn best_root(&self, now: i64) -> Option<Arc<Peer>> {
        let world = self.world.read().unwrap();
        let roots = world.as_ref()?.roots();
        let peers = self.peers.read().unwrap();

        let mut best: Option<(&Arc<Peer>, u64)> = None;
        for r in roots {
            if let Some(p) = peers.get(&r.identity.address()) {
                let mut lat = p.latency() as u64;
                if !p.alive(now) {
                    lat = lat.saturating_add(1 << 32); // deprioritize the silent
                }
                if best.map(|(_, bl)| lat < bl).unwrap_or(true) {
                    best = Some((p, lat));
                }
            }
        }
        let (candidate, candidate_lat) = best?;

        let mut sticky = self.best_root.lock().unwrap();
        if let Some(current_addr) = *sticky {
            if current_addr != candidate.address() {
                if let Some(current) = peers.get(&current_addr) {
                    if current.alive(now) {
                        let current_lat = current.latency() as u64;
                        // Margin test: candidate must be >25% better.
                        if candidate_lat.saturating_mul(100) >= current_lat.saturating_mul((100 - ROOT_SWITCH_LATENCY_MARGIN_PCT) as u64) {
                            return Some(current.clone());
                        }
                    }
                }
            }
        }
        *sticky = Some(candidate.address());
        Some(candidate.clone())
    }

    /* Peer directory */

    pub fn get_peer(&self, address: Address) -> Option<Arc<Peer>> {
        self.peers.read().unwrap().get(&address).cloned()
    }

    /// Insert a peer for a verified identity, or return the existing one.
    /// An identity that collides with a different stored identity for the
    /// same address is rejected; first verified identity wins.
    pub fn add_peer<App: NodeHost>(&self, rt: &RuntimeEnvironment<App>, identity: Identity) -> Option<Arc<Peer>> {
        if identity.address() == rt.address() {
            return None;
        }
        {
            let peers = self.peers.read().unwrap();
            if let Some(existing) = peers.get(&identity.address()) {
                return if existing.identity() == &identity { Some(existing.clone()) } else { None };
            }
        }
        let peer = Arc::new(Peer::new(&rt.identity, identity)?);
        let mut peers = self.peers.write().unwrap();
        Some(peers.entry(peer.address()).or_insert(peer).clone())
    }

    /// Look up a peer, firing a WHOIS into the ether if we don't know them.
    pub fn get_or_request_peer<App: NodeHost>(&self, rt: &RuntimeEnvironment<App>, address: Address, now: i64) -> Option<Arc<Peer>> {
        let p = self.get_peer(address);
        if p.is_none() {
            rt.sw.request_whois(rt, address, now);
        }
        p
    }

    pub fn each_peer(&self, mut f: impl FnMut(&Arc<Peer>)) {
        // Snapshot so `f` can reach back into the topology without holding
        // the directory lock.
        let snapshot: Vec<Arc<Peer>> = self.peers.read().unwrap().values().cloned().collect();
        for p in snapshot.iter() {
            f(p);
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().unwrap().len()
    }

    /// Evict peers that have been silent for a long time. Roots stay.
    pub fn clean(&self, now: i64) {
        let world = self.world.read().unwrap();
        let mut peers = self.peers.write().unwrap();
        peers.retain(|addr, p| {
            if let Some(w) = world.as_ref() {
                if w.is_root_address(*addr) {
                    return true;
                }
            }
            let lr = p.last_receive();
            lr != 0 && (now - lr) < PEER_EXPIRATION
        });
    }

    /* Trusted physical paths */

    pub fn set_trusted_paths(&self, paths: Vec<(InetAddress, u64)>) {
        *self.trusted_paths.write().unwrap() = paths;
    }

    /// Trusted path ID to stamp on outbound packets to `remote`, or 0.
    pub fn outbound_trusted_path_id(&self, remote: &InetAddress) -> u64 {
        for (net, id) in self.trusted_paths.read().unwrap().iter() {
            if net.network_contains(remote) {
                return *id;
            }
        }
        0
    }

    /// Should an inbound packet claiming `trusted_path_id` from `remote` be
    /// accepted without MAC or cipher?
    pub fn inbound_trusted_path_ok(&self, remote: &InetAddress, trusted_path_id: u64) -> bool {
        trusted_path_id != 0 && self.outbound_trusted_path_id(remote) == trusted_path_id
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trusted_path_table() {
        let t = Topology::new();
        t.set_trusted_paths(vec![
            (InetAddress::V4("10.0.0.0".parse().unwrap(), 8), 7777),
            (InetAddress::V6("fd00::".parse().unwrap(), 8), 8888),
        ]);
        let in_net = InetAddress::V4("10.9.9.9".parse().unwrap(), 9993);
        let outside = InetAddress::V4("192.0.2.1".parse().unwrap(), 9993);
        assert_eq!(t.outbound_trusted_path_id(&in_net), 7777);
        assert_eq!(t.outbound_trusted_path_id(&outside), 0);
        assert!(t.inbound_trusted_path_ok(&in_net, 7777));
        assert!(!t.inbound_trusted_path_ok(&in_net, 8888));
        assert!(!t.inbound_trusted_path_ok(&outside, 0));
    }
}
