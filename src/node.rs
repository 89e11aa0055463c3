/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};

use crate::address::Address;
use crate::applicationlayer::{store, Event, NetworkController, NodeHost, VirtualNetworkConfig};
use crate::crypto::random::SalsaPrng;
use crate::deferred::{DeferredPackets, DeferredWirePacket};
use crate::identity::Identity;
use crate::inetaddress::InetAddress;
use crate::mac::Mac;
use crate::multicastgroup::MulticastGroup;
use crate::multicaster::Multicaster;
use crate::network::Network;
use crate::peer::PathStatus;
use crate::proto::*;
use crate::runtime::RuntimeEnvironment;
use crate::selfawareness::SelfAwareness;
use crate::switch::Switch;
use crate::topology::Topology;
use crate::world::World;

/// Public API result codes. Fatal codes mean the node is unusable and must
/// be torn down; codes at or above 1000 are ordinary call failures.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum ResultCode {
    Ok = 0,
    FatalOutOfMemory = 1,
    FatalDataStoreFailed = 2,
    FatalInternal = 3,
    NetworkNotFound = 1000,
    UnsupportedOperation = 1001,
    BadParameter = 1002,
}

impl ResultCode {
    pub fn is_fatal(self) -> bool {
        let v = self as u32;
        v > 0 && v < 1000
    }
}

/// Role of a peer in the overlay, as reported by status queries.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PeerRole {
    Leaf,
    Root,
}

#[derive(Clone, Debug)]
pub struct PeerStatus {
    pub address: Address,
    pub role: PeerRole,
    pub latency_ms: u32,
    pub version: Option<(u8, u8, u8, u16)>,
    pub paths: Vec<PathStatus>,
}

#[derive(Clone, Debug)]
pub struct NodeStatus {
    pub address: Address,
    pub world_id: u64,
    pub world_timestamp: i64,
    pub public_identity: String,
    pub secret_identity: String,
    pub online: bool,
}

struct BackgroundState {
    last_ping_check: i64,
    last_housekeeping: i64,
    last_multicast_announce: i64,
    online: bool,
}

/// The top-level node: owns the runtime environment and drives the
/// background scheduler.
///
/// All entry points are thread-safe and synchronous; the host owns every
/// thread, socket and timer, calling in with `now` from its own clock.
pub struct Node<App: NodeHost> {
    rt: Arc<RuntimeEnvironment<App>>,
    deferred: Arc<DeferredPackets>,
    background: Mutex<BackgroundState>,
    local_interface_addresses: Mutex<Vec<InetAddress>>,
}

impl<App: NodeHost> Node<App> {
    /// Bring up a node. The identity is loaded from the host's data store,
    /// or generated and persisted on first run.
    pub fn new(host: App, now: i64) -> Result<Self, ResultCode> {
        let identity = match host.data_store_get(store::IDENTITY_SECRET) {
            Some(blob) => match std::str::from_utf8(&blob).ok().and_then(|s| Identity::from_str(s.trim()).ok()) {
                Some(id) if id.has_private() => id,
                // Corrupt or public-only: start over with a fresh identity.
                _ => Self::generate_identity(&host)?,
            },
            None => Self::generate_identity(&host)?,
        };

        let rt = Arc::new(RuntimeEnvironment {
            host,
            identity,
            prng: SalsaPrng::new(),
            topology: Topology::new(),
            sw: Switch::new(),
            mc: Multicaster::new(),
            sa: SelfAwareness::new(),
            networks: RwLock::new(HashMap::new()),
            controller: RwLock::new(None),
        });
        rt.host.event(Event::Up);
        Ok(Self {
            rt,
            deferred: Arc::new(DeferredPackets::new()),
            background: Mutex::new(BackgroundState {
                // Zero timestamps make the first background call run
                // everything immediately, whatever `now` the host uses.
                last_ping_check: now.min(0),
                last_housekeeping: now.min(0),
                last_multicast_announce: now.min(0),
                online: false,
            }),
            local_interface_addresses: Mutex::new(Vec::new()),
        })
    }

    fn generate_identity(host: &App) -> Result<Identity, ResultCode> {
        let id = Identity::generate();
        let secret = id.to_string_with_private(true);
        let public = id.to_string_with_private(false);
        if !host.data_store_put(store::IDENTITY_SECRET, secret.as_bytes(), true)
            || !host.data_store_put(store::IDENTITY_PUBLIC, public.as_bytes(), false)
        {
            return Err(ResultCode::FatalDataStoreFailed);
        }
        Ok(id)
    }

    #[inline(always)]
    pub fn address(&self) -> Address {
        self.rt.address()
    }

    #[inline(always)]
    pub fn identity(&self) -> &Identity {
        &self.rt.identity
    }

    /// Install the initial signed root set. Later worlds arrive over the
    /// wire and are only accepted if the stored one vouches for them.
    pub fn set_world(&self, world: World) {
        self.rt.topology.set_world(&self.rt, world);
    }

    /// Co-host a network controller on this node.
    pub fn set_network_controller(&self, controller: Arc<dyn NetworkController>) {
        *self.rt.controller.write().unwrap() = Some(controller);
    }

    /* Data plane entry points */

    /// Feed a received UDP datagram into the engine.
    pub fn process_wire_packet(&self, now: i64, local: &InetAddress, remote: &InetAddress, data: &[u8]) -> ResultCode {
        if data.is_empty() || data.len() > PACKET_MAX_SIZE {
            return ResultCode::BadParameter;
        }
        if self.deferred.enabled() {
            let queued = self.deferred.enqueue(DeferredWirePacket {
                local: local.clone(),
                remote: remote.clone(),
                data: data.to_vec(),
            });
            if queued {
                return ResultCode::Ok;
            }
            // Queue full or racing a disable: fall through to inline.
        }
        self.rt.sw.on_remote_packet(&self.rt, local, remote, data, now);
        ResultCode::Ok
    }

    /// Feed an Ethernet frame from a virtual tap into the engine.
    #[allow(clippy::too_many_arguments)]
    pub fn process_virtual_network_frame(
        &self,
        now: i64,
        nwid: u64,
        source_mac: Mac,
        dest_mac: Mac,
        ethertype: u16,
        vlan_id: u16,
        data: &[u8],
    ) -> ResultCode {
        let Some(network) = self.rt.network(nwid) else {
            return ResultCode::NetworkNotFound;
        };
        self.rt.sw.on_local_ethernet(&self.rt, &network, source_mac, dest_mac, ethertype, vlan_id, data, now);
        ResultCode::Ok
    }

    /* Deferred packet workers */

    /// Enable or disable moving packet processing to worker threads.
    pub fn set_deferred_processing(&self, enabled: bool) {
        self.deferred.set_enabled(enabled);
    }

    /// Worker loop body: block for one deferred packet and process it.
    /// Returns false when the node is shutting down and the worker should
    /// exit.
    pub fn process_deferred_packets(&self, now: i64) -> bool {
        match self.deferred.wait_and_pop() {
            Some(p) => {
                self.rt.sw.on_remote_packet(&self.rt, &p.local, &p.remote, &p.data, now);
                true
            }
            None => false,
        }
    }

    /* Background scheduler */

    /// Run periodic tasks. Returns the time at which the host should call
    /// again (sooner calls are harmless).
    pub fn process_background_tasks(&self, now: i64) -> (ResultCode, i64) {
        let rt = &self.rt;
        let mut bg = self.background.lock().unwrap();

        let mut until_ping = PING_CHECK_INTERVAL - (now - bg.last_ping_check);
        if until_ping <= 0 {
            bg.last_ping_check = now;
            until_ping = PING_CHECK_INTERVAL;

            // Refresh network configs that are missing or stale, and gather
            // the relay set the configs declare.
            let mut relays: Vec<Address> = Vec::new();
            for nw in rt.networks_snapshot() {
                if !nw.has_config() || (now - nw.last_config_update()) >= NETWORK_AUTOCONF_DELAY {
                    nw.request_configuration(rt, now);
                }
                if let Some(cfg) = nw.config() {
                    relays.extend(cfg.relays());
                }
            }

            // Re-announce multicast subscriptions on their own cadence.
            if (now - bg.last_multicast_announce) >= MULTICAST_LIKE_INTERVAL {
                bg.last_multicast_announce = now;
                for nw in rt.networks_snapshot() {
                    nw.announce_multicast_groups(rt, now);
                }
            }

            // Ping what needs pinging.
            let mut last_upstream_receive: i64 = 0;
            rt.topology.each_peer(|peer| {
                let upstream = rt.topology.is_root_address(peer.address()) || relays.contains(&peer.address());
                if upstream {
                    last_upstream_receive = last_upstream_receive.max(peer.last_receive());
                    peer.do_ping_and_keepalive(rt, now);
                    if !peer.has_active_direct_path(now) {
                        // Fall back to the statically known endpoints.
                        for (addr, endpoints) in rt.topology.root_stable_endpoints() {
                            if addr == peer.address() {
                                for ep in endpoints {
                                    peer.send_hello(rt, &InetAddress::Nil, &ep, now, 0);
                                }
                            }
                        }
                    }
                } else if peer.recently_exchanged_frames(now) {
                    peer.do_ping_and_keepalive(rt, now);
                }
            });

            let online = rt.topology.am_root(rt)
                || (last_upstream_receive != 0 && (now - last_upstream_receive) < PEER_ACTIVITY_TIMEOUT);
            if online != bg.online {
                bg.online = online;
                rt.host.event(if online { Event::Online } else { Event::Offline });
            }
        }

        if (now - bg.last_housekeeping) >= HOUSEKEEPING_PERIOD {
            bg.last_housekeeping = now;
            rt.topology.clean(now);
            rt.mc.clean(now);
            rt.sa.clean(now);
            for nw in rt.networks_snapshot() {
                nw.clean(now);
            }
        }

        let switch_delay = rt.sw.do_timer_tasks(rt, now);
        let next = now + until_ping.min(switch_delay).max(TIMER_GRANULARITY);
        (ResultCode::Ok, next)
    }

    /* Network membership */

    pub fn join(&self, nwid: u64, now: i64) -> ResultCode {
        if nwid == 0 {
            return ResultCode::BadParameter;
        }
        // Construct outside the map lock: warm start may invoke host
        // callbacks, which must never run under an internal lock.
        let network = match self.rt.network(nwid) {
            Some(n) => n,
            None => {
                let fresh = Arc::new(Network::new(&self.rt, nwid, now));
                self.rt.networks.write().unwrap().entry(nwid).or_insert(fresh).clone()
            }
        };
        network.request_configuration(&self.rt, now);
        ResultCode::Ok
    }

    pub fn leave(&self, nwid: u64) -> ResultCode {
        let removed = self.rt.networks.write().unwrap().remove(&nwid);
        match removed {
            Some(network) => {
                network.set_down(&self.rt, true);
                ResultCode::Ok
            }
            None => ResultCode::NetworkNotFound,
        }
    }

    pub fn multicast_subscribe(&self, now: i64, nwid: u64, group_mac: Mac, adi: u32) -> ResultCode {
        match self.rt.network(nwid) {
            Some(network) => {
                network.multicast_subscribe(&self.rt, MulticastGroup::new(group_mac, adi), now);
                ResultCode::Ok
            }
            None => ResultCode::NetworkNotFound,
        }
    }

    pub fn multicast_unsubscribe(&self, nwid: u64, group_mac: Mac, adi: u32) -> ResultCode {
        match self.rt.network(nwid) {
            Some(network) => {
                network.multicast_unsubscribe(&MulticastGroup::new(group_mac, adi));
                ResultCode::Ok
            }
            None => ResultCode::NetworkNotFound,
        }
    }

    /* Physical configuration */

    pub fn add_local_interface_address(&self, addr: InetAddress) -> ResultCode {
        if addr.is_nil() {
            return ResultCode::BadParameter;
        }
        let mut v = self.local_interface_addresses.lock().unwrap();
        if !v.contains(&addr) {
            v.push(addr);
        }
        ResultCode::Ok
    }

    pub fn clear_local_interface_addresses(&self) {
        self.local_interface_addresses.lock().unwrap().clear();
    }

    pub fn local_interface_addresses(&self) -> Vec<InetAddress> {
        self.local_interface_addresses.lock().unwrap().clone()
    }

    /// Declare physical networks over which encryption/MAC may be elided.
    /// Both ends must agree on (CIDR, ID) pairs for this to take effect.
    pub fn set_trusted_paths(&self, paths: Vec<(InetAddress, u64)>) {
        self.rt.topology.set_trusted_paths(paths);
    }

    /* Status queries */

    pub fn status(&self, _now: i64) -> NodeStatus {
        let (world_id, world_timestamp) = self.rt.topology.world_id_timestamp();
        NodeStatus {
            address: self.rt.address(),
            world_id,
            world_timestamp,
            public_identity: self.rt.identity.to_string_with_private(false),
            secret_identity: self.rt.identity.to_string_with_private(true),
            online: self.background.lock().unwrap().online,
        }
    }

    pub fn peers(&self, now: i64) -> Vec<PeerStatus> {
        let mut out = Vec::new();
        self.rt.topology.each_peer(|peer| {
            out.push(PeerStatus {
                address: peer.address(),
                role: if self.rt.topology.is_root_address(peer.address()) { PeerRole::Root } else { PeerRole::Leaf },
                latency_ms: peer.latency(),
                version: peer.remote_version(),
                paths: peer.path_statuses(now),
            });
        });
        out.sort_by_key(|p| p.address);
        out
    }

    pub fn networks(&self) -> Vec<VirtualNetworkConfig> {
        let mut out: Vec<VirtualNetworkConfig> = self.rt.networks_snapshot().iter().map(|nw| nw.external_config()).collect();
        out.sort_by_key(|n| n.nwid);
        out
    }

    pub fn network_config(&self, nwid: u64) -> Option<VirtualNetworkConfig> {
        self.rt.network(nwid).map(|nw| nw.external_config())
    }

    /// Live fragment-reassembly slots. Diagnostic only.
    pub fn reassembly_in_flight(&self) -> usize {
        self.rt.sw.reassembly_in_flight()
    }
}

impl<App: NodeHost> Drop for Node<App> {
    fn drop(&mut self) {
        self.deferred.shutdown();
        self.rt.host.event(Event::Down);
    }
}
