/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */
use crate::inetaddress::InetAddress;
use crate::mac::Mac;

/// Node lifecycle and status events delivered through `NodeHost::event`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// The node is up and its identity is established.
    Up,
    /// No upstream peer has been heard from recently.
    Offline,
    /// At least one upstream peer is alive again.
    Online,
    /// The node is shutting down.
    Down,
    /// Another node out there holds our address with a different identity.
    /// Someone would have had to redo the hashcash search to forge this, but
    /// it can also mean a duplicated identity file. Fatal either way.
    IdentityCollision,
    /// Diagnostic trace; free-form, for logs only.
    Trace(String),
}

/// Operations on a network port, delivered through
/// `NodeHost::virtual_network_config`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VirtualNetworkConfigOperation {
    /// The network came up and its port should be created.
    Up,
    /// The config changed (IPs, routes, MTU...); the port should be synced.
    ConfigUpdate,
    /// The network is down (left or misconfigured); stop the port.
    Down,
    /// The network was destroyed; delete the port and all state.
    Destroy,
}

/// Completion states of a network's config state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VirtualNetworkStatus {
    RequestingConfiguration,
    Ok,
    AccessDenied,
    NotFound,
    PortError,
    ClientTooOld,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VirtualNetworkType {
    Private,
    Public,
}

/// Flat summary of a network handed to the host and returned from status
/// queries.
#[derive(Clone, Debug)]
pub struct VirtualNetworkConfig {
    pub nwid: u64,
    pub mac: Mac,
    pub name: String,
    pub status: VirtualNetworkStatus,
    pub network_type: VirtualNetworkType,
    pub mtu: u32,
    pub bridge: bool,
    pub broadcast_enabled: bool,
    pub netconf_revision: u64,
    pub assigned_addresses: Vec<InetAddress>,
    pub routes: Vec<VirtualNetworkRoute>,
}

/// A route pushed by the network operator. `via` nil means on-link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VirtualNetworkRoute {
    pub target: InetAddress,
    pub via: InetAddress,
    pub flags: u16,
    pub metric: u16,
}

/// Everything the engine needs from its host environment.
///
/// The engine does no I/O and never reads a clock; sockets, taps, storage
/// and time all come through this trait. Implementations must be
/// thread-safe: any entry point may invoke any of these from any thread.
///
/// Re-entrancy: these callbacks are always invoked with no internal lock
/// held, but they must NOT call back into methods of the same `Node`.
/// `virtual_network_config` in particular has historically deadlocked hosts
/// that tried.
pub trait NodeHost: Send + Sync {
    /// Send a UDP datagram. `local` may be nil, meaning any interface. A
    /// nonzero `ttl` asks for a reduced IP TTL on this one send (used for
    /// NAT hole punching). Return false if the send definitely failed.
    fn wire_send(&self, local: &InetAddress, remote: &InetAddress, data: &[u8], ttl: u32) -> bool;

    /// Deliver an Ethernet frame to a virtual network's tap.
    fn frame_deliver(&self, nwid: u64, source_mac: Mac, dest_mac: Mac, ethertype: u16, vlan_id: u16, data: &[u8]);

    /// A network port must be brought up, reconfigured, or torn down.
    /// Return 0 on success; any other value flags the port as broken.
    fn virtual_network_config(&self, nwid: u64, op: VirtualNetworkConfigOperation, config: &VirtualNetworkConfig) -> i32;

    /// Fetch an object from the flat key/value store. Keys are `/` separated
    /// paths, never containing `..` or `\`.
    fn data_store_get(&self, name: &str) -> Option<Vec<u8>>;

    /// Store an object. `secure` marks private key material that should get
    /// restrictive permissions. Empty `data` deletes the object.
    fn data_store_put(&self, name: &str, data: &[u8], secure: bool) -> bool;

    /// May packets be sent from `local` to `remote` at all? Lets hosts
    /// blacklist physical routes (e.g. to stop ZeroTier-over-ZeroTier).
    fn path_check(&self, local: &InetAddress, remote: &InetAddress) -> bool {
        let _ = (local, remote);
        true
    }

    /// Status and trace events.
    fn event(&self, event: Event);
}

impl<T: NodeHost + ?Sized> NodeHost for std::sync::Arc<T> {
    fn wire_send(&self, local: &InetAddress, remote: &InetAddress, data: &[u8], ttl: u32) -> bool {
        (**self).wire_send(local, remote, data, ttl)
    }

    fn frame_deliver(&self, nwid: u64, source_mac: Mac, dest_mac: Mac, ethertype: u16, vlan_id: u16, data: &[u8]) {
        (**self).frame_deliver(nwid, source_mac, dest_mac, ethertype, vlan_id, data)
    }

    fn virtual_network_config(&self, nwid: u64, op: VirtualNetworkConfigOperation, config: &VirtualNetworkConfig) -> i32 {
        (**self).virtual_network_config(nwid, op, config)
    }

    fn data_store_get(&self, name: &str) -> Option<Vec<u8>> {
        (**self).data_store_get(name)
    }

    fn data_store_put(&self, name: &str, data: &[u8], secure: bool) -> bool {
        (**self).data_store_put(name, data, secure)
    }

    fn path_check(&self, local: &InetAddress, remote: &InetAddress) -> bool {
        (**self).path_check(local, remote)
    }

    fn event(&self, event: Event) {
        (**self).event(event)
    }
}

/// Outcome of a controller config request.
pub enum NetworkControllerResult {
    /// The signed config dictionary blob to return to the member.
    Ok(Vec<u8>),
    AccessDenied,
    NotFound,
}

/// Narrow interface to a network controller co-hosted with this node.
///
/// Most nodes have none; config requests they receive are answered with
/// "unsupported operation". The controller proper (database, member
/// authorization, address assignment) lives outside the core.
pub trait NetworkController: Send + Sync {
    fn request_config(&self, member: &crate::identity::Identity, nwid: u64, have_revision: u64) -> NetworkControllerResult;
}

/// Keys in the host's key/value store.
pub mod store {
    pub const IDENTITY_PUBLIC: &str = "identity.public";
    pub const IDENTITY_SECRET: &str = "identity.secret";

    pub fn network_config(nwid: u64) -> String {
        format!("networks.d/{:016x}.conf", nwid)
    }

    pub fn peer(address: crate::address::Address) -> String {
        format!("peers.d/{}", address)
    }
}
