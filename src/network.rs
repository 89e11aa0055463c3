/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use crate::address::Address;
use crate::applicationlayer::{
    NodeHost, VirtualNetworkConfig, VirtualNetworkConfigOperation, VirtualNetworkStatus, VirtualNetworkType,
};
use crate::applicationlayer::store;
use crate::certificateofmembership::CertificateOfMembership;
use crate::dictionary::Dictionary;
use crate::error::{ParseError, PolicyError};
use crate::identity::Identity;
use crate::inetaddress::InetAddress;
use crate::mac::Mac;
use crate::multicastgroup::MulticastGroup;
use crate::networkconfig::{controller_for, evaluate_rules, NetworkConfig, RuleOutcome};
use crate::packet::{Packet, Verb};
use crate::proto::*;
use crate::runtime::RuntimeEnvironment;

/// Why a pushed membership certificate couldn't be accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComVerifyError {
    /// We don't know the controller's identity yet; retry after WHOIS.
    ControllerUnknown(Address),
    Invalid,
}

struct NetworkInner {
    config: Option<NetworkConfig>,
    status: VirtualNetworkStatus,
    last_config_update: i64,
    last_config_request: i64,
    port_initialized: bool,
    // Groups we are explicitly subscribed to; derived groups (broadcast,
    // ARP/NDP for our assigned IPs) are computed on the fly.
    my_multicast_groups: BTreeSet<MulticastGroup>,
    // Latest valid membership certificate per remote member.
    remote_coms: HashMap<Address, CertificateOfMembership>,
}

/// One joined virtual network: its configuration state machine, multicast
/// subscriptions, and the membership certificates of peers on it.
pub struct Network {
    nwid: u64,
    mac: Mac,
    inner: Mutex<NetworkInner>,
}

impl Network {
    /// Create in REQUESTING_CONFIGURATION state. If a previous config blob
    /// is in the data store it is applied immediately for warm start; the
    /// controller still gets asked for a fresh one.
    pub fn new<App: NodeHost>(rt: &RuntimeEnvironment<App>, nwid: u64, now: i64) -> Self {
        let nw = Self {
            nwid,
            mac: Mac::from_address(rt.address(), nwid),
            inner: Mutex::new(NetworkInner {
                config: None,
                status: VirtualNetworkStatus::RequestingConfiguration,
                last_config_update: 0,
                last_config_request: 0,
                port_initialized: false,
                my_multicast_groups: BTreeSet::new(),
                remote_coms: HashMap::new(),
            }),
        };
        if let Some(blob) = rt.host.data_store_get(&store::network_config(nwid)) {
            // Cached blob came from our own store; the wire-time checks
            // already vetted it, so the signature is not re-verified here.
            let d = Dictionary::from_bytes(&blob);
            let _ = nw.apply_config_dictionary(rt, &d, None, now);
        }
        nw
    }

    #[inline(always)]
    pub fn id(&self) -> u64 {
        self.nwid
    }

    /// The deterministic MAC of our virtual port on this network.
    #[inline(always)]
    pub fn mac(&self) -> Mac {
        self.mac
    }

    pub fn controller(&self) -> Address {
        controller_for(self.nwid)
    }

    pub fn status(&self) -> VirtualNetworkStatus {
        self.inner.lock().unwrap().status
    }

    pub fn has_config(&self) -> bool {
        self.inner.lock().unwrap().config.is_some()
    }

    pub fn config(&self) -> Option<NetworkConfig> {
        self.inner.lock().unwrap().config.clone()
    }

    pub fn last_config_update(&self) -> i64 {
        self.inner.lock().unwrap().last_config_update
    }

    pub fn multicast_limit(&self) -> u32 {
        self.inner
            .lock()
            .unwrap()
            .config
            .as_ref()
            .map(|c| c.multicast_limit)
            .unwrap_or(DEFAULT_MULTICAST_LIMIT)
    }

    /* Configuration state machine */

    /// Fire a NETWORK_CONFIG_REQUEST at the controller.
    pub fn request_configuration<App: NodeHost>(&self, rt: &RuntimeEnvironment<App>, now: i64) {
        let controller = self.controller();
        if controller == rt.address() {
            return; // we'd be asking ourselves
        }
        let have_revision = {
            let mut inner = self.inner.lock().unwrap();
            // Collapse request bursts; the controller answer or the next
            // scheduler pass will try again.
            if (now - inner.last_config_request) < 1_000 {
                return;
            }
            inner.last_config_request = now;
            inner.config.as_ref().map(|c| c.revision).unwrap_or(0)
        };
        let mut p = Packet::new(rt.prng.next_u64(), controller, rt.address(), Verb::NetworkConfigRequest);
        let meta: Dictionary<NETWORK_CONFIG_METADATA_DICT_CAPACITY> = Dictionary::new();
        let b = p.buf_mut();
        let ok = b.append_u64(self.nwid).is_ok()
            && b.append_u16(meta.size_bytes() as u16).is_ok()
            && b.append_bytes(meta.as_bytes()).is_ok()
            && b.append_u64(have_revision).is_ok();
        if ok {
            rt.sw.send(rt, p, true, now);
        }
    }

    /// Apply a config blob. `from_controller` carries the verified identity
    /// of the sender when the blob arrived on the wire; None means it came
    /// from our own cache.
    pub fn apply_config_dictionary<App: NodeHost>(
        &self,
        rt: &RuntimeEnvironment<App>,
        d: &Dictionary<NETWORK_CONFIG_DICT_CAPACITY>,
        from_controller: Option<&Identity>,
        now: i64,
    ) -> Result<(), ParseError> {
        if let Some(controller) = from_controller {
            if controller.address() != self.controller()
                || !NetworkConfig::verify_dictionary_signature(d, controller)
            {
                return Err(ParseError::InvalidNetworkConfig);
            }
        }
        let config = NetworkConfig::from_dictionary(d)?;
        if config.network_id != self.nwid || config.issued_to != rt.address() {
            return Err(ParseError::InvalidNetworkConfig);
        }

        let first = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(current) = inner.config.as_ref() {
                if config.revision <= current.revision {
                    return Ok(()); // stale or same; keep what we have
                }
            }
            let first = !inner.port_initialized;
            inner.config = Some(config);
            inner.status = VirtualNetworkStatus::Ok;
            inner.last_config_update = now;
            inner.port_initialized = true;
            first
        };

        if from_controller.is_some() {
            rt.host.data_store_put(&store::network_config(self.nwid), d.as_bytes(), false);
        }

        let op = if first { VirtualNetworkConfigOperation::Up } else { VirtualNetworkConfigOperation::ConfigUpdate };
        if rt.host.virtual_network_config(self.nwid, op, &self.external_config()) != 0 {
            self.inner.lock().unwrap().status = VirtualNetworkStatus::PortError;
        }

        self.announce_multicast_groups(rt, now);
        Ok(())
    }

    /// Record a terminal answer from the controller.
    pub fn set_not_found(&self) {
        self.inner.lock().unwrap().status = VirtualNetworkStatus::NotFound;
    }

    pub fn set_access_denied(&self) {
        self.inner.lock().unwrap().status = VirtualNetworkStatus::AccessDenied;
    }

    /// Tear down. With `destroy` the cached config is deleted too.
    pub fn set_down<App: NodeHost>(&self, rt: &RuntimeEnvironment<App>, destroy: bool) {
        let op = if destroy { VirtualNetworkConfigOperation::Destroy } else { VirtualNetworkConfigOperation::Down };
        rt.host.virtual_network_config(self.nwid, op, &self.external_config());
        if destroy {
            rt.host.data_store_put(&store::network_config(self.nwid), &[], false);
        }
    }

    /* Multicast subscriptions */

    pub fn multicast_subscribe<App: NodeHost>(&self, rt: &RuntimeEnvironment<App>, group: MulticastGroup, now: i64) {
        let added = self.inner.lock().unwrap().my_multicast_groups.insert(group);
        if added {
            self.announce_multicast_groups(rt, now);
        }
    }

    pub fn multicast_unsubscribe(&self, group: &MulticastGroup) {
        self.inner.lock().unwrap().my_multicast_groups.remove(group);
    }

    /// All groups this node should receive: explicit subscriptions plus
    /// broadcast and the ARP/NDP groups derived from our assigned IPs.
    pub fn all_multicast_groups(&self) -> Vec<MulticastGroup> {
        let inner = self.inner.lock().unwrap();
        let mut groups: BTreeSet<MulticastGroup> = inner.my_multicast_groups.clone();
        if inner.config.as_ref().map(|c| c.broadcast_enabled).unwrap_or(true) {
            groups.insert(MulticastGroup::new(Mac::from_u64(0xffff_ffff_ffff), 0));
        }
        if let Some(cfg) = inner.config.as_ref() {
            for ip in &cfg.static_ips {
                if let Some(g) = MulticastGroup::derive_for_address_resolution(ip) {
                    groups.insert(g);
                }
            }
        }
        groups.into_iter().collect()
    }

    pub fn subscribed_to(&self, group: &MulticastGroup) -> bool {
        self.all_multicast_groups().contains(group)
    }

    /// Push LIKEs for everything we're subscribed to at the best root and
    /// the controller. Called on change and on the periodic tick.
    pub fn announce_multicast_groups<App: NodeHost>(&self, rt: &RuntimeEnvironment<App>, now: i64) {
        let groups = self.all_multicast_groups();
        if groups.is_empty() {
            return;
        }
        let mut destinations: Vec<Address> = Vec::with_capacity(2);
        if let Some(root) = rt.topology.best_root(now) {
            destinations.push(root.address());
        }
        let controller = self.controller();
        if controller != rt.address() && !destinations.contains(&controller) {
            destinations.push(controller);
        }
        for dest in destinations {
            let mut p = Packet::new(rt.prng.next_u64(), dest, rt.address(), Verb::MulticastLike);
            let mut wrote = false;
            for g in &groups {
                let b = p.buf_mut();
                let mark = b.len();
                if b.append_u64(self.nwid).is_err() || g.mac().marshal(b).is_err() || b.append_u32(g.adi()).is_err() {
                    b.truncate(mark); // drop any half-written record
                    break;
                }
                wrote = true;
            }
            if wrote {
                rt.sw.send(rt, p, true, now);
            }
        }
    }

    /* Membership certificates */

    /// Store a peer's membership certificate after validating it. The
    /// signature is checked against the controller's identity; when that is
    /// not yet known the caller should park the packet and retry once WHOIS
    /// answers.
    pub fn add_membership_certificate(
        &self,
        controller_identity: Option<&Identity>,
        com: CertificateOfMembership,
    ) -> Result<(), ComVerifyError> {
        if com.network_id() != self.nwid || com.issued_to().is_nil() {
            return Err(ComVerifyError::Invalid);
        }
        let Some(controller_id) = controller_identity else {
            return Err(ComVerifyError::ControllerUnknown(self.controller()));
        };
        if controller_id.address() != self.controller() || !com.verify(controller_id) {
            return Err(ComVerifyError::Invalid);
        }
        let member = com.issued_to();
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.remote_coms.entry(member).or_insert_with(|| com.clone());
        if com.timestamp() >= entry.timestamp() {
            *entry = com;
        }
        Ok(())
    }

    /// Has this member shown us a valid certificate for this network?
    pub fn knows_member(&self, addr: Address) -> bool {
        self.inner.lock().unwrap().remote_coms.contains_key(&addr)
    }

    /// Gate for frame exchange with a peer on this network.
    ///
    /// Public networks admit everyone. Private networks require our own
    /// certificate and one from the peer, and ours must agree with theirs.
    pub fn may_communicate_with(&self, member: Address) -> Result<(), PolicyError> {
        let inner = self.inner.lock().unwrap();
        let Some(cfg) = inner.config.as_ref() else {
            return Err(PolicyError::NetworkAccessDenied);
        };
        if !cfg.private {
            return Ok(());
        }
        let Some(ours) = cfg.com.as_ref() else {
            return Err(PolicyError::NetworkAccessDenied);
        };
        let Some(theirs) = inner.remote_coms.get(&member) else {
            return Err(PolicyError::NetworkAccessDenied);
        };
        if ours.agrees_with(theirs) {
            Ok(())
        } else {
            Err(PolicyError::ComDisagreement)
        }
    }

    /// Apply this network's rule set to a frame.
    pub fn filter_frame(&self, ethertype: u16) -> Result<(), PolicyError> {
        let inner = self.inner.lock().unwrap();
        let Some(cfg) = inner.config.as_ref() else {
            return Err(PolicyError::NetworkAccessDenied);
        };
        if cfg.rules.is_empty() {
            // No rules pushed means the network accepts everything.
            return Ok(());
        }
        match evaluate_rules(&cfg.rules, ethertype) {
            RuleOutcome::Accept => Ok(()),
            RuleOutcome::Drop => Err(PolicyError::RuleDropped),
        }
    }

    /// Expire remote certificates that no longer agree with ours by age.
    pub fn clean(&self, _now: i64) {
        let mut inner = self.inner.lock().unwrap();
        let ours = inner.config.as_ref().and_then(|c| c.com.clone());
        if let Some(ours) = ours {
            inner.remote_coms.retain(|_, theirs| ours.agrees_with(theirs));
        }
    }

    /// The flat record handed to the host and to status queries.
    pub fn external_config(&self) -> VirtualNetworkConfig {
        let inner = self.inner.lock().unwrap();
        let cfg = inner.config.as_ref();
        VirtualNetworkConfig {
            nwid: self.nwid,
            mac: self.mac,
            name: cfg.map(|c| c.name.clone()).unwrap_or_default(),
            status: inner.status,
            network_type: if cfg.map(|c| c.private).unwrap_or(true) {
                VirtualNetworkType::Private
            } else {
                VirtualNetworkType::Public
            },
            mtu: cfg.map(|c| c.mtu).unwrap_or(crate::networkconfig::DEFAULT_MTU),
            bridge: false,
            broadcast_enabled: cfg.map(|c| c.broadcast_enabled).unwrap_or(false),
            netconf_revision: cfg.map(|c| c.revision).unwrap_or(0),
            assigned_addresses: cfg.map(|c| c.static_ips.clone()).unwrap_or_default(),
            routes: cfg.map(|c| c.routes.clone()).unwrap_or_default(),
        }
    }

    /// Our MAC on this network belongs to `addr`; any member can compute it.
    pub fn mac_for_member(&self, addr: Address) -> Mac {
        Mac::from_address(addr, self.nwid)
    }

    /// Find which member owns a unicast MAC on this network.
    pub fn member_for_mac(&self, mac: Mac) -> Address {
        mac.to_address(self.nwid)
    }

    /// An IP assigned to us on this network (used for ARP group checks).
    pub fn has_static_ip(&self, ip: &InetAddress) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .config
            .as_ref()
            .map(|c| c.static_ips.iter().any(|a| a.ip() == ip.ip()))
            .unwrap_or(false)
    }

    /// Our COM for attaching to outbound frames, if this is a private
    /// network and we hold one.
    pub fn our_membership_certificate(&self) -> Option<CertificateOfMembership> {
        let inner = self.inner.lock().unwrap();
        inner.config.as_ref().filter(|c| c.private).and_then(|c| c.com.clone())
    }
}
