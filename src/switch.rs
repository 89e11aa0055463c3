/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::address::Address;
use crate::applicationlayer::NodeHost;
use crate::incoming;
use crate::mac::Mac;
use crate::multicastgroup::MulticastGroup;
use crate::network::Network;
use crate::packet::{assemble, Fragment, Packet, Verb};
use crate::peer::Peer;
use crate::proto::*;
use crate::runtime::RuntimeEnvironment;

struct ReassemblyEntry {
    timestamp: i64, // 0 = unused
    packet_id: u64,
    head: Option<Packet>,
    frags: Vec<Option<Fragment>>,
    total: usize, // 0 = not yet known
    have: usize,
}

impl ReassemblyEntry {
    fn empty() -> Self {
        Self { timestamp: 0, packet_id: 0, head: None, frags: Vec::new(), total: 0, have: 0 }
    }

    fn complete(&self) -> bool {
        self.total != 0 && self.head.is_some() && self.have == self.total
    }
}

struct RxQueueEntry {
    timestamp: i64,
    waiting_for: Address,
    // Armored when the missing peer is the packet's own source; already
    // authenticated when a handler parked it waiting for a third party
    // (e.g. the controller identity needed to verify a certificate).
    authenticated: bool,
    packet: Packet,
    local: crate::inetaddress::InetAddress,
    remote: crate::inetaddress::InetAddress,
}

struct TxQueueEntry {
    timestamp: i64,
    packet: Packet, // not yet armored
    encrypt: bool,
}

struct WhoisRequest {
    last_sent: i64,
    retries: u32,
}

struct ContactQueueEntry {
    peer: Arc<Peer>,
    local: crate::inetaddress::InetAddress,
    remote: crate::inetaddress::InetAddress,
    started: i64,
    next_iteration: usize,
}

/// The distributed Ethernet switch core.
///
/// This is where everything meets: transport packets come in here, as do
/// Ethernet frames from virtual taps, and this sends them where they need
/// to go, wrapping and unwrapping accordingly. It also owns the queues of
/// things waiting on missing information (fragments, WHOIS answers) and the
/// NAT-traversal contact queue.
pub struct Switch {
    reassembly: Mutex<Vec<ReassemblyEntry>>,
    rx_queue: Mutex<Vec<RxQueueEntry>>,
    tx_queue: Mutex<Vec<TxQueueEntry>>,
    outstanding_whois: Mutex<HashMap<Address, WhoisRequest>>,
    last_unite: Mutex<HashMap<(u64, u64), i64>>,
    contact_queue: Mutex<Vec<ContactQueueEntry>>,
}

impl Switch {
    pub fn new() -> Self {
        Self {
            reassembly: Mutex::new((0..REASSEMBLY_TABLE_SIZE).map(|_| ReassemblyEntry::empty()).collect()),
            rx_queue: Mutex::new(Vec::new()),
            tx_queue: Mutex::new(Vec::new()),
            outstanding_whois: Mutex::new(HashMap::new()),
            last_unite: Mutex::new(HashMap::new()),
            contact_queue: Mutex::new(Vec::new()),
        }
    }

    /* Wire ingress */

    /// Entry point for raw UDP payloads from the real network.
    pub fn on_remote_packet<App: NodeHost>(
        &self,
        rt: &RuntimeEnvironment<App>,
        local: &crate::inetaddress::InetAddress,
        remote: &crate::inetaddress::InetAddress,
        data: &[u8],
        now: i64,
    ) {
        if data.len() < FRAGMENT_HEADER_SIZE {
            return;
        }
        if Fragment::is_fragment(data) {
            let Ok(frag) = Fragment::from_wire(data) else {
                return;
            };
            if frag.destination() != rt.address() {
                self.relay_fragment(rt, frag, now);
                return;
            }
            if let Some(whole) = self.reassemble_fragment(None, Some(frag), now) {
                self.on_packet_ready(rt, whole, local, remote, now);
            }
        } else {
            let Ok(packet) = Packet::from_wire(data) else {
                return;
            };
            if packet.destination() != rt.address() && !packet.source().is_reserved() {
                self.relay_packet(rt, packet, now);
                return;
            }
            if packet.fragmented() {
                if let Some(whole) = self.reassemble_fragment(Some(packet), None, now) {
                    self.on_packet_ready(rt, whole, local, remote, now);
                }
            } else {
                self.on_packet_ready(rt, packet, local, remote, now);
            }
        }
    }

    /// Insert the head packet or a later fragment into the reassembly table,
    /// returning the whole packet when it completes. The table is a ring:
    /// a new packet ID claims the matching live entry or the oldest slot.
    fn reassemble_fragment(&self, head: Option<Packet>, frag: Option<Fragment>, now: i64) -> Option<Packet> {
        let packet_id = head.as_ref().map(|p| p.packet_id()).or_else(|| frag.as_ref().map(|f| f.packet_id()))?;
        let mut table = self.reassembly.lock().unwrap();

        let mut idx = None;
        let mut oldest = 0usize;
        let mut oldest_ts = i64::MAX;
        for i in 0..table.len() {
            if table[i].timestamp != 0 && (now - table[i].timestamp) >= FRAGMENT_REASSEMBLY_TTL {
                table[i] = ReassemblyEntry::empty();
            }
            if table[i].timestamp != 0 && table[i].packet_id == packet_id {
                idx = Some(i);
                break;
            }
            // Empty slots carry timestamp 0 and therefore win "oldest".
            if table[i].timestamp < oldest_ts {
                oldest_ts = table[i].timestamp;
                oldest = i;
            }
        }
        let e = match idx {
            Some(i) => &mut table[i],
            None => {
                let e = &mut table[oldest];
                *e = ReassemblyEntry::empty();
                e.timestamp = now;
                e.packet_id = packet_id;
                e
            }
        };

        if let Some(p) = head {
            if e.head.is_none() {
                e.head = Some(p);
                e.have += 1;
            }
        }
        if let Some(f) = frag {
            let total = f.total_fragments() as usize;
            let no = f.fragment_no() as usize;
            if total < 2 || total > MAX_FRAGMENTS || no == 0 || no >= total {
                return None;
            }
            if e.total == 0 {
                e.total = total;
                e.frags.resize(total - 1, None);
            }
            if e.total != total {
                return None;
            }
            if e.frags[no - 1].is_none() {
                e.frags[no - 1] = Some(f);
                e.have += 1;
            }
        }

        if e.complete() {
            let whole = assemble(e.head.as_ref().unwrap(), &e.frags).ok();
            *e = ReassemblyEntry::empty();
            whole
        } else {
            None
        }
    }

    fn relay_packet<App: NodeHost>(&self, rt: &RuntimeEnvironment<App>, mut packet: Packet, now: i64) {
        if !packet.increment_hops() {
            return;
        }
        let dest = packet.destination();
        if let Some(peer) = rt.topology.get_peer(dest) {
            if let Some((local, remote)) = peer.best_path(now) {
                peer.mark_path_sent(&local, &remote, now);
                rt.host.wire_send(&local, &remote, packet.buf().as_bytes(), 0);
                // Both endpoints flow through us: hint them at each other so
                // they can go direct. Only for pairs we can place on a
                // common network; RENDEZVOUS for strangers would make every
                // relay a traffic-steering oracle.
                if self.peers_share_network(rt, packet.source(), dest) {
                    self.unite(rt, packet.source(), dest, now);
                }
            }
        }
    }

    /// Do we hold evidence that two peers are members of the same network?
    /// Either their subscription gossip meets on one network ID, or both
    /// have shown membership certificates for a network we joined.
    fn peers_share_network<App: NodeHost>(&self, rt: &RuntimeEnvironment<App>, a: Address, b: Address) -> bool {
        rt.mc.have_common_network(a, b)
            || rt
                .networks_snapshot()
                .iter()
                .any(|nw| nw.knows_member(a) && nw.knows_member(b))
    }

    fn relay_fragment<App: NodeHost>(&self, rt: &RuntimeEnvironment<App>, mut frag: Fragment, now: i64) {
        if !frag.increment_hops() {
            return;
        }
        if let Some(peer) = rt.topology.get_peer(frag.destination()) {
            if let Some((local, remote)) = peer.best_path(now) {
                peer.mark_path_sent(&local, &remote, now);
                rt.host.wire_send(&local, &remote, frag.as_bytes(), 0);
            }
        }
    }

    /// A whole packet addressed to us: authenticate and dispatch, or park it
    /// until WHOIS tells us who the sender is.
    fn on_packet_ready<App: NodeHost>(
        &self,
        rt: &RuntimeEnvironment<App>,
        mut packet: Packet,
        local: &crate::inetaddress::InetAddress,
        remote: &crate::inetaddress::InetAddress,
        now: i64,
    ) {
        let source = packet.source();
        if source == rt.address() || source.is_reserved() {
            return;
        }

        // Trusted physical paths skip crypto entirely.
        if packet.cipher() == CIPHER_SUITE_TRUSTED_PATH {
            if rt.topology.inbound_trusted_path_ok(remote, packet.trusted_path_id()) {
                if let Some(peer) = rt.topology.get_peer(source) {
                    if packet.uncompress().is_ok() {
                        incoming::dispatch(rt, self, &peer, packet, local, remote, now);
                    }
                }
            }
            return;
        }

        // HELLO authenticates itself: identity rides in the plaintext
        // payload, so it gets its own path before any peer lookup.
        if packet.cipher() == CIPHER_SUITE_POLY1305_NONE && packet.verb() == Some(Verb::Hello) {
            incoming::handle_hello(rt, self, packet, local, remote, now);
            return;
        }

        match rt.topology.get_peer(source) {
            Some(peer) => {
                if let Err(fault) = packet.dearmor(peer.key()) {
                    rt.trace(format!("dropped packet {:016x} from {}: {:?}", packet.packet_id(), source, fault));
                    return;
                }
                if !peer.expect_packet_id(packet.packet_id()) {
                    rt.trace(format!("dropped replayed packet {:016x} from {}", packet.packet_id(), source));
                    return;
                }
                if packet.uncompress().is_err() {
                    return;
                }
                incoming::dispatch(rt, self, &peer, packet, local, remote, now);
            }
            None => {
                self.queue_rx(rt, packet, source, local, remote, now);
            }
        }
    }

    /// Park an undecryptable packet until the sender's identity arrives.
    pub(crate) fn queue_rx<App: NodeHost>(
        &self,
        rt: &RuntimeEnvironment<App>,
        packet: Packet,
        waiting_for: Address,
        local: &crate::inetaddress::InetAddress,
        remote: &crate::inetaddress::InetAddress,
        now: i64,
    ) {
        {
            let mut q = self.rx_queue.lock().unwrap();
            q.retain(|e| (now - e.timestamp) < RX_TX_QUEUE_TTL);
            if q.len() >= RX_QUEUE_SIZE {
                q.remove(0);
            }
            q.push(RxQueueEntry {
                timestamp: now,
                waiting_for,
                authenticated: false,
                packet,
                local: local.clone(),
                remote: remote.clone(),
            });
        }
        self.request_whois(rt, waiting_for, now);
    }

    /// Park an already authenticated packet until some third party's
    /// identity (usually a controller's) becomes known.
    pub(crate) fn queue_rx_decrypted<App: NodeHost>(
        &self,
        rt: &RuntimeEnvironment<App>,
        packet: Packet,
        waiting_for: Address,
        local: &crate::inetaddress::InetAddress,
        remote: &crate::inetaddress::InetAddress,
        now: i64,
    ) {
        {
            let mut q = self.rx_queue.lock().unwrap();
            q.retain(|e| (now - e.timestamp) < RX_TX_QUEUE_TTL);
            if q.len() >= RX_QUEUE_SIZE {
                q.remove(0);
            }
            q.push(RxQueueEntry {
                timestamp: now,
                waiting_for,
                authenticated: true,
                packet,
                local: local.clone(),
                remote: remote.clone(),
            });
        }
        self.request_whois(rt, waiting_for, now);
    }

    /* WHOIS */

    /// Ask the best root who an address is, rate limited per address.
    pub fn request_whois<App: NodeHost>(&self, rt: &RuntimeEnvironment<App>, address: Address, now: i64) {
        if address == rt.address() || address.is_reserved() {
            return;
        }
        {
            let mut w = self.outstanding_whois.lock().unwrap();
            match w.get_mut(&address) {
                Some(req) => {
                    if (now - req.last_sent) < WHOIS_RETRY_DELAY {
                        return;
                    }
                    req.last_sent = now;
                    req.retries += 1;
                    if req.retries > MAX_WHOIS_RETRIES {
                        w.remove(&address);
                        return;
                    }
                }
                None => {
                    if w.len() >= MAX_OUTSTANDING_WHOIS {
                        return;
                    }
                    w.insert(address, WhoisRequest { last_sent: now, retries: 0 });
                }
            }
        }
        if let Some(root) = rt.topology.best_root(now) {
            let mut p = Packet::new(rt.prng.next_u64(), root.address(), rt.address(), Verb::Whois);
            if p.buf_mut().append_bytes(&address.to_bytes()).is_ok() {
                self.try_send(rt, &p, true, now);
            }
        }
    }

    /// A peer's identity just became known: drain everything parked on it.
    pub fn do_anything_waiting_for_peer<App: NodeHost>(&self, rt: &RuntimeEnvironment<App>, peer: &Arc<Peer>, now: i64) {
        self.outstanding_whois.lock().unwrap().remove(&peer.address());

        let rx: Vec<RxQueueEntry> = {
            let mut q = self.rx_queue.lock().unwrap();
            let (take, keep): (Vec<RxQueueEntry>, Vec<RxQueueEntry>) =
                q.drain(..).partition(|e| e.waiting_for == peer.address());
            *q = keep;
            take
        };
        for mut e in rx {
            if e.authenticated {
                // Parked post-auth; re-dispatch on behalf of its own source.
                if let Some(src) = rt.topology.get_peer(e.packet.source()) {
                    incoming::dispatch(rt, self, &src, e.packet, &e.local, &e.remote, now);
                }
            } else if e.packet.dearmor(peer.key()).is_ok()
                && peer.expect_packet_id(e.packet.packet_id())
                && e.packet.uncompress().is_ok()
            {
                incoming::dispatch(rt, self, peer, e.packet, &e.local, &e.remote, now);
            }
        }

        let tx: Vec<TxQueueEntry> = {
            let mut q = self.tx_queue.lock().unwrap();
            let (take, keep): (Vec<TxQueueEntry>, Vec<TxQueueEntry>) =
                q.drain(..).partition(|e| e.packet.destination() == peer.address());
            *q = keep;
            take
        };
        for e in tx {
            self.try_send(rt, &e.packet, e.encrypt, now);
        }
    }

    /* Outbound */

    /// Send a fully composed (but unarmored) packet to its destination,
    /// queueing it behind a WHOIS if the destination is unknown.
    pub fn send<App: NodeHost>(&self, rt: &RuntimeEnvironment<App>, packet: Packet, encrypt: bool, now: i64) {
        if packet.destination() == rt.address() {
            return;
        }
        if rt.topology.get_peer(packet.destination()).is_none() {
            let dest = packet.destination();
            {
                let mut q = self.tx_queue.lock().unwrap();
                q.retain(|e| (now - e.timestamp) < RX_TX_QUEUE_TTL);
                if q.len() >= TX_QUEUE_SIZE {
                    q.remove(0);
                }
                q.push(TxQueueEntry { timestamp: now, packet, encrypt });
            }
            self.request_whois(rt, dest, now);
            return;
        }
        if !self.try_send(rt, &packet, encrypt, now) {
            // Known peer but nowhere to send (no path, no root). Park it;
            // timer retries may find a path.
            let mut q = self.tx_queue.lock().unwrap();
            if q.len() < TX_QUEUE_SIZE {
                q.push(TxQueueEntry { timestamp: now, packet, encrypt });
            }
        }
    }

    /// Armor and transmit. Direct if a path exists, otherwise end-to-end
    /// encrypted through the best root. False if there's nowhere to send.
    fn try_send<App: NodeHost>(&self, rt: &RuntimeEnvironment<App>, packet: &Packet, encrypt: bool, now: i64) -> bool {
        let dest = packet.destination();
        let Some(peer) = rt.topology.get_peer(dest) else {
            return false;
        };

        let (via_peer, local, remote) = match peer.best_path(now) {
            Some((l, r)) => (peer.clone(), l, r),
            None => {
                let Some(root) = rt.topology.best_root(now).filter(|r| r.address() != dest) else {
                    return false;
                };
                match root.best_path(now) {
                    Some((l, r)) => (root, l, r),
                    None => return false,
                }
            }
        };
        if !rt.host.path_check(&local, &remote) {
            return false;
        }

        let direct = via_peer.address() == dest;
        let mut p = packet.clone();
        let tpid = if direct { rt.topology.outbound_trusted_path_id(&remote) } else { 0 };
        if tpid != 0 {
            p.set_trusted_path(tpid);
        } else {
            // Armored with the destination's key even when relayed; the
            // relay moves bytes it cannot read.
            p.armor(peer.key(), encrypt);
        }

        via_peer.mark_path_sent(&local, &remote, now);
        match p.fragment(UDP_DEFAULT_PAYLOAD_MTU) {
            Some((head, frags)) => {
                let mut ok = rt.host.wire_send(&local, &remote, head.buf().as_bytes(), 0);
                for f in frags {
                    ok &= rt.host.wire_send(&local, &remote, f.as_bytes(), 0);
                }
                ok
            }
            None => rt.host.wire_send(&local, &remote, p.buf().as_bytes(), 0),
        }
    }

    /* Tap-frame ingress (VL2) */

    /// An Ethernet frame from a local tap enters the virtual switch.
    #[allow(clippy::too_many_arguments)]
    pub fn on_local_ethernet<App: NodeHost>(
        &self,
        rt: &RuntimeEnvironment<App>,
        network: &Arc<Network>,
        from: Mac,
        to: Mac,
        ethertype: u16,
        vlan_id: u16,
        data: &[u8],
        now: i64,
    ) {
        let nwid = network.id();
        let bridging = network.config().map(|c| c.allow_passive_bridging).unwrap_or(false);
        if from != network.mac() && !bridging {
            rt.trace(format!("dropped frame on {:016x}: source MAC {} is not our port", nwid, from));
            return;
        }
        if let Err(e) = network.filter_frame(ethertype) {
            rt.trace(format!("dropped frame on {:016x}: {}", nwid, e));
            return;
        }
        let _ = vlan_id; // rules don't evaluate VLANs in this version

        if to.is_multicast() {
            let group = if to.is_broadcast() && ethertype == 0x0806 && data.len() >= 28 {
                // IPv4 ARP: scope the broadcast by the queried address so it
                // only reaches the member that owns it (plus gossip overlap).
                let target_ip: [u8; 4] = data[24..28].try_into().unwrap();
                MulticastGroup::new(to, u32::from_be_bytes(target_ip))
            } else {
                MulticastGroup::new(to, 0)
            };
            let com = network.our_membership_certificate();
            let bridges = network.config().map(|c| c.active_bridges()).unwrap_or_default();
            rt.mc.send(
                rt,
                com.as_ref(),
                network.multicast_limit() as usize,
                now,
                nwid,
                &bridges,
                group,
                from,
                ethertype,
                data,
            );
            return;
        }

        let member = network.member_for_mac(to);
        if !member.is_reserved() && member != rt.address() {
            if let Some(mut p) = self.ext_frame_packet(rt, network, member, to, from, ethertype, data, now) {
                p.compress();
                self.send(rt, p, true, now);
            }
            return;
        }

        // Unknown destination MAC: flood to active bridges, if any.
        if bridging || !network.config().map(|c| c.active_bridges().is_empty()).unwrap_or(true) {
            let bridges = network.config().map(|c| c.active_bridges()).unwrap_or_default();
            for bridge in bridges {
                if bridge != rt.address() {
                    if let Some(mut p) = self.ext_frame_packet(rt, network, bridge, to, from, ethertype, data, now) {
                        p.compress();
                        self.send(rt, p, true, now);
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn ext_frame_packet<App: NodeHost>(
        &self,
        rt: &RuntimeEnvironment<App>,
        network: &Arc<Network>,
        dest: Address,
        to: Mac,
        from: Mac,
        ethertype: u16,
        data: &[u8],
        now: i64,
    ) -> Option<Packet> {
        let com = network.our_membership_certificate().filter(|_| {
            rt.topology
                .get_peer(dest)
                .map(|p| p.needs_our_network_membership_certificate(network.id(), now, true))
                .unwrap_or(true)
        });
        let mut p = Packet::new(rt.prng.next_u64(), dest, rt.address(), Verb::ExtFrame);
        let b = p.buf_mut();
        b.append_u64(network.id()).ok()?;
        b.append_u8(if com.is_some() { 0x01 } else { 0x00 }).ok()?;
        if let Some(com) = com {
            com.marshal(b).ok()?;
        }
        to.marshal(b).ok()?;
        from.marshal(b).ok()?;
        b.append_u16(ethertype).ok()?;
        b.append_bytes(data).ok()?;
        Some(p)
    }

    /* NAT traversal */

    /// As a relay seeing traffic both ways, hint two peers at each other's
    /// external addresses so they can open a direct path. Rate limited per
    /// unordered pair.
    pub fn unite<App: NodeHost>(&self, rt: &RuntimeEnvironment<App>, p1: Address, p2: Address, now: i64) -> bool {
        if p1 == p2 || p1 == rt.address() || p2 == rt.address() {
            return false;
        }
        let key = if p1 < p2 { (p1.to_u64(), p2.to_u64()) } else { (p2.to_u64(), p1.to_u64()) };
        {
            let mut lu = self.last_unite.lock().unwrap();
            let last = lu.get(&key).copied().unwrap_or(0);
            if (now - last) < UNITE_MIN_INTERVAL {
                return false;
            }
            lu.insert(key, now);
        }
        let (Some(peer1), Some(peer2)) = (rt.topology.get_peer(p1), rt.topology.get_peer(p2)) else {
            return false;
        };
        let (Some((_, addr1)), Some((_, addr2))) = (peer1.best_path(now), peer2.best_path(now)) else {
            return false;
        };

        for (to, other, other_addr) in [(p1, p2, &addr2), (p2, p1, &addr1)] {
            let mut p = Packet::new(rt.prng.next_u64(), to, rt.address(), Verb::Rendezvous);
            let b = p.buf_mut();
            let raw: Vec<u8> = match other_addr {
                crate::inetaddress::InetAddress::V4(ip, _) => ip.octets().to_vec(),
                crate::inetaddress::InetAddress::V6(ip, _) => ip.octets().to_vec(),
                crate::inetaddress::InetAddress::Nil => continue,
            };
            let ok = b.append_u8(0).is_ok()
                && b.append_bytes(&other.to_bytes()).is_ok()
                && b.append_u16(other_addr.port()).is_ok()
                && b.append_u8(raw.len() as u8).is_ok()
                && b.append_bytes(&raw).is_ok();
            if ok {
                self.try_send(rt, &p, true, now);
            }
        }
        true
    }

    /// Begin the probe sequence toward a hinted address: one HELLO now, the
    /// rest on the timer at the standard offsets, abandoning after the last.
    pub fn rendezvous<App: NodeHost>(
        &self,
        rt: &RuntimeEnvironment<App>,
        peer: Arc<Peer>,
        local: &crate::inetaddress::InetAddress,
        at_addr: &crate::inetaddress::InetAddress,
        now: i64,
    ) {
        peer.send_hello(rt, local, at_addr, now, 0);
        let mut q = self.contact_queue.lock().unwrap();
        if q.len() < CONTACT_QUEUE_SIZE {
            q.push(ContactQueueEntry {
                peer,
                local: local.clone(),
                remote: at_addr.clone(),
                started: now,
                next_iteration: 1,
            });
        }
    }

    /* Timers */

    /// Retries and expiries. Returns milliseconds until it wants to run
    /// again.
    pub fn do_timer_tasks<App: NodeHost>(&self, rt: &RuntimeEnvironment<App>, now: i64) -> i64 {
        let mut next_delay: i64 = 60_000;

        // NAT traversal probes.
        let due: Vec<(Arc<Peer>, crate::inetaddress::InetAddress, crate::inetaddress::InetAddress)> = {
            let mut q = self.contact_queue.lock().unwrap();
            let mut fired = Vec::new();
            q.retain_mut(|e| {
                if e.peer.has_active_direct_path(now) || e.next_iteration >= CONTACT_PROBE_SCHEDULE.len() {
                    return false;
                }
                let fire_at = e.started + CONTACT_PROBE_SCHEDULE[e.next_iteration];
                if now >= fire_at {
                    fired.push((e.peer.clone(), e.local.clone(), e.remote.clone()));
                    e.next_iteration += 1;
                    if e.next_iteration >= CONTACT_PROBE_SCHEDULE.len() {
                        return false;
                    }
                }
                next_delay = next_delay.min((e.started + CONTACT_PROBE_SCHEDULE[e.next_iteration] - now).max(1));
                true
            });
            fired
        };
        for (peer, local, remote) in due {
            peer.send_hello(rt, &local, &remote, now, 0);
        }

        // WHOIS retries.
        let retry: Vec<Address> = {
            let mut w = self.outstanding_whois.lock().unwrap();
            w.retain(|_, req| req.retries <= MAX_WHOIS_RETRIES);
            let mut retry = Vec::new();
            for (addr, req) in w.iter() {
                if (now - req.last_sent) >= WHOIS_RETRY_DELAY {
                    retry.push(*addr);
                } else {
                    next_delay = next_delay.min(req.last_sent + WHOIS_RETRY_DELAY - now);
                }
            }
            retry
        };
        for addr in retry {
            self.request_whois(rt, addr, now);
        }

        // Queue TTLs.
        self.rx_queue.lock().unwrap().retain(|e| (now - e.timestamp) < RX_TX_QUEUE_TTL);
        {
            // Re-attempt parked sends whose peers may have gained a path.
            let pending: Vec<TxQueueEntry> = {
                let mut q = self.tx_queue.lock().unwrap();
                let (expired_ok, keep): (Vec<_>, Vec<_>) =
                    q.drain(..).partition(|e| (now - e.timestamp) >= RX_TX_QUEUE_TTL);
                drop(expired_ok);
                keep
            };
            let mut q_back = Vec::new();
            for e in pending {
                if rt.topology.get_peer(e.packet.destination()).is_none() || !self.try_send(rt, &e.packet, e.encrypt, now) {
                    q_back.push(e);
                }
            }
            let mut q = self.tx_queue.lock().unwrap();
            for e in q_back {
                if q.len() < TX_QUEUE_SIZE {
                    q.push(e);
                }
            }
            if !q.is_empty() {
                next_delay = next_delay.min(RX_TX_QUEUE_TTL);
            }
        }

        // Reassembly TTL.
        {
            let mut table = self.reassembly.lock().unwrap();
            for e in table.iter_mut() {
                if e.timestamp != 0 && (now - e.timestamp) >= FRAGMENT_REASSEMBLY_TTL {
                    *e = ReassemblyEntry::empty();
                }
            }
        }

        // Unite rate-limit table GC.
        self.last_unite.lock().unwrap().retain(|_, t| (now - *t) < UNITE_MIN_INTERVAL * 4);

        next_delay.max(TIMER_GRANULARITY)
    }

    /// How many reassembly slots are currently live (for tests/diagnostics).
    pub fn reassembly_in_flight(&self) -> usize {
        self.reassembly.lock().unwrap().iter().filter(|e| e.timestamp != 0).count()
    }
}

impl Default for Switch {
    fn default() -> Self {
        Self::new()
    }
}
