/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::collections::HashMap;
use std::sync::Mutex;

use crate::address::Address;
use crate::applicationlayer::NodeHost;
use crate::certificateofmembership::CertificateOfMembership;
use crate::mac::Mac;
use crate::multicastgroup::MulticastGroup;
use crate::networkconfig::controller_for;
use crate::packet::{Packet, Verb};
use crate::proto::*;
use crate::runtime::RuntimeEnvironment;

/* MULTICAST_FRAME / MULTICAST_GATHER payload flags */
pub const MULTICAST_FLAG_HAS_COM: u8 = 0x01;
pub const MULTICAST_FLAG_GATHER_LIMIT: u8 = 0x02;
pub const MULTICAST_FLAG_HAS_SOURCE_MAC: u8 = 0x04;

/// One multicast frame in flight: the canonical packets (with and without a
/// membership certificate attached) plus the log of who already got it, so
/// late GATHER results can top the send up without duplicating anyone.
pub struct OutboundMulticast {
    timestamp: i64,
    nwid: u64,
    limit: usize,
    packet_no_com: Packet,
    packet_with_com: Option<Packet>,
    already_sent_to: Vec<Address>,
}

impl OutboundMulticast {
    #[allow(clippy::too_many_arguments)]
    fn init<App: NodeHost>(
        rt: &RuntimeEnvironment<App>,
        timestamp: i64,
        nwid: u64,
        com: Option<&CertificateOfMembership>,
        limit: usize,
        gather_limit: u32,
        src_mac: Mac,
        group: MulticastGroup,
        ethertype: u16,
        payload: &[u8],
    ) -> Option<Self> {
        let build = |with_com: bool| -> Option<Packet> {
            // Destination is patched per recipient at send time.
            let mut p = Packet::new(0, Address::default(), rt.address(), Verb::MulticastFrame);
            let b = p.buf_mut();
            let mut flags = MULTICAST_FLAG_HAS_SOURCE_MAC;
            if with_com {
                flags |= MULTICAST_FLAG_HAS_COM;
            }
            if gather_limit > 0 {
                flags |= MULTICAST_FLAG_GATHER_LIMIT;
            }
            b.append_u64(nwid).ok()?;
            b.append_u8(flags).ok()?;
            if gather_limit > 0 {
                b.append_u32(gather_limit).ok()?;
            }
            if with_com {
                com.unwrap().marshal(b).ok()?;
            }
            src_mac.marshal(b).ok()?;
            group.mac().marshal(b).ok()?;
            b.append_u32(group.adi()).ok()?;
            b.append_u16(ethertype).ok()?;
            b.append_bytes(payload).ok()?;
            Some(p)
        };
        Some(Self {
            timestamp,
            nwid,
            limit,
            packet_no_com: build(false)?,
            packet_with_com: if com.is_some() { Some(build(true)?) } else { None },
            already_sent_to: Vec::new(),
        })
    }

    pub fn expired(&self, now: i64) -> bool {
        (now - self.timestamp) >= MULTICAST_TRANSMIT_TIMEOUT
    }

    pub fn at_limit(&self) -> bool {
        self.already_sent_to.len() >= self.limit
    }

    /// Send without consulting or updating the dedup log (one-pass sends).
    fn send_only<App: NodeHost>(&self, rt: &RuntimeEnvironment<App>, to: Address, now: i64) {
        let needs_com = self.packet_with_com.is_some()
            && rt
                .topology
                .get_peer(to)
                .map(|p| p.needs_our_network_membership_certificate(self.nwid, now, true))
                .unwrap_or(true);
        let template = if needs_com { self.packet_with_com.as_ref().unwrap() } else { &self.packet_no_com };
        let mut p = template.clone();
        p.set_packet_id(rt.prng.next_u64());
        p.set_destination(to);
        rt.sw.send(rt, p, true, now);
    }

    fn send_and_log<App: NodeHost>(&mut self, rt: &RuntimeEnvironment<App>, to: Address, now: i64) {
        self.already_sent_to.push(to);
        self.send_only(rt, to, now);
    }

    /// Deliver to a member the job hasn't reached yet. True if it was new.
    fn send_if_new<App: NodeHost>(&mut self, rt: &RuntimeEnvironment<App>, to: Address, now: i64) -> bool {
        if self.already_sent_to.contains(&to) {
            false
        } else {
            self.send_and_log(rt, to, now);
            true
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct GroupMember {
    address: Address,
    timestamp: i64,
}

#[derive(Default)]
struct GroupStatus {
    // Most recently refreshed members last; gather replies walk randomly.
    members: Vec<GroupMember>,
    last_explicit_gather: i64,
    tx_queue: Vec<OutboundMulticast>,
}

/// The multicast engine: remote subscription lists learned through
/// LIKE/GATHER gossip and the per-group queue of outbound frames waiting
/// for more members.
pub struct Multicaster {
    groups: Mutex<HashMap<(u64, MulticastGroup), GroupStatus>>,
}

impl Multicaster {
    pub fn new() -> Self {
        Self { groups: Mutex::new(HashMap::new()) }
    }

    /// Learn that `member` subscribes to (nwid, group). Queued sends that
    /// still have budget are topped up immediately.
    pub fn add<App: NodeHost>(&self, rt: &RuntimeEnvironment<App>, now: i64, nwid: u64, group: MulticastGroup, member: Address) {
        if member == rt.address() {
            return;
        }
        let mut groups = self.groups.lock().unwrap();
        let gs = groups.entry((nwid, group)).or_default();
        Self::add_locked(rt, gs, now, member);
    }

    fn add_locked<App: NodeHost>(rt: &RuntimeEnvironment<App>, gs: &mut GroupStatus, now: i64, member: Address) {
        if member == rt.address() {
            return;
        }
        if let Some(m) = gs.members.iter_mut().find(|m| m.address == member) {
            m.timestamp = now;
        } else {
            if gs.members.len() >= MULTICAST_MAX_MEMBERS {
                return;
            }
            gs.members.push(GroupMember { address: member, timestamp: now });
        }
        gs.tx_queue.retain_mut(|tx| {
            if tx.at_limit() {
                return false;
            }
            tx.send_if_new(rt, member, now);
            !tx.at_limit()
        });
    }

    /// Bulk learn from an OK(MULTICAST_GATHER) result.
    pub fn add_multiple<App: NodeHost>(
        &self,
        rt: &RuntimeEnvironment<App>,
        now: i64,
        nwid: u64,
        group: MulticastGroup,
        members: &[Address],
    ) {
        let mut groups = self.groups.lock().unwrap();
        let gs = groups.entry((nwid, group)).or_default();
        for m in members {
            Self::add_locked(rt, gs, now, *m);
        }
    }

    pub fn remove(&self, nwid: u64, group: MulticastGroup, member: Address) {
        let mut groups = self.groups.lock().unwrap();
        if let Some(gs) = groups.get_mut(&(nwid, group)) {
            gs.members.retain(|m| m.address != member);
        }
    }

    /// Answer a GATHER: append `[u32 total][u16 count][count * address]` to
    /// a reply packet, starting at a random member so repeated queries see
    /// different subsets. The querying peer is never returned to itself.
    pub fn gather<App: NodeHost>(
        &self,
        rt: &RuntimeEnvironment<App>,
        querying_peer: Address,
        nwid: u64,
        group: MulticastGroup,
        limit: u32,
        append_to: &mut Packet,
    ) -> u16 {
        let limit = limit.min(0xffff) as usize;
        let b = append_to.buf_mut();
        let Ok(total_at) = b.append_padding(4) else {
            return 0;
        };
        let Ok(count_at) = b.append_padding(2) else {
            return 0;
        };
        let mut total: u32 = 0;
        let mut count: u16 = 0;

        // Ourselves first, if we're a subscriber.
        if rt.network(nwid).map(|nw| nw.subscribed_to(&group)).unwrap_or(false) {
            total += 1;
            if limit > 0 && rt.address() != querying_peer && rt.address().marshal(b).is_ok() {
                count += 1;
            }
        }

        let groups = self.groups.lock().unwrap();
        if let Some(gs) = groups.get(&(nwid, group)) {
            total += gs.members.len() as u32;
            if !gs.members.is_empty() {
                let start = (rt.prng.next_u32() as usize) % gs.members.len();
                for i in 0..gs.members.len() {
                    if (count as usize) >= limit || append_to.len() + 5 > UDP_DEFAULT_PAYLOAD_MTU {
                        break;
                    }
                    let a = gs.members[(start + i) % gs.members.len()].address;
                    if a != querying_peer && a.marshal(append_to.buf_mut()).is_ok() {
                        count += 1;
                    }
                }
            }
        }
        let _ = append_to.buf_mut().set_u32_at(total_at, total);
        let _ = append_to.buf_mut().set_u16_at(count_at, count);
        count
    }

    /// Do the subscription lists place both addresses on one common
    /// network? This is the gossip evidence a relay consults before it
    /// offers to introduce two peers to each other.
    pub fn have_common_network(&self, a: Address, b: Address) -> bool {
        let groups = self.groups.lock().unwrap();
        let mut a_nets: std::collections::HashSet<u64> = std::collections::HashSet::new();
        let mut b_nets: std::collections::HashSet<u64> = std::collections::HashSet::new();
        for ((nwid, _), gs) in groups.iter() {
            for m in &gs.members {
                if m.address == a {
                    a_nets.insert(*nwid);
                } else if m.address == b {
                    b_nets.insert(*nwid);
                }
            }
        }
        a_nets.intersection(&b_nets).next().is_some()
    }

    /// A snapshot of known members, freshest first.
    pub fn members(&self, nwid: u64, group: MulticastGroup, limit: usize) -> Vec<Address> {
        let groups = self.groups.lock().unwrap();
        match groups.get(&(nwid, group)) {
            Some(gs) => gs.members.iter().rev().take(limit).map(|m| m.address).collect(),
            None => Vec::new(),
        }
    }

    /// Send a multicast frame to up to `limit` members of a group.
    ///
    /// With enough known members this is a single pass over a random
    /// permutation. Otherwise everyone known gets it now, the job is queued
    /// with the remaining budget, and (rate limited) an explicit GATHER goes
    /// to the best root and the network's controller to find the rest.
    #[allow(clippy::too_many_arguments)]
    pub fn send<App: NodeHost>(
        &self,
        rt: &RuntimeEnvironment<App>,
        com: Option<&CertificateOfMembership>,
        limit: usize,
        now: i64,
        nwid: u64,
        always_send_to: &[Address],
        group: MulticastGroup,
        src_mac: Mac,
        ethertype: u16,
        payload: &[u8],
    ) {
        if limit == 0 {
            return;
        }
        let mut groups = self.groups.lock().unwrap();
        let gs = groups.entry((nwid, group)).or_default();

        // Random permutation of member indexes.
        let mut indexes: Vec<usize> = (0..gs.members.len()).collect();
        for i in (1..indexes.len()).rev() {
            let j = (rt.prng.next_u64() as usize) % (i + 1);
            indexes.swap(i, j);
        }

        // The branch below is on |M|: known members plus whatever in
        // alwaysSendTo isn't already known. Ourselves never counted.
        let member_union = gs.members.len()
            + always_send_to
                .iter()
                .filter(|a| **a != rt.address() && !gs.members.iter().any(|m| m.address == **a))
                .count();

        if member_union >= limit {
            // Enough members known: skip the queue, still gather a token
            // amount to keep the list fresh.
            let Some(out) = OutboundMulticast::init(rt, now, nwid, com, limit, 1, src_mac, group, ethertype, payload) else {
                return;
            };
            let mut count = 0;
            for ast in always_send_to {
                if *ast != rt.address() {
                    out.send_only(rt, *ast, now);
                    count += 1;
                    if count >= limit {
                        break;
                    }
                }
            }
            let mut idx = 0;
            while count < limit && idx < indexes.len() {
                let ma = gs.members[indexes[idx]].address;
                idx += 1;
                if !always_send_to.contains(&ma) {
                    out.send_only(rt, ma, now);
                    count += 1;
                }
            }
        } else {
            let mut gather_limit = (limit - member_union) as u32 + 1;

            if gs.members.is_empty() || (now - gs.last_explicit_gather) >= MULTICAST_EXPLICIT_GATHER_DELAY {
                gs.last_explicit_gather = now;
                let mut gather_peers: Vec<Address> = Vec::with_capacity(2);
                if let Some(root) = rt.topology.best_root(now) {
                    gather_peers.push(root.address());
                }
                let controller = controller_for(nwid);
                if controller != rt.address() && !gather_peers.contains(&controller) {
                    gather_peers.push(controller);
                }
                for gp in gather_peers {
                    let attach_com = com.filter(|_| {
                        rt.topology
                            .get_peer(gp)
                            .map(|p| p.needs_our_network_membership_certificate(nwid, now, true))
                            .unwrap_or(true)
                    });
                    let mut outp = Packet::new(rt.prng.next_u64(), gp, rt.address(), Verb::MulticastGather);
                    let b = outp.buf_mut();
                    let ok = b.append_u64(nwid).is_ok()
                        && b.append_u8(if attach_com.is_some() { MULTICAST_FLAG_HAS_COM } else { 0 }).is_ok()
                        && group.mac().marshal(b).is_ok()
                        && b.append_u32(group.adi()).is_ok()
                        && b.append_u32(gather_limit).is_ok()
                        && attach_com.map(|c| c.marshal(b).is_ok()).unwrap_or(true);
                    if ok {
                        rt.sw.send(rt, outp, true, now);
                    }
                }
                gather_limit = 0;
            }

            let Some(mut out) = OutboundMulticast::init(rt, now, nwid, com, limit, gather_limit, src_mac, group, ethertype, payload)
            else {
                return;
            };
            let mut count = 0;
            for ast in always_send_to {
                if *ast != rt.address() {
                    out.send_and_log(rt, *ast, now);
                    count += 1;
                    if count >= limit {
                        break;
                    }
                }
            }
            let mut idx = 0;
            while count < limit && idx < indexes.len() {
                let ma = gs.members[indexes[idx]].address;
                idx += 1;
                if !always_send_to.contains(&ma) {
                    out.send_and_log(rt, ma, now);
                    count += 1;
                }
            }
            gs.tx_queue.push(out);
        }
    }

    /// Expire members and spent or timed-out jobs; empty groups go away.
    pub fn clean(&self, now: i64) {
        let mut groups = self.groups.lock().unwrap();
        groups.retain(|_, gs| {
            gs.tx_queue.retain(|tx| !tx.expired(now) && !tx.at_limit());
            gs.members.retain(|m| (now - m.timestamp) < MULTICAST_LIKE_EXPIRE);
            !gs.members.is_empty() || !gs.tx_queue.is_empty()
        });
    }
}

impl Default for Multicaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inetaddress::InetAddress;
    use crate::packet::Verb;
    use crate::testutil;

    const NWID: u64 = 0x8056c2e21c000001;

    fn v4(last: u8) -> InetAddress {
        InetAddress::V4(std::net::Ipv4Addr::new(192, 0, 2, last), 9993)
    }

    // Register a peer with a live direct path so sends reach the wire.
    fn add_reachable_peer(rt: &crate::runtime::RuntimeEnvironment<testutil::LoopHost>, i: usize, now: i64) -> Address {
        let peer = rt.topology.add_peer(rt, testutil::identity(i).clone()).unwrap();
        peer.received(rt, &v4(1), &v4(100 + i as u8), 0, Verb::Nop, now);
        peer.address()
    }

    // Destinations of everything that reached the wire. Headers stay
    // readable after armor, so this works on encrypted packets.
    fn sent_destinations(rt: &crate::runtime::RuntimeEnvironment<testutil::LoopHost>) -> Vec<Address> {
        rt.host
            .wire
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(_, _, data)| crate::packet::Packet::from_wire(data).ok())
            .map(|p| p.destination())
            .collect()
    }

    #[test]
    fn send_delivers_each_member_at_most_once_and_respects_limit() {
        let now = 1_000_000;
        let rt = testutil::runtime();
        let group = MulticastGroup::new(Mac::from_u64(0xffff_ffff_ffff), 0);
        let m1 = add_reachable_peer(&rt, 1, now);
        let m2 = add_reachable_peer(&rt, 2, now);
        let m3 = add_reachable_peer(&rt, 3, now);
        rt.mc.add(&rt, now, NWID, group, m1);
        rt.mc.add(&rt, now, NWID, group, m2);
        rt.mc.add(&rt, now, NWID, group, m3);

        // 3 members known, limit 2: one-pass send, alwaysSendTo first.
        rt.mc.send(&rt, None, 2, now, NWID, &[m2], group, Mac::from_u64(0x0200aa), 0x0800, b"frame");
        let dests = sent_destinations(&rt);
        assert_eq!(dests.len(), 2);
        assert_eq!(dests[0], m2); // alwaysSendTo goes first
        assert!(dests[1] == m1 || dests[1] == m3);
        let mut uniq = dests.clone();
        uniq.dedup();
        assert_eq!(uniq.len(), dests.len());
    }

    #[test]
    fn always_send_to_counts_toward_the_member_union() {
        let now = 1_000_000;
        let rt = testutil::runtime();
        let group = MulticastGroup::new(Mac::from_u64(0xffff_ffff_ffff), 0x0a000009);
        let m1 = add_reachable_peer(&rt, 1, now);
        let bridge_a = add_reachable_peer(&rt, 2, now);
        let bridge_b = add_reachable_peer(&rt, 3, now);
        rt.mc.add(&rt, now, NWID, group, m1);

        // Known members alone (1) are under the limit, but the union with
        // the two bridges reaches it, so this is a one-pass send: no job is
        // queued and no explicit GATHER goes out.
        rt.mc.send(&rt, None, 3, now, NWID, &[bridge_a, bridge_b], group, Mac::from_u64(0x0200aa), 0x0800, b"x");
        let dests = sent_destinations(&rt);
        assert_eq!(dests.len(), 3);
        assert_eq!(&dests[..2], &[bridge_a, bridge_b]); // alwaysSendTo first
        assert_eq!(dests[2], m1);

        // A later LIKE finds no queued job to top up.
        let count_before = sent_destinations(&rt).len();
        rt.mc.add(&rt, now + 10, NWID, group, bridge_a);
        assert_eq!(sent_destinations(&rt).len(), count_before);
    }

    #[test]
    fn common_network_evidence() {
        let now = 1_000_000;
        let rt = testutil::runtime();
        let group = MulticastGroup::new(Mac::from_u64(0xffff_ffff_ffff), 0);
        let a = add_reachable_peer(&rt, 1, now);
        let b = add_reachable_peer(&rt, 2, now);
        let c = add_reachable_peer(&rt, 3, now);
        rt.mc.add(&rt, now, NWID, group, a);
        rt.mc.add(&rt, now, NWID, MulticastGroup::new(Mac::from_u64(0x3333ff000001), 0), b);
        rt.mc.add(&rt, now, NWID ^ 1, group, c);
        assert!(rt.mc.have_common_network(a, b)); // different groups, same network
        assert!(!rt.mc.have_common_network(a, c)); // different networks
        assert!(!rt.mc.have_common_network(b, c));
    }

    #[test]
    fn queued_send_tops_up_without_duplicates() {
        let now = 1_000_000;
        let rt = testutil::runtime();
        let group = MulticastGroup::new(Mac::from_u64(0x3333ff000001), 0);
        let m1 = add_reachable_peer(&rt, 1, now);
        rt.mc.add(&rt, now, NWID, group, m1);

        // 1 member known, limit 3: delivered now, job queued with budget.
        rt.mc.send(&rt, None, 3, now, NWID, &[], group, Mac::from_u64(0x0200aa), 0x86dd, b"x");
        assert_eq!(sent_destinations(&rt), vec![m1]);

        // A re-announce of the same member must not resend.
        rt.mc.add(&rt, now + 10, NWID, group, m1);
        assert_eq!(sent_destinations(&rt).len(), 1);

        // A fresh member tops the queued job up.
        let m2 = add_reachable_peer(&rt, 2, now);
        rt.mc.add(&rt, now + 20, NWID, group, m2);
        let dests = sent_destinations(&rt);
        assert_eq!(dests, vec![m1, m2]);

        // Expired jobs stop topping up.
        rt.mc.clean(now + MULTICAST_TRANSMIT_TIMEOUT + 1);
        let m3 = add_reachable_peer(&rt, 3, now + MULTICAST_TRANSMIT_TIMEOUT + 2);
        rt.mc.add(&rt, now + MULTICAST_TRANSMIT_TIMEOUT + 2, NWID, group, m3);
        assert_eq!(sent_destinations(&rt).len(), 2);
    }

    #[test]
    fn gather_reply_skips_querier_and_reports_total() {
        let now = 1_000_000;
        let rt = testutil::runtime();
        let group = MulticastGroup::new(Mac::from_u64(0xffff_ffff_ffff), 0x0a000001);
        let m1 = add_reachable_peer(&rt, 1, now);
        let m2 = add_reachable_peer(&rt, 2, now);
        rt.mc.add(&rt, now, NWID, group, m1);
        rt.mc.add(&rt, now, NWID, group, m2);

        let mut reply = Packet::new(1, m1, rt.address(), Verb::Ok);
        let start = reply.len();
        let count = rt.mc.gather(&rt, m1, NWID, group, 16, &mut reply);
        assert_eq!(count, 1); // m1 never gets itself back
        let b = reply.buf();
        let mut c = start;
        assert_eq!(b.read_u32(&mut c).unwrap(), 2); // total known
        assert_eq!(b.read_u16(&mut c).unwrap(), 1);
        assert_eq!(Address::unmarshal(b, &mut c).unwrap(), m2);

        // A limit of zero yields counts only.
        let mut reply2 = Packet::new(2, m1, rt.address(), Verb::Ok);
        let start2 = reply2.len();
        assert_eq!(rt.mc.gather(&rt, m1, NWID, group, 0, &mut reply2), 0);
        let mut c2 = start2;
        assert_eq!(reply2.buf().read_u32(&mut c2).unwrap(), 2);
        assert_eq!(reply2.buf().read_u16(&mut c2).unwrap(), 0);
    }

    #[test]
    fn member_lists_expire() {
        let now = 1_000_000;
        let rt = testutil::runtime();
        let group = MulticastGroup::new(Mac::from_u64(0xffff_ffff_ffff), 7);
        let m1 = add_reachable_peer(&rt, 1, now);
        rt.mc.add(&rt, now, NWID, group, m1);
        assert_eq!(rt.mc.members(NWID, group, 10), vec![m1]);
        rt.mc.clean(now + MULTICAST_LIKE_EXPIRE + 1);
        assert!(rt.mc.members(NWID, group, 10).is_empty());
    }
}
