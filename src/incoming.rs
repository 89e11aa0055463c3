/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::sync::Arc;

use crate::address::Address;
use crate::applicationlayer::{Event, NetworkControllerResult, NodeHost};
use crate::certificateofmembership::CertificateOfMembership;
use crate::dictionary::Dictionary;
use crate::error::FaultType;
use crate::identity::Identity;
use crate::inetaddress::InetAddress;
use crate::mac::Mac;
use crate::multicastgroup::MulticastGroup;
use crate::network::ComVerifyError;
use crate::networkconfig::controller_for;
use crate::packet::{ErrorCode, Packet, Verb};
use crate::peer::Peer;
use crate::proto::*;
use crate::runtime::RuntimeEnvironment;
use crate::switch::Switch;
use crate::world::World;

const PAYLOAD_START: usize = PACKET_IDX_VERB + 1;

/// Dispatch an authenticated, decompressed packet to its verb handler.
///
/// Unknown verbs are ignored without comment so old nodes tolerate new
/// protocol vocabulary. Faults are local drops, surfaced only as traces.
pub(crate) fn dispatch<App: NodeHost>(
    rt: &RuntimeEnvironment<App>,
    sw: &Switch,
    peer: &Arc<Peer>,
    packet: Packet,
    local: &InetAddress,
    remote: &InetAddress,
    now: i64,
) {
    let Some(verb) = packet.verb() else {
        return;
    };
    peer.received(rt, local, remote, packet.hops(), verb, now);

    let result = match verb {
        Verb::Nop => Ok(()),
        Verb::Hello => do_hello_from_known_peer(rt, peer, &packet, local, remote, now),
        Verb::Ok => do_ok(rt, sw, peer, &packet, now),
        Verb::Error => do_error(rt, sw, peer, &packet, now),
        Verb::Whois => do_whois(rt, sw, peer, &packet, now),
        Verb::Rendezvous => do_rendezvous(rt, sw, peer, &packet, local, now),
        Verb::Frame => do_frame(rt, sw, peer, &packet, now),
        Verb::ExtFrame => do_ext_frame(rt, sw, peer, &packet, local, remote, now),
        Verb::Echo => do_echo(rt, sw, peer, &packet, now),
        Verb::MulticastLike => do_multicast_like(rt, peer, &packet, now),
        Verb::NetworkMembershipCertificate => do_network_membership_certificate(rt, sw, peer, &packet, local, remote, now),
        Verb::NetworkConfigRequest => do_network_config_request(rt, sw, peer, &packet, now),
        Verb::NetworkConfigRefresh => do_network_config_refresh(rt, peer, &packet, now),
        Verb::MulticastGather => do_multicast_gather(rt, sw, peer, &packet, now),
        Verb::MulticastFrame => do_multicast_frame(rt, sw, peer, &packet, local, remote, now),
        Verb::CircuitTest => do_circuit_test(rt, sw, peer, &packet, local, remote, now),
        Verb::CircuitTestReport => do_circuit_test_report(rt, peer, &packet),
    };
    if let Err(fault) = result {
        rt.trace(format!("dropped {:?} from {}: {:?}", verb, peer.address(), fault));
    }
}

/* HELLO */

struct HelloFields {
    proto: u8,
    vmaj: u8,
    vmin: u8,
    vrev: u16,
    timestamp: u64,
    identity: Identity,
    external: InetAddress,
    world_id: u64,
    world_ts: u64,
}

fn parse_hello(packet: &Packet) -> Result<HelloFields, FaultType> {
    let b = packet.buf();
    let mut c = PAYLOAD_START;
    Ok(HelloFields {
        proto: b.read_u8(&mut c)?,
        vmaj: b.read_u8(&mut c)?,
        vmin: b.read_u8(&mut c)?,
        vrev: b.read_u16(&mut c)?,
        timestamp: b.read_u64(&mut c)?,
        identity: Identity::unmarshal(b, &mut c)?,
        external: InetAddress::unmarshal(b, &mut c)?,
        world_id: b.read_u64(&mut c)?,
        world_ts: b.read_u64(&mut c)?,
    })
}

/// A HELLO from the wire, before any peer lookup: it carries the identity
/// needed to authenticate itself.
pub(crate) fn handle_hello<App: NodeHost>(
    rt: &RuntimeEnvironment<App>,
    sw: &Switch,
    mut packet: Packet,
    local: &InetAddress,
    remote: &InetAddress,
    now: i64,
) {
    let _ = sw;
    let Ok(fields) = parse_hello(&packet) else {
        return;
    };
    if fields.identity.address() != packet.source() || fields.proto == 0 {
        return;
    }
    if fields.identity.address() == rt.address() {
        if fields.identity != rt.identity {
            rt.host.event(Event::IdentityCollision);
        }
        return;
    }

    let known = rt.topology.get_peer(fields.identity.address());
    if known.is_none() && !fields.identity.locally_validate() {
        rt.trace(format!("rejected HELLO from {}: identity fails hashcash validation", fields.identity.address()));
        return;
    }
    let Some(peer) = rt.topology.add_peer(rt, fields.identity.public_only()) else {
        // Address already bound to a different verified identity.
        rt.trace(format!("rejected HELLO from {}: identity collision with stored identity", packet.source()));
        return;
    };
    if packet.dearmor(peer.key()).is_err() {
        rt.trace(format!("dropped HELLO from {}: authentication failed", peer.address()));
        return;
    }
    if !peer.expect_packet_id(packet.packet_id()) {
        return;
    }
    peer.received(rt, local, remote, packet.hops(), Verb::Hello, now);
    let _ = finish_hello(rt, &peer, &fields, packet.packet_id(), local, remote, now);
}

/// A HELLO that arrived from a peer we already knew (re-key probes,
/// keepalives). The identity inside must match the stored one.
fn do_hello_from_known_peer<App: NodeHost>(
    rt: &RuntimeEnvironment<App>,
    peer: &Arc<Peer>,
    packet: &Packet,
    local: &InetAddress,
    remote: &InetAddress,
    now: i64,
) -> Result<(), FaultType> {
    let fields = parse_hello(packet)?;
    if &fields.identity != peer.identity() {
        return Err(FaultType::AuthenticationFailed);
    }
    finish_hello(rt, peer, &fields, packet.packet_id(), local, remote, now)
}

fn finish_hello<App: NodeHost>(
    rt: &RuntimeEnvironment<App>,
    peer: &Arc<Peer>,
    fields: &HelloFields,
    in_re_packet_id: u64,
    local: &InetAddress,
    remote: &InetAddress,
    now: i64,
) -> Result<(), FaultType> {
    peer.set_remote_version(fields.proto, fields.vmaj, fields.vmin, fields.vrev);
    rt.sa.iam(rt, peer.address(), &fields.external, rt.topology.is_root_address(peer.address()), now);

    // Piggyback a world update if the caller's is older than ours.
    let (our_world_id, our_world_ts) = rt.topology.world_id_timestamp();
    let send_world = our_world_id != 0 && fields.world_id == our_world_id && our_world_ts > fields.world_ts as i64;

    let mut ok = Packet::new(rt.prng.next_u64(), peer.address(), rt.address(), Verb::Ok);
    let b = ok.buf_mut();
    b.append_u8(Verb::Hello as u8)?;
    b.append_u64(in_re_packet_id)?;
    b.append_u64(fields.timestamp)?;
    b.append_u8(PROTOCOL_VERSION)?;
    b.append_u8(VERSION_MAJOR)?;
    b.append_u8(VERSION_MINOR)?;
    b.append_u16(VERSION_REVISION)?;
    remote.marshal(b)?;
    if send_world {
        b.append_u8(1)?;
        if let Some(w) = rt.topology.world() {
            w.marshal(b)?;
        }
    } else {
        b.append_u8(0)?;
    }
    ok.armor(peer.key(), true);
    // Reply out the path the HELLO came in on; with NATs involved it is the
    // only address known to work.
    peer.mark_path_sent(local, remote, now);
    rt.host.wire_send(local, remote, ok.buf().as_bytes(), 0);
    Ok(())
}

/* OK / ERROR */

fn do_ok<App: NodeHost>(
    rt: &RuntimeEnvironment<App>,
    sw: &Switch,
    peer: &Arc<Peer>,
    packet: &Packet,
    now: i64,
) -> Result<(), FaultType> {
    let b = packet.buf();
    let mut c = PAYLOAD_START;
    let in_re = Verb::from_u8(b.read_u8(&mut c)?);
    let _in_re_packet_id = b.read_u64(&mut c)?;

    match in_re {
        Some(Verb::Hello) => {
            let echoed_ts = b.read_u64(&mut c)?;
            let proto = b.read_u8(&mut c)?;
            let vmaj = b.read_u8(&mut c)?;
            let vmin = b.read_u8(&mut c)?;
            let vrev = b.read_u16(&mut c)?;
            let external = InetAddress::unmarshal(b, &mut c)?;
            let latency = (now - echoed_ts as i64).clamp(0, u32::MAX as i64) as u32;
            peer.record_latency(latency);
            peer.set_remote_version(proto, vmaj, vmin, vrev);
            rt.sa.iam(rt, peer.address(), &external, rt.topology.is_root_address(peer.address()), now);
            if b.read_u8(&mut c)? == 1 {
                let world = World::unmarshal(b, &mut c)?;
                rt.topology.consider_world_update(rt, world);
            }
        }
        Some(Verb::Whois) => {
            let identity = Identity::unmarshal(b, &mut c)?;
            if identity.address() == rt.address() {
                if identity != rt.identity {
                    rt.host.event(Event::IdentityCollision);
                }
                return Ok(());
            }
            let known = rt.topology.get_peer(identity.address());
            if known.is_none() && !identity.locally_validate() {
                return Err(FaultType::AuthenticationFailed);
            }
            if let Some(new_peer) = rt.topology.add_peer(rt, identity) {
                sw.do_anything_waiting_for_peer(rt, &new_peer, now);
            }
        }
        Some(Verb::NetworkConfigRequest) => {
            let nwid = b.read_u64(&mut c)?;
            let len = b.read_u16(&mut c)? as usize;
            let blob = b.read_bytes(&mut c, len)?;
            if let Some(network) = rt.network(nwid) {
                let d = Dictionary::from_bytes(blob);
                if network.apply_config_dictionary(rt, &d, Some(peer.identity()), now).is_err() {
                    return Err(FaultType::InvalidPacket);
                }
            }
        }
        Some(Verb::MulticastGather) => {
            let nwid = b.read_u64(&mut c)?;
            let mac = Mac::unmarshal(b, &mut c)?;
            let adi = b.read_u32(&mut c)?;
            let group = MulticastGroup::new(mac, adi);
            let _total = b.read_u32(&mut c)?;
            let count = b.read_u16(&mut c)? as usize;
            let mut members = Vec::with_capacity(count);
            for _ in 0..count {
                members.push(Address::unmarshal(b, &mut c)?);
            }
            rt.mc.add_multiple(rt, now, nwid, group, &members);
        }
        Some(Verb::MulticastFrame) => {
            let nwid = b.read_u64(&mut c)?;
            let mac = Mac::unmarshal(b, &mut c)?;
            let adi = b.read_u32(&mut c)?;
            let group = MulticastGroup::new(mac, adi);
            let flags = b.read_u8(&mut c)?;
            if flags & crate::multicaster::MULTICAST_FLAG_GATHER_LIMIT != 0 {
                let _total = b.read_u32(&mut c)?;
                let count = b.read_u16(&mut c)? as usize;
                let mut members = Vec::with_capacity(count);
                for _ in 0..count {
                    members.push(Address::unmarshal(b, &mut c)?);
                }
                rt.mc.add_multiple(rt, now, nwid, group, &members);
            }
        }
        _ => {} // OK for a verb we don't track
    }
    Ok(())
}

fn do_error<App: NodeHost>(
    rt: &RuntimeEnvironment<App>,
    sw: &Switch,
    peer: &Arc<Peer>,
    packet: &Packet,
    now: i64,
) -> Result<(), FaultType> {
    let b = packet.buf();
    let mut c = PAYLOAD_START;
    let in_re = Verb::from_u8(b.read_u8(&mut c)?);
    let _in_re_packet_id = b.read_u64(&mut c)?;
    let code = ErrorCode::from_u8(b.read_u8(&mut c)?);

    match (in_re, code) {
        (Some(Verb::NetworkConfigRequest), Some(ErrorCode::ObjNotFound)) => {
            let nwid = b.read_u64(&mut c)?;
            if peer.address() == controller_for(nwid) {
                if let Some(network) = rt.network(nwid) {
                    network.set_not_found();
                }
            }
        }
        (Some(Verb::NetworkConfigRequest), Some(ErrorCode::NetworkAccessDenied)) => {
            let nwid = b.read_u64(&mut c)?;
            if peer.address() == controller_for(nwid) {
                if let Some(network) = rt.network(nwid) {
                    network.set_access_denied();
                }
            }
        }
        (_, Some(ErrorCode::IdentityCollision)) => {
            if rt.topology.is_root_address(peer.address()) {
                rt.host.event(Event::IdentityCollision);
            }
        }
        (_, Some(ErrorCode::NeedMembershipCertificate)) => {
            let nwid = b.read_u64(&mut c)?;
            if let Some(network) = rt.network(nwid) {
                if let Some(com) = network.our_membership_certificate() {
                    peer.needs_our_network_membership_certificate(nwid, now, true);
                    let mut p = Packet::new(rt.prng.next_u64(), peer.address(), rt.address(), Verb::NetworkMembershipCertificate);
                    if com.marshal(p.buf_mut()).is_ok() {
                        sw.send(rt, p, true, now);
                    }
                }
            }
        }
        _ => {}
    }
    Ok(())
}

/* WHOIS / RENDEZVOUS */

fn do_whois<App: NodeHost>(
    rt: &RuntimeEnvironment<App>,
    sw: &Switch,
    peer: &Arc<Peer>,
    packet: &Packet,
    now: i64,
) -> Result<(), FaultType> {
    let b = packet.buf();
    let mut c = PAYLOAD_START;
    while c < b.len() {
        let addr = Address::unmarshal(b, &mut c)?;
        match rt.topology.get_peer(addr) {
            Some(subject) => {
                let mut ok = Packet::new(rt.prng.next_u64(), peer.address(), rt.address(), Verb::Ok);
                let ob = ok.buf_mut();
                ob.append_u8(Verb::Whois as u8)?;
                ob.append_u64(packet.packet_id())?;
                subject.identity().marshal(ob, false)?;
                sw.send(rt, ok, true, now);
            }
            None => {
                let mut err = Packet::new(rt.prng.next_u64(), peer.address(), rt.address(), Verb::Error);
                let eb = err.buf_mut();
                eb.append_u8(Verb::Whois as u8)?;
                eb.append_u64(packet.packet_id())?;
                eb.append_u8(ErrorCode::ObjNotFound as u8)?;
                addr.marshal(eb)?;
                sw.send(rt, err, true, now);
            }
        }
    }
    Ok(())
}

fn do_rendezvous<App: NodeHost>(
    rt: &RuntimeEnvironment<App>,
    sw: &Switch,
    peer: &Arc<Peer>,
    packet: &Packet,
    local: &InetAddress,
    now: i64,
) -> Result<(), FaultType> {
    // Only relays we already trust to carry our traffic may redirect our
    // probes; otherwise this is a traffic-steering primitive for attackers.
    if !rt.topology.is_root_address(peer.address()) {
        return Err(FaultType::BadParameter);
    }
    let b = packet.buf();
    let mut c = PAYLOAD_START;
    let _flags = b.read_u8(&mut c)?;
    let with = Address::unmarshal(b, &mut c)?;
    let port = b.read_u16(&mut c)?;
    let addr_len = b.read_u8(&mut c)? as usize;
    let raw = b.read_bytes(&mut c, addr_len)?;
    let at = match addr_len {
        4 => InetAddress::V4(<[u8; 4]>::try_from(raw).unwrap().into(), port),
        16 => InetAddress::V6(<[u8; 16]>::try_from(raw).unwrap().into(), port),
        _ => return Err(FaultType::BadParameter),
    };
    let Some(with_peer) = rt.topology.get_peer(with) else {
        return Ok(()); // can't probe an identity we don't have
    };
    if !rt.host.path_check(local, &at) {
        return Ok(());
    }
    rt.trace(format!("RENDEZVOUS from {}: probing {} at {}", peer.address(), with, at));
    sw.rendezvous(rt, with_peer, local, &at, now);
    Ok(())
}

/* Frames */

fn send_need_certificate<App: NodeHost>(
    rt: &RuntimeEnvironment<App>,
    sw: &Switch,
    peer: &Arc<Peer>,
    in_re: Verb,
    in_re_packet_id: u64,
    nwid: u64,
    now: i64,
) {
    let mut err = Packet::new(rt.prng.next_u64(), peer.address(), rt.address(), Verb::Error);
    let eb = err.buf_mut();
    let ok = eb.append_u8(in_re as u8).is_ok()
        && eb.append_u64(in_re_packet_id).is_ok()
        && eb.append_u8(ErrorCode::NeedMembershipCertificate as u8).is_ok()
        && eb.append_u64(nwid).is_ok();
    if ok {
        sw.send(rt, err, true, now);
    }
}

fn gate_frame<App: NodeHost>(
    rt: &RuntimeEnvironment<App>,
    sw: &Switch,
    peer: &Arc<Peer>,
    network: &Arc<crate::network::Network>,
    in_re: Verb,
    in_re_packet_id: u64,
    now: i64,
) -> bool {
    match network.may_communicate_with(peer.address()) {
        Ok(()) => true,
        Err(e) => {
            // Missing/expired certificate is recoverable: tell the sender to
            // push a fresh one.
            send_need_certificate(rt, sw, peer, in_re, in_re_packet_id, network.id(), now);
            rt.trace(format!("refused frame on {:016x} from {}: {}", network.id(), peer.address(), e));
            false
        }
    }
}

fn do_frame<App: NodeHost>(
    rt: &RuntimeEnvironment<App>,
    sw: &Switch,
    peer: &Arc<Peer>,
    packet: &Packet,
    now: i64,
) -> Result<(), FaultType> {
    let b = packet.buf();
    let mut c = PAYLOAD_START;
    let nwid = b.read_u64(&mut c)?;
    let ethertype = b.read_u16(&mut c)?;
    let Some(network) = rt.network(nwid) else {
        return Ok(()); // not ours; silence, the sender may have stale state
    };
    if !gate_frame(rt, sw, peer, &network, Verb::Frame, packet.packet_id(), now) {
        return Ok(());
    }
    if network.filter_frame(ethertype).is_err() {
        return Ok(());
    }
    let payload = b.bytes_at(c, b.len() - c)?;
    rt.host.frame_deliver(nwid, network.mac_for_member(peer.address()), network.mac(), ethertype, 0, payload);
    Ok(())
}

fn do_ext_frame<App: NodeHost>(
    rt: &RuntimeEnvironment<App>,
    sw: &Switch,
    peer: &Arc<Peer>,
    packet: &Packet,
    local: &InetAddress,
    remote: &InetAddress,
    now: i64,
) -> Result<(), FaultType> {
    let b = packet.buf();
    let mut c = PAYLOAD_START;
    let nwid = b.read_u64(&mut c)?;
    let flags = b.read_u8(&mut c)?;
    let com = if flags & 0x01 != 0 { Some(CertificateOfMembership::unmarshal(b, &mut c)?) } else { None };
    let to = Mac::unmarshal(b, &mut c)?;
    let from = Mac::unmarshal(b, &mut c)?;
    let ethertype = b.read_u16(&mut c)?;
    let payload_at = c;

    let Some(network) = rt.network(nwid) else {
        return Ok(());
    };
    if let Some(com) = com {
        let controller_id = rt.topology.get_peer(network.controller()).map(|p| p.identity().clone());
        match network.add_membership_certificate(controller_id.as_ref(), com) {
            Ok(()) => {}
            Err(ComVerifyError::ControllerUnknown(ctrl)) => {
                sw.queue_rx_decrypted(rt, packet.clone(), ctrl, local, remote, now);
                return Ok(());
            }
            Err(ComVerifyError::Invalid) => return Err(FaultType::AuthenticationFailed),
        }
    }
    if !gate_frame(rt, sw, peer, &network, Verb::ExtFrame, packet.packet_id(), now) {
        return Ok(());
    }
    if network.filter_frame(ethertype).is_err() {
        return Ok(());
    }

    // Source MACs that aren't the sender's own port mean bridging, which
    // must be authorized for the sender.
    if from != network.mac_for_member(peer.address()) {
        let bridging_ok = network.config().map(|cfg| cfg.allow_passive_bridging || cfg.is_active_bridge(peer.address())).unwrap_or(false);
        if !bridging_ok {
            rt.trace(format!("dropped EXT_FRAME on {:016x}: {} may not bridge {}", nwid, peer.address(), from));
            return Ok(());
        }
    }
    // Destinations other than our port only make sense if we bridge onward.
    if to != network.mac() && !to.is_multicast() {
        let cfg_allows = network.config().map(|cfg| cfg.allow_passive_bridging).unwrap_or(false);
        if !cfg_allows {
            return Ok(());
        }
    }

    let b = packet.buf();
    let payload = b.bytes_at(payload_at, b.len() - payload_at)?;
    rt.host.frame_deliver(nwid, from, to, ethertype, 0, payload);
    Ok(())
}

fn do_echo<App: NodeHost>(
    rt: &RuntimeEnvironment<App>,
    sw: &Switch,
    peer: &Arc<Peer>,
    packet: &Packet,
    now: i64,
) -> Result<(), FaultType> {
    let mut ok = Packet::new(rt.prng.next_u64(), peer.address(), rt.address(), Verb::Ok);
    let ob = ok.buf_mut();
    ob.append_u8(Verb::Echo as u8)?;
    ob.append_u64(packet.packet_id())?;
    ob.append_bytes(packet.payload())?;
    sw.send(rt, ok, true, now);
    Ok(())
}

/* Multicast */

fn do_multicast_like<App: NodeHost>(
    rt: &RuntimeEnvironment<App>,
    peer: &Arc<Peer>,
    packet: &Packet,
    now: i64,
) -> Result<(), FaultType> {
    let b = packet.buf();
    let mut c = PAYLOAD_START;
    while c < b.len() {
        let nwid = b.read_u64(&mut c)?;
        let mac = Mac::unmarshal(b, &mut c)?;
        let adi = b.read_u32(&mut c)?;
        let group = MulticastGroup::new(mac, adi);
        // Learn subscriptions only where we have a reason to hold them:
        // as a root (to answer GATHER) or as a subscriber ourselves.
        // Anything else would let strangers grow our state without bound.
        let interested = rt.topology.am_root(rt)
            || rt.network(nwid).map(|nw| nw.subscribed_to(&group)).unwrap_or(false);
        if interested {
            rt.mc.add(rt, now, nwid, group, peer.address());
        }
    }
    Ok(())
}

fn do_network_membership_certificate<App: NodeHost>(
    rt: &RuntimeEnvironment<App>,
    sw: &Switch,
    peer: &Arc<Peer>,
    packet: &Packet,
    local: &InetAddress,
    remote: &InetAddress,
    now: i64,
) -> Result<(), FaultType> {
    let _ = peer;
    let b = packet.buf();
    let mut c = PAYLOAD_START;
    let mut parked = false;
    let mut coms = Vec::new();
    while c < b.len() {
        coms.push(CertificateOfMembership::unmarshal(b, &mut c)?);
    }
    for com in coms {
        let Some(network) = rt.network(com.network_id()) else {
            continue;
        };
        let controller_id = rt.topology.get_peer(network.controller()).map(|p| p.identity().clone());
        match network.add_membership_certificate(controller_id.as_ref(), com) {
            Ok(()) => {}
            Err(ComVerifyError::ControllerUnknown(ctrl)) => {
                if !parked {
                    sw.queue_rx_decrypted(rt, packet.clone(), ctrl, local, remote, now);
                    parked = true;
                }
            }
            Err(ComVerifyError::Invalid) => return Err(FaultType::AuthenticationFailed),
        }
    }
    Ok(())
}

fn do_network_config_request<App: NodeHost>(
    rt: &RuntimeEnvironment<App>,
    sw: &Switch,
    peer: &Arc<Peer>,
    packet: &Packet,
    now: i64,
) -> Result<(), FaultType> {
    let b = packet.buf();
    let mut c = PAYLOAD_START;
    let nwid = b.read_u64(&mut c)?;
    let meta_len = b.read_u16(&mut c)? as usize;
    let _meta = b.read_bytes(&mut c, meta_len)?;
    let have_revision = if c < b.len() { b.read_u64(&mut c)? } else { 0 };

    let controller = rt.controller.read().unwrap().clone();
    let Some(controller) = controller else {
        let mut err = Packet::new(rt.prng.next_u64(), peer.address(), rt.address(), Verb::Error);
        let eb = err.buf_mut();
        eb.append_u8(Verb::NetworkConfigRequest as u8)?;
        eb.append_u64(packet.packet_id())?;
        eb.append_u8(ErrorCode::UnsupportedOperation as u8)?;
        eb.append_u64(nwid)?;
        sw.send(rt, err, true, now);
        return Ok(());
    };

    match controller.request_config(peer.identity(), nwid, have_revision) {
        NetworkControllerResult::Ok(blob) => {
            let mut ok = Packet::new(rt.prng.next_u64(), peer.address(), rt.address(), Verb::Ok);
            let ob = ok.buf_mut();
            ob.append_u8(Verb::NetworkConfigRequest as u8)?;
            ob.append_u64(packet.packet_id())?;
            ob.append_u64(nwid)?;
            ob.append_u16(blob.len() as u16)?;
            ob.append_bytes(&blob)?;
            sw.send(rt, ok, true, now);
        }
        result @ (NetworkControllerResult::AccessDenied | NetworkControllerResult::NotFound) => {
            let code = if matches!(result, NetworkControllerResult::NotFound) {
                ErrorCode::ObjNotFound
            } else {
                ErrorCode::NetworkAccessDenied
            };
            let mut err = Packet::new(rt.prng.next_u64(), peer.address(), rt.address(), Verb::Error);
            let eb = err.buf_mut();
            eb.append_u8(Verb::NetworkConfigRequest as u8)?;
            eb.append_u64(packet.packet_id())?;
            eb.append_u8(code as u8)?;
            eb.append_u64(nwid)?;
            sw.send(rt, err, true, now);
        }
    }
    Ok(())
}

fn do_network_config_refresh<App: NodeHost>(
    rt: &RuntimeEnvironment<App>,
    peer: &Arc<Peer>,
    packet: &Packet,
    now: i64,
) -> Result<(), FaultType> {
    let b = packet.buf();
    let mut c = PAYLOAD_START;
    while c < b.len() {
        let nwid = b.read_u64(&mut c)?;
        // Only the network's own controller may force a refresh.
        if peer.address() == controller_for(nwid) {
            if let Some(network) = rt.network(nwid) {
                network.request_configuration(rt, now);
            }
        }
    }
    Ok(())
}

fn do_multicast_gather<App: NodeHost>(
    rt: &RuntimeEnvironment<App>,
    sw: &Switch,
    peer: &Arc<Peer>,
    packet: &Packet,
    now: i64,
) -> Result<(), FaultType> {
    let b = packet.buf();
    let mut c = PAYLOAD_START;
    let nwid = b.read_u64(&mut c)?;
    let flags = b.read_u8(&mut c)?;
    let mac = Mac::unmarshal(b, &mut c)?;
    let adi = b.read_u32(&mut c)?;
    let gather_limit = b.read_u32(&mut c)?;
    if flags & crate::multicaster::MULTICAST_FLAG_HAS_COM != 0 {
        let com = CertificateOfMembership::unmarshal(b, &mut c)?;
        if let Some(network) = rt.network(nwid) {
            let controller_id = rt.topology.get_peer(network.controller()).map(|p| p.identity().clone());
            let _ = network.add_membership_certificate(controller_id.as_ref(), com);
        }
    }
    let group = MulticastGroup::new(mac, adi);

    let mut ok = Packet::new(rt.prng.next_u64(), peer.address(), rt.address(), Verb::Ok);
    let ob = ok.buf_mut();
    ob.append_u8(Verb::MulticastGather as u8)?;
    ob.append_u64(packet.packet_id())?;
    ob.append_u64(nwid)?;
    mac.marshal(ob)?;
    ob.append_u32(adi)?;
    if rt.mc.gather(rt, peer.address(), nwid, group, gather_limit, &mut ok) > 0 {
        sw.send(rt, ok, true, now);
    }
    Ok(())
}

fn do_multicast_frame<App: NodeHost>(
    rt: &RuntimeEnvironment<App>,
    sw: &Switch,
    peer: &Arc<Peer>,
    packet: &Packet,
    local: &InetAddress,
    remote: &InetAddress,
    now: i64,
) -> Result<(), FaultType> {
    let b = packet.buf();
    let mut c = PAYLOAD_START;
    let nwid = b.read_u64(&mut c)?;
    let flags = b.read_u8(&mut c)?;
    let gather_limit = if flags & crate::multicaster::MULTICAST_FLAG_GATHER_LIMIT != 0 { b.read_u32(&mut c)? } else { 0 };
    let com = if flags & crate::multicaster::MULTICAST_FLAG_HAS_COM != 0 {
        Some(CertificateOfMembership::unmarshal(b, &mut c)?)
    } else {
        None
    };
    let src_mac = if flags & crate::multicaster::MULTICAST_FLAG_HAS_SOURCE_MAC != 0 { Some(Mac::unmarshal(b, &mut c)?) } else { None };
    let dest_mac = Mac::unmarshal(b, &mut c)?;
    let adi = b.read_u32(&mut c)?;
    let ethertype = b.read_u16(&mut c)?;
    let payload_at = c;
    let group = MulticastGroup::new(dest_mac, adi);

    let Some(network) = rt.network(nwid) else {
        return Ok(());
    };
    if let Some(com) = com {
        let controller_id = rt.topology.get_peer(network.controller()).map(|p| p.identity().clone());
        match network.add_membership_certificate(controller_id.as_ref(), com) {
            Ok(()) => {}
            Err(ComVerifyError::ControllerUnknown(ctrl)) => {
                sw.queue_rx_decrypted(rt, packet.clone(), ctrl, local, remote, now);
                return Ok(());
            }
            Err(ComVerifyError::Invalid) => return Err(FaultType::AuthenticationFailed),
        }
    }
    if !gate_frame(rt, sw, peer, &network, Verb::MulticastFrame, packet.packet_id(), now) {
        return Ok(());
    }

    let b = packet.buf();
    let payload = b.bytes_at(payload_at, b.len() - payload_at)?;
    if !payload.is_empty()
        && network.subscribed_to(&group)
        && network.filter_frame(ethertype).is_ok()
    {
        let from = src_mac.unwrap_or_else(|| network.mac_for_member(peer.address()));
        if from != network.mac() {
            rt.host.frame_deliver(nwid, from, dest_mac, ethertype, 0, payload);
        }
    }

    if gather_limit > 0 {
        let mut ok = Packet::new(rt.prng.next_u64(), peer.address(), rt.address(), Verb::Ok);
        let ob = ok.buf_mut();
        ob.append_u8(Verb::MulticastFrame as u8)?;
        ob.append_u64(packet.packet_id())?;
        ob.append_u64(nwid)?;
        dest_mac.marshal(ob)?;
        ob.append_u32(adi)?;
        ob.append_u8(crate::multicaster::MULTICAST_FLAG_GATHER_LIMIT)?;
        if rt.mc.gather(rt, peer.address(), nwid, group, gather_limit, &mut ok) > 0 {
            sw.send(rt, ok, true, now);
        }
    }
    Ok(())
}

/* Circuit tests */

fn circuit_test_signable(test_id: u64, timestamp: u64, originator: Address) -> [u8; 21] {
    let mut msg = [0u8; 21];
    msg[..8].copy_from_slice(&test_id.to_be_bytes());
    msg[8..16].copy_from_slice(&timestamp.to_be_bytes());
    msg[16..].copy_from_slice(&originator.to_bytes());
    msg
}

fn do_circuit_test<App: NodeHost>(
    rt: &RuntimeEnvironment<App>,
    sw: &Switch,
    peer: &Arc<Peer>,
    packet: &Packet,
    local: &InetAddress,
    remote: &InetAddress,
    now: i64,
) -> Result<(), FaultType> {
    let _ = peer;
    let b = packet.buf();
    let mut c = PAYLOAD_START;
    let test_id = b.read_u64(&mut c)?;
    let timestamp = b.read_u64(&mut c)?;
    let originator = Address::unmarshal(b, &mut c)?;
    let sig_len = b.read_u16(&mut c)? as usize;
    let sig = b.read_bytes(&mut c, sig_len)?.to_vec();
    let hop_idx_at = c;
    let hop_idx = b.read_u8(&mut c)? as usize;
    let hop_count = b.read_u8(&mut c)? as usize;

    let Some(originator_peer) = rt.topology.get_peer(originator) else {
        sw.queue_rx_decrypted(rt, packet.clone(), originator, local, remote, now);
        return Ok(());
    };
    if !originator_peer.identity().verify(&circuit_test_signable(test_id, timestamp, originator), &sig) {
        return Err(FaultType::AuthenticationFailed);
    }
    // Only parties that already hold authority over us may probe: roots,
    // or the controller of a network we joined.
    let authorized = rt.topology.is_root_address(originator)
        || rt.networks_snapshot().iter().any(|nw| nw.controller() == originator);
    if !authorized {
        return Err(FaultType::BadParameter);
    }

    // Report back to the originator.
    let mut report = Packet::new(rt.prng.next_u64(), originator, rt.address(), Verb::CircuitTestReport);
    {
        let rb = report.buf_mut();
        rb.append_u64(test_id)?;
        rb.append_u64(now as u64)?;
        rt.address().marshal(rb)?;
        rb.append_u8(hop_idx as u8)?;
        remote.marshal(rb)?;
    }
    sw.send(rt, report, true, now);

    // Forward to the next hop's addresses, bumping the hop index in place.
    if hop_idx < hop_count {
        // Seek over earlier hops to our own entry.
        for _ in 0..hop_idx {
            let breadth = b.read_u8(&mut c)? as usize;
            b.bytes_at(c, breadth * 5)?;
            c += breadth * 5;
        }
        let breadth = b.read_u8(&mut c)? as usize;
        let mut next_hops = Vec::with_capacity(breadth);
        for _ in 0..breadth {
            next_hops.push(Address::unmarshal(b, &mut c)?);
        }
        for next in next_hops {
            if next == rt.address() || next.is_reserved() {
                continue;
            }
            let mut fwd = packet.clone();
            fwd.set_packet_id(rt.prng.next_u64());
            fwd.set_destination(next);
            let _ = fwd.buf_mut().set_u8_at(hop_idx_at, (hop_idx + 1) as u8);
            sw.send(rt, fwd, true, now);
        }
    }
    Ok(())
}

fn do_circuit_test_report<App: NodeHost>(
    rt: &RuntimeEnvironment<App>,
    peer: &Arc<Peer>,
    packet: &Packet,
) -> Result<(), FaultType> {
    let b = packet.buf();
    let mut c = PAYLOAD_START;
    let test_id = b.read_u64(&mut c)?;
    let hop_ts = b.read_u64(&mut c)?;
    let reporter = Address::unmarshal(b, &mut c)?;
    let hop_idx = b.read_u8(&mut c)?;
    let upstream = InetAddress::unmarshal(b, &mut c)?;
    rt.host.event(Event::Trace(format!(
        "circuit test {:016x}: hop {} reported by {} (via {}, upstream {}, at {})",
        test_id,
        hop_idx,
        reporter,
        peer.address(),
        upstream,
        hop_ts
    )));
    Ok(())
}
