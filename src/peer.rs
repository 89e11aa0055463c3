/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::address::Address;
use crate::applicationlayer::NodeHost;
use crate::crypto::{Secret, PEER_KEY_SIZE};
use crate::identity::Identity;
use crate::inetaddress::InetAddress;
use crate::packet::{Packet, Verb};
use crate::path::Path;
use crate::proto::*;
use crate::runtime::RuntimeEnvironment;

/// Snapshot of one physical path, for status queries.
#[derive(Clone, Debug)]
pub struct PathStatus {
    pub local: InetAddress,
    pub remote: InetAddress,
    pub last_send: i64,
    pub last_receive: i64,
    pub active: bool,
    pub preferred: bool,
}

struct PeerInner {
    paths: Vec<Path>,
    last_receive: i64,
    last_unicast_frame: i64,
    last_multicast_frame: i64,
    // Ring of recently seen packet IDs. IDs are random, so replay detection
    // is a membership test over a recent window, not a counter comparison.
    replay_window: [u64; REPLAY_WINDOW_SIZE],
    replay_ptr: usize,
    vproto: u8,
    vmajor: u8,
    vminor: u8,
    vrevision: u16,
    // Per network: when we last pushed our membership certificate to them.
    com_push: HashMap<u64, i64>,
}

/// A remote node with a verified identity.
///
/// Owns up to four physical paths and the long-term symmetric key derived
/// from identity agreement. Shared between the topology and any packet
/// dispatch running on this peer's behalf.
pub struct Peer {
    identity: Identity,
    key: Secret<PEER_KEY_SIZE>,
    latency_ms: AtomicU32,
    inner: Mutex<PeerInner>,
}

impl Peer {
    /// None if `ours` has no private key or agreement fails.
    pub fn new(ours: &Identity, theirs: Identity) -> Option<Self> {
        let shared = ours.agree(&theirs)?;
        Some(Self {
            identity: theirs,
            key: shared.first_n_clone::<PEER_KEY_SIZE>(),
            latency_ms: AtomicU32::new(u32::MAX),
            inner: Mutex::new(PeerInner {
                paths: Vec::with_capacity(MAX_PATHS_PER_PEER),
                last_receive: 0,
                last_unicast_frame: 0,
                last_multicast_frame: 0,
                replay_window: [0; REPLAY_WINDOW_SIZE],
                replay_ptr: 0,
                vproto: 0,
                vmajor: 0,
                vminor: 0,
                vrevision: 0,
                com_push: HashMap::new(),
            }),
        })
    }

    #[inline(always)]
    pub fn address(&self) -> Address {
        self.identity.address()
    }

    #[inline(always)]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// The per-peer packet key (first half of the SHA-512 expanded ECDH
    /// agreement).
    #[inline(always)]
    pub fn key(&self) -> &Secret<PEER_KEY_SIZE> {
        &self.key
    }

    /// Check a freshly authenticated packet ID against the replay window
    /// and record it. False means drop: we saw this ID recently.
    pub fn expect_packet_id(&self, packet_id: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.replay_window.contains(&packet_id) {
            return false;
        }
        let ptr = inner.replay_ptr;
        inner.replay_window[ptr] = packet_id;
        inner.replay_ptr = (ptr + 1) % REPLAY_WINDOW_SIZE;
        true
    }

    /// Account for an authenticated packet from this peer and learn the
    /// physical path it came in on if it was direct.
    pub fn received<App: NodeHost>(
        &self,
        rt: &RuntimeEnvironment<App>,
        local: &InetAddress,
        remote: &InetAddress,
        hops: u8,
        verb: Verb,
        now: i64,
    ) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.last_receive = now;
            match verb {
                Verb::Frame | Verb::ExtFrame => inner.last_unicast_frame = now,
                Verb::MulticastFrame => inner.last_multicast_frame = now,
                _ => {}
            }
            if hops != 0 || remote.is_nil() {
                return;
            }
            if let Some(p) = inner.paths.iter_mut().find(|p| p.matches(local, remote)) {
                p.received(now);
                return;
            }
        }

        // New direct path. The host gets a veto, outside our lock since it
        // is a callback.
        if !rt.host.path_check(local, remote) {
            return;
        }
        let mut candidate = Path::new(local.clone(), remote.clone());
        candidate.received(now);
        let mut inner = self.inner.lock().unwrap();
        if let Some(p) = inner.paths.iter_mut().find(|p| p.matches(local, remote)) {
            p.received(now); // raced another thread; it won
        } else if inner.paths.len() < MAX_PATHS_PER_PEER {
            inner.paths.push(candidate);
        } else {
            // Replace the worst slot, preferring to evict dead paths, but
            // only if the newcomer actually outscores it.
            if let Some(worst) = inner.paths.iter_mut().min_by_key(|p| (p.active(now), p.quality(now))) {
                if !worst.active(now) || worst.quality(now) < candidate.quality(now) {
                    *worst = candidate;
                }
            }
        }
    }

    pub fn last_receive(&self) -> i64 {
        self.inner.lock().unwrap().last_receive
    }

    /// Heard from at all recently?
    pub fn alive(&self, now: i64) -> bool {
        let lr = self.last_receive();
        lr != 0 && (now - lr) < PEER_ACTIVITY_TIMEOUT
    }

    /// Did actual network frames flow recently? Gates keepalive effort for
    /// non-upstream peers.
    pub fn recently_exchanged_frames(&self, now: i64) -> bool {
        let inner = self.inner.lock().unwrap();
        let last = inner.last_unicast_frame.max(inner.last_multicast_frame);
        last != 0 && (now - last) < PEER_FRAME_EXCHANGE_HORIZON
    }

    /// The best path: highest quality among active confirmed paths, falling
    /// back to the most recently used unconfirmed one.
    pub fn best_path(&self, now: i64) -> Option<(InetAddress, InetAddress)> {
        let inner = self.inner.lock().unwrap();
        let best_confirmed = inner
            .paths
            .iter()
            .filter(|p| p.active(now) && p.confirmed())
            .max_by_key(|p| p.quality(now));
        let chosen = best_confirmed.or_else(|| {
            inner
                .paths
                .iter()
                .filter(|p| p.active(now) || p.last_send() != 0)
                .max_by_key(|p| p.last_send())
        })?;
        Some((chosen.local().clone(), chosen.remote().clone()))
    }

    pub fn has_active_direct_path(&self, now: i64) -> bool {
        self.inner.lock().unwrap().paths.iter().any(|p| p.active(now))
    }

    pub fn path_statuses(&self, now: i64) -> Vec<PathStatus> {
        let best = self.best_path(now).map(|(_, r)| r);
        let inner = self.inner.lock().unwrap();
        inner
            .paths
            .iter()
            .map(|p| PathStatus {
                local: p.local().clone(),
                remote: p.remote().clone(),
                last_send: p.last_send(),
                last_receive: p.last_receive(),
                active: p.active(now),
                preferred: best.as_ref() == Some(p.remote()),
            })
            .collect()
    }

    /// Send pre-armored bytes down the best path. False if we have nowhere
    /// to send.
    pub fn send_direct<App: NodeHost>(&self, rt: &RuntimeEnvironment<App>, data: &[u8], now: i64) -> bool {
        let Some((local, remote)) = self.best_path(now) else {
            return false;
        };
        self.mark_path_sent(&local, &remote, now);
        rt.host.wire_send(&local, &remote, data, 0)
    }

    pub(crate) fn mark_path_sent(&self, local: &InetAddress, remote: &InetAddress, now: i64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(p) = inner.paths.iter_mut().find(|p| p.matches(local, remote)) {
            p.sent(now);
        }
    }

    /// Compose and send a HELLO to a specific physical address. This is the
    /// probe used for keepalive, path confirmation, and NAT traversal; it is
    /// MAC'd but never payload-encrypted so the receiver can read our
    /// identity before it has our key.
    pub fn send_hello<App: NodeHost>(&self, rt: &RuntimeEnvironment<App>, local: &InetAddress, remote: &InetAddress, now: i64, ttl: u32) -> bool {
        if remote.is_nil() || !rt.host.path_check(local, remote) {
            return false;
        }
        let (world_id, world_ts) = rt.topology.world_id_timestamp();
        let mut p = Packet::new(rt.prng.next_u64(), self.address(), rt.address(), Verb::Hello);
        let b = p.buf_mut();
        let ok = b.append_u8(PROTOCOL_VERSION).is_ok()
            && b.append_u8(VERSION_MAJOR).is_ok()
            && b.append_u8(VERSION_MINOR).is_ok()
            && b.append_u16(VERSION_REVISION).is_ok()
            && b.append_u64(now as u64).is_ok()
            && rt.identity.marshal(b, false).is_ok()
            && remote.marshal(b).is_ok()
            && b.append_u64(world_id).is_ok()
            && b.append_u64(world_ts as u64).is_ok();
        if !ok {
            return false;
        }
        p.armor(&self.key, false);
        self.mark_path_sent(local, remote, now);
        rt.host.wire_send(local, remote, p.buf().as_bytes(), ttl)
    }

    /// Periodic per-peer upkeep: re-HELLO stale paths per address family and
    /// NOP-keepalive fresh ones so NAT mappings stay warm. Returns true if
    /// this peer still has any active direct path.
    pub fn do_ping_and_keepalive<App: NodeHost>(&self, rt: &RuntimeEnvironment<App>, now: i64) -> bool {
        // Best path per family, copied out so no lock is held during sends.
        let mut targets: Vec<(InetAddress, InetAddress, i64, i64)> = Vec::new();
        {
            let inner = self.inner.lock().unwrap();
            for v6 in [false, true] {
                let best = inner
                    .paths
                    .iter()
                    .filter(|p| p.remote().is_v6() == v6 && (p.active(now) || (now - p.last_send()) < PEER_DIRECT_PING_DELAY))
                    .max_by_key(|p| p.quality(now));
                if let Some(p) = best {
                    targets.push((p.local().clone(), p.remote().clone(), p.last_send(), p.last_receive()));
                }
            }
        }
        for (local, remote, last_send, last_receive) in targets {
            if (now - last_receive) >= PEER_DIRECT_PING_DELAY {
                self.send_hello(rt, &local, &remote, now, 0);
            } else if (now - last_send) >= NAT_KEEPALIVE_DELAY {
                let mut nop = Packet::new(rt.prng.next_u64(), self.address(), rt.address(), Verb::Nop);
                nop.armor(&self.key, false);
                self.mark_path_sent(&local, &remote, now);
                rt.host.wire_send(&local, &remote, nop.buf().as_bytes(), 0);
            }
        }
        self.has_active_direct_path(now)
    }

    /// Drop paths whose remote falls in an IP scope whose external surface
    /// changed; they will re-confirm or die.
    pub fn reset_paths_in_scope(&self, scope: crate::inetaddress::IpScope) {
        self.inner.lock().unwrap().paths.retain(|p| p.scope() != scope);
    }

    pub fn set_remote_version(&self, proto: u8, major: u8, minor: u8, revision: u16) {
        let mut inner = self.inner.lock().unwrap();
        inner.vproto = proto;
        inner.vmajor = major;
        inner.vminor = minor;
        inner.vrevision = revision;
    }

    pub fn remote_version(&self) -> Option<(u8, u8, u8, u16)> {
        let inner = self.inner.lock().unwrap();
        if inner.vproto == 0 {
            None
        } else {
            Some((inner.vproto, inner.vmajor, inner.vminor, inner.vrevision))
        }
    }

    pub fn record_latency(&self, ms: u32) {
        // Smooth with the previous sample to keep one outlier from flapping
        // root selection.
        let prev = self.latency_ms.load(Ordering::Relaxed);
        let next = if prev == u32::MAX { ms } else { (prev * 3 + ms) / 4 };
        self.latency_ms.store(next, Ordering::Relaxed);
    }

    /// Measured round-trip latency in ms, or u32::MAX if never measured.
    pub fn latency(&self) -> u32 {
        self.latency_ms.load(Ordering::Relaxed)
    }

    /// True if this peer hasn't seen our membership certificate for `nwid`
    /// recently. With `update`, the push is recorded as happening now.
    pub fn needs_our_network_membership_certificate(&self, nwid: u64, now: i64, update: bool) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let last = inner.com_push.get(&nwid).copied().unwrap_or(0);
        let needs = (now - last) >= COM_PUSH_HORIZON;
        if needs && update {
            inner.com_push.insert(nwid, now);
        }
        needs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair_peer() -> (Identity, Peer) {
        let ours = crate::testutil::identity(0);
        let theirs = crate::testutil::identity(1).clone();
        let p = Peer::new(ours, theirs.clone()).unwrap();
        (theirs, p)
    }

    #[test]
    fn replay_window_rejects_recent_ids() {
        let (_, p) = keypair_peer();
        assert!(p.expect_packet_id(42));
        assert!(!p.expect_packet_id(42));
        for i in 0..REPLAY_WINDOW_SIZE as u64 {
            assert!(p.expect_packet_id(1000 + i));
        }
        // 42 has been pushed out of the window by now.
        assert!(p.expect_packet_id(42));
    }

    #[test]
    fn symmetric_keys_match() {
        let a = crate::testutil::identity(2);
        let b = crate::testutil::identity(3);
        let pa = Peer::new(a, b.clone()).unwrap();
        let pb = Peer::new(b, a.clone()).unwrap();
        assert_eq!(pa.key(), pb.key());
        assert!(Peer::new(&a.public_only(), b.clone()).is_none());
    }

    #[test]
    fn latency_smooths() {
        let (_, p) = keypair_peer();
        assert_eq!(p.latency(), u32::MAX);
        p.record_latency(100);
        assert_eq!(p.latency(), 100);
        p.record_latency(200);
        assert_eq!(p.latency(), 125);
    }

    #[test]
    fn com_push_horizon() {
        let (_, p) = keypair_peer();
        assert!(p.needs_our_network_membership_certificate(1, 1_000_000, true));
        assert!(!p.needs_our_network_membership_certificate(1, 1_000_000 + COM_PUSH_HORIZON / 2, false));
        assert!(p.needs_our_network_membership_certificate(1, 1_000_000 + COM_PUSH_HORIZON, false));
        // A different network is tracked separately.
        assert!(p.needs_our_network_membership_certificate(2, 1_000_000, false));
    }

    #[test]
    fn path_status_snapshot_without_paths() {
        let (_, p) = keypair_peer();
        assert!(p.best_path(1000).is_none());
        assert!(!p.has_active_direct_path(1000));
        assert!(p.path_statuses(1000).is_empty());
        assert!(!p.alive(1000));
    }
}
