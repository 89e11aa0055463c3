/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use crate::inetaddress::{InetAddress, IpScope};
use crate::proto::PATH_ACTIVITY_TIMEOUT;

/// A physical link to a peer: the local socket address we send from and the
/// remote socket address we send to.
///
/// A path is *active* while packets keep arriving on it, and *confirmed*
/// once we have received on it after sending to it, which proves the remote
/// can actually reach us back through this tuple (and not just spoof its
/// source).
#[derive(Clone, Debug)]
pub struct Path {
    local: InetAddress,
    remote: InetAddress,
    last_send: i64,
    last_receive: i64,
    confirmed: bool,
}

impl Path {
    pub fn new(local: InetAddress, remote: InetAddress) -> Self {
        Self { local, remote, last_send: 0, last_receive: 0, confirmed: false }
    }

    #[inline(always)]
    pub fn local(&self) -> &InetAddress {
        &self.local
    }

    #[inline(always)]
    pub fn remote(&self) -> &InetAddress {
        &self.remote
    }

    pub fn matches(&self, local: &InetAddress, remote: &InetAddress) -> bool {
        // A nil local matches any local interface; the remote must be exact.
        &self.remote == remote && (self.local.is_nil() || local.is_nil() || &self.local == local)
    }

    pub fn sent(&mut self, now: i64) {
        self.last_send = now;
    }

    pub fn received(&mut self, now: i64) {
        self.last_receive = now;
        if self.last_send != 0 {
            self.confirmed = true;
        }
    }

    #[inline(always)]
    pub fn last_send(&self) -> i64 {
        self.last_send
    }

    #[inline(always)]
    pub fn last_receive(&self) -> i64 {
        self.last_receive
    }

    #[inline(always)]
    pub fn confirmed(&self) -> bool {
        self.confirmed
    }

    pub fn active(&self, now: i64) -> bool {
        self.last_receive != 0 && (now - self.last_receive) < PATH_ACTIVITY_TIMEOUT
    }

    pub fn scope(&self) -> IpScope {
        self.remote.ip_scope()
    }

    /// Relative quality for path selection: address scope dominates, recency
    /// of receive breaks ties within a scope.
    pub fn quality(&self, now: i64) -> u64 {
        let freshness = (PATH_ACTIVITY_TIMEOUT - (now - self.last_receive)).clamp(0, PATH_ACTIVITY_TIMEOUT) as u64;
        ((self.scope() as u64) << 32) | freshness
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(remote: &str) -> Path {
        Path::new(
            InetAddress::V4("0.0.0.0".parse().unwrap(), 9993),
            InetAddress::V4(remote.parse().unwrap(), 9993),
        )
    }

    #[test]
    fn liveness_and_confirmation() {
        let mut p = path("203.0.113.5");
        assert!(!p.active(1000));
        p.received(1000);
        assert!(p.active(1000 + PATH_ACTIVITY_TIMEOUT - 1));
        assert!(!p.active(1000 + PATH_ACTIVITY_TIMEOUT));
        // Receive before any send does not confirm.
        assert!(!p.confirmed());
        p.sent(2000);
        p.received(3000);
        assert!(p.confirmed());
    }

    #[test]
    fn quality_prefers_scope_over_freshness() {
        let now = 100_000;
        let mut private = path("10.0.0.1");
        let mut global = path("203.0.113.5");
        private.received(now - 50_000); // stale but private
        global.received(now); // fresh but global
        assert!(private.quality(now) > global.quality(now));

        let mut global2 = path("198.51.100.1");
        global2.received(now - 1_000);
        assert!(global.quality(now) > global2.quality(now));
    }
}
