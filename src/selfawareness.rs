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
use crate::inetaddress::{InetAddress, IpScope};
use crate::runtime::RuntimeEnvironment;

const ENTRY_TIMEOUT: i64 = 600_000;

struct SurfaceEntry {
    reported: InetAddress,
    reporter: Address,
    timestamp: i64,
}

/// Tracks how the outside world sees us.
///
/// Trusted peers report the external address our packets arrive from (in
/// OK(HELLO)). When that surface changes within a scope it means NAT
/// re-mapped us or connectivity moved; paths negotiated under the old
/// surface are then torn down in that scope so everything re-confirms
/// against reality.
pub struct SelfAwareness {
    surface: Mutex<HashMap<IpScope, SurfaceEntry>>,
}

impl SelfAwareness {
    pub fn new() -> Self {
        Self { surface: Mutex::new(HashMap::new()) }
    }

    /// Process an external-address report from `reporter`. Only reports from
    /// trusted peers (roots) may trigger path resets.
    pub fn iam<App: NodeHost>(
        &self,
        rt: &RuntimeEnvironment<App>,
        reporter: Address,
        reported: &InetAddress,
        trusted: bool,
        now: i64,
    ) {
        let scope = reported.ip_scope();
        if !matches!(scope, IpScope::Global | IpScope::Shared | IpScope::Private) {
            return;
        }
        let changed = {
            let mut surface = self.surface.lock().unwrap();
            match surface.get_mut(&scope) {
                Some(entry) => {
                    let changed = entry.reported != *reported;
                    if !changed || trusted {
                        entry.reported = reported.clone();
                        entry.reporter = reporter;
                        entry.timestamp = now;
                    }
                    changed && trusted
                }
                None => {
                    surface.insert(scope, SurfaceEntry { reported: reported.clone(), reporter, timestamp: now });
                    false
                }
            }
        };
        if changed {
            rt.trace(format!("external surface in scope {:?} changed to {} (reported by {})", scope, reported, reporter));
            rt.topology.each_peer(|p| p.reset_paths_in_scope(scope));
        }
    }

    /// Our external address in a scope, if anyone told us recently.
    pub fn external_address(&self, scope: IpScope, now: i64) -> Option<InetAddress> {
        let surface = self.surface.lock().unwrap();
        surface
            .get(&scope)
            .filter(|e| (now - e.timestamp) < ENTRY_TIMEOUT)
            .map(|e| e.reported.clone())
    }

    pub fn clean(&self, now: i64) {
        self.surface.lock().unwrap().retain(|_, e| (now - e.timestamp) < ENTRY_TIMEOUT);
    }
}

impl Default for SelfAwareness {
    fn default() -> Self {
        Self::new()
    }
}
