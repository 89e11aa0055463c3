/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::address::Address;
use crate::applicationlayer::{Event, NetworkController, NodeHost};
use crate::crypto::random::SalsaPrng;
use crate::identity::Identity;
use crate::multicaster::Multicaster;
use crate::network::Network;
use crate::selfawareness::SelfAwareness;
use crate::switch::Switch;
use crate::topology::Topology;

/// Holds global state for one node instance.
///
/// The node owns this; the subsystems it contains hold no back-references
/// and instead receive `&RuntimeEnvironment` on every call, which is what
/// lets them call across each other without ownership cycles.
pub struct RuntimeEnvironment<App: NodeHost> {
    pub host: App,

    /// This node's identity, always with its private half.
    pub identity: Identity,

    /// Non-cryptographic randomness: jitter, member selection, packet IDs.
    pub prng: SalsaPrng,

    pub topology: Topology,
    pub sw: Switch,
    pub mc: Multicaster,
    pub sa: SelfAwareness,

    /// Joined networks by network ID. Lock order: this is the outermost
    /// lock in the system; nothing that holds any other internal lock may
    /// take it.
    pub networks: RwLock<HashMap<u64, Arc<Network>>>,

    /// Set when this node co-hosts a network controller.
    pub controller: RwLock<Option<Arc<dyn NetworkController>>>,
}

impl<App: NodeHost> RuntimeEnvironment<App> {
    #[inline(always)]
    pub fn address(&self) -> Address {
        self.identity.address()
    }

    pub fn network(&self, nwid: u64) -> Option<Arc<Network>> {
        self.networks.read().unwrap().get(&nwid).cloned()
    }

    pub fn networks_snapshot(&self) -> Vec<Arc<Network>> {
        self.networks.read().unwrap().values().cloned().collect()
    }

    pub fn trace(&self, msg: String) {
        self.host.event(Event::Trace(msg));
    }
}
