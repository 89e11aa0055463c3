/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

//! Shared fixtures for unit tests. Identity generation runs the memory-hard
//! hashcash search, so tests draw from one lazily generated pool instead of
//! each paying for their own.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock, RwLock};

use crate::applicationlayer::{Event, NodeHost, VirtualNetworkConfig, VirtualNetworkConfigOperation};
use crate::crypto::random::SalsaPrng;
use crate::identity::Identity;
use crate::inetaddress::InetAddress;
use crate::mac::Mac;
use crate::multicaster::Multicaster;
use crate::runtime::RuntimeEnvironment;
use crate::selfawareness::SelfAwareness;
use crate::switch::Switch;
use crate::topology::Topology;

static POOL: OnceLock<Vec<Identity>> = OnceLock::new();

/// A stable, process-wide test identity. Indexes 0..4 are valid.
pub fn identity(i: usize) -> &'static Identity {
    &POOL.get_or_init(|| (0..4).map(|_| Identity::generate()).collect())[i]
}

/// Host stub that records callback invocations.
#[derive(Default)]
pub struct LoopHost {
    pub wire: Mutex<Vec<(InetAddress, InetAddress, Vec<u8>)>>,
    pub frames: Mutex<Vec<(u64, Mac, Mac, u16, Vec<u8>)>>,
}

impl NodeHost for LoopHost {
    fn wire_send(&self, local: &InetAddress, remote: &InetAddress, data: &[u8], _ttl: u32) -> bool {
        self.wire.lock().unwrap().push((local.clone(), remote.clone(), data.to_vec()));
        true
    }

    fn frame_deliver(&self, nwid: u64, source_mac: Mac, dest_mac: Mac, ethertype: u16, _vlan_id: u16, data: &[u8]) {
        self.frames.lock().unwrap().push((nwid, source_mac, dest_mac, ethertype, data.to_vec()));
    }

    fn virtual_network_config(&self, _nwid: u64, _op: VirtualNetworkConfigOperation, _config: &VirtualNetworkConfig) -> i32 {
        0
    }

    fn data_store_get(&self, _name: &str) -> Option<Vec<u8>> {
        None
    }

    fn data_store_put(&self, _name: &str, _data: &[u8], _secure: bool) -> bool {
        true
    }

    fn event(&self, _event: Event) {}
}

/// A runtime environment around `identity(0)` and a recording host.
pub fn runtime() -> RuntimeEnvironment<LoopHost> {
    RuntimeEnvironment {
        host: LoopHost::default(),
        identity: identity(0).clone(),
        prng: SalsaPrng::new(),
        topology: Topology::new(),
        sw: Switch::new(),
        mc: Multicaster::new(),
        sa: SelfAwareness::new(),
        networks: RwLock::new(HashMap::new()),
        controller: RwLock::new(None),
    }
}
