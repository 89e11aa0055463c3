/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */
pub mod crypto;

pub mod address;
pub mod applicationlayer;
pub mod buffer;
pub mod certificateofmembership;
mod deferred;
pub mod dictionary;
pub mod error;
pub mod identity;
mod incoming;
pub mod inetaddress;
pub mod mac;
pub mod multicastgroup;
pub mod multicaster;
pub mod network;
pub mod networkconfig;
pub mod node;
pub mod packet;
mod path;
pub mod peer;
pub mod proto;
pub mod runtime;
pub mod selfawareness;
pub mod switch;
pub mod topology;
mod util;
pub mod world;

#[cfg(test)]
pub(crate) mod testutil;

pub use crate::address::Address;
pub use crate::applicationlayer::{
    Event, NetworkController, NetworkControllerResult, NodeHost, VirtualNetworkConfig,
    VirtualNetworkConfigOperation, VirtualNetworkRoute, VirtualNetworkStatus, VirtualNetworkType,
};
pub use crate::identity::Identity;
pub use crate::inetaddress::{InetAddress, IpScope};
pub use crate::mac::Mac;
pub use crate::multicastgroup::MulticastGroup;
pub use crate::networkconfig::{NetworkConfig, Rule, RuleSpec};
pub use crate::node::{Node, NodeStatus, PeerRole, PeerStatus, ResultCode};
pub use crate::world::{Root, World};
