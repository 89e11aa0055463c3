/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::fmt;

use crate::inetaddress::InetAddress;
use crate::mac::Mac;

/// A multicast group: a multicast MAC plus a 32-bit ADI field.
///
/// ADI (additional distinguishing information) exists mostly for broadcast
/// (ff:ff:ff:ff:ff:ff) memberships, since straight-up broadcast won't scale.
/// For IPv4 ARP the ADI holds the queried IP itself, turning ARP into a
/// selective multicast. Everywhere else it is zero.
///
/// Behaves as an immutable value object and orders by (MAC, ADI) so it can
/// key sorted containers.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MulticastGroup {
    mac: Mac,
    adi: u32,
}

impl MulticastGroup {
    pub fn new(mac: Mac, adi: u32) -> Self {
        Self { mac, adi }
    }

    /// The group used for address resolution (ARP/NDP) of an IP.
    pub fn derive_for_address_resolution(ip: &InetAddress) -> Option<Self> {
        match ip {
            InetAddress::V4(v4, _) => {
                // IPv4 ARP wants Ethernet broadcast, so the queried address
                // goes in the ADI to scope it.
                Some(Self::new(Mac::from_u64(0xffff_ffff_ffff), u32::from_be_bytes(v4.octets())))
            }
            InetAddress::V6(v6, _) => {
                // IPv6 solicited-node multicast: 33:33:ff + low 24 bits.
                let o = v6.octets();
                Some(Self::new(Mac::from_bytes(&[0x33, 0x33, 0xff, o[13], o[14], o[15]]), 0))
            }
            InetAddress::Nil => None,
        }
    }

    #[inline(always)]
    pub fn mac(&self) -> Mac {
        self.mac
    }

    #[inline(always)]
    pub fn adi(&self) -> u32 {
        self.adi
    }
}

impl fmt::Display for MulticastGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:08x}", self.mac, self.adi)
    }
}

impl fmt::Debug for MulticastGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MulticastGroup({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arp_derivation_scopes_broadcast_by_ip() {
        let ip = InetAddress::V4("10.1.2.3".parse().unwrap(), 0);
        let g = MulticastGroup::derive_for_address_resolution(&ip).unwrap();
        assert!(g.mac().is_broadcast());
        assert_eq!(g.adi(), 0x0a010203);
    }

    #[test]
    fn ndp_derivation_uses_solicited_node_mac() {
        let ip = InetAddress::V6("fd00::1234:5678".parse().unwrap(), 0);
        let g = MulticastGroup::derive_for_address_resolution(&ip).unwrap();
        assert_eq!(g.mac().to_bytes(), [0x33, 0x33, 0xff, 0x34, 0x56, 0x78]);
        assert_eq!(g.adi(), 0);
        assert!(MulticastGroup::derive_for_address_resolution(&InetAddress::Nil).is_none());
    }

    #[test]
    fn ordering_is_by_mac_then_adi() {
        let a = MulticastGroup::new(Mac::from_u64(1), 5);
        let b = MulticastGroup::new(Mac::from_u64(1), 6);
        let c = MulticastGroup::new(Mac::from_u64(2), 0);
        assert!(a < b && b < c);
    }
}
