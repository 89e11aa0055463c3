/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::buffer::{Buffer, BufferOverflow};

/// Address family bytes used in the wire form of an InetAddress.
const FAMILY_NIL: u8 = 0;
const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

/// Classification of an IP by where it can be routed.
///
/// The numeric order doubles as the preference order for physical path
/// selection: higher is preferred.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[repr(u8)]
pub enum IpScope {
    None = 0,          // nil or not an IP
    Multicast = 1,     // 224.0.0.0/4 and ff00::/8
    Loopback = 2,      // 127.0.0.0/8, ::1
    PseudoPrivate = 3, // unofficially unrouted IPv4 blocks often "bogarted"
    Global = 4,        // globally routable
    LinkLocal = 5,     // 169.254.0.0/16, fe80::/10
    Shared = 6,        // 100.64.0.0/10 carrier-grade NAT space
    Private = 7,       // 10/8, 172.16/12, 192.168/16, fc00::/7
}

/// An IP endpoint (or nothing).
///
/// Doubles as a CIDR route/network spec: in that use the port field holds the
/// number of prefix bits instead of a port.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum InetAddress {
    Nil,
    V4(Ipv4Addr, u16),
    V6(Ipv6Addr, u16),
}

impl InetAddress {
    pub fn from_ip_port(ip: IpAddr, port: u16) -> Self {
        match ip {
            IpAddr::V4(v4) => Self::V4(v4, port),
            IpAddr::V6(v6) => Self::V6(v6, port),
        }
    }

    #[inline(always)]
    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Self::Nil => None,
            Self::V4(ip, _) => Some(IpAddr::V4(*ip)),
            Self::V6(ip, _) => Some(IpAddr::V6(*ip)),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Self::Nil => 0,
            Self::V4(_, p) | Self::V6(_, p) => *p,
        }
    }

    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Nil => None,
            Self::V4(ip, p) => Some(SocketAddr::new(IpAddr::V4(*ip), *p)),
            Self::V6(ip, p) => Some(SocketAddr::new(IpAddr::V6(*ip), *p)),
        }
    }

    pub fn is_v4(&self) -> bool {
        matches!(self, Self::V4(_, _))
    }

    pub fn is_v6(&self) -> bool {
        matches!(self, Self::V6(_, _))
    }

    pub fn ip_scope(&self) -> IpScope {
        match self {
            Self::Nil => IpScope::None,
            Self::V4(ip, _) => {
                let b = ip.octets();
                let w = u32::from_be_bytes(b);
                match b[0] {
                    0x00 | 0xff => IpScope::None, // 0/8 reserved, 255/8 broadcast
                    0x0a => IpScope::Private,     // 10.0.0.0/8
                    0x7f => IpScope::Loopback,    // 127.0.0.0/8
                    // Unofficially unrouted blocks historically squatted on
                    // for private use.
                    0x06 | 0x0b | 0x15 | 0x16 | 0x19 | 0x1a | 0x1c | 0x1d | 0x1e | 0x2c | 0x33 | 0x37 | 0x38 => {
                        IpScope::PseudoPrivate
                    }
                    0x64 if (w & 0xffc0_0000) == 0x6440_0000 => IpScope::Shared, // 100.64.0.0/10
                    0xa9 if (w & 0xffff_0000) == 0xa9fe_0000 => IpScope::LinkLocal, // 169.254.0.0/16
                    0xac if (w & 0xfff0_0000) == 0xac10_0000 => IpScope::Private, // 172.16.0.0/12
                    0xc0 if (w & 0xffff_0000) == 0xc0a8_0000 => IpScope::Private, // 192.168.0.0/16
                    _ => match w >> 28 {
                        0xe => IpScope::Multicast,     // 224.0.0.0/4
                        0xf => IpScope::PseudoPrivate, // 240.0.0.0/4 reserved
                        _ => IpScope::Global,
                    },
                }
            }
            Self::V6(ip, _) => {
                let b = ip.octets();
                if b[0] == 0xff {
                    return IpScope::Multicast; // ff00::/8
                }
                if b[0] == 0xfe && (b[1] & 0xc0) == 0x80 {
                    // fe80::1/128 is another spelling of loopback
                    if b[2..15].iter().all(|x| *x == 0) && b[15] == 0x01 {
                        return IpScope::Loopback;
                    }
                    return IpScope::LinkLocal; // fe80::/10
                }
                if (b[0] & 0xfe) == 0xfc {
                    return IpScope::Private; // fc00::/7
                }
                if b[..15].iter().all(|x| *x == 0) {
                    if b[15] == 0x01 {
                        return IpScope::Loopback; // ::1/128
                    }
                    if b[15] == 0x00 {
                        return IpScope::None; // ::/128
                    }
                }
                IpScope::Global
            }
        }
    }

    /// Treat this as a CIDR spec (port field = prefix bits) and test whether
    /// an endpoint falls inside it. Families must match; nil matches nothing.
    pub fn network_contains(&self, addr: &InetAddress) -> bool {
        fn prefix_match(net: &[u8], ip: &[u8], mut bits: u16) -> bool {
            if bits as usize > net.len() * 8 {
                return false;
            }
            let mut i = 0;
            while bits >= 8 {
                if net[i] != ip[i] {
                    return false;
                }
                i += 1;
                bits -= 8;
            }
            if bits > 0 {
                let mask = 0xffu8 << (8 - bits);
                if (net[i] & mask) != (ip[i] & mask) {
                    return false;
                }
            }
            true
        }
        match (self, addr) {
            (Self::V4(net, bits), Self::V4(ip, _)) => prefix_match(&net.octets(), &ip.octets(), *bits),
            (Self::V6(net, bits), Self::V6(ip, _)) => prefix_match(&net.octets(), &ip.octets(), *bits),
            _ => false,
        }
    }

    pub fn marshal<const C: usize>(&self, b: &mut Buffer<C>) -> Result<(), BufferOverflow> {
        match self {
            Self::Nil => b.append_u8(FAMILY_NIL),
            Self::V4(ip, port) => {
                b.append_u8(FAMILY_V4)?;
                b.append_bytes(&ip.octets())?;
                b.append_u16(*port)
            }
            Self::V6(ip, port) => {
                b.append_u8(FAMILY_V6)?;
                b.append_bytes(&ip.octets())?;
                b.append_u16(*port)
            }
        }
    }

    /// Deserialize. Unknown family bytes are treated as the reserved
    /// length-prefixed form and skipped, yielding Nil, so that new address
    /// families do not break old nodes.
    pub fn unmarshal<const C: usize>(b: &Buffer<C>, cursor: &mut usize) -> Result<Self, BufferOverflow> {
        match b.read_u8(cursor)? {
            FAMILY_NIL => Ok(Self::Nil),
            FAMILY_V4 => {
                let ip: [u8; 4] = b.read_bytes(cursor, 4)?.try_into().unwrap();
                let port = b.read_u16(cursor)?;
                Ok(Self::V4(Ipv4Addr::from(ip), port))
            }
            FAMILY_V6 => {
                let ip: [u8; 16] = b.read_bytes(cursor, 16)?.try_into().unwrap();
                let port = b.read_u16(cursor)?;
                Ok(Self::V6(Ipv6Addr::from(ip), port))
            }
            _ => {
                let skip = b.read_u16(cursor)? as usize;
                b.read_bytes(cursor, skip)?;
                Ok(Self::Nil)
            }
        }
    }
}

impl Default for InetAddress {
    fn default() -> Self {
        Self::Nil
    }
}

impl From<SocketAddr> for InetAddress {
    fn from(sa: SocketAddr) -> Self {
        Self::from_ip_port(sa.ip(), sa.port())
    }
}

impl fmt::Display for InetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => f.write_str("(nil)"),
            Self::V4(ip, p) => write!(f, "{}/{}", ip, p),
            Self::V6(ip, p) => write!(f, "{}/{}", ip, p),
        }
    }
}

impl fmt::Debug for InetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InetAddress({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> InetAddress {
        InetAddress::V4(s.parse().unwrap(), 9993)
    }
    fn v6(s: &str) -> InetAddress {
        InetAddress::V6(s.parse().unwrap(), 9993)
    }

    #[test]
    fn scope_classification() {
        assert_eq!(v4("127.0.0.1").ip_scope(), IpScope::Loopback);
        assert_eq!(v4("10.1.2.3").ip_scope(), IpScope::Private);
        assert_eq!(v4("172.16.0.1").ip_scope(), IpScope::Private);
        assert_eq!(v4("172.32.0.1").ip_scope(), IpScope::Global);
        assert_eq!(v4("192.168.55.1").ip_scope(), IpScope::Private);
        assert_eq!(v4("100.64.0.1").ip_scope(), IpScope::Shared);
        assert_eq!(v4("100.128.0.1").ip_scope(), IpScope::Global);
        assert_eq!(v4("169.254.10.10").ip_scope(), IpScope::LinkLocal);
        assert_eq!(v4("224.0.0.251").ip_scope(), IpScope::Multicast);
        assert_eq!(v4("28.11.12.13").ip_scope(), IpScope::PseudoPrivate);
        assert_eq!(v4("8.8.8.8").ip_scope(), IpScope::Global);
        assert_eq!(v6("fe80::1234").ip_scope(), IpScope::LinkLocal);
        assert_eq!(v6("fe80::1").ip_scope(), IpScope::Loopback);
        assert_eq!(v6("::1").ip_scope(), IpScope::Loopback);
        assert_eq!(v6("fc00::1").ip_scope(), IpScope::Private);
        assert_eq!(v6("fd12:3456::1").ip_scope(), IpScope::Private);
        assert_eq!(v6("ff02::fb").ip_scope(), IpScope::Multicast);
        assert_eq!(v6("2001:db8::1").ip_scope(), IpScope::Global);
        assert_eq!(InetAddress::Nil.ip_scope(), IpScope::None);
    }

    #[test]
    fn scope_preference_order() {
        assert!(IpScope::Private > IpScope::Shared);
        assert!(IpScope::Shared > IpScope::LinkLocal);
        assert!(IpScope::LinkLocal > IpScope::Global);
        assert!(IpScope::Global > IpScope::PseudoPrivate);
        assert!(IpScope::PseudoPrivate > IpScope::Loopback);
        assert!(IpScope::Loopback > IpScope::Multicast);
        assert!(IpScope::Multicast > IpScope::None);
    }

    #[test]
    fn wire_round_trip_and_unknown_family_skip() {
        let mut b: Buffer<64> = Buffer::new();
        v4("1.2.3.4").marshal(&mut b).unwrap();
        InetAddress::Nil.marshal(&mut b).unwrap();
        // A hypothetical future family: type 9 with a 16-bit length prefix.
        b.append_u8(9).unwrap();
        b.append_u16(3).unwrap();
        b.append_bytes(&[0xaa, 0xbb, 0xcc]).unwrap();
        v6("fe80::1234").marshal(&mut b).unwrap();

        let mut c = 0;
        assert_eq!(InetAddress::unmarshal(&b, &mut c).unwrap(), v4("1.2.3.4"));
        assert_eq!(InetAddress::unmarshal(&b, &mut c).unwrap(), InetAddress::Nil);
        assert_eq!(InetAddress::unmarshal(&b, &mut c).unwrap(), InetAddress::Nil);
        assert_eq!(InetAddress::unmarshal(&b, &mut c).unwrap(), v6("fe80::1234"));
        assert_eq!(c, b.len());
    }

    #[test]
    fn cidr_containment() {
        let net = InetAddress::V4("10.0.0.0".parse().unwrap(), 8);
        assert!(net.network_contains(&v4("10.99.1.2")));
        assert!(!net.network_contains(&v4("11.0.0.1")));
        assert!(!net.network_contains(&v6("fc00::1")));
        let net6 = InetAddress::V6("fd00::".parse().unwrap(), 8);
        assert!(net6.network_contains(&v6("fdff::9")));
        assert!(!net6.network_contains(&v6("fe80::9")));
    }
}
