/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::fmt;
use std::str::FromStr;

use crate::buffer::{Buffer, BufferOverflow};
use crate::error::ParseError;

/// Length of an address in wire form.
pub const ADDRESS_LENGTH: usize = 5;

/// Addresses beginning with this byte are reserved (broadcast, fragment
/// indicator on the wire) and can never be assigned to a node.
pub const ADDRESS_RESERVED_PREFIX: u8 = 0xff;

/// A 40-bit node address derived from the hashcash hash of an identity's
/// public key.
///
/// Zero is the nil address and is not valid on the wire.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(u64);

impl Address {
    #[inline(always)]
    pub fn from_u64(i: u64) -> Self {
        Self(i & 0xff_ffff_ffff)
    }

    pub fn from_bytes(b: &[u8; ADDRESS_LENGTH]) -> Self {
        Self(
            ((b[0] as u64) << 32)
                | ((b[1] as u64) << 24)
                | ((b[2] as u64) << 16)
                | ((b[3] as u64) << 8)
                | (b[4] as u64),
        )
    }

    #[inline(always)]
    pub fn to_u64(self) -> u64 {
        self.0
    }

    pub fn to_bytes(self) -> [u8; ADDRESS_LENGTH] {
        [
            (self.0 >> 32) as u8,
            (self.0 >> 24) as u8,
            (self.0 >> 16) as u8,
            (self.0 >> 8) as u8,
            self.0 as u8,
        ]
    }

    #[inline(always)]
    pub fn is_nil(self) -> bool {
        self.0 == 0
    }

    /// True if this address may never belong to a node: nil, or in the
    /// reserved 0xff prefix block.
    #[inline(always)]
    pub fn is_reserved(self) -> bool {
        self.0 == 0 || (self.0 >> 32) == (ADDRESS_RESERVED_PREFIX as u64)
    }

    pub fn marshal<const C: usize>(&self, b: &mut Buffer<C>) -> Result<(), BufferOverflow> {
        b.append_bytes(&self.to_bytes())
    }

    pub fn unmarshal<const C: usize>(b: &Buffer<C>, cursor: &mut usize) -> Result<Self, BufferOverflow> {
        let s = b.read_bytes(cursor, ADDRESS_LENGTH)?;
        Ok(Self::from_bytes(s.try_into().unwrap()))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:0>10x}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({:0>10x})", self.0)
    }
}

impl FromStr for Address {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != ADDRESS_LENGTH * 2 || !s.bytes().all(|c| c.is_ascii_hexdigit()) {
            return Err(ParseError::InvalidAddress);
        }
        u64::from_str_radix(s, 16).map(Self::from_u64).map_err(|_| ParseError::InvalidAddress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let a = Address::from_u64(0x89abcdef01);
        assert_eq!(a, Address::from_bytes(&a.to_bytes()));
        assert_eq!(a, a.to_string().parse().unwrap());
        assert_eq!(a.to_string(), "89abcdef01");
    }

    #[test]
    fn reserved() {
        assert!(Address::from_u64(0).is_reserved());
        assert!(Address::from_u64(0xff00000001).is_reserved());
        assert!(!Address::from_u64(0xfe00000001).is_reserved());
        // Truncation to 40 bits happens on construction.
        assert_eq!(Address::from_u64(0x1_0000000001).to_u64(), 1);
    }

    #[test]
    fn parse_rejects_junk() {
        assert!("12345".parse::<Address>().is_err());
        assert!("zzzzzzzzzz".parse::<Address>().is_err());
        assert!("0123456789".parse::<Address>().is_ok());
    }
}
