/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use crate::buffer::{Buffer, BufferOverflow};
use crate::crypto::c25519::{self, C25519KeyPair};
use crate::crypto::{C25519_PUBLIC_KEY_SIZE, C25519_SIGNATURE_SIZE};
use crate::error::ParseError;
use crate::identity::Identity;
use crate::inetaddress::InetAddress;

pub const WORLD_MAX_ROOTS: usize = 4;
pub const WORLD_MAX_STABLE_ENDPOINTS_PER_ROOT: usize = 32;

/// A root server and the static physical endpoints it can always be reached
/// at. The endpoints bootstrap connectivity before any path is learned.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Root {
    pub identity: Identity,
    pub stable_endpoints: Vec<InetAddress>,
}

/// The "world": a signed, versioned definition of the current root set.
///
/// Worlds ride along in HELLO/OK(HELLO) so updates diffuse through ordinary
/// keepalive traffic. An update is only accepted if it carries the same
/// world ID, a strictly newer timestamp, and a valid signature by the
/// update-signing key embedded in the world we already trust. That key is
/// part of the signed content, so control of the world can only be handed
/// forward voluntarily.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct World {
    id: u64,
    timestamp: i64,
    update_public_key: [u8; C25519_PUBLIC_KEY_SIZE],
    signature: [u8; C25519_SIGNATURE_SIZE],
    roots: Vec<Root>,
}

impl World {
    /// Build and sign a world. Used by world generators, not by nodes.
    pub fn create(id: u64, timestamp: i64, roots: Vec<Root>, signing: &C25519KeyPair) -> Option<Self> {
        if roots.is_empty() || roots.len() > WORLD_MAX_ROOTS {
            return None;
        }
        let mut w = Self {
            id,
            timestamp,
            update_public_key: signing.public_bytes(),
            signature: [0; C25519_SIGNATURE_SIZE],
            roots,
        };
        let mut signable: Buffer<8192> = Buffer::new();
        w.marshal_content(&mut signable).ok()?;
        w.signature = signing.sign(signable.as_bytes());
        Some(w)
    }

    #[inline(always)]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline(always)]
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    #[inline(always)]
    pub fn roots(&self) -> &[Root] {
        &self.roots
    }

    pub fn is_root(&self, identity: &Identity) -> bool {
        self.roots.iter().any(|r| &r.identity == identity)
    }

    pub fn is_root_address(&self, address: crate::address::Address) -> bool {
        self.roots.iter().any(|r| r.identity.address() == address)
    }

    /// Should `update` replace this world?
    pub fn should_be_replaced_by(&self, update: &World) -> bool {
        if update.id != self.id || update.timestamp <= self.timestamp {
            return false;
        }
        let mut signable: Buffer<8192> = Buffer::new();
        if update.marshal_content(&mut signable).is_err() {
            return false;
        }
        c25519::verify(&self.update_public_key, signable.as_bytes(), &update.signature)
    }

    // Everything that is covered by the signature.
    fn marshal_content<const C: usize>(&self, b: &mut Buffer<C>) -> Result<(), BufferOverflow> {
        b.append_u8(1)?; // world format
        b.append_u64(self.id)?;
        b.append_u64(self.timestamp as u64)?;
        b.append_bytes(&self.update_public_key)?;
        b.append_u8(self.roots.len() as u8)?;
        for r in &self.roots {
            r.identity.marshal(b, false)?;
            b.append_u8(r.stable_endpoints.len() as u8)?;
            for ep in &r.stable_endpoints {
                ep.marshal(b)?;
            }
        }
        Ok(())
    }

    pub fn marshal<const C: usize>(&self, b: &mut Buffer<C>) -> Result<(), BufferOverflow> {
        self.marshal_content(b)?;
        b.append_bytes(&self.signature)
    }

    pub fn unmarshal<const C: usize>(b: &Buffer<C>, cursor: &mut usize) -> Result<Self, ParseError> {
        if b.read_u8(cursor)? != 1 {
            return Err(ParseError::InvalidWorld);
        }
        let id = b.read_u64(cursor)?;
        let timestamp = b.read_u64(cursor)? as i64;
        let update_public_key: [u8; C25519_PUBLIC_KEY_SIZE] = b.read_bytes(cursor, C25519_PUBLIC_KEY_SIZE)?.try_into().unwrap();
        let root_count = b.read_u8(cursor)? as usize;
        if root_count == 0 || root_count > WORLD_MAX_ROOTS {
            return Err(ParseError::InvalidWorld);
        }
        let mut roots = Vec::with_capacity(root_count);
        for _ in 0..root_count {
            let identity = Identity::unmarshal(b, cursor)?;
            let ep_count = b.read_u8(cursor)? as usize;
            if ep_count > WORLD_MAX_STABLE_ENDPOINTS_PER_ROOT {
                return Err(ParseError::InvalidWorld);
            }
            let mut stable_endpoints = Vec::with_capacity(ep_count);
            for _ in 0..ep_count {
                stable_endpoints.push(InetAddress::unmarshal(b, cursor)?);
            }
            roots.push(Root { identity, stable_endpoints });
        }
        let mut signature = [0u8; C25519_SIGNATURE_SIZE];
        signature.copy_from_slice(b.read_bytes(cursor, C25519_SIGNATURE_SIZE)?);
        Ok(Self { id, timestamp, update_public_key, signature, roots })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_world(signing: &C25519KeyPair, ts: i64) -> World {
        let root = Root {
            identity: crate::testutil::identity(0).public_only(),
            stable_endpoints: vec![InetAddress::V4("198.51.100.9".parse().unwrap(), 9993)],
        };
        World::create(77, ts, vec![root], signing).unwrap()
    }

    #[test]
    fn update_rules() {
        let signer = C25519KeyPair::generate();
        let current = test_world(&signer, 1000);
        let newer = test_world(&signer, 2000);
        let same_ts = test_world(&signer, 1000);
        assert!(current.should_be_replaced_by(&newer));
        assert!(!current.should_be_replaced_by(&same_ts));
        assert!(!newer.should_be_replaced_by(&current));

        // Signed by the wrong key: refused regardless of timestamp.
        let mallory = C25519KeyPair::generate();
        let forged = test_world(&mallory, 9000);
        assert!(!current.should_be_replaced_by(&forged));

        // Different world ID entirely.
        let other = World::create(78, 9000, current.roots().to_vec(), &signer).unwrap();
        assert!(!current.should_be_replaced_by(&other));
    }

    #[test]
    fn wire_round_trip() {
        let signer = C25519KeyPair::generate();
        let w = test_world(&signer, 42);
        let mut b: Buffer<8192> = Buffer::new();
        w.marshal(&mut b).unwrap();
        let mut c = 0;
        let back = World::unmarshal(&b, &mut c).unwrap();
        assert_eq!(c, b.len());
        assert_eq!(back, w);
        assert!(back.is_root(&w.roots()[0].identity));
        assert!(back.is_root_address(w.roots()[0].identity.address()));
    }
}
