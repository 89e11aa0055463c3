/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::fmt;
use std::str::FromStr;

use crate::address::Address;
use crate::buffer::{Buffer, BufferOverflow};
use crate::crypto::c25519::{self, C25519KeyPair};
use crate::crypto::salsa::Salsa2020;
use crate::crypto::{sha512, Secret, C25519_PRIVATE_KEY_SIZE, C25519_PUBLIC_KEY_SIZE, C25519_SHARED_KEY_SIZE, C25519_SIGNATURE_SIZE, SHA512_HASH_SIZE};
use crate::error::ParseError;
use crate::util;

// These can't be changed without a new identity type. They define the
// parameters of the hashcash hashing/searching algorithm.
const HASHCASH_FIRST_BYTE_LESS_THAN: u8 = 17;
const IDENTITY_GEN_MEMORY: usize = 2097152;

/// A memory-hard composition of SHA-512 and Salsa20 for hashcash hashing.
///
/// The keystream fill is chained CBC-style because plain Salsa20 output is
/// randomly seekable, which would defeat sequential memory hardness. The
/// final pass permutes digest and memory words against each other so the
/// whole 2 MiB has to exist at once.
fn compute_memory_hard_hash(public_key: &[u8; C25519_PUBLIC_KEY_SIZE], genmem: &mut [u8]) -> [u8; SHA512_HASH_SIZE] {
    debug_assert_eq!(genmem.len(), IDENTITY_GEN_MEMORY);

    let mut digest = sha512::hash(public_key);
    let key: [u8; 32] = digest[..32].try_into().unwrap();
    let iv: [u8; 8] = digest[32..40].try_into().unwrap();
    let mut s20 = Salsa2020::new(&key, &iv);

    genmem.fill(0);
    s20.crypt_in_place(&mut genmem[..64]);
    for i in (64..IDENTITY_GEN_MEMORY).step_by(64) {
        genmem.copy_within(i - 64..i, i);
        s20.crypt_in_place(&mut genmem[i..i + 64]);
    }

    let mut i = 0;
    while i < IDENTITY_GEN_MEMORY {
        let idx1 = ((u64::from_be_bytes(genmem[i..i + 8].try_into().unwrap()) % 8) * 8) as usize;
        i += 8;
        let idx2 = ((u64::from_be_bytes(genmem[i..i + 8].try_into().unwrap()) % ((IDENTITY_GEN_MEMORY / 8) as u64)) * 8) as usize;
        i += 8;
        let mut tmp = [0u8; 8];
        tmp.copy_from_slice(&genmem[idx2..idx2 + 8]);
        genmem[idx2..idx2 + 8].copy_from_slice(&digest[idx1..idx1 + 8]);
        digest[idx1..idx1 + 8].copy_from_slice(&tmp);
        s20.crypt_in_place(&mut digest);
    }

    digest
}

/// A node's cryptographic identity: a combined C25519/Ed25519 key pair whose
/// 40-bit address is bound to the public key by a memory-hard hashcash proof.
///
/// Forging an identity that collides with a given address requires redoing
/// the generation search, which is why addresses can be treated as scarce.
#[derive(Clone)]
pub struct Identity {
    address: Address,
    public: [u8; C25519_PUBLIC_KEY_SIZE],
    secret: Option<C25519KeyPair>,
}

impl Identity {
    /// Search for a new identity. This burns CPU and touches 2 MiB per
    /// candidate; expect seconds, not milliseconds.
    pub fn generate() -> Self {
        let mut genmem = vec![0u8; IDENTITY_GEN_MEMORY];
        let mut digest = [0u8; SHA512_HASH_SIZE];
        loop {
            let kp = C25519KeyPair::generate_satisfying(|public| {
                digest = compute_memory_hard_hash(public, &mut genmem);
                digest[0] < HASHCASH_FIRST_BYTE_LESS_THAN
            });
            let address = Address::from_bytes(digest[59..64].try_into().unwrap());
            if !address.is_reserved() {
                return Self { address, public: kp.public_bytes(), secret: Some(kp) };
            }
        }
    }

    #[inline(always)]
    pub fn address(&self) -> Address {
        self.address
    }

    #[inline(always)]
    pub fn public_key_bytes(&self) -> &[u8; C25519_PUBLIC_KEY_SIZE] {
        &self.public
    }

    #[inline(always)]
    pub fn has_private(&self) -> bool {
        self.secret.is_some()
    }

    /// Strip the private half, leaving a public-only identity.
    pub fn public_only(&self) -> Self {
        Self { address: self.address, public: self.public, secret: None }
    }

    /// Re-run the hashcash proof and check the address binding.
    pub fn locally_validate(&self) -> bool {
        if self.address.is_reserved() {
            return false;
        }
        let mut genmem = vec![0u8; IDENTITY_GEN_MEMORY];
        let digest = compute_memory_hard_hash(&self.public, &mut genmem);
        digest[0] < HASHCASH_FIRST_BYTE_LESS_THAN && digest[59..64] == self.address.to_bytes()
    }

    pub fn sign(&self, msg: &[u8]) -> Option<[u8; C25519_SIGNATURE_SIZE]> {
        self.secret.as_ref().map(|kp| kp.sign(msg))
    }

    pub fn verify(&self, msg: &[u8], signature: &[u8]) -> bool {
        c25519::verify(&self.public, msg, signature)
    }

    /// Long-term key agreement with another identity. The first 32 bytes of
    /// the result are the per-peer packet key.
    pub fn agree(&self, their: &Identity) -> Option<Secret<C25519_SHARED_KEY_SIZE>> {
        self.secret.as_ref().map(|kp| kp.agree(&their.public))
    }

    pub fn marshal<const C: usize>(&self, b: &mut Buffer<C>, include_private: bool) -> Result<(), BufferOverflow> {
        self.address.marshal(b)?;
        b.append_u8(0)?; // identity type
        b.append_bytes(&self.public)?;
        match (&self.secret, include_private) {
            (Some(kp), true) => {
                b.append_u8(C25519_PRIVATE_KEY_SIZE as u8)?;
                b.append_bytes(kp.private_bytes().as_bytes())
            }
            _ => b.append_u8(0),
        }
    }

    pub fn unmarshal<const C: usize>(b: &Buffer<C>, cursor: &mut usize) -> Result<Self, ParseError> {
        let address = Address::unmarshal(b, cursor)?;
        if address.is_reserved() {
            return Err(ParseError::InvalidAddress);
        }
        if b.read_u8(cursor)? != 0 {
            return Err(ParseError::UnsupportedIdentityType);
        }
        let public: [u8; C25519_PUBLIC_KEY_SIZE] = b.read_bytes(cursor, C25519_PUBLIC_KEY_SIZE)?.try_into().unwrap();
        let secret = match b.read_u8(cursor)? as usize {
            0 => None,
            C25519_PRIVATE_KEY_SIZE => {
                let private: [u8; C25519_PRIVATE_KEY_SIZE] = b.read_bytes(cursor, C25519_PRIVATE_KEY_SIZE)?.try_into().unwrap();
                Some(C25519KeyPair::from_bytes(&public, &private).ok_or(ParseError::InvalidIdentity)?)
            }
            _ => return Err(ParseError::InvalidIdentity),
        };
        Ok(Self { address, public, secret })
    }

    pub fn to_string_with_private(&self, include_private: bool) -> String {
        let mut s = format!("{}:0:{}", self.address, util::hex(&self.public));
        if include_private {
            if let Some(kp) = &self.secret {
                s.push(':');
                s.push_str(&util::hex(kp.private_bytes().as_bytes()));
            }
        }
        s
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.public == other.public
    }
}
impl Eq for Identity {}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_with_private(false))
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.address)
    }
}

impl FromStr for Identity {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.split(':');
        let address: Address = fields.next().ok_or(ParseError::InvalidIdentity)?.parse()?;
        if address.is_reserved() {
            return Err(ParseError::InvalidAddress);
        }
        match fields.next() {
            Some("0") => {}
            Some(_) => return Err(ParseError::UnsupportedIdentityType),
            None => return Err(ParseError::InvalidIdentity),
        }
        let mut public = [0u8; C25519_PUBLIC_KEY_SIZE];
        let pub_hex = fields.next().ok_or(ParseError::InvalidIdentity)?;
        if util::unhex(pub_hex, &mut public) != Some(C25519_PUBLIC_KEY_SIZE) {
            return Err(ParseError::InvalidIdentity);
        }
        let secret = match fields.next() {
            Some(priv_hex) => {
                let mut private = [0u8; C25519_PRIVATE_KEY_SIZE];
                if util::unhex(priv_hex, &mut private) != Some(C25519_PRIVATE_KEY_SIZE) {
                    return Err(ParseError::InvalidIdentity);
                }
                Some(C25519KeyPair::from_bytes(&public, &private).ok_or(ParseError::InvalidIdentity)?)
            }
            None => None,
        };
        if fields.next().is_some() {
            return Err(ParseError::InvalidIdentity);
        }
        Ok(Self { address, public, secret })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_identity() -> &'static Identity {
        crate::testutil::identity(0)
    }

    #[test]
    fn generated_identity_validates() {
        let id = test_identity();
        assert!(!id.address().is_reserved());
        assert!(id.locally_validate());

        let mut genmem = vec![0u8; IDENTITY_GEN_MEMORY];
        let digest = compute_memory_hard_hash(id.public_key_bytes(), &mut genmem);
        assert!(digest[0] < HASHCASH_FIRST_BYTE_LESS_THAN);
        assert_eq!(&digest[59..64], &id.address().to_bytes());
    }

    #[test]
    fn tampered_identity_fails_validation() {
        let mut id = test_identity().clone();
        id.public[10] ^= 0x40;
        assert!(!id.locally_validate());
    }

    #[test]
    fn string_round_trip() {
        let id = test_identity();
        let full: Identity = id.to_string_with_private(true).parse().unwrap();
        assert_eq!(&full, id);
        assert!(full.has_private());
        let public: Identity = id.to_string_with_private(false).parse().unwrap();
        assert_eq!(&public, id);
        assert!(!public.has_private());

        assert!("junk".parse::<Identity>().is_err());
        // Version byte must be "0".
        let bad = id.to_string_with_private(false).replacen(":0:", ":1:", 1);
        assert_eq!(bad.parse::<Identity>().unwrap_err(), ParseError::UnsupportedIdentityType);
    }

    #[test]
    fn wire_round_trip() {
        let id = test_identity();
        let mut b: Buffer<512> = Buffer::new();
        id.marshal(&mut b, true).unwrap();
        id.marshal(&mut b, false).unwrap();
        let mut c = 0;
        let with_private = Identity::unmarshal(&b, &mut c).unwrap();
        let without = Identity::unmarshal(&b, &mut c).unwrap();
        assert_eq!(c, b.len());
        assert_eq!(&with_private, id);
        assert!(with_private.has_private());
        assert!(!without.has_private());
    }

    #[test]
    fn sign_verify_agree() {
        let id = test_identity();
        let sig = id.sign(b"hello").unwrap();
        assert!(id.verify(b"hello", &sig));
        assert!(!id.verify(b"hellp", &sig));
        assert!(id.public_only().sign(b"x").is_none());

        let other = crate::testutil::identity(1);
        let k1 = id.agree(other).unwrap();
        let k2 = other.agree(id).unwrap();
        assert_eq!(k1, k2);
    }
}
