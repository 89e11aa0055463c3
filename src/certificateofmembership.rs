/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use crate::address::Address;
use crate::buffer::{Buffer, BufferOverflow};
use crate::crypto::C25519_SIGNATURE_SIZE;
use crate::error::ParseError;
use crate::identity::Identity;

pub const COM_MAX_QUALIFIERS: usize = 8;

/// Reserved qualifier IDs.
pub const COM_ID_TIMESTAMP: u64 = 0;
pub const COM_ID_NETWORK_ID: u64 = 1;
pub const COM_ID_ISSUED_TO: u64 = 2;

/// maxDelta for issuedTo: any two distinct members may differ arbitrarily.
const ISSUED_TO_MAX_DELTA: u64 = 0xffff_ffff_ffff;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct Qualifier {
    id: u64,
    value: u64,
    max_delta: u64,
}

/// Certificate of network membership.
///
/// A sorted list of qualifier tuples signed by the network controller. Two
/// members may exchange frames on a private network iff each one's COM
/// "agrees with" the other's: for every tuple we hold, the other side must
/// hold a tuple with the same ID whose value differs from ours by at most our
/// maxDelta. The check is asymmetric; both directions are evaluated by the
/// two peers independently.
///
/// The timestamp tuple (ID 0) makes certificates age out: a peer whose
/// timestamp is too far behind ours no longer agrees. Network ID (1) pins
/// the network with maxDelta zero. IssuedTo (2) carries the member address
/// with an any-delta so distinct members still agree.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CertificateOfMembership {
    qualifiers: Vec<Qualifier>, // sorted by id
    signed_by: Address,
    signature: [u8; C25519_SIGNATURE_SIZE],
}

impl CertificateOfMembership {
    pub fn new(timestamp: i64, timestamp_max_delta: i64, nwid: u64, issued_to: Address) -> Self {
        let mut com = Self { qualifiers: Vec::with_capacity(3), signed_by: Address::default(), signature: [0; C25519_SIGNATURE_SIZE] };
        com.set_qualifier(COM_ID_TIMESTAMP, timestamp as u64, timestamp_max_delta as u64);
        com.set_qualifier(COM_ID_NETWORK_ID, nwid, 0);
        com.set_qualifier(COM_ID_ISSUED_TO, issued_to.to_u64(), ISSUED_TO_MAX_DELTA);
        com
    }

    /// Set or replace a qualifier.
    ///
    /// This invalidates any existing signature: `signed_by` is cleared and
    /// the certificate must be signed again before use.
    pub fn set_qualifier(&mut self, id: u64, value: u64, max_delta: u64) {
        self.signed_by = Address::default();
        for q in self.qualifiers.iter_mut() {
            if q.id == id {
                q.value = value;
                q.max_delta = max_delta;
                return;
            }
        }
        if self.qualifiers.len() < COM_MAX_QUALIFIERS {
            self.qualifiers.push(Qualifier { id, value, max_delta });
            self.qualifiers.sort_by_key(|q| q.id);
        }
    }

    fn qualifier_value(&self, id: u64) -> Option<u64> {
        self.qualifiers.iter().find(|q| q.id == id).map(|q| q.value)
    }

    pub fn timestamp(&self) -> i64 {
        self.qualifier_value(COM_ID_TIMESTAMP).unwrap_or(0) as i64
    }

    pub fn timestamp_max_delta(&self) -> i64 {
        self.qualifiers.iter().find(|q| q.id == COM_ID_TIMESTAMP).map(|q| q.max_delta).unwrap_or(0) as i64
    }

    pub fn network_id(&self) -> u64 {
        self.qualifier_value(COM_ID_NETWORK_ID).unwrap_or(0)
    }

    pub fn issued_to(&self) -> Address {
        Address::from_u64(self.qualifier_value(COM_ID_ISSUED_TO).unwrap_or(0))
    }

    pub fn signed_by(&self) -> Address {
        self.signed_by
    }

    /// Would we allow a peer holding `other` to talk to us?
    ///
    /// Every tuple present here must be matched in `other` within our
    /// maxDelta. Tuples `other` has that we lack are ignored; both sides run
    /// this check so novel qualifiers still bind once both certificates
    /// carry them.
    pub fn agrees_with(&self, other: &CertificateOfMembership) -> bool {
        let mut other_idx = 0;
        for mine in &self.qualifiers {
            // Both lists are sorted by ID so a single forward walk finds the
            // counterpart or proves it missing.
            loop {
                if other_idx >= other.qualifiers.len() {
                    return false;
                }
                if other.qualifiers[other_idx].id == mine.id {
                    break;
                }
                other_idx += 1;
            }
            let a = mine.value;
            let b = other.qualifiers[other_idx].value;
            if a.abs_diff(b) > mine.max_delta {
                return false;
            }
        }
        true
    }

    fn signable_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.qualifiers.len() * 24);
        for q in &self.qualifiers {
            buf.extend_from_slice(&q.id.to_be_bytes());
            buf.extend_from_slice(&q.value.to_be_bytes());
            buf.extend_from_slice(&q.max_delta.to_be_bytes());
        }
        buf
    }

    /// Sign as the controller. False if `with` has no private key.
    pub fn sign(&mut self, with: &Identity) -> bool {
        match with.sign(&self.signable_bytes()) {
            Some(sig) => {
                self.signature = sig;
                self.signed_by = with.address();
                true
            }
            None => {
                self.signed_by = Address::default();
                false
            }
        }
    }

    /// Verify against the claimed signer's identity.
    pub fn verify(&self, signer: &Identity) -> bool {
        !self.signed_by.is_nil() && signer.address() == self.signed_by && signer.verify(&self.signable_bytes(), &self.signature)
    }

    pub fn marshal<const C: usize>(&self, b: &mut Buffer<C>) -> Result<(), BufferOverflow> {
        b.append_u8(1)?; // format version
        b.append_u16(self.qualifiers.len() as u16)?;
        for q in &self.qualifiers {
            b.append_u64(q.id)?;
            b.append_u64(q.value)?;
            b.append_u64(q.max_delta)?;
        }
        self.signed_by.marshal(b)?;
        if !self.signed_by.is_nil() {
            b.append_bytes(&self.signature)?;
        }
        Ok(())
    }

    pub fn unmarshal<const C: usize>(b: &Buffer<C>, cursor: &mut usize) -> Result<Self, ParseError> {
        if b.read_u8(cursor)? != 1 {
            return Err(ParseError::InvalidCertificate);
        }
        let count = b.read_u16(cursor)? as usize;
        if count > COM_MAX_QUALIFIERS {
            return Err(ParseError::InvalidCertificate);
        }
        let mut qualifiers = Vec::with_capacity(count);
        for _ in 0..count {
            let id = b.read_u64(cursor)?;
            let value = b.read_u64(cursor)?;
            let max_delta = b.read_u64(cursor)?;
            qualifiers.push(Qualifier { id, value, max_delta });
        }
        qualifiers.sort_by_key(|q| q.id);
        let signed_by = Address::unmarshal(b, cursor)?;
        let mut signature = [0u8; C25519_SIGNATURE_SIZE];
        if !signed_by.is_nil() {
            signature.copy_from_slice(b.read_bytes(cursor, C25519_SIGNATURE_SIZE)?);
        }
        Ok(Self { qualifiers, signed_by, signature })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NWID: u64 = 0x8056c2e21c000001;

    fn member(ts: i64, delta: i64, addr: u64) -> CertificateOfMembership {
        CertificateOfMembership::new(ts, delta, NWID, Address::from_u64(addr))
    }

    #[test]
    fn members_of_same_network_agree() {
        let a = member(100_000, 60_000, 0x1111111111);
        let b = member(110_000, 60_000, 0x2222222222);
        assert!(a.agrees_with(&b));
        assert!(b.agrees_with(&a));
    }

    #[test]
    fn different_network_never_agrees() {
        let a = member(100_000, 60_000, 0x1111111111);
        let mut b = member(100_000, 60_000, 0x2222222222);
        b.set_qualifier(COM_ID_NETWORK_ID, NWID ^ 1, 0);
        assert!(!a.agrees_with(&b));
        assert!(!b.agrees_with(&a));
    }

    #[test]
    fn timestamp_delta_is_monotone_and_asymmetric() {
        let old = member(100_000, 60_000, 1);
        let new = member(165_001, 60_000, 2);
        // From new's point of view old has aged out.
        assert!(!new.agrees_with(&old));
        assert!(!old.agrees_with(&new));
        let close = member(160_000, 60_000, 2);
        assert!(close.agrees_with(&old));

        // Asymmetry: a side with a tighter delta refuses first.
        let strict = member(100_000, 1_000, 3);
        let lax = member(130_000, 60_000, 4);
        assert!(lax.agrees_with(&strict));
        assert!(!strict.agrees_with(&lax));
    }

    #[test]
    fn missing_qualifier_fails_agreement() {
        let mut a = member(100, 1000, 1);
        a.set_qualifier(77, 5, 0);
        let b = member(100, 1000, 2);
        assert!(!a.agrees_with(&b)); // b lacks 77
        assert!(b.agrees_with(&a)); // b doesn't care about 77
    }

    #[test]
    fn set_qualifier_clears_signature() {
        let controller = crate::testutil::identity(0);
        let mut com = member(100, 1000, 1);
        assert!(com.sign(controller));
        assert!(com.verify(controller));
        com.set_qualifier(COM_ID_TIMESTAMP, 200, 1000);
        assert!(com.signed_by().is_nil());
        assert!(!com.verify(controller));
        assert!(com.sign(controller));
        assert!(com.verify(controller));

        // A different identity cannot pass verification.
        let impostor = crate::testutil::identity(1);
        assert!(!com.verify(impostor));
    }

    #[test]
    fn wire_round_trip() {
        let controller = crate::testutil::identity(0);
        let mut com = member(123_456, 60_000, 0x55aa55aa55);
        com.sign(controller);
        let mut b: Buffer<512> = Buffer::new();
        com.marshal(&mut b).unwrap();
        let mut c = 0;
        let back = CertificateOfMembership::unmarshal(&b, &mut c).unwrap();
        assert_eq!(c, b.len());
        assert_eq!(back, com);
        assert!(back.verify(controller));
        assert_eq!(back.network_id(), NWID);
        assert_eq!(back.issued_to(), Address::from_u64(0x55aa55aa55));
    }
}
