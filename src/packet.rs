/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use crate::address::Address;
use crate::buffer::Buffer;
use crate::crypto::salsa::Salsa2012;
use crate::crypto::{poly1305, secure_eq, Secret, PEER_KEY_SIZE};
use crate::error::FaultType;
use crate::proto::*;

/// Packet verbs. The wire byte also carries the compressed flag in bit 7;
/// these values are the masked low bits.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Verb {
    Nop = 0x00,
    Hello = 0x01,
    Ok = 0x02,
    Error = 0x03,
    Whois = 0x04,
    Rendezvous = 0x05,
    Frame = 0x06,
    ExtFrame = 0x07,
    Echo = 0x08,
    MulticastLike = 0x09,
    NetworkMembershipCertificate = 0x0a,
    NetworkConfigRequest = 0x0b,
    NetworkConfigRefresh = 0x0c,
    MulticastGather = 0x0d,
    MulticastFrame = 0x0e,
    CircuitTest = 0x11,
    CircuitTestReport = 0x12,
}

impl Verb {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v & VERB_MASK {
            0x00 => Self::Nop,
            0x01 => Self::Hello,
            0x02 => Self::Ok,
            0x03 => Self::Error,
            0x04 => Self::Whois,
            0x05 => Self::Rendezvous,
            0x06 => Self::Frame,
            0x07 => Self::ExtFrame,
            0x08 => Self::Echo,
            0x09 => Self::MulticastLike,
            0x0a => Self::NetworkMembershipCertificate,
            0x0b => Self::NetworkConfigRequest,
            0x0c => Self::NetworkConfigRefresh,
            0x0d => Self::MulticastGather,
            0x0e => Self::MulticastFrame,
            0x11 => Self::CircuitTest,
            0x12 => Self::CircuitTestReport,
            _ => return None,
        })
    }
}

/// Error codes carried in VERB_ERROR payloads.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ErrorCode {
    None = 0x00,
    InvalidRequest = 0x01,
    UnsupportedOperation = 0x02,
    ObjNotFound = 0x03,
    IdentityCollision = 0x04,
    NeedMembershipCertificate = 0x06,
    NetworkAccessDenied = 0x07,
}

impl ErrorCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x00 => Self::None,
            0x01 => Self::InvalidRequest,
            0x02 => Self::UnsupportedOperation,
            0x03 => Self::ObjNotFound,
            0x04 => Self::IdentityCollision,
            0x06 => Self::NeedMembershipCertificate,
            0x07 => Self::NetworkAccessDenied,
            _ => return None,
        })
    }
}

/// A protocol packet.
///
/// Packets move through the engine by value in a fixed-capacity buffer. The
/// 28-byte header is laid out in `proto.rs`; everything after the verb byte
/// is the verb-specific payload, which may be LZ4 compressed (verb bit 7).
#[derive(Clone)]
pub struct Packet {
    b: Buffer<PACKET_MAX_SIZE>,
}

impl Packet {
    /// Start a packet. The packet ID doubles as the cipher IV and must come
    /// from the PRNG so it never repeats under one key.
    pub fn new(packet_id: u64, dest: Address, source: Address, verb: Verb) -> Self {
        let mut b = Buffer::new();
        // Header writes cannot overflow an empty max-size buffer.
        let _ = b.append_u64(packet_id);
        let _ = b.append_bytes(&dest.to_bytes());
        let _ = b.append_bytes(&source.to_bytes());
        let _ = b.append_u8(0); // flags/hops
        let _ = b.append_padding(8); // MAC
        let _ = b.append_u8(verb as u8);
        Self { b }
    }

    /// Wrap raw wire bytes. Fails on anything shorter than a full header.
    pub fn from_wire(data: &[u8]) -> Result<Self, FaultType> {
        if data.len() < PACKET_MIN_SIZE {
            return Err(FaultType::InvalidPacket);
        }
        match Buffer::from_bytes(data) {
            Ok(b) => Ok(Self { b }),
            Err(_) => Err(FaultType::InvalidPacket),
        }
    }

    #[inline(always)]
    pub fn buf(&self) -> &Buffer<PACKET_MAX_SIZE> {
        &self.b
    }

    #[inline(always)]
    pub fn buf_mut(&mut self) -> &mut Buffer<PACKET_MAX_SIZE> {
        &mut self.b
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.b.len()
    }

    pub fn packet_id(&self) -> u64 {
        self.b.u64_at(PACKET_IDX_IV).unwrap_or(0)
    }

    /// Re-key the packet ID. Required when a packet template is cloned for
    /// another recipient, since IDs double as cipher IVs.
    pub fn set_packet_id(&mut self, packet_id: u64) {
        let _ = self.b.set_u64_at(PACKET_IDX_IV, packet_id);
    }

    pub fn set_destination(&mut self, dest: Address) {
        let _ = self.b.bytes_at_mut(PACKET_IDX_DEST, 5).map(|s| s.copy_from_slice(&dest.to_bytes()));
    }

    pub fn destination(&self) -> Address {
        self.b
            .bytes_at(PACKET_IDX_DEST, 5)
            .map(|s| Address::from_bytes(s.try_into().unwrap()))
            .unwrap_or_default()
    }

    pub fn source(&self) -> Address {
        self.b
            .bytes_at(PACKET_IDX_SOURCE, 5)
            .map(|s| Address::from_bytes(s.try_into().unwrap()))
            .unwrap_or_default()
    }

    fn flags(&self) -> u8 {
        self.b.u8_at(PACKET_IDX_FLAGS).unwrap_or(0)
    }

    pub fn hops(&self) -> u8 {
        self.flags() & FLAGS_HOPS_MASK
    }

    /// Bump the hop count; false if the packet is already at the limit.
    pub fn increment_hops(&mut self) -> bool {
        let f = self.flags();
        let h = (f & FLAGS_HOPS_MASK) + 1;
        if h > MAX_HOPS {
            return false;
        }
        let _ = self.b.set_u8_at(PACKET_IDX_FLAGS, (f & !FLAGS_HOPS_MASK) | h);
        true
    }

    pub fn cipher(&self) -> u8 {
        self.flags() >> FLAGS_CIPHER_SHIFT
    }

    pub fn encrypted(&self) -> bool {
        self.flags() & FLAGS_ENCRYPTED != 0
    }

    pub fn fragmented(&self) -> bool {
        self.flags() & FLAGS_FRAGMENTED != 0
    }

    pub fn set_fragmented(&mut self, f: bool) {
        let flags = self.flags();
        let _ = self.b.set_u8_at(
            PACKET_IDX_FLAGS,
            if f { flags | FLAGS_FRAGMENTED } else { flags & !FLAGS_FRAGMENTED },
        );
    }

    fn set_cipher(&mut self, suite: u8) {
        let mut f = self.flags() & !(0x03 << FLAGS_CIPHER_SHIFT) & !FLAGS_ENCRYPTED;
        f |= suite << FLAGS_CIPHER_SHIFT;
        if suite == CIPHER_SUITE_POLY1305_SALSA2012 {
            f |= FLAGS_ENCRYPTED;
        }
        let _ = self.b.set_u8_at(PACKET_IDX_FLAGS, f);
    }

    pub fn verb(&self) -> Option<Verb> {
        Verb::from_u8(self.b.u8_at(PACKET_IDX_VERB).ok()?)
    }

    pub fn compressed(&self) -> bool {
        self.b.u8_at(PACKET_IDX_VERB).unwrap_or(0) & VERB_FLAG_COMPRESSED != 0
    }

    pub fn payload(&self) -> &[u8] {
        &self.b.as_bytes()[(PACKET_IDX_VERB + 1).min(self.b.len())..]
    }

    /// XOR-fold mutable and per-packet header fields into the static peer
    /// key. This divides the keyspace by direction and packet size. The hop
    /// count and fragmented bit are excluded because they legitimately change
    /// in flight.
    fn mangled_key(&self, key: &Secret<PEER_KEY_SIZE>) -> Secret<PEER_KEY_SIZE> {
        let b = self.b.as_bytes();
        let len = self.b.len();
        let mut out = key.clone();
        for i in 0..PACKET_IDX_FLAGS {
            out.0[i] ^= b[i];
        }
        out.0[18] ^= b[PACKET_IDX_FLAGS] & !(FLAGS_HOPS_MASK | FLAGS_FRAGMENTED);
        out.0[19] ^= len as u8;
        out.0[20] ^= (len >> 8) as u8;
        out
    }

    /// Set the cipher suite, optionally encrypt the payload, and write the
    /// MAC. HELLO goes out with suite 0 (authenticated plaintext) so version
    /// and identity discovery work before key agreement.
    pub fn armor(&mut self, key: &Secret<PEER_KEY_SIZE>, encrypt_payload: bool) {
        self.set_cipher(if encrypt_payload {
            CIPHER_SUITE_POLY1305_SALSA2012
        } else {
            CIPHER_SUITE_POLY1305_NONE
        });

        let mangled = self.mangled_key(key);
        let iv: [u8; 8] = self.b.bytes_at(PACKET_IDX_IV, 8).unwrap().try_into().unwrap();
        let mut s20 = Salsa2012::new(mangled.as_bytes(), &iv);

        // The whole first keystream block is consumed so payload encryption
        // starts on a block boundary; its first 32 bytes key the MAC.
        let mut block0 = Secret::<64>::new();
        s20.keystream(block0.as_mut());

        let len = self.b.len();
        if encrypt_payload && len > PACKET_IDX_VERB {
            let payload = self.b.bytes_at_mut(PACKET_IDX_VERB, len - PACKET_IDX_VERB).unwrap();
            s20.crypt_in_place(payload);
        }

        let mac = poly1305::compute(block0.first_n::<32>(), self.b.bytes_at(PACKET_IDX_VERB, len - PACKET_IDX_VERB).unwrap());
        let _ = self.b.bytes_at_mut(PACKET_IDX_MAC, 8).map(|m| m.copy_from_slice(&mac[..8]));
    }

    /// Verify the MAC and decrypt if needed. Must be called with the key of
    /// the claimed source peer. Trusted-path packets (suite 2) never reach
    /// here; the switch short-circuits them.
    pub fn dearmor(&mut self, key: &Secret<PEER_KEY_SIZE>) -> Result<(), FaultType> {
        let suite = self.cipher();
        if suite != CIPHER_SUITE_POLY1305_NONE && suite != CIPHER_SUITE_POLY1305_SALSA2012 {
            return Err(FaultType::InvalidPacket);
        }
        let len = self.b.len();
        if len < PACKET_MIN_SIZE {
            return Err(FaultType::InvalidPacket);
        }

        let mangled = self.mangled_key(key);
        let iv: [u8; 8] = self.b.bytes_at(PACKET_IDX_IV, 8).unwrap().try_into().unwrap();
        let mut s20 = Salsa2012::new(mangled.as_bytes(), &iv);
        let mut block0 = Secret::<64>::new();
        s20.keystream(block0.as_mut());

        let mac = poly1305::compute(block0.first_n::<32>(), self.b.bytes_at(PACKET_IDX_VERB, len - PACKET_IDX_VERB).unwrap());
        if !secure_eq(&mac[..8], self.b.bytes_at(PACKET_IDX_MAC, 8).unwrap()) {
            return Err(FaultType::AuthenticationFailed);
        }

        if suite == CIPHER_SUITE_POLY1305_SALSA2012 {
            let payload = self.b.bytes_at_mut(PACKET_IDX_VERB, len - PACKET_IDX_VERB).unwrap();
            s20.crypt_in_place(payload);
        }
        Ok(())
    }

    /// Mark as traveling over a trusted physical path: no cipher, no MAC,
    /// the 64-bit path ID sits where the MAC would.
    pub fn set_trusted_path(&mut self, trusted_path_id: u64) {
        self.set_cipher(CIPHER_SUITE_TRUSTED_PATH);
        let _ = self.b.set_u64_at(PACKET_IDX_MAC, trusted_path_id);
    }

    pub fn trusted_path_id(&self) -> u64 {
        self.b.u64_at(PACKET_IDX_MAC).unwrap_or(0)
    }

    /// Try to LZ4 the payload in place. Keeps the packet unchanged unless
    /// compression actually wins. Call before armor.
    pub fn compress(&mut self) -> bool {
        let payload_start = PACKET_IDX_VERB + 1;
        let len = self.b.len();
        if len <= payload_start + 32 || self.compressed() {
            return false; // not worth it below ~32 bytes
        }
        let payload = &self.b.as_bytes()[payload_start..];
        let mut tmp = vec![0u8; lz4_flex::block::get_maximum_output_size(payload.len())];
        match lz4_flex::block::compress_into(payload, &mut tmp) {
            Ok(n) if n < payload.len() => {
                self.b.truncate(payload_start);
                let _ = self.b.append_bytes(&tmp[..n]);
                let verb = self.b.u8_at(PACKET_IDX_VERB).unwrap();
                let _ = self.b.set_u8_at(PACKET_IDX_VERB, verb | VERB_FLAG_COMPRESSED);
                true
            }
            _ => false,
        }
    }

    /// Reverse `compress`. Call after dearmor, before verb dispatch. A
    /// payload that does not decompress cleanly is a protocol fault.
    pub fn uncompress(&mut self) -> Result<(), FaultType> {
        if !self.compressed() {
            return Ok(());
        }
        let payload_start = PACKET_IDX_VERB + 1;
        let payload = &self.b.as_bytes()[payload_start.min(self.b.len())..];
        let mut tmp = vec![0u8; PACKET_MAX_SIZE];
        let n = lz4_flex::block::decompress_into(payload, &mut tmp).map_err(|_| FaultType::InvalidPacket)?;
        if payload_start + n > PACKET_MAX_SIZE {
            return Err(FaultType::InvalidPacket);
        }
        self.b.truncate(payload_start);
        self.b.append_bytes(&tmp[..n]).map_err(|_| FaultType::InvalidPacket)?;
        let verb = self.b.u8_at(PACKET_IDX_VERB).unwrap();
        let _ = self.b.set_u8_at(PACKET_IDX_VERB, verb & !VERB_FLAG_COMPRESSED);
        Ok(())
    }

    /// Split an armored packet for a path MTU. The first piece is the packet
    /// truncated to `mtu` with the fragmented flag set; the rest are
    /// `Fragment`s. None if it already fits or cannot be split.
    pub fn fragment(&self, mtu: usize) -> Option<(Packet, Vec<Fragment>)> {
        let len = self.b.len();
        if len <= mtu || mtu <= FRAGMENT_HEADER_SIZE || mtu < PACKET_MIN_SIZE {
            return None;
        }
        let remaining = len - mtu;
        let per_fragment = mtu - FRAGMENT_HEADER_SIZE;
        let later_count = remaining.div_ceil(per_fragment);
        let total = later_count + 1;
        if total > MAX_FRAGMENTS {
            return None;
        }

        let mut head = self.clone();
        head.b.truncate(mtu);
        head.set_fragmented(true);

        let packet_id = self.packet_id();
        let dest = self.destination();
        let mut frags = Vec::with_capacity(later_count);
        let mut at = mtu;
        for no in 1..total {
            let end = (at + per_fragment).min(len);
            frags.push(Fragment::new(packet_id, dest, no as u8, total as u8, &self.b.as_bytes()[at..end]));
            at = end;
        }
        Some((head, frags))
    }
}

/// A non-head fragment of an oversized packet.
///
/// Distinguished from whole packets on the wire by the 0xff byte at the
/// offset where a normal packet's source address starts; 0xff is a reserved
/// address prefix so no real source can collide with it.
#[derive(Clone)]
pub struct Fragment {
    b: Buffer<PACKET_MAX_SIZE>,
}

impl Fragment {
    pub fn new(packet_id: u64, dest: Address, fragment_no: u8, total_fragments: u8, payload: &[u8]) -> Self {
        let mut b = Buffer::new();
        let _ = b.append_u64(packet_id);
        let _ = b.append_bytes(&dest.to_bytes());
        let _ = b.append_u8(FRAGMENT_INDICATOR);
        let _ = b.append_u8((fragment_no << 4) | (total_fragments & 0x0f));
        let _ = b.append_u8(0); // hops
        let _ = b.append_bytes(payload);
        Self { b }
    }

    pub fn from_wire(data: &[u8]) -> Result<Self, FaultType> {
        if data.len() <= FRAGMENT_HEADER_SIZE || data[FRAGMENT_IDX_INDICATOR] != FRAGMENT_INDICATOR {
            return Err(FaultType::InvalidPacket);
        }
        match Buffer::from_bytes(data) {
            Ok(b) => Ok(Self { b }),
            Err(_) => Err(FaultType::InvalidPacket),
        }
    }

    /// True if raw wire bytes look like a fragment rather than a packet.
    pub fn is_fragment(data: &[u8]) -> bool {
        data.len() > FRAGMENT_IDX_INDICATOR && data[FRAGMENT_IDX_INDICATOR] == FRAGMENT_INDICATOR
    }

    pub fn packet_id(&self) -> u64 {
        self.b.u64_at(FRAGMENT_IDX_PACKET_ID).unwrap_or(0)
    }

    pub fn destination(&self) -> Address {
        self.b
            .bytes_at(FRAGMENT_IDX_DEST, 5)
            .map(|s| Address::from_bytes(s.try_into().unwrap()))
            .unwrap_or_default()
    }

    pub fn fragment_no(&self) -> u8 {
        self.b.u8_at(FRAGMENT_IDX_FRAGMENT_NO).unwrap_or(0) >> 4
    }

    /// Total fragments: 0 in the 4-bit field would be nonsensical and is
    /// treated as 16 nowhere; callers validate against MAX_FRAGMENTS.
    pub fn total_fragments(&self) -> u8 {
        self.b.u8_at(FRAGMENT_IDX_FRAGMENT_NO).unwrap_or(0) & 0x0f
    }

    pub fn hops(&self) -> u8 {
        self.b.u8_at(FRAGMENT_IDX_HOPS).unwrap_or(0)
    }

    pub fn increment_hops(&mut self) -> bool {
        let h = self.hops() + 1;
        if h > MAX_HOPS {
            return false;
        }
        let _ = self.b.set_u8_at(FRAGMENT_IDX_HOPS, h);
        true
    }

    pub fn payload(&self) -> &[u8] {
        &self.b.as_bytes()[FRAGMENT_HEADER_SIZE.min(self.b.len())..]
    }

    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        self.b.as_bytes()
    }
}

/// Reassemble a head packet plus its later fragments, in fragment order.
pub fn assemble(head: &Packet, later: &[Option<Fragment>]) -> Result<Packet, FaultType> {
    let mut whole = head.clone();
    whole.set_fragmented(false);
    for f in later {
        let f = f.as_ref().ok_or(FaultType::InvalidPacket)?;
        whole.buf_mut().append_bytes(f.payload()).map_err(|_| FaultType::FragmentedTooLong)?;
    }
    Ok(whole)
}
