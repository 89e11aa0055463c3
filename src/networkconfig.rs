/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::address::Address;
use crate::applicationlayer::VirtualNetworkRoute;
use crate::buffer::{Buffer, BufferOverflow};
use crate::certificateofmembership::CertificateOfMembership;
use crate::dictionary::Dictionary;
use crate::error::ParseError;
use crate::identity::Identity;
use crate::inetaddress::InetAddress;
use crate::mac::Mac;
use crate::proto::NETWORK_CONFIG_DICT_CAPACITY;

/// Default virtual interface MTU when the controller doesn't set one.
pub const DEFAULT_MTU: u32 = 2800;

/// Specialist role flags (high bits above the 40-bit address).
pub const SPECIALIST_TYPE_ACTIVE_BRIDGE: u64 = 0x0000_0100_0000_0000;
pub const SPECIALIST_TYPE_NETWORK_RELAY: u64 = 0x0000_0200_0000_0000;

/* Dictionary keys for the config blob */
const KEY_VERSION: &str = "v";
const KEY_NETWORK_ID: &str = "nwid";
const KEY_TIMESTAMP: &str = "ts";
const KEY_REVISION: &str = "r";
const KEY_ISSUED_TO: &str = "id";
const KEY_NAME: &str = "n";
const KEY_PRIVATE: &str = "p";
const KEY_MTU: &str = "mtu";
const KEY_MULTICAST_LIMIT: &str = "ml";
const KEY_BROADCAST: &str = "b";
const KEY_BRIDGING: &str = "pb";
const KEY_COM: &str = "com";
const KEY_STATIC_IPS: &str = "ip";
const KEY_ROUTES: &str = "rt";
const KEY_RULES: &str = "rl";
const KEY_SPECIALISTS: &str = "sp";
const KEY_SIGNATURE: &str = "sig";

/// One entry in a network's rule set.
///
/// The wire type byte carries the rule kind in its low 7 bits and a NOT flag
/// in bit 7. Entries are evaluated left to right: consecutive MATCH entries
/// AND together and the next action entry decides the verdict for frames
/// that matched. An action with no preceding matches applies to everything.
/// Falling off the end drops the frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rule {
    pub not: bool,
    pub spec: RuleSpec,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RuleSpec {
    ActionAccept,
    ActionDrop,
    /// Copy the frame toward an observer as well as accepting it. The local
    /// frame decision is ACCEPT; the observation leg is handled upstream.
    ActionTee(Address),
    /// Like TEE but the frame is diverted instead of copied. Treated as
    /// ACCEPT for the local frame decision in this version.
    ActionRedirect(Address),
    MatchSourceMac(Mac),
    MatchDestMac(Mac),
    MatchEtherType(u16),
    MatchSourceIpv4(Ipv4Addr, u8),
    MatchDestIpv4(Ipv4Addr, u8),
    MatchSourceIpv6(Ipv6Addr, u8),
    MatchDestIpv6(Ipv6Addr, u8),
    MatchSourcePortRange(u16, u16),
    MatchDestPortRange(u16, u16),
    MatchTcpSeqRange(u32, u32),
    MatchCharacteristics(u64),
    MatchComField(u64, u64),
}

impl RuleSpec {
    fn type_byte(&self) -> u8 {
        match self {
            Self::ActionAccept => 0,
            Self::ActionDrop => 1,
            Self::ActionTee(_) => 2,
            Self::ActionRedirect(_) => 3,
            Self::MatchSourceMac(_) => 32,
            Self::MatchDestMac(_) => 33,
            Self::MatchEtherType(_) => 34,
            Self::MatchSourceIpv4(_, _) => 35,
            Self::MatchDestIpv4(_, _) => 36,
            Self::MatchSourceIpv6(_, _) => 37,
            Self::MatchDestIpv6(_, _) => 38,
            Self::MatchSourcePortRange(_, _) => 39,
            Self::MatchDestPortRange(_, _) => 40,
            Self::MatchTcpSeqRange(_, _) => 41,
            Self::MatchCharacteristics(_) => 42,
            Self::MatchComField(_, _) => 43,
        }
    }

    fn is_action(&self) -> bool {
        matches!(self, Self::ActionAccept | Self::ActionDrop | Self::ActionTee(_) | Self::ActionRedirect(_))
    }
}

impl Rule {
    pub fn marshal<const C: usize>(&self, b: &mut Buffer<C>) -> Result<(), BufferOverflow> {
        b.append_u8(self.spec.type_byte() | if self.not { 0x80 } else { 0 })?;
        let len_at = b.append_padding(1)?;
        let start = b.len();
        match &self.spec {
            RuleSpec::ActionAccept | RuleSpec::ActionDrop => {}
            RuleSpec::ActionTee(a) | RuleSpec::ActionRedirect(a) => a.marshal(b)?,
            RuleSpec::MatchSourceMac(m) | RuleSpec::MatchDestMac(m) => m.marshal(b)?,
            RuleSpec::MatchEtherType(et) => b.append_u16(*et)?,
            RuleSpec::MatchSourceIpv4(ip, bits) | RuleSpec::MatchDestIpv4(ip, bits) => {
                b.append_bytes(&ip.octets())?;
                b.append_u8(*bits)?;
            }
            RuleSpec::MatchSourceIpv6(ip, bits) | RuleSpec::MatchDestIpv6(ip, bits) => {
                b.append_bytes(&ip.octets())?;
                b.append_u8(*bits)?;
            }
            RuleSpec::MatchSourcePortRange(lo, hi) | RuleSpec::MatchDestPortRange(lo, hi) => {
                b.append_u16(*lo)?;
                b.append_u16(*hi)?;
            }
            RuleSpec::MatchTcpSeqRange(lo, hi) => {
                b.append_u32(*lo)?;
                b.append_u32(*hi)?;
            }
            RuleSpec::MatchCharacteristics(bits) => b.append_u64(*bits)?,
            RuleSpec::MatchComField(id, value) => {
                b.append_u64(*id)?;
                b.append_u64(*value)?;
            }
        }
        b.set_u8_at(len_at, (b.len() - start) as u8)
    }

    pub fn unmarshal<const C: usize>(b: &Buffer<C>, cursor: &mut usize) -> Result<Self, ParseError> {
        let t = b.read_u8(cursor)?;
        let not = t & 0x80 != 0;
        let len = b.read_u8(cursor)? as usize;
        let end = *cursor + len;
        let spec = match t & 0x7f {
            0 => RuleSpec::ActionAccept,
            1 => RuleSpec::ActionDrop,
            2 => RuleSpec::ActionTee(Address::unmarshal(b, cursor)?),
            3 => RuleSpec::ActionRedirect(Address::unmarshal(b, cursor)?),
            32 => RuleSpec::MatchSourceMac(Mac::unmarshal(b, cursor)?),
            33 => RuleSpec::MatchDestMac(Mac::unmarshal(b, cursor)?),
            34 => RuleSpec::MatchEtherType(b.read_u16(cursor)?),
            35 | 36 => {
                let ip: [u8; 4] = b.read_bytes(cursor, 4)?.try_into().unwrap();
                let bits = b.read_u8(cursor)?;
                if (t & 0x7f) == 35 {
                    RuleSpec::MatchSourceIpv4(Ipv4Addr::from(ip), bits)
                } else {
                    RuleSpec::MatchDestIpv4(Ipv4Addr::from(ip), bits)
                }
            }
            37 | 38 => {
                let ip: [u8; 16] = b.read_bytes(cursor, 16)?.try_into().unwrap();
                let bits = b.read_u8(cursor)?;
                if (t & 0x7f) == 37 {
                    RuleSpec::MatchSourceIpv6(Ipv6Addr::from(ip), bits)
                } else {
                    RuleSpec::MatchDestIpv6(Ipv6Addr::from(ip), bits)
                }
            }
            39 => RuleSpec::MatchSourcePortRange(b.read_u16(cursor)?, b.read_u16(cursor)?),
            40 => RuleSpec::MatchDestPortRange(b.read_u16(cursor)?, b.read_u16(cursor)?),
            41 => RuleSpec::MatchTcpSeqRange(b.read_u32(cursor)?, b.read_u32(cursor)?),
            42 => RuleSpec::MatchCharacteristics(b.read_u64(cursor)?),
            43 => RuleSpec::MatchComField(b.read_u64(cursor)?, b.read_u64(cursor)?),
            _ => {
                // Unknown rule types are skipped via their length prefix so
                // old nodes tolerate new rule vocabularies.
                *cursor = end;
                return Err(ParseError::InvalidRule);
            }
        };
        if *cursor != end {
            return Err(ParseError::InvalidRule);
        }
        Ok(Self { not, spec })
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RuleOutcome {
    Accept,
    Drop,
}

/// Evaluate a rule set for a frame.
///
/// Only EtherType matches are actually evaluated in this version; every
/// other match type counts as matched. Full field evaluation is a planned
/// extension of the rules engine, not of this function's contract.
pub fn evaluate_rules(rules: &[Rule], ethertype: u16) -> RuleOutcome {
    let mut match_state: Option<bool> = None;
    for rule in rules {
        if rule.spec.is_action() {
            if match_state.unwrap_or(true) {
                return match rule.spec {
                    RuleSpec::ActionDrop => RuleOutcome::Drop,
                    _ => RuleOutcome::Accept,
                };
            }
            match_state = None;
        } else {
            let matched = match rule.spec {
                RuleSpec::MatchEtherType(et) => (et == ethertype) != rule.not,
                _ => true,
            };
            match_state = Some(match_state.unwrap_or(true) && matched);
        }
    }
    RuleOutcome::Drop
}

/// A network configuration as issued by the controller.
#[derive(Clone, Debug)]
pub struct NetworkConfig {
    pub network_id: u64,
    pub timestamp: i64,
    pub revision: u64,
    pub issued_to: Address,
    pub name: String,
    pub private: bool,
    pub mtu: u32,
    pub multicast_limit: u32,
    pub broadcast_enabled: bool,
    pub allow_passive_bridging: bool,
    pub com: Option<CertificateOfMembership>,
    pub static_ips: Vec<InetAddress>,
    pub routes: Vec<VirtualNetworkRoute>,
    pub rules: Vec<Rule>,
    /// Addresses with role flags in the high bits: bridges, relays.
    pub specialists: Vec<u64>,
}

/// The controller's address is the high 40 bits of a network ID.
pub fn controller_for(nwid: u64) -> Address {
    Address::from_u64(nwid >> 24)
}

impl NetworkConfig {
    pub fn active_bridges(&self) -> Vec<Address> {
        self.specialists
            .iter()
            .filter(|s| *s & SPECIALIST_TYPE_ACTIVE_BRIDGE != 0)
            .map(|s| Address::from_u64(*s))
            .collect()
    }

    pub fn relays(&self) -> Vec<Address> {
        self.specialists
            .iter()
            .filter(|s| *s & SPECIALIST_TYPE_NETWORK_RELAY != 0)
            .map(|s| Address::from_u64(*s))
            .collect()
    }

    pub fn is_active_bridge(&self, addr: Address) -> bool {
        self.active_bridges().contains(&addr)
    }

    /// Serialize to the dictionary blob form used on the wire and on disk.
    /// Binary sub-objects ride as escaped binary values.
    pub fn to_dictionary(&self) -> Option<Dictionary<NETWORK_CONFIG_DICT_CAPACITY>> {
        let mut d = Dictionary::new();
        let mut ok = d.add_u64(KEY_VERSION, 1)
            && d.add_u64(KEY_NETWORK_ID, self.network_id)
            && d.add_u64(KEY_TIMESTAMP, self.timestamp as u64)
            && d.add_u64(KEY_REVISION, self.revision)
            && d.add_str(KEY_ISSUED_TO, &self.issued_to.to_string())
            && d.add_str(KEY_NAME, &self.name)
            && d.add_bool(KEY_PRIVATE, self.private)
            && d.add_u64(KEY_MTU, self.mtu as u64)
            && d.add_u64(KEY_MULTICAST_LIMIT, self.multicast_limit as u64)
            && d.add_bool(KEY_BROADCAST, self.broadcast_enabled)
            && d.add_bool(KEY_BRIDGING, self.allow_passive_bridging);

        if let Some(com) = &self.com {
            let mut b: Buffer<512> = Buffer::new();
            com.marshal(&mut b).ok()?;
            ok = ok && d.add(KEY_COM, b.as_bytes());
        }
        if !self.static_ips.is_empty() {
            let mut b: Buffer<2048> = Buffer::new();
            for ip in &self.static_ips {
                ip.marshal(&mut b).ok()?;
            }
            ok = ok && d.add(KEY_STATIC_IPS, b.as_bytes());
        }
        if !self.routes.is_empty() {
            let mut b: Buffer<2048> = Buffer::new();
            for r in &self.routes {
                r.target.marshal(&mut b).ok()?;
                r.via.marshal(&mut b).ok()?;
                b.append_u16(r.flags).ok()?;
                b.append_u16(r.metric).ok()?;
            }
            ok = ok && d.add(KEY_ROUTES, b.as_bytes());
        }
        if !self.rules.is_empty() {
            let mut b: Buffer<4096> = Buffer::new();
            b.append_u16(self.rules.len() as u16).ok()?;
            for r in &self.rules {
                r.marshal(&mut b).ok()?;
            }
            ok = ok && d.add(KEY_RULES, b.as_bytes());
        }
        if !self.specialists.is_empty() {
            let mut b: Buffer<2048> = Buffer::new();
            for s in &self.specialists {
                b.append_u64(*s).ok()?;
            }
            ok = ok && d.add(KEY_SPECIALISTS, b.as_bytes());
        }
        ok.then_some(d)
    }

    pub fn from_dictionary(d: &Dictionary<NETWORK_CONFIG_DICT_CAPACITY>) -> Result<Self, ParseError> {
        let network_id = d.get_u64(KEY_NETWORK_ID).ok_or(ParseError::InvalidNetworkConfig)?;
        let timestamp = d.get_u64(KEY_TIMESTAMP).ok_or(ParseError::InvalidNetworkConfig)? as i64;
        let revision = d.get_u64(KEY_REVISION).unwrap_or(0);
        let issued_to: Address = d
            .get_str(KEY_ISSUED_TO)
            .ok_or(ParseError::InvalidNetworkConfig)?
            .parse()
            .map_err(|_| ParseError::InvalidNetworkConfig)?;

        let com = match d.get(KEY_COM) {
            Some(raw) => {
                let b: Buffer<512> = Buffer::from_bytes(&raw).map_err(|_| ParseError::InvalidNetworkConfig)?;
                Some(CertificateOfMembership::unmarshal(&b, &mut 0)?)
            }
            None => None,
        };

        let mut static_ips = Vec::new();
        if let Some(raw) = d.get(KEY_STATIC_IPS) {
            let b: Buffer<2048> = Buffer::from_bytes(&raw).map_err(|_| ParseError::InvalidNetworkConfig)?;
            let mut c = 0;
            while c < b.len() {
                static_ips.push(InetAddress::unmarshal(&b, &mut c)?);
            }
        }

        let mut routes = Vec::new();
        if let Some(raw) = d.get(KEY_ROUTES) {
            let b: Buffer<2048> = Buffer::from_bytes(&raw).map_err(|_| ParseError::InvalidNetworkConfig)?;
            let mut c = 0;
            while c < b.len() {
                routes.push(VirtualNetworkRoute {
                    target: InetAddress::unmarshal(&b, &mut c)?,
                    via: InetAddress::unmarshal(&b, &mut c)?,
                    flags: b.read_u16(&mut c)?,
                    metric: b.read_u16(&mut c)?,
                });
            }
        }

        let mut rules = Vec::new();
        if let Some(raw) = d.get(KEY_RULES) {
            let b: Buffer<4096> = Buffer::from_bytes(&raw).map_err(|_| ParseError::InvalidNetworkConfig)?;
            let mut c = 0;
            let count = b.read_u16(&mut c)? as usize;
            for _ in 0..count {
                match Rule::unmarshal(&b, &mut c) {
                    Ok(r) => rules.push(r),
                    Err(ParseError::InvalidRule) => {} // unknown type, skipped
                    Err(e) => return Err(e),
                }
            }
        }

        let mut specialists = Vec::new();
        if let Some(raw) = d.get(KEY_SPECIALISTS) {
            let b: Buffer<2048> = Buffer::from_bytes(&raw).map_err(|_| ParseError::InvalidNetworkConfig)?;
            let mut c = 0;
            while c < b.len() {
                specialists.push(b.read_u64(&mut c)?);
            }
        }

        Ok(Self {
            network_id,
            timestamp,
            revision,
            issued_to,
            name: d.get_str(KEY_NAME).unwrap_or_default(),
            private: d.get_bool(KEY_PRIVATE).unwrap_or(true),
            mtu: d.get_u64(KEY_MTU).map(|v| v as u32).unwrap_or(DEFAULT_MTU),
            multicast_limit: d.get_u64(KEY_MULTICAST_LIMIT).map(|v| v as u32).unwrap_or(crate::proto::DEFAULT_MULTICAST_LIMIT),
            broadcast_enabled: d.get_bool(KEY_BROADCAST).unwrap_or(true),
            allow_passive_bridging: d.get_bool(KEY_BRIDGING).unwrap_or(false),
            com,
            static_ips,
            routes,
            rules,
            specialists,
        })
    }

    /// Serialize and sign as the controller. The signature covers the blob
    /// exactly as it stands before the signature line is appended.
    pub fn to_signed_dictionary(&self, controller: &Identity) -> Option<Dictionary<NETWORK_CONFIG_DICT_CAPACITY>> {
        let mut d = self.to_dictionary()?;
        let sig = controller.sign(d.as_bytes())?;
        d.add(KEY_SIGNATURE, &sig).then_some(d)
    }

    /// Verify a received blob against the expected controller identity.
    pub fn verify_dictionary_signature(d: &Dictionary<NETWORK_CONFIG_DICT_CAPACITY>, controller: &Identity) -> bool {
        let Some(sig) = d.get(KEY_SIGNATURE) else {
            return false;
        };
        let mut unsigned = d.clone();
        unsigned.erase(KEY_SIGNATURE);
        controller.verify(unsigned.as_bytes(), &sig)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> NetworkConfig {
        NetworkConfig {
            network_id: 0x8056c2e21c000001,
            timestamp: 1_000_000,
            revision: 7,
            issued_to: Address::from_u64(0x1234567890),
            name: "earth".into(),
            private: true,
            mtu: DEFAULT_MTU,
            multicast_limit: 32,
            broadcast_enabled: true,
            allow_passive_bridging: false,
            com: None,
            static_ips: vec![InetAddress::V4("10.1.2.3".parse().unwrap(), 24)],
            routes: vec![VirtualNetworkRoute {
                target: InetAddress::V4("10.1.0.0".parse().unwrap(), 16),
                via: InetAddress::Nil,
                flags: 0,
                metric: 0,
            }],
            rules: vec![
                Rule { not: false, spec: RuleSpec::MatchEtherType(0x0806) },
                Rule { not: false, spec: RuleSpec::ActionAccept },
                Rule { not: false, spec: RuleSpec::MatchEtherType(0x0800) },
                Rule { not: false, spec: RuleSpec::ActionAccept },
            ],
            specialists: vec![0x55aa55aa55 | SPECIALIST_TYPE_ACTIVE_BRIDGE],
        }
    }

    #[test]
    fn dictionary_round_trip() {
        let cfg = sample_config();
        let d = cfg.to_dictionary().unwrap();
        let back = NetworkConfig::from_dictionary(&d).unwrap();
        assert_eq!(back.network_id, cfg.network_id);
        assert_eq!(back.revision, 7);
        assert_eq!(back.issued_to, cfg.issued_to);
        assert_eq!(back.name, "earth");
        assert_eq!(back.static_ips, cfg.static_ips);
        assert_eq!(back.routes, cfg.routes);
        assert_eq!(back.rules, cfg.rules);
        assert_eq!(back.active_bridges(), vec![Address::from_u64(0x55aa55aa55)]);
        assert!(back.relays().is_empty());
    }

    #[test]
    fn signature_validates_and_detects_tamper() {
        let controller = crate::testutil::identity(0);
        let cfg = sample_config();
        let d = cfg.to_signed_dictionary(controller).unwrap();
        assert!(NetworkConfig::verify_dictionary_signature(&d, controller));

        let mut tampered = d.clone();
        tampered.erase(KEY_REVISION);
        tampered.add_u64(KEY_REVISION, 9999);
        assert!(!NetworkConfig::verify_dictionary_signature(&tampered, controller));

        let wrong = crate::testutil::identity(1);
        assert!(!NetworkConfig::verify_dictionary_signature(&d, wrong));
    }

    #[test]
    fn rule_evaluation_groups_reset_after_action() {
        let rules = vec![
            Rule { not: false, spec: RuleSpec::MatchEtherType(0x0806) },
            Rule { not: false, spec: RuleSpec::ActionAccept },
            Rule { not: false, spec: RuleSpec::MatchEtherType(0x0800) },
            Rule { not: false, spec: RuleSpec::ActionAccept },
        ];
        assert_eq!(evaluate_rules(&rules, 0x0800), RuleOutcome::Accept);
        assert_eq!(evaluate_rules(&rules, 0x86dd), RuleOutcome::Drop);
        // Bare accept accepts all.
        assert_eq!(evaluate_rules(&[Rule { not: false, spec: RuleSpec::ActionAccept }], 0x1234), RuleOutcome::Accept);
        // Empty rule set drops.
        assert_eq!(evaluate_rules(&[], 0x0800), RuleOutcome::Drop);
        // NOT inverts an ethertype match.
        let not_arp_drop = vec![
            Rule { not: true, spec: RuleSpec::MatchEtherType(0x0806) },
            Rule { not: false, spec: RuleSpec::ActionDrop },
            Rule { not: false, spec: RuleSpec::ActionAccept },
        ];
        assert_eq!(evaluate_rules(&not_arp_drop, 0x0806), RuleOutcome::Accept);
        assert_eq!(evaluate_rules(&not_arp_drop, 0x0800), RuleOutcome::Drop);
        // Unevaluated match types are accepted-as-match.
        let other = vec![
            Rule { not: false, spec: RuleSpec::MatchCharacteristics(0xff) },
            Rule { not: false, spec: RuleSpec::ActionAccept },
        ];
        assert_eq!(evaluate_rules(&other, 0x0800), RuleOutcome::Accept);
    }

    #[test]
    fn rule_wire_round_trip() {
        let rules = vec![
            Rule { not: true, spec: RuleSpec::MatchSourceMac(Mac::from_u64(0x112233445566)) },
            Rule { not: false, spec: RuleSpec::MatchSourceIpv4("10.0.0.0".parse().unwrap(), 8) },
            Rule { not: false, spec: RuleSpec::MatchDestIpv6("fd00::".parse().unwrap(), 8) },
            Rule { not: false, spec: RuleSpec::MatchDestPortRange(80, 443) },
            Rule { not: false, spec: RuleSpec::MatchTcpSeqRange(1, 2) },
            Rule { not: false, spec: RuleSpec::MatchComField(7, 9) },
            Rule { not: false, spec: RuleSpec::ActionTee(Address::from_u64(0x99)) },
            Rule { not: false, spec: RuleSpec::ActionDrop },
        ];
        let mut b: Buffer<1024> = Buffer::new();
        for r in &rules {
            r.marshal(&mut b).unwrap();
        }
        let mut c = 0;
        for r in &rules {
            assert_eq!(&Rule::unmarshal(&b, &mut c).unwrap(), r);
        }
        assert_eq!(c, b.len());
    }
}
