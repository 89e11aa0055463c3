/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::fmt;

use crate::buffer::BufferOverflow;

/// Failure to parse a serialized object from a string or wire blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    InvalidAddress,
    InvalidMac,
    InvalidIdentity,
    /// Identity type byte was not "0"; future types are not accepted here.
    UnsupportedIdentityType,
    InvalidWorld,
    InvalidCertificate,
    InvalidNetworkConfig,
    InvalidRule,
    Truncated,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidAddress => "invalid address",
            Self::InvalidMac => "invalid MAC",
            Self::InvalidIdentity => "invalid identity",
            Self::UnsupportedIdentityType => "unsupported identity type",
            Self::InvalidWorld => "invalid world",
            Self::InvalidCertificate => "invalid certificate",
            Self::InvalidNetworkConfig => "invalid network config",
            Self::InvalidRule => "invalid rule",
            Self::Truncated => "truncated object",
        };
        f.write_str(s)
    }
}
impl std::error::Error for ParseError {}

impl From<BufferOverflow> for ParseError {
    fn from(_: BufferOverflow) -> Self {
        Self::Truncated
    }
}

/// A fault caused by a received packet.
///
/// An unauthenticated attacker can trigger any of these on purpose, so they
/// are dropped locally (optionally surfaced through the trace event) and never
/// answered on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultType {
    /// Packet failed MAC verification against the expected peer key.
    AuthenticationFailed,
    /// Packet or verb payload was structurally malformed.
    InvalidPacket,
    /// Verb byte is not one we implement. Silently ignored for forward
    /// compatibility.
    UnknownVerb,
    /// Packet ID was seen recently on this peer.
    Replay,
    /// Object inside the packet (config, certificate, world) was expired.
    Expired,
    /// A field value was out of range.
    BadParameter,
    /// Fragmented packet exceeded the fragment or size limits.
    FragmentedTooLong,
}

impl From<BufferOverflow> for FaultType {
    fn from(_: BufferOverflow) -> Self {
        Self::InvalidPacket
    }
}

impl From<ParseError> for FaultType {
    fn from(_: ParseError) -> Self {
        Self::InvalidPacket
    }
}

/// A frame or packet refused by policy rather than by protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyError {
    /// Not authorized on this network (no or failed certificate).
    NetworkAccessDenied,
    /// Both sides hold certificates but they do not agree.
    ComDisagreement,
    /// Frame matched a DROP rule (or fell through the rule set).
    RuleDropped,
    /// Physical path vetoed by the host's path-check callback.
    PathRejected,
}

impl fmt::Display for PolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NetworkAccessDenied => "network access denied",
            Self::ComDisagreement => "membership certificates disagree",
            Self::RuleDropped => "dropped by rule",
            Self::PathRejected => "physical path rejected",
        };
        f.write_str(s)
    }
}
impl std::error::Error for PolicyError {}
