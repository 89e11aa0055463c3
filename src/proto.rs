/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

/* Version */

pub const PROTOCOL_VERSION: u8 = 1;
pub const VERSION_MAJOR: u8 = 1;
pub const VERSION_MINOR: u8 = 0;
pub const VERSION_REVISION: u16 = 0;

/* Packet geometry */
/*
Header:
    [0..8]   packet ID (also the cipher IV)
    [8..13]  destination address
    [13..18] source address
    [18]     flags: [7..6] cipher suite, [5] reserved, [4] fragmented,
             [3] encrypted, [2..0] hop count
    [19..27] first 8 bytes of Poly1305 MAC (or trusted path ID)
    [27]     verb; bit 7 = payload is LZ4 compressed
Payload follows the verb.
*/

pub const PACKET_IDX_IV: usize = 0;
pub const PACKET_IDX_DEST: usize = 8;
pub const PACKET_IDX_SOURCE: usize = 13;
pub const PACKET_IDX_FLAGS: usize = 18;
pub const PACKET_IDX_MAC: usize = 19;
pub const PACKET_IDX_VERB: usize = 27;

pub const PACKET_MIN_SIZE: usize = 28;
pub const PACKET_MAX_SIZE: usize = 16384;

/// Conservative default UDP payload MTU: 1500 minus IPv4/UDP headers and
/// slack for PPPoE and similar underlays.
pub const UDP_DEFAULT_PAYLOAD_MTU: usize = 1444;

pub const FLAGS_HOPS_MASK: u8 = 0x07;
pub const FLAGS_ENCRYPTED: u8 = 0x08;
pub const FLAGS_FRAGMENTED: u8 = 0x10;
pub const FLAGS_CIPHER_SHIFT: u32 = 6;
pub const MAX_HOPS: u8 = 7;

pub const CIPHER_SUITE_POLY1305_NONE: u8 = 0;
pub const CIPHER_SUITE_POLY1305_SALSA2012: u8 = 1;
pub const CIPHER_SUITE_TRUSTED_PATH: u8 = 2;

pub const VERB_MASK: u8 = 0x1f;
pub const VERB_FLAG_COMPRESSED: u8 = 0x80;

/* Fragments */
/*
Fragment header:
    [0..8]   packet ID of the packet this is a fragment of
    [8..13]  destination address (fragments are relayed without reassembly)
    [13]     0xff, a reserved address prefix, marking this as a fragment
    [14]     [7..4] fragment number, [3..0] total fragments
    [15]     hop count
*/

pub const FRAGMENT_IDX_PACKET_ID: usize = 0;
pub const FRAGMENT_IDX_DEST: usize = 8;
pub const FRAGMENT_IDX_INDICATOR: usize = 13;
pub const FRAGMENT_IDX_FRAGMENT_NO: usize = 14;
pub const FRAGMENT_IDX_HOPS: usize = 15;
pub const FRAGMENT_HEADER_SIZE: usize = 16;
pub const FRAGMENT_INDICATOR: u8 = 0xff;

/// Fragment counts travel in 4 bits.
pub const MAX_FRAGMENTS: usize = 15;

/* Resource caps */

pub const MAX_PATHS_PER_PEER: usize = 4;
pub const REASSEMBLY_TABLE_SIZE: usize = 64;
pub const RX_QUEUE_SIZE: usize = 32;
pub const TX_QUEUE_SIZE: usize = 32;
pub const CONTACT_QUEUE_SIZE: usize = 256;
pub const MAX_OUTSTANDING_WHOIS: usize = 10;
pub const MULTICAST_MAX_MEMBERS: usize = 8192;
pub const REPLAY_WINDOW_SIZE: usize = 32;
pub const MAX_NETWORK_SPECIALISTS: usize = 256;

pub const NETWORK_CONFIG_DICT_CAPACITY: usize = 8192;
pub const NETWORK_CONFIG_METADATA_DICT_CAPACITY: usize = 1024;

/* Timing (milliseconds) */

pub const PING_CHECK_INTERVAL: i64 = 30_000;
pub const HOUSEKEEPING_PERIOD: i64 = 120_000;
pub const TIMER_GRANULARITY: i64 = 500;

/// A path with no receive inside this window is no longer "active".
pub const PATH_ACTIVITY_TIMEOUT: i64 = 60_000;
/// We are "online" if an upstream peer was heard inside this window.
pub const PEER_ACTIVITY_TIMEOUT: i64 = 65_000;
/// Upstream peers get keepalives at this interval per address family.
pub const PEER_DIRECT_PING_DELAY: i64 = 60_000;
/// Idle paths get a tiny NOP this often to hold NAT mappings open.
pub const NAT_KEEPALIVE_DELAY: i64 = 20_000;
/// Ordinary peers are only kept alive while frames flowed this recently.
pub const PEER_FRAME_EXCHANGE_HORIZON: i64 = 150_000;
/// Peers untouched for this long are evicted (roots excepted).
pub const PEER_EXPIRATION: i64 = 30 * 60_000;

pub const FRAGMENT_REASSEMBLY_TTL: i64 = 500;
pub const RX_TX_QUEUE_TTL: i64 = 5_000;

pub const WHOIS_RETRY_DELAY: i64 = 500;
pub const MAX_WHOIS_RETRIES: u32 = 4;

/// NAT traversal probe schedule after a RENDEZVOUS, relative to receipt.
pub const CONTACT_PROBE_SCHEDULE: [i64; 4] = [0, 500, 1_000, 2_000];
/// Floor between RENDEZVOUS originations for the same peer pair.
pub const UNITE_MIN_INTERVAL: i64 = 30_000;

pub const MULTICAST_LIKE_INTERVAL: i64 = 60_000;
pub const MULTICAST_LIKE_EXPIRE: i64 = 600_000;
pub const MULTICAST_EXPLICIT_GATHER_DELAY: i64 = 5_000;
pub const MULTICAST_TRANSMIT_TIMEOUT: i64 = 60_000;
pub const DEFAULT_MULTICAST_LIMIT: u32 = 32;

pub const NETWORK_AUTOCONF_DELAY: i64 = 60_000;
/// How long a pushed membership certificate is considered fresh on the
/// receiving peer before we push it again.
pub const COM_PUSH_HORIZON: i64 = 600_000;

/// A candidate root must beat the current one by this fraction of latency
/// (in percent) before we switch. Keeps root selection from flapping.
pub const ROOT_SWITCH_LATENCY_MARGIN_PCT: u32 = 25;
