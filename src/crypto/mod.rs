/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */
pub mod c25519;
pub mod poly1305;
pub mod random;
pub mod salsa;
pub mod secret;
pub mod sha512;

pub use secret::{secure_eq, Secret};

pub const SHA512_HASH_SIZE: usize = 64;
pub const SALSA_KEY_SIZE: usize = 32;
pub const SALSA_IV_SIZE: usize = 8;
pub const POLY1305_KEY_SIZE: usize = 32;
pub const POLY1305_MAC_SIZE: usize = 16;
pub const C25519_PUBLIC_KEY_SIZE: usize = 64;
pub const C25519_PRIVATE_KEY_SIZE: usize = 64;
pub const C25519_SIGNATURE_SIZE: usize = 96;
pub const C25519_SHARED_KEY_SIZE: usize = 64;

/// Size of the per-peer symmetric key actually used by the packet cipher:
/// the first half of the SHA-512 expanded agreement.
pub const PEER_KEY_SIZE: usize = 32;
