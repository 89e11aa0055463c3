/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */
use poly1305::universal_hash::KeyInit;
use poly1305::Poly1305;

use crate::crypto::{POLY1305_KEY_SIZE, POLY1305_MAC_SIZE};

/// One-shot Poly1305.
///
/// The key must be used for exactly one message; packet armor derives it from
/// the first keystream block of the per-packet Salsa20/12 state. Only the
/// first 8 bytes of the tag travel on the wire.
pub fn compute(key: &[u8; POLY1305_KEY_SIZE], data: &[u8]) -> [u8; POLY1305_MAC_SIZE] {
    Poly1305::new(key.into()).compute_unpadded(data).into()
}
