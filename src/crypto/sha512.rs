/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */
use sha2::{Digest, Sha512};

use crate::crypto::SHA512_HASH_SIZE;

pub fn hash(data: &[u8]) -> [u8; SHA512_HASH_SIZE] {
    let mut h = Sha512::new();
    h.update(data);
    h.finalize().into()
}

/// Hash the concatenation of several slices without copying them together.
pub fn hash_all(data: &[&[u8]]) -> [u8; SHA512_HASH_SIZE] {
    let mut h = Sha512::new();
    for d in data {
        h.update(d);
    }
    h.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        // SHA-512("abc")
        let d = hash(b"abc");
        assert_eq!(
            &d[..8],
            &[0xdd, 0xaf, 0x35, 0xa1, 0x93, 0x61, 0x7a, 0xba]
        );
        assert_eq!(hash_all(&[b"a", b"bc"]), d);
    }
}
