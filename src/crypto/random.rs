/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */
use std::sync::Mutex;

use rand_core::{OsRng, RngCore};

use crate::crypto::salsa::Salsa2012;

/// Fill with OS entropy. All key material comes through here.
pub fn fill_secure(dest: &mut [u8]) {
    OsRng.fill_bytes(dest);
}

pub fn next_secure_u64() -> u64 {
    OsRng.next_u64()
}

/// A cheap Salsa20/12 keystream PRNG seeded once from OS entropy.
///
/// This is for non-cryptographic choices: timing jitter, random member
/// selection, packet IDs. Never for keys.
pub struct SalsaPrng {
    inner: Mutex<PrngState>,
}

struct PrngState {
    cipher: Salsa2012,
    buf: [u8; 64],
    ptr: usize,
}

impl SalsaPrng {
    pub fn new() -> Self {
        let mut key = [0u8; 32];
        let mut iv = [0u8; 8];
        fill_secure(&mut key);
        fill_secure(&mut iv);
        Self {
            inner: Mutex::new(PrngState { cipher: Salsa2012::new(&key, &iv), buf: [0; 64], ptr: 64 }),
        }
    }

    pub fn next_u64(&self) -> u64 {
        let mut s = self.inner.lock().unwrap();
        if s.ptr + 8 > s.buf.len() {
            let mut fresh = [0u8; 64];
            s.cipher.keystream(&mut fresh);
            s.buf = fresh;
            s.ptr = 0;
        }
        let v = u64::from_ne_bytes(s.buf[s.ptr..s.ptr + 8].try_into().unwrap());
        s.ptr += 8;
        v
    }

    pub fn next_u32(&self) -> u32 {
        self.next_u64() as u32
    }
}

impl Default for SalsaPrng {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streams_do_not_repeat_or_collide() {
        let p = SalsaPrng::new();
        let q = SalsaPrng::new();
        let mut last = 0u64;
        for _ in 0..64 {
            let v = p.next_u64();
            assert_ne!(v, last);
            last = v;
        }
        // Two instances are independently seeded.
        assert_ne!(p.next_u64(), q.next_u64());
    }
}
