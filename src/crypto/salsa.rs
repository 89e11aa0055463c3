/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */
use salsa20::cipher::{KeyIvInit, StreamCipher};
use salsa20::{Salsa12, Salsa20};

use crate::crypto::{SALSA_IV_SIZE, SALSA_KEY_SIZE};

/// Salsa20/12 keystream, the packet cipher.
///
/// The 8-byte IV is the packet ID; the block counter starts at zero for every
/// packet, which is safe because packet IDs never repeat under one key.
pub struct Salsa2012(Salsa12);

impl Salsa2012 {
    pub fn new(key: &[u8; SALSA_KEY_SIZE], iv: &[u8; SALSA_IV_SIZE]) -> Self {
        Self(Salsa12::new(key.into(), iv.into()))
    }

    #[inline]
    pub fn crypt_in_place(&mut self, data: &mut [u8]) {
        self.0.apply_keystream(data);
    }

    /// Fill `out` with raw keystream.
    #[inline]
    pub fn keystream(&mut self, out: &mut [u8]) {
        out.fill(0);
        self.0.apply_keystream(out);
    }
}

/// Full-round Salsa20/20, used only by the identity hashcash function.
pub struct Salsa2020(Salsa20);

impl Salsa2020 {
    pub fn new(key: &[u8; SALSA_KEY_SIZE], iv: &[u8; SALSA_IV_SIZE]) -> Self {
        Self(Salsa20::new(key.into(), iv.into()))
    }

    #[inline]
    pub fn crypt_in_place(&mut self, data: &mut [u8]) {
        self.0.apply_keystream(data);
    }
}
