/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::crypto::secret::{secure_eq, Secret};
use crate::crypto::{random, sha512, C25519_PRIVATE_KEY_SIZE, C25519_PUBLIC_KEY_SIZE, C25519_SHARED_KEY_SIZE, C25519_SIGNATURE_SIZE};

/// A combined Curve25519 ECDH and Ed25519 signature key pair.
///
/// Public and private blobs are each 64 bytes: the ECDH half in bytes 0..32
/// and the signing half in bytes 32..64.
///
/// Signatures are a 96-byte composite: a 64-byte Ed25519 signature over the
/// first 32 bytes of the SHA-512 digest of the message, followed by that
/// digest prefix itself. The trailing prefix lets a single byte stream carry
/// both an integrity check and an explicit digest of what was signed.
#[derive(Clone)]
pub struct C25519KeyPair {
    dh: StaticSecret,
    ed: SigningKey,
}

impl C25519KeyPair {
    pub fn generate() -> Self {
        let mut dh_seed = [0u8; 32];
        let mut ed_seed = [0u8; 32];
        random::fill_secure(&mut dh_seed);
        random::fill_secure(&mut ed_seed);
        Self { dh: StaticSecret::from(dh_seed), ed: SigningKey::from_bytes(&ed_seed) }
    }

    /// Generate a key pair whose public blob satisfies a condition.
    ///
    /// The signing half is fixed and the ECDH half is re-rolled by counting
    /// the secret upward until `cond` accepts the public blob. Used for the
    /// identity hashcash search, where the condition is expensive.
    pub fn generate_satisfying(mut cond: impl FnMut(&[u8; C25519_PUBLIC_KEY_SIZE]) -> bool) -> Self {
        let mut ed_seed = [0u8; 32];
        random::fill_secure(&mut ed_seed);
        let ed = SigningKey::from_bytes(&ed_seed);
        let mut dh_seed = [0u8; 32];
        random::fill_secure(&mut dh_seed);
        loop {
            // Increment the middle of the seed; clamping only touches the
            // first and last bytes, so every step yields a distinct scalar.
            let ctr = u64::from_le_bytes(dh_seed[8..16].try_into().unwrap()).wrapping_add(1);
            dh_seed[8..16].copy_from_slice(&ctr.to_le_bytes());
            let dh = StaticSecret::from(dh_seed);
            let kp = Self { dh, ed: ed.clone() };
            if cond(&kp.public_bytes()) {
                return kp;
            }
        }
    }

    /// Reconstruct from serialized halves. The supplied public blob must
    /// match what the private blob derives to.
    pub fn from_bytes(public: &[u8; C25519_PUBLIC_KEY_SIZE], private: &[u8; C25519_PRIVATE_KEY_SIZE]) -> Option<Self> {
        let dh_seed: [u8; 32] = private[..32].try_into().unwrap();
        let ed_seed: [u8; 32] = private[32..].try_into().unwrap();
        let kp = Self { dh: StaticSecret::from(dh_seed), ed: SigningKey::from_bytes(&ed_seed) };
        if secure_eq(&kp.public_bytes(), public) {
            Some(kp)
        } else {
            None
        }
    }

    pub fn public_bytes(&self) -> [u8; C25519_PUBLIC_KEY_SIZE] {
        let mut pk = [0u8; C25519_PUBLIC_KEY_SIZE];
        pk[..32].copy_from_slice(X25519Public::from(&self.dh).as_bytes());
        pk[32..].copy_from_slice(self.ed.verifying_key().as_bytes());
        pk
    }

    pub fn private_bytes(&self) -> Secret<C25519_PRIVATE_KEY_SIZE> {
        let mut sk = Secret::new();
        sk.0[..32].copy_from_slice(self.dh.as_bytes());
        sk.0[32..].copy_from_slice(&self.ed.to_bytes());
        sk
    }

    /// ECDH agreement, expanded through SHA-512. Symmetric in the pair:
    /// `a.agree(b.pub) == b.agree(a.pub)`.
    pub fn agree(&self, their_public: &[u8; C25519_PUBLIC_KEY_SIZE]) -> Secret<C25519_SHARED_KEY_SIZE> {
        let their_dh: [u8; 32] = their_public[..32].try_into().unwrap();
        let raw = self.dh.diffie_hellman(&X25519Public::from(their_dh));
        Secret::from_bytes(sha512::hash(raw.as_bytes()))
    }

    pub fn sign(&self, msg: &[u8]) -> [u8; C25519_SIGNATURE_SIZE] {
        let digest = sha512::hash(msg);
        let mut sig = [0u8; C25519_SIGNATURE_SIZE];
        sig[..64].copy_from_slice(&self.ed.sign(&digest[..32]).to_bytes());
        sig[64..].copy_from_slice(&digest[..32]);
        sig
    }
}

/// Verify a 96-byte composite signature against a 64-byte public blob.
pub fn verify(public: &[u8; C25519_PUBLIC_KEY_SIZE], msg: &[u8], signature: &[u8]) -> bool {
    if signature.len() != C25519_SIGNATURE_SIZE {
        return false;
    }
    let digest = sha512::hash(msg);
    if !secure_eq(&digest[..32], &signature[64..]) {
        return false;
    }
    let ed_pub: [u8; 32] = public[32..].try_into().unwrap();
    let sig_bytes: [u8; 64] = signature[..64].try_into().unwrap();
    match VerifyingKey::from_bytes(&ed_pub) {
        Ok(vk) => vk.verify_strict(&digest[..32], &ed25519_dalek::Signature::from_bytes(&sig_bytes)).is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agreement_is_symmetric() {
        let a = C25519KeyPair::generate();
        let b = C25519KeyPair::generate();
        assert_eq!(a.agree(&b.public_bytes()), b.agree(&a.public_bytes()));
        let c = C25519KeyPair::generate();
        assert_ne!(a.agree(&b.public_bytes()), a.agree(&c.public_bytes()));
    }

    #[test]
    fn sign_verify_and_bit_flips() {
        let kp = C25519KeyPair::generate();
        let public = kp.public_bytes();
        let msg = b"membership certificate bytes";
        let sig = kp.sign(msg);
        assert!(verify(&public, msg, &sig));

        let mut bad_msg = *msg;
        bad_msg[3] ^= 0x10;
        assert!(!verify(&public, &bad_msg, &sig));

        for i in [0usize, 40, 63, 64, 95] {
            let mut bad_sig = sig;
            bad_sig[i] ^= 1;
            assert!(!verify(&public, msg, &bad_sig));
        }
        assert!(!verify(&public, msg, &sig[..95]));
    }

    #[test]
    fn round_trip_through_bytes() {
        let kp = C25519KeyPair::generate();
        let restored = C25519KeyPair::from_bytes(&kp.public_bytes(), kp.private_bytes().as_bytes()).unwrap();
        assert_eq!(restored.public_bytes(), kp.public_bytes());

        // Mismatched halves are rejected.
        let other = C25519KeyPair::generate();
        assert!(C25519KeyPair::from_bytes(&other.public_bytes(), kp.private_bytes().as_bytes()).is_none());
    }

    #[test]
    fn generate_satisfying_re_rolls_only_dh_half() {
        let kp = C25519KeyPair::generate_satisfying(|pk| pk[0] & 0x07 == 0);
        assert_eq!(kp.public_bytes()[0] & 0x07, 0);
    }
}
