// SPDX-License-Identifier: MIT

//! The cryptographic collaborator (§1, §6): "the core only calls into them." This
//! module defines the seam, not a real cipher — a production build links a real
//! `CipherSuite` implementation; [`PlaceholderCipher`] exists so the handshake state
//! machine (§4.5) and its tests can run without one.

use crate::error::DaemonError;
use rand::RngCore;

/// An opaque session key, established during the `METAKEY` exchange.
#[derive(Clone)]
pub struct SessionKey(pub Vec<u8>);

/// The operations C5's handshake needs from the crypto layer. Real implementations
/// wrap a block cipher, a MAC, and an asymmetric key-agreement primitive; none of
/// that is specified here (§1 Non-goals).
pub trait CipherSuite: Send {
    /// Generates a fresh random session key for `METAKEY`.
    fn generate_session_key(&self) -> SessionKey;

    /// Encrypts `plaintext` under the long-term public key named by `peer_fingerprint`.
    fn seal_with_identity(
        &self,
        peer_fingerprint: &str,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, DaemonError>;

    /// Decrypts data addressed to our own long-term private key.
    fn open_with_identity(&self, ciphertext: &[u8]) -> Result<Vec<u8>, DaemonError>;

    /// Encrypts `plaintext` under an established session key (`CHALLENGE`, data).
    fn seal_with_session(
        &self,
        key: &SessionKey,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, DaemonError>;

    /// Decrypts data under an established session key.
    fn open_with_session(
        &self,
        key: &SessionKey,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, DaemonError>;

    /// Computes the digest used for `CHAL_REPLY`.
    fn digest(&self, data: &[u8]) -> Vec<u8>;

    /// Fills `buf` with cryptographically random bytes (nonces, etc).
    fn random_bytes(&self, buf: &mut [u8]);
}

/// A non-cryptographic stand-in that satisfies the trait's *shape* so the
/// control-plane state machine can be exercised in tests. It does NOT provide
/// confidentiality or authenticity and must never be linked into a real deployment;
/// it XORs with a fixed keystream and "digests" by summation, which is sufficient to
/// prove the CHALLENGE/CHAL_REPLY round trip wires up correctly without pulling in a
/// real cipher crate purely to unit-test control flow.
#[derive(Default)]
pub struct PlaceholderCipher;

impl CipherSuite for PlaceholderCipher {
    fn generate_session_key(&self) -> SessionKey {
        let mut key = vec![0u8; 32];
        self.random_bytes(&mut key);
        SessionKey(key)
    }

    fn seal_with_identity(
        &self,
        _peer_fingerprint: &str,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, DaemonError> {
        Ok(plaintext.to_vec())
    }

    fn open_with_identity(&self, ciphertext: &[u8]) -> Result<Vec<u8>, DaemonError> {
        Ok(ciphertext.to_vec())
    }

    fn seal_with_session(
        &self,
        key: &SessionKey,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, DaemonError> {
        Ok(xor_keystream(key, plaintext))
    }

    fn open_with_session(
        &self,
        key: &SessionKey,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, DaemonError> {
        Ok(xor_keystream(key, ciphertext))
    }

    fn digest(&self, data: &[u8]) -> Vec<u8> {
        let mut acc: u64 = 0xcbf29ce484222325;
        for &b in data {
            acc ^= b as u64;
            acc = acc.wrapping_mul(0x100000001b3);
        }
        acc.to_be_bytes().to_vec()
    }

    fn random_bytes(&self, buf: &mut [u8]) {
        rand::thread_rng().fill_bytes(buf);
    }
}

fn xor_keystream(key: &SessionKey, data: &[u8]) -> Vec<u8> {
    data.iter()
        .enumerate()
        .map(|(i, b)| b ^ key.0[i % key.0.len()])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_round_trips_through_seal_and_open() {
        let cipher = PlaceholderCipher;
        let key = cipher.generate_session_key();
        let plaintext = b"CHALLENGE nonce-bytes";
        let sealed = cipher.seal_with_session(&key, plaintext).unwrap();
        let opened = cipher.open_with_session(&key, &sealed).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn digest_is_deterministic() {
        let cipher = PlaceholderCipher;
        assert_eq!(cipher.digest(b"nonce"), cipher.digest(b"nonce"));
        assert_ne!(cipher.digest(b"nonce"), cipher.digest(b"other"));
    }
}
