//! Cryptographic primitives: AEAD framing, hashing, and constant-time
//! comparison.
//!
//! Confidentiality and integrity of the wire protocol come entirely from
//! AES-256-GCM once a session is authenticated; there is no PKI and no
//! certificate verification. Trust is established once, out of band, by
//! the pairing handshake in [`crate::pairing`].

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Length of an AES-256-GCM key, in bytes.
pub const KEY_SIZE: usize = 32;

/// Length of the random nonce prepended to every encrypted frame.
pub const NONCE_SIZE: usize = 12;

/// Length of the GCM authentication tag appended by the cipher.
pub const TAG_SIZE: usize = 16;

/// Encrypt `plaintext` under `key`, returning `nonce(12) || ciphertext ||
/// tag(16)`.
///
/// A fresh random nonce is generated for every call; associated data is
/// empty, matching the wire format.
pub fn encrypt(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce_bytes = random_bytes::<NONCE_SIZE>();
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| Error::Internal("AEAD encryption failed".to_string()))?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a `nonce(12) || ciphertext || tag(16)` payload under `key`.
///
/// Returns [`Error::DecryptFailed`] on any failure: too-short payload,
/// wrong key, or a tampered nonce/ciphertext/tag.
pub fn decrypt(key: &[u8; KEY_SIZE], payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() < NONCE_SIZE + TAG_SIZE {
        return Err(Error::DecryptFailed);
    }

    let (nonce_bytes, ciphertext) = payload.split_at(NONCE_SIZE);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| Error::DecryptFailed)
}

/// SHA-256 of `data`.
#[must_use]
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Computes the session auth-response digest `SHA-256(nonce || shared_key)`.
///
/// This preserves the literal source behaviour rather than substituting an
/// HMAC; see `DESIGN.md` for the rationale.
#[must_use]
pub fn auth_response(nonce: &[u8], shared_key: &[u8; KEY_SIZE]) -> [u8; 32] {
    let mut buf = Vec::with_capacity(nonce.len() + KEY_SIZE);
    buf.extend_from_slice(nonce);
    buf.extend_from_slice(shared_key);
    sha256(&buf)
}

/// Constant-time byte slice comparison. Returns `false` on any length
/// mismatch without short-circuiting on content.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Fill an array of `N` cryptographically random bytes.
#[must_use]
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Combine two key halves contributed by each pairing party:
/// `shared_key = k_s XOR k_c`.
#[must_use]
pub fn xor_key_halves(k_s: &[u8; KEY_SIZE], k_c: &[u8; KEY_SIZE]) -> [u8; KEY_SIZE] {
    let mut out = [0u8; KEY_SIZE];
    for i in 0..KEY_SIZE {
        out[i] = k_s[i] ^ k_c[i];
    }
    out
}

/// Generate a random 6-digit pairing PIN, zero-padded, as a `String`.
#[must_use]
pub fn generate_pin() -> String {
    let n = rand::thread_rng().next_u32() % 1_000_000;
    format!("{n:06}")
}
