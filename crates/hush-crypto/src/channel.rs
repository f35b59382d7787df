//! Symmetric payload channel.
//!
//! # Wire Format
//!
//! ```text
//! base64( [12 bytes: nonce] [ciphertext] [16 bytes: auth tag] )
//! ```
//!
//! The nonce is drawn from the OS CSPRNG on every call. Ciphertexts never depend on each
//! other, which lets ICE candidates be decrypted in whatever order they arrive.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;
use thiserror::Error;

use crate::keys::ChannelKey;

/// ChaCha20-Poly1305 nonce length (96 bits).
pub const NONCE_LEN: usize = 12;

/// Poly1305 tag length.
pub const TAG_LEN: usize = 16;

/// Errors from the symmetric channel.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("encryption failed")]
    Encryption,

    #[error("decryption failed: {0}")]
    Decryption(#[from] DecryptionError),

    #[error("invalid key: {0}")]
    InvalidKey(String),
}

/// Why an inbound transport string was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecryptionError {
    #[error("invalid base64 encoding")]
    Encoding,

    #[error("payload too short: {0} bytes")]
    Truncated(usize),

    #[error("authentication failed")]
    Authentication,

    #[error("invalid plaintext: {0}")]
    Payload(String),
}

impl From<CryptoError> for hush_common::Error {
    fn from(err: CryptoError) -> Self {
        hush_common::Error::crypto(err)
    }
}

/// Authenticated encryption of structured payloads under one symmetric key.
#[derive(Clone)]
pub struct SymmetricChannel {
    cipher: ChaCha20Poly1305,
}

impl SymmetricChannel {
    pub fn new(key: &ChannelKey) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key.as_bytes())),
        }
    }

    /// Serialize `value` and seal it into a transport string.
    pub fn encrypt<T: Serialize + ?Sized>(&self, value: &T) -> Result<String, CryptoError> {
        let plaintext =
            serde_json::to_vec(value).map_err(|e| CryptoError::Serialization(e.to_string()))?;
        self.seal(&plaintext)
    }

    /// Open a transport string and deserialize the plaintext.
    pub fn decrypt<T: DeserializeOwned>(&self, transport: &str) -> Result<T, CryptoError> {
        let plaintext = self.open(transport)?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| CryptoError::Decryption(DecryptionError::Payload(e.to_string())))
    }

    /// Seal raw bytes: fresh nonce, AEAD, base64.
    pub fn seal(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::Encryption)?;

        let mut packet = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        packet.extend_from_slice(&nonce);
        packet.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(packet))
    }

    /// Reverse of [`seal`](Self::seal).
    pub fn open(&self, transport: &str) -> Result<Vec<u8>, CryptoError> {
        let packet = STANDARD
            .decode(transport.trim())
            .map_err(|_| DecryptionError::Encoding)?;

        if packet.len() < NONCE_LEN + TAG_LEN {
            return Err(DecryptionError::Truncated(packet.len()).into());
        }

        let (nonce, ciphertext) = packet.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| DecryptionError::Authentication)?;
        Ok(plaintext)
    }
}

impl fmt::Debug for SymmetricChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricChannel(..)")
    }
}
