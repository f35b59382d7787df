//! Process-lifetime key material.
//!
//! A client generates one [`ClientKeys`] at startup. It holds:
//! - an X25519 key-exchange keypair, only used when a caller opts into [`ClientKeys::agree`]
//! - the [`ChannelKey`] that seals chat, signaling and auxiliary-channel payloads
//!
//! Nothing here is persisted or exported implicitly. Secrets are zeroized on drop.
//!
//! # Example
//!
//! ```
//! use hush_crypto::ClientKeys;
//!
//! let keys = ClientKeys::generate();
//! let channel = keys.channel();
//!
//! let sealed = channel.encrypt("hi").unwrap();
//! let opened: String = channel.decrypt(&sealed).unwrap();
//! assert_eq!(opened, "hi");
//! ```

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::fmt;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::channel::{CryptoError, SymmetricChannel};

/// Symmetric key length (256 bits).
pub const KEY_LEN: usize = 32;

const AGREEMENT_LABEL: &[u8] = b"hush-channel-v1";

/// 256-bit key for the symmetric channel.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct ChannelKey([u8; KEY_LEN]);

impl ChannelKey {
    /// Generate a new random key using the OS CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a key shared out of band (standard base64, 32 bytes).
    pub fn from_base64(s: &str) -> Result<Self, CryptoError> {
        let mut bytes = STANDARD
            .decode(s.trim())
            .map_err(|_| CryptoError::InvalidKey("invalid base64 encoding".into()))?;

        if bytes.len() != KEY_LEN {
            let len = bytes.len();
            bytes.zeroize();
            return Err(CryptoError::InvalidKey(format!(
                "expected {KEY_LEN} bytes, got {len}"
            )));
        }

        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&bytes);
        bytes.zeroize();
        Ok(Self::from_bytes(key))
    }

    /// Export for out-of-band sharing.
    ///
    /// # Security
    /// Anyone holding this string can read every payload sealed under the key.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChannelKey(<redacted>)")
    }
}

/// Key material generated once per client process.
pub struct ClientKeys {
    exchange_secret: StaticSecret,
    exchange_public: PublicKey,
    channel_key: ChannelKey,
}

impl ClientKeys {
    /// Fresh exchange keypair and fresh channel key.
    pub fn generate() -> Self {
        Self::with_channel_key(ChannelKey::generate())
    }

    /// Fresh exchange keypair, caller-provided channel key.
    pub fn with_channel_key(channel_key: ChannelKey) -> Self {
        let exchange_secret = StaticSecret::random_from_rng(OsRng);
        let exchange_public = PublicKey::from(&exchange_secret);
        Self {
            exchange_secret,
            exchange_public,
            channel_key,
        }
    }

    /// Public half of the exchange keypair.
    pub fn exchange_public(&self) -> [u8; 32] {
        *self.exchange_public.as_bytes()
    }

    pub fn channel_key(&self) -> &ChannelKey {
        &self.channel_key
    }

    /// Channel sealing under the process channel key.
    pub fn channel(&self) -> SymmetricChannel {
        SymmetricChannel::new(&self.channel_key)
    }

    /// Derive a channel key shared with a peer.
    ///
    /// `SHA-256(label || context || X25519(own_secret, peer_public))`. Both sides get the
    /// same key when they swap public keys and use the same `context` (e.g. the room id).
    /// The exchange itself is unauthenticated; callers must verify `peer_public` out of band.
    pub fn agree(&self, peer_public: &[u8; 32], context: &[u8]) -> ChannelKey {
        let shared = self
            .exchange_secret
            .diffie_hellman(&PublicKey::from(*peer_public));

        let mut hasher = Sha256::new();
        hasher.update(AGREEMENT_LABEL);
        hasher.update(context);
        hasher.update(shared.as_bytes());
        let digest = hasher.finalize();

        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&digest);
        ChannelKey(key)
    }
}

impl fmt::Debug for ClientKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientKeys")
            .field("exchange_public", &STANDARD.encode(self.exchange_public.as_bytes()))
            .finish_non_exhaustive()
    }
}
