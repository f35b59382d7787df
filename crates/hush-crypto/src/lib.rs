//! Cryptographic primitives for Hush.
//!
//! This crate provides:
//! - Process-lifetime key material (X25519 exchange keypair plus a symmetric channel key)
//! - The symmetric channel used to wrap chat text, signaling descriptors and
//!   auxiliary-channel metadata before they cross the relay
//!
//! # Design
//!
//! Every payload is serialized to JSON and sealed with ChaCha20-Poly1305 under a fresh
//! random 96-bit nonce. The transport form is `base64(nonce || ciphertext || tag)`, so each
//! payload is independently decryptable regardless of arrival order.

#![forbid(unsafe_code)]

pub mod channel;
pub mod keys;

pub use channel::{CryptoError, DecryptionError, SymmetricChannel, NONCE_LEN, TAG_LEN};
pub use keys::{ChannelKey, ClientKeys, KEY_LEN};
