#![forbid(unsafe_code)]

//! Hush client library.
//!
//! - [`signaling`]: WebSocket connection to the room relay
//! - [`chat`]: sealing and opening chat lines
//! - [`negotiator`]: the call session state machine
//! - [`peer`]: traits for media capture and peer connections
//! - [`dummy`]: synthetic providers for tests and the CLI

pub mod chat;
pub mod command;
pub mod dummy;
pub mod negotiator;
pub mod payload;
pub mod peer;
pub mod signaling;

pub use chat::{ChatCodec, ChatLine};
pub use negotiator::{CallCommand, CallRole, Negotiator, NegotiatorEvent, NegotiatorState};
pub use payload::{AuxMessage, SignalPayload};
pub use signaling::{SignalingClient, SignalingHandle};
