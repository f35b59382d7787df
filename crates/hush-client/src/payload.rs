//! Plaintexts sealed inside relay payloads.
//!
//! The relay only ever sees these as ciphertext strings. They share the wire conventions of
//! the relay protocol: `type` tag in snake_case, camelCase fields.

use hush_common::CallType;
use serde::{Deserialize, Serialize};

/// Negotiation messages carried by `encrypted_signaling`.
///
/// Offers go to the whole room. Answers and candidates name the member they are meant for in
/// `to`; other members drop them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalPayload {
    #[serde(rename_all = "camelCase")]
    Offer { sdp: String, call_type: CallType },

    Answer {
        sdp: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    IceCandidate {
        candidate: String,
        #[serde(default)]
        sdp_mid: Option<String>,
        #[serde(default)]
        sdp_m_line_index: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
    },
}

impl SignalPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalPayload::Offer { .. } => "offer",
            SignalPayload::Answer { .. } => "answer",
            SignalPayload::IceCandidate { .. } => "ice_candidate",
        }
    }

    /// Member this payload is addressed to, if any.
    pub fn recipient(&self) -> Option<&str> {
        match self {
            SignalPayload::Offer { .. } => None,
            SignalPayload::Answer { to, .. } | SignalPayload::IceCandidate { to, .. } => {
                to.as_deref()
            }
        }
    }
}

/// Post-connection metadata sent over the auxiliary data channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuxMessage {
    ConnectionEstablished,
    Mute { muted: bool },
    Camera { enabled: bool },
    ScreenShare { active: bool },
    #[serde(rename_all = "camelCase")]
    Quality { rtt_ms: u32, packet_loss_pct: f32 },
}
