//! Chat sealing and echo detection.

use hush_common::{unix_millis, ClientMessage, Result};
use hush_crypto::SymmetricChannel;

/// A decrypted chat line ready for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatLine {
    pub sender: String,
    pub text: String,
    pub timestamp: i64,
    /// Sent by this client.
    pub own: bool,
}

pub struct ChatCodec {
    channel: SymmetricChannel,
    member_id: Option<String>,
}

impl ChatCodec {
    pub fn new(channel: SymmetricChannel) -> Self {
        Self {
            channel,
            member_id: None,
        }
    }

    /// Remember the handle the relay assigned to this connection.
    pub fn set_member_id(&mut self, member_id: impl Into<String>) {
        self.member_id = Some(member_id.into());
    }

    pub fn member_id(&self) -> Option<&str> {
        self.member_id.as_deref()
    }

    pub fn is_own(&self, sender: &str) -> bool {
        self.member_id.as_deref() == Some(sender)
    }

    pub fn encode(&self, text: &str) -> Result<ClientMessage> {
        Ok(ClientMessage::ChatMessage {
            content: self.channel.encrypt(text)?,
            sender: None,
            timestamp: Some(unix_millis()),
        })
    }

    pub fn decode(&self, content: &str, sender: &str, timestamp: i64) -> Result<ChatLine> {
        let text: String = self.channel.decrypt(content)?;
        Ok(ChatLine {
            sender: sender.to_string(),
            text,
            timestamp,
            own: self.is_own(sender),
        })
    }
}
