use std::net::SocketAddr;

use clap::Parser;

pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;
pub const DEFAULT_MESSAGES_PER_MINUTE: u32 = 600;
pub const DEFAULT_OUTBOX_CAPACITY: usize = 128;
pub const DEFAULT_HUB_QUEUE_CAPACITY: usize = 1024;

#[derive(Parser, Debug, Clone)]
#[command(name = "hush-relay")]
#[command(about = "Hush room relay - forwards end-to-end encrypted chat and call signaling")]
pub struct RelayConfig {
    /// WebSocket listen address
    #[arg(long, env = "HUSH_RELAY_LISTEN", default_value = "127.0.0.1:8080")]
    pub listen: SocketAddr,

    /// Allow binding a non-loopback address
    #[arg(long, env = "HUSH_ALLOW_PUBLIC_BIND", default_value_t = false)]
    pub allow_public_bind: bool,

    /// Largest accepted text frame in bytes
    #[arg(long, env = "HUSH_MAX_MESSAGE_BYTES", default_value_t = DEFAULT_MAX_MESSAGE_BYTES)]
    pub max_message_bytes: usize,

    /// Messages a single connection may send per minute
    #[arg(long, env = "HUSH_RATE_LIMIT_PER_MINUTE", default_value_t = DEFAULT_MESSAGES_PER_MINUTE)]
    pub rate_limit_per_minute: u32,

    /// Queued outbound frames per connection before fan-out skips it
    #[arg(long, env = "HUSH_OUTBOX_CAPACITY", default_value_t = DEFAULT_OUTBOX_CAPACITY)]
    pub outbox_capacity: usize,

    /// Pending events in the hub queue
    #[arg(long, env = "HUSH_HUB_QUEUE_CAPACITY", default_value_t = DEFAULT_HUB_QUEUE_CAPACITY)]
    pub hub_queue_capacity: usize,

    /// Log level
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl RelayConfig {
    pub fn limits(&self) -> TransportLimits {
        TransportLimits {
            max_message_bytes: self.max_message_bytes,
            messages_per_minute: self.rate_limit_per_minute,
            outbox_capacity: self.outbox_capacity,
        }
    }
}

/// Per-connection limits enforced by the WebSocket transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportLimits {
    pub max_message_bytes: usize,
    pub messages_per_minute: u32,
    pub outbox_capacity: usize,
}

impl Default for TransportLimits {
    fn default() -> Self {
        Self {
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            messages_per_minute: DEFAULT_MESSAGES_PER_MINUTE,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
        }
    }
}
