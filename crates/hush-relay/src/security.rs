use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Per-connection fixed-window message counter.
#[derive(Debug)]
pub struct MessageWindow {
    max_messages: u32,
    window: Duration,
    window_start: Instant,
    count: u32,
}

impl MessageWindow {
    pub fn new(max_messages: u32, window: Duration) -> Self {
        Self {
            max_messages,
            window,
            window_start: Instant::now(),
            count: 0,
        }
    }

    pub fn per_minute(max_messages: u32) -> Self {
        Self::new(max_messages, Duration::from_secs(60))
    }

    /// Count one message; `false` once the window's budget is spent.
    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    fn allow_at(&mut self, now: Instant) -> bool {
        if now.duration_since(self.window_start) >= self.window {
            self.window_start = now;
            self.count = 0;
        }
        self.count = self.count.saturating_add(1);
        self.count <= self.max_messages
    }
}

pub fn check_public_bind_allowed(addr: SocketAddr, allow_public: bool) -> anyhow::Result<()> {
    if addr.ip().is_loopback() || allow_public {
        return Ok(());
    }
    Err(anyhow::anyhow!(
        "refusing non-loopback bind {addr} without HUSH_ALLOW_PUBLIC_BIND=1"
    ))
}
