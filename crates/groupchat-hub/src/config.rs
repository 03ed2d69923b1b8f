use groupchat_core::DEFAULT_MAX_FRAME_BYTES;
use std::{net::SocketAddr, time::Duration};

pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Upper bound on a single socket write before the recipient is dropped.
    pub write_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Per-session outbound buffer, in frames.
    pub queue_capacity: usize,
    pub shutdown_grace: Duration,
    pub max_frame_bytes: usize,
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}
