use groupchat_core::FrameError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("not connected")]
    NotConnected,
    #[error("connection lost: {0}")]
    ConnectionLost(#[source] io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
}
