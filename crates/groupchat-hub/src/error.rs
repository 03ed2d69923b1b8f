use groupchat_core::FrameError;
use std::{io, net::SocketAddr};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("listener failed: {0}")]
    Listener(#[source] io::Error),
}

/// Why a connection never got past its first line. Fatal to that
/// connection only.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("connection closed before join request")]
    Closed,
    #[error("no join request within {0:?}")]
    Timeout(std::time::Duration),
    #[error("server shutting down")]
    Shutdown,
    #[error("read failed: {0}")]
    Io(#[from] io::Error),
    #[error("malformed join request: {0}")]
    Malformed(#[from] FrameError),
    #[error("expected join request, got {0}")]
    UnexpectedFrame(&'static str),
}

impl HandshakeError {
    pub fn code(&self) -> &'static str {
        match self {
            HandshakeError::Closed => "closed",
            HandshakeError::Timeout(_) => "timeout",
            HandshakeError::Shutdown => "shutdown",
            HandshakeError::Io(_) => "io",
            HandshakeError::Malformed(_) => "malformed",
            HandshakeError::UnexpectedFrame(_) => "unexpected_frame",
        }
    }
}
