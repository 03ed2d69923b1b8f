//! Group chat relay server.
//!
//! One task per connection reads chat lines and feeds a single dispatch loop,
//! which fans every message out to all other joined sessions.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod registry;
pub mod server;
mod session;

pub use config::ServerConfig;
pub use dispatch::{DispatchHandle, Dispatcher, OutgoingMessage};
pub use error::{HandshakeError, HubError};
pub use registry::{Admission, SessionHandle, SessionId, SessionRegistry};
pub use server::{run, ChatServer};
