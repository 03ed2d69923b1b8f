//! Client side of the group chat relay: joins a hub, mirrors who is online
//! and hands everything it hears to a [`PresentationSurface`].

pub mod connector;
pub mod error;
pub mod surface;
pub mod users;

pub use connector::{connect, ChatConnection, ClientConfig};
pub use error::ClientError;
pub use surface::{present, ChannelSurface, JsonLinesSurface, PresentationSurface, TerminalSurface};
pub use users::UserSet;
