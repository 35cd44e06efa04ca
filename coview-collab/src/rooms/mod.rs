mod client;
mod join_sync;
mod membership;
mod permissions;
mod session;
mod synchronizer;

#[cfg(test)]
pub(crate) mod testing;

pub(crate) use client::RoomClient;
pub use client::{ClientError, RoomCommand, RoomHandle, SessionEnd};
pub use join_sync::*;
pub use membership::*;
pub use permissions::*;
pub use session::*;
pub use synchronizer::*;
