//! The length-prefixed binary protocol between the controller and sandbox children.
//!
//! The controller side is [`IpcClient`], the sandbox side is [`IpcServer`]. A channel carries
//! one request at a time: the client never writes a second request before it has read the
//! response to the first.

mod client;
pub use client::*;

mod codec;
pub use codec::*;

mod error;
pub use error::*;

mod message;
pub use message::*;

mod server;
pub use server::*;
