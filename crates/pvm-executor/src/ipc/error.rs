use std::{io, time::Duration};

use crate::ipc::{DecodeError, MessageType};

/// Errors raised on the sandbox channel.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// The child answered with an error frame or an error response.
    #[error("sandbox reported an error: {0}")]
    ChildError(String),
    /// A frame or payload could not be decoded.
    #[error("failed to decode message: {0}")]
    Decode(#[from] DecodeError),
    /// The stream ended before a complete frame was read.
    #[error("unexpected end of stream")]
    UnexpectedEof,
    /// The channel could not be set up for asynchronous use.
    #[error("failed to adopt channel: {0}")]
    Channel(#[source] io::Error),
    /// Reading from the channel failed.
    #[error("failed to read from channel: {0}")]
    Read(#[source] io::Error),
    /// Writing to the channel failed.
    #[error("failed to write to channel: {0}")]
    Write(#[source] io::Error),
    /// The declared frame length is out of range.
    #[error("malformed frame: declared length {length}")]
    MalformedFrame {
        /// The declared length.
        length: u32,
    },
    /// A message arrived that is not valid at this point of the protocol.
    #[error("unexpected message type {0:?}")]
    UnexpectedMessage(MessageType),
    /// A message arrived without the payload its type requires.
    #[error("{0:?} message is missing its payload")]
    MissingPayload(MessageType),
    /// A bounded wait on the channel expired.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}
