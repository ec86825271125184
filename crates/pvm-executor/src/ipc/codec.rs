//! Little-endian binary encoding and stream framing.
//!
//! Every frame is a 4-byte little-endian length followed by exactly that many body bytes. The
//! body is `type u8 ‖ request_id u32 ‖ has_payload u8 ‖ payload`.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    constants::{
        ipc::{FRAME_HEADER_SIZE, LENGTH_PREFIX_SIZE, MAX_MESSAGE_SIZE},
        vm::REGISTER_COUNT,
    },
    ipc::{IpcError, IpcMessage, MessageType},
    Registers,
};

/// Errors raised while decoding a frame body or payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Fewer bytes remain than the field needs.
    #[error("unexpected end of data: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEnd {
        /// Bytes the field needs.
        needed: usize,
        /// Bytes left in the buffer.
        remaining: usize,
    },
    /// An option flag was neither 0 nor 1.
    #[error("invalid presence flag {0}")]
    InvalidFlag(u8),
    /// A string field is not valid UTF-8.
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
    /// The message type byte is unknown.
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
    /// An enum field holds an unknown discriminant.
    #[error("unknown {field} value {value}")]
    UnknownVariant {
        /// The field being decoded.
        field: &'static str,
        /// The raw value.
        value: u8,
    },
    /// Bytes follow the last field.
    #[error("{0} trailing bytes")]
    TrailingBytes(usize),
}

/// Appends little-endian fields to a buffer.
#[derive(Debug, Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes one byte.
    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    /// Writes a `u32`.
    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Writes a `u64`.
    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Writes a `u32` length followed by the bytes.
    pub fn put_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.put_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Writes a presence flag and, when present, the bytes.
    pub fn put_opt_bytes(&mut self, bytes: Option<&[u8]>) -> &mut Self {
        match bytes {
            Some(bytes) => self.put_u8(1).put_bytes(bytes),
            None => self.put_u8(0),
        }
    }

    /// Writes a UTF-8 string as bytes.
    pub fn put_str(&mut self, value: &str) -> &mut Self {
        self.put_bytes(value.as_bytes())
    }

    /// Writes an optional string.
    pub fn put_opt_str(&mut self, value: Option<&str>) -> &mut Self {
        self.put_opt_bytes(value.map(str::as_bytes))
    }

    /// Writes every register as a `u64`.
    pub fn put_registers(&mut self, registers: &Registers) -> &mut Self {
        for value in registers {
            self.put_u64(*value);
        }
        self
    }

    /// Returns the encoded bytes.
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Reads little-endian fields from a buffer.
#[derive(Debug)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
}

impl<'a> ByteReader<'a> {
    /// Reads from `buf`.
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() < needed {
            return Err(DecodeError::UnexpectedEnd { needed, remaining: self.buf.len() });
        }
        let (head, tail) = self.buf.split_at(needed);
        self.buf = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Reads one byte.
    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    /// Reads a `u32`.
    pub fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    /// Reads a `u64`.
    pub fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    /// Reads a presence flag.
    pub fn flag(&mut self) -> Result<bool, DecodeError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DecodeError::InvalidFlag(other)),
        }
    }

    /// Reads a length-prefixed byte string.
    pub fn bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// Reads an optional byte string.
    pub fn opt_bytes(&mut self) -> Result<Option<Vec<u8>>, DecodeError> {
        if self.flag()? {
            self.bytes().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn string(&mut self) -> Result<String, DecodeError> {
        String::from_utf8(self.bytes()?).map_err(|_| DecodeError::InvalidUtf8)
    }

    /// Reads an optional string.
    pub fn opt_string(&mut self) -> Result<Option<String>, DecodeError> {
        if self.flag()? {
            self.string().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Reads a full register file.
    pub fn registers(&mut self) -> Result<Registers, DecodeError> {
        let mut registers = [0; REGISTER_COUNT];
        for value in &mut registers {
            *value = self.u64()?;
        }
        Ok(registers)
    }

    /// Consumes everything that is left.
    pub fn rest(&mut self) -> &'a [u8] {
        core::mem::take(&mut self.buf)
    }

    /// Fails if any bytes are left.
    pub const fn finish(self) -> Result<(), DecodeError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(DecodeError::TrailingBytes(self.buf.len()))
        }
    }
}

/// Encodes `message` into a complete frame, length prefix included.
pub fn encode_frame(message: &IpcMessage) -> Vec<u8> {
    let payload = message.payload.as_deref().unwrap_or_default();
    let body_len = FRAME_HEADER_SIZE + payload.len();
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + body_len);
    frame.extend_from_slice(&(body_len as u32).to_le_bytes());
    frame.push(message.message_type as u8);
    frame.extend_from_slice(&message.request_id.to_le_bytes());
    frame.push(u8::from(message.payload.is_some()));
    frame.extend_from_slice(payload);
    frame
}

/// Decodes a frame body, i.e. everything after the length prefix.
pub fn decode_body(body: &[u8]) -> Result<IpcMessage, DecodeError> {
    let mut reader = ByteReader::new(body);
    let raw_type = reader.u8()?;
    let message_type =
        MessageType::try_from(raw_type).map_err(|_| DecodeError::UnknownMessageType(raw_type))?;
    let request_id = reader.u32()?;
    let payload = if reader.flag()? { Some(reader.rest().to_vec()) } else { None };
    reader.finish()?;
    Ok(IpcMessage { message_type, request_id, payload })
}

/// Validates a declared frame length.
pub fn check_frame_length(length: u32) -> Result<usize, IpcError> {
    if length >= MAX_MESSAGE_SIZE || (length as usize) < FRAME_HEADER_SIZE {
        Err(IpcError::MalformedFrame { length })
    } else {
        Ok(length as usize)
    }
}

/// Decodes the first frame in `buf`.
///
/// # Returns
///
/// `Ok(None)` if `buf` does not hold a complete frame yet, otherwise the message and the number
/// of bytes it occupied.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(IpcMessage, usize)>, IpcError> {
    let Some(prefix) = buf.first_chunk::<LENGTH_PREFIX_SIZE>() else {
        return Ok(None);
    };
    let length = check_frame_length(u32::from_le_bytes(*prefix))?;
    let Some(body) = buf.get(LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + length) else {
        return Ok(None);
    };
    Ok(Some((decode_body(body)?, LENGTH_PREFIX_SIZE + length)))
}

/// Reads one frame from `reader`.
///
/// # Returns
///
/// `Ok(None)` if the stream ended cleanly before the first byte of a frame. A stream that ends
/// inside a frame is [`IpcError::UnexpectedEof`].
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<IpcMessage>, IpcError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    let mut filled = 0;
    while filled < LENGTH_PREFIX_SIZE {
        let read = reader.read(&mut prefix[filled..]).await.map_err(IpcError::Read)?;
        if read == 0 {
            return if filled == 0 { Ok(None) } else { Err(IpcError::UnexpectedEof) };
        }
        filled += read;
    }

    let length = check_frame_length(u32::from_le_bytes(prefix))?;
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await.map_err(|err| match err.kind() {
        std::io::ErrorKind::UnexpectedEof => IpcError::UnexpectedEof,
        _ => IpcError::Read(err),
    })?;
    Ok(Some(decode_body(&body)?))
}

/// Writes `message` as one frame and flushes it.
pub async fn write_frame<W>(writer: &mut W, message: &IpcMessage) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(message);
    writer.write_all(&frame).await.map_err(IpcError::Write)?;
    writer.flush().await.map_err(IpcError::Write)
}
