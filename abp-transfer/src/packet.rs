//! Wire-format definitions for protocol messages.
//!
//! Every datagram exchanged between a sender and the server is a single
//! [`Message`].  This module is responsible for:
//! - Defining the on-wire text layout (kind, sequence bit, fields).
//! - Serialising a [`Message`] into a byte buffer ready for transmission.
//! - Deserialising a raw byte slice back into a [`Message`], returning errors
//!   for malformed or truncated input.
//!
//! No I/O happens here; this is pure data transformation.
//!
//! # Wire format
//!
//! Fields are separated by `|`.  The first field selects the message kind, the
//! second is always the alternating sequence bit (`0` or `1`).
//!
//! | Kind  | Layout                              | Direction        |
//! |-------|-------------------------------------|------------------|
//! | Start | `s|<bit>|<filename>|<filesize>`     | sender → server  |
//! | Data  | `d|<bit>|<payload>`                 | sender → server  |
//! | Ack   | `a|<bit>`                           | server → sender  |
//! | Nack  | `n|<bit>`                           | server → sender  |
//!
//! Header fields are UTF-8 text.  The Data payload is everything after the
//! second separator and is carried as raw bytes, so it may itself contain `|`.

use std::fmt;

use thiserror::Error;

/// Maximum number of payload bytes carried by one Data message.
pub const MAX_SEGMENT_SIZE: usize = 20_476;

/// Bytes a Data message spends on framing: `d|<bit>|`.
pub const DATA_OVERHEAD: usize = 4;

/// Largest datagram either side needs to receive with the default segment size.
pub const MAX_DATAGRAM: usize = MAX_SEGMENT_SIZE + DATA_OVERHEAD;

const SEPARATOR: u8 = b'|';

// ---------------------------------------------------------------------------
// Bit
// ---------------------------------------------------------------------------

/// The one-bit sequence identifier of the alternating-bit protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bit {
    Zero,
    One,
}

impl Bit {
    /// `(bit + 1) mod 2`.
    pub fn toggled(self) -> Self {
        match self {
            Bit::Zero => Bit::One,
            Bit::One => Bit::Zero,
        }
    }

    fn as_byte(self) -> u8 {
        match self {
            Bit::Zero => b'0',
            Bit::One => b'1',
        }
    }

    fn parse(field: &[u8]) -> Result<Self, PacketError> {
        match field {
            b"0" => Ok(Bit::Zero),
            b"1" => Ok(Bit::One),
            other => Err(PacketError::InvalidBit(lossy(other))),
        }
    }
}

impl From<bool> for Bit {
    fn from(value: bool) -> Self {
        if value {
            Bit::One
        } else {
            Bit::Zero
        }
    }
}

impl fmt::Display for Bit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_byte() as char)
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Discriminant of a [`Message`], as carried in the leading field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Start,
    Data,
    Ack,
    Nack,
}

impl Kind {
    fn tag(self) -> u8 {
        match self {
            Kind::Start => b's',
            Kind::Data => b'd',
            Kind::Ack => b'a',
            Kind::Nack => b'n',
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag() as char)
    }
}

/// A complete protocol datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Opens an upload session for `filename`, declaring its total length.
    Start {
        bit: Bit,
        filename: String,
        file_size: u64,
    },
    /// Carries one segment of file content.
    Data { bit: Bit, payload: Vec<u8> },
    /// Positive acknowledgment; `bit` is the toggle of the acknowledged bit.
    Ack { bit: Bit },
    /// Rejection; `bit` is the toggle of the rejected bit.
    Nack { bit: Bit },
}

impl Message {
    pub fn kind(&self) -> Kind {
        match self {
            Message::Start { .. } => Kind::Start,
            Message::Data { .. } => Kind::Data,
            Message::Ack { .. } => Kind::Ack,
            Message::Nack { .. } => Kind::Nack,
        }
    }

    pub fn bit(&self) -> Bit {
        match self {
            Message::Start { bit, .. }
            | Message::Data { bit, .. }
            | Message::Ack { bit }
            | Message::Nack { bit } => *bit,
        }
    }

    /// Serialise this message into a newly allocated byte vector.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![self.kind().tag(), SEPARATOR, self.bit().as_byte()];
        match self {
            Message::Start {
                filename,
                file_size,
                ..
            } => {
                buf.push(SEPARATOR);
                buf.extend_from_slice(filename.as_bytes());
                buf.push(SEPARATOR);
                buf.extend_from_slice(file_size.to_string().as_bytes());
            }
            Message::Data { payload, .. } => {
                buf.push(SEPARATOR);
                buf.extend_from_slice(payload);
            }
            Message::Ack { .. } | Message::Nack { .. } => {}
        }
        buf
    }

    /// Parse a [`Message`] from a raw datagram.
    ///
    /// Returns [`Err`] if:
    /// - `buf` is empty,
    /// - the leading field is not one of `s`, `d`, `a`, `n`,
    /// - a required field is missing or not UTF-8,
    /// - the bit is anything other than `0` or `1`, or
    /// - the declared file size of a Start message is not a non-negative integer.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.is_empty() {
            return Err(PacketError::Empty);
        }

        let kind_end = buf
            .iter()
            .position(|&b| b == SEPARATOR)
            .unwrap_or(buf.len());
        let kind = match &buf[..kind_end] {
            b"s" => Kind::Start,
            b"d" => Kind::Data,
            b"a" => Kind::Ack,
            b"n" => Kind::Nack,
            other => return Err(PacketError::UnknownKind(lossy(other))),
        };

        match kind {
            Kind::Start => {
                let mut fields = buf.splitn(4, |&b| b == SEPARATOR).skip(1);
                let bit = Bit::parse(fields.next().ok_or(PacketError::MissingField("bit"))?)?;
                let filename = fields
                    .next()
                    .ok_or(PacketError::MissingField("filename"))?;
                let filename = std::str::from_utf8(filename)
                    .map_err(|_| PacketError::NotUtf8("filename"))?
                    .to_owned();
                let size = fields
                    .next()
                    .ok_or(PacketError::MissingField("filesize"))?;
                let size = std::str::from_utf8(size)
                    .map_err(|_| PacketError::NotUtf8("filesize"))?;
                let file_size = size
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| PacketError::InvalidFileSize(size.to_owned()))?;
                Ok(Message::Start {
                    bit,
                    filename,
                    file_size,
                })
            }
            Kind::Data => {
                let mut fields = buf.splitn(3, |&b| b == SEPARATOR).skip(1);
                let bit = Bit::parse(fields.next().ok_or(PacketError::MissingField("bit"))?)?;
                let payload = fields
                    .next()
                    .ok_or(PacketError::MissingField("payload"))?
                    .to_vec();
                Ok(Message::Data { bit, payload })
            }
            Kind::Ack | Kind::Nack => {
                let field = buf
                    .splitn(2, |&b| b == SEPARATOR)
                    .nth(1)
                    .ok_or(PacketError::MissingField("bit"))?;
                let bit = Bit::parse(field)?;
                Ok(if kind == Kind::Ack {
                    Message::Ack { bit }
                } else {
                    Message::Nack { bit }
                })
            }
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Start {
                bit,
                filename,
                file_size,
            } => write!(f, "s|{bit}|{filename}|{file_size}"),
            Message::Data { bit, payload } => write!(f, "d|{bit}|<{} bytes>", payload.len()),
            Message::Ack { bit } => write!(f, "a|{bit}"),
            Message::Nack { bit } => write!(f, "n|{bit}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can arise when parsing a raw datagram.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("empty datagram")]
    Empty,
    #[error("unrecognized message type {0:?}")]
    UnknownKind(String),
    #[error("missing {0} field")]
    MissingField(&'static str),
    #[error("{0} field is not valid UTF-8")]
    NotUtf8(&'static str),
    #[error("sequence bit must be 0 or 1, got {0:?}")]
    InvalidBit(String),
    #[error("invalid file size {0:?}")]
    InvalidFileSize(String),
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
