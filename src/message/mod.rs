//! Construction and parsing of USB PD messages.
//!
//! Messages carry a little-endian 16-bit header and up to seven 32-bit
//! little-endian data objects. Host representations are normalized at this
//! boundary; nothing outside this module touches wire bytes.

pub mod header;
pub mod pdo;
pub mod request;

use byteorder::{ByteOrder, LittleEndian};
use header::{DataMessageType, Header, MessageType};
use pdo::{Capabilities, PDO_MAX_OBJECTS};
use request::RawRequest;

/// Maximum size of a message in bytes: header plus seven data objects.
pub const MAX_MESSAGE_SIZE: usize = 2 + 4 * PDO_MAX_OBJECTS;

/// Errors that can occur during message parsing.
#[derive(thiserror::Error, Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParseError {
    /// The input buffer does not hold the advertised number of objects.
    #[error("invalid length (expected `{expected}`, found `{found}`)")]
    InvalidLength {
        /// The expected length in bytes.
        expected: usize,
        /// The length found.
        found: usize,
    },
    /// The revision field is reserved or unknown.
    #[error("unsupported specification revision `{0}`")]
    UnsupportedSpecificationRevision(u8),
}

/// Payload of a data message.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Payload {
    /// Source capability advertisement.
    SourceCapabilities(Capabilities),
    /// Sink capability advertisement.
    SinkCapabilities(Capabilities),
    /// A sink's request for power.
    Request(RawRequest),
    /// A data message this engine does not interpret.
    Unknown,
}

/// A USB PD message.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Message {
    /// The message header.
    pub header: Header,
    /// Payload of a data message, absent for control messages.
    pub payload: Option<Payload>,
}

impl Message {
    /// Create a new message from a message header.
    pub fn new(header: Header) -> Self {
        Self {
            header,
            payload: None,
        }
    }

    /// Create a new message from a header and payload.
    pub fn new_with_payload(header: Header, payload: Payload) -> Self {
        Self {
            header,
            payload: Some(payload),
        }
    }

    /// Serialize to wire bytes, returning the number of bytes written.
    ///
    /// The buffer must hold at least [`MAX_MESSAGE_SIZE`] bytes.
    pub fn to_bytes(&self, buffer: &mut [u8]) -> usize {
        let mut size = self.header.to_bytes(buffer);

        match &self.payload {
            None | Some(Payload::Unknown) => (),
            Some(Payload::SourceCapabilities(caps)) | Some(Payload::SinkCapabilities(caps)) => {
                for pdo in caps.pdos() {
                    LittleEndian::write_u32(&mut buffer[size..], pdo.raw());
                    size += 4;
                }
            }
            Some(Payload::Request(rdo)) => {
                LittleEndian::write_u32(&mut buffer[size..], rdo.0);
                size += 4;
            }
        }

        size
    }

    /// Parse a message from wire bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ParseError> {
        let header = Header::from_bytes(data)?;
        let payload_bytes = &data[2..];

        let expected = 4 * header.num_objects();
        if payload_bytes.len() < expected {
            return Err(ParseError::InvalidLength {
                expected: 2 + expected,
                found: data.len(),
            });
        }

        let payload = match header.message_type() {
            MessageType::Control(_) => None,
            MessageType::Data(DataMessageType::SourceCapabilities) => Some(
                Payload::SourceCapabilities(Self::parse_capabilities(header, payload_bytes)),
            ),
            MessageType::Data(DataMessageType::SinkCapabilities) => Some(
                Payload::SinkCapabilities(Self::parse_capabilities(header, payload_bytes)),
            ),
            MessageType::Data(DataMessageType::Request) => Some(Payload::Request(RawRequest(
                LittleEndian::read_u32(payload_bytes),
            ))),
            MessageType::Data(_) | MessageType::Extended(_) => Some(Payload::Unknown),
        };

        Ok(Self { header, payload })
    }

    fn parse_capabilities(header: Header, payload_bytes: &[u8]) -> Capabilities {
        Capabilities(
            payload_bytes
                .chunks_exact(4)
                .take(header.num_objects().min(PDO_MAX_OBJECTS))
                .map(LittleEndian::read_u32)
                .map(pdo::parse_raw_pdo)
                .collect(),
        )
    }
}
