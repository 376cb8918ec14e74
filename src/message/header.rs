//! The 16-bit USB PD message header.
use core::convert::TryFrom;

use byteorder::{ByteOrder, LittleEndian};
use proc_bitfield::bitfield;

use crate::message::ParseError;
use crate::{DataRole, PowerRole};

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    /// Message header. Every message starts with it; endianness on the wire
    /// is little-endian and normalized here.
    pub struct Header(pub u16): Debug, FromStorage, IntoStorage {
        /// Zero for control and data messages, one for extended messages.
        pub extended: bool @ 15,
        /// The number of 32 bit data objects that follow the header.
        pub num_objects: u8 [get usize] @ 12..=14,
        /// A rolling counter, maintained by the originator of the message.
        pub message_id: u8 @ 9..=11,
        /// The port's present power role (0 -> sink, 1 -> source).
        pub port_power_role: bool [get PowerRole, set PowerRole] @ 8,
        /// The specification revision.
        pub spec_revision: u8 [try_get SpecificationRevision, set SpecificationRevision] @ 6..=7,
        /// The port's data role (0 -> UFP, 1 -> DFP).
        pub port_data_role: bool [get DataRole, set DataRole] @ 5,
        /// The type of message being sent.
        pub message_type_raw: u8 @ 0..=4,
    }
}

impl Header {
    /// Create a new control message header.
    pub fn new_control(
        data_role: DataRole,
        power_role: PowerRole,
        revision: SpecificationRevision,
        message_id: u8,
        message_type: ControlMessageType,
    ) -> Self {
        Self(0)
            .with_port_data_role(data_role)
            .with_port_power_role(power_role)
            .with_spec_revision(revision)
            .with_message_id(message_id)
            .with_message_type_raw(message_type as u8)
    }

    /// Create a new data message header.
    pub fn new_data(
        data_role: DataRole,
        power_role: PowerRole,
        revision: SpecificationRevision,
        message_id: u8,
        message_type: DataMessageType,
        num_objects: u8,
    ) -> Self {
        Self(0)
            .with_port_data_role(data_role)
            .with_port_power_role(power_role)
            .with_spec_revision(revision)
            .with_message_id(message_id)
            .with_message_type_raw(message_type as u8)
            .with_num_objects(num_objects)
    }

    /// Parse a header from its binary representation.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, ParseError> {
        if buf.len() < 2 {
            return Err(ParseError::InvalidLength {
                expected: 2,
                found: buf.len(),
            });
        }

        let header = Header(LittleEndian::read_u16(buf));
        // Validate the revision field; 0b11 is reserved.
        header.spec_revision()?;
        Ok(header)
    }

    /// Serialize the header to its binary representation.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u16(buf, self.0);
        2
    }

    /// Extract the message type that the header encodes.
    pub fn message_type(&self) -> MessageType {
        if self.extended() {
            MessageType::Extended(self.message_type_raw())
        } else if self.num_objects() == 0 {
            MessageType::Control(self.message_type_raw().into())
        } else {
            MessageType::Data(self.message_type_raw().into())
        }
    }
}

/// Specification revisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(non_camel_case_types)]
pub enum SpecificationRevision {
    /// Revision 1.0 (deprecated; never negotiated).
    R1_0,
    /// Revision 2.0.
    R2_0,
    /// Revision 3.0.
    R3_0,
}

/// The highest revision this engine negotiates.
pub const PD_MAX_REV: SpecificationRevision = SpecificationRevision::R3_0;

impl SpecificationRevision {
    /// The next-lower revision, saturating at 2.0.
    pub fn lower(self) -> Self {
        match self {
            Self::R3_0 => Self::R2_0,
            rev => rev,
        }
    }

    /// Printable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::R1_0 => "rev1",
            Self::R2_0 => "rev2",
            Self::R3_0 => "rev3",
        }
    }
}

impl TryFrom<u8> for SpecificationRevision {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0b00 => Ok(Self::R1_0),
            0b01 => Ok(Self::R2_0),
            0b10 => Ok(Self::R3_0),
            _ => Err(ParseError::UnsupportedSpecificationRevision(value)),
        }
    }
}

impl From<SpecificationRevision> for u8 {
    fn from(value: SpecificationRevision) -> Self {
        match value {
            SpecificationRevision::R1_0 => 0b00,
            SpecificationRevision::R2_0 => 0b01,
            SpecificationRevision::R3_0 => 0b10,
        }
    }
}

/// The type of message that a header encodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MessageType {
    /// A control message; carries no data objects.
    Control(ControlMessageType),
    /// A data message.
    Data(DataMessageType),
    /// An extended message (unsupported; carried as the raw type field).
    Extended(u8),
}

/// Types of control messages.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ControlMessageType {
    GoodCrc = 0b0_0001,
    GotoMin = 0b0_0010,
    Accept = 0b0_0011,
    Reject = 0b0_0100,
    Ping = 0b0_0101,
    PsRdy = 0b0_0110,
    GetSourceCap = 0b0_0111,
    GetSinkCap = 0b0_1000,
    DrSwap = 0b0_1001,
    PrSwap = 0b0_1010,
    VconnSwap = 0b0_1011,
    Wait = 0b0_1100,
    SoftReset = 0b0_1101,
    NotSupported = 0b1_0000,
    GetSourceCapExtended = 0b1_0001,
    GetStatus = 0b1_0010,
    FrSwap = 0b1_0011,
    GetPpsStatus = 0b1_0100,
    GetCountryCodes = 0b1_0101,
    Reserved,
}

impl From<u8> for ControlMessageType {
    fn from(value: u8) -> Self {
        match value {
            0b0_0001 => Self::GoodCrc,
            0b0_0010 => Self::GotoMin,
            0b0_0011 => Self::Accept,
            0b0_0100 => Self::Reject,
            0b0_0101 => Self::Ping,
            0b0_0110 => Self::PsRdy,
            0b0_0111 => Self::GetSourceCap,
            0b0_1000 => Self::GetSinkCap,
            0b0_1001 => Self::DrSwap,
            0b0_1010 => Self::PrSwap,
            0b0_1011 => Self::VconnSwap,
            0b0_1100 => Self::Wait,
            0b0_1101 => Self::SoftReset,
            0b1_0000 => Self::NotSupported,
            0b1_0001 => Self::GetSourceCapExtended,
            0b1_0010 => Self::GetStatus,
            0b1_0011 => Self::FrSwap,
            0b1_0100 => Self::GetPpsStatus,
            0b1_0101 => Self::GetCountryCodes,
            _ => Self::Reserved,
        }
    }
}

/// Types of data messages.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataMessageType {
    SourceCapabilities = 0b0_0001,
    Request = 0b0_0010,
    Bist = 0b0_0011,
    SinkCapabilities = 0b0_0100,
    BatteryStatus = 0b0_0101,
    Alert = 0b0_0110,
    GetCountryInfo = 0b0_0111,
    VendorDefined = 0b0_1111,
    Reserved,
}

impl From<u8> for DataMessageType {
    fn from(value: u8) -> Self {
        match value {
            0b0_0001 => Self::SourceCapabilities,
            0b0_0010 => Self::Request,
            0b0_0011 => Self::Bist,
            0b0_0100 => Self::SinkCapabilities,
            0b0_0101 => Self::BatteryStatus,
            0b0_0110 => Self::Alert,
            0b0_0111 => Self::GetCountryInfo,
            0b0_1111 => Self::VendorDefined,
            _ => Self::Reserved,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = Header::new_data(
            DataRole::Ufp,
            PowerRole::Sink,
            SpecificationRevision::R3_0,
            5,
            DataMessageType::Request,
            1,
        );

        let mut buf = [0u8; 2];
        assert_eq!(header.to_bytes(&mut buf), 2);

        let parsed = Header::from_bytes(&buf).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.message_id(), 5);
        assert_eq!(parsed.num_objects(), 1);
        assert_eq!(parsed.port_power_role(), PowerRole::Sink);
        assert_eq!(parsed.port_data_role(), DataRole::Ufp);
        assert_eq!(parsed.spec_revision().unwrap(), SpecificationRevision::R3_0);
        assert_eq!(
            parsed.message_type(),
            MessageType::Data(DataMessageType::Request)
        );
    }

    #[test]
    fn reserved_revision_is_rejected() {
        // Control header with revision bits 0b11.
        let raw: u16 = 0b11 << 6 | 0b0_0011;
        let buf = raw.to_le_bytes();

        assert!(matches!(
            Header::from_bytes(&buf),
            Err(ParseError::UnsupportedSpecificationRevision(0b11))
        ));
    }

    #[test]
    fn control_and_data_discrimination() {
        let accept = Header::new_control(
            DataRole::Dfp,
            PowerRole::Source,
            SpecificationRevision::R2_0,
            0,
            ControlMessageType::Accept,
        );
        assert_eq!(
            accept.message_type(),
            MessageType::Control(ControlMessageType::Accept)
        );

        // The same type value with a non-zero object count reads as data.
        let caps = accept
            .with_message_type_raw(DataMessageType::SourceCapabilities as u8)
            .with_num_objects(2);
        assert_eq!(
            caps.message_type(),
            MessageType::Data(DataMessageType::SourceCapabilities)
        );
    }
}
