//! The 8 byte payload of a control SETUP stage.
use std::convert::{TryFrom, TryInto};

pub const GET_STATUS: u8 = 0;
pub const CLEAR_FEATURE: u8 = 1;
pub const SET_FEATURE: u8 = 3;
pub const SET_ADDRESS: u8 = 5;
pub const GET_DESCRIPTOR: u8 = 6;
pub const GET_CONFIGURATION: u8 = 8;
pub const SET_CONFIGURATION: u8 = 9;

pub const DEVICE_DESCRIPTOR: u8 = 1;
pub const CONFIGURATION_DESCRIPTOR: u8 = 2;
pub const STRING_DESCRIPTOR: u8 = 3;

#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
    Reserved(u8),
}

#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub enum RequestType {
    Standard,
    Class,
    Vendor,
    Reserved,
}

/// Direction of the data stage.
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub enum Direction {
    In,
    Out,
}

#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub fn new(
        direction: Direction,
        request_type: RequestType,
        recipient: Recipient,
        request: u8,
    ) -> Self {
        let mut packed = match direction {
            Direction::In => 0x80,
            Direction::Out => 0x00,
        };
        packed |= match request_type {
            RequestType::Standard => 0,
            RequestType::Class => 1,
            RequestType::Vendor => 2,
            RequestType::Reserved => 3,
        } << 5;
        packed |= match recipient {
            Recipient::Device => 0,
            Recipient::Interface => 1,
            Recipient::Endpoint => 2,
            Recipient::Other => 3,
            Recipient::Reserved(n) => n & 0x1F,
        };
        Self {
            request_type: packed,
            request,
            value: 0,
            index: 0,
            length: 0,
        }
    }

    pub fn with_value(mut self, value: u16) -> Self {
        self.value = value;
        self
    }

    pub fn with_index(mut self, index: u16) -> Self {
        self.index = index;
        self
    }

    pub fn with_length(mut self, length: u16) -> Self {
        self.length = length;
        self
    }

    pub fn get_descriptor(descriptor: u8, index: u8, length: u16) -> Self {
        Self::new(
            Direction::In,
            RequestType::Standard,
            Recipient::Device,
            GET_DESCRIPTOR,
        )
        .with_value(u16::from(descriptor) << 8 | u16::from(index))
        .with_length(length)
    }

    pub fn set_address(address: u8) -> Self {
        Self::new(
            Direction::Out,
            RequestType::Standard,
            Recipient::Device,
            SET_ADDRESS,
        )
        .with_value(u16::from(address & 0x7F))
    }

    pub fn set_configuration(configuration: u8) -> Self {
        Self::new(
            Direction::Out,
            RequestType::Standard,
            Recipient::Device,
            SET_CONFIGURATION,
        )
        .with_value(configuration.into())
    }

    pub fn set_feature(recipient: Recipient, feature: u16, index: u16) -> Self {
        Self::new(Direction::Out, RequestType::Standard, recipient, SET_FEATURE)
            .with_value(feature)
            .with_index(index)
    }

    pub fn direction(&self) -> Direction {
        if (self.request_type & 0x80) == 0x80 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn kind(&self) -> RequestType {
        match (self.request_type >> 5) & 0b11 {
            0 => RequestType::Standard,
            1 => RequestType::Class,
            2 => RequestType::Vendor,
            _ => RequestType::Reserved,
        }
    }

    pub fn recipient(&self) -> Recipient {
        match self.request_type & 0x1F {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            3 => Recipient::Other,
            b => Recipient::Reserved(b),
        }
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let [value_lo, value_hi] = self.value.to_le_bytes();
        let [index_lo, index_hi] = self.index.to_le_bytes();
        let [length_lo, length_hi] = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value_lo,
            value_hi,
            index_lo,
            index_hi,
            length_lo,
            length_hi,
        ]
    }
}

impl TryFrom<&[u8]> for SetupPacket {
    type Error = anyhow::Error;
    fn try_from(from: &[u8]) -> anyhow::Result<SetupPacket> {
        anyhow::ensure!(from.len() == 8, "Invalid Setup packet length.");
        Ok(Self {
            request_type: from[0],
            request: from[1],
            value: u16::from_le_bytes(from[2..4].try_into()?),
            index: u16::from_le_bytes(from[4..6].try_into()?),
            length: u16::from_le_bytes(from[6..8].try_into()?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_descriptor_layout() {
        let setup = SetupPacket::get_descriptor(STRING_DESCRIPTOR, 3, 0x0209);
        assert_eq!(
            setup.to_bytes(),
            [0x80, 0x06, 0x03, 0x03, 0x00, 0x00, 0x09, 0x02]
        );
        assert_eq!(setup.direction(), Direction::In);
        assert_eq!(setup.kind(), RequestType::Standard);
        assert_eq!(setup.recipient(), Recipient::Device);
    }

    #[test]
    fn parses_what_it_builds() {
        let setup = SetupPacket::set_feature(Recipient::Endpoint, 0, 0x81);
        let bytes = setup.to_bytes();
        assert_eq!(bytes, [0x02, 0x03, 0x00, 0x00, 0x81, 0x00, 0x00, 0x00]);
        assert_eq!(SetupPacket::try_from(&bytes[..]).unwrap(), setup);
        assert!(SetupPacket::try_from(&bytes[..7]).is_err());
        assert_eq!(
            SetupPacket::set_address(0x85).to_bytes(),
            [0x00, 0x05, 0x05, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn class_interface_request() {
        let setup = SetupPacket::new(
            Direction::Out,
            RequestType::Class,
            Recipient::Interface,
            0x20,
        )
        .with_length(7);
        assert_eq!(setup.to_bytes()[0], 0x21);
        assert_eq!(setup.kind(), RequestType::Class);
        assert_eq!(setup.recipient(), Recipient::Interface);
        assert_eq!(setup.direction(), Direction::Out);
    }
}
