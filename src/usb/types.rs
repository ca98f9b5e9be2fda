use std::fmt::Debug;

use super::error::DecodeError;

/// Packet identifier, the low nibble of the PID byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pid {
    Out = 0b0001,
    In = 0b1001,
    Sof = 0b0101,
    Setup = 0b1101,

    Data0 = 0b0011,
    Data1 = 0b1011,
    Data2 = 0b0111,
    MData = 0b1111,

    Ack = 0b0010,
    Nak = 0b1010,
    Stall = 0b1110,
    NYet = 0b0110,

    /// Shares its encoding with ERR.
    Pre = 0b1100,
    Split = 0b1000,
    Ping = 0b0100,
    Reserved = 0b0000,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidKind {
    Token,
    Data,
    HandShake,
    Special,
}

impl Pid {
    pub fn from_nibble(nibble: u8) -> Pid {
        match nibble & 0xF {
            0b0001 => Pid::Out,
            0b1001 => Pid::In,
            0b0101 => Pid::Sof,
            0b1101 => Pid::Setup,
            0b0011 => Pid::Data0,
            0b1011 => Pid::Data1,
            0b0111 => Pid::Data2,
            0b1111 => Pid::MData,
            0b0010 => Pid::Ack,
            0b1010 => Pid::Nak,
            0b1110 => Pid::Stall,
            0b0110 => Pid::NYet,
            0b1100 => Pid::Pre,
            0b1000 => Pid::Split,
            0b0100 => Pid::Ping,
            _ => Pid::Reserved,
        }
    }

    /// Validates the check nibble of a PID byte.
    pub fn from_byte(byte: u8) -> Result<Pid, DecodeError> {
        if byte >> 4 != !byte & 0xF {
            return Err(DecodeError::PidCheck(byte));
        }
        Ok(Pid::from_nibble(byte))
    }

    /// PID byte as sent: the identifier followed by its complement.
    pub fn byte(self) -> u8 {
        let v = self as u8;
        v | ((!v & 0xF) << 4)
    }

    pub fn kind(self) -> PidKind {
        match self as u8 & 0b11 {
            0b01 => PidKind::Token,
            0b11 => PidKind::Data,
            0b10 => PidKind::HandShake,
            _ => PidKind::Special,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TokenType {
    Setup,
    Out,
    In,
}

impl TokenType {
    pub fn pid(self) -> Pid {
        match self {
            TokenType::Setup => Pid::Setup,
            TokenType::Out => Pid::Out,
            TokenType::In => Pid::In,
        }
    }
}

/// Token packets. Addresses are 7 bits wide, endpoints 4 and frame numbers 11.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    Transfer {
        token_type: TokenType,
        address: u8,
        endpoint: u8,
    },
    Sof {
        frame: u16,
    },
}

impl Token {
    pub fn new(token_type: TokenType, address: u8, endpoint: u8) -> Self {
        Token::Transfer {
            token_type,
            address,
            endpoint,
        }
    }

    pub fn pid(&self) -> Pid {
        match self {
            Token::Transfer { token_type, .. } => token_type.pid(),
            Token::Sof { .. } => Pid::Sof,
        }
    }

    /// The 11 bits covered by the CRC5.
    pub fn field(&self) -> u16 {
        match *self {
            Token::Transfer {
                address, endpoint, ..
            } => address_field(address, endpoint),
            Token::Sof { frame } => frame & 0x7FF,
        }
    }
}

pub(crate) fn address_field(address: u8, endpoint: u8) -> u16 {
    u16::from(address & 0x7F) | (u16::from(endpoint & 0xF) << 7)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataPID {
    Data0,
    Data1,
    Data2,
    MData,
}

impl DataPID {
    pub fn pid(self) -> Pid {
        match self {
            DataPID::Data0 => Pid::Data0,
            DataPID::Data1 => Pid::Data1,
            DataPID::Data2 => Pid::Data2,
            DataPID::MData => Pid::MData,
        }
    }

    /// Next value of a DATA0/DATA1 toggle sequence.
    pub fn toggled(self) -> Self {
        match self {
            DataPID::Data0 => DataPID::Data1,
            DataPID::Data1 => DataPID::Data0,
            other => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Data {
    pub pid: DataPID,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandShake {
    Ack,
    NAck,
    Stall,
    NYet,
}

impl HandShake {
    pub fn pid(self) -> Pid {
        match self {
            HandShake::Ack => Pid::Ack,
            HandShake::NAck => Pid::Nak,
            HandShake::Stall => Pid::Stall,
            HandShake::NYet => Pid::NYet,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Special {
    Pre,
    Ping { address: u8, endpoint: u8 },
}

impl Special {
    pub fn pid(&self) -> Pid {
        match self {
            Special::Pre => Pid::Pre,
            Special::Ping { .. } => Pid::Ping,
        }
    }
}

/// CRC-5/USB of the `width` low bits of `field`, fed and returned LSB first.
pub fn crc5(field: u16, width: u32) -> u8 {
    let mut acc = 0x1F;
    for i in 0..width {
        let bit = ((field >> i) & 1) as u8;
        let do_xor = (acc ^ bit) & 1 == 1;
        acc >>= 1;
        if do_xor {
            acc ^= 0x14;
        }
    }
    !acc & 0x1F
}

/// CRC-16/USB, sent low byte first.
pub fn crc16(v: &[u8]) -> u16 {
    let mut acc = 0xFFFF;
    for b in v {
        acc ^= u16::from(*b);
        for _ in 0..8 {
            acc = if acc & 1 == 1 {
                (acc >> 1) ^ 0xA001
            } else {
                acc >> 1
            };
        }
    }
    !acc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_bytes_carry_their_complement() {
        assert_eq!(Pid::Setup.byte(), 0x2D);
        assert_eq!(Pid::Out.byte(), 0xE1);
        assert_eq!(Pid::In.byte(), 0x69);
        assert_eq!(Pid::Sof.byte(), 0xA5);
        assert_eq!(Pid::Data0.byte(), 0xC3);
        assert_eq!(Pid::Data1.byte(), 0x4B);
        assert_eq!(Pid::Ack.byte(), 0xD2);
        assert_eq!(Pid::Nak.byte(), 0x5A);
        assert_eq!(Pid::Stall.byte(), 0x1E);
        assert_eq!(Pid::Pre.byte(), 0x3C);

        for nibble in 0..16 {
            let pid = Pid::from_nibble(nibble);
            assert_eq!(Pid::from_byte(pid.byte()), Ok(pid));
            assert_eq!(
                Pid::from_byte(pid.byte() ^ 0x10),
                Err(DecodeError::PidCheck(pid.byte() ^ 0x10))
            );
        }
    }

    #[test]
    fn pid_kinds() {
        assert_eq!(Pid::Sof.kind(), PidKind::Token);
        assert_eq!(Pid::MData.kind(), PidKind::Data);
        assert_eq!(Pid::NYet.kind(), PidKind::HandShake);
        assert_eq!(Pid::Ping.kind(), PidKind::Special);
        assert_eq!(Pid::Pre.kind(), PidKind::Special);
    }

    #[test]
    fn crc5_matches_known_tokens() {
        assert_eq!(crc5(address_field(0, 0), 11), 0x02);
        assert_eq!(crc5(address_field(92, 0), 11), 0x1C);
        assert_eq!(crc5(address_field(3, 0), 11), 0x0A);
        assert_eq!(crc5(address_field(56, 4), 11), 0x0B);
        assert_eq!(crc5(1, 11), 0b11101);
        assert_eq!(crc5(1429, 11), 0x01);
    }

    #[test]
    fn crc16_matches_catalogue() {
        assert_eq!(crc16(b"123456789"), 0xB4C8);
        assert_eq!(crc16(&[]), 0x0000);
        assert_eq!(crc16(&[0x80, 0x06, 0x03, 0x03, 0x09, 0x04, 0x00, 0x02]), 0x3B56);
    }

    #[test]
    fn toggle_alternates() {
        assert_eq!(DataPID::Data0.toggled(), DataPID::Data1);
        assert_eq!(DataPID::Data1.toggled(), DataPID::Data0);
        assert_eq!(DataPID::MData.toggled(), DataPID::MData);
    }
}
