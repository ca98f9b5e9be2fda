use thiserror::Error;

/// Line-level violations found while recovering bits from symbols.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("missing stuff bit after six consecutive ones at bit {position}")]
    MissingStuffBit { position: usize },
    #[error("stream ended before the end of packet")]
    Truncated,
    #[error("SE1 on the bus")]
    Se1,
    #[error("malformed end of packet")]
    BadEop,
    #[error("single-ended zero inside a packet at bit {position}")]
    UnexpectedSe0 { position: usize },
    #[error("packet longer than {max_bits} bit times")]
    TooLong { max_bits: usize },
    #[error("{bits} bits do not make whole bytes")]
    DanglingBits { bits: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrcKind {
    Crc5,
    Crc16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{kind:?} mismatch: computed {expected:#06x}, received {received:#06x}")]
pub struct CrcError {
    pub kind: CrcKind,
    pub expected: u16,
    pub received: u16,
}

/// Reasons a bit stream could not be turned into a [`Packet`](super::packet::Packet).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error("no sync pattern within {window} bit times")]
    NoSync { window: usize },
    #[error(transparent)]
    Crc(#[from] CrcError),
    #[error("invalid sync byte {0:#04x}")]
    InvalidSync(u8),
    #[error("PID check bits do not match in {0:#04x}")]
    PidCheck(u8),
    #[error("unsupported PID {0:#04x}")]
    UnsupportedPid(u8),
    #[error("{len} byte(s) is not a valid length for PID {pid:#04x}")]
    Length { pid: u8, len: usize },
}

/// Why a transaction did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error("no sync pattern within {window} bit times")]
    NoSync { window: usize },
    #[error(transparent)]
    Crc(#[from] CrcError),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("no response within {bits} bit times")]
    TimedOut { bits: u32 },
    #[error("still NAKed after {attempts} attempts")]
    RetryExhausted { attempts: u32 },
    #[error("transaction aborted")]
    Aborted,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl From<DecodeError> for TransferError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::Framing(e) => TransferError::Framing(e),
            DecodeError::NoSync { window } => TransferError::NoSync { window },
            DecodeError::Crc(e) => TransferError::Crc(e),
            e => TransferError::ProtocolViolation(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_errors_map_onto_the_transfer_taxonomy() {
        let crc = CrcError {
            kind: CrcKind::Crc16,
            expected: 0x1234,
            received: 0x1235,
        };
        assert_eq!(
            TransferError::from(DecodeError::Crc(crc)),
            TransferError::Crc(crc)
        );
        assert_eq!(
            TransferError::from(DecodeError::Framing(FramingError::BadEop)),
            TransferError::Framing(FramingError::BadEop)
        );
        assert!(matches!(
            TransferError::from(DecodeError::PidCheck(0xd3)),
            TransferError::ProtocolViolation(_)
        ));
    }
}
