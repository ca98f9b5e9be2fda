use std::convert::TryFrom;
use std::fmt;

use anyhow::Result;
use clap::{value_t, SubCommand};

use super::bits::{Bit, Receiver, RxEvent, DEFAULT_SYNC_WINDOW};
use super::error::{CrcError, CrcKind, DecodeError, FramingError};
use super::signal::{self, LineSymbol};
use super::timing::Speed;
use super::types::{
    address_field, crc16, crc5, Data, DataPID, HandShake, Pid, PidKind, Special, Token,
    TokenType,
};
use crate::pipeline::{self, Event, EventData, EventIterator, Node};
use crate::sink;

pub const SYNC_BYTE: u8 = 0x80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Token(Token),
    Data(Data),
    HandShake(HandShake),
    Special(Special),
}

impl Packet {
    pub fn pid(&self) -> Pid {
        match self {
            Packet::Token(token) => token.pid(),
            Packet::Data(data) => data.pid.pid(),
            Packet::HandShake(handshake) => handshake.pid(),
            Packet::Special(special) => special.pid(),
        }
    }

    /// The packet as sent on the wire, sync byte included.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![SYNC_BYTE, self.pid().byte()];
        match self {
            Packet::Token(token) => push_field(&mut buf, token.field()),
            Packet::Special(Special::Ping { address, endpoint }) => {
                push_field(&mut buf, address_field(*address, *endpoint))
            }
            Packet::Data(data) => {
                buf.extend_from_slice(&data.payload);
                buf.extend_from_slice(&crc16(&data.payload).to_le_bytes());
            }
            Packet::HandShake(_) | Packet::Special(Special::Pre) => {}
        }
        buf
    }
}

fn push_field(buf: &mut Vec<u8>, field: u16) {
    let crc = crc5(field, 11);
    buf.push(field as u8);
    buf.push(((field >> 8) as u8 & 0x7) | (crc << 3));
}

fn check_field(lsb: u8, msb: u8) -> Result<u16, DecodeError> {
    let field = u16::from(lsb) | (u16::from(msb & 0x7) << 8);
    let expected = crc5(field, 11);
    let received = msb >> 3;
    if expected != received {
        return Err(CrcError {
            kind: CrcKind::Crc5,
            expected: expected.into(),
            received: received.into(),
        }
        .into());
    }
    Ok(field)
}

impl TryFrom<&[u8]> for Packet {
    type Error = DecodeError;
    fn try_from(buf: &[u8]) -> Result<Self, DecodeError> {
        let (pid_byte, body) = match buf {
            &[SYNC_BYTE, pid, ref body @ ..] => (pid, body),
            &[sync, ..] if sync != SYNC_BYTE => return Err(DecodeError::InvalidSync(sync)),
            _ => return Err(FramingError::Truncated.into()),
        };
        let pid = Pid::from_byte(pid_byte)?;
        let bad_length = || DecodeError::Length {
            pid: pid_byte,
            len: body.len(),
        };

        match pid.kind() {
            PidKind::Token => {
                let field = match body {
                    &[lsb, msb] => check_field(lsb, msb)?,
                    _ => return Err(bad_length()),
                };
                let (address, endpoint) = ((field & 0x7F) as u8, (field >> 7) as u8);
                Ok(Packet::Token(match pid {
                    Pid::Out => Token::new(TokenType::Out, address, endpoint),
                    Pid::In => Token::new(TokenType::In, address, endpoint),
                    Pid::Setup => Token::new(TokenType::Setup, address, endpoint),
                    _ => Token::Sof { frame: field },
                }))
            }
            PidKind::Data => {
                let (payload, crc) = match body {
                    &[ref payload @ .., lo, hi] => (payload, u16::from_le_bytes([lo, hi])),
                    _ => return Err(bad_length()),
                };
                let expected = crc16(payload);
                if expected != crc {
                    return Err(CrcError {
                        kind: CrcKind::Crc16,
                        expected,
                        received: crc,
                    }
                    .into());
                }
                let pid = match pid {
                    Pid::Data0 => DataPID::Data0,
                    Pid::Data1 => DataPID::Data1,
                    Pid::Data2 => DataPID::Data2,
                    _ => DataPID::MData,
                };
                Ok(Packet::Data(Data {
                    pid,
                    payload: payload.to_vec(),
                }))
            }
            PidKind::HandShake => {
                if !body.is_empty() {
                    return Err(bad_length());
                }
                Ok(Packet::HandShake(match pid {
                    Pid::Ack => HandShake::Ack,
                    Pid::Nak => HandShake::NAck,
                    Pid::Stall => HandShake::Stall,
                    _ => HandShake::NYet,
                }))
            }
            PidKind::Special => match (pid, body) {
                (Pid::Pre, &[]) => Ok(Packet::Special(Special::Pre)),
                (Pid::Pre, _) => Err(bad_length()),
                (Pid::Ping, &[lsb, msb]) => {
                    let field = check_field(lsb, msb)?;
                    Ok(Packet::Special(Special::Ping {
                        address: (field & 0x7F) as u8,
                        endpoint: (field >> 7) as u8,
                    }))
                }
                (Pid::Ping, _) => Err(bad_length()),
                _ => Err(DecodeError::UnsupportedPid(pid_byte)),
            },
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Packet::Token(Token::Transfer {
                token_type,
                address,
                endpoint,
            }) => write!(f, "{:?}({}.{})", token_type, address, endpoint),
            Packet::Token(Token::Sof { frame }) => write!(f, "SOF({})", frame),
            Packet::Data(data) => write!(f, "{:?}{:02x?}", data.pid, data.payload),
            Packet::HandShake(handshake) => write!(f, "{:?}", handshake),
            Packet::Special(Special::Pre) => f.write_str("PRE"),
            Packet::Special(Special::Ping { address, endpoint }) => {
                write!(f, "PING({}.{})", address, endpoint)
            }
        }
    }
}

/// Sync, PID and payload bits in wire order.
pub fn serialize(packet: &Packet) -> Vec<Bit> {
    packet
        .to_bytes()
        .into_iter()
        .flat_map(|byte| (0..8).map(move |i| (byte >> i) & 1 == 1))
        .collect()
}

pub fn parse(bits: &[Bit]) -> Result<Packet, DecodeError> {
    if bits.len() % 8 != 0 {
        return Err(FramingError::DanglingBits { bits: bits.len() }.into());
    }
    let bytes: Vec<u8> = bits
        .chunks(8)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .fold(0u8, |acc, (i, &bit)| acc | (u8::from(bit) << i))
        })
        .collect();
    Packet::try_from(&bytes[..])
}

/// What the packet stage reports from a capture.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    /// SE0 held long enough to reset the device.
    Reset,
    Packet(Packet),
}

/// A single ended zero longer than this resets the device.
pub const RESET_DETECT_SECS: f64 = 2.5e-6;

/// Recovers packets from the bus state changes of a capture.
pub struct PacketIterator<T> {
    it: T,
    look_ahead: Option<(f64, LineSymbol)>,
    bit_len: f64,
    rx: Receiver,
    started_at: f64,
    done: bool,
}

impl<T> PacketIterator<T> {
    pub fn new(input: T, speed: Speed) -> Self {
        Self {
            it: input,
            look_ahead: None,
            bit_len: speed.bit_period_secs(),
            rx: Receiver::new(DEFAULT_SYNC_WINDOW, usize::MAX),
            started_at: 0.,
            done: false,
        }
    }
}

macro_rules! opt_bail {
    ($input:expr) => {
        match $input {
            Some((ts, Ok(ev))) => match pipeline::downcast::<LineSymbol>(ev) {
                Ok(s) => Some((ts, s)),
                Err(e) => return Some((ts, Err(e))),
            },
            Some((ts, Err(e))) => return Some((ts, Err(e))),
            None => None,
        }
    };
}

impl<T> PacketIterator<T>
where
    T: Iterator<Item = Event>,
{
    /// Feeds `count` bit times of `symbol` to the receiver, stopping on the first result.
    fn feed(&mut self, ts: f64, symbol: LineSymbol, count: u64) -> Option<Event> {
        for i in 0..count {
            let at = ts + i as f64 * self.bit_len;
            match self.rx.push(symbol) {
                RxEvent::Idle => break,
                RxEvent::Started => self.started_at = at,
                RxEvent::Busy => {}
                RxEvent::Frame(frame) => {
                    let ev = frame
                        .and_then(|bits| parse(&bits))
                        .map(|p| Box::new(BusEvent::Packet(p)) as Box<dyn EventData>)
                        .map_err(anyhow::Error::from);
                    return Some((self.started_at, ev));
                }
            }
        }
        None
    }
}

impl<T> Iterator for PacketIterator<T>
where
    T: Iterator<Item = Event>,
{
    type Item = Event;
    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            let mut current = match self.look_ahead.take() {
                Some(current) => current,
                None => opt_bail!(self.it.next())?,
            };
            let mut next = opt_bail!(self.it.next());

            // D+ and D- never switch at exactly the same instant. The short single ended
            // states this produces belong to the run that follows.
            let mut glitch = 0.;
            if let Some(n) = next {
                if !current.1.is_differential() && n.0 - current.0 <= self.bit_len / 2. {
                    glitch = n.0 - current.0;
                    current = n;
                    next = opt_bail!(self.it.next());
                }
            }
            self.look_ahead = next;

            let (ts, symbol) = current;
            let (len, count) = match next {
                Some((nts, _)) => {
                    let len = nts - ts + glitch;
                    (len, (len / self.bit_len).round() as u64)
                }
                None => {
                    self.done = true;
                    (self.bit_len, 1)
                }
            };

            if symbol == LineSymbol::SE0 && len > RESET_DETECT_SECS {
                self.rx.reset();
                return Some((ts, Ok(Box::new(BusEvent::Reset))));
            }
            if let Some(ev) = self.feed(ts - glitch, symbol, count) {
                return Some(ev);
            }
        }
    }
}

pub fn build(pipeline: &mut Vec<Box<dyn EventIterator>>, args: &[String]) -> Result<()> {
    let matches = SubCommand::with_name("usb::packet")
        .setting(clap::AppSettings::NoBinaryName)
        .args(&signal::args())
        .arg(sink::verbose_arg())
        .get_matches_from(args);

    let speed = signal::speed_of(&matches);
    let dp = value_t!(matches, "dp", u8).unwrap_or_else(|e| e.exit());
    let dm = value_t!(matches, "dm", u8).unwrap_or_else(|e| e.exit());
    let input = pipeline::take_input::<LineSymbol>(pipeline, "usb::packet", |pipeline| {
        let mut forwarded = vec![format!("--dp={}", dp), format!("--dm={}", dm)];
        if speed == Speed::Full {
            forwarded.push("--fs".into());
        }
        signal::build(pipeline, &forwarded)
    })?;
    let it = PacketIterator::new(input, speed);
    sink::push(pipeline, Node::<_, BusEvent>::new(it), matches.is_present("verbose"));
    Ok(())
}
