//! An in-memory bus with a scriptable device at the far end.
//!
//! The host side drives the line through [`LineTransport`]. The device decodes whatever the
//! host drove as simulated time advances, asks its [`DeviceModel`] for a reply and schedules
//! that reply on its own half of the line.
use std::collections::{BTreeMap, VecDeque};

use tracing::{debug, info};

use super::bits::{self, Receiver, RxEvent, DEFAULT_SYNC_WINDOW};
use super::error::DecodeError;
use super::packet::{self, Packet};
use super::signal::LineSymbol;
use super::timing::{Speed, Ticks};
use super::transport::{LineTransport, SymbolRecovery};
use super::types::{Data, DataPID, HandShake, Token, TokenType};

/// SE0 held this long resets the device, 2.5 us.
pub const RESET_DETECT: Ticks = Ticks(120);
/// Bit times between the end of a host packet and the device's reply.
pub const DEFAULT_RESPONSE_DELAY: u64 = 2;
/// Bit times of line history kept behind the current time. Older edges are forgotten, so
/// sampling further back than this reads the last level that was kept.
pub const LINE_HISTORY_BITS: u64 = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Silent,
    Packet(Packet),
    /// Sent `bits` bit times after the host packet instead of the default delay.
    Delayed { packet: Packet, bits: u64 },
    /// Sent with its last bit flipped, breaking the CRC or the PID check.
    Corrupted(Packet),
    /// Raw line symbols, for anything a well formed packet cannot express.
    Symbols(Vec<LineSymbol>),
}

impl Reply {
    pub fn ack() -> Self {
        Reply::Packet(Packet::HandShake(HandShake::Ack))
    }

    pub fn nak() -> Self {
        Reply::Packet(Packet::HandShake(HandShake::NAck))
    }

    pub fn stall() -> Self {
        Reply::Packet(Packet::HandShake(HandShake::Stall))
    }

    pub fn data(pid: DataPID, payload: &[u8]) -> Self {
        Reply::Packet(Packet::Data(Data {
            pid,
            payload: payload.to_vec(),
        }))
    }
}

/// Device behaviour behind a [`SimBus`].
pub trait DeviceModel {
    /// Called with every packet the host sent, once its end of packet was seen.
    fn on_packet(&mut self, packet: &Packet, at: Ticks) -> Reply;
    fn on_reset(&mut self) {}
    fn on_error(&mut self, _error: &DecodeError) {}
}

impl<F: FnMut(&Packet) -> Reply> DeviceModel for F {
    fn on_packet(&mut self, packet: &Packet, _at: Ticks) -> Reply {
        self(packet)
    }
}

/// Answers IN tokens and host data packets from a queue of replies, in order.
#[derive(Debug, Default)]
pub struct ScriptedDevice {
    replies: VecDeque<Reply>,
    /// Used once the queue runs dry.
    pub fallback: Option<Reply>,
    pub received: Vec<Packet>,
    pub resets: usize,
}

impl ScriptedDevice {
    pub fn new<I: IntoIterator<Item = Reply>>(replies: I) -> Self {
        Self {
            replies: replies.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn with_fallback(mut self, reply: Reply) -> Self {
        self.fallback = Some(reply);
        self
    }

    pub fn push(&mut self, reply: Reply) {
        self.replies.push_back(reply);
    }

    pub fn pending(&self) -> usize {
        self.replies.len()
    }
}

impl DeviceModel for ScriptedDevice {
    fn on_packet(&mut self, packet: &Packet, _at: Ticks) -> Reply {
        self.received.push(packet.clone());
        let answers = match packet {
            Packet::Token(Token::Transfer { token_type, .. }) => *token_type == TokenType::In,
            Packet::Data(_) => true,
            _ => false,
        };
        if !answers {
            return Reply::Silent;
        }
        self.replies
            .pop_front()
            .or_else(|| self.fallback.clone())
            .unwrap_or(Reply::Silent)
    }

    fn on_reset(&mut self) {
        self.resets += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Host,
    Device,
}

/// One packet seen on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Traffic {
    /// Start of the sync field.
    pub at: Ticks,
    pub source: Source,
    pub packet: Result<Packet, DecodeError>,
}

pub struct SimBus<D> {
    bit: Ticks,
    now: Ticks,
    host: BTreeMap<Ticks, LineSymbol>,
    device_line: BTreeMap<Ticks, LineSymbol>,
    device: D,
    recovery: SymbolRecovery,
    rx: Receiver,
    frame_start: Ticks,
    se0_since: Option<Ticks>,
    in_reset: bool,
    response_delay: u64,
    traffic: Vec<Traffic>,
    resets: Vec<Ticks>,
}

impl<D: DeviceModel> SimBus<D> {
    pub fn new(device: D, speed: Speed) -> Self {
        let bit = Ticks(speed.ticks_per_bit());
        Self {
            bit,
            now: Ticks::ZERO,
            host: BTreeMap::new(),
            device_line: BTreeMap::new(),
            device,
            recovery: SymbolRecovery::new(bit),
            rx: Receiver::new(DEFAULT_SYNC_WINDOW, usize::MAX),
            frame_start: Ticks::ZERO,
            se0_since: None,
            in_reset: false,
            response_delay: DEFAULT_RESPONSE_DELAY,
            traffic: Vec::new(),
            resets: Vec::new(),
        }
    }

    pub fn with_response_delay(mut self, bits: u64) -> Self {
        self.response_delay = bits;
        self
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn now(&self) -> Ticks {
        self.now
    }

    pub fn traffic(&self) -> &[Traffic] {
        &self.traffic
    }

    /// Hands over the traffic recorded so far and starts a fresh record.
    pub fn take_traffic(&mut self) -> Vec<Traffic> {
        std::mem::take(&mut self.traffic)
    }

    /// Packets in the order they appeared, undecodable ones left out.
    pub fn packets(&self) -> Vec<(Source, Packet)> {
        self.traffic
            .iter()
            .filter_map(|t| t.packet.clone().ok().map(|p| (t.source, p)))
            .collect()
    }

    /// Times at which the device saw a reset begin.
    pub fn resets(&self) -> &[Ticks] {
        &self.resets
    }

    /// Forgets every edge before the last one at or before `horizon`.
    fn prune(line: &mut BTreeMap<Ticks, LineSymbol>, horizon: Ticks) {
        if let Some(keep) = line.range(..=horizon).next_back().map(|(t, _)| *t) {
            *line = line.split_off(&keep);
        }
    }

    fn level(line: &BTreeMap<Ticks, LineSymbol>, at: Ticks) -> Option<(Ticks, LineSymbol)> {
        line.range(..=at).next_back().map(|(t, s)| (*t, *s))
    }

    fn on_host_frame(&mut self, frame: Result<Vec<bits::Bit>, DecodeError>, end: Ticks) {
        let parsed = frame.and_then(|bits| packet::parse(&bits));
        self.traffic.push(Traffic {
            at: self.frame_start,
            source: Source::Host,
            packet: parsed.clone(),
        });
        let reply = match parsed {
            Ok(packet) => self.device.on_packet(&packet, end),
            Err(err) => {
                debug!(%err, "device could not decode host packet");
                self.device.on_error(&err);
                Reply::Silent
            }
        };

        let delayed = |bits: u64| end + self.bit * bits;
        let (symbols, at) = match reply {
            Reply::Silent => return,
            Reply::Packet(p) => (
                bits::encode(&packet::serialize(&p)).symbols,
                delayed(self.response_delay),
            ),
            Reply::Delayed { packet: p, bits } => {
                (bits::encode(&packet::serialize(&p)).symbols, delayed(bits))
            }
            Reply::Corrupted(p) => {
                let mut raw = packet::serialize(&p);
                if let Some(last) = raw.last_mut() {
                    *last = !*last;
                }
                (bits::encode(&raw).symbols, delayed(self.response_delay))
            }
            Reply::Symbols(symbols) => (symbols, delayed(self.response_delay)),
        };
        self.schedule(symbols, at);
    }

    fn schedule(&mut self, symbols: Vec<LineSymbol>, start: Ticks) {
        let packet = bits::decode(&symbols).and_then(|bits| packet::parse(&bits));
        if let Ok(p) = &packet {
            debug!(packet = %p, at = %start, "device");
        }
        self.traffic.push(Traffic {
            at: start,
            source: Source::Device,
            packet,
        });

        let mut at = start;
        let mut previous = None;
        for s in symbols {
            if previous != Some(s) {
                self.device_line.insert(at, s);
                previous = Some(s);
            }
            at += self.bit;
        }
        // Let go of the line.
        if previous != Some(LineSymbol::J) {
            self.device_line.insert(at, LineSymbol::J);
        }
    }

    fn process(&mut self, at: Ticks) {
        let s = Self::level(&self.host, at).map_or(LineSymbol::J, |(_, s)| s);

        if s == LineSymbol::SE0 {
            let since = *self.se0_since.get_or_insert(at);
            if !self.in_reset && at + Ticks(1) - since >= RESET_DETECT {
                self.in_reset = true;
                self.rx.reset();
                self.recovery.clear();
                self.resets.push(since);
                info!(at = %since, "device reset");
                self.device.on_reset();
            }
        } else {
            self.se0_since = None;
            self.in_reset = false;
        }
        if self.in_reset {
            return;
        }

        if let Some((start, symbol)) = self.recovery.push(at, s) {
            match self.rx.push(symbol) {
                RxEvent::Started => self.frame_start = start,
                RxEvent::Frame(frame) => self.on_host_frame(frame, start + self.bit),
                RxEvent::Idle | RxEvent::Busy => {}
            }
        }
    }
}

impl<D: DeviceModel> LineTransport for SimBus<D> {
    fn drive(&mut self, symbol: LineSymbol, at: Ticks) {
        self.host.insert(at, symbol);
    }

    fn sample(&mut self, at: Ticks) -> LineSymbol {
        match (
            Self::level(&self.host, at),
            Self::level(&self.device_line, at),
        ) {
            (Some((h, hs)), Some((d, ds))) => {
                if d >= h {
                    ds
                } else {
                    hs
                }
            }
            (Some((_, s)), None) | (None, Some((_, s))) => s,
            (None, None) => LineSymbol::J,
        }
    }

    fn set_speed(&mut self, speed: Speed) {
        self.bit = Ticks(speed.ticks_per_bit());
        self.recovery = SymbolRecovery::new(self.bit);
        self.rx.reset();
    }

    fn advance(&mut self, duration: Ticks) {
        let end = self.now + duration;
        let mut at = self.now;
        while at < end {
            self.process(at);
            at += Ticks(1);
        }
        self.now = end;

        let horizon = end.saturating_sub(self.bit * LINE_HISTORY_BITS);
        Self::prune(&mut self.host, horizon);
        Self::prune(&mut self.device_line, horizon);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::bits::BitFrame;
    use crate::usb::transport::LineAdapter;

    fn send<D: DeviceModel>(
        link: &mut LineAdapter<SimBus<D>>,
        packet: &Packet,
        at: Ticks,
    ) -> Ticks {
        let frame: BitFrame = bits::encode(&packet::serialize(packet));
        link.send(&frame, at)
    }

    #[test]
    fn device_answers_in_tokens() {
        let device = ScriptedDevice::new(vec![Reply::data(DataPID::Data1, &[7])]);
        let mut link = LineAdapter::new(SimBus::new(device, Speed::Full), Speed::Full);
        let token = Packet::Token(Token::new(TokenType::In, 5, 1));
        let end = send(&mut link, &token, Ticks(8));
        link.transport_mut().advance(end + Ticks(400));

        let bus = link.transport();
        assert_eq!(bus.device().received, vec![token.clone()]);
        assert_eq!(
            bus.packets(),
            vec![
                (Source::Host, token),
                (
                    Source::Device,
                    Packet::Data(Data {
                        pid: DataPID::Data1,
                        payload: vec![7]
                    })
                )
            ]
        );
        assert_eq!(bus.traffic()[0].at, Ticks(8));
        assert_eq!(bus.traffic()[1].at, end + Ticks(8));
    }

    #[test]
    fn reply_is_visible_on_the_line() {
        let device = |p: &Packet| match p {
            Packet::Data(_) => Reply::ack(),
            _ => Reply::Silent,
        };
        let mut link = LineAdapter::new(SimBus::new(device, Speed::Low), Speed::Low);
        let data = Packet::Data(Data {
            pid: DataPID::Data0,
            payload: vec![],
        });
        let end = send(&mut link, &data, Ticks::ZERO);
        let bit = link.bit();
        link.transport_mut().advance(end + bit * 40);
        let line = link.sample(end, bit * 40);
        let ack = bits::encode(&packet::serialize(&Packet::HandShake(HandShake::Ack)));
        let expected: Vec<_> = std::iter::repeat(LineSymbol::J)
            .take(2)
            .chain(ack.symbols)
            .collect();
        assert_eq!(&line[..expected.len()], &expected[..]);
    }

    #[test]
    fn line_history_stays_bounded() {
        let bus = SimBus::new(ScriptedDevice::default(), Speed::Full);
        let mut link = LineAdapter::new(bus, Speed::Full);
        let period = Ticks(2000);
        for frame in 0..20 {
            let sof = Packet::Token(Token::Sof { frame });
            let start = period * u64::from(frame);
            send(&mut link, &sof, start);
            let idle = start + period - link.transport().now();
            link.transport_mut().advance(idle);
        }

        let bus = link.transport_mut();
        assert_eq!(bus.device().received.len(), 20);
        // Only the frames within the last 1024 bit times are left.
        assert!(bus.host.len() < 3 * 40, "{} edges kept", bus.host.len());
        assert!(bus.host.range(..Ticks(30_000)).count() <= 1);
        assert_eq!(bus.take_traffic().len(), 20);
        assert!(bus.traffic().is_empty());
    }

    #[test]
    fn long_se0_resets_the_device() {
        let mut bus = SimBus::new(ScriptedDevice::default(), Speed::Full);
        bus.drive(LineSymbol::SE0, Ticks(10));
        bus.drive(LineSymbol::J, Ticks(10) + RESET_DETECT * 2);
        bus.advance(RESET_DETECT * 4);
        assert_eq!(bus.resets(), &[Ticks(10)]);
        assert_eq!(bus.device().resets, 1);
    }

    #[test]
    fn corrupted_handshake_fails_its_pid_check() {
        let device = |p: &Packet| match p {
            Packet::Data(_) => Reply::Corrupted(Packet::HandShake(HandShake::Ack)),
            _ => Reply::Silent,
        };
        let mut link = LineAdapter::new(SimBus::new(device, Speed::Full), Speed::Full);
        let data = Packet::Data(Data {
            pid: DataPID::Data0,
            payload: vec![1],
        });
        let end = send(&mut link, &data, Ticks::ZERO);
        link.transport_mut().advance(end + Ticks(200));
        let traffic = link.transport().traffic();
        assert_eq!(traffic.len(), 2);
        assert_eq!(traffic[1].packet, Err(DecodeError::PidCheck(0x52)));
    }
}
