//! Host side sequencing of token, data and handshake packets.
//!
//! The engine never blocks. [`TransactionEngine::step`] does whatever the current simulated
//! time allows and says how long to wait before it should be called again.
use std::collections::HashMap;

use tracing::{debug, info, warn};

use super::bits::{self, Receiver, RxEvent};
use super::error::{DecodeError, TransferError};
use super::packet::{self, Packet};
use super::signal::LineSymbol;
use super::timing::{BusConfig, Deadline, Speed, Ticks, Timing};
use super::transport::{LineAdapter, LineTransport};
use super::types::{Data, DataPID, HandShake, Pid, Token, TokenType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    ControlSetup,
    ControlIn,
    ControlOut,
    BulkIn,
    BulkOut,
    InterruptIn,
    InterruptOut,
    IsochronousIn,
    IsochronousOut,
}

impl TransferKind {
    pub fn token_type(self) -> TokenType {
        use TransferKind::*;
        match self {
            ControlSetup => TokenType::Setup,
            ControlIn | BulkIn | InterruptIn | IsochronousIn => TokenType::In,
            ControlOut | BulkOut | InterruptOut | IsochronousOut => TokenType::Out,
        }
    }

    pub fn pipe(self) -> Pipe {
        use TransferKind::*;
        match self {
            ControlSetup | ControlIn | ControlOut => Pipe::Control,
            BulkIn | InterruptIn | IsochronousIn => Pipe::In,
            BulkOut | InterruptOut | IsochronousOut => Pipe::Out,
        }
    }

    pub fn is_isochronous(self) -> bool {
        matches!(self, TransferKind::IsochronousIn | TransferKind::IsochronousOut)
    }

    pub fn is_bulk(self) -> bool {
        matches!(self, TransferKind::BulkIn | TransferKind::BulkOut)
    }

    /// Whether the host sends a data packet after the token.
    pub fn sends_data(self) -> bool {
        self.token_type() != TokenType::In
    }

    /// Low speed devices only do control and interrupt transfers.
    pub fn allowed_at(self, speed: Speed) -> bool {
        speed == Speed::Full || !(self.is_bulk() || self.is_isochronous())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub address: u8,
    pub number: u8,
}

impl Endpoint {
    pub fn new(address: u8, number: u8) -> Self {
        Self { address, number }
    }

    pub fn control(address: u8) -> Self {
        Self::new(address, 0)
    }
}

/// Which toggle sequence of an endpoint a transfer uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pipe {
    Control,
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointState {
    /// PID of the next data packet.
    pub toggle: DataPID,
    pub last_handshake: Option<HandShake>,
}

impl Default for EndpointState {
    fn default() -> Self {
        Self {
            toggle: DataPID::Data0,
            last_handshake: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    TokenSent,
    DataSent,
    AwaitingHandshake,
    AwaitingData,
    HandshakeSent,
    Acked,
    Nacked,
    Stalled,
    TimedOut,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub kind: TransferKind,
    pub endpoint: Endpoint,
    pub payload: Vec<u8>,
    pub toggle: DataPID,
    pub state: TransactionState,
    /// Tokens sent so far.
    pub attempts: u32,
    pub naks: u32,
    /// Missing or corrupted responses.
    pub errors: u32,
}

impl Transaction {
    /// PIDs exchanged by one successful attempt, host and device packets alike.
    pub fn expected_sequence(&self) -> Vec<Pid> {
        let mut sequence = vec![self.kind.token_type().pid(), self.toggle.pid()];
        if !self.kind.is_isochronous() {
            sequence.push(Pid::Ack);
        }
        sequence
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    Stalled,
    TimedOut,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub status: Status,
    pub received_data: Vec<u8>,
    pub error: Option<TransferError>,
    pub attempts: u32,
}

impl TransferOutcome {
    pub fn success(received_data: Vec<u8>, attempts: u32) -> Self {
        Self {
            status: Status::Success,
            received_data,
            error: None,
            attempts,
        }
    }

    pub fn failed(error: TransferError, attempts: u32) -> Self {
        Self {
            status: Status::Error,
            received_data: Vec::new(),
            error: Some(error),
            attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Call again once this much simulated time has passed.
    Wait(Ticks),
    Done(TransferOutcome),
}

#[derive(Debug)]
enum AfterAck {
    Complete(Vec<u8>),
    /// The data carried the wrong toggle and was dropped.
    Retry,
}

#[derive(Debug)]
enum Phase {
    SendToken {
        at: Ticks,
    },
    SendData {
        at: Ticks,
    },
    Await {
        sent_end: Ticks,
        deadline: Deadline,
        sampled: Ticks,
        started: Option<Ticks>,
    },
    SendAck {
        at: Ticks,
        then: AfterAck,
    },
    Complete {
        at: Ticks,
        outcome: TransferOutcome,
    },
}

#[derive(Debug)]
struct Active {
    tx: Transaction,
    phase: Phase,
}

pub struct TransactionEngine {
    timing: Timing,
    nak_retry_limit: u32,
    error_retry_limit: u32,
    timeout_bits: u32,
    endpoints: HashMap<(Endpoint, Pipe), EndpointState>,
    active: Option<Active>,
    rx: Receiver,
}

impl TransactionEngine {
    pub fn new(config: &BusConfig) -> Self {
        let timing = config.timing();
        Self {
            timing,
            nak_retry_limit: config.nak_retry_limit,
            error_retry_limit: config.error_retry_limit,
            timeout_bits: config.turnaround_timeout_bits.max(1),
            endpoints: HashMap::new(),
            active: None,
            rx: Receiver::for_payload(timing.sync_window, timing.max_packet_size),
        }
    }

    /// Applies a new configuration. Endpoint state is kept.
    pub fn configure(&mut self, config: &BusConfig) {
        let endpoints = std::mem::take(&mut self.endpoints);
        *self = Self::new(config);
        self.endpoints = endpoints;
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    pub fn is_busy(&self) -> bool {
        self.active.is_some()
    }

    pub fn transaction(&self) -> Option<&Transaction> {
        self.active.as_ref().map(|active| &active.tx)
    }

    pub fn endpoint_state(&self, endpoint: Endpoint, pipe: Pipe) -> EndpointState {
        self.endpoints
            .get(&(endpoint, pipe))
            .copied()
            .unwrap_or_default()
    }

    pub fn set_toggle(&mut self, endpoint: Endpoint, pipe: Pipe, toggle: DataPID) {
        self.endpoints.entry((endpoint, pipe)).or_default().toggle = toggle;
    }

    /// Forgets every endpoint's state and drops the active transaction, as a bus reset does.
    pub fn reset(&mut self) {
        if self.active.take().is_some() {
            warn!("transaction dropped by bus reset");
        }
        self.endpoints.clear();
        self.rx.reset();
    }

    /// Queues a transaction. It goes out on the next [`step`](Self::step).
    pub fn begin(
        &mut self,
        kind: TransferKind,
        endpoint: Endpoint,
        payload: Vec<u8>,
        now: Ticks,
    ) -> Result<(), TransferError> {
        let invalid = |reason: String| Err(TransferError::InvalidRequest(reason));
        if self.active.is_some() {
            return invalid("a transaction is already in progress".into());
        }
        if endpoint.address > 0x7F || endpoint.number > 0xF {
            return invalid(format!("no such endpoint {:?}", endpoint));
        }
        if !kind.allowed_at(self.timing.speed) {
            return invalid(format!("{:?} is not available at {:?} speed", kind, self.timing.speed));
        }
        if kind == TransferKind::ControlSetup && payload.len() != 8 {
            return invalid(format!("SETUP carries 8 bytes, not {}", payload.len()));
        }
        if !kind.sends_data() && !payload.is_empty() {
            return invalid(format!("{:?} does not send data", kind));
        }
        if payload.len() > self.timing.max_packet_size {
            return invalid(format!(
                "{} bytes exceed the max packet size of {}",
                payload.len(),
                self.timing.max_packet_size
            ));
        }

        let toggle = if kind.is_isochronous() {
            DataPID::Data0
        } else if kind == TransferKind::ControlSetup {
            self.set_toggle(endpoint, Pipe::Control, DataPID::Data0);
            DataPID::Data0
        } else {
            self.endpoint_state(endpoint, kind.pipe()).toggle
        };

        self.rx.reset();
        self.active = Some(Active {
            tx: Transaction {
                kind,
                endpoint,
                payload,
                toggle,
                state: TransactionState::Idle,
                attempts: 0,
                naks: 0,
                errors: 0,
            },
            phase: Phase::SendToken { at: now },
        });
        Ok(())
    }

    /// Finalises the active transaction as aborted, leaving every toggle untouched.
    pub fn abort(&mut self) -> Option<TransferOutcome> {
        let mut active = self.active.take()?;
        self.rx.reset();
        active.tx.state = TransactionState::Error;
        warn!(kind = ?active.tx.kind, "transaction aborted");
        Some(TransferOutcome::failed(
            TransferError::Aborted,
            active.tx.attempts,
        ))
    }

    pub fn step<T: LineTransport>(&mut self, now: Ticks, link: &mut LineAdapter<T>) -> Step {
        let mut active = match self.active.take() {
            Some(active) => active,
            None => {
                return Step::Done(TransferOutcome::failed(
                    TransferError::InvalidRequest("no transaction in progress".into()),
                    0,
                ))
            }
        };
        let step = self.advance(&mut active, now, link);
        if let Step::Wait(_) = step {
            self.active = Some(active);
        }
        step
    }

    fn send<T: LineTransport>(&self, packet: &Packet, now: Ticks, link: &mut LineAdapter<T>) -> Ticks {
        debug!(%packet, at = %now, "host");
        let frame = bits::encode(&packet::serialize(packet));
        link.send(&frame, now)
    }

    fn advance<T: LineTransport>(
        &mut self,
        active: &mut Active,
        now: Ticks,
        link: &mut LineAdapter<T>,
    ) -> Step {
        let tx = &mut active.tx;
        match &mut active.phase {
            Phase::SendToken { at } | Phase::SendData { at } | Phase::SendAck { at, .. }
                if now < *at =>
            {
                Step::Wait(*at - now)
            }
            Phase::Complete { at, .. } if now < *at => Step::Wait(*at - now),

            Phase::SendToken { .. } => {
                let token = Token::new(
                    tx.kind.token_type(),
                    tx.endpoint.address,
                    tx.endpoint.number,
                );
                let end = self.send(&Packet::Token(token), now, link);
                tx.attempts += 1;
                tx.state = TransactionState::TokenSent;
                if tx.kind.sends_data() {
                    active.phase = Phase::SendData {
                        at: end + self.timing.inter_packet_gap,
                    };
                } else {
                    tx.state = TransactionState::AwaitingData;
                    active.phase = self.await_response(end);
                }
                Step::Wait(end - now)
            }
            Phase::SendData { .. } => {
                let data = Data {
                    pid: tx.toggle,
                    payload: tx.payload.clone(),
                };
                let end = self.send(&Packet::Data(data), now, link);
                tx.state = TransactionState::DataSent;
                if tx.kind.is_isochronous() {
                    active.phase = Phase::Complete {
                        at: end,
                        outcome: TransferOutcome::success(Vec::new(), tx.attempts),
                    };
                } else {
                    tx.state = TransactionState::AwaitingHandshake;
                    active.phase = self.await_response(end);
                }
                Step::Wait(end - now)
            }
            Phase::SendAck { then, .. } => {
                let end = self.send(&Packet::HandShake(HandShake::Ack), now, link);
                tx.state = TransactionState::HandshakeSent;
                match std::mem::replace(then, AfterAck::Retry) {
                    AfterAck::Complete(data) => {
                        self.acknowledged(tx);
                        active.phase = Phase::Complete {
                            at: end,
                            outcome: TransferOutcome::success(data, tx.attempts),
                        };
                    }
                    AfterAck::Retry => {
                        warn!(expected = ?tx.toggle, "data toggle mismatch, data discarded");
                        tx.naks += 1;
                        active.phase = match self.retry_after_nak(tx, end) {
                            Ok(phase) => phase,
                            Err(outcome) => Phase::Complete { at: end, outcome },
                        };
                    }
                }
                Step::Wait(end - now)
            }
            Phase::Complete { outcome, .. } => {
                let outcome = std::mem::replace(outcome, TransferOutcome::success(Vec::new(), 0));
                self.finish(tx, outcome)
            }
            Phase::Await {
                sent_end,
                deadline,
                sampled,
                started,
            } => {
                let sent_end = *sent_end;
                let deadline = *deadline;
                let symbols = if now > *sampled {
                    link.sample_timed(*sampled, now - *sampled)
                } else {
                    Vec::new()
                };
                *sampled = now.max(*sampled);

                for (at, s) in symbols {
                    match self.rx.push(s) {
                        RxEvent::Started => *started = Some(at),
                        RxEvent::Frame(frame) => {
                            let start = started.unwrap_or(at);
                            let delay = start.saturating_sub(sent_end);
                            if delay > self.timing.expected_response {
                                warn!(
                                    bits = self.timing.in_bits(delay),
                                    "late response from {:?}", tx.endpoint
                                );
                            }
                            let end = at + self.timing.bit;
                            let response = frame.and_then(|bits| packet::parse(&bits));
                            return self.on_response(active, response, end, now);
                        }
                        RxEvent::Idle | RxEvent::Busy => {}
                    }
                }

                let line_idle = link.pending_level() != Some(LineSymbol::K);
                if deadline.expired(now) && !self.rx.is_active() && line_idle {
                    let bits = self.timeout_bits;
                    return self.on_missing(active, TransferError::TimedOut { bits }, now);
                }
                Step::Wait(self.timing.bit)
            }
        }
    }

    fn await_response(&mut self, sent_end: Ticks) -> Phase {
        self.rx.reset();
        Phase::Await {
            sent_end,
            deadline: Deadline::after(sent_end, self.timing.turnaround),
            sampled: sent_end,
            started: None,
        }
    }

    fn on_response(
        &mut self,
        active: &mut Active,
        response: Result<Packet, DecodeError>,
        end: Ticks,
        now: Ticks,
    ) -> Step {
        let packet = match response {
            Ok(packet) => packet,
            Err(err @ DecodeError::Crc(_)) | Err(err @ DecodeError::PidCheck(_)) => {
                warn!(%err, "corrupted response");
                return self.on_missing(active, err.into(), now);
            }
            Err(err) => {
                warn!(%err, "undecodable response");
                return self.fail(&mut active.tx, err.into());
            }
        };
        debug!(%packet, at = %end, "device");

        let tx = &mut active.tx;
        let gap = self.timing.inter_packet_gap;
        match (tx.kind.token_type(), packet) {
            (TokenType::In, Packet::Data(data)) if tx.kind.is_isochronous() => {
                if data.pid == DataPID::Data0 || data.pid == DataPID::Data1 {
                    self.finish(tx, TransferOutcome::success(data.payload, tx.attempts))
                } else {
                    self.violation(tx, format!("{:?} in an isochronous IN", data.pid))
                }
            }
            (TokenType::In, Packet::Data(data)) => {
                if data.payload.len() > self.timing.max_packet_size {
                    return self.violation(
                        tx,
                        format!(
                            "babble: {} bytes exceed the max packet size of {}",
                            data.payload.len(),
                            self.timing.max_packet_size
                        ),
                    );
                }
                let then = match data.pid {
                    pid if pid == tx.toggle => AfterAck::Complete(data.payload),
                    DataPID::Data0 | DataPID::Data1 => AfterAck::Retry,
                    pid => return self.violation(tx, format!("{:?} in a non isochronous IN", pid)),
                };
                active.phase = Phase::SendAck {
                    at: end + gap,
                    then,
                };
                Step::Wait((end + gap).saturating_sub(now).max(Ticks(1)))
            }
            (TokenType::Setup, Packet::HandShake(HandShake::Ack))
            | (TokenType::Out, Packet::HandShake(HandShake::Ack))
                if !tx.kind.is_isochronous() =>
            {
                self.acknowledged(tx);
                self.finish(tx, TransferOutcome::success(Vec::new(), tx.attempts))
            }
            (TokenType::Setup, Packet::HandShake(handshake)) => {
                self.violation(tx, format!("SETUP answered with {:?}", handshake))
            }
            (_, Packet::HandShake(HandShake::NAck)) if !tx.kind.is_isochronous() => {
                tx.naks += 1;
                tx.state = TransactionState::Nacked;
                self.record(tx, HandShake::NAck);
                match self.retry_after_nak(tx, end) {
                    Ok(phase) => {
                        active.phase = phase;
                        Step::Wait(self.timing.bit)
                    }
                    Err(outcome) => self.finish(tx, outcome),
                }
            }
            (_, Packet::HandShake(HandShake::Stall)) if !tx.kind.is_isochronous() => {
                tx.state = TransactionState::Stalled;
                self.record(tx, HandShake::Stall);
                self.finish(
                    tx,
                    TransferOutcome {
                        status: Status::Stalled,
                        received_data: Vec::new(),
                        error: None,
                        attempts: tx.attempts,
                    },
                )
            }
            (token_type, packet) => {
                self.violation(tx, format!("unexpected {} after {:?}", packet, token_type))
            }
        }
    }

    /// Either resends the token after a NAK, or gives up once the ceiling is passed.
    fn retry_after_nak(&self, tx: &Transaction, end: Ticks) -> Result<Phase, TransferOutcome> {
        if tx.naks > self.nak_retry_limit {
            warn!(attempts = tx.attempts, "retries exhausted");
            return Err(TransferOutcome::failed(
                TransferError::RetryExhausted {
                    attempts: tx.attempts,
                },
                tx.attempts,
            ));
        }
        debug!(naks = tx.naks, "retrying");
        Ok(Phase::SendToken {
            at: end + self.timing.inter_packet_gap,
        })
    }

    /// No usable response: either try again or time out.
    fn on_missing(&mut self, active: &mut Active, err: TransferError, now: Ticks) -> Step {
        let tx = &mut active.tx;
        tx.errors += 1;
        if tx.kind.is_isochronous() || tx.errors > self.error_retry_limit {
            tx.state = TransactionState::TimedOut;
            warn!(%err, attempts = tx.attempts, "no response");
            return self.finish(
                tx,
                TransferOutcome {
                    status: Status::TimedOut,
                    received_data: Vec::new(),
                    error: Some(err),
                    attempts: tx.attempts,
                },
            );
        }
        warn!(%err, errors = tx.errors, "no response, retrying");
        active.phase = Phase::SendToken {
            at: now + self.timing.inter_packet_gap,
        };
        Step::Wait(self.timing.inter_packet_gap.max(Ticks(1)))
    }

    fn acknowledged(&mut self, tx: &mut Transaction) {
        tx.state = TransactionState::Acked;
        if tx.kind.is_isochronous() {
            return;
        }
        let state = self.endpoints.entry((tx.endpoint, tx.kind.pipe())).or_default();
        state.toggle = tx.toggle.toggled();
        state.last_handshake = Some(HandShake::Ack);
    }

    fn record(&mut self, tx: &Transaction, handshake: HandShake) {
        self.endpoints
            .entry((tx.endpoint, tx.kind.pipe()))
            .or_default()
            .last_handshake = Some(handshake);
    }

    fn violation(&mut self, tx: &mut Transaction, reason: String) -> Step {
        warn!(%reason, "protocol violation");
        self.fail(tx, TransferError::ProtocolViolation(reason))
    }

    fn fail(&mut self, tx: &mut Transaction, err: TransferError) -> Step {
        let attempts = tx.attempts;
        self.finish(tx, TransferOutcome::failed(err, attempts))
    }

    fn finish(&mut self, tx: &mut Transaction, outcome: TransferOutcome) -> Step {
        if outcome.status == Status::Error {
            tx.state = TransactionState::Error;
        }
        self.rx.reset();
        info!(
            kind = ?tx.kind,
            endpoint = ?tx.endpoint,
            status = ?outcome.status,
            attempts = outcome.attempts,
            "transaction finished"
        );
        Step::Done(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::timing::Clock;
    use std::collections::BTreeMap;

    /// Records host drives and plays back a canned device response after every host packet
    /// that asks for one.
    struct Loopback {
        host: BTreeMap<Ticks, LineSymbol>,
        device: BTreeMap<Ticks, LineSymbol>,
    }

    impl Loopback {
        fn new() -> Self {
            Self {
                host: BTreeMap::new(),
                device: BTreeMap::new(),
            }
        }

        fn respond(&mut self, packet: &Packet, at: Ticks, bit: Ticks) {
            let frame = bits::encode(&packet::serialize(packet));
            let mut t = at;
            for s in frame.symbols {
                self.device.insert(t, s);
                t += bit;
            }
        }
    }

    impl LineTransport for Loopback {
        fn drive(&mut self, symbol: LineSymbol, at: Ticks) {
            self.host.insert(at, symbol);
        }
        fn sample(&mut self, at: Ticks) -> LineSymbol {
            let host = self.host.range(..=at).next_back();
            let device = self.device.range(..=at).next_back();
            match (host, device) {
                (Some((h, hs)), Some((d, ds))) => {
                    if d >= h {
                        *ds
                    } else {
                        *hs
                    }
                }
                (Some((_, s)), None) | (None, Some((_, s))) => *s,
                (None, None) => LineSymbol::J,
            }
        }
        fn advance(&mut self, _duration: Ticks) {}
    }

    fn run(
        engine: &mut TransactionEngine,
        link: &mut LineAdapter<Loopback>,
        clock: &mut Clock,
    ) -> TransferOutcome {
        for _ in 0..10_000 {
            match engine.step(clock.now(), link) {
                Step::Wait(d) => {
                    assert!(d > Ticks::ZERO);
                    clock.wait(d, link.transport_mut());
                }
                Step::Done(outcome) => return outcome,
            }
        }
        panic!("transaction never finished");
    }

    #[test]
    fn unanswered_out_times_out() {
        let config = BusConfig::default();
        let mut engine = TransactionEngine::new(&config);
        let mut link = LineAdapter::new(Loopback::new(), Speed::Full);
        let mut clock = Clock::new();
        let ep = Endpoint::new(1, 2);

        engine
            .begin(TransferKind::BulkOut, ep, vec![1, 2, 3], clock.now())
            .unwrap();
        assert_eq!(
            engine.transaction().map(|tx| tx.expected_sequence()),
            Some(vec![Pid::Out, Pid::Data0, Pid::Ack])
        );
        let outcome = run(&mut engine, &mut link, &mut clock);
        assert_eq!(outcome.status, Status::TimedOut);
        assert_eq!(outcome.error, Some(TransferError::TimedOut { bits: 16 }));
        assert_eq!(outcome.attempts, 1);
        assert_eq!(engine.endpoint_state(ep, Pipe::Out).toggle, DataPID::Data0);
        assert!(!engine.is_busy());
    }

    #[test]
    fn in_data_is_acknowledged() {
        let config = BusConfig::default();
        let mut engine = TransactionEngine::new(&config);
        let mut link = LineAdapter::new(Loopback::new(), Speed::Full);
        let mut clock = Clock::new();
        let ep = Endpoint::new(3, 1);
        let bit = Ticks(4);

        // IN token is 35 bit times long, the device answers 3 bit times later.
        let data = Packet::Data(Data {
            pid: DataPID::Data0,
            payload: vec![0xAA, 0x55],
        });
        link.transport_mut().respond(&data, bit * 38, bit);

        engine
            .begin(TransferKind::InterruptIn, ep, vec![], clock.now())
            .unwrap();
        let outcome = run(&mut engine, &mut link, &mut clock);
        assert_eq!(outcome, TransferOutcome::success(vec![0xAA, 0x55], 1));
        let state = engine.endpoint_state(ep, Pipe::In);
        assert_eq!(state.toggle, DataPID::Data1);
        assert_eq!(state.last_handshake, Some(HandShake::Ack));

        // The ACK went out on the host side after the data packet.
        let host_after: Vec<_> = link
            .transport()
            .host
            .range(bit * 38..)
            .map(|(_, s)| *s)
            .collect();
        assert_eq!(host_after.first(), Some(&LineSymbol::K));
    }

    #[test]
    fn requests_are_validated() {
        let mut engine = TransactionEngine::new(&BusConfig::new(Speed::Low));
        let ep = Endpoint::new(1, 1);
        for kind in [TransferKind::BulkOut, TransferKind::IsochronousIn].iter().copied() {
            assert!(matches!(
                engine.begin(kind, ep, vec![], Ticks::ZERO),
                Err(TransferError::InvalidRequest(_))
            ));
        }
        assert!(engine
            .begin(TransferKind::ControlSetup, Endpoint::control(0), vec![0; 7], Ticks::ZERO)
            .is_err());
        assert!(engine
            .begin(TransferKind::InterruptOut, ep, vec![0; 9], Ticks::ZERO)
            .is_err());
        assert!(engine
            .begin(TransferKind::InterruptIn, Endpoint::new(128, 1), vec![], Ticks::ZERO)
            .is_err());
        assert!(engine
            .begin(TransferKind::InterruptOut, ep, vec![0; 8], Ticks::ZERO)
            .is_ok());
        assert!(engine
            .begin(TransferKind::InterruptOut, ep, vec![], Ticks::ZERO)
            .is_err());
        assert_eq!(
            engine.abort(),
            Some(TransferOutcome::failed(TransferError::Aborted, 0))
        );
        assert_eq!(engine.abort(), None);
    }

    #[test]
    fn setup_resets_the_control_toggle() {
        let mut engine = TransactionEngine::new(&BusConfig::default());
        let ep = Endpoint::control(4);
        engine.set_toggle(ep, Pipe::Control, DataPID::Data1);
        engine
            .begin(TransferKind::ControlSetup, ep, vec![0; 8], Ticks::ZERO)
            .unwrap();
        assert_eq!(engine.transaction().map(|tx| tx.toggle), Some(DataPID::Data0));
        assert_eq!(engine.endpoint_state(ep, Pipe::Control).toggle, DataPID::Data0);
        engine.reset();
        assert!(!engine.is_busy());
    }

    #[test]
    fn isochronous_sequences_have_no_handshake() {
        let mut engine = TransactionEngine::new(&BusConfig::default());
        engine
            .begin(TransferKind::IsochronousOut, Endpoint::new(2, 3), vec![9], Ticks::ZERO)
            .unwrap();
        assert_eq!(
            engine.transaction().map(|tx| tx.expected_sequence()),
            Some(vec![Pid::Out, Pid::Data0])
        );
    }
}
