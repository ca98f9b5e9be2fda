//! The test facing side of the model: one bus, one clock, one transaction at a time.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use super::bits;
use super::engine::{
    Endpoint, EndpointState, Pipe, Status, Step, TransactionEngine, TransferKind,
    TransferOutcome,
};
use super::error::TransferError;
use super::packet::{self, Packet};
use super::request::{Direction, SetupPacket};
use super::signal::LineSymbol;
use super::timing::{BusConfig, Clock, Speed, Ticks};
use super::transport::{LineAdapter, LineTransport};
use super::types::{DataPID, Token};

/// Cancels the transaction in progress from anywhere, including another thread.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

pub struct BusSession<T: LineTransport> {
    config: BusConfig,
    clock: Clock,
    link: LineAdapter<T>,
    engine: TransactionEngine,
    abort: AbortHandle,
}

impl<T: LineTransport> BusSession<T> {
    pub fn new(transport: T, config: BusConfig) -> Self {
        Self {
            link: LineAdapter::new(transport, config.speed),
            engine: TransactionEngine::new(&config),
            clock: Clock::new(),
            abort: AbortHandle::default(),
            config,
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn speed(&self) -> Speed {
        self.config.speed
    }

    /// Switches the bit rate of the session and its transport. A transaction in progress is
    /// aborted.
    pub fn set_speed(&mut self, speed: Speed) {
        if let Some(outcome) = self.abort() {
            warn!(?outcome, "transaction aborted by a speed change");
        }
        self.config.speed = speed;
        self.engine.configure(&self.config);
        self.link.set_speed(speed);
    }

    pub fn now(&self) -> Ticks {
        self.clock.now()
    }

    /// Leaves the bus idle for `duration`.
    pub fn wait(&mut self, duration: Ticks) {
        self.clock.wait(duration, self.link.transport_mut());
    }

    pub fn transport(&self) -> &T {
        self.link.transport()
    }

    pub fn transport_mut(&mut self) -> &mut T {
        self.link.transport_mut()
    }

    pub fn into_transport(self) -> T {
        self.link.into_inner()
    }

    pub fn endpoint_state(&self, endpoint: Endpoint, pipe: Pipe) -> EndpointState {
        self.engine.endpoint_state(endpoint, pipe)
    }

    /// Holds SE0 for the configured reset duration, then returns the bus to idle.
    ///
    /// Every endpoint goes back to DATA0.
    pub fn reset_bus(&mut self) {
        if let Some(outcome) = self.abort() {
            warn!(?outcome, "transaction aborted by a bus reset");
        }
        let start = self.clock.now();
        let duration = self.config.reset_duration;
        info!(at = %start, "bus reset");
        self.link.drive(LineSymbol::SE0, start);
        self.link.drive(LineSymbol::J, start + duration);
        let recovery = self.engine.timing().inter_packet_gap;
        self.wait(duration + recovery);
        self.engine.reset();
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Finalises the transaction in progress as [`TransferError::Aborted`].
    pub fn abort(&mut self) -> Option<TransferOutcome> {
        self.abort.take();
        self.link.clear();
        self.engine.abort()
    }

    /// Starts a transaction without running it. Drive it with [`poll`](Self::poll).
    pub fn begin(
        &mut self,
        kind: TransferKind,
        endpoint: Endpoint,
        data: &[u8],
    ) -> Result<(), TransferError> {
        self.abort.take();
        self.engine
            .begin(kind, endpoint, data.to_vec(), self.clock.now())
    }

    /// Runs the engine for one step, letting simulated time pass as it asks.
    pub fn poll(&mut self) -> Option<TransferOutcome> {
        if self.abort.take() {
            return self.abort();
        }
        match self.engine.step(self.clock.now(), &mut self.link) {
            Step::Wait(duration) => {
                self.clock.wait(duration, self.link.transport_mut());
                None
            }
            Step::Done(outcome) => Some(outcome),
        }
    }

    fn run(&mut self, kind: TransferKind, endpoint: Endpoint, data: &[u8]) -> TransferOutcome {
        if let Err(err) = self.begin(kind, endpoint, data) {
            warn!(%err, "transfer rejected");
            return TransferOutcome::failed(err, 0);
        }
        loop {
            if let Some(outcome) = self.poll() {
                return outcome;
            }
        }
    }

    /// Runs a transfer to completion.
    ///
    /// OUT data larger than the max packet size goes out as one transaction per packet,
    /// stopping at the first one that does not succeed.
    pub fn do_transfer(
        &mut self,
        kind: TransferKind,
        endpoint: Endpoint,
        data: Option<&[u8]>,
    ) -> TransferOutcome {
        let data = data.unwrap_or(&[]);
        let max = self.engine.timing().max_packet_size;
        if kind == TransferKind::ControlSetup || data.len() <= max {
            return self.run(kind, endpoint, data);
        }

        let mut attempts = 0;
        for chunk in data.chunks(max) {
            let mut outcome = self.run(kind, endpoint, chunk);
            attempts += outcome.attempts;
            if !outcome.is_success() {
                outcome.attempts = attempts;
                return outcome;
            }
        }
        TransferOutcome::success(Vec::new(), attempts)
    }

    /// Sends a start of frame packet and the gap that follows it.
    pub fn send_sof(&mut self, frame: u16) -> Result<(), TransferError> {
        if self.engine.is_busy() {
            return Err(TransferError::InvalidRequest(
                "cannot send SOF during a transaction".into(),
            ));
        }
        let now = self.clock.now();
        let sof = Packet::Token(Token::Sof {
            frame: frame & 0x7FF,
        });
        let end = self
            .link
            .send(&bits::encode(&packet::serialize(&sof)), now);
        let gap = self.engine.timing().inter_packet_gap;
        self.wait(end - now + gap);
        Ok(())
    }

    /// SETUP, IN data stage until a short packet or `setup.length` bytes, then an OUT status
    /// stage. A device returning more than `setup.length` bytes fails the read.
    pub fn control_read(&mut self, address: u8, setup: &SetupPacket) -> TransferOutcome {
        if setup.direction() != Direction::In {
            return TransferOutcome::failed(
                TransferError::InvalidRequest("control read needs an IN request".into()),
                0,
            );
        }
        let ep = Endpoint::control(address);
        let mut outcome = self.run(TransferKind::ControlSetup, ep, &setup.to_bytes());
        if !outcome.is_success() {
            return outcome;
        }
        let mut attempts = outcome.attempts;

        let max = self.engine.timing().max_packet_size;
        let mut received = Vec::new();
        while received.len() < usize::from(setup.length) {
            outcome = self.run(TransferKind::ControlIn, ep, &[]);
            attempts += outcome.attempts;
            if !outcome.is_success() {
                outcome.attempts = attempts;
                return outcome;
            }
            let short = outcome.received_data.len() < max;
            received.append(&mut outcome.received_data);
            if received.len() > usize::from(setup.length) {
                return TransferOutcome {
                    status: Status::Error,
                    received_data: Vec::new(),
                    error: Some(TransferError::ProtocolViolation(format!(
                        "{} bytes returned for a {} byte request",
                        received.len(),
                        setup.length
                    ))),
                    attempts,
                };
            }
            if short {
                break;
            }
        }

        self.engine.set_toggle(ep, Pipe::Control, DataPID::Data1);
        outcome = self.run(TransferKind::ControlOut, ep, &[]);
        outcome.attempts += attempts;
        if outcome.is_success() {
            outcome.received_data = received;
        }
        outcome
    }

    /// SETUP, OUT data stage, then an IN status stage expecting an empty DATA1.
    pub fn control_write(
        &mut self,
        address: u8,
        setup: &SetupPacket,
        data: Option<&[u8]>,
    ) -> TransferOutcome {
        let data = data.unwrap_or(&[]);
        if setup.direction() != Direction::Out || usize::from(setup.length) != data.len() {
            return TransferOutcome::failed(
                TransferError::InvalidRequest(format!(
                    "control write of {} bytes announced as {}",
                    data.len(),
                    setup.length
                )),
                0,
            );
        }
        let ep = Endpoint::control(address);
        let mut outcome = self.run(TransferKind::ControlSetup, ep, &setup.to_bytes());
        if !outcome.is_success() {
            return outcome;
        }
        let mut attempts = outcome.attempts;

        let max = self.engine.timing().max_packet_size;
        for chunk in data.chunks(max) {
            outcome = self.run(TransferKind::ControlOut, ep, chunk);
            attempts += outcome.attempts;
            if !outcome.is_success() {
                outcome.attempts = attempts;
                return outcome;
            }
        }

        self.engine.set_toggle(ep, Pipe::Control, DataPID::Data1);
        outcome = self.run(TransferKind::ControlIn, ep, &[]);
        outcome.attempts += attempts;
        if outcome.is_success() && !outcome.received_data.is_empty() {
            outcome = TransferOutcome {
                status: Status::Error,
                error: Some(TransferError::ProtocolViolation(format!(
                    "status stage carried {} bytes",
                    outcome.received_data.len()
                ))),
                ..outcome
            };
        }
        outcome
    }
}
