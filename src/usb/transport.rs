//! Boundary with the simulator that owns the physical D+/D- pair.
use tracing::trace;

use super::bits::BitFrame;
use super::signal::LineSymbol;
use super::timing::{Speed, Ticks};

/// Timed access to the bus lines, implemented by the simulation driver.
pub trait LineTransport {
    /// Drives `symbol` from `at` on, until the next drive.
    fn drive(&mut self, symbol: LineSymbol, at: Ticks);
    /// Bus state at `at`, which must not be later than the simulated present.
    fn sample(&mut self, at: Ticks) -> LineSymbol;
    /// Lets `duration` of simulated time pass.
    fn advance(&mut self, duration: Ticks);
    /// Called when the bus changes bit rate.
    fn set_speed(&mut self, _speed: Speed) {}
}

impl<T: LineTransport + ?Sized> LineTransport for &mut T {
    fn drive(&mut self, symbol: LineSymbol, at: Ticks) {
        (**self).drive(symbol, at)
    }
    fn sample(&mut self, at: Ticks) -> LineSymbol {
        (**self).sample(at)
    }
    fn advance(&mut self, duration: Ticks) {
        (**self).advance(duration)
    }
    fn set_speed(&mut self, speed: Speed) {
        (**self).set_speed(speed)
    }
}

impl<T: LineTransport + ?Sized> LineTransport for Box<T> {
    fn drive(&mut self, symbol: LineSymbol, at: Ticks) {
        (**self).drive(symbol, at)
    }
    fn sample(&mut self, at: Ticks) -> LineSymbol {
        (**self).sample(at)
    }
    fn advance(&mut self, duration: Ticks) {
        (**self).advance(duration)
    }
    fn set_speed(&mut self, speed: Speed) {
        (**self).set_speed(speed)
    }
}

/// Turns per-tick samples back into one symbol per bit time.
///
/// Each run of identical samples yields a symbol at the middle of every bit time it covers,
/// counted from the edge that started it. Runs shorter than half a bit never reach a middle.
#[derive(Debug, Clone)]
pub struct SymbolRecovery {
    bit: u64,
    level: Option<LineSymbol>,
    run_start: Ticks,
    run: u64,
}

impl SymbolRecovery {
    pub fn new(bit: Ticks) -> Self {
        Self {
            bit: bit.0.max(1),
            level: None,
            run_start: Ticks::ZERO,
            run: 0,
        }
    }

    pub fn clear(&mut self) {
        self.level = None;
        self.run = 0;
    }

    /// Level of the run in progress, even when it is too short to have produced a symbol.
    pub fn pending_level(&self) -> Option<LineSymbol> {
        self.level
    }

    /// Feeds the sample taken at `at`. Returns the bit time start and symbol once one completes.
    pub fn push(&mut self, at: Ticks, s: LineSymbol) -> Option<(Ticks, LineSymbol)> {
        if self.level != Some(s) {
            self.level = Some(s);
            self.run_start = at;
            self.run = 0;
        }
        let offset = self.run;
        self.run += 1;
        if offset % self.bit == self.bit / 2 {
            Some((self.run_start + Ticks(offset - self.bit / 2), s))
        } else {
            None
        }
    }
}

/// Packet level send and sample on top of a [`LineTransport`].
pub struct LineAdapter<T> {
    transport: T,
    bit: Ticks,
    recovery: SymbolRecovery,
    sampled_until: Option<Ticks>,
}

impl<T: LineTransport> LineAdapter<T> {
    pub fn new(transport: T, speed: Speed) -> Self {
        let bit = Ticks(speed.ticks_per_bit());
        Self {
            transport,
            bit,
            recovery: SymbolRecovery::new(bit),
            sampled_until: None,
        }
    }

    /// Switches the bit time used for sending and sampling, and tells the transport.
    pub fn set_speed(&mut self, speed: Speed) {
        self.bit = Ticks(speed.ticks_per_bit());
        self.recovery = SymbolRecovery::new(self.bit);
        self.sampled_until = None;
        self.transport.set_speed(speed);
    }

    pub fn bit(&self) -> Ticks {
        self.bit
    }

    /// Drives one symbol per bit time from `start`. Returns the end of the last bit time.
    pub fn send(&mut self, frame: &BitFrame, start: Ticks) -> Ticks {
        let mut at = start;
        let mut previous = None;
        for &symbol in &frame.symbols {
            if previous != Some(symbol) {
                self.transport.drive(symbol, at);
                previous = Some(symbol);
            }
            at += self.bit;
        }
        trace!(%start, end = %at, "sent {}", frame);
        at
    }

    /// Drives a single level, e.g. SE0 for a bus reset.
    pub fn drive(&mut self, symbol: LineSymbol, at: Ticks) {
        self.transport.drive(symbol, at);
    }

    /// Samples every tick of `[start, start + window)`, with the start of each recovered bit time.
    ///
    /// A window that does not continue the previous one starts recovery afresh.
    pub fn sample_timed(&mut self, start: Ticks, window: Ticks) -> Vec<(Ticks, LineSymbol)> {
        if self.sampled_until != Some(start) {
            self.recovery.clear();
        }
        let end = start + window;
        let mut out = Vec::new();
        let mut at = start;
        while at < end {
            let s = self.transport.sample(at);
            out.extend(self.recovery.push(at, s));
            at += Ticks(1);
        }
        self.sampled_until = Some(end);
        out
    }

    pub fn sample(&mut self, start: Ticks, window: Ticks) -> Vec<LineSymbol> {
        self.sample_timed(start, window)
            .into_iter()
            .map(|(_, s)| s)
            .collect()
    }

    pub fn pending_level(&self) -> Option<LineSymbol> {
        self.recovery.pending_level()
    }

    /// Forgets any partially sampled run.
    pub fn clear(&mut self) {
        self.recovery.clear();
        self.sampled_until = None;
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }
}
