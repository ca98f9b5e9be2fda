//! Simulated time and the per-speed bus timing constants.
//!
//! Time is counted in ticks of a 48 MHz reference clock so that both bit periods are whole
//! numbers: a full-speed bit lasts 4 ticks, a low-speed bit 32. Nothing in here ever looks at
//! wall-clock time.
use std::fmt;
use std::ops::{Add, AddAssign, Mul, Sub};

use super::transport::LineTransport;

pub const TICKS_PER_SECOND: u64 = 48_000_000;

/// A point in, or a span of, simulated time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ticks(pub u64);

impl Ticks {
    pub const ZERO: Ticks = Ticks(0);

    pub fn from_micros(us: u64) -> Self {
        Ticks(us * (TICKS_PER_SECOND / 1_000_000))
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / TICKS_PER_SECOND as f64
    }

    pub fn saturating_sub(self, rhs: Ticks) -> Ticks {
        Ticks(self.0.saturating_sub(rhs.0))
    }
}

impl Add for Ticks {
    type Output = Ticks;
    fn add(self, rhs: Ticks) -> Ticks {
        Ticks(self.0 + rhs.0)
    }
}
impl AddAssign for Ticks {
    fn add_assign(&mut self, rhs: Ticks) {
        self.0 += rhs.0;
    }
}
impl Sub for Ticks {
    type Output = Ticks;
    fn sub(self, rhs: Ticks) -> Ticks {
        Ticks(self.0 - rhs.0)
    }
}
impl Mul<u64> for Ticks {
    type Output = Ticks;
    fn mul(self, rhs: u64) -> Ticks {
        Ticks(self.0 * rhs)
    }
}

impl fmt::Display for Ticks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.9}", self.as_secs_f64())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Speed {
    Low,
    Full,
}

impl Speed {
    pub fn bit_rate(self) -> u64 {
        match self {
            Speed::Low => 1_500_000,
            Speed::Full => 12_000_000,
        }
    }

    pub fn ticks_per_bit(self) -> u64 {
        TICKS_PER_SECOND / self.bit_rate()
    }

    pub fn bit_period_secs(self) -> f64 {
        1. / self.bit_rate() as f64
    }

    /// Largest control/interrupt payload a device on this bus may use.
    pub fn default_max_packet_size(self) -> usize {
        match self {
            Speed::Low => 8,
            Speed::Full => 64,
        }
    }
}

/// Protocol constants injected into a bus session.
///
/// Durations are expressed in bit times, so the same configuration works at either speed.
#[derive(Debug, Clone, PartialEq)]
pub struct BusConfig {
    pub speed: Speed,
    /// Idle time the host leaves between two packets it sends back to back.
    pub inter_packet_gap_bits: u32,
    /// How long the host waits, from the end of its packet, for the response's sync to begin.
    pub turnaround_timeout_bits: u32,
    /// Responses starting later than this are accepted but logged.
    pub expected_response_bits: f64,
    /// Bit times the receiver keeps hunting for a sync pattern once the line left idle.
    pub sync_window_bits: usize,
    /// Retransmissions allowed after a NAK before giving up.
    pub nak_retry_limit: u32,
    /// Retransmissions allowed after a missing or corrupted response.
    pub error_retry_limit: u32,
    pub reset_duration: Ticks,
    /// Overrides the speed's default max packet size.
    pub max_packet_size: Option<usize>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            speed: Speed::Full,
            inter_packet_gap_bits: 2,
            turnaround_timeout_bits: 16,
            expected_response_bits: 7.5,
            sync_window_bits: 16,
            nak_retry_limit: 3,
            error_retry_limit: 0,
            reset_duration: Ticks::from_micros(10_000),
            max_packet_size: None,
        }
    }
}

impl BusConfig {
    pub fn new(speed: Speed) -> Self {
        Self {
            speed,
            ..Self::default()
        }
    }

    pub fn with_speed(mut self, speed: Speed) -> Self {
        self.speed = speed;
        self
    }

    pub fn with_inter_packet_gap(mut self, bits: u32) -> Self {
        self.inter_packet_gap_bits = bits;
        self
    }

    pub fn with_turnaround_timeout(mut self, bits: u32) -> Self {
        self.turnaround_timeout_bits = bits;
        self
    }

    pub fn with_expected_response(mut self, bits: f64) -> Self {
        self.expected_response_bits = bits;
        self
    }

    pub fn with_sync_window(mut self, bits: usize) -> Self {
        self.sync_window_bits = bits;
        self
    }

    pub fn with_nak_retry_limit(mut self, retries: u32) -> Self {
        self.nak_retry_limit = retries;
        self
    }

    pub fn with_error_retry_limit(mut self, retries: u32) -> Self {
        self.error_retry_limit = retries;
        self
    }

    pub fn with_reset_duration(mut self, duration: Ticks) -> Self {
        self.reset_duration = duration;
        self
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = Some(size);
        self
    }

    pub fn timing(&self) -> Timing {
        let bit = Ticks(self.speed.ticks_per_bit());
        Timing {
            speed: self.speed,
            bit,
            inter_packet_gap: bit * u64::from(self.inter_packet_gap_bits),
            turnaround: bit * u64::from(self.turnaround_timeout_bits.max(1)),
            expected_response: Ticks((self.expected_response_bits * bit.0 as f64).round() as u64),
            sync_window: self.sync_window_bits.max(8),
            max_packet_size: self
                .max_packet_size
                .unwrap_or_else(|| self.speed.default_max_packet_size()),
        }
    }
}

/// [`BusConfig`] resolved against the bit period of its speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub speed: Speed,
    pub bit: Ticks,
    pub inter_packet_gap: Ticks,
    pub turnaround: Ticks,
    pub expected_response: Ticks,
    pub sync_window: usize,
    pub max_packet_size: usize,
}

impl Timing {
    pub fn bits(&self, n: u64) -> Ticks {
        self.bit * n
    }

    pub fn in_bits(&self, span: Ticks) -> f64 {
        span.0 as f64 / self.bit.0 as f64
    }
}

/// Latest simulated time at which an awaited event still counts as on time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Ticks);

impl Deadline {
    pub fn after(start: Ticks, window: Ticks) -> Self {
        Deadline(start + window)
    }

    pub fn at(&self) -> Ticks {
        self.0
    }

    pub fn expired(&self, now: Ticks) -> bool {
        now >= self.0
    }
}

/// The single suspension point of a bus session.
#[derive(Debug, Default)]
pub struct Clock {
    now: Ticks,
}

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> Ticks {
        self.now
    }

    /// Lets `duration` of simulated time pass on the transport.
    pub fn wait<T: LineTransport + ?Sized>(&mut self, duration: Ticks, transport: &mut T) {
        if duration == Ticks::ZERO {
            return;
        }
        transport.advance(duration);
        self.now += duration;
    }
}
