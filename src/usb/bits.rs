//! Line coding of a packet: sync field, bit stuffing, NRZI and end of packet.
//!
//! Bits travel LSB first. The sync field is never stuffed, and does not count towards the
//! run of ones that triggers a stuff bit.
use std::fmt;

use super::error::{DecodeError, FramingError};
use super::signal::{self, LineSymbol};
use super::timing::Ticks;

pub type Bit = bool;

/// Sync field, seven zeros and a one.
pub const SYNC_BITS: [Bit; 8] = [false, false, false, false, false, false, false, true];
/// Sync field as it appears on the line after idle.
pub const SYNC_SYMBOLS: [LineSymbol; 8] = [
    LineSymbol::K,
    LineSymbol::J,
    LineSymbol::K,
    LineSymbol::J,
    LineSymbol::K,
    LineSymbol::J,
    LineSymbol::K,
    LineSymbol::K,
];
pub const EOP_SYMBOLS: [LineSymbol; 3] = [LineSymbol::SE0, LineSymbol::SE0, LineSymbol::J];
/// A zero is forced onto the line after this many consecutive ones.
pub const MAX_ONES: usize = 6;
pub const DEFAULT_SYNC_WINDOW: usize = 16;

/// One packet as driven on the line, one symbol per bit time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BitFrame {
    pub symbols: Vec<LineSymbol>,
}

impl BitFrame {
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn duration(&self, bit: Ticks) -> Ticks {
        bit * self.symbols.len() as u64
    }
}

impl From<Vec<LineSymbol>> for BitFrame {
    fn from(symbols: Vec<LineSymbol>) -> Self {
        Self { symbols }
    }
}

impl fmt::Display for BitFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&signal::to_line_string(&self.symbols))
    }
}

pub fn stuff(bits: &[Bit]) -> Vec<Bit> {
    let mut out = Vec::with_capacity(bits.len() + bits.len() / MAX_ONES);
    let mut ones = 0;
    for &bit in bits {
        out.push(bit);
        ones = if bit { ones + 1 } else { 0 };
        if ones == MAX_ONES {
            out.push(false);
            ones = 0;
        }
    }
    out
}

pub fn destuff(bits: &[Bit]) -> Result<Vec<Bit>, FramingError> {
    let mut out = Vec::with_capacity(bits.len());
    let mut ones = 0;
    let mut it = bits.iter().copied().enumerate();
    while let Some((_, bit)) = it.next() {
        out.push(bit);
        if !bit {
            ones = 0;
            continue;
        }
        ones += 1;
        if ones == MAX_ONES {
            ones = 0;
            match it.next() {
                Some((_, false)) => {}
                Some((position, true)) => return Err(FramingError::MissingStuffBit { position }),
                None => {
                    return Err(FramingError::MissingStuffBit {
                        position: bits.len(),
                    })
                }
            }
        }
    }
    Ok(out)
}

/// Holds the level on a one, toggles it on a zero. `from` is the level before the first bit.
pub fn nrzi_encode(bits: &[Bit], from: LineSymbol) -> Vec<LineSymbol> {
    let mut level = from;
    bits.iter()
        .map(|&bit| {
            if !bit {
                level = level.toggled();
            }
            level
        })
        .collect()
}

pub fn nrzi_decode(symbols: &[LineSymbol], from: LineSymbol) -> Result<Vec<Bit>, FramingError> {
    let mut prev = from;
    symbols
        .iter()
        .enumerate()
        .map(|(position, &s)| match s {
            LineSymbol::SE0 => Err(FramingError::UnexpectedSe0 { position }),
            LineSymbol::SE1 => Err(FramingError::Se1),
            _ => {
                let bit = s == prev;
                prev = s;
                Ok(bit)
            }
        })
        .collect()
}

/// Line codes a serialized packet, `bits` starting with the sync field, and closes it with an
/// end of packet.
pub fn encode(bits: &[Bit]) -> BitFrame {
    let (sync, body) = bits.split_at(bits.len().min(SYNC_BITS.len()));
    debug_assert_eq!(sync, &SYNC_BITS[..sync.len()]);

    let mut coded = sync.to_vec();
    coded.extend(stuff(body));
    let mut symbols = nrzi_encode(&coded, LineSymbol::J);
    symbols.extend_from_slice(&EOP_SYMBOLS);
    BitFrame { symbols }
}

/// Recovers the bits of the first packet found in `symbols`, sync field included.
pub fn decode(symbols: &[LineSymbol]) -> Result<Vec<Bit>, DecodeError> {
    let mut rx = Receiver::new(DEFAULT_SYNC_WINDOW, usize::MAX);
    for &s in symbols {
        if let RxEvent::Frame(frame) = rx.push(s) {
            return frame;
        }
    }
    if rx.is_active() {
        Err(FramingError::Truncated.into())
    } else {
        Err(DecodeError::NoSync {
            window: DEFAULT_SYNC_WINDOW,
        })
    }
}

#[derive(Debug, PartialEq)]
pub enum RxEvent {
    /// The line is idle.
    Idle,
    /// The line just left idle.
    Started,
    /// A packet is being received.
    Busy,
    Frame(Result<Vec<Bit>, DecodeError>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxState {
    Idle,
    Hunting,
    Receiving,
    Eop(u8),
}

/// Incremental decoder fed one symbol per bit time.
#[derive(Debug, Clone)]
pub struct Receiver {
    state: RxState,
    window: Vec<LineSymbol>,
    hunted: usize,
    symbols: Vec<LineSymbol>,
    /// Consecutive J symbols at the end of `symbols`.
    idle_run: usize,
    sync_window: usize,
    max_symbols: usize,
}

impl Receiver {
    pub fn new(sync_window: usize, max_symbols: usize) -> Self {
        Self {
            state: RxState::Idle,
            window: Vec::with_capacity(SYNC_SYMBOLS.len()),
            hunted: 0,
            symbols: Vec::new(),
            idle_run: 0,
            sync_window,
            max_symbols,
        }
    }

    /// Sized for packets carrying at most `max_payload` bytes, worst case stuffing included.
    pub fn for_payload(sync_window: usize, max_payload: usize) -> Self {
        let raw = (max_payload + 3) * 8;
        Self::new(sync_window, raw + raw / MAX_ONES + 1)
    }

    pub fn is_active(&self) -> bool {
        self.state != RxState::Idle
    }

    pub fn reset(&mut self) {
        self.state = RxState::Idle;
        self.window.clear();
        self.hunted = 0;
        self.symbols.clear();
        self.idle_run = 0;
    }

    fn fail(&mut self, err: impl Into<DecodeError>) -> RxEvent {
        self.reset();
        RxEvent::Frame(Err(err.into()))
    }

    pub fn push(&mut self, s: LineSymbol) -> RxEvent {
        match self.state {
            RxState::Idle => {
                if s != LineSymbol::K {
                    return RxEvent::Idle;
                }
                self.state = RxState::Hunting;
                self.window.clear();
                self.window.push(s);
                self.hunted = 1;
                RxEvent::Started
            }
            RxState::Hunting => {
                if self.window.len() == SYNC_SYMBOLS.len() {
                    self.window.remove(0);
                }
                self.window.push(s);
                self.hunted += 1;
                if self.window[..] == SYNC_SYMBOLS[..] {
                    self.state = RxState::Receiving;
                    self.symbols.clear();
                    RxEvent::Busy
                } else if !s.is_differential() || self.hunted >= self.sync_window {
                    let window = self.sync_window;
                    self.fail(DecodeError::NoSync { window })
                } else {
                    RxEvent::Busy
                }
            }
            RxState::Receiving => match s {
                LineSymbol::J | LineSymbol::K => {
                    self.symbols.push(s);
                    self.idle_run = if s == LineSymbol::J {
                        self.idle_run + 1
                    } else {
                        0
                    };
                    // Stuffing bounds a run of equal symbols to MAX_ONES + 1. A longer run of
                    // J means the transmitter let go of the line.
                    if self.idle_run > MAX_ONES + 1 {
                        self.fail(FramingError::Truncated)
                    } else if self.symbols.len() > self.max_symbols {
                        let max_bits = self.max_symbols;
                        self.fail(FramingError::TooLong { max_bits })
                    } else {
                        RxEvent::Busy
                    }
                }
                LineSymbol::SE0 => {
                    self.state = RxState::Eop(1);
                    RxEvent::Busy
                }
                LineSymbol::SE1 => self.fail(FramingError::Se1),
            },
            RxState::Eop(1) if s == LineSymbol::SE0 => {
                self.state = RxState::Eop(2);
                RxEvent::Busy
            }
            RxState::Eop(2) if s == LineSymbol::J => {
                let frame = self.finish();
                self.reset();
                RxEvent::Frame(frame)
            }
            RxState::Eop(_) => self.fail(FramingError::BadEop),
        }
    }

    fn finish(&self) -> Result<Vec<Bit>, DecodeError> {
        let last_sync = SYNC_SYMBOLS[SYNC_SYMBOLS.len() - 1];
        let bits = destuff(&nrzi_decode(&self.symbols, last_sync)?)?;
        let mut out = SYNC_BITS.to_vec();
        out.extend(bits);
        Ok(out)
    }
}
