use std::convert::TryFrom;
use std::fmt;

use anyhow::Result;
use clap::{value_t, Arg, ArgMatches, SubCommand};

use super::timing::Speed;
use crate::pipeline::{self, Event, EventData, EventIterator, Node};
use crate::sink;
use crate::source::Sample;

/// Differential state of the bus during one bit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LineSymbol {
    SE0,
    J,
    K,
    SE1,
}

impl LineSymbol {
    /// Decodes the (D+, D-) levels. J and K swap polarity between low and full speed.
    pub fn from_lines(dp: bool, dm: bool, speed: Speed) -> Self {
        let fs = speed == Speed::Full;
        match (dp, dm, fs) {
            (true, true, _) => LineSymbol::SE1,
            (true, false, true) | (false, true, false) => LineSymbol::J,
            (true, false, false) | (false, true, true) => LineSymbol::K,
            (false, false, _) => LineSymbol::SE0,
        }
    }

    /// (D+, D-) levels to drive for this symbol.
    pub fn to_lines(self, speed: Speed) -> (bool, bool) {
        let fs = speed == Speed::Full;
        match self {
            LineSymbol::SE0 => (false, false),
            LineSymbol::SE1 => (true, true),
            LineSymbol::J => (fs, !fs),
            LineSymbol::K => (!fs, fs),
        }
    }

    /// The other differential level; single-ended states are returned as is.
    pub fn toggled(self) -> Self {
        match self {
            LineSymbol::J => LineSymbol::K,
            LineSymbol::K => LineSymbol::J,
            s => s,
        }
    }

    pub fn is_differential(self) -> bool {
        matches!(self, LineSymbol::J | LineSymbol::K)
    }

    pub fn as_char(self) -> char {
        match self {
            LineSymbol::J => 'J',
            LineSymbol::K => 'K',
            LineSymbol::SE0 => '_',
            LineSymbol::SE1 => 'E',
        }
    }
}

impl TryFrom<char> for LineSymbol {
    type Error = anyhow::Error;
    fn try_from(c: char) -> Result<Self> {
        Ok(match c {
            'J' | 'j' => LineSymbol::J,
            'K' | 'k' => LineSymbol::K,
            '_' => LineSymbol::SE0,
            'E' => LineSymbol::SE1,
            _ => anyhow::bail!("Unknown line symbol {:?}", c),
        })
    }
}

impl fmt::Display for LineSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// Renders symbols the way bus traces are usually written, e.g. `KJKJKJKK__J`.
pub fn to_line_string(symbols: &[LineSymbol]) -> String {
    symbols.iter().map(|s| s.as_char()).collect()
}

/// Parses a `KJKJKJKK__J` style trace. Blanks are ignored.
pub fn from_line_string(line: &str) -> Result<Vec<LineSymbol>> {
    line.chars()
        .filter(|c| !c.is_whitespace())
        .map(LineSymbol::try_from)
        .collect()
}

/// Reduces raw samples to the bus state changes on the D+/D- pair.
pub struct SignalIterator<T> {
    it: T,
    speed: Speed,
    dp: u8,
    dm: u8,

    current_signal: Option<LineSymbol>,
}

impl<T> Iterator for SignalIterator<T>
where
    T: Iterator<Item = Event>,
{
    type Item = Event;
    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (ts, smp) = self.it.next()?;
            let smp = match smp.and_then(pipeline::downcast::<Sample>) {
                Ok(smp) => smp,
                Err(e) => return Some((ts, Err(e))),
            };

            let s = LineSymbol::from_lines(smp.level(self.dp), smp.level(self.dm), self.speed);
            if self.current_signal != Some(s) {
                self.current_signal = Some(s);
                return Some((ts, Ok(Box::new(s) as Box<dyn EventData>)));
            }
        }
    }
}

impl<T> SignalIterator<T> {
    pub fn new(input: T, speed: Speed, dp: u8, dm: u8) -> Self {
        Self {
            it: input,
            speed,
            dp,
            dm,
            current_signal: None,
        }
    }
}

pub fn args() -> [Arg<'static, 'static>; 3] {
    [
        Arg::from_usage("--dp [dp] 'Channel used for the d+ pin'").default_value("0"),
        Arg::from_usage("--dm [dm] 'Channel used for the d- pin'").default_value("1"),
        Arg::from_usage("--fs 'Indicates that the device is full-speed USB'"),
    ]
}

pub fn speed_of(matches: &ArgMatches<'_>) -> Speed {
    if matches.is_present("fs") {
        Speed::Full
    } else {
        Speed::Low
    }
}

pub fn build(pipeline: &mut Vec<Box<dyn EventIterator>>, args: &[String]) -> Result<()> {
    let matches = SubCommand::with_name("usb::signal")
        .setting(clap::AppSettings::NoBinaryName)
        .args(&self::args())
        .arg(sink::verbose_arg())
        .get_matches_from(args);

    let dp = value_t!(matches, "dp", u8).unwrap_or_else(|e| e.exit());
    let dm = value_t!(matches, "dm", u8).unwrap_or_else(|e| e.exit());
    let input = pipeline::take_input::<Sample>(pipeline, "usb::signal", |_| {
        anyhow::bail!("usb::signal needs a sample source such as vcd")
    })?;
    let it = SignalIterator::new(input, speed_of(&matches), dp, dm);
    sink::push(pipeline, Node::<_, LineSymbol>::new(it), matches.is_present("verbose"));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn polarity_flips_with_speed() {
        assert_eq!(LineSymbol::from_lines(true, false, Speed::Full), LineSymbol::J);
        assert_eq!(LineSymbol::from_lines(true, false, Speed::Low), LineSymbol::K);
        for speed in [Speed::Low, Speed::Full].iter().copied() {
            for s in [LineSymbol::J, LineSymbol::K, LineSymbol::SE0, LineSymbol::SE1]
                .iter()
                .copied()
            {
                let (dp, dm) = s.to_lines(speed);
                assert_eq!(LineSymbol::from_lines(dp, dm, speed), s);
            }
        }
    }

    #[test]
    fn stage_parses_its_flags_before_looking_for_a_source() {
        let mut pipeline = Vec::new();
        let args: Vec<String> = vec!["--dp=2".into(), "--dm=3".into(), "--fs".into()];
        let err = build(&mut pipeline, &args).unwrap_err();
        assert_eq!(err.to_string(), "Missing source for usb::signal");
        assert!(pipeline.is_empty());
    }

    #[test]
    fn line_strings() {
        let symbols = from_line_string("KJ _E").unwrap();
        assert_eq!(
            symbols,
            vec![LineSymbol::K, LineSymbol::J, LineSymbol::SE0, LineSymbol::SE1]
        );
        assert_eq!(to_line_string(&symbols), "KJ_E");
        assert!(from_line_string("KX").is_err());
    }

    #[test]
    fn only_changes_are_reported() {
        let samples = vec![0b01u64, 0b01, 0b10, 0b00, 0b00, 0b01]
            .into_iter()
            .enumerate()
            .map(|(i, s)| (i as f64, Ok(Box::new(Sample(s)) as Box<dyn EventData>)));
        let changes: Vec<_> = SignalIterator::new(samples, Speed::Full, 0, 1)
            .map(|(ts, ev)| (ts, pipeline::downcast::<LineSymbol>(ev.unwrap()).unwrap()))
            .collect();
        assert_eq!(
            changes,
            vec![
                (0., LineSymbol::J),
                (2., LineSymbol::K),
                (3., LineSymbol::SE0),
                (5., LineSymbol::J)
            ]
        );
    }
}
