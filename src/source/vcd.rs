use std::collections::BTreeMap;
use std::io::Read;

use anyhow::{anyhow, Context, Result};
use vcd::{Command, IdCode, Parser, TimescaleUnit, Value, VarType};

use super::Sample;
use crate::pipeline::{Event, EventData, EventIterator, Node};
use crate::sink;

/// Turns value changes of a VCD dump into [`Sample`]s.
///
/// Wires are mapped to channels by the trailing number of their reference (`d_0`, `ch1`, ...).
/// Wires without such a number take the next free channel in declaration order.
pub struct VcdParser<T>
where
    T: Read,
{
    input: Parser<T>,
    factor: f64,
    first_ts: Option<f64>,
    current_ts: f64,
    vars: BTreeMap<IdCode, u8>,
    state: u64,
    stopped: bool,
}

impl<T> VcdParser<T>
where
    T: Read,
{
    pub fn new(input: T) -> Self {
        Self {
            input: Parser::new(input),
            factor: 1.,
            first_ts: None,
            current_ts: 0.,
            vars: BTreeMap::new(),
            state: 0,
            stopped: false,
        }
    }

    fn channel_for(&self, reference: &str) -> Result<u8> {
        let digits = reference
            .chars()
            .rev()
            .take_while(char::is_ascii_digit)
            .count();
        let channel = if digits == 0 {
            self.vars.len()
        } else {
            reference[reference.len() - digits..]
                .parse::<usize>()
                .with_context(|| format!("Invalid channel number in {}", reference))?
        };
        anyhow::ensure!(channel < 64, "Channel {} of {} is out of range", channel, reference);
        Ok(channel as u8)
    }

    fn stop(&mut self, err: anyhow::Error) -> Event {
        self.stopped = true;
        (self.current_ts, Err(err))
    }
}

impl<T> Iterator for VcdParser<T>
where
    T: Read,
{
    type Item = Event;
    fn next(&mut self) -> Option<Self::Item> {
        if self.stopped {
            return None;
        }

        let out = loop {
            match self.input.next()? {
                Ok(Command::Timescale(n, unit)) => {
                    let unit = match unit {
                        TimescaleUnit::S => 1.,
                        TimescaleUnit::MS => 0.001,
                        TimescaleUnit::US => 0.000_001,
                        TimescaleUnit::NS => 0.000_000_001,
                        TimescaleUnit::PS => 0.000_000_000_001,
                        TimescaleUnit::FS => 0.000_000_000_000_001,
                    };
                    self.factor = (n as f64) * unit;
                }
                Ok(Command::Timestamp(ts)) => {
                    let ts = (ts as f64) * self.factor;
                    let first = *self.first_ts.get_or_insert(ts);
                    let ts = ts - first;
                    if self.current_ts > ts {
                        break self.stop(anyhow!("Timestamp must be monotonic"));
                    }
                    self.current_ts = ts;
                }
                Ok(Command::ChangeScalar(id, v)) => {
                    let v = match v {
                        Value::V0 => 0,
                        Value::V1 => 1,
                        _ => break self.stop(anyhow!("Unsupported value : {:?}", v)),
                    };
                    let shift = match self.vars.get(&id) {
                        Some(shift) => *shift,
                        None => break self.stop(anyhow!("Value change for undeclared wire {:?}", id)),
                    };
                    self.state &= !(1 << shift);
                    self.state |= v << shift;
                    break (
                        self.current_ts,
                        Ok(Box::new(Sample(self.state)) as Box<dyn EventData>),
                    );
                }
                Ok(Command::VarDef(ty, _sz, id, name)) => {
                    if ty != VarType::Wire {
                        break self.stop(anyhow!("Unsupported VarType: {:?}", ty));
                    }
                    match self.channel_for(&name) {
                        Ok(channel) => {
                            self.vars.insert(id, channel);
                        }
                        Err(e) => break self.stop(e),
                    }
                }
                Ok(_) => {}
                Err(err) => break self.stop(anyhow!("{:?}", err)),
            }
        };
        Some(out)
    }
}

pub fn build(pipeline: &mut Vec<Box<dyn EventIterator>>, args: &[String]) -> Result<()> {
    use clap::Arg;
    let args = clap::SubCommand::with_name("vcd")
        .setting(clap::AppSettings::NoBinaryName)
        .args(&[Arg::with_name("file")
            .help("Value change dump holding the D+ and D- wires.")
            .required(true)])
        .arg(sink::verbose_arg())
        .get_matches_from(args);

    let path = args.value_of("file").context("Fetching file argument")?;
    let file = std::fs::File::open(path).with_context(|| format!("Opening {}", path))?;
    let node = Node::<_, Sample>::new(VcdParser::new(file));
    sink::push(pipeline, node, args.is_present("verbose"));
    Ok(())
}
