use std::collections::VecDeque;

use anyhow::{anyhow, Result};
use clap::SubCommand;

use super::packet::{self, BusEvent, Packet};
use super::types::{Data, HandShake, Special, Token};
use crate::pipeline::{self, Event as PipeEvent, EventData, EventIterator, Node};
use crate::sink;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Reset,
    Sof(u16),
    Transaction(Transaction),
    Ping {
        address: u8,
        endpoint: u8,
        handshake: HandShake,
    },
    Pre,
}

#[derive(PartialEq, Debug, Clone)]
pub enum TransactionState {
    Idle,
    Token(Token),
    Data { token: Token, data: Data },
    Ping { address: u8, endpoint: u8 },
}

/// A token and whatever followed it. Isochronous transactions have no handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub token: Token,
    pub data: Option<Data>,
    pub handshake: Option<HandShake>,
}

/// Groups packets seen on the bus into transactions.
#[derive(Debug)]
pub struct TransactionMonitor {
    state: TransactionState,
}

impl Default for TransactionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionMonitor {
    pub fn new() -> Self {
        Self {
            state: TransactionState::Idle,
        }
    }

    pub fn state(&self) -> &TransactionState {
        &self.state
    }

    /// Emits the transaction left open by a token that got data but no handshake.
    fn flush(&mut self, out: &mut Vec<Result<Event>>) {
        match std::mem::replace(&mut self.state, TransactionState::Idle) {
            TransactionState::Idle => {}
            TransactionState::Data { token, data } => {
                out.push(Ok(Event::Transaction(Transaction {
                    token,
                    data: Some(data),
                    handshake: None,
                })))
            }
            TransactionState::Token(token) => {
                out.push(Err(anyhow!("No response to {:?}", token)))
            }
            TransactionState::Ping { address, endpoint } => out.push(Err(anyhow!(
                "No response to PING({}.{})",
                address,
                endpoint
            ))),
        }
    }

    pub fn push(&mut self, event: BusEvent) -> Vec<Result<Event>> {
        let mut out = Vec::new();
        let packet = match event {
            BusEvent::Reset => {
                self.state = TransactionState::Idle;
                out.push(Ok(Event::Reset));
                return out;
            }
            BusEvent::Packet(packet) => packet,
        };

        match packet {
            Packet::Token(Token::Sof { frame }) => {
                self.flush(&mut out);
                out.push(Ok(Event::Sof(frame)));
            }
            Packet::Token(token) => {
                self.flush(&mut out);
                self.state = TransactionState::Token(token);
            }
            Packet::Special(Special::Pre) => out.push(Ok(Event::Pre)),
            Packet::Special(Special::Ping { address, endpoint }) => {
                self.flush(&mut out);
                self.state = TransactionState::Ping { address, endpoint };
            }
            Packet::Data(data) => match std::mem::replace(&mut self.state, TransactionState::Idle) {
                TransactionState::Token(token) => {
                    self.state = TransactionState::Data { token, data };
                }
                _ => out.push(Err(anyhow!("Unexpected data packet"))),
            },
            Packet::HandShake(handshake) => {
                match std::mem::replace(&mut self.state, TransactionState::Idle) {
                    TransactionState::Token(token) => {
                        out.push(Ok(Event::Transaction(Transaction {
                            token,
                            data: None,
                            handshake: Some(handshake),
                        })))
                    }
                    TransactionState::Data { token, data } => {
                        out.push(Ok(Event::Transaction(Transaction {
                            token,
                            data: Some(data),
                            handshake: Some(handshake),
                        })))
                    }
                    TransactionState::Ping { address, endpoint } => out.push(Ok(Event::Ping {
                        address,
                        endpoint,
                        handshake,
                    })),
                    TransactionState::Idle => {
                        out.push(Err(anyhow!("Unexpected handshake packet")))
                    }
                }
            }
        }
        out
    }
}

pub struct ProtocolIterator<T> {
    it: T,
    monitor: TransactionMonitor,
    queue: VecDeque<PipeEvent>,
}

impl<T> Iterator for ProtocolIterator<T>
where
    T: Iterator<Item = PipeEvent>,
{
    type Item = PipeEvent;
    fn next(&mut self) -> Option<Self::Item> {
        while self.queue.is_empty() {
            let (ts, event) = match self.it.next()? {
                (ts, Ok(ev)) => (ts, ev),
                (ts, Err(e)) => return Some((ts, Err(e))),
            };
            let event = match pipeline::downcast::<BusEvent>(event) {
                Ok(event) => event,
                Err(e) => return Some((ts, Err(e))),
            };
            for res in self.monitor.push(event) {
                self.queue
                    .push_back((ts, res.map(|ev| Box::new(ev) as Box<dyn EventData>)));
            }
        }
        self.queue.pop_front()
    }
}

impl<T> ProtocolIterator<T>
where
    T: Iterator<Item = PipeEvent>,
{
    pub fn new(input: T) -> Self {
        Self {
            it: input,
            monitor: TransactionMonitor::new(),
            queue: VecDeque::new(),
        }
    }
}

pub fn build(pipeline: &mut Vec<Box<dyn EventIterator>>, args: &[String]) -> Result<()> {
    let matches = SubCommand::with_name("usb::protocol")
        .setting(clap::AppSettings::NoBinaryName)
        .args(&super::signal::args())
        .arg(sink::verbose_arg())
        .get_matches_from(args);

    let mut forwarded: Vec<String> = ["dp", "dm"]
        .iter()
        .filter_map(|name| matches.value_of(name).map(|v| format!("--{}={}", name, v)))
        .collect();
    if matches.is_present("fs") {
        forwarded.push("--fs".into());
    }
    let input = pipeline::take_input::<BusEvent>(pipeline, "usb::protocol", |pipeline| {
        packet::build(pipeline, &forwarded)
    })?;
    sink::push(
        pipeline,
        Node::<_, Event>::new(ProtocolIterator::new(input)),
        matches.is_present("verbose"),
    );
    Ok(())
}
