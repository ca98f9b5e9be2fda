use std::any::TypeId;

use clap::Arg;
use colored::*;

use crate::pipeline::{Event, EventIterator};

/// Prints every event passing through, then forwards it unchanged.
pub struct PrintSink<T>(T);

impl<T: EventIterator> Iterator for PrintSink<T> {
    type Item = Event;
    fn next(&mut self) -> Option<Self::Item> {
        let (ts, res) = self.0.next()?;
        let stamp = format!("{:.9}", ts);
        match &res {
            Ok(event) => println!("{}: {:?}", stamp.dimmed(), event.as_debug()),
            Err(e) => println!("{}: {} {:#}", stamp.dimmed(), "Error".red().bold(), e),
        }
        Some((ts, res))
    }
}

impl<T: 'static + EventIterator> EventIterator for PrintSink<T> {
    fn into_iterator(self: Box<Self>) -> Box<dyn Iterator<Item = Event>> {
        self
    }
    fn event_type(&self) -> TypeId {
        self.0.event_type()
    }
    fn event_type_name(&self) -> &'static str {
        self.0.event_type_name()
    }
}

pub fn verbose_arg() -> Arg<'static, 'static> {
    Arg::from_usage("-v, --verbose 'set to print events to stdout.'")
}

/// Appends a stage, behind a [`PrintSink`] when `verbose`.
pub fn push<T: 'static + EventIterator>(
    pipeline: &mut Vec<Box<dyn EventIterator>>,
    stage: T,
    verbose: bool,
) {
    if verbose {
        pipeline.push(Box::new(PrintSink(stage)));
    } else {
        pipeline.push(Box::new(stage));
    }
}
