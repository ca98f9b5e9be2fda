//! Dynamically chained decoding stages used by the trace decoder.
//!
//! Every stage is an iterator of timestamped, type-erased events. A stage checks the event type
//! produced by the stage before it and downcasts on the fly.
use std::any::{Any, TypeId};
use std::fmt::Debug;
use std::marker::PhantomData;

use anyhow::{anyhow, Result};

pub trait EventData: Debug + Any {
    fn as_debug(&self) -> &dyn Debug;
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}
impl<T: Debug + Any> EventData for T {
    fn as_debug(&self) -> &dyn Debug {
        self
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

pub fn downcast<T: 'static>(event: Box<dyn EventData>) -> Result<T> {
    let name = event.type_name();
    event
        .into_any()
        .downcast::<T>()
        .map(|boxed| *boxed)
        .map_err(|_| {
            anyhow!(
                "Unexpected event type {} while expecting {}",
                name,
                std::any::type_name::<T>()
            )
        })
}

pub fn downcast_ref<T: 'static>(event: &dyn EventData) -> Result<&T> {
    let name = event.type_name();
    event.as_any().downcast_ref().ok_or_else(|| {
        anyhow!(
            "Unexpected event type {} while expecting {}",
            name,
            std::any::type_name::<T>()
        )
    })
}

/// Timestamp in seconds since the start of the capture, and the decoded event.
pub type Event = (f64, Result<Box<dyn EventData>>);

pub trait EventIterator: Iterator<Item = Event> {
    fn into_iterator(self: Box<Self>) -> Box<dyn Iterator<Item = Event>>;
    fn event_type(&self) -> TypeId;
    fn event_type_name(&self) -> &'static str;
}

/// Wraps a stage's iterator and tags it with the type of event it yields.
pub struct Node<I, T> {
    it: I,
    _produces: PhantomData<fn() -> T>,
}

impl<I, T> Node<I, T> {
    pub fn new(it: I) -> Self {
        Self {
            it,
            _produces: PhantomData,
        }
    }
}

impl<I: Iterator<Item = Event>, T> Iterator for Node<I, T> {
    type Item = Event;
    fn next(&mut self) -> Option<Self::Item> {
        self.it.next()
    }
}

impl<I: 'static + Iterator<Item = Event>, T: 'static> EventIterator for Node<I, T> {
    fn into_iterator(self: Box<Self>) -> Box<dyn Iterator<Item = Event>> {
        self
    }
    fn event_type(&self) -> TypeId {
        TypeId::of::<T>()
    }
    fn event_type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// Pops the last stage, first letting `fill` insert the stage producing `T` when the tail of the
/// pipeline produces something else.
pub fn take_input<T: 'static>(
    pipeline: &mut Vec<Box<dyn EventIterator>>,
    stage: &str,
    fill: impl FnOnce(&mut Vec<Box<dyn EventIterator>>) -> Result<()>,
) -> Result<Box<dyn Iterator<Item = Event>>> {
    if pipeline
        .last()
        .map(|node| node.event_type() != TypeId::of::<T>())
        .unwrap_or(false)
    {
        fill(pipeline)?;
    }

    match pipeline.pop() {
        None => Err(anyhow!("Missing source for {}", stage)),
        Some(node) if node.event_type() != TypeId::of::<T>() => Err(anyhow!(
            "{} expects {} but got {}",
            stage,
            std::any::type_name::<T>(),
            node.event_type_name()
        )),
        Some(node) => Ok(node.into_iterator()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Marker(u8);

    #[test]
    fn downcast_reports_the_wrong_type() {
        let event: Box<dyn EventData> = Box::new(Marker(3));
        assert!(downcast_ref::<u32>(event.as_ref()).is_err());
        assert_eq!(downcast::<Marker>(event).unwrap(), Marker(3));
    }

    #[test]
    fn take_input_inserts_missing_stage() {
        let mut pipeline: Vec<Box<dyn EventIterator>> = vec![Box::new(Node::<_, u8>::new(
            std::iter::once((0., Ok(Box::new(1u8) as Box<dyn EventData>))),
        ))];
        let mut it = take_input::<u16>(&mut pipeline, "test", |pipeline| {
            let input = pipeline.pop().unwrap().into_iterator();
            let mapped = input.map(|(ts, ev)| {
                let ev = ev.and_then(downcast::<u8>);
                (ts, ev.map(|v| Box::new(u16::from(v) * 2) as Box<dyn EventData>))
            });
            pipeline.push(Box::new(Node::<_, u16>::new(mapped)));
            Ok(())
        })
        .unwrap();
        let (_, ev) = it.next().unwrap();
        assert_eq!(downcast::<u16>(ev.unwrap()).unwrap(), 2);
    }
}
