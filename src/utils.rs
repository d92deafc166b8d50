//! Utility components: a generated-data source and a counting sink.
//! Handy for wiring up graphs in tests and examples without a real
//! trace behind them.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::debug;

use crate::error::Error;
use crate::graph::component::{Params, PortSpec, Sink, SinkStatus, Source};
use crate::graph::graph::ConsumeContext;
use crate::graph::iterator::{IteratorContext, IteratorStatus, NotificationIterator};
use crate::graph::notification::{Notification, NotificationKind};
use crate::ir::event::Event;
use crate::ir::event_class::EventClass;
use crate::ir::field::Field;
use crate::ir::field_class::{ByteOrder, FieldClass};
use crate::ir::packet::PreviousPacketAvailability;
use crate::ir::stream::Stream;
use crate::ir::stream_class::StreamClass;
use crate::ir::trace::Trace;

/// Emits one generated stream: stream-begin, one packet holding a
/// configurable number of events, packet-end, stream-end.
pub struct SyntheticSource {
    event_count: usize,
    trace: Rc<Trace>,
    event_class: Rc<EventClass>,
}

impl SyntheticSource {
    pub fn new(event_count: usize) -> Result<Self, Error> {
        let trace = Trace::new();
        let sc = StreamClass::new(0);

        let payload = FieldClass::structure();
        let ps = payload
            .as_structure()
            .ok_or_else(|| Error::Component("payload root is not a structure".into()))?;
        ps.add_member(
            "seq",
            FieldClass::unsigned_integer(64, ByteOrder::LittleEndian),
        )?;
        ps.add_member("label", FieldClass::string())?;
        ps.add_member(
            "flags",
            FieldClass::unsigned_integer(32, ByteOrder::LittleEndian),
        )?;

        let event_class = EventClass::new(0, "synthetic");
        event_class.set_payload_field_class(payload)?;
        sc.add_event_class(event_class.clone())?;
        trace.add_stream_class(sc)?;

        Ok(Self {
            event_count,
            trace,
            event_class,
        })
    }
}

impl Source for SyntheticSource {
    fn initialize(&mut self, _params: &Params, ports: &mut PortSpec) -> Result<(), Error> {
        ports.add_output_port("out");
        Ok(())
    }

    fn create_notification_iterator(
        &mut self,
        _port: &str,
    ) -> Result<Box<dyn NotificationIterator>, Error> {
        let sc = self
            .trace
            .stream_class_by_index(0)
            .ok_or_else(|| Error::Component("the synthetic trace has no stream class".into()))?;
        let stream = match self.trace.stream_by_id(0, 0) {
            Some(s) => s,
            None => self.trace.create_stream(sc, 0)?,
        };
        debug!(events = self.event_count, "created synthetic iterator");
        Ok(Box::new(SyntheticIterator {
            stream,
            event_class: self.event_class.clone(),
            event_count: self.event_count,
            packet: None,
            state: SyntheticState::StreamBegin,
        }))
    }
}

enum SyntheticState {
    StreamBegin,
    PacketBegin,
    Event(usize),
    PacketEnd,
    StreamEnd,
    Done,
}

struct SyntheticIterator {
    stream: Rc<Stream>,
    event_class: Rc<EventClass>,
    event_count: usize,
    packet: Option<Rc<crate::ir::packet::Packet>>,
    state: SyntheticState,
}

impl SyntheticIterator {
    fn missing(what: &str) -> Error {
        Error::Component(format!("synthetic payload shape mismatch: {what}"))
    }

    fn emit(&mut self, ctx: &mut IteratorContext<'_>) -> Result<Option<Rc<Notification>>, Error> {
        let notif = match self.state {
            SyntheticState::StreamBegin => {
                self.state = SyntheticState::PacketBegin;
                Some(Notification::stream_begin(self.stream.clone(), None))
            }
            SyntheticState::PacketBegin => {
                let p = self
                    .stream
                    .create_packet(PreviousPacketAvailability::NotAvailable, None);
                self.packet = Some(p.clone());
                self.state = if self.event_count > 0 {
                    SyntheticState::Event(0)
                } else {
                    SyntheticState::PacketEnd
                };
                Some(ctx.notification_pools().create_packet_begin_notification(p, None))
            }
            SyntheticState::Event(seq) => {
                let p = self
                    .packet
                    .clone()
                    .ok_or_else(|| Self::missing("no packet was begun"))?;
                let mut event = Event::new(self.event_class.clone(), p);
                let mut payload = Field::new(
                    self.event_class
                        .payload_field_class()
                        .ok_or_else(|| Self::missing("no payload class"))?,
                );
                payload
                    .child_at_mut(0)
                    .ok_or_else(|| Self::missing("no seq member"))?
                    .set_unsigned(seq as u64)?;
                let label = payload
                    .child_at_mut(1)
                    .ok_or_else(|| Self::missing("no label member"))?;
                label.string_clear()?;
                label.string_append("synthetic")?;
                payload
                    .child_at_mut(2)
                    .ok_or_else(|| Self::missing("no flags member"))?
                    .set_unsigned(0xC0FFEE)?;
                event.move_payload(payload);

                self.state = if seq + 1 < self.event_count {
                    SyntheticState::Event(seq + 1)
                } else {
                    SyntheticState::PacketEnd
                };
                Some(ctx.notification_pools().create_event_notification(event))
            }
            SyntheticState::PacketEnd => {
                let p = self
                    .packet
                    .take()
                    .ok_or_else(|| Self::missing("no packet was begun"))?;
                self.state = SyntheticState::StreamEnd;
                Some(ctx.notification_pools().create_packet_end_notification(p, None))
            }
            SyntheticState::StreamEnd => {
                self.state = SyntheticState::Done;
                Some(Notification::stream_end(self.stream.clone(), None))
            }
            SyntheticState::Done => None,
        };
        Ok(notif)
    }
}

impl NotificationIterator for SyntheticIterator {
    fn next(
        &mut self,
        ctx: &mut IteratorContext<'_>,
        batch: &mut Vec<Rc<Notification>>,
        capacity: usize,
    ) -> Result<IteratorStatus, Error> {
        while batch.len() < capacity {
            match self.emit(ctx)? {
                Some(n) => batch.push(n),
                None => {
                    return Ok(if batch.is_empty() {
                        IteratorStatus::End
                    } else {
                        IteratorStatus::Ok
                    });
                }
            }
        }
        Ok(IteratorStatus::Ok)
    }
}

/// Per-kind notification counters, shared with the embedding test or
/// application.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NotificationCounts {
    pub stream_begin: usize,
    pub packet_begin: usize,
    pub events: usize,
    pub packet_end: usize,
    pub stream_end: usize,
}

impl NotificationCounts {
    pub fn total(&self) -> usize {
        self.stream_begin + self.packet_begin + self.events + self.packet_end + self.stream_end
    }
}

/// Pulls everything from its single input port and counts what it saw.
pub struct CountingSink {
    counts: Rc<RefCell<NotificationCounts>>,
    batch_capacity: usize,
    batch: Vec<Rc<Notification>>,
}

impl CountingSink {
    pub fn new(batch_capacity: usize) -> (Self, Rc<RefCell<NotificationCounts>>) {
        let counts = Rc::new(RefCell::new(NotificationCounts::default()));
        (
            Self {
                counts: counts.clone(),
                batch_capacity,
                batch: Vec::new(),
            },
            counts,
        )
    }
}

impl Sink for CountingSink {
    fn initialize(&mut self, _params: &Params, ports: &mut PortSpec) -> Result<(), Error> {
        ports.add_input_port("in");
        Ok(())
    }

    fn consume(&mut self, ctx: &mut ConsumeContext<'_>) -> Result<SinkStatus, Error> {
        let mut batch = std::mem::take(&mut self.batch);
        let status = ctx.notification_iterator_next(0, &mut batch, self.batch_capacity)?;
        for notif in batch.iter() {
            let mut counts = self.counts.borrow_mut();
            match notif.kind() {
                NotificationKind::StreamBegin => counts.stream_begin += 1,
                NotificationKind::PacketBegin => counts.packet_begin += 1,
                NotificationKind::Event => counts.events += 1,
                NotificationKind::PacketEnd => counts.packet_end += 1,
                NotificationKind::StreamEnd => counts.stream_end += 1,
            }
        }
        batch.clear();
        self.batch = batch;
        Ok(match status {
            IteratorStatus::Ok => SinkStatus::Ok,
            IteratorStatus::Again => SinkStatus::Again,
            IteratorStatus::End => SinkStatus::End,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctf::medium::BufferMedium;
    use crate::ctf::source::{CtfSource, CtfSourceConfig};
    use crate::ctf::testwire::BitWriter;
    use crate::graph::component::Filter;
    use crate::graph::graph::{Graph, RunStatus};
    use pretty_assertions::assert_eq;

    #[test]
    fn synthetic_source_through_counting_sink() {
        let mut graph = Graph::new();
        let src = graph
            .add_source("src", Box::new(SyntheticSource::new(5).unwrap()), &Params::new())
            .unwrap();
        let (sink, counts) = CountingSink::new(4);
        let snk = graph.add_sink("snk", Box::new(sink), &Params::new()).unwrap();
        let out = graph.output_port(src, "out").unwrap();
        let inp = graph.input_port(snk, "in").unwrap();
        graph.connect(out, inp).unwrap();

        assert_eq!(graph.run().unwrap(), RunStatus::End);
        assert_eq!(
            *counts.borrow(),
            NotificationCounts {
                stream_begin: 1,
                packet_begin: 1,
                events: 5,
                packet_end: 1,
                stream_end: 1,
            }
        );
    }

    /// Forwards its input unchanged; exercises upstream pulls through
    /// a filter's iterator.
    struct Passthrough;

    impl Filter for Passthrough {
        fn initialize(&mut self, _params: &Params, ports: &mut PortSpec) -> Result<(), Error> {
            ports.add_input_port("in");
            ports.add_output_port("out");
            Ok(())
        }

        fn create_notification_iterator(
            &mut self,
            _port: &str,
        ) -> Result<Box<dyn NotificationIterator>, Error> {
            struct Iter;
            impl NotificationIterator for Iter {
                fn next(
                    &mut self,
                    ctx: &mut IteratorContext<'_>,
                    batch: &mut Vec<Rc<Notification>>,
                    capacity: usize,
                ) -> Result<IteratorStatus, Error> {
                    ctx.upstream_next(0, batch, capacity)
                }
            }
            Ok(Box::new(Iter))
        }
    }

    #[test]
    fn filter_forwards_in_source_order() {
        let mut graph = Graph::new();
        let src = graph
            .add_source("src", Box::new(SyntheticSource::new(3).unwrap()), &Params::new())
            .unwrap();
        let flt = graph
            .add_filter("flt", Box::new(Passthrough), &Params::new())
            .unwrap();
        let (sink, counts) = CountingSink::new(2);
        let snk = graph.add_sink("snk", Box::new(sink), &Params::new()).unwrap();

        graph
            .connect(
                graph.output_port(src, "out").unwrap(),
                graph.input_port(flt, "in").unwrap(),
            )
            .unwrap();
        graph
            .connect(
                graph.output_port(flt, "out").unwrap(),
                graph.input_port(snk, "in").unwrap(),
            )
            .unwrap();

        assert_eq!(graph.run().unwrap(), RunStatus::End);
        assert_eq!(counts.borrow().events, 3);
        assert_eq!(counts.borrow().total(), 7);
    }

    /// One input-byte trace decoded end to end through the graph,
    /// checking the notification sequencing guarantees.
    #[test]
    fn ctf_source_through_graph_preserves_sequencing() {
        let trace = Trace::new();
        let sc = StreamClass::new(0);
        sc.set_packet_context_field_class({
            let st = FieldClass::structure();
            st.as_structure()
                .unwrap()
                .add_member(
                    "content_size",
                    FieldClass::unsigned_integer(32, ByteOrder::LittleEndian),
                )
                .unwrap();
            st
        })
        .unwrap();
        let ec = EventClass::new(0, "e");
        ec.set_payload_field_class({
            let st = FieldClass::structure();
            st.as_structure()
                .unwrap()
                .add_member(
                    "value",
                    FieldClass::unsigned_integer(32, ByteOrder::LittleEndian),
                )
                .unwrap();
            st
        })
        .unwrap();
        sc.add_event_class(ec).unwrap();
        trace.add_stream_class(sc).unwrap();

        // ctx 32 + two 32-bit events = 96 bits of content.
        let mut w = BitWriter::new();
        w.write_u32_le(96).write_u32_le(11).write_u32_le(22);
        let medium = BufferMedium::with_chunk_len(trace.clone(), w.into_bytes(), 3);

        let mut source = CtfSource::new(trace, CtfSourceConfig::default());
        source.add_stream_medium("stream0", Box::new(medium));

        struct Recorder {
            seen: Rc<RefCell<Vec<NotificationKind>>>,
            frozen: Rc<RefCell<bool>>,
        }
        impl Sink for Recorder {
            fn initialize(&mut self, _params: &Params, ports: &mut PortSpec) -> Result<(), Error> {
                ports.add_input_port("in");
                Ok(())
            }
            fn consume(&mut self, ctx: &mut ConsumeContext<'_>) -> Result<SinkStatus, Error> {
                let mut batch = Vec::new();
                let status = ctx.notification_iterator_next(0, &mut batch, 8)?;
                for n in &batch {
                    *self.frozen.borrow_mut() &= n.is_frozen();
                    self.seen.borrow_mut().push(n.kind());
                }
                Ok(match status {
                    IteratorStatus::Ok => SinkStatus::Ok,
                    IteratorStatus::Again => SinkStatus::Again,
                    IteratorStatus::End => SinkStatus::End,
                })
            }
        }

        let seen = Rc::new(RefCell::new(Vec::new()));
        let frozen = Rc::new(RefCell::new(true));
        let mut graph = Graph::new();
        let src = graph.add_source("ctf", Box::new(source), &Params::new()).unwrap();
        let snk = graph
            .add_sink(
                "rec",
                Box::new(Recorder {
                    seen: seen.clone(),
                    frozen: frozen.clone(),
                }),
                &Params::new(),
            )
            .unwrap();
        graph
            .connect(
                graph.output_port(src, "stream0").unwrap(),
                graph.input_port(snk, "in").unwrap(),
            )
            .unwrap();
        assert_eq!(graph.run().unwrap(), RunStatus::End);

        assert_eq!(
            *seen.borrow(),
            vec![
                NotificationKind::StreamBegin,
                NotificationKind::PacketBegin,
                NotificationKind::Event,
                NotificationKind::Event,
                NotificationKind::PacketEnd,
                NotificationKind::StreamEnd,
            ]
        );
        // Every delivered notification was frozen first.
        assert!(*frozen.borrow());
    }

    #[test]
    fn synthetic_payloads_are_populated() {
        let mut graph = Graph::new();
        let src = graph
            .add_source("src", Box::new(SyntheticSource::new(2).unwrap()), &Params::new())
            .unwrap();

        struct Check {
            seen: Rc<RefCell<Vec<u64>>>,
        }
        impl Sink for Check {
            fn initialize(&mut self, _params: &Params, ports: &mut PortSpec) -> Result<(), Error> {
                ports.add_input_port("in");
                Ok(())
            }
            fn consume(&mut self, ctx: &mut ConsumeContext<'_>) -> Result<SinkStatus, Error> {
                let mut batch = Vec::new();
                let status = ctx.notification_iterator_next(0, &mut batch, 16)?;
                for n in &batch {
                    if let Some(event) = n.event_ref() {
                        let payload = event.payload().expect("payload set");
                        self.seen
                            .borrow_mut()
                            .push(payload.member_by_name("seq").unwrap().as_unsigned().unwrap());
                        assert_eq!(
                            payload.member_by_name("label").unwrap().as_str(),
                            Some("synthetic")
                        );
                    }
                }
                Ok(match status {
                    IteratorStatus::Ok => SinkStatus::Ok,
                    IteratorStatus::Again => SinkStatus::Again,
                    IteratorStatus::End => SinkStatus::End,
                })
            }
        }

        let seen = Rc::new(RefCell::new(Vec::new()));
        let snk = graph
            .add_sink("chk", Box::new(Check { seen: seen.clone() }), &Params::new())
            .unwrap();
        graph
            .connect(
                graph.output_port(src, "out").unwrap(),
                graph.input_port(snk, "in").unwrap(),
            )
            .unwrap();
        graph.run().unwrap();
        assert_eq!(*seen.borrow(), vec![0, 1]);
    }
}
