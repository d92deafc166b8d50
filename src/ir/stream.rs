use std::cell::RefCell;
use std::rc::{Rc, Weak};

use tracing::trace;

use crate::ir::packet::{Packet, PacketInner, PreviousPacketAvailability};
use crate::ir::stream_class::StreamClass;
use crate::ir::trace::Trace;
use crate::object::ObjectPool;

/// One stream instance: a timeline of packets belonging to one stream
/// class. IDs are unique within the (trace, stream class) pair.
#[derive(Debug)]
pub struct Stream {
    id: u64,
    name: RefCell<Option<String>>,
    stream_class: Rc<StreamClass>,
    trace: Weak<Trace>,
    packet_pool: RefCell<ObjectPool<PacketInner>>,
}

impl Stream {
    pub(crate) fn new(trace: &Rc<Trace>, stream_class: Rc<StreamClass>, id: u64) -> Rc<Self> {
        Rc::new(Self {
            id,
            name: RefCell::new(None),
            stream_class,
            trace: Rc::downgrade(trace),
            packet_pool: RefCell::new(ObjectPool::default()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> Option<String> {
        self.name.borrow().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.borrow_mut() = Some(name.into());
    }

    pub fn stream_class(&self) -> &Rc<StreamClass> {
        &self.stream_class
    }

    pub fn trace(&self) -> Option<Rc<Trace>> {
        self.trace.upgrade()
    }

    /// Produces a packet through this stream's pool.
    pub fn create_packet(
        self: &Rc<Self>,
        prev_availability: PreviousPacketAvailability,
        prev_packet: Option<Rc<Packet>>,
    ) -> Rc<Packet> {
        let inner = self.packet_pool.borrow_mut().acquire(PacketInner::default);
        Packet::from_inner(self.clone(), inner, prev_availability, prev_packet)
    }

    /// Returns a packet to the pool if the caller held the last
    /// reference; otherwise the packet just drops when its consumers
    /// are done with it.
    pub fn recycle_packet(&self, packet: Rc<Packet>) {
        if let Ok(packet) = Rc::try_unwrap(packet) {
            trace!(stream_id = self.id, "recycling packet");
            self.packet_pool
                .borrow_mut()
                .recycle(packet.take_inner());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::trace::Trace;
    use pretty_assertions::assert_eq;

    fn stream() -> Rc<Stream> {
        let trace = Trace::new();
        let sc = StreamClass::new(0);
        trace.add_stream_class(sc.clone()).unwrap();
        trace.create_stream(sc, 9).unwrap()
    }

    #[test]
    fn packet_pool_round_trip() {
        let s = stream();
        let p = s.create_packet(PreviousPacketAvailability::None, None);
        p.set_sequence_number(4).unwrap();
        s.recycle_packet(p);
        assert_eq!(s.packet_pool.borrow().len(), 1);

        // The recycled instance comes back reset.
        let p = s.create_packet(PreviousPacketAvailability::None, None);
        assert_eq!(p.sequence_number(), None);
        assert_eq!(s.packet_pool.borrow().len(), 0);
    }

    #[test]
    fn shared_packet_is_not_recycled() {
        let s = stream();
        let p = s.create_packet(PreviousPacketAvailability::None, None);
        let extra = p.clone();
        s.recycle_packet(p);
        assert_eq!(s.packet_pool.borrow().len(), 0);
        drop(extra);
    }

    #[test]
    fn stream_parents() {
        let s = stream();
        assert_eq!(s.id(), 9);
        assert_eq!(s.stream_class().id(), 0);
        assert!(s.trace().is_some());
    }

    #[test]
    fn reference_counts_round_trip() {
        let trace = Trace::new();
        let sc = StreamClass::new(0);
        trace.add_stream_class(sc.clone()).unwrap();
        let s = trace.create_stream(sc, 0).unwrap();

        let base = Rc::strong_count(&s);
        let extra = s.clone();
        assert_eq!(Rc::strong_count(&s), base + 1);
        drop(extra);
        assert_eq!(Rc::strong_count(&s), base);

        // The trace owns its streams; children only hold weak
        // back-references, so dropping the root leaves our handle as
        // the sole owner.
        drop(trace);
        assert_eq!(Rc::strong_count(&s), 1);
        assert!(s.trace().is_none());
    }
}
