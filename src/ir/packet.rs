use std::cell::{Ref, RefCell};
use std::rc::Rc;

use crate::error::Error;
use crate::ir::field::Field;
use crate::ir::stream::Stream;
use crate::object::{FreezeFlag, Poolable};

/// Whether the packet preceding this one in its stream is known to
/// exist, known to be absent, or irrelevant.
#[derive(Copy, Clone, Eq, PartialEq, Debug, derive_more::Display)]
pub enum PreviousPacketAvailability {
    #[display(fmt = "available")]
    Available,
    #[display(fmt = "not-available")]
    NotAvailable,
    #[display(fmt = "none")]
    None,
}

#[derive(Debug, Default)]
pub(crate) struct PacketInner {
    pub(crate) header: Option<Field>,
    pub(crate) context: Option<Field>,
    pub(crate) beginning_clock_value: Option<u64>,
    pub(crate) end_clock_value: Option<u64>,
    pub(crate) sequence_number: Option<u64>,
    pub(crate) discarded_event_count: Option<u64>,
    pub(crate) prev_availability: Option<PreviousPacketAvailability>,
    pub(crate) prev_packet: Option<Rc<Packet>>,
}

impl Poolable for PacketInner {
    fn reset(&mut self) {
        self.header = None;
        self.context = None;
        self.beginning_clock_value = None;
        self.end_clock_value = None;
        self.sequence_number = None;
        self.discarded_event_count = None;
        self.prev_availability = None;
        self.prev_packet = None;
    }
}

/// One packet of a stream: decoded header and context fields plus the
/// framing properties the context carried.
#[derive(Debug)]
pub struct Packet {
    stream: Rc<Stream>,
    freeze: FreezeFlag,
    inner: RefCell<PacketInner>,
}

impl Packet {
    pub(crate) fn from_inner(stream: Rc<Stream>, mut inner: PacketInner, prev_availability: PreviousPacketAvailability, prev_packet: Option<Rc<Packet>>) -> Rc<Self> {
        inner.prev_availability = Some(prev_availability);
        inner.prev_packet = prev_packet;
        Rc::new(Self {
            stream,
            freeze: FreezeFlag::new(),
            inner: RefCell::new(inner),
        })
    }

    pub fn stream(&self) -> &Rc<Stream> {
        &self.stream
    }

    pub fn header(&self) -> Ref<'_, Option<Field>> {
        Ref::map(self.inner.borrow(), |i| &i.header)
    }

    pub fn context(&self) -> Ref<'_, Option<Field>> {
        Ref::map(self.inner.borrow(), |i| &i.context)
    }

    /// Moves a decoded packet header field into this packet.
    pub fn move_header(&self, header: Field) -> Result<(), Error> {
        self.freeze.check_hot("packet")?;
        self.inner.borrow_mut().header = Some(header);
        Ok(())
    }

    pub fn move_context(&self, context: Field) -> Result<(), Error> {
        self.freeze.check_hot("packet")?;
        self.inner.borrow_mut().context = Some(context);
        Ok(())
    }

    /// Default clock value at the beginning of the packet
    /// (`timestamp_begin`).
    pub fn beginning_clock_value(&self) -> Option<u64> {
        self.inner.borrow().beginning_clock_value
    }

    pub fn set_beginning_clock_value(&self, value: u64) -> Result<(), Error> {
        self.freeze.check_hot("packet")?;
        self.inner.borrow_mut().beginning_clock_value = Some(value);
        Ok(())
    }

    /// Default clock value at the end of the packet (`timestamp_end`).
    pub fn end_clock_value(&self) -> Option<u64> {
        self.inner.borrow().end_clock_value
    }

    pub fn set_end_clock_value(&self, value: u64) -> Result<(), Error> {
        self.freeze.check_hot("packet")?;
        self.inner.borrow_mut().end_clock_value = Some(value);
        Ok(())
    }

    pub fn sequence_number(&self) -> Option<u64> {
        self.inner.borrow().sequence_number
    }

    pub fn set_sequence_number(&self, value: u64) -> Result<(), Error> {
        self.freeze.check_hot("packet")?;
        self.inner.borrow_mut().sequence_number = Some(value);
        Ok(())
    }

    pub fn discarded_event_count(&self) -> Option<u64> {
        self.inner.borrow().discarded_event_count
    }

    pub fn set_discarded_event_count(&self, value: u64) -> Result<(), Error> {
        self.freeze.check_hot("packet")?;
        self.inner.borrow_mut().discarded_event_count = Some(value);
        Ok(())
    }

    pub fn previous_packet_availability(&self) -> PreviousPacketAvailability {
        self.inner
            .borrow()
            .prev_availability
            .unwrap_or(PreviousPacketAvailability::None)
    }

    pub fn previous_packet(&self) -> Option<Rc<Packet>> {
        self.inner.borrow().prev_packet.clone()
    }

    pub fn is_frozen(&self) -> bool {
        self.freeze.is_frozen()
    }

    pub fn freeze(&self) {
        self.freeze.freeze();
    }

    pub(crate) fn take_inner(self) -> PacketInner {
        self.inner.into_inner()
    }
}
