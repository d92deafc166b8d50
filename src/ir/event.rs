use std::rc::Rc;

use crate::ir::clock::ClockClass;
use crate::ir::event_class::EventClass;
use crate::ir::field::Field;
use crate::ir::packet::Packet;

/// One decoded event. Owned transiently by the event notification that
/// delivers it; immutable once the notification is frozen.
#[derive(Debug)]
pub struct Event {
    event_class: Rc<EventClass>,
    packet: Rc<Packet>,
    header: Option<Field>,
    common_context: Option<Field>,
    specific_context: Option<Field>,
    payload: Option<Field>,
    clock_values: Vec<(Rc<ClockClass>, u64)>,
}

impl Event {
    pub fn new(event_class: Rc<EventClass>, packet: Rc<Packet>) -> Self {
        Self {
            event_class,
            packet,
            header: None,
            common_context: None,
            specific_context: None,
            payload: None,
            clock_values: Vec::new(),
        }
    }

    pub fn event_class(&self) -> &Rc<EventClass> {
        &self.event_class
    }

    pub fn packet(&self) -> &Rc<Packet> {
        &self.packet
    }

    pub fn header(&self) -> Option<&Field> {
        self.header.as_ref()
    }

    pub fn common_context(&self) -> Option<&Field> {
        self.common_context.as_ref()
    }

    pub fn specific_context(&self) -> Option<&Field> {
        self.specific_context.as_ref()
    }

    pub fn payload(&self) -> Option<&Field> {
        self.payload.as_ref()
    }

    pub fn move_header(&mut self, field: Field) {
        self.header = Some(field);
    }

    pub fn move_common_context(&mut self, field: Field) {
        self.common_context = Some(field);
    }

    pub fn move_specific_context(&mut self, field: Field) {
        self.specific_context = Some(field);
    }

    pub fn move_payload(&mut self, field: Field) {
        self.payload = Some(field);
    }

    /// Current cycle value of one clock class at this event.
    pub fn clock_value(&self, clock_class: &Rc<ClockClass>) -> Option<u64> {
        self.clock_values
            .iter()
            .find(|(cc, _)| Rc::ptr_eq(cc, clock_class))
            .map(|(_, v)| *v)
    }

    /// Cycle value of the stream class's default clock, if any.
    pub fn default_clock_value(&self) -> Option<u64> {
        let cc = self
            .event_class
            .stream_class()
            .and_then(|sc| sc.default_clock_class())?;
        self.clock_value(&cc)
    }

    pub fn set_clock_value(&mut self, clock_class: Rc<ClockClass>, value: u64) {
        if let Some(entry) = self
            .clock_values
            .iter_mut()
            .find(|(cc, _)| Rc::ptr_eq(cc, &clock_class))
        {
            entry.1 = value;
        } else {
            self.clock_values.push((clock_class, value));
        }
    }

    pub fn clock_values(&self) -> &[(Rc<ClockClass>, u64)] {
        &self.clock_values
    }

    /// Freezing an event freezes its packet.
    pub fn freeze(&self) {
        self.packet.freeze();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::packet::PreviousPacketAvailability;
    use crate::ir::stream_class::StreamClass;
    use crate::ir::trace::Trace;
    use pretty_assertions::assert_eq;

    fn event() -> Event {
        let trace = Trace::new();
        let sc = StreamClass::new(0);
        let cc = ClockClass::new("c", 1_000_000);
        sc.set_default_clock_class(cc).unwrap();
        let ec = EventClass::new(0, "e");
        sc.add_event_class(ec.clone()).unwrap();
        trace.add_stream_class(sc.clone()).unwrap();
        let stream = trace.create_stream(sc, 0).unwrap();
        let packet = stream.create_packet(PreviousPacketAvailability::None, None);
        Event::new(ec, packet)
    }

    #[test]
    fn clock_values_update_in_place() {
        let mut ev = event();
        let cc = ev
            .event_class()
            .stream_class()
            .unwrap()
            .default_clock_class()
            .unwrap();
        ev.set_clock_value(cc.clone(), 100);
        ev.set_clock_value(cc.clone(), 200);
        assert_eq!(ev.clock_value(&cc), Some(200));
        assert_eq!(ev.default_clock_value(), Some(200));
        assert_eq!(ev.clock_values().len(), 1);
    }

    #[test]
    fn freezing_an_event_freezes_its_packet() {
        let ev = event();
        assert!(!ev.packet().is_frozen());
        ev.freeze();
        assert!(ev.packet().is_frozen());
    }
}
