use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::error::Error;
use crate::ir::clock::ClockClass;
use crate::ir::event_class::EventClass;
use crate::ir::field_class::FieldClass;
use crate::ir::trace::Trace;
use crate::object::FreezeFlag;

/// Schema for one stream: the packet-context / event-header /
/// event-common-context layouts and the set of event classes.
#[derive(Debug)]
pub struct StreamClass {
    freeze: FreezeFlag,
    id: u64,
    name: RefCell<Option<String>>,
    packet_context_class: RefCell<Option<Rc<FieldClass>>>,
    event_header_class: RefCell<Option<Rc<FieldClass>>>,
    event_common_context_class: RefCell<Option<Rc<FieldClass>>>,
    event_classes: RefCell<Vec<Rc<EventClass>>>,
    default_clock_class: RefCell<Option<Rc<ClockClass>>>,
    assigns_automatic_event_class_id: Cell<bool>,
    assigns_automatic_stream_id: Cell<bool>,
    pub(crate) trace: RefCell<Weak<Trace>>,
}

impl StreamClass {
    pub fn new(id: u64) -> Rc<Self> {
        Rc::new(Self {
            freeze: FreezeFlag::new(),
            id,
            name: RefCell::new(None),
            packet_context_class: RefCell::new(None),
            event_header_class: RefCell::new(None),
            event_common_context_class: RefCell::new(None),
            event_classes: RefCell::new(Vec::new()),
            default_clock_class: RefCell::new(None),
            assigns_automatic_event_class_id: Cell::new(false),
            assigns_automatic_stream_id: Cell::new(false),
            trace: RefCell::new(Weak::new()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> Option<String> {
        self.name.borrow().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) -> Result<(), Error> {
        self.freeze.check_hot("stream class")?;
        *self.name.borrow_mut() = Some(name.into());
        Ok(())
    }

    pub fn trace(&self) -> Option<Rc<Trace>> {
        self.trace.borrow().upgrade()
    }

    pub fn packet_context_field_class(&self) -> Option<Rc<FieldClass>> {
        self.packet_context_class.borrow().clone()
    }

    pub fn set_packet_context_field_class(&self, class: Rc<FieldClass>) -> Result<(), Error> {
        self.freeze.check_hot("stream class")?;
        *self.packet_context_class.borrow_mut() = Some(class);
        Ok(())
    }

    pub fn event_header_field_class(&self) -> Option<Rc<FieldClass>> {
        self.event_header_class.borrow().clone()
    }

    pub fn set_event_header_field_class(&self, class: Rc<FieldClass>) -> Result<(), Error> {
        self.freeze.check_hot("stream class")?;
        *self.event_header_class.borrow_mut() = Some(class);
        Ok(())
    }

    pub fn event_common_context_field_class(&self) -> Option<Rc<FieldClass>> {
        self.event_common_context_class.borrow().clone()
    }

    pub fn set_event_common_context_field_class(
        &self,
        class: Rc<FieldClass>,
    ) -> Result<(), Error> {
        self.freeze.check_hot("stream class")?;
        *self.event_common_context_class.borrow_mut() = Some(class);
        Ok(())
    }

    pub fn default_clock_class(&self) -> Option<Rc<ClockClass>> {
        self.default_clock_class.borrow().clone()
    }

    pub fn set_default_clock_class(&self, clock_class: Rc<ClockClass>) -> Result<(), Error> {
        self.freeze.check_hot("stream class")?;
        *self.default_clock_class.borrow_mut() = Some(clock_class);
        Ok(())
    }

    pub fn assigns_automatic_event_class_id(&self) -> bool {
        self.assigns_automatic_event_class_id.get()
    }

    pub fn set_assigns_automatic_event_class_id(&self, value: bool) -> Result<(), Error> {
        self.freeze.check_hot("stream class")?;
        self.assigns_automatic_event_class_id.set(value);
        Ok(())
    }

    pub fn assigns_automatic_stream_id(&self) -> bool {
        self.assigns_automatic_stream_id.get()
    }

    pub fn set_assigns_automatic_stream_id(&self, value: bool) -> Result<(), Error> {
        self.freeze.check_hot("stream class")?;
        self.assigns_automatic_stream_id.set(value);
        Ok(())
    }

    pub fn event_class_count(&self) -> usize {
        self.event_classes.borrow().len()
    }

    /// Adds an event class; its ID must be unique within this stream
    /// class.
    pub fn add_event_class(self: &Rc<Self>, event_class: Rc<EventClass>) -> Result<(), Error> {
        self.freeze.check_hot("stream class")?;
        if self.event_class_by_id(event_class.id()).is_some() {
            return Err(Error::Metadata(format!(
                "stream class {} already has an event class with ID {}",
                self.id,
                event_class.id()
            )));
        }
        *event_class.stream_class.borrow_mut() = Rc::downgrade(self);
        self.event_classes.borrow_mut().push(event_class);
        Ok(())
    }

    /// Adds an event class with the next free ID; requires the
    /// automatic-assignment discipline.
    pub fn create_event_class(self: &Rc<Self>, name: impl Into<String>) -> Result<Rc<EventClass>, Error> {
        if !self.assigns_automatic_event_class_id.get() {
            return Err(Error::Metadata(
                "stream class does not assign automatic event class IDs".into(),
            ));
        }
        let id = self
            .event_classes
            .borrow()
            .iter()
            .map(|ec| ec.id() + 1)
            .max()
            .unwrap_or(0);
        let ec = EventClass::new(id, name);
        self.add_event_class(ec.clone())?;
        Ok(ec)
    }

    pub fn event_class_by_index(&self, index: usize) -> Option<Rc<EventClass>> {
        self.event_classes.borrow().get(index).cloned()
    }

    pub fn event_class_by_id(&self, id: u64) -> Option<Rc<EventClass>> {
        self.event_classes
            .borrow()
            .iter()
            .find(|ec| ec.id() == id)
            .cloned()
    }

    pub fn is_frozen(&self) -> bool {
        self.freeze.is_frozen()
    }

    /// Freezes this stream class, its field classes, its clock class,
    /// and every event class.
    pub fn freeze(&self) {
        if self.freeze.is_frozen() {
            return;
        }
        self.freeze.freeze();
        for class in [
            &self.packet_context_class,
            &self.event_header_class,
            &self.event_common_context_class,
        ] {
            if let Some(c) = &*class.borrow() {
                c.freeze();
            }
        }
        if let Some(cc) = &*self.default_clock_class.borrow() {
            cc.freeze();
        }
        for ec in self.event_classes.borrow().iter() {
            ec.freeze();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn event_class_ids_are_unique() {
        let sc = StreamClass::new(0);
        sc.add_event_class(EventClass::new(1, "a")).unwrap();
        assert!(sc.add_event_class(EventClass::new(1, "b")).is_err());
        sc.add_event_class(EventClass::new(2, "b")).unwrap();
        assert_eq!(sc.event_class_count(), 2);
        assert_eq!(sc.event_class_by_id(2).unwrap().name(), "b");
    }

    #[test]
    fn automatic_event_class_ids() {
        let sc = StreamClass::new(0);
        sc.set_assigns_automatic_event_class_id(true).unwrap();
        let a = sc.create_event_class("a").unwrap();
        let b = sc.create_event_class("b").unwrap();
        assert_eq!(a.id(), 0);
        assert_eq!(b.id(), 1);
    }

    #[test]
    fn freeze_propagates_to_event_classes() {
        let sc = StreamClass::new(0);
        let ec = EventClass::new(0, "e");
        sc.add_event_class(ec.clone()).unwrap();
        let ctx = FieldClass::structure();
        sc.set_packet_context_field_class(ctx.clone()).unwrap();
        sc.freeze();
        assert!(ec.is_frozen());
        assert!(ctx.is_frozen());
        assert!(sc.set_name("late").is_err());
        // Idempotent.
        sc.freeze();
    }

    #[test]
    fn parent_back_reference() {
        let sc = StreamClass::new(3);
        let ec = EventClass::new(0, "e");
        sc.add_event_class(ec.clone()).unwrap();
        assert_eq!(ec.stream_class().unwrap().id(), 3);
    }
}
