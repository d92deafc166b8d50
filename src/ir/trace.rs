//! The trace: root of the metadata hierarchy and owner of its streams.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use crate::error::Error;
use crate::ir::field_class::FieldClass;
use crate::ir::path::{resolve_scope, Scope, ScopeClasses};
use crate::ir::stream::Stream;
use crate::ir::stream_class::StreamClass;
use crate::object::FreezeFlag;

/// One typed trace environment entry value.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    Integer(i64),
    String(String),
}

#[derive(Debug)]
pub struct Trace {
    freeze: FreezeFlag,
    name: RefCell<Option<String>>,
    uuid: RefCell<Option<Uuid>>,
    packet_header_class: RefCell<Option<Rc<FieldClass>>>,
    stream_classes: RefCell<Vec<Rc<StreamClass>>>,
    environment: RefCell<Vec<(String, EnvValue)>>,
    is_static: Cell<bool>,
    streams: RefCell<Vec<Rc<Stream>>>,
    stored_slot_count: Cell<usize>,
    validated: Cell<bool>,
}

impl Trace {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            freeze: FreezeFlag::new(),
            name: RefCell::new(None),
            uuid: RefCell::new(None),
            packet_header_class: RefCell::new(None),
            stream_classes: RefCell::new(Vec::new()),
            environment: RefCell::new(Vec::new()),
            is_static: Cell::new(false),
            streams: RefCell::new(Vec::new()),
            stored_slot_count: Cell::new(0),
            validated: Cell::new(false),
        })
    }

    pub fn name(&self) -> Option<String> {
        self.name.borrow().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) -> Result<(), Error> {
        self.freeze.check_hot("trace")?;
        *self.name.borrow_mut() = Some(name.into());
        Ok(())
    }

    pub fn uuid(&self) -> Option<Uuid> {
        *self.uuid.borrow()
    }

    pub fn set_uuid(&self, uuid: Uuid) -> Result<(), Error> {
        self.freeze.check_hot("trace")?;
        *self.uuid.borrow_mut() = Some(uuid);
        Ok(())
    }

    pub fn packet_header_field_class(&self) -> Option<Rc<FieldClass>> {
        self.packet_header_class.borrow().clone()
    }

    pub fn set_packet_header_field_class(&self, class: Rc<FieldClass>) -> Result<(), Error> {
        self.freeze.check_hot("trace")?;
        *self.packet_header_class.borrow_mut() = Some(class);
        Ok(())
    }

    pub fn environment_entry(&self, name: &str) -> Option<EnvValue> {
        self.environment
            .borrow()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
    }

    pub fn environment_entries(&self) -> Vec<(String, EnvValue)> {
        self.environment.borrow().clone()
    }

    pub fn set_environment_entry(
        &self,
        name: impl Into<String>,
        value: EnvValue,
    ) -> Result<(), Error> {
        self.freeze.check_hot("trace")?;
        let name = name.into();
        let mut env = self.environment.borrow_mut();
        if let Some(entry) = env.iter_mut().find(|(n, _)| *n == name) {
            entry.1 = value;
        } else {
            env.push((name, value));
        }
        Ok(())
    }

    pub fn stream_class_count(&self) -> usize {
        self.stream_classes.borrow().len()
    }

    pub fn stream_class_by_index(&self, index: usize) -> Option<Rc<StreamClass>> {
        self.stream_classes.borrow().get(index).cloned()
    }

    pub fn stream_class_by_id(&self, id: u64) -> Option<Rc<StreamClass>> {
        self.stream_classes
            .borrow()
            .iter()
            .find(|sc| sc.id() == id)
            .cloned()
    }

    pub fn add_stream_class(
        self: &Rc<Self>,
        stream_class: Rc<StreamClass>,
    ) -> Result<(), Error> {
        self.freeze.check_hot("trace")?;
        if self.stream_class_by_id(stream_class.id()).is_some() {
            return Err(Error::Metadata(format!(
                "trace already has a stream class with ID {}",
                stream_class.id()
            )));
        }
        *stream_class.trace.borrow_mut() = Rc::downgrade(self);
        self.stream_classes.borrow_mut().push(stream_class);
        Ok(())
    }

    /// Marking a trace static forbids adding further streams.
    pub fn is_static(&self) -> bool {
        self.is_static.get()
    }

    pub fn make_static(&self) {
        self.is_static.set(true);
    }

    pub fn stream_count(&self) -> usize {
        self.streams.borrow().len()
    }

    pub fn stream_by_index(&self, index: usize) -> Option<Rc<Stream>> {
        self.streams.borrow().get(index).cloned()
    }

    pub fn stream_by_id(&self, stream_class_id: u64, stream_id: u64) -> Option<Rc<Stream>> {
        self.streams
            .borrow()
            .iter()
            .find(|s| s.stream_class().id() == stream_class_id && s.id() == stream_id)
            .cloned()
    }

    /// Creates a stream of the given class. The (stream class, ID) pair
    /// must be unique within the trace. Creating the first stream
    /// freezes the metadata.
    pub fn create_stream(
        self: &Rc<Self>,
        stream_class: Rc<StreamClass>,
        id: u64,
    ) -> Result<Rc<Stream>, Error> {
        if self.is_static.get() {
            return Err(Error::Metadata(
                "cannot add a stream to a static trace".into(),
            ));
        }
        if self.stream_class_by_id(stream_class.id()).is_none() {
            return Err(Error::Metadata(format!(
                "stream class {} does not belong to this trace",
                stream_class.id()
            )));
        }
        if self.stream_by_id(stream_class.id(), id).is_some() {
            return Err(Error::Metadata(format!(
                "trace already has stream {id} of stream class {}",
                stream_class.id()
            )));
        }
        self.freeze();
        let stream = Stream::new(self, stream_class, id);
        self.streams.borrow_mut().push(stream.clone());
        Ok(stream)
    }

    /// Total number of stored-value slots a decoder of this trace needs.
    pub fn stored_slot_count(&self) -> usize {
        self.stored_slot_count.get()
    }

    pub fn is_validated(&self) -> bool {
        self.validated.get()
    }

    /// Freezes the metadata, checks structural invariants, resolves
    /// every variant tag and sequence length path, and assigns
    /// stored-value slots. Idempotent; required before decoding.
    pub fn validate(self: &Rc<Self>) -> Result<(), Error> {
        if self.validated.get() {
            return Ok(());
        }
        self.freeze();

        let header = self.packet_header_class.borrow().clone();
        if let Some(h) = &header {
            if h.as_structure().is_none() {
                return Err(Error::Metadata(
                    "the packet header field class must be a structure".into(),
                ));
            }
        }

        let mut slot_count = self.stored_slot_count.get();
        let stream_classes = self.stream_classes.borrow().clone();
        for sc in &stream_classes {
            for root in [
                sc.packet_context_field_class(),
                sc.event_header_field_class(),
                sc.event_common_context_field_class(),
            ]
            .into_iter()
            .flatten()
            {
                if root.as_structure().is_none() {
                    return Err(Error::Metadata(format!(
                        "scope roots of stream class {} must be structures",
                        sc.id()
                    )));
                }
            }

            let sc_scopes = ScopeClasses {
                trace_packet_header: header.clone(),
                stream_packet_context: sc.packet_context_field_class(),
                stream_event_header: sc.event_header_field_class(),
                stream_event_context: sc.event_common_context_field_class(),
                event_context: None,
                event_payload: None,
            };
            resolve_scope(Scope::TracePacketHeader, &sc_scopes, &mut slot_count)?;
            resolve_scope(Scope::StreamPacketContext, &sc_scopes, &mut slot_count)?;
            resolve_scope(Scope::StreamEventHeader, &sc_scopes, &mut slot_count)?;
            resolve_scope(Scope::StreamEventContext, &sc_scopes, &mut slot_count)?;

            for index in 0..sc.event_class_count() {
                let Some(ec) = sc.event_class_by_index(index) else {
                    continue;
                };
                let ec_scopes = ScopeClasses {
                    event_context: ec.context_field_class(),
                    event_payload: ec.payload_field_class(),
                    ..sc_scopes.clone()
                };
                resolve_scope(Scope::EventContext, &ec_scopes, &mut slot_count)?;
                resolve_scope(Scope::EventPayload, &ec_scopes, &mut slot_count)?;
            }
        }

        self.stored_slot_count.set(slot_count);
        self.validated.set(true);
        debug!(
            stream_classes = stream_classes.len(),
            stored_slots = slot_count,
            "validated trace metadata"
        );
        Ok(())
    }

    pub fn is_frozen(&self) -> bool {
        self.freeze.is_frozen()
    }

    /// Freezes the trace and all metadata reachable from it.
    pub fn freeze(&self) {
        if self.freeze.is_frozen() {
            return;
        }
        self.freeze.freeze();
        if let Some(h) = &*self.packet_header_class.borrow() {
            h.freeze();
        }
        for sc in self.stream_classes.borrow().iter() {
            sc.freeze();
        }
    }
}
