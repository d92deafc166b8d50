use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::error::Error;
use crate::ir::field_class::FieldClass;
use crate::ir::stream_class::StreamClass;
use crate::object::FreezeFlag;

/// Log levels carried through from the metadata, ordered from most to
/// least severe.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, derive_more::Display)]
pub enum LogLevel {
    #[display(fmt = "emergency")]
    Emergency,
    #[display(fmt = "alert")]
    Alert,
    #[display(fmt = "critical")]
    Critical,
    #[display(fmt = "error")]
    Error,
    #[display(fmt = "warning")]
    Warning,
    #[display(fmt = "notice")]
    Notice,
    #[display(fmt = "info")]
    Info,
    #[display(fmt = "debug-system")]
    DebugSystem,
    #[display(fmt = "debug-program")]
    DebugProgram,
    #[display(fmt = "debug-process")]
    DebugProcess,
    #[display(fmt = "debug-module")]
    DebugModule,
    #[display(fmt = "debug-unit")]
    DebugUnit,
    #[display(fmt = "debug-function")]
    DebugFunction,
    #[display(fmt = "debug-line")]
    DebugLine,
    #[display(fmt = "debug")]
    Debug,
}

/// Schema for one kind of event within a stream class. IDs are unique
/// within the parent stream class.
#[derive(Debug)]
pub struct EventClass {
    freeze: FreezeFlag,
    id: u64,
    name: String,
    log_level: Cell<Option<LogLevel>>,
    emf_uri: RefCell<Option<String>>,
    context_class: RefCell<Option<Rc<FieldClass>>>,
    payload_class: RefCell<Option<Rc<FieldClass>>>,
    pub(crate) stream_class: RefCell<Weak<StreamClass>>,
}

impl EventClass {
    pub fn new(id: u64, name: impl Into<String>) -> Rc<Self> {
        Rc::new(Self {
            freeze: FreezeFlag::new(),
            id,
            name: name.into(),
            log_level: Cell::new(None),
            emf_uri: RefCell::new(None),
            context_class: RefCell::new(None),
            payload_class: RefCell::new(None),
            stream_class: RefCell::new(Weak::new()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn log_level(&self) -> Option<LogLevel> {
        self.log_level.get()
    }

    pub fn set_log_level(&self, log_level: LogLevel) -> Result<(), Error> {
        self.freeze.check_hot("event class")?;
        self.log_level.set(Some(log_level));
        Ok(())
    }

    pub fn emf_uri(&self) -> Option<String> {
        self.emf_uri.borrow().clone()
    }

    pub fn set_emf_uri(&self, uri: impl Into<String>) -> Result<(), Error> {
        self.freeze.check_hot("event class")?;
        *self.emf_uri.borrow_mut() = Some(uri.into());
        Ok(())
    }

    pub fn context_field_class(&self) -> Option<Rc<FieldClass>> {
        self.context_class.borrow().clone()
    }

    pub fn set_context_field_class(&self, class: Rc<FieldClass>) -> Result<(), Error> {
        self.freeze.check_hot("event class")?;
        *self.context_class.borrow_mut() = Some(class);
        Ok(())
    }

    pub fn payload_field_class(&self) -> Option<Rc<FieldClass>> {
        self.payload_class.borrow().clone()
    }

    pub fn set_payload_field_class(&self, class: Rc<FieldClass>) -> Result<(), Error> {
        self.freeze.check_hot("event class")?;
        *self.payload_class.borrow_mut() = Some(class);
        Ok(())
    }

    /// Parent stream class, once this event class has been added to one.
    pub fn stream_class(&self) -> Option<Rc<StreamClass>> {
        self.stream_class.borrow().upgrade()
    }

    pub fn is_frozen(&self) -> bool {
        self.freeze.is_frozen()
    }

    pub fn freeze(&self) {
        if self.freeze.is_frozen() {
            return;
        }
        self.freeze.freeze();
        if let Some(c) = &*self.context_class.borrow() {
            c.freeze();
        }
        if let Some(c) = &*self.payload_class.borrow() {
            c.freeze();
        }
    }
}
