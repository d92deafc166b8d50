//! Trace IR: the metadata (schema) layer and the instance layer of the
//! trace → stream → packet → event hierarchy.

pub mod clock;
pub mod event;
pub mod event_class;
pub mod field;
pub mod field_class;
pub mod packet;
pub mod path;
pub mod stream;
pub mod stream_class;
pub mod trace;

pub use clock::ClockClass;
pub use event::Event;
pub use event_class::{EventClass, LogLevel};
pub use field::Field;
pub use field_class::{
    ByteOrder, DisplayBase, EnumerationMapping, FieldClass, FieldClassId, FloatWidth,
};
pub use packet::{Packet, PreviousPacketAvailability};
pub use path::{FieldPath, Scope, ScopeClasses};
pub use stream::Stream;
pub use stream_class::StreamClass;
pub use trace::{EnvValue, Trace};
