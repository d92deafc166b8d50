pub use crate::ctf::{
    BufferMedium, CtfSource, CtfSourceConfig, DecoderNext, Medium, MediumRequest, StreamDecoder,
};
pub use crate::error::{DecodeError, Error, ResolutionError};
pub use crate::graph::{
    ConsumeStatus, Filter, Graph, Notification, NotificationKind, Params, RunStatus, Sink,
    SinkStatus, Source,
};
pub use crate::ir::{
    ByteOrder, ClockClass, EventClass, Field, FieldClass, StreamClass, Trace,
};
pub use crate::types::Interruptor;
pub use crate::utils::{CountingSink, NotificationCounts, SyntheticSource};
