//! The component graph runtime: sources, filters, and sinks joined by
//! typed ports, scheduled cooperatively on one thread.

pub mod component;
pub(crate) mod connection;
#[allow(clippy::module_inception)]
pub mod graph;
pub mod iterator;
pub mod notification;

pub use component::{ComponentKind, Filter, ParamValue, Params, PortSpec, Sink, SinkStatus, Source};
pub use graph::{
    ConsumeContext, ConsumeStatus, Graph, ListenerId, PortAddedEvent, PortRemovedEvent,
    PortsConnectedEvent, PortsDisconnectedEvent, RunStatus,
};
pub use iterator::{IteratorContext, IteratorStatus, NotificationIterator};
pub use notification::{Notification, NotificationKind, NotificationPools};
