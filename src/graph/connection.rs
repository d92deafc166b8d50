use crate::graph::iterator::NotificationIterator;
use crate::types::{ConnectionId, PortId};

/// A named attachment point on a component. At most one connection.
#[derive(Debug)]
pub(crate) struct Port {
    pub(crate) name: String,
    pub(crate) connection: Option<ConnectionId>,
}

impl Port {
    pub(crate) fn new(name: String) -> Self {
        Self {
            name,
            connection: None,
        }
    }
}

/// Joins an output port to an input port. Endpoints are plain ids into
/// the graph's component arena; the graph owns both sides, so a
/// connection never keeps a component alive. The connection owns the
/// notification iterator created against it.
pub(crate) struct Connection {
    pub(crate) upstream: PortId,
    pub(crate) downstream: PortId,
    pub(crate) iterator: Option<Box<dyn NotificationIterator>>,
    /// Set while a `next` call is in flight on this connection's
    /// iterator, and permanently once the connection is severed.
    pub(crate) detached: bool,
}

impl Connection {
    pub(crate) fn new(upstream: PortId, downstream: PortId) -> Self {
        Self {
            upstream,
            downstream,
            iterator: None,
            detached: false,
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("upstream", &self.upstream)
            .field("downstream", &self.downstream)
            .field("has_iterator", &self.iterator.is_some())
            .field("detached", &self.detached)
            .finish()
    }
}
