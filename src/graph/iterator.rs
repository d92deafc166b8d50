//! Message iterators: the per-connection pull channel between
//! components. Batched; strict upstream order.

use std::rc::Rc;

use crate::error::Error;
use crate::graph::graph::Graph;
use crate::graph::notification::Notification;
use crate::types::ComponentId;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum IteratorStatus {
    /// The batch holds at least one notification.
    Ok,
    /// Nothing available right now; retry later.
    Again,
    /// The upstream is done; no further notifications will come.
    End,
}

/// Handed to an iterator's `next` so filter iterators can pull from
/// the input ports of the component they belong to.
pub struct IteratorContext<'a> {
    pub(crate) graph: &'a mut Graph,
    pub(crate) component: ComponentId,
}

impl IteratorContext<'_> {
    /// The notification pools of the graph this iterator runs in.
    pub fn notification_pools(&self) -> Rc<crate::graph::notification::NotificationPools> {
        self.graph.notification_pools().clone()
    }

    /// Pulls a batch from the connection on this component's input
    /// port `input_index`. Source iterators have no inputs and never
    /// call this.
    pub fn upstream_next(
        &mut self,
        input_index: usize,
        batch: &mut Vec<Rc<Notification>>,
        capacity: usize,
    ) -> Result<IteratorStatus, Error> {
        let connection = self
            .graph
            .input_connection(self.component, input_index)?;
        self.graph.iterator_next(connection, batch, capacity)
    }
}

/// One upstream-ordered notification cursor. Created on a connection by
/// the upstream component; owned by that connection.
pub trait NotificationIterator {
    /// Fills `batch` with up to `capacity` notifications. Returns
    /// `Ok` with a non-empty batch, `Again` with an empty one, or
    /// `End` once exhausted. Order must match the upstream source.
    fn next(
        &mut self,
        ctx: &mut IteratorContext<'_>,
        batch: &mut Vec<Rc<Notification>>,
        capacity: usize,
    ) -> Result<IteratorStatus, Error>;
}
