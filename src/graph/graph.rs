//! The graph: single owning root of components and connections, sink
//! scheduler, and listener registry.
//!
//! Ownership discipline: the graph owns every component and every
//! connection; connections refer to their endpoints by id only, so no
//! reference cycle can form. Notification pools are per graph.

use std::collections::VecDeque;
use std::rc::Rc;

use tracing::{debug, trace, warn};

use crate::error::Error;
use crate::graph::component::{
    ComponentImpl, ComponentKind, Filter, Params, PortSpec, Sink, SinkStatus, Source,
};
use crate::graph::connection::{Connection, Port};
use crate::graph::iterator::{IteratorContext, IteratorStatus, NotificationIterator};
use crate::graph::notification::{Notification, NotificationPools};
use crate::types::{ComponentId, ConnectionId, Interruptor, PortDirection, PortId};

/// Result of one scheduling turn.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ConsumeStatus {
    /// A sink consumed; more work remains.
    Ok,
    /// The scheduled sink could not progress; retry later.
    Again,
    /// Every sink has ended.
    End,
}

/// Result of a full run.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum RunStatus {
    /// Every sink ended.
    End,
    /// A sink returned `Again`; call `run` again later.
    Again,
}

#[derive(Clone, Debug)]
pub struct PortAddedEvent {
    pub component: ComponentId,
    pub component_name: String,
    pub port: PortId,
    pub port_name: String,
}

#[derive(Clone, Debug)]
pub struct PortRemovedEvent {
    pub component: ComponentId,
    pub component_name: String,
    pub port_name: String,
}

#[derive(Clone, Debug)]
pub struct PortsConnectedEvent {
    pub upstream: PortId,
    pub downstream: PortId,
}

#[derive(Clone, Debug)]
pub struct PortsDisconnectedEvent {
    pub upstream: PortId,
    pub downstream: PortId,
}

#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, derive_more::Display,
)]
pub struct ListenerId(usize);

type Listener<E> = Box<dyn FnMut(&E)>;

#[derive(Default)]
struct Listeners {
    port_added: Vec<Option<Listener<PortAddedEvent>>>,
    port_removed: Vec<Option<Listener<PortRemovedEvent>>>,
    ports_connected: Vec<Option<Listener<PortsConnectedEvent>>>,
    ports_disconnected: Vec<Option<Listener<PortsDisconnectedEvent>>>,
}

#[derive(Debug)]
struct ComponentEntry {
    name: String,
    kind: ComponentKind,
    inputs: Vec<Port>,
    outputs: Vec<Port>,
    /// Taken out while one of the component's methods runs; putting it
    /// back is unconditional.
    imp: Option<ComponentImpl>,
    ended: bool,
    removed: bool,
}

pub struct Graph {
    components: Vec<ComponentEntry>,
    connections: Vec<Connection>,
    sinks_to_consume: VecDeque<ComponentId>,
    interruptor: Interruptor,
    in_listener: bool,
    listeners: Listeners,
    pools: Rc<NotificationPools>,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        Self {
            components: Vec::new(),
            connections: Vec::new(),
            sinks_to_consume: VecDeque::new(),
            interruptor: Interruptor::new(),
            in_listener: false,
            listeners: Listeners::default(),
            pools: NotificationPools::new(),
        }
    }

    /// The pools backing this graph's event and packet notifications.
    pub fn notification_pools(&self) -> &Rc<NotificationPools> {
        &self.pools
    }

    /// Shared cancellation flag; settable from anywhere, including
    /// signal handlers.
    pub fn interruptor(&self) -> Interruptor {
        self.interruptor.clone()
    }

    pub fn cancel(&self) {
        self.interruptor.set();
    }

    pub fn is_canceled(&self) -> bool {
        self.interruptor.is_set()
    }

    fn check_mutable(&self) -> Result<(), Error> {
        if self.in_listener {
            return Err(Error::InListener);
        }
        if self.is_canceled() {
            return Err(Error::Canceled);
        }
        Ok(())
    }

    pub fn add_source(
        &mut self,
        name: impl Into<String>,
        source: Box<dyn Source>,
        params: &Params,
    ) -> Result<ComponentId, Error> {
        self.add_component(name.into(), ComponentImpl::Source(source), params)
    }

    pub fn add_filter(
        &mut self,
        name: impl Into<String>,
        filter: Box<dyn Filter>,
        params: &Params,
    ) -> Result<ComponentId, Error> {
        self.add_component(name.into(), ComponentImpl::Filter(filter), params)
    }

    pub fn add_sink(
        &mut self,
        name: impl Into<String>,
        sink: Box<dyn Sink>,
        params: &Params,
    ) -> Result<ComponentId, Error> {
        self.add_component(name.into(), ComponentImpl::Sink(sink), params)
    }

    fn add_component(
        &mut self,
        name: String,
        mut imp: ComponentImpl,
        params: &Params,
    ) -> Result<ComponentId, Error> {
        self.check_mutable()?;
        if self.components.iter().any(|c| !c.removed && c.name == name) {
            return Err(Error::Graph(format!(
                "a component named '{name}' already exists in the graph"
            )));
        }

        let mut spec = PortSpec::default();
        match &mut imp {
            ComponentImpl::Source(s) => s.initialize(params, &mut spec)?,
            ComponentImpl::Filter(f) => f.initialize(params, &mut spec)?,
            ComponentImpl::Sink(s) => s.initialize(params, &mut spec)?,
        }

        let kind = imp.kind();
        if kind == ComponentKind::Source && !spec.inputs.is_empty() {
            return Err(Error::Component(format!(
                "source component '{name}' declared input ports"
            )));
        }
        if kind == ComponentKind::Sink && !spec.outputs.is_empty() {
            return Err(Error::Component(format!(
                "sink component '{name}' declared output ports"
            )));
        }

        let id = ComponentId(self.components.len());
        let entry = ComponentEntry {
            name: name.clone(),
            kind,
            inputs: spec.inputs.into_iter().map(Port::new).collect(),
            outputs: spec.outputs.into_iter().map(Port::new).collect(),
            imp: Some(imp),
            ended: false,
            removed: false,
        };
        debug!(component = %name, %kind, "added component");
        self.components.push(entry);

        if kind == ComponentKind::Sink {
            self.sinks_to_consume.push_back(id);
        }

        let events: Vec<PortAddedEvent> = {
            let entry = &self.components[id.0];
            let mut events = Vec::new();
            for (direction, ports) in [
                (PortDirection::Input, &entry.inputs),
                (PortDirection::Output, &entry.outputs),
            ] {
                for (index, port) in ports.iter().enumerate() {
                    events.push(PortAddedEvent {
                        component: id,
                        component_name: entry.name.clone(),
                        port: PortId {
                            component: id,
                            direction,
                            index,
                        },
                        port_name: port.name.clone(),
                    });
                }
            }
            events
        };
        for event in events {
            self.dispatch_port_added(event);
        }
        Ok(id)
    }

    fn entry(&self, id: ComponentId) -> Result<&ComponentEntry, Error> {
        self.components
            .get(id.0)
            .filter(|e| !e.removed)
            .ok_or(Error::NotFound {
                kind: "component",
                name: id.to_string(),
            })
    }

    fn entry_mut(&mut self, id: ComponentId) -> Result<&mut ComponentEntry, Error> {
        self.components
            .get_mut(id.0)
            .filter(|e| !e.removed)
            .ok_or(Error::NotFound {
                kind: "component",
                name: id.to_string(),
            })
    }

    pub fn component_name(&self, id: ComponentId) -> Result<&str, Error> {
        Ok(&self.entry(id)?.name)
    }

    pub fn component_kind(&self, id: ComponentId) -> Result<ComponentKind, Error> {
        Ok(self.entry(id)?.kind)
    }

    pub fn output_port(&self, id: ComponentId, name: &str) -> Result<PortId, Error> {
        let entry = self.entry(id)?;
        let index = entry
            .outputs
            .iter()
            .position(|p| p.name == name)
            .ok_or(Error::NotFound {
                kind: "output port",
                name: name.to_owned(),
            })?;
        Ok(PortId {
            component: id,
            direction: PortDirection::Output,
            index,
        })
    }

    pub fn input_port(&self, id: ComponentId, name: &str) -> Result<PortId, Error> {
        let entry = self.entry(id)?;
        let index = entry
            .inputs
            .iter()
            .position(|p| p.name == name)
            .ok_or(Error::NotFound {
                kind: "input port",
                name: name.to_owned(),
            })?;
        Ok(PortId {
            component: id,
            direction: PortDirection::Input,
            index,
        })
    }

    fn port(&self, id: PortId) -> Result<&Port, Error> {
        let entry = self.entry(id.component)?;
        let ports = match id.direction {
            PortDirection::Input => &entry.inputs,
            PortDirection::Output => &entry.outputs,
        };
        ports.get(id.index).ok_or(Error::NotFound {
            kind: "port",
            name: id.to_string(),
        })
    }

    fn port_mut(&mut self, id: PortId) -> Result<&mut Port, Error> {
        let entry = self.entry_mut(id.component)?;
        let ports = match id.direction {
            PortDirection::Input => &mut entry.inputs,
            PortDirection::Output => &mut entry.outputs,
        };
        ports.get_mut(id.index).ok_or(Error::NotFound {
            kind: "port",
            name: id.to_string(),
        })
    }

    /// Connects an output port to an input port. The downstream
    /// component may refuse; on acceptance, `port_connected` runs
    /// downstream first, then upstream.
    pub fn connect(
        &mut self,
        upstream: PortId,
        downstream: PortId,
    ) -> Result<ConnectionId, Error> {
        self.check_mutable()?;
        if upstream.direction != PortDirection::Output
            || downstream.direction != PortDirection::Input
        {
            return Err(Error::Graph(
                "a connection joins an output port to an input port".into(),
            ));
        }
        if self.port(upstream)?.connection.is_some()
            || self.port(downstream)?.connection.is_some()
        {
            return Err(Error::Graph("port is already connected".into()));
        }

        let upstream_comp_name = self.entry(upstream.component)?.name.clone();
        let upstream_port_name = self.port(upstream)?.name.clone();
        let downstream_port_name = self.port(downstream)?.name.clone();
        let downstream_comp_name = self.entry(downstream.component)?.name.clone();

        let accepted = {
            let entry = self.entry_mut(downstream.component)?;
            let imp = entry.imp.as_mut().ok_or(Error::Graph(
                "cannot connect a port of a component that is currently running".into(),
            ))?;
            match imp {
                ComponentImpl::Filter(f) => f.accept_input_port_connection(
                    &downstream_port_name,
                    &upstream_comp_name,
                    &upstream_port_name,
                ),
                ComponentImpl::Sink(s) => s.accept_input_port_connection(
                    &downstream_port_name,
                    &upstream_comp_name,
                    &upstream_port_name,
                ),
                ComponentImpl::Source(_) => {
                    return Err(Error::Graph(
                        "a source component has no input ports".into(),
                    ))
                }
            }
        };
        if !accepted {
            return Err(Error::PortRefused(format!(
                "'{downstream_comp_name}.{downstream_port_name}' refused \
                 '{upstream_comp_name}.{upstream_port_name}'"
            )));
        }

        let id = ConnectionId(self.connections.len());
        self.connections.push(Connection::new(upstream, downstream));
        self.port_mut(upstream)?.connection = Some(id);
        self.port_mut(downstream)?.connection = Some(id);

        // Downstream first, then upstream.
        {
            let entry = self.entry_mut(downstream.component)?;
            if let Some(imp) = entry.imp.as_mut() {
                match imp {
                    ComponentImpl::Filter(f) => f.port_connected(
                        &downstream_port_name,
                        &upstream_comp_name,
                        &upstream_port_name,
                    ),
                    ComponentImpl::Sink(s) => s.port_connected(
                        &downstream_port_name,
                        &upstream_comp_name,
                        &upstream_port_name,
                    ),
                    ComponentImpl::Source(_) => {}
                }
            }
        }
        {
            let entry = self.entry_mut(upstream.component)?;
            if let Some(imp) = entry.imp.as_mut() {
                match imp {
                    ComponentImpl::Source(s) => s.port_connected(
                        &upstream_port_name,
                        &downstream_comp_name,
                        &downstream_port_name,
                    ),
                    ComponentImpl::Filter(f) => f.port_connected(
                        &upstream_port_name,
                        &downstream_comp_name,
                        &downstream_port_name,
                    ),
                    ComponentImpl::Sink(_) => {}
                }
            }
        }

        debug!(
            upstream = %upstream_comp_name,
            upstream_port = %upstream_port_name,
            downstream = %downstream_comp_name,
            downstream_port = %downstream_port_name,
            "connected ports"
        );
        self.dispatch_ports_connected(PortsConnectedEvent {
            upstream,
            downstream,
        });
        Ok(id)
    }

    /// Severs a connection, notifying both endpoints and the
    /// ports-disconnected listeners.
    pub fn disconnect(&mut self, id: ConnectionId) -> Result<(), Error> {
        self.check_mutable()?;
        let (upstream, downstream) = {
            let conn = self.connections.get_mut(id.0).ok_or(Error::NotFound {
                kind: "connection",
                name: id.to_string(),
            })?;
            if conn.detached {
                return Err(Error::Graph("connection is already severed".into()));
            }
            conn.detached = true;
            conn.iterator = None;
            (conn.upstream, conn.downstream)
        };
        self.port_mut(upstream)?.connection = None;
        self.port_mut(downstream)?.connection = None;

        for port in [downstream, upstream] {
            let port_name = self.port(port)?.name.clone();
            if let Ok(entry) = self.entry_mut(port.component) {
                if let Some(imp) = entry.imp.as_mut() {
                    match imp {
                        ComponentImpl::Source(s) => s.port_disconnected(&port_name),
                        ComponentImpl::Filter(f) => f.port_disconnected(&port_name),
                        ComponentImpl::Sink(s) => s.port_disconnected(&port_name),
                    }
                }
            }
        }

        self.dispatch_ports_disconnected(PortsDisconnectedEvent {
            upstream,
            downstream,
        });
        Ok(())
    }

    /// Removes a component: severs its connections, announces its
    /// ports' removal, and finalizes it.
    pub fn remove_component(&mut self, id: ComponentId) -> Result<(), Error> {
        self.check_mutable()?;
        let entry = self.entry(id)?;
        let name = entry.name.clone();
        let port_names: Vec<String> = entry
            .inputs
            .iter()
            .chain(entry.outputs.iter())
            .map(|p| p.name.clone())
            .collect();
        let connected: Vec<ConnectionId> = entry
            .inputs
            .iter()
            .chain(entry.outputs.iter())
            .filter_map(|p| p.connection)
            .collect();
        for conn in connected {
            self.disconnect(conn)?;
        }

        let entry = self.entry_mut(id)?;
        if let Some(mut imp) = entry.imp.take() {
            match &mut imp {
                ComponentImpl::Source(s) => s.finalize(),
                ComponentImpl::Filter(f) => f.finalize(),
                ComponentImpl::Sink(s) => s.finalize(),
            }
        }
        entry.removed = true;
        self.sinks_to_consume.retain(|sid| *sid != id);
        debug!(component = %name, "removed component");

        for port_name in port_names {
            self.dispatch_port_removed(PortRemovedEvent {
                component: id,
                component_name: name.clone(),
                port_name,
            });
        }
        Ok(())
    }

    pub(crate) fn input_connection(
        &self,
        component: ComponentId,
        input_index: usize,
    ) -> Result<ConnectionId, Error> {
        let entry = self.entry(component)?;
        let port = entry.inputs.get(input_index).ok_or(Error::NotFound {
            kind: "input port",
            name: format!("{component}:{input_index}"),
        })?;
        port.connection.ok_or_else(|| {
            Error::Graph(format!(
                "input port '{}' of '{}' is not connected",
                port.name, entry.name
            ))
        })
    }

    /// Pulls the next batch from a connection's iterator, creating the
    /// iterator on first use. Every delivered notification is frozen.
    pub(crate) fn iterator_next(
        &mut self,
        id: ConnectionId,
        batch: &mut Vec<Rc<Notification>>,
        capacity: usize,
    ) -> Result<IteratorStatus, Error> {
        batch.clear();
        let (upstream, have_iterator, detached) = {
            let conn = self.connections.get(id.0).ok_or(Error::NotFound {
                kind: "connection",
                name: id.to_string(),
            })?;
            (conn.upstream, conn.iterator.is_some(), conn.detached)
        };
        if detached {
            return Err(Error::Graph(
                "cannot iterate a severed or busy connection".into(),
            ));
        }

        if !have_iterator {
            let port_name = self.port(upstream)?.name.clone();
            let entry = self.entry_mut(upstream.component)?;
            let imp = entry.imp.as_mut().ok_or(Error::Graph(
                "cannot create an iterator on a component that is currently running".into(),
            ))?;
            let iterator: Box<dyn NotificationIterator> = match imp {
                ComponentImpl::Source(s) => s.create_notification_iterator(&port_name)?,
                ComponentImpl::Filter(f) => f.create_notification_iterator(&port_name)?,
                ComponentImpl::Sink(_) => {
                    return Err(Error::Graph(
                        "a sink component cannot produce notifications".into(),
                    ))
                }
            };
            trace!(connection = %id, port = %port_name, "created notification iterator");
            self.connections[id.0].iterator = Some(iterator);
        }

        let mut iterator = self.connections[id.0].iterator.take().ok_or_else(|| {
            Error::Graph("the connection's iterator disappeared after creation".into())
        })?;
        self.connections[id.0].detached = true;
        let mut ctx = IteratorContext {
            graph: self,
            component: upstream.component,
        };
        let result = iterator.next(&mut ctx, batch, capacity);
        self.connections[id.0].detached = false;
        self.connections[id.0].iterator = Some(iterator);

        let status = result?;
        if batch.len() > capacity {
            return Err(Error::Component(format!(
                "iterator returned {} notifications for a capacity of {capacity}",
                batch.len()
            )));
        }
        if status == IteratorStatus::Ok && batch.is_empty() {
            return Err(Error::Component(
                "iterator reported progress with an empty batch".into(),
            ));
        }
        for notif in batch.iter() {
            notif.freeze();
        }
        Ok(status)
    }

    /// Runs one scheduling turn: the sink at the head of the queue
    /// consumes once and is requeued at the tail unless it ended.
    pub fn consume(&mut self) -> Result<ConsumeStatus, Error> {
        if self.is_canceled() {
            return Err(Error::Canceled);
        }
        let Some(sink_id) = self.sinks_to_consume.pop_front() else {
            return Ok(ConsumeStatus::End);
        };

        let entry = self.entry_mut(sink_id)?;
        if entry.ended {
            return Ok(if self.sinks_to_consume.is_empty() {
                ConsumeStatus::End
            } else {
                ConsumeStatus::Ok
            });
        }
        let name = entry.name.clone();
        let mut imp = entry.imp.take().ok_or(Error::Graph(
            "sink is already being consumed".into(),
        ))?;
        trace!(sink = %name, "consuming");

        let result = match &mut imp {
            ComponentImpl::Sink(sink) => {
                let mut ctx = ConsumeContext {
                    graph: self,
                    component: sink_id,
                };
                sink.consume(&mut ctx)
            }
            _ => Err(Error::Graph(
                "a non-sink component was scheduled for consumption".into(),
            )),
        };
        self.entry_mut(sink_id)?.imp = Some(imp);

        match result {
            Ok(SinkStatus::Ok) => {
                self.sinks_to_consume.push_back(sink_id);
                Ok(ConsumeStatus::Ok)
            }
            Ok(SinkStatus::Again) => {
                self.sinks_to_consume.push_back(sink_id);
                Ok(ConsumeStatus::Again)
            }
            Ok(SinkStatus::End) => {
                debug!(sink = %name, "sink ended");
                self.entry_mut(sink_id)?.ended = true;
                if self.sinks_to_consume.is_empty() {
                    Ok(ConsumeStatus::End)
                } else {
                    Ok(ConsumeStatus::Ok)
                }
            }
            Err(e) => {
                warn!(sink = %name, error = %e, "sink failed; removing from schedule");
                self.entry_mut(sink_id)?.ended = true;
                Err(e)
            }
        }
    }

    /// Consumes until every sink ends, an error occurs, cancellation
    /// is requested, or a sink suspends with `Again`.
    pub fn run(&mut self) -> Result<RunStatus, Error> {
        debug!("running graph");
        loop {
            match self.consume()? {
                ConsumeStatus::Ok => {}
                ConsumeStatus::Again => return Ok(RunStatus::Again),
                ConsumeStatus::End => return Ok(RunStatus::End),
            }
        }
    }

    fn check_listener_registration(&self) -> Result<(), Error> {
        if self.in_listener {
            return Err(Error::InListener);
        }
        Ok(())
    }

    pub fn add_port_added_listener(
        &mut self,
        listener: impl FnMut(&PortAddedEvent) + 'static,
    ) -> Result<ListenerId, Error> {
        self.check_listener_registration()?;
        self.listeners.port_added.push(Some(Box::new(listener)));
        Ok(ListenerId(self.listeners.port_added.len() - 1))
    }

    pub fn add_port_removed_listener(
        &mut self,
        listener: impl FnMut(&PortRemovedEvent) + 'static,
    ) -> Result<ListenerId, Error> {
        self.check_listener_registration()?;
        self.listeners.port_removed.push(Some(Box::new(listener)));
        Ok(ListenerId(self.listeners.port_removed.len() - 1))
    }

    pub fn add_ports_connected_listener(
        &mut self,
        listener: impl FnMut(&PortsConnectedEvent) + 'static,
    ) -> Result<ListenerId, Error> {
        self.check_listener_registration()?;
        self.listeners
            .ports_connected
            .push(Some(Box::new(listener)));
        Ok(ListenerId(self.listeners.ports_connected.len() - 1))
    }

    pub fn add_ports_disconnected_listener(
        &mut self,
        listener: impl FnMut(&PortsDisconnectedEvent) + 'static,
    ) -> Result<ListenerId, Error> {
        self.check_listener_registration()?;
        self.listeners
            .ports_disconnected
            .push(Some(Box::new(listener)));
        Ok(ListenerId(self.listeners.ports_disconnected.len() - 1))
    }

    pub fn remove_port_added_listener(&mut self, id: ListenerId) -> Result<(), Error> {
        self.check_listener_registration()?;
        if let Some(slot) = self.listeners.port_added.get_mut(id.0) {
            *slot = None;
        }
        Ok(())
    }

    fn dispatch_port_added(&mut self, event: PortAddedEvent) {
        let mut listeners = std::mem::take(&mut self.listeners.port_added);
        self.in_listener = true;
        for listener in listeners.iter_mut().flatten() {
            listener(&event);
        }
        self.in_listener = false;
        self.listeners.port_added = listeners;
    }

    fn dispatch_port_removed(&mut self, event: PortRemovedEvent) {
        let mut listeners = std::mem::take(&mut self.listeners.port_removed);
        self.in_listener = true;
        for listener in listeners.iter_mut().flatten() {
            listener(&event);
        }
        self.in_listener = false;
        self.listeners.port_removed = listeners;
    }

    fn dispatch_ports_connected(&mut self, event: PortsConnectedEvent) {
        let mut listeners = std::mem::take(&mut self.listeners.ports_connected);
        self.in_listener = true;
        for listener in listeners.iter_mut().flatten() {
            listener(&event);
        }
        self.in_listener = false;
        self.listeners.ports_connected = listeners;
    }

    fn dispatch_ports_disconnected(&mut self, event: PortsDisconnectedEvent) {
        let mut listeners = std::mem::take(&mut self.listeners.ports_disconnected);
        self.in_listener = true;
        for listener in listeners.iter_mut().flatten() {
            listener(&event);
        }
        self.in_listener = false;
        self.listeners.ports_disconnected = listeners;
    }
}

impl Drop for Graph {
    fn drop(&mut self) {
        for entry in &mut self.components {
            if let Some(mut imp) = entry.imp.take() {
                match &mut imp {
                    ComponentImpl::Source(s) => s.finalize(),
                    ComponentImpl::Filter(f) => f.finalize(),
                    ComponentImpl::Sink(s) => s.finalize(),
                }
            }
        }
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("components", &self.components)
            .field("connections", &self.connections)
            .field("sinks_to_consume", &self.sinks_to_consume)
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

/// Access a sink gets to its own input ports while consuming.
pub struct ConsumeContext<'a> {
    graph: &'a mut Graph,
    component: ComponentId,
}

impl ConsumeContext<'_> {
    pub fn input_port_count(&self) -> usize {
        self.graph
            .entry(self.component)
            .map(|e| e.inputs.len())
            .unwrap_or(0)
    }

    /// Pulls up to `capacity` notifications from the iterator on the
    /// given input port's connection.
    pub fn notification_iterator_next(
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

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;

    /// Consumes nothing; reports `Ok` a fixed number of times, then
    /// `End`, recording each turn into a shared journal.
    struct TurnCounter {
        name: &'static str,
        remaining: usize,
        journal: Rc<RefCell<Vec<&'static str>>>,
    }

    impl Sink for TurnCounter {
        fn initialize(&mut self, _params: &Params, _ports: &mut PortSpec) -> Result<(), Error> {
            Ok(())
        }

        fn consume(&mut self, _ctx: &mut ConsumeContext<'_>) -> Result<SinkStatus, Error> {
            self.journal.borrow_mut().push(self.name);
            if self.remaining == 0 {
                return Ok(SinkStatus::End);
            }
            self.remaining -= 1;
            if self.remaining == 0 {
                Ok(SinkStatus::End)
            } else {
                Ok(SinkStatus::Ok)
            }
        }
    }

    #[test]
    fn sinks_are_scheduled_round_robin() {
        let journal = Rc::new(RefCell::new(Vec::new()));
        let mut graph = Graph::new();
        let n = 4;
        for name in ["a", "b"] {
            graph
                .add_sink(
                    name,
                    Box::new(TurnCounter {
                        name: if name == "a" { "a" } else { "b" },
                        remaining: n,
                        journal: journal.clone(),
                    }),
                    &Params::new(),
                )
                .unwrap();
        }

        assert_eq!(graph.run().unwrap(), RunStatus::End);
        assert_eq!(
            *journal.borrow(),
            vec!["a", "b", "a", "b", "a", "b", "a", "b"]
        );
    }

    #[test]
    fn ended_sink_is_not_rescheduled() {
        let journal = Rc::new(RefCell::new(Vec::new()));
        let mut graph = Graph::new();
        graph
            .add_sink(
                "short",
                Box::new(TurnCounter {
                    name: "short",
                    remaining: 1,
                    journal: journal.clone(),
                }),
                &Params::new(),
            )
            .unwrap();
        graph
            .add_sink(
                "long",
                Box::new(TurnCounter {
                    name: "long",
                    remaining: 3,
                    journal: journal.clone(),
                }),
                &Params::new(),
            )
            .unwrap();
        assert_eq!(graph.run().unwrap(), RunStatus::End);
        assert_eq!(*journal.borrow(), vec!["short", "long", "long", "long"]);
    }

    struct AgainOnce {
        fired: bool,
    }

    impl Sink for AgainOnce {
        fn initialize(&mut self, _params: &Params, _ports: &mut PortSpec) -> Result<(), Error> {
            Ok(())
        }

        fn consume(&mut self, _ctx: &mut ConsumeContext<'_>) -> Result<SinkStatus, Error> {
            if self.fired {
                Ok(SinkStatus::End)
            } else {
                self.fired = true;
                Ok(SinkStatus::Again)
            }
        }
    }

    #[test]
    fn again_suspends_run_and_requeues_the_sink() {
        let mut graph = Graph::new();
        graph
            .add_sink("s", Box::new(AgainOnce { fired: false }), &Params::new())
            .unwrap();
        assert_eq!(graph.run().unwrap(), RunStatus::Again);
        assert_eq!(graph.run().unwrap(), RunStatus::End);
    }

    #[test]
    fn canceled_graph_is_terminal() {
        let mut graph = Graph::new();
        let journal = Rc::new(RefCell::new(Vec::new()));
        graph
            .add_sink(
                "s",
                Box::new(TurnCounter {
                    name: "s",
                    remaining: 100,
                    journal,
                }),
                &Params::new(),
            )
            .unwrap();
        let interruptor = graph.interruptor();
        interruptor.set();
        assert!(matches!(graph.run(), Err(Error::Canceled)));
        assert!(graph.is_canceled());
        assert!(matches!(graph.consume(), Err(Error::Canceled)));
    }

    struct Refuser;

    impl Sink for Refuser {
        fn initialize(&mut self, _params: &Params, ports: &mut PortSpec) -> Result<(), Error> {
            ports.add_input_port("in");
            Ok(())
        }

        fn accept_input_port_connection(
            &mut self,
            _port: &str,
            _upstream_component: &str,
            _upstream_port: &str,
        ) -> bool {
            false
        }

        fn consume(&mut self, _ctx: &mut ConsumeContext<'_>) -> Result<SinkStatus, Error> {
            Ok(SinkStatus::End)
        }
    }

    struct NoopSource;

    impl Source for NoopSource {
        fn initialize(&mut self, _params: &Params, ports: &mut PortSpec) -> Result<(), Error> {
            ports.add_output_port("out");
            Ok(())
        }

        fn create_notification_iterator(
            &mut self,
            _port: &str,
        ) -> Result<Box<dyn NotificationIterator>, Error> {
            struct Empty;
            impl NotificationIterator for Empty {
                fn next(
                    &mut self,
                    _ctx: &mut IteratorContext<'_>,
                    _batch: &mut Vec<Rc<Notification>>,
                    _capacity: usize,
                ) -> Result<IteratorStatus, Error> {
                    Ok(IteratorStatus::End)
                }
            }
            Ok(Box::new(Empty))
        }
    }

    #[test]
    fn downstream_refusal_blocks_the_connection() {
        let mut graph = Graph::new();
        let src = graph
            .add_source("src", Box::new(NoopSource), &Params::new())
            .unwrap();
        let sink = graph.add_sink("sink", Box::new(Refuser), &Params::new()).unwrap();
        let out = graph.output_port(src, "out").unwrap();
        let inp = graph.input_port(sink, "in").unwrap();
        assert!(matches!(graph.connect(out, inp), Err(Error::PortRefused(_))));
        // Ports remain free for another attempt.
        assert!(graph.port(out).unwrap().connection.is_none());
        assert!(graph.port(inp).unwrap().connection.is_none());
    }

    #[test]
    fn listeners_observe_port_and_connection_events() {
        let events = Rc::new(RefCell::new(Vec::new()));
        let mut graph = Graph::new();
        {
            let events = events.clone();
            graph
                .add_port_added_listener(move |e| {
                    events.borrow_mut().push(format!("added:{}", e.port_name));
                })
                .unwrap();
        }
        {
            let events = events.clone();
            graph
                .add_ports_connected_listener(move |e| {
                    events
                        .borrow_mut()
                        .push(format!("connected:{}->{}", e.upstream, e.downstream));
                })
                .unwrap();
        }
        {
            let events = events.clone();
            graph
                .add_ports_disconnected_listener(move |_| {
                    events.borrow_mut().push("disconnected".into());
                })
                .unwrap();
        }

        let src = graph
            .add_source("src", Box::new(NoopSource), &Params::new())
            .unwrap();
        struct Open;
        impl Sink for Open {
            fn initialize(&mut self, _params: &Params, ports: &mut PortSpec) -> Result<(), Error> {
                ports.add_input_port("in");
                Ok(())
            }
            fn consume(&mut self, _ctx: &mut ConsumeContext<'_>) -> Result<SinkStatus, Error> {
                Ok(SinkStatus::End)
            }
        }
        let sink = graph.add_sink("sink", Box::new(Open), &Params::new()).unwrap();
        let out = graph.output_port(src, "out").unwrap();
        let inp = graph.input_port(sink, "in").unwrap();
        let conn = graph.connect(out, inp).unwrap();
        graph.disconnect(conn).unwrap();

        let seen = events.borrow();
        assert_eq!(seen[0], "added:out");
        assert_eq!(seen[1], "added:in");
        assert!(seen[2].starts_with("connected:"));
        assert_eq!(seen[3], "disconnected");
    }

    #[test]
    fn listeners_run_during_component_addition() {
        let fired = Rc::new(RefCell::new(false));
        let mut graph = Graph::new();
        {
            let fired = fired.clone();
            graph
                .add_port_added_listener(move |e| {
                    assert_eq!(e.component_name, "src");
                    *fired.borrow_mut() = true;
                })
                .unwrap();
        }
        graph
            .add_source("src", Box::new(NoopSource), &Params::new())
            .unwrap();
        assert!(*fired.borrow());
    }

    #[test]
    fn duplicate_component_names_are_rejected() {
        let mut graph = Graph::new();
        graph
            .add_source("s", Box::new(NoopSource), &Params::new())
            .unwrap();
        assert!(graph
            .add_source("s", Box::new(NoopSource), &Params::new())
            .is_err());
    }

    #[test]
    fn removing_a_component_fires_port_removed() {
        let removed = Rc::new(RefCell::new(Vec::new()));
        let mut graph = Graph::new();
        {
            let removed = removed.clone();
            graph
                .add_port_removed_listener(move |e| {
                    removed.borrow_mut().push(e.port_name.clone());
                })
                .unwrap();
        }
        let src = graph
            .add_source("src", Box::new(NoopSource), &Params::new())
            .unwrap();
        graph.remove_component(src).unwrap();
        assert_eq!(*removed.borrow(), vec!["out".to_owned()]);
        assert!(graph.component_name(src).is_err());
    }
}
