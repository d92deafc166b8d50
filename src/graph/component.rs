//! Component classes: the three trait flavours a graph can host and
//! the typed parameter values they are initialized with.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::Error;
use crate::graph::graph::ConsumeContext;
use crate::graph::iterator::NotificationIterator;

/// A typed initialization parameter value.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Integer(i64),
    UnsignedInteger(u64),
    Float(f64),
    String(String),
}

pub type Params = BTreeMap<String, ParamValue>;

/// Collects the port names a component declares during initialization.
#[derive(Debug, Default)]
pub struct PortSpec {
    pub(crate) inputs: Vec<String>,
    pub(crate) outputs: Vec<String>,
}

impl PortSpec {
    pub fn add_input_port(&mut self, name: impl Into<String>) {
        self.inputs.push(name.into());
    }

    pub fn add_output_port(&mut self, name: impl Into<String>) {
        self.outputs.push(name.into());
    }
}

/// What a sink's `consume` reported.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SinkStatus {
    /// Made progress; schedule me again.
    Ok,
    /// No progress possible right now; retry later.
    Again,
    /// Finished for good.
    End,
}

pub trait Source {
    /// Declare output ports and capture parameters.
    fn initialize(&mut self, params: &Params, ports: &mut PortSpec) -> Result<(), Error>;

    fn finalize(&mut self) {}

    fn query(&self, object: &str, _params: &Params) -> Result<ParamValue, Error> {
        Err(Error::NotFound {
            kind: "query object",
            name: object.to_owned(),
        })
    }

    fn port_connected(&mut self, _port: &str, _peer_component: &str, _peer_port: &str) {}

    fn port_disconnected(&mut self, _port: &str) {}

    /// Create a notification iterator for one of this source's output
    /// ports.
    fn create_notification_iterator(
        &mut self,
        port: &str,
    ) -> Result<Box<dyn NotificationIterator>, Error>;
}

pub trait Filter {
    fn initialize(&mut self, params: &Params, ports: &mut PortSpec) -> Result<(), Error>;

    fn finalize(&mut self) {}

    fn query(&self, object: &str, _params: &Params) -> Result<ParamValue, Error> {
        Err(Error::NotFound {
            kind: "query object",
            name: object.to_owned(),
        })
    }

    /// Downstream veto over a proposed connection to one of this
    /// filter's input ports.
    fn accept_input_port_connection(
        &mut self,
        _port: &str,
        _upstream_component: &str,
        _upstream_port: &str,
    ) -> bool {
        true
    }

    fn port_connected(&mut self, _port: &str, _peer_component: &str, _peer_port: &str) {}

    fn port_disconnected(&mut self, _port: &str) {}

    fn create_notification_iterator(
        &mut self,
        port: &str,
    ) -> Result<Box<dyn NotificationIterator>, Error>;
}

pub trait Sink {
    fn initialize(&mut self, params: &Params, ports: &mut PortSpec) -> Result<(), Error>;

    fn finalize(&mut self) {}

    fn query(&self, object: &str, _params: &Params) -> Result<ParamValue, Error> {
        Err(Error::NotFound {
            kind: "query object",
            name: object.to_owned(),
        })
    }

    fn accept_input_port_connection(
        &mut self,
        _port: &str,
        _upstream_component: &str,
        _upstream_port: &str,
    ) -> bool {
        true
    }

    fn port_connected(&mut self, _port: &str, _peer_component: &str, _peer_port: &str) {}

    fn port_disconnected(&mut self, _port: &str) {}

    /// Pull and process notifications. Called exactly once per
    /// scheduling turn.
    fn consume(&mut self, ctx: &mut ConsumeContext<'_>) -> Result<SinkStatus, Error>;
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, derive_more::Display)]
pub enum ComponentKind {
    #[display(fmt = "source")]
    Source,
    #[display(fmt = "filter")]
    Filter,
    #[display(fmt = "sink")]
    Sink,
}

pub(crate) enum ComponentImpl {
    Source(Box<dyn Source>),
    Filter(Box<dyn Filter>),
    Sink(Box<dyn Sink>),
}

impl ComponentImpl {
    pub(crate) fn kind(&self) -> ComponentKind {
        match self {
            ComponentImpl::Source(_) => ComponentKind::Source,
            ComponentImpl::Filter(_) => ComponentKind::Filter,
            ComponentImpl::Sink(_) => ComponentKind::Sink,
        }
    }
}

impl std::fmt::Debug for ComponentImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ComponentImpl::{}", self.kind())
    }
}
