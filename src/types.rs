use derive_more::{Display, From, Into};
use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
use std::sync::Arc;

/// Cooperative cancellation flag shared between a graph and its caller.
///
/// Setting it is sticky; a canceled graph is terminal.
#[derive(Clone, Debug)]
#[repr(transparent)]
pub struct Interruptor(Arc<AtomicBool>);

impl Interruptor {
    pub fn new() -> Self {
        Interruptor(Arc::new(AtomicBool::new(false)))
    }

    pub fn set(&self) {
        self.0.store(true, SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(SeqCst)
    }
}

impl Default for Interruptor {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, From, Into, Display,
)]
#[repr(transparent)]
pub struct ComponentId(pub usize);

#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, From, Into, Display,
)]
#[repr(transparent)]
pub struct ConnectionId(pub usize);

/// A port is addressed by its owning component, direction, and position.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display)]
#[display(fmt = "{}:{}:{}", component, direction, index)]
pub struct PortId {
    pub component: ComponentId,
    pub direction: PortDirection,
    pub index: usize,
}

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display)]
pub enum PortDirection {
    #[display(fmt = "in")]
    Input,
    #[display(fmt = "out")]
    Output,
}

/// Slot number assigned to an integer/enumeration field class referenced
/// by a variant tag or sequence length. Decoders record decoded values in
/// a flat array indexed by this.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, From, Into, Display,
)]
#[repr(transparent)]
pub struct StoredValueIndex(pub usize);
