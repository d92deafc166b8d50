//! Notifications: the five message kinds that flow through a graph,
//! plus the per-graph pools that recycle the three high-frequency
//! kinds.

use std::cell::{Cell, Ref, RefCell};
use std::rc::{Rc, Weak};

use tracing::trace;

use crate::ir::event::Event;
use crate::ir::packet::Packet;
use crate::ir::stream::Stream;
use crate::object::FreezeFlag;

/// Tag of a notification. Unknown kinds are reserved; consumers must
/// treat anything they do not recognize as an error.
#[non_exhaustive]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, derive_more::Display)]
pub enum NotificationKind {
    #[display(fmt = "stream-begin")]
    StreamBegin,
    #[display(fmt = "packet-begin")]
    PacketBegin,
    #[display(fmt = "event")]
    Event,
    #[display(fmt = "packet-end")]
    PacketEnd,
    #[display(fmt = "stream-end")]
    StreamEnd,
}

#[derive(Debug)]
pub(crate) enum NotificationData {
    /// Pooled state only; never observable through a delivered
    /// notification.
    Empty,
    StreamBegin {
        stream: Rc<Stream>,
        default_clock_value: Option<u64>,
    },
    PacketBegin {
        packet: Rc<Packet>,
        default_clock_value: Option<u64>,
    },
    Event(Event),
    PacketEnd {
        packet: Rc<Packet>,
        default_clock_value: Option<u64>,
    },
    StreamEnd {
        stream: Rc<Stream>,
        default_clock_value: Option<u64>,
    },
}

/// A message delivered through the graph. Frozen at first delivery;
/// from then on only reference counting is allowed.
#[derive(Debug)]
pub struct Notification {
    freeze: FreezeFlag,
    pools: RefCell<Weak<NotificationPools>>,
    /// Kept beside the data so the tag survives the pooled reset
    /// state; re-armed whenever the data is replaced.
    kind: Cell<NotificationKind>,
    data: RefCell<NotificationData>,
}

impl Notification {
    fn new(kind: NotificationKind, data: NotificationData) -> Rc<Self> {
        Rc::new(Self {
            freeze: FreezeFlag::new(),
            pools: RefCell::new(Weak::new()),
            kind: Cell::new(kind),
            data: RefCell::new(data),
        })
    }

    pub fn stream_begin(stream: Rc<Stream>, default_clock_value: Option<u64>) -> Rc<Self> {
        Self::new(
            NotificationKind::StreamBegin,
            NotificationData::StreamBegin {
                stream,
                default_clock_value,
            },
        )
    }

    pub fn stream_end(stream: Rc<Stream>, default_clock_value: Option<u64>) -> Rc<Self> {
        Self::new(
            NotificationKind::StreamEnd,
            NotificationData::StreamEnd {
                stream,
                default_clock_value,
            },
        )
    }

    pub fn packet_begin(packet: Rc<Packet>, default_clock_value: Option<u64>) -> Rc<Self> {
        Self::new(
            NotificationKind::PacketBegin,
            NotificationData::PacketBegin {
                packet,
                default_clock_value,
            },
        )
    }

    pub fn packet_end(packet: Rc<Packet>, default_clock_value: Option<u64>) -> Rc<Self> {
        Self::new(
            NotificationKind::PacketEnd,
            NotificationData::PacketEnd {
                packet,
                default_clock_value,
            },
        )
    }

    pub fn event(event: Event) -> Rc<Self> {
        Self::new(NotificationKind::Event, NotificationData::Event(event))
    }

    pub fn kind(&self) -> NotificationKind {
        self.kind.get()
    }

    /// The event carried by an event notification.
    pub fn event_ref(&self) -> Option<Ref<'_, Event>> {
        Ref::filter_map(self.data.borrow(), |d| match d {
            NotificationData::Event(e) => Some(e),
            _ => None,
        })
        .ok()
    }

    /// The packet of a packet-begin/packet-end/event notification.
    pub fn packet(&self) -> Option<Rc<Packet>> {
        match &*self.data.borrow() {
            NotificationData::PacketBegin { packet, .. }
            | NotificationData::PacketEnd { packet, .. } => Some(packet.clone()),
            NotificationData::Event(e) => Some(e.packet().clone()),
            _ => None,
        }
    }

    /// The stream every notification kind ultimately refers to.
    pub fn stream(&self) -> Option<Rc<Stream>> {
        match &*self.data.borrow() {
            NotificationData::StreamBegin { stream, .. }
            | NotificationData::StreamEnd { stream, .. } => Some(stream.clone()),
            NotificationData::PacketBegin { packet, .. }
            | NotificationData::PacketEnd { packet, .. } => Some(packet.stream().clone()),
            NotificationData::Event(e) => Some(e.packet().stream().clone()),
            NotificationData::Empty => None,
        }
    }

    pub fn default_clock_value(&self) -> Option<u64> {
        match &*self.data.borrow() {
            NotificationData::StreamBegin {
                default_clock_value, ..
            }
            | NotificationData::PacketBegin {
                default_clock_value, ..
            }
            | NotificationData::PacketEnd {
                default_clock_value, ..
            }
            | NotificationData::StreamEnd {
                default_clock_value, ..
            } => *default_clock_value,
            NotificationData::Event(e) => e.default_clock_value(),
            NotificationData::Empty => None,
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.freeze.is_frozen()
    }

    /// Marks the notification delivered. Freezing an event notification
    /// freezes the event's packet; packet notifications freeze theirs.
    pub fn freeze(&self) {
        if self.freeze.is_frozen() {
            return;
        }
        self.freeze.freeze();
        match &*self.data.borrow() {
            NotificationData::Event(e) => e.freeze(),
            NotificationData::PacketBegin { packet, .. }
            | NotificationData::PacketEnd { packet, .. } => packet.freeze(),
            _ => {}
        }
    }

    /// Returns the notification to its graph's pool when the caller
    /// held the last reference and the owning graph still exists;
    /// otherwise it simply drops.
    pub fn try_recycle(this: Rc<Notification>) {
        let pools = this.pools.borrow().upgrade();
        if let Some(pools) = pools {
            pools.recycle(this);
        }
    }
}

/// Per-graph pools for the event, packet-begin, and packet-end
/// notifications. Stream begin/end are rare enough to always allocate.
#[derive(Debug, Default)]
pub struct NotificationPools {
    event: RefCell<Vec<Rc<Notification>>>,
    packet_begin: RefCell<Vec<Rc<Notification>>>,
    packet_end: RefCell<Vec<Rc<Notification>>>,
}

impl NotificationPools {
    const POOL_CAPACITY: usize = 64;

    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    fn acquire(
        self: &Rc<Self>,
        pool: &RefCell<Vec<Rc<Notification>>>,
        kind: NotificationKind,
        data: NotificationData,
    ) -> Rc<Notification> {
        if let Some(notif) = pool.borrow_mut().pop() {
            notif.kind.set(kind);
            *notif.data.borrow_mut() = data;
            return notif;
        }
        let notif = Notification::new(kind, data);
        *notif.pools.borrow_mut() = Rc::downgrade(self);
        notif
    }

    pub fn create_event_notification(self: &Rc<Self>, event: Event) -> Rc<Notification> {
        self.acquire(
            &self.event,
            NotificationKind::Event,
            NotificationData::Event(event),
        )
    }

    pub fn create_packet_begin_notification(
        self: &Rc<Self>,
        packet: Rc<Packet>,
        default_clock_value: Option<u64>,
    ) -> Rc<Notification> {
        self.acquire(
            &self.packet_begin,
            NotificationKind::PacketBegin,
            NotificationData::PacketBegin {
                packet,
                default_clock_value,
            },
        )
    }

    pub fn create_packet_end_notification(
        self: &Rc<Self>,
        packet: Rc<Packet>,
        default_clock_value: Option<u64>,
    ) -> Rc<Notification> {
        self.acquire(
            &self.packet_end,
            NotificationKind::PacketEnd,
            NotificationData::PacketEnd {
                packet,
                default_clock_value,
            },
        )
    }

    /// Recycles a notification whose last reference the caller holds.
    pub fn recycle(&self, notif: Rc<Notification>) {
        if Rc::strong_count(&notif) != 1 {
            return;
        }
        let pool = match &*notif.data.borrow() {
            NotificationData::Event(_) => &self.event,
            NotificationData::PacketBegin { .. } => &self.packet_begin,
            NotificationData::PacketEnd { .. } => &self.packet_end,
            _ => return,
        };
        let mut pool = pool.borrow_mut();
        if pool.len() >= Self::POOL_CAPACITY {
            return;
        }
        trace!("recycling notification");
        *notif.data.borrow_mut() = NotificationData::Empty;
        notif.freeze.reset();
        pool.push(notif);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::event_class::EventClass;
    use crate::ir::packet::PreviousPacketAvailability;
    use crate::ir::stream_class::StreamClass;
    use crate::ir::trace::Trace;
    use pretty_assertions::assert_eq;

    fn stream() -> Rc<Stream> {
        let trace = Trace::new();
        let sc = StreamClass::new(0);
        sc.add_event_class(EventClass::new(0, "e")).unwrap();
        trace.add_stream_class(sc.clone()).unwrap();
        trace.create_stream(sc, 0).unwrap()
    }

    #[test]
    fn kinds_and_accessors() {
        let s = stream();
        let packet = s.create_packet(PreviousPacketAvailability::None, None);
        let n = Notification::packet_begin(packet.clone(), Some(5));
        assert_eq!(n.kind(), NotificationKind::PacketBegin);
        assert_eq!(n.default_clock_value(), Some(5));
        assert!(Rc::ptr_eq(&n.packet().unwrap(), &packet));
        assert!(Rc::ptr_eq(&n.stream().unwrap(), &s));

        let n = Notification::stream_end(s.clone(), None);
        assert_eq!(n.kind(), NotificationKind::StreamEnd);
        assert!(n.packet().is_none());
    }

    #[test]
    fn freezing_a_packet_notification_freezes_the_packet() {
        let s = stream();
        let packet = s.create_packet(PreviousPacketAvailability::None, None);
        let n = Notification::packet_end(packet.clone(), None);
        n.freeze();
        assert!(n.is_frozen());
        assert!(packet.is_frozen());
    }

    #[test]
    fn pool_round_trip() {
        let pools = NotificationPools::new();
        let s = stream();
        let packet = s.create_packet(PreviousPacketAvailability::None, None);
        let n = pools.create_packet_begin_notification(packet, None);
        n.freeze();
        Notification::try_recycle(n);
        assert_eq!(pools.packet_begin.borrow().len(), 1);

        // The pooled instance comes back hot and re-armed.
        let s2 = stream();
        let packet2 = s2.create_packet(PreviousPacketAvailability::None, None);
        let n = pools.create_packet_begin_notification(packet2, Some(3));
        assert!(!n.is_frozen());
        assert_eq!(n.default_clock_value(), Some(3));
        assert!(pools.packet_begin.borrow().is_empty());
    }

    #[test]
    fn shared_notification_is_not_recycled() {
        let pools = NotificationPools::new();
        let s = stream();
        let packet = s.create_packet(PreviousPacketAvailability::None, None);
        let n = pools.create_packet_end_notification(packet, None);
        let extra = n.clone();
        Notification::try_recycle(n);
        assert!(pools.packet_end.borrow().is_empty());
        drop(extra);
    }

    #[test]
    fn recycle_after_pool_teardown_is_a_plain_drop() {
        let pools = NotificationPools::new();
        let s = stream();
        let packet = s.create_packet(PreviousPacketAvailability::None, None);
        let n = pools.create_packet_end_notification(packet, None);
        drop(pools);
        // Nothing to return to; must not panic.
        Notification::try_recycle(n);
    }
}
