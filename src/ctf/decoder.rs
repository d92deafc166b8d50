//! The stream decoder: a resumable state machine that turns the bytes
//! of one packet sequence into an ordered series of notifications.
//!
//! One decoder handles one packet sequence; every packet must refer to
//! the same stream class. The machine suspends cleanly whenever the
//! medium returns `Again` and resumes from the exact bit it stopped at.

use std::rc::Rc;

use tracing::{debug, trace, warn};

use crate::ctf::btr::{Btr, BtrCallbacks, BtrStatus};
use crate::ctf::medium::{Medium, MediumRequest, SeekWhence};
use crate::error::{DecodeError, Error};
use crate::graph::notification::{Notification, NotificationPools};
use crate::ir::clock::ClockClass;
use crate::ir::event::Event;
use crate::ir::event_class::EventClass;
use crate::ir::field::Field;
use crate::ir::field_class::FieldClass;
use crate::ir::packet::{Packet, PreviousPacketAvailability};
use crate::ir::path::Scope;
use crate::ir::stream::Stream;
use crate::ir::stream_class::StreamClass;
use crate::ir::trace::Trace;

const PACKET_HEADER_MAGIC: u32 = 0xC1FC_1FC1;
const DEFAULT_MAX_REQUEST_LEN: usize = 4096;

/// Outcome of one `next` call.
#[derive(Debug)]
pub enum DecoderNext {
    Notification(Rc<Notification>),
    /// The medium has nothing right now; retry later.
    Again,
    /// Clean end of the packet sequence.
    End,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum State {
    Init,
    TraceHeaderBegin,
    TraceHeaderContinue,
    AfterTraceHeader,
    PacketCtxBegin,
    PacketCtxContinue,
    AfterPacketCtx,
    EmitNewStream,
    EmitNewPacket,
    EvHeaderBegin,
    EvHeaderContinue,
    AfterEvHeader,
    StreamEvCtxBegin,
    StreamEvCtxContinue,
    EvCtxBegin,
    EvCtxContinue,
    EvPayloadBegin,
    EvPayloadContinue,
    EmitEvent,
    EmitEndOfPacket,
    SkipPadding,
    Done,
}

/// What one state-machine step produced.
enum Step {
    Continue,
    Again,
    CleanEof,
    Emit(Rc<Notification>),
}

enum Feed {
    Ready,
    Again,
    CleanEof,
}

/// Member indices of the recognized packet header fields, computed once
/// per trace.
#[derive(Debug, Default)]
struct TraceFieldCache {
    stream_id: Option<usize>,
    stream_instance_id: Option<usize>,
    magic: Option<usize>,
    uuid: Option<usize>,
}

impl TraceFieldCache {
    fn new(trace: &Trace) -> Self {
        let mut cache = Self::default();
        if let Some(header) = trace.packet_header_field_class() {
            if let Some(st) = header.as_structure() {
                cache.stream_id = st.member_index("stream_id");
                cache.stream_instance_id = st.member_index("stream_instance_id");
                cache.magic = st.member_index("magic");
                cache.uuid = st.member_index("uuid");
            }
        }
        cache
    }
}

/// Member indices of the recognized event header and packet context
/// fields, computed once per stream class.
#[derive(Debug, Default)]
struct StreamClassFieldCache {
    v: Option<usize>,
    id: Option<usize>,
    timestamp_begin: Option<usize>,
    timestamp_end: Option<usize>,
    packet_size: Option<usize>,
    content_size: Option<usize>,
    packet_seq_num: Option<usize>,
    events_discarded: Option<usize>,
}

impl StreamClassFieldCache {
    fn new(stream_class: &StreamClass) -> Self {
        let mut cache = Self::default();
        if let Some(header) = stream_class.event_header_field_class() {
            if let Some(st) = header.as_structure() {
                cache.v = st.member_index("v");
                cache.id = st.member_index("id");
            }
        }
        if let Some(ctx) = stream_class.packet_context_field_class() {
            if let Some(st) = ctx.as_structure() {
                cache.timestamp_begin = st.member_index("timestamp_begin");
                cache.timestamp_end = st.member_index("timestamp_end");
                cache.packet_size = st.member_index("packet_size");
                cache.content_size = st.member_index("content_size");
                cache.packet_seq_num = st.member_index("packet_seq_num");
                cache.events_discarded = st.member_index("events_discarded");
            }
        }
        cache
    }
}

/// The decoded root fields of the six dynamic scopes, kept only as long
/// as the machine still needs them.
#[derive(Debug, Default)]
struct Dscopes {
    packet_header: Option<Field>,
    packet_context: Option<Field>,
    event_header: Option<Field>,
    event_common_ctx: Option<Field>,
    event_spec_ctx: Option<Field>,
    event_payload: Option<Field>,
}

impl Dscopes {
    fn release_event_scopes(&mut self) {
        self.event_header = None;
        self.event_common_ctx = None;
        self.event_spec_ctx = None;
        self.event_payload = None;
    }

    fn release_all(&mut self) {
        self.packet_header = None;
        self.packet_context = None;
        self.release_event_scopes();
    }
}

#[derive(Debug)]
struct VisitFrame {
    /// Which child of the parent frame's base this base is.
    child_index: usize,
    /// Next child to fill.
    next: usize,
}

/// Receives the binary type reader's callbacks and materializes values
/// into the current dynamic scope's field tree.
#[derive(Debug, Default)]
struct VisitState {
    stack: Vec<VisitFrame>,
    root: Option<Field>,
    string_buf: Vec<u8>,
    /// Decoded values of every integer class that a variant tag or
    /// sequence length refers to, indexed by stored-value slot.
    stored_values: Vec<u64>,
    clock_states: Vec<(Rc<ClockClass>, u64)>,
    /// The packet context's `timestamp_end` class: its decoded value
    /// must not touch the clock until the end of the packet.
    timestamp_end_class: Option<Rc<FieldClass>>,
    deferred_timestamp_end: Option<(u64, Rc<FieldClass>)>,
}

impl VisitState {
    fn begin_scope(&mut self, scope: Scope, root: Field) {
        trace!(%scope, "decoding dynamic scope");
        self.stack.clear();
        self.string_buf.clear();
        self.root = Some(root);
    }

    fn base_field_mut(&mut self) -> Result<&mut Field, DecodeError> {
        let mut field = self
            .root
            .as_mut()
            .ok_or_else(|| DecodeError::Field("no dynamic scope in progress".into()))?;
        for frame in self.stack.iter().skip(1) {
            field = field.child_at_mut(frame.child_index).ok_or_else(|| {
                DecodeError::Field("visit stack does not match the field tree".into())
            })?;
        }
        Ok(field)
    }

    fn next_field_mut(&mut self) -> Result<&mut Field, DecodeError> {
        let index = self
            .stack
            .last()
            .ok_or_else(|| DecodeError::Field("empty visit stack".into()))?
            .next;
        let base = self.base_field_mut()?;
        base.child_at_mut(index)
            .ok_or_else(|| DecodeError::Field("no next field to fill".into()))
    }

    fn advance(&mut self) {
        if let Some(top) = self.stack.last_mut() {
            top.next += 1;
        }
    }

    fn record_stored_value(&mut self, class: &Rc<FieldClass>, raw: u64) {
        if let Some(index) = class.stored_value_index() {
            self.stored_values[index.0] = raw;
        }
    }

    fn update_clock(&mut self, class: &Rc<FieldClass>, value: u64) {
        let Some(clock_class) = class.as_integer_like().and_then(|c| c.mapped_clock_class())
        else {
            return;
        };
        let width = class
            .as_integer_like()
            .map(|c| c.width())
            .unwrap_or(64);
        let index = match self
            .clock_states
            .iter()
            .position(|(cc, _)| Rc::ptr_eq(cc, &clock_class))
        {
            Some(index) => index,
            None => {
                self.clock_states.push((clock_class, 0));
                self.clock_states.len() - 1
            }
        };
        if let Some(entry) = self.clock_states.get_mut(index) {
            update_clock_state(&mut entry.1, value, width);
            trace!(clock_value = entry.1, "updated clock from integer field");
        }
    }

    fn clock_state(&self, clock_class: &Rc<ClockClass>) -> Option<u64> {
        self.clock_states
            .iter()
            .find(|(cc, _)| Rc::ptr_eq(cc, clock_class))
            .map(|(_, v)| *v)
    }
}

/// Maps a mutation refused by a frozen packet onto the decoder's
/// inconsistency error; a packet under construction is never frozen.
fn hot(result: Result<(), Error>) -> Result<(), DecodeError> {
    result.map_err(|_| DecodeError::Poisoned("the packet was frozen while still being built"))
}

/// Monotonic clock extrapolation under the single-wrap assumption: the
/// decoded value replaces the low `width` bits of the running state,
/// adding one wrap period when the new low bits went backwards.
fn update_clock_state(state: &mut u64, value: u64, width: u32) {
    if width == 64 {
        *state = value;
        return;
    }
    let mask = (1u64 << width) - 1;
    let current_low = *state & mask;
    if value < current_low {
        *state += mask + 1;
    }
    *state &= !mask;
    *state |= value;
}

impl BtrCallbacks for VisitState {
    fn unsigned_int(&mut self, value: u64, class: &Rc<FieldClass>) -> Result<(), DecodeError> {
        self.next_field_mut()?.set_unsigned(value)?;
        self.advance();
        self.record_stored_value(class, value);
        if let Some(ts_class) = &self.timestamp_end_class {
            if Rc::ptr_eq(ts_class, class) {
                // Deferred: events inside the packet must not observe
                // the end timestamp.
                self.deferred_timestamp_end = Some((value, class.clone()));
                return Ok(());
            }
        }
        self.update_clock(class, value);
        Ok(())
    }

    fn signed_int(&mut self, value: i64, class: &Rc<FieldClass>) -> Result<(), DecodeError> {
        self.next_field_mut()?.set_signed(value)?;
        self.advance();
        self.record_stored_value(class, value as u64);
        Ok(())
    }

    fn floating_point(&mut self, value: f64, _class: &Rc<FieldClass>) -> Result<(), DecodeError> {
        self.next_field_mut()?.set_float(value)?;
        self.advance();
        Ok(())
    }

    fn string_begin(&mut self, _class: &Rc<FieldClass>) -> Result<(), DecodeError> {
        self.string_buf.clear();
        Ok(())
    }

    fn string(&mut self, chunk: &[u8], _class: &Rc<FieldClass>) -> Result<(), DecodeError> {
        self.string_buf.extend_from_slice(chunk);
        Ok(())
    }

    fn string_end(&mut self, _class: &Rc<FieldClass>) -> Result<(), DecodeError> {
        let value = String::from_utf8_lossy(&self.string_buf).into_owned();
        let field = self.next_field_mut()?;
        field.string_clear()?;
        field.string_append(&value)?;
        self.advance();
        Ok(())
    }

    fn compound_begin(&mut self, _class: &Rc<FieldClass>) -> Result<(), DecodeError> {
        // The root frame's child index is never read.
        let child_index = self.stack.last().map(|frame| frame.next).unwrap_or(0);
        self.stack.push(VisitFrame {
            child_index,
            next: 0,
        });
        Ok(())
    }

    fn compound_end(&mut self, _class: &Rc<FieldClass>) -> Result<(), DecodeError> {
        self.stack.pop();
        self.advance();
        Ok(())
    }

    fn sequence_length(&mut self, class: &Rc<FieldClass>) -> Result<u64, DecodeError> {
        let slot = class
            .as_sequence()
            .and_then(|c| c.stored_length_index())
            .ok_or_else(|| {
                DecodeError::Field("sequence length path was never resolved".into())
            })?;
        let length = self.stored_values[slot.0];
        self.base_field_mut()?.sequence_set_length(length)?;
        Ok(length)
    }

    fn variant_class(&mut self, class: &Rc<FieldClass>) -> Result<Rc<FieldClass>, DecodeError> {
        let slot = class
            .as_variant()
            .and_then(|c| c.stored_tag_index())
            .ok_or_else(|| DecodeError::Field("variant tag path was never resolved".into()))?;
        let tag = self.stored_values[slot.0];
        let base = self.base_field_mut()?;
        base.variant_set_tag(tag)?;
        base.variant_current()
            .map(|f| f.class().clone())
            .ok_or(DecodeError::Poisoned(
                "the variant has no current field after tag selection",
            ))
    }
}

/// The CTF notification iterator: decodes one packet sequence from a
/// medium against a validated trace.
pub struct StreamDecoder {
    trace: Rc<Trace>,
    medium: Box<dyn Medium>,
    max_request_len: usize,
    pools: Option<Rc<NotificationPools>>,

    btr: Btr,
    visit: VisitState,
    state: State,
    dscopes: Dscopes,

    stream_class: Option<Rc<StreamClass>>,
    event_class: Option<Rc<EventClass>>,
    stream: Option<Rc<Stream>>,
    packet: Option<Rc<Packet>>,
    prev_packet: Option<Rc<Packet>>,
    prev_packet_avail: PreviousPacketAvailability,
    cur_event: Option<Event>,
    prev_event_notif: Option<Rc<Notification>>,

    /// Packet and content sizes in bits; `None` until decoded, and
    /// permanently `None` for size-less packets.
    cur_packet_size: Option<usize>,
    cur_content_size: Option<usize>,
    /// Bit offset of the current packet within the whole medium.
    cur_packet_offset: u64,
    stream_begin_emitted: bool,

    buf: Vec<u8>,
    /// Bits consumed within `buf`.
    buf_at: usize,
    /// Bits of the current packet that preceded `buf`.
    buf_packet_offset: usize,
    /// Position of the last event header within `buf`, for graceful
    /// end-of-stream detection between events.
    last_eh_at: Option<usize>,

    trace_cache: TraceFieldCache,
    sc_cache: Option<StreamClassFieldCache>,
}

impl StreamDecoder {
    pub fn new(trace: Rc<Trace>, medium: Box<dyn Medium>) -> Result<Self, Error> {
        Self::with_max_request_len(trace, medium, DEFAULT_MAX_REQUEST_LEN)
    }

    pub fn with_max_request_len(
        trace: Rc<Trace>,
        medium: Box<dyn Medium>,
        max_request_len: usize,
    ) -> Result<Self, Error> {
        trace.validate()?;
        let trace_cache = TraceFieldCache::new(&trace);
        let visit = VisitState {
            stored_values: vec![0; trace.stored_slot_count()],
            ..Default::default()
        };
        debug!(max_request_len, "created stream decoder");
        Ok(Self {
            trace,
            medium,
            max_request_len: max_request_len.max(1),
            pools: None,
            btr: Btr::new(),
            visit,
            state: State::Init,
            dscopes: Dscopes::default(),
            stream_class: None,
            event_class: None,
            stream: None,
            packet: None,
            prev_packet: None,
            prev_packet_avail: PreviousPacketAvailability::None,
            cur_event: None,
            prev_event_notif: None,
            cur_packet_size: None,
            cur_content_size: None,
            cur_packet_offset: 0,
            stream_begin_emitted: false,
            buf: Vec::new(),
            buf_at: 0,
            buf_packet_offset: 0,
            last_eh_at: None,
            trace_cache,
            sc_cache: None,
        })
    }

    /// Routes the hot notification kinds through a graph's pools.
    pub fn set_notification_pools(&mut self, pools: Rc<NotificationPools>) {
        self.pools = Some(pools);
    }

    /// Current cycle state of one clock.
    pub fn clock_state(&self, clock_class: &Rc<ClockClass>) -> Option<u64> {
        self.visit.clock_state(clock_class)
    }

    /// Bit offset within the current packet.
    fn packet_at(&self) -> usize {
        self.buf_packet_offset + self.buf_at
    }

    /// Bit offset of the current packet within the whole medium.
    pub fn current_packet_offset_bits(&self) -> u64 {
        self.cur_packet_offset
    }

    fn buf_available_bits(&self) -> usize {
        self.buf.len() * 8 - self.buf_at
    }

    fn current_stream_class(&self) -> Result<Rc<StreamClass>, DecodeError> {
        self.stream_class
            .clone()
            .ok_or(DecodeError::Poisoned("no stream class is current"))
    }

    fn current_event_class(&self) -> Result<Rc<EventClass>, DecodeError> {
        self.event_class
            .clone()
            .ok_or(DecodeError::Poisoned("no event class is current"))
    }

    fn current_cache(&self) -> Result<&StreamClassFieldCache, DecodeError> {
        self.sc_cache
            .as_ref()
            .ok_or(DecodeError::Poisoned("no stream class field cache is current"))
    }

    /// Produces the next notification, or `Again`/`End`.
    pub fn next(&mut self) -> Result<DecoderNext, Error> {
        if self.state == State::Done {
            return Ok(DecoderNext::End);
        }
        loop {
            let step = match self.handle_state() {
                Ok(step) => step,
                Err(e) => {
                    self.state = State::Done;
                    return Err(e.into());
                }
            };
            match step {
                Step::Continue => {}
                Step::Again => return Ok(DecoderNext::Again),
                Step::Emit(notif) => return Ok(DecoderNext::Notification(notif)),
                Step::CleanEof => {
                    if self.packet.is_some() {
                        // Size-less packet ended by the medium; the
                        // machine state is untouched so the next call
                        // drains the stream end.
                        let notif = self.make_packet_end()?;
                        return Ok(DecoderNext::Notification(notif));
                    }
                    if let Some(stream) = self.stream.clone() {
                        if self.stream_begin_emitted {
                            self.state = State::Done;
                            let dcv = self.default_clock_state(&stream);
                            return Ok(DecoderNext::Notification(Notification::stream_end(
                                stream, dcv,
                            )));
                        }
                    }
                    self.state = State::Done;
                    return Ok(DecoderNext::End);
                }
            }
        }
    }

    /// Repositions to a packet boundary at the given byte offset in the
    /// medium and resets the machine. The previous packet is unknown
    /// from here on.
    pub fn seek(&mut self, offset_bytes: u64) -> Result<(), Error> {
        self.medium.seek(SeekWhence::Set, offset_bytes)?;
        self.reset();
        self.cur_packet_offset = offset_bytes * 8;
        self.prev_packet_avail = PreviousPacketAvailability::NotAvailable;
        debug!(offset_bytes, "decoder seeked to packet boundary");
        Ok(())
    }

    /// Returns the machine to its initial state, keeping the trace and
    /// medium.
    pub fn reset(&mut self) {
        self.visit.stack.clear();
        self.visit.deferred_timestamp_end = None;
        self.visit.root = None;
        self.dscopes.release_all();
        self.stream_class = None;
        self.event_class = None;
        self.stream = None;
        self.packet = None;
        self.prev_packet = None;
        self.prev_packet_avail = PreviousPacketAvailability::None;
        self.cur_event = None;
        self.cur_packet_size = None;
        self.cur_content_size = None;
        self.cur_packet_offset = 0;
        self.stream_begin_emitted = false;
        self.buf.clear();
        self.buf_at = 0;
        self.buf_packet_offset = 0;
        self.last_eh_at = None;
        self.sc_cache = None;
        self.state = State::Init;
    }

    fn handle_state(&mut self) -> Result<Step, DecodeError> {
        trace!(state = ?self.state, packet_at = self.packet_at(), "handling state");
        match self.state {
            State::Init => {
                // Probe the medium so an empty byte source ends the
                // iterator before any notification is synthesized.
                if self.buf.is_empty() {
                    match self.request_medium_bytes()? {
                        Feed::Ready => {}
                        Feed::Again => return Ok(Step::Again),
                        Feed::CleanEof => return Ok(Step::CleanEof),
                    }
                }
                self.state = State::TraceHeaderBegin;
                Ok(Step::Continue)
            }
            State::TraceHeaderBegin => {
                self.switch_packet()?;
                match self.trace.packet_header_field_class() {
                    Some(class) => self.read_dscope_begin(
                        class,
                        Scope::TracePacketHeader,
                        State::AfterTraceHeader,
                        State::TraceHeaderContinue,
                    ),
                    None => {
                        self.state = State::AfterTraceHeader;
                        Ok(Step::Continue)
                    }
                }
            }
            State::TraceHeaderContinue => self.read_dscope_continue(State::AfterTraceHeader),
            State::AfterTraceHeader => {
                self.dscopes.packet_header = self.visit.root.take();
                self.check_packet_header()?;
                self.set_current_stream_class()?;
                self.state = State::PacketCtxBegin;
                Ok(Step::Continue)
            }
            State::PacketCtxBegin => {
                let class = self.current_stream_class()?.packet_context_field_class();
                match class {
                    Some(class) => self.read_dscope_begin(
                        class,
                        Scope::StreamPacketContext,
                        State::AfterPacketCtx,
                        State::PacketCtxContinue,
                    ),
                    None => {
                        self.state = State::AfterPacketCtx;
                        Ok(Step::Continue)
                    }
                }
            }
            State::PacketCtxContinue => self.read_dscope_continue(State::AfterPacketCtx),
            State::AfterPacketCtx => {
                self.dscopes.packet_context = self.visit.root.take();
                self.set_packet_content_sizes()?;
                self.state = if self.stream_begin_emitted {
                    State::EmitNewPacket
                } else {
                    State::EmitNewStream
                };
                Ok(Step::Continue)
            }
            State::EmitNewStream => {
                self.set_current_stream()?;
                self.stream_begin_emitted = true;
                self.state = State::EmitNewPacket;
                let stream = self
                    .stream
                    .clone()
                    .ok_or(DecodeError::Poisoned("no stream is current"))?;
                debug!(stream_id = stream.id(), "emitting stream beginning");
                Ok(Step::Emit(Notification::stream_begin(stream, None)))
            }
            State::EmitNewPacket => {
                let notif = self.make_packet_begin()?;
                self.state = State::EvHeaderBegin;
                Ok(Step::Emit(notif))
            }
            State::EvHeaderBegin => {
                self.last_eh_at = Some(self.buf_at);
                if let Some(content_size) = self.cur_content_size {
                    if self.packet_at() == content_size {
                        self.state = State::EmitEndOfPacket;
                        return Ok(Step::Continue);
                    }
                    if self.packet_at() > content_size {
                        return Err(DecodeError::ContentOverrun {
                            at: self.packet_at(),
                            content_size,
                        });
                    }
                }
                self.dscopes.release_event_scopes();
                let class = self.current_stream_class()?.event_header_field_class();
                match class {
                    Some(class) => self.read_dscope_begin(
                        class,
                        Scope::StreamEventHeader,
                        State::AfterEvHeader,
                        State::EvHeaderContinue,
                    ),
                    None => {
                        self.state = State::AfterEvHeader;
                        Ok(Step::Continue)
                    }
                }
            }
            State::EvHeaderContinue => self.read_dscope_continue(State::AfterEvHeader),
            State::AfterEvHeader => {
                self.dscopes.event_header = self.visit.root.take();
                self.set_current_event_class()?;
                let event_class = self.current_event_class()?;
                let packet = self
                    .packet
                    .clone()
                    .ok_or(DecodeError::Poisoned("no packet is current"))?;
                let mut event = Event::new(event_class, packet);
                if let Some(header) = self.dscopes.event_header.take() {
                    event.move_header(header);
                }
                self.cur_event = Some(event);
                self.state = State::StreamEvCtxBegin;
                Ok(Step::Continue)
            }
            State::StreamEvCtxBegin => {
                let class = self
                    .current_stream_class()?
                    .event_common_context_field_class();
                match class {
                    Some(class) => self.read_dscope_begin(
                        class,
                        Scope::StreamEventContext,
                        State::EvCtxBegin,
                        State::StreamEvCtxContinue,
                    ),
                    None => {
                        self.state = State::EvCtxBegin;
                        Ok(Step::Continue)
                    }
                }
            }
            State::StreamEvCtxContinue => self.read_dscope_continue(State::EvCtxBegin),
            State::EvCtxBegin => {
                self.dscopes.event_common_ctx = self.visit.root.take();
                let class = self.current_event_class()?.context_field_class();
                match class {
                    Some(class) => self.read_dscope_begin(
                        class,
                        Scope::EventContext,
                        State::EvPayloadBegin,
                        State::EvCtxContinue,
                    ),
                    None => {
                        self.state = State::EvPayloadBegin;
                        Ok(Step::Continue)
                    }
                }
            }
            State::EvCtxContinue => self.read_dscope_continue(State::EvPayloadBegin),
            State::EvPayloadBegin => {
                self.dscopes.event_spec_ctx = self.visit.root.take();
                let class = self.current_event_class()?.payload_field_class();
                match class {
                    Some(class) => self.read_dscope_begin(
                        class,
                        Scope::EventPayload,
                        State::EmitEvent,
                        State::EvPayloadContinue,
                    ),
                    None => {
                        self.state = State::EmitEvent;
                        Ok(Step::Continue)
                    }
                }
            }
            State::EvPayloadContinue => self.read_dscope_continue(State::EmitEvent),
            State::EmitEvent => {
                self.dscopes.event_payload = self.visit.root.take();
                let notif = self.make_event()?;
                self.state = State::EvHeaderBegin;
                Ok(Step::Emit(notif))
            }
            State::EmitEndOfPacket => {
                let notif = self.make_packet_end()?;
                self.state = State::SkipPadding;
                Ok(Step::Emit(notif))
            }
            State::SkipPadding => self.skip_packet_padding(),
            State::Done => Ok(Step::CleanEof),
        }
    }

    /// Starts decoding one dynamic scope with the binary type reader.
    fn read_dscope_begin(
        &mut self,
        class: Rc<FieldClass>,
        scope: Scope,
        done_state: State,
        continue_state: State,
    ) -> Result<Step, DecodeError> {
        self.visit.begin_scope(scope, Field::new(class.clone()));
        let packet_at = self.packet_at();
        let (status, consumed) =
            self.btr
                .start(&class, &self.buf, self.buf_at, packet_at, &mut self.visit)?;
        self.buf_at += consumed;
        self.state = match status {
            BtrStatus::Ok => done_state,
            BtrStatus::Eof => continue_state,
        };
        Ok(Step::Continue)
    }

    fn read_dscope_continue(&mut self, done_state: State) -> Result<Step, DecodeError> {
        if self.buf_available_bits() == 0 {
            match self.request_medium_bytes()? {
                Feed::Ready => {}
                Feed::Again => return Ok(Step::Again),
                Feed::CleanEof => return Ok(Step::CleanEof),
            }
        }
        let (status, consumed) = self.btr.resume(&self.buf, &mut self.visit)?;
        self.buf_at += consumed;
        if status == BtrStatus::Ok {
            self.state = done_state;
        }
        Ok(Step::Continue)
    }

    /// Asks the medium for more bytes, validating a clean end of the
    /// byte stream against the framing state.
    fn request_medium_bytes(&mut self) -> Result<Feed, DecodeError> {
        match self.medium.request_bytes(self.max_request_len)? {
            MediumRequest::Bytes(bytes) => {
                debug_assert!(!bytes.is_empty());
                self.buf_packet_offset += self.buf.len() * 8;
                self.buf = bytes;
                self.buf_at = 0;
                self.last_eh_at = None;
                trace!(len = self.buf.len(), "medium returned bytes");
                Ok(Feed::Ready)
            }
            MediumRequest::Again => Ok(Feed::Again),
            MediumRequest::Eof => {
                let clean = match self.cur_packet_size {
                    Some(size) => self.packet_at() == size,
                    None => {
                        self.packet_at() == 0
                            || self
                                .last_eh_at
                                .map(|at| self.buf_at == at)
                                .unwrap_or(false)
                    }
                };
                if clean {
                    Ok(Feed::CleanEof)
                } else {
                    warn!(
                        packet_at = self.packet_at(),
                        packet_size = ?self.cur_packet_size,
                        "medium ended mid-packet"
                    );
                    Err(DecodeError::UnexpectedEof {
                        at: self.packet_at(),
                    })
                }
            }
        }
    }

    /// Prepares for the next packet: drops per-packet state and slides
    /// the buffer so it starts at the new packet's first byte.
    fn switch_packet(&mut self) -> Result<(), DecodeError> {
        if let Some(size) = self.cur_packet_size {
            self.cur_packet_offset += size as u64;
        }
        self.visit.stack.clear();
        self.visit.root = None;
        self.visit.deferred_timestamp_end = None;
        self.event_class = None;
        self.cur_event = None;
        self.dscopes.release_all();
        self.packet = None;

        if !self.buf.is_empty() || self.buf_at > 0 {
            if self.buf_at % 8 != 0 {
                return Err(DecodeError::InvalidPacketSize(format!(
                    "packet does not end on a byte boundary (bit {})",
                    self.packet_at()
                )));
            }
            let consumed_bytes = self.buf_at / 8;
            self.buf.drain(..consumed_bytes);
            self.buf_at = 0;
            self.buf_packet_offset = 0;
        }
        self.cur_packet_size = None;
        self.cur_content_size = None;
        Ok(())
    }

    /// Checks the recognized packet header fields: `magic` and `uuid`.
    fn check_packet_header(&mut self) -> Result<(), DecodeError> {
        let Some(header) = &self.dscopes.packet_header else {
            return Ok(());
        };
        if let Some(index) = self.trace_cache.magic {
            if let Some(raw) = header.child_at(index).and_then(|f| f.raw_bits()) {
                let found = raw as u32;
                if found != PACKET_HEADER_MAGIC {
                    return Err(DecodeError::BadMagic {
                        expected: PACKET_HEADER_MAGIC,
                        found,
                    });
                }
            }
        }
        if let (Some(index), Some(expected)) = (self.trace_cache.uuid, self.trace.uuid()) {
            if let Some(field) = header.child_at(index) {
                let mut bytes = [0u8; 16];
                let mut ok = field.member_count() == 16;
                for i in 0..field.member_count().min(16) {
                    match field.child_at(i).and_then(|f| f.raw_bits()) {
                        Some(b) => bytes[i] = b as u8,
                        None => ok = false,
                    }
                }
                if ok {
                    let found = uuid::Uuid::from_bytes(bytes);
                    if found != expected {
                        return Err(DecodeError::UuidMismatch { expected, found });
                    }
                }
            }
        }
        Ok(())
    }

    /// Selects the stream class from the decoded `stream_id`, and pins
    /// it: every packet of the sequence must use the same one.
    fn set_current_stream_class(&mut self) -> Result<(), DecodeError> {
        let stream_id = self
            .dscopes
            .packet_header
            .as_ref()
            .zip(self.trace_cache.stream_id)
            .and_then(|(header, index)| header.child_at(index))
            .and_then(|f| f.raw_bits());

        let new_class = match stream_id {
            Some(id) => self
                .trace
                .stream_class_by_id(id)
                .ok_or(DecodeError::NoSuchStreamClass(id))?,
            None => {
                if self.trace.stream_class_count() != 1 {
                    return Err(DecodeError::Field(
                        "no stream_id field and the trace has more than one stream class"
                            .into(),
                    ));
                }
                self.trace
                    .stream_class_by_index(0)
                    .ok_or(DecodeError::Poisoned(
                        "the trace lost its only stream class",
                    ))?
            }
        };

        match &self.stream_class {
            Some(current) => {
                if !Rc::ptr_eq(current, &new_class) {
                    return Err(DecodeError::StreamClassMismatch {
                        expected: current.id(),
                        found: new_class.id(),
                    });
                }
            }
            None => {
                let cache = StreamClassFieldCache::new(&new_class);
                if let Some(index) = cache.timestamp_end {
                    self.visit.timestamp_end_class = new_class
                        .packet_context_field_class()
                        .and_then(|c| c.as_structure().and_then(|s| s.member_by_index(index)))
                        .map(|(_, c)| c);
                }
                debug!(stream_class_id = new_class.id(), "selected stream class");
                self.sc_cache = Some(cache);
                self.stream_class = Some(new_class);
            }
        }
        Ok(())
    }

    /// Computes the packet and content sizes from the decoded packet
    /// context.
    fn set_packet_content_sizes(&mut self) -> Result<(), DecodeError> {
        let cache = self.current_cache()?;
        let context = self.dscopes.packet_context.as_ref();
        let read = |index: Option<usize>| {
            context
                .zip(index)
                .and_then(|(ctx, i)| ctx.child_at(i))
                .and_then(|f| f.raw_bits())
        };

        let packet_size = read(cache.packet_size);
        let mut content_size = read(cache.content_size);

        if let Some(size) = packet_size {
            if size == 0 {
                return Err(DecodeError::InvalidPacketSize(
                    "packet context says the packet size is zero".into(),
                ));
            }
            if size % 8 != 0 {
                return Err(DecodeError::InvalidPacketSize(format!(
                    "packet size {size} is not a multiple of 8"
                )));
            }
        }
        if content_size.is_none() {
            content_size = packet_size;
        }
        if let (Some(c), Some(p)) = (content_size, packet_size) {
            if c > p {
                return Err(DecodeError::InvalidPacketSize(format!(
                    "content size {c} is greater than packet size {p}"
                )));
            }
        }

        // A missing packet size means no padding: the content is the
        // whole packet.
        self.cur_packet_size = packet_size.or(content_size).map(|s| s as usize);
        self.cur_content_size = content_size.map(|s| s as usize);
        trace!(
            packet_size = ?self.cur_packet_size,
            content_size = ?self.cur_content_size,
            "packet sizes set"
        );
        Ok(())
    }

    /// Resolves the stream through the medium, once per sequence.
    fn set_current_stream(&mut self) -> Result<(), DecodeError> {
        let stream_class = self.current_stream_class()?;
        let instance_id = self
            .dscopes
            .packet_header
            .as_ref()
            .zip(self.trace_cache.stream_instance_id)
            .and_then(|(header, index)| header.child_at(index))
            .and_then(|f| f.raw_bits());
        let stream = self.medium.borrow_stream(&stream_class, instance_id)?;
        if let Some(current) = &self.stream {
            if !Rc::ptr_eq(current, &stream) {
                return Err(DecodeError::StreamMismatch);
            }
        }
        self.stream = Some(stream);
        Ok(())
    }

    /// Materializes the packet: resolves the stream's packet from the
    /// pool, moves the decoded header and context in, and copies the
    /// recognized context properties.
    fn make_packet_begin(&mut self) -> Result<Rc<Notification>, DecodeError> {
        if self.stream.is_none() {
            self.set_current_stream()?;
        }
        let stream = self
            .stream
            .clone()
            .ok_or(DecodeError::Poisoned("no stream is current"))?;
        let packet = stream.create_packet(self.prev_packet_avail, self.prev_packet.clone());

        if let Some(header) = self.dscopes.packet_header.take() {
            hot(packet.move_header(header))?;
        }

        // Borrow the cache field directly: the context is taken out of
        // the scope set below while the cache is still in use.
        let cache = self.sc_cache.as_ref().ok_or(DecodeError::Poisoned(
            "no stream class field cache is current",
        ))?;
        let mut begin_cv = None;
        if let Some(context) = self.dscopes.packet_context.take() {
            if let Some(v) = cache
                .timestamp_begin
                .and_then(|i| context.child_at(i))
                .and_then(|f| f.raw_bits())
            {
                begin_cv = Some(v);
                hot(packet.set_beginning_clock_value(v))?;
            }
            // The raw end timestamp is known now; only its effect on
            // the clock is deferred to the end of the packet.
            if let Some(v) = cache
                .timestamp_end
                .and_then(|i| context.child_at(i))
                .and_then(|f| f.raw_bits())
            {
                hot(packet.set_end_clock_value(v))?;
                if let Some(begin) = begin_cv {
                    if begin > v {
                        warn!(
                            timestamp_begin = begin,
                            timestamp_end = v,
                            "packet context timestamps are inconsistent"
                        );
                    }
                }
            }
            if let Some(v) = cache
                .packet_seq_num
                .and_then(|i| context.child_at(i))
                .and_then(|f| f.raw_bits())
            {
                hot(packet.set_sequence_number(v))?;
            }
            if let Some(v) = cache
                .events_discarded
                .and_then(|i| context.child_at(i))
                .and_then(|f| f.raw_bits())
            {
                hot(packet.set_discarded_event_count(v))?;
            }
            hot(packet.move_context(context))?;
        }

        debug!(
            stream_id = stream.id(),
            packet_offset_bits = self.cur_packet_offset,
            "emitting packet beginning"
        );
        self.packet = Some(packet.clone());
        Ok(match &self.pools {
            Some(pools) => pools.create_packet_begin_notification(packet, begin_cv),
            None => Notification::packet_begin(packet, begin_cv),
        })
    }

    /// Finishes the current packet: applies the deferred
    /// `timestamp_end` clock update, emits the packet-end notification,
    /// and shifts the packet into the previous-packet slot.
    fn make_packet_end(&mut self) -> Result<Rc<Notification>, DecodeError> {
        let packet = self
            .packet
            .take()
            .ok_or(DecodeError::Poisoned("no packet is current"))?;

        let mut end_cv = packet.end_clock_value();
        if let Some((value, class)) = self.visit.deferred_timestamp_end.take() {
            self.visit.update_clock(&class, value);
            let clock_class = class.as_integer_like().and_then(|c| c.mapped_clock_class());
            if let Some(cc) = clock_class {
                end_cv = self.visit.clock_state(&cc);
            }
        }

        debug!("emitting packet end");
        let notif = match &self.pools {
            Some(pools) => pools.create_packet_end_notification(packet.clone(), end_cv),
            None => Notification::packet_end(packet.clone(), end_cv),
        };

        // The outgoing previous packet can go back to the stream pool
        // once nothing else holds it.
        if let Some(old_prev) = self.prev_packet.take() {
            let stream = old_prev.stream().clone();
            stream.recycle_packet(old_prev);
        }
        self.prev_packet = Some(packet);
        self.prev_packet_avail = PreviousPacketAvailability::Available;
        Ok(notif)
    }

    /// Selects the event class from the decoded event header: the `v`
    /// variant's option `id`, the plain `id` integer, or the only event
    /// class.
    fn set_current_event_class(&mut self) -> Result<(), DecodeError> {
        let stream_class = self.current_stream_class()?;
        let cache = self.current_cache()?;
        let header = self.dscopes.event_header.as_ref();

        let mut event_id = None;
        if let Some(v_field) = cache.v.zip(header).and_then(|(i, h)| h.child_at(i)) {
            event_id = v_field
                .variant_current()
                .and_then(|opt| opt.member_by_name("id"))
                .and_then(|f| f.raw_bits());
        }
        if event_id.is_none() {
            event_id = cache
                .id
                .zip(header)
                .and_then(|(i, h)| h.child_at(i))
                .and_then(|f| f.raw_bits());
        }

        let event_class = match event_id {
            Some(id) => stream_class
                .event_class_by_id(id)
                .ok_or(DecodeError::NoSuchEventClass(id))?,
            None => {
                if stream_class.event_class_count() != 1 {
                    return Err(DecodeError::Field(
                        "no event ID field and the stream class has more than one event class"
                            .into(),
                    ));
                }
                stream_class
                    .event_class_by_index(0)
                    .ok_or(DecodeError::Poisoned(
                        "the stream class lost its only event class",
                    ))?
            }
        };
        trace!(event_class_id = event_class.id(), "selected event class");
        self.event_class = Some(event_class);
        Ok(())
    }

    /// Assembles the event notification: moves the remaining scope
    /// fields in and snapshots every clock.
    fn make_event(&mut self) -> Result<Rc<Notification>, DecodeError> {
        let mut event = self
            .cur_event
            .take()
            .ok_or(DecodeError::Poisoned("no event is under construction"))?;
        if let Some(f) = self.dscopes.event_common_ctx.take() {
            event.move_common_context(f);
        }
        if let Some(f) = self.dscopes.event_spec_ctx.take() {
            event.move_specific_context(f);
        }
        if let Some(f) = self.dscopes.event_payload.take() {
            event.move_payload(f);
        }
        for (cc, value) in self.visit.clock_states.iter() {
            event.set_clock_value(cc.clone(), *value);
        }

        // Recycle the previous event notification if its consumer is
        // done with it.
        if let Some(prev) = self.prev_event_notif.take() {
            Notification::try_recycle(prev);
        }
        let notif = match &self.pools {
            Some(pools) => pools.create_event_notification(event),
            None => Notification::event(event),
        };
        self.prev_event_notif = Some(notif.clone());
        Ok(notif)
    }

    /// Skips the padding between the content and the end of the packet.
    fn skip_packet_padding(&mut self) -> Result<Step, DecodeError> {
        let Some(packet_size) = self.cur_packet_size else {
            self.state = State::TraceHeaderBegin;
            return Ok(Step::Continue);
        };
        loop {
            let to_skip = packet_size - self.packet_at();
            if to_skip == 0 {
                self.state = State::TraceHeaderBegin;
                return Ok(Step::Continue);
            }
            if self.buf_available_bits() == 0 {
                match self.request_medium_bytes()? {
                    Feed::Ready => {}
                    Feed::Again => return Ok(Step::Again),
                    Feed::CleanEof => return Ok(Step::CleanEof),
                }
            }
            let take = to_skip.min(self.buf_available_bits());
            trace!(bits = take, "skipping packet padding");
            self.buf_at += take;
        }
    }

    fn default_clock_state(&self, stream: &Rc<Stream>) -> Option<u64> {
        stream
            .stream_class()
            .default_clock_class()
            .and_then(|cc| self.visit.clock_state(&cc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctf::medium::BufferMedium;
    use crate::ctf::testwire::BitWriter;
    use crate::graph::notification::NotificationKind;
    use crate::ir::field_class::ByteOrder;
    use pretty_assertions::assert_eq;

    const LE: ByteOrder = ByteOrder::LittleEndian;

    fn uint(width: u32) -> Rc<FieldClass> {
        FieldClass::unsigned_integer(width, LE)
    }

    fn structure(members: &[(&str, Rc<FieldClass>)]) -> Rc<FieldClass> {
        let st = FieldClass::structure();
        for (name, class) in members {
            st.as_structure()
                .unwrap()
                .add_member(*name, class.clone())
                .unwrap();
        }
        st
    }

    /// Trace shaped like a typical single-stream kernel trace: magic +
    /// stream_id packet header, sized packet context, id event header,
    /// one u32 payload member plus filler to an exact content size.
    fn sized_trace(payload_filler_bytes: u64) -> Rc<Trace> {
        let trace = Trace::new();
        trace
            .set_packet_header_field_class(structure(&[
                ("magic", uint(32)),
                ("stream_id", uint(32)),
            ]))
            .unwrap();

        let sc = StreamClass::new(0);
        sc.set_packet_context_field_class(structure(&[
            ("packet_size", uint(32)),
            ("content_size", uint(32)),
        ]))
        .unwrap();
        sc.set_event_header_field_class(structure(&[("id", uint(32))]))
            .unwrap();

        let ec = EventClass::new(0, "value_event");
        let mut payload_members = vec![("value".to_owned(), uint(32))];
        if payload_filler_bytes > 0 {
            payload_members.push((
                "filler".to_owned(),
                FieldClass::static_array(payload_filler_bytes, uint(8)),
            ));
        }
        let payload = FieldClass::structure();
        for (name, class) in payload_members {
            payload.as_structure().unwrap().add_member(name, class).unwrap();
        }
        ec.set_payload_field_class(payload).unwrap();
        sc.add_event_class(ec).unwrap();
        trace.add_stream_class(sc).unwrap();
        trace
    }

    fn drain(decoder: &mut StreamDecoder) -> Vec<Rc<Notification>> {
        let mut out = Vec::new();
        loop {
            match decoder.next().unwrap() {
                DecoderNext::Notification(n) => out.push(n),
                DecoderNext::Again => continue,
                DecoderNext::End => return out,
            }
        }
    }

    fn kinds(notifs: &[Rc<Notification>]) -> Vec<NotificationKind> {
        notifs.iter().map(|n| n.kind()).collect()
    }

    #[test]
    fn empty_medium_ends_immediately() {
        let trace = sized_trace(0);
        let medium = BufferMedium::new(trace.clone(), Vec::new());
        let mut decoder = StreamDecoder::new(trace, Box::new(medium)).unwrap();
        assert!(matches!(decoder.next().unwrap(), DecoderNext::End));
        // Terminal state is sticky.
        assert!(matches!(decoder.next().unwrap(), DecoderNext::End));
    }

    /// One 1024-bit packet holding one event whose first payload member
    /// is 0xdeadc0de.
    fn single_packet_image() -> Vec<u8> {
        let mut w = BitWriter::new();
        w.write_u32_le(PACKET_HEADER_MAGIC).write_u32_le(0); // header
        w.write_u32_le(1024).write_u32_le(1024); // context
        w.write_u32_le(0); // event id
        w.write_u32_le(0xdeadc0de); // payload value
        w.write_bytes(&[0u8; 104]); // payload filler
        let bytes = w.into_bytes();
        assert_eq!(bytes.len(), 128);
        bytes
    }

    #[test]
    fn single_packet_single_event() {
        let trace = sized_trace(104);
        let medium = BufferMedium::new(trace.clone(), single_packet_image());
        let mut decoder = StreamDecoder::new(trace, Box::new(medium)).unwrap();
        let notifs = drain(&mut decoder);
        assert_eq!(
            kinds(&notifs),
            vec![
                NotificationKind::StreamBegin,
                NotificationKind::PacketBegin,
                NotificationKind::Event,
                NotificationKind::PacketEnd,
                NotificationKind::StreamEnd,
            ]
        );
        let event = notifs[2].event_ref().unwrap();
        assert_eq!(event.event_class().id(), 0);
        let payload = event.payload().unwrap();
        assert_eq!(payload.child_at(0).unwrap().as_unsigned(), Some(0xdeadc0de));
        assert_eq!(
            event.header().unwrap().member_by_name("id").unwrap().as_unsigned(),
            Some(0)
        );
        // Delivered through the decoder directly: frozen only once a
        // graph iterator delivers it, but the packet chain is intact.
        assert!(std::rc::Rc::ptr_eq(&notifs[1].packet().unwrap(), &notifs[3].packet().unwrap()));
    }

    #[test]
    fn resumed_decode_matches_single_shot() {
        let trace = sized_trace(104);
        let medium = BufferMedium::new(trace.clone(), single_packet_image());
        let mut one_shot = StreamDecoder::new(trace, Box::new(medium)).unwrap();
        let expected = drain(&mut one_shot);

        // One byte per medium request: every continue state runs.
        let trace = sized_trace(104);
        let medium = BufferMedium::with_chunk_len(trace.clone(), single_packet_image(), 1);
        let mut chunked = StreamDecoder::new(trace, Box::new(medium)).unwrap();
        let got = drain(&mut chunked);

        assert_eq!(kinds(&expected), kinds(&got));
        let ev_a = expected[2].event_ref().unwrap();
        let ev_b = got[2].event_ref().unwrap();
        assert_eq!(
            ev_a.payload().unwrap().child_at(0).unwrap().as_unsigned(),
            ev_b.payload().unwrap().child_at(0).unwrap().as_unsigned(),
        );
    }

    #[test]
    fn padding_is_skipped_to_the_packet_size() {
        // packet_size 4096, content 3072: one event filling the
        // content, one KiB of padding after it.
        let trace = sized_trace((3072 - 192) / 8);
        let mut w = BitWriter::new();
        w.write_u32_le(PACKET_HEADER_MAGIC).write_u32_le(0);
        w.write_u32_le(4096).write_u32_le(3072);
        w.write_u32_le(0);
        w.write_u32_le(0xdeadc0de);
        w.write_bytes(&vec![0u8; (3072 - 192) / 8]);
        assert_eq!(w.bit_len(), 3072);
        w.write_bytes(&vec![0u8; 1024 / 8]);
        let image = w.into_bytes();
        assert_eq!(image.len(), 512);

        let medium = BufferMedium::with_chunk_len(trace.clone(), image, 64);
        let mut decoder = StreamDecoder::new(trace, Box::new(medium)).unwrap();
        let notifs = drain(&mut decoder);
        assert_eq!(
            kinds(&notifs),
            vec![
                NotificationKind::StreamBegin,
                NotificationKind::PacketBegin,
                NotificationKind::Event,
                NotificationKind::PacketEnd,
                NotificationKind::StreamEnd,
            ]
        );
    }

    #[test]
    fn truncated_padding_is_an_error() {
        let trace = sized_trace((3072 - 192) / 8);
        let mut w = BitWriter::new();
        w.write_u32_le(PACKET_HEADER_MAGIC).write_u32_le(0);
        w.write_u32_le(4096).write_u32_le(3072);
        w.write_u32_le(0);
        w.write_u32_le(0xdeadc0de);
        w.write_bytes(&vec![0u8; (3072 - 192) / 8]);
        // Padding cut short: only half of the KiB is present.
        w.write_bytes(&vec![0u8; 64]);
        let medium = BufferMedium::new(trace.clone(), w.into_bytes());
        let mut decoder = StreamDecoder::new(trace, Box::new(medium)).unwrap();

        let mut saw_error = false;
        loop {
            match decoder.next() {
                Ok(DecoderNext::Notification(_)) => {}
                Ok(DecoderNext::Again) => {}
                Ok(DecoderNext::End) => break,
                Err(e) => {
                    assert!(matches!(
                        e,
                        Error::Decode(DecodeError::UnexpectedEof { .. })
                    ));
                    saw_error = true;
                    break;
                }
            }
        }
        assert!(saw_error);
        // Error is terminal; the next call reports the end.
        assert!(matches!(decoder.next().unwrap(), DecoderNext::End));
    }

    /// Trace with a 27-bit timestamp mapped to a 1 GHz clock, no packet
    /// header (single stream class), content-size-only framing.
    fn wrap_trace() -> (Rc<Trace>, Rc<ClockClass>) {
        let trace = Trace::new();
        let clock = ClockClass::new("cycles", 1_000_000_000);
        let sc = StreamClass::new(0);
        sc.set_default_clock_class(clock.clone()).unwrap();
        sc.set_packet_context_field_class(structure(&[("content_size", uint(32))]))
            .unwrap();
        let ts = uint(27);
        ts.as_integer().unwrap().map_clock_class(clock.clone()).unwrap();
        sc.set_event_header_field_class(structure(&[
            ("timestamp", ts),
            ("pad", uint(5)),
        ]))
        .unwrap();
        sc.add_event_class(EventClass::new(0, "tick")).unwrap();
        trace.add_stream_class(sc).unwrap();
        (trace, clock)
    }

    #[test]
    fn clock_wrap_adds_one_period() {
        let (trace, clock) = wrap_trace();
        let mut w = BitWriter::new();
        // content: 32-bit context + two 32-bit event headers.
        w.write_u32_le(96);
        w.write(0x07FF_FFFF, 27, LE).write(0, 5, LE);
        w.write(0x0000_0001, 27, LE).write(0, 5, LE);
        let medium = BufferMedium::new(trace.clone(), w.into_bytes());
        let mut decoder = StreamDecoder::new(trace, Box::new(medium)).unwrap();
        let notifs = drain(&mut decoder);
        assert_eq!(
            kinds(&notifs),
            vec![
                NotificationKind::StreamBegin,
                NotificationKind::PacketBegin,
                NotificationKind::Event,
                NotificationKind::Event,
                NotificationKind::PacketEnd,
                NotificationKind::StreamEnd,
            ]
        );
        let first = notifs[2].event_ref().unwrap().clock_value(&clock);
        let second = notifs[3].event_ref().unwrap().clock_value(&clock);
        assert_eq!(first, Some(0x07FF_FFFF));
        // One wrap of the 27-bit counter was assumed.
        assert_eq!(second, Some(0x0800_0001));
        assert_eq!(notifs[3].event_ref().unwrap().default_clock_value(), second);
    }

    #[test]
    fn stream_class_change_mid_sequence_is_fatal() {
        let trace = sized_trace(0);
        // A second stream class exists so the ID resolves; switching to
        // it mid-sequence is still a sequence error.
        trace.add_stream_class(StreamClass::new(1)).unwrap();

        let packet = |stream_id: u32| {
            let mut w = BitWriter::new();
            w.write_u32_le(PACKET_HEADER_MAGIC).write_u32_le(stream_id);
            w.write_u32_le(192).write_u32_le(192);
            w.write_u32_le(0);
            w.write_u32_le(0xdeadc0de);
            w.into_bytes()
        };
        let mut image = packet(0);
        image.extend(packet(1));

        let medium = BufferMedium::new(trace.clone(), image);
        let mut decoder = StreamDecoder::new(trace, Box::new(medium)).unwrap();

        let mut seen = Vec::new();
        let err = loop {
            match decoder.next() {
                Ok(DecoderNext::Notification(n)) => seen.push(n.kind()),
                Ok(DecoderNext::Again) => {}
                Ok(DecoderNext::End) => panic!("expected a stream class mismatch"),
                Err(e) => break e,
            }
        };
        // The whole first packet was delivered before the failure.
        assert_eq!(
            seen,
            vec![
                NotificationKind::StreamBegin,
                NotificationKind::PacketBegin,
                NotificationKind::Event,
                NotificationKind::PacketEnd,
            ]
        );
        assert!(matches!(
            err,
            Error::Decode(DecodeError::StreamClassMismatch {
                expected: 0,
                found: 1
            })
        ));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let trace = sized_trace(0);
        let mut w = BitWriter::new();
        w.write_u32_le(0xBADBADBA).write_u32_le(0);
        w.write_u32_le(192).write_u32_le(192);
        w.write_u32_le(0);
        w.write_u32_le(0xdeadc0de);
        let medium = BufferMedium::new(trace.clone(), w.into_bytes());
        let mut decoder = StreamDecoder::new(trace, Box::new(medium)).unwrap();
        assert!(matches!(
            decoder.next(),
            Err(Error::Decode(DecodeError::BadMagic { .. }))
        ));
    }

    #[test]
    fn packet_context_properties_are_carried() {
        let trace = Trace::new();
        trace
            .set_packet_header_field_class(structure(&[("stream_id", uint(32))]))
            .unwrap();
        let sc = StreamClass::new(0);
        sc.set_packet_context_field_class(structure(&[
            ("content_size", uint(32)),
            ("packet_seq_num", uint(32)),
            ("events_discarded", uint(32)),
        ]))
        .unwrap();
        sc.add_event_class(EventClass::new(0, "e")).unwrap();
        trace.add_stream_class(sc).unwrap();

        let mut w = BitWriter::new();
        w.write_u32_le(0);
        w.write_u32_le(128).write_u32_le(7).write_u32_le(3);
        let medium = BufferMedium::new(trace.clone(), w.into_bytes());
        let mut decoder = StreamDecoder::new(trace, Box::new(medium)).unwrap();
        let notifs = drain(&mut decoder);
        let packet = notifs[1].packet().unwrap();
        assert_eq!(packet.sequence_number(), Some(7));
        assert_eq!(packet.discarded_event_count(), Some(3));
        assert_eq!(
            packet.previous_packet_availability(),
            PreviousPacketAvailability::None
        );
    }

    #[test]
    fn sequences_and_variants_resolve_through_stored_values() {
        let trace = Trace::new();
        let sc = StreamClass::new(0);
        sc.set_packet_context_field_class(structure(&[("content_size", uint(32))]))
            .unwrap();

        let tag = FieldClass::enumeration(8, false, LE);
        tag.as_enumeration().unwrap().add_mapping("small", 0, 0).unwrap();
        tag.as_enumeration().unwrap().add_mapping("big", 1, 1).unwrap();
        let var = FieldClass::variant("tag");
        var.as_variant().unwrap().add_option("small", uint(16)).unwrap();
        var.as_variant().unwrap().add_option("big", uint(32)).unwrap();

        let ec = EventClass::new(0, "mixed");
        ec.set_payload_field_class(structure(&[
            ("len", uint(8)),
            ("tag", tag),
            ("data", FieldClass::sequence("len", uint(8))),
            ("v", var),
        ]))
        .unwrap();
        sc.add_event_class(ec).unwrap();
        trace.add_stream_class(sc).unwrap();

        // content: ctx 32 + len 8 + tag 8 + 3 bytes + u32 = 104 bits.
        let mut w = BitWriter::new();
        w.write_u32_le(104);
        w.write(3, 8, LE);
        w.write(1, 8, LE);
        w.write_bytes(&[10, 20, 30]);
        w.write_u32_le(0xAABBCCDD);
        let medium = BufferMedium::with_chunk_len(trace.clone(), w.into_bytes(), 2);
        let mut decoder = StreamDecoder::new(trace, Box::new(medium)).unwrap();
        let notifs = drain(&mut decoder);

        let event = notifs[2].event_ref().unwrap();
        let payload = event.payload().unwrap();
        let data = payload.member_by_name("data").unwrap();
        assert_eq!(data.member_count(), 3);
        assert_eq!(data.child_at(2).unwrap().as_unsigned(), Some(30));
        let v = payload.member_by_name("v").unwrap();
        assert_eq!(v.variant_selected_index(), Some(1));
        assert_eq!(v.variant_current().unwrap().as_unsigned(), Some(0xAABBCCDD));
    }

    #[test]
    fn deferred_timestamp_end_is_invisible_to_events() {
        let trace = Trace::new();
        let clock = ClockClass::new("c", 1_000_000_000);
        let sc = StreamClass::new(0);
        sc.set_default_clock_class(clock.clone()).unwrap();

        let ts_begin = uint(32);
        ts_begin.as_integer().unwrap().map_clock_class(clock.clone()).unwrap();
        let ts_end = uint(32);
        ts_end.as_integer().unwrap().map_clock_class(clock.clone()).unwrap();
        sc.set_packet_context_field_class(structure(&[
            ("content_size", uint(32)),
            ("timestamp_begin", ts_begin),
            ("timestamp_end", ts_end),
        ]))
        .unwrap();

        let ts = uint(32);
        ts.as_integer().unwrap().map_clock_class(clock.clone()).unwrap();
        sc.set_event_header_field_class(structure(&[("timestamp", ts)]))
            .unwrap();
        sc.add_event_class(EventClass::new(0, "e")).unwrap();
        trace.add_stream_class(sc).unwrap();

        // ctx 96 + one event header 32 = 128 bits of content.
        let mut w = BitWriter::new();
        w.write_u32_le(128).write_u32_le(100).write_u32_le(900);
        w.write_u32_le(150);
        let medium = BufferMedium::new(trace.clone(), w.into_bytes());
        let mut decoder = StreamDecoder::new(trace, Box::new(medium)).unwrap();
        let notifs = drain(&mut decoder);

        // The event sits between the packet timestamps: it must see the
        // event header's clock, not the packet's end timestamp.
        let event = notifs[2].event_ref().unwrap();
        assert_eq!(event.clock_value(&clock), Some(150));

        let packet = notifs[3].packet().unwrap();
        assert_eq!(packet.beginning_clock_value(), Some(100));
        assert_eq!(packet.end_clock_value(), Some(900));
        assert_eq!(notifs[3].default_clock_value(), Some(900));
    }

    #[test]
    fn compact_and_extended_event_headers_select_the_event_class() {
        // LTTng-shaped event header: an `id` enumeration whose
        // "extended" range routes the real event ID through the `v`
        // variant's option.
        let trace = Trace::new();
        let sc = StreamClass::new(0);
        sc.set_packet_context_field_class(structure(&[("content_size", uint(32))]))
            .unwrap();

        let id_enum = FieldClass::enumeration(8, false, LE);
        id_enum
            .as_enumeration()
            .unwrap()
            .add_mapping("compact", 0, 30)
            .unwrap();
        id_enum
            .as_enumeration()
            .unwrap()
            .add_mapping("extended", 31, 31)
            .unwrap();
        let v = FieldClass::variant("id");
        v.as_variant()
            .unwrap()
            .add_option("compact", FieldClass::structure())
            .unwrap();
        v.as_variant()
            .unwrap()
            .add_option("extended", structure(&[("id", uint(32))]))
            .unwrap();
        sc.set_event_header_field_class(structure(&[("id", id_enum), ("v", v)]))
            .unwrap();

        sc.add_event_class(EventClass::new(5, "five")).unwrap();
        sc.add_event_class(EventClass::new(200, "two_hundred")).unwrap();
        trace.add_stream_class(sc).unwrap();

        // ctx 32 + compact event (8 bits id, empty option) + extended
        // event (8 bits id + 32-bit inner id) = 80 bits of content.
        let mut w = BitWriter::new();
        w.write_u32_le(80);
        w.write(5, 8, LE);
        w.write(31, 8, LE);
        w.write_u32_le(200);
        let medium = BufferMedium::new(trace.clone(), w.into_bytes());
        let mut decoder = StreamDecoder::new(trace, Box::new(medium)).unwrap();
        let notifs = drain(&mut decoder);

        assert_eq!(kinds(&notifs).len(), 6);
        assert_eq!(notifs[2].event_ref().unwrap().event_class().id(), 5);
        assert_eq!(notifs[3].event_ref().unwrap().event_class().id(), 200);
    }

    #[test]
    fn header_uuid_is_checked_against_the_trace() {
        let trace = Trace::new();
        let trace_uuid = uuid::Uuid::from_bytes([7u8; 16]);
        trace.set_uuid(trace_uuid).unwrap();
        trace
            .set_packet_header_field_class(structure(&[(
                "uuid",
                FieldClass::static_array(16, uint(8)),
            )]))
            .unwrap();
        let sc = StreamClass::new(0);
        sc.set_packet_context_field_class(structure(&[("content_size", uint(32))]))
            .unwrap();
        sc.add_event_class(EventClass::new(0, "e")).unwrap();
        trace.add_stream_class(sc).unwrap();

        // Matching UUID decodes cleanly.
        let mut w = BitWriter::new();
        w.write_bytes(&[7u8; 16]);
        w.write_u32_le(160);
        let medium = BufferMedium::new(trace.clone(), w.into_bytes());
        let mut decoder = StreamDecoder::new(trace.clone(), Box::new(medium)).unwrap();
        let notifs = drain(&mut decoder);
        assert_eq!(kinds(&notifs).len(), 4);

        // A different UUID is rejected before anything is emitted.
        let mut w = BitWriter::new();
        w.write_bytes(&[9u8; 16]);
        w.write_u32_le(160);
        let medium = BufferMedium::new(trace.clone(), w.into_bytes());
        let mut decoder = StreamDecoder::new(trace, Box::new(medium)).unwrap();
        assert!(matches!(
            decoder.next(),
            Err(Error::Decode(DecodeError::UuidMismatch { .. }))
        ));
    }

    /// Wraps a medium, interleaving an `Again` before every response.
    struct Hesitant {
        inner: BufferMedium,
        ready: bool,
    }

    impl Medium for Hesitant {
        fn request_bytes(&mut self, max_len: usize) -> Result<MediumRequest, DecodeError> {
            if !self.ready {
                self.ready = true;
                return Ok(MediumRequest::Again);
            }
            self.ready = false;
            self.inner.request_bytes(max_len)
        }

        fn borrow_stream(
            &mut self,
            stream_class: &Rc<StreamClass>,
            stream_instance_id: Option<u64>,
        ) -> Result<Rc<Stream>, DecodeError> {
            self.inner.borrow_stream(stream_class, stream_instance_id)
        }
    }

    #[test]
    fn again_suspends_and_resumes_without_loss() {
        let trace = sized_trace(104);
        let medium = Hesitant {
            inner: BufferMedium::with_chunk_len(trace.clone(), single_packet_image(), 16),
            ready: false,
        };
        let mut decoder = StreamDecoder::new(trace, Box::new(medium)).unwrap();

        let mut notifs = Vec::new();
        let mut agains = 0;
        loop {
            match decoder.next().unwrap() {
                DecoderNext::Notification(n) => notifs.push(n),
                DecoderNext::Again => agains += 1,
                DecoderNext::End => break,
            }
        }
        assert!(agains > 0);
        assert_eq!(kinds(&notifs).len(), 5);
        let event = notifs[2].event_ref().unwrap();
        assert_eq!(
            event.payload().unwrap().child_at(0).unwrap().as_unsigned(),
            Some(0xdeadc0de)
        );
    }

    #[test]
    fn seek_restarts_at_a_packet_boundary() {
        let trace = sized_trace(0);
        let packet = |value: u32| {
            let mut w = BitWriter::new();
            w.write_u32_le(PACKET_HEADER_MAGIC).write_u32_le(0);
            w.write_u32_le(192).write_u32_le(192);
            w.write_u32_le(0);
            w.write_u32_le(value);
            w.into_bytes()
        };
        let mut image = packet(1);
        image.extend(packet(2));
        let medium = BufferMedium::new(trace.clone(), image);
        let mut decoder = StreamDecoder::new(trace, Box::new(medium)).unwrap();

        // Jump straight to the second packet.
        decoder.seek(24).unwrap();
        let notifs = drain(&mut decoder);
        assert_eq!(
            kinds(&notifs),
            vec![
                NotificationKind::StreamBegin,
                NotificationKind::PacketBegin,
                NotificationKind::Event,
                NotificationKind::PacketEnd,
                NotificationKind::StreamEnd,
            ]
        );
        let event = notifs[2].event_ref().unwrap();
        assert_eq!(
            event.payload().unwrap().child_at(0).unwrap().as_unsigned(),
            Some(2)
        );
        // After a seek the predecessor is unknown, not absent.
        assert_eq!(
            notifs[1].packet().unwrap().previous_packet_availability(),
            PreviousPacketAvailability::NotAvailable
        );
    }

    #[test]
    fn second_packet_sees_the_previous_one() {
        let trace = sized_trace(0);
        let packet = |value: u32| {
            let mut w = BitWriter::new();
            w.write_u32_le(PACKET_HEADER_MAGIC).write_u32_le(0);
            w.write_u32_le(192).write_u32_le(192);
            w.write_u32_le(0);
            w.write_u32_le(value);
            w.into_bytes()
        };
        let mut image = packet(1);
        image.extend(packet(2));
        let medium = BufferMedium::new(trace.clone(), image);
        let mut decoder = StreamDecoder::new(trace, Box::new(medium)).unwrap();
        let notifs = drain(&mut decoder);
        assert_eq!(
            kinds(&notifs),
            vec![
                NotificationKind::StreamBegin,
                NotificationKind::PacketBegin,
                NotificationKind::Event,
                NotificationKind::PacketEnd,
                NotificationKind::PacketBegin,
                NotificationKind::Event,
                NotificationKind::PacketEnd,
                NotificationKind::StreamEnd,
            ]
        );
        let first_packet = notifs[1].packet().unwrap();
        let second_packet = notifs[4].packet().unwrap();
        assert_eq!(
            second_packet.previous_packet_availability(),
            PreviousPacketAvailability::Available
        );
        assert!(Rc::ptr_eq(
            &second_packet.previous_packet().unwrap(),
            &first_packet
        ));
    }
}
