//! The binary type reader: a resumable bit-granular decoder driven by
//! a field class tree and a set of typed callbacks.
//!
//! The reader owns no IR state; every decoded value is passed by value
//! through the callbacks. `Eof` means "feed me more bytes", not end of
//! stream: the reader carries partial-integer and alignment state
//! across buffers so decoding resumes exactly where it stopped.

use std::rc::Rc;

use tracing::trace;

use crate::error::DecodeError;
use crate::ir::field_class::{ByteOrder, FieldClass};

/// Typed decode callbacks. One record of functions, matching the shape
/// of the class tree being walked.
pub trait BtrCallbacks {
    fn unsigned_int(&mut self, value: u64, class: &Rc<FieldClass>) -> Result<(), DecodeError>;
    fn signed_int(&mut self, value: i64, class: &Rc<FieldClass>) -> Result<(), DecodeError>;
    fn floating_point(&mut self, value: f64, class: &Rc<FieldClass>) -> Result<(), DecodeError>;
    fn string_begin(&mut self, class: &Rc<FieldClass>) -> Result<(), DecodeError>;
    fn string(&mut self, chunk: &[u8], class: &Rc<FieldClass>) -> Result<(), DecodeError>;
    fn string_end(&mut self, class: &Rc<FieldClass>) -> Result<(), DecodeError>;
    fn compound_begin(&mut self, class: &Rc<FieldClass>) -> Result<(), DecodeError>;
    fn compound_end(&mut self, class: &Rc<FieldClass>) -> Result<(), DecodeError>;

    /// Length of the sequence the reader just entered, resolved through
    /// the sequence's length path.
    fn sequence_length(&mut self, class: &Rc<FieldClass>) -> Result<u64, DecodeError>;

    /// Class of the option selected by the tag of the variant the
    /// reader just entered.
    fn variant_class(&mut self, class: &Rc<FieldClass>) -> Result<Rc<FieldClass>, DecodeError>;
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum BtrStatus {
    /// The class was decoded completely.
    Ok,
    /// More bytes are needed; call `resume` with the next buffer.
    Eof,
}

#[derive(Debug)]
struct StackEntry {
    class: Rc<FieldClass>,
    index: usize,
    len: usize,
    /// For variants: the option class selected by the tag.
    selected: Option<Rc<FieldClass>>,
}

#[derive(Clone, Debug)]
enum State {
    NextField,
    AlignBasic(Rc<FieldClass>),
    ReadBasic(Rc<FieldClass>),
    ReadString(Rc<FieldClass>),
    AlignCompound(Rc<FieldClass>),
    Done,
}

/// Partially decoded integer carried across buffer boundaries.
#[derive(Copy, Clone, Debug)]
struct Partial {
    bits_done: u32,
    acc: u64,
}

struct Cursor<'a> {
    buf: &'a [u8],
    at: usize,
    start: usize,
}

impl<'a> Cursor<'a> {
    fn available(&self) -> usize {
        self.buf.len() * 8 - self.at
    }

    fn consumed(&self) -> usize {
        self.at - self.start
    }
}

#[derive(Debug, Default)]
pub struct Btr {
    stack: Vec<StackEntry>,
    state: Option<State>,
    packet_at: usize,
    partial: Option<Partial>,
}

impl Btr {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begins decoding `class` from `buf` at `offset_bits`, with the
    /// first bit sitting `packet_at_bits` bits into the packet
    /// (alignment is computed from the packet start). Returns the
    /// status and the number of bits consumed from `buf`.
    pub fn start(
        &mut self,
        class: &Rc<FieldClass>,
        buf: &[u8],
        offset_bits: usize,
        packet_at_bits: usize,
        cbs: &mut dyn BtrCallbacks,
    ) -> Result<(BtrStatus, usize), DecodeError> {
        self.stack.clear();
        self.partial = None;
        self.packet_at = packet_at_bits;
        self.state = Some(if is_compound(class) {
            State::AlignCompound(class.clone())
        } else {
            State::AlignBasic(class.clone())
        });
        trace!(class = %class.type_id(), offset_bits, packet_at_bits, "starting field read");
        self.run(buf, offset_bits, cbs)
    }

    /// Resumes after `Eof` with the next buffer.
    pub fn resume(
        &mut self,
        buf: &[u8],
        cbs: &mut dyn BtrCallbacks,
    ) -> Result<(BtrStatus, usize), DecodeError> {
        self.run(buf, 0, cbs)
    }

    fn run(
        &mut self,
        buf: &[u8],
        offset_bits: usize,
        cbs: &mut dyn BtrCallbacks,
    ) -> Result<(BtrStatus, usize), DecodeError> {
        let mut cur = Cursor {
            buf,
            at: offset_bits,
            start: offset_bits,
        };
        loop {
            let state = self
                .state
                .clone()
                .ok_or(DecodeError::Poisoned("the binary reader was never started"))?;
            match state {
                State::Done => return Ok((BtrStatus::Ok, cur.consumed())),
                State::NextField => {
                    if !self.next_field(cbs)? {
                        return Ok((BtrStatus::Ok, cur.consumed()));
                    }
                }
                State::AlignBasic(class) => {
                    if !self.align(&mut cur, &class)? {
                        return Ok((BtrStatus::Eof, cur.consumed()));
                    }
                    self.state = Some(if matches!(&*class, FieldClass::String(_)) {
                        State::ReadString(class)
                    } else {
                        State::ReadBasic(class)
                    });
                }
                State::ReadBasic(class) => {
                    if !self.read_basic(&mut cur, &class, cbs)? {
                        return Ok((BtrStatus::Eof, cur.consumed()));
                    }
                    self.after_basic();
                }
                State::ReadString(class) => {
                    if self.partial.is_none() {
                        cbs.string_begin(&class)?;
                        // Marks the begin callback as already emitted.
                        self.partial = Some(Partial {
                            bits_done: 0,
                            acc: 0,
                        });
                    }
                    if !self.read_string(&mut cur, &class, cbs)? {
                        return Ok((BtrStatus::Eof, cur.consumed()));
                    }
                    self.partial = None;
                    cbs.string_end(&class)?;
                    self.after_basic();
                }
                State::AlignCompound(class) => {
                    if !self.align(&mut cur, &class)? {
                        return Ok((BtrStatus::Eof, cur.consumed()));
                    }
                    cbs.compound_begin(&class)?;
                    let entry = match &*class {
                        FieldClass::Structure(c) => StackEntry {
                            class: class.clone(),
                            index: 0,
                            len: c.member_count(),
                            selected: None,
                        },
                        FieldClass::StaticArray(c) => StackEntry {
                            class: class.clone(),
                            index: 0,
                            len: c.length() as usize,
                            selected: None,
                        },
                        FieldClass::Sequence(_) => {
                            let len = cbs.sequence_length(&class)?;
                            StackEntry {
                                class: class.clone(),
                                index: 0,
                                len: len as usize,
                                selected: None,
                            }
                        }
                        FieldClass::Variant(_) => {
                            let selected = cbs.variant_class(&class)?;
                            StackEntry {
                                class: class.clone(),
                                index: 0,
                                len: 1,
                                selected: Some(selected),
                            }
                        }
                        _ => {
                            return Err(DecodeError::Poisoned(
                                "a basic class was routed to the compound state",
                            ))
                        }
                    };
                    self.stack.push(entry);
                    self.state = Some(State::NextField);
                }
            }
        }
    }

    /// Advances to the next child of the top compound, popping finished
    /// compounds. Returns false when the whole tree is decoded.
    fn next_field(&mut self, cbs: &mut dyn BtrCallbacks) -> Result<bool, DecodeError> {
        loop {
            let Some(top) = self.stack.last_mut() else {
                self.state = Some(State::Done);
                return Ok(false);
            };
            if top.index == top.len {
                let class = top.class.clone();
                self.stack.pop();
                cbs.compound_end(&class)?;
                continue;
            }
            let child = child_class(top, top.index)?;
            top.index += 1;
            self.state = Some(if is_compound(&child) {
                State::AlignCompound(child)
            } else {
                State::AlignBasic(child)
            });
            return Ok(true);
        }
    }

    /// Skips padding up to the class's alignment boundary. Returns
    /// false when the buffer ran out first.
    fn align(
        &mut self,
        cur: &mut Cursor<'_>,
        class: &Rc<FieldClass>,
    ) -> Result<bool, DecodeError> {
        let alignment = class.alignment() as usize;
        let pad = (alignment - (self.packet_at % alignment)) % alignment;
        if pad == 0 {
            return Ok(true);
        }
        let take = pad.min(cur.available());
        cur.at += take;
        self.packet_at += take;
        Ok(take == pad)
    }

    fn after_basic(&mut self) {
        self.state = Some(if self.stack.is_empty() {
            State::Done
        } else {
            State::NextField
        });
    }

    /// Reads an integer, enumeration, or floating point field, possibly
    /// resuming a partial read. Returns false when more bytes are
    /// needed.
    fn read_basic(
        &mut self,
        cur: &mut Cursor<'_>,
        class: &Rc<FieldClass>,
        cbs: &mut dyn BtrCallbacks,
    ) -> Result<bool, DecodeError> {
        let (width, byte_order, signed) = match &**class {
            FieldClass::Integer(c) => (c.width(), c.byte_order(), c.is_signed()),
            FieldClass::Enumeration(c) => (
                c.container().width(),
                c.container().byte_order(),
                c.container().is_signed(),
            ),
            FieldClass::FloatingPoint(c) => (c.width().bits(), c.byte_order(), false),
            other => {
                return Err(DecodeError::Field(format!(
                    "cannot read a {} field as a basic field",
                    other.type_id()
                )))
            }
        };

        let mut partial = self.partial.take().unwrap_or(Partial {
            bits_done: 0,
            acc: 0,
        });
        let want = width - partial.bits_done;
        let take = (want as usize).min(cur.available()) as u32;
        let bits = read_bits(cur.buf, cur.at, take, byte_order);
        partial.acc = match byte_order {
            // bits_done < width <= 64 whenever a partial exists, so the
            // left shifts below stay in range.
            ByteOrder::LittleEndian => partial.acc | (bits << partial.bits_done),
            ByteOrder::BigEndian if take == 64 => bits,
            ByteOrder::BigEndian => (partial.acc << take) | bits,
        };
        partial.bits_done += take;
        cur.at += take as usize;
        self.packet_at += take as usize;

        if partial.bits_done < width {
            self.partial = Some(partial);
            return Ok(false);
        }

        let raw = partial.acc;
        match &**class {
            FieldClass::FloatingPoint(c) => {
                let value = match c.width().bits() {
                    32 => f64::from(f32::from_bits(raw as u32)),
                    _ => f64::from_bits(raw),
                };
                cbs.floating_point(value, class)?;
            }
            _ if signed => cbs.signed_int(sign_extend(raw, width), class)?,
            _ => cbs.unsigned_int(raw, class)?,
        }
        Ok(true)
    }

    /// Scans a null-terminated string, emitting available bytes as
    /// chunks. Returns false when the terminator was not reached.
    fn read_string(
        &mut self,
        cur: &mut Cursor<'_>,
        class: &Rc<FieldClass>,
        cbs: &mut dyn BtrCallbacks,
    ) -> Result<bool, DecodeError> {
        debug_assert_eq!(cur.at % 8, 0, "strings are byte aligned");
        let start_byte = cur.at / 8;
        let bytes = &cur.buf[start_byte..];
        match bytes.iter().position(|b| *b == 0) {
            Some(nul) => {
                if nul > 0 {
                    cbs.string(&bytes[..nul], class)?;
                }
                let consumed = (nul + 1) * 8;
                cur.at += consumed;
                self.packet_at += consumed;
                Ok(true)
            }
            None => {
                if !bytes.is_empty() {
                    cbs.string(bytes, class)?;
                    let consumed = bytes.len() * 8;
                    cur.at += consumed;
                    self.packet_at += consumed;
                }
                Ok(false)
            }
        }
    }
}

fn child_class(entry: &StackEntry, index: usize) -> Result<Rc<FieldClass>, DecodeError> {
    match &*entry.class {
        FieldClass::Structure(c) => c
            .member_by_index(index)
            .map(|(_, class)| class)
            .ok_or(DecodeError::Poisoned(
                "structure member index is out of range",
            )),
        FieldClass::StaticArray(c) => Ok(c.element_class().clone()),
        FieldClass::Sequence(c) => Ok(c.element_class().clone()),
        FieldClass::Variant(_) => entry.selected.clone().ok_or(DecodeError::Poisoned(
            "variant entry has no selected option class",
        )),
        _ => Err(DecodeError::Poisoned(
            "a basic class is sitting on the compound stack",
        )),
    }
}

fn is_compound(class: &Rc<FieldClass>) -> bool {
    matches!(
        &**class,
        FieldClass::Structure(_)
            | FieldClass::StaticArray(_)
            | FieldClass::Sequence(_)
            | FieldClass::Variant(_)
    )
}

fn sign_extend(raw: u64, width: u32) -> i64 {
    if width == 64 {
        return raw as i64;
    }
    let sign_bit = 1u64 << (width - 1);
    if raw & sign_bit != 0 {
        (raw | (!0u64 << width)) as i64
    } else {
        raw as i64
    }
}

/// Reads up to 64 bits starting at an absolute bit position.
///
/// Little-endian: bit k of the result is bit `(at + k) % 8` (from the
/// LSB) of byte `(at + k) / 8`. Big-endian: bits are taken MSB first.
/// Byte-aligned whole-byte reads take the byte fast path.
fn read_bits(buf: &[u8], at: usize, count: u32, byte_order: ByteOrder) -> u64 {
    if count == 0 {
        return 0;
    }
    if at % 8 == 0 && count % 8 == 0 {
        let mut value = 0u64;
        let first = at / 8;
        let nbytes = (count / 8) as usize;
        match byte_order {
            ByteOrder::LittleEndian => {
                for i in (0..nbytes).rev() {
                    value = (value << 8) | u64::from(buf[first + i]);
                }
            }
            ByteOrder::BigEndian => {
                for i in 0..nbytes {
                    value = (value << 8) | u64::from(buf[first + i]);
                }
            }
        }
        return value;
    }

    let mut value = 0u64;
    match byte_order {
        ByteOrder::LittleEndian => {
            for k in 0..count as usize {
                let pos = at + k;
                let bit = u64::from((buf[pos / 8] >> (pos % 8)) & 1);
                value |= bit << k;
            }
        }
        ByteOrder::BigEndian => {
            for k in 0..count as usize {
                let pos = at + k;
                let bit = u64::from((buf[pos / 8] >> (7 - pos % 8)) & 1);
                value = (value << 1) | bit;
            }
        }
    }
    value
}
