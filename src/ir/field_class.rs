//! Field classes: the recursive schema layer describing the wire layout
//! of every field a packet can contain.
//!
//! Field classes compose a tree. Integer and enumeration classes that
//! are referenced by a variant tag or a sequence length additionally
//! carry a stored-value slot index assigned during trace validation so
//! the hot decode path never walks the tree to find them again.

use std::cell::{Cell, OnceCell, RefCell};
use std::rc::Rc;

use crate::error::Error;
use crate::ir::clock::ClockClass;
use crate::ir::path::FieldPath;
use crate::object::FreezeFlag;
use crate::types::StoredValueIndex;

#[derive(Copy, Clone, Eq, PartialEq, Debug, derive_more::Display)]
pub enum ByteOrder {
    #[display(fmt = "le")]
    LittleEndian,
    #[display(fmt = "be")]
    BigEndian,
}

/// Preferred display base for integer values; carried through from the
/// metadata, not interpreted by the decoder.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum DisplayBase {
    Binary,
    Octal,
    Decimal,
    Hexadecimal,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, derive_more::Display)]
pub enum FieldClassId {
    #[display(fmt = "integer")]
    Integer,
    #[display(fmt = "enumeration")]
    Enumeration,
    #[display(fmt = "floating-point")]
    FloatingPoint,
    #[display(fmt = "string")]
    String,
    #[display(fmt = "structure")]
    Structure,
    #[display(fmt = "static-array")]
    StaticArray,
    #[display(fmt = "sequence")]
    Sequence,
    #[display(fmt = "variant")]
    Variant,
}

#[derive(Debug)]
pub struct IntegerFieldClass {
    pub(crate) freeze: FreezeFlag,
    width: u32,
    is_signed: bool,
    byte_order: ByteOrder,
    alignment: Cell<u32>,
    base: Cell<DisplayBase>,
    mapped_clock: RefCell<Option<Rc<ClockClass>>>,
    stored_index: Cell<Option<StoredValueIndex>>,
}

impl IntegerFieldClass {
    fn new(width: u32, is_signed: bool, byte_order: ByteOrder) -> Self {
        debug_assert!((1..=64).contains(&width));
        // Byte-multiple integers default to byte alignment, like the
        // usual CTF metadata emitters produce.
        let alignment = if width % 8 == 0 { 8 } else { 1 };
        Self {
            freeze: FreezeFlag::new(),
            width,
            is_signed,
            byte_order,
            alignment: Cell::new(alignment),
            base: Cell::new(DisplayBase::Decimal),
            mapped_clock: RefCell::new(None),
            stored_index: Cell::new(None),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn is_signed(&self) -> bool {
        self.is_signed
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    pub fn alignment(&self) -> u32 {
        self.alignment.get()
    }

    pub fn set_alignment(&self, alignment: u32) -> Result<(), Error> {
        self.freeze.check_hot("integer field class")?;
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(Error::Metadata(format!(
                "integer alignment must be a non-zero power of two, got {alignment}"
            )));
        }
        self.alignment.set(alignment);
        Ok(())
    }

    pub fn base(&self) -> DisplayBase {
        self.base.get()
    }

    pub fn set_base(&self, base: DisplayBase) -> Result<(), Error> {
        self.freeze.check_hot("integer field class")?;
        self.base.set(base);
        Ok(())
    }

    pub fn mapped_clock_class(&self) -> Option<Rc<ClockClass>> {
        self.mapped_clock.borrow().clone()
    }

    pub fn map_clock_class(&self, clock_class: Rc<ClockClass>) -> Result<(), Error> {
        self.freeze.check_hot("integer field class")?;
        *self.mapped_clock.borrow_mut() = Some(clock_class);
        Ok(())
    }

    pub fn stored_value_index(&self) -> Option<StoredValueIndex> {
        self.stored_index.get()
    }

    pub(crate) fn set_stored_value_index(&self, index: StoredValueIndex) {
        self.stored_index.set(Some(index));
    }
}

/// One labelled value range of an enumeration. Bounds are stored as the
/// container's raw bits; interpret per the container's signedness.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EnumerationMapping {
    pub label: String,
    pub lower: u64,
    pub upper: u64,
}

#[derive(Debug)]
pub struct EnumerationFieldClass {
    container: IntegerFieldClass,
    mappings: RefCell<Vec<EnumerationMapping>>,
}

impl EnumerationFieldClass {
    pub fn container(&self) -> &IntegerFieldClass {
        &self.container
    }

    pub fn add_mapping(
        &self,
        label: impl Into<String>,
        lower: u64,
        upper: u64,
    ) -> Result<(), Error> {
        self.container.freeze.check_hot("enumeration field class")?;
        self.mappings.borrow_mut().push(EnumerationMapping {
            label: label.into(),
            lower,
            upper,
        });
        Ok(())
    }

    pub fn mappings(&self) -> Vec<EnumerationMapping> {
        self.mappings.borrow().clone()
    }

    /// First mapping whose range contains `value`, if any. Ranges may
    /// overlap; the first one wins, matching declaration order.
    pub fn label_for_value(&self, value: u64) -> Option<String> {
        let signed = self.container.is_signed();
        self.mappings
            .borrow()
            .iter()
            .find(|m| {
                if signed {
                    let v = value as i64;
                    (m.lower as i64) <= v && v <= (m.upper as i64)
                } else {
                    m.lower <= value && value <= m.upper
                }
            })
            .map(|m| m.label.clone())
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum FloatWidth {
    Single,
    Double,
}

impl FloatWidth {
    pub fn bits(self) -> u32 {
        match self {
            FloatWidth::Single => 32,
            FloatWidth::Double => 64,
        }
    }
}

#[derive(Debug)]
pub struct FloatingPointFieldClass {
    freeze: FreezeFlag,
    width: FloatWidth,
    byte_order: ByteOrder,
    alignment: Cell<u32>,
}

impl FloatingPointFieldClass {
    pub fn width(&self) -> FloatWidth {
        self.width
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    pub fn alignment(&self) -> u32 {
        self.alignment.get()
    }

    pub fn set_alignment(&self, alignment: u32) -> Result<(), Error> {
        self.freeze.check_hot("floating point field class")?;
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(Error::Metadata(format!(
                "floating point alignment must be a non-zero power of two, got {alignment}"
            )));
        }
        self.alignment.set(alignment);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct StringFieldClass {
    freeze: FreezeFlag,
}

#[derive(Debug)]
pub struct StructureFieldClass {
    freeze: FreezeFlag,
    members: RefCell<Vec<(String, Rc<FieldClass>)>>,
}

impl StructureFieldClass {
    pub fn member_count(&self) -> usize {
        self.members.borrow().len()
    }

    pub fn add_member(
        &self,
        name: impl Into<String>,
        class: Rc<FieldClass>,
    ) -> Result<(), Error> {
        self.freeze.check_hot("structure field class")?;
        let name = name.into();
        if self.member_index(&name).is_some() {
            return Err(Error::Metadata(format!(
                "structure already has a member named '{name}'"
            )));
        }
        self.members.borrow_mut().push((name, class));
        Ok(())
    }

    pub fn member_by_index(&self, index: usize) -> Option<(String, Rc<FieldClass>)> {
        self.members.borrow().get(index).cloned()
    }

    pub fn member_index(&self, name: &str) -> Option<usize> {
        self.members.borrow().iter().position(|(n, _)| n == name)
    }

    pub fn member_class(&self, name: &str) -> Option<Rc<FieldClass>> {
        self.members
            .borrow()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, c)| c.clone())
    }

    pub(crate) fn members(&self) -> Vec<(String, Rc<FieldClass>)> {
        self.members.borrow().clone()
    }
}

#[derive(Debug)]
pub struct StaticArrayFieldClass {
    freeze: FreezeFlag,
    length: u64,
    element: Rc<FieldClass>,
}

impl StaticArrayFieldClass {
    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn element_class(&self) -> &Rc<FieldClass> {
        &self.element
    }
}

#[derive(Debug)]
pub struct SequenceFieldClass {
    freeze: FreezeFlag,
    length_path_expr: String,
    element: Rc<FieldClass>,
    resolved_length_path: OnceCell<FieldPath>,
    stored_length_index: Cell<Option<StoredValueIndex>>,
}

impl SequenceFieldClass {
    pub fn length_path_expr(&self) -> &str {
        &self.length_path_expr
    }

    pub fn element_class(&self) -> &Rc<FieldClass> {
        &self.element
    }

    pub fn length_path(&self) -> Option<&FieldPath> {
        self.resolved_length_path.get()
    }

    pub(crate) fn set_length_path(&self, path: FieldPath) {
        let _ = self.resolved_length_path.set(path);
    }

    pub fn stored_length_index(&self) -> Option<StoredValueIndex> {
        self.stored_length_index.get()
    }

    pub(crate) fn set_stored_length_index(&self, index: StoredValueIndex) {
        self.stored_length_index.set(Some(index));
    }
}

#[derive(Debug)]
pub struct VariantFieldClass {
    freeze: FreezeFlag,
    tag_path_expr: String,
    options: RefCell<Vec<(String, Rc<FieldClass>)>>,
    resolved_tag_path: OnceCell<FieldPath>,
    tag_class: OnceCell<Rc<FieldClass>>,
    stored_tag_index: Cell<Option<StoredValueIndex>>,
}

impl VariantFieldClass {
    pub fn tag_path_expr(&self) -> &str {
        &self.tag_path_expr
    }

    pub fn option_count(&self) -> usize {
        self.options.borrow().len()
    }

    pub fn add_option(
        &self,
        name: impl Into<String>,
        class: Rc<FieldClass>,
    ) -> Result<(), Error> {
        self.freeze.check_hot("variant field class")?;
        let name = name.into();
        if self.option_index(&name).is_some() {
            return Err(Error::Metadata(format!(
                "variant already has an option named '{name}'"
            )));
        }
        self.options.borrow_mut().push((name, class));
        Ok(())
    }

    pub fn option_by_index(&self, index: usize) -> Option<(String, Rc<FieldClass>)> {
        self.options.borrow().get(index).cloned()
    }

    pub fn option_index(&self, name: &str) -> Option<usize> {
        self.options.borrow().iter().position(|(n, _)| n == name)
    }

    pub(crate) fn options(&self) -> Vec<(String, Rc<FieldClass>)> {
        self.options.borrow().clone()
    }

    pub fn tag_path(&self) -> Option<&FieldPath> {
        self.resolved_tag_path.get()
    }

    pub(crate) fn set_tag_path(&self, path: FieldPath) {
        let _ = self.resolved_tag_path.set(path);
    }

    /// The enumeration class the tag path resolved to.
    pub fn tag_class(&self) -> Option<&Rc<FieldClass>> {
        self.tag_class.get()
    }

    pub(crate) fn set_tag_class(&self, class: Rc<FieldClass>) {
        let _ = self.tag_class.set(class);
    }

    pub fn stored_tag_index(&self) -> Option<StoredValueIndex> {
        self.stored_tag_index.get()
    }

    pub(crate) fn set_stored_tag_index(&self, index: StoredValueIndex) {
        self.stored_tag_index.set(Some(index));
    }

    /// Selects the option for a raw tag value through the tag
    /// enumeration's label mappings.
    pub fn option_for_tag(&self, tag: u64) -> Option<(usize, Rc<FieldClass>)> {
        let tag_class = self.tag_class.get()?;
        let label = tag_class.as_enumeration()?.label_for_value(tag)?;
        let index = self.option_index(&label)?;
        let class = self.options.borrow()[index].1.clone();
        Some((index, class))
    }
}

#[derive(Debug)]
pub enum FieldClass {
    Integer(IntegerFieldClass),
    Enumeration(EnumerationFieldClass),
    FloatingPoint(FloatingPointFieldClass),
    String(StringFieldClass),
    Structure(StructureFieldClass),
    StaticArray(StaticArrayFieldClass),
    Sequence(SequenceFieldClass),
    Variant(VariantFieldClass),
}

impl FieldClass {
    pub fn unsigned_integer(width: u32, byte_order: ByteOrder) -> Rc<Self> {
        Rc::new(FieldClass::Integer(IntegerFieldClass::new(
            width, false, byte_order,
        )))
    }

    pub fn signed_integer(width: u32, byte_order: ByteOrder) -> Rc<Self> {
        Rc::new(FieldClass::Integer(IntegerFieldClass::new(
            width, true, byte_order,
        )))
    }

    pub fn enumeration(width: u32, is_signed: bool, byte_order: ByteOrder) -> Rc<Self> {
        Rc::new(FieldClass::Enumeration(EnumerationFieldClass {
            container: IntegerFieldClass::new(width, is_signed, byte_order),
            mappings: RefCell::new(Vec::new()),
        }))
    }

    pub fn floating_point(width: FloatWidth, byte_order: ByteOrder) -> Rc<Self> {
        Rc::new(FieldClass::FloatingPoint(FloatingPointFieldClass {
            freeze: FreezeFlag::new(),
            width,
            byte_order,
            alignment: Cell::new(8),
        }))
    }

    pub fn string() -> Rc<Self> {
        Rc::new(FieldClass::String(StringFieldClass::default()))
    }

    pub fn structure() -> Rc<Self> {
        Rc::new(FieldClass::Structure(StructureFieldClass {
            freeze: FreezeFlag::new(),
            members: RefCell::new(Vec::new()),
        }))
    }

    pub fn static_array(length: u64, element: Rc<FieldClass>) -> Rc<Self> {
        Rc::new(FieldClass::StaticArray(StaticArrayFieldClass {
            freeze: FreezeFlag::new(),
            length,
            element,
        }))
    }

    pub fn sequence(length_path_expr: impl Into<String>, element: Rc<FieldClass>) -> Rc<Self> {
        Rc::new(FieldClass::Sequence(SequenceFieldClass {
            freeze: FreezeFlag::new(),
            length_path_expr: length_path_expr.into(),
            element,
            resolved_length_path: OnceCell::new(),
            stored_length_index: Cell::new(None),
        }))
    }

    pub fn variant(tag_path_expr: impl Into<String>) -> Rc<Self> {
        Rc::new(FieldClass::Variant(VariantFieldClass {
            freeze: FreezeFlag::new(),
            tag_path_expr: tag_path_expr.into(),
            options: RefCell::new(Vec::new()),
            resolved_tag_path: OnceCell::new(),
            tag_class: OnceCell::new(),
            stored_tag_index: Cell::new(None),
        }))
    }

    pub fn type_id(&self) -> FieldClassId {
        match self {
            FieldClass::Integer(_) => FieldClassId::Integer,
            FieldClass::Enumeration(_) => FieldClassId::Enumeration,
            FieldClass::FloatingPoint(_) => FieldClassId::FloatingPoint,
            FieldClass::String(_) => FieldClassId::String,
            FieldClass::Structure(_) => FieldClassId::Structure,
            FieldClass::StaticArray(_) => FieldClassId::StaticArray,
            FieldClass::Sequence(_) => FieldClassId::Sequence,
            FieldClass::Variant(_) => FieldClassId::Variant,
        }
    }

    pub fn as_integer(&self) -> Option<&IntegerFieldClass> {
        match self {
            FieldClass::Integer(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_enumeration(&self) -> Option<&EnumerationFieldClass> {
        match self {
            FieldClass::Enumeration(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_structure(&self) -> Option<&StructureFieldClass> {
        match self {
            FieldClass::Structure(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&SequenceFieldClass> {
        match self {
            FieldClass::Sequence(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_variant(&self) -> Option<&VariantFieldClass> {
        match self {
            FieldClass::Variant(c) => Some(c),
            _ => None,
        }
    }

    /// Integer-like view: the integer class itself or an enumeration's
    /// container.
    pub fn as_integer_like(&self) -> Option<&IntegerFieldClass> {
        match self {
            FieldClass::Integer(c) => Some(c),
            FieldClass::Enumeration(c) => Some(c.container()),
            _ => None,
        }
    }

    /// Stored-value slot of an integer or enumeration class.
    pub fn stored_value_index(&self) -> Option<StoredValueIndex> {
        self.as_integer_like().and_then(|c| c.stored_value_index())
    }

    pub(crate) fn set_stored_value_index(&self, index: StoredValueIndex) {
        if let Some(c) = self.as_integer_like() {
            c.set_stored_value_index(index);
        }
    }

    /// Alignment in bits, counted from the start of the packet.
    /// Compound classes align to their most demanding child.
    pub fn alignment(&self) -> u32 {
        match self {
            FieldClass::Integer(c) => c.alignment(),
            FieldClass::Enumeration(c) => c.container().alignment(),
            FieldClass::FloatingPoint(c) => c.alignment(),
            FieldClass::String(_) => 8,
            FieldClass::Structure(c) => c
                .members
                .borrow()
                .iter()
                .map(|(_, m)| m.alignment())
                .max()
                .unwrap_or(1),
            FieldClass::StaticArray(c) => c.element.alignment(),
            FieldClass::Sequence(c) => c.element.alignment(),
            FieldClass::Variant(c) => c
                .options
                .borrow()
                .iter()
                .map(|(_, o)| o.alignment())
                .max()
                .unwrap_or(1),
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.freeze_flag().is_frozen()
    }

    fn freeze_flag(&self) -> &FreezeFlag {
        match self {
            FieldClass::Integer(c) => &c.freeze,
            FieldClass::Enumeration(c) => &c.container.freeze,
            FieldClass::FloatingPoint(c) => &c.freeze,
            FieldClass::String(c) => &c.freeze,
            FieldClass::Structure(c) => &c.freeze,
            FieldClass::StaticArray(c) => &c.freeze,
            FieldClass::Sequence(c) => &c.freeze,
            FieldClass::Variant(c) => &c.freeze,
        }
    }

    /// Freezes this class and every class reachable from it.
    pub fn freeze(&self) {
        if self.is_frozen() {
            return;
        }
        self.freeze_flag().freeze();
        match self {
            FieldClass::Integer(_)
            | FieldClass::Enumeration(_)
            | FieldClass::FloatingPoint(_)
            | FieldClass::String(_) => {}
            FieldClass::Structure(c) => {
                for (_, member) in c.members.borrow().iter() {
                    member.freeze();
                }
            }
            FieldClass::StaticArray(c) => c.element.freeze(),
            FieldClass::Sequence(c) => c.element.freeze(),
            FieldClass::Variant(c) => {
                for (_, option) in c.options.borrow().iter() {
                    option.freeze();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn structure_member_lookup() {
        let st = FieldClass::structure();
        let su = st.as_structure().unwrap();
        su.add_member("a", FieldClass::unsigned_integer(8, ByteOrder::LittleEndian))
            .unwrap();
        su.add_member("b", FieldClass::string()).unwrap();
        assert_eq!(su.member_index("b"), Some(1));
        assert!(su.member_class("c").is_none());
        assert!(su
            .add_member("a", FieldClass::string())
            .is_err());
    }

    #[test]
    fn freeze_propagates_to_children() {
        let inner = FieldClass::unsigned_integer(16, ByteOrder::BigEndian);
        let st = FieldClass::structure();
        st.as_structure()
            .unwrap()
            .add_member("x", inner.clone())
            .unwrap();
        st.freeze();
        assert!(st.is_frozen());
        assert!(inner.is_frozen());
        assert!(inner.as_integer().unwrap().set_alignment(16).is_err());
    }

    #[test]
    fn enumeration_label_lookup_first_match_wins() {
        let en = FieldClass::enumeration(8, false, ByteOrder::LittleEndian);
        let ec = en.as_enumeration().unwrap();
        ec.add_mapping("LOW", 0, 9).unwrap();
        ec.add_mapping("ALSO_LOW", 5, 9).unwrap();
        ec.add_mapping("HIGH", 10, 255).unwrap();
        assert_eq!(ec.label_for_value(7).as_deref(), Some("LOW"));
        assert_eq!(ec.label_for_value(10).as_deref(), Some("HIGH"));
    }

    #[test]
    fn signed_enumeration_ranges() {
        let en = FieldClass::enumeration(8, true, ByteOrder::LittleEndian);
        let ec = en.as_enumeration().unwrap();
        ec.add_mapping("NEG", -10i64 as u64, -1i64 as u64).unwrap();
        assert_eq!(ec.label_for_value(-5i64 as u64).as_deref(), Some("NEG"));
        assert_eq!(ec.label_for_value(5), None);
    }

    #[test]
    fn alignment_of_compounds_is_max_of_children() {
        let st = FieldClass::structure();
        let su = st.as_structure().unwrap();
        su.add_member("a", FieldClass::unsigned_integer(5, ByteOrder::LittleEndian))
            .unwrap();
        let wide = FieldClass::unsigned_integer(64, ByteOrder::LittleEndian);
        wide.as_integer().unwrap().set_alignment(64).unwrap();
        su.add_member("b", wide).unwrap();
        assert_eq!(st.alignment(), 64);
    }

    #[test]
    fn variant_option_selection_through_tag() {
        let tag = FieldClass::enumeration(8, false, ByteOrder::LittleEndian);
        tag.as_enumeration().unwrap().add_mapping("u16", 0, 0).unwrap();
        tag.as_enumeration().unwrap().add_mapping("u32", 1, 1).unwrap();
        let var = FieldClass::variant("tag");
        let vc = var.as_variant().unwrap();
        vc.add_option("u16", FieldClass::unsigned_integer(16, ByteOrder::LittleEndian))
            .unwrap();
        vc.add_option("u32", FieldClass::unsigned_integer(32, ByteOrder::LittleEndian))
            .unwrap();
        vc.set_tag_class(tag);
        let (idx, class) = vc.option_for_tag(1).unwrap();
        assert_eq!(idx, 1);
        assert_eq!(class.as_integer().unwrap().width(), 32);
        assert!(vc.option_for_tag(7).is_none());
    }
}
