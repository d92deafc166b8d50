//! Field instances: one value tree per dynamic scope, shaped by a field
//! class tree. The decoder fills these in decode order and moves them
//! into packets and events wholesale.

use std::rc::Rc;

use crate::error::DecodeError;
use crate::ir::field_class::{FieldClass, FieldClassId};

#[derive(Debug, Clone)]
pub enum Field {
    UnsignedInteger {
        class: Rc<FieldClass>,
        value: Option<u64>,
    },
    SignedInteger {
        class: Rc<FieldClass>,
        value: Option<i64>,
    },
    FloatingPoint {
        class: Rc<FieldClass>,
        value: Option<f64>,
    },
    String {
        class: Rc<FieldClass>,
        value: Option<String>,
    },
    Structure {
        class: Rc<FieldClass>,
        members: Vec<Field>,
    },
    StaticArray {
        class: Rc<FieldClass>,
        elements: Vec<Field>,
    },
    Sequence {
        class: Rc<FieldClass>,
        elements: Vec<Field>,
    },
    Variant {
        class: Rc<FieldClass>,
        tag: Option<u64>,
        selected: Option<(usize, Box<Field>)>,
    },
}

impl Field {
    /// Instantiates an unset field tree for a class. Sequences start
    /// empty; variants start unselected.
    pub fn new(class: Rc<FieldClass>) -> Field {
        enum Shape {
            Unsigned,
            Signed,
            Float,
            Str,
            Structure(Vec<Field>),
            StaticArray(Vec<Field>),
            Sequence,
            Variant,
        }
        let shape = match &*class {
            FieldClass::Integer(_) | FieldClass::Enumeration(_) => {
                let signed = class
                    .as_integer_like()
                    .map(|c| c.is_signed())
                    .unwrap_or(false);
                if signed {
                    Shape::Signed
                } else {
                    Shape::Unsigned
                }
            }
            FieldClass::FloatingPoint(_) => Shape::Float,
            FieldClass::String(_) => Shape::Str,
            FieldClass::Structure(c) => Shape::Structure(
                c.members().into_iter().map(|(_, mc)| Field::new(mc)).collect(),
            ),
            FieldClass::StaticArray(c) => Shape::StaticArray(
                (0..c.length())
                    .map(|_| Field::new(c.element_class().clone()))
                    .collect(),
            ),
            FieldClass::Sequence(_) => Shape::Sequence,
            FieldClass::Variant(_) => Shape::Variant,
        };
        match shape {
            Shape::Unsigned => Field::UnsignedInteger { class, value: None },
            Shape::Signed => Field::SignedInteger { class, value: None },
            Shape::Float => Field::FloatingPoint { class, value: None },
            Shape::Str => Field::String { class, value: None },
            Shape::Structure(members) => Field::Structure { class, members },
            Shape::StaticArray(elements) => Field::StaticArray { class, elements },
            Shape::Sequence => Field::Sequence {
                class,
                elements: Vec::new(),
            },
            Shape::Variant => Field::Variant {
                class,
                tag: None,
                selected: None,
            },
        }
    }

    pub fn class(&self) -> &Rc<FieldClass> {
        match self {
            Field::UnsignedInteger { class, .. }
            | Field::SignedInteger { class, .. }
            | Field::FloatingPoint { class, .. }
            | Field::String { class, .. }
            | Field::Structure { class, .. }
            | Field::StaticArray { class, .. }
            | Field::Sequence { class, .. }
            | Field::Variant { class, .. } => class,
        }
    }

    pub fn type_id(&self) -> FieldClassId {
        self.class().type_id()
    }

    pub fn set_unsigned(&mut self, v: u64) -> Result<(), DecodeError> {
        match self {
            Field::UnsignedInteger { value, .. } => {
                *value = Some(v);
                Ok(())
            }
            other => Err(DecodeError::Field(format!(
                "cannot set an unsigned value on a {} field",
                other.type_id()
            ))),
        }
    }

    pub fn set_signed(&mut self, v: i64) -> Result<(), DecodeError> {
        match self {
            Field::SignedInteger { value, .. } => {
                *value = Some(v);
                Ok(())
            }
            other => Err(DecodeError::Field(format!(
                "cannot set a signed value on a {} field",
                other.type_id()
            ))),
        }
    }

    pub fn set_float(&mut self, v: f64) -> Result<(), DecodeError> {
        match self {
            Field::FloatingPoint { value, .. } => {
                *value = Some(v);
                Ok(())
            }
            other => Err(DecodeError::Field(format!(
                "cannot set a floating point value on a {} field",
                other.type_id()
            ))),
        }
    }

    pub fn as_unsigned(&self) -> Option<u64> {
        match self {
            Field::UnsignedInteger { value, .. } => *value,
            _ => None,
        }
    }

    pub fn as_signed(&self) -> Option<i64> {
        match self {
            Field::SignedInteger { value, .. } => *value,
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Field::FloatingPoint { value, .. } => *value,
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Field::String { value, .. } => value.as_deref(),
            _ => None,
        }
    }

    /// Raw bits of an integer or enumeration field, regardless of
    /// signedness.
    pub fn raw_bits(&self) -> Option<u64> {
        match self {
            Field::UnsignedInteger { value, .. } => *value,
            Field::SignedInteger { value, .. } => value.map(|v| v as u64),
            _ => None,
        }
    }

    /// Labels of an enumeration field's current value.
    pub fn enumeration_label(&self) -> Option<String> {
        let raw = self.raw_bits()?;
        self.class().as_enumeration()?.label_for_value(raw)
    }

    pub fn string_clear(&mut self) -> Result<(), DecodeError> {
        match self {
            Field::String { value, .. } => {
                match value {
                    Some(s) => s.clear(),
                    None => *value = Some(String::new()),
                }
                Ok(())
            }
            other => Err(DecodeError::Field(format!(
                "cannot clear a {} field as a string",
                other.type_id()
            ))),
        }
    }

    pub fn string_append(&mut self, chunk: &str) -> Result<(), DecodeError> {
        match self {
            Field::String { value, .. } => {
                value.get_or_insert_with(String::new).push_str(chunk);
                Ok(())
            }
            other => Err(DecodeError::Field(format!(
                "cannot append to a {} field as a string",
                other.type_id()
            ))),
        }
    }

    pub fn member_count(&self) -> usize {
        match self {
            Field::Structure { members, .. } => members.len(),
            Field::StaticArray { elements, .. } | Field::Sequence { elements, .. } => {
                elements.len()
            }
            Field::Variant { selected, .. } => usize::from(selected.is_some()),
            _ => 0,
        }
    }

    /// Child used by decode-order navigation: structure member or array
    /// element by index, the selected field for variants.
    pub fn child_at(&self, index: usize) -> Option<&Field> {
        match self {
            Field::Structure { members, .. } => members.get(index),
            Field::StaticArray { elements, .. } | Field::Sequence { elements, .. } => {
                elements.get(index)
            }
            Field::Variant { selected, .. } => selected.as_ref().map(|(_, f)| f.as_ref()),
            _ => None,
        }
    }

    pub fn child_at_mut(&mut self, index: usize) -> Option<&mut Field> {
        match self {
            Field::Structure { members, .. } => members.get_mut(index),
            Field::StaticArray { elements, .. } | Field::Sequence { elements, .. } => {
                elements.get_mut(index)
            }
            Field::Variant { selected, .. } => selected.as_mut().map(|(_, f)| f.as_mut()),
            _ => None,
        }
    }

    /// Structure member by name, through the class's member table.
    pub fn member_by_name(&self, name: &str) -> Option<&Field> {
        match self {
            Field::Structure { class, members } => {
                let index = class.as_structure()?.member_index(name)?;
                members.get(index)
            }
            _ => None,
        }
    }

    /// Grows a sequence to its decoded length.
    pub fn sequence_set_length(&mut self, length: u64) -> Result<(), DecodeError> {
        match self {
            Field::Sequence { class, elements } => {
                let element_class = class
                    .as_sequence()
                    .ok_or_else(|| {
                        DecodeError::Field(
                            "sequence field does not carry a sequence class".into(),
                        )
                    })?
                    .element_class()
                    .clone();
                elements.clear();
                elements.reserve(length as usize);
                for _ in 0..length {
                    elements.push(Field::new(element_class.clone()));
                }
                Ok(())
            }
            other => Err(DecodeError::Field(format!(
                "cannot set a length on a {} field",
                other.type_id()
            ))),
        }
    }

    /// Selects a variant option from a raw tag value.
    pub fn variant_set_tag(&mut self, tag_value: u64) -> Result<(), DecodeError> {
        match self {
            Field::Variant {
                class,
                tag,
                selected,
            } => {
                let vc = class.as_variant().ok_or_else(|| {
                    DecodeError::Field("variant field does not carry a variant class".into())
                })?;
                let (index, option_class) = vc
                    .option_for_tag(tag_value)
                    .ok_or(DecodeError::NoVariantOption(tag_value))?;
                *tag = Some(tag_value);
                *selected = Some((index, Box::new(Field::new(option_class))));
                Ok(())
            }
            other => Err(DecodeError::Field(format!(
                "cannot set a variant tag on a {} field",
                other.type_id()
            ))),
        }
    }

    pub fn variant_selected_index(&self) -> Option<usize> {
        match self {
            Field::Variant { selected, .. } => selected.as_ref().map(|(i, _)| *i),
            _ => None,
        }
    }

    pub fn variant_current(&self) -> Option<&Field> {
        match self {
            Field::Variant { selected, .. } => selected.as_ref().map(|(_, f)| f.as_ref()),
            _ => None,
        }
    }

    /// Returns the field to its unset state, keeping allocations where
    /// possible. Used by the packet and notification pools.
    pub fn reset(&mut self) {
        match self {
            Field::UnsignedInteger { value, .. } => *value = None,
            Field::SignedInteger { value, .. } => *value = None,
            Field::FloatingPoint { value, .. } => *value = None,
            Field::String { value, .. } => {
                if let Some(s) = value {
                    s.clear();
                }
                *value = None;
            }
            Field::Structure { members, .. } => {
                for m in members {
                    m.reset();
                }
            }
            Field::StaticArray { elements, .. } => {
                for e in elements {
                    e.reset();
                }
            }
            Field::Sequence { elements, .. } => elements.clear(),
            Field::Variant { tag, selected, .. } => {
                *tag = None;
                *selected = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::field_class::ByteOrder;
    use pretty_assertions::assert_eq;

    fn sample_struct() -> Rc<FieldClass> {
        let st = FieldClass::structure();
        let su = st.as_structure().unwrap();
        su.add_member("len", FieldClass::unsigned_integer(8, ByteOrder::LittleEndian))
            .unwrap();
        su.add_member(
            "data",
            FieldClass::sequence("len", FieldClass::unsigned_integer(8, ByteOrder::LittleEndian)),
        )
        .unwrap();
        st
    }

    #[test]
    fn instantiation_mirrors_the_class_tree() {
        let f = Field::new(sample_struct());
        assert_eq!(f.member_count(), 2);
        assert_eq!(f.child_at(0).unwrap().as_unsigned(), None);
        assert_eq!(f.child_at(1).unwrap().member_count(), 0);
    }

    #[test]
    fn member_lookup_by_name() {
        let mut f = Field::new(sample_struct());
        f.child_at_mut(0).unwrap().set_unsigned(3).unwrap();
        assert_eq!(f.member_by_name("len").unwrap().as_unsigned(), Some(3));
        assert!(f.member_by_name("nope").is_none());
    }

    #[test]
    fn sequence_growth_and_reset() {
        let mut f = Field::new(sample_struct());
        let seq = f.child_at_mut(1).unwrap();
        seq.sequence_set_length(4).unwrap();
        assert_eq!(seq.member_count(), 4);
        f.reset();
        assert_eq!(f.child_at(1).unwrap().member_count(), 0);
        assert_eq!(f.child_at(0).unwrap().as_unsigned(), None);
    }

    #[test]
    fn signed_fields_instantiate_signed() {
        let f = Field::new(FieldClass::signed_integer(16, ByteOrder::BigEndian));
        assert!(matches!(f, Field::SignedInteger { .. }));
        let f = Field::new(FieldClass::enumeration(8, true, ByteOrder::LittleEndian));
        assert!(matches!(f, Field::SignedInteger { .. }));
    }

    #[test]
    fn string_chunked_append() {
        let mut f = Field::new(FieldClass::string());
        f.string_clear().unwrap();
        f.string_append("hel").unwrap();
        f.string_append("lo").unwrap();
        assert_eq!(f.as_str(), Some("hello"));
    }

    #[test]
    fn type_mismatch_is_an_error() {
        let mut f = Field::new(FieldClass::string());
        assert!(f.set_unsigned(1).is_err());
        let mut f = Field::new(FieldClass::unsigned_integer(8, ByteOrder::LittleEndian));
        assert!(f.set_signed(-1).is_err());
    }
}
