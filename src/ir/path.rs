//! Dynamic scopes, resolved field paths, and the stored-value index
//! pass.
//!
//! Variant tags and sequence lengths are written in the metadata as
//! textual paths. Validation turns each of them into a `FieldPath`
//! (scope root + member indices) and assigns a stored-value slot to the
//! referenced integer class so decoding never has to walk the field
//! tree to find a tag or length again.

use std::rc::Rc;

use crate::error::ResolutionError;
use crate::ir::field_class::FieldClass;
use crate::types::StoredValueIndex;

/// The six enclosing field regions of a packet, in decode order.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, derive_more::Display)]
pub enum Scope {
    #[display(fmt = "trace.packet.header")]
    TracePacketHeader,
    #[display(fmt = "stream.packet.context")]
    StreamPacketContext,
    #[display(fmt = "stream.event.header")]
    StreamEventHeader,
    #[display(fmt = "stream.event.context")]
    StreamEventContext,
    #[display(fmt = "event.context")]
    EventContext,
    #[display(fmt = "event.fields")]
    EventPayload,
}

impl Scope {
    pub const IN_DECODE_ORDER: [Scope; 6] = [
        Scope::TracePacketHeader,
        Scope::StreamPacketContext,
        Scope::StreamEventHeader,
        Scope::StreamEventContext,
        Scope::EventContext,
        Scope::EventPayload,
    ];

    pub fn decode_order(self) -> usize {
        match self {
            Scope::TracePacketHeader => 0,
            Scope::StreamPacketContext => 1,
            Scope::StreamEventHeader => 2,
            Scope::StreamEventContext => 3,
            Scope::EventContext => 4,
            Scope::EventPayload => 5,
        }
    }

    /// Strips a scope prefix from dotted path components, returning the
    /// scope and the remaining components.
    fn strip_prefix<'a>(components: &'a [&'a str]) -> Option<(Scope, &'a [&'a str])> {
        const PREFIXES: [(&[&str], Scope); 6] = [
            (
                &["trace", "packet", "header"],
                Scope::TracePacketHeader,
            ),
            (
                &["stream", "packet", "context"],
                Scope::StreamPacketContext,
            ),
            (&["stream", "event", "header"], Scope::StreamEventHeader),
            (
                &["stream", "event", "context"],
                Scope::StreamEventContext,
            ),
            (&["event", "context"], Scope::EventContext),
            (&["event", "fields"], Scope::EventPayload),
        ];
        PREFIXES.iter().find_map(|(prefix, scope)| {
            components
                .strip_prefix(*prefix)
                .map(|rest| (*scope, rest))
        })
    }
}

/// A resolved reference: scope root plus the member indices leading to
/// the target. Indices step through structure members and variant
/// options; arrays are not addressable.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct FieldPath {
    pub root: Scope,
    pub indices: Vec<usize>,
}

impl std::fmt::Display for FieldPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.root)?;
        for i in &self.indices {
            write!(f, "[{i}]")?;
        }
        Ok(())
    }
}

impl FieldPath {
    /// Navigates the class tree under the given scope roots to the
    /// target class.
    pub fn borrow_class(&self, roots: &ScopeClasses) -> Option<Rc<FieldClass>> {
        let mut class = roots.root(self.root)?.clone();
        for &index in &self.indices {
            let next = match &*class {
                FieldClass::Structure(c) => c.member_by_index(index).map(|(_, c)| c),
                FieldClass::Variant(c) => c.option_by_index(index).map(|(_, c)| c),
                _ => None,
            }?;
            class = next;
        }
        Some(class)
    }
}

/// The root field classes of every scope reachable from one event class
/// context. Missing scopes are `None`.
#[derive(Clone, Default)]
pub struct ScopeClasses {
    pub trace_packet_header: Option<Rc<FieldClass>>,
    pub stream_packet_context: Option<Rc<FieldClass>>,
    pub stream_event_header: Option<Rc<FieldClass>>,
    pub stream_event_context: Option<Rc<FieldClass>>,
    pub event_context: Option<Rc<FieldClass>>,
    pub event_payload: Option<Rc<FieldClass>>,
}

impl ScopeClasses {
    pub fn root(&self, scope: Scope) -> Option<&Rc<FieldClass>> {
        match scope {
            Scope::TracePacketHeader => self.trace_packet_header.as_ref(),
            Scope::StreamPacketContext => self.stream_packet_context.as_ref(),
            Scope::StreamEventHeader => self.stream_event_header.as_ref(),
            Scope::StreamEventContext => self.stream_event_context.as_ref(),
            Scope::EventContext => self.event_context.as_ref(),
            Scope::EventPayload => self.event_payload.as_ref(),
        }
    }
}

/// Resolves every variant tag and sequence length path under `scope`'s
/// root and assigns stored-value slots, bumping `slot_count` for each
/// newly referenced integer class.
pub(crate) fn resolve_scope(
    scope: Scope,
    classes: &ScopeClasses,
    slot_count: &mut usize,
) -> Result<(), ResolutionError> {
    let Some(root) = classes.root(scope) else {
        return Ok(());
    };
    let mut position = Vec::new();
    resolve_in_class(root, scope, &mut position, classes, slot_count)
}

fn resolve_in_class(
    class: &Rc<FieldClass>,
    scope: Scope,
    position: &mut Vec<usize>,
    classes: &ScopeClasses,
    slot_count: &mut usize,
) -> Result<(), ResolutionError> {
    match &**class {
        FieldClass::Structure(c) => {
            for (index, (_, member)) in c.members().iter().enumerate() {
                position.push(index);
                resolve_in_class(member, scope, position, classes, slot_count)?;
                position.pop();
            }
        }
        FieldClass::StaticArray(c) => {
            // Element position is the array's own position; targets
            // inside arrays are not addressable.
            resolve_in_class(c.element_class(), scope, position, classes, slot_count)?;
        }
        FieldClass::Sequence(c) => {
            if c.length_path().is_none() {
                let path = resolve_expr(c.length_path_expr(), scope, position, classes)?;
                let target = assign_stored_index(&path, classes, slot_count)
                    .ok_or_else(|| {
                        ResolutionError::TargetNotFound(c.length_path_expr().to_owned())
                    })?;
                if let Some(index) = target.stored_value_index() {
                    c.set_stored_length_index(index);
                }
                c.set_length_path(path);
            }
            resolve_in_class(c.element_class(), scope, position, classes, slot_count)?;
        }
        FieldClass::Variant(c) => {
            if c.tag_path().is_none() {
                let path = resolve_expr(c.tag_path_expr(), scope, position, classes)?;
                let target = path.borrow_class(classes).ok_or_else(|| {
                    ResolutionError::TargetNotFound(c.tag_path_expr().to_owned())
                })?;
                if target.as_enumeration().is_none() {
                    return Err(ResolutionError::TargetNotInteger(
                        c.tag_path_expr().to_owned(),
                    ));
                }
                if assign_stored_index(&path, classes, slot_count).is_none() {
                    return Err(ResolutionError::TargetNotFound(
                        c.tag_path_expr().to_owned(),
                    ));
                }
                if let Some(index) = target.stored_value_index() {
                    c.set_stored_tag_index(index);
                }
                c.set_tag_class(target);
                c.set_tag_path(path);
            }
            for (index, (_, option)) in c.options().iter().enumerate() {
                position.push(index);
                resolve_in_class(option, scope, position, classes, slot_count)?;
                position.pop();
            }
        }
        _ => {}
    }
    Ok(())
}

/// Assigns a fresh slot to the path's target unless it already has one,
/// returning the target class. `None` when the path no longer
/// navigates, which the callers report as an unresolved path.
fn assign_stored_index(
    path: &FieldPath,
    classes: &ScopeClasses,
    slot_count: &mut usize,
) -> Option<Rc<FieldClass>> {
    let target = path.borrow_class(classes)?;
    if target.stored_value_index().is_none() {
        target.set_stored_value_index(StoredValueIndex(*slot_count));
        *slot_count += 1;
    }
    Some(target)
}

/// Resolves one textual path from the declaring position. Absolute
/// paths name their scope; relative paths search the declaring scope
/// then every earlier scope, in decode order, first match wins.
fn resolve_expr(
    expr: &str,
    declaring_scope: Scope,
    declaring_position: &[usize],
    classes: &ScopeClasses,
) -> Result<FieldPath, ResolutionError> {
    let components: Vec<&str> = expr.split('.').collect();
    if components.iter().any(|c| c.is_empty()) {
        return Err(ResolutionError::UnknownScope(expr.to_owned()));
    }

    let path = if let Some((scope, rest)) = Scope::strip_prefix(&components) {
        if rest.is_empty() {
            return Err(ResolutionError::TargetNotFound(expr.to_owned()));
        }
        let root = classes
            .root(scope)
            .ok_or_else(|| ResolutionError::TargetNotFound(expr.to_owned()))?;
        let indices = navigate_named(root, rest)
            .ok_or_else(|| ResolutionError::TargetNotFound(expr.to_owned()))?;
        FieldPath { root: scope, indices }
    } else {
        find_relative(&components, declaring_scope, classes)
            .ok_or_else(|| ResolutionError::TargetNotFound(expr.to_owned()))?
    };

    let target = path
        .borrow_class(classes)
        .ok_or_else(|| ResolutionError::TargetNotFound(expr.to_owned()))?;
    if target.as_integer_like().is_none() {
        return Err(ResolutionError::TargetNotInteger(expr.to_owned()));
    }
    if !is_earlier(&path, declaring_scope, declaring_position) {
        return Err(ResolutionError::TargetNotEarlier(expr.to_owned()));
    }
    Ok(path)
}

/// Walks named components down from a root: structure members and
/// variant options by name.
fn navigate_named(root: &Rc<FieldClass>, components: &[&str]) -> Option<Vec<usize>> {
    let mut indices = Vec::with_capacity(components.len());
    let mut class = root.clone();
    for component in components {
        let (index, next) = match &*class {
            FieldClass::Structure(c) => {
                let index = c.member_index(component)?;
                (index, c.member_by_index(index)?.1)
            }
            FieldClass::Variant(c) => {
                let index = c.option_index(component)?;
                (index, c.option_by_index(index)?.1)
            }
            _ => return None,
        };
        indices.push(index);
        class = next;
    }
    Some(indices)
}

/// Relative lookup: anchor the first component anywhere in the scope
/// (depth-first, decode order), then navigate the rest by name.
fn find_relative(
    components: &[&str],
    declaring_scope: Scope,
    classes: &ScopeClasses,
) -> Option<FieldPath> {
    let mut scopes: Vec<Scope> = Scope::IN_DECODE_ORDER
        .into_iter()
        .filter(|s| s.decode_order() <= declaring_scope.decode_order())
        .collect();
    // Declaring scope first, then nearest earlier scopes.
    scopes.reverse();

    for scope in scopes {
        let Some(root) = classes.root(scope) else {
            continue;
        };
        let mut anchor = Vec::new();
        if find_anchor(root, components[0], &mut anchor) {
            let anchored = FieldPath {
                root: scope,
                indices: anchor,
            };
            let anchor_class = anchored.borrow_class(classes)?;
            let rest = navigate_named(&anchor_class, &components[1..])?;
            let mut indices = anchored.indices;
            indices.extend(rest);
            return Some(FieldPath { root: scope, indices });
        }
    }
    None
}

fn find_anchor(class: &Rc<FieldClass>, name: &str, position: &mut Vec<usize>) -> bool {
    match &**class {
        FieldClass::Structure(c) => {
            for (index, (member_name, member)) in c.members().iter().enumerate() {
                position.push(index);
                if member_name == name || find_anchor(member, name, position) {
                    return true;
                }
                position.pop();
            }
            false
        }
        FieldClass::Variant(c) => {
            for (index, (_, option)) in c.options().iter().enumerate() {
                position.push(index);
                if find_anchor(option, name, position) {
                    return true;
                }
                position.pop();
            }
            false
        }
        _ => false,
    }
}

/// Whether a resolved target precedes the declaring position in decode
/// order. Equal prefixes mean the target encloses the declaration,
/// which does not count as earlier.
fn is_earlier(path: &FieldPath, declaring_scope: Scope, declaring_position: &[usize]) -> bool {
    match path.root.decode_order().cmp(&declaring_scope.decode_order()) {
        std::cmp::Ordering::Less => true,
        std::cmp::Ordering::Greater => false,
        std::cmp::Ordering::Equal => {
            for (t, d) in path.indices.iter().zip(declaring_position.iter()) {
                if t < d {
                    return true;
                }
                if t > d {
                    return false;
                }
            }
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::field_class::ByteOrder;
    use pretty_assertions::assert_eq;

    fn uint(width: u32) -> Rc<FieldClass> {
        FieldClass::unsigned_integer(width, ByteOrder::LittleEndian)
    }

    #[test]
    fn absolute_path_resolution() {
        let ctx = FieldClass::structure();
        ctx.as_structure().unwrap().add_member("len", uint(16)).unwrap();

        let payload = FieldClass::structure();
        payload
            .as_structure()
            .unwrap()
            .add_member(
                "data",
                FieldClass::sequence("stream.packet.context.len", uint(8)),
            )
            .unwrap();

        let classes = ScopeClasses {
            stream_packet_context: Some(ctx),
            event_payload: Some(payload.clone()),
            ..Default::default()
        };
        let mut slots = 0;
        resolve_scope(Scope::EventPayload, &classes, &mut slots).unwrap();
        assert_eq!(slots, 1);

        let seq = payload
            .as_structure()
            .unwrap()
            .member_class("data")
            .unwrap();
        let seq = seq.as_sequence().unwrap();
        assert_eq!(
            seq.length_path(),
            Some(&FieldPath {
                root: Scope::StreamPacketContext,
                indices: vec![0],
            })
        );
        assert_eq!(seq.stored_length_index(), Some(StoredValueIndex(0)));
    }

    #[test]
    fn relative_path_finds_earlier_sibling() {
        let payload = FieldClass::structure();
        let ps = payload.as_structure().unwrap();
        ps.add_member("count", uint(8)).unwrap();
        ps.add_member("items", FieldClass::sequence("count", uint(32)))
            .unwrap();

        let classes = ScopeClasses {
            event_payload: Some(payload.clone()),
            ..Default::default()
        };
        let mut slots = 0;
        resolve_scope(Scope::EventPayload, &classes, &mut slots).unwrap();

        let seq = ps.member_class("items").unwrap();
        assert_eq!(
            seq.as_sequence().unwrap().length_path(),
            Some(&FieldPath {
                root: Scope::EventPayload,
                indices: vec![0],
            })
        );
    }

    #[test]
    fn later_sibling_is_rejected() {
        let payload = FieldClass::structure();
        let ps = payload.as_structure().unwrap();
        ps.add_member("items", FieldClass::sequence("count", uint(32)))
            .unwrap();
        ps.add_member("count", uint(8)).unwrap();

        let classes = ScopeClasses {
            event_payload: Some(payload),
            ..Default::default()
        };
        let mut slots = 0;
        let err = resolve_scope(Scope::EventPayload, &classes, &mut slots).unwrap_err();
        assert_eq!(err, ResolutionError::TargetNotEarlier("count".to_owned()));
    }

    #[test]
    fn missing_target_is_rejected() {
        let payload = FieldClass::structure();
        payload
            .as_structure()
            .unwrap()
            .add_member("items", FieldClass::sequence("nope", uint(32)))
            .unwrap();
        let classes = ScopeClasses {
            event_payload: Some(payload),
            ..Default::default()
        };
        let mut slots = 0;
        assert!(matches!(
            resolve_scope(Scope::EventPayload, &classes, &mut slots),
            Err(ResolutionError::TargetNotFound(_))
        ));
    }

    #[test]
    fn string_target_is_rejected() {
        let payload = FieldClass::structure();
        let ps = payload.as_structure().unwrap();
        ps.add_member("name", FieldClass::string()).unwrap();
        ps.add_member("items", FieldClass::sequence("name", uint(32)))
            .unwrap();
        let classes = ScopeClasses {
            event_payload: Some(payload),
            ..Default::default()
        };
        let mut slots = 0;
        assert!(matches!(
            resolve_scope(Scope::EventPayload, &classes, &mut slots),
            Err(ResolutionError::TargetNotInteger(_))
        ));
    }

    #[test]
    fn shared_slot_for_doubly_referenced_target() {
        let payload = FieldClass::structure();
        let ps = payload.as_structure().unwrap();
        ps.add_member("len", uint(8)).unwrap();
        ps.add_member("a", FieldClass::sequence("len", uint(8))).unwrap();
        ps.add_member("b", FieldClass::sequence("len", uint(8))).unwrap();

        let classes = ScopeClasses {
            event_payload: Some(payload.clone()),
            ..Default::default()
        };
        let mut slots = 0;
        resolve_scope(Scope::EventPayload, &classes, &mut slots).unwrap();
        assert_eq!(slots, 1);
        let a = ps.member_class("a").unwrap();
        let b = ps.member_class("b").unwrap();
        assert_eq!(
            a.as_sequence().unwrap().stored_length_index(),
            b.as_sequence().unwrap().stored_length_index()
        );
    }

    #[test]
    fn variant_tag_resolution_requires_enumeration() {
        let header = FieldClass::structure();
        let hs = header.as_structure().unwrap();
        hs.add_member("tag", uint(8)).unwrap();
        let var = FieldClass::variant("tag");
        var.as_variant().unwrap().add_option("x", uint(16)).unwrap();
        hs.add_member("v", var).unwrap();

        let classes = ScopeClasses {
            stream_event_header: Some(header),
            ..Default::default()
        };
        let mut slots = 0;
        assert!(matches!(
            resolve_scope(Scope::StreamEventHeader, &classes, &mut slots),
            Err(ResolutionError::TargetNotInteger(_))
        ));
    }
}
