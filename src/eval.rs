//! Turning host objects into wire descriptors, and the child-enumeration
//! logic behind the `chld` command.
//!
//! Everything here runs on the parked thread that owns the frame, via the
//! coordinator's work queue, so lookups resolve in that thread's context.
//! Every accessor is wrapped so a misbehaving user object produces a
//! placeholder instead of an error.

use crate::interp::FrameRef;
use crate::interp::ObjectRef;
use crate::wire::ObjDesc;

/// At most this many children are reported for one object; a marker entry
/// tells the user the sequence kept going.
pub const MAX_CHILDREN: usize = 10_000;

const TOO_MANY_ITEMS: &str = "Evaluation halted because sequence included too many items...";

pub fn safe_repr(obj: &ObjectRef) -> String {
    match obj.repr() {
        Ok(repr) => repr,
        Err(_) => "__repr__ raised an exception".to_owned(),
    }
}

/// Build the wire descriptor for one object. A value is expandable unless
/// its type is a leaf type or it reports a length of zero.
pub fn describe(obj: &ObjectRef) -> ObjDesc {
    ObjDesc {
        repr: safe_repr(obj),
        hex_repr: obj.hex_repr(),
        type_name: obj.type_name(),
        expandable: !obj.is_leaf_type() && obj.len() != Some(0),
    }
}

/// Descriptor for a variable that is declared but not currently bound.
pub fn undefined_desc() -> ObjDesc {
    ObjDesc {
        repr: "<undefined>".to_owned(),
        hex_repr: None,
        type_name: "unknown".to_owned(),
        expandable: false,
    }
}

pub struct ChildList {
    pub children: Vec<(String, ObjDesc)>,
    /// Children can be fetched back by indexing into the parent.
    pub is_index: bool,
    /// Iteration order is the only way to reach the children again.
    pub is_enumerate: bool,
}

impl ChildList {
    pub fn empty() -> ChildList {
        ChildList {
            children: Vec::new(),
            is_index: false,
            is_enumerate: false,
        }
    }
}

/// Split a trailing literal index off an expression the front-end built for
/// re-fetching an enumerate-only child, e.g. `items()[12]` -> (`items()`, 12).
pub fn split_trailing_index(text: &str) -> Option<(String, usize)> {
    let t = text.trim_end();
    if !t.ends_with(']') {
        return None;
    }
    let open = t.rfind('[')?;
    let digits = &t[open + 1..t.len() - 1];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let index = digits.parse().ok()?;
    Some((t[..open].to_owned(), index))
}

fn truncation_marker() -> (String, ObjDesc) {
    (
        "[...]".to_owned(),
        ObjDesc {
            repr: TOO_MANY_ITEMS.to_owned(),
            hex_repr: None,
            type_name: "str".to_owned(),
            expandable: false,
        },
    )
}

/// Evaluate `text` in `frame` and enumerate the result's children. With
/// `child_is_enumerate` the text carries a trailing `[index]` naming one
/// child of an enumerate-only parent; the base expression is re-evaluated
/// and iterated up to that index first.
pub fn enum_children(frame: &FrameRef, text: &str, child_is_enumerate: bool) -> ChildList {
    let mut text = text.to_owned();
    let mut enumerate_index = 0;
    if child_is_enumerate {
        if let Some((base, index)) = split_trailing_index(&text) {
            text = base;
            enumerate_index = index;
        }
    }

    let res = match frame.eval(&text) {
        Ok(res) => res,
        Err(_) => return ChildList::empty(),
    };
    let res = if child_is_enumerate {
        let nth = res
            .iterate()
            .and_then(|values| values.into_iter().nth(enumerate_index));
        match nth {
            Some(value) => value,
            // The value changed since the front-end saw it.
            None => return ChildList::empty(),
        }
    } else {
        res
    };

    if res.is_generator() {
        // Enumerating a generator would consume it.
        return ChildList::empty();
    }

    if let Some(items) = res.items() {
        let mut children = Vec::new();
        for (key, value) in items {
            if children.len() >= MAX_CHILDREN {
                children.push(truncation_marker());
                break;
            }
            children.push((format!("[{}]", safe_repr(&key)), describe(&value)));
        }
        return ChildList {
            children,
            is_index: true,
            is_enumerate: false,
        };
    }

    if let Some(values) = res.iterate() {
        let mut children = Vec::new();
        let mut is_enumerate = false;
        for (index, item) in values.iter().enumerate() {
            if children.len() >= MAX_CHILDREN {
                children.push(truncation_marker());
                break;
            }
            children.push((format!("[{}]", index), describe(item)));
            if !is_enumerate {
                // If indexing back into the object does not return the very
                // object iteration produced, the front-end must re-enumerate
                // to fetch children.
                match res.index(index) {
                    Some(fetched) if fetched.identity() == item.identity() => {}
                    _ => is_enumerate = true,
                }
            }
        }
        return ChildList {
            children,
            is_index: true,
            is_enumerate,
        };
    }

    // Not iterable: fall back to attributes, skipping callables and the
    // dunder namespace.
    let mut children = Vec::new();
    for name in res.attr_names() {
        if name.starts_with("__") && name.ends_with("__") {
            continue;
        }
        if let Some(item) = res.get_attr(&name) {
            if !item.is_callable() {
                children.push((name, describe(&item)));
            }
        }
    }
    ChildList {
        children,
        is_index: false,
        is_enumerate: false,
    }
}
