use crate::types::flags::TypeFlags;

use super::heap::{Heap, ObjectBody, ObjectHandle};
use super::value::Value;
use super::RuntimeError;

/// The lifetime regime of a type, fixed at registration. Exactly one
/// applies to every object type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Regime {
    /// Trivially copyable value type; no lifecycle traffic at all.
    PodValue,
    /// Value type with constructor and destructor.
    Value,
    /// Reference type with a per-instance count; zero destroys.
    Counted,
    /// Reference type whose lifetime the host guarantees; no traffic.
    NoCount,
    /// Single-owner reference type; rebinding or scope exit destroys.
    Scoped,
}

pub fn regime(flags: TypeFlags) -> Regime {
    if flags.is_value() {
        if flags.is_pod() {
            Regime::PodValue
        } else {
            Regime::Value
        }
    } else if flags.is_scoped() {
        Regime::Scoped
    } else if flags.is_nocount() {
        Regime::NoCount
    } else {
        Regime::Counted
    }
}

/// Whether instances of the type enroll in the collector's candidate
/// table at construction.
pub fn uses_collector(flags: TypeFlags) -> bool {
    flags.is_counted() && flags.is_gc()
}

/// Whether the type sees addref/release traffic on handle copies.
pub fn counts_references(flags: TypeFlags) -> bool {
    matches!(regime(flags), Regime::Counted)
}

/// Takes every outgoing handle out of a script object, leaving the
/// fields null. Part of the destroy sequence: the script destructor
/// has already run when this is called.
pub fn drain_outgoing(heap: &mut Heap, handle: ObjectHandle) -> Vec<ObjectHandle> {
    let mut out = Vec::new();
    if let Some(entry) = heap.get_mut(handle) {
        if let ObjectBody::Script(fields) = &mut entry.body {
            for slot in fields.iter_mut() {
                if let Value::Object(target) = *slot {
                    out.push(target);
                    *slot = Value::Null;
                }
            }
        }
    }
    out
}

/// Lists the outgoing handles of a script object without changing it.
/// The collector's counting passes use this.
pub fn scan_outgoing(heap: &Heap, handle: ObjectHandle) -> Vec<ObjectHandle> {
    match heap.get(handle) {
        Some(entry) => match &entry.body {
            ObjectBody::Script(fields) => fields
                .iter()
                .filter_map(|slot| slot.as_object())
                .collect(),
            _ => Vec::new(),
        },
        None => Vec::new(),
    }
}

/// Bitwise copy between two POD value instances of the same type.
pub fn copy_pod(heap: &mut Heap, src: ObjectHandle, dst: ObjectHandle) -> Result<(), RuntimeError> {
    let bytes = match &heap.entry(src)?.body {
        ObjectBody::Raw(bytes) => bytes.clone(),
        _ => {
            return Err(RuntimeError::InvalidOperation(
                "source is not a value instance".into(),
            ))
        }
    };
    match &mut heap.entry_mut(dst)?.body {
        ObjectBody::Raw(slot) if slot.len() == bytes.len() => {
            slot.copy_from_slice(&bytes);
            Ok(())
        }
        ObjectBody::Raw(_) => Err(RuntimeError::InvalidOperation(
            "value instances differ in size".into(),
        )),
        _ => Err(RuntimeError::InvalidOperation(
            "destination is not a value instance".into(),
        )),
    }
}
