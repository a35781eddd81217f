use std::any::Any;

use crate::types::descriptor::TypeId;

use super::value::Value;
use super::RuntimeError;

/// Handle to an object slot, valid only for one occupant. The generation
/// makes access through a handle that outlived its object a detectable
/// error instead of undefined behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectHandle {
    index: u32,
    generation: u32,
}

impl ObjectHandle {
    pub fn slot_index(self) -> usize {
        self.index as usize
    }
}

impl std::fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}:{}", self.index, self.generation)
    }
}

/// Instance storage of one object.
pub enum ObjectBody {
    /// Field slots of a script-class instance, in declaration order.
    Script(Vec<Value>),
    /// Byte storage of a registered value-type instance.
    Raw(Vec<u8>),
    /// A host instance owned by the engine.
    Foreign(Box<dyn Any>),
    /// A host instance owned by the host, held as an opaque address.
    /// Used by the native calling conventions.
    Extern(usize),
}

impl std::fmt::Debug for ObjectBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectBody::Script(fields) => write!(f, "Script({} fields)", fields.len()),
            ObjectBody::Raw(bytes) => write!(f, "Raw({} bytes)", bytes.len()),
            ObjectBody::Foreign(_) => write!(f, "Foreign"),
            ObjectBody::Extern(addr) => write!(f, "Extern({:#x})", addr),
        }
    }
}

/// Header and storage of one live object. The header is the count
/// authority for every instance, script and host alike.
#[derive(Debug)]
pub struct ObjectEntry {
    pub type_id: TypeId,
    pub refcount: u32,
    /// Monotonic creation sequence number, exposed through the collector
    /// inspection interface.
    pub seq: u32,
    /// Collector mark bit, meaningful only during a detect pass.
    pub gc_flag: bool,
    /// Whether the object is in the collector's candidate table.
    pub enrolled: bool,
    /// Set while the object is being destroyed; a second destroy request
    /// for the same object is ignored.
    pub destroying: bool,
    pub body: ObjectBody,
}

struct Slot {
    generation: u32,
    entry: Option<ObjectEntry>,
}

/// The object heap. A flat slab of slots with a free list; freed slots
/// bump their generation so stale handles miss.
#[derive(Default)]
pub struct Heap {
    slots: Vec<Slot>,
    free: Vec<u32>,
    next_seq: u32,
    live: usize,
    enrolled: usize,
}

impl Heap {
    pub fn new() -> Self {
        Heap::default()
    }

    pub fn live_count(&self) -> usize {
        self.live
    }

    pub fn enrolled_count(&self) -> usize {
        self.enrolled
    }

    /// Sequence number of the most recently allocated object.
    pub fn last_seq(&self) -> u32 {
        self.next_seq
    }

    pub fn allocate(&mut self, type_id: TypeId, body: ObjectBody) -> ObjectHandle {
        self.next_seq += 1;
        let entry = ObjectEntry {
            type_id,
            refcount: 1,
            seq: self.next_seq,
            gc_flag: false,
            enrolled: false,
            destroying: false,
            body,
        };
        self.live += 1;
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.entry = Some(entry);
                ObjectHandle {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                ObjectHandle {
                    index,
                    generation: 0,
                }
            }
        }
    }

    pub fn get(&self, handle: ObjectHandle) -> Option<&ObjectEntry> {
        let slot = self.slots.get(handle.slot_index())?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    pub fn get_mut(&mut self, handle: ObjectHandle) -> Option<&mut ObjectEntry> {
        let slot = self.slots.get_mut(handle.slot_index())?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    pub fn contains(&self, handle: ObjectHandle) -> bool {
        self.get(handle).is_some()
    }

    pub fn entry(&self, handle: ObjectHandle) -> Result<&ObjectEntry, RuntimeError> {
        self.get(handle).ok_or(RuntimeError::StaleObjectAccess)
    }

    pub fn entry_mut(&mut self, handle: ObjectHandle) -> Result<&mut ObjectEntry, RuntimeError> {
        self.get_mut(handle).ok_or(RuntimeError::StaleObjectAccess)
    }

    /// Increments the header count and returns the new count.
    pub fn retain(&mut self, handle: ObjectHandle) -> Result<u32, RuntimeError> {
        let entry = self.entry_mut(handle)?;
        entry.refcount += 1;
        Ok(entry.refcount)
    }

    /// Decrements the header count and returns the new count. The caller
    /// destroys the object when zero comes back.
    pub fn release_count(&mut self, handle: ObjectHandle) -> Result<u32, RuntimeError> {
        let entry = self.entry_mut(handle)?;
        if entry.refcount == 0 {
            return Err(RuntimeError::InvalidOperation(
                "release of an object with no references".into(),
            ));
        }
        entry.refcount -= 1;
        Ok(entry.refcount)
    }

    pub fn refcount(&self, handle: ObjectHandle) -> Result<u32, RuntimeError> {
        Ok(self.entry(handle)?.refcount)
    }

    pub fn set_enrolled(&mut self, handle: ObjectHandle, enrolled: bool) -> Result<(), RuntimeError> {
        let entry = self.entry_mut(handle)?;
        if entry.enrolled != enrolled {
            entry.enrolled = enrolled;
            if enrolled {
                self.enrolled += 1;
            } else {
                self.enrolled -= 1;
            }
        }
        Ok(())
    }

    /// Frees the slot and returns the entry. The generation bump makes
    /// every outstanding handle to this occupant stale.
    pub fn free(&mut self, handle: ObjectHandle) -> Option<ObjectEntry> {
        let slot = self.slots.get_mut(handle.slot_index())?;
        if slot.generation != handle.generation {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation += 1;
        self.free.push(handle.index);
        self.live -= 1;
        if entry.enrolled {
            self.enrolled -= 1;
        }
        Some(entry)
    }

    /// Borrows the host instance stored in a foreign body.
    pub fn foreign<T: 'static>(&self, handle: ObjectHandle) -> Result<&T, RuntimeError> {
        match &self.entry(handle)?.body {
            ObjectBody::Foreign(body) => body.downcast_ref::<T>().ok_or_else(|| {
                RuntimeError::InvalidOperation("host object has a different type".into())
            }),
            _ => Err(RuntimeError::InvalidOperation(
                "object has no host instance".into(),
            )),
        }
    }

    pub fn foreign_mut<T: 'static>(&mut self, handle: ObjectHandle) -> Result<&mut T, RuntimeError> {
        match &mut self.entry_mut(handle)?.body {
            ObjectBody::Foreign(body) => body.downcast_mut::<T>().ok_or_else(|| {
                RuntimeError::InvalidOperation("host object has a different type".into())
            }),
            _ => Err(RuntimeError::InvalidOperation(
                "object has no host instance".into(),
            )),
        }
    }
}
