use std::fmt::{self, Debug};

use super::RegisterError;

/// Category and sub-flag bits for a registered type.
///
/// Exactly one of `REFERENCE`/`VALUE` must be set for host object types.
/// The remaining bits refine the lifetime regime and the native ABI
/// classification of the type.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct TypeFlags(u32);

impl TypeFlags {
    /// Reference category: instances live on the heap, accessed via handles.
    pub const REFERENCE: TypeFlags = TypeFlags(1 << 0);
    /// Value category: instances are owned in place, copied on assignment.
    pub const VALUE: TypeFlags = TypeFlags(1 << 1);
    /// Cycle-capable: instances are tracked by the garbage collector.
    pub const GC: TypeFlags = TypeFlags(1 << 2);
    /// Trivially copyable value type, bitwise copy is always legal.
    pub const POD: TypeFlags = TypeFlags(1 << 3);
    /// The engine emits no addref/release traffic; the host guarantees
    /// every instance outlives every handle to it.
    pub const NOCOUNT: TypeFlags = TypeFlags(1 << 4);
    /// Single-owner reference type: factory and release only, never
    /// exposed to scripts as a handle.
    pub const SCOPED: TypeFlags = TypeFlags(1 << 5);
    /// Template type with an unresolved subtype.
    pub const TEMPLATE: TypeFlags = TypeFlags(1 << 6);
    /// Instances require 8-byte alignment.
    pub const ALIGN8: TypeFlags = TypeFlags(1 << 7);
    /// ABI hint: every field of the by-value struct is an integer word.
    pub const ABI_ALL_INTS: TypeFlags = TypeFlags(1 << 8);
    /// ABI hint: every field of the by-value struct is a float.
    pub const ABI_ALL_FLOATS: TypeFlags = TypeFlags(1 << 9);
    /// Script-declared class; set by the engine, not by registration.
    pub const SCRIPT: TypeFlags = TypeFlags(1 << 10);

    pub const fn empty() -> TypeFlags {
        TypeFlags(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: TypeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: TypeFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn union(self, other: TypeFlags) -> TypeFlags {
        TypeFlags(self.0 | other.0)
    }

    pub fn insert(&mut self, other: TypeFlags) {
        self.0 |= other.0;
    }

    pub fn is_reference(self) -> bool {
        self.contains(TypeFlags::REFERENCE)
    }

    pub fn is_value(self) -> bool {
        self.contains(TypeFlags::VALUE)
    }

    pub fn is_pod(self) -> bool {
        self.contains(TypeFlags::POD)
    }

    pub fn is_scoped(self) -> bool {
        self.contains(TypeFlags::SCOPED)
    }

    pub fn is_nocount(self) -> bool {
        self.contains(TypeFlags::NOCOUNT)
    }

    pub fn is_gc(self) -> bool {
        self.contains(TypeFlags::GC)
    }

    /// Counted reference type: refcount traffic is emitted and the count
    /// reaching zero destroys the instance.
    pub fn is_counted(self) -> bool {
        self.is_reference() && !self.is_nocount() && !self.is_scoped()
    }

    /// Rejects illegal flag combinations at type-registration time.
    pub fn validate(self) -> Result<(), RegisterError> {
        let category = self.is_reference() as u32 + self.is_value() as u32;
        if category != 1 {
            return Err(RegisterError::InvalidFlags(
                "exactly one of the reference and value categories must be set".to_string(),
            ));
        }
        if self.is_scoped() && !self.is_reference() {
            return Err(RegisterError::InvalidFlags(
                "the scoped flag requires the reference category".to_string(),
            ));
        }
        if self.is_nocount() && !self.is_reference() {
            return Err(RegisterError::InvalidFlags(
                "the nocount flag requires the reference category".to_string(),
            ));
        }
        if self.is_scoped() && self.is_nocount() {
            return Err(RegisterError::InvalidFlags(
                "a scoped type cannot also be nocount".to_string(),
            ));
        }
        if self.is_pod() && !self.is_value() {
            return Err(RegisterError::InvalidFlags(
                "the pod flag requires the value category".to_string(),
            ));
        }
        if self.is_gc() && !self.is_reference() {
            return Err(RegisterError::NotSupported(
                "garbage collection is only supported for reference types".to_string(),
            ));
        }
        if self.is_gc() && (self.is_nocount() || self.is_scoped()) {
            return Err(RegisterError::InvalidFlags(
                "a garbage collected type must be a counted reference type".to_string(),
            ));
        }
        if self.intersects(TypeFlags::ABI_ALL_INTS.union(TypeFlags::ABI_ALL_FLOATS))
            && !self.is_value()
        {
            return Err(RegisterError::InvalidFlags(
                "ABI classification hints only apply to value types".to_string(),
            ));
        }
        if self.contains(TypeFlags::ABI_ALL_INTS) && self.contains(TypeFlags::ABI_ALL_FLOATS) {
            return Err(RegisterError::InvalidFlags(
                "conflicting ABI classification hints".to_string(),
            ));
        }
        Ok(())
    }
}

impl std::ops::BitOr for TypeFlags {
    type Output = TypeFlags;

    fn bitor(self, rhs: TypeFlags) -> TypeFlags {
        self.union(rhs)
    }
}

impl std::ops::BitOrAssign for TypeFlags {
    fn bitor_assign(&mut self, rhs: TypeFlags) {
        self.insert(rhs);
    }
}

impl Debug for TypeFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        for (flag, name) in [
            (TypeFlags::REFERENCE, "REFERENCE"),
            (TypeFlags::VALUE, "VALUE"),
            (TypeFlags::GC, "GC"),
            (TypeFlags::POD, "POD"),
            (TypeFlags::NOCOUNT, "NOCOUNT"),
            (TypeFlags::SCOPED, "SCOPED"),
            (TypeFlags::TEMPLATE, "TEMPLATE"),
            (TypeFlags::ALIGN8, "ALIGN8"),
            (TypeFlags::ABI_ALL_INTS, "ABI_ALL_INTS"),
            (TypeFlags::ABI_ALL_FLOATS, "ABI_ALL_FLOATS"),
            (TypeFlags::SCRIPT, "SCRIPT"),
        ] {
            if self.contains(flag) {
                names.push(name);
            }
        }
        write!(f, "TypeFlags({})", names.join("|"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_is_mandatory() {
        assert!(TypeFlags::empty().validate().is_err());
        assert!((TypeFlags::REFERENCE | TypeFlags::VALUE).validate().is_err());
        assert!(TypeFlags::REFERENCE.validate().is_ok());
        assert!(TypeFlags::VALUE.validate().is_ok());
    }

    #[test]
    fn test_scoped_and_nocount_require_reference() {
        assert!((TypeFlags::VALUE | TypeFlags::SCOPED).validate().is_err());
        assert!((TypeFlags::VALUE | TypeFlags::NOCOUNT).validate().is_err());
        assert!((TypeFlags::REFERENCE | TypeFlags::SCOPED).validate().is_ok());
        assert!((TypeFlags::REFERENCE | TypeFlags::NOCOUNT).validate().is_ok());
        assert!((TypeFlags::REFERENCE | TypeFlags::SCOPED | TypeFlags::NOCOUNT)
            .validate()
            .is_err());
    }

    #[test]
    fn test_gc_needs_counted_reference() {
        assert!((TypeFlags::VALUE | TypeFlags::GC).validate().is_err());
        assert!((TypeFlags::REFERENCE | TypeFlags::GC | TypeFlags::NOCOUNT)
            .validate()
            .is_err());
        assert!((TypeFlags::REFERENCE | TypeFlags::GC | TypeFlags::SCOPED)
            .validate()
            .is_err());
        assert!((TypeFlags::REFERENCE | TypeFlags::GC).validate().is_ok());
    }

    #[test]
    fn test_pod_and_abi_hints() {
        assert!((TypeFlags::REFERENCE | TypeFlags::POD).validate().is_err());
        assert!((TypeFlags::VALUE | TypeFlags::POD | TypeFlags::ABI_ALL_INTS)
            .validate()
            .is_ok());
        assert!((TypeFlags::VALUE | TypeFlags::ABI_ALL_INTS | TypeFlags::ABI_ALL_FLOATS)
            .validate()
            .is_err());
        assert!((TypeFlags::REFERENCE | TypeFlags::ABI_ALL_INTS)
            .validate()
            .is_err());
    }

    #[test]
    fn test_counted_classification() {
        assert!((TypeFlags::REFERENCE).is_counted());
        assert!((TypeFlags::REFERENCE | TypeFlags::GC).is_counted());
        assert!(!(TypeFlags::REFERENCE | TypeFlags::NOCOUNT).is_counted());
        assert!(!(TypeFlags::REFERENCE | TypeFlags::SCOPED).is_counted());
        assert!(!(TypeFlags::VALUE).is_counted());
    }
}
