use super::flags::TypeFlags;
use super::RegisterError;

/// 类型行为种类。
///
/// 每个注册类型的行为表将行为种类映射到宿主函数，
/// 注册时按类型类别校验合法性。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Behavior {
    /// In-place construction of a value-type instance.
    Construct = 0,
    /// In-place copy construction of a value-type instance.
    CopyConstruct = 1,
    /// Destruction of a value-type instance.
    Destruct = 2,
    /// Value assignment; also reachable by registering `opAssign`.
    Assign = 3,
    /// Heap construction of a reference-type instance, count starts at 1.
    Factory = 4,
    /// Heap construction from an existing instance.
    CopyFactory = 5,
    /// Reference count increment notification.
    AddRef = 6,
    /// Reference count decrement notification; at zero the instance dies.
    Release = 7,
    /// Reference count query used by the collector.
    GetRefCount = 8,
    /// Collector mark flag store (kept for the full behavior surface).
    SetGcFlag = 9,
    /// Collector mark flag query.
    GetGcFlag = 10,
    /// Enumerate all outgoing handles of an instance for the collector.
    EnumRefs = 11,
    /// Forcibly drop all outgoing handles of an instance.
    ReleaseRefs = 12,
}

impl Behavior {
    pub fn name(self) -> &'static str {
        match self {
            Behavior::Construct => "construct",
            Behavior::CopyConstruct => "copy construct",
            Behavior::Destruct => "destruct",
            Behavior::Assign => "assign",
            Behavior::Factory => "factory",
            Behavior::CopyFactory => "copy factory",
            Behavior::AddRef => "addref",
            Behavior::Release => "release",
            Behavior::GetRefCount => "get refcount",
            Behavior::SetGcFlag => "set gc flag",
            Behavior::GetGcFlag => "get gc flag",
            Behavior::EnumRefs => "enum refs",
            Behavior::ReleaseRefs => "release refs",
        }
    }

    /// Whether the behavior belongs to the collector's per-type set.
    pub fn is_gc_behavior(self) -> bool {
        matches!(
            self,
            Behavior::GetRefCount
                | Behavior::SetGcFlag
                | Behavior::GetGcFlag
                | Behavior::EnumRefs
                | Behavior::ReleaseRefs
        )
    }
}

/// Validates a behavior kind against the category flags of the owning type.
///
/// Completeness (a reference type with no addref/release at all, a value
/// type with no constructor) is deliberately *not* checked here; it is
/// deferred to the first use of the type because registration may be split
/// across several calls.
pub fn validate_behavior(flags: TypeFlags, behavior: Behavior) -> Result<(), RegisterError> {
    let illegal = |why: &str| {
        Err(RegisterError::IllegalBehaviourForType(format!(
            "{} behaviour: {}",
            behavior.name(),
            why
        )))
    };

    if flags.is_value() {
        return match behavior {
            Behavior::Construct | Behavior::CopyConstruct | Behavior::Destruct | Behavior::Assign => {
                Ok(())
            }
            Behavior::Factory | Behavior::CopyFactory => {
                illegal("value types are constructed in place, not by factory")
            }
            _ => illegal("reference counting does not apply to value types"),
        };
    }

    if flags.is_scoped() {
        // Single-owner types expose exactly the lifecycle a unique owner
        // needs: create and destroy.
        return match behavior {
            Behavior::Factory | Behavior::Release => Ok(()),
            _ => illegal("a scoped reference type only has factory and release"),
        };
    }

    if flags.is_nocount() {
        return match behavior {
            Behavior::Factory | Behavior::CopyFactory => Ok(()),
            Behavior::AddRef | Behavior::Release | Behavior::GetRefCount => {
                illegal("a nocount reference type must not register refcounting")
            }
            Behavior::Construct | Behavior::CopyConstruct | Behavior::Destruct => {
                illegal("reference types are created by factory, not in place")
            }
            Behavior::Assign => Ok(()),
            _ => illegal("a nocount reference type is never garbage collected"),
        };
    }

    // Counted reference type, possibly garbage collected.
    match behavior {
        Behavior::Factory
        | Behavior::CopyFactory
        | Behavior::AddRef
        | Behavior::Release
        | Behavior::Assign => Ok(()),
        Behavior::Construct | Behavior::CopyConstruct => {
            illegal("reference types are created by factory, not in place")
        }
        Behavior::Destruct => {
            illegal("a counted reference type is destroyed by its release behaviour")
        }
        b if b.is_gc_behavior() => {
            if flags.is_gc() {
                Ok(())
            } else {
                illegal("the type was not registered as garbage collected")
            }
        }
        _ => illegal("not applicable to this type"),
    }
}

/// The behaviours a type of this category must have registered before its
/// first use, reported lazily with the configuration diagnostics.
pub fn required_behaviors(flags: TypeFlags) -> &'static [Behavior] {
    if flags.is_value() {
        if flags.is_pod() {
            &[]
        } else {
            &[Behavior::Construct, Behavior::Destruct]
        }
    } else if flags.is_scoped() {
        &[Behavior::Factory, Behavior::Release]
    } else if flags.is_nocount() {
        &[]
    } else if flags.is_gc() {
        &[
            Behavior::AddRef,
            Behavior::Release,
            Behavior::EnumRefs,
            Behavior::ReleaseRefs,
        ]
    } else {
        &[Behavior::AddRef, Behavior::Release]
    }
}

/// The one-line diagnostic matching the category, emitted alongside the
/// missing-behaviours configuration error.
pub fn completeness_hint(flags: TypeFlags) -> &'static str {
    if flags.is_value() {
        "A non-pod value type must have at least one constructor and the destructor behaviours"
    } else if flags.is_gc() {
        "A garbage collected ref type must have the addref, release, and all gc behaviours"
    } else {
        "A reference type must have the addref and release behaviours"
    }
}
