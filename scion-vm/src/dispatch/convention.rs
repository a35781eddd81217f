use crate::types::RegisterError;

/// How a host function expects its arguments. `Generic` is the portable
/// convention every build supports; the rest go through the prepared
/// foreign-call descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallConvention {
    /// Opaque accessor object, marshalled by the engine.
    Generic,
    /// Plain C function; no implicit instance argument.
    Cdecl,
    /// Method call with the instance as the first argument.
    ObjFirst,
    /// Method call with the instance as the last argument.
    ObjLast,
    /// Global function bound to a fixed instance, passed first.
    BoundGlobal,
}

impl CallConvention {
    pub fn is_native(self) -> bool {
        !matches!(self, CallConvention::Generic)
    }

    /// Whether calls carry an implicit instance from the call site.
    pub fn takes_instance(self) -> bool {
        matches!(self, CallConvention::ObjFirst | CallConvention::ObjLast)
    }

    pub fn name(self) -> &'static str {
        match self {
            CallConvention::Generic => "generic",
            CallConvention::Cdecl => "cdecl",
            CallConvention::ObjFirst => "obj-first",
            CallConvention::ObjLast => "obj-last",
            CallConvention::BoundGlobal => "bound-global",
        }
    }

    /// Registration-time pairing check between the entry point form and
    /// the declared convention.
    pub fn check_entry(self, is_generic_entry: bool) -> Result<(), RegisterError> {
        match (self, is_generic_entry) {
            (CallConvention::Generic, true) => Ok(()),
            (CallConvention::Generic, false) => Err(RegisterError::InvalidDeclaration(
                "a native entry point cannot use the generic convention".into(),
            )),
            (_, true) => Err(RegisterError::InvalidDeclaration(
                "a generic entry point requires the generic convention".into(),
            )),
            (_, false) => Ok(()),
        }
    }
}

impl std::fmt::Display for CallConvention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_pairing() {
        assert!(CallConvention::Generic.check_entry(true).is_ok());
        assert!(CallConvention::Generic.check_entry(false).is_err());
        assert!(CallConvention::Cdecl.check_entry(false).is_ok());
        assert!(CallConvention::ObjFirst.check_entry(true).is_err());
    }

    #[test]
    fn test_instance_conventions() {
        assert!(CallConvention::ObjFirst.takes_instance());
        assert!(CallConvention::ObjLast.takes_instance());
        assert!(!CallConvention::Cdecl.takes_instance());
        assert!(!CallConvention::BoundGlobal.takes_instance());
        assert!(!CallConvention::Generic.is_native());
    }
}
