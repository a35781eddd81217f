use indexmap::IndexMap;

use super::behavior::{completeness_hint, required_behaviors, validate_behavior, Behavior};
use super::decl::TypeExpr;
use super::descriptor::{
    FieldDef, FunctionId, PropertyDef, ResolvedType, TypeDescriptor, TypeId, TypeKind,
};
use super::flags::TypeFlags;
use super::RegisterError;

/// The type registry. Holds every primitive, registered and installed
/// type descriptor; host registration is only possible until
/// [`finalize`](TypeRegistry::finalize), module units are appended
/// afterwards and frozen per unit.
#[derive(Debug)]
pub struct TypeRegistry {
    types: Vec<TypeDescriptor>,
    by_name: IndexMap<String, TypeId>,
    frozen: bool,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    pub fn new() -> Self {
        let mut registry = TypeRegistry {
            types: Vec::new(),
            by_name: IndexMap::new(),
            frozen: false,
        };
        for raw in 0..TypeId::FIRST_USER {
            let id = TypeId(raw);
            let name = match id.primitive_name() {
                Some(name) => name,
                None => continue,
            };
            let flags = if id == TypeId::VOID {
                TypeFlags::empty()
            } else {
                TypeFlags::VALUE | TypeFlags::POD
            };
            let size = id.primitive_size().unwrap_or(0);
            registry.types.push(TypeDescriptor::new(
                id,
                name.to_string(),
                size,
                flags,
                TypeKind::Primitive,
            ));
            registry.by_name.insert(name.to_string(), id);
        }
        registry
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Freezes host registration. Module units may still be installed.
    pub fn finalize(&mut self) {
        self.frozen = true;
        log::debug!("type registry finalized with {} types", self.types.len());
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn get(&self, id: TypeId) -> Option<&TypeDescriptor> {
        self.types.get(id.index())
    }

    pub fn type_id(&self, name: &str) -> Option<TypeId> {
        self.by_name.get(name).copied()
    }

    /// Type name for diagnostics; unknown ids render as `?`.
    pub fn name_of(&self, id: TypeId) -> &str {
        self.get(id).map(|t| t.name.as_str()).unwrap_or("?")
    }

    fn check_open(&self) -> Result<(), RegisterError> {
        if self.frozen {
            Err(RegisterError::ConfigurationFrozen)
        } else {
            Ok(())
        }
    }

    fn check_new_name(&self, name: &str) -> Result<(), RegisterError> {
        if self.by_name.contains_key(name) {
            Err(RegisterError::AlreadyRegistered(name.to_string()))
        } else {
            Ok(())
        }
    }

    fn push_type(&mut self, name: String, size: u32, flags: TypeFlags, kind: TypeKind) -> TypeId {
        let id = TypeId(self.types.len() as u32);
        self.by_name.insert(name.clone(), id);
        self.types.push(TypeDescriptor::new(id, name, size, flags, kind));
        id
    }

    /// Registers a host object type. A declaration of the form
    /// `"name<class T>"` registers a template; everything else is a plain
    /// named type. Illegal flag combinations are rejected before any state
    /// changes.
    pub fn register_object_type(
        &mut self,
        decl: &str,
        size: u32,
        flags: TypeFlags,
    ) -> Result<TypeId, RegisterError> {
        self.check_open()?;
        flags.validate()?;
        if flags.is_value() && size == 0 {
            return Err(RegisterError::InvalidFlags(format!(
                "value type '{}' must declare a non-zero size",
                decl
            )));
        }
        let (name, kind) = match parse_template_decl(decl)? {
            Some((name, subtype)) => {
                if !flags.contains(TypeFlags::TEMPLATE) {
                    return Err(RegisterError::InvalidFlags(format!(
                        "'{}' declares a subtype but the template flag is not set",
                        decl
                    )));
                }
                (name, TypeKind::Template { subtype })
            }
            None => {
                if flags.contains(TypeFlags::TEMPLATE) {
                    return Err(RegisterError::InvalidFlags(format!(
                        "template type '{}' must declare its subtype",
                        decl
                    )));
                }
                check_ident(decl)?;
                (decl.to_string(), TypeKind::Registered)
            }
        };
        self.check_new_name(&name)?;
        Ok(self.push_type(name, size, flags, kind))
    }

    /// Registers a script interface descriptor.
    pub fn register_interface(&mut self, name: &str) -> Result<TypeId, RegisterError> {
        self.check_open()?;
        check_ident(name)?;
        self.check_new_name(name)?;
        Ok(self.push_type(
            name.to_string(),
            0,
            TypeFlags::REFERENCE,
            TypeKind::Interface,
        ))
    }

    /// Registers a function-signature type.
    pub fn register_funcdef(
        &mut self,
        name: String,
        signature: super::descriptor::Signature,
    ) -> Result<TypeId, RegisterError> {
        self.check_open()?;
        self.check_new_name(&name)?;
        Ok(self.push_type(
            name,
            0,
            TypeFlags::REFERENCE,
            TypeKind::Funcdef { signature },
        ))
    }

    /// Creates (or finds) the instance of a registered template for a
    /// concrete subtype. Instances can be created after finalization; each
    /// distinct subtype yields one shared descriptor.
    pub fn instantiate_template(
        &mut self,
        template: TypeId,
        sub: ResolvedType,
    ) -> Result<TypeId, RegisterError> {
        let base = self
            .get(template)
            .ok_or_else(|| RegisterError::UnknownType(format!("type #{}", template.0)))?;
        if !matches!(base.kind, TypeKind::Template { .. }) {
            return Err(RegisterError::NotSupported(format!(
                "'{}' is not a template type",
                base.name
            )));
        }
        let mut name = format!("{}<{}", base.name, self.name_of(sub.id));
        if sub.is_handle {
            name.push('@');
        }
        name.push('>');
        if let Some(existing) = self.type_id(&name) {
            return Ok(existing);
        }
        let mut flags = TypeFlags::REFERENCE;
        if self.referent_may_cycle(sub) {
            flags.insert(TypeFlags::GC);
        }
        Ok(self.push_type(
            name,
            0,
            flags,
            TypeKind::TemplateInstance { template, sub },
        ))
    }

    /// Resolves a parsed type expression against the registered names.
    /// Handles are only meaningful on reference types that expose them.
    pub fn resolve(&self, expr: &TypeExpr) -> Result<ResolvedType, RegisterError> {
        let id = self
            .type_id(&expr.base)
            .ok_or_else(|| RegisterError::UnknownType(expr.base.clone()))?;
        let resolved = ResolvedType {
            id,
            is_handle: expr.is_handle,
            ref_mode: expr.ref_mode,
            is_const: expr.is_const,
        };
        if expr.is_handle {
            self.check_handle_allowed(id)?;
        }
        Ok(resolved)
    }

    /// Like [`resolve`](Self::resolve) but instantiates template instance
    /// names (`"array<node>"`) on demand. Used when installing module
    /// images that mention instances no one has created yet.
    pub fn resolve_creating(&mut self, expr: &TypeExpr) -> Result<ResolvedType, RegisterError> {
        if self.type_id(&expr.base).is_none() {
            if let Some((template_name, sub_src)) = split_instance_name(&expr.base) {
                let template = self
                    .type_id(template_name)
                    .ok_or_else(|| RegisterError::UnknownType(template_name.to_string()))?;
                let sub_expr = super::decl::parse_type_expr(sub_src)?;
                let sub = self.resolve_creating(&sub_expr)?;
                self.instantiate_template(template, sub)?;
            }
        }
        self.resolve(expr)
    }

    fn check_handle_allowed(&self, id: TypeId) -> Result<(), RegisterError> {
        let not_supported =
            || RegisterError::NotSupported("Object handle is not supported for this type".into());
        let desc = self.get(id).ok_or_else(not_supported)?;
        if desc.flags.is_reference() && !desc.flags.is_scoped() {
            Ok(())
        } else {
            Err(not_supported())
        }
    }

    pub(crate) fn add_behavior(
        &mut self,
        id: TypeId,
        behavior: Behavior,
        func: FunctionId,
    ) -> Result<(), RegisterError> {
        let desc = self
            .types
            .get_mut(id.index())
            .ok_or_else(|| RegisterError::UnknownType(format!("type #{}", id.0)))?;
        validate_behavior(desc.flags, behavior)?;
        let overloadable = matches!(
            behavior,
            Behavior::Construct | Behavior::Factory | Behavior::Assign
        );
        let slot = desc.behaviors.entry(behavior).or_default();
        if !slot.is_empty() && !overloadable {
            return Err(RegisterError::AlreadyRegistered(format!(
                "{} behaviour of '{}'",
                behavior.name(),
                desc.name
            )));
        }
        slot.push(func);
        Ok(())
    }

    pub(crate) fn add_method(&mut self, id: TypeId, func: FunctionId) -> Result<(), RegisterError> {
        let desc = self
            .types
            .get_mut(id.index())
            .ok_or_else(|| RegisterError::UnknownType(format!("type #{}", id.0)))?;
        desc.methods.push(func);
        Ok(())
    }

    pub(crate) fn add_property(
        &mut self,
        id: TypeId,
        prop: PropertyDef,
    ) -> Result<(), RegisterError> {
        let slot_size = prop.ty.id.primitive_size().unwrap_or(8);
        let desc = self
            .types
            .get_mut(id.index())
            .ok_or_else(|| RegisterError::UnknownType(format!("type #{}", id.0)))?;
        if desc.properties.iter().any(|p| p.name == prop.name) {
            return Err(RegisterError::AlreadyRegistered(format!(
                "property '{}' of '{}'",
                prop.name, desc.name
            )));
        }
        if desc.flags.is_value() && prop.offset + slot_size > desc.size {
            return Err(RegisterError::InvalidDeclaration(format!(
                "property '{}' does not fit in '{}'",
                prop.name, desc.name
            )));
        }
        desc.properties.push(prop);
        Ok(())
    }

    /// Starts a script class of a module unit. The name is reserved at
    /// once so classes of the same unit can refer to each other in any
    /// declaration order; fields follow in
    /// [`set_script_class_body`](Self::set_script_class_body).
    pub(crate) fn begin_script_class(
        &mut self,
        name: &str,
        is_final: bool,
    ) -> Result<TypeId, RegisterError> {
        check_ident(name)?;
        self.check_new_name(name)?;
        Ok(self.push_type(
            name.to_string(),
            0,
            TypeFlags::REFERENCE | TypeFlags::SCRIPT,
            TypeKind::ScriptClass {
                fields: Vec::new(),
                destructor: None,
                is_final,
            },
        ))
    }

    pub(crate) fn set_script_class_body(
        &mut self,
        id: TypeId,
        fields: Vec<FieldDef>,
        destructor: Option<FunctionId>,
    ) -> Result<(), RegisterError> {
        let desc = self
            .types
            .get_mut(id.index())
            .ok_or_else(|| RegisterError::UnknownType(format!("type #{}", id.0)))?;
        match &mut desc.kind {
            TypeKind::ScriptClass {
                fields: slot,
                destructor: dtor,
                ..
            } => {
                *slot = fields;
                *dtor = destructor;
                Ok(())
            }
            _ => Err(RegisterError::NotSupported(format!(
                "'{}' is not a script class",
                desc.name
            ))),
        }
    }

    /// Runs the cycle-capability fixed point over one installed unit.
    ///
    /// A class is marked cycle-capable when one of its handle fields can
    /// point at an object that may itself hold handles: the target type is
    /// unknown or still open to subclassing, already cycle-capable, or
    /// structurally holds handles. Iterating to a fixed point makes the
    /// outcome independent of declaration order inside the unit.
    pub(crate) fn resolve_unit_cycles(&mut self, unit: &[TypeId]) {
        loop {
            let mut changed = false;
            for &id in unit {
                let desc = match self.get(id) {
                    Some(d) if !d.flags.is_gc() => d,
                    _ => continue,
                };
                let cyclic = desc.fields().iter().any(|field| {
                    field.is_handle
                        && self.referent_may_cycle(ResolvedType::handle(field.ty))
                });
                if cyclic {
                    if let Some(desc) = self.types.get_mut(id.index()) {
                        desc.flags.insert(TypeFlags::GC);
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }
    }

    /// Whether a handle slot of the given type can be part of a circular
    /// reference. Unknown targets count as cyclic.
    fn referent_may_cycle(&self, slot: ResolvedType) -> bool {
        let Some(target) = self.get(slot.id) else {
            return true;
        };
        if !slot.is_handle && !target.flags.is_reference() {
            return false;
        }
        target.flags.is_gc() || !target.is_final() || self.holds_handles(target)
    }

    fn holds_handles(&self, desc: &TypeDescriptor) -> bool {
        match &desc.kind {
            TypeKind::Primitive => false,
            TypeKind::Registered => desc.flags.is_gc(),
            TypeKind::ScriptClass { fields, .. } => fields.iter().any(|f| f.is_handle),
            // An interface handle can point at any implementing class; a
            // funcdef value can carry a bound object.
            TypeKind::Interface | TypeKind::Template { .. } | TypeKind::Funcdef { .. } => true,
            TypeKind::TemplateInstance { sub, .. } => desc.flags.is_gc() || sub.is_handle,
        }
    }

    /// Rolls an aborted unit install back to `mark` (a value previously
    /// returned by [`len`](Self::len)).
    pub(crate) fn rollback_to(&mut self, mark: usize) {
        self.types.truncate(mark);
        self.by_name.retain(|_, id| id.index() < mark);
    }

    /// Deferred completeness check, run at the first instantiation of a
    /// registered type. Returns the diagnostic lines of the original
    /// message stream on failure.
    pub fn verify_complete(&self, id: TypeId) -> Result<(), Vec<String>> {
        let Some(desc) = self.get(id) else {
            return Ok(());
        };
        if !matches!(desc.kind, TypeKind::Registered) {
            return Ok(());
        }
        let missing = required_behaviors(desc.flags)
            .iter()
            .any(|b| !desc.has_behavior(*b));
        if missing {
            Err(vec![
                format!("Type '{}' is missing behaviours", desc.name),
                completeness_hint(desc.flags).to_string(),
            ])
        } else {
            Ok(())
        }
    }
}

fn check_ident(name: &str) -> Result<(), RegisterError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(RegisterError::InvalidDeclaration(format!(
            "'{}' is not a valid type name",
            name
        )))
    }
}

/// Splits `"array<class T>"` into `("array", "T")`; returns `None` for
/// plain names.
fn parse_template_decl(decl: &str) -> Result<Option<(String, String)>, RegisterError> {
    let Some(open) = decl.find('<') else {
        return Ok(None);
    };
    let bad = || RegisterError::InvalidDeclaration(format!("'{}' is not a valid template form", decl));
    let name = decl[..open].trim();
    check_ident(name)?;
    let inner = decl[open + 1..].trim_end();
    let inner = inner.strip_suffix('>').ok_or_else(bad)?.trim();
    let subtype = inner.strip_prefix("class").ok_or_else(bad)?.trim();
    check_ident(subtype)?;
    Ok(Some((name.to_string(), subtype.to_string())))
}

/// Splits a template instance name `"array<node@>"` into
/// `("array", "node@")`.
fn split_instance_name(name: &str) -> Option<(&str, &str)> {
    let open = name.find('<')?;
    let inner = name[open + 1..].strip_suffix('>')?;
    Some((&name[..open], inner))
}
