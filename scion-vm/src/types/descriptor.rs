use rustc_hash::FxHashMap;

use super::behavior::Behavior;
use super::decl::RefMode;
use super::flags::TypeFlags;

/// Identifier of a type in the registry. Primitive types occupy a fixed
/// low range so bytecode can refer to them without a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde_support", derive(serde::Serialize, serde::Deserialize))]
pub struct TypeId(pub u32);

impl TypeId {
    pub const VOID: TypeId = TypeId(0);
    pub const BOOL: TypeId = TypeId(1);
    pub const INT8: TypeId = TypeId(2);
    pub const INT16: TypeId = TypeId(3);
    pub const INT32: TypeId = TypeId(4);
    pub const INT64: TypeId = TypeId(5);
    pub const UINT8: TypeId = TypeId(6);
    pub const UINT16: TypeId = TypeId(7);
    pub const UINT32: TypeId = TypeId(8);
    pub const UINT64: TypeId = TypeId(9);
    pub const FLOAT: TypeId = TypeId(10);
    pub const DOUBLE: TypeId = TypeId(11);
    /// First id handed out to registered or installed types.
    pub const FIRST_USER: u32 = 12;

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn is_primitive(self) -> bool {
        self.0 < Self::FIRST_USER
    }

    pub fn primitive_name(self) -> Option<&'static str> {
        let name = match self {
            TypeId::VOID => "void",
            TypeId::BOOL => "bool",
            TypeId::INT8 => "int8",
            TypeId::INT16 => "int16",
            TypeId::INT32 => "int",
            TypeId::INT64 => "int64",
            TypeId::UINT8 => "uint8",
            TypeId::UINT16 => "uint16",
            TypeId::UINT32 => "uint",
            TypeId::UINT64 => "uint64",
            TypeId::FLOAT => "float",
            TypeId::DOUBLE => "double",
            _ => return None,
        };
        Some(name)
    }

    /// Size in bytes for primitives, `None` for object types and `void`.
    pub fn primitive_size(self) -> Option<u32> {
        let size = match self {
            TypeId::BOOL | TypeId::INT8 | TypeId::UINT8 => 1,
            TypeId::INT16 | TypeId::UINT16 => 2,
            TypeId::INT32 | TypeId::UINT32 | TypeId::FLOAT => 4,
            TypeId::INT64 | TypeId::UINT64 | TypeId::DOUBLE => 8,
            _ => return None,
        };
        Some(size)
    }
}

/// Identifier of a registered or installed function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde_support", derive(serde::Serialize, serde::Deserialize))]
pub struct FunctionId(pub u32);

impl FunctionId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A type expression with its base name resolved to a `TypeId`. Carries
/// everything the dispatcher needs to marshal one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde_support", derive(serde::Serialize, serde::Deserialize))]
pub struct ResolvedType {
    pub id: TypeId,
    pub is_handle: bool,
    pub ref_mode: RefMode,
    pub is_const: bool,
}

impl ResolvedType {
    pub fn plain(id: TypeId) -> Self {
        ResolvedType {
            id,
            is_handle: false,
            ref_mode: RefMode::None,
            is_const: false,
        }
    }

    pub fn handle(id: TypeId) -> Self {
        ResolvedType {
            is_handle: true,
            ..Self::plain(id)
        }
    }

    pub fn reference(id: TypeId, ref_mode: RefMode) -> Self {
        ResolvedType {
            ref_mode,
            ..Self::plain(id)
        }
    }

    pub fn is_void(&self) -> bool {
        self.id == TypeId::VOID && !self.is_handle
    }

    /// True when the slot refers to a heap object (by handle or by value).
    pub fn is_object(&self) -> bool {
        !self.id.is_primitive()
    }
}

/// Full signature of a function: return slot plus ordered parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde_support", derive(serde::Serialize, serde::Deserialize))]
pub struct Signature {
    pub ret: ResolvedType,
    pub params: Vec<ResolvedType>,
}

impl Signature {
    pub fn new(ret: ResolvedType, params: Vec<ResolvedType>) -> Self {
        Signature { ret, params }
    }
}

/// Field of a script class. Fields hold primitives or handles; the slot
/// index is the field's position in the declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    pub ty: TypeId,
    pub is_handle: bool,
}

/// Exposed member of a registered host type, addressed by byte offset
/// into the instance storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyDef {
    pub name: String,
    pub ty: ResolvedType,
    pub offset: u32,
}

/// 某个类型在注册表中的具体形态。宿主注册类型、脚本类、接口、模板与
/// 函数签名类型共享同一张描述符表。
#[derive(Debug, Clone)]
pub enum TypeKind {
    Primitive,
    /// A type registered by the host application.
    Registered,
    /// A class installed from a module image.
    ScriptClass {
        fields: Vec<FieldDef>,
        destructor: Option<FunctionId>,
        is_final: bool,
    },
    /// A script interface. Carries no storage of its own.
    Interface,
    /// A registered template type, e.g. `array<class T>`.
    Template { subtype: String },
    /// An instantiation of a template with a concrete subtype.
    TemplateInstance { template: TypeId, sub: ResolvedType },
    /// A function-signature type.
    Funcdef { signature: Signature },
}

/// Descriptor of one type. Mutable only while its owning unit is still
/// being configured; the registry freezes it afterwards.
#[derive(Debug, Clone)]
pub struct TypeDescriptor {
    pub id: TypeId,
    pub name: String,
    pub size: u32,
    pub flags: TypeFlags,
    pub kind: TypeKind,
    /// Constructors, factories and assignment may be overloaded; the
    /// other kinds hold exactly one entry.
    pub behaviors: FxHashMap<Behavior, Vec<FunctionId>>,
    pub methods: Vec<FunctionId>,
    pub properties: Vec<PropertyDef>,
}

impl TypeDescriptor {
    pub fn new(id: TypeId, name: String, size: u32, flags: TypeFlags, kind: TypeKind) -> Self {
        TypeDescriptor {
            id,
            name,
            size,
            flags,
            kind,
            behaviors: FxHashMap::default(),
            methods: Vec::new(),
            properties: Vec::new(),
        }
    }

    /// First registered behavior of the kind, if any.
    pub fn behavior(&self, kind: Behavior) -> Option<FunctionId> {
        self.behaviors.get(&kind).and_then(|v| v.first().copied())
    }

    pub fn behaviors_of(&self, kind: Behavior) -> &[FunctionId] {
        self.behaviors.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_behavior(&self, kind: Behavior) -> bool {
        self.behaviors.get(&kind).is_some_and(|v| !v.is_empty())
    }

    pub fn is_script_class(&self) -> bool {
        matches!(self.kind, TypeKind::ScriptClass { .. })
    }

    pub fn is_final(&self) -> bool {
        match &self.kind {
            TypeKind::ScriptClass { is_final, .. } => *is_final,
            // Registered host types and template instances cannot be
            // subclassed by scripts; interface handles may point at any
            // implementing class.
            TypeKind::Registered
            | TypeKind::Primitive
            | TypeKind::Funcdef { .. }
            | TypeKind::TemplateInstance { .. } => true,
            TypeKind::Interface | TypeKind::Template { .. } => false,
        }
    }

    pub fn fields(&self) -> &[FieldDef] {
        match &self.kind {
            TypeKind::ScriptClass { fields, .. } => fields,
            _ => &[],
        }
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields().iter().position(|f| f.name == name)
    }

    pub fn script_destructor(&self) -> Option<FunctionId> {
        match &self.kind {
            TypeKind::ScriptClass { destructor, .. } => *destructor,
            _ => None,
        }
    }

    pub fn property(&self, name: &str) -> Option<&PropertyDef> {
        self.properties.iter().find(|p| p.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_ids() {
        assert!(TypeId::DOUBLE.is_primitive());
        assert!(!TypeId(TypeId::FIRST_USER).is_primitive());
        assert_eq!(TypeId::INT32.primitive_name(), Some("int"));
        assert_eq!(TypeId::UINT32.primitive_name(), Some("uint"));
        assert_eq!(TypeId::VOID.primitive_size(), None);
        assert_eq!(TypeId::BOOL.primitive_size(), Some(1));
        assert_eq!(TypeId::DOUBLE.primitive_size(), Some(8));
    }

    #[test]
    fn test_resolved_type_queries() {
        let h = ResolvedType::handle(TypeId(20));
        assert!(h.is_object() && h.is_handle && !h.is_void());
        let v = ResolvedType::plain(TypeId::VOID);
        assert!(v.is_void() && !v.is_object());
    }

    #[test]
    fn test_script_class_accessors() {
        let kind = TypeKind::ScriptClass {
            fields: vec![
                FieldDef {
                    name: "value".into(),
                    ty: TypeId::INT32,
                    is_handle: false,
                },
                FieldDef {
                    name: "next".into(),
                    ty: TypeId(12),
                    is_handle: true,
                },
            ],
            destructor: None,
            is_final: true,
        };
        let desc = TypeDescriptor::new(TypeId(12), "node".into(), 0, TypeFlags::REFERENCE, kind);
        assert_eq!(desc.field_index("next"), Some(1));
        assert_eq!(desc.field_index("missing"), None);
        assert!(desc.is_final());
        assert!(desc.script_destructor().is_none());
    }
}
