use libffi::middle::{Arg, Cif, CodePtr, Type};

use crate::runtime::heap::{Heap, ObjectBody, ObjectHandle};
use crate::runtime::value::Value;
use crate::runtime::RuntimeError;
use crate::types::decl::RefMode;
use crate::types::descriptor::{ResolvedType, Signature, TypeId};
use crate::types::flags::TypeFlags;
use crate::types::registry::TypeRegistry;
use crate::types::RegisterError;

use super::convention::CallConvention;

/// How one declared parameter is marshalled into the foreign call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParamKind {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    /// Handle or reference object; passed as the instance address.
    Object,
    /// POD value object passed by value, classified by its ABI hints.
    Struct,
    /// Primitive passed by address; read back after the call for
    /// `&out` and `&inout` parameters.
    ByRef(TypeId),
}

/// Typed return slot of a foreign call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReturnKind {
    Void,
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    /// An object address; resolved or adopted by the engine.
    Pointer,
}

/// A prepared foreign call. The platform classification lives in the
/// CIF, built once at registration so call sites only move bytes.
#[derive(Clone)]
pub struct NativeCall {
    cif: Cif,
    code: usize,
    convention: CallConvention,
    aux: Option<usize>,
    params: Vec<ParamKind>,
    ret: ReturnKind,
}

impl std::fmt::Debug for NativeCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeCall")
            .field("code", &format_args!("{:#x}", self.code))
            .field("convention", &self.convention)
            .field("params", &self.params.len())
            .finish()
    }
}

/// Result of a foreign call before the engine interprets the return.
#[derive(Debug)]
pub enum NativeOutcome {
    Value(Value),
    /// A returned object address the engine must resolve or adopt.
    Pointer(usize),
}

/// Readbacks of `&out`/`&inout` parameters, by parameter index.
pub type NativeOuts = Vec<(usize, Value)>;

/// Scratch storage for one marshalled argument. Lives across the call
/// so the argument array can point into it.
enum Scratch {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Ptr(*mut std::ffi::c_void),
}

impl Scratch {
    fn as_arg(&self) -> Arg {
        match self {
            Scratch::I8(v) => Arg::new(v),
            Scratch::I16(v) => Arg::new(v),
            Scratch::I32(v) => Arg::new(v),
            Scratch::I64(v) => Arg::new(v),
            Scratch::U8(v) => Arg::new(v),
            Scratch::U16(v) => Arg::new(v),
            Scratch::U32(v) => Arg::new(v),
            Scratch::U64(v) => Arg::new(v),
            Scratch::F32(v) => Arg::new(v),
            Scratch::F64(v) => Arg::new(v),
            Scratch::Ptr(p) => Arg::new(p),
        }
    }

    /// The argument slot for a by-value struct: the address of the
    /// instance bytes themselves, not the address of a pointer.
    fn as_struct_arg(&self) -> Arg {
        match self {
            Scratch::Ptr(p) => Arg::new(unsafe { &*(*p as *const u8) }),
            _ => unreachable!("struct scratch is always a pointer"),
        }
    }
}

/// Boxed storage a `&out`/`&inout` primitive is written through. Boxing
/// keeps the address stable while the argument list is assembled.
enum ByRefCell {
    I8(Box<i8>),
    I16(Box<i16>),
    I32(Box<i32>),
    I64(Box<i64>),
    U8(Box<u8>),
    U16(Box<u16>),
    U32(Box<u32>),
    U64(Box<u64>),
    F32(Box<f32>),
    F64(Box<f64>),
}

impl ByRefCell {
    fn new(id: TypeId, seed: &Value) -> Self {
        let int = seed.as_int().unwrap_or(0);
        let float = seed.as_double().unwrap_or(0.0);
        match id {
            TypeId::INT8 => ByRefCell::I8(Box::new(int as i8)),
            TypeId::INT16 => ByRefCell::I16(Box::new(int as i16)),
            TypeId::INT32 => ByRefCell::I32(Box::new(int as i32)),
            TypeId::UINT8 | TypeId::BOOL => ByRefCell::U8(Box::new(int as u8)),
            TypeId::UINT16 => ByRefCell::U16(Box::new(int as u16)),
            TypeId::UINT32 => ByRefCell::U32(Box::new(int as u32)),
            TypeId::UINT64 => ByRefCell::U64(Box::new(int as u64)),
            TypeId::FLOAT => ByRefCell::F32(Box::new(float as f32)),
            TypeId::DOUBLE => ByRefCell::F64(Box::new(float)),
            _ => ByRefCell::I64(Box::new(int)),
        }
    }

    fn addr(&mut self) -> *mut std::ffi::c_void {
        match self {
            ByRefCell::I8(b) => b.as_mut() as *mut i8 as *mut _,
            ByRefCell::I16(b) => b.as_mut() as *mut i16 as *mut _,
            ByRefCell::I32(b) => b.as_mut() as *mut i32 as *mut _,
            ByRefCell::I64(b) => b.as_mut() as *mut i64 as *mut _,
            ByRefCell::U8(b) => b.as_mut() as *mut u8 as *mut _,
            ByRefCell::U16(b) => b.as_mut() as *mut u16 as *mut _,
            ByRefCell::U32(b) => b.as_mut() as *mut u32 as *mut _,
            ByRefCell::U64(b) => b.as_mut() as *mut u64 as *mut _,
            ByRefCell::F32(b) => b.as_mut() as *mut f32 as *mut _,
            ByRefCell::F64(b) => b.as_mut() as *mut f64 as *mut _,
        }
    }

    fn read(&self) -> Value {
        match self {
            ByRefCell::I8(b) => Value::Int(**b as i64),
            ByRefCell::I16(b) => Value::Int(**b as i64),
            ByRefCell::I32(b) => Value::Int(**b as i64),
            ByRefCell::I64(b) => Value::Int(**b),
            ByRefCell::U8(b) => Value::Uint(**b as u64),
            ByRefCell::U16(b) => Value::Uint(**b as u64),
            ByRefCell::U32(b) => Value::Uint(**b as u64),
            ByRefCell::U64(b) => Value::Uint(**b),
            ByRefCell::F32(b) => Value::Float(**b),
            ByRefCell::F64(b) => Value::Double(**b),
        }
    }
}

fn primitive_ffi_type(id: TypeId) -> Option<(Type, ParamKind)> {
    let pair = match id {
        TypeId::BOOL => (Type::u8(), ParamKind::Bool),
        TypeId::INT8 => (Type::i8(), ParamKind::I8),
        TypeId::INT16 => (Type::i16(), ParamKind::I16),
        TypeId::INT32 => (Type::i32(), ParamKind::I32),
        TypeId::INT64 => (Type::i64(), ParamKind::I64),
        TypeId::UINT8 => (Type::u8(), ParamKind::U8),
        TypeId::UINT16 => (Type::u16(), ParamKind::U16),
        TypeId::UINT32 => (Type::u32(), ParamKind::U32),
        TypeId::UINT64 => (Type::u64(), ParamKind::U64),
        TypeId::FLOAT => (Type::f32(), ParamKind::F32),
        TypeId::DOUBLE => (Type::f64(), ParamKind::F64),
        _ => return None,
    };
    Some(pair)
}

/// The structure classification for a by-value POD object. Requires the
/// ABI hint flags; the element list feeds the platform classifier inside
/// libffi.
fn struct_ffi_type(registry: &TypeRegistry, id: TypeId) -> Result<Type, RegisterError> {
    let desc = registry
        .get(id)
        .ok_or_else(|| RegisterError::UnknownType(format!("type #{}", id.0)))?;
    let flags = desc.flags;
    let invalid = |why: &str| {
        Err(RegisterError::InvalidDeclaration(format!(
            "'{}' cannot be passed by value to a native function: {}",
            desc.name, why
        )))
    };
    if !flags.is_value() || !flags.is_pod() {
        return invalid("only POD value types can be passed by value");
    }
    let all_ints = flags.contains(TypeFlags::ABI_ALL_INTS);
    let all_floats = flags.contains(TypeFlags::ABI_ALL_FLOATS);
    if !all_ints && !all_floats {
        return invalid("the type declares no ABI class hint");
    }
    let align8 = flags.contains(TypeFlags::ALIGN8);
    let unit = if align8 { 8 } else { 4 };
    if desc.size == 0 || desc.size % unit != 0 {
        return invalid("the size does not match the declared ABI class");
    }
    let element = match (all_floats, align8) {
        (true, true) => Type::f64(),
        (true, false) => Type::f32(),
        (false, true) => Type::u64(),
        (false, false) => Type::u32(),
    };
    let count = (desc.size / unit) as usize;
    Ok(Type::structure(std::iter::repeat(element).take(count)))
}

fn param_ffi_type(
    registry: &TypeRegistry,
    slot: &ResolvedType,
) -> Result<(Type, ParamKind), RegisterError> {
    if slot.is_handle {
        return Ok((Type::pointer(), ParamKind::Object));
    }
    if slot.ref_mode != RefMode::None {
        if slot.id.is_primitive() {
            return Ok((Type::pointer(), ParamKind::ByRef(slot.id)));
        }
        return Ok((Type::pointer(), ParamKind::Object));
    }
    if let Some(pair) = primitive_ffi_type(slot.id) {
        return Ok(pair);
    }
    let desc = registry
        .get(slot.id)
        .ok_or_else(|| RegisterError::UnknownType(format!("type #{}", slot.id.0)))?;
    if desc.flags.is_reference() {
        // A reference type without a handle marker is still the
        // instance address at the ABI level.
        return Ok((Type::pointer(), ParamKind::Object));
    }
    Ok((struct_ffi_type(registry, slot.id)?, ParamKind::Struct))
}

fn return_ffi_type(
    registry: &TypeRegistry,
    slot: &ResolvedType,
) -> Result<(Type, ReturnKind), RegisterError> {
    if slot.is_void() {
        return Ok((Type::void(), ReturnKind::Void));
    }
    if slot.is_handle || !slot.id.is_primitive() {
        if !slot.is_handle && slot.ref_mode == RefMode::None {
            let value_type = registry
                .get(slot.id)
                .map(|d| d.flags.is_value())
                .unwrap_or(false);
            if value_type {
                return Err(RegisterError::InvalidDeclaration(format!(
                    "'{}' cannot be returned by value from a native function; use the generic convention",
                    registry.name_of(slot.id)
                )));
            }
        }
        return Ok((Type::pointer(), ReturnKind::Pointer));
    }
    let kind = match slot.id {
        TypeId::BOOL => ReturnKind::Bool,
        TypeId::INT8 => ReturnKind::I8,
        TypeId::INT16 => ReturnKind::I16,
        TypeId::INT32 => ReturnKind::I32,
        TypeId::INT64 => ReturnKind::I64,
        TypeId::UINT8 => ReturnKind::U8,
        TypeId::UINT16 => ReturnKind::U16,
        TypeId::UINT32 => ReturnKind::U32,
        TypeId::UINT64 => ReturnKind::U64,
        TypeId::FLOAT => ReturnKind::F32,
        TypeId::DOUBLE => ReturnKind::F64,
        _ => {
            return Err(RegisterError::InvalidDeclaration(
                "unsupported native return type".into(),
            ))
        }
    };
    let ty = primitive_ffi_type(slot.id)
        .map(|(t, _)| t)
        .unwrap_or_else(Type::u8);
    Ok((ty, kind))
}

/// Prepares the CIF and marshalling plan for one native entry point.
/// Everything that can fail does so here, at registration time.
pub(crate) fn build_native_call(
    registry: &TypeRegistry,
    signature: &Signature,
    convention: CallConvention,
    code: usize,
    aux: Option<usize>,
) -> Result<NativeCall, RegisterError> {
    if convention == CallConvention::BoundGlobal && aux.is_none() {
        return Err(RegisterError::InvalidDeclaration(
            "a bound global function requires its bound instance".into(),
        ));
    }
    let mut arg_types = Vec::with_capacity(signature.params.len() + 1);
    let mut params = Vec::with_capacity(signature.params.len());
    if matches!(
        convention,
        CallConvention::ObjFirst | CallConvention::BoundGlobal
    ) {
        arg_types.push(Type::pointer());
    }
    for param in &signature.params {
        let (ty, kind) = param_ffi_type(registry, param)?;
        arg_types.push(ty);
        params.push(kind);
    }
    if convention == CallConvention::ObjLast {
        arg_types.push(Type::pointer());
    }
    let (ret_type, ret) = return_ffi_type(registry, &signature.ret)?;
    let cif = Cif::new(arg_types, ret_type);
    Ok(NativeCall {
        cif,
        code,
        convention,
        aux,
        params,
        ret,
    })
}

/// The address a native call passes for an object argument.
fn instance_ptr(heap: &Heap, handle: ObjectHandle) -> Result<*mut std::ffi::c_void, RuntimeError> {
    let entry = heap.entry(handle)?;
    let ptr = match &entry.body {
        ObjectBody::Extern(addr) => *addr as *mut std::ffi::c_void,
        ObjectBody::Raw(bytes) => bytes.as_ptr() as *mut std::ffi::c_void,
        ObjectBody::Foreign(body) => {
            body.as_ref() as *const dyn std::any::Any as *mut std::ffi::c_void
        }
        ObjectBody::Script(_) => {
            return Err(RuntimeError::InvalidOperation(
                "script objects cannot cross a native call boundary".into(),
            ))
        }
    };
    Ok(ptr)
}

impl NativeCall {
    /// Invokes the prepared call with marshalled arguments. The heap is
    /// only read, for instance addresses; native targets do not reenter
    /// the engine.
    pub(crate) fn invoke(
        &self,
        heap: &Heap,
        object: Option<ObjectHandle>,
        args: &[Value],
    ) -> Result<(NativeOutcome, NativeOuts), RuntimeError> {
        if args.len() != self.params.len() {
            return Err(RuntimeError::InvalidOperation(format!(
                "native call expects {} arguments, got {}",
                self.params.len(),
                args.len()
            )));
        }
        let mut scratch: Vec<Scratch> = Vec::with_capacity(args.len() + 1);
        let mut struct_slots: Vec<bool> = Vec::with_capacity(args.len() + 1);
        let mut cells: Vec<(usize, ByRefCell)> = Vec::new();

        match self.convention {
            CallConvention::ObjFirst => {
                let handle = object.ok_or(RuntimeError::NullPointerAccess)?;
                scratch.push(Scratch::Ptr(instance_ptr(heap, handle)?));
                struct_slots.push(false);
            }
            CallConvention::BoundGlobal => {
                let aux = self.aux.unwrap_or(0);
                scratch.push(Scratch::Ptr(aux as *mut std::ffi::c_void));
                struct_slots.push(false);
            }
            _ => {}
        }
        for (index, (kind, value)) in self.params.iter().zip(args).enumerate() {
            let slot = match kind {
                ParamKind::Bool => Scratch::U8(value.as_bool()? as u8),
                ParamKind::I8 => Scratch::I8(value.as_int()? as i8),
                ParamKind::I16 => Scratch::I16(value.as_int()? as i16),
                ParamKind::I32 => Scratch::I32(value.as_int()? as i32),
                ParamKind::I64 => Scratch::I64(value.as_int()?),
                ParamKind::U8 => Scratch::U8(value.as_int()? as u8),
                ParamKind::U16 => Scratch::U16(value.as_int()? as u16),
                ParamKind::U32 => Scratch::U32(value.as_int()? as u32),
                ParamKind::U64 => Scratch::U64(value.as_int()? as u64),
                ParamKind::F32 => Scratch::F32(value.as_double()? as f32),
                ParamKind::F64 => Scratch::F64(value.as_double()?),
                ParamKind::Object => match value {
                    Value::Object(h) => Scratch::Ptr(instance_ptr(heap, *h)?),
                    Value::Null => Scratch::Ptr(std::ptr::null_mut()),
                    other => {
                        return Err(RuntimeError::InvalidOperation(format!(
                            "argument {} is a {}, not an object",
                            index,
                            other.kind_name()
                        )))
                    }
                },
                ParamKind::Struct => {
                    let handle = value.expect_object()?;
                    Scratch::Ptr(instance_ptr(heap, handle)?)
                }
                ParamKind::ByRef(id) => {
                    let mut cell = ByRefCell::new(*id, value);
                    let addr = cell.addr();
                    cells.push((index, cell));
                    Scratch::Ptr(addr)
                }
            };
            struct_slots.push(matches!(kind, ParamKind::Struct));
            scratch.push(slot);
        }
        if self.convention == CallConvention::ObjLast {
            let handle = object.ok_or(RuntimeError::NullPointerAccess)?;
            scratch.push(Scratch::Ptr(instance_ptr(heap, handle)?));
            struct_slots.push(false);
        }

        let ffi_args: Vec<Arg> = scratch
            .iter()
            .enumerate()
            .map(|(i, slot)| {
                if struct_slots[i] {
                    slot.as_struct_arg()
                } else {
                    slot.as_arg()
                }
            })
            .collect();

        let code_ptr = CodePtr(self.code as *mut _);
        let outcome = unsafe {
            match self.ret {
                ReturnKind::Void => {
                    self.cif.call::<()>(code_ptr, &ffi_args);
                    NativeOutcome::Value(Value::Void)
                }
                ReturnKind::Bool => {
                    NativeOutcome::Value(Value::Bool(self.cif.call::<u8>(code_ptr, &ffi_args) != 0))
                }
                ReturnKind::I8 => NativeOutcome::Value(Value::Int(
                    self.cif.call::<i8>(code_ptr, &ffi_args) as i64,
                )),
                ReturnKind::I16 => NativeOutcome::Value(Value::Int(
                    self.cif.call::<i16>(code_ptr, &ffi_args) as i64,
                )),
                ReturnKind::I32 => NativeOutcome::Value(Value::Int(
                    self.cif.call::<i32>(code_ptr, &ffi_args) as i64,
                )),
                ReturnKind::I64 => {
                    NativeOutcome::Value(Value::Int(self.cif.call::<i64>(code_ptr, &ffi_args)))
                }
                ReturnKind::U8 => NativeOutcome::Value(Value::Uint(
                    self.cif.call::<u8>(code_ptr, &ffi_args) as u64,
                )),
                ReturnKind::U16 => NativeOutcome::Value(Value::Uint(
                    self.cif.call::<u16>(code_ptr, &ffi_args) as u64,
                )),
                ReturnKind::U32 => NativeOutcome::Value(Value::Uint(
                    self.cif.call::<u32>(code_ptr, &ffi_args) as u64,
                )),
                ReturnKind::U64 => {
                    NativeOutcome::Value(Value::Uint(self.cif.call::<u64>(code_ptr, &ffi_args)))
                }
                ReturnKind::F32 => {
                    NativeOutcome::Value(Value::Float(self.cif.call::<f32>(code_ptr, &ffi_args)))
                }
                ReturnKind::F64 => {
                    NativeOutcome::Value(Value::Double(self.cif.call::<f64>(code_ptr, &ffi_args)))
                }
                ReturnKind::Pointer => NativeOutcome::Pointer(
                    self.cif.call::<*mut std::ffi::c_void>(code_ptr, &ffi_args) as usize,
                ),
            }
        };

        let outs = cells
            .into_iter()
            .map(|(param, cell)| (param, cell.read()))
            .collect();
        Ok((outcome, outs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::decl::parse_function_decl;

    fn resolve_sig(registry: &TypeRegistry, decl: &str) -> Signature {
        let parsed = parse_function_decl(decl).unwrap();
        Signature::new(
            registry.resolve(&parsed.ret).unwrap(),
            parsed
                .params
                .iter()
                .map(|p| registry.resolve(p).unwrap())
                .collect(),
        )
    }

    extern "C" fn native_add(a: i32, b: i32) -> i32 {
        a.wrapping_add(b)
    }

    extern "C" fn native_scale(x: f64, factor: f64) -> f64 {
        x * factor
    }

    extern "C" fn native_deref(p: *const i32) -> i32 {
        unsafe { *p }
    }

    extern "C" fn native_divmod(n: i32, d: i32, rem: *mut i32) -> i32 {
        unsafe { *rem = n % d };
        n / d
    }

    #[test]
    fn test_cdecl_int_call() {
        let registry = TypeRegistry::new();
        let sig = resolve_sig(&registry, "int add(int, int)");
        let call = build_native_call(
            &registry,
            &sig,
            CallConvention::Cdecl,
            native_add as usize,
            None,
        )
        .unwrap();
        let heap = Heap::new();
        let (outcome, outs) = call
            .invoke(&heap, None, &[Value::Int(40), Value::Int(2)])
            .unwrap();
        assert!(outs.is_empty());
        match outcome {
            NativeOutcome::Value(v) => assert_eq!(v, Value::Int(42)),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_cdecl_double_call() {
        let registry = TypeRegistry::new();
        let sig = resolve_sig(&registry, "double scale(double, double)");
        let call = build_native_call(
            &registry,
            &sig,
            CallConvention::Cdecl,
            native_scale as usize,
            None,
        )
        .unwrap();
        let heap = Heap::new();
        let (outcome, _) = call
            .invoke(&heap, None, &[Value::Double(1.5), Value::Double(4.0)])
            .unwrap();
        match outcome {
            NativeOutcome::Value(v) => assert_eq!(v, Value::Double(6.0)),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_out_param_read_back() {
        let registry = TypeRegistry::new();
        let sig = resolve_sig(&registry, "int divmod(int, int, int &out)");
        let call = build_native_call(
            &registry,
            &sig,
            CallConvention::Cdecl,
            native_divmod as usize,
            None,
        )
        .unwrap();
        let heap = Heap::new();
        let (outcome, outs) = call
            .invoke(&heap, None, &[Value::Int(17), Value::Int(5), Value::Void])
            .unwrap();
        match outcome {
            NativeOutcome::Value(v) => assert_eq!(v, Value::Int(3)),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(outs, vec![(2, Value::Int(2))]);
    }

    #[test]
    fn test_obj_first_receives_instance_address() {
        let mut registry = TypeRegistry::new();
        registry
            .register_object_type("cell", 0, TypeFlags::REFERENCE | TypeFlags::NOCOUNT)
            .unwrap();
        let sig = resolve_sig(&registry, "int read()");
        let call = build_native_call(
            &registry,
            &sig,
            CallConvention::ObjFirst,
            native_deref as usize,
            None,
        )
        .unwrap();
        let mut heap = Heap::new();
        let boxed = Box::new(7i32);
        let addr = Box::as_ref(&boxed) as *const i32 as usize;
        let cell = registry.type_id("cell").unwrap();
        let handle = heap.allocate(cell, ObjectBody::Extern(addr));
        let (outcome, _) = call.invoke(&heap, Some(handle), &[]).unwrap();
        match outcome {
            NativeOutcome::Value(v) => assert_eq!(v, Value::Int(7)),
            other => panic!("unexpected outcome {:?}", other),
        }
        drop(boxed);
    }

    #[test]
    fn test_by_value_struct_requires_abi_hints() {
        let mut registry = TypeRegistry::new();
        registry
            .register_object_type("vec2", 8, TypeFlags::VALUE | TypeFlags::POD)
            .unwrap();
        let sig = resolve_sig(&registry, "double len(vec2)");
        let err = build_native_call(&registry, &sig, CallConvention::Cdecl, 0, None).unwrap_err();
        assert!(matches!(err, RegisterError::InvalidDeclaration(_)));

        let mut registry = TypeRegistry::new();
        registry
            .register_object_type(
                "vec2",
                8,
                TypeFlags::VALUE | TypeFlags::POD | TypeFlags::ABI_ALL_FLOATS,
            )
            .unwrap();
        let sig = resolve_sig(&registry, "double len(vec2)");
        assert!(build_native_call(&registry, &sig, CallConvention::Cdecl, 0, None).is_ok());
    }

    #[test]
    fn test_bound_global_requires_aux() {
        let registry = TypeRegistry::new();
        let sig = resolve_sig(&registry, "void poke(int)");
        let err =
            build_native_call(&registry, &sig, CallConvention::BoundGlobal, 0, None).unwrap_err();
        assert!(matches!(err, RegisterError::InvalidDeclaration(_)));
        assert!(
            build_native_call(&registry, &sig, CallConvention::BoundGlobal, 0, Some(0x10)).is_ok()
        );
    }

    #[test]
    fn test_value_object_return_rejected() {
        let mut registry = TypeRegistry::new();
        registry
            .register_object_type(
                "vec2",
                8,
                TypeFlags::VALUE | TypeFlags::POD | TypeFlags::ABI_ALL_FLOATS,
            )
            .unwrap();
        let sig = resolve_sig(&registry, "vec2 make(double, double)");
        assert!(build_native_call(&registry, &sig, CallConvention::Cdecl, 0, None).is_err());
    }
}
