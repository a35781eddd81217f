//! Scion 引擎。
//!
//! 引擎是所有部件的汇合点：类型注册表、对象堆、回收器、函数表、
//! 全局变量与已安装模块都挂在这里。宿主先注册类型与函数，调用
//! `finalize` 冻结注册表，然后安装模块镜像并通过执行上下文运行
//! 入口函数。引用计数以堆头部计数为准，宿主行为函数在每次计数
//! 变化时得到通知。

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use rustc_hash::FxHashSet;

use crate::dispatch::convention::CallConvention;
use crate::dispatch::generic::{dispatch_generic, GenericFn, GenericMode};
use crate::dispatch::native::{build_native_call, NativeCall, NativeOutcome, NativeOuts};
use crate::dispatch::HostEntry;
use crate::gc::{
    CircularRefCallback, GarbageCollector, GcObjectInfo, GcStatistics, GC_DESTROY_GARBAGE,
    GC_DETECT_GARBAGE, GC_FULL_CYCLE, GC_ONE_STEP,
};
use crate::runtime::heap::{Heap, ObjectBody, ObjectHandle};
use crate::runtime::lifecycle::{self, Regime};
use crate::runtime::value::Value;
use crate::runtime::RuntimeError;
use crate::types::behavior::Behavior;
use crate::types::decl::{parse_function_decl, parse_property_decl, parse_type_expr, FunctionDecl};
use crate::types::descriptor::{
    FieldDef, FunctionId, PropertyDef, ResolvedType, Signature, TypeId, TypeKind,
};
use crate::types::flags::TypeFlags;
use crate::types::function::{FunctionBody, FunctionDescriptor, LocalVarDecl, ScriptCode};
use crate::types::registry::TypeRegistry;
use crate::types::RegisterError;
use crate::utils::pool::NamePool;
use crate::vm::context::{ContextState, ExecutionContext};
use crate::vm::module::{
    verify_function, CallInfo, FunctionBodyImage, ModuleImage, TypeFacts, VerifyError,
};

/// Tunable engine limits, read by contexts when they are prepared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineProperty {
    /// Operand-stack slots a fresh context reserves up front.
    InitialStackSize,
    /// Upper bound on stack slots across all frames of one context.
    MaxStackSize,
    /// Upper bound on nested script frames.
    MaxCallDepth,
    /// Non-zero runs an incremental collection step whenever an object
    /// is enrolled for cycle detection.
    AutoGarbageCollect,
}

/// A module resolved against the engine: type and function tables
/// translated to engine ids, globals mapped to engine slots, and the
/// retained name pool for `Throw` messages.
pub struct InstalledModule {
    id: u32,
    name: String,
    types: Vec<TypeId>,
    functions: Vec<FunctionId>,
    globals: Vec<usize>,
    entry_points: HashMap<String, FunctionId>,
    messages: NamePool,
}

impl InstalledModule {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry_point(&self, name: &str) -> Option<FunctionId> {
        self.entry_points.get(name).copied()
    }

    pub fn entry_points(&self) -> impl Iterator<Item = (&str, FunctionId)> {
        self.entry_points
            .iter()
            .map(|(name, id)| (name.as_str(), *id))
    }

    pub fn types(&self) -> &[TypeId] {
        &self.types
    }

    pub fn functions(&self) -> &[FunctionId] {
        &self.functions
    }
}

/// A registered or module global variable. Slots are engine-wide; the
/// module keeps a table mapping its own indexes onto them.
struct GlobalVar {
    name: String,
    #[allow(dead_code)]
    ty: ResolvedType,
    value: Value,
    module: Option<u32>,
}

/// What a host call produced. `outs` carries by-reference writebacks
/// from native targets, keyed by parameter index.
pub(crate) struct HostCallResult {
    pub ret: Value,
    pub suspend: bool,
    pub outs: NativeOuts,
    pub enumerated: Vec<ObjectHandle>,
}

enum HostTarget {
    Generic(GenericFn),
    Native(NativeCall, ResolvedType),
}

pub struct Engine {
    registry: TypeRegistry,
    heap: Heap,
    functions: Vec<Option<FunctionDescriptor>>,
    globals: Vec<GlobalVar>,
    modules: Vec<Option<InstalledModule>>,
    /// Taken while a pass runs; nested collection requests during a
    /// destructor or callback find it absent and are absorbed.
    collector: Option<GarbageCollector>,
    /// Candidate table of enrolled objects, in enrollment order.
    gc_table: Vec<ObjectHandle>,
    /// Types that already passed the completeness check.
    verified: FxHashSet<TypeId>,
    initial_stack_size: u64,
    max_stack_size: u64,
    max_call_depth: u64,
    auto_garbage_collect: bool,
}

impl Default for Engine {
    fn default() -> Self {
        Engine::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Engine {
            registry: TypeRegistry::new(),
            heap: Heap::new(),
            functions: Vec::new(),
            globals: Vec::new(),
            modules: Vec::new(),
            collector: Some(GarbageCollector::default()),
            gc_table: Vec::new(),
            verified: FxHashSet::default(),
            initial_stack_size: 256,
            max_stack_size: 4096,
            max_call_depth: 64,
            auto_garbage_collect: true,
        }
    }

    pub fn set_property(&mut self, property: EngineProperty, value: u64) {
        match property {
            EngineProperty::InitialStackSize => self.initial_stack_size = value,
            EngineProperty::MaxStackSize => self.max_stack_size = value,
            EngineProperty::MaxCallDepth => self.max_call_depth = value,
            EngineProperty::AutoGarbageCollect => self.auto_garbage_collect = value != 0,
        }
    }

    pub fn property(&self, property: EngineProperty) -> u64 {
        match property {
            EngineProperty::InitialStackSize => self.initial_stack_size,
            EngineProperty::MaxStackSize => self.max_stack_size,
            EngineProperty::MaxCallDepth => self.max_call_depth,
            EngineProperty::AutoGarbageCollect => self.auto_garbage_collect as u64,
        }
    }

    pub(crate) fn max_stack_slots(&self) -> usize {
        self.max_stack_size as usize
    }

    pub(crate) fn max_call_depth(&self) -> usize {
        self.max_call_depth as usize
    }

    /// Read access to the type registry, for hosts that want to walk
    /// descriptors directly.
    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn type_id(&self, name: &str) -> Option<TypeId> {
        self.registry.type_id(name)
    }

    pub fn type_name(&self, type_id: TypeId) -> String {
        self.registry.name_of(type_id).to_string()
    }

    pub fn function(&self, function: FunctionId) -> Option<&FunctionDescriptor> {
        self.functions.get(function.index())?.as_ref()
    }

    pub fn live_objects(&self) -> usize {
        self.heap.live_count()
    }

    /// Freezes the registered application interface. Module units are
    /// still installed afterwards; host registration is not.
    pub fn finalize(&mut self) {
        self.registry.finalize();
    }

    /// Fresh execution context. Contexts snapshot the stack and call
    /// depth limits when they are prepared.
    pub fn create_context(&self) -> ExecutionContext {
        ExecutionContext::new()
    }

    // ---- 注册接口 ----

    pub fn register_object_type(
        &mut self,
        decl: &str,
        size: u32,
        flags: TypeFlags,
    ) -> Result<TypeId, RegisterError> {
        self.registry.register_object_type(decl, size, flags)
    }

    pub fn register_interface(&mut self, name: &str) -> Result<TypeId, RegisterError> {
        self.registry.register_interface(name)
    }

    /// Registers a function signature as a type, e.g.
    /// `"void Callback(int)"`.
    pub fn register_funcdef(&mut self, decl: &str) -> Result<TypeId, RegisterError> {
        let parsed = parse_function_decl(decl)?;
        let signature = self.resolve_signature(&parsed)?;
        self.registry.register_funcdef(parsed.name, signature)
    }

    pub fn register_object_behavior(
        &mut self,
        type_name: &str,
        behavior: Behavior,
        decl: &str,
        entry: HostEntry,
        convention: CallConvention,
    ) -> Result<FunctionId, RegisterError> {
        if self.registry.is_frozen() {
            return Err(RegisterError::ConfigurationFrozen);
        }
        let type_id = self
            .registry
            .type_id(type_name)
            .ok_or_else(|| RegisterError::UnknownType(type_name.to_string()))?;
        let parsed = parse_function_decl(decl)?;
        let signature = self.resolve_signature(&parsed)?;
        let function =
            self.add_host_function(parsed.name, Some(type_id), signature, convention, entry)?;
        if let Err(err) = self.registry.add_behavior(type_id, behavior, function) {
            self.functions.pop();
            return Err(err);
        }
        Ok(function)
    }

    /// Registers a method of a host type. A method named `opAssign`
    /// doubles as the assignment behavior where the type's category
    /// allows one.
    pub fn register_object_method(
        &mut self,
        type_name: &str,
        decl: &str,
        entry: HostEntry,
        convention: CallConvention,
    ) -> Result<FunctionId, RegisterError> {
        if self.registry.is_frozen() {
            return Err(RegisterError::ConfigurationFrozen);
        }
        let type_id = self
            .registry
            .type_id(type_name)
            .ok_or_else(|| RegisterError::UnknownType(type_name.to_string()))?;
        let parsed = parse_function_decl(decl)?;
        let signature = self.resolve_signature(&parsed)?;
        if self.method_exists(type_id, &parsed.name, &signature.params) {
            return Err(RegisterError::AlreadyRegistered(format!(
                "method '{}' of '{}'",
                parsed.name, type_name
            )));
        }
        let is_assign = parsed.name == "opAssign";
        let function =
            self.add_host_function(parsed.name, Some(type_id), signature, convention, entry)?;
        if let Err(err) = self.registry.add_method(type_id, function) {
            self.functions.pop();
            return Err(err);
        }
        if is_assign {
            match self.registry.add_behavior(type_id, Behavior::Assign, function) {
                Ok(()) | Err(RegisterError::IllegalBehaviourForType(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(function)
    }

    pub fn register_global_function(
        &mut self,
        decl: &str,
        entry: HostEntry,
        convention: CallConvention,
    ) -> Result<FunctionId, RegisterError> {
        if self.registry.is_frozen() {
            return Err(RegisterError::ConfigurationFrozen);
        }
        let parsed = parse_function_decl(decl)?;
        let signature = self.resolve_signature(&parsed)?;
        let duplicate = self.functions.iter().flatten().any(|f| {
            f.object_type.is_none()
                && f.module.is_none()
                && f.name == parsed.name
                && params_match(&f.signature.params, &signature.params)
        });
        if duplicate {
            return Err(RegisterError::AlreadyRegistered(format!(
                "global function '{}'",
                parsed.name
            )));
        }
        self.add_host_function(parsed.name, None, signature, convention, entry)
    }

    /// Exposes a member of a host type by byte offset into its storage.
    pub fn register_object_property(
        &mut self,
        type_name: &str,
        decl: &str,
        offset: u32,
    ) -> Result<(), RegisterError> {
        if self.registry.is_frozen() {
            return Err(RegisterError::ConfigurationFrozen);
        }
        let type_id = self
            .registry
            .type_id(type_name)
            .ok_or_else(|| RegisterError::UnknownType(type_name.to_string()))?;
        let parsed = parse_property_decl(decl)?;
        let ty = self.registry.resolve_creating(&parsed.ty)?;
        self.registry.add_property(
            type_id,
            PropertyDef {
                name: parsed.name,
                ty,
                offset,
            },
        )
    }

    /// Registers an engine-level global variable. An object `init`
    /// value hands its reference to the engine.
    pub fn register_global_property(
        &mut self,
        decl: &str,
        init: Value,
    ) -> Result<usize, RegisterError> {
        let parsed = parse_property_decl(decl)?;
        let ty = self.registry.resolve_creating(&parsed.ty)?;
        if self
            .globals
            .iter()
            .any(|g| g.module.is_none() && g.name == parsed.name)
        {
            return Err(RegisterError::AlreadyRegistered(format!(
                "global property '{}'",
                parsed.name
            )));
        }
        let slot = self.globals.len();
        self.globals.push(GlobalVar {
            name: parsed.name,
            ty,
            value: init,
            module: None,
        });
        Ok(slot)
    }

    fn add_host_function(
        &mut self,
        name: String,
        object_type: Option<TypeId>,
        signature: Signature,
        convention: CallConvention,
        entry: HostEntry,
    ) -> Result<FunctionId, RegisterError> {
        convention.check_entry(entry.is_generic())?;
        let body = match entry {
            HostEntry::Generic(target) => FunctionBody::Generic(target),
            HostEntry::Native { code, aux } => FunctionBody::Native(build_native_call(
                &self.registry,
                &signature,
                convention,
                code,
                aux,
            )?),
        };
        let id = FunctionId(self.functions.len() as u32);
        self.functions.push(Some(FunctionDescriptor {
            id,
            name,
            object_type,
            signature,
            convention,
            body,
            module: None,
        }));
        Ok(id)
    }

    fn add_script_function(
        &mut self,
        name: String,
        object_type: Option<TypeId>,
        signature: Signature,
        module: u32,
        code: ScriptCode,
    ) -> FunctionId {
        let id = FunctionId(self.functions.len() as u32);
        self.functions.push(Some(FunctionDescriptor {
            id,
            name,
            object_type,
            signature,
            convention: CallConvention::Generic,
            body: FunctionBody::Script(Arc::new(code)),
            module: Some(module),
        }));
        id
    }

    fn resolve_signature(&mut self, decl: &FunctionDecl) -> Result<Signature, RegisterError> {
        let ret = self.registry.resolve_creating(&decl.ret)?;
        let mut params = Vec::with_capacity(decl.params.len());
        for param in &decl.params {
            params.push(self.registry.resolve_creating(param)?);
        }
        Ok(Signature::new(ret, params))
    }

    fn method_exists(&self, type_id: TypeId, name: &str, params: &[ResolvedType]) -> bool {
        let Some(desc) = self.registry.get(type_id) else {
            return false;
        };
        desc.methods.iter().any(|&fid| {
            self.function(fid)
                .is_some_and(|f| f.name == name && params_match(&f.signature.params, params))
        })
    }

    /// Method lookup by name and arity, used by operator dispatch.
    pub(crate) fn find_method(
        &self,
        type_id: TypeId,
        name: &str,
        param_count: usize,
    ) -> Option<FunctionId> {
        let desc = self.registry.get(type_id)?;
        desc.methods.iter().copied().find(|&fid| {
            self.function(fid)
                .is_some_and(|f| f.name == name && f.signature.params.len() == param_count)
        })
    }

    fn behavior_of(&self, type_id: TypeId, kind: Behavior) -> Option<FunctionId> {
        let desc = self.registry.get(type_id)?;
        desc.behavior(kind).or_else(|| match desc.kind {
            // Template instances share the template's behavior table.
            TypeKind::TemplateInstance { template, .. } => {
                self.registry.get(template).and_then(|t| t.behavior(kind))
            }
            _ => None,
        })
    }

    // ---- 生命周期 ----

    pub(crate) fn addref_value(&mut self, value: Value) -> Result<(), RuntimeError> {
        match value {
            Value::Object(handle) => self.addref_object(handle),
            _ => Ok(()),
        }
    }

    /// Takes one reference on an object. No-count types ignore the
    /// traffic entirely; counted host types see their addref behavior.
    pub fn addref_object(&mut self, handle: ObjectHandle) -> Result<(), RuntimeError> {
        let type_id = self.heap.entry(handle)?.type_id;
        let flags = self.flags_of(type_id);
        if lifecycle::regime(flags) == Regime::NoCount {
            return Ok(());
        }
        self.heap.retain(handle)?;
        if lifecycle::counts_references(flags) {
            if let Some(addref) = self.behavior_of(type_id, Behavior::AddRef) {
                if let Err(err) = self.call_host(addref, Some(handle), &[]) {
                    log::warn!(
                        "addref behaviour of '{}' failed: {}",
                        self.type_name(type_id),
                        err
                    );
                }
            }
        }
        Ok(())
    }

    /// Drops one reference. When the last one goes, the object is
    /// destroyed: script destructor or host destructor first, then its
    /// outgoing references cascade.
    pub fn release_object(&mut self, handle: ObjectHandle) -> Result<(), RuntimeError> {
        let (type_id, destroying) = {
            let entry = self.heap.entry(handle)?;
            (entry.type_id, entry.destroying)
        };
        let flags = self.flags_of(type_id);
        if lifecycle::regime(flags) == Regime::NoCount {
            return Ok(());
        }
        let remaining = self.heap.release_count(handle)?;
        if lifecycle::counts_references(flags) {
            if let Some(release) = self.behavior_of(type_id, Behavior::Release) {
                if let Err(err) = self.call_host(release, Some(handle), &[]) {
                    log::warn!(
                        "release behaviour of '{}' failed: {}",
                        self.type_name(type_id),
                        err
                    );
                }
            }
        }
        if remaining == 0 && !destroying {
            self.destroy_object(handle)?;
        }
        Ok(())
    }

    /// Release that must not fail: faults are logged and swallowed.
    /// This is what stack unwinding and cleanup paths use.
    pub(crate) fn release_value(&mut self, value: Value) {
        if let Value::Object(handle) = value {
            if let Err(err) = self.release_object(handle) {
                log::warn!("release of {} failed: {}", handle, err);
            }
        }
    }

    fn destroy_object(&mut self, handle: ObjectHandle) -> Result<(), RuntimeError> {
        {
            let entry = self.heap.entry_mut(handle)?;
            if entry.destroying {
                return Ok(());
            }
            entry.destroying = true;
        }
        let type_id = self.heap.entry(handle)?.type_id;
        let flags = self.flags_of(type_id);
        let (script_dtor, destruct, scoped_release) = {
            let desc = self.registry.get(type_id);
            (
                desc.and_then(|d| d.script_destructor()),
                desc.and_then(|d| d.behavior(Behavior::Destruct)),
                if flags.is_scoped() {
                    desc.and_then(|d| d.behavior(Behavior::Release))
                } else {
                    None
                },
            )
        };
        if let Some(destructor) = script_dtor {
            self.run_script_destructor(handle, destructor);
        }
        if let Some(destruct) = destruct {
            if let Err(err) = self.call_host(destruct, Some(handle), &[]) {
                log::warn!(
                    "destruct behaviour of '{}' failed: {}",
                    self.type_name(type_id),
                    err
                );
            }
        }
        if let Some(release) = scoped_release {
            if let Err(err) = self.call_host(release, Some(handle), &[]) {
                log::warn!(
                    "release behaviour of '{}' failed: {}",
                    self.type_name(type_id),
                    err
                );
            }
        }
        for target in lifecycle::drain_outgoing(&mut self.heap, handle) {
            self.release_value(Value::Object(target));
        }
        self.heap.free(handle);
        log::trace!("destroyed {}", handle);
        Ok(())
    }

    /// Runs a script destructor on an internal context. Faults are
    /// contained: the object still goes away afterwards.
    fn run_script_destructor(&mut self, handle: ObjectHandle, destructor: FunctionId) {
        let mut ctx = ExecutionContext::new();
        if let Err(err) = ctx.prepare(self, destructor) {
            log::warn!("destructor of {} not runnable: {}", handle, err);
            return;
        }
        if let Err(err) = ctx.set_object(handle) {
            log::warn!("destructor of {} not runnable: {}", handle, err);
            let _ = ctx.unprepare(self);
            return;
        }
        match ctx.execute(self) {
            Ok(ContextState::Finished) => {}
            Ok(ContextState::ExceptionRaised) => log::warn!(
                "destructor of {} raised '{}'",
                handle,
                ctx.exception_message().unwrap_or("")
            ),
            Ok(state) => log::warn!("destructor of {} ended {}", handle, state),
            Err(err) => log::warn!("destructor of {} failed: {}", handle, err),
        }
        let _ = ctx.unprepare(self);
    }

    // ---- 实例 ----

    /// Constructs an instance of a type: script classes get default
    /// field slots, registered value types run their constructor in
    /// fresh storage, reference types go through their factory. The
    /// first use of each type runs the completeness check.
    pub fn instantiate(&mut self, type_id: TypeId) -> Result<Value, RuntimeError> {
        self.ensure_complete(type_id)?;
        enum Plan {
            Script(Vec<Value>),
            Value(u32, Option<FunctionId>),
            Factory(FunctionId),
        }
        let plan = {
            let desc = self
                .registry
                .get(type_id)
                .ok_or_else(|| RuntimeError::UnknownEntity(format!("type #{}", type_id.0)))?;
            match &desc.kind {
                TypeKind::ScriptClass { fields, .. } => {
                    Plan::Script(fields.iter().map(field_default).collect())
                }
                TypeKind::Registered | TypeKind::TemplateInstance { .. }
                    if desc.flags.is_value() =>
                {
                    Plan::Value(desc.size, self.behavior_of(type_id, Behavior::Construct))
                }
                TypeKind::Registered | TypeKind::TemplateInstance { .. } => {
                    match self.behavior_of(type_id, Behavior::Factory) {
                        Some(factory) => Plan::Factory(factory),
                        None => {
                            return Err(RuntimeError::InvalidOperation(format!(
                                "type '{}' has no factory",
                                desc.name
                            )))
                        }
                    }
                }
                _ => {
                    return Err(RuntimeError::InvalidOperation(format!(
                        "cannot instantiate '{}'",
                        desc.name
                    )))
                }
            }
        };
        let flags = self.flags_of(type_id);
        match plan {
            Plan::Script(fields) => {
                let handle = self.heap.allocate(type_id, ObjectBody::Script(fields));
                if lifecycle::uses_collector(flags) {
                    self.enroll_in_gc(handle);
                }
                Ok(Value::Object(handle))
            }
            Plan::Value(size, construct) => {
                let handle = self
                    .heap
                    .allocate(type_id, ObjectBody::Raw(vec![0; size as usize]));
                if let Some(constructor) = construct {
                    if let Err(err) = self.call_host(constructor, Some(handle), &[]) {
                        self.heap.free(handle);
                        return Err(err);
                    }
                }
                Ok(Value::Object(handle))
            }
            Plan::Factory(factory) => {
                let call = self.call_host(factory, None, &[])?;
                match call.ret {
                    Value::Object(handle) => Ok(Value::Object(handle)),
                    Value::Null => Err(RuntimeError::NullPointerAccess),
                    other => Err(RuntimeError::InvalidOperation(format!(
                        "factory of '{}' returned a {}",
                        self.type_name(type_id),
                        other.kind_name()
                    ))),
                }
            }
        }
    }

    /// Brings a host-constructed value onto the heap with the single
    /// reference the caller receives. GC-capable types are enrolled.
    pub(crate) fn adopt_foreign(
        &mut self,
        type_id: TypeId,
        body: Box<dyn Any>,
    ) -> Result<ObjectHandle, RuntimeError> {
        let flags = self.object_flags(type_id)?;
        let handle = self.heap.allocate(type_id, ObjectBody::Foreign(body));
        if lifecycle::uses_collector(flags) {
            self.enroll_in_gc(handle);
        }
        Ok(handle)
    }

    /// Wraps a raw host pointer returned by a native factory.
    fn adopt_extern(
        &mut self,
        type_id: TypeId,
        address: usize,
    ) -> Result<ObjectHandle, RuntimeError> {
        let flags = self.object_flags(type_id)?;
        let handle = self.heap.allocate(type_id, ObjectBody::Extern(address));
        if lifecycle::uses_collector(flags) {
            self.enroll_in_gc(handle);
        }
        Ok(handle)
    }

    fn object_flags(&self, type_id: TypeId) -> Result<TypeFlags, RuntimeError> {
        self.registry
            .get(type_id)
            .map(|d| d.flags)
            .ok_or_else(|| RuntimeError::UnknownEntity(format!("type #{}", type_id.0)))
    }

    fn flags_of(&self, type_id: TypeId) -> TypeFlags {
        self.registry
            .get(type_id)
            .map(|d| d.flags)
            .unwrap_or(TypeFlags::REFERENCE)
    }

    fn ensure_complete(&mut self, type_id: TypeId) -> Result<(), RuntimeError> {
        if self.verified.contains(&type_id) {
            return Ok(());
        }
        match self.registry.verify_complete(type_id) {
            Ok(()) => {
                self.verified.insert(type_id);
                Ok(())
            }
            Err(lines) => {
                for line in &lines {
                    log::error!("{}", line);
                }
                Err(RuntimeError::InvalidConfiguration)
            }
        }
    }

    /// `dst = src` for two instances of `type_id`. POD types copy
    /// bytes, script classes copy fields with the new references taken
    /// before the displaced ones go, host types run their assignment
    /// behavior.
    pub(crate) fn assign_value(
        &mut self,
        type_id: TypeId,
        dst: ObjectHandle,
        src: ObjectHandle,
    ) -> Result<(), RuntimeError> {
        let (is_script, pod_value, name) = {
            let desc = self
                .registry
                .get(type_id)
                .ok_or_else(|| RuntimeError::UnknownEntity(format!("type #{}", type_id.0)))?;
            (
                desc.is_script_class(),
                desc.flags.is_value() && desc.flags.is_pod(),
                desc.name.clone(),
            )
        };
        if is_script {
            return self.assign_script_fields(dst, src);
        }
        if pod_value {
            return lifecycle::copy_pod(&mut self.heap, src, dst);
        }
        match self.behavior_of(type_id, Behavior::Assign) {
            Some(assign) => {
                self.call_host(assign, Some(dst), &[Value::Object(src)])?;
                Ok(())
            }
            None => Err(RuntimeError::InvalidOperation(format!(
                "No appropriate opAssign method found in '{}' for value assignment",
                name
            ))),
        }
    }

    fn assign_script_fields(
        &mut self,
        dst: ObjectHandle,
        src: ObjectHandle,
    ) -> Result<(), RuntimeError> {
        let src_fields = match &self.heap.entry(src)?.body {
            ObjectBody::Script(fields) => fields.clone(),
            _ => {
                return Err(RuntimeError::InvalidOperation(
                    "assignment source has no script fields".into(),
                ))
            }
        };
        if !matches!(self.heap.entry(dst)?.body, ObjectBody::Script(_)) {
            return Err(RuntimeError::InvalidOperation(
                "assignment destination has no script fields".into(),
            ));
        }
        // Incoming references are taken before the old ones are
        // released, so self-assignment can never dip a count to zero.
        let mut retained = 0usize;
        let mut fault = None;
        for value in &src_fields {
            match self.addref_value(*value) {
                Ok(()) => retained += 1,
                Err(err) => {
                    fault = Some(err);
                    break;
                }
            }
        }
        if let Some(err) = fault {
            for value in src_fields.iter().take(retained) {
                self.release_value(*value);
            }
            return Err(err);
        }
        let old = {
            let entry = self.heap.entry_mut(dst)?;
            match &mut entry.body {
                ObjectBody::Script(fields) => std::mem::replace(fields, src_fields),
                _ => unreachable!("checked above"),
            }
        };
        for value in old {
            self.release_value(value);
        }
        Ok(())
    }

    pub(crate) fn read_script_field(
        &self,
        handle: ObjectHandle,
        index: u32,
    ) -> Result<Value, RuntimeError> {
        match &self.heap.entry(handle)?.body {
            ObjectBody::Script(fields) => fields.get(index as usize).copied().ok_or_else(|| {
                RuntimeError::InvalidOperation(format!("field index {} out of range", index))
            }),
            _ => Err(RuntimeError::InvalidOperation(
                "object has no script fields".into(),
            )),
        }
    }

    /// Takes ownership of `value`. The displaced reference is released
    /// after the write; when the write itself fails, `value` is
    /// released instead so the transfer stays balanced.
    pub(crate) fn write_script_field(
        &mut self,
        handle: ObjectHandle,
        index: u32,
        value: Value,
    ) -> Result<(), RuntimeError> {
        match self.swap_script_field(handle, index, value) {
            Ok(old) => {
                self.release_value(old);
                Ok(())
            }
            Err(err) => {
                self.release_value(value);
                Err(err)
            }
        }
    }

    fn swap_script_field(
        &mut self,
        handle: ObjectHandle,
        index: u32,
        value: Value,
    ) -> Result<Value, RuntimeError> {
        let entry = self.heap.entry_mut(handle)?;
        match &mut entry.body {
            ObjectBody::Script(fields) => match fields.get_mut(index as usize) {
                Some(slot) => Ok(std::mem::replace(slot, value)),
                None => Err(RuntimeError::InvalidOperation(format!(
                    "field index {} out of range",
                    index
                ))),
            },
            _ => Err(RuntimeError::InvalidOperation(
                "object has no script fields".into(),
            )),
        }
    }

    pub(crate) fn heap(&self) -> &Heap {
        &self.heap
    }

    pub(crate) fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    // ---- 全局变量 ----

    pub fn global_by_name(&self, name: &str) -> Option<usize> {
        self.globals.iter().position(|g| g.name == name)
    }

    pub fn global_value(&self, slot: usize) -> Option<Value> {
        self.globals.get(slot).map(|g| g.value)
    }

    /// Takes ownership of `value` and releases the displaced one, also
    /// when the slot does not exist.
    pub fn set_global_value(&mut self, slot: usize, value: Value) -> Result<(), RuntimeError> {
        match self.globals.get_mut(slot) {
            Some(cell) => {
                let old = std::mem::replace(&mut cell.value, value);
                self.release_value(old);
                Ok(())
            }
            None => {
                self.release_value(value);
                Err(RuntimeError::InvalidOperation(format!(
                    "global slot {} out of range",
                    slot
                )))
            }
        }
    }

    // ---- 模块安装 ----

    /// Installs a module image. Declarations are parsed, types
    /// resolved, the class unit's cycle capability fixed point run, and
    /// every script function verified. A failing module leaves nothing
    /// behind.
    pub fn install_module(&mut self, image: &ModuleImage) -> Result<u32, VerifyError> {
        let module_id = self.modules.len() as u32;
        let type_mark = self.registry.len();
        let function_mark = self.functions.len();
        let global_mark = self.globals.len();
        match self.install_module_inner(image, module_id) {
            Ok(module) => {
                log::debug!(
                    "module '{}' installed: {} types, {} functions, {} globals",
                    module.name,
                    module.types.len(),
                    module.functions.len(),
                    module.globals.len()
                );
                self.modules.push(Some(module));
                Ok(module_id)
            }
            Err(err) => {
                self.registry.rollback_to(type_mark);
                self.verified.retain(|id| id.index() < type_mark);
                self.functions.truncate(function_mark);
                self.globals.truncate(global_mark);
                log::warn!("module '{}' rejected: {}", image.name, err);
                Err(err)
            }
        }
    }

    fn install_module_inner(
        &mut self,
        image: &ModuleImage,
        module_id: u32,
    ) -> Result<InstalledModule, VerifyError> {
        // Classes are declared first so the type table, field types and
        // method signatures can refer to them in any order.
        let mut class_ids = Vec::with_capacity(image.classes.len());
        for class in &image.classes {
            let name = pool_name(&image.names, class.name)?;
            let id = self
                .registry
                .begin_script_class(name, class.is_final)
                .map_err(decl_err)?;
            class_ids.push(id);
        }

        let mut types = Vec::with_capacity(image.types.len());
        for &pooled in &image.types {
            let spelled = pool_name(&image.names, pooled)?;
            let expr = parse_type_expr(spelled).map_err(decl_err)?;
            let resolved = self.registry.resolve_creating(&expr).map_err(decl_err)?;
            types.push(resolved.id);
        }

        let mut functions = Vec::with_capacity(image.functions.len());
        let mut script_entries = Vec::new();
        for (index, function) in image.functions.iter().enumerate() {
            let decl_src = pool_name(&image.names, function.decl)?;
            let parsed = parse_function_decl(decl_src).map_err(decl_err)?;
            let signature = self.resolve_signature(&parsed).map_err(decl_err)?;
            let object_type = match function.object {
                Some(pooled) => {
                    let type_name = pool_name(&image.names, pooled)?;
                    Some(self.registry.type_id(type_name).ok_or_else(|| {
                        VerifyError::BadDeclaration(format!("unknown type '{}'", type_name))
                    })?)
                }
                None => None,
            };
            match &function.body {
                FunctionBodyImage::Script {
                    code,
                    vars,
                    line_table,
                } => {
                    let mut locals = Vec::with_capacity(vars.len());
                    for var in vars {
                        let var_src = pool_name(&image.names, var.decl)?;
                        let parsed_var = parse_property_decl(var_src).map_err(decl_err)?;
                        let ty = self
                            .registry
                            .resolve_creating(&parsed_var.ty)
                            .map_err(decl_err)?;
                        locals.push(LocalVarDecl {
                            name: parsed_var.name,
                            ty,
                            slot: var.slot,
                            scope_start: var.scope_start,
                            scope_end: var.scope_end,
                        });
                    }
                    if signature.params.len() > locals.len() {
                        return Err(VerifyError::BadDeclaration(format!(
                            "'{}' declares fewer locals than parameters",
                            parsed.name
                        )));
                    }
                    let id = self.add_script_function(
                        parsed.name,
                        object_type,
                        signature,
                        module_id,
                        ScriptCode {
                            code: code.clone(),
                            locals,
                            line_table: line_table.clone(),
                        },
                    );
                    if let Some(type_id) = object_type {
                        self.registry.add_method(type_id, id).map_err(decl_err)?;
                    }
                    functions.push(id);
                    script_entries.push(index);
                }
                FunctionBodyImage::Import => {
                    let id = self
                        .resolve_import(object_type, &parsed.name, &signature.params)
                        .ok_or_else(|| VerifyError::UnknownImport(decl_src.to_string()))?;
                    functions.push(id);
                }
            }
        }

        for (class, &type_id) in image.classes.iter().zip(&class_ids) {
            let mut fields = Vec::with_capacity(class.fields.len());
            for &pooled in &class.fields {
                let field_src = pool_name(&image.names, pooled)?;
                let parsed_field = parse_property_decl(field_src).map_err(decl_err)?;
                let resolved = self
                    .registry
                    .resolve_creating(&parsed_field.ty)
                    .map_err(decl_err)?;
                fields.push(FieldDef {
                    name: parsed_field.name,
                    ty: resolved.id,
                    is_handle: resolved.is_handle,
                });
            }
            let destructor = match class.destructor {
                Some(index) => Some(functions.get(index as usize).copied().ok_or_else(|| {
                    VerifyError::BadDeclaration("destructor index out of range".into())
                })?),
                None => None,
            };
            self.registry
                .set_script_class_body(type_id, fields, destructor)
                .map_err(decl_err)?;
        }

        // The whole unit reaches its cycle-capability fixed point at
        // once; declaration order inside the unit cannot matter.
        self.registry.resolve_unit_cycles(&class_ids);

        let mut globals = Vec::with_capacity(image.globals.len());
        for global in &image.globals {
            let global_src = pool_name(&image.names, global.decl)?;
            let parsed_global = parse_property_decl(global_src).map_err(decl_err)?;
            let ty = self
                .registry
                .resolve_creating(&parsed_global.ty)
                .map_err(decl_err)?;
            let slot = self.globals.len();
            self.globals.push(GlobalVar {
                name: parsed_global.name,
                ty,
                value: init_value(global.init),
                module: Some(module_id),
            });
            globals.push(slot);
        }

        let type_facts: Vec<TypeFacts> = types.iter().map(|&id| self.type_facts(id)).collect();
        let call_infos: Vec<CallInfo> = functions
            .iter()
            .map(|&id| {
                let desc = self.function(id);
                CallInfo {
                    params: desc.map(|d| d.param_count() as u32).unwrap_or(0),
                    returns_value: desc.map(|d| !d.signature.ret.is_void()).unwrap_or(false),
                    is_method: desc.map(|d| d.object_type.is_some()).unwrap_or(false),
                }
            })
            .collect();
        for &index in &script_entries {
            let id = functions[index];
            let script = self
                .function(id)
                .and_then(|d| d.script_code_arc())
                .ok_or_else(|| VerifyError::BadDeclaration("script body missing".into()))?;
            let ret_pops = self
                .function(id)
                .map(|d| !d.signature.ret.is_void() as u32)
                .unwrap_or(0);
            verify_function(
                &script.code,
                &script.locals,
                ret_pops,
                image.globals.len() as u32,
                &type_facts,
                &call_infos,
                image.names.len() as u32,
            )?;
        }

        let mut entry_points = HashMap::new();
        for (symbol, &index) in &image.entry_points {
            let id = *functions.get(index as usize).ok_or_else(|| {
                VerifyError::BadDeclaration(format!("entry '{}' index out of range", symbol))
            })?;
            entry_points.insert(symbol.clone(), id);
        }

        Ok(InstalledModule {
            id: module_id,
            name: image.name.clone(),
            types,
            functions,
            globals,
            entry_points,
            messages: image.names.clone(),
        })
    }

    fn resolve_import(
        &self,
        object_type: Option<TypeId>,
        name: &str,
        params: &[ResolvedType],
    ) -> Option<FunctionId> {
        match object_type {
            Some(type_id) => self
                .registry
                .get(type_id)?
                .methods
                .iter()
                .copied()
                .find(|&fid| {
                    self.function(fid)
                        .is_some_and(|f| f.name == name && params_match(&f.signature.params, params))
                }),
            None => self
                .functions
                .iter()
                .flatten()
                .find(|f| {
                    f.object_type.is_none()
                        && f.module.is_none()
                        && f.name == name
                        && params_match(&f.signature.params, params)
                })
                .map(|f| f.id),
        }
    }

    fn type_facts(&self, type_id: TypeId) -> TypeFacts {
        let Some(desc) = self.registry.get(type_id) else {
            return TypeFacts {
                name: "?".to_string(),
                instantiable: false,
                assignable: false,
            };
        };
        let instantiable = match &desc.kind {
            TypeKind::ScriptClass { .. } => true,
            TypeKind::Registered | TypeKind::TemplateInstance { .. } => {
                desc.flags.is_value() || self.behavior_of(type_id, Behavior::Factory).is_some()
            }
            _ => false,
        };
        let assignable = desc.is_script_class()
            || (desc.flags.is_value() && desc.flags.is_pod())
            || self.behavior_of(type_id, Behavior::Assign).is_some();
        TypeFacts {
            name: desc.name.clone(),
            instantiable,
            assignable,
        }
    }

    /// Drops a module: its functions disappear from the engine, its
    /// globals are released. Class descriptors stay behind because
    /// instances can outlive the module.
    pub fn discard_module(&mut self, module_id: u32) -> bool {
        let Some(slot) = self.modules.get_mut(module_id as usize) else {
            return false;
        };
        let Some(module) = slot.take() else {
            return false;
        };
        for &function in &module.functions {
            if let Some(cell) = self.functions.get_mut(function.index()) {
                if cell.as_ref().is_some_and(|f| f.module == Some(module_id)) {
                    *cell = None;
                }
            }
        }
        let mut dropped = Vec::new();
        for &slot in &module.globals {
            if let Some(global) = self.globals.get_mut(slot) {
                dropped.push(std::mem::replace(&mut global.value, Value::Void));
            }
        }
        for value in dropped {
            self.release_value(value);
        }
        log::debug!("module '{}' discarded", module.name);
        true
    }

    pub fn module(&self, module_id: u32) -> Option<&InstalledModule> {
        self.modules.get(module_id as usize)?.as_ref()
    }

    pub fn module_by_name(&self, name: &str) -> Option<&InstalledModule> {
        self.modules
            .iter()
            .flatten()
            .find(|m| m.name == name)
    }

    pub fn entry_point(&self, module_id: u32, name: &str) -> Option<FunctionId> {
        self.module(module_id)?.entry_point(name)
    }

    pub(crate) fn module_function(&self, module_id: u32, index: u32) -> Option<FunctionId> {
        self.module(module_id)?.functions.get(index as usize).copied()
    }

    pub(crate) fn module_type(&self, module_id: u32, index: u32) -> Option<TypeId> {
        self.module(module_id)?.types.get(index as usize).copied()
    }

    pub(crate) fn module_global_slot(&self, module_id: u32, index: u32) -> Option<usize> {
        self.module(module_id)?.globals.get(index as usize).copied()
    }

    pub(crate) fn module_message(&self, module_id: u32, index: u32) -> Option<String> {
        self.module(module_id)?
            .messages
            .get(index)
            .map(str::to_string)
    }

    // ---- 宿主调用 ----

    pub(crate) fn call_host(
        &mut self,
        function: FunctionId,
        object: Option<ObjectHandle>,
        args: &[Value],
    ) -> Result<HostCallResult, RuntimeError> {
        self.call_host_mode(function, object, args, GenericMode::Call)
    }

    fn call_host_mode(
        &mut self,
        function: FunctionId,
        object: Option<ObjectHandle>,
        args: &[Value],
        mode: GenericMode,
    ) -> Result<HostCallResult, RuntimeError> {
        let target = {
            let desc = self
                .function(function)
                .ok_or_else(|| RuntimeError::UnknownEntity(format!("function #{}", function.0)))?;
            match &desc.body {
                FunctionBody::Script(_) => {
                    return Err(RuntimeError::InvalidOperation(format!(
                        "'{}' is not a host function",
                        desc.name
                    )))
                }
                FunctionBody::Generic(entry) => HostTarget::Generic(*entry),
                FunctionBody::Native(call) => HostTarget::Native(call.clone(), desc.signature.ret),
            }
        };
        match target {
            HostTarget::Generic(entry) => {
                let outcome = dispatch_generic(self, entry, function, object, args, mode)?;
                Ok(HostCallResult {
                    ret: outcome.ret,
                    suspend: outcome.suspend,
                    outs: Vec::new(),
                    enumerated: outcome.enumerated,
                })
            }
            HostTarget::Native(call, ret_type) => {
                let (outcome, outs) = call.invoke(&self.heap, object, args)?;
                let ret = match outcome {
                    NativeOutcome::Value(value) => value,
                    NativeOutcome::Pointer(address) => {
                        self.adopt_returned_pointer(ret_type, address)?
                    }
                };
                Ok(HostCallResult {
                    ret,
                    suspend: false,
                    outs,
                    enumerated: Vec::new(),
                })
            }
        }
    }

    fn adopt_returned_pointer(
        &mut self,
        ret: ResolvedType,
        address: usize,
    ) -> Result<Value, RuntimeError> {
        if address == 0 {
            return Ok(Value::Null);
        }
        let handle = self.adopt_extern(ret.id, address)?;
        Ok(Value::Object(handle))
    }

    // ---- 回收 ----

    /// Runs a collection request. `GC_FULL_CYCLE` drives detection to
    /// completion, `GC_ONE_STEP` advances one unit of work. Requests
    /// made while a pass is already running on this engine are
    /// absorbed.
    pub fn garbage_collect(&mut self, flags: u32) -> Result<(), RuntimeError> {
        let Some(mut collector) = self.collector.take() else {
            log::trace!("nested collection request absorbed");
            return Ok(());
        };
        let result = collector.run(self, flags);
        self.collector = Some(collector);
        result
    }

    /// Exact collector counters. `current_size` and `new_objects`
    /// count enrolled candidates, the totals are lifetime sums.
    pub fn gc_statistics(&self) -> GcStatistics {
        let current_size = self.heap.enrolled_count() as u32;
        match &self.collector {
            Some(collector) => {
                let new_objects = self
                    .gc_table
                    .iter()
                    .filter(|&&handle| {
                        self.heap
                            .get(handle)
                            .is_some_and(|e| e.enrolled && e.seq > collector.last_detect_seq)
                    })
                    .count() as u32;
                GcStatistics {
                    current_size,
                    total_destroyed: collector.total_destroyed,
                    total_detected: collector.total_detected,
                    new_objects,
                    total_new_destroyed: collector.total_new_destroyed,
                }
            }
            None => GcStatistics {
                current_size,
                total_destroyed: 0,
                total_detected: 0,
                new_objects: 0,
                total_new_destroyed: 0,
            },
        }
    }

    pub fn gc_candidate_count(&self) -> usize {
        self.gc_table.len()
    }

    /// Inspects one candidate-table entry, for leak reports.
    pub fn object_in_gc(&self, index: usize) -> Option<GcObjectInfo> {
        let handle = *self.gc_table.get(index)?;
        let entry = self.heap.get(handle)?;
        if !entry.enrolled {
            return None;
        }
        Some(GcObjectInfo {
            seq: entry.seq,
            handle,
            type_id: entry.type_id,
        })
    }

    /// Invoked once per detected cycle member, before it is destroyed.
    pub fn set_circular_ref_callback(&mut self, callback: CircularRefCallback) {
        match &mut self.collector {
            Some(collector) => collector.callback = Some(callback),
            None => log::warn!("collector busy; circular-ref callback not installed"),
        }
    }

    pub fn clear_circular_ref_callback(&mut self) {
        if let Some(collector) = &mut self.collector {
            collector.callback = None;
        }
    }

    fn enroll_in_gc(&mut self, handle: ObjectHandle) {
        if self.heap.set_enrolled(handle, true).is_ok() {
            self.gc_table.push(handle);
            log::trace!("{} enrolled for cycle detection", handle);
            if self.auto_garbage_collect {
                if let Err(err) =
                    self.garbage_collect(GC_ONE_STEP | GC_DETECT_GARBAGE | GC_DESTROY_GARBAGE)
                {
                    log::warn!("auto collection step failed: {}", err);
                }
            }
        }
    }

    pub(crate) fn purge_gc_table(&mut self) {
        let heap = &self.heap;
        self.gc_table
            .retain(|&handle| heap.get(handle).is_some_and(|e| e.enrolled));
    }

    pub(crate) fn gc_table_snapshot(&self) -> Vec<ObjectHandle> {
        self.gc_table.clone()
    }

    pub fn object_refcount(&self, handle: ObjectHandle) -> Option<u32> {
        self.heap.get(handle).map(|e| e.refcount)
    }

    pub(crate) fn set_gc_mark(&mut self, handle: ObjectHandle, mark: bool) {
        if let Some(entry) = self.heap.get_mut(handle) {
            entry.gc_flag = mark;
        }
    }

    pub(crate) fn gc_mark(&self, handle: ObjectHandle) -> bool {
        self.heap.get(handle).is_some_and(|e| e.gc_flag)
    }

    pub(crate) fn is_enrolled(&self, handle: ObjectHandle) -> bool {
        self.heap.get(handle).is_some_and(|e| e.enrolled)
    }

    pub(crate) fn object_seq(&self, handle: ObjectHandle) -> Option<u32> {
        self.heap.get(handle).map(|e| e.seq)
    }

    pub(crate) fn object_type(&self, handle: ObjectHandle) -> Option<TypeId> {
        self.heap.get(handle).map(|e| e.type_id)
    }

    pub(crate) fn heap_last_seq(&self) -> u32 {
        self.heap.last_seq()
    }

    /// The references an object holds, for the counting passes. Script
    /// bodies are scanned directly, host types answer through their
    /// enumeration behavior.
    pub(crate) fn enumerate_object_refs(
        &mut self,
        handle: ObjectHandle,
    ) -> Result<Vec<ObjectHandle>, RuntimeError> {
        let (is_script, type_id) = {
            let entry = self.heap.entry(handle)?;
            (matches!(entry.body, ObjectBody::Script(_)), entry.type_id)
        };
        if is_script {
            return Ok(lifecycle::scan_outgoing(&self.heap, handle));
        }
        match self.behavior_of(type_id, Behavior::EnumRefs) {
            Some(enum_refs) => {
                let call =
                    self.call_host_mode(enum_refs, Some(handle), &[], GenericMode::EnumRefs)?;
                Ok(call.enumerated)
            }
            None => Ok(Vec::new()),
        }
    }

    /// Forced teardown of an identified cycle member: destructor first,
    /// then its outgoing references are cleared and released, then the
    /// slot goes away regardless of the remaining count. Faults are
    /// contained so the rest of the batch still completes.
    pub(crate) fn destroy_cycle_member(&mut self, handle: ObjectHandle) {
        let Some(entry) = self.heap.get_mut(handle) else {
            return;
        };
        if entry.destroying {
            return;
        }
        entry.destroying = true;
        let type_id = entry.type_id;
        let (script_dtor, release_refs) = {
            let desc = self.registry.get(type_id);
            (
                desc.and_then(|d| d.script_destructor()),
                desc.and_then(|d| d.behavior(Behavior::ReleaseRefs)),
            )
        };
        if let Some(destructor) = script_dtor {
            self.run_script_destructor(handle, destructor);
        }
        if let Some(release_refs) = release_refs {
            if let Err(err) =
                self.call_host_mode(release_refs, Some(handle), &[], GenericMode::ReleaseRefs)
            {
                log::warn!(
                    "releaserefs behaviour of '{}' failed: {}",
                    self.type_name(type_id),
                    err
                );
            }
        }
        for target in lifecycle::drain_outgoing(&mut self.heap, handle) {
            self.release_value(Value::Object(target));
        }
        self.heap.free(handle);
        log::debug!("cycle member {} destroyed", handle);
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let globals: Vec<Value> = self
            .globals
            .iter_mut()
            .map(|g| std::mem::replace(&mut g.value, Value::Void))
            .collect();
        for value in globals {
            self.release_value(value);
        }
        if let Err(err) = self.garbage_collect(GC_FULL_CYCLE | GC_DETECT_GARBAGE | GC_DESTROY_GARBAGE)
        {
            log::warn!("final collection failed: {}", err);
        }
        if self.heap.live_count() > 0 {
            log::debug!(
                "{} objects still live at engine teardown",
                self.heap.live_count()
            );
        }
    }
}

fn params_match(a: &[ResolvedType], b: &[ResolvedType]) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b)
            .all(|(x, y)| x.id == y.id && x.is_handle == y.is_handle)
}

fn field_default(field: &FieldDef) -> Value {
    if field.is_handle {
        return Value::Null;
    }
    primitive_default(field.ty)
}

fn primitive_default(id: TypeId) -> Value {
    match id {
        TypeId::BOOL => Value::Bool(false),
        TypeId::INT8 | TypeId::INT16 | TypeId::INT32 | TypeId::INT64 => Value::Int(0),
        TypeId::UINT8 | TypeId::UINT16 | TypeId::UINT32 | TypeId::UINT64 => Value::Uint(0),
        TypeId::FLOAT => Value::Float(0.0),
        TypeId::DOUBLE => Value::Double(0.0),
        _ => Value::Null,
    }
}

fn init_value(init: crate::vm::module::InitValue) -> Value {
    use crate::vm::module::InitValue;
    match init {
        InitValue::Null => Value::Null,
        InitValue::Bool(v) => Value::Bool(v),
        InitValue::Int(v) => Value::Int(v),
        InitValue::Uint(v) => Value::Uint(v),
        InitValue::Float(v) => Value::Float(v),
        InitValue::Double(v) => Value::Double(v),
    }
}

fn pool_name(names: &NamePool, index: u32) -> Result<&str, VerifyError> {
    names
        .get(index)
        .ok_or_else(|| VerifyError::BadDeclaration(format!("name pool index {} out of range", index)))
}

fn decl_err(err: RegisterError) -> VerifyError {
    VerifyError::BadDeclaration(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::generic::GenericCall;
    use crate::runtime::ContextError;
    use crate::vm::context::LineDirective;
    use crate::vm::instruction::Instruction;
    use crate::vm::module::{CodeBuilder, InitValue};
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

    struct Widget {
        #[allow(dead_code)]
        stored: i64,
    }

    fn widget_factory(call: &mut GenericCall<'_>) -> Result<(), RuntimeError> {
        call.set_return_new_object(Box::new(Widget { stored: 0 }))?;
        Ok(())
    }

    fn noop_behavior(_call: &mut GenericCall<'_>) -> Result<(), RuntimeError> {
        Ok(())
    }

    /// Engine with one counted host reference type, auto collection off.
    fn counted_engine() -> Engine {
        let mut engine = Engine::new();
        engine.set_property(EngineProperty::AutoGarbageCollect, 0);
        engine
            .register_object_type("widget", 0, TypeFlags::REFERENCE)
            .unwrap();
        engine
            .register_object_behavior(
                "widget",
                Behavior::Factory,
                "widget@ f()",
                HostEntry::Generic(widget_factory),
                CallConvention::Generic,
            )
            .unwrap();
        engine
            .register_object_behavior(
                "widget",
                Behavior::AddRef,
                "void f()",
                HostEntry::Generic(noop_behavior),
                CallConvention::Generic,
            )
            .unwrap();
        engine
            .register_object_behavior(
                "widget",
                Behavior::Release,
                "void f()",
                HostEntry::Generic(noop_behavior),
                CallConvention::Generic,
            )
            .unwrap();
        engine
    }

    /// Engine with a script class `node { node@ next; }` installed.
    fn node_engine() -> (Engine, TypeId) {
        let mut engine = Engine::new();
        engine.set_property(EngineProperty::AutoGarbageCollect, 0);
        engine.finalize();
        let mut image = ModuleImage::new("nodes");
        image.add_class("node", true, &["node@ next"], None);
        engine.install_module(&image).unwrap();
        let node = engine.type_id("node").unwrap();
        (engine, node)
    }

    /// Two nodes pointing at each other, one external reference each.
    fn linked_pair(engine: &mut Engine, node: TypeId) -> (ObjectHandle, ObjectHandle) {
        let a = engine.instantiate(node).unwrap().as_object().unwrap();
        let b = engine.instantiate(node).unwrap().as_object().unwrap();
        engine.addref_object(b).unwrap();
        engine.write_script_field(a, 0, Value::Object(b)).unwrap();
        engine.addref_object(a).unwrap();
        engine.write_script_field(b, 0, Value::Object(a)).unwrap();
        (a, b)
    }

    /// `int sum_below(int n)`: sums 0..n with a counted loop, one line
    /// table entry per source "line" so line callbacks fire.
    fn sums_module() -> ModuleImage {
        let mut image = ModuleImage::new("sums");
        let mut code = CodeBuilder::new();
        code.push_int(0).op1(Instruction::StoreVar, 1);
        code.push_int(0).op1(Instruction::StoreVar, 2);
        let top = code.pc();
        code.op1(Instruction::LoadVar, 2)
            .op1(Instruction::LoadVar, 0)
            .op(Instruction::CmpLt);
        let exit = code.jump_slot(Instruction::JumpIfFalse);
        code.op1(Instruction::LoadVar, 1)
            .op1(Instruction::LoadVar, 2)
            .op(Instruction::Add)
            .op1(Instruction::StoreVar, 1);
        let step = code.pc();
        code.op1(Instruction::LoadVar, 2)
            .push_int(1)
            .op(Instruction::Add)
            .op1(Instruction::StoreVar, 2);
        code.op1(Instruction::Jump, top);
        let done = code.pc();
        code.patch(exit, done);
        code.op1(Instruction::LoadVar, 1).op(Instruction::Ret);
        let vars = vec![
            image.local("int n", 0, 0, 100),
            image.local("int acc", 1, 0, 100),
            image.local("int i", 2, 0, 100),
        ];
        let f = image.add_script_function(
            "int sum_below(int)",
            None,
            code.finish(),
            vars,
            vec![(0, 1), (top, 2), (step, 3), (done, 4)],
        );
        image.add_entry("sum_below", f);
        image
    }

    fn run_sum(engine: &mut Engine, entry: FunctionId, n: i64) -> i64 {
        let mut ctx = engine.create_context();
        ctx.prepare(engine, entry).unwrap();
        ctx.set_arg_int(0, n).unwrap();
        assert_eq!(ctx.execute(engine).unwrap(), ContextState::Finished);
        ctx.return_int().unwrap()
    }

    #[test]
    fn test_engine_property_round_trip() {
        let mut engine = Engine::new();
        engine.set_property(EngineProperty::InitialStackSize, 64);
        engine.set_property(EngineProperty::MaxStackSize, 512);
        engine.set_property(EngineProperty::MaxCallDepth, 10);
        engine.set_property(EngineProperty::AutoGarbageCollect, 0);
        assert_eq!(engine.property(EngineProperty::InitialStackSize), 64);
        assert_eq!(engine.property(EngineProperty::MaxStackSize), 512);
        assert_eq!(engine.property(EngineProperty::MaxCallDepth), 10);
        assert_eq!(engine.property(EngineProperty::AutoGarbageCollect), 0);
    }

    #[test]
    fn test_property_registration_rules() {
        let mut engine = counted_engine();
        engine
            .register_object_property("widget", "int stored", 0)
            .unwrap();
        let err = engine
            .register_object_property("widget", "double stored", 8)
            .unwrap_err();
        assert!(matches!(err, RegisterError::AlreadyRegistered(_)));

        engine
            .register_object_type("vec3", 12, TypeFlags::VALUE | TypeFlags::POD)
            .unwrap();
        engine
            .register_object_property("vec3", "float x", 0)
            .unwrap();
        let err = engine
            .register_object_property("vec3", "double w", 8)
            .unwrap_err();
        assert!(matches!(err, RegisterError::InvalidDeclaration(_)));
    }

    #[test]
    fn test_global_property_registration() {
        let mut engine = Engine::new();
        let slot = engine
            .register_global_property("int tuning", Value::Int(9))
            .unwrap();
        assert_eq!(engine.global_by_name("tuning"), Some(slot));
        assert_eq!(engine.global_value(slot), Some(Value::Int(9)));
        engine.set_global_value(slot, Value::Int(11)).unwrap();
        assert_eq!(engine.global_value(slot), Some(Value::Int(11)));
        let err = engine
            .register_global_property("int tuning", Value::Int(0))
            .unwrap_err();
        assert!(matches!(err, RegisterError::AlreadyRegistered(_)));
        assert!(engine.set_global_value(999, Value::Int(0)).is_err());
    }

    static METER_UP: AtomicUsize = AtomicUsize::new(0);
    static METER_DOWN: AtomicUsize = AtomicUsize::new(0);

    fn meter_addref(_call: &mut GenericCall<'_>) -> Result<(), RuntimeError> {
        METER_UP.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn meter_release(_call: &mut GenericCall<'_>) -> Result<(), RuntimeError> {
        METER_DOWN.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    #[test]
    fn test_refcount_traffic_notifies_host() {
        let mut engine = Engine::new();
        engine.set_property(EngineProperty::AutoGarbageCollect, 0);
        let meter = engine
            .register_object_type("meter", 0, TypeFlags::REFERENCE)
            .unwrap();
        engine
            .register_object_behavior(
                "meter",
                Behavior::Factory,
                "meter@ f()",
                HostEntry::Generic(widget_factory),
                CallConvention::Generic,
            )
            .unwrap();
        engine
            .register_object_behavior(
                "meter",
                Behavior::AddRef,
                "void f()",
                HostEntry::Generic(meter_addref),
                CallConvention::Generic,
            )
            .unwrap();
        engine
            .register_object_behavior(
                "meter",
                Behavior::Release,
                "void f()",
                HostEntry::Generic(meter_release),
                CallConvention::Generic,
            )
            .unwrap();
        engine.finalize();

        let h = engine.instantiate(meter).unwrap().as_object().unwrap();
        // The factory's initial reference is not addref traffic.
        assert_eq!(METER_UP.load(Ordering::SeqCst), 0);
        for _ in 0..3 {
            engine.addref_object(h).unwrap();
        }
        assert_eq!(engine.object_refcount(h), Some(4));
        assert_eq!(METER_UP.load(Ordering::SeqCst), 3);
        for _ in 0..4 {
            engine.release_object(h).unwrap();
        }
        assert_eq!(METER_DOWN.load(Ordering::SeqCst), 4);
        assert_eq!(engine.live_objects(), 0);
        assert_eq!(engine.object_refcount(h), None);
    }

    #[test]
    fn test_release_to_zero_destroys() {
        let mut engine = counted_engine();
        let widget = engine.type_id("widget").unwrap();
        let h = engine.instantiate(widget).unwrap().as_object().unwrap();
        assert_eq!(engine.object_refcount(h), Some(1));
        assert_eq!(engine.live_objects(), 1);
        engine.addref_object(h).unwrap();
        engine.release_object(h).unwrap();
        assert_eq!(engine.object_refcount(h), Some(1));
        engine.release_object(h).unwrap();
        assert_eq!(engine.live_objects(), 0);
        assert!(engine.heap().get(h).is_none());
    }

    #[test]
    fn test_incomplete_type_faults_first_instantiation() {
        let mut engine = Engine::new();
        let halfbaked = engine
            .register_object_type("halfbaked", 0, TypeFlags::REFERENCE)
            .unwrap();
        engine
            .register_object_behavior(
                "halfbaked",
                Behavior::Factory,
                "halfbaked@ f()",
                HostEntry::Generic(widget_factory),
                CallConvention::Generic,
            )
            .unwrap();
        let err = engine.instantiate(halfbaked).unwrap_err();
        assert_eq!(err, RuntimeError::InvalidConfiguration);
        assert_eq!(
            err.to_string(),
            "Invalid configuration. Verify the registered application interface."
        );
    }

    #[test]
    fn test_pod_value_assignment_copies_bytes() {
        let mut engine = Engine::new();
        let pair = engine
            .register_object_type("pair64", 16, TypeFlags::VALUE | TypeFlags::POD)
            .unwrap();
        engine.finalize();
        let a = engine.instantiate(pair).unwrap().as_object().unwrap();
        let b = engine.instantiate(pair).unwrap().as_object().unwrap();
        match &mut engine.heap_mut().entry_mut(a).unwrap().body {
            ObjectBody::Raw(bytes) => bytes.copy_from_slice(&[7u8; 16]),
            _ => unreachable!(),
        }
        engine.assign_value(pair, b, a).unwrap();
        match &engine.heap().entry(b).unwrap().body {
            ObjectBody::Raw(bytes) => assert!(bytes.iter().all(|&x| x == 7)),
            _ => unreachable!(),
        }
        engine.release_object(a).unwrap();
        engine.release_object(b).unwrap();
        assert_eq!(engine.live_objects(), 0);
    }

    #[test]
    fn test_acyclic_instance_destroyed_without_collector() {
        let mut engine = Engine::new();
        engine.finalize();
        let mut image = ModuleImage::new("leaves");
        image.add_class("leaf", true, &["int tally"], None);
        engine.install_module(&image).unwrap();
        let leaf = engine.type_id("leaf").unwrap();
        assert!(!engine.registry().get(leaf).unwrap().flags.is_gc());
        let h = engine.instantiate(leaf).unwrap().as_object().unwrap();
        assert_eq!(engine.gc_statistics().current_size, 0);
        engine.release_object(h).unwrap();
        assert_eq!(engine.live_objects(), 0);
    }

    #[test]
    fn test_cycle_flags_order_independent() {
        let mut forward = ModuleImage::new("chain");
        forward.add_class("alpha", true, &["beta@ n"], None);
        forward.add_class("beta", true, &["gamma@ n"], None);
        forward.add_class("gamma", true, &["alpha@ n"], None);
        let mut backward = ModuleImage::new("chain");
        backward.add_class("gamma", true, &["alpha@ n"], None);
        backward.add_class("beta", true, &["gamma@ n"], None);
        backward.add_class("alpha", true, &["beta@ n"], None);
        for image in [&forward, &backward] {
            let mut engine = Engine::new();
            engine.finalize();
            engine.install_module(image).unwrap();
            for name in ["alpha", "beta", "gamma"] {
                let tid = engine.type_id(name).unwrap();
                assert!(
                    engine.registry().get(tid).unwrap().flags.is_gc(),
                    "{} should be cycle-capable",
                    name
                );
            }
        }
    }

    #[test]
    fn test_script_cycle_reclaimed_by_full_pass() {
        let (mut engine, node) = node_engine();
        assert!(engine.registry().get(node).unwrap().flags.is_gc());
        let (a, b) = linked_pair(&mut engine, node);

        let before = engine.gc_statistics();
        assert_eq!(before.current_size, 2);
        assert_eq!(before.new_objects, 2);

        engine.release_object(a).unwrap();
        engine.release_object(b).unwrap();
        // Still referencing each other: reachable only from the cycle.
        assert_eq!(engine.live_objects(), 2);

        engine
            .garbage_collect(GC_FULL_CYCLE | GC_DETECT_GARBAGE | GC_DESTROY_GARBAGE)
            .unwrap();
        assert_eq!(engine.live_objects(), 0);

        let after = engine.gc_statistics();
        assert_eq!(after.current_size, 0);
        assert_eq!(after.total_detected, 2);
        assert_eq!(after.total_destroyed, 2);
        assert_eq!(after.total_new_destroyed, 2);
        assert_eq!(after.new_objects, 0);
    }

    #[test]
    fn test_three_node_ring_statistics() {
        let (mut engine, node) = node_engine();
        let a = engine.instantiate(node).unwrap().as_object().unwrap();
        let b = engine.instantiate(node).unwrap().as_object().unwrap();
        let c = engine.instantiate(node).unwrap().as_object().unwrap();
        for (from, to) in [(a, b), (b, c), (c, a)] {
            engine.addref_object(to).unwrap();
            engine.write_script_field(from, 0, Value::Object(to)).unwrap();
        }

        let before = engine.gc_statistics();
        assert_eq!(
            (before.current_size, before.total_destroyed, before.total_detected),
            (3, 0, 0)
        );

        for handle in [a, b, c] {
            engine.release_object(handle).unwrap();
        }
        engine
            .garbage_collect(GC_FULL_CYCLE | GC_DETECT_GARBAGE | GC_DESTROY_GARBAGE)
            .unwrap();

        let after = engine.gc_statistics();
        assert_eq!(
            (after.current_size, after.total_destroyed, after.total_detected),
            (0, 3, 3)
        );
        assert_eq!(engine.live_objects(), 0);
    }

    #[test]
    fn test_externally_held_cycle_survives_detection() {
        let (mut engine, node) = node_engine();
        let (a, b) = linked_pair(&mut engine, node);
        engine.release_object(b).unwrap();
        // `a` still has its external reference.
        engine
            .garbage_collect(GC_FULL_CYCLE | GC_DETECT_GARBAGE | GC_DESTROY_GARBAGE)
            .unwrap();
        assert_eq!(engine.live_objects(), 2);
        assert_eq!(engine.gc_statistics().total_destroyed, 0);
        engine.release_object(a).unwrap();
        engine
            .garbage_collect(GC_FULL_CYCLE | GC_DETECT_GARBAGE | GC_DESTROY_GARBAGE)
            .unwrap();
        assert_eq!(engine.live_objects(), 0);
    }

    #[test]
    fn test_circular_ref_callback_reports_members() {
        let (mut engine, node) = node_engine();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        engine.set_circular_ref_callback(Box::new(move |_, tid, _| {
            if tid == node {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        }));
        let (a, b) = linked_pair(&mut engine, node);
        engine.release_object(a).unwrap();
        engine.release_object(b).unwrap();
        engine
            .garbage_collect(GC_FULL_CYCLE | GC_DETECT_GARBAGE | GC_DESTROY_GARBAGE)
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        engine.clear_circular_ref_callback();
    }

    #[test]
    fn test_destructor_exception_contained() {
        let mut engine = Engine::new();
        engine.set_property(EngineProperty::AutoGarbageCollect, 0);
        engine.finalize();
        let mut image = ModuleImage::new("noisies");
        let msg = image.intern("dying loudly");
        let mut code = CodeBuilder::new();
        code.op1(Instruction::Throw, msg);
        let die = image.add_script_function("void die()", Some("noisy"), code.finish(), vec![], vec![(0, 1)]);
        image.add_class("noisy", true, &["int x"], Some(die));
        engine.install_module(&image).unwrap();
        let noisy = engine.type_id("noisy").unwrap();
        for _ in 0..2 {
            let h = engine.instantiate(noisy).unwrap().as_object().unwrap();
            engine.release_object(h).unwrap();
        }
        assert_eq!(engine.live_objects(), 0);
    }

    #[test]
    fn test_incremental_collection_from_line_callback() {
        let (mut engine, node) = node_engine();
        let mid = engine.install_module(&sums_module()).unwrap();
        let entry = engine.entry_point(mid, "sum_below").unwrap();
        let (a, b) = linked_pair(&mut engine, node);
        engine.release_object(a).unwrap();
        engine.release_object(b).unwrap();
        assert_eq!(engine.live_objects(), 2);

        let mut ctx = engine.create_context();
        ctx.prepare(&mut engine, entry).unwrap();
        ctx.set_arg_int(0, 10).unwrap();
        ctx.set_line_callback(Box::new(|engine, _, _| {
            let _ = engine.garbage_collect(GC_ONE_STEP | GC_DETECT_GARBAGE | GC_DESTROY_GARBAGE);
            LineDirective::Continue
        }));
        assert_eq!(ctx.execute(&mut engine).unwrap(), ContextState::Finished);
        assert_eq!(ctx.return_int(), Some(45));
        assert_eq!(engine.live_objects(), 0);
        assert_eq!(engine.gc_statistics().total_destroyed, 2);
    }

    #[test]
    fn test_module_rejection_leaves_no_residue() {
        let mut engine = counted_engine();
        engine.finalize();
        let types_before = engine.registry().len();

        let mut image = ModuleImage::new("assigns");
        image.add_class("orphan", true, &["int x"], None);
        let widget_t = image.type_ref("widget");
        let mut code = CodeBuilder::new();
        code.op1(Instruction::New, widget_t)
            .op1(Instruction::New, widget_t)
            .op1(Instruction::ValueAssign, widget_t)
            .op(Instruction::Pop)
            .op(Instruction::Ret);
        let f = image.add_script_function("void broken()", None, code.finish(), vec![], vec![(0, 1)]);
        image.add_entry("broken", f);

        let err = engine.install_module(&image).unwrap_err();
        assert!(matches!(err, VerifyError::MissingAssign(_)));
        assert_eq!(
            err.to_string(),
            "No appropriate opAssign method found in 'widget' for value assignment"
        );
        // Nothing from the rejected unit may remain behind.
        assert_eq!(engine.registry().len(), types_before);
        assert!(engine.type_id("orphan").is_none());
        assert!(engine.module_by_name("assigns").is_none());
        assert_eq!(engine.live_objects(), 0);

        // The engine is unharmed: a valid unit still installs and runs.
        let mid = engine.install_module(&sums_module()).unwrap();
        let entry = engine.entry_point(mid, "sum_below").unwrap();
        assert_eq!(run_sum(&mut engine, entry, 10), 45);
    }

    static SPAN_LIVE: AtomicI64 = AtomicI64::new(0);

    struct Span {
        total: i64,
    }

    fn span_factory(call: &mut GenericCall<'_>) -> Result<(), RuntimeError> {
        SPAN_LIVE.fetch_add(1, Ordering::SeqCst);
        call.set_return_new_object(Box::new(Span { total: 0 }))?;
        Ok(())
    }

    fn span_release(_call: &mut GenericCall<'_>) -> Result<(), RuntimeError> {
        SPAN_LIVE.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn span_add(call: &mut GenericCall<'_>) -> Result<(), RuntimeError> {
        let total = call.object_as::<Span>()?.total + call.arg_int(0)?;
        SPAN_LIVE.fetch_add(1, Ordering::SeqCst);
        call.set_return_new_object(Box::new(Span { total }))?;
        Ok(())
    }

    #[test]
    fn test_scoped_type_handles_rejected_and_counted() {
        let mut engine = Engine::new();
        engine.set_property(EngineProperty::AutoGarbageCollect, 0);
        engine
            .register_object_type("span", 0, TypeFlags::REFERENCE | TypeFlags::SCOPED)
            .unwrap();
        engine
            .register_object_behavior(
                "span",
                Behavior::Factory,
                "span f()",
                HostEntry::Generic(span_factory),
                CallConvention::Generic,
            )
            .unwrap();
        engine
            .register_object_behavior(
                "span",
                Behavior::Release,
                "void f()",
                HostEntry::Generic(span_release),
                CallConvention::Generic,
            )
            .unwrap();
        engine
            .register_object_method(
                "span",
                "span opAdd(int)",
                HostEntry::Generic(span_add),
                CallConvention::Generic,
            )
            .unwrap();
        engine.finalize();

        // A local declared as a handle to a scoped type is rejected.
        let mut bad = ModuleImage::new("spanhandles");
        let mut code = CodeBuilder::new();
        code.op(Instruction::PushNull)
            .op1(Instruction::StoreVar, 0)
            .op(Instruction::Ret);
        let vars = vec![bad.local("span@ s", 0, 0, 8)];
        bad.add_script_function("void leak()", None, code.finish(), vars, vec![(0, 1)]);
        let err = engine.install_module(&bad).unwrap_err();
        assert!(err
            .to_string()
            .contains("Object handle is not supported for this type"));

        // Plain scoped locals work, and `+` routes through opAdd.
        let mut image = ModuleImage::new("spans");
        let span_t = image.type_ref("span");
        let mut code = CodeBuilder::new();
        code.op1(Instruction::New, span_t)
            .op1(Instruction::StoreVar, 0)
            .op1(Instruction::LoadVar, 0)
            .push_int(10)
            .op(Instruction::Add)
            .op1(Instruction::StoreVar, 1)
            .op1(Instruction::LoadVar, 1)
            .op(Instruction::Ret);
        let vars = vec![
            image.local("span a", 0, 0, 32),
            image.local("span b", 1, 0, 32),
        ];
        let f = image.add_script_function("span measure()", None, code.finish(), vars, vec![(0, 1)]);
        image.add_entry("measure", f);
        let mid = engine.install_module(&image).unwrap();
        let entry = engine.entry_point(mid, "measure").unwrap();

        let mut ctx = engine.create_context();
        ctx.prepare(&mut engine, entry).unwrap();
        assert_eq!(ctx.execute(&mut engine).unwrap(), ContextState::Finished);
        let out = ctx.return_object().unwrap();
        assert_eq!(engine.heap().foreign::<Span>(out).unwrap().total, 10);
        // Only the returned span is still alive.
        assert_eq!(engine.live_objects(), 1);
        assert_eq!(SPAN_LIVE.load(Ordering::SeqCst), 1);
        ctx.unprepare(&mut engine).unwrap();
        assert_eq!(engine.live_objects(), 0);
        assert_eq!(SPAN_LIVE.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_suspend_resume_equivalence() {
        let mut engine = Engine::new();
        engine.finalize();
        let mid = engine.install_module(&sums_module()).unwrap();
        let entry = engine.entry_point(mid, "sum_below").unwrap();
        assert_eq!(run_sum(&mut engine, entry, 10), 45);

        let mut ctx = engine.create_context();
        ctx.prepare(&mut engine, entry).unwrap();
        ctx.set_arg_int(0, 10).unwrap();
        let mut ticks = 0u32;
        ctx.set_line_callback(Box::new(move |_, _, _| {
            ticks += 1;
            if ticks % 3 == 0 {
                LineDirective::Suspend
            } else {
                LineDirective::Continue
            }
        }));
        let mut rounds = 0;
        let mut state = ctx.execute(&mut engine).unwrap();
        while state == ContextState::Suspended {
            rounds += 1;
            state = ctx.execute(&mut engine).unwrap();
        }
        assert_eq!(state, ContextState::Finished);
        assert!(rounds > 3, "expected several suspensions, got {}", rounds);
        assert_eq!(ctx.return_int(), Some(45));
    }

    #[test]
    fn test_exception_preserves_callstack() {
        let mut engine = Engine::new();
        engine.finalize();
        let mut image = ModuleImage::new("faults");
        let mut code = CodeBuilder::new();
        code.op(Instruction::PushNull)
            .op1(Instruction::LoadField, 0)
            .op(Instruction::Ret);
        let vars = vec![
            image.local("int x", 0, 0, 8),
            image.local("int gone", 1, 0, 1),
        ];
        let faulty = image.add_script_function(
            "int faulty(int)",
            None,
            code.finish(),
            vars,
            vec![(0, 10), (1, 11)],
        );
        let mut code = CodeBuilder::new();
        code.push_int(7)
            .op1(Instruction::Call, faulty)
            .op(Instruction::Ret);
        let caller =
            image.add_script_function("int caller()", None, code.finish(), vec![], vec![(0, 20)]);
        image.add_entry("caller", caller);
        let mid = engine.install_module(&image).unwrap();
        let entry = engine.entry_point(mid, "caller").unwrap();
        let faulty_id = engine.module_function(mid, faulty).unwrap();

        let mut ctx = engine.create_context();
        ctx.prepare(&mut engine, entry).unwrap();
        assert_eq!(
            ctx.execute(&mut engine).unwrap(),
            ContextState::ExceptionRaised
        );
        assert_eq!(ctx.exception_message(), Some("Null pointer access"));
        assert_eq!(ctx.exception_function(), Some(faulty_id));
        assert_eq!(ctx.exception_line(), Some(11));

        // The whole stack stays inspectable until the next prepare.
        assert_eq!(ctx.call_depth(), 2);
        assert_eq!(ctx.function_at(0), Some(faulty_id));
        assert_eq!(ctx.function_at(1), Some(entry));
        assert_eq!(ctx.line_at(1), Some(20));
        assert_eq!(ctx.local_name(0, 0), Some("x"));
        assert_eq!(ctx.local_value(0, 0), Some(Value::Int(7)));
        assert_eq!(ctx.local_in_scope(0, 0), Some(true));
        assert_eq!(ctx.local_in_scope(0, 1), Some(false));
        let snap = ctx.stack_json(&engine);
        assert_eq!(snap["frame_0"]["function"], "caller");
        assert_eq!(snap["frame_1"]["function"], "faulty");

        ctx.unprepare(&mut engine).unwrap();
        assert_eq!(ctx.call_depth(), 0);
        assert_eq!(ctx.state(), ContextState::Uninitialized);
    }

    #[test]
    fn test_out_parameter_readback() {
        let mut engine = Engine::new();
        engine.finalize();
        let mut image = ModuleImage::new("outparams");
        let mut code = CodeBuilder::new();
        code.op1(Instruction::LoadVar, 0)
            .op1(Instruction::LoadVar, 1)
            .op(Instruction::Mod)
            .op1(Instruction::StoreVar, 2)
            .op1(Instruction::LoadVar, 0)
            .op1(Instruction::LoadVar, 1)
            .op(Instruction::Div)
            .op(Instruction::Ret);
        let vars = vec![
            image.local("int a", 0, 0, 16),
            image.local("int b", 1, 0, 16),
            image.local("int r", 2, 0, 16),
        ];
        let f = image.add_script_function(
            "int divmod(int, int, int &out)",
            None,
            code.finish(),
            vars,
            vec![(0, 1)],
        );
        image.add_entry("divmod", f);
        let mid = engine.install_module(&image).unwrap();
        let entry = engine.entry_point(mid, "divmod").unwrap();

        let mut ctx = engine.create_context();
        ctx.prepare(&mut engine, entry).unwrap();
        ctx.set_arg_int(0, 7).unwrap();
        ctx.set_arg_int(1, 3).unwrap();
        ctx.set_arg_int(2, 0).unwrap();
        assert_eq!(ctx.execute(&mut engine).unwrap(), ContextState::Finished);
        assert_eq!(ctx.return_int(), Some(2));
        assert_eq!(ctx.out_value(2), Some(Value::Int(1)));
    }

    #[test]
    fn test_integer_divide_faults() {
        let mut engine = Engine::new();
        engine.finalize();
        let mut image = ModuleImage::new("divides");
        let mut code = CodeBuilder::new();
        code.push_int(7).push_int(0).op(Instruction::Div).op(Instruction::Ret);
        let div0 = image.add_script_function("int div0()", None, code.finish(), vec![], vec![(0, 1)]);
        let mut code = CodeBuilder::new();
        code.push_int(i64::MIN)
            .push_int(-1)
            .op(Instruction::Div)
            .op(Instruction::Ret);
        let divmin =
            image.add_script_function("int divmin()", None, code.finish(), vec![], vec![(0, 1)]);
        image.add_entry("div0", div0);
        image.add_entry("divmin", divmin);
        let mid = engine.install_module(&image).unwrap();

        let div0_entry = engine.entry_point(mid, "div0").unwrap();
        let divmin_entry = engine.entry_point(mid, "divmin").unwrap();
        let mut ctx = engine.create_context();
        ctx.prepare(&mut engine, div0_entry).unwrap();
        assert_eq!(
            ctx.execute(&mut engine).unwrap(),
            ContextState::ExceptionRaised
        );
        assert_eq!(ctx.exception_message(), Some("Divide by zero"));

        // Re-preparing after an exception clears the dead frames.
        ctx.prepare(&mut engine, divmin_entry).unwrap();
        assert_eq!(
            ctx.execute(&mut engine).unwrap(),
            ContextState::ExceptionRaised
        );
        assert_eq!(ctx.exception_message(), Some("Divide overflow"));
    }

    #[test]
    fn test_runaway_recursion_overflows() {
        let mut engine = Engine::new();
        engine.set_property(EngineProperty::MaxCallDepth, 16);
        engine.finalize();
        let mut image = ModuleImage::new("towers");
        let mut code = CodeBuilder::new();
        code.op1(Instruction::LoadVar, 0)
            .push_int(1)
            .op(Instruction::Sub)
            .op1(Instruction::Call, 0)
            .op(Instruction::Ret);
        let vars = vec![image.local("int n", 0, 0, 16)];
        let f = image.add_script_function("int down(int)", None, code.finish(), vars, vec![(0, 1)]);
        image.add_entry("down", f);
        let mid = engine.install_module(&image).unwrap();
        let entry = engine.entry_point(mid, "down").unwrap();

        let mut ctx = engine.create_context();
        ctx.prepare(&mut engine, entry).unwrap();
        ctx.set_arg_int(0, 1000).unwrap();
        assert_eq!(
            ctx.execute(&mut engine).unwrap(),
            ContextState::ExceptionRaised
        );
        assert_eq!(ctx.exception_message(), Some("Stack overflow"));
        assert_eq!(ctx.call_depth(), 16);
    }

    #[test]
    fn test_abort_via_handle() {
        let mut engine = Engine::new();
        engine.finalize();
        let mid = engine.install_module(&sums_module()).unwrap();
        let entry = engine.entry_point(mid, "sum_below").unwrap();

        let mut ctx = engine.create_context();
        ctx.prepare(&mut engine, entry).unwrap();
        ctx.set_arg_int(0, 1_000_000).unwrap();
        let handle = ctx.abort_handle();
        ctx.set_line_callback(Box::new(move |_, _, _| {
            handle.abort();
            LineDirective::Continue
        }));
        assert_eq!(ctx.execute(&mut engine).unwrap(), ContextState::Aborted);
        ctx.unprepare(&mut engine).unwrap();
    }

    #[test]
    fn test_throw_surfaces_message() {
        let mut engine = Engine::new();
        engine.finalize();
        let mut image = ModuleImage::new("throws");
        let msg = image.intern("kaput");
        let mut code = CodeBuilder::new();
        code.op1(Instruction::Throw, msg);
        let f = image.add_script_function("void boom()", None, code.finish(), vec![], vec![(0, 3)]);
        image.add_entry("boom", f);
        let mid = engine.install_module(&image).unwrap();
        let entry = engine.entry_point(mid, "boom").unwrap();

        let mut ctx = engine.create_context();
        ctx.prepare(&mut engine, entry).unwrap();
        assert_eq!(
            ctx.execute(&mut engine).unwrap(),
            ContextState::ExceptionRaised
        );
        assert_eq!(ctx.exception_message(), Some("kaput"));
        assert_eq!(ctx.exception_line(), Some(3));
    }

    #[test]
    fn test_load_this_identity() {
        let mut engine = Engine::new();
        engine.finalize();
        let mut image = ModuleImage::new("selves");
        let mut code = CodeBuilder::new();
        code.op(Instruction::LoadThis).op(Instruction::Ret);
        let me = image.add_script_function(
            "selfish@ me()",
            Some("selfish"),
            code.finish(),
            vec![],
            vec![(0, 1)],
        );
        let selfish_t = image.add_class("selfish", true, &["int pad"], None);
        let mut code = CodeBuilder::new();
        code.op1(Instruction::New, selfish_t)
            .op(Instruction::Dup)
            .op1(Instruction::CallMethod, me)
            .op(Instruction::CmpEq)
            .op(Instruction::Ret);
        let f = image.add_script_function("bool same()", None, code.finish(), vec![], vec![(0, 2)]);
        image.add_entry("same", f);
        let mid = engine.install_module(&image).unwrap();
        let entry = engine.entry_point(mid, "same").unwrap();

        let mut ctx = engine.create_context();
        ctx.prepare(&mut engine, entry).unwrap();
        assert_eq!(ctx.execute(&mut engine).unwrap(), ContextState::Finished);
        assert_eq!(ctx.return_bool(), Some(true));
        assert_eq!(engine.live_objects(), 0);
    }

    #[test]
    fn test_module_globals_persist_across_runs() {
        let mut engine = Engine::new();
        engine.finalize();
        let mut image = ModuleImage::new("counters");
        image.add_global("int counter", InitValue::Int(5));
        let mut code = CodeBuilder::new();
        code.op1(Instruction::LoadGlobal, 0)
            .push_int(1)
            .op(Instruction::Add)
            .op1(Instruction::StoreGlobal, 0)
            .op(Instruction::Ret);
        let f = image.add_script_function("void bump()", None, code.finish(), vec![], vec![(0, 1)]);
        image.add_entry("bump", f);
        let mid = engine.install_module(&image).unwrap();
        let entry = engine.entry_point(mid, "bump").unwrap();

        for _ in 0..2 {
            let mut ctx = engine.create_context();
            ctx.prepare(&mut engine, entry).unwrap();
            assert_eq!(ctx.execute(&mut engine).unwrap(), ContextState::Finished);
        }
        let slot = engine.global_by_name("counter").unwrap();
        assert_eq!(engine.global_value(slot), Some(Value::Int(7)));
    }

    extern "C" fn native_mul(a: i64, b: i64) -> i64 {
        a.wrapping_mul(b)
    }

    #[test]
    fn test_native_global_function_from_script() {
        let mut engine = Engine::new();
        engine
            .register_global_function(
                "int64 mul(int64, int64)",
                HostEntry::native(native_mul as usize),
                CallConvention::Cdecl,
            )
            .unwrap();
        engine.finalize();
        let mut image = ModuleImage::new("muls");
        let mul = image.add_import("int64 mul(int64, int64)", None);
        let mut code = CodeBuilder::new();
        code.push_int(6)
            .push_int(7)
            .op1(Instruction::Call, mul)
            .op(Instruction::Ret);
        let f = image.add_script_function("int64 answer()", None, code.finish(), vec![], vec![(0, 1)]);
        image.add_entry("answer", f);
        let mid = engine.install_module(&image).unwrap();
        let entry = engine.entry_point(mid, "answer").unwrap();

        let mut ctx = engine.create_context();
        ctx.prepare(&mut engine, entry).unwrap();
        assert_eq!(ctx.execute(&mut engine).unwrap(), ContextState::Finished);
        assert_eq!(ctx.return_int(), Some(42));
    }

    fn poke_method(call: &mut GenericCall<'_>) -> Result<(), RuntimeError> {
        let v = call.arg_int(0)?;
        call.set_return_int(v * 2);
        Ok(())
    }

    #[test]
    fn test_registered_method_import() {
        let mut engine = counted_engine();
        engine
            .register_object_method(
                "widget",
                "int poke(int)",
                HostEntry::Generic(poke_method),
                CallConvention::Generic,
            )
            .unwrap();
        engine.finalize();
        let mut image = ModuleImage::new("pokes");
        let widget_t = image.type_ref("widget");
        let poke = image.add_import("int poke(int)", Some("widget"));
        let mut code = CodeBuilder::new();
        code.op1(Instruction::New, widget_t)
            .push_int(5)
            .op1(Instruction::CallMethod, poke)
            .op(Instruction::Ret);
        let f = image.add_script_function("int poked()", None, code.finish(), vec![], vec![(0, 1)]);
        image.add_entry("poked", f);
        let mid = engine.install_module(&image).unwrap();
        let entry = engine.entry_point(mid, "poked").unwrap();

        let mut ctx = engine.create_context();
        ctx.prepare(&mut engine, entry).unwrap();
        assert_eq!(ctx.execute(&mut engine).unwrap(), ContextState::Finished);
        assert_eq!(ctx.return_int(), Some(10));
        assert_eq!(engine.live_objects(), 0);
    }

    #[test]
    fn test_unknown_import_rejected() {
        let mut engine = Engine::new();
        engine.finalize();
        let mut image = ModuleImage::new("ghosts");
        image.add_import("void nothing_like_this(double)", None);
        let err = engine.install_module(&image).unwrap_err();
        assert!(matches!(err, VerifyError::UnknownImport(_)));
        assert_eq!(
            err.to_string(),
            "no registered function matches import 'void nothing_like_this(double)'"
        );
    }

    #[test]
    fn test_discard_module() {
        let mut engine = Engine::new();
        engine.finalize();
        let image = sums_module();
        let mid = engine.install_module(&image).unwrap();
        let old = engine.entry_point(mid, "sum_below").unwrap();
        assert_eq!(run_sum(&mut engine, old, 10), 45);

        assert!(engine.discard_module(mid));
        assert!(!engine.discard_module(mid));
        assert!(engine.module(mid).is_none());
        assert!(engine.entry_point(mid, "sum_below").is_none());

        let mut ctx = engine.create_context();
        assert_eq!(
            ctx.prepare(&mut engine, old),
            Err(ContextError::NotExecutable)
        );

        let again = engine.install_module(&image).unwrap();
        assert_ne!(mid, again);
        let entry = engine.entry_point(again, "sum_below").unwrap();
        assert_eq!(run_sum(&mut engine, entry, 10), 45);
    }

    #[cfg(feature = "serde_support")]
    #[test]
    fn test_module_image_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sums.svb");
        let path = path.to_str().unwrap();
        let image = sums_module();
        image.write_to_file(path).unwrap();
        let loaded = ModuleImage::read_from_file(path).unwrap();
        assert_eq!(image, loaded);

        let mut engine = Engine::new();
        engine.finalize();
        let mid = engine.install_module(&loaded).unwrap();
        let entry = engine.entry_point(mid, "sum_below").unwrap();
        assert_eq!(run_sum(&mut engine, entry, 10), 45);
    }
}
