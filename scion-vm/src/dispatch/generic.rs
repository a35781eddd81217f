use std::any::Any;

use crate::engine::Engine;
use crate::runtime::heap::ObjectHandle;
use crate::runtime::value::Value;
use crate::runtime::RuntimeError;
use crate::types::descriptor::FunctionId;

/// A host function using the portable convention. Reads its arguments
/// and writes its return through the accessor; faults either by
/// returning an error or by setting an exception.
pub type GenericFn = fn(&mut GenericCall<'_>) -> Result<(), RuntimeError>;

/// Why the engine is invoking the host function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenericMode {
    /// An ordinary call from script or host.
    Call,
    /// The collector asks the object to enumerate its outgoing handles
    /// through [`GenericCall::enum_reference`].
    EnumRefs,
    /// The collector asks the object to drop its outgoing handles.
    ReleaseRefs,
}

/// The opaque accessor handed to generic-convention host functions.
///
/// Arguments are pre-marshalled by slot; typed getters check the stored
/// kind and fault with a bad-argument style error instead of
/// reinterpreting memory.
pub struct GenericCall<'a> {
    engine: &'a mut Engine,
    function: FunctionId,
    object: Option<ObjectHandle>,
    args: &'a [Value],
    mode: GenericMode,
    ret: Value,
    exception: Option<String>,
    suspend: bool,
    enumerated: Vec<ObjectHandle>,
}

/// What the dispatcher hands back to the interpreter after a generic
/// call returns.
#[derive(Debug)]
pub struct GenericOutcome {
    pub ret: Value,
    pub suspend: bool,
    pub enumerated: Vec<ObjectHandle>,
}

impl<'a> GenericCall<'a> {
    pub(crate) fn new(
        engine: &'a mut Engine,
        function: FunctionId,
        object: Option<ObjectHandle>,
        args: &'a [Value],
        mode: GenericMode,
    ) -> Self {
        GenericCall {
            engine,
            function,
            object,
            args,
            mode,
            ret: Value::Void,
            exception: None,
            suspend: false,
            enumerated: Vec::new(),
        }
    }

    /// Full engine access for nested operations (allocation, lookups,
    /// even incremental collection).
    pub fn engine(&mut self) -> &mut Engine {
        self.engine
    }

    pub fn function(&self) -> FunctionId {
        self.function
    }

    pub fn mode(&self) -> GenericMode {
        self.mode
    }

    /// The instance a behavior or method call is bound to.
    pub fn object(&self) -> Result<ObjectHandle, RuntimeError> {
        self.object.ok_or_else(|| {
            RuntimeError::InvalidOperation("the call is not bound to an object".into())
        })
    }

    /// Downcasts the bound instance to its host type.
    pub fn object_as<T: 'static>(&self) -> Result<&T, RuntimeError> {
        self.engine.heap().foreign::<T>(self.object()?)
    }

    pub fn object_as_mut<T: 'static>(&mut self) -> Result<&mut T, RuntimeError> {
        let handle = self.object()?;
        self.engine.heap_mut().foreign_mut::<T>(handle)
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    fn arg(&self, index: usize) -> Result<&Value, RuntimeError> {
        self.args.get(index).ok_or_else(|| {
            RuntimeError::InvalidOperation(format!("argument {} is out of range", index))
        })
    }

    pub fn arg_bool(&self, index: usize) -> Result<bool, RuntimeError> {
        self.arg(index)?.as_bool()
    }

    pub fn arg_byte(&self, index: usize) -> Result<u8, RuntimeError> {
        Ok(self.arg(index)?.as_int()? as u8)
    }

    pub fn arg_word(&self, index: usize) -> Result<u16, RuntimeError> {
        Ok(self.arg(index)?.as_int()? as u16)
    }

    pub fn arg_dword(&self, index: usize) -> Result<u32, RuntimeError> {
        Ok(self.arg(index)?.as_int()? as u32)
    }

    pub fn arg_qword(&self, index: usize) -> Result<u64, RuntimeError> {
        Ok(self.arg(index)?.as_int()? as u64)
    }

    pub fn arg_int(&self, index: usize) -> Result<i64, RuntimeError> {
        self.arg(index)?.as_int()
    }

    pub fn arg_float(&self, index: usize) -> Result<f32, RuntimeError> {
        Ok(self.arg(index)?.as_double()? as f32)
    }

    pub fn arg_double(&self, index: usize) -> Result<f64, RuntimeError> {
        self.arg(index)?.as_double()
    }

    /// An object argument; null handles come back as `None`.
    pub fn arg_object(&self, index: usize) -> Result<Option<ObjectHandle>, RuntimeError> {
        match self.arg(index)? {
            Value::Object(h) => Ok(Some(*h)),
            Value::Null | Value::Void => Ok(None),
            other => Err(RuntimeError::InvalidOperation(format!(
                "argument {} is a {}, not an object",
                index,
                other.kind_name()
            ))),
        }
    }

    /// Downcasts an object argument to its host type.
    pub fn arg_as<T: 'static>(&self, index: usize) -> Result<&T, RuntimeError> {
        let handle = self
            .arg_object(index)?
            .ok_or(RuntimeError::NullPointerAccess)?;
        self.engine.heap().foreign::<T>(handle)
    }

    pub fn set_return_bool(&mut self, v: bool) {
        self.ret = Value::Bool(v);
    }

    pub fn set_return_int(&mut self, v: i64) {
        self.ret = Value::Int(v);
    }

    pub fn set_return_uint(&mut self, v: u64) {
        self.ret = Value::Uint(v);
    }

    pub fn set_return_float(&mut self, v: f32) {
        self.ret = Value::Float(v);
    }

    pub fn set_return_double(&mut self, v: f64) {
        self.ret = Value::Double(v);
    }

    /// Returns an existing object. The reference the caller receives is
    /// retained here; handing back a handle the host owned stays balanced.
    pub fn set_return_object(&mut self, handle: Option<ObjectHandle>) -> Result<(), RuntimeError> {
        match handle {
            Some(h) => {
                self.engine.addref_object(h)?;
                self.ret = Value::Object(h);
            }
            None => self.ret = Value::Null,
        }
        Ok(())
    }

    /// Creates and returns a fresh host instance of the function's
    /// declared return type. This is how factories hand objects out; the
    /// instance starts with the single reference the caller receives.
    pub fn set_return_new_object(&mut self, body: Box<dyn Any>) -> Result<ObjectHandle, RuntimeError> {
        let ret_type = self
            .engine
            .function(self.function)
            .ok_or_else(|| RuntimeError::UnknownEntity("function".into()))?
            .signature
            .ret
            .id;
        let handle = self.engine.adopt_foreign(ret_type, body)?;
        self.ret = Value::Object(handle);
        Ok(handle)
    }

    /// Raises a script exception from host code. The call still returns
    /// normally; the dispatcher turns this into the context's exception
    /// state.
    pub fn set_exception(&mut self, message: &str) {
        self.exception = Some(message.to_string());
    }

    /// Asks the executing context to suspend at the next safe point.
    pub fn request_suspend(&mut self) {
        self.suspend = true;
    }

    /// Reports one outgoing handle during an EnumRefs invocation.
    pub fn enum_reference(&mut self, handle: ObjectHandle) {
        self.enumerated.push(handle);
    }

    fn finish(self) -> Result<GenericOutcome, RuntimeError> {
        if let Some(message) = self.exception {
            return Err(RuntimeError::HostException(message));
        }
        Ok(GenericOutcome {
            ret: self.ret,
            suspend: self.suspend,
            enumerated: self.enumerated,
        })
    }
}

/// Invokes a generic-convention entry point and folds host-raised
/// exceptions into the error path.
pub(crate) fn dispatch_generic(
    engine: &mut Engine,
    entry: GenericFn,
    function: FunctionId,
    object: Option<ObjectHandle>,
    args: &[Value],
    mode: GenericMode,
) -> Result<GenericOutcome, RuntimeError> {
    let mut call = GenericCall::new(engine, function, object, args, mode);
    entry(&mut call)?;
    call.finish()
}
