use super::heap::ObjectHandle;
use super::RuntimeError;

/// A single operand-stack, local-variable or field slot.
///
/// Primitives are stored widened; objects are stored as arena handles
/// whose reference ownership is managed by the engine, not by `Clone`.
/// Cloning a `Value::Object` copies the handle without touching the
/// count; every code path that stores the copy retains it first.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    /// An uninitialized or freed slot.
    Void,
    /// The null handle.
    Null,
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f32),
    Double(f64),
    Object(ObjectHandle),
}

impl Default for Value {
    fn default() -> Self {
        Value::Void
    }
}

impl Value {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Void => "void",
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Uint(_) => "uint",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::Object(_) => "object",
        }
    }

    pub fn is_object(&self) -> bool {
        matches!(self, Value::Object(_))
    }

    pub fn as_object(&self) -> Option<ObjectHandle> {
        match self {
            Value::Object(h) => Some(*h),
            _ => None,
        }
    }

    /// The object behind a handle slot, faulting on null the way script
    /// dereferences do.
    pub fn expect_object(&self) -> Result<ObjectHandle, RuntimeError> {
        match self {
            Value::Object(h) => Ok(*h),
            Value::Null | Value::Void => Err(RuntimeError::NullPointerAccess),
            other => Err(RuntimeError::InvalidOperation(format!(
                "a {} is not an object",
                other.kind_name()
            ))),
        }
    }

    pub fn as_bool(&self) -> Result<bool, RuntimeError> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(RuntimeError::InvalidOperation(format!(
                "a {} is not a bool",
                other.kind_name()
            ))),
        }
    }

    pub fn as_int(&self) -> Result<i64, RuntimeError> {
        match self {
            Value::Int(v) => Ok(*v),
            Value::Uint(v) => Ok(*v as i64),
            Value::Bool(b) => Ok(*b as i64),
            other => Err(RuntimeError::InvalidOperation(format!(
                "a {} is not an integer",
                other.kind_name()
            ))),
        }
    }

    pub fn as_double(&self) -> Result<f64, RuntimeError> {
        match self {
            Value::Double(v) => Ok(*v),
            Value::Float(v) => Ok(*v as f64),
            Value::Int(v) => Ok(*v as f64),
            Value::Uint(v) => Ok(*v as f64),
            other => Err(RuntimeError::InvalidOperation(format!(
                "a {} is not a number",
                other.kind_name()
            ))),
        }
    }

    /// Whether two slots hold the same primitive value or the same object
    /// identity. Used by the comparison instructions.
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Null, Value::Null) => true,
            (Value::Null, Value::Object(_)) | (Value::Object(_), Value::Null) => false,
            (a, b) => a == b,
        }
    }
}
