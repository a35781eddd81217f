//! Scion 运行时模块。
//!
//! 本模块提供对象生命周期的底层设施：统一的栈值表示、带代数校验的
//! 对象堆（引用计数头、序列号、标志位）以及按类别的生命周期规则。
//!
//! # 子模块
//! - `value`：操作数栈与字段槽的统一值表示
//! - `heap`：对象堆，句柄失效可被检测而非未定义行为
//! - `lifecycle`：各类别（值、POD、计数引用、免计数、独占）的规则
//!
//! 引用计数的权威存放在堆头中；宿主注册的 addref/release 行为仍会被
//! 调用，使宿主能够观测计数流量。

pub mod heap;
pub mod lifecycle;
pub mod value;

/// Faults raised while script code or the engine machinery runs. These
/// surface through the execution context's exception state, never as a
/// process abort.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeError {
    /// Method or property access through a null handle.
    NullPointerAccess,
    /// Integer division or modulo by zero.
    DivideByZero,
    /// Signed division overflow (`INT_MIN / -1`).
    DivideOverflow,
    /// Operand stack or call depth limit exceeded.
    StackOverflow,
    /// An exception raised by a host function.
    HostException(String),
    /// Access through a handle whose object has already been destroyed.
    StaleObjectAccess,
    /// A registered type was used before its behaviours were complete.
    InvalidConfiguration,
    /// An operation was applied to values it does not support.
    InvalidOperation(String),
    /// A function or type id that resolves to nothing.
    UnknownEntity(String),
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeError::NullPointerAccess => write!(f, "Null pointer access"),
            RuntimeError::DivideByZero => write!(f, "Divide by zero"),
            RuntimeError::DivideOverflow => write!(f, "Divide overflow"),
            RuntimeError::StackOverflow => write!(f, "Stack overflow"),
            RuntimeError::HostException(msg) => write!(f, "{}", msg),
            RuntimeError::StaleObjectAccess => write!(f, "Stale object handle access"),
            RuntimeError::InvalidConfiguration => {
                write!(f, "Invalid configuration. Verify the registered application interface.")
            }
            RuntimeError::InvalidOperation(msg) => write!(f, "Invalid operation: {}", msg),
            RuntimeError::UnknownEntity(what) => write!(f, "Unknown {}", what),
        }
    }
}

impl std::error::Error for RuntimeError {}

/// Misuse of the execution context interface itself, distinct from script
/// faults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    /// The operation needs a prepared context.
    NotPrepared,
    /// Prepare or argument writes attempted while the context is active
    /// or suspended.
    AlreadyActive,
    /// An argument slot index or value kind that does not match the
    /// prepared function.
    BadArgument(String),
    /// Execute called in a state that cannot run.
    NotExecutable,
}

impl std::fmt::Display for ContextError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContextError::NotPrepared => write!(f, "The context is not prepared"),
            ContextError::AlreadyActive => write!(f, "The context is already in use"),
            ContextError::BadArgument(msg) => write!(f, "Bad argument: {}", msg),
            ContextError::NotExecutable => write!(f, "The context cannot execute in this state"),
        }
    }
}

impl std::error::Error for ContextError {}
