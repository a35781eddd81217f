//! Scion 类型系统模块。
//!
//! 本模块实现引擎的类型注册表：类型类别与子标志、注册声明文法、
//! 类型与函数描述符、行为表以及注册表本体。
//!
//! # 子模块
//! - `flags`：类型类别与子标志及其合法组合
//! - `decl`：注册声明字符串的小型文法
//! - `behavior`：行为种类与按类别的合法性校验
//! - `descriptor`：类型描述符（宿主类型、脚本类、接口、模板、函数签名类型）
//! - `function`：函数描述符（脚本字节码或宿主入口）
//! - `registry`：注册表本体，冻结后不可变
//!
//! 注册表冻结之后，所有描述符对外只读；模块安装以"单元"为粒度追加
//! 脚本类描述符，并在单元内求环引用能力的不动点。

pub mod behavior;
pub mod decl;
pub mod descriptor;
pub mod flags;
pub mod function;
pub mod registry;

/// Errors reported synchronously by the registration interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterError {
    /// A declaration string did not parse.
    InvalidDeclaration(String),
    /// A behavior kind is not legal for the type's category.
    IllegalBehaviourForType(String),
    /// A name or signature was registered twice.
    AlreadyRegistered(String),
    /// An illegal combination of type flags.
    InvalidFlags(String),
    /// A declaration names a type the registry does not know.
    UnknownType(String),
    /// The operation is not supported for this type.
    NotSupported(String),
    /// Registration attempted after the registry was finalized.
    ConfigurationFrozen,
}

impl std::fmt::Display for RegisterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegisterError::InvalidDeclaration(msg) => {
                write!(f, "Invalid declaration: {}", msg)
            }
            RegisterError::IllegalBehaviourForType(msg) => {
                write!(f, "Illegal behaviour for type: {}", msg)
            }
            RegisterError::AlreadyRegistered(msg) => {
                write!(f, "Already registered: {}", msg)
            }
            RegisterError::InvalidFlags(msg) => {
                write!(f, "Invalid type flags: {}", msg)
            }
            RegisterError::UnknownType(name) => {
                write!(f, "Unknown type '{}'", name)
            }
            // Carries a complete diagnostic sentence already.
            RegisterError::NotSupported(msg) => write!(f, "{}", msg),
            RegisterError::ConfigurationFrozen => {
                write!(f, "The configuration is frozen and cannot be changed")
            }
        }
    }
}

impl std::error::Error for RegisterError {}
