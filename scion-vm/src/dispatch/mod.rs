//! Scion 调用分发模块。
//!
//! 宿主函数有两种接入方式：通用约定由宿主实现 [`GenericFn`]，通过
//! [`GenericCall`] 读参数、写返回槽；原生约定在注册时构建 libffi CIF，
//! 调用时按平台分类搬运参数，宿主侧是一个普通的 C ABI 函数。
//!
//! # 子模块
//!
//! - `convention`：调用约定枚举与入口配对校验
//! - `generic`：通用调用接口与分发
//! - `native`：libffi 前向调用的构建与执行

pub mod convention;
pub mod generic;
pub mod native;

pub use convention::CallConvention;
pub use generic::{GenericCall, GenericFn, GenericMode, GenericOutcome};
pub use native::{NativeCall, NativeOutcome, NativeOuts};

/// An entry point the host hands to the engine at registration time.
pub enum HostEntry {
    /// Portable convention; the target receives a [`GenericCall`].
    Generic(GenericFn),
    /// Raw code address called through libffi. `aux` is the bound
    /// instance for [`CallConvention::BoundGlobal`].
    Native { code: usize, aux: Option<usize> },
}

impl HostEntry {
    pub fn native(code: usize) -> Self {
        HostEntry::Native { code, aux: None }
    }

    pub fn bound(code: usize, aux: usize) -> Self {
        HostEntry::Native {
            code,
            aux: Some(aux),
        }
    }

    pub fn is_generic(&self) -> bool {
        matches!(self, HostEntry::Generic(_))
    }
}

impl std::fmt::Debug for HostEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostEntry::Generic(_) => f.write_str("Generic"),
            HostEntry::Native { code, aux } => f
                .debug_struct("Native")
                .field("code", &format_args!("{:#x}", code))
                .field("aux", aux)
                .finish(),
        }
    }
}
