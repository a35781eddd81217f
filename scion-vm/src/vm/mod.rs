//! Scion 字节码虚拟机。
//!
//! # 子模块
//!
//! - `instruction`：指令集与操作数编码
//! - `module`：模块镜像、构建器与装载前验证
//! - `frame`：调用帧
//! - `context`：执行上下文（状态机、回调、调用栈查询）
//! - `handlers`：指令处理函数

pub mod context;
pub mod frame;
pub(crate) mod handlers;
pub mod instruction;
pub mod module;

pub use context::{
    AbortHandle, ContextState, ExceptionCallback, ExceptionInfo, ExecutionContext, LineCallback,
    LineDirective,
};
pub use frame::Frame;
pub use instruction::{Instruction, Operands};
pub use module::{
    verify_function, CallInfo, ClassImage, CodeBuilder, FunctionBodyImage, FunctionImage,
    GlobalImage, InitValue, ModuleImage, TypeFacts, VarImage, VerifyError,
};
