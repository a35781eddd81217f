//! Scion 脚本引擎执行核心。
//!
//! 本 crate 实现可嵌入宿主程序的脚本运行时：类型注册表、按类别划分
//! 的对象生命周期、增量环垃圾回收、两种约定的宿主调用分发以及栈式
//! 字节码虚拟机。宿主先注册自己的类型、行为与函数，冻结配置，然后
//! 装载编译好的模块镜像并通过执行上下文驱动脚本函数。
//!
//! 典型用法：
//!
//! 1. 创建 [`Engine`]，注册宿主接口；
//! 2. [`Engine::finalize`] 冻结注册表；
//! 3. [`Engine::install_module`] 装载并验证模块镜像；
//! 4. 用 [`ExecutionContext`] 准备入口、写入参数、执行；
//!    挂起、恢复与中止都经由上下文状态机。
//!
//! # 模块
//!
//! - `types`：类型类别与标志、声明文法、描述符、注册表
//! - `runtime`：统一值表示、对象堆、生命周期规则
//! - `gc`：环垃圾回收器（平坦候选表，模拟减引用检测）
//! - `dispatch`：宿主调用约定，通用接口与 libffi 原生桥
//! - `vm`：指令集、模块镜像与验证器、调用帧、执行上下文
//! - `engine`：把上述各部分装配成对外门面
//! - `utils`：名字池等通用工具

pub mod dispatch;
pub mod engine;
pub mod gc;
pub mod runtime;
pub mod types;
pub mod utils;
pub mod vm;

pub use dispatch::{CallConvention, GenericCall, GenericFn, GenericMode, HostEntry};
pub use engine::{Engine, EngineProperty, InstalledModule};
pub use gc::{
    CircularRefCallback, GcObjectInfo, GcStatistics, GC_DESTROY_GARBAGE, GC_DETECT_GARBAGE,
    GC_FULL_CYCLE, GC_ONE_STEP,
};
pub use runtime::heap::ObjectHandle;
pub use runtime::value::Value;
pub use runtime::{ContextError, RuntimeError};
pub use types::behavior::Behavior;
pub use types::descriptor::{FunctionId, TypeId};
pub use types::flags::TypeFlags;
pub use types::RegisterError;
pub use vm::{
    AbortHandle, CodeBuilder, ContextState, ExecutionContext, InitValue, Instruction,
    LineCallback, LineDirective, ModuleImage, VerifyError,
};
