use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{Map, Value as Json};

use crate::engine::Engine;
use crate::runtime::heap::ObjectHandle;
use crate::runtime::value::Value;
use crate::runtime::{ContextError, RuntimeError};
use crate::types::decl::RefMode;
use crate::types::descriptor::{FunctionId, ResolvedType, TypeId};
use crate::utils::truncate_summary;

use super::frame::Frame;
use super::handlers;
use super::instruction::{Instruction, Operands};

/// Life cycle of an execution context. `Active` and `Suspended`
/// alternate freely; the three terminal states keep the callstack
/// intact for inspection until the next prepare or unprepare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Uninitialized,
    Prepared,
    Active,
    Suspended,
    Finished,
    ExceptionRaised,
    Aborted,
}

impl ContextState {
    pub fn name(&self) -> &'static str {
        match self {
            ContextState::Uninitialized => "uninitialized",
            ContextState::Prepared => "prepared",
            ContextState::Active => "active",
            ContextState::Suspended => "suspended",
            ContextState::Finished => "finished",
            ContextState::ExceptionRaised => "exception",
            ContextState::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for ContextState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// What a line callback asks the interpreter to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineDirective {
    Continue,
    Suspend,
}

/// Fired before every instruction with the executing function and the
/// mapped source line. May reenter the engine, e.g. for incremental
/// collection.
pub type LineCallback = Box<dyn FnMut(&mut Engine, FunctionId, u32) -> LineDirective>;

/// Fired at the moment an exception is raised, before any cleanup, so
/// the whole callstack is still inspectable.
pub type ExceptionCallback = Box<dyn FnMut(&mut Engine, &ExceptionInfo)>;

#[derive(Debug, Clone)]
pub struct ExceptionInfo {
    pub message: String,
    pub function: Option<FunctionId>,
    pub line: u32,
}

/// Cloneable handle that aborts the owning context from anywhere,
/// including another thread or a destructor run by the collector.
#[derive(Debug, Clone)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StepOutcome {
    Continue,
    Finished,
    Suspended,
}

type InstructionHandler =
    fn(&mut ExecutionContext, &mut Engine, &Operands) -> Result<StepOutcome, RuntimeError>;

/// One cooperative interpreter. All execution state lives here, so
/// suspension is a flag check between instructions and never unwinds a
/// native stack.
pub struct ExecutionContext {
    pub(crate) state: ContextState,
    pub(crate) entry: Option<FunctionId>,
    pub(crate) root_this: Option<ObjectHandle>,
    /// Staged arguments; non-owning until materialized into the root
    /// frame.
    pub(crate) args: Vec<Value>,
    /// Readbacks of `&out`/`&inout` parameters after completion.
    pub(crate) outs: Vec<(usize, Value)>,
    pub(crate) ret: Value,
    pub(crate) frames: Vec<Frame>,
    pub(crate) exception: Option<ExceptionInfo>,
    pub(crate) abort_flag: Arc<AtomicBool>,
    pub(crate) suspend_requested: bool,
    pub(crate) line_callback: Option<LineCallback>,
    pub(crate) exception_callback: Option<ExceptionCallback>,
    pub(crate) max_stack_slots: usize,
    pub(crate) max_call_depth: usize,
    pub(crate) slots_used: usize,
    pub(crate) instruction_table: Vec<InstructionHandler>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext {
    pub fn new() -> Self {
        let mut instruction_table: Vec<InstructionHandler> = vec![
            handlers::invalid_instruction; // 默认处理函数，未知指令直接报错
            256
        ];

        // 栈操作
        instruction_table[Instruction::Nop as usize] = handlers::nop;
        instruction_table[Instruction::PushNull as usize] = handlers::push_null;
        instruction_table[Instruction::PushBool as usize] = handlers::push_bool;
        instruction_table[Instruction::PushInt as usize] = handlers::push_int;
        instruction_table[Instruction::PushUint as usize] = handlers::push_uint;
        instruction_table[Instruction::PushFloat as usize] = handlers::push_float;
        instruction_table[Instruction::PushDouble as usize] = handlers::push_double;
        instruction_table[Instruction::Pop as usize] = handlers::discard_top;
        instruction_table[Instruction::Dup as usize] = handlers::dup_top;
        instruction_table[Instruction::Swap as usize] = handlers::swap_top;

        // 变量与属性
        instruction_table[Instruction::LoadVar as usize] = handlers::load_var;
        instruction_table[Instruction::StoreVar as usize] = handlers::store_var;
        instruction_table[Instruction::LoadField as usize] = handlers::load_field;
        instruction_table[Instruction::StoreField as usize] = handlers::store_field;
        instruction_table[Instruction::LoadGlobal as usize] = handlers::load_global;
        instruction_table[Instruction::StoreGlobal as usize] = handlers::store_global;
        instruction_table[Instruction::FreeVar as usize] = handlers::free_var;
        instruction_table[Instruction::LoadThis as usize] = handlers::load_this;

        // 算术
        instruction_table[Instruction::Add as usize] = handlers::binary_add;
        instruction_table[Instruction::Sub as usize] = handlers::binary_sub;
        instruction_table[Instruction::Mul as usize] = handlers::binary_mul;
        instruction_table[Instruction::Div as usize] = handlers::binary_div;
        instruction_table[Instruction::Mod as usize] = handlers::binary_mod;
        instruction_table[Instruction::Neg as usize] = handlers::unary_neg;

        // 比较与逻辑
        instruction_table[Instruction::CmpEq as usize] = handlers::cmp_eq;
        instruction_table[Instruction::CmpNe as usize] = handlers::cmp_ne;
        instruction_table[Instruction::CmpLt as usize] = handlers::cmp_lt;
        instruction_table[Instruction::CmpLe as usize] = handlers::cmp_le;
        instruction_table[Instruction::CmpGt as usize] = handlers::cmp_gt;
        instruction_table[Instruction::CmpGe as usize] = handlers::cmp_ge;
        instruction_table[Instruction::Not as usize] = handlers::logic_not;

        // 控制流
        instruction_table[Instruction::Jump as usize] = handlers::jump;
        instruction_table[Instruction::JumpIf as usize] = handlers::jump_if;
        instruction_table[Instruction::JumpIfFalse as usize] = handlers::jump_if_false;
        instruction_table[Instruction::Ret as usize] = handlers::return_value;

        // 调用与对象
        instruction_table[Instruction::Call as usize] = handlers::call_function;
        instruction_table[Instruction::CallMethod as usize] = handlers::call_method;
        instruction_table[Instruction::New as usize] = handlers::new_object;
        instruction_table[Instruction::ValueAssign as usize] = handlers::value_assign;
        instruction_table[Instruction::Throw as usize] = handlers::throw_message;

        ExecutionContext {
            state: ContextState::Uninitialized,
            entry: None,
            root_this: None,
            args: Vec::new(),
            outs: Vec::new(),
            ret: Value::Void,
            frames: Vec::new(),
            exception: None,
            abort_flag: Arc::new(AtomicBool::new(false)),
            suspend_requested: false,
            line_callback: None,
            exception_callback: None,
            max_stack_slots: 0,
            max_call_depth: 0,
            slots_used: 0,
            instruction_table,
        }
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    /// Binds the context to `function` and resets it. Everything a
    /// previous run left behind, including a callstack kept after an
    /// exception or abort, is released here exactly once.
    pub fn prepare(&mut self, engine: &mut Engine, function: FunctionId) -> Result<(), ContextError> {
        if matches!(self.state, ContextState::Active | ContextState::Suspended) {
            return Err(ContextError::AlreadyActive);
        }
        let param_count = engine
            .function(function)
            .ok_or(ContextError::NotExecutable)?
            .param_count();
        self.cleanup(engine);
        self.entry = Some(function);
        self.args = vec![Value::Void; param_count];
        self.max_stack_slots = engine.max_stack_slots();
        self.max_call_depth = engine.max_call_depth();
        self.state = ContextState::Prepared;
        Ok(())
    }

    pub fn unprepare(&mut self, engine: &mut Engine) -> Result<(), ContextError> {
        if matches!(self.state, ContextState::Active) {
            return Err(ContextError::AlreadyActive);
        }
        self.cleanup(engine);
        self.entry = None;
        self.state = ContextState::Uninitialized;
        Ok(())
    }

    fn cleanup(&mut self, engine: &mut Engine) {
        for frame in self.frames.drain(..).rev() {
            if let Some(this) = frame.this {
                engine.release_value(Value::Object(this));
            }
            for v in frame.locals {
                engine.release_value(v);
            }
            for v in frame.stack {
                engine.release_value(v);
            }
        }
        for (_, v) in self.outs.drain(..) {
            engine.release_value(v);
        }
        engine.release_value(self.ret);
        self.ret = Value::Void;
        self.args.clear();
        self.root_this = None;
        self.exception = None;
        self.suspend_requested = false;
        self.abort_flag.store(false, Ordering::Relaxed);
        self.slots_used = 0;
    }

    fn stage_arg(&mut self, slot: usize, value: Value) -> Result<(), ContextError> {
        if self.state != ContextState::Prepared {
            return Err(ContextError::NotPrepared);
        }
        match self.args.get_mut(slot) {
            Some(cell) => {
                *cell = value;
                Ok(())
            }
            None => Err(ContextError::BadArgument(format!(
                "argument slot {} out of range",
                slot
            ))),
        }
    }

    pub fn set_arg_bool(&mut self, slot: usize, value: bool) -> Result<(), ContextError> {
        self.stage_arg(slot, Value::Bool(value))
    }

    pub fn set_arg_byte(&mut self, slot: usize, value: u8) -> Result<(), ContextError> {
        self.stage_arg(slot, Value::Uint(value as u64))
    }

    pub fn set_arg_word(&mut self, slot: usize, value: u16) -> Result<(), ContextError> {
        self.stage_arg(slot, Value::Uint(value as u64))
    }

    pub fn set_arg_dword(&mut self, slot: usize, value: u32) -> Result<(), ContextError> {
        self.stage_arg(slot, Value::Uint(value as u64))
    }

    pub fn set_arg_qword(&mut self, slot: usize, value: u64) -> Result<(), ContextError> {
        self.stage_arg(slot, Value::Uint(value))
    }

    pub fn set_arg_int(&mut self, slot: usize, value: i64) -> Result<(), ContextError> {
        self.stage_arg(slot, Value::Int(value))
    }

    pub fn set_arg_float(&mut self, slot: usize, value: f32) -> Result<(), ContextError> {
        self.stage_arg(slot, Value::Float(value))
    }

    pub fn set_arg_double(&mut self, slot: usize, value: f64) -> Result<(), ContextError> {
        self.stage_arg(slot, Value::Double(value))
    }

    /// Stages a handle argument. The context does not take a reference;
    /// the root frame addrefs when execution starts.
    pub fn set_arg_object(&mut self, slot: usize, value: ObjectHandle) -> Result<(), ContextError> {
        self.stage_arg(slot, Value::Object(value))
    }

    /// Seeds a `&out`/`&inout` parameter. The final value is read back
    /// with [`out_value`](Self::out_value) after completion.
    pub fn set_arg_address(&mut self, slot: usize, value: Value) -> Result<(), ContextError> {
        self.stage_arg(slot, value)
    }

    /// Bound instance for method entry points.
    pub fn set_object(&mut self, object: ObjectHandle) -> Result<(), ContextError> {
        if self.state != ContextState::Prepared {
            return Err(ContextError::NotPrepared);
        }
        self.root_this = Some(object);
        Ok(())
    }

    /// Runs until completion, suspension, exception or abort. The
    /// returned state is also queryable through [`state`](Self::state).
    pub fn execute(&mut self, engine: &mut Engine) -> Result<ContextState, ContextError> {
        match self.state {
            ContextState::Prepared => {
                self.state = ContextState::Active;
                match self.enter_root(engine) {
                    Ok(true) => {}
                    Ok(false) => {
                        self.state = ContextState::Finished;
                        return Ok(self.state);
                    }
                    Err(err) => {
                        self.raise(engine, err);
                        return Ok(self.state);
                    }
                }
            }
            ContextState::Suspended => {
                self.state = ContextState::Active;
            }
            _ => return Err(ContextError::NotPrepared),
        }
        loop {
            if self.abort_flag.load(Ordering::Relaxed) {
                self.state = ContextState::Aborted;
                break;
            }
            if self.suspend_requested {
                self.suspend_requested = false;
                self.state = ContextState::Suspended;
                break;
            }
            match self.step(engine) {
                Ok(StepOutcome::Continue) => {}
                Ok(StepOutcome::Finished) => {
                    self.state = ContextState::Finished;
                    break;
                }
                Ok(StepOutcome::Suspended) => {
                    self.state = ContextState::Suspended;
                    break;
                }
                Err(err) => {
                    self.raise(engine, err);
                    break;
                }
            }
        }
        Ok(self.state)
    }

    /// Requests suspension at the next instruction boundary.
    pub fn suspend(&mut self) {
        self.suspend_requested = true;
    }

    /// Aborts execution at the next safe point. A suspended context
    /// aborts immediately.
    pub fn abort(&mut self) {
        self.abort_flag.store(true, Ordering::Relaxed);
        if matches!(self.state, ContextState::Suspended | ContextState::Prepared) {
            self.state = ContextState::Aborted;
        }
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle(Arc::clone(&self.abort_flag))
    }

    fn enter_root(&mut self, engine: &mut Engine) -> Result<bool, RuntimeError> {
        let function = match self.entry {
            Some(f) => f,
            None => return Err(RuntimeError::InvalidOperation("no entry function".into())),
        };
        let desc = engine
            .function(function)
            .ok_or_else(|| RuntimeError::UnknownEntity(format!("function #{}", function.0)))?;
        let returns_value = !desc.signature.ret.is_void();
        if let Some(script) = desc.script_code_arc() {
            let module = desc.module;
            let param_count = desc.param_count();
            if self.frames.len() + 1 > self.max_call_depth {
                return Err(RuntimeError::StackOverflow);
            }
            let mut frame = Frame::new(function, module, self.root_this, script);
            if self.slots_used + frame.locals.len() > self.max_stack_slots {
                return Err(RuntimeError::StackOverflow);
            }
            if let Some(this) = self.root_this {
                engine.addref_object(this)?;
            }
            for (i, v) in self.args.iter().enumerate().take(param_count) {
                engine.addref_value(*v)?;
                frame.locals[i] = *v;
            }
            let defaults: Vec<(usize, Value)> = frame
                .script
                .locals
                .iter()
                .filter(|d| (d.slot as usize) >= param_count)
                .map(|d| (d.slot as usize, default_local(&d.ty)))
                .collect();
            for (slot, v) in defaults {
                if slot < frame.locals.len() {
                    frame.locals[slot] = v;
                }
            }
            self.slots_used += frame.locals.len();
            self.frames.push(frame);
            Ok(true)
        } else {
            let call = engine.call_host(function, self.root_this, &self.args)?;
            for (slot, v) in call.outs {
                if slot < self.args.len() && engine.addref_value(v).is_ok() {
                    self.outs.push((slot, v));
                }
            }
            if returns_value {
                self.ret = call.ret;
            }
            Ok(false)
        }
    }

    fn step(&mut self, engine: &mut Engine) -> Result<StepOutcome, RuntimeError> {
        let decoded = {
            let frame = match self.frames.last() {
                Some(f) => f,
                None => return Ok(StepOutcome::Finished),
            };
            let pc = frame.ip as usize;
            let code = &frame.script.code;
            if pc >= code.len() {
                None
            } else {
                let raw = code[pc];
                let instr = u8::try_from(raw)
                    .ok()
                    .and_then(Instruction::from_opcode)
                    .ok_or_else(|| {
                        RuntimeError::InvalidOperation(format!(
                            "invalid instruction {} at pc {}",
                            raw, pc
                        ))
                    })?;
                let words = instr.operand_words();
                if pc + 1 + words > code.len() {
                    return Err(RuntimeError::InvalidOperation(format!(
                        "truncated instruction at pc {}",
                        pc
                    )));
                }
                let a = if words >= 1 { code[pc + 1] } else { 0 };
                let b = if words >= 2 { code[pc + 2] } else { 0 };
                Some((
                    frame.function,
                    frame.script.line_for_pc(frame.ip),
                    instr,
                    Operands { a, b },
                    (pc + 1 + words) as u32,
                ))
            }
        };
        let Some((function, line, instr, ops, next_ip)) = decoded else {
            // Implicit void return at the end of the code section.
            return self.return_from_frame(engine);
        };
        if let Some(mut cb) = self.line_callback.take() {
            let directive = cb(engine, function, line);
            self.line_callback = Some(cb);
            if directive == LineDirective::Suspend {
                // ip untouched: the instruction runs on resume.
                return Ok(StepOutcome::Suspended);
            }
        }
        if let Some(frame) = self.frames.last_mut() {
            frame.ip = next_ip;
        }
        let handler = self.instruction_table[instr as usize];
        handler(self, engine, &ops)
    }

    fn raise(&mut self, engine: &mut Engine, err: RuntimeError) {
        let (function, line) = match self.frames.last() {
            Some(frame) => (Some(frame.function), frame.current_line()),
            None => (self.entry, 0),
        };
        let info = ExceptionInfo {
            message: err.to_string(),
            function,
            line,
        };
        log::debug!(
            "script exception '{}' at line {} (depth {})",
            info.message,
            info.line,
            self.frames.len()
        );
        if let Some(mut cb) = self.exception_callback.take() {
            cb(engine, &info);
            self.exception_callback = Some(cb);
        }
        self.exception = Some(info);
        self.state = ContextState::ExceptionRaised;
    }

    // ---- interpreter internals used by the instruction handlers ----

    pub(crate) fn push(&mut self, v: Value) -> Result<(), RuntimeError> {
        if self.slots_used + 1 > self.max_stack_slots {
            return Err(RuntimeError::StackOverflow);
        }
        match self.frames.last_mut() {
            Some(frame) => {
                frame.stack.push(v);
                self.slots_used += 1;
                Ok(())
            }
            None => Err(RuntimeError::InvalidOperation("no active frame".into())),
        }
    }

    pub(crate) fn pop(&mut self) -> Result<Value, RuntimeError> {
        match self.frames.last_mut().and_then(|f| f.stack.pop()) {
            Some(v) => {
                self.slots_used = self.slots_used.saturating_sub(1);
                Ok(v)
            }
            None => Err(RuntimeError::InvalidOperation("stack underflow".into())),
        }
    }

    pub(crate) fn top(&self) -> Result<Value, RuntimeError> {
        self.frames
            .last()
            .and_then(|f| f.stack.last())
            .copied()
            .ok_or_else(|| RuntimeError::InvalidOperation("stack underflow".into()))
    }

    pub(crate) fn jump(&mut self, target: u32) {
        if let Some(frame) = self.frames.last_mut() {
            frame.ip = target;
        }
    }

    pub(crate) fn current_module(&self) -> Option<u32> {
        self.frames.last().and_then(|f| f.module)
    }

    pub(crate) fn local(&self, slot: u32) -> Result<Value, RuntimeError> {
        self.frames
            .last()
            .and_then(|f| f.locals.get(slot as usize))
            .copied()
            .ok_or_else(|| RuntimeError::InvalidOperation("local slot out of range".into()))
    }

    /// Stores into a local slot, taking over the value's reference and
    /// releasing the previous occupant.
    pub(crate) fn store_local(
        &mut self,
        engine: &mut Engine,
        slot: u32,
        v: Value,
    ) -> Result<(), RuntimeError> {
        let old = match self
            .frames
            .last_mut()
            .and_then(|f| f.locals.get_mut(slot as usize))
        {
            Some(cell) => std::mem::replace(cell, v),
            None => {
                engine.release_value(v);
                return Err(RuntimeError::InvalidOperation(
                    "local slot out of range".into(),
                ));
            }
        };
        engine.release_value(old);
        Ok(())
    }

    /// Pushes a callee frame for script targets or completes host
    /// targets immediately. Consumes `this` and every argument.
    pub(crate) fn invoke_function(
        &mut self,
        engine: &mut Engine,
        function: FunctionId,
        this: Option<ObjectHandle>,
        args: Vec<Value>,
    ) -> Result<(), RuntimeError> {
        let release_all = |engine: &mut Engine, this: Option<ObjectHandle>, args: Vec<Value>| {
            for v in args {
                engine.release_value(v);
            }
            if let Some(h) = this {
                engine.release_value(Value::Object(h));
            }
        };
        let desc = match engine.function(function) {
            Some(d) => d,
            None => {
                release_all(engine, this, args);
                return Err(RuntimeError::UnknownEntity(format!(
                    "function #{}",
                    function.0
                )));
            }
        };
        let param_count = desc.param_count();
        let returns_value = !desc.signature.ret.is_void();
        if args.len() != param_count {
            let got = args.len();
            release_all(engine, this, args);
            return Err(RuntimeError::InvalidOperation(format!(
                "expected {} arguments, got {}",
                param_count, got
            )));
        }
        if let Some(script) = desc.script_code_arc() {
            let module = desc.module;
            if self.frames.len() + 1 > self.max_call_depth
                || self.slots_used + script.local_count() > self.max_stack_slots
            {
                release_all(engine, this, args);
                return Err(RuntimeError::StackOverflow);
            }
            let mut frame = Frame::new(function, module, this, script);
            for (i, v) in args.into_iter().enumerate() {
                frame.locals[i] = v;
            }
            let defaults: Vec<(usize, Value)> = frame
                .script
                .locals
                .iter()
                .filter(|d| (d.slot as usize) >= param_count)
                .map(|d| (d.slot as usize, default_local(&d.ty)))
                .collect();
            for (slot, v) in defaults {
                if slot < frame.locals.len() {
                    frame.locals[slot] = v;
                }
            }
            self.slots_used += frame.locals.len();
            self.frames.push(frame);
            Ok(())
        } else {
            let result = engine.call_host(function, this, &args);
            release_all(engine, this, args);
            let call = result?;
            if call.suspend {
                self.suspend_requested = true;
            }
            if returns_value {
                self.push(call.ret)?;
            }
            Ok(())
        }
    }

    /// Pops the current frame: reads the return value, reads back root
    /// out-parameters, and releases everything the frame owned.
    pub(crate) fn return_from_frame(
        &mut self,
        engine: &mut Engine,
    ) -> Result<StepOutcome, RuntimeError> {
        let mut frame = match self.frames.pop() {
            Some(f) => f,
            None => return Ok(StepOutcome::Finished),
        };
        self.slots_used = self.slots_used.saturating_sub(frame.slot_count());
        let returns_value = engine
            .function(frame.function)
            .map(|d| !d.signature.ret.is_void())
            .unwrap_or(false);
        let ret = if returns_value {
            frame.stack.pop().unwrap_or(Value::Void)
        } else {
            Value::Void
        };
        if self.frames.is_empty() {
            let out_slots: Vec<usize> = engine
                .function(frame.function)
                .map(|d| {
                    d.signature
                        .params
                        .iter()
                        .enumerate()
                        .filter(|(_, p)| matches!(p.ref_mode, RefMode::Out | RefMode::InOut))
                        .map(|(i, _)| i)
                        .collect()
                })
                .unwrap_or_default();
            for i in out_slots {
                let v = frame.locals.get(i).copied().unwrap_or(Value::Void);
                if engine.addref_value(v).is_ok() {
                    self.outs.push((i, v));
                }
            }
        }
        if let Some(this) = frame.this {
            engine.release_value(Value::Object(this));
        }
        for v in frame.locals.drain(..) {
            engine.release_value(v);
        }
        for v in frame.stack.drain(..) {
            engine.release_value(v);
        }
        if self.frames.is_empty() {
            self.ret = ret;
            Ok(StepOutcome::Finished)
        } else {
            if returns_value {
                self.push(ret)?;
            }
            Ok(StepOutcome::Continue)
        }
    }

    // ---- post-mortem and inspection surfaces ----

    pub fn exception_message(&self) -> Option<&str> {
        self.exception.as_ref().map(|e| e.message.as_str())
    }

    pub fn exception_function(&self) -> Option<FunctionId> {
        self.exception.as_ref().and_then(|e| e.function)
    }

    pub fn exception_line(&self) -> Option<u32> {
        self.exception.as_ref().map(|e| e.line)
    }

    pub fn set_line_callback(&mut self, cb: LineCallback) {
        self.line_callback = Some(cb);
    }

    pub fn clear_line_callback(&mut self) {
        self.line_callback = None;
    }

    pub fn set_exception_callback(&mut self, cb: ExceptionCallback) {
        self.exception_callback = Some(cb);
    }

    pub fn clear_exception_callback(&mut self) {
        self.exception_callback = None;
    }

    pub fn call_depth(&self) -> usize {
        self.frames.len()
    }

    /// Level 0 is the deepest (currently executing) frame.
    fn frame_at(&self, level: usize) -> Option<&Frame> {
        if level < self.frames.len() {
            self.frames.get(self.frames.len() - 1 - level)
        } else {
            None
        }
    }

    pub fn function_at(&self, level: usize) -> Option<FunctionId> {
        self.frame_at(level).map(|f| f.function)
    }

    pub fn line_at(&self, level: usize) -> Option<u32> {
        self.frame_at(level).map(|f| f.current_line())
    }

    pub fn this_at(&self, level: usize) -> Option<ObjectHandle> {
        self.frame_at(level).and_then(|f| f.this)
    }

    pub fn local_count(&self, level: usize) -> Option<usize> {
        self.frame_at(level).map(|f| f.script.locals.len())
    }

    pub fn local_name(&self, level: usize, index: usize) -> Option<&str> {
        self.frame_at(level)
            .and_then(|f| f.script.locals.get(index))
            .map(|d| d.name.as_str())
    }

    pub fn local_value(&self, level: usize, index: usize) -> Option<Value> {
        let frame = self.frame_at(level)?;
        let decl = frame.script.locals.get(index)?;
        frame.locals.get(decl.slot as usize).copied()
    }

    pub fn local_in_scope(&self, level: usize, index: usize) -> Option<bool> {
        let frame = self.frame_at(level)?;
        let decl = frame.script.locals.get(index)?;
        Some(decl.in_scope(frame.ip))
    }

    pub fn return_value(&self) -> Value {
        self.ret
    }

    pub fn return_bool(&self) -> Option<bool> {
        self.ret.as_bool().ok()
    }

    pub fn return_int(&self) -> Option<i64> {
        self.ret.as_int().ok()
    }

    pub fn return_uint(&self) -> Option<u64> {
        match self.ret {
            Value::Uint(v) => Some(v),
            Value::Int(v) => Some(v as u64),
            _ => None,
        }
    }

    pub fn return_float(&self) -> Option<f32> {
        match self.ret {
            Value::Float(v) => Some(v),
            _ => None,
        }
    }

    pub fn return_double(&self) -> Option<f64> {
        self.ret.as_double().ok()
    }

    /// The returned handle stays owned by the context until unprepare;
    /// addref to keep it longer.
    pub fn return_object(&self) -> Option<ObjectHandle> {
        self.ret.as_object()
    }

    /// Final value of a `&out`/`&inout` parameter after completion.
    pub fn out_value(&self, slot: usize) -> Option<Value> {
        self.outs
            .iter()
            .rev()
            .find(|(s, _)| *s == slot)
            .map(|(_, v)| *v)
    }

    /// Whole-callstack snapshot: one object per frame with the
    /// function, current line, in-scope variables and operand stack.
    pub fn stack_json(&self, engine: &Engine) -> Json {
        let mut frames = Map::new();
        for (i, frame) in self.frames.iter().enumerate() {
            let mut frame_obj = Map::new();
            let name = engine
                .function(frame.function)
                .map(|d| d.name.clone())
                .unwrap_or_else(|| format!("#{}", frame.function.0));
            frame_obj.insert("function".to_string(), Json::String(name));
            frame_obj.insert("line".to_string(), Json::Number(frame.current_line().into()));

            let mut variables = Map::new();
            for decl in &frame.script.locals {
                if !decl.in_scope(frame.ip) {
                    continue;
                }
                let value = frame
                    .locals
                    .get(decl.slot as usize)
                    .map(|v| render_value(engine, *v))
                    .unwrap_or_else(|| "<missing>".to_string());
                variables.insert(decl.name.clone(), Json::String(truncate_summary(&value)));
            }
            frame_obj.insert("variables".to_string(), Json::Object(variables));

            let stack_values: Vec<Json> = frame
                .stack
                .iter()
                .map(|v| Json::String(truncate_summary(&render_value(engine, *v))))
                .collect();
            frame_obj.insert("stack".to_string(), Json::Array(stack_values));

            frames.insert(format!("frame_{}", i), Json::Object(frame_obj));
        }
        Json::Object(frames)
    }
}

/// Human-readable rendering of one value for snapshots and logs.
pub(crate) fn render_value(engine: &Engine, v: Value) -> String {
    match v {
        Value::Void => "<void>".to_string(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Uint(u) => u.to_string(),
        Value::Float(x) => format!("{}", x),
        Value::Double(x) => format!("{}", x),
        Value::Object(h) => match engine.object_type(h) {
            Some(tid) => format!("{}{}", engine.type_name(tid), h),
            None => "<stale>".to_string(),
        },
    }
}

/// Initial value for a declared local that is not a parameter.
fn default_local(ty: &ResolvedType) -> Value {
    if ty.is_handle {
        return Value::Null;
    }
    match ty.id {
        TypeId::BOOL => Value::Bool(false),
        TypeId::INT8 | TypeId::INT16 | TypeId::INT32 | TypeId::INT64 => Value::Int(0),
        TypeId::UINT8 | TypeId::UINT16 | TypeId::UINT32 | TypeId::UINT64 => Value::Uint(0),
        TypeId::FLOAT => Value::Float(0.0),
        TypeId::DOUBLE => Value::Double(0.0),
        TypeId::VOID => Value::Void,
        // Object locals start empty until the code constructs into them.
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(ContextState::Uninitialized.name(), "uninitialized");
        assert_eq!(ContextState::ExceptionRaised.name(), "exception");
        assert_eq!(format!("{}", ContextState::Suspended), "suspended");
    }

    #[test]
    fn test_abort_handle_shares_flag() {
        let ctx = ExecutionContext::new();
        let handle = ctx.abort_handle();
        handle.abort();
        assert!(ctx.abort_flag.load(Ordering::Relaxed));
    }

    #[test]
    fn test_default_local_values() {
        assert_eq!(
            default_local(&ResolvedType::plain(TypeId::INT32)),
            Value::Int(0)
        );
        assert_eq!(
            default_local(&ResolvedType::handle(TypeId(TypeId::FIRST_USER))),
            Value::Null
        );
        assert_eq!(
            default_local(&ResolvedType::plain(TypeId::DOUBLE)),
            Value::Double(0.0)
        );
    }
}
