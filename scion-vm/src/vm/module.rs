//! Scion 模块镜像。
//!
//! 镜像是模块的持久化形式：类与全局变量的声明字符串、函数代码、
//! 局部变量表、行号表和入口表，全部名字经名字池内部化。安装时
//! 逐条解析声明、解析类型、运行环单元不动点，并对每个脚本函数
//! 做安装期校验；校验失败的模块不会留下任何已注册的残留。

use std::collections::HashMap;

use rustc_hash::FxHashMap;

use crate::types::function::LocalVarDecl;
use crate::utils::pool::NamePool;

use super::instruction::Instruction;

/// A class declared by a module.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde_support", derive(serde::Serialize, serde::Deserialize))]
pub struct ClassImage {
    /// Pool index of the class name.
    pub name: u32,
    pub is_final: bool,
    /// Pool indexes of field declarations, e.g. `"node@ next"`.
    pub fields: Vec<u32>,
    /// Function table index of the script destructor, if any.
    pub destructor: Option<u32>,
}

/// A module global with its initial value.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde_support", derive(serde::Serialize, serde::Deserialize))]
pub struct GlobalImage {
    /// Pool index of the declaration, e.g. `"int counter"`.
    pub decl: u32,
    pub init: InitValue,
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde_support", derive(serde::Serialize, serde::Deserialize))]
pub enum InitValue {
    Null,
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f32),
    Double(f64),
}

/// A local variable of a script function, declaration-string form.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde_support", derive(serde::Serialize, serde::Deserialize))]
pub struct VarImage {
    /// Pool index of the declaration, e.g. `"node@ n"`.
    pub decl: u32,
    pub slot: u32,
    pub scope_start: u32,
    pub scope_end: u32,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde_support", derive(serde::Serialize, serde::Deserialize))]
pub enum FunctionBodyImage {
    Script {
        code: Vec<u32>,
        vars: Vec<VarImage>,
        line_table: Vec<(u32, u32)>,
    },
    /// Resolved at install time against an engine-registered function,
    /// or a method of `object`, by name and parameter count.
    Import,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde_support", derive(serde::Serialize, serde::Deserialize))]
pub struct FunctionImage {
    /// Pool index of the declaration, e.g. `"int fib(int)"`.
    pub decl: u32,
    /// Pool index of the owning class name for methods.
    pub object: Option<u32>,
    pub body: FunctionBodyImage,
}

/// Serializable module image. `Call`/`CallMethod` operands index the
/// function table, `New`/`ValueAssign` operands the type table,
/// `Throw` operands the name pool.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde_support", derive(serde::Serialize, serde::Deserialize))]
pub struct ModuleImage {
    pub name: String,
    pub names: NamePool,
    /// Pool indexes of type names the code refers to, including the
    /// module's own classes. Template instances appear spelled out,
    /// e.g. `"array<int>"`.
    pub types: Vec<u32>,
    pub classes: Vec<ClassImage>,
    pub globals: Vec<GlobalImage>,
    pub functions: Vec<FunctionImage>,
    /// Entry symbol to function table index.
    pub entry_points: HashMap<String, u32>,
}

impl ModuleImage {
    pub fn new(name: &str) -> Self {
        ModuleImage {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn intern(&mut self, text: &str) -> u32 {
        self.names.intern(text)
    }

    /// Index of `name` in the type table, adding it if missing.
    pub fn type_ref(&mut self, name: &str) -> u32 {
        let pooled = self.names.intern(name);
        if let Some(pos) = self.types.iter().position(|&n| n == pooled) {
            return pos as u32;
        }
        self.types.push(pooled);
        (self.types.len() - 1) as u32
    }

    /// Declares a script class; also enters it into the type table so
    /// bytecode can construct it. Returns the type table index.
    pub fn add_class(
        &mut self,
        name: &str,
        is_final: bool,
        fields: &[&str],
        destructor: Option<u32>,
    ) -> u32 {
        let name_idx = self.names.intern(name);
        let fields = fields.iter().map(|f| self.names.intern(f)).collect();
        self.classes.push(ClassImage {
            name: name_idx,
            is_final,
            fields,
            destructor,
        });
        self.type_ref(name)
    }

    /// Returns the global table index.
    pub fn add_global(&mut self, decl: &str, init: InitValue) -> u32 {
        let decl = self.names.intern(decl);
        self.globals.push(GlobalImage { decl, init });
        (self.globals.len() - 1) as u32
    }

    /// Returns the function table index.
    pub fn add_script_function(
        &mut self,
        decl: &str,
        object: Option<&str>,
        code: Vec<u32>,
        vars: Vec<VarImage>,
        line_table: Vec<(u32, u32)>,
    ) -> u32 {
        let decl = self.names.intern(decl);
        let object = object.map(|o| self.names.intern(o));
        self.functions.push(FunctionImage {
            decl,
            object,
            body: FunctionBodyImage::Script {
                code,
                vars,
                line_table,
            },
        });
        (self.functions.len() - 1) as u32
    }

    /// Declares a function the module expects the engine to provide.
    /// Returns the function table index.
    pub fn add_import(&mut self, decl: &str, object: Option<&str>) -> u32 {
        let decl = self.names.intern(decl);
        let object = object.map(|o| self.names.intern(o));
        self.functions.push(FunctionImage {
            decl,
            object,
            body: FunctionBodyImage::Import,
        });
        (self.functions.len() - 1) as u32
    }

    pub fn local(&mut self, decl: &str, slot: u32, scope_start: u32, scope_end: u32) -> VarImage {
        VarImage {
            decl: self.names.intern(decl),
            slot,
            scope_start,
            scope_end,
        }
    }

    pub fn add_entry(&mut self, name: &str, function: u32) {
        self.entry_points.insert(name.to_string(), function);
    }

    #[cfg(feature = "serde_support")]
    pub fn write_to_file(&self, path: &str) -> Result<(), std::io::Error> {
        let serialized = bincode::serialize(self)
            .map_err(|e| std::io::Error::other(format!("Serialization error: {}", e)))?;
        std::fs::write(path, serialized)
    }

    #[cfg(feature = "serde_support")]
    pub fn read_from_file(path: &str) -> Result<Self, std::io::Error> {
        let bytes = std::fs::read(path)?;
        bincode::deserialize(&bytes)
            .map_err(|e| std::io::Error::other(format!("Deserialization error: {}", e)))
    }

    /// Text-safe encoding of the serialized image, for embedding a
    /// compiled module in configuration or source text.
    #[cfg(feature = "serde_support")]
    pub fn to_base64_string(&self) -> Result<String, std::io::Error> {
        use base64::{engine::general_purpose, Engine as _};
        let serialized = bincode::serialize(self)
            .map_err(|e| std::io::Error::other(format!("Serialization error: {}", e)))?;
        Ok(general_purpose::STANDARD.encode(serialized))
    }

    #[cfg(feature = "serde_support")]
    pub fn from_base64_string(text: &str) -> Result<Self, std::io::Error> {
        use base64::{engine::general_purpose, Engine as _};
        let bytes = general_purpose::STANDARD
            .decode(text.trim())
            .map_err(|e| std::io::Error::other(format!("Base64 error: {}", e)))?;
        bincode::deserialize(&bytes)
            .map_err(|e| std::io::Error::other(format!("Deserialization error: {}", e)))
    }
}

/// Sequential code assembler with jump patching.
#[derive(Debug, Default)]
pub struct CodeBuilder {
    code: Vec<u32>,
}

impl CodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pc(&self) -> u32 {
        self.code.len() as u32
    }

    pub fn op(&mut self, i: Instruction) -> &mut Self {
        self.code.push(i as u32);
        self
    }

    pub fn op1(&mut self, i: Instruction, a: u32) -> &mut Self {
        self.code.push(i as u32);
        self.code.push(a);
        self
    }

    pub fn push_int(&mut self, v: i64) -> &mut Self {
        let (lo, hi) = super::instruction::split_u64(v as u64);
        self.code.push(Instruction::PushInt as u32);
        self.code.push(lo);
        self.code.push(hi);
        self
    }

    pub fn push_uint(&mut self, v: u64) -> &mut Self {
        let (lo, hi) = super::instruction::split_u64(v);
        self.code.push(Instruction::PushUint as u32);
        self.code.push(lo);
        self.code.push(hi);
        self
    }

    pub fn push_double(&mut self, v: f64) -> &mut Self {
        let (lo, hi) = super::instruction::split_u64(v.to_bits());
        self.code.push(Instruction::PushDouble as u32);
        self.code.push(lo);
        self.code.push(hi);
        self
    }

    pub fn push_float(&mut self, v: f32) -> &mut Self {
        self.code.push(Instruction::PushFloat as u32);
        self.code.push(v.to_bits());
        self
    }

    pub fn push_bool(&mut self, v: bool) -> &mut Self {
        self.code.push(Instruction::PushBool as u32);
        self.code.push(v as u32);
        self
    }

    /// Emits a jump with a placeholder target; patch later.
    pub fn jump_slot(&mut self, i: Instruction) -> usize {
        self.code.push(i as u32);
        self.code.push(u32::MAX);
        self.code.len() - 1
    }

    pub fn patch(&mut self, slot: usize, target: u32) {
        self.code[slot] = target;
    }

    pub fn finish(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.code)
    }
}

/// Install-time verification failure. The module is rejected whole.
#[derive(Debug, Clone, PartialEq)]
pub enum VerifyError {
    UnknownOpcode { pc: u32, raw: u32 },
    TruncatedOperands { pc: u32 },
    BadJumpTarget { pc: u32, target: u32 },
    StackUnderflow { pc: u32 },
    InconsistentStack { pc: u32 },
    BadOperand { pc: u32, what: String },
    MissingAssign(String),
    NotInstantiable(String),
    /// Declaration parse or type resolution failure; carries the
    /// registry's diagnostic verbatim.
    BadDeclaration(String),
    UnknownImport(String),
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerifyError::UnknownOpcode { pc, raw } => {
                write!(f, "unknown opcode {} at pc {}", raw, pc)
            }
            VerifyError::TruncatedOperands { pc } => {
                write!(f, "operands overrun the code section at pc {}", pc)
            }
            VerifyError::BadJumpTarget { pc, target } => {
                write!(
                    f,
                    "jump target {} at pc {} is not an instruction boundary",
                    target, pc
                )
            }
            VerifyError::StackUnderflow { pc } => write!(f, "stack underflow at pc {}", pc),
            VerifyError::InconsistentStack { pc } => {
                write!(f, "inconsistent stack depth at join point pc {}", pc)
            }
            VerifyError::BadOperand { pc, what } => {
                write!(f, "invalid operand at pc {}: {}", pc, what)
            }
            VerifyError::MissingAssign(name) => write!(
                f,
                "No appropriate opAssign method found in '{}' for value assignment",
                name
            ),
            VerifyError::NotInstantiable(name) => write!(f, "cannot instantiate '{}'", name),
            VerifyError::BadDeclaration(msg) => write!(f, "{}", msg),
            VerifyError::UnknownImport(decl) => {
                write!(f, "no registered function matches import '{}'", decl)
            }
        }
    }
}

impl std::error::Error for VerifyError {}

/// What the verifier knows about a function table entry.
#[derive(Debug, Clone, Copy)]
pub struct CallInfo {
    pub params: u32,
    pub returns_value: bool,
    pub is_method: bool,
}

/// What the verifier knows about a type table entry.
#[derive(Debug, Clone)]
pub struct TypeFacts {
    pub name: String,
    pub instantiable: bool,
    /// POD, or carries a registered assignment behavior.
    pub assignable: bool,
}

/// Checks one script function's code: known opcodes, operand bounds,
/// jump targets on instruction boundaries, and a stack-depth dataflow
/// pass that requires equal depth at every join point. `ValueAssign`
/// against a type without assignment and `New` against a type that
/// cannot be constructed are rejected here so they never fault mid-run.
pub fn verify_function(
    code: &[u32],
    locals: &[LocalVarDecl],
    ret_pops: u32,
    globals: u32,
    types: &[TypeFacts],
    calls: &[CallInfo],
    names: u32,
) -> Result<(), VerifyError> {
    // First pass: decode boundaries.
    let mut decoded: FxHashMap<u32, (Instruction, u32)> = FxHashMap::default();
    let mut pc = 0usize;
    while pc < code.len() {
        let raw = code[pc];
        let instr = u8::try_from(raw)
            .ok()
            .and_then(Instruction::from_opcode)
            .ok_or(VerifyError::UnknownOpcode {
                pc: pc as u32,
                raw,
            })?;
        let words = instr.operand_words();
        if pc + 1 + words > code.len() {
            return Err(VerifyError::TruncatedOperands { pc: pc as u32 });
        }
        let a = if words >= 1 { code[pc + 1] } else { 0 };
        decoded.insert(pc as u32, (instr, a));
        pc += 1 + words;
    }

    let bad = |pc: u32, what: &str| VerifyError::BadOperand {
        pc,
        what: what.to_string(),
    };

    // Second pass: depth dataflow over the control-flow graph.
    let mut depths: FxHashMap<u32, u32> = FxHashMap::default();
    let mut work: Vec<(u32, u32)> = vec![(0, 0)];
    while let Some((pc, depth)) = work.pop() {
        if pc as usize >= code.len() {
            // Falling off the end is an implicit void return.
            continue;
        }
        if let Some(&seen) = depths.get(&pc) {
            if seen != depth {
                return Err(VerifyError::InconsistentStack { pc });
            }
            continue;
        }
        depths.insert(pc, depth);
        let (instr, a) = decoded[&pc];
        let next = pc + 1 + instr.operand_words() as u32;
        let branch = |target: u32, depth: u32, work: &mut Vec<(u32, u32)>| {
            if target as usize != code.len() && !decoded.contains_key(&target) {
                return Err(VerifyError::BadJumpTarget { pc, target });
            }
            work.push((target, depth));
            Ok(())
        };
        let (pops, pushes): (u32, u32) = match instr {
            Instruction::Nop => (0, 0),
            Instruction::PushNull
            | Instruction::PushBool
            | Instruction::PushInt
            | Instruction::PushUint
            | Instruction::PushFloat
            | Instruction::PushDouble => (0, 1),
            Instruction::Pop => (1, 0),
            Instruction::Dup => (1, 2),
            Instruction::Swap => (2, 2),
            Instruction::LoadVar => {
                if a as usize >= locals.len() {
                    return Err(bad(pc, "local slot out of range"));
                }
                (0, 1)
            }
            Instruction::StoreVar => {
                if a as usize >= locals.len() {
                    return Err(bad(pc, "local slot out of range"));
                }
                (1, 0)
            }
            Instruction::FreeVar => {
                if a as usize >= locals.len() {
                    return Err(bad(pc, "local slot out of range"));
                }
                (0, 0)
            }
            Instruction::LoadThis => (0, 1),
            Instruction::LoadField => (1, 1),
            Instruction::StoreField => (2, 0),
            Instruction::LoadGlobal => {
                if a >= globals {
                    return Err(bad(pc, "global slot out of range"));
                }
                (0, 1)
            }
            Instruction::StoreGlobal => {
                if a >= globals {
                    return Err(bad(pc, "global slot out of range"));
                }
                (1, 0)
            }
            Instruction::Add
            | Instruction::Sub
            | Instruction::Mul
            | Instruction::Div
            | Instruction::Mod
            | Instruction::CmpEq
            | Instruction::CmpNe
            | Instruction::CmpLt
            | Instruction::CmpLe
            | Instruction::CmpGt
            | Instruction::CmpGe => (2, 1),
            Instruction::Neg | Instruction::Not => (1, 1),
            Instruction::Jump => {
                branch(a, depth, &mut work)?;
                continue;
            }
            Instruction::JumpIf | Instruction::JumpIfFalse => {
                if depth < 1 {
                    return Err(VerifyError::StackUnderflow { pc });
                }
                branch(a, depth - 1, &mut work)?;
                work.push((next, depth - 1));
                continue;
            }
            Instruction::Ret => {
                if depth < ret_pops {
                    return Err(VerifyError::StackUnderflow { pc });
                }
                continue;
            }
            Instruction::Throw => {
                if a >= names {
                    return Err(bad(pc, "message index out of range"));
                }
                continue;
            }
            Instruction::Call => {
                let info = calls
                    .get(a as usize)
                    .ok_or_else(|| bad(pc, "function index out of range"))?;
                if info.is_method {
                    return Err(bad(pc, "method called without an instance"));
                }
                (info.params, info.returns_value as u32)
            }
            Instruction::CallMethod => {
                let info = calls
                    .get(a as usize)
                    .ok_or_else(|| bad(pc, "function index out of range"))?;
                if !info.is_method {
                    return Err(bad(pc, "instance call of a non-method"));
                }
                (info.params + 1, info.returns_value as u32)
            }
            Instruction::New => {
                let facts = types
                    .get(a as usize)
                    .ok_or_else(|| bad(pc, "type index out of range"))?;
                if !facts.instantiable {
                    return Err(VerifyError::NotInstantiable(facts.name.clone()));
                }
                (0, 1)
            }
            Instruction::ValueAssign => {
                let facts = types
                    .get(a as usize)
                    .ok_or_else(|| bad(pc, "type index out of range"))?;
                if !facts.assignable {
                    return Err(VerifyError::MissingAssign(facts.name.clone()));
                }
                (2, 1)
            }
        };
        if depth < pops {
            return Err(VerifyError::StackUnderflow { pc });
        }
        work.push((next, depth - pops + pushes));
    }
    Ok(())
}
