use std::sync::Arc;

use crate::dispatch::convention::CallConvention;
use crate::dispatch::generic::GenericFn;
use crate::dispatch::native::NativeCall;

use super::descriptor::{FunctionId, ResolvedType, Signature, TypeId};

/// A local variable declaration of a script function, with the program
/// counter range in which it is in scope.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde_support", derive(serde::Serialize, serde::Deserialize))]
pub struct LocalVarDecl {
    pub name: String,
    pub ty: ResolvedType,
    pub slot: u32,
    pub scope_start: u32,
    pub scope_end: u32,
}

impl LocalVarDecl {
    pub fn in_scope(&self, pc: u32) -> bool {
        pc >= self.scope_start && pc < self.scope_end
    }
}

/// Executable body of a script function: code, local declarations and
/// the pc to source-line table. Shared between the descriptor and every
/// live frame through an `Arc`.
#[derive(Debug, Clone)]
pub struct ScriptCode {
    pub code: Vec<u32>,
    pub locals: Vec<LocalVarDecl>,
    /// Sorted `(pc, line)` pairs. A pc maps to the last entry at or
    /// before it.
    pub line_table: Vec<(u32, u32)>,
}

impl ScriptCode {
    pub fn line_for_pc(&self, pc: u32) -> u32 {
        match self.line_table.binary_search_by_key(&pc, |&(p, _)| p) {
            Ok(i) => self.line_table[i].1,
            Err(0) => 0,
            Err(i) => self.line_table[i - 1].1,
        }
    }

    pub fn local_count(&self) -> usize {
        self.locals.len()
    }
}

/// What runs when the function is invoked.
pub enum FunctionBody {
    /// Bytecode installed from a module image.
    Script(Arc<ScriptCode>),
    /// Host function using the portable generic convention.
    Generic(GenericFn),
    /// Host function called through a prepared foreign-call descriptor.
    Native(NativeCall),
}

impl std::fmt::Debug for FunctionBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FunctionBody::Script(code) => f
                .debug_struct("Script")
                .field("words", &code.code.len())
                .finish(),
            FunctionBody::Generic(_) => f.write_str("Generic"),
            FunctionBody::Native(call) => call.fmt(f),
        }
    }
}

/// Descriptor of one callable function, host or script.
#[derive(Debug)]
pub struct FunctionDescriptor {
    pub id: FunctionId,
    pub name: String,
    /// Set for methods and behaviors of an object type.
    pub object_type: Option<TypeId>,
    pub signature: Signature,
    pub convention: CallConvention,
    pub body: FunctionBody,
    /// Set for functions installed from a module, used when the module
    /// is discarded.
    pub module: Option<u32>,
}

impl FunctionDescriptor {
    pub fn is_script(&self) -> bool {
        matches!(self.body, FunctionBody::Script(_))
    }

    pub fn script_code(&self) -> Option<&ScriptCode> {
        match &self.body {
            FunctionBody::Script(code) => Some(code.as_ref()),
            _ => None,
        }
    }

    pub fn script_code_arc(&self) -> Option<Arc<ScriptCode>> {
        match &self.body {
            FunctionBody::Script(code) => Some(Arc::clone(code)),
            _ => None,
        }
    }

    pub fn param_count(&self) -> usize {
        self.signature.params.len()
    }

    /// Declaration string for diagnostics, e.g. `"node@ factory(int)"`.
    pub fn declaration(&self, type_name: impl Fn(TypeId) -> String) -> String {
        let fmt_ty = |t: &ResolvedType| {
            let mut s = type_name(t.id);
            if t.is_handle {
                s.push('@');
            }
            s
        };
        let params = self
            .signature
            .params
            .iter()
            .map(|p| fmt_ty(p))
            .collect::<Vec<_>>()
            .join(", ");
        format!("{} {}({})", fmt_ty(&self.signature.ret), self.name, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_code() -> ScriptCode {
        ScriptCode {
            code: vec![0; 8],
            locals: vec![
                LocalVarDecl {
                    name: "i".into(),
                    ty: ResolvedType::plain(TypeId::INT32),
                    slot: 0,
                    scope_start: 0,
                    scope_end: 8,
                },
                LocalVarDecl {
                    name: "i".into(),
                    ty: ResolvedType::plain(TypeId::DOUBLE),
                    slot: 1,
                    scope_start: 3,
                    scope_end: 6,
                },
            ],
            line_table: vec![(0, 1), (2, 2), (5, 4)],
        }
    }

    #[test]
    fn test_line_for_pc() {
        let code = sample_code();
        assert_eq!(code.line_for_pc(0), 1);
        assert_eq!(code.line_for_pc(1), 1);
        assert_eq!(code.line_for_pc(2), 2);
        assert_eq!(code.line_for_pc(4), 2);
        assert_eq!(code.line_for_pc(5), 4);
        assert_eq!(code.line_for_pc(100), 4);
    }

    #[test]
    fn test_shadowed_local_scopes() {
        let code = sample_code();
        let at = |pc: u32| {
            code.locals
                .iter()
                .filter(|l| l.in_scope(pc))
                .count()
        };
        assert_eq!(at(0), 1);
        assert_eq!(at(4), 2);
        assert_eq!(at(7), 1);
    }
}
