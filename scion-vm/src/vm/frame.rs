use std::sync::Arc;

use crate::runtime::heap::ObjectHandle;
use crate::runtime::value::Value;
use crate::types::descriptor::FunctionId;
use crate::types::function::ScriptCode;

/// One activation record. All interpreter state lives here so a context
/// can suspend between any two instructions without unwinding native
/// frames.
#[derive(Debug, Clone)]
pub struct Frame {
    pub function: FunctionId,
    /// Module the function was installed from; operands resolve through
    /// its maps.
    pub module: Option<u32>,
    pub this: Option<ObjectHandle>,
    pub ip: u32,
    pub script: Arc<ScriptCode>,
    pub locals: Vec<Value>,
    pub stack: Vec<Value>,
}

impl Frame {
    pub fn new(
        function: FunctionId,
        module: Option<u32>,
        this: Option<ObjectHandle>,
        script: Arc<ScriptCode>,
    ) -> Self {
        let locals = vec![Value::Void; script.local_count()];
        Frame {
            function,
            module,
            this,
            ip: 0,
            script,
            locals,
            stack: Vec::new(),
        }
    }

    pub fn current_line(&self) -> u32 {
        self.script.line_for_pc(self.ip)
    }

    /// Stack slots this frame occupies, for the context-wide limit.
    pub fn slot_count(&self) -> usize {
        self.locals.len() + self.stack.len()
    }
}
