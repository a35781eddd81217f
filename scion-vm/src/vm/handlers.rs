//! 指令处理函数。每个处理函数在取指之后执行，操作数栈上的句柄
//! 均持有一个引用，弹出即转移所有权，出错路径负责释放已弹出的值。

use crate::engine::Engine;
use crate::runtime::value::Value;
use crate::runtime::RuntimeError;

use super::context::{ExecutionContext, StepOutcome};
use super::instruction::Operands;

#[derive(Debug, Clone, Copy)]
enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

pub(crate) fn invalid_instruction(
    _ctx: &mut ExecutionContext,
    _engine: &mut Engine,
    _ops: &Operands,
) -> Result<StepOutcome, RuntimeError> {
    Err(RuntimeError::InvalidOperation(
        "invalid instruction".to_string(),
    ))
}

pub(crate) fn nop(
    _ctx: &mut ExecutionContext,
    _engine: &mut Engine,
    _ops: &Operands,
) -> Result<StepOutcome, RuntimeError> {
    Ok(StepOutcome::Continue)
}

// ---- 栈操作 ----

pub(crate) fn push_null(
    ctx: &mut ExecutionContext,
    _engine: &mut Engine,
    _ops: &Operands,
) -> Result<StepOutcome, RuntimeError> {
    ctx.push(Value::Null)?;
    Ok(StepOutcome::Continue)
}

pub(crate) fn push_bool(
    ctx: &mut ExecutionContext,
    _engine: &mut Engine,
    ops: &Operands,
) -> Result<StepOutcome, RuntimeError> {
    ctx.push(Value::Bool(ops.a != 0))?;
    Ok(StepOutcome::Continue)
}

pub(crate) fn push_int(
    ctx: &mut ExecutionContext,
    _engine: &mut Engine,
    ops: &Operands,
) -> Result<StepOutcome, RuntimeError> {
    ctx.push(Value::Int(ops.as_u64() as i64))?;
    Ok(StepOutcome::Continue)
}

pub(crate) fn push_uint(
    ctx: &mut ExecutionContext,
    _engine: &mut Engine,
    ops: &Operands,
) -> Result<StepOutcome, RuntimeError> {
    ctx.push(Value::Uint(ops.as_u64()))?;
    Ok(StepOutcome::Continue)
}

pub(crate) fn push_float(
    ctx: &mut ExecutionContext,
    _engine: &mut Engine,
    ops: &Operands,
) -> Result<StepOutcome, RuntimeError> {
    ctx.push(Value::Float(f32::from_bits(ops.a)))?;
    Ok(StepOutcome::Continue)
}

pub(crate) fn push_double(
    ctx: &mut ExecutionContext,
    _engine: &mut Engine,
    ops: &Operands,
) -> Result<StepOutcome, RuntimeError> {
    ctx.push(Value::Double(f64::from_bits(ops.as_u64())))?;
    Ok(StepOutcome::Continue)
}

pub(crate) fn discard_top(
    ctx: &mut ExecutionContext,
    engine: &mut Engine,
    _ops: &Operands,
) -> Result<StepOutcome, RuntimeError> {
    let v = ctx.pop()?;
    engine.release_value(v);
    Ok(StepOutcome::Continue)
}

pub(crate) fn dup_top(
    ctx: &mut ExecutionContext,
    engine: &mut Engine,
    _ops: &Operands,
) -> Result<StepOutcome, RuntimeError> {
    let v = ctx.top()?;
    engine.addref_value(v)?;
    ctx.push(v)?;
    Ok(StepOutcome::Continue)
}

pub(crate) fn swap_top(
    ctx: &mut ExecutionContext,
    _engine: &mut Engine,
    _ops: &Operands,
) -> Result<StepOutcome, RuntimeError> {
    let frame = ctx
        .frames
        .last_mut()
        .ok_or_else(|| RuntimeError::InvalidOperation("no active frame".to_string()))?;
    let n = frame.stack.len();
    if n < 2 {
        return Err(RuntimeError::InvalidOperation(
            "stack underflow".to_string(),
        ));
    }
    frame.stack.swap(n - 1, n - 2);
    Ok(StepOutcome::Continue)
}

// ---- 变量与属性 ----

pub(crate) fn load_var(
    ctx: &mut ExecutionContext,
    engine: &mut Engine,
    ops: &Operands,
) -> Result<StepOutcome, RuntimeError> {
    let v = ctx.local(ops.a)?;
    engine.addref_value(v)?;
    ctx.push(v)?;
    Ok(StepOutcome::Continue)
}

pub(crate) fn store_var(
    ctx: &mut ExecutionContext,
    engine: &mut Engine,
    ops: &Operands,
) -> Result<StepOutcome, RuntimeError> {
    let v = ctx.pop()?;
    ctx.store_local(engine, ops.a, v)?;
    Ok(StepOutcome::Continue)
}

pub(crate) fn free_var(
    ctx: &mut ExecutionContext,
    engine: &mut Engine,
    ops: &Operands,
) -> Result<StepOutcome, RuntimeError> {
    ctx.store_local(engine, ops.a, Value::Void)?;
    Ok(StepOutcome::Continue)
}

pub(crate) fn load_this(
    ctx: &mut ExecutionContext,
    engine: &mut Engine,
    _ops: &Operands,
) -> Result<StepOutcome, RuntimeError> {
    let this = ctx.frames.last().and_then(|f| f.this);
    match this {
        Some(h) => {
            engine.addref_object(h)?;
            ctx.push(Value::Object(h))?;
        }
        None => ctx.push(Value::Null)?,
    }
    Ok(StepOutcome::Continue)
}

pub(crate) fn load_field(
    ctx: &mut ExecutionContext,
    engine: &mut Engine,
    ops: &Operands,
) -> Result<StepOutcome, RuntimeError> {
    let obj = ctx.pop()?;
    let h = match obj.expect_object() {
        Ok(h) => h,
        Err(err) => {
            engine.release_value(obj);
            return Err(err);
        }
    };
    let v = match engine.read_script_field(h, ops.a) {
        Ok(v) => v,
        Err(err) => {
            engine.release_value(obj);
            return Err(err);
        }
    };
    if let Err(err) = engine.addref_value(v) {
        engine.release_value(obj);
        return Err(err);
    }
    engine.release_value(obj);
    ctx.push(v)?;
    Ok(StepOutcome::Continue)
}

pub(crate) fn store_field(
    ctx: &mut ExecutionContext,
    engine: &mut Engine,
    ops: &Operands,
) -> Result<StepOutcome, RuntimeError> {
    let v = ctx.pop()?;
    let obj = ctx.pop()?;
    let h = match obj.expect_object() {
        Ok(h) => h,
        Err(err) => {
            engine.release_value(v);
            return Err(err);
        }
    };
    // write_script_field consumes the value, success or not.
    let result = engine.write_script_field(h, ops.a, v);
    engine.release_value(obj);
    result?;
    Ok(StepOutcome::Continue)
}

pub(crate) fn load_global(
    ctx: &mut ExecutionContext,
    engine: &mut Engine,
    ops: &Operands,
) -> Result<StepOutcome, RuntimeError> {
    let mid = ctx
        .current_module()
        .ok_or_else(|| RuntimeError::InvalidOperation("no module for global access".to_string()))?;
    let slot = engine
        .module_global_slot(mid, ops.a)
        .ok_or_else(|| RuntimeError::UnknownEntity(format!("global #{}", ops.a)))?;
    let v = engine
        .global_value(slot)
        .ok_or_else(|| RuntimeError::UnknownEntity(format!("global slot {}", slot)))?;
    engine.addref_value(v)?;
    ctx.push(v)?;
    Ok(StepOutcome::Continue)
}

pub(crate) fn store_global(
    ctx: &mut ExecutionContext,
    engine: &mut Engine,
    ops: &Operands,
) -> Result<StepOutcome, RuntimeError> {
    let v = ctx.pop()?;
    let mid = match ctx.current_module() {
        Some(m) => m,
        None => {
            engine.release_value(v);
            return Err(RuntimeError::InvalidOperation(
                "no module for global access".to_string(),
            ));
        }
    };
    let slot = match engine.module_global_slot(mid, ops.a) {
        Some(s) => s,
        None => {
            engine.release_value(v);
            return Err(RuntimeError::UnknownEntity(format!("global #{}", ops.a)));
        }
    };
    engine.set_global_value(slot, v)?;
    Ok(StepOutcome::Continue)
}

// ---- 算术 ----

fn binary_arith(
    ctx: &mut ExecutionContext,
    engine: &mut Engine,
    op: ArithOp,
    method: &'static str,
) -> Result<StepOutcome, RuntimeError> {
    let rhs = ctx.pop()?;
    let lhs = ctx.pop()?;
    if lhs.is_object() {
        return operator_call(ctx, engine, method, lhs, rhs);
    }
    if rhs.is_object() {
        engine.release_value(rhs);
        return Err(RuntimeError::InvalidOperation(
            "arithmetic on object value".to_string(),
        ));
    }
    let v = arithmetic(lhs, rhs, op)?;
    ctx.push(v)?;
    Ok(StepOutcome::Continue)
}

pub(crate) fn binary_add(
    ctx: &mut ExecutionContext,
    engine: &mut Engine,
    _ops: &Operands,
) -> Result<StepOutcome, RuntimeError> {
    binary_arith(ctx, engine, ArithOp::Add, "opAdd")
}

pub(crate) fn binary_sub(
    ctx: &mut ExecutionContext,
    engine: &mut Engine,
    _ops: &Operands,
) -> Result<StepOutcome, RuntimeError> {
    binary_arith(ctx, engine, ArithOp::Sub, "opSub")
}

pub(crate) fn binary_mul(
    ctx: &mut ExecutionContext,
    engine: &mut Engine,
    _ops: &Operands,
) -> Result<StepOutcome, RuntimeError> {
    binary_arith(ctx, engine, ArithOp::Mul, "opMul")
}

pub(crate) fn binary_div(
    ctx: &mut ExecutionContext,
    engine: &mut Engine,
    _ops: &Operands,
) -> Result<StepOutcome, RuntimeError> {
    binary_arith(ctx, engine, ArithOp::Div, "opDiv")
}

pub(crate) fn binary_mod(
    ctx: &mut ExecutionContext,
    engine: &mut Engine,
    _ops: &Operands,
) -> Result<StepOutcome, RuntimeError> {
    binary_arith(ctx, engine, ArithOp::Mod, "opMod")
}

pub(crate) fn unary_neg(
    ctx: &mut ExecutionContext,
    engine: &mut Engine,
    _ops: &Operands,
) -> Result<StepOutcome, RuntimeError> {
    let v = ctx.pop()?;
    let r = match v {
        Value::Int(i) => Value::Int(i.wrapping_neg()),
        Value::Uint(u) => Value::Int((u as i64).wrapping_neg()),
        Value::Float(x) => Value::Float(-x),
        Value::Double(x) => Value::Double(-x),
        other => {
            engine.release_value(other);
            return Err(RuntimeError::InvalidOperation(
                "negation on non-numeric value".to_string(),
            ));
        }
    };
    ctx.push(r)?;
    Ok(StepOutcome::Continue)
}

/// Dispatches a registered operator method on the left operand.
/// Consumes both operands; `this` and the argument are handed to the
/// callee like any other method call.
fn operator_call(
    ctx: &mut ExecutionContext,
    engine: &mut Engine,
    name: &str,
    lhs: Value,
    rhs: Value,
) -> Result<StepOutcome, RuntimeError> {
    let h = match lhs.expect_object() {
        Ok(h) => h,
        Err(err) => {
            engine.release_value(rhs);
            return Err(err);
        }
    };
    let tid = match engine.object_type(h) {
        Some(t) => t,
        None => {
            engine.release_value(rhs);
            engine.release_value(lhs);
            return Err(RuntimeError::StaleObjectAccess);
        }
    };
    let method = match engine.find_method(tid, name, 1) {
        Some(f) => f,
        None => {
            let msg = format!("type '{}' does not implement {}", engine.type_name(tid), name);
            engine.release_value(rhs);
            engine.release_value(lhs);
            return Err(RuntimeError::InvalidOperation(msg));
        }
    };
    ctx.invoke_function(engine, method, Some(h), vec![rhs])?;
    Ok(StepOutcome::Continue)
}

// ---- 比较与逻辑 ----

fn values_equal(lhs: Value, rhs: Value) -> Result<bool, RuntimeError> {
    Ok(match (lhs, rhs) {
        (Value::Null, _) | (_, Value::Null) | (Value::Object(_), _) | (_, Value::Object(_)) => {
            lhs.same(&rhs)
        }
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Int(a), Value::Int(b)) => a == b,
        (Value::Uint(a), Value::Uint(b)) => a == b,
        (Value::Void, _) | (_, Value::Void) => false,
        _ => lhs.as_double()? == rhs.as_double()?,
    })
}

fn values_order(lhs: Value, rhs: Value) -> Result<Option<std::cmp::Ordering>, RuntimeError> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => Ok(Some(a.cmp(&b))),
        (Value::Uint(a), Value::Uint(b)) => Ok(Some(a.cmp(&b))),
        _ => {
            if lhs.is_object() || rhs.is_object() {
                return Err(RuntimeError::InvalidOperation(
                    "ordering comparison on object values".to_string(),
                ));
            }
            let a = lhs.as_double()?;
            let b = rhs.as_double()?;
            Ok(a.partial_cmp(&b))
        }
    }
}

fn binary_equality(
    ctx: &mut ExecutionContext,
    engine: &mut Engine,
    negate: bool,
) -> Result<StepOutcome, RuntimeError> {
    let rhs = ctx.pop()?;
    let lhs = ctx.pop()?;
    let eq = values_equal(lhs, rhs)?;
    engine.release_value(lhs);
    engine.release_value(rhs);
    ctx.push(Value::Bool(eq != negate))?;
    Ok(StepOutcome::Continue)
}

fn binary_ordering(
    ctx: &mut ExecutionContext,
    engine: &mut Engine,
    accept: fn(std::cmp::Ordering) -> bool,
) -> Result<StepOutcome, RuntimeError> {
    let rhs = ctx.pop()?;
    let lhs = ctx.pop()?;
    let ord = match values_order(lhs, rhs) {
        Ok(ord) => ord,
        Err(err) => {
            engine.release_value(lhs);
            engine.release_value(rhs);
            return Err(err);
        }
    };
    // Unordered (NaN) compares false under every relation.
    ctx.push(Value::Bool(ord.map(accept).unwrap_or(false)))?;
    Ok(StepOutcome::Continue)
}

pub(crate) fn cmp_eq(
    ctx: &mut ExecutionContext,
    engine: &mut Engine,
    _ops: &Operands,
) -> Result<StepOutcome, RuntimeError> {
    binary_equality(ctx, engine, false)
}

pub(crate) fn cmp_ne(
    ctx: &mut ExecutionContext,
    engine: &mut Engine,
    _ops: &Operands,
) -> Result<StepOutcome, RuntimeError> {
    binary_equality(ctx, engine, true)
}

pub(crate) fn cmp_lt(
    ctx: &mut ExecutionContext,
    engine: &mut Engine,
    _ops: &Operands,
) -> Result<StepOutcome, RuntimeError> {
    binary_ordering(ctx, engine, std::cmp::Ordering::is_lt)
}

pub(crate) fn cmp_le(
    ctx: &mut ExecutionContext,
    engine: &mut Engine,
    _ops: &Operands,
) -> Result<StepOutcome, RuntimeError> {
    binary_ordering(ctx, engine, std::cmp::Ordering::is_le)
}

pub(crate) fn cmp_gt(
    ctx: &mut ExecutionContext,
    engine: &mut Engine,
    _ops: &Operands,
) -> Result<StepOutcome, RuntimeError> {
    binary_ordering(ctx, engine, std::cmp::Ordering::is_gt)
}

pub(crate) fn cmp_ge(
    ctx: &mut ExecutionContext,
    engine: &mut Engine,
    _ops: &Operands,
) -> Result<StepOutcome, RuntimeError> {
    binary_ordering(ctx, engine, std::cmp::Ordering::is_ge)
}

pub(crate) fn logic_not(
    ctx: &mut ExecutionContext,
    engine: &mut Engine,
    _ops: &Operands,
) -> Result<StepOutcome, RuntimeError> {
    let v = ctx.pop()?;
    let c = match v.as_bool() {
        Ok(c) => c,
        Err(err) => {
            engine.release_value(v);
            return Err(err);
        }
    };
    ctx.push(Value::Bool(!c))?;
    Ok(StepOutcome::Continue)
}

// ---- 控制流 ----

pub(crate) fn jump(
    ctx: &mut ExecutionContext,
    _engine: &mut Engine,
    ops: &Operands,
) -> Result<StepOutcome, RuntimeError> {
    ctx.jump(ops.a);
    Ok(StepOutcome::Continue)
}

pub(crate) fn jump_if(
    ctx: &mut ExecutionContext,
    engine: &mut Engine,
    ops: &Operands,
) -> Result<StepOutcome, RuntimeError> {
    let v = ctx.pop()?;
    let c = match v.as_bool() {
        Ok(c) => c,
        Err(err) => {
            engine.release_value(v);
            return Err(err);
        }
    };
    if c {
        ctx.jump(ops.a);
    }
    Ok(StepOutcome::Continue)
}

pub(crate) fn jump_if_false(
    ctx: &mut ExecutionContext,
    engine: &mut Engine,
    ops: &Operands,
) -> Result<StepOutcome, RuntimeError> {
    let v = ctx.pop()?;
    let c = match v.as_bool() {
        Ok(c) => c,
        Err(err) => {
            engine.release_value(v);
            return Err(err);
        }
    };
    if !c {
        ctx.jump(ops.a);
    }
    Ok(StepOutcome::Continue)
}

pub(crate) fn return_value(
    ctx: &mut ExecutionContext,
    engine: &mut Engine,
    _ops: &Operands,
) -> Result<StepOutcome, RuntimeError> {
    ctx.return_from_frame(engine)
}

// ---- 调用与对象 ----

fn pop_args(
    ctx: &mut ExecutionContext,
    engine: &mut Engine,
    count: usize,
) -> Result<Vec<Value>, RuntimeError> {
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        match ctx.pop() {
            Ok(v) => args.push(v),
            Err(err) => {
                for v in args {
                    engine.release_value(v);
                }
                return Err(err);
            }
        }
    }
    args.reverse();
    Ok(args)
}

pub(crate) fn call_function(
    ctx: &mut ExecutionContext,
    engine: &mut Engine,
    ops: &Operands,
) -> Result<StepOutcome, RuntimeError> {
    let mid = ctx
        .current_module()
        .ok_or_else(|| RuntimeError::InvalidOperation("no module for call".to_string()))?;
    let function = engine
        .module_function(mid, ops.a)
        .ok_or_else(|| RuntimeError::UnknownEntity(format!("function #{}", ops.a)))?;
    let param_count = engine
        .function(function)
        .map(|d| d.param_count())
        .unwrap_or(0);
    let args = pop_args(ctx, engine, param_count)?;
    ctx.invoke_function(engine, function, None, args)?;
    Ok(StepOutcome::Continue)
}

pub(crate) fn call_method(
    ctx: &mut ExecutionContext,
    engine: &mut Engine,
    ops: &Operands,
) -> Result<StepOutcome, RuntimeError> {
    let mid = ctx
        .current_module()
        .ok_or_else(|| RuntimeError::InvalidOperation("no module for call".to_string()))?;
    let function = engine
        .module_function(mid, ops.a)
        .ok_or_else(|| RuntimeError::UnknownEntity(format!("function #{}", ops.a)))?;
    let param_count = engine
        .function(function)
        .map(|d| d.param_count())
        .unwrap_or(0);
    let args = pop_args(ctx, engine, param_count)?;
    let obj = match ctx.pop() {
        Ok(v) => v,
        Err(err) => {
            for v in args {
                engine.release_value(v);
            }
            return Err(err);
        }
    };
    let h = match obj.expect_object() {
        Ok(h) => h,
        Err(err) => {
            for v in args {
                engine.release_value(v);
            }
            engine.release_value(obj);
            return Err(err);
        }
    };
    ctx.invoke_function(engine, function, Some(h), args)?;
    Ok(StepOutcome::Continue)
}

pub(crate) fn new_object(
    ctx: &mut ExecutionContext,
    engine: &mut Engine,
    ops: &Operands,
) -> Result<StepOutcome, RuntimeError> {
    let mid = ctx
        .current_module()
        .ok_or_else(|| RuntimeError::InvalidOperation("no module for construction".to_string()))?;
    let tid = engine
        .module_type(mid, ops.a)
        .ok_or_else(|| RuntimeError::UnknownEntity(format!("type #{}", ops.a)))?;
    let v = engine.instantiate(tid)?;
    ctx.push(v)?;
    Ok(StepOutcome::Continue)
}

pub(crate) fn value_assign(
    ctx: &mut ExecutionContext,
    engine: &mut Engine,
    ops: &Operands,
) -> Result<StepOutcome, RuntimeError> {
    let src = ctx.pop()?;
    let dst = ctx.pop()?;
    let release_both = |engine: &mut Engine| {
        engine.release_value(src);
        engine.release_value(dst);
    };
    let mid = match ctx.current_module() {
        Some(m) => m,
        None => {
            release_both(engine);
            return Err(RuntimeError::InvalidOperation(
                "no module for assignment".to_string(),
            ));
        }
    };
    let tid = match engine.module_type(mid, ops.a) {
        Some(t) => t,
        None => {
            release_both(engine);
            return Err(RuntimeError::UnknownEntity(format!("type #{}", ops.a)));
        }
    };
    let dst_h = match dst.expect_object() {
        Ok(h) => h,
        Err(err) => {
            release_both(engine);
            return Err(err);
        }
    };
    let src_h = match src.expect_object() {
        Ok(h) => h,
        Err(err) => {
            release_both(engine);
            return Err(err);
        }
    };
    if let Err(err) = engine.assign_value(tid, dst_h, src_h) {
        release_both(engine);
        return Err(err);
    }
    engine.release_value(src);
    // The destination keeps its reference and goes back on the stack.
    ctx.push(dst)?;
    Ok(StepOutcome::Continue)
}

pub(crate) fn throw_message(
    ctx: &mut ExecutionContext,
    engine: &mut Engine,
    ops: &Operands,
) -> Result<StepOutcome, RuntimeError> {
    let msg = ctx
        .current_module()
        .and_then(|mid| engine.module_message(mid, ops.a))
        .unwrap_or_else(|| "script exception".to_string());
    Err(RuntimeError::HostException(msg))
}

// ---- 纯算术实现 ----

fn arithmetic(lhs: Value, rhs: Value, op: ArithOp) -> Result<Value, RuntimeError> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => int_arithmetic(a, b, op),
        (Value::Uint(a), Value::Uint(b)) => uint_arithmetic(a, b, op),
        (Value::Float(a), Value::Float(b)) => {
            Ok(Value::Float(float_arithmetic(a as f64, b as f64, op) as f32))
        }
        _ => {
            let a = lhs.as_double()?;
            let b = rhs.as_double()?;
            Ok(Value::Double(float_arithmetic(a, b, op)))
        }
    }
}

fn int_arithmetic(a: i64, b: i64, op: ArithOp) -> Result<Value, RuntimeError> {
    let v = match op {
        ArithOp::Add => a.wrapping_add(b),
        ArithOp::Sub => a.wrapping_sub(b),
        ArithOp::Mul => a.wrapping_mul(b),
        ArithOp::Div => {
            if b == 0 {
                return Err(RuntimeError::DivideByZero);
            }
            if a == i64::MIN && b == -1 {
                return Err(RuntimeError::DivideOverflow);
            }
            a / b
        }
        ArithOp::Mod => {
            if b == 0 {
                return Err(RuntimeError::DivideByZero);
            }
            if a == i64::MIN && b == -1 {
                return Err(RuntimeError::DivideOverflow);
            }
            a % b
        }
    };
    Ok(Value::Int(v))
}

fn uint_arithmetic(a: u64, b: u64, op: ArithOp) -> Result<Value, RuntimeError> {
    let v = match op {
        ArithOp::Add => a.wrapping_add(b),
        ArithOp::Sub => a.wrapping_sub(b),
        ArithOp::Mul => a.wrapping_mul(b),
        ArithOp::Div => {
            if b == 0 {
                return Err(RuntimeError::DivideByZero);
            }
            a / b
        }
        ArithOp::Mod => {
            if b == 0 {
                return Err(RuntimeError::DivideByZero);
            }
            a % b
        }
    };
    Ok(Value::Uint(v))
}

fn float_arithmetic(a: f64, b: f64, op: ArithOp) -> f64 {
    match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => a / b,
        ArithOp::Mod => a % b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_divide_by_zero() {
        assert!(matches!(
            int_arithmetic(7, 0, ArithOp::Div),
            Err(RuntimeError::DivideByZero)
        ));
        assert!(matches!(
            int_arithmetic(7, 0, ArithOp::Mod),
            Err(RuntimeError::DivideByZero)
        ));
    }

    #[test]
    fn test_int_divide_overflow() {
        assert!(matches!(
            int_arithmetic(i64::MIN, -1, ArithOp::Div),
            Err(RuntimeError::DivideOverflow)
        ));
        assert!(matches!(
            int_arithmetic(i64::MIN, -1, ArithOp::Mod),
            Err(RuntimeError::DivideOverflow)
        ));
    }

    #[test]
    fn test_int_arithmetic_wraps() {
        assert_eq!(
            int_arithmetic(i64::MAX, 1, ArithOp::Add).unwrap(),
            Value::Int(i64::MIN)
        );
    }

    #[test]
    fn test_mixed_arithmetic_promotes_to_double() {
        let v = arithmetic(Value::Int(3), Value::Double(0.5), ArithOp::Add).unwrap();
        assert_eq!(v, Value::Double(3.5));
        let v = arithmetic(Value::Uint(10), Value::Int(4), ArithOp::Div).unwrap();
        assert_eq!(v, Value::Double(2.5));
    }

    #[test]
    fn test_equality_rules() {
        assert!(values_equal(Value::Null, Value::Null).unwrap());
        assert!(!values_equal(Value::Null, Value::Int(0)).unwrap());
        assert!(values_equal(Value::Int(2), Value::Double(2.0)).unwrap());
        assert!(values_equal(Value::Bool(true), Value::Bool(true)).unwrap());
    }

    #[test]
    fn test_nan_is_unordered() {
        let ord = values_order(Value::Double(f64::NAN), Value::Double(1.0)).unwrap();
        assert!(ord.is_none());
    }
}
