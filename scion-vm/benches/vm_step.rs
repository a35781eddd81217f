//! Interpreter micro-benchmarks: straight-line arithmetic, recursive
//! calls, and generic host dispatch.
//!
//! Run with: cargo bench -p scion-vm --bench vm_step

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use scion_vm::{
    CallConvention, CodeBuilder, ContextState, Engine, FunctionId, GenericCall, HostEntry,
    Instruction, ModuleImage, RuntimeError,
};

fn run(engine: &mut Engine, entry: FunctionId, n: i64) -> i64 {
    let mut ctx = engine.create_context();
    ctx.prepare(engine, entry).unwrap();
    ctx.set_arg_int(0, n).unwrap();
    assert_eq!(ctx.execute(engine).unwrap(), ContextState::Finished);
    ctx.return_int().unwrap()
}

/// `int sum_below(int n)`: counted loop, no calls.
fn sum_image() -> ModuleImage {
    let mut image = ModuleImage::new("sums");
    let mut code = CodeBuilder::new();
    code.push_int(0).op1(Instruction::StoreVar, 1);
    code.push_int(0).op1(Instruction::StoreVar, 2);
    let top = code.pc();
    code.op1(Instruction::LoadVar, 2)
        .op1(Instruction::LoadVar, 0)
        .op(Instruction::CmpLt);
    let exit = code.jump_slot(Instruction::JumpIfFalse);
    code.op1(Instruction::LoadVar, 1)
        .op1(Instruction::LoadVar, 2)
        .op(Instruction::Add)
        .op1(Instruction::StoreVar, 1)
        .op1(Instruction::LoadVar, 2)
        .push_int(1)
        .op(Instruction::Add)
        .op1(Instruction::StoreVar, 2)
        .op1(Instruction::Jump, top);
    let done = code.pc();
    code.patch(exit, done);
    code.op1(Instruction::LoadVar, 1).op(Instruction::Ret);
    let vars = vec![
        image.local("int n", 0, 0, 64),
        image.local("int acc", 1, 0, 64),
        image.local("int i", 2, 0, 64),
    ];
    let f = image.add_script_function("int sum_below(int)", None, code.finish(), vars, vec![(0, 1)]);
    image.add_entry("sum_below", f);
    image
}

/// `int fib(int n)`: naive recursion, two calls per level.
fn fib_image() -> ModuleImage {
    let mut image = ModuleImage::new("fibs");
    let mut code = CodeBuilder::new();
    code.op1(Instruction::LoadVar, 0).push_int(2).op(Instruction::CmpLt);
    let recurse = code.jump_slot(Instruction::JumpIfFalse);
    code.op1(Instruction::LoadVar, 0).op(Instruction::Ret);
    let target = code.pc();
    code.patch(recurse, target);
    code.op1(Instruction::LoadVar, 0)
        .push_int(1)
        .op(Instruction::Sub)
        .op1(Instruction::Call, 0)
        .op1(Instruction::LoadVar, 0)
        .push_int(2)
        .op(Instruction::Sub)
        .op1(Instruction::Call, 0)
        .op(Instruction::Add)
        .op(Instruction::Ret);
    let vars = vec![image.local("int n", 0, 0, 64)];
    let f = image.add_script_function("int fib(int)", None, code.finish(), vars, vec![(0, 1)]);
    image.add_entry("fib", f);
    image
}

fn twice(call: &mut GenericCall<'_>) -> Result<(), RuntimeError> {
    let v = call.arg_int(0)?;
    call.set_return_int(v * 2);
    Ok(())
}

/// `int pump(int n)`: the same loop, but every iteration crosses into
/// a generic host function.
fn pump_image() -> ModuleImage {
    let mut image = ModuleImage::new("pumps");
    let host = image.add_import("int twice(int)", None);
    let mut code = CodeBuilder::new();
    code.push_int(0).op1(Instruction::StoreVar, 1);
    code.push_int(0).op1(Instruction::StoreVar, 2);
    let top = code.pc();
    code.op1(Instruction::LoadVar, 2)
        .op1(Instruction::LoadVar, 0)
        .op(Instruction::CmpLt);
    let exit = code.jump_slot(Instruction::JumpIfFalse);
    code.op1(Instruction::LoadVar, 1)
        .op1(Instruction::LoadVar, 2)
        .op1(Instruction::Call, host)
        .op(Instruction::Add)
        .op1(Instruction::StoreVar, 1)
        .op1(Instruction::LoadVar, 2)
        .push_int(1)
        .op(Instruction::Add)
        .op1(Instruction::StoreVar, 2)
        .op1(Instruction::Jump, top);
    let done = code.pc();
    code.patch(exit, done);
    code.op1(Instruction::LoadVar, 1).op(Instruction::Ret);
    let vars = vec![
        image.local("int n", 0, 0, 64),
        image.local("int acc", 1, 0, 64),
        image.local("int i", 2, 0, 64),
    ];
    let f = image.add_script_function("int pump(int)", None, code.finish(), vars, vec![(0, 1)]);
    image.add_entry("pump", f);
    image
}

fn bench_sum_loop(c: &mut Criterion) {
    let mut engine = Engine::new();
    engine.finalize();
    let mid = engine.install_module(&sum_image()).unwrap();
    let entry = engine.entry_point(mid, "sum_below").unwrap();
    assert_eq!(run(&mut engine, entry, 1000), 499_500);
    c.bench_function("sum_loop/1000", |b| {
        b.iter(|| black_box(run(&mut engine, entry, black_box(1000))))
    });
}

fn bench_fib_recursive(c: &mut Criterion) {
    let mut engine = Engine::new();
    engine.finalize();
    let mid = engine.install_module(&fib_image()).unwrap();
    let entry = engine.entry_point(mid, "fib").unwrap();
    assert_eq!(run(&mut engine, entry, 15), 610);
    c.bench_function("fib_recursive/15", |b| {
        b.iter(|| black_box(run(&mut engine, entry, black_box(15))))
    });
}

fn bench_host_dispatch(c: &mut Criterion) {
    let mut engine = Engine::new();
    engine
        .register_global_function(
            "int twice(int)",
            HostEntry::Generic(twice),
            CallConvention::Generic,
        )
        .unwrap();
    engine.finalize();
    let mid = engine.install_module(&pump_image()).unwrap();
    let entry = engine.entry_point(mid, "pump").unwrap();
    assert_eq!(run(&mut engine, entry, 1000), 999_000);
    c.bench_function("host_dispatch/1000", |b| {
        b.iter(|| black_box(run(&mut engine, entry, black_box(1000))))
    });
}

criterion_group!(
    benches,
    bench_sum_loop,
    bench_fib_recursive,
    bench_host_dispatch
);
criterion_main!(benches);
