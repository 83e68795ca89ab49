//! Benchmarks for the register compiler and VM.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use forge_vm::ast::build::*;
use forge_vm::ast::{BinaryOp, Program};
use forge_vm::vm::{Compiler, Vm};

/// Compile and execute on a fresh VM.
fn run_vm(program: &Program) {
    let module = Compiler::compile(program).expect("compile error");
    let mut vm = Vm::new();
    vm.execute(&module.main).expect("vm runtime error");
}

/// fn fib(n) { if (n <= 1) { return n; } return fib(n - 1) + fib(n - 2); } fib(n)
fn fib_program(n: i64) -> Program {
    program(vec![
        func(
            "fib",
            &["n"],
            vec![
                if_(binary(var("n"), BinaryOp::LessEqual, int(1)), vec![ret(var("n"))], None),
                ret(binary(
                    call("fib", vec![binary(var("n"), BinaryOp::Subtract, int(1))]),
                    BinaryOp::Add,
                    call("fib", vec![binary(var("n"), BinaryOp::Subtract, int(2))]),
                )),
            ],
        ),
        expr_stmt(call("fib", vec![int(n)])),
    ])
}

/// let mut sum = 0; let mut i = 0; while (i < n) { sum = sum + i; i = i + 1; } sum
fn loop_sum_program(n: i64) -> Program {
    program(vec![
        let_mut("sum", int(0)),
        let_mut("i", int(0)),
        while_(
            binary(var("i"), BinaryOp::Less, int(n)),
            vec![
                expr_stmt(assign("sum", binary(var("sum"), BinaryOp::Add, var("i")))),
                expr_stmt(assign("i", binary(var("i"), BinaryOp::Add, int(1)))),
            ],
        ),
        expr_stmt(var("sum")),
    ])
}

/// A counter closure called `n` times through its captured cell.
fn closure_counter_program(n: i64) -> Program {
    program(vec![
        func(
            "counter",
            &[],
            vec![
                let_mut("count", int(0)),
                ret(lambda(
                    &[],
                    vec![
                        expr_stmt(assign("count", binary(var("count"), BinaryOp::Add, int(1)))),
                        ret(var("count")),
                    ],
                )),
            ],
        ),
        let_("tick", call("counter", vec![])),
        let_mut("i", int(0)),
        while_(
            binary(var("i"), BinaryOp::Less, int(n)),
            vec![
                expr_stmt(call("tick", vec![])),
                expr_stmt(assign("i", binary(var("i"), BinaryOp::Add, int(1)))),
            ],
        ),
        expr_stmt(call("tick", vec![])),
    ])
}

/// Allocates a short-lived array and map every iteration to keep the collector busy.
fn allocation_program(n: i64) -> Program {
    program(vec![
        let_mut("i", int(0)),
        let_mut("kept", array(vec![])),
        while_(
            binary(var("i"), BinaryOp::Less, int(n)),
            vec![
                let_("tmp", array(vec![var("i"), string("x"), map(vec![("k", var("i"))])])),
                if_(
                    binary(binary(var("i"), BinaryOp::Modulo, int(100)), BinaryOp::Equal, int(0)),
                    vec![expr_stmt(call("push", vec![var("kept"), var("tmp")]))],
                    None,
                ),
                expr_stmt(assign("i", binary(var("i"), BinaryOp::Add, int(1)))),
            ],
        ),
        expr_stmt(call("len", vec![var("kept")])),
    ])
}

fn fibonacci(c: &mut Criterion) {
    let mut group = c.benchmark_group("fib_recursive");

    for n in [10, 15, 20].iter() {
        let program = fib_program(*n);
        group.bench_with_input(BenchmarkId::new("vm", n), &program, |b, p| {
            b.iter(|| run_vm(black_box(p)))
        });
    }

    group.finish();
}

fn loop_sum(c: &mut Criterion) {
    let mut group = c.benchmark_group("loop_sum");
    let program = loop_sum_program(10_000);

    group.bench_function("vm", |b| b.iter(|| run_vm(black_box(&program))));

    group.finish();
}

fn closures(c: &mut Criterion) {
    let mut group = c.benchmark_group("closure_counter");
    let program = closure_counter_program(10_000);

    group.bench_function("vm", |b| b.iter(|| run_vm(black_box(&program))));

    group.finish();
}

fn allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocation_gc");
    let program = allocation_program(5_000);

    group.bench_function("vm", |b| b.iter(|| run_vm(black_box(&program))));

    group.finish();
}

/// Benchmark compilation time alone (not execution).
fn compilation_overhead(c: &mut Criterion) {
    let mut group = c.benchmark_group("compilation_overhead");

    let program = fib_program(20);
    group.bench_function("compile_fib", |b| {
        b.iter(|| Compiler::compile(black_box(&program)).unwrap())
    });

    let program = allocation_program(10);
    group.bench_function("compile_alloc", |b| {
        b.iter(|| Compiler::compile(black_box(&program)).unwrap())
    });

    group.finish();
}

criterion_group!(benches, fibonacci, loop_sum, closures, allocation, compilation_overhead);

criterion_main!(benches);
