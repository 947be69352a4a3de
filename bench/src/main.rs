use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use iris::config::{EmitterKind, JitMode, RuntimeConfig};
use iris::runtime::Engine;
use iris::vm::{BytecodeProgram, FunctionInfo, Instr, OpCode};
use serde::Serialize;

#[derive(Serialize)]
struct BenchmarkResult {
    name: String,
    output: Vec<String>,
    iris_jit_vm_secs: f64,
    iris_jit_baseline_secs: f64,
    iris_jit_off_secs: f64,
    rust_time_secs: f64,
}

#[derive(Serialize)]
struct BenchmarkOutput {
    results: Vec<BenchmarkResult>,
}

// Rust reference implementations

fn rust_sum_loop(n: i64) -> i64 {
    let mut sum: i64 = 0;
    for i in 1..=n {
        sum += i;
    }
    sum
}

fn rust_fibonacci(n: i64) -> i64 {
    if n < 2 { n } else { rust_fibonacci(n - 1) + rust_fibonacci(n - 2) }
}

fn rust_array_sum(n: i64) -> i64 {
    let values: Vec<i64> = (0..n).map(|i| i * 2).collect();
    values.iter().sum()
}

fn time_rust<F>(f: F) -> f64
where
    F: FnOnce() -> i64,
{
    let start = Instant::now();
    let value = f();
    let elapsed = start.elapsed().as_secs_f64();
    eprintln!("{}", value);
    elapsed
}

// Bytecode programs

fn op(op: OpCode) -> Instr {
    Instr::new(op)
}

fn with(op: OpCode, operand: i64) -> Instr {
    Instr::with(op, operand)
}

/// main: print(f(n)) where f is the single function at ip 4.
fn with_main(n: i64, body: Vec<Instr>, info: FunctionInfo) -> BytecodeProgram {
    let mut code = vec![
        with(OpCode::PushI64, n),
        with(OpCode::Call, 0),
        op(OpCode::PrintI64),
        op(OpCode::Halt),
    ];
    code.extend(body);
    BytecodeProgram::new(code, vec![info])
}

fn fibonacci(n: i64) -> BytecodeProgram {
    with_main(
        n,
        vec![
            with(OpCode::LoadLocal, 0),
            with(OpCode::PushI64, 2),
            op(OpCode::CmpLt),
            with(OpCode::JmpIfFalse, 10),
            with(OpCode::LoadLocal, 0),
            op(OpCode::Ret),
            with(OpCode::LoadLocal, 0),
            with(OpCode::PushI64, 1),
            op(OpCode::Sub),
            with(OpCode::Call, 0),
            with(OpCode::LoadLocal, 0),
            with(OpCode::PushI64, 2),
            op(OpCode::Sub),
            with(OpCode::Call, 0),
            op(OpCode::Add),
            op(OpCode::Ret),
        ],
        FunctionInfo::new("fib", 4, 1, 1, true),
    )
}

/// sum(n): locals n, i, acc
fn sum_loop(n: i64) -> BytecodeProgram {
    with_main(
        n,
        vec![
            with(OpCode::PushI64, 1),
            with(OpCode::StoreLocal, 1),
            with(OpCode::PushI64, 0),
            with(OpCode::StoreLocal, 2),
            // loop @ 8
            with(OpCode::LoadLocal, 1),
            with(OpCode::LoadLocal, 0),
            op(OpCode::CmpLe),
            with(OpCode::JmpIfFalse, 21),
            with(OpCode::LoadLocal, 2),
            with(OpCode::LoadLocal, 1),
            op(OpCode::Add),
            with(OpCode::StoreLocal, 2),
            with(OpCode::LoadLocal, 1),
            with(OpCode::PushI64, 1),
            op(OpCode::Add),
            with(OpCode::StoreLocal, 1),
            with(OpCode::Jmp, 8),
            // exit @ 21
            with(OpCode::LoadLocal, 2),
            op(OpCode::Ret),
        ],
        FunctionInfo::new("sum", 4, 1, 3, true),
    )
}

/// array_sum(n): locals n, arr, i, acc. Fills arr[i] = 2i, then sums it.
fn array_sum(n: i64) -> BytecodeProgram {
    with_main(
        n,
        vec![
            with(OpCode::LoadLocal, 0),
            op(OpCode::AllocArr),
            with(OpCode::StoreLocal, 1),
            with(OpCode::PushI64, 0),
            with(OpCode::StoreLocal, 2),
            with(OpCode::PushI64, 0),
            with(OpCode::StoreLocal, 3),
            // loop @ 11
            with(OpCode::LoadLocal, 2),
            with(OpCode::LoadLocal, 0),
            op(OpCode::CmpLt),
            with(OpCode::JmpIfFalse, 32),
            with(OpCode::LoadLocal, 1),
            with(OpCode::LoadLocal, 2),
            with(OpCode::LoadLocal, 2),
            with(OpCode::PushI64, 2),
            op(OpCode::Mul),
            op(OpCode::StoreArr),
            with(OpCode::LoadLocal, 3),
            with(OpCode::LoadLocal, 1),
            with(OpCode::LoadLocal, 2),
            op(OpCode::LoadArr),
            op(OpCode::Add),
            with(OpCode::StoreLocal, 3),
            with(OpCode::LoadLocal, 2),
            with(OpCode::PushI64, 1),
            op(OpCode::Add),
            with(OpCode::StoreLocal, 2),
            with(OpCode::Jmp, 11),
            // exit @ 32
            with(OpCode::LoadLocal, 3),
            op(OpCode::Ret),
        ],
        FunctionInfo::new("array_sum", 4, 1, 4, true),
    )
}

fn run_iris_benchmark(name: &str, program: &Arc<BytecodeProgram>, mode: Option<EmitterKind>) -> (f64, Vec<String>) {
    let config = RuntimeConfig {
        jit_mode: if mode.is_some() { JitMode::On } else { JitMode::Off },
        jit_emitter: mode.unwrap_or_default(),
        jit_threshold: 1, // Compile immediately for benchmarking
        ..Default::default()
    };

    let lines = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&lines);

    let start = Instant::now();
    let result = Engine::new(config).and_then(|engine| {
        engine.execute(Arc::clone(program), move |line| {
            sink.borrow_mut().push(line.to_string())
        })
    });
    let elapsed = start.elapsed().as_secs_f64();

    if let Err(e) = result {
        eprintln!("iris benchmark {} ({:?}) failed: {}", name, mode, e);
    }
    let output = lines.borrow().clone();
    (elapsed, output)
}

fn bench(name: &str, program: BytecodeProgram, rust_time: f64) -> BenchmarkResult {
    let program = Arc::new(program);
    let (jit_off, output) = run_iris_benchmark(name, &program, None);
    let (jit_vm, vm_output) = run_iris_benchmark(name, &program, Some(EmitterKind::VmIntegrated));
    let (jit_baseline, baseline_output) = run_iris_benchmark(name, &program, Some(EmitterKind::Baseline));
    if vm_output != output || baseline_output != output {
        eprintln!("iris benchmark {}: JIT output differs from the interpreter", name);
    }
    BenchmarkResult {
        name: name.to_string(),
        output,
        iris_jit_vm_secs: jit_vm,
        iris_jit_baseline_secs: jit_baseline,
        iris_jit_off_secs: jit_off,
        rust_time_secs: rust_time,
    }
}

fn main() {
    let results = vec![
        bench("sum_loop", sum_loop(1_000_000), time_rust(|| rust_sum_loop(1_000_000))),
        bench("fibonacci", fibonacci(25), time_rust(|| rust_fibonacci(25))),
        bench("array_sum", array_sum(100_000), time_rust(|| rust_array_sum(100_000))),
    ];

    let output = BenchmarkOutput { results };
    match serde_json::to_string_pretty(&output) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("failed to encode results: {}", e),
    }
}
