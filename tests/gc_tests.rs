//! Garbage collection through the VM and against the heap directly.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use iris::config::RuntimeConfig;
use iris::vm::{BytecodeProgram, GarbageCollector, Heap, Instr, OpCode, Value, Vm};

fn push(n: i64) -> Instr {
    Instr::with(OpCode::PushI64, n)
}

/// `prologue`, then allocate and drop `count` arrays, then `epilogue`.
fn churn(prologue: Vec<Instr>, count: i64, epilogue: Vec<Instr>) -> BytecodeProgram {
    let base = prologue.len() as i64;
    let mut code = prologue;
    code.extend([
        push(0),
        Instr::with(OpCode::StoreGlobal, 0),
        // loop head
        Instr::with(OpCode::LoadGlobal, 0),
        push(count),
        Instr::new(OpCode::CmpLt),
        Instr::with(OpCode::JmpIfFalse, base + 14),
        push(4),
        Instr::new(OpCode::AllocArr),
        Instr::new(OpCode::Pop),
        Instr::with(OpCode::LoadGlobal, 0),
        push(1),
        Instr::new(OpCode::Add),
        Instr::with(OpCode::StoreGlobal, 0),
        Instr::with(OpCode::Jmp, base + 2),
    ]);
    code.extend(epilogue);
    code.push(Instr::new(OpCode::Halt));
    BytecodeProgram::new(code, vec![])
}

fn run_with(config: RuntimeConfig, program: BytecodeProgram) -> (Vm, Vec<String>) {
    let lines = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&lines);
    let mut vm = Vm::with_config(&config).with_output(move |line| sink.borrow_mut().push(line.to_string()));
    let result = vm.run(Arc::new(program)).unwrap();
    assert_eq!(result.exit_code, 0);
    let output = lines.borrow().clone();
    (vm, output)
}

fn small_threshold() -> RuntimeConfig {
    RuntimeConfig {
        gc_threshold: 10,
        ..RuntimeConfig::default()
    }
}

#[test]
fn test_threshold_triggers_collection() {
    let (vm, _) = run_with(small_threshold(), churn(vec![], 50, vec![]));
    assert!(vm.gc_stats().cycles >= 4);
    assert!(vm.gc_stats().freed_objects >= 40);
    assert!(vm.heap().object_count() <= 11);
    assert_eq!(vm.heap().total_allocs(), 50);
}

#[test]
fn test_disabled_gc_keeps_everything() {
    let config = RuntimeConfig {
        gc_enabled: false,
        gc_threshold: 10,
        ..RuntimeConfig::default()
    };
    let (vm, _) = run_with(config, churn(vec![], 50, vec![]));
    assert_eq!(vm.gc_stats().cycles, 0);
    assert_eq!(vm.heap().object_count(), 50);
}

#[test]
fn test_global_root_survives() {
    let prologue = vec![
        push(1),
        Instr::new(OpCode::AllocArr),
        Instr::new(OpCode::Dup),
        push(0),
        push(7),
        Instr::new(OpCode::StoreArr),
        Instr::with(OpCode::StoreGlobal, 1),
    ];
    let epilogue = vec![
        Instr::with(OpCode::LoadGlobal, 1),
        push(0),
        Instr::new(OpCode::LoadArr),
        Instr::new(OpCode::PrintI64),
    ];
    let (mut vm, output) = run_with(small_threshold(), churn(prologue, 40, epilogue));
    assert_eq!(output, vec!["7"]);

    vm.collect_garbage();
    assert_eq!(vm.heap().object_count(), 1);
}

#[test]
fn test_nested_objects_reachable_from_local() {
    // local0 = struct { field0: [42] }
    let prologue = vec![
        push(1),
        Instr::with(OpCode::AllocStruct, 0),
        Instr::with(OpCode::StoreLocal, 0),
        Instr::with(OpCode::LoadLocal, 0),
        push(1),
        Instr::new(OpCode::AllocArr),
        Instr::with(OpCode::StoreField, 0),
        Instr::with(OpCode::LoadLocal, 0),
        Instr::with(OpCode::LoadField, 0),
        push(0),
        push(42),
        Instr::new(OpCode::StoreArr),
    ];
    let epilogue = vec![
        Instr::with(OpCode::LoadLocal, 0),
        Instr::with(OpCode::LoadField, 0),
        push(0),
        Instr::new(OpCode::LoadArr),
        Instr::new(OpCode::PrintI64),
    ];
    let (mut vm, output) = run_with(small_threshold(), churn(prologue, 40, epilogue));
    assert_eq!(output, vec!["42"]);

    vm.collect_garbage();
    assert_eq!(vm.heap().object_count(), 2);
}

#[test]
fn test_operand_stack_is_a_root() {
    // The array stays on the operand stack while garbage piles up.
    let prologue = vec![push(3), Instr::new(OpCode::AllocArr)];
    let epilogue = vec![push(2), Instr::new(OpCode::LoadArr), Instr::new(OpCode::PrintI64)];
    let (_, output) = run_with(small_threshold(), churn(prologue, 40, epilogue));
    assert_eq!(output, vec!["0"]);
}

#[test]
fn test_unreachable_cycle_is_freed() {
    let mut heap = Heap::new();
    let a = heap.alloc_struct(0, 1);
    let b = heap.alloc_struct(0, 1);
    heap.get_mut(a).unwrap().field_set(0, Value::Ref(b)).unwrap();
    heap.get_mut(b).unwrap().field_set(0, Value::Ref(a)).unwrap();

    let mut gc = GarbageCollector::new();
    let report = gc.collect(&mut heap, &[Value::Ref(a)]);
    assert_eq!(report.freed, 0);
    assert!(heap.contains(a) && heap.contains(b));

    let report = gc.collect(&mut heap, &[Value::Int(5)]);
    assert_eq!(report.freed, 2);
    assert_eq!(heap.object_count(), 0);
}

#[test]
fn test_stale_roots_are_skipped() {
    let mut heap = Heap::new();
    let live = heap.alloc_array(1);
    let gone = heap.alloc_array(1);
    heap.free(gone);

    let mut gc = GarbageCollector::new();
    let report = gc.collect(&mut heap, &[Value::Ref(gone), Value::Ref(live)]);
    assert_eq!(report.freed, 0);
    assert_eq!(report.marked, 1);
    assert!(heap.contains(live));
}

#[test]
fn test_addresses_are_not_reused() {
    let mut heap = Heap::new();
    let first = heap.alloc_array(0);
    let mut gc = GarbageCollector::new();
    gc.collect(&mut heap, &[]);
    let second = heap.alloc_array(0);
    assert!(second > first);
    assert!(heap.get(first).is_err());
}
