use std::sync::Arc;

use tracing::{debug, info};

use crate::config::RuntimeConfig;
use crate::vm::{
    BytecodeProgram, CompiledCode, GarbageCollector, GcStats, Heap, HeapAddr, Instr, JitHooks, OpCode,
    VarKind, VmError, Value, eval_binary, eval_unary,
};

/// Receives each line printed by PRINT_I64 / PRINT_BOOL.
pub type OutputSink = Box<dyn FnMut(&str)>;

/// A call frame for the VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFrame {
    /// Index into the function table (None for a headless entry frame)
    pub func_index: Option<usize>,
    /// Where to resume the caller; None marks the entry frame
    pub return_ip: Option<usize>,
    pub locals: Vec<Value>,
    /// Operand stack height when the frame was entered
    pub base_pointer: usize,
}

impl CallFrame {
    pub fn is_entry(&self) -> bool {
        self.return_ip.is_none()
    }
}

/// Outcome of a run. Exit code 0 on HALT or RET from the entry frame,
/// 1 when execution ran off the end of the instruction stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunResult {
    pub exit_code: i32,
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Halted(Option<Value>),
    Exhausted,
}

enum ControlFlow {
    Next,
    Jump(usize),
    /// A frame was popped; `ip` already points at the resume address
    Returned,
    Stop,
}

/// The iris virtual machine.
pub struct Vm {
    program: Arc<BytecodeProgram>,
    ip: usize,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Vec<Value>,
    heap: Heap,
    gc: GarbageCollector,
    stop: Option<Stop>,
    hooks: Option<Arc<dyn JitHooks>>,
    /// Output sink for print instructions
    output: OutputSink,
    /// Calls dispatched to compiled code
    compiled_calls: u64,
    config: RuntimeConfig,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_config(&RuntimeConfig::default())
    }

    pub fn with_config(config: &RuntimeConfig) -> Self {
        Self {
            program: Arc::new(BytecodeProgram::default()),
            ip: 0,
            stack: Vec::with_capacity(1024),
            frames: Vec::with_capacity(64),
            globals: Vec::new(),
            heap: Heap::new(),
            gc: GarbageCollector::new(),
            stop: None,
            hooks: None,
            output: Box::new(|line| println!("{}", line)),
            compiled_calls: 0,
            config: config.clone(),
        }
    }

    /// Replace the output sink.
    pub fn with_output(mut self, output: impl FnMut(&str) + 'static) -> Self {
        self.output = Box::new(output);
        self
    }

    pub fn with_jit_hooks(mut self, hooks: Arc<dyn JitHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn set_jit_hooks(&mut self, hooks: Option<Arc<dyn JitHooks>>) {
        self.hooks = hooks;
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn program(&self) -> &Arc<BytecodeProgram> {
        &self.program
    }

    /// Index of the instruction being executed.
    pub fn ip(&self) -> usize {
        self.ip
    }

    pub fn stack(&self) -> &[Value] {
        &self.stack
    }

    pub fn frames(&self) -> &[CallFrame] {
        &self.frames
    }

    pub fn globals(&self) -> &[Value] {
        &self.globals
    }

    /// Get immutable reference to the heap.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn gc_stats(&self) -> &GcStats {
        self.gc.stats()
    }

    /// Number of CALLs served by compiled code so far.
    pub fn compiled_calls(&self) -> u64 {
        self.compiled_calls
    }

    /// True once HALT ran or the instruction stream was exhausted, even
    /// if that happened inside a nested call made by compiled code.
    pub fn is_stopped(&self) -> bool {
        self.stop.is_some()
    }

    // ========================================================================
    // Running
    // ========================================================================

    /// Run `program` from ip 0 with a fresh stack, heap and globals.
    pub fn run(&mut self, program: Arc<BytecodeProgram>) -> Result<RunResult, VmError> {
        self.reset(program);

        let entry = self.program.entry_function();
        let entry_locals = entry
            .and_then(|idx| self.program.function(idx))
            .map(|f| f.frame_size())
            .unwrap_or(self.config.entry_locals);
        self.frames.push(CallFrame {
            func_index: entry,
            return_ip: None,
            locals: vec![Value::Int(0); entry_locals],
            base_pointer: 0,
        });

        info!(
            target: "iris::vm",
            instructions = self.program.instructions.len(),
            functions = self.program.functions.len(),
            "run started"
        );

        self.run_loop(0)?;

        let result = match self.stop {
            Some(Stop::Halted(value)) => RunResult { exit_code: 0, value },
            Some(Stop::Exhausted) | None => RunResult {
                exit_code: 1,
                value: None,
            },
        };

        info!(
            target: "iris::vm",
            exit_code = result.exit_code,
            compiled_calls = self.compiled_calls,
            "run finished"
        );
        if self.config.gc_stats {
            let stats = self.gc.stats();
            info!(
                target: "iris::gc",
                cycles = stats.cycles,
                freed = stats.freed_objects,
                total_pause_us = stats.total_pause_us,
                max_pause_us = stats.max_pause_us,
                live = self.heap.object_count(),
                "gc summary"
            );
        }
        Ok(result)
    }

    fn reset(&mut self, program: Arc<BytecodeProgram>) {
        self.program = program;
        self.ip = 0;
        self.stack.clear();
        self.frames.clear();
        self.globals = vec![Value::Int(0); self.config.globals_capacity];
        self.heap = Heap::new();
        self.gc = GarbageCollector::new();
        self.stop = None;
        self.compiled_calls = 0;
    }

    /// Interpret until a stop condition, or until a RET brings the frame
    /// count down to `stop_depth`.
    fn run_loop(&mut self, stop_depth: usize) -> Result<(), VmError> {
        let program = Arc::clone(&self.program);
        loop {
            if self.stop.is_some() {
                return Ok(());
            }
            self.maybe_collect();

            let ip = self.ip;
            let Some(&instr) = program.instructions.get(ip) else {
                debug!(target: "iris::vm", ip, "instruction stream exhausted");
                self.stop = Some(Stop::Exhausted);
                return Ok(());
            };

            match self.step(instr).map_err(|e| e.at(ip, instr))? {
                ControlFlow::Next => self.ip += 1,
                ControlFlow::Jump(target) => self.ip = target,
                ControlFlow::Returned => {
                    if self.frames.len() <= stop_depth {
                        return Ok(());
                    }
                }
                ControlFlow::Stop => return Ok(()),
            }
        }
    }

    fn step(&mut self, instr: Instr) -> Result<ControlFlow, VmError> {
        let op = instr.op;
        match op {
            OpCode::Jmp => return self.jump_target(&instr).map(ControlFlow::Jump),
            OpCode::JmpIfFalse | OpCode::JmpIfTrue => {
                let target = self.jump_target(&instr)?;
                let cond = self.pop(op)?.to_bool();
                let taken = if op == OpCode::JmpIfTrue { cond } else { !cond };
                return Ok(if taken {
                    ControlFlow::Jump(target)
                } else {
                    ControlFlow::Next
                });
            }
            OpCode::Call => {
                let func_index = self.function_index(&instr)?;
                if let Some(code) = self.compiled(func_index) {
                    self.run_compiled(func_index, code.as_ref())?;
                    return Ok(if self.is_stopped() {
                        ControlFlow::Stop
                    } else {
                        ControlFlow::Next
                    });
                }
                let start_ip = self.enter_frame(func_index, self.ip + 1)?;
                self.notify_call(func_index);
                return Ok(ControlFlow::Jump(start_ip));
            }
            OpCode::Ret => {
                let value = self.pop(op)?;
                return self.return_from_frame(op, Some(value));
            }
            OpCode::RetVoid => return self.return_from_frame(op, None),
            OpCode::Halt => {
                self.stop = Some(Stop::Halted(None));
                return Ok(ControlFlow::Stop);
            }
            _ => self.exec_data_op(instr)?,
        }
        Ok(ControlFlow::Next)
    }

    /// Execute an instruction that neither transfers control nor touches
    /// the call stack. Shared by the interpreter and compiled code.
    pub fn exec_data_op(&mut self, instr: Instr) -> Result<(), VmError> {
        let op = instr.op;
        match op {
            OpCode::PushI64 => self.push(Value::Int(instr.operand()?)),
            OpCode::PushTrue => self.push(Value::Bool(true)),
            OpCode::PushFalse => self.push(Value::Bool(false)),
            OpCode::Pop => {
                self.pop(op)?;
            }
            OpCode::Dup => {
                let top = self.peek(op)?;
                self.push(top);
            }
            _ if op.is_binary() => {
                let right = self.pop(op)?;
                let left = self.pop(op)?;
                self.push(eval_binary(op, left, right)?);
            }
            _ if op.is_unary() => {
                let operand = self.pop(op)?;
                self.push(eval_unary(op, operand)?);
            }
            OpCode::LoadLocal => {
                let value = self.load_local(instr.operand()?)?;
                self.push(value);
            }
            OpCode::StoreLocal => {
                let index = instr.operand()?;
                let value = self.pop(op)?;
                self.store_local(index, value)?;
            }
            OpCode::LoadGlobal => {
                let value = self.load_global(instr.operand()?)?;
                self.push(value);
            }
            OpCode::StoreGlobal => {
                let index = instr.operand()?;
                let value = self.pop(op)?;
                self.store_global(index, value)?;
            }
            OpCode::AllocArr => {
                let size = self.pop(op)?.to_int()?;
                let array = self.alloc_array(size)?;
                self.push(array);
            }
            OpCode::AllocStruct | OpCode::New => {
                let type_index = instr.operand()?;
                let field_count = self.pop(op)?.to_int()?;
                let object = self.alloc_struct(op, type_index, field_count)?;
                self.push(object);
            }
            OpCode::LoadArr => {
                let index = self.pop(op)?.to_int()?;
                let addr = self.pop_ref(op)?;
                let value = self.heap.get(addr)?.array_get(index)?;
                self.push(value);
            }
            OpCode::StoreArr => {
                let value = self.pop(op)?;
                let index = self.pop(op)?.to_int()?;
                let addr = self.pop_ref(op)?;
                self.heap.get_mut(addr)?.array_set(index, value)?;
            }
            OpCode::LoadField => {
                let field = instr.operand()?;
                let addr = self.pop_ref(op)?;
                let value = self.heap.get(addr)?.field_get(field)?;
                self.push(value);
            }
            OpCode::StoreField => {
                let field = instr.operand()?;
                let value = self.pop(op)?;
                let addr = self.pop_ref(op)?;
                self.heap.get_mut(addr)?.field_set(field, value)?;
            }
            OpCode::PrintI64 => {
                let value = self.pop(op)?.to_int()?;
                self.print(&value.to_string());
            }
            OpCode::PrintBool => {
                let value = self.pop(op)?.to_bool();
                self.print(if value { "true" } else { "false" });
            }
            other => return Err(VmError::UnsupportedOpcode(other)),
        }
        Ok(())
    }

    fn jump_target(&self, instr: &Instr) -> Result<usize, VmError> {
        let target = instr.target()?;
        if target > self.program.instructions.len() {
            return Err(VmError::InvalidJumpTarget(target as i64));
        }
        Ok(target)
    }

    fn function_index(&self, instr: &Instr) -> Result<usize, VmError> {
        let raw = instr.operand()?;
        usize::try_from(raw)
            .ok()
            .filter(|idx| *idx < self.program.functions.len())
            .ok_or(VmError::InvalidFunction(raw))
    }

    // ========================================================================
    // Calls
    // ========================================================================

    fn compiled(&self, func_index: usize) -> Option<Arc<dyn CompiledCode>> {
        self.hooks.as_ref()?.get_compiled(func_index)
    }

    fn notify_call(&self, func_index: usize) {
        if let Some(hooks) = &self.hooks {
            hooks.notify_call(func_index);
        }
    }

    fn run_compiled(&mut self, func_index: usize, code: &dyn CompiledCode) -> Result<(), VmError> {
        self.compiled_calls += 1;
        debug!(target: "iris::vm", func_index, "dispatching to compiled code");
        code.execute(self)
    }

    /// Push a frame for `func_index`, moving its parameters from the
    /// operand stack into the low local slots. Returns the body's start ip.
    pub fn enter_frame(&mut self, func_index: usize, return_ip: usize) -> Result<usize, VmError> {
        let info = self
            .program
            .function(func_index)
            .ok_or(VmError::InvalidFunction(func_index as i64))?;
        let (start_ip, params, frame_size) = (info.start_ip, info.param_count, info.frame_size());

        if self.stack.len() < params {
            return Err(VmError::StackUnderflow(OpCode::Call));
        }
        let args = self.stack.split_off(self.stack.len() - params);
        let mut locals = vec![Value::Int(0); frame_size];
        locals[..params].copy_from_slice(&args);

        self.frames.push(CallFrame {
            func_index: Some(func_index),
            return_ip: Some(return_ip),
            locals,
            base_pointer: self.stack.len(),
        });
        Ok(start_ip)
    }

    /// Pop the current frame, discard anything it left on the operand
    /// stack, and push `value` for the caller.
    pub fn leave_frame(&mut self, op: OpCode, value: Option<Value>) -> Result<CallFrame, VmError> {
        let frame = self.frames.pop().ok_or(VmError::StackUnderflow(op))?;
        self.stack.truncate(frame.base_pointer);
        if let Some(value) = value {
            self.push(value);
        }
        Ok(frame)
    }

    fn return_from_frame(&mut self, op: OpCode, value: Option<Value>) -> Result<ControlFlow, VmError> {
        let is_entry = self.frames.last().is_some_and(CallFrame::is_entry);
        if is_entry {
            self.frames.pop();
            self.stop = Some(Stop::Halted(value));
            return Ok(ControlFlow::Stop);
        }
        let frame = self.leave_frame(op, value)?;
        if let Some(return_ip) = frame.return_ip {
            self.ip = return_ip;
        }
        Ok(ControlFlow::Returned)
    }

    /// Perform a CALL on behalf of compiled code: run compiled code if the
    /// callee has some, otherwise interpret the callee to completion.
    pub fn call_function(&mut self, func_index: usize) -> Result<(), VmError> {
        if func_index >= self.program.functions.len() {
            return Err(VmError::InvalidFunction(func_index as i64));
        }
        if let Some(code) = self.compiled(func_index) {
            return self.run_compiled(func_index, code.as_ref());
        }

        let saved_ip = self.ip;
        let depth = self.frames.len();
        self.ip = self.enter_frame(func_index, saved_ip)?;
        self.notify_call(func_index);
        self.run_loop(depth)?;
        self.ip = saved_ip;
        Ok(())
    }

    // ========================================================================
    // Stack & Variables
    // ========================================================================

    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub fn pop(&mut self, op: OpCode) -> Result<Value, VmError> {
        self.stack.pop().ok_or(VmError::StackUnderflow(op))
    }

    pub fn peek(&self, op: OpCode) -> Result<Value, VmError> {
        self.stack.last().copied().ok_or(VmError::StackUnderflow(op))
    }

    fn pop_ref(&mut self, op: OpCode) -> Result<HeapAddr, VmError> {
        let value = self.pop(op)?;
        value.as_addr().ok_or(VmError::TypeMismatch {
            op,
            expected: "ref",
            found: value.type_name(),
        })
    }

    pub fn load_local(&self, index: i64) -> Result<Value, VmError> {
        let locals = self.frames.last().map(|f| f.locals.as_slice()).unwrap_or(&[]);
        let slot = slot_index(index, locals.len(), VarKind::Local)?;
        Ok(locals[slot])
    }

    pub fn store_local(&mut self, index: i64, value: Value) -> Result<(), VmError> {
        let Some(frame) = self.frames.last_mut() else {
            return Err(VmError::InvalidVariableIndex {
                kind: VarKind::Local,
                index,
                size: 0,
            });
        };
        let slot = slot_index(index, frame.locals.len(), VarKind::Local)?;
        frame.locals[slot] = value;
        Ok(())
    }

    pub fn load_global(&self, index: i64) -> Result<Value, VmError> {
        let slot = slot_index(index, self.globals.len(), VarKind::Global)?;
        Ok(self.globals[slot])
    }

    /// Store a global, growing the globals array up to `max_globals`.
    pub fn store_global(&mut self, index: i64, value: Value) -> Result<(), VmError> {
        let slot = slot_index(index, self.config.max_globals, VarKind::Global)?;
        if slot >= self.globals.len() {
            self.globals.resize(slot + 1, Value::Int(0));
        }
        self.globals[slot] = value;
        Ok(())
    }

    // ========================================================================
    // Heap
    // ========================================================================

    pub fn alloc_array(&mut self, size: i64) -> Result<Value, VmError> {
        let size = self.alloc_len(OpCode::AllocArr, size)?;
        Ok(Value::Ref(self.heap.alloc_array(size)))
    }

    pub fn alloc_struct(&mut self, op: OpCode, type_index: i64, field_count: i64) -> Result<Value, VmError> {
        let fields = self.alloc_len(op, field_count)?;
        Ok(Value::Ref(self.heap.alloc_struct(type_index, fields)))
    }

    /// Validate a popped allocation size against `max_alloc_len`.
    fn alloc_len(&self, op: OpCode, size: i64) -> Result<usize, VmError> {
        let len = usize::try_from(size).map_err(|_| VmError::NegativeSize { op, size })?;
        if len > self.config.max_alloc_len {
            return Err(VmError::AllocationTooLarge {
                op,
                size,
                limit: self.config.max_alloc_len,
            });
        }
        Ok(len)
    }

    /// Forward one line to the output sink.
    pub fn print(&mut self, line: &str) {
        (self.output)(line);
    }

    // ========================================================================
    // Garbage Collection
    // ========================================================================

    /// Collect if enough allocations happened since the last cycle.
    /// Only called between instructions.
    pub fn maybe_collect(&mut self) {
        if self.config.gc_enabled && self.heap.allocs_since_gc() > self.config.gc_threshold {
            self.collect_garbage();
        }
    }

    /// Collect with roots gathered fresh from the operand stack, every
    /// frame's locals, and the globals.
    pub fn collect_garbage(&mut self) {
        let roots: Vec<Value> = self
            .stack
            .iter()
            .chain(self.frames.iter().flat_map(|f| f.locals.iter()))
            .chain(self.globals.iter())
            .copied()
            .filter(Value::is_ref)
            .collect();
        self.gc.collect(&mut self.heap, &roots);
    }
}

fn slot_index(index: i64, size: usize, kind: VarKind) -> Result<usize, VmError> {
    usize::try_from(index)
        .ok()
        .filter(|i| *i < size)
        .ok_or(VmError::InvalidVariableIndex { kind, index, size })
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::vm::FunctionInfo;

    fn run_code(instructions: Vec<Instr>) -> (Result<RunResult, VmError>, Vec<String>, Vm) {
        let lines = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&lines);
        let mut vm = Vm::new().with_output(move |line| sink.borrow_mut().push(line.to_string()));
        let result = vm.run(Arc::new(BytecodeProgram::new(instructions, vec![])));
        let output = lines.borrow().clone();
        (result, output, vm)
    }

    fn push(n: i64) -> Instr {
        Instr::with(OpCode::PushI64, n)
    }

    #[test]
    fn test_add_and_print() {
        let (result, output, _) = run_code(vec![
            push(10),
            push(20),
            Instr::new(OpCode::Add),
            Instr::new(OpCode::PrintI64),
            Instr::new(OpCode::Halt),
        ]);
        assert_eq!(result.unwrap().exit_code, 0);
        assert_eq!(output, vec!["30"]);
    }

    #[test]
    fn test_fall_off_end_is_nonzero() {
        let (result, _, vm) = run_code(vec![push(1)]);
        assert_eq!(result.unwrap().exit_code, 1);
        assert_eq!(vm.stack(), &[Value::Int(1)]);
    }

    #[test]
    fn test_underflow_names_opcode() {
        let (result, _, _) = run_code(vec![Instr::new(OpCode::Add)]);
        let err = result.unwrap_err();
        assert!(err.to_string().contains("ADD"));
        assert_eq!(err.root(), &VmError::StackUnderflow(OpCode::Add));
    }

    #[test]
    fn test_conditional_jump() {
        let (result, output, _) = run_code(vec![
            Instr::new(OpCode::PushFalse),
            Instr::with(OpCode::JmpIfFalse, 4),
            push(1),
            Instr::new(OpCode::PrintI64),
            Instr::new(OpCode::PushTrue),
            Instr::new(OpCode::PrintBool),
            Instr::new(OpCode::Halt),
        ]);
        assert!(result.is_ok());
        assert_eq!(output, vec!["true"]);
    }

    #[test]
    fn test_globals_grow_on_store() {
        let (result, _, vm) = run_code(vec![
            push(9),
            Instr::with(OpCode::StoreGlobal, 300),
            Instr::with(OpCode::LoadGlobal, 300),
            Instr::new(OpCode::Halt),
        ]);
        assert!(result.is_ok());
        assert_eq!(vm.globals().len(), 301);
        assert_eq!(vm.stack(), &[Value::Int(9)]);
    }

    #[test]
    fn test_global_load_out_of_bounds() {
        let (result, _, _) = run_code(vec![Instr::with(OpCode::LoadGlobal, 5000)]);
        assert_eq!(
            result.unwrap_err().root(),
            &VmError::InvalidVariableIndex {
                kind: VarKind::Global,
                index: 5000,
                size: 256
            }
        );
    }

    #[test]
    fn test_ret_from_entry_halts_with_value() {
        let program = BytecodeProgram::new(
            vec![push(5), Instr::new(OpCode::Ret)],
            vec![FunctionInfo::new("main", 0, 0, 0, true)],
        );
        let mut vm = Vm::new();
        let result = vm.run(Arc::new(program)).unwrap();
        assert_eq!(
            result,
            RunResult {
                exit_code: 0,
                value: Some(Value::Int(5))
            }
        );
    }

    #[test]
    fn test_call_pops_params_into_locals() {
        // main: push 7, push 3, call sub, print, halt
        // sub(a, b): a - b
        let program = BytecodeProgram::new(
            vec![
                push(7),
                push(3),
                Instr::with(OpCode::Call, 0),
                Instr::new(OpCode::PrintI64),
                Instr::new(OpCode::Halt),
                Instr::with(OpCode::LoadLocal, 0),
                Instr::with(OpCode::LoadLocal, 1),
                Instr::new(OpCode::Sub),
                Instr::new(OpCode::Ret),
            ],
            vec![FunctionInfo::new("sub", 5, 2, 2, true)],
        );
        let lines = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&lines);
        let mut vm = Vm::new().with_output(move |line| sink.borrow_mut().push(line.to_string()));
        vm.run(Arc::new(program)).unwrap();
        assert_eq!(*lines.borrow(), vec!["4"]);
        assert!(vm.stack().is_empty());
    }
}
