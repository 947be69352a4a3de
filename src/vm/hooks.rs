//! The narrow seam between the interpreter and a JIT.
//!
//! The VM only ever sees these two traits; it never depends on how
//! artifacts are produced or scheduled.

use std::sync::Arc;

use super::error::VmError;
use super::vm::Vm;

/// An executable artifact for one function.
///
/// `execute` runs against the live VM: it consumes the call's arguments
/// from the operand stack and leaves the return value (if any) there,
/// handling RET/RET_VOID itself.
pub trait CompiledCode: Send + Sync {
    fn execute(&self, vm: &mut Vm) -> Result<(), VmError>;
}

/// Consulted by the interpreter on every CALL.
pub trait JitHooks: Send + Sync {
    /// A published artifact for `func_index`, if one is ready.
    fn get_compiled(&self, func_index: usize) -> Option<Arc<dyn CompiledCode>>;

    /// Hint that `func_index` is about to be interpreted.
    fn notify_call(&self, func_index: usize);
}
