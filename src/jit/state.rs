//! Per-function JIT lifecycle.
//!
//! Each function index owns a slot with an atomic state byte and a
//! single-assignment cell for the compiled artifact. The only write that
//! races is the NotCompiled -> Compiling compare-and-set, so exactly one
//! caller starts a job. Ready and Failed are terminal.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};

use crate::jit::api::CompiledFunction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum JitState {
    NotCompiled = 0,
    Compiling = 1,
    Ready = 2,
    Failed = 3,
}

impl JitState {
    fn from_u8(raw: u8) -> JitState {
        match raw {
            1 => JitState::Compiling,
            2 => JitState::Ready,
            3 => JitState::Failed,
            _ => JitState::NotCompiled,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JitState::Ready | JitState::Failed)
    }
}

impl fmt::Display for JitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JitState::NotCompiled => "not-compiled",
            JitState::Compiling => "compiling",
            JitState::Ready => "ready",
            JitState::Failed => "failed",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Job handles
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Finished(JitState),
    /// The JIT was closed before the job resolved
    Cancelled,
}

#[derive(Debug)]
struct JobCell {
    status: Mutex<JobStatus>,
    changed: Condvar,
}

/// A handle to one compilation job. Every request for the same function
/// while it compiles gets a clone of the same handle.
#[derive(Debug, Clone)]
pub struct JitHandle {
    func_index: usize,
    cell: Arc<JobCell>,
}

impl JitHandle {
    fn new(func_index: usize) -> Self {
        Self {
            func_index,
            cell: Arc::new(JobCell {
                status: Mutex::new(JobStatus::Pending),
                changed: Condvar::new(),
            }),
        }
    }

    pub fn func_index(&self) -> usize {
        self.func_index
    }

    pub fn status(&self) -> JobStatus {
        *self.cell.status.lock()
    }

    pub fn same_job(&self, other: &JitHandle) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }

    /// Block until the job resolves or is cancelled.
    pub fn wait(&self) -> JobStatus {
        let mut status = self.cell.status.lock();
        while *status == JobStatus::Pending {
            self.cell.changed.wait(&mut status);
        }
        *status
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> JobStatus {
        let mut status = self.cell.status.lock();
        if *status == JobStatus::Pending {
            self.cell
                .changed
                .wait_while_for(&mut status, |s| *s == JobStatus::Pending, timeout);
        }
        *status
    }

    fn resolve(&self, outcome: JobStatus) {
        let mut status = self.cell.status.lock();
        if *status == JobStatus::Pending {
            *status = outcome;
            self.cell.changed.notify_all();
        }
    }
}

// ============================================================================
// State table
// ============================================================================

#[derive(Default)]
struct Slot {
    state: AtomicU8,
    compiled: OnceCell<CompiledFunction>,
    job: OnceCell<JitHandle>,
}

/// Result of asking to compile a function.
#[derive(Debug, Clone)]
pub enum StartOutcome {
    /// The caller won the transition and must run the job
    Started(JitHandle),
    /// Another caller's job is in flight
    InFlight(JitHandle),
    /// Ready or Failed already; nothing to do
    Resolved(JitState),
}

pub struct JitStateTable {
    slots: Vec<Slot>,
}

impl JitStateTable {
    pub fn new(function_count: usize) -> Self {
        Self {
            slots: (0..function_count).map(|_| Slot::default()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn state(&self, func_index: usize) -> JitState {
        self.slots
            .get(func_index)
            .map(|slot| JitState::from_u8(slot.state.load(Ordering::Acquire)))
            .unwrap_or(JitState::NotCompiled)
    }

    /// The published artifact, if the function is Ready. Lock-free.
    pub fn compiled(&self, func_index: usize) -> Option<CompiledFunction> {
        let slot = self.slots.get(func_index)?;
        if JitState::from_u8(slot.state.load(Ordering::Acquire)) != JitState::Ready {
            return None;
        }
        slot.compiled.get().cloned()
    }

    /// Try to move NotCompiled -> Compiling. Out-of-range indices are
    /// treated as permanently failed.
    pub fn try_start(&self, func_index: usize) -> StartOutcome {
        let Some(slot) = self.slots.get(func_index) else {
            return StartOutcome::Resolved(JitState::Failed);
        };
        // The handle exists before the transition, so losers of the race
        // always find it.
        let handle = slot.job.get_or_init(|| JitHandle::new(func_index)).clone();

        match slot.state.compare_exchange(
            JitState::NotCompiled as u8,
            JitState::Compiling as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => StartOutcome::Started(handle),
            Err(current) => match JitState::from_u8(current) {
                JitState::Compiling => StartOutcome::InFlight(handle),
                other => StartOutcome::Resolved(other),
            },
        }
    }

    /// Publish the artifact and move Compiling -> Ready. Returns false if
    /// the slot was not Compiling.
    pub fn publish_ready(&self, func_index: usize, code: CompiledFunction) -> bool {
        let Some(slot) = self.slots.get(func_index) else {
            return false;
        };
        if JitState::from_u8(slot.state.load(Ordering::Acquire)) != JitState::Compiling {
            return false;
        }
        // Single writer: only the job that won try_start gets here.
        if slot.compiled.set(code).is_err() {
            return false;
        }
        slot.state
            .compare_exchange(
                JitState::Compiling as u8,
                JitState::Ready as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Move Compiling -> Failed. Returns false if the slot was not Compiling.
    pub fn mark_failed(&self, func_index: usize) -> bool {
        let Some(slot) = self.slots.get(func_index) else {
            return false;
        };
        slot.state
            .compare_exchange(
                JitState::Compiling as u8,
                JitState::Failed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Wake everyone waiting on the function's job once it reached a
    /// terminal state. Separate from the transition so observers can be
    /// told first.
    pub fn finish_job(&self, func_index: usize) {
        let state = self.state(func_index);
        if !state.is_terminal() {
            return;
        }
        if let Some(handle) = self.slots.get(func_index).and_then(|slot| slot.job.get()) {
            handle.resolve(JobStatus::Finished(state));
        }
    }

    /// Wake everyone waiting on an unresolved job. States are left alone:
    /// an abandoned function simply stays Compiling.
    pub fn cancel_pending(&self) -> usize {
        let mut cancelled = 0;
        for slot in &self.slots {
            if JitState::from_u8(slot.state.load(Ordering::Acquire)) == JitState::Compiling {
                if let Some(handle) = slot.job.get() {
                    handle.resolve(JobStatus::Cancelled);
                    cancelled += 1;
                }
            }
        }
        cancelled
    }

    pub fn count(&self, state: JitState) -> usize {
        (0..self.slots.len()).filter(|i| self.state(*i) == state).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{CompiledCode, Vm, VmError};

    struct Nop;

    impl CompiledCode for Nop {
        fn execute(&self, _vm: &mut Vm) -> Result<(), VmError> {
            Ok(())
        }
    }

    #[test]
    fn test_single_start() {
        let table = JitStateTable::new(2);
        let first = table.try_start(0);
        let second = table.try_start(0);
        let (StartOutcome::Started(a), StartOutcome::InFlight(b)) = (first, second) else {
            panic!("expected one start and one in-flight");
        };
        assert!(a.same_job(&b));
        assert_eq!(table.state(0), JitState::Compiling);
        assert_eq!(table.state(1), JitState::NotCompiled);
    }

    #[test]
    fn test_ready_is_terminal() {
        let table = JitStateTable::new(1);
        let StartOutcome::Started(handle) = table.try_start(0) else {
            panic!("expected start");
        };
        assert!(table.compiled(0).is_none());
        assert!(table.publish_ready(0, Arc::new(Nop)));
        assert_eq!(handle.status(), JobStatus::Pending);
        table.finish_job(0);
        assert_eq!(handle.status(), JobStatus::Finished(JitState::Ready));
        assert!(table.compiled(0).is_some());

        assert!(matches!(
            table.try_start(0),
            StartOutcome::Resolved(JitState::Ready)
        ));
        assert!(!table.mark_failed(0));
        assert!(!table.publish_ready(0, Arc::new(Nop)));
        assert_eq!(table.state(0), JitState::Ready);
    }

    #[test]
    fn test_failed_is_terminal() {
        let table = JitStateTable::new(1);
        table.try_start(0);
        assert!(table.mark_failed(0));
        assert!(!table.publish_ready(0, Arc::new(Nop)));
        assert!(matches!(
            table.try_start(0),
            StartOutcome::Resolved(JitState::Failed)
        ));
        assert!(table.compiled(0).is_none());
    }

    #[test]
    fn test_publish_requires_compiling() {
        let table = JitStateTable::new(1);
        assert!(!table.publish_ready(0, Arc::new(Nop)));
        assert_eq!(table.state(0), JitState::NotCompiled);
    }

    #[test]
    fn test_cancel_wakes_waiters() {
        let table = Arc::new(JitStateTable::new(1));
        let StartOutcome::Started(handle) = table.try_start(0) else {
            panic!("expected start");
        };
        let waiter = std::thread::spawn(move || handle.wait());
        assert_eq!(table.cancel_pending(), 1);
        assert_eq!(waiter.join().unwrap(), JobStatus::Cancelled);
        assert_eq!(table.state(0), JitState::Compiling);
    }

    #[test]
    fn test_concurrent_starts() {
        let table = Arc::new(JitStateTable::new(1));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || matches!(table.try_start(0), StartOutcome::Started(_)))
            })
            .collect();
        let winners = threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|started| *started)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_out_of_range() {
        let table = JitStateTable::new(0);
        assert_eq!(table.state(4), JitState::NotCompiled);
        assert!(matches!(
            table.try_start(4),
            StartOutcome::Resolved(JitState::Failed)
        ));
    }
}
