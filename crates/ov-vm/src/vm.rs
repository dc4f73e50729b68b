//! The reversible instruction VM.
//!
//! Mirrors a C VM header's `OV_EXEC_OK` / `TRIGGER_FAIL` / `WAIT` result
//! shape, the forward/inverse handler split driven by `ProgramStatus`, and
//! periodic timeout scanning.

use std::collections::HashMap;

use ov_proto::{Instruction, OPCODE_END, OPCODE_INVALID, OPCODE_NOP};
use thiserror::Error;
use tracing::warn;

use crate::store::{Program, ProgramResult, ProgramStatus, ProgramStore, StepResult, StoreError};

/// One registered instruction's behavior. The forward handler runs while
/// the program is `Ok`; the inverse handler runs while `Aborting`.
pub type Handler<D> = Box<dyn FnMut(&mut Program<D>, [u8; 3]) -> StepResult + Send>;

struct OpcodeDefinition<D> {
    symbol: &'static str,
    forward: Handler<D>,
    inverse: Handler<D>,
}

#[derive(Debug, Error, PartialEq)]
pub enum VmError {
    #[error("opcode {0:#x} is reserved and cannot be registered")]
    ReservedOpcode(u8),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A program reference returned by [`Vm::trigger`]; `TriggerFail` hands
/// the caller's data straight back so nothing is silently dropped.
pub enum TriggerOutcome<D> {
    Started,
    TriggerFail(D),
}

fn no_op_inverse<D>() -> Handler<D> {
    Box::new(|_program, _args| StepResult::Next)
}

/// Opcode table plus the program store and periodic timeout scanner.
pub struct Vm<D> {
    opcodes: HashMap<u8, OpcodeDefinition<D>>,
    store: ProgramStore<D>,
    default_timeout_usecs: i64,
    on_done: Box<dyn FnMut(&str) + Send>,
    on_aborted: Box<dyn FnMut(&str) + Send>,
    on_failed_to_abort: Box<dyn FnMut(&str) + Send>,
    timeout_batch: usize,
}

impl<D> Vm<D> {
    pub fn new(
        capacity: usize,
        default_timeout_usecs: i64,
        releaser: impl FnMut(D) + Send + 'static,
        on_done: impl FnMut(&str) + Send + 'static,
        on_aborted: impl FnMut(&str) + Send + 'static,
        on_failed_to_abort: impl FnMut(&str) + Send + 'static,
    ) -> Self {
        Vm {
            opcodes: HashMap::new(),
            store: ProgramStore::new(capacity, releaser),
            default_timeout_usecs,
            on_done: Box::new(on_done),
            on_aborted: Box::new(on_aborted),
            on_failed_to_abort: Box::new(on_failed_to_abort),
            timeout_batch: 5,
        }
    }

    pub fn register(
        &mut self,
        opcode: u8,
        symbol: &'static str,
        forward: Handler<D>,
        inverse: Option<Handler<D>>,
    ) -> Result<(), VmError> {
        if matches!(opcode, OPCODE_END | OPCODE_NOP | OPCODE_INVALID) {
            return Err(VmError::ReservedOpcode(opcode));
        }
        let inverse = inverse.unwrap_or_else(|| {
            warn!(opcode, symbol, "no inverse handler registered, substituting no-op");
            no_op_inverse()
        });
        self.opcodes.insert(opcode, OpcodeDefinition { symbol, forward, inverse });
        Ok(())
    }

    pub fn store(&self) -> &ProgramStore<D> {
        &self.store
    }

    /// Mutable store access for a host binary resuming a suspended program
    /// with externally-arrived data (e.g. an orchestration response) before
    /// calling [`Vm::continue_program`].
    pub fn store_mut(&mut self) -> &mut ProgramStore<D> {
        &mut self.store
    }

    /// Insert a new program and run it to its first suspension or
    /// completion.
    pub fn trigger(
        &mut self,
        id: impl Into<String>,
        instructions: Vec<Instruction>,
        data: D,
        now_usecs: i64,
    ) -> TriggerOutcome<D> {
        let id = id.into();
        match self.store.insert(id.clone(), instructions, data, now_usecs) {
            Ok(()) => {
                self.execute(&id);
                TriggerOutcome::Started
            }
            Err((_err, data)) => TriggerOutcome::TriggerFail(data),
        }
    }

    pub fn continue_program(&mut self, id: &str) {
        self.execute(id);
    }

    /// Drive a program forward (or backward, while aborting) until it
    /// suspends, finishes, or fully unwinds.
    fn execute(&mut self, id: &str) {
        let canonical = match self.store.resolve(id) {
            Some(c) => c.to_string(),
            None => return,
        };

        loop {
            let (status, pc) = {
                let program = match self.store.get(&canonical) {
                    Some(p) => p,
                    None => return,
                };
                (program.status, program.pc)
            };

            if status == ProgramStatus::FailedToAbort || status == ProgramStatus::Invalid {
                return;
            }

            if pc < 0 {
                self.finish_abort(&canonical);
                return;
            }

            let instruction = {
                let program = self.store.get(&canonical).unwrap();
                match program.instructions.get(pc as usize) {
                    Some(instr) => *instr,
                    None => {
                        self.mark_invalid(&canonical);
                        return;
                    }
                }
            };

            if instruction.is_end() {
                if status == ProgramStatus::Aborting {
                    self.finish_abort(&canonical);
                } else {
                    self.release(&canonical, Notify::Done);
                }
                return;
            }

            let def = match self.opcodes.get_mut(&instruction.opcode) {
                Some(d) => d,
                None => {
                    self.mark_invalid(&canonical);
                    return;
                }
            };

            let result = {
                let program = self.store.get_mut(&canonical).unwrap();
                let handler = if status == ProgramStatus::Ok {
                    &mut def.forward
                } else {
                    &mut def.inverse
                };
                let r = handler(program, instruction.args);
                program.last_return = Some(r);
                r
            };

            let step = (status, result);
            match step {
                (_, StepResult::Next) => {
                    let program = self.store.get_mut(&canonical).unwrap();
                    program.pc += if status == ProgramStatus::Ok { 1 } else { -1 };
                }
                (ProgramStatus::Aborting, StepResult::WaitAndNext)
                | (ProgramStatus::Aborting, StepResult::WaitAndRepeat) => {
                    warn!(id = %canonical, "wait requested during abort, treating as Next");
                    let program = self.store.get_mut(&canonical).unwrap();
                    program.pc -= 1;
                }
                (_, StepResult::WaitAndNext) => {
                    let program = self.store.get_mut(&canonical).unwrap();
                    program.pc += 1;
                    return;
                }
                (_, StepResult::WaitAndRepeat) => {
                    return;
                }
                (_, StepResult::Finished) => {
                    self.release(&canonical, Notify::Done);
                    return;
                }
                (_, StepResult::Error) => {
                    self.begin_abort(&canonical, false);
                }
            }
        }
    }

    fn mark_invalid(&mut self, id: &str) {
        if let Some(program) = self.store.get_mut(id) {
            program.status = ProgramStatus::Invalid;
            program.result = ProgramResult { code: -1, message: Some("invalid program counter".into()) };
        }
    }

    fn begin_abort(&mut self, id: &str, _already_aborting: bool) {
        let program = match self.store.get_mut(id) {
            Some(p) => p,
            None => return,
        };
        program.status = ProgramStatus::Aborting;
        if program.last_return == Some(StepResult::WaitAndNext) {
            program.pc -= 1;
        }
        program.pc -= 1;
        self.execute(id);
    }

    fn finish_abort(&mut self, id: &str) {
        self.release(id, Notify::Aborted);
    }

    pub fn abort(&mut self, id: &str, finish_current_step: bool) {
        let canonical = match self.store.resolve(id) {
            Some(c) => c.to_string(),
            None => return,
        };
        let status = match self.store.get(&canonical) {
            Some(p) => p.status,
            None => return,
        };
        match status {
            ProgramStatus::Ok => {
                let program = self.store.get_mut(&canonical).unwrap();
                program.status = ProgramStatus::Aborting;
                if !finish_current_step && program.last_return == Some(StepResult::WaitAndNext) {
                    program.pc -= 1;
                }
                program.pc -= 1;
                self.execute(&canonical);
            }
            ProgramStatus::Aborting => {
                self.release(&canonical, Notify::FailedToAbort);
            }
            ProgramStatus::FailedToAbort | ProgramStatus::Invalid => {}
        }
    }

    fn release(&mut self, id: &str, notify: Notify) {
        match notify {
            Notify::Done => (self.on_done)(id),
            Notify::Aborted => (self.on_aborted)(id),
            Notify::FailedToAbort => (self.on_failed_to_abort)(id),
        }
        let _ = self.store.remove(id);
    }

    /// Scan for programs older than `default_timeout_usecs` and abort up to
    /// `timeout_batch` of them. Does not rearm itself; the owning actor is
    /// responsible for calling this periodically (e.g. off its own event
    /// loop's timer tick).
    pub fn scan_timeouts(&mut self, now_usecs: i64) {
        for _ in 0..self.timeout_batch {
            match self.store.next_due(now_usecs - self.default_timeout_usecs) {
                Some(id) => self.abort(&id, true),
                None => break,
            }
        }
    }
}

enum Notify {
    Done,
    Aborted,
    FailedToAbort,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting_opcode(delta: i32) -> (Handler<i32>, Handler<i32>) {
        (
            Box::new(move |program, _args| {
                *program.data.as_mut().unwrap() += delta;
                StepResult::Next
            }),
            Box::new(move |program, _args| {
                *program.data.as_mut().unwrap() -= delta;
                StepResult::Next
            }),
        )
    }

    fn wait_opcode() -> (Handler<i32>, Handler<i32>) {
        (
            Box::new(|_program, _args| StepResult::WaitAndNext),
            Box::new(|_program, _args| StepResult::Next),
        )
    }

    #[test]
    fn program_runs_to_completion_and_notifies_done() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let done = Arc::new(AtomicUsize::new(0));
        let done2 = done.clone();
        let mut vm = Vm::new(4, 1_000_000, |_d: i32| {}, move |_id| { done2.fetch_add(1, Ordering::SeqCst); }, |_| {}, |_| {});
        let (f, inv) = counting_opcode(1);
        vm.register(1, "inc", f, Some(inv)).unwrap();

        let program = vec![
            Instruction::new(1, [0, 0, 0]),
            Instruction::new(1, [0, 0, 0]),
            Instruction::end(),
        ];
        vm.trigger("p1", program, 0, 0);

        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert!(vm.store().get("p1").is_none());
    }

    #[test]
    fn reserved_opcode_registration_is_rejected() {
        let mut vm: Vm<i32> = Vm::new(4, 1, |_| {}, |_| {}, |_| {}, |_| {});
        let (f, inv) = counting_opcode(1);
        assert_eq!(vm.register(OPCODE_END, "x", f, Some(inv)), Err(VmError::ReservedOpcode(OPCODE_END)));
    }

    #[test]
    fn abort_rewinds_completed_instructions_and_skips_unexecuted_ones() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let aborted = Arc::new(AtomicUsize::new(0));
        let aborted2 = aborted.clone();
        let released = Arc::new(AtomicUsize::new(0));
        let released2 = released.clone();

        let mut vm = Vm::new(
            4,
            1_000_000,
            move |_d: i32| { released2.fetch_add(1, Ordering::SeqCst); },
            |_| {},
            move |_id| { aborted2.fetch_add(1, Ordering::SeqCst); },
            |_| {},
        );
        let (inc_f, inc_inv) = counting_opcode(1);
        vm.register(1, "inc", inc_f, Some(inc_inv)).unwrap();
        let (wait_f, wait_inv) = wait_opcode();
        vm.register(2, "wait", wait_f, Some(wait_inv)).unwrap();

        let program = vec![
            Instruction::new(1, [0, 0, 0]), // A 1
            Instruction::new(1, [0, 0, 0]), // A 2
            Instruction::new(2, [0, 0, 0]), // W
            Instruction::new(1, [0, 0, 0]), // A 3 (never forward-executed)
            Instruction::end(),
        ];

        vm.trigger("p1", program, 0, 0);
        assert_eq!(vm.store().get("p1").unwrap().data, Some(2));

        vm.abort("p1", false);

        assert_eq!(aborted.load(Ordering::SeqCst), 1);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn aborting_an_already_failed_to_abort_program_is_a_noop() {
        let mut vm: Vm<i32> = Vm::new(4, 1_000_000, |_| {}, |_| {}, |_| {}, |_| {});
        let (wait_f, wait_inv) = wait_opcode();
        vm.register(2, "wait", wait_f, Some(wait_inv)).unwrap();
        let program = vec![Instruction::new(2, [0, 0, 0]), Instruction::end()];
        vm.trigger("p1", program, 0, 0);

        vm.abort("p1", true); // Ok -> Aborting, stays suspended after one inverse step? program completes unwind since pc hits -1 quickly in this tiny program.
        vm.abort("p1", true); // second abort call on an already-removed/again-triggered id is simply a no-op (NotFound).
    }
}
