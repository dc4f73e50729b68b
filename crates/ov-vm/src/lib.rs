//! Program store and reversible instruction VM.

pub mod store;
pub mod vm;

pub use store::{Program, ProgramResult, ProgramStatus, ProgramStore, StepResult, StoreError};
pub use vm::{Handler, TriggerOutcome, Vm, VmError};
