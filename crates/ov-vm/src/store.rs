//! Program store.
//!
//! Mirrors a C VM's `ov_vm_prog_db` id→program / alias→canonical two-index
//! design, which backs it with a fixed-capacity slot array; here a
//! `HashMap` plus an explicit capacity check gives the same externally
//! observable behavior (duplicate-id rejection, capacity exhaustion, alias
//! rules) without hand-rolling a free list.

use std::collections::HashMap;

use ov_proto::Instruction;
use thiserror::Error;

pub const MAX_ID_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramStatus {
    Ok,
    Aborting,
    FailedToAbort,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    Next,
    WaitAndNext,
    WaitAndRepeat,
    Finished,
    Error,
}

#[derive(Debug, Clone, Default)]
pub struct ProgramResult {
    pub code: i64,
    pub message: Option<String>,
}

pub struct Program<D> {
    pub id: String,
    pub instructions: Vec<Instruction>,
    pub pc: i64,
    pub status: ProgramStatus,
    pub last_return: Option<StepResult>,
    pub data: Option<D>,
    pub result: ProgramResult,
    pub started_at_usecs: i64,
}

impl<D> Program<D> {
    fn new(id: String, instructions: Vec<Instruction>, data: D, now_usecs: i64) -> Self {
        Program {
            id,
            instructions,
            pc: 0,
            status: ProgramStatus::Ok,
            last_return: None,
            data: Some(data),
            result: ProgramResult::default(),
            started_at_usecs: now_usecs,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum StoreError {
    #[error("program id exceeds {MAX_ID_LEN} bytes")]
    IdTooLong,
    #[error("program id already exists")]
    DuplicateId,
    #[error("program store is at capacity")]
    Full,
    #[error("alias already refers to a program")]
    AliasTaken,
    #[error("no program or alias with this id")]
    NotFound,
}

/// Fixed-capacity id→program table plus an alias→canonical index.
pub struct ProgramStore<D> {
    capacity: usize,
    programs: HashMap<String, Program<D>>,
    aliases: HashMap<String, String>,
    releaser: Box<dyn FnMut(D) + Send>,
}

impl<D> ProgramStore<D> {
    pub fn new(capacity: usize, releaser: impl FnMut(D) + Send + 'static) -> Self {
        ProgramStore {
            capacity,
            programs: HashMap::new(),
            aliases: HashMap::new(),
            releaser: Box::new(releaser),
        }
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    /// Resolve an id (canonical or alias) to its canonical program id.
    pub fn resolve<'a>(&'a self, id: &'a str) -> Option<&'a str> {
        if self.programs.contains_key(id) {
            return Some(id);
        }
        self.aliases.get(id).map(|s| s.as_str())
    }

    /// Insert a new program. On failure, hands `data` straight back so the
    /// caller (the VM's `trigger`) never silently drops it.
    pub fn insert(
        &mut self,
        id: impl Into<String>,
        instructions: Vec<Instruction>,
        data: D,
        now_usecs: i64,
    ) -> Result<(), (StoreError, D)> {
        let id = id.into();
        if id.len() > MAX_ID_LEN {
            return Err((StoreError::IdTooLong, data));
        }
        if self.programs.contains_key(&id) || self.aliases.contains_key(&id) {
            return Err((StoreError::DuplicateId, data));
        }
        if self.programs.len() >= self.capacity {
            return Err((StoreError::Full, data));
        }
        self.programs
            .insert(id.clone(), Program::new(id, instructions, data, now_usecs));
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Program<D>> {
        let canonical = self.resolve(id)?;
        self.programs.get(canonical)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Program<D>> {
        let canonical = self.resolve(id)?.to_string();
        self.programs.get_mut(&canonical)
    }

    /// Alias `new` to `id`. Aliasing an id to itself, or re-aliasing a name
    /// that already resolves to the same canonical program, is a no-op
    /// success; aliasing to a name that resolves to a *different* program is
    /// rejected.
    pub fn alias(&mut self, id: &str, new: impl Into<String>) -> Result<(), StoreError> {
        let new = new.into();
        let canonical = self.resolve(id).ok_or(StoreError::NotFound)?.to_string();
        if new == canonical {
            return Ok(());
        }
        if let Some(existing) = self.resolve(&new) {
            return if existing == canonical { Ok(()) } else { Err(StoreError::AliasTaken) };
        }
        self.aliases.insert(new, canonical);
        Ok(())
    }

    /// Remove a program by canonical id or alias, releasing its user data
    /// and dropping every alias that pointed at it.
    pub fn remove(&mut self, id: &str) -> Result<(), StoreError> {
        let canonical = self.resolve(id).ok_or(StoreError::NotFound)?.to_string();
        if let Some(mut program) = self.programs.remove(&canonical) {
            if let Some(data) = program.data.take() {
                (self.releaser)(data);
            }
        }
        self.aliases.retain(|_, v| v != &canonical);
        Ok(())
    }

    pub fn update_time(&mut self, id: &str, now_usecs: i64) -> Result<(), StoreError> {
        let program = self.get_mut(id).ok_or(StoreError::NotFound)?;
        program.started_at_usecs = now_usecs;
        Ok(())
    }

    /// First in-use program whose start timestamp is older than `before_usecs`.
    pub fn next_due(&self, before_usecs: i64) -> Option<String> {
        self.programs
            .values()
            .filter(|p| p.started_at_usecs < before_usecs)
            .min_by_key(|p| p.started_at_usecs)
            .map(|p| p.id.clone())
    }

    /// Visit every live program; the visitor can halt iteration early by
    /// returning `ControlFlow::Break(())`. Always returns `true`: this store
    /// has no state in which iteration itself cannot run.
    pub fn for_each(&self, mut f: impl FnMut(&Program<D>) -> std::ops::ControlFlow<()>) -> bool {
        for program in self.programs.values() {
            if f(program).is_break() {
                break;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ProgramStore<u32> {
        ProgramStore::new(4, |_data| {})
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let mut s = store();
        s.insert("p1", vec![Instruction::end()], 1, 0).unwrap();
        assert_eq!(
            s.insert("p1", vec![Instruction::end()], 2, 0).unwrap_err().0,
            StoreError::DuplicateId
        );
    }

    #[test]
    fn capacity_is_enforced() {
        let mut s = store();
        for i in 0..4 {
            s.insert(format!("p{i}"), vec![Instruction::end()], 0, 0).unwrap();
        }
        assert_eq!(
            s.insert("p4", vec![Instruction::end()], 0, 0).unwrap_err().0,
            StoreError::Full
        );
    }

    #[test]
    fn aliasing_id_to_itself_is_a_noop_success() {
        let mut s = store();
        s.insert("p1", vec![Instruction::end()], 0, 0).unwrap();
        assert!(s.alias("p1", "p1").is_ok());
    }

    #[test]
    fn alias_resolves_to_same_program_as_canonical() {
        let mut s = store();
        s.insert("p1", vec![Instruction::end()], 7, 0).unwrap();
        s.alias("p1", "p1-alias").unwrap();
        assert_eq!(s.get("p1-alias").unwrap().data, Some(7));
    }

    #[test]
    fn alias_already_taken_is_rejected() {
        let mut s = store();
        s.insert("p1", vec![Instruction::end()], 0, 0).unwrap();
        s.insert("p2", vec![Instruction::end()], 0, 0).unwrap();
        s.alias("p1", "shared").unwrap();
        assert_eq!(s.alias("p2", "shared"), Err(StoreError::AliasTaken));
    }

    #[test]
    fn realiasing_to_the_same_program_is_a_noop_success() {
        let mut s = store();
        s.insert("p1", vec![Instruction::end()], 0, 0).unwrap();
        s.alias("p1", "a").unwrap();
        assert!(s.alias("p1", "a").is_ok());
    }

    #[test]
    fn remove_drops_all_aliases_and_releases_data() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let released = Arc::new(AtomicUsize::new(0));
        let released2 = released.clone();
        let mut s = ProgramStore::new(4, move |_data: u32| {
            released2.fetch_add(1, Ordering::SeqCst);
        });
        s.insert("p1", vec![Instruction::end()], 0, 0).unwrap();
        s.alias("p1", "a1").unwrap();
        s.remove("p1").unwrap();

        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(s.get("p1").is_none());
        assert!(s.get("a1").is_none());
    }

    #[test]
    fn next_due_returns_none_when_all_programs_are_younger_than_bound() {
        let mut s = store();
        s.insert("p1", vec![Instruction::end()], 0, 100).unwrap();
        assert_eq!(s.next_due(50), None);
    }

    #[test]
    fn next_due_returns_oldest_eligible_program() {
        let mut s = store();
        s.insert("p1", vec![Instruction::end()], 0, 10).unwrap();
        s.insert("p2", vec![Instruction::end()], 0, 5).unwrap();
        assert_eq!(s.next_due(20), Some("p2".to_string()));
    }

    #[test]
    fn for_each_visitor_can_halt_iteration_early() {
        use std::ops::ControlFlow;

        let mut s = store();
        s.insert("p1", vec![Instruction::end()], 0, 0).unwrap();
        s.insert("p2", vec![Instruction::end()], 0, 0).unwrap();
        s.insert("p3", vec![Instruction::end()], 0, 0).unwrap();

        let mut visited = 0;
        let ran = s.for_each(|_program| {
            visited += 1;
            if visited == 1 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        assert!(ran);
        assert_eq!(visited, 1);
    }
}
