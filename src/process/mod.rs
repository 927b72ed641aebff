//! Processes, activations and lexical contexts
//!
//! Green-thread processes share one native execution context, so only one of
//! them runs at a time. The recompilation policy walks a process stack; the
//! deoptimizer rewrites stacks across all processes when a compiled context
//! becomes unusable.

use crate::code::{NativeMethodId, ScopeOffset};
use crate::error::{Error, HandleKind, Result};
use crate::lookup::LookupKey;
use crate::oop::{Bci, MethodId, Root};

/// Process identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(pub u32);

/// Lexical context (heap-allocated captured variables) identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u32);

/// How an activation executes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Interpreted,
    /// Running native code; `scope` is the innermost inlined scope at the
    /// current pc
    Compiled { nm: NativeMethodId, scope: ScopeOffset },
}

/// One physical stack frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activation {
    pub key: LookupKey,
    pub method: MethodId,
    pub kind: FrameKind,
    pub is_block: bool,
    /// Context this frame allocated for its captured variables
    pub own_context: Option<ContextId>,
    /// Lexically enclosing context of a block
    pub home_context: Option<ContextId>,
    /// Frame was entered through a super send
    pub super_send: bool,
    pub bci: Bci,
}

impl Activation {
    pub fn interpreted(key: LookupKey, method: MethodId) -> Self {
        Self {
            key,
            method,
            kind: FrameKind::Interpreted,
            is_block: false,
            own_context: None,
            home_context: None,
            super_send: false,
            bci: 0,
        }
    }

    pub fn compiled(key: LookupKey, method: MethodId, nm: NativeMethodId, scope: ScopeOffset) -> Self {
        Self {
            kind: FrameKind::Compiled { nm, scope },
            ..Self::interpreted(key, method)
        }
    }

    /// Mark as a block activation whose home context is `home`
    pub fn block_in(mut self, home: Option<ContextId>) -> Self {
        self.is_block = true;
        self.home_context = home;
        self
    }

    pub fn with_context(mut self, context: ContextId) -> Self {
        self.own_context = Some(context);
        self
    }

    pub fn via_super(mut self) -> Self {
        self.super_send = true;
        self
    }

    pub fn at(mut self, bci: Bci) -> Self {
        self.bci = bci;
        self
    }

    pub fn is_compiled(&self) -> bool {
        matches!(self.kind, FrameKind::Compiled { .. })
    }

    pub fn native_method(&self) -> Option<NativeMethodId> {
        match self.kind {
            FrameKind::Compiled { nm, .. } => Some(nm),
            FrameKind::Interpreted => None,
        }
    }

    /// Whether this frame holds a reference to `context`
    pub fn references(&self, context: ContextId) -> bool {
        self.own_context == Some(context) || self.home_context == Some(context)
    }
}

/// A process: frames ordered oldest first
#[derive(Debug, Clone)]
pub struct Process {
    pub id: ProcessId,
    pub frames: Vec<Activation>,
}

impl Process {
    pub fn new(id: ProcessId) -> Self {
        Self { id, frames: Vec::new() }
    }

    /// Frame that created `context`, searching only frames older than `below`
    pub fn find_context_creator(&self, context: ContextId, below: usize) -> Option<usize> {
        self.frames[..below.min(self.frames.len())]
            .iter()
            .rposition(|f| f.own_context == Some(context))
    }
}

/// A lexical context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextInfo {
    pub creator: MethodId,
    /// Laid out by optimized code; incompatible with interpreted execution
    pub optimized: bool,
    pub valid: bool,
}

/// All processes plus the context registry
#[derive(Debug, Default)]
pub struct ProcessTable {
    processes: Vec<Process>,
    contexts: Vec<ContextInfo>,
    active: Option<ProcessId>,
    in_scheduler: bool,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty process and make it active if none is
    pub fn spawn(&mut self) -> ProcessId {
        let id = ProcessId(self.processes.len() as u32);
        self.processes.push(Process::new(id));
        if self.active.is_none() {
            self.active = Some(id);
        }
        id
    }

    pub fn process(&self, id: ProcessId) -> Result<&Process> {
        self.processes
            .get(id.0 as usize)
            .ok_or_else(|| Error::invalid_handle(HandleKind::Process, id.0 as usize))
    }

    pub fn process_mut(&mut self, id: ProcessId) -> Result<&mut Process> {
        self.processes
            .get_mut(id.0 as usize)
            .ok_or_else(|| Error::invalid_handle(HandleKind::Process, id.0 as usize))
    }

    pub fn processes(&self) -> impl Iterator<Item = &Process> {
        self.processes.iter()
    }

    /// Push a frame; returns its index
    pub fn push_frame(&mut self, id: ProcessId, frame: Activation) -> Result<usize> {
        let process = self.process_mut(id)?;
        process.frames.push(frame);
        Ok(process.frames.len() - 1)
    }

    pub fn frame(&self, id: ProcessId, index: usize) -> Result<&Activation> {
        self.process(id)?
            .frames
            .get(index)
            .ok_or_else(|| Error::invalid_handle(HandleKind::Frame, index))
    }

    pub fn frame_mut(&mut self, id: ProcessId, index: usize) -> Result<&mut Activation> {
        self.process_mut(id)?
            .frames
            .get_mut(index)
            .ok_or_else(|| Error::invalid_handle(HandleKind::Frame, index))
    }

    pub fn active(&self) -> Option<ProcessId> {
        self.active
    }

    pub fn set_active(&mut self, id: ProcessId) -> Result<()> {
        self.process(id)?;
        self.active = Some(id);
        Ok(())
    }

    /// The VM's own scheduler is running; there is no mutator to recover into
    pub fn enter_scheduler(&mut self) {
        self.in_scheduler = true;
    }

    pub fn leave_scheduler(&mut self) {
        self.in_scheduler = false;
    }

    pub fn in_scheduler(&self) -> bool {
        self.in_scheduler
    }

    pub fn new_context(&mut self, creator: MethodId, optimized: bool) -> ContextId {
        let id = ContextId(self.contexts.len() as u32);
        self.contexts.push(ContextInfo {
            creator,
            optimized,
            valid: true,
        });
        id
    }

    pub fn context(&self, id: ContextId) -> Option<&ContextInfo> {
        self.contexts.get(id.0 as usize)
    }

    pub fn invalidate_context(&mut self, id: ContextId) {
        if let Some(info) = self.contexts.get_mut(id.0 as usize) {
            info.valid = false;
        }
    }

    /// Every frame in every process referencing `context`
    pub fn frames_referencing(&self, context: ContextId) -> Vec<(ProcessId, usize)> {
        self.processes
            .iter()
            .flat_map(|p| {
                p.frames
                    .iter()
                    .enumerate()
                    .filter(move |(_, f)| f.references(context))
                    .map(move |(i, _)| (p.id, i))
            })
            .collect()
    }

    /// Home frame of the block activation at `index`; `None` when the block
    /// is not strictly nested on this stack
    pub fn find_home_frame(&self, id: ProcessId, index: usize) -> Result<Option<usize>> {
        let process = self.process(id)?;
        let frame = self.frame(id, index)?;
        Ok(frame
            .home_context
            .and_then(|ctx| process.find_context_creator(ctx, index)))
    }

    pub fn trace_roots(&self, visit: &mut dyn FnMut(Root)) {
        for process in &self.processes {
            for frame in &process.frames {
                frame.key.trace_roots(visit);
                visit(Root::Method(frame.method));
                if let Some(nm) = frame.native_method() {
                    visit(Root::NativeMethod(nm));
                }
            }
        }
        for context in self.contexts.iter().filter(|c| c.valid) {
            visit(Root::Method(context.creator));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oop::{ClassId, ClassTable};

    fn key() -> LookupKey {
        let mut table = ClassTable::new();
        LookupKey::new(ClassId(1), table.intern("foo"))
    }

    #[test]
    fn test_push_and_frame_access() {
        let mut table = ProcessTable::new();
        let pid = table.spawn();
        assert_eq!(table.active(), Some(pid));
        let idx = table.push_frame(pid, Activation::interpreted(key(), MethodId(0))).unwrap();
        assert_eq!(idx, 0);
        assert!(table.frame(pid, 0).is_ok());
        assert!(table.frame(pid, 1).is_err());
        assert!(table.process(ProcessId(9)).is_err());
    }

    #[test]
    fn test_spawned_processes_start_empty() {
        let mut table = ProcessTable::new();
        let first = table.spawn();
        let second = table.spawn();
        assert_ne!(first, second);
        let process = table.process(second).unwrap();
        assert_eq!(process.id, second);
        assert!(process.frames.is_empty());
        assert_eq!(process.find_context_creator(ContextId(0), 3), None);
    }

    #[test]
    fn test_find_home_frame() {
        let mut table = ProcessTable::new();
        let pid = table.spawn();
        let ctx = table.new_context(MethodId(0), false);
        table
            .push_frame(pid, Activation::interpreted(key(), MethodId(0)).with_context(ctx))
            .unwrap();
        table.push_frame(pid, Activation::interpreted(key(), MethodId(1))).unwrap();
        let block = table
            .push_frame(pid, Activation::interpreted(key(), MethodId(2)).block_in(Some(ctx)))
            .unwrap();
        assert_eq!(table.find_home_frame(pid, block).unwrap(), Some(0));

        let other = table.new_context(MethodId(5), false);
        let orphan = table
            .push_frame(pid, Activation::interpreted(key(), MethodId(2)).block_in(Some(other)))
            .unwrap();
        assert_eq!(table.find_home_frame(pid, orphan).unwrap(), None);
    }

    #[test]
    fn test_frames_referencing_across_processes() {
        let mut table = ProcessTable::new();
        let p1 = table.spawn();
        let p2 = table.spawn();
        let ctx = table.new_context(MethodId(0), true);
        table
            .push_frame(p1, Activation::interpreted(key(), MethodId(0)).with_context(ctx))
            .unwrap();
        table
            .push_frame(p2, Activation::interpreted(key(), MethodId(3)).block_in(Some(ctx)))
            .unwrap();
        table.push_frame(p2, Activation::interpreted(key(), MethodId(4))).unwrap();

        assert_eq!(table.frames_referencing(ctx), vec![(p1, 0), (p2, 0)]);
    }

    #[test]
    fn test_scheduler_flag() {
        let mut table = ProcessTable::new();
        assert!(!table.in_scheduler());
        table.enter_scheduler();
        assert!(table.in_scheduler());
        table.leave_scheduler();
        assert!(!table.in_scheduler());
    }
}
