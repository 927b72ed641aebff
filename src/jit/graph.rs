//! Compiled graph
//!
//! The inliner's output: the tree of compile scopes (one per inlined method
//! or block, in preorder) and one resolved node per send it visited. The
//! emitter turns this into a native method.

use super::policy::RejectReason;
use crate::ic::IcFlags;
use crate::lookup::LookupKey;
use crate::oop::{Bci, ClassId, MethodId, Operand, Selector};
use crate::rscope::ScopeId;
use std::collections::BTreeMap;

/// Index of a compile scope; equal to its emitted scope offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompileScopeId(pub u32);

/// Statically known value of an operand inside a compile scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value {
    /// An object of exactly this class
    Class(ClassId),
    /// A block literal whose outer receiver has class `receiver`
    Block { method: MethodId, receiver: ClassId },
    Unknown,
}

/// One method or block being compiled, either the root or inlined
#[derive(Debug, Clone)]
pub struct CompileScope {
    pub id: CompileScopeId,
    pub key: LookupKey,
    pub method: MethodId,
    pub sender: Option<(CompileScopeId, Bci)>,
    pub depth: usize,
    /// Receiver class (compiled code is customized per receiver class)
    pub receiver: ClassId,
    pub args: Vec<Value>,
    /// Matching node of the scope tree, if feedback exists
    pub rscope: Option<ScopeId>,
    /// Inlined without feedback-based justification; never traps
    pub lite: bool,
}

/// A real (non-inlined) send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RealSend {
    pub flags: IcFlags,
    /// Lookup class of a super send
    pub lookup_class: Option<ClassId>,
}

/// An uncommon trap with the expression stack spilled at the send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrapNode {
    pub spill: Vec<Operand>,
}

/// One inlined arm of a type case
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeCaseArm {
    pub class: ClassId,
    pub callee: CompileScopeId,
}

/// The branch taken when no arm of a type case matches
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Residual {
    Send(RealSend),
    Trap(TrapNode),
}

/// How a send was compiled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendResolution {
    /// Receiver known statically; the callee body replaces the send
    Inlined { class: ClassId, callee: CompileScopeId },
    /// Class tests dispatching to inlined arms, merging after them
    TypeCase { arms: Vec<TypeCaseArm>, residual: Residual },
    RealSend(RealSend),
    UncommonTrap(TrapNode),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendNode {
    pub scope: CompileScopeId,
    pub bci: Bci,
    pub selector: Selector,
    pub resolution: SendResolution,
}

/// Counters of one compilation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InliningStats {
    pub inlined: usize,
    pub type_cases: usize,
    pub real_sends: usize,
    pub uncommon_traps: usize,
    pub rejections: BTreeMap<&'static str, usize>,
}

impl InliningStats {
    pub fn reject(&mut self, reason: RejectReason) {
        *self.rejections.entry(reason.name()).or_insert(0) += 1;
    }

    pub fn rejected(&self) -> usize {
        self.rejections.values().sum()
    }
}

/// Output of the inliner for one compilation
#[derive(Debug, Clone)]
pub struct CompiledGraph {
    pub key: LookupKey,
    pub method: MethodId,
    pub level: u8,
    pub scopes: Vec<CompileScope>,
    pub sends: Vec<SendNode>,
}

impl CompiledGraph {
    pub fn new(key: LookupKey, method: MethodId, level: u8) -> Self {
        Self {
            key,
            method,
            level,
            scopes: Vec::new(),
            sends: Vec::new(),
        }
    }

    pub fn scope(&self, id: CompileScopeId) -> Option<&CompileScope> {
        self.scopes.get(id.0 as usize)
    }

    pub(crate) fn add_scope(&mut self, mut scope: CompileScope) -> CompileScopeId {
        let id = CompileScopeId(self.scopes.len() as u32);
        scope.id = id;
        self.scopes.push(scope);
        id
    }

    /// Sends resolved inside `scope`, in bci order of resolution
    pub fn sends_in(&self, scope: CompileScopeId) -> impl Iterator<Item = &SendNode> {
        self.sends.iter().filter(move |s| s.scope == scope)
    }

    pub fn send_at(&self, scope: CompileScopeId, bci: Bci) -> Option<&SendNode> {
        self.sends.iter().find(|s| s.scope == scope && s.bci == bci)
    }

    /// Deepest inlining level reached
    pub fn inlined_depth(&self) -> usize {
        self.scopes.iter().map(|s| s.depth).max().unwrap_or(0)
    }
}
