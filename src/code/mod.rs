//! Compiled code: native methods and the code table
//!
//! A [`NativeMethod`] is everything the feedback loop needs to know about one
//! piece of compiled code: its debug scope descriptors (which methods were
//! inlined where), the inline caches embedded at its real sends, and its
//! uncommon-trap sites. The emitted machine code itself is not modelled.

use crate::error::{Error, HandleKind, Result};
use crate::ic::InlineCache;
use crate::lookup::LookupKey;
use crate::oop::{Bci, MethodId, Root};
use crate::trap::{TrapSite, TrapState};
use rustc_hash::FxHashMap as HashMap;

/// Native method identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeMethodId(pub u32);

/// Offset of a scope descriptor within its native method
pub type ScopeOffset = u32;

/// Where an inlined scope was called from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeSender {
    pub offset: ScopeOffset,
    pub bci: Bci,
}

/// Debug scope descriptor: one per inlined scope, in preorder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeDesc {
    pub offset: ScopeOffset,
    /// `None` for the root scope
    pub sender: Option<ScopeSender>,
    pub key: LookupKey,
    pub method: MethodId,
    /// Compiled without full debug information; never trap-converted
    pub lite: bool,
}

/// An inline cache embedded at a real send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSiteCache {
    pub scope: ScopeOffset,
    pub bci: Bci,
    pub cache: InlineCache,
}

/// Record of a speculatively eliminated branch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UncommonBranchRecord {
    pub scope: ScopeOffset,
    pub bci: Bci,
    /// The branch was taken at least once
    pub taken: bool,
}

/// Lifecycle of a native method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeState {
    /// Current version for its key
    Live,
    /// A newer version exists; existing activations may still run it
    Superseded,
    /// Must not be entered again
    Invalid,
}

/// Compiled method
#[derive(Debug, Clone)]
pub struct NativeMethod {
    pub id: NativeMethodId,
    pub key: LookupKey,
    pub method: MethodId,
    pub version: u16,
    pub level: u8,
    pub invocation_count: u32,
    /// Invocations since the counter last overflowed
    pub overflow_count: u32,
    pub trap_count: u32,
    /// Compile epoch at install time
    pub compiled_at: u64,
    /// Compiled code size
    pub size: u32,
    pub scopes: Vec<ScopeDesc>,
    pub call_sites: Vec<CallSiteCache>,
    pub traps: Vec<TrapSite>,
    pub state: CodeState,
}

impl NativeMethod {
    /// A method not yet installed in a code table
    pub fn new(key: LookupKey, method: MethodId, level: u8) -> Self {
        Self {
            id: NativeMethodId(u32::MAX),
            key,
            method,
            version: 0,
            level,
            invocation_count: 0,
            overflow_count: 0,
            trap_count: 0,
            compiled_at: 0,
            size: 0,
            scopes: Vec::new(),
            call_sites: Vec::new(),
            traps: Vec::new(),
            state: CodeState::Live,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.state != CodeState::Invalid
    }

    pub fn is_live(&self) -> bool {
        self.state == CodeState::Live
    }

    pub fn root_scope(&self) -> Option<&ScopeDesc> {
        self.scopes.first()
    }

    pub fn scope(&self, offset: ScopeOffset) -> Option<&ScopeDesc> {
        self.scopes.iter().find(|s| s.offset == offset)
    }

    /// Caches of the real sends at `(scope, bci)`
    pub fn call_sites_at(&self, scope: ScopeOffset, bci: Bci) -> impl Iterator<Item = &CallSiteCache> {
        self.call_sites
            .iter()
            .filter(move |c| c.scope == scope && c.bci == bci)
    }

    pub fn call_site_mut(&mut self, index: usize) -> Result<&mut CallSiteCache> {
        self.call_sites
            .get_mut(index)
            .ok_or_else(|| Error::invalid_handle(HandleKind::CallSite, index))
    }

    /// Uncommon branch records derived from the trap sites
    pub fn uncommon_branches(&self) -> impl Iterator<Item = UncommonBranchRecord> + '_ {
        self.traps.iter().map(|t| UncommonBranchRecord {
            scope: t.scope,
            bci: t.bci,
            taken: t.state == TrapState::Used,
        })
    }

    /// Whether `method` was compiled into this code (at any scope)
    pub fn depends_on(&self, method: MethodId) -> bool {
        self.method == method || self.scopes.iter().any(|s| s.method == method)
    }

    pub fn trace_roots(&self, visit: &mut dyn FnMut(Root)) {
        visit(Root::NativeMethod(self.id));
        self.key.trace_roots(visit);
        visit(Root::Method(self.method));
        for scope in &self.scopes {
            scope.key.trace_roots(visit);
            visit(Root::Method(scope.method));
        }
        for site in &self.call_sites {
            site.cache.trace_roots(visit);
        }
    }
}

// ==================== Code Table ====================

/// Arena of native methods with the current version per key
///
/// The arena is append-only. Invalidated methods keep their slot: frames
/// still running them are deoptimized through their scope descriptors, and
/// the levels of earlier versions pick the level of the next compilation.
#[derive(Debug, Default)]
pub struct CodeTable {
    methods: Vec<NativeMethod>,
    current: HashMap<LookupKey, NativeMethodId>,
    versions: HashMap<LookupKey, u16>,
    epoch: u64,
}

impl CodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `nm` as the current version for its key
    pub fn install(&mut self, mut nm: NativeMethod) -> NativeMethodId {
        let id = NativeMethodId(self.methods.len() as u32);
        self.epoch += 1;
        let version = self.versions.entry(nm.key).or_insert(0);
        *version += 1;

        nm.id = id;
        nm.version = *version;
        nm.compiled_at = self.epoch;
        nm.state = CodeState::Live;

        if let Some(previous) = self.current.insert(nm.key, id) {
            if let Some(old) = self.methods.get_mut(previous.0 as usize) {
                if old.state == CodeState::Live {
                    old.state = CodeState::Superseded;
                }
            }
        }
        self.methods.push(nm);
        id
    }

    pub fn get(&self, id: NativeMethodId) -> Option<&NativeMethod> {
        self.methods.get(id.0 as usize)
    }

    pub fn get_mut(&mut self, id: NativeMethodId) -> Option<&mut NativeMethod> {
        self.methods.get_mut(id.0 as usize)
    }

    pub fn checked(&self, id: NativeMethodId) -> Result<&NativeMethod> {
        self.get(id)
            .ok_or_else(|| Error::invalid_handle(HandleKind::NativeMethod, id.0 as usize))
    }

    pub fn checked_mut(&mut self, id: NativeMethodId) -> Result<&mut NativeMethod> {
        self.get_mut(id)
            .ok_or_else(|| Error::invalid_handle(HandleKind::NativeMethod, id.0 as usize))
    }

    /// Current version for `key`
    pub fn current(&self, key: &LookupKey) -> Option<NativeMethodId> {
        self.current.get(key).copied()
    }

    /// Whether a newer compiled version than `id` exists for `key`
    pub fn is_newer_than(&self, key: &LookupKey, id: NativeMethodId) -> bool {
        let Some(current) = self.current(key) else {
            return false;
        };
        match (self.get(current), self.get(id)) {
            (Some(cur), Some(old)) => current != id && cur.compiled_at > old.compiled_at,
            _ => false,
        }
    }

    /// Number of versions ever compiled for `key`
    pub fn version_count(&self, key: &LookupKey) -> u16 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Make `id` unenterable; returns false if it was already invalid
    pub fn invalidate(&mut self, id: NativeMethodId) -> bool {
        let Some(nm) = self.methods.get_mut(id.0 as usize) else {
            return false;
        };
        if nm.state == CodeState::Invalid {
            return false;
        }
        nm.state = CodeState::Invalid;
        if self.current.get(&nm.key) == Some(&id) {
            self.current.remove(&nm.key);
        }
        true
    }

    /// Invalidate every valid native method that compiled `method` in
    pub fn invalidate_dependents(&mut self, method: MethodId) -> Vec<NativeMethodId> {
        let dependents: Vec<NativeMethodId> = self
            .methods
            .iter()
            .filter(|nm| nm.is_valid() && nm.depends_on(method))
            .map(|nm| nm.id)
            .collect();
        for id in &dependents {
            self.invalidate(*id);
        }
        dependents
    }

    pub fn iter(&self) -> impl Iterator<Item = &NativeMethod> {
        self.methods.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut NativeMethod> {
        self.methods.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Valid native methods are roots
    pub fn trace_roots(&self, visit: &mut dyn FnMut(Root)) {
        for nm in self.methods.iter().filter(|nm| nm.is_valid()) {
            nm.trace_roots(visit);
        }
    }
}
