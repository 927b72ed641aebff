//! Lookup keys and the memoizing lookup cache
//!
//! A [`LookupKey`] pairs a receiver class with either a selector (a dynamic
//! send) or a concrete method (a block or an already-resolved callee). It is
//! the identity used by inline caches, the code table, scope trees and the
//! inlining database.

use crate::oop::{ClassId, ClassTable, MethodId, Root, Selector};
use rustc_hash::FxHashMap as HashMap;
use std::fmt;

/// What a lookup key resolves against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LookupTarget {
    Selector(Selector),
    Method(MethodId),
}

/// Identity pair used as the cache and table key everywhere
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LookupKey {
    pub class: ClassId,
    pub target: LookupTarget,
}

impl LookupKey {
    pub fn new(class: ClassId, selector: Selector) -> Self {
        Self {
            class,
            target: LookupTarget::Selector(selector),
        }
    }

    /// Key for a block or an already-resolved method
    pub fn for_method(class: ClassId, method: MethodId) -> Self {
        Self {
            class,
            target: LookupTarget::Method(method),
        }
    }

    pub fn selector(&self) -> Option<Selector> {
        match self.target {
            LookupTarget::Selector(s) => Some(s),
            LookupTarget::Method(_) => None,
        }
    }

    /// Resolve the key against the class table
    pub fn resolve(&self, classes: &ClassTable) -> Option<MethodId> {
        match self.target {
            LookupTarget::Selector(s) => classes.lookup(self.class, s),
            LookupTarget::Method(m) => classes.method(m).map(|_| m),
        }
    }

    /// Human-readable form, e.g. `Point>>x:`
    pub fn display<'a>(&'a self, classes: &'a ClassTable) -> KeyDisplay<'a> {
        KeyDisplay { key: self, classes }
    }

    pub fn trace_roots(&self, visit: &mut dyn FnMut(Root)) {
        visit(Root::Class(self.class));
        if let LookupTarget::Method(m) = self.target {
            visit(Root::Method(m));
        }
    }
}

/// Display adapter for [`LookupKey`]
pub struct KeyDisplay<'a> {
    key: &'a LookupKey,
    classes: &'a ClassTable,
}

impl fmt::Display for KeyDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let class = self.classes.class_name(self.key.class);
        match self.key.target {
            LookupTarget::Selector(s) => write!(f, "{}>>{}", class, self.classes.selector_name(s)),
            LookupTarget::Method(m) => match self.classes.method(m) {
                Some(method) if method.is_block() => write!(f, "{}>>[] in {}", class, self.classes.selector_name(method.selector)),
                Some(method) => write!(f, "{}>>{}", class, self.classes.selector_name(method.selector)),
                None => write!(f, "{}>>#{}", class, m.0),
            },
        }
    }
}

// ==================== Lookup Cache ====================

/// Lookup cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LookupStats {
    pub hits: u64,
    pub misses: u64,
    pub flushes: u64,
}

/// Memoizing global lookup cache
#[derive(Debug, Default)]
pub struct LookupCache {
    entries: HashMap<LookupKey, Option<MethodId>>,
    stats: LookupStats,
}

impl LookupCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `key`, memoizing hits and misses
    pub fn lookup(&mut self, classes: &ClassTable, key: LookupKey) -> Option<MethodId> {
        if let Some(&result) = self.entries.get(&key) {
            self.stats.hits += 1;
            return result;
        }
        self.stats.misses += 1;
        let result = key.resolve(classes);
        self.entries.insert(key, result);
        result
    }

    /// Drop everything (after a method is added or replaced)
    pub fn flush(&mut self) {
        self.entries.clear();
        self.stats.flushes += 1;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> LookupStats {
        self.stats
    }

    /// Cached keys and results are GC roots while cached
    pub fn trace_roots(&self, visit: &mut dyn FnMut(Root)) {
        for (key, result) in &self.entries {
            key.trace_roots(visit);
            if let Some(m) = result {
                visit(Root::Method(*m));
            }
        }
    }
}
