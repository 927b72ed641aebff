//! Recompilation scope trees
//!
//! A scope tree is the compiler-facing view of what a method actually did at
//! run time. It is rebuilt for every compilation from the previous native
//! method's debug scopes, inline caches and uncommon branch records (see
//! [`ScopeTreeBuilder`]), or from the inlining database, and discarded
//! afterwards.
//!
//! Scopes live in an arena and refer to each other by [`ScopeId`]. Each scope
//! maps call-site bcis to the subscopes observed there.

mod builder;
mod database;

pub use builder::ScopeTreeBuilder;
pub use database::{DatabaseEntry, DatabaseFormat, DatabaseKey, DatabaseNode, InliningDatabase};

use crate::code::{NativeMethodId, ScopeOffset};
use crate::ic::Target;
use crate::lookup::LookupKey;
use crate::oop::{Bci, ClassId, ClassTable, MethodId, Root};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

/// Handle of a scope in its [`ScopeTree`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(pub u32);

/// Method known only from interpreter caches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterpretedScope {
    pub key: LookupKey,
    pub method: MethodId,
    pub trusted: bool,
}

/// Scope that was inlined into a previous native method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InlinedScope {
    pub key: LookupKey,
    pub method: MethodId,
    pub nm: NativeMethodId,
    pub offset: ScopeOffset,
    pub lite: bool,
}

/// Callee observed through a caller's PIC entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PicScope {
    pub key: LookupKey,
    pub method: MethodId,
    pub target: Target,
}

/// Why a site is known not to have executed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UntakenSource {
    /// Inline cache empty and never dirty
    NeverExecuted,
    /// Uncommon branch that never trapped
    UncommonBranch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UninlinableScope {
    pub megamorphic: bool,
}

/// Scope supplied by the inlining database
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseScope {
    pub key: LookupKey,
    pub method: MethodId,
}

/// What is known about a scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RScopeKind {
    Interpreted(InterpretedScope),
    Inlined(InlinedScope),
    Pic(PicScope),
    Untaken(UntakenSource),
    Uninlinable(UninlinableScope),
    Database(DatabaseScope),
    /// No information
    Null,
}

/// One node of a scope tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RScope {
    pub kind: RScopeKind,
    pub sender: Option<ScopeId>,
    pub sender_bci: Option<Bci>,
    /// Re-walk depth this scope was created at
    pub level: u32,
    subscopes: BTreeMap<Bci, Vec<ScopeId>>,
    /// Sites whose uncommon branch was taken at least once
    uncommon: BTreeSet<Bci>,
    /// Sites whose feedback came from a complete, non-megamorphic cache
    complete: BTreeSet<Bci>,
}

impl RScope {
    fn new(kind: RScopeKind, sender: Option<(ScopeId, Bci)>, level: u32) -> Self {
        Self {
            kind,
            sender: sender.map(|(s, _)| s),
            sender_bci: sender.map(|(_, b)| b),
            level,
            subscopes: BTreeMap::new(),
            uncommon: BTreeSet::new(),
            complete: BTreeSet::new(),
        }
    }

    /// Lookup key of scopes that stand for a method
    pub fn key(&self) -> Option<LookupKey> {
        match self.kind {
            RScopeKind::Interpreted(s) => Some(s.key),
            RScopeKind::Inlined(s) => Some(s.key),
            RScopeKind::Pic(s) => Some(s.key),
            RScopeKind::Database(s) => Some(s.key),
            RScopeKind::Untaken(_) | RScopeKind::Uninlinable(_) | RScopeKind::Null => None,
        }
    }

    pub fn method(&self) -> Option<MethodId> {
        match self.kind {
            RScopeKind::Interpreted(s) => Some(s.method),
            RScopeKind::Inlined(s) => Some(s.method),
            RScopeKind::Pic(s) => Some(s.method),
            RScopeKind::Database(s) => Some(s.method),
            RScopeKind::Untaken(_) | RScopeKind::Uninlinable(_) | RScopeKind::Null => None,
        }
    }

    /// Call-site bcis with subscopes, ascending
    pub fn sites(&self) -> impl Iterator<Item = Bci> + '_ {
        self.subscopes.keys().copied()
    }

    pub fn is_untaken(&self) -> bool {
        matches!(self.kind, RScopeKind::Untaken(_))
    }

    pub fn is_uninlinable(&self) -> bool {
        matches!(self.kind, RScopeKind::Uninlinable(_))
    }

    /// Scopes compiled without full debug info must never become traps
    pub fn is_lite(&self) -> bool {
        matches!(self.kind, RScopeKind::Inlined(InlinedScope { lite: true, .. }))
    }
}

// ==================== Scope Tree ====================

/// Arena-owned scope tree for one compilation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeTree {
    scopes: Vec<RScope>,
}

impl ScopeTree {
    /// Tree with a single root of `kind`
    pub fn with_root(kind: RScopeKind) -> Self {
        Self {
            scopes: vec![RScope::new(kind, None, 0)],
        }
    }

    /// Tree that knows nothing
    pub fn null() -> Self {
        Self::with_root(RScopeKind::Null)
    }

    pub fn root(&self) -> ScopeId {
        ScopeId(0)
    }

    pub fn get(&self, id: ScopeId) -> Option<&RScope> {
        self.scopes.get(id.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    pub fn is_null(&self) -> bool {
        self.scopes.len() == 1 && self.scopes[0].kind == RScopeKind::Null
    }

    pub(crate) fn replace_root(&mut self, kind: RScopeKind) {
        self.scopes[0].kind = kind;
    }

    pub(crate) fn add(&mut self, kind: RScopeKind, sender: Option<(ScopeId, Bci)>, level: u32) -> ScopeId {
        let id = ScopeId(self.scopes.len() as u32);
        self.scopes.push(RScope::new(kind, sender, level));
        if let Some((parent, bci)) = sender {
            if let Some(p) = self.scopes.get_mut(parent.0 as usize) {
                p.subscopes.entry(bci).or_default().push(id);
            }
        }
        id
    }

    /// Attach an untaken leaf unless one is already there
    pub(crate) fn add_untaken(&mut self, parent: ScopeId, bci: Bci, source: UntakenSource, level: u32) {
        if !self.is_untaken(parent, bci) {
            self.add(RScopeKind::Untaken(source), Some((parent, bci)), level);
        }
    }

    pub(crate) fn mark_uncommon(&mut self, scope: ScopeId, bci: Bci) {
        if let Some(s) = self.scopes.get_mut(scope.0 as usize) {
            s.uncommon.insert(bci);
        }
    }

    pub(crate) fn mark_complete(&mut self, scope: ScopeId, bci: Bci) {
        if let Some(s) = self.scopes.get_mut(scope.0 as usize) {
            s.complete.insert(bci);
        }
    }

    // ==================== Queries ====================

    /// Subscopes observed at `bci` of `scope`
    pub fn subscopes(&self, scope: ScopeId, bci: Bci) -> &[ScopeId] {
        self.get(scope)
            .and_then(|s| s.subscopes.get(&bci))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    fn any_subscope(&self, scope: ScopeId, bci: Bci, pred: impl Fn(&RScope) -> bool) -> bool {
        self.subscopes(scope, bci)
            .iter()
            .filter_map(|id| self.get(*id))
            .any(pred)
    }

    /// The site (or its residual branch) never executed
    pub fn is_untaken(&self, scope: ScopeId, bci: Bci) -> bool {
        self.any_subscope(scope, bci, RScope::is_untaken)
    }

    pub fn is_uninlinable(&self, scope: ScopeId, bci: Bci) -> bool {
        self.any_subscope(scope, bci, RScope::is_uninlinable)
    }

    /// An uncommon branch at the site was taken before
    pub fn has_taken_uncommon(&self, scope: ScopeId, bci: Bci) -> bool {
        self.get(scope).is_some_and(|s| s.uncommon.contains(&bci))
    }

    /// Feedback at the site enumerates every receiver class seen
    pub fn is_complete(&self, scope: ScopeId, bci: Bci) -> bool {
        self.get(scope).is_some_and(|s| s.complete.contains(&bci))
    }

    /// Distinct receiver classes observed at the site, in subscope order
    pub fn receiver_classes(&self, scope: ScopeId, bci: Bci) -> Vec<ClassId> {
        let mut classes: Vec<ClassId> = Vec::new();
        for key in self
            .subscopes(scope, bci)
            .iter()
            .filter_map(|id| self.get(*id))
            .filter_map(RScope::key)
        {
            if !classes.contains(&key.class) {
                classes.push(key.class);
            }
        }
        classes
    }

    /// Subscope at the site standing for `key`
    pub fn lookup_subscope(&self, scope: ScopeId, bci: Bci, key: LookupKey) -> Option<ScopeId> {
        self.subscopes(scope, bci)
            .iter()
            .copied()
            .find(|id| self.get(*id).and_then(RScope::key) == Some(key))
    }

    pub fn is_lite(&self, scope: ScopeId) -> bool {
        self.get(scope).is_some_and(RScope::is_lite)
    }

    /// Preorder iteration over all scope ids
    pub fn preorder(&self) -> Vec<ScopeId> {
        let mut order = Vec::with_capacity(self.scopes.len());
        let mut stack = vec![self.root()];
        while let Some(id) = stack.pop() {
            order.push(id);
            if let Some(scope) = self.get(id) {
                for children in scope.subscopes.values().rev() {
                    stack.extend(children.iter().rev());
                }
            }
        }
        order
    }

    pub fn trace_roots(&self, visit: &mut dyn FnMut(Root)) {
        for scope in &self.scopes {
            if let Some(key) = scope.key() {
                key.trace_roots(visit);
            }
            if let Some(method) = scope.method() {
                visit(Root::Method(method));
            }
            match scope.kind {
                RScopeKind::Inlined(s) => visit(Root::NativeMethod(s.nm)),
                RScopeKind::Pic(s) => s.target.trace_roots(visit),
                _ => {}
            }
        }
    }

    // ==================== Rendering ====================

    /// Deterministic indented dump
    pub fn render(&self, classes: &ClassTable) -> String {
        let mut out = String::new();
        self.render_scope(classes, self.root(), None, 0, &mut out);
        out
    }

    fn render_scope(&self, classes: &ClassTable, id: ScopeId, bci: Option<Bci>, depth: usize, out: &mut String) {
        let Some(scope) = self.get(id) else {
            return;
        };
        let indent = "  ".repeat(depth);
        let at = bci.map(|b| format!("@{} ", b)).unwrap_or_default();
        let label = match scope.kind {
            RScopeKind::Interpreted(s) => format!(
                "Interpreted {}{}",
                s.key.display(classes),
                if s.trusted { "" } else { " (untrusted)" }
            ),
            RScopeKind::Inlined(s) => format!(
                "Inlined {} [nm {} scope {}]{}",
                s.key.display(classes),
                s.nm.0,
                s.offset,
                if s.lite { " lite" } else { "" }
            ),
            RScopeKind::Pic(s) => match s.target {
                Target::Compiled(nm) => format!("Pic {} -> nm {}", s.key.display(classes), nm.0),
                Target::Interpreted(_) => format!("Pic {} -> interpreted", s.key.display(classes)),
            },
            RScopeKind::Untaken(UntakenSource::NeverExecuted) => "Untaken (never executed)".to_string(),
            RScopeKind::Untaken(UntakenSource::UncommonBranch) => "Untaken (uncommon branch)".to_string(),
            RScopeKind::Uninlinable(s) => {
                format!("Uninlinable{}", if s.megamorphic { " (megamorphic)" } else { "" })
            }
            RScopeKind::Database(s) => format!("Database {}", s.key.display(classes)),
            RScopeKind::Null => "Null".to_string(),
        };
        let _ = writeln!(out, "{}{}{}", indent, at, label);
        for bci in &scope.uncommon {
            let _ = writeln!(out, "{}  @{} uncommon branch taken", indent, bci);
        }
        for (bci, children) in &scope.subscopes {
            for child in children {
                self.render_scope(classes, *child, Some(*bci), depth + 1, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (ClassTable, LookupKey, LookupKey) {
        let mut table = ClassTable::new();
        let point = table.define_class("Point", None);
        let foo = table.intern("foo");
        let bar = table.intern("bar");
        (table, LookupKey::new(point, foo), LookupKey::new(point, bar))
    }

    #[test]
    fn test_null_tree() {
        let tree = ScopeTree::null();
        assert!(tree.is_null());
        assert!(tree.subscopes(tree.root(), 3).is_empty());
        assert!(!tree.is_untaken(tree.root(), 3));
        assert!(tree.receiver_classes(tree.root(), 3).is_empty());
    }

    #[test]
    fn test_subscope_queries() {
        let (_, foo, bar) = setup();
        let mut tree = ScopeTree::with_root(RScopeKind::Interpreted(InterpretedScope {
            key: foo,
            method: MethodId(0),
            trusted: true,
        }));
        let root = tree.root();
        let pic = tree.add(
            RScopeKind::Pic(PicScope {
                key: bar,
                method: MethodId(1),
                target: Target::Interpreted(MethodId(1)),
            }),
            Some((root, 2)),
            1,
        );
        tree.add_untaken(root, 2, UntakenSource::NeverExecuted, 1);
        tree.add_untaken(root, 2, UntakenSource::NeverExecuted, 1);
        tree.add(RScopeKind::Uninlinable(UninlinableScope { megamorphic: true }), Some((root, 4)), 1);
        tree.mark_complete(root, 2);
        tree.mark_uncommon(root, 6);

        assert_eq!(tree.subscopes(root, 2).len(), 2);
        assert_eq!(tree.lookup_subscope(root, 2, bar), Some(pic));
        assert_eq!(tree.lookup_subscope(root, 2, foo), None);
        assert!(tree.is_untaken(root, 2));
        assert!(tree.is_uninlinable(root, 4));
        assert!(tree.is_complete(root, 2));
        assert!(!tree.is_complete(root, 4));
        assert!(tree.has_taken_uncommon(root, 6));
        assert_eq!(tree.receiver_classes(root, 2), vec![bar.class]);
        assert_eq!(tree.get(pic).unwrap().sender, Some(root));
        assert_eq!(tree.preorder().len(), tree.len());
    }

    #[test]
    fn test_render_is_indented() {
        let (table, foo, bar) = setup();
        let mut tree = ScopeTree::with_root(RScopeKind::Database(DatabaseScope { key: foo, method: MethodId(0) }));
        let root = tree.root();
        tree.add(RScopeKind::Database(DatabaseScope { key: bar, method: MethodId(1) }), Some((root, 1)), 1);
        tree.add_untaken(root, 3, UntakenSource::UncommonBranch, 1);

        let text = tree.render(&table);
        assert_eq!(
            text,
            "Database Point>>foo\n  @1 Database Point>>bar\n  @3 Untaken (uncommon branch)\n"
        );
    }

    #[test]
    fn test_trace_roots_covers_targets() {
        let (_, foo, bar) = setup();
        let mut tree = ScopeTree::with_root(RScopeKind::Inlined(InlinedScope {
            key: foo,
            method: MethodId(0),
            nm: NativeMethodId(4),
            offset: 0,
            lite: false,
        }));
        let root = tree.root();
        tree.add(
            RScopeKind::Pic(PicScope {
                key: bar,
                method: MethodId(1),
                target: Target::Compiled(NativeMethodId(7)),
            }),
            Some((root, 0)),
            1,
        );
        let mut roots = Vec::new();
        tree.trace_roots(&mut |r| roots.push(r));
        assert!(roots.contains(&Root::NativeMethod(NativeMethodId(4))));
        assert!(roots.contains(&Root::NativeMethod(NativeMethodId(7))));
        assert!(roots.contains(&Root::Class(foo.class)));
    }
}
