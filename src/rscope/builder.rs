//! Scope tree reconstruction
//!
//! Walks a previous native method's scope descriptors in preorder, keeping a
//! stack of open scopes, then attaches what its uncommon branch records and
//! embedded inline caches say about every call site. Records are processed
//! sorted by descending scope offset, then ascending bci, so identical
//! inputs always yield identical trees.

use super::{
    DatabaseNode, InlinedScope, InliningDatabase, InterpretedScope, PicScope, RScopeKind, ScopeId, ScopeTree,
    UninlinableScope, UntakenSource,
};
use crate::code::{CodeTable, NativeMethod, ScopeOffset};
use crate::config::FeedbackConfig;
use crate::ic::{InlineCache, InterpreterCaches, PicEntry, Target};
use crate::lookup::LookupKey;
use crate::oop::{Bci, ClassTable, MethodId};
use rustc_hash::FxHashMap as HashMap;
use tracing::{debug, trace, warn};

/// Builds [`ScopeTree`]s from compiled code, interpreter caches or the
/// inlining database
pub struct ScopeTreeBuilder<'a> {
    classes: &'a ClassTable,
    code: &'a CodeTable,
    caches: &'a InterpreterCaches,
    database: Option<&'a InliningDatabase>,
    config: &'a FeedbackConfig,
}

impl<'a> ScopeTreeBuilder<'a> {
    pub fn new(
        classes: &'a ClassTable,
        code: &'a CodeTable,
        caches: &'a InterpreterCaches,
        config: &'a FeedbackConfig,
    ) -> Self {
        Self {
            classes,
            code,
            caches,
            database: None,
            config,
        }
    }

    /// Graft database subtrees for callees that have an entry
    pub fn with_database(mut self, database: &'a InliningDatabase) -> Self {
        self.database = Some(database);
        self
    }

    /// Tree for compiling `key`: database entry, previous native method,
    /// interpreter feedback or nothing, in that order of preference
    pub fn build_for(&self, key: LookupKey, method: MethodId) -> ScopeTree {
        if let Some(tree) = self
            .database
            .and_then(|db| db.materialize(self.classes, key, None))
        {
            debug!("scope tree taken from inlining database");
            return tree;
        }
        if let Some(nm) = self.code.current(&key).and_then(|id| self.code.get(id)) {
            let trusted = nm.invocation_count >= self.config.min_invocations_before_trust;
            return self.build_from_native(nm, trusted);
        }
        self.build_interpreted(key, method)
    }

    /// Tree for a method that has never been compiled
    pub fn build_interpreted(&self, key: LookupKey, method: MethodId) -> ScopeTree {
        if !self.config.type_feedback {
            return ScopeTree::null();
        }
        let mut tree = ScopeTree::with_root(RScopeKind::Interpreted(InterpretedScope {
            key,
            method,
            trusted: true,
        }));
        let root = tree.root();
        self.expand_interpreted(&mut tree, key, root, method, true, 0);
        tree
    }

    /// Reconstruct the tree of a previously compiled method
    pub fn build_from_native(&self, nm: &NativeMethod, trusted: bool) -> ScopeTree {
        if !self.config.type_feedback {
            return ScopeTree::null();
        }
        let mut tree = ScopeTree::null();
        self.walk_native(&mut tree, nm.key, nm, trusted, 0, None);
        debug!(
            nm = nm.id.0,
            trusted,
            scopes = tree.len(),
            "scope tree reconstructed"
        );
        tree
    }

    /// Add the scopes of `nm`; `parent` is `None` when `nm` becomes the root
    fn walk_native(
        &self,
        tree: &mut ScopeTree,
        outer: LookupKey,
        nm: &NativeMethod,
        trusted: bool,
        level: u32,
        parent: Option<(ScopeId, Bci)>,
    ) -> Option<ScopeId> {
        let mut descs: Vec<_> = nm.scopes.iter().collect();
        descs.sort_by_key(|d| d.offset);

        let mut ids: HashMap<ScopeOffset, ScopeId> = HashMap::default();
        let mut stack: Vec<(ScopeOffset, ScopeId)> = Vec::new();
        for desc in descs {
            let kind = RScopeKind::Inlined(InlinedScope {
                key: desc.key,
                method: desc.method,
                nm: nm.id,
                offset: desc.offset,
                lite: desc.lite,
            });
            let id = match desc.sender {
                None if ids.is_empty() => match parent {
                    Some(sender) => tree.add(kind, Some(sender), level),
                    None => {
                        tree.replace_root(kind);
                        tree.root()
                    }
                },
                None => {
                    warn!(nm = nm.id.0, offset = desc.offset, "second root scope descriptor ignored");
                    continue;
                }
                Some(sender) => {
                    while stack.last().is_some_and(|(offset, _)| *offset != sender.offset) {
                        stack.pop();
                    }
                    let Some(&(_, parent_id)) = stack.last() else {
                        warn!(nm = nm.id.0, offset = desc.offset, "orphaned scope descriptor");
                        continue;
                    };
                    tree.add(kind, Some((parent_id, sender.bci)), level)
                }
            };
            ids.insert(desc.offset, id);
            stack.push((desc.offset, id));
        }

        let mut records: Vec<_> = nm.uncommon_branches().collect();
        records.sort_by(|a, b| b.scope.cmp(&a.scope).then(a.bci.cmp(&b.bci)));
        for record in records {
            let Some(&scope) = ids.get(&record.scope) else {
                continue;
            };
            if record.taken {
                tree.mark_uncommon(scope, record.bci);
            } else {
                tree.add_untaken(scope, record.bci, UntakenSource::UncommonBranch, level + 1);
            }
        }

        let mut sites: Vec<_> = nm.call_sites.iter().collect();
        sites.sort_by(|a, b| b.scope.cmp(&a.scope).then(a.bci.cmp(&b.bci)));
        for site in sites {
            let Some(&scope) = ids.get(&site.scope) else {
                continue;
            };
            self.attach_cache(tree, outer, scope, site.bci, &site.cache, trusted, level);
        }

        nm.root_scope().and_then(|d| ids.get(&d.offset).copied())
    }

    /// What one inline cache says about its call site
    fn attach_cache(
        &self,
        tree: &mut ScopeTree,
        outer: LookupKey,
        scope: ScopeId,
        bci: Bci,
        cache: &InlineCache,
        trusted: bool,
        level: u32,
    ) {
        if cache.was_never_executed() {
            if !tree.has_taken_uncommon(scope, bci) {
                tree.add_untaken(scope, bci, UntakenSource::NeverExecuted, level + 1);
            }
            return;
        }
        if cache.is_megamorphic() || cache.is_uninlinable() {
            tree.add(
                RScopeKind::Uninlinable(UninlinableScope {
                    megamorphic: cache.is_megamorphic(),
                }),
                Some((scope, bci)),
                level + 1,
            );
            return;
        }
        if cache.is_empty() {
            // Executed, but the contents were since invalidated
            return;
        }

        let targets = cache.number_of_targets();
        if !self.trusts(cache, targets, trusted) {
            trace!(bci, targets, trusted, "inline cache contents not trusted");
            return;
        }
        tree.mark_complete(scope, bci);
        for entry in cache.entries() {
            self.attach_entry(tree, outer, scope, bci, cache, entry, trusted, level);
        }
    }

    fn trusts(&self, cache: &InlineCache, targets: usize, trusted: bool) -> bool {
        let limit = if trusted {
            self.config.pic_trust_limit
        } else {
            self.config.untrusted_pic_limit
        };
        if targets <= limit {
            return true;
        }
        let name = self.classes.selector_name(cache.selector());
        targets <= 1 && self.config.hot_arithmetic_selectors.iter().any(|s| s == name)
    }

    fn attach_entry(
        &self,
        tree: &mut ScopeTree,
        outer: LookupKey,
        scope: ScopeId,
        bci: Bci,
        cache: &InlineCache,
        entry: PicEntry,
        trusted: bool,
        level: u32,
    ) {
        let key = LookupKey::new(entry.class, cache.selector());
        let sender = Some((scope, bci));

        if let Some(node) = self.database.and_then(|db| db.lookup(self.classes, outer, Some(key))) {
            if let Some(method) = key.resolve(self.classes) {
                graft_database(tree, self.classes, node, key, method, sender, level + 1);
                return;
            }
        }

        let depth_left = level < self.config.max_scope_depth;
        match entry.target {
            Target::Compiled(id) => {
                let Some(callee) = self.code.get(id).filter(|nm| nm.is_valid()) else {
                    // Stale entry: the callee was invalidated since the cache filled
                    return;
                };
                let young = self.code.epoch().saturating_sub(callee.compiled_at) <= self.config.max_rewalk_age;
                let hot = callee.invocation_count >= self.config.min_invocations_before_trust;
                if trusted && depth_left && young && hot {
                    trace!(nm = id.0, level, "re-walking callee native method");
                    self.walk_native(tree, outer, callee, trusted, level + 1, sender);
                } else {
                    tree.add(
                        RScopeKind::Pic(PicScope {
                            key,
                            method: callee.method,
                            target: entry.target,
                        }),
                        sender,
                        level + 1,
                    );
                }
            }
            Target::Interpreted(method) => {
                if depth_left && self.caches.has_feedback(method) {
                    let id = tree.add(
                        RScopeKind::Interpreted(InterpretedScope { key, method, trusted }),
                        sender,
                        level + 1,
                    );
                    self.expand_interpreted(tree, outer, id, method, trusted, level + 1);
                } else {
                    tree.add(
                        RScopeKind::Pic(PicScope {
                            key,
                            method,
                            target: entry.target,
                        }),
                        sender,
                        level + 1,
                    );
                }
            }
        }
    }

    /// Expand an interpreted scope from the interpreter caches of `method`
    fn expand_interpreted(
        &self,
        tree: &mut ScopeTree,
        outer: LookupKey,
        scope: ScopeId,
        method: MethodId,
        trusted: bool,
        level: u32,
    ) {
        for (bci, cache) in self.caches.sites(method) {
            self.attach_cache(tree, outer, scope, bci, cache, trusted, level);
        }
    }
}

/// Copy a database node (and its children) below `sender`
fn graft_database(
    tree: &mut ScopeTree,
    classes: &ClassTable,
    node: &DatabaseNode,
    key: LookupKey,
    method: MethodId,
    sender: Option<(ScopeId, Bci)>,
    level: u32,
) -> ScopeId {
    let id = tree.add(
        RScopeKind::Database(super::DatabaseScope { key, method }),
        sender,
        level,
    );
    super::database::fill_children(tree, classes, node, id, level);
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{CallSiteCache, ScopeDesc, ScopeSender};
    use crate::ic::{tests::MapResolver, PicSpace};
    use crate::oop::{ClassId, Selector};
    use crate::trap::TrapSite;

    struct World {
        classes: ClassTable,
        code: CodeTable,
        caches: InterpreterCaches,
        config: FeedbackConfig,
        foo: Selector,
        bar: Selector,
        point: ClassId,
    }

    fn world() -> World {
        let mut classes = ClassTable::new();
        let point = classes.define_class("Point", None);
        let foo = classes.intern("foo");
        let bar = classes.intern("bar");
        World {
            classes,
            code: CodeTable::new(),
            caches: InterpreterCaches::new(),
            config: FeedbackConfig::default(),
            foo,
            bar,
            point,
        }
    }

    fn filled_cache(selector: Selector, classes: &[ClassId]) -> InlineCache {
        let mut resolver = MapResolver::default();
        let mut space = PicSpace::default();
        let mut ic = InlineCache::new(selector);
        for (i, class) in classes.iter().enumerate() {
            resolver
                .targets
                .insert(LookupKey::new(*class, selector), Target::Interpreted(MethodId(100 + i as u32)));
            ic.dispatch(*class, &mut resolver, &mut space, 4);
        }
        ic
    }

    /// foo with bar inlined at bci 1, plus a cache at bci 3 of the root
    fn native(w: &World, cache: InlineCache) -> NativeMethod {
        let key = LookupKey::new(w.point, w.foo);
        let mut nm = NativeMethod::new(key, MethodId(0), 1);
        nm.scopes.push(ScopeDesc { offset: 0, sender: None, key, method: MethodId(0), lite: false });
        nm.scopes.push(ScopeDesc {
            offset: 1,
            sender: Some(ScopeSender { offset: 0, bci: 1 }),
            key: LookupKey::new(w.point, w.bar),
            method: MethodId(1),
            lite: false,
        });
        nm.call_sites.push(CallSiteCache { scope: 0, bci: 3, cache });
        nm
    }

    #[test]
    fn test_inlined_structure() {
        let w = world();
        let nm = native(&w, InlineCache::new(w.foo));
        let builder = ScopeTreeBuilder::new(&w.classes, &w.code, &w.caches, &w.config);
        let tree = builder.build_from_native(&nm, true);
        let root = tree.root();

        assert!(matches!(tree.get(root).unwrap().kind, RScopeKind::Inlined(_)));
        let inlined = tree.lookup_subscope(root, 1, LookupKey::new(w.point, w.bar)).unwrap();
        assert!(matches!(tree.get(inlined).unwrap().kind, RScopeKind::Inlined(s) if s.offset == 1));
        assert!(tree.is_untaken(root, 3));
    }

    #[test]
    fn test_dirty_empty_cache_gives_nothing() {
        let w = world();
        let mut ic = filled_cache(w.foo, &[w.point]);
        ic.clear(&mut PicSpace::default());
        let nm = native(&w, ic);
        let tree = ScopeTreeBuilder::new(&w.classes, &w.code, &w.caches, &w.config).build_from_native(&nm, true);
        assert!(tree.subscopes(tree.root(), 3).is_empty());
    }

    #[test]
    fn test_trust_gating() {
        let mut w = world();
        let a = w.classes.define_class("A", None);
        let b = w.classes.define_class("B", None);
        let nm = native(&w, filled_cache(w.foo, &[a, b]));
        let builder = ScopeTreeBuilder::new(&w.classes, &w.code, &w.caches, &w.config);

        let trusted = builder.build_from_native(&nm, true);
        assert_eq!(trusted.receiver_classes(trusted.root(), 3), vec![a, b]);
        assert!(trusted.is_complete(trusted.root(), 3));

        let untrusted = builder.build_from_native(&nm, false);
        assert!(untrusted.subscopes(untrusted.root(), 3).is_empty());
    }

    #[test]
    fn test_hot_arithmetic_selector_trusted_when_monomorphic() {
        let mut w = world();
        let plus = w.classes.intern("+");
        w.config.untrusted_pic_limit = 0;
        let nm = native(&w, filled_cache(plus, &[w.point]));
        let tree = ScopeTreeBuilder::new(&w.classes, &w.code, &w.caches, &w.config).build_from_native(&nm, false);
        assert_eq!(tree.receiver_classes(tree.root(), 3), vec![w.point]);
    }

    #[test]
    fn test_megamorphic_is_uninlinable() {
        let mut w = world();
        let classes: Vec<ClassId> = (0..5).map(|i| w.classes.define_class(&format!("C{}", i), None)).collect();
        let nm = native(&w, filled_cache(w.foo, &classes));
        let tree = ScopeTreeBuilder::new(&w.classes, &w.code, &w.caches, &w.config).build_from_native(&nm, true);
        assert!(tree.is_uninlinable(tree.root(), 3));
        assert!(tree.receiver_classes(tree.root(), 3).is_empty());
    }

    #[test]
    fn test_uncommon_records() {
        let w = world();
        let mut nm = native(&w, filled_cache(w.foo, &[w.point]));
        nm.traps.push(TrapSite::new(1, 2));
        nm.traps.push(TrapSite::new(0, 5));
        nm.traps[1].patch();
        let tree = ScopeTreeBuilder::new(&w.classes, &w.code, &w.caches, &w.config).build_from_native(&nm, true);
        let inner = tree.lookup_subscope(tree.root(), 1, LookupKey::new(w.point, w.bar)).unwrap();

        assert!(tree.is_untaken(inner, 2));
        assert!(tree.has_taken_uncommon(tree.root(), 5));
        assert!(!tree.is_untaken(tree.root(), 5));
    }

    #[test]
    fn test_orphaned_descriptor_is_skipped() {
        let w = world();
        let mut nm = native(&w, InlineCache::new(w.foo));
        nm.scopes.push(ScopeDesc {
            offset: 2,
            sender: Some(ScopeSender { offset: 9, bci: 0 }),
            key: LookupKey::new(w.point, w.foo),
            method: MethodId(2),
            lite: false,
        });
        let tree = ScopeTreeBuilder::new(&w.classes, &w.code, &w.caches, &w.config).build_from_native(&nm, true);
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn test_type_feedback_disabled_yields_null() {
        let mut w = world();
        w.config.type_feedback = false;
        let nm = native(&w, InlineCache::new(w.foo));
        let builder = ScopeTreeBuilder::new(&w.classes, &w.code, &w.caches, &w.config);
        assert!(builder.build_from_native(&nm, true).is_null());
        assert!(builder
            .build_interpreted(LookupKey::new(w.point, w.foo), MethodId(0))
            .is_null());
    }

    #[test]
    fn test_interpreted_expansion_bounded() {
        let mut w = world();
        // A recursive interpreted method whose cache points back at itself
        let mut resolver = MapResolver::default();
        let key = LookupKey::new(w.point, w.foo);
        resolver.targets.insert(key, Target::Interpreted(MethodId(0)));
        let mut space = PicSpace::default();
        w.caches
            .site_mut(MethodId(0), 1, w.foo)
            .dispatch(w.point, &mut resolver, &mut space, 4);
        w.config.max_scope_depth = 3;

        let tree = ScopeTreeBuilder::new(&w.classes, &w.code, &w.caches, &w.config).build_interpreted(key, MethodId(0));
        // root + 3 interpreted levels + final PIC leaf
        assert_eq!(tree.len(), 5);
        let leaf = tree.get(ScopeId(4)).unwrap();
        assert!(matches!(leaf.kind, RScopeKind::Pic(_)));
    }
}
