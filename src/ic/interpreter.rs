//! Inline caches of interpreted send sites
//!
//! The interpreter's sends follow the same cache protocol as compiled code.
//! Their contents are the type feedback for methods that have never been
//! compiled.

use super::{InlineCache, PicSpace, TargetResolver};
use crate::oop::{Bci, ClassId, MethodId, Root, Selector};
use rustc_hash::FxHashMap as HashMap;
use std::collections::BTreeMap;

/// Interpreter inline caches keyed by `(method, bci)`
#[derive(Debug, Clone, Default)]
pub struct InterpreterCaches {
    sites: HashMap<MethodId, BTreeMap<Bci, InlineCache>>,
}

impl InterpreterCaches {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cache at `(method, bci)`, created empty on first use
    pub fn site_mut(&mut self, method: MethodId, bci: Bci, selector: Selector) -> &mut InlineCache {
        self.sites
            .entry(method)
            .or_default()
            .entry(bci)
            .or_insert_with(|| InlineCache::new(selector))
    }

    /// Like [`Self::site_mut`], for a super send whose lookup starts at
    /// `lookup_class`
    pub fn super_site_mut(
        &mut self,
        method: MethodId,
        bci: Bci,
        selector: Selector,
        lookup_class: ClassId,
    ) -> &mut InlineCache {
        self.sites
            .entry(method)
            .or_default()
            .entry(bci)
            .or_insert_with(|| InlineCache::new_super(selector, lookup_class))
    }

    pub fn site(&self, method: MethodId, bci: Bci) -> Option<&InlineCache> {
        self.sites.get(&method)?.get(&bci)
    }

    /// All caches of `method` in bci order
    pub fn sites(&self, method: MethodId) -> impl Iterator<Item = (Bci, &InlineCache)> {
        self.sites
            .get(&method)
            .into_iter()
            .flat_map(|m| m.iter().map(|(bci, ic)| (*bci, ic)))
    }

    pub fn has_feedback(&self, method: MethodId) -> bool {
        self.sites.get(&method).is_some_and(|m| !m.is_empty())
    }

    /// Run [`InlineCache::cleanup`] on every site; returns removed entries
    pub fn cleanup_all(&mut self, resolver: &dyn TargetResolver, space: &mut PicSpace) -> usize {
        self.sites
            .values_mut()
            .flat_map(|m| m.values_mut())
            .map(|ic| ic.cleanup(resolver, space))
            .sum()
    }

    /// Forget the caches of a method (e.g. after it was superseded)
    pub fn remove_method(&mut self, method: MethodId, space: &mut PicSpace) {
        if let Some(sites) = self.sites.remove(&method) {
            for (_, mut ic) in sites {
                ic.clear(space);
            }
        }
    }

    pub fn trace_roots(&self, visit: &mut dyn FnMut(Root)) {
        for (method, sites) in &self.sites {
            visit(Root::Method(*method));
            for ic in sites.values() {
                ic.trace_roots(visit);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ic::tests::MapResolver;
    use crate::ic::{IcState, Target};
    use crate::lookup::LookupKey;
    use crate::oop::{ClassId, ClassTable};

    #[test]
    fn test_sites_created_on_demand() {
        let mut table = ClassTable::new();
        let foo = table.intern("foo");
        let mut caches = InterpreterCaches::new();
        assert!(!caches.has_feedback(MethodId(1)));

        caches.site_mut(MethodId(1), 3, foo);
        caches.site_mut(MethodId(1), 1, foo);
        assert!(caches.has_feedback(MethodId(1)));
        let bcis: Vec<Bci> = caches.sites(MethodId(1)).map(|(bci, _)| bci).collect();
        assert_eq!(bcis, vec![1, 3]);
        assert!(caches.site(MethodId(2), 1).is_none());
    }

    #[test]
    fn test_cleanup_all_and_remove() {
        let mut table = ClassTable::new();
        let foo = table.intern("foo");
        let class = ClassId(50);
        let mut resolver = MapResolver::default();
        resolver
            .targets
            .insert(LookupKey::new(class, foo), Target::Interpreted(MethodId(9)));
        let mut space = PicSpace::default();
        let mut caches = InterpreterCaches::new();

        caches.site_mut(MethodId(1), 0, foo).dispatch(class, &mut resolver, &mut space, 4);
        assert_eq!(caches.site(MethodId(1), 0).unwrap().state(), IcState::Monomorphic);

        resolver.targets.clear();
        assert_eq!(caches.cleanup_all(&resolver, &mut space), 1);
        assert_eq!(caches.site(MethodId(1), 0).unwrap().state(), IcState::Empty);

        caches.remove_method(MethodId(1), &mut space);
        assert!(!caches.has_feedback(MethodId(1)));
        assert_eq!(space.used(), 0);
    }
}
