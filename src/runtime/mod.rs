//! Runtime façade for the adaptive optimization loop
//!
//! [`Runtime`] owns every table the loop touches (classes, compiled code,
//! caches, processes, the inlining database and trap history) and exposes
//! the events an execution engine reports: sends through inline caches,
//! invocations, uncommon traps and method redefinition. Each event runs the
//! relevant part of the loop and reports what it did.

mod resolver;

pub use resolver::RuntimeResolver;

use crate::code::{CodeTable, NativeMethodId};
use crate::config::VmConfig;
use crate::error::{Error, HandleKind, Result};
use crate::ic::{IcTransition, InlineCache, InterpreterCaches, PicSpace};
use crate::jit::{self, CompilationContext, Compilation};
use crate::lookup::{LookupCache, LookupKey, LookupStats};
use crate::oop::{Bci, ClassId, ClassTable, MethodBuilder, MethodId, Root};
use crate::process::{ProcessId, ProcessTable};
use crate::recompile::{DeclineReason, RecompilationPolicy, RecompileDecision, RecompileTrigger};
use crate::rscope::{InliningDatabase, ScopeTree, ScopeTreeBuilder};
use crate::trap::{self, TrapHistory, TrapOutcome};
use rustc_hash::FxHashMap as HashMap;
use tracing::{debug, error, info};

/// What a recompilation request led to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecompileOutcome {
    Compiled { nm: NativeMethodId, key: LookupKey },
    Deferred { home: MethodId },
    Declined(DeclineReason),
}

/// Result of handling an uncommon trap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrapReport {
    pub outcome: TrapOutcome,
    /// Set when the trap count reached the recompilation threshold
    pub recompile: Option<RecompileOutcome>,
}

/// Event counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    pub sends: u64,
    pub not_understood: u64,
    pub compilations: u64,
    pub recompilations: u64,
    pub deferred: u64,
    pub declined: u64,
    pub traps: u64,
}

/// The adaptive optimization runtime
pub struct Runtime {
    config: VmConfig,
    classes: ClassTable,
    code: CodeTable,
    lookup: LookupCache,
    caches: InterpreterCaches,
    pics: PicSpace,
    processes: ProcessTable,
    database: InliningDatabase,
    traps: TrapHistory,
    /// Invocation counters of interpreted methods
    counters: HashMap<MethodId, u32>,
    stats: RuntimeStats,
}

impl Runtime {
    /// Create a runtime with the default configuration
    pub fn new() -> Self {
        Self::build(VmConfig::default(), ClassTable::new())
    }

    pub fn with_config(config: VmConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config, ClassTable::new()))
    }

    /// Create a runtime over an existing class table
    pub fn with_classes(config: VmConfig, classes: ClassTable) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config, classes))
    }

    fn build(config: VmConfig, classes: ClassTable) -> Self {
        let pics = PicSpace::new(config.ic.pic_space_capacity, config.ic.megamorphic_stubs_enabled);
        Self {
            config,
            classes,
            code: CodeTable::new(),
            lookup: LookupCache::new(),
            caches: InterpreterCaches::new(),
            pics,
            processes: ProcessTable::new(),
            database: InliningDatabase::new(),
            traps: TrapHistory::new(),
            counters: HashMap::default(),
            stats: RuntimeStats::default(),
        }
    }

    // ==================== Accessors ====================

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn classes(&self) -> &ClassTable {
        &self.classes
    }

    /// Direct class table access; use [`Self::replace_method`] to redefine
    /// methods that may already be compiled
    pub fn classes_mut(&mut self) -> &mut ClassTable {
        &mut self.classes
    }

    pub fn code(&self) -> &CodeTable {
        &self.code
    }

    pub fn caches(&self) -> &InterpreterCaches {
        &self.caches
    }

    pub fn pic_space(&self) -> &PicSpace {
        &self.pics
    }

    pub fn processes(&self) -> &ProcessTable {
        &self.processes
    }

    pub fn processes_mut(&mut self) -> &mut ProcessTable {
        &mut self.processes
    }

    pub fn database(&self) -> &InliningDatabase {
        &self.database
    }

    pub fn database_mut(&mut self) -> &mut InliningDatabase {
        &mut self.database
    }

    pub fn trap_history(&self) -> &TrapHistory {
        &self.traps
    }

    pub fn lookup_stats(&self) -> LookupStats {
        self.lookup.stats()
    }

    pub fn stats(&self) -> RuntimeStats {
        self.stats
    }

    /// Invocation count of an interpreted method
    pub fn invocation_count(&self, method: MethodId) -> u32 {
        self.counters.get(&method).copied().unwrap_or(0)
    }

    fn resolve_key(&self, key: LookupKey) -> Result<MethodId> {
        key.resolve(&self.classes)
            .ok_or_else(|| Error::not_understood(key.display(&self.classes).to_string()))
    }

    // ==================== Compilation ====================

    /// Scope tree a compilation of `key` would start from
    pub fn scope_tree(&self, key: LookupKey) -> Result<ScopeTree> {
        let method = self.resolve_key(key)?;
        Ok(self.tree_builder().build_for(key, method))
    }

    fn tree_builder(&self) -> ScopeTreeBuilder<'_> {
        ScopeTreeBuilder::new(&self.classes, &self.code, &self.caches, &self.config.feedback)
            .with_database(&self.database)
    }

    /// Compile `key` without installing the result
    pub fn prepare(&self, key: LookupKey, level: u8) -> Result<Compilation> {
        let method = self.resolve_key(key)?;
        let tree = self.tree_builder().build_for(key, method);
        let ctx = CompilationContext::new(&self.classes, &self.code, &self.config, &self.traps);
        jit::compile(&ctx, &tree, key, method, level)
    }

    /// Compile and install `key` one level above its current code
    pub fn compile(&mut self, key: LookupKey) -> Result<NativeMethodId> {
        let level = self
            .code
            .current(&key)
            .and_then(|id| self.code.get(id))
            .map_or(1, |nm| (nm.level + 1).min(self.config.recompile.max_optimization_level));
        self.compile_at(key, level)
    }

    fn compile_at(&mut self, key: LookupKey, level: u8) -> Result<NativeMethodId> {
        let compilation = self.prepare(key, level)?;
        let method = compilation.graph.method;
        let size = compilation.native.size;
        let id = self.code.install(compilation.native);
        self.counters.remove(&method);
        self.stats.compilations += 1;
        info!(
            key = %key.display(&self.classes),
            nm = id.0,
            level,
            size,
            inlined = compilation.stats.inlined,
            "installed native method"
        );
        Ok(id)
    }

    // ==================== Sends ====================

    /// Send from the interpreter at `(method, bci)` to a receiver of class
    /// `receiver`
    pub fn send_interpreted(&mut self, method: MethodId, bci: Bci, receiver: ClassId) -> Result<IcTransition> {
        let m = self.classes.method_checked(method)?;
        let site = m
            .send_at(bci)
            .ok_or_else(|| Error::invalid_handle(HandleKind::CallSite, bci as usize))?;
        let selector = site.selector;
        let super_class = if site.is_super {
            self.classes.class(m.holder).and_then(|c| c.superclass)
        } else {
            None
        };

        let cache = match super_class {
            Some(class) => self.caches.super_site_mut(method, bci, selector, class),
            None => self.caches.site_mut(method, bci, selector),
        };
        let mut resolver = RuntimeResolver {
            classes: &self.classes,
            code: &self.code,
            lookup: &mut self.lookup,
        };
        let transition = cache.dispatch(receiver, &mut resolver, &mut self.pics, self.config.ic.max_entries);
        self.after_send(transition)
    }

    /// Send through call site `site` of native method `nm`
    pub fn send_compiled(&mut self, nm: NativeMethodId, site: usize, receiver: ClassId) -> Result<IcTransition> {
        // The cache is detached while the resolver reads the code table
        let slot = self.code.checked_mut(nm)?.call_site_mut(site)?;
        let selector = slot.cache.selector();
        let mut cache = std::mem::replace(&mut slot.cache, InlineCache::new(selector));

        let mut resolver = RuntimeResolver {
            classes: &self.classes,
            code: &self.code,
            lookup: &mut self.lookup,
        };
        let transition = cache.dispatch(receiver, &mut resolver, &mut self.pics, self.config.ic.max_entries);
        self.code.checked_mut(nm)?.call_site_mut(site)?.cache = cache;
        self.after_send(transition)
    }

    /// Create the (empty) caches of every send in `method`, as the
    /// interpreter does on a method's first activation
    pub fn link_method(&mut self, method: MethodId) -> Result<()> {
        let m = self.classes.method_checked(method)?;
        let super_class = self.classes.class(m.holder).and_then(|c| c.superclass);
        for site in m.sends() {
            match super_class {
                Some(class) if site.is_super => {
                    self.caches.super_site_mut(method, site.bci, site.selector, class);
                }
                _ => {
                    self.caches.site_mut(method, site.bci, site.selector);
                }
            }
        }
        Ok(())
    }

    fn after_send(&mut self, transition: IcTransition) -> Result<IcTransition> {
        self.stats.sends += 1;
        if transition == IcTransition::NotUnderstood {
            self.stats.not_understood += 1;
            if self.processes.in_scheduler() {
                error!("message not understood in scheduler context");
                return Err(Error::fatal("lookup failed in the scheduler context"));
            }
        }
        Ok(transition)
    }

    // ==================== Invocation Counting ====================

    /// Count one invocation of the activation at `index`; returns the
    /// recompilation outcome when its counter overflowed
    pub fn invoke(&mut self, pid: ProcessId, index: usize) -> Result<Option<RecompileOutcome>> {
        let frame = self.processes.frame(pid, index)?;
        let (key, method) = (frame.key, frame.method);
        let limit = self
            .config
            .effective_invocation_limit(self.traps.backoff(&key));

        let overflowed = match frame.native_method() {
            Some(nm) => {
                let nm = self.code.checked_mut(nm)?;
                nm.invocation_count = nm.invocation_count.saturating_add(1);
                nm.overflow_count += 1;
                if nm.overflow_count >= limit {
                    nm.overflow_count = 0;
                    true
                } else {
                    false
                }
            }
            None => {
                if !self.caches.has_feedback(method) {
                    self.link_method(method)?;
                }
                let count = self.counters.entry(method).or_insert(0);
                *count += 1;
                if *count >= limit {
                    *count = 0;
                    true
                } else {
                    false
                }
            }
        };
        if !overflowed {
            return Ok(None);
        }
        debug!(key = %key.display(&self.classes), limit, "invocation counter overflow");
        self.recompile(pid, index, RecompileTrigger::CounterOverflow).map(Some)
    }

    /// Run the recompilation policy from the activation at `index`
    pub fn recompile(&mut self, pid: ProcessId, index: usize, trigger: RecompileTrigger) -> Result<RecompileOutcome> {
        let decision = {
            let ctx = CompilationContext::new(&self.classes, &self.code, &self.config, &self.traps);
            RecompilationPolicy::new(&ctx, &self.processes).find_candidate(pid, index, trigger)?
        };
        match decision {
            RecompileDecision::Recompile(candidate) => {
                let nm = self.compile_at(candidate.key, candidate.level)?;
                if candidate.current.is_some() || self.code.version_count(&candidate.key) > 1 {
                    self.stats.recompilations += 1;
                }
                Ok(RecompileOutcome::Compiled {
                    nm,
                    key: candidate.key,
                })
            }
            RecompileDecision::Deferred { home } => {
                *self.counters.entry(home).or_insert(0) += 1;
                self.stats.deferred += 1;
                Ok(RecompileOutcome::Deferred { home })
            }
            RecompileDecision::Declined(reason) => {
                debug!(%reason, "recompilation declined");
                self.stats.declined += 1;
                Ok(RecompileOutcome::Declined(reason))
            }
        }
    }

    // ==================== Uncommon Traps ====================

    /// Handle the firing of trap `trap` in the compiled activation `index`
    pub fn uncommon_trap(&mut self, pid: ProcessId, index: usize, trap: usize) -> Result<TrapReport> {
        let outcome = trap::fire(
            &mut self.processes,
            &mut self.code,
            &mut self.traps,
            &self.config.trap,
            self.config.recompile.max_backoff,
            pid,
            index,
            trap,
        )?;
        self.stats.traps += 1;
        let recompile = match outcome.recompile {
            Some(_) => Some(self.recompile(pid, index, RecompileTrigger::UncommonTrap)?),
            None => None,
        };
        Ok(TrapReport { outcome, recompile })
    }

    // ==================== Redefinition ====================

    /// Install a method in `class`, invalidating code and caches that
    /// depended on the definition it overrides
    pub fn replace_method(&mut self, class: ClassId, builder: MethodBuilder) -> Result<MethodId> {
        let old = self.classes.lookup(class, builder.selector());
        let new = self.classes.add_method(class, builder)?;
        self.lookup.flush();

        let mut invalidated = Vec::new();
        if let Some(old) = old {
            invalidated = self.code.invalidate_dependents(old);
            if self.classes.method(old).is_some_and(|m| m.superseded) {
                self.traps.forget_method(old);
                self.caches.remove_method(old, &mut self.pics);
            }
        }
        let removed = self.cleanup_caches();
        info!(
            method = new.0,
            invalidated = invalidated.len(),
            removed,
            "method replaced"
        );
        Ok(new)
    }

    /// Drop cache entries whose targets are no longer current
    pub fn cleanup_caches(&mut self) -> usize {
        let mut removed = {
            let resolver = RuntimeResolver {
                classes: &self.classes,
                code: &self.code,
                lookup: &mut self.lookup,
            };
            self.caches.cleanup_all(&resolver, &mut self.pics)
        };

        let ids: Vec<NativeMethodId> = self.code.iter().filter(|nm| nm.is_valid()).map(|nm| nm.id).collect();
        for id in ids {
            let Some(nm) = self.code.get_mut(id) else {
                continue;
            };
            let mut sites = std::mem::take(&mut nm.call_sites);
            {
                let resolver = RuntimeResolver {
                    classes: &self.classes,
                    code: &self.code,
                    lookup: &mut self.lookup,
                };
                for site in &mut sites {
                    removed += site.cache.cleanup(&resolver, &mut self.pics);
                }
            }
            if let Some(nm) = self.code.get_mut(id) {
                nm.call_sites = sites;
            }
        }
        removed
    }

    // ==================== Inlining Database ====================

    /// Record the inlining decisions of `nm` in the database
    pub fn capture_database(&mut self, nm: NativeMethodId) -> Result<usize> {
        let nm = self.code.checked(nm)?;
        Ok(self.database.capture(&self.classes, nm))
    }

    /// Replace the inlining database
    pub fn set_database(&mut self, database: InliningDatabase) {
        self.database = database;
    }

    // ==================== Roots ====================

    /// Enumerate every object reference held by the runtime's tables
    pub fn trace_roots(&self, visit: &mut dyn FnMut(Root)) {
        self.classes.trace_roots(visit);
        self.code.trace_roots(visit);
        self.lookup.trace_roots(visit);
        self.caches.trace_roots(visit);
        self.processes.trace_roots(visit);
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oop::Operand;
    use crate::process::Activation;

    /// Point>>area, Circle>>area, Point>>foo: sending area to its argument
    struct World {
        rt: Runtime,
        point: ClassId,
        circle: ClassId,
        foo_key: LookupKey,
        foo: MethodId,
    }

    fn world(config: VmConfig) -> World {
        let mut classes = ClassTable::new();
        let point = classes.define_class("Point", None);
        let circle = classes.define_class("Circle", None);
        let area = classes.intern("area");
        let foo = classes.intern("foo:");
        classes.add_method(point, MethodBuilder::new(area).work(3)).unwrap();
        classes.add_method(circle, MethodBuilder::new(area).work(3)).unwrap();
        let foo_m = classes
            .add_method(point, MethodBuilder::new(foo).args(1).send(area, Operand::Arg(0), vec![]))
            .unwrap();
        World {
            rt: Runtime::with_classes(config, classes).unwrap(),
            point,
            circle,
            foo_key: LookupKey::new(point, foo),
            foo: foo_m,
        }
    }

    #[test]
    fn test_interpreted_sends_fill_cache() {
        let mut w = world(VmConfig::default());
        let t = w.rt.send_interpreted(w.foo, 0, w.point).unwrap();
        assert!(matches!(t, IcTransition::Filled(_)));
        let t = w.rt.send_interpreted(w.foo, 0, w.point).unwrap();
        assert!(matches!(t, IcTransition::Hit(_)));
        let t = w.rt.send_interpreted(w.foo, 0, w.circle).unwrap();
        assert!(matches!(t, IcTransition::Grown(_)));
        assert_eq!(w.rt.stats().sends, 3);
    }

    #[test]
    fn test_not_understood_is_fatal_in_scheduler() {
        let mut w = world(VmConfig::default());
        let nil = w.rt.classes().well_known().nil;
        assert_eq!(w.rt.send_interpreted(w.foo, 0, nil).unwrap(), IcTransition::NotUnderstood);
        w.rt.processes_mut().enter_scheduler();
        assert!(w.rt.send_interpreted(w.foo, 0, nil).unwrap_err().is_fatal());
    }

    #[test]
    fn test_compile_from_interpreter_feedback() {
        let mut w = world(VmConfig::default());
        w.rt.send_interpreted(w.foo, 0, w.point).unwrap();
        let nm = w.rt.compile(w.foo_key).unwrap();
        let nm = w.rt.code().get(nm).unwrap();
        assert_eq!(nm.level, 1);
        assert_eq!(nm.scopes.len(), 2);
        // residual send of the type case
        assert_eq!(nm.call_sites.len(), 1);
    }

    #[test]
    fn test_compiled_send_uses_embedded_cache() {
        let mut config = VmConfig::default();
        config.inlining.use_uncommon_traps = false;
        let mut w = world(config);
        let nm = w.rt.compile(w.foo_key).unwrap();
        let t = w.rt.send_compiled(nm, 0, w.circle).unwrap();
        assert!(matches!(t, IcTransition::Filled(_)));
        assert!(!w.rt.code().get(nm).unwrap().call_sites[0].cache.is_empty());
        assert!(w.rt.send_compiled(nm, 5, w.circle).is_err());
    }

    #[test]
    fn test_counter_overflow_compiles() {
        let mut config = VmConfig::default();
        config.recompile.invocation_limit = 3;
        config.recompile.min_invocations_before_recompile = 0;
        let mut w = world(config);
        let pid = w.rt.processes_mut().spawn();
        let index = w
            .rt
            .processes_mut()
            .push_frame(pid, Activation::interpreted(w.foo_key, w.foo))
            .unwrap();
        assert_eq!(w.rt.invoke(pid, index).unwrap(), None);
        assert_eq!(w.rt.invoke(pid, index).unwrap(), None);
        match w.rt.invoke(pid, index).unwrap() {
            Some(RecompileOutcome::Compiled { key, .. }) => assert_eq!(key, w.foo_key),
            other => panic!("expected compilation, got {:?}", other),
        }
        assert!(w.rt.code().current(&w.foo_key).is_some());
        assert_eq!(w.rt.invocation_count(w.foo), 0);
    }

    #[test]
    fn test_replace_method_invalidates_dependents() {
        let mut w = world(VmConfig::default());
        w.rt.send_interpreted(w.foo, 0, w.point).unwrap();
        let nm = w.rt.compile(w.foo_key).unwrap();
        let area = w.rt.classes().selector("area").unwrap();
        w.rt
            .replace_method(w.point, MethodBuilder::new(area).work(7))
            .unwrap();
        assert!(!w.rt.code().get(nm).unwrap().is_valid());
        assert_eq!(w.rt.code().current(&w.foo_key), None);
        // The interpreter cache no longer holds the old Point>>area
        assert!(w.rt.caches().site(w.foo, 0).unwrap().is_empty());
    }

    #[test]
    fn test_trace_roots_reports_code_and_frames() {
        let mut w = world(VmConfig::default());
        let nm = w.rt.compile(w.foo_key).unwrap();
        let pid = w.rt.processes_mut().spawn();
        w.rt
            .processes_mut()
            .push_frame(pid, Activation::compiled(w.foo_key, w.foo, nm, 0))
            .unwrap();
        let mut roots = Vec::new();
        w.rt.trace_roots(&mut |r| roots.push(r));
        assert!(roots.contains(&Root::NativeMethod(nm)));
        assert!(roots.contains(&Root::Method(w.foo)));
    }
}
