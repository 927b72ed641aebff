//! The inliner
//!
//! Visits every send of the method being compiled (and, recursively, of
//! every inlined callee) and resolves it using the receiver estimate built
//! from static knowledge, the scope tree and selector predictions:
//!
//! - exactly one known class: inline the callee in place
//! - several classes: a type case with one inlined arm per class and a
//!   residual branch for everything else
//! - nothing inlinable: a real send, counting unless the unknown branch is
//!   unlikely
//! - an unknown branch recorded as never taken: an uncommon trap

use super::graph::{
    CompileScope, CompileScopeId, CompiledGraph, InliningStats, RealSend, Residual, SendNode, SendResolution,
    TrapNode, TypeCaseArm, Value,
};
use super::policy::{InlineCandidate, InlineDecision, InliningPolicy, RejectReason};
use super::prediction;
use super::send_info::{ReceiverEstimate, SendInfo, UnknownBranch};
use super::CompilationContext;
use crate::error::Result;
use crate::lookup::LookupKey;
use crate::oop::{Bci, ClassId, InlineHint, MethodId, Operand, SendSite};
use crate::rscope::ScopeTree;
use tracing::{debug, trace, warn};

pub struct Inliner<'c, 'a> {
    ctx: &'c CompilationContext<'a>,
    tree: &'c ScopeTree,
    policy: InliningPolicy<'c, 'a>,
    graph: CompiledGraph,
    stats: InliningStats,
}

impl<'c, 'a> Inliner<'c, 'a> {
    pub fn new(ctx: &'c CompilationContext<'a>, tree: &'c ScopeTree, key: LookupKey, method: MethodId, level: u8) -> Self {
        Self {
            ctx,
            tree,
            policy: InliningPolicy::new(ctx),
            graph: CompiledGraph::new(key, method, level),
            stats: InliningStats::default(),
        }
    }

    /// Inline everything reachable from the root method
    pub fn run(mut self) -> Result<(CompiledGraph, InliningStats)> {
        let method = self.ctx.classes.method_checked(self.graph.method)?;
        let root = CompileScope {
            id: CompileScopeId(0),
            key: self.graph.key,
            method: method.id,
            sender: None,
            depth: 0,
            receiver: self.graph.key.class,
            args: vec![Value::Unknown; method.arg_count as usize],
            rscope: (!self.tree.is_null()).then(|| self.tree.root()),
            lite: false,
        };
        let root = self.graph.add_scope(root);
        self.inline_scope(root);
        Ok((self.graph, self.stats))
    }

    fn inline_scope(&mut self, id: CompileScopeId) {
        let classes = self.ctx.classes;
        let Some(method) = self.graph.scope(id).and_then(|s| classes.method(s.method)) else {
            warn!(scope = id.0, "compile scope without method");
            return;
        };
        for site in method.sends() {
            let resolution = self.resolve_send(id, site);
            self.graph.sends.push(SendNode {
                scope: id,
                bci: site.bci,
                selector: site.selector,
                resolution,
            });
        }
    }

    // ==================== Send Resolution ====================

    fn resolve_send(&mut self, id: CompileScopeId, site: &SendSite) -> SendResolution {
        let Some(scope) = self.graph.scope(id).cloned() else {
            return SendResolution::RealSend(RealSend {
                flags: SendInfo::new(id, site.bci, site.selector).ic_flags(),
                lookup_class: None,
            });
        };
        let mut info = SendInfo::new(id, site.bci, site.selector);
        if site.is_super {
            return self.resolve_super(&scope, site, info);
        }

        let receiver = self.value_of(&scope, site.receiver);
        match receiver {
            Value::Class(class) => {
                info.receiver_static = true;
                info.estimate = ReceiverEstimate::exact(class);
            }
            Value::Block { .. } => {
                info.receiver_static = true;
                info.estimate = ReceiverEstimate::exact(self.ctx.classes.well_known().block_closure);
            }
            Value::Unknown => self.estimate_from_feedback(&scope, &mut info),
        }

        if info.uninlinable {
            return self.real_send(&info, None);
        }

        if info.estimate.is_exact() {
            let class = info.estimate.classes[0];
            return match self.try_inline(&scope, site, class, receiver) {
                Ok(callee) => {
                    self.stats.inlined += 1;
                    SendResolution::Inlined { class, callee }
                }
                Err(_) => {
                    info.counting = self.counting(UnknownBranch::Likely);
                    self.real_send(&info, None)
                }
            };
        }

        let unknown = info.estimate.unknown.unwrap_or(UnknownBranch::Likely);
        if info.estimate.is_unknown() {
            if unknown == UnknownBranch::Untaken && self.can_trap(&scope, site.bci) {
                return self.uncommon_trap(site);
            }
            info.counting = self.counting(unknown);
            return self.real_send(&info, None);
        }

        let mut arms = Vec::new();
        let mut deferred = false;
        for class in info.estimate.classes.clone() {
            match self.try_inline(&scope, site, class, receiver) {
                Ok(callee) => arms.push(TypeCaseArm { class, callee }),
                Err(_) => deferred = true,
            }
        }
        if arms.is_empty() {
            info.counting = self.counting(unknown);
            return self.real_send(&info, None);
        }

        self.stats.inlined += arms.len();
        self.stats.type_cases += 1;
        let residual = if !deferred && unknown == UnknownBranch::Untaken && self.can_trap(&scope, site.bci) {
            self.stats.uncommon_traps += 1;
            Residual::Trap(Self::trap_node(site))
        } else {
            info.counting = self.counting(if deferred { UnknownBranch::Likely } else { unknown });
            self.stats.real_sends += 1;
            Residual::Send(RealSend {
                flags: info.ic_flags(),
                lookup_class: None,
            })
        };
        trace!(bci = site.bci, arms = arms.len(), "type case");
        SendResolution::TypeCase { arms, residual }
    }

    fn resolve_super(&mut self, scope: &CompileScope, site: &SendSite, mut info: SendInfo) -> SendResolution {
        let classes = self.ctx.classes;
        info.super_send = true;
        info.receiver_static = true;
        let holder = classes.method(scope.method).map(|m| m.holder);
        let lookup_class = holder.and_then(|h| classes.class(h)).and_then(|c| c.superclass);
        let target = holder.and_then(|h| classes.super_lookup(h, site.selector));

        if let Some(target) = target {
            let key = LookupKey::for_method(scope.receiver, target);
            if let Ok(callee) = self.inline_target(scope, site, key, target, scope.receiver, scope.receiver) {
                self.stats.inlined += 1;
                return SendResolution::Inlined {
                    class: scope.receiver,
                    callee,
                };
            }
        } else {
            self.stats.reject(RejectReason::LookupFailed);
        }
        self.real_send(&info, lookup_class)
    }

    /// What type feedback (or, failing that, static prediction) says
    fn estimate_from_feedback(&self, scope: &CompileScope, info: &mut SendInfo) {
        let tree = self.tree;
        if let (true, Some(rs)) = (self.ctx.config.feedback.type_feedback, scope.rscope) {
            if tree.is_uninlinable(rs, info.bci) {
                info.uninlinable = true;
                return;
            }
            let classes = tree.receiver_classes(rs, info.bci);
            let untaken = tree.is_untaken(rs, info.bci);
            if !classes.is_empty() {
                let unknown = if untaken {
                    UnknownBranch::Untaken
                } else if tree.is_complete(rs, info.bci) {
                    UnknownBranch::Unlikely
                } else {
                    UnknownBranch::Likely
                };
                info.estimate = ReceiverEstimate::merge(classes, unknown);
                return;
            }
            if untaken {
                info.estimate = ReceiverEstimate::unknown(UnknownBranch::Untaken);
                return;
            }
        }
        if let Some(predicted) = prediction::predict(self.ctx.classes, info.selector) {
            info.estimate = predicted;
        }
    }

    fn value_of(&self, scope: &CompileScope, operand: Operand) -> Value {
        match operand {
            Operand::SelfRef => Value::Class(scope.receiver),
            Operand::Arg(i) => scope.args.get(i as usize).copied().unwrap_or(Value::Unknown),
            Operand::Literal(class) => Value::Class(class),
            Operand::Block(method) => Value::Block {
                method,
                receiver: scope.receiver,
            },
            Operand::Unknown => Value::Unknown,
        }
    }

    fn counting(&self, unknown: UnknownBranch) -> bool {
        self.ctx.config.inlining.counting_sends && unknown != UnknownBranch::Unlikely
    }

    /// Whether the send may be compiled as an uncommon trap
    fn can_trap(&self, scope: &CompileScope, bci: Bci) -> bool {
        !scope.lite
            && self.ctx.config.inlining.use_uncommon_traps
            && !self.ctx.traps.is_disabled(scope.method, bci)
            && !scope.rscope.is_some_and(|rs| self.tree.has_taken_uncommon(rs, bci))
    }

    fn real_send(&mut self, info: &SendInfo, lookup_class: Option<ClassId>) -> SendResolution {
        self.stats.real_sends += 1;
        SendResolution::RealSend(RealSend {
            flags: info.ic_flags(),
            lookup_class,
        })
    }

    fn uncommon_trap(&mut self, site: &SendSite) -> SendResolution {
        self.stats.uncommon_traps += 1;
        SendResolution::UncommonTrap(Self::trap_node(site))
    }

    fn trap_node(site: &SendSite) -> TrapNode {
        let mut spill = Vec::with_capacity(site.args.len() + 1);
        spill.push(site.receiver);
        spill.extend(site.args.iter().copied());
        TrapNode { spill }
    }

    // ==================== Inlining ====================

    /// Inline the method `receiver` of class `class` would run
    fn try_inline(
        &mut self,
        scope: &CompileScope,
        site: &SendSite,
        class: ClassId,
        receiver: Value,
    ) -> std::result::Result<CompileScopeId, RejectReason> {
        let classes = self.ctx.classes;
        let block = match receiver {
            Value::Block { method, receiver } if classes.is_block_invocation(site.selector) => Some((method, receiver)),
            _ => None,
        };
        let (key, target, callee_receiver) = match block {
            Some((method, outer)) => (LookupKey::for_method(class, method), method, outer),
            None => {
                let key = LookupKey::new(class, site.selector);
                match key.resolve(classes) {
                    Some(target) => (key, target, class),
                    None => {
                        self.stats.reject(RejectReason::LookupFailed);
                        return Err(RejectReason::LookupFailed);
                    }
                }
            }
        };
        self.inline_target(scope, site, key, target, class, callee_receiver)
    }

    fn inline_target(
        &mut self,
        scope: &CompileScope,
        site: &SendSite,
        key: LookupKey,
        target: MethodId,
        class: ClassId,
        callee_receiver: ClassId,
    ) -> std::result::Result<CompileScopeId, RejectReason> {
        let decision = self.decide(scope, site, target, class);
        let builtin = match decision {
            InlineDecision::Allowed { builtin } => builtin,
            InlineDecision::Rejected(reason) => {
                debug!(
                    callee = %key.display(self.ctx.classes),
                    bci = site.bci,
                    %reason,
                    "not inlined"
                );
                self.stats.reject(reason);
                return Err(reason);
            }
        };

        let classes = self.ctx.classes;
        let always = classes.method(target).is_some_and(|m| m.hint == InlineHint::Always);
        let callee = CompileScope {
            id: CompileScopeId(0),
            key,
            method: target,
            sender: Some((scope.id, site.bci)),
            depth: scope.depth + 1,
            receiver: callee_receiver,
            args: site.args.iter().map(|a| self.value_of(scope, *a)).collect(),
            rscope: scope
                .rscope
                .and_then(|rs| self.tree.lookup_subscope(rs, site.bci, key)),
            lite: scope.lite || builtin || always,
        };
        let id = self.graph.add_scope(callee);
        trace!(callee = %key.display(classes), depth = scope.depth + 1, "inlined");
        self.inline_scope(id);
        Ok(id)
    }

    fn decide(&self, scope: &CompileScope, site: &SendSite, target: MethodId, class: ClassId) -> InlineDecision {
        let config = &self.ctx.config.inlining;
        let classes = self.ctx.classes;
        let Some(method) = classes.method(target) else {
            return InlineDecision::Rejected(RejectReason::LookupFailed);
        };

        let depth = scope.depth + 1;
        if depth > config.max_inline_depth {
            return InlineDecision::Rejected(RejectReason::TooDeep { depth });
        }
        let recursion = self.recursion_depth(scope.id, target, class);
        if recursion > config.max_recursion_unroll {
            return InlineDecision::Rejected(RejectReason::Recursive { depth: recursion });
        }

        let block_args = site
            .args
            .iter()
            .filter(|a| matches!(self.value_of(scope, **a), Value::Block { .. }))
            .count();
        let home_cost = method.home().and_then(|h| classes.method(h)).map(|h| h.cost());
        self.policy.should_inline(&InlineCandidate {
            method,
            receiver: class,
            block_args,
            home_cost,
        })
    }

    /// Occurrences of `method` on `class` on the inlining stack ending at
    /// `from`
    fn recursion_depth(&self, from: CompileScopeId, method: MethodId, class: ClassId) -> usize {
        let mut count = 0;
        let mut current = Some(from);
        while let Some(scope) = current.and_then(|id| self.graph.scope(id)) {
            if scope.method == method && scope.key.class == class {
                count += 1;
            }
            current = scope.sender.map(|(sender, _)| sender);
        }
        count
    }
}
