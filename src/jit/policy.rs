//! Inlining policy
//!
//! A pure cost function deciding whether one candidate may be inlined at
//! one call site. Rules are applied in order:
//!
//! 1. language hints (`Never` rejects, `Always` accepts)
//! 2. blocks that are a negligible fraction of their home method are rejected
//! 3. the size limit depends on method/block and grows per block argument
//! 4. candidates over the limit are rejected unless they are builtin
//!    hot-path selectors on primitive receivers
//!
//! [`RecompilerInliningPolicy`] additionally compares against the compiled
//! size of an existing native method; it only predicts what the compiler
//! would do.

use super::CompilationContext;
use crate::lookup::LookupKey;
use crate::oop::{ClassId, InlineHint, Method};
use std::fmt;

/// An inlining candidate at a call site
#[derive(Debug, Clone, Copy)]
pub struct InlineCandidate<'m> {
    pub method: &'m Method,
    pub receiver: ClassId,
    /// Arguments statically known to be blocks
    pub block_args: usize,
    /// Cost of the home method when the candidate is a block
    pub home_cost: Option<u32>,
}

/// Why a candidate was not inlined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RejectReason {
    Disabled,
    NeverInline,
    BlockTooSmall { cost: u32, home_cost: u32 },
    TooExpensive { cost: u32, limit: u32 },
    CompiledTooLarge { size: u32, limit: u32 },
    Recursive { depth: usize },
    TooDeep { depth: usize },
    LookupFailed,
}

impl RejectReason {
    /// Short name used for statistics
    pub fn name(&self) -> &'static str {
        match self {
            RejectReason::Disabled => "disabled",
            RejectReason::NeverInline => "never inline",
            RejectReason::BlockTooSmall { .. } => "block too small",
            RejectReason::TooExpensive { .. } => "too expensive",
            RejectReason::CompiledTooLarge { .. } => "compiled too large",
            RejectReason::Recursive { .. } => "recursive",
            RejectReason::TooDeep { .. } => "too deep",
            RejectReason::LookupFailed => "lookup failed",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::BlockTooSmall { cost, home_cost } => {
                write!(f, "block cost {} is a negligible part of home cost {}", cost, home_cost)
            }
            RejectReason::TooExpensive { cost, limit } => write!(f, "cost {} exceeds limit {}", cost, limit),
            RejectReason::CompiledTooLarge { size, limit } => {
                write!(f, "compiled size {} exceeds limit {}", size, limit)
            }
            RejectReason::Recursive { depth } => write!(f, "recursive call unrolled {} times", depth),
            RejectReason::TooDeep { depth } => write!(f, "inline depth {} too deep", depth),
            other => f.write_str(other.name()),
        }
    }
}

/// Outcome of a policy query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InlineDecision {
    /// `builtin` is set when only the hot-path exemption allowed it
    Allowed { builtin: bool },
    Rejected(RejectReason),
}

impl InlineDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, InlineDecision::Allowed { .. })
    }
}

/// The compiler's inlining policy
pub struct InliningPolicy<'c, 'a> {
    ctx: &'c CompilationContext<'a>,
}

impl<'c, 'a> InliningPolicy<'c, 'a> {
    pub fn new(ctx: &'c CompilationContext<'a>) -> Self {
        Self { ctx }
    }

    /// Cost limit for `candidate`
    pub fn size_limit(&self, candidate: &InlineCandidate<'_>) -> u32 {
        let config = &self.ctx.config.inlining;
        let base = if candidate.method.is_block() {
            config.max_block_inline_cost
        } else {
            config.max_method_inline_cost
        };
        base + candidate.block_args as u32 * config.block_arg_additional_allowed_inline_cost
    }

    fn is_builtin(&self, candidate: &InlineCandidate<'_>) -> bool {
        let classes = self.ctx.classes;
        let name = classes.selector_name(candidate.method.selector);
        classes.is_primitive_class(candidate.receiver)
            && self.ctx.config.inlining.builtin_selectors.iter().any(|s| s == name)
    }

    pub fn should_inline(&self, candidate: &InlineCandidate<'_>) -> InlineDecision {
        let config = &self.ctx.config.inlining;
        if !config.enabled {
            return InlineDecision::Rejected(RejectReason::Disabled);
        }
        match candidate.method.hint {
            InlineHint::Never => return InlineDecision::Rejected(RejectReason::NeverInline),
            InlineHint::Always => return InlineDecision::Allowed { builtin: false },
            InlineHint::Default => {}
        }

        let cost = candidate.method.cost();
        if let (true, Some(home_cost)) = (candidate.method.is_block(), candidate.home_cost) {
            if (cost as u64) * 100 < config.min_block_cost_fraction as u64 * home_cost as u64 {
                return InlineDecision::Rejected(RejectReason::BlockTooSmall { cost, home_cost });
            }
        }

        let limit = self.size_limit(candidate);
        if cost <= limit {
            InlineDecision::Allowed { builtin: false }
        } else if self.is_builtin(candidate) {
            InlineDecision::Allowed { builtin: true }
        } else {
            InlineDecision::Rejected(RejectReason::TooExpensive { cost, limit })
        }
    }
}

/// Advisory policy used by the recompilation candidate search
pub struct RecompilerInliningPolicy<'c, 'a> {
    policy: InliningPolicy<'c, 'a>,
}

impl<'c, 'a> RecompilerInliningPolicy<'c, 'a> {
    pub fn new(ctx: &'c CompilationContext<'a>) -> Self {
        Self {
            policy: InliningPolicy::new(ctx),
        }
    }

    /// Would `candidate`, compiled as `key`, be inlined into its caller
    pub fn should_inline(&self, candidate: &InlineCandidate<'_>, key: &LookupKey) -> InlineDecision {
        let decision = self.policy.should_inline(candidate);
        if !decision.is_allowed() {
            return decision;
        }
        let ctx = self.policy.ctx;
        let limit = ctx.config.inlining.max_compiled_inline_size;
        match ctx.code.current(key).and_then(|id| ctx.code.get(id)) {
            Some(nm) if nm.size > limit => InlineDecision::Rejected(RejectReason::CompiledTooLarge { size: nm.size, limit }),
            _ => decision,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{CodeTable, NativeMethod};
    use crate::config::VmConfig;
    use crate::oop::{ClassTable, MethodBuilder, MethodId};
    use crate::trap::TrapHistory;

    struct World {
        classes: ClassTable,
        code: CodeTable,
        config: VmConfig,
        traps: TrapHistory,
        point: ClassId,
    }

    fn world() -> World {
        let mut classes = ClassTable::new();
        let point = classes.define_class("Point", None);
        World {
            classes,
            code: CodeTable::new(),
            config: VmConfig::default(),
            traps: TrapHistory::new(),
            point,
        }
    }

    fn method_of_cost(w: &mut World, name: &str, cost: u32, hint: InlineHint) -> MethodId {
        let sel = w.classes.intern(name);
        // body: work + return(1)
        w.classes
            .add_method(w.point, MethodBuilder::new(sel).hint(hint).work(cost - 1))
            .unwrap()
    }

    fn ctx(w: &World) -> CompilationContext<'_> {
        CompilationContext::new(&w.classes, &w.code, &w.config, &w.traps)
    }

    fn decide(w: &World, id: MethodId, block_args: usize) -> InlineDecision {
        let ctx = ctx(w);
        let method = w.classes.method(id).unwrap();
        InliningPolicy::new(&ctx).should_inline(&InlineCandidate {
            method,
            receiver: w.point,
            block_args,
            home_cost: None,
        })
    }

    #[test]
    fn test_hints_override_cost() {
        let mut w = world();
        let big = method_of_cost(&mut w, "big", 500, InlineHint::Always);
        let small = method_of_cost(&mut w, "small", 2, InlineHint::Never);
        assert_eq!(decide(&w, big, 0), InlineDecision::Allowed { builtin: false });
        assert_eq!(decide(&w, small, 0), InlineDecision::Rejected(RejectReason::NeverInline));
    }

    #[test]
    fn test_cost_limit_and_block_arg_bonus() {
        let mut w = world();
        let m = method_of_cost(&mut w, "m", 50, InlineHint::Default);
        assert_eq!(
            decide(&w, m, 0),
            InlineDecision::Rejected(RejectReason::TooExpensive { cost: 50, limit: 40 })
        );
        assert!(decide(&w, m, 1).is_allowed());
    }

    #[test]
    fn test_lowering_limit_never_allows_more() {
        let mut w = world();
        let ids: Vec<MethodId> = (1..80).map(|c| method_of_cost(&mut w, &format!("m{}", c), c, InlineHint::Default)).collect();
        let before: Vec<bool> = ids.iter().map(|id| decide(&w, *id, 0).is_allowed()).collect();
        w.config.inlining.max_method_inline_cost = 10;
        let after: Vec<bool> = ids.iter().map(|id| decide(&w, *id, 0).is_allowed()).collect();
        for (b, a) in before.iter().zip(&after) {
            assert!(*b || !*a);
        }
        assert!(before.iter().filter(|x| **x).count() > after.iter().filter(|x| **x).count());
    }

    #[test]
    fn test_builtin_exemption_on_primitive_receiver() {
        let mut w = world();
        let plus = w.classes.intern("+");
        let int = w.classes.well_known().small_integer;
        let id = w
            .classes
            .add_method(int, MethodBuilder::new(plus).work(100))
            .unwrap();
        let ctx = ctx(&w);
        let method = w.classes.method(id).unwrap();
        let policy = InliningPolicy::new(&ctx);
        let on_int = InlineCandidate { method, receiver: int, block_args: 0, home_cost: None };
        assert_eq!(policy.should_inline(&on_int), InlineDecision::Allowed { builtin: true });
        let on_point = InlineCandidate { receiver: w.point, ..on_int };
        assert!(!policy.should_inline(&on_point).is_allowed());
    }

    #[test]
    fn test_tiny_block_of_big_home_rejected() {
        let mut w = world();
        let home = method_of_cost(&mut w, "home", 1000, InlineHint::Default);
        let sel = w.classes.intern("value");
        let block = w.classes.add_block(home, MethodBuilder::new(sel).work(1)).unwrap();
        let ctx = ctx(&w);
        let candidate = InlineCandidate {
            method: w.classes.method(block).unwrap(),
            receiver: w.classes.well_known().block_closure,
            block_args: 0,
            home_cost: Some(1000),
        };
        assert!(matches!(
            InliningPolicy::new(&ctx).should_inline(&candidate),
            InlineDecision::Rejected(RejectReason::BlockTooSmall { .. })
        ));
    }

    #[test]
    fn test_recompiler_policy_checks_compiled_size() {
        let mut w = world();
        let m = method_of_cost(&mut w, "m", 10, InlineHint::Default);
        let sel = w.classes.intern("m");
        let key = LookupKey::new(w.point, sel);
        let mut nm = NativeMethod::new(key, m, 1);
        nm.size = 1000;
        w.code.install(nm);

        let ctx = ctx(&w);
        let candidate = InlineCandidate {
            method: w.classes.method(m).unwrap(),
            receiver: w.point,
            block_args: 0,
            home_cost: None,
        };
        assert!(InliningPolicy::new(&ctx).should_inline(&candidate).is_allowed());
        assert_eq!(
            RecompilerInliningPolicy::new(&ctx).should_inline(&candidate, &key),
            InlineDecision::Rejected(RejectReason::CompiledTooLarge { size: 1000, limit: 400 })
        );
    }
}
