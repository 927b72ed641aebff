//! Recompilation candidate search
//!
//! When an invocation counter overflows or an uncommon trap asks for new
//! code, the activation that triggered it is rarely the best thing to
//! recompile: a small method is better optimized as part of its caller.
//! The policy walks up the stack from the triggering activation for as long
//! as the current method would be inlined into its caller, within limits on
//! how many (interpreted) frames may be crossed, and then decides whether
//! the candidate may be recompiled at all.

use crate::code::NativeMethodId;
use crate::error::{Error, HandleKind, Result};
use crate::jit::{CompilationContext, InlineCandidate, RecompilerInliningPolicy};
use crate::lookup::LookupKey;
use crate::oop::MethodId;
use crate::process::{Activation, FrameKind, ProcessId, ProcessTable};
use std::fmt;
use tracing::debug;

/// What asked for a recompilation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecompileTrigger {
    CounterOverflow,
    UncommonTrap,
}

/// Activation chosen for recompilation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecompileCandidate {
    pub frame: usize,
    pub key: LookupKey,
    pub method: MethodId,
    /// Current native method of the key, if any
    pub current: Option<NativeMethodId>,
    /// Optimization level of the new code
    pub level: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclineReason {
    TooManyVersions { versions: u16 },
    MaxLevel { level: u8 },
    TooYoung { invocations: u32 },
}

impl fmt::Display for DeclineReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeclineReason::TooManyVersions { versions } => write!(f, "already compiled {} times", versions),
            DeclineReason::MaxLevel { level } => write!(f, "already at optimization level {}", level),
            DeclineReason::TooYoung { invocations } => write!(f, "only {} invocations", invocations),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecompileDecision {
    Recompile(RecompileCandidate),
    /// The trigger was a block whose home activation is not on the stack;
    /// only the home method's counter is bumped
    Deferred { home: MethodId },
    Declined(DeclineReason),
}

pub struct RecompilationPolicy<'c, 'a> {
    ctx: &'c CompilationContext<'a>,
    processes: &'c ProcessTable,
    inlining: RecompilerInliningPolicy<'c, 'a>,
}

impl<'c, 'a> RecompilationPolicy<'c, 'a> {
    pub fn new(ctx: &'c CompilationContext<'a>, processes: &'c ProcessTable) -> Self {
        Self {
            ctx,
            processes,
            inlining: RecompilerInliningPolicy::new(ctx),
        }
    }

    /// Pick the activation to recompile, starting at frame `start` of `pid`
    pub fn find_candidate(&self, pid: ProcessId, start: usize, trigger: RecompileTrigger) -> Result<RecompileDecision> {
        let frames = &self.processes.process(pid)?.frames;
        if start >= frames.len() {
            return Err(Error::invalid_handle(HandleKind::Frame, start));
        }
        let limits = &self.ctx.config.recompile;

        let mut current = start;
        let mut crossed = 0;
        let mut interpreted_crossed = 0;
        loop {
            let frame = &frames[current];
            if frame.is_block {
                match self.processes.find_home_frame(pid, current)? {
                    Some(home) => {
                        current = home;
                        continue;
                    }
                    None => {
                        let home = self
                            .ctx
                            .classes
                            .method(frame.method)
                            .and_then(|m| m.home())
                            .unwrap_or(frame.method);
                        debug!(process = pid.0, frame = current, "non-LIFO block, recompilation deferred");
                        return Ok(RecompileDecision::Deferred { home });
                    }
                }
            }
            if current == 0 || !self.would_inline(frame) || crossed + 1 > limits.max_frames_crossed {
                break;
            }

            let caller = &frames[current - 1];
            match caller.kind {
                FrameKind::Compiled { nm, .. } => {
                    let Some(caller_nm) = self.ctx.code.get(nm) else {
                        break;
                    };
                    if caller_nm.level >= limits.max_optimization_level
                        || self.ctx.code.is_newer_than(&caller.key, nm)
                    {
                        break;
                    }
                }
                FrameKind::Interpreted => {
                    // Code compiled since this activation started is newer than it
                    if interpreted_crossed + 1 > limits.max_interpreted_frames_crossed
                        || self.ctx.code.current(&caller.key).is_some()
                    {
                        break;
                    }
                    interpreted_crossed += 1;
                }
            }
            crossed += 1;
            current -= 1;
        }

        while current > 0 && frames[current].super_send {
            current -= 1;
        }

        let frame = &frames[current];
        debug!(
            process = pid.0,
            start,
            candidate = current,
            crossed,
            "recompilation candidate"
        );
        Ok(match self.should_recompile(&frame.key, trigger) {
            Ok(level) => RecompileDecision::Recompile(RecompileCandidate {
                frame: current,
                key: frame.key,
                method: frame.method,
                current: self.ctx.code.current(&frame.key),
                level,
            }),
            Err(reason) => RecompileDecision::Declined(reason),
        })
    }

    /// Whether `frame`'s method would be inlined into its caller
    fn would_inline(&self, frame: &Activation) -> bool {
        let classes = self.ctx.classes;
        let Some(method) = classes.method(frame.method) else {
            return false;
        };
        let candidate = InlineCandidate {
            method,
            receiver: frame.key.class,
            block_args: 0,
            home_cost: method.home().and_then(|h| classes.method(h)).map(|h| h.cost()),
        };
        self.inlining.should_inline(&candidate, &frame.key).is_allowed()
    }

    /// Gate on version count, optimization level and age; returns the level
    /// to compile at
    pub fn should_recompile(&self, key: &LookupKey, trigger: RecompileTrigger) -> std::result::Result<u8, DeclineReason> {
        let code = self.ctx.code;
        let limits = &self.ctx.config.recompile;
        let versions = code.version_count(key);
        if versions >= limits.max_versions {
            return Err(DeclineReason::TooManyVersions { versions });
        }
        match code.current(key).and_then(|id| code.get(id)) {
            Some(nm) => {
                if trigger == RecompileTrigger::CounterOverflow && nm.level >= limits.max_optimization_level {
                    return Err(DeclineReason::MaxLevel { level: nm.level });
                }
                if nm.invocation_count < limits.min_invocations_before_recompile {
                    return Err(DeclineReason::TooYoung {
                        invocations: nm.invocation_count,
                    });
                }
                Ok((nm.level + 1).min(limits.max_optimization_level))
            }
            // Never compiled, or the last version was invalidated
            None => Ok(code
                .iter()
                .filter(|nm| nm.key == *key)
                .map(|nm| nm.level)
                .max()
                .unwrap_or(1)
                .clamp(1, limits.max_optimization_level.max(1))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{CodeTable, NativeMethod};
    use crate::config::VmConfig;
    use crate::oop::{ClassId, ClassTable, MethodBuilder, Operand, Selector};
    use crate::trap::TrapHistory;

    struct World {
        classes: ClassTable,
        code: CodeTable,
        config: VmConfig,
        traps: TrapHistory,
        processes: ProcessTable,
        pid: ProcessId,
        point: ClassId,
    }

    fn world() -> World {
        let mut classes = ClassTable::new();
        let point = classes.define_class("Point", None);
        let mut processes = ProcessTable::new();
        let pid = processes.spawn();
        World {
            classes,
            code: CodeTable::new(),
            config: VmConfig::default(),
            traps: TrapHistory::new(),
            processes,
            pid,
            point,
        }
    }

    fn method(w: &mut World, name: &str, work: u32) -> (LookupKey, MethodId) {
        let sel: Selector = w.classes.intern(name);
        let id = w.classes.add_method(w.point, MethodBuilder::new(sel).work(work)).unwrap();
        (LookupKey::new(w.point, sel), id)
    }

    fn push(w: &mut World, frame: Activation) -> usize {
        w.processes.push_frame(w.pid, frame).unwrap()
    }

    fn decide(w: &World, start: usize, trigger: RecompileTrigger) -> RecompileDecision {
        let ctx = CompilationContext::new(&w.classes, &w.code, &w.config, &w.traps);
        RecompilationPolicy::new(&ctx, &w.processes)
            .find_candidate(w.pid, start, trigger)
            .unwrap()
    }

    fn candidate_frame(decision: RecompileDecision) -> usize {
        match decision {
            RecompileDecision::Recompile(c) => c.frame,
            other => panic!("expected a candidate, got {:?}", other),
        }
    }

    #[test]
    fn test_small_callee_recompiles_caller() {
        let mut w = world();
        let (outer, outer_m) = method(&mut w, "outer", 100);
        let (inner, inner_m) = method(&mut w, "inner", 5);
        push(&mut w, Activation::interpreted(outer, outer_m));
        let top = push(&mut w, Activation::interpreted(inner, inner_m));
        let decision = decide(&w, top, RecompileTrigger::CounterOverflow);
        assert_eq!(candidate_frame(decision), 0);
        match decision {
            RecompileDecision::Recompile(c) => {
                assert_eq!(c.key, outer);
                assert_eq!(c.level, 1);
                assert_eq!(c.current, None);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_large_callee_is_its_own_candidate() {
        let mut w = world();
        let (outer, outer_m) = method(&mut w, "outer", 10);
        let (inner, inner_m) = method(&mut w, "inner", 100);
        push(&mut w, Activation::interpreted(outer, outer_m));
        let top = push(&mut w, Activation::interpreted(inner, inner_m));
        assert_eq!(candidate_frame(decide(&w, top, RecompileTrigger::CounterOverflow)), top);
    }

    #[test]
    fn test_interpreted_crossing_limit() {
        let mut w = world();
        w.config.recompile.max_interpreted_frames_crossed = 1;
        for i in 0..4 {
            let (key, m) = method(&mut w, &format!("m{}", i), 5);
            push(&mut w, Activation::interpreted(key, m));
        }
        assert_eq!(candidate_frame(decide(&w, 3, RecompileTrigger::CounterOverflow)), 2);
    }

    #[test]
    fn test_walk_stops_below_optimized_caller() {
        let mut w = world();
        let (outer, outer_m) = method(&mut w, "outer", 10);
        let (inner, inner_m) = method(&mut w, "inner", 5);
        let mut nm = NativeMethod::new(outer, outer_m, 2);
        nm.invocation_count = 1_000;
        let nm = w.code.install(nm);
        push(&mut w, Activation::compiled(outer, outer_m, nm, 0));
        let top = push(&mut w, Activation::interpreted(inner, inner_m));
        assert_eq!(candidate_frame(decide(&w, top, RecompileTrigger::CounterOverflow)), top);
    }

    #[test]
    fn test_walk_stops_below_interpreted_caller_with_newer_code() {
        let mut w = world();
        let (outer, outer_m) = method(&mut w, "outer", 100);
        let (inner, inner_m) = method(&mut w, "inner", 5);
        w.code.install(NativeMethod::new(outer, outer_m, 1));
        push(&mut w, Activation::interpreted(outer, outer_m));
        let top = push(&mut w, Activation::interpreted(inner, inner_m));
        match decide(&w, top, RecompileTrigger::CounterOverflow) {
            RecompileDecision::Recompile(c) => {
                assert_eq!(c.frame, top);
                assert_eq!(c.key, inner);
            }
            other => panic!("expected the callee, got {:?}", other),
        }
    }

    #[test]
    fn test_block_walks_to_home() {
        let mut w = world();
        let (outer, outer_m) = method(&mut w, "outer", 100);
        let value = w.classes.intern("value");
        let block = w.classes.add_block(outer_m, MethodBuilder::new(value).work(90)).unwrap();
        let ctx = w.processes.new_context(outer_m, false);
        push(&mut w, Activation::interpreted(outer, outer_m).with_context(ctx));
        let block_key = LookupKey::for_method(w.classes.well_known().block_closure, block);
        let top = push(&mut w, Activation::interpreted(block_key, block).block_in(Some(ctx)));
        assert_eq!(candidate_frame(decide(&w, top, RecompileTrigger::CounterOverflow)), 0);
    }

    #[test]
    fn test_non_lifo_block_defers() {
        let mut w = world();
        let (other, other_m) = method(&mut w, "other", 100);
        let (_, home_m) = method(&mut w, "home", 100);
        let value = w.classes.intern("value");
        let block = w.classes.add_block(home_m, MethodBuilder::new(value).work(3)).unwrap();
        // The home context was created by an activation that already returned
        let ctx = w.processes.new_context(home_m, false);
        push(&mut w, Activation::interpreted(other, other_m));
        let block_key = LookupKey::for_method(w.classes.well_known().block_closure, block);
        let top = push(&mut w, Activation::interpreted(block_key, block).block_in(Some(ctx)));
        assert_eq!(
            decide(&w, top, RecompileTrigger::CounterOverflow),
            RecompileDecision::Deferred { home: home_m }
        );
    }

    #[test]
    fn test_super_send_candidate_moves_to_caller() {
        let mut w = world();
        let (outer, outer_m) = method(&mut w, "outer", 10);
        let sel = w.classes.intern("init");
        let sub = w.classes.define_class("Sub", Some(w.point));
        let init_m = w
            .classes
            .add_method(w.point, MethodBuilder::new(sel).work(100).send(sel, Operand::Unknown, vec![]))
            .unwrap();
        push(&mut w, Activation::interpreted(outer, outer_m));
        let top = push(&mut w, Activation::interpreted(LookupKey::new(sub, sel), init_m).via_super());
        assert_eq!(candidate_frame(decide(&w, top, RecompileTrigger::CounterOverflow)), 0);
    }

    #[test]
    fn test_gate_declines_max_level_and_versions() {
        let mut w = world();
        let (key, m) = method(&mut w, "hot", 100);
        let mut nm = NativeMethod::new(key, m, 2);
        nm.invocation_count = 50_000;
        let id = w.code.install(nm);
        let top = push(&mut w, Activation::compiled(key, m, id, 0));
        assert_eq!(
            decide(&w, top, RecompileTrigger::CounterOverflow),
            RecompileDecision::Declined(DeclineReason::MaxLevel { level: 2 })
        );

        // An uncommon trap invalidated it: recompile at the same level
        w.code.invalidate(id);
        match decide(&w, top, RecompileTrigger::UncommonTrap) {
            RecompileDecision::Recompile(c) => assert_eq!(c.level, 2),
            other => panic!("expected a candidate, got {:?}", other),
        }

        w.config.recompile.max_versions = 1;
        assert_eq!(
            decide(&w, top, RecompileTrigger::UncommonTrap),
            RecompileDecision::Declined(DeclineReason::TooManyVersions { versions: 1 })
        );
    }

    #[test]
    fn test_gate_declines_young_code() {
        let mut w = world();
        let (key, m) = method(&mut w, "warm", 100);
        let mut nm = NativeMethod::new(key, m, 1);
        nm.invocation_count = 3;
        let id = w.code.install(nm);
        let top = push(&mut w, Activation::compiled(key, m, id, 0));
        assert_eq!(
            decide(&w, top, RecompileTrigger::CounterOverflow),
            RecompileDecision::Declined(DeclineReason::TooYoung { invocations: 3 })
        );
    }
}
