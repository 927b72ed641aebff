//! Uncommon traps and deoptimization
//!
//! A trap site starts unused. The first firing patches it to used (the
//! patch is idempotent), every firing bumps the owning native method's trap
//! counter, and the trapping activation is rewritten into interpreter
//! frames. Optimized contexts captured by the deoptimized frames become
//! invalid, which forces every other frame referencing them, in any
//! process, to be deoptimized too.
//!
//! Once a native method traps often enough, the sites that fired are
//! recorded in [`TrapHistory`] so the next compile emits real sends there,
//! and the key's backoff exponent grows.

use crate::code::{CodeTable, NativeMethodId, ScopeOffset};
use crate::config::TrapConfig;
use crate::error::{Error, HandleKind, Result};
use crate::lookup::LookupKey;
use crate::oop::{Bci, MethodId};
use crate::process::{Activation, ContextId, FrameKind, ProcessId, ProcessTable};
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use std::collections::BTreeSet;
use tracing::{debug, error, info};

// ==================== Trap Sites ====================

/// Patch state of a trap's call destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapState {
    /// Calls the unused-trap stub
    Unused,
    /// Calls the used-trap stub
    Used,
}

/// Result of patching a trap site
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchResult {
    Patched,
    AlreadyUsed,
}

/// An uncommon-trap stub emitted for a speculatively eliminated branch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapSite {
    pub scope: ScopeOffset,
    pub bci: Bci,
    pub state: TrapState,
}

impl TrapSite {
    pub fn new(scope: ScopeOffset, bci: Bci) -> Self {
        Self {
            scope,
            bci,
            state: TrapState::Unused,
        }
    }

    /// Switch to the used-trap stub; a no-op when already used
    pub fn patch(&mut self) -> PatchResult {
        match self.state {
            TrapState::Used => PatchResult::AlreadyUsed,
            TrapState::Unused => {
                self.state = TrapState::Used;
                PatchResult::Patched
            }
        }
    }

    pub fn is_used(&self) -> bool {
        self.state == TrapState::Used
    }
}

// ==================== Trap History ====================

/// Speculations disabled by earlier trap-driven recompilations
#[derive(Debug, Clone, Default)]
pub struct TrapHistory {
    /// `(method, bci)` sends that must compile to real sends
    disabled: HashSet<(MethodId, Bci)>,
    /// Backoff exponent per compiled key
    backoff: HashMap<LookupKey, u32>,
}

impl TrapHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn disable(&mut self, method: MethodId, bci: Bci) -> bool {
        self.disabled.insert((method, bci))
    }

    pub fn is_disabled(&self, method: MethodId, bci: Bci) -> bool {
        self.disabled.contains(&(method, bci))
    }

    pub fn disabled_count(&self) -> usize {
        self.disabled.len()
    }

    pub fn backoff(&self, key: &LookupKey) -> u32 {
        self.backoff.get(key).copied().unwrap_or(0)
    }

    /// Increase the backoff exponent of `key`, saturating at `max`
    pub fn bump_backoff(&mut self, key: LookupKey, max: u32) -> u32 {
        let level = self.backoff.entry(key).or_insert(0);
        *level = (*level + 1).min(max);
        *level
    }

    /// Forget everything recorded against `method` (it was replaced)
    pub fn forget_method(&mut self, method: MethodId) {
        self.disabled.retain(|(m, _)| *m != method);
    }
}

// ==================== Deoptimization ====================

/// Frames rewritten by one deoptimization
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeoptimizationReport {
    /// Compiled frames converted, identified by process and pre-rewrite index
    pub converted: Vec<(ProcessId, usize)>,
    /// Interpreted frames whose context references were redirected
    pub rewired: Vec<(ProcessId, usize)>,
    /// Optimized contexts that were invalidated
    pub invalidated_contexts: Vec<ContextId>,
    /// Interpreter frames synthesized in place of the converted ones
    pub synthesized_frames: usize,
}

/// Deoptimize frame `index` of `pid` and every activation above it, then
/// cascade through invalidated contexts across all processes
pub fn deoptimize(
    processes: &mut ProcessTable,
    code: &CodeTable,
    pid: ProcessId,
    index: usize,
) -> Result<DeoptimizationReport> {
    let depth = processes.process(pid)?.frames.len();
    if index >= depth {
        return Err(Error::invalid_handle(HandleKind::Frame, index));
    }

    // Closure over frames to rewrite and contexts to invalidate
    let mut marked: BTreeSet<(ProcessId, usize)> = (index..depth).map(|i| (pid, i)).collect();
    let mut contexts: BTreeSet<ContextId> = BTreeSet::new();
    let mut worklist: Vec<(ProcessId, usize)> = marked.iter().copied().collect();
    while let Some((p, i)) = worklist.pop() {
        let frame = processes.frame(p, i)?;
        if !frame.is_compiled() {
            continue;
        }
        let Some(ctx) = frame.own_context else {
            continue;
        };
        let optimized = processes.context(ctx).is_some_and(|c| c.optimized && c.valid);
        if optimized && contexts.insert(ctx) {
            for referencing in processes.frames_referencing(ctx) {
                if marked.insert(referencing) {
                    worklist.push(referencing);
                }
            }
        }
    }

    let mut report = DeoptimizationReport::default();
    let mut replacements: HashMap<ContextId, ContextId> = HashMap::default();
    for ctx in &contexts {
        let creator = processes
            .context(*ctx)
            .map(|c| c.creator)
            .ok_or_else(|| Error::fatal(format!("context {} vanished during deoptimization", ctx.0)))?;
        processes.invalidate_context(*ctx);
        let fresh = processes.new_context(creator, false);
        replacements.insert(*ctx, fresh);
        report.invalidated_contexts.push(*ctx);
    }

    // Rewrite from the newest frame down so earlier indices stay valid
    for &(p, i) in marked.iter().rev() {
        let frame = processes.frame(p, i)?.clone();
        let rewired = redirect_contexts(frame, &replacements);
        match rewired.kind {
            FrameKind::Compiled { nm, scope } => {
                let vframes = interpreter_frames(code, &rewired, nm, scope)?;
                report.synthesized_frames += vframes.len();
                let process = processes.process_mut(p)?;
                process.frames.splice(i..=i, vframes);
                report.converted.push((p, i));
            }
            FrameKind::Interpreted => {
                *processes.frame_mut(p, i)? = rewired;
                report.rewired.push((p, i));
            }
        }
    }
    report.converted.sort();
    report.rewired.sort();

    debug!(
        converted = report.converted.len(),
        rewired = report.rewired.len(),
        contexts = report.invalidated_contexts.len(),
        "deoptimized"
    );
    Ok(report)
}

fn redirect_contexts(mut frame: Activation, replacements: &HashMap<ContextId, ContextId>) -> Activation {
    if let Some(ctx) = frame.own_context {
        if let Some(fresh) = replacements.get(&ctx) {
            frame.own_context = Some(*fresh);
        }
    }
    if let Some(ctx) = frame.home_context {
        if let Some(fresh) = replacements.get(&ctx) {
            frame.home_context = Some(*fresh);
        }
    }
    frame
}

/// One interpreter frame per inlined scope from the root down to `scope`
fn interpreter_frames(
    code: &CodeTable,
    frame: &Activation,
    nm: NativeMethodId,
    scope: ScopeOffset,
) -> Result<Vec<Activation>> {
    let native = code.checked(nm)?;
    let mut chain = Vec::new();
    let mut bci = frame.bci;
    let mut current = Some(scope);
    while let Some(offset) = current {
        let desc = native
            .scope(offset)
            .ok_or_else(|| Error::invalid_handle(HandleKind::Frame, offset as usize))?;
        chain.push((desc.key, desc.method, bci));
        current = desc.sender.map(|s| {
            bci = s.bci;
            s.offset
        });
    }
    chain.reverse();

    let last = chain.len().saturating_sub(1);
    Ok(chain
        .into_iter()
        .enumerate()
        .map(|(i, (key, method, bci))| {
            let mut vframe = Activation::interpreted(key, method).at(bci);
            if i == 0 {
                vframe.own_context = frame.own_context;
                vframe.super_send = frame.super_send;
            }
            if i == last {
                vframe.is_block = frame.is_block;
                vframe.home_context = frame.home_context;
            }
            vframe
        })
        .collect())
}

// ==================== Trap Handler ====================

/// Recompilation requested after a native method trapped too often
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrapRecompile {
    pub nm: NativeMethodId,
    pub key: LookupKey,
    /// Sends that must compile to real sends from now on
    pub disabled: Vec<(MethodId, Bci)>,
    pub backoff: u32,
}

/// Everything one trap firing did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrapOutcome {
    pub patch: PatchResult,
    pub trap_count: u32,
    pub deoptimization: DeoptimizationReport,
    pub recompile: Option<TrapRecompile>,
}

/// Handle the firing of trap `trap` in the compiled frame `index` of `pid`
pub fn fire(
    processes: &mut ProcessTable,
    code: &mut CodeTable,
    history: &mut TrapHistory,
    config: &TrapConfig,
    max_backoff: u32,
    pid: ProcessId,
    index: usize,
    trap: usize,
) -> Result<TrapOutcome> {
    if processes.in_scheduler() {
        error!(process = pid.0, "uncommon trap in scheduler context");
        return Err(Error::fatal("uncommon trap fired in the scheduler context"));
    }
    let frame = processes.frame(pid, index)?;
    let nm_id = frame
        .native_method()
        .ok_or_else(|| Error::fatal("uncommon trap fired in an interpreted frame"))?;

    let nm = code.checked_mut(nm_id)?;
    let site = nm
        .traps
        .get_mut(trap)
        .ok_or_else(|| Error::invalid_handle(HandleKind::Trap, trap))?;
    let patch = site.patch();
    nm.trap_count += 1;
    let trap_count = nm.trap_count;
    let key = nm.key;
    debug!(nm = nm_id.0, trap, ?patch, trap_count, "uncommon trap fired");

    let recompile = if trap_count >= config.recompile_threshold && nm.is_valid() {
        let disabled: Vec<(MethodId, Bci)> = nm
            .traps
            .iter()
            .filter(|t| t.is_used())
            .filter_map(|t| nm.scope(t.scope).map(|s| (s.method, t.bci)))
            .collect();
        for (method, bci) in &disabled {
            history.disable(*method, *bci);
        }
        let backoff = history.bump_backoff(key, max_backoff);
        code.invalidate(nm_id);
        info!(nm = nm_id.0, trap_count, backoff, "trap threshold reached, recompiling");
        Some(TrapRecompile {
            nm: nm_id,
            key,
            disabled,
            backoff,
        })
    } else {
        None
    };

    let deoptimization = deoptimize(processes, code, pid, index)?;
    Ok(TrapOutcome {
        patch,
        trap_count,
        deoptimization,
        recompile,
    })
}
