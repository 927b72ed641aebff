//! Optimizing compiler driven by type feedback
//!
//! A compilation takes a [`ScopeTree`] describing what previous executions
//! observed, runs the [`Inliner`] over the method being compiled and lowers
//! the resulting graph into a [`NativeMethod`]. Everything a compilation
//! reads lives in an explicit [`CompilationContext`] passed by reference, so
//! several compilations may be prepared side by side.

pub mod emit;
pub mod graph;
pub mod inliner;
pub mod policy;
pub mod prediction;
pub mod send_info;

pub use emit::{CodeEmitter, NativeMethodEmitter};
pub use graph::{CompiledGraph, InliningStats, Residual, SendResolution};
pub use inliner::Inliner;
pub use policy::{InlineCandidate, InlineDecision, InliningPolicy, RecompilerInliningPolicy, RejectReason};
pub use send_info::{ReceiverEstimate, SendInfo, UnknownBranch};

use crate::code::{CodeTable, NativeMethod};
use crate::config::VmConfig;
use crate::error::Result;
use crate::lookup::LookupKey;
use crate::oop::{ClassTable, MethodId};
use crate::rscope::ScopeTree;
use crate::trap::TrapHistory;
use std::fmt;
use tracing::info_span;

/// Read-only state shared by the inliner, the inlining policies and the
/// recompilation policy during one compilation
#[derive(Clone, Copy)]
pub struct CompilationContext<'a> {
    pub classes: &'a ClassTable,
    pub code: &'a CodeTable,
    pub config: &'a VmConfig,
    pub traps: &'a TrapHistory,
}

impl<'a> CompilationContext<'a> {
    pub fn new(classes: &'a ClassTable, code: &'a CodeTable, config: &'a VmConfig, traps: &'a TrapHistory) -> Self {
        Self {
            classes,
            code,
            config,
            traps,
        }
    }
}

/// Result of compiling one method
#[derive(Debug, Clone)]
pub struct Compilation {
    pub graph: CompiledGraph,
    pub stats: InliningStats,
    /// Not yet installed
    pub native: NativeMethod,
}

impl fmt::Display for Compilation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Compilation (level {}) ===", self.graph.level)?;
        writeln!(
            f,
            "Scopes: {} ({} deep)",
            self.graph.scopes.len(),
            self.graph.inlined_depth()
        )?;
        writeln!(
            f,
            "Sends: {} inlined, {} type cases, {} real, {} traps",
            self.stats.inlined, self.stats.type_cases, self.stats.real_sends, self.stats.uncommon_traps
        )?;
        for (reason, count) in &self.stats.rejections {
            writeln!(f, "  rejected ({}): {}", reason, count)?;
        }
        writeln!(f, "Size: {}", self.native.size)?;
        Ok(())
    }
}

/// Compile `method` for `key` at optimization `level` using `tree` as type
/// feedback
pub fn compile(
    ctx: &CompilationContext<'_>,
    tree: &ScopeTree,
    key: LookupKey,
    method: MethodId,
    level: u8,
) -> Result<Compilation> {
    let span = info_span!("compile", key = %key.display(ctx.classes), level);
    let _enter = span.enter();

    let (graph, stats) = Inliner::new(ctx, tree, key, method, level).run()?;
    let native = NativeMethodEmitter::new(ctx.classes).emit(&graph)?;
    Ok(Compilation { graph, stats, native })
}
