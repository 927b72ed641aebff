//! Native method emission
//!
//! Lowers a [`CompiledGraph`] into a [`NativeMethod`]: one scope descriptor
//! per compile scope (in preorder, so offsets equal compile scope ids), one
//! inline cache per real or residual send and one trap site per uncommon
//! trap.

use super::graph::{CompiledGraph, RealSend, Residual, SendNode, SendResolution};
use crate::code::{CallSiteCache, NativeMethod, ScopeDesc, ScopeSender};
use crate::error::Result;
use crate::ic::InlineCache;
use crate::oop::{ClassTable, SEND_COST};
use crate::trap::TrapSite;

/// Code size of one class test of a type case
pub const TYPE_TEST_COST: u32 = 2;
/// Code size of a trap stub call with its spill
pub const TRAP_COST: u32 = 2;

/// Turns compiled graphs into installable code
pub trait CodeEmitter {
    fn emit(&mut self, graph: &CompiledGraph) -> Result<NativeMethod>;
}

/// Emits the in-memory [`NativeMethod`] representation
pub struct NativeMethodEmitter<'a> {
    classes: &'a ClassTable,
}

impl<'a> NativeMethodEmitter<'a> {
    pub fn new(classes: &'a ClassTable) -> Self {
        Self { classes }
    }

    fn emit_send(nm: &mut NativeMethod, node: &SendNode) -> i64 {
        let scope = node.scope.0;
        let real_send = |nm: &mut NativeMethod, send: &RealSend| {
            let cache = match send.lookup_class {
                Some(class) => InlineCache::new_super(node.selector, class).with_flags(send.flags),
                None => InlineCache::new(node.selector).with_flags(send.flags),
            };
            nm.call_sites.push(CallSiteCache {
                scope,
                bci: node.bci,
                cache,
            });
        };
        match &node.resolution {
            SendResolution::Inlined { .. } => -(SEND_COST as i64),
            SendResolution::RealSend(send) => {
                real_send(nm, send);
                0
            }
            SendResolution::UncommonTrap(_) => {
                nm.traps.push(TrapSite::new(scope, node.bci));
                TRAP_COST as i64 - SEND_COST as i64
            }
            SendResolution::TypeCase { arms, residual } => {
                let tests = (arms.len() as u32 * TYPE_TEST_COST) as i64;
                match residual {
                    Residual::Send(send) => {
                        real_send(nm, send);
                        tests
                    }
                    Residual::Trap(_) => {
                        nm.traps.push(TrapSite::new(scope, node.bci));
                        tests + TRAP_COST as i64 - SEND_COST as i64
                    }
                }
            }
        }
    }
}

impl CodeEmitter for NativeMethodEmitter<'_> {
    fn emit(&mut self, graph: &CompiledGraph) -> Result<NativeMethod> {
        let mut nm = NativeMethod::new(graph.key, graph.method, graph.level);
        let mut size: i64 = 0;

        for scope in &graph.scopes {
            size += self.classes.method_checked(scope.method)?.cost() as i64;
            nm.scopes.push(ScopeDesc {
                offset: scope.id.0,
                sender: scope.sender.map(|(sender, bci)| ScopeSender {
                    offset: sender.0,
                    bci,
                }),
                key: scope.key,
                method: scope.method,
                lite: scope.lite,
            });
        }

        let mut nodes: Vec<&SendNode> = graph.sends.iter().collect();
        nodes.sort_by_key(|n| (n.scope, n.bci));
        for node in nodes {
            size += Self::emit_send(&mut nm, node);
        }
        nm.size = size.max(0) as u32;
        Ok(nm)
    }
}
