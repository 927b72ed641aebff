//! Send resolution for inline cache misses

use crate::code::CodeTable;
use crate::ic::{Target, TargetResolver};
use crate::lookup::{LookupCache, LookupKey};
use crate::oop::ClassTable;

/// Resolves keys to the current native method, falling back to the
/// interpreter
pub struct RuntimeResolver<'r> {
    pub classes: &'r ClassTable,
    pub code: &'r CodeTable,
    pub lookup: &'r mut LookupCache,
}

impl TargetResolver for RuntimeResolver<'_> {
    fn resolve(&mut self, key: LookupKey) -> Option<Target> {
        let method = self.lookup.lookup(self.classes, key)?;
        Some(match self.code.current(&key) {
            Some(nm) => Target::Compiled(nm),
            None => Target::Interpreted(method),
        })
    }

    fn is_current(&self, key: LookupKey, target: Target) -> bool {
        match target {
            Target::Compiled(nm) => self.code.current(&key) == Some(nm),
            Target::Interpreted(method) => {
                key.resolve(self.classes) == Some(method) && self.code.current(&key).is_none()
            }
        }
    }
}
