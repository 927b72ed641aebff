//! Polymorphic inline caches and the code space they live in
//!
//! A PIC is owned by exactly one [`InlineCache`](super::InlineCache). Growing
//! it never mutates the existing object: a new PIC holding the old entries
//! plus the new one is allocated and the old one is freed.

use super::Target;
use crate::oop::{ClassId, Root};

/// One `(class, target)` pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PicEntry {
    pub class: ClassId,
    pub target: Target,
}

impl PicEntry {
    pub fn new(class: ClassId, target: Target) -> Self {
        Self { class, target }
    }
}

/// Polymorphic inline cache
///
/// `Megamorphic` has no per-class entries (`number_of_targets() == 0`); every
/// call goes through a full lookup and only the last receiver class is kept.
/// A one-entry `Entries` PIC is the monomorphic form used for interpreted
/// targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolymorphicInlineCache {
    Entries(Vec<PicEntry>),
    Megamorphic { last_class: Option<ClassId> },
}

impl PolymorphicInlineCache {
    pub fn number_of_targets(&self) -> usize {
        match self {
            Self::Entries(entries) => entries.len(),
            Self::Megamorphic { .. } => 0,
        }
    }

    pub fn entries(&self) -> &[PicEntry] {
        match self {
            Self::Entries(entries) => entries,
            Self::Megamorphic { .. } => &[],
        }
    }

    pub fn is_megamorphic(&self) -> bool {
        matches!(self, Self::Megamorphic { .. })
    }

    /// Cached target for `class`
    pub fn find(&self, class: ClassId) -> Option<Target> {
        self.entries().iter().find(|e| e.class == class).map(|e| e.target)
    }

    /// Code space units this PIC occupies
    pub fn footprint(&self) -> usize {
        match self {
            Self::Entries(entries) => entries.len(),
            Self::Megamorphic { .. } => 1,
        }
    }

    pub fn trace_roots(&self, visit: &mut dyn FnMut(Root)) {
        match self {
            Self::Entries(entries) => {
                for entry in entries {
                    visit(Root::Class(entry.class));
                    entry.target.trace_roots(visit);
                }
            }
            Self::Megamorphic { last_class } => {
                if let Some(class) = last_class {
                    visit(Root::Class(*class));
                }
            }
        }
    }
}

// ==================== PIC Code Space ====================

/// Code space statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PicSpaceStats {
    pub allocations: u64,
    pub frees: u64,
    pub failures: u64,
}

/// Accounts PIC allocations against a fixed capacity
#[derive(Debug, Clone)]
pub struct PicSpace {
    capacity: usize,
    used: usize,
    megamorphic_stubs_enabled: bool,
    stats: PicSpaceStats,
}

impl PicSpace {
    pub fn new(capacity: usize, megamorphic_stubs_enabled: bool) -> Self {
        Self {
            capacity,
            used: 0,
            megamorphic_stubs_enabled,
            stats: PicSpaceStats::default(),
        }
    }

    /// Reserve space for `pic`; false when the space is exhausted or the PIC
    /// is a megamorphic stub and those are disabled
    pub fn allocate(&mut self, pic: &PolymorphicInlineCache) -> bool {
        let size = pic.footprint();
        if (pic.is_megamorphic() && !self.megamorphic_stubs_enabled) || self.used + size > self.capacity {
            self.stats.failures += 1;
            return false;
        }
        self.used += size;
        self.stats.allocations += 1;
        true
    }

    /// Return the space held by a superseded PIC
    pub fn free(&mut self, pic: &PolymorphicInlineCache) {
        self.used = self.used.saturating_sub(pic.footprint());
        self.stats.frees += 1;
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> PicSpaceStats {
        self.stats
    }
}

impl Default for PicSpace {
    fn default() -> Self {
        Self::new(64 * 1024, true)
    }
}
