//! Inline cache protocol
//!
//! Every non-inlined send in compiled code (and every send in the
//! interpreter) owns one [`InlineCache`]. Its dispatch target is a single
//! replaceable value:
//!
//! ```text
//!  Empty ──miss──► Monomorphic ──miss──► Polymorphic ──miss (full)──► Megamorphic
//!    ▲                 │                    │  ▲                          │
//!    └──── clear() ────┴────────────────────┘  └── miss (room) ──┘       │
//!    └──────────────────────────── clear() ──────────────────────────────┘
//! ```
//!
//! The dirty flag is set on the first miss and never cleared again, so the
//! scope tree builder can tell a site that never ran from one whose cache
//! was reset after it ran.

mod interpreter;
mod pic;

pub use interpreter::InterpreterCaches;
pub use pic::{PicEntry, PicSpace, PicSpaceStats, PolymorphicInlineCache};

use crate::code::NativeMethodId;
use crate::lookup::LookupKey;
use crate::oop::{ClassId, MethodId, Root, Selector};
use bitflags::bitflags;
use tracing::{debug, warn};

bitflags! {
    /// Per-site cache flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct IcFlags: u8 {
        /// The site has missed at least once; never cleared
        const DIRTY = 1 << 0;
        /// The site lives in optimized code
        const OPTIMIZED = 1 << 1;
        /// The compiler must not try to inline this send
        const UNINLINABLE = 1 << 2;
        const SUPER_SEND = 1 << 3;
        const MEGAMORPHIC = 1 << 4;
        /// The receiver class was known statically at compile time
        const RECEIVER_STATIC = 1 << 5;
        /// The emitted send carries an invocation counter
        const COUNTING = 1 << 6;
    }
}

/// What a cache entry dispatches to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Target {
    /// Native code
    Compiled(NativeMethodId),
    /// Interpreted method (needs a PIC even when monomorphic)
    Interpreted(MethodId),
}

impl Target {
    pub fn native_method(self) -> Option<NativeMethodId> {
        match self {
            Target::Compiled(nm) => Some(nm),
            Target::Interpreted(_) => None,
        }
    }

    pub fn trace_roots(self, visit: &mut dyn FnMut(Root)) {
        match self {
            Target::Compiled(nm) => visit(Root::NativeMethod(nm)),
            Target::Interpreted(m) => visit(Root::Method(m)),
        }
    }
}

/// Resolves sends for cache misses and validates cached targets
pub trait TargetResolver {
    /// Resolve `key` to its current target; `None` means message not understood
    fn resolve(&mut self, key: LookupKey) -> Option<Target>;

    /// Whether `target` is still what `key` resolves to
    fn is_current(&self, key: LookupKey, target: Target) -> bool;
}

/// Call destination of a cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Unfilled: the next call performs a lookup
    LookupStub,
    /// Direct call to native code whose entry checks the receiver class
    Direct(PicEntry),
    Pic(Box<PolymorphicInlineCache>),
}

/// Observable cache state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IcState {
    Empty,
    Monomorphic,
    Polymorphic,
    Megamorphic,
}

/// Which lookup stub an empty cache calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubKind {
    NormalLookup,
    SuperLookup,
}

/// Result of sending through a cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcTransition {
    /// Served from the cache without a state change
    Hit(Target),
    /// Empty → Monomorphic
    Filled(Target),
    /// Monomorphic → Polymorphic, or a polymorphic cache gained an entry
    Grown(Target),
    /// The entry limit was exceeded
    WentMegamorphic(Target),
    /// Megamorphic stub performed a full lookup
    MegamorphicLookup(Target),
    /// Lookup failed; handled by the message-not-understood path
    NotUnderstood,
    /// PIC allocation failed: the cache was cleared and the call went through
    /// the jump table
    Fallback(Target),
}

impl IcTransition {
    pub fn target(&self) -> Option<Target> {
        match *self {
            IcTransition::Hit(t)
            | IcTransition::Filled(t)
            | IcTransition::Grown(t)
            | IcTransition::WentMegamorphic(t)
            | IcTransition::MegamorphicLookup(t)
            | IcTransition::Fallback(t) => Some(t),
            IcTransition::NotUnderstood => None,
        }
    }
}

/// Per-call-site inline cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineCache {
    selector: Selector,
    /// Class the lookup starts at for super sends
    super_lookup_class: Option<ClassId>,
    flags: IcFlags,
    destination: Destination,
    hits: u64,
    misses: u64,
}

impl InlineCache {
    pub fn new(selector: Selector) -> Self {
        Self {
            selector,
            super_lookup_class: None,
            flags: IcFlags::empty(),
            destination: Destination::LookupStub,
            hits: 0,
            misses: 0,
        }
    }

    /// Cache for a super send whose lookup starts at `lookup_class`
    pub fn new_super(selector: Selector, lookup_class: ClassId) -> Self {
        let mut ic = Self::new(selector);
        ic.super_lookup_class = Some(lookup_class);
        ic.flags |= IcFlags::SUPER_SEND;
        ic
    }

    /// Cache with compile-time flags (`DIRTY` and `MEGAMORPHIC` are ignored)
    pub fn with_flags(mut self, flags: IcFlags) -> Self {
        self.flags |= flags - (IcFlags::DIRTY | IcFlags::MEGAMORPHIC);
        self
    }

    pub fn selector(&self) -> Selector {
        self.selector
    }

    pub fn flags(&self) -> IcFlags {
        self.flags
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.contains(IcFlags::DIRTY)
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.destination, Destination::LookupStub)
    }

    /// Empty and never missed: the site has not executed
    pub fn was_never_executed(&self) -> bool {
        self.is_empty() && !self.is_dirty()
    }

    pub fn is_megamorphic(&self) -> bool {
        matches!(&self.destination, Destination::Pic(pic) if pic.is_megamorphic())
    }

    pub fn is_uninlinable(&self) -> bool {
        self.flags.contains(IcFlags::UNINLINABLE)
    }

    pub fn is_super_send(&self) -> bool {
        self.flags.contains(IcFlags::SUPER_SEND)
    }

    pub fn stub_kind(&self) -> StubKind {
        if self.is_super_send() {
            StubKind::SuperLookup
        } else {
            StubKind::NormalLookup
        }
    }

    pub fn state(&self) -> IcState {
        match &self.destination {
            Destination::LookupStub => IcState::Empty,
            Destination::Direct(_) => IcState::Monomorphic,
            Destination::Pic(pic) => match pic.number_of_targets() {
                0 => IcState::Megamorphic,
                1 => IcState::Monomorphic,
                _ => IcState::Polymorphic,
            },
        }
    }

    /// 0 for empty and megamorphic caches
    pub fn number_of_targets(&self) -> usize {
        match &self.destination {
            Destination::LookupStub => 0,
            Destination::Direct(_) => 1,
            Destination::Pic(pic) => pic.number_of_targets(),
        }
    }

    /// Cached `(class, target)` pairs in insertion order
    pub fn entries(&self) -> Vec<PicEntry> {
        match &self.destination {
            Destination::LookupStub => Vec::new(),
            Destination::Direct(entry) => vec![*entry],
            Destination::Pic(pic) => pic.entries().to_vec(),
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Key the send resolves for a receiver of `class`
    pub fn lookup_key(&self, class: ClassId) -> LookupKey {
        LookupKey::new(self.super_lookup_class.unwrap_or(class), self.selector)
    }

    fn cached_target(&self, class: ClassId) -> Option<Target> {
        match &self.destination {
            Destination::LookupStub => None,
            Destination::Direct(entry) => (entry.class == class).then_some(entry.target),
            Destination::Pic(pic) => pic.find(class),
        }
    }

    /// Send through the cache, transitioning on a miss
    pub fn dispatch(
        &mut self,
        receiver: ClassId,
        resolver: &mut dyn TargetResolver,
        space: &mut PicSpace,
        max_entries: usize,
    ) -> IcTransition {
        if let Some(target) = self.cached_target(receiver) {
            self.hits += 1;
            return IcTransition::Hit(target);
        }
        let transition = self.miss(receiver, resolver, space, max_entries);
        debug_assert!(self.is_empty() || self.is_dirty(), "filled cache must be dirty");
        transition
    }

    fn miss(
        &mut self,
        receiver: ClassId,
        resolver: &mut dyn TargetResolver,
        space: &mut PicSpace,
        max_entries: usize,
    ) -> IcTransition {
        self.misses += 1;
        self.flags |= IcFlags::DIRTY;

        let Some(target) = resolver.resolve(self.lookup_key(receiver)) else {
            debug!(selector = self.selector.index(), class = receiver.0, "lookup failed on cache miss");
            return IcTransition::NotUnderstood;
        };
        let entry = PicEntry::new(receiver, target);

        match &mut self.destination {
            Destination::LookupStub => {
                if let Target::Compiled(_) = target {
                    self.destination = Destination::Direct(entry);
                    debug!(selector = self.selector.index(), class = receiver.0, "inline cache filled");
                    return IcTransition::Filled(target);
                }
                let pic = PolymorphicInlineCache::Entries(vec![entry]);
                if self.install_pic(pic, space) {
                    IcTransition::Filled(target)
                } else {
                    IcTransition::Fallback(target)
                }
            }
            Destination::Pic(pic) if pic.is_megamorphic() => {
                **pic = PolymorphicInlineCache::Megamorphic { last_class: Some(receiver) };
                IcTransition::MegamorphicLookup(target)
            }
            _ => {
                let mut entries = self.entries();
                entries.push(entry);
                if entries.len() <= max_entries {
                    if self.install_pic(PolymorphicInlineCache::Entries(entries), space) {
                        debug!(
                            selector = self.selector.index(),
                            targets = self.number_of_targets(),
                            "inline cache grown"
                        );
                        IcTransition::Grown(target)
                    } else {
                        IcTransition::Fallback(target)
                    }
                } else if self.install_pic(PolymorphicInlineCache::Megamorphic { last_class: Some(receiver) }, space) {
                    self.flags |= IcFlags::MEGAMORPHIC;
                    debug!(selector = self.selector.index(), "inline cache went megamorphic");
                    IcTransition::WentMegamorphic(target)
                } else {
                    IcTransition::Fallback(target)
                }
            }
        }
    }

    /// Replace the current PIC (if any) with `pic`; on allocation failure the
    /// cache is cleared and false is returned
    fn install_pic(&mut self, pic: PolymorphicInlineCache, space: &mut PicSpace) -> bool {
        self.release(space);
        if space.allocate(&pic) {
            self.destination = Destination::Pic(Box::new(pic));
            true
        } else {
            warn!(selector = self.selector.index(), "PIC allocation failed, using jump table");
            self.destination = Destination::LookupStub;
            false
        }
    }

    fn release(&mut self, space: &mut PicSpace) {
        if let Destination::Pic(pic) = &self.destination {
            space.free(pic);
        }
        self.destination = Destination::LookupStub;
    }

    /// Reset to the lookup stub; the dirty flag survives
    pub fn clear(&mut self, space: &mut PicSpace) {
        self.release(space);
        self.flags.remove(IcFlags::MEGAMORPHIC);
    }

    /// Drop entries whose targets are no longer current; returns how many
    /// entries were removed
    pub fn cleanup(&mut self, resolver: &dyn TargetResolver, space: &mut PicSpace) -> usize {
        let entries = match &self.destination {
            Destination::LookupStub => return 0,
            Destination::Pic(pic) if pic.is_megamorphic() => return 0,
            _ => self.entries(),
        };
        let live: Vec<PicEntry> = entries
            .iter()
            .copied()
            .filter(|e| resolver.is_current(self.lookup_key(e.class), e.target))
            .collect();
        let removed = entries.len() - live.len();
        if removed == 0 {
            return 0;
        }

        match live.as_slice() {
            [] => self.clear(space),
            [entry] if matches!(entry.target, Target::Compiled(_)) => {
                self.release(space);
                self.destination = Destination::Direct(*entry);
            }
            _ => {
                self.install_pic(PolymorphicInlineCache::Entries(live), space);
            }
        }
        debug!(selector = self.selector.index(), removed, "inline cache cleaned up");
        removed
    }

    pub fn trace_roots(&self, visit: &mut dyn FnMut(Root)) {
        if let Some(class) = self.super_lookup_class {
            visit(Root::Class(class));
        }
        match &self.destination {
            Destination::LookupStub => {}
            Destination::Direct(entry) => {
                visit(Root::Class(entry.class));
                entry.target.trace_roots(visit);
            }
            Destination::Pic(pic) => pic.trace_roots(visit),
        }
    }
}
