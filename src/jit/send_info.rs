//! Per-send compiler state

use super::graph::CompileScopeId;
use crate::ic::IcFlags;
use crate::oop::{Bci, ClassId, Selector};

/// How likely the "none of the above" branch of an estimate is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum UnknownBranch {
    /// Recorded as never taken; may become an uncommon trap
    Untaken,
    /// Feedback enumerated every receiver class seen
    Unlikely,
    Likely,
}

/// Hypotheses about a send's receiver class
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverEstimate {
    /// Class hypotheses in feedback order
    pub classes: Vec<ClassId>,
    /// `None` when the classes are exhaustive
    pub unknown: Option<UnknownBranch>,
}

impl ReceiverEstimate {
    /// Nothing is known
    pub fn unknown(likelihood: UnknownBranch) -> Self {
        Self {
            classes: Vec::new(),
            unknown: Some(likelihood),
        }
    }

    /// The receiver class is known exactly
    pub fn exact(class: ClassId) -> Self {
        Self {
            classes: vec![class],
            unknown: None,
        }
    }

    pub fn merge(classes: Vec<ClassId>, unknown: UnknownBranch) -> Self {
        Self {
            classes,
            unknown: Some(unknown),
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.classes.is_empty()
    }

    /// A single class and no unknown branch
    pub fn is_exact(&self) -> bool {
        self.classes.len() == 1 && self.unknown.is_none()
    }
}

/// Compiler state of one send; discarded once the send is resolved
#[derive(Debug, Clone)]
pub struct SendInfo {
    pub scope: CompileScopeId,
    pub bci: Bci,
    pub selector: Selector,
    pub estimate: ReceiverEstimate,
    /// Emit the real send with an invocation counter
    pub counting: bool,
    /// Never try to inline this send
    pub uninlinable: bool,
    /// The receiver class is known statically
    pub receiver_static: bool,
    pub super_send: bool,
}

impl SendInfo {
    pub fn new(scope: CompileScopeId, bci: Bci, selector: Selector) -> Self {
        Self {
            scope,
            bci,
            selector,
            estimate: ReceiverEstimate::unknown(UnknownBranch::Likely),
            counting: false,
            uninlinable: false,
            receiver_static: false,
            super_send: false,
        }
    }

    /// Cache flags for the real send emitted for this info
    pub fn ic_flags(&self) -> IcFlags {
        let mut flags = IcFlags::OPTIMIZED;
        flags.set(IcFlags::COUNTING, self.counting);
        flags.set(IcFlags::UNINLINABLE, self.uninlinable);
        flags.set(IcFlags::RECEIVER_STATIC, self.receiver_static);
        flags.set(IcFlags::SUPER_SEND, self.super_send);
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oop::ClassTable;

    #[test]
    fn test_estimate_shapes() {
        assert!(ReceiverEstimate::unknown(UnknownBranch::Likely).is_unknown());
        assert!(ReceiverEstimate::exact(ClassId(3)).is_exact());
        let merged = ReceiverEstimate::merge(vec![ClassId(3)], UnknownBranch::Unlikely);
        assert!(!merged.is_exact());
        assert!(!merged.is_unknown());
    }

    #[test]
    fn test_ic_flags() {
        let mut table = ClassTable::new();
        let mut info = SendInfo::new(CompileScopeId(0), 1, table.intern("foo"));
        info.counting = true;
        info.uninlinable = true;
        let flags = info.ic_flags();
        assert!(flags.contains(IcFlags::OPTIMIZED | IcFlags::COUNTING | IcFlags::UNINLINABLE));
        assert!(!flags.contains(IcFlags::RECEIVER_STATIC));
    }
}
