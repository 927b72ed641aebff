//! Static receiver prediction
//!
//! Used when no type feedback is available for a send. Arithmetic and
//! comparison selectors predict SmallInteger, indexing predicts Array and
//! control-flow selectors predict the two boolean classes.

use super::send_info::{ReceiverEstimate, UnknownBranch};
use crate::oop::{ClassTable, Selector};

const ARITHMETIC: &[&str] = &["+", "-", "*", "/", "//", "\\\\", "<", "<=", ">", ">=", "=", "~="];
const INDEXING: &[&str] = &["at:", "at:put:", "size"];
const BOOLEAN: &[&str] = &["ifTrue:", "ifFalse:", "ifTrue:ifFalse:", "ifFalse:ifTrue:", "and:", "or:", "not"];

/// Predicted receiver classes for `selector`, if it has a hardcoded
/// prediction
pub fn predict(classes: &ClassTable, selector: Selector) -> Option<ReceiverEstimate> {
    let name = classes.selector_name(selector);
    let wk = classes.well_known();
    if ARITHMETIC.contains(&name) {
        Some(ReceiverEstimate::merge(vec![wk.small_integer], UnknownBranch::Likely))
    } else if INDEXING.contains(&name) {
        Some(ReceiverEstimate::merge(vec![wk.array], UnknownBranch::Likely))
    } else if BOOLEAN.contains(&name) {
        Some(ReceiverEstimate::merge(
            vec![wk.true_class, wk.false_class],
            UnknownBranch::Unlikely,
        ))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predictions() {
        let mut table = ClassTable::new();
        let plus = table.intern("+");
        let at = table.intern("at:");
        let if_true = table.intern("ifTrue:");
        let foo = table.intern("foo");
        let wk = *table.well_known();

        assert_eq!(predict(&table, plus).unwrap().classes, vec![wk.small_integer]);
        assert_eq!(predict(&table, at).unwrap().classes, vec![wk.array]);
        let boolean = predict(&table, if_true).unwrap();
        assert_eq!(boolean.classes, vec![wk.true_class, wk.false_class]);
        assert_eq!(boolean.unknown, Some(UnknownBranch::Unlikely));
        assert!(predict(&table, foo).is_none());
    }
}
