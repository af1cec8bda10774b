//! Reconciliation of decoded log entries into the pending set.

use std::collections::BTreeSet;

use crate::{
    oplog::{codec::LogEntry, OpLogError, OpLogResult},
    plan::SplitOperation,
};

/// Fold log entries, in the order they were written, into the set of
/// operations still pending.
///
/// `Add` inserts an operation; `Remove` must find a previously added
/// operation, otherwise the log is corrupt. The reported line is the
/// 1-based position of the entry.
pub fn reconcile(
    entries: impl IntoIterator<Item = LogEntry>,
) -> OpLogResult<BTreeSet<SplitOperation>> {
    let mut pending = BTreeSet::new();
    for (idx, entry) in entries.into_iter().enumerate() {
        match entry {
            LogEntry::Add(op) => {
                pending.insert(op);
            }
            LogEntry::Remove(op) => {
                if !pending.remove(&op) {
                    return Err(OpLogError::Corruption {
                        line: idx + 1,
                        reason: format!("remove of {op} without a matching add"),
                    });
                }
            }
        }
    }
    Ok(pending)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(start: u128, split: u128) -> SplitOperation {
        SplitOperation::new(start, split)
    }

    #[test]
    fn removes_completed_operations() {
        let pending = reconcile([
            LogEntry::Add(op(1, 5)),
            LogEntry::Add(op(10, 15)),
            LogEntry::Remove(op(1, 5)),
        ])
        .unwrap();
        assert_eq!(pending.into_iter().collect::<Vec<_>>(), vec![op(10, 15)]);
    }

    #[test]
    fn remove_without_add_is_corruption() {
        let err = reconcile([LogEntry::Add(op(1, 5)), LogEntry::Remove(op(2, 9))]).unwrap_err();
        match err {
            OpLogError::Corruption { line, reason } => {
                assert_eq!(line, 2);
                assert!(reason.contains("(2, 9)"), "{reason}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn double_remove_is_corruption() {
        let result = reconcile([
            LogEntry::Add(op(1, 5)),
            LogEntry::Remove(op(1, 5)),
            LogEntry::Remove(op(1, 5)),
        ]);
        assert!(matches!(result, Err(OpLogError::Corruption { line: 3, .. })));
    }

    #[test]
    fn result_does_not_depend_on_add_order() {
        let forward = reconcile([LogEntry::Add(op(1, 5)), LogEntry::Add(op(10, 15))]).unwrap();
        let backward = reconcile([LogEntry::Add(op(10, 15)), LogEntry::Add(op(1, 5))]).unwrap();
        assert_eq!(forward, backward);
    }

    #[test]
    fn duplicate_adds_collapse() {
        let pending = reconcile([
            LogEntry::Add(op(1, 5)),
            LogEntry::Add(op(1, 5)),
            LogEntry::Remove(op(1, 5)),
        ])
        .unwrap();
        assert!(pending.is_empty());
    }
}
