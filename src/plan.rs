//! Balanced split planning.
//!
//! A plan bisects every existing shard: the shard starting at `start` is
//! split at the integer midpoint of its range. The planner is pure; fetching
//! boundaries and persisting the plan belong to the caller.

use std::{collections::BTreeSet, fmt};

use thiserror::Error;

use crate::{
    key::{KeySpace, KeyValue},
    observability::{log_debug, log_warn},
};

/// One currently existing shard, `[start, end)`.
///
/// An `end` of zero marks the last shard of the table and resolves to the
/// key space maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShardRange {
    /// First key owned by the shard.
    pub start: KeyValue,
    /// First key past the shard, or zero when open ended.
    pub end: KeyValue,
}

impl ShardRange {
    /// Build a range from its bounds.
    pub fn new(start: impl Into<KeyValue>, end: impl Into<KeyValue>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }
}

/// A planned split: cut the shard starting at `start` at `split_point`.
///
/// Ordering is by `(start, split_point)`, which is also the order in which a
/// run processes its pending operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SplitOperation {
    /// Start key of the shard being split.
    pub start: KeyValue,
    /// Start key of the upper daughter.
    pub split_point: KeyValue,
}

impl SplitOperation {
    /// Build an operation from its two keys.
    pub fn new(start: impl Into<KeyValue>, split_point: impl Into<KeyValue>) -> Self {
        Self {
            start: start.into(),
            split_point: split_point.into(),
        }
    }
}

impl fmt::Display for SplitOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:x}, {:x})", self.start, self.split_point)
    }
}

/// Errors raised while computing a plan.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlanError {
    /// A range is empty or inverted once its open end is resolved.
    #[error("invalid shard range [{start:#x}, {end:#x})")]
    InvalidRange {
        /// Start of the offending range.
        start: u128,
        /// Resolved end of the offending range.
        end: u128,
    },
    /// Two ranges share keys.
    #[error("shard ranges [{first_start:#x}, {first_end:#x}) and [{second_start:#x}, ..) overlap")]
    Overlap {
        /// Start of the earlier range.
        first_start: u128,
        /// Resolved end of the earlier range.
        first_end: u128,
        /// Start of the later range.
        second_start: u128,
    },
    /// Uniform pre-splitting needs at least two regions.
    #[error("cannot pre-split into {0} regions")]
    TooFewRegions(u32),
}

/// Compute one split operation per shard.
///
/// Ranges may be supplied in any order. Every range is checked for
/// `start < end` and for overlap with its neighbour; a violation fails the
/// whole plan. A shard holding a single key cannot be bisected and is left
/// out of the plan.
pub fn compute_plan(
    space: &KeySpace,
    ranges: &[ShardRange],
) -> Result<BTreeSet<SplitOperation>, PlanError> {
    let mut resolved = Vec::with_capacity(ranges.len());
    for range in ranges {
        let end = space.resolve_end(range.end);
        if range.start >= end {
            return Err(PlanError::InvalidRange {
                start: range.start.get(),
                end: end.get(),
            });
        }
        resolved.push((range.start, end));
    }
    resolved.sort();

    for pair in resolved.windows(2) {
        let (first_start, first_end) = pair[0];
        let (second_start, _) = pair[1];
        if first_end > second_start {
            return Err(PlanError::Overlap {
                first_start: first_start.get(),
                first_end: first_end.get(),
                second_start: second_start.get(),
            });
        }
    }

    let mut plan = BTreeSet::new();
    for (start, end) in resolved {
        let split_point = midpoint(start, end);
        if split_point == start {
            log_warn!(
                component = "planner",
                event = "shard_too_small",
                start = %space.to_hex(start),
                end = %space.to_hex(end),
            );
            continue;
        }
        log_debug!(
            component = "planner",
            event = "split_planned",
            start = %space.to_hex(start),
            end = %space.to_hex(end),
            split_point = %space.to_hex(split_point),
        );
        plan.insert(SplitOperation { start, split_point });
    }
    Ok(plan)
}

/// Boundaries that cut the key space into `regions` equal shards.
///
/// Returns `regions - 1` keys, `max / regions * i` for `i` in `1..regions`,
/// suitable for creating a pre-split table.
pub fn uniform_boundaries(space: &KeySpace, regions: u32) -> Result<Vec<KeyValue>, PlanError> {
    if regions < 2 {
        return Err(PlanError::TooFewRegions(regions));
    }
    let step = space.max().get() / u128::from(regions);
    Ok((1..regions)
        .map(|i| KeyValue::new(step * u128::from(i)))
        .collect())
}

/// `floor((start + end) / 2)` without overflowing the key type.
fn midpoint(start: KeyValue, end: KeyValue) -> KeyValue {
    KeyValue::new(start.get() + (end.get() - start.get()) / 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space_200() -> KeySpace {
        KeySpace::new(2, 200).unwrap()
    }

    #[test]
    fn two_shards_with_open_end() {
        let plan = compute_plan(
            &space_200(),
            &[ShardRange::new(100, 0), ShardRange::new(0, 100)],
        )
        .unwrap();
        let ops: Vec<_> = plan.into_iter().collect();
        assert_eq!(
            ops,
            vec![SplitOperation::new(0, 50), SplitOperation::new(100, 150)]
        );
    }

    #[test]
    fn split_point_is_floor_of_midpoint() {
        let space = KeySpace::md5_prefix();
        let cases = [(0u128, 3u128), (10, 15), (7, 9), (0x1000, 0x7fff_ffff), (1, 2_000_001)];
        for (s, e) in cases {
            let plan = compute_plan(&space, &[ShardRange::new(s, e)]).unwrap();
            let op = plan.into_iter().next().unwrap();
            assert_eq!(op.start.get(), s);
            assert_eq!(op.split_point.get(), (s + e) / 2);
            assert!(op.start < op.split_point && op.split_point.get() < e);
        }
    }

    #[test]
    fn midpoint_does_not_overflow_wide_keys() {
        let space = KeySpace::new(32, u128::MAX).unwrap();
        let plan = compute_plan(&space, &[ShardRange::new(u128::MAX - 10, 0)]).unwrap();
        let op = plan.into_iter().next().unwrap();
        assert_eq!(op.split_point.get(), u128::MAX - 5);
    }

    #[test]
    fn rejects_inverted_and_empty_ranges() {
        let space = space_200();
        assert_eq!(
            compute_plan(&space, &[ShardRange::new(50, 20)]),
            Err(PlanError::InvalidRange { start: 50, end: 20 })
        );
        assert_eq!(
            compute_plan(&space, &[ShardRange::new(30, 30)]),
            Err(PlanError::InvalidRange { start: 30, end: 30 })
        );
    }

    #[test]
    fn rejects_overlapping_ranges() {
        let err = compute_plan(
            &space_200(),
            &[ShardRange::new(0, 120), ShardRange::new(100, 0)],
        )
        .unwrap_err();
        assert_eq!(
            err,
            PlanError::Overlap {
                first_start: 0,
                first_end: 120,
                second_start: 100,
            }
        );
    }

    #[test]
    fn single_key_shards_are_skipped() {
        let plan = compute_plan(
            &space_200(),
            &[ShardRange::new(0, 1), ShardRange::new(1, 11)],
        )
        .unwrap();
        assert_eq!(plan.into_iter().collect::<Vec<_>>(), vec![SplitOperation::new(1, 6)]);
    }

    #[test]
    fn uniform_boundaries_cover_the_space() {
        let bounds = uniform_boundaries(&space_200(), 4).unwrap();
        let raw: Vec<u128> = bounds.iter().map(|k| k.get()).collect();
        assert_eq!(raw, vec![50, 100, 150]);
        assert_eq!(
            uniform_boundaries(&space_200(), 1),
            Err(PlanError::TooFewRegions(1))
        );
    }
}
