//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::{path::Path, time::Duration};

use balanced_split::{
    cluster::mem::{MemCluster, MemClusterBuilder},
    KeySpace, KeyValue, SplitOperation, SplitOptions,
};

/// Two hex digit key space topping out at 200, small enough to reason about.
pub fn space() -> KeySpace {
    KeySpace::new(2, 0xc8).expect("valid key space")
}

/// Raw key bytes for `value` in [`space`].
pub fn key(value: u128) -> Vec<u8> {
    space().decode(KeyValue::new(value))
}

/// Options with polling sped up and logs kept under `root`.
pub fn fast_options(root: impl AsRef<Path>) -> SplitOptions {
    SplitOptions::from(root.as_ref())
        .poll_interval(Duration::ZERO)
        .key_space(space())
}

/// Table `t` with a single family and shards starting at 0, 0x32, 0x64, 0x96.
pub fn four_shards() -> MemClusterBuilder {
    MemCluster::builder().table("t", &["d"], &[key(0x32), key(0x64), key(0x96)])
}

/// The midpoint plan of [`four_shards`].
pub fn four_shard_plan() -> Vec<SplitOperation> {
    vec![
        SplitOperation::new(0x00, 0x19),
        SplitOperation::new(0x32, 0x4b),
        SplitOperation::new(0x64, 0x7d),
        SplitOperation::new(0x96, 0xaf),
    ]
}
