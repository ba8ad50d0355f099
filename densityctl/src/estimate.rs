// Copyright (c) Facebook, Inc. and its affiliates.
use density_util::ksm::{PAGES_SHARED, PAGES_SHARING};
use std::collections::BTreeMap;

/// Memory saved by KSM in MiB. `pages_sharing` counts the extra mappings
/// of the `pages_shared` merge targets, so each mapping beyond the target
/// is a page saved. The counters can be inconsistent while a scan is in
/// flight, which is reported as no saving rather than a negative one.
pub fn estimate_saved_mib(ksm: Option<&BTreeMap<String, i64>>, page_size: usize) -> f64 {
    let ksm = match ksm {
        Some(v) => v,
        None => return 0.0,
    };
    let shared = ksm.get(PAGES_SHARED).copied().unwrap_or(0);
    let sharing = ksm.get(PAGES_SHARING).copied().unwrap_or(0);

    if shared <= 0 || sharing <= 0 || sharing < shared {
        return 0.0;
    }
    (sharing - shared) as f64 * page_size as f64 / (1 << 20) as f64
}

/// Scanner CPU ticks spent between two readings. Unavailable, zero or
/// backwards readings yield None instead of an error.
pub fn ticks_delta(before: Option<u64>, after: Option<u64>) -> Option<u64> {
    match (before, after) {
        (Some(b), Some(a)) if b > 0 && a > 0 && a >= b => Some(a - b),
        _ => None,
    }
}
