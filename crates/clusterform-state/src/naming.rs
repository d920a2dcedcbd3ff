//! Hostname assignment for new nodes

use std::collections::BTreeSet;

/// Pick `count` hostnames derived from `base` that are not in `existing`.
///
/// A single node keeps `base` verbatim when it is free. Otherwise names are
/// numbered `base-N` upwards from the largest suffix already taken, so gaps
/// left by removed nodes are never reused.
pub fn node_names(existing: &BTreeSet<String>, base: &str, count: usize) -> Vec<String> {
    if count == 0 {
        return Vec::new();
    }
    if count == 1 && !existing.contains(base) {
        return vec![base.to_string()];
    }

    let max_suffix = existing
        .iter()
        .filter_map(|name| numeric_suffix(name, base))
        .max()
        .unwrap_or(0);

    (1..=count as u128)
        .map(|i| format!("{}-{}", base, u128::from(max_suffix) + i))
        .collect()
}

/// `Some(n)` when `name` is exactly `base-n` for a positive integer `n`
/// written in canonical form
fn numeric_suffix(name: &str, base: &str) -> Option<u64> {
    let suffix = name.strip_prefix(base)?.strip_prefix('-')?;
    if suffix.is_empty() || suffix.starts_with('0') || !suffix.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    suffix.parse().ok()
}
