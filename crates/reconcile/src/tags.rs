use std::collections::{BTreeMap, HashSet};

use kubecat_core::Tag;

/// True when every desired (key, value) pair is already present.
pub fn contains_all_tags(desired: &[Tag], current: &[Tag]) -> bool {
    let have: HashSet<(&str, &str)> = current.iter().map(|t| (t.key.as_str(), t.value.as_str())).collect();
    desired.iter().all(|t| have.contains(&(t.key.as_str(), t.value.as_str())))
}

/// Bulk-assign payload; the last value wins for a repeated key.
pub fn tag_map(tags: &[Tag]) -> BTreeMap<String, String> {
    tags.iter().map(|t| (t.key.clone(), t.value.clone())).collect()
}
