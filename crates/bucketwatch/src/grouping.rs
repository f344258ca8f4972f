//! Grouping of nested prefixes under their outermost root.
//!
//! In lexicographic order every extension of a prefix sorts directly after it
//! and before any prefix that does not extend it, so one pass over the sorted
//! list recovers the roots of the implicit prefix tree.

use crate::types::covers;

/// Items sharing one root prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrefixGroup<T> {
    /// Scope of the group; `None` is the whole bucket.
    pub root: Option<String>,
    /// Members in prefix order, the root item first.
    pub members: Vec<T>,
}

/// Groups `items` under their root prefixes.
///
/// Items are ordered by `prefix_of` first (stable, `None` first), then each item
/// either joins the current group, when its prefix extends the group root, or
/// opens a new group.
pub fn group_by_root_prefix<T, F>(mut items: Vec<T>, prefix_of: F) -> Vec<PrefixGroup<T>>
where
    F: Fn(&T) -> Option<&str>,
{
    items.sort_by(|a, b| prefix_of(a).cmp(&prefix_of(b)));

    let mut groups: Vec<PrefixGroup<T>> = Vec::new();
    for item in items {
        match groups.last_mut() {
            Some(group) if covers(group.root.as_deref(), prefix_of(&item)) => {
                group.members.push(item);
            }
            _ => groups.push(PrefixGroup {
                root: prefix_of(&item).map(str::to_string),
                members: vec![item],
            }),
        }
    }
    groups
}
