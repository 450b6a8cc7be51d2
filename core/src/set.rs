//! Ordered set of store paths.

use std::collections::{BTreeMap, BTreeSet};

/// Set of `<repo>/<path>` strings with the operations garbage collection needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerSet {
    items: BTreeSet<String>,
}

impl LayerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the entry was not present yet.
    pub fn insert(&mut self, item: impl Into<String>) -> bool {
        self.items.insert(item.into())
    }

    pub fn contains(&self, item: &str) -> bool {
        self.items.contains(item)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(String::as_str)
    }

    /// Entries in either set.
    pub fn union(&self, other: &LayerSet) -> LayerSet {
        LayerSet {
            items: self.items.union(&other.items).cloned().collect(),
        }
    }

    /// Entries of `self` that are not in `other`.
    pub fn difference(&self, other: &LayerSet) -> LayerSet {
        LayerSet {
            items: self.items.difference(&other.items).cloned().collect(),
        }
    }

    /// Group entries by their first path component (the repository).
    ///
    /// `images.example.org/layers/abc` lands under `images.example.org` as
    /// `layers/abc`. Entries without a `/` are skipped.
    pub fn group_by_repo(&self) -> BTreeMap<String, Vec<String>> {
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for item in &self.items {
            let trimmed = item.trim_start_matches('/');
            if let Some((repo, path)) = trimmed.split_once('/') {
                if !repo.is_empty() && !path.is_empty() {
                    groups
                        .entry(repo.to_string())
                        .or_default()
                        .push(path.to_string());
                }
            }
        }
        groups
    }
}

impl<S: Into<String>> FromIterator<S> for LayerSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        LayerSet {
            items: iter.into_iter().map(Into::into).collect(),
        }
    }
}

impl IntoIterator for LayerSet {
    type Item = String;
    type IntoIter = std::collections::btree_set::IntoIter<String>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_difference_is_a_true_set_difference() {
        let present: LayerSet = ["r/layers/a", "r/layers/b", "r/layers/b", "r/layers/c"]
            .into_iter()
            .collect();
        let referenced: LayerSet = ["r/layers/b", "r/layers/b", "r/layers/z"].into_iter().collect();

        let removed = present.difference(&referenced);
        let removed: Vec<&str> = removed.iter().collect();
        assert_eq!(removed, vec!["r/layers/a", "r/layers/c"]);
    }

    #[test]
    fn test_difference_with_empty_sets() {
        let present: LayerSet = ["r/layers/a", "r/layers/b"].into_iter().collect();
        assert_eq!(present.difference(&LayerSet::new()), present);
        assert!(LayerSet::new().difference(&present).is_empty());
    }

    #[test]
    fn test_union() {
        let a: LayerSet = ["x", "y"].into_iter().collect();
        let b: LayerSet = ["y", "z"].into_iter().collect();
        assert_eq!(a.union(&b).len(), 3);
    }

    #[test]
    fn test_insert_reports_novelty() {
        let mut set = LayerSet::new();
        assert!(set.insert("a"));
        assert!(!set.insert("a"));
        assert!(set.contains("a"));
    }

    #[test]
    fn test_group_by_repo() {
        let set: LayerSet = [
            "one.org/layers/a",
            "two.org/layers/b",
            "one.org/layers/c",
            "/one.org/layers/d",
            "broken",
        ]
        .into_iter()
        .collect();
        let groups = set.group_by_repo();
        assert_eq!(groups.len(), 2);
        assert_eq!(
            groups["one.org"],
            vec!["layers/d", "layers/a", "layers/c"]
        );
        assert_eq!(groups["two.org"], vec!["layers/b"]);
    }
}
