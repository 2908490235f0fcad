//! Topic Trie for efficient subscription, retained-message and permission
//! matching
//!
//! A trie (prefix tree) data structure optimized for MQTT topic matching.
//! Supports wildcards (+ and #) for subscription filters. Shared by three
//! call sites: subscriptions (`TopicTrie<HashMap<SessionId, QoS>>`), the
//! retained-message store (`TopicTrie<Message>`), and permission sets
//! (`TopicTrie<()>`).
//!
//! Performance optimizations:
//! - Uses iterator-based traversal to avoid Vec allocations on every operation
//! - Uses compact_str for memory-efficient topic level storage
//! - Pre-allocates children HashMap capacity for common workloads

use ahash::AHashMap;
use compact_str::CompactString;
use smallvec::SmallVec;

/// A value type that can be combined with another of the same type — needed
/// for `TopicTrie::union`/`TopicTrie::intersection`, and for inserting a
/// subscriber alongside existing subscribers at the same filter.
pub trait MergeValue {
    fn merge(self, other: Self) -> Self;
}

impl<T> MergeValue for std::collections::HashSet<T>
where
    T: std::hash::Hash + Eq,
{
    fn merge(mut self, other: Self) -> Self {
        self.extend(other);
        self
    }
}

impl<K, V> MergeValue for std::collections::HashMap<K, V>
where
    K: std::hash::Hash + Eq,
{
    fn merge(mut self, other: Self) -> Self {
        self.extend(other);
        self
    }
}

impl MergeValue for () {
    fn merge(self, _other: Self) -> Self {}
}

/// Node in the topic trie
#[derive(Debug)]
struct TrieNode<V> {
    /// Value stored at this node (subscription data)
    value: Option<V>,
    /// Children indexed by topic level (CompactString avoids heap allocation for short strings)
    children: AHashMap<CompactString, TrieNode<V>>,
    /// Single-level wildcard (+) child
    single_wildcard: Option<Box<TrieNode<V>>>,
    /// Multi-level wildcard (#) value
    multi_wildcard: Option<V>,
}

impl<V> TrieNode<V> {
    fn new() -> Self {
        Self {
            value: None,
            // Most nodes have few children, but some may have many
            children: AHashMap::with_capacity(4),
            single_wildcard: None,
            multi_wildcard: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.value.is_none()
            && self.multi_wildcard.is_none()
            && self.single_wildcard.is_none()
            && self.children.is_empty()
    }
}

impl<V> Default for TrieNode<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Topic Trie for efficient subscription matching
#[derive(Debug)]
pub struct TopicTrie<V> {
    root: TrieNode<V>,
}

impl<V> TopicTrie<V> {
    pub fn new() -> Self {
        Self {
            root: TrieNode::new(),
        }
    }

    /// Alias for `new`.
    pub fn empty() -> Self {
        Self::new()
    }

    /// A trie holding a single filter/value pair.
    pub fn singleton(filter: &str, value: V) -> Self {
        let mut trie = Self::new();
        trie.insert(filter, value);
        trie
    }

    /// Insert a topic filter with associated value, replacing whatever
    /// value was there before.
    /// Uses iterator-based traversal to avoid Vec allocation.
    pub fn insert(&mut self, filter: &str, value: V) {
        let slot = self.leaf_mut(filter);
        *slot = Some(value);
    }

    /// Insert a value at `filter`, merging with any existing value via
    /// `MergeValue::merge` rather than replacing it.
    pub fn insert_or_merge(&mut self, filter: &str, value: V)
    where
        V: MergeValue,
    {
        let slot = self.leaf_mut(filter);
        *slot = Some(match slot.take() {
            Some(existing) => existing.merge(value),
            None => value,
        });
    }

    fn leaf_mut(&mut self, filter: &str) -> &mut Option<V> {
        let mut node = &mut self.root;
        let mut levels = filter.split('/').peekable();

        while let Some(level) = levels.next() {
            let is_last = levels.peek().is_none();

            if level == "#" {
                return &mut node.multi_wildcard;
            } else if level == "+" {
                if node.single_wildcard.is_none() {
                    node.single_wildcard = Some(Box::new(TrieNode::new()));
                }
                node = node.single_wildcard.as_mut().unwrap();
            } else {
                node = node.children.entry(CompactString::new(level)).or_default();
            }

            if is_last {
                return &mut node.value;
            }
        }
        unreachable!("topic filter must contain at least one segment")
    }

    /// Get a mutable reference to the value at a filter
    /// Uses iterator-based traversal to avoid Vec allocation
    pub fn get_mut(&mut self, filter: &str) -> Option<&mut V> {
        let mut node = &mut self.root;
        let mut levels = filter.split('/').peekable();

        while let Some(level) = levels.next() {
            let is_last = levels.peek().is_none();

            if level == "#" {
                return node.multi_wildcard.as_mut();
            } else if level == "+" {
                node = node.single_wildcard.as_mut()?;
            } else {
                node = node.children.get_mut(level)?;
            }

            if is_last {
                return node.value.as_mut();
            }
        }

        None
    }

    /// Remove a filter from the trie, pruning now-empty subtrees on the way
    /// back up.
    /// Uses SmallVec to avoid heap allocation for typical topic depths (up to 8 levels)
    pub fn remove(&mut self, filter: &str) -> Option<V> {
        let levels: SmallVec<[&str; 8]> = filter.split('/').collect();
        Self::remove_recursive(&mut self.root, &levels, 0)
    }

    fn remove_recursive(node: &mut TrieNode<V>, levels: &[&str], index: usize) -> Option<V> {
        if index >= levels.len() {
            return node.value.take();
        }

        let level = levels[index];

        match level {
            "#" => node.multi_wildcard.take(),
            "+" => {
                if let Some(child) = node.single_wildcard.as_mut() {
                    let removed = Self::remove_recursive(child, levels, index + 1);
                    if child.is_empty() {
                        node.single_wildcard = None;
                    }
                    removed
                } else {
                    None
                }
            }
            literal => {
                if let Some(child) = node.children.get_mut(literal) {
                    let removed = Self::remove_recursive(child, levels, index + 1);
                    if child.is_empty() {
                        node.children.remove(literal);
                    }
                    removed
                } else {
                    None
                }
            }
        }
    }

    /// Remove entries by predicate (returns true if entry should be removed),
    /// pruning emptied subtrees.
    pub fn remove_by_predicate<F>(&mut self, mut pred: F)
    where
        F: FnMut(&mut V) -> bool,
    {
        Self::remove_by_predicate_recursive(&mut self.root, &mut pred);
    }

    fn remove_by_predicate_recursive<F>(node: &mut TrieNode<V>, pred: &mut F)
    where
        F: FnMut(&mut V) -> bool,
    {
        if let Some(v) = node.value.as_mut() {
            if pred(v) {
                node.value = None;
            }
        }

        if let Some(v) = node.multi_wildcard.as_mut() {
            if pred(v) {
                node.multi_wildcard = None;
            }
        }

        if let Some(child) = node.single_wildcard.as_mut() {
            Self::remove_by_predicate_recursive(child, pred);
            if child.is_empty() {
                node.single_wildcard = None;
            }
        }

        node.children.retain(|_, child| {
            Self::remove_by_predicate_recursive(child, pred);
            !child.is_empty()
        });
    }

    /// Find all matching subscriptions for a topic name
    /// Uses SmallVec to avoid heap allocation for typical topic depths (up to 8 levels)
    pub fn matches<F>(&self, topic: &str, mut callback: F)
    where
        F: FnMut(&V),
    {
        // $-topics don't match filters starting with + or #
        let is_system_topic = topic.starts_with('$');

        let levels: SmallVec<[&str; 8]> = topic.split('/').collect();
        Self::matches_recursive(&self.root, &levels, 0, is_system_topic, &mut callback);
    }

    fn matches_recursive<F>(
        node: &TrieNode<V>,
        levels: &[&str],
        index: usize,
        is_system_topic: bool,
        callback: &mut F,
    ) where
        F: FnMut(&V),
    {
        // Check multi-level wildcard at current level
        // (but not for $-topics at the root level)
        if !(is_system_topic && index == 0) {
            if let Some(v) = node.multi_wildcard.as_ref() {
                callback(v);
            }
        }

        if index >= levels.len() {
            // At end of topic - check for exact match
            if let Some(v) = node.value.as_ref() {
                callback(v);
            }
            return;
        }

        let level = levels[index];

        // Check single-level wildcard (but not for $-topics at root)
        if !(is_system_topic && index == 0) {
            if let Some(child) = node.single_wildcard.as_ref() {
                Self::matches_recursive(child, levels, index + 1, is_system_topic, callback);
            }
        }

        // Check exact match
        if let Some(child) = node.children.get(level) {
            Self::matches_recursive(child, levels, index + 1, is_system_topic, callback);
        }
    }

    /// `true` iff at least one value in the trie matches `topic` — used for
    /// permission-set membership checks. Short-circuits on the first hit
    /// rather than visiting the whole matching set like `matches` does.
    pub fn matches_any(&self, topic: &str) -> bool {
        let is_system_topic = topic.starts_with('$');
        let levels: SmallVec<[&str; 8]> = topic.split('/').collect();
        Self::matches_any_recursive(&self.root, &levels, 0, is_system_topic)
    }

    fn matches_any_recursive(
        node: &TrieNode<V>,
        levels: &[&str],
        index: usize,
        is_system_topic: bool,
    ) -> bool {
        if !(is_system_topic && index == 0) && node.multi_wildcard.is_some() {
            return true;
        }

        if index >= levels.len() {
            return node.value.is_some();
        }

        let level = levels[index];

        if !(is_system_topic && index == 0) {
            if let Some(child) = node.single_wildcard.as_ref() {
                if Self::matches_any_recursive(child, levels, index + 1, is_system_topic) {
                    return true;
                }
            }
        }

        if let Some(child) = node.children.get(level) {
            return Self::matches_any_recursive(child, levels, index + 1, is_system_topic);
        }
        false
    }

    /// Walk a *literal* trie (e.g. the retained-message store) using a
    /// filter that may itself contain wildcards, invoking `callback` for
    /// every value whose topic the filter covers. `#` descends the entire
    /// subtree rooted at that point. This is the reverse traversal
    /// direction from `matches`: `matches` walks a wildcard trie against a
    /// literal topic (fan-out on publish); this walks a literal trie
    /// against a possibly-wildcard filter, which is what replaying
    /// retained messages on a new subscription needs.
    pub fn filter_matches<F>(&self, filter: &str, mut callback: F)
    where
        F: FnMut(&V),
    {
        let levels: SmallVec<[&str; 8]> = filter.split('/').collect();
        Self::filter_matches_recursive(&self.root, &levels, 0, &mut callback);
    }

    fn filter_matches_recursive<F>(
        node: &TrieNode<V>,
        levels: &[&str],
        index: usize,
        callback: &mut F,
    ) where
        F: FnMut(&V),
    {
        if index >= levels.len() {
            if let Some(v) = node.value.as_ref() {
                callback(v);
            }
            return;
        }

        match levels[index] {
            // A `#`/`+` at the top level must not descend into `$`-prefixed
            // children (retained `$SYS/...` etc.) — only an exact literal
            // filter segment may match one.
            "#" => Self::collect_subtree(node, index == 0, callback),
            "+" => {
                for (key, child) in node.children.iter() {
                    if index == 0 && key.starts_with('$') {
                        continue;
                    }
                    Self::filter_matches_recursive(child, levels, index + 1, callback);
                }
            }
            literal => {
                if let Some(child) = node.children.get(literal) {
                    Self::filter_matches_recursive(child, levels, index + 1, callback);
                }
            }
        }
    }

    fn collect_subtree<F>(node: &TrieNode<V>, skip_dollar_children: bool, callback: &mut F)
    where
        F: FnMut(&V),
    {
        if let Some(v) = node.value.as_ref() {
            callback(v);
        }
        for (key, child) in node.children.iter() {
            if skip_dollar_children && key.starts_with('$') {
                continue;
            }
            Self::collect_subtree(child, false, callback);
        }
        // A literal trie (retained store) never has wildcard children, but
        // guard against it anyway rather than assuming the invariant holds.
        if let Some(child) = node.single_wildcard.as_ref() {
            Self::collect_subtree(child, false, callback);
        }
        if let Some(v) = node.multi_wildcard.as_ref() {
            callback(v);
        }
    }

    /// Visit every value stored in the trie, in no particular order.
    pub fn for_each<F>(&self, mut callback: F)
    where
        F: FnMut(&V),
    {
        Self::collect_subtree(&self.root, false, &mut callback);
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }
}

impl<V: MergeValue> TopicTrie<V> {
    /// Structural union: every filter present in either trie is present in
    /// the result; a filter present in both has its values merged.
    pub fn union(self, other: Self) -> Self {
        let mut result = self;
        Self::union_into(&mut result.root, other.root);
        result
    }

    fn union_into(into: &mut TrieNode<V>, from: TrieNode<V>) {
        into.value = match (into.value.take(), from.value) {
            (Some(a), Some(b)) => Some(a.merge(b)),
            (a, b) => a.or(b),
        };
        into.multi_wildcard = match (into.multi_wildcard.take(), from.multi_wildcard) {
            (Some(a), Some(b)) => Some(a.merge(b)),
            (a, b) => a.or(b),
        };
        match (into.single_wildcard.as_mut(), from.single_wildcard) {
            (Some(a), Some(b)) => Self::union_into(a, *b),
            (None, Some(b)) => into.single_wildcard = Some(b),
            _ => {}
        }
        for (segment, child) in from.children {
            let existing = into.children.entry(segment).or_insert_with(TrieNode::new);
            Self::union_into(existing, child);
        }
    }

    /// Structural intersection: only filters present in *both* tries
    /// survive, with their values merged.
    pub fn intersection(self, other: Self) -> Self {
        let mut result = TrieNode::new();
        Self::intersection_into(&mut result, self.root, other.root);
        Self { root: result }
    }

    fn intersection_into(into: &mut TrieNode<V>, a: TrieNode<V>, b: TrieNode<V>) {
        into.value = match (a.value, b.value) {
            (Some(x), Some(y)) => Some(x.merge(y)),
            _ => None,
        };
        into.multi_wildcard = match (a.multi_wildcard, b.multi_wildcard) {
            (Some(x), Some(y)) => Some(x.merge(y)),
            _ => None,
        };
        if let (Some(x), Some(y)) = (a.single_wildcard, b.single_wildcard) {
            let mut merged = TrieNode::new();
            Self::intersection_into(&mut merged, *x, *y);
            if !merged.is_empty() {
                into.single_wildcard = Some(Box::new(merged));
            }
        }
        let mut a_children = a.children;
        for (segment, b_child) in b.children {
            if let Some(a_child) = a_children.remove(&segment) {
                let mut merged = TrieNode::new();
                Self::intersection_into(&mut merged, a_child, b_child);
                if !merged.is_empty() {
                    into.children.insert(segment, merged);
                }
            }
        }
    }
}

impl<V> Default for TopicTrie<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_exact_match() {
        let mut trie = TopicTrie::new();
        trie.insert("test/topic", 1);

        let mut matches = Vec::new();
        trie.matches("test/topic", |v| matches.push(*v));
        assert_eq!(matches, vec![1]);

        matches.clear();
        trie.matches("test/other", |v| matches.push(*v));
        assert!(matches.is_empty());
    }

    #[test]
    fn test_single_wildcard() {
        let mut trie = TopicTrie::new();
        trie.insert("test/+", 1);
        trie.insert("+/topic", 2);
        trie.insert("+/+", 3);

        let mut matches = Vec::new();
        trie.matches("test/topic", |v| matches.push(*v));
        matches.sort();
        assert_eq!(matches, vec![1, 2, 3]);
    }

    #[test]
    fn test_multi_wildcard() {
        let mut trie = TopicTrie::new();
        trie.insert("#", 1);
        trie.insert("test/#", 2);

        let mut matches = Vec::new();
        trie.matches("test/topic/deep", |v| matches.push(*v));
        matches.sort();
        assert_eq!(matches, vec![1, 2]);
    }

    #[test]
    fn test_system_topics() {
        let mut trie = TopicTrie::new();
        trie.insert("#", 1);
        trie.insert("+/test", 2);
        trie.insert("$SYS/#", 3);

        // $SYS topics should not match # or +
        let mut matches = Vec::new();
        trie.matches("$SYS/test", |v| matches.push(*v));
        assert_eq!(matches, vec![3]);
    }

    #[test]
    fn test_remove() {
        let mut trie = TopicTrie::new();
        trie.insert("test/topic", 1);

        let removed = trie.remove("test/topic");
        assert_eq!(removed, Some(1));
        assert!(trie.is_empty());

        let mut matches = Vec::new();
        trie.matches("test/topic", |v| matches.push(*v));
        assert!(matches.is_empty());
    }

    #[test]
    fn matches_any_short_circuits() {
        let mut trie: TopicTrie<HashSet<u32>> = TopicTrie::new();
        trie.insert_or_merge("sensors/+", HashSet::from([1]));
        trie.insert_or_merge("sensors/#", HashSet::from([2]));
        assert!(trie.matches_any("sensors/kitchen"));
        assert!(!trie.matches_any("lights/kitchen"));
    }

    #[test]
    fn filter_matches_walks_literal_trie_with_wildcard_filter() {
        let mut retained: TopicTrie<&str> = TopicTrie::new();
        retained.insert("home/kitchen/temp", "21C");
        retained.insert("home/kitchen/humidity", "40%");
        retained.insert("home/garage/temp", "18C");

        let mut found = Vec::new();
        retained.filter_matches("home/kitchen/+", |v| found.push(*v));
        found.sort_unstable();
        assert_eq!(found, vec!["21C", "40%"]);

        found.clear();
        retained.filter_matches("home/#", |v| found.push(*v));
        found.sort_unstable();
        assert_eq!(found, vec!["18C", "21C", "40%"]);

        found.clear();
        retained.filter_matches("home/garage/temp", |v| found.push(*v));
        assert_eq!(found, vec!["18C"]);
    }

    #[test]
    fn filter_matches_excludes_dollar_topics_from_wildcard_filters() {
        let mut retained: TopicTrie<&str> = TopicTrie::new();
        retained.insert("$SYS/stats", "42");
        retained.insert("home/stats", "ok");

        let mut found = Vec::new();
        retained.filter_matches("#", |v| found.push(*v));
        assert_eq!(found, vec!["ok"]);

        found.clear();
        retained.filter_matches("+/stats", |v| found.push(*v));
        assert_eq!(found, vec!["ok"]);

        // An exact literal filter still reaches a $-prefixed entry.
        found.clear();
        retained.filter_matches("$SYS/stats", |v| found.push(*v));
        assert_eq!(found, vec!["42"]);
    }

    #[test]
    fn union_merges_values_at_shared_filters() {
        let a: TopicTrie<HashSet<u32>> = TopicTrie::singleton("a/b", HashSet::from([1]));
        let b: TopicTrie<HashSet<u32>> = TopicTrie::singleton("a/b", HashSet::from([2]));
        let merged = a.union(b);
        let mut found = Vec::new();
        merged.matches("a/b", |v| found.extend(v.iter().copied()));
        found.sort_unstable();
        assert_eq!(found, vec![1, 2]);
    }

    #[test]
    fn union_keeps_filters_unique_to_either_side() {
        let a: TopicTrie<HashSet<u32>> = TopicTrie::singleton("a/b", HashSet::from([1]));
        let b: TopicTrie<HashSet<u32>> = TopicTrie::singleton("c/d", HashSet::from([2]));
        let merged = a.union(b);
        assert!(merged.matches_any("a/b"));
        assert!(merged.matches_any("c/d"));
        assert!(!merged.matches_any("e/f"));
    }

    #[test]
    fn intersection_keeps_only_shared_filters() {
        let mut a: TopicTrie<HashSet<u32>> = TopicTrie::new();
        a.insert_or_merge("a/b", HashSet::from([1]));
        a.insert_or_merge("c/d", HashSet::from([9]));

        let mut b: TopicTrie<HashSet<u32>> = TopicTrie::new();
        b.insert_or_merge("a/b", HashSet::from([2]));
        b.insert_or_merge("e/f", HashSet::from([9]));

        let combined = a.intersection(b);
        assert!(combined.matches_any("a/b"));
        assert!(!combined.matches_any("c/d"));
        assert!(!combined.matches_any("e/f"));

        let mut found = Vec::new();
        combined.matches("a/b", |v| found.extend(v.iter().copied()));
        found.sort_unstable();
        assert_eq!(found, vec![1, 2]);
    }
}
