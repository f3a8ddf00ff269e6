//! Topic trie for wildcard subscription matching.
//!
//! A prefix tree keyed by topic level, supporting the single-level (`+`)
//! and multi-level (`#`) wildcards. Matching is a pure function of trie
//! state and runs in O(depth-of-topic) for the common case.
//!
//! Performance notes:
//! - Iterator-based traversal avoids Vec allocations on insert/lookup
//! - `CompactString` keeps short topic levels inline
//! - `SmallVec` avoids heap allocation for typical topic depths

use ahash::AHashMap;
use compact_str::CompactString;
use smallvec::SmallVec;

/// Node in the topic trie
#[derive(Debug)]
struct TrieNode<V> {
    /// Value stored for a filter ending at this node
    value: Option<V>,
    /// Children indexed by topic level
    children: AHashMap<CompactString, TrieNode<V>>,
    /// Single-level wildcard (+) child
    single_wildcard: Option<Box<TrieNode<V>>>,
    /// Multi-level wildcard (#) value anchored at this node
    multi_wildcard: Option<V>,
}

impl<V> TrieNode<V> {
    fn new() -> Self {
        Self {
            value: None,
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

/// Topic trie mapping wildcard filters to values
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

    /// Insert a filter with an associated value, replacing any previous value
    pub fn insert(&mut self, filter: &str, value: V) {
        let mut node = &mut self.root;
        let mut levels = filter.split('/').peekable();

        while let Some(level) = levels.next() {
            let is_last = levels.peek().is_none();

            if level == "#" {
                node.multi_wildcard = Some(value);
                return;
            } else if level == "+" {
                if node.single_wildcard.is_none() {
                    node.single_wildcard = Some(Box::new(TrieNode::new()));
                }
                node = node.single_wildcard.as_mut().unwrap();
            } else {
                node = node.children.entry(CompactString::new(level)).or_default();
            }

            if is_last {
                node.value = Some(value);
                return;
            }
        }
    }

    /// Mutable access to the value stored for a filter
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

    /// Remove a filter, returning its value if present.
    /// Empty interior nodes are pruned on the way back up.
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
                let child = node.single_wildcard.as_mut()?;
                let removed = if index + 1 >= levels.len() {
                    child.value.take()
                } else {
                    Self::remove_recursive(child, levels, index + 1)
                };
                if child.is_empty() {
                    node.single_wildcard = None;
                }
                removed
            }
            _ => {
                let child = node.children.get_mut(level)?;
                let removed = if index + 1 >= levels.len() {
                    child.value.take()
                } else {
                    Self::remove_recursive(child, levels, index + 1)
                };
                if child.is_empty() {
                    node.children.remove(level);
                }
                removed
            }
        }
    }

    /// Invoke the callback for every filter value matching the topic
    pub fn matches<F>(&self, topic: &str, mut callback: F)
    where
        F: FnMut(&V),
    {
        let levels: SmallVec<[&str; 8]> = topic.split('/').collect();
        Self::matches_recursive(&self.root, &levels, 0, &mut callback);
    }

    fn matches_recursive<F>(node: &TrieNode<V>, levels: &[&str], index: usize, callback: &mut F)
    where
        F: FnMut(&V),
    {
        // # anchored here matches zero or more trailing levels
        if let Some(ref v) = node.multi_wildcard {
            callback(v);
        }

        if index >= levels.len() {
            if let Some(ref v) = node.value {
                callback(v);
            }
            return;
        }

        if let Some(ref child) = node.single_wildcard {
            Self::matches_recursive(child, levels, index + 1, callback);
        }

        if let Some(child) = node.children.get(levels[index]) {
            Self::matches_recursive(child, levels, index + 1, callback);
        }
    }

    /// Invoke the callback for every (filter, value) pair in the trie.
    /// Filter strings are reconstructed from the path; used by the
    /// reconciliation sweep, not on the hot matching path.
    pub fn for_each_entry<F>(&self, mut callback: F)
    where
        F: FnMut(&str, &V),
    {
        let mut path: Vec<CompactString> = Vec::new();
        Self::for_each_entry_recursive(&self.root, &mut path, &mut callback);
    }

    fn for_each_entry_recursive<'a, F>(
        node: &'a TrieNode<V>,
        path: &mut Vec<CompactString>,
        callback: &mut F,
    ) where
        F: FnMut(&str, &V),
    {
        if let Some(ref v) = node.value {
            callback(&join_levels(path), v);
        }

        if let Some(ref v) = node.multi_wildcard {
            path.push(CompactString::const_new("#"));
            callback(&join_levels(path), v);
            path.pop();
        }

        if let Some(ref child) = node.single_wildcard {
            path.push(CompactString::const_new("+"));
            Self::for_each_entry_recursive(child, path, callback);
            path.pop();
        }

        for (level, child) in &node.children {
            path.push(level.clone());
            Self::for_each_entry_recursive(child, path, callback);
            path.pop();
        }
    }
}

fn join_levels(path: &[CompactString]) -> String {
    let mut out = String::new();
    for (i, level) in path.iter().enumerate() {
        if i > 0 {
            out.push('/');
        }
        out.push_str(level);
    }
    out
}

impl<V> Default for TopicTrie<V> {
    fn default() -> Self {
        Self::new()
    }
}
