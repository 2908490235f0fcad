//! Topic trie, shared by subscriptions, retained messages and permissions.

mod trie;

pub use trie::{MergeValue, TopicTrie};
