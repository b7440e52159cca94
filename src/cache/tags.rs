//! Invalidation tags and the tag-to-entry index.
//!
//! Tags group cache entries for partial invalidation. A tag either names a
//! specific entity (`Entity`) or any listing query of a type (`List`). The
//! two are deliberately not linked: invalidating a `List` tag does not touch
//! `Entity` tags of the same kind, and vice versa. Each entry declares
//! exactly the tags it needs.

use crate::cache::key::QueryKey;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// The id half of a tag: a concrete entity id, or the listing sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TagId {
    Entity(String),
    List,
}

/// A dependency label attached to cache entries, e.g. `Post:42` or `Post:LIST`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub kind: String,
    pub id: TagId,
}

impl Tag {
    pub fn entity(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: TagId::Entity(id.into()),
        }
    }

    pub fn list(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: TagId::List,
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            TagId::Entity(id) => write!(f, "{}:{}", self.kind, id),
            TagId::List => write!(f, "{}:LIST", self.kind),
        }
    }
}

/// Index from tags to the entry keys that depend on them.
///
/// Plain synchronous structure; lives behind the store's lock so tag
/// registration can never drift from entry state.
#[derive(Debug, Default)]
pub struct TagIndex {
    by_tag: HashMap<Tag, HashSet<QueryKey>>,
    by_key: HashMap<QueryKey, HashSet<Tag>>,
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dependency. Registering the same pair twice is idempotent.
    pub fn register(&mut self, tag: Tag, key: QueryKey) {
        self.by_tag
            .entry(tag.clone())
            .or_default()
            .insert(key.clone());
        self.by_key.entry(key).or_default().insert(tag);
    }

    /// Remove a key from every tag it was registered under.
    pub fn unregister(&mut self, key: &QueryKey) {
        if let Some(tags) = self.by_key.remove(key) {
            for tag in tags {
                if let Some(keys) = self.by_tag.get_mut(&tag) {
                    keys.remove(key);
                    if keys.is_empty() {
                        self.by_tag.remove(&tag);
                    }
                }
            }
        }
    }

    /// Resolve the set of keys depending on any of the given tags.
    ///
    /// Unknown tags contribute nothing; they are not an error.
    pub fn resolve(&self, tags: &[Tag]) -> HashSet<QueryKey> {
        let mut keys = HashSet::new();
        for tag in tags {
            if let Some(entries) = self.by_tag.get(tag) {
                keys.extend(entries.iter().cloned());
            }
        }
        keys
    }

    /// Tags currently registered for a key.
    pub fn tags_for(&self, key: &QueryKey) -> HashSet<Tag> {
        self.by_key.get(key).cloned().unwrap_or_default()
    }

    pub fn tag_count(&self) -> usize {
        self.by_tag.len()
    }
}
