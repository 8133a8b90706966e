//! Run-to-run change detection.

use std::collections::HashMap;
use std::fmt;

use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::models::{ExtractedItem, canonical_json};

/// Identity of an item within one run.
///
/// Keyed and unkeyed items live in separate namespaces, so a key field value
/// that happens to look like a URL never matches a URL-derived identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    /// Key field value and its occurrence among equal values.
    Key(String, usize),
    /// Source URL and its occurrence among unkeyed items from that URL.
    Url(String, usize),
}

impl Identity {
    fn nth(self, n: usize) -> Self {
        match self {
            Identity::Key(k, _) => Identity::Key(k, n),
            Identity::Url(u, _) => Identity::Url(u, n),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Key(k, 0) => write!(f, "{k}"),
            Identity::Key(k, n) => write!(f, "{k}#{n}"),
            Identity::Url(u, n) => write!(f, "{u}#{n}"),
        }
    }
}

impl Serialize for Identity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// An item whose identity survived between runs but whose data changed.
#[derive(Debug, Clone, Serialize)]
pub struct Modification<'a> {
    pub key: Identity,
    pub before: &'a ExtractedItem,
    pub after: &'a ExtractedItem,
}

/// Difference between two runs of the same schema.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChangeSet<'a> {
    pub added: Vec<&'a ExtractedItem>,
    pub modified: Vec<Modification<'a>>,
    pub removed: Vec<&'a ExtractedItem>,
    pub unchanged: Vec<&'a ExtractedItem>,
}

impl ChangeSet<'_> {
    pub fn has_changes(&self) -> bool {
        !(self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty())
    }
}

/// Identities for a run, in item order.
///
/// With `key_field` set and present on the item the identity is that field's
/// value; otherwise it is the source URL. Repeats are told apart by their
/// occurrence index, so every item in a run has a distinct identity.
pub fn identities(items: &[ExtractedItem], key_field: Option<&str>) -> Vec<Identity> {
    let mut seen: HashMap<Identity, usize> = HashMap::new();
    items
        .iter()
        .map(|item| {
            let base = match key_field.and_then(|f| item.data.get(f)) {
                Some(Value::Null) | None => Identity::Url(item.source_url.clone(), 0),
                Some(Value::String(s)) => Identity::Key(s.clone(), 0),
                Some(other) => Identity::Key(canonical_json(other), 0),
            };
            let n = seen.entry(base.clone()).or_insert(0);
            let identity = base.nth(*n);
            *n += 1;
            identity
        })
        .collect()
}

/// Diff `old` against `new`.
///
/// Output order follows `new` for added, modified and unchanged items and
/// `old` for removed ones.
pub fn diff<'a>(
    old: &'a [ExtractedItem],
    new: &'a [ExtractedItem],
    key_field: Option<&str>,
) -> ChangeSet<'a> {
    let old_keys = identities(old, key_field);
    let new_keys = identities(new, key_field);

    let mut previous: HashMap<&Identity, &'a ExtractedItem> =
        old_keys.iter().zip(old.iter()).collect();

    let mut changes = ChangeSet::default();
    for (key, item) in new_keys.iter().zip(new.iter()) {
        match previous.remove(key) {
            None => changes.added.push(item),
            Some(before) if before.hash == item.hash => changes.unchanged.push(item),
            Some(before) => changes.modified.push(Modification {
                key: key.clone(),
                before,
                after: item,
            }),
        }
    }
    changes.removed = old_keys
        .iter()
        .zip(old.iter())
        .filter(|(key, _)| previous.contains_key(key))
        .map(|(_, item)| item)
        .collect();

    tracing::debug!(
        added = changes.added.len(),
        modified = changes.modified.len(),
        removed = changes.removed.len(),
        unchanged = changes.unchanged.len(),
        "Computed change set"
    );
    changes
}
