//! Subscription filters.
//!
//! A filter is an object with optional `ids`, `authors`, `kinds`, `since`,
//! `until`, `limit` and tag selectors spelled `#x: [values]` — "any tag
//! whose first element is `x` and whose second element is in `values`".
//! An event matches a filter iff every present predicate holds; it matches
//! a subscription iff any of the subscription's filters match.

use std::collections::BTreeMap;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::event::Event;

/// A single subscription filter. Tag selectors are stored without the
/// `#` prefix; (de)serialization adds/strips it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub ids: Option<Vec<String>>,
    pub authors: Option<Vec<String>>,
    pub kinds: Option<Vec<u16>>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub limit: Option<usize>,
    pub tags: BTreeMap<String, Vec<String>>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    pub fn kinds<I: IntoIterator<Item = u16>>(mut self, kinds: I) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Add a `#name` tag selector. Multiple selectors AND together;
    /// values within one selector OR together.
    pub fn tag<I, S>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags
            .insert(name.to_string(), values.into_iter().map(Into::into).collect());
        self
    }

    /// Whether an event satisfies every present predicate.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| *id == event.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| *a == event.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }
        for (name, values) in &self.tags {
            if !event.tag_values(name).any(|v| values.iter().any(|w| w == v)) {
                return false;
            }
        }
        true
    }

    /// Canonical JSON form: sorted keys, sorted value lists. Two filters
    /// that select the same events in a different spelling canonicalize
    /// identically.
    fn canonical_value(&self) -> Value {
        let mut map = Map::new();
        if let Some(ids) = &self.ids {
            map.insert("ids".into(), sorted_strings(ids));
        }
        if let Some(authors) = &self.authors {
            map.insert("authors".into(), sorted_strings(authors));
        }
        if let Some(kinds) = &self.kinds {
            let mut kinds = kinds.clone();
            kinds.sort_unstable();
            kinds.dedup();
            map.insert("kinds".into(), json!(kinds));
        }
        if let Some(since) = self.since {
            map.insert("since".into(), json!(since));
        }
        if let Some(until) = self.until {
            map.insert("until".into(), json!(until));
        }
        if let Some(limit) = self.limit {
            map.insert("limit".into(), json!(limit));
        }
        for (name, values) in &self.tags {
            map.insert(format!("#{name}"), sorted_strings(values));
        }
        Value::Object(map)
    }
}

fn sorted_strings(values: &[String]) -> Value {
    let mut values = values.to_vec();
    values.sort();
    values.dedup();
    json!(values)
}

/// Whether an event matches any filter in a subscription's set.
pub fn match_any(filters: &[Filter], event: &Event) -> bool {
    filters.iter().any(|f| f.matches(event))
}

/// Canonical hash of a filter set, used for subscription deduplication.
/// Order-insensitive: the same filters in a different order hash equal.
pub fn canonical_hash(filters: &[Filter]) -> String {
    let mut parts: Vec<String> = filters
        .iter()
        .map(|f| f.canonical_value().to_string())
        .collect();
    parts.sort();
    parts.dedup();
    hex::encode(Sha256::digest(parts.join(",").as_bytes()))
}

// ── Serde: `#x` spelling on the wire ───────────────────────────────────

impl Serialize for Filter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = Map::new();
        if let Some(ids) = &self.ids {
            map.insert("ids".into(), json!(ids));
        }
        if let Some(authors) = &self.authors {
            map.insert("authors".into(), json!(authors));
        }
        if let Some(kinds) = &self.kinds {
            map.insert("kinds".into(), json!(kinds));
        }
        if let Some(since) = self.since {
            map.insert("since".into(), json!(since));
        }
        if let Some(until) = self.until {
            map.insert("until".into(), json!(until));
        }
        if let Some(limit) = self.limit {
            map.insert("limit".into(), json!(limit));
        }
        for (name, values) in &self.tags {
            map.insert(format!("#{name}"), json!(values));
        }
        Value::Object(map).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Filter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Map::<String, Value>::deserialize(deserializer)?;
        let mut filter = Filter::default();
        for (key, val) in value {
            match key.as_str() {
                "ids" => filter.ids = Some(string_list(&key, val).map_err(D::Error::custom)?),
                "authors" => {
                    filter.authors = Some(string_list(&key, val).map_err(D::Error::custom)?)
                }
                "kinds" => {
                    let kinds: Vec<u16> =
                        serde_json::from_value(val).map_err(D::Error::custom)?;
                    filter.kinds = Some(kinds);
                }
                "since" => filter.since = Some(u64_value(&key, val).map_err(D::Error::custom)?),
                "until" => filter.until = Some(u64_value(&key, val).map_err(D::Error::custom)?),
                "limit" => {
                    filter.limit = Some(u64_value(&key, val).map_err(D::Error::custom)? as usize)
                }
                name if name.starts_with('#') && name.len() > 1 => {
                    let values = string_list(name, val).map_err(D::Error::custom)?;
                    filter.tags.insert(name[1..].to_string(), values);
                }
                // Unknown keys are ignored, matching lenient relay behavior.
                _ => {}
            }
        }
        Ok(filter)
    }
}

fn string_list(key: &str, val: Value) -> Result<Vec<String>, String> {
    serde_json::from_value(val).map_err(|e| format!("{key}: {e}"))
}

fn u64_value(key: &str, val: Value) -> Result<u64, String> {
    val.as_u64().ok_or_else(|| format!("{key}: not a u64"))
}
