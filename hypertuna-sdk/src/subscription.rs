//! Subscription registry: filter-hash deduplication, short wire ids,
//! and demultiplexing of incoming frames.
//!
//! Every subscription has a caller-provided *name* and a process-unique
//! *short id* (`sub<N>`) used on the wire. Three indexes are kept in
//! lock-step:
//!
//! - `name → entry` (the subscription itself),
//! - `canonical filter hash → name` (so independent callers producing an
//!   identical filter set share one wire subscription),
//! - `short id → name` (demux of incoming `EVENT`/`EOSE` frames).
//!
//! Index updates are atomic with respect to subscription creation: one
//! subscription is active at any time for a given hash + name.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::event::Event;
use crate::filter::{canonical_hash, Filter};

const UPDATE_CAPACITY: usize = 256;

/// Delivery to a subscription's consumers.
#[derive(Debug, Clone)]
pub enum SubscriptionUpdate {
    Event { relay_url: String, event: Event },
    Eose { relay_url: String },
}

/// Per-subscription options.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionOptions {
    /// When set, matching events are not re-emitted on the pool's global
    /// event channel.
    pub suppress_global_events: bool,
    /// When non-empty, the subscription applies only to these relay URLs.
    pub target_relays: Vec<String>,
}

/// What the registry decided for a `subscribe` call. The pool uses this
/// to know whether wire frames are needed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// An equal filter set already runs under this (or another) name;
    /// the caller was attached to it. No wire change.
    Reused { name: String },
    /// A fresh subscription was created.
    Created,
    /// The name existed with different filters; the old wire subscription
    /// must be CLOSEd and the new one REQed.
    Replaced { closed_short_id: String },
}

/// A snapshot of one subscription, as the pool's routing logic sees it.
#[derive(Debug, Clone)]
pub struct SubscriptionInfo {
    pub name: String,
    pub short_id: String,
    pub filters: Vec<Filter>,
    pub options: SubscriptionOptions,
}

impl SubscriptionInfo {
    /// The group id a subscription is scoped to, from the naming
    /// convention `group:<id>` or `group:<id>:<purpose>`.
    pub fn group_scope(&self) -> Option<&str> {
        group_scope_of(&self.name)
    }
}

/// The group id encoded in a subscription name, if any.
pub fn group_scope_of(name: &str) -> Option<&str> {
    let rest = name.strip_prefix("group:")?;
    let id = rest.split(':').next().unwrap_or(rest);
    (!id.is_empty()).then_some(id)
}

struct SubEntry {
    short_id: String,
    filters: Vec<Filter>,
    filter_hash: String,
    options: SubscriptionOptions,
    sender: broadcast::Sender<SubscriptionUpdate>,
    /// subscribe calls minus unsubscribe calls; the wire subscription is
    /// closed when this reaches zero.
    refs: usize,
}

#[derive(Default)]
struct Indexes {
    by_name: HashMap<String, SubEntry>,
    by_hash: HashMap<String, String>,
    by_short: HashMap<String, String>,
    /// caller name → canonical name, for callers attached through the
    /// hash index.
    aliases: HashMap<String, String>,
}

/// Registry shared by the pool and its connection tasks.
pub struct SubscriptionRegistry {
    inner: Mutex<Indexes>,
    counter: AtomicU64,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Indexes::default()),
            counter: AtomicU64::new(1),
        }
    }

    fn next_short_id(&self) -> String {
        format!("sub{}", self.counter.fetch_add(1, Ordering::Relaxed))
    }

    /// Register (or attach to) a subscription. Returns the wire decision,
    /// the live short id, and a receiver for matched events.
    pub fn subscribe(
        &self,
        name: &str,
        filters: Vec<Filter>,
        options: SubscriptionOptions,
    ) -> (
        SubscribeOutcome,
        String,
        broadcast::Receiver<SubscriptionUpdate>,
    ) {
        let hash = canonical_hash(&filters);
        let mut inner = self.inner.lock();

        // Same name, same filters: reuse, attach another consumer.
        let canonical = inner.aliases.get(name).cloned();
        let lookup = canonical.as_deref().unwrap_or(name);
        if let Some(entry) = inner.by_name.get_mut(lookup) {
            if entry.filter_hash == hash {
                entry.refs += 1;
                return (
                    SubscribeOutcome::Reused {
                        name: lookup.to_string(),
                    },
                    entry.short_id.clone(),
                    entry.sender.subscribe(),
                );
            }
            // Same name, different filters: replace in place.
            let closed_short_id = entry.short_id.clone();
            let short_id = self.next_short_id();
            let old_hash = entry.filter_hash.clone();
            entry.short_id = short_id.clone();
            entry.filters = filters;
            entry.filter_hash = hash.clone();
            entry.options = options;
            entry.refs += 1;
            let rx = entry.sender.subscribe();
            inner.by_short.remove(&closed_short_id);
            inner.by_short.insert(short_id.clone(), lookup.to_string());
            if inner.by_hash.get(&old_hash).map(String::as_str) == Some(lookup) {
                inner.by_hash.remove(&old_hash);
            }
            inner.by_hash.insert(hash, lookup.to_string());
            return (
                SubscribeOutcome::Replaced { closed_short_id },
                short_id,
                rx,
            );
        }

        // Different caller, identical filter set: share the existing
        // wire subscription through the hash index.
        if let Some(existing) = inner.by_hash.get(&hash).cloned() {
            if let Some(entry) = inner.by_name.get_mut(&existing) {
                entry.refs += 1;
                let short_id = entry.short_id.clone();
                let rx = entry.sender.subscribe();
                inner.aliases.insert(name.to_string(), existing.clone());
                return (SubscribeOutcome::Reused { name: existing }, short_id, rx);
            }
        }

        // Fresh subscription.
        let short_id = self.next_short_id();
        let (sender, rx) = broadcast::channel(UPDATE_CAPACITY);
        inner.by_name.insert(
            name.to_string(),
            SubEntry {
                short_id: short_id.clone(),
                filters,
                filter_hash: hash.clone(),
                options,
                sender,
                refs: 1,
            },
        );
        inner.by_hash.insert(hash, name.to_string());
        inner.by_short.insert(short_id.clone(), name.to_string());
        (SubscribeOutcome::Created, short_id, rx)
    }

    /// Drop one reference to a subscription. Returns the short id to
    /// CLOSE on the wire when the last reference went away.
    pub fn unsubscribe(&self, name: &str) -> Option<String> {
        let mut inner = self.inner.lock();
        let canonical = inner
            .aliases
            .remove(name)
            .unwrap_or_else(|| name.to_string());
        let entry = inner.by_name.get_mut(&canonical)?;
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 {
            return None;
        }
        let entry = inner.by_name.remove(&canonical)?;
        inner.by_short.remove(&entry.short_id);
        if inner.by_hash.get(&entry.filter_hash).map(String::as_str) == Some(canonical.as_str()) {
            inner.by_hash.remove(&entry.filter_hash);
        }
        inner.aliases.retain(|_, v| *v != canonical);
        Some(entry.short_id)
    }

    /// Demultiplex an incoming EVENT frame to the owning subscription.
    /// Returns the options of the subscription if it was delivered.
    pub fn dispatch_event(
        &self,
        short_id: &str,
        relay_url: &str,
        event: Event,
    ) -> Option<SubscriptionOptions> {
        let inner = self.inner.lock();
        let name = inner.by_short.get(short_id)?;
        let entry = inner.by_name.get(name)?;
        let _ = entry.sender.send(SubscriptionUpdate::Event {
            relay_url: relay_url.to_string(),
            event,
        });
        Some(entry.options.clone())
    }

    /// Demultiplex an incoming EOSE frame.
    pub fn dispatch_eose(&self, short_id: &str, relay_url: &str) {
        let inner = self.inner.lock();
        if let Some(name) = inner.by_short.get(short_id) {
            if let Some(entry) = inner.by_name.get(name) {
                let _ = entry.sender.send(SubscriptionUpdate::Eose {
                    relay_url: relay_url.to_string(),
                });
            }
        }
    }

    /// Snapshot of all live subscriptions, for routing on (re)connect.
    pub fn all(&self) -> Vec<SubscriptionInfo> {
        let inner = self.inner.lock();
        inner
            .by_name
            .iter()
            .map(|(name, e)| SubscriptionInfo {
                name: name.clone(),
                short_id: e.short_id.clone(),
                filters: e.filters.clone(),
                options: e.options.clone(),
            })
            .collect()
    }

    /// Look up one subscription by name (following aliases).
    pub fn get(&self, name: &str) -> Option<SubscriptionInfo> {
        let inner = self.inner.lock();
        let canonical = inner.aliases.get(name).map(String::as_str).unwrap_or(name);
        inner.by_name.get(canonical).map(|e| SubscriptionInfo {
            name: canonical.to_string(),
            short_id: e.short_id.clone(),
            filters: e.filters.clone(),
            options: e.options.clone(),
        })
    }

    /// Drop every subscription (orderly shutdown).
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.by_name.clear();
        inner.by_hash.clear();
        inner.by_short.clear();
        inner.aliases.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBuilder;
    use crate::keys::Keys;

    fn filters(kind: u16) -> Vec<Filter> {
        vec![Filter::new().kinds([kind])]
    }

    #[test]
    fn short_ids_are_monotonic() {
        let reg = SubscriptionRegistry::new();
        let (_, a, _) = reg.subscribe("a", filters(1), Default::default());
        let (_, b, _) = reg.subscribe("b", filters(3), Default::default());
        assert_eq!(a, "sub1");
        assert_eq!(b, "sub2");
    }

    #[test]
    fn same_name_same_filters_reuses() {
        let reg = SubscriptionRegistry::new();
        let (o1, id1, _rx1) = reg.subscribe("foo", filters(1), Default::default());
        let (o2, id2, _rx2) = reg.subscribe("foo", filters(1), Default::default());
        assert_eq!(o1, SubscribeOutcome::Created);
        assert_eq!(o2, SubscribeOutcome::Reused { name: "foo".into() });
        assert_eq!(id1, id2);
        assert_eq!(reg.all().len(), 1);
    }

    #[test]
    fn same_name_new_filters_replaces() {
        let reg = SubscriptionRegistry::new();
        let (_, id1, _rx1) = reg.subscribe("foo", filters(1), Default::default());
        let (o2, id2, _rx2) = reg.subscribe("foo", filters(3), Default::default());
        assert_eq!(
            o2,
            SubscribeOutcome::Replaced {
                closed_short_id: id1
            }
        );
        assert_ne!(id2, "sub1");
        assert_eq!(reg.get("foo").unwrap().short_id, id2);
    }

    #[test]
    fn independent_callers_share_by_hash() {
        let reg = SubscriptionRegistry::new();
        let (_, id1, _rx1) = reg.subscribe("caller-a", filters(1), Default::default());
        let (o2, id2, _rx2) = reg.subscribe("caller-b", filters(1), Default::default());
        assert_eq!(
            o2,
            SubscribeOutcome::Reused {
                name: "caller-a".into()
            }
        );
        assert_eq!(id1, id2);
        assert_eq!(reg.all().len(), 1);

        // The alias keeps the wire subscription alive until both leave.
        assert_eq!(reg.unsubscribe("caller-b"), None);
        assert_eq!(reg.unsubscribe("caller-a"), Some(id1));
    }

    #[test]
    fn both_receivers_get_events_after_dedup() {
        let reg = SubscriptionRegistry::new();
        let (_, short_id, mut rx1) = reg.subscribe("a", filters(1), Default::default());
        let (_, _, mut rx2) = reg.subscribe("b", filters(1), Default::default());

        let event = EventBuilder::group_message("grp", "hi")
            .unwrap()
            .sign(&Keys::generate())
            .unwrap();
        assert!(reg
            .dispatch_event(&short_id, "wss://r", event.clone())
            .is_some());

        for rx in [&mut rx1, &mut rx2] {
            match rx.try_recv().unwrap() {
                SubscriptionUpdate::Event { event: got, .. } => assert_eq!(got.id, event.id),
                other => panic!("unexpected update {other:?}"),
            }
        }
    }

    #[test]
    fn dispatch_unknown_short_id_is_noop() {
        let reg = SubscriptionRegistry::new();
        let event = EventBuilder::group_message("grp", "hi")
            .unwrap()
            .sign(&Keys::generate())
            .unwrap();
        assert!(reg.dispatch_event("sub99", "wss://r", event).is_none());
    }

    #[test]
    fn group_scope_parsing() {
        assert_eq!(group_scope_of("group:abc:messages"), Some("abc"));
        assert_eq!(group_scope_of("group:abc"), Some("abc"));
        assert_eq!(group_scope_of("profiles"), None);
        assert_eq!(group_scope_of("group:"), None);
    }
}
